use heapless::String;

use super::{Backend, BackendType, Error};

/// File access on removable media.
pub trait FileSource {
    type Error: core::fmt::Debug;

    /// Open `path` and return its size.
    fn open(&mut self, path: &str) -> Result<u32, Self::Error>;

    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    fn close(&mut self);
}

/// Image file on an SD card.
pub struct SdCardBackend<S: FileSource> {
    fs: S,
    path: String<64>,
    size: Option<u32>,
}

impl<S: FileSource> SdCardBackend<S> {
    pub fn new(fs: S, path: &str) -> Result<Self, Error> {
        Ok(Self {
            fs,
            path: String::try_from(path).map_err(|_| Error::OutOfRange)?,
            size: None,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl<S: FileSource> Backend for SdCardBackend<S> {
    type Error = Error;

    fn kind(&self) -> BackendType {
        BackendType::SdCard
    }

    fn open(&mut self) -> Result<(), Error> {
        let size = self.fs.open(&self.path).map_err(|e| {
            log::error!("open {} failed: {:?}", self.path.as_str(), e);
            Error::Io
        })?;
        log::info!("sdcard image {}: {} bytes", self.path.as_str(), size);
        self.size = Some(size);
        Ok(())
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        let size = self.size.ok_or(Error::NotOpen)?;
        if offset as u64 + buf.len() as u64 > size as u64 {
            return Err(Error::OutOfRange);
        }
        self.fs.read_at(offset, buf).map_err(|e| {
            log::error!("sdcard read {:#x} failed: {:?}", offset, e);
            Error::Io
        })
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.size.take().is_some() {
            self.fs.close();
        }
        Ok(())
    }
}
