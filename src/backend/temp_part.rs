use super::{Backend, BackendType, Error};
use crate::storage::ReadStorage;

/// Image staged in a flash partition, typically by a previous run in
/// recovery mode.
pub struct TempPartitionBackend<R: ReadStorage> {
    flash: R,
    base: u32,
    size: u32,
    opened: bool,
}

impl<R: ReadStorage> TempPartitionBackend<R> {
    pub fn new(flash: R, base: u32, size: u32) -> Self {
        Self {
            flash,
            base,
            size,
            opened: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.flash
    }
}

impl<R: ReadStorage> Backend for TempPartitionBackend<R> {
    type Error = Error;

    fn kind(&self) -> BackendType {
        BackendType::TempPartition
    }

    fn open(&mut self) -> Result<(), Error> {
        if (self.base + self.size) as usize > self.flash.capacity() {
            return Err(Error::OutOfRange);
        }
        self.opened = true;
        Ok(())
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        if !self.opened {
            return Err(Error::NotOpen);
        }
        if offset as u64 + buf.len() as u64 > self.size as u64 {
            return Err(Error::OutOfRange);
        }
        self.flash.read(self.base + offset, buf).map_err(|e| {
            log::error!("temp partition read {:#x} failed: {:?}", offset, e);
            Error::Io
        })
    }

    fn close(&mut self) -> Result<(), Error> {
        self.opened = false;
        Ok(())
    }
}
