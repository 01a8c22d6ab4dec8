use super::{Backend, BackendType, ConnectType, Error, Ioctl};

/// Upgrade service of a Bluetooth link.
///
/// The phone side serves ranged requests: [`request`](OtaLink::request)
/// asks for a range and [`receive`](OtaLink::receive) blocks until the next
/// bytes of it arrive.
pub trait OtaLink {
    type Error: core::fmt::Debug;

    fn connect_type(&self) -> ConnectType;

    /// Ask for `size` bytes at `offset`; zero cancels the outstanding request.
    fn request(&mut self, offset: u32, size: u32) -> Result<(), Self::Error>;

    /// Fill `buf` with the next bytes of the outstanding request.
    fn receive(&mut self, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Payload unit of the link.
    fn unit_size(&self) -> u32;

    /// Largest request the peer accepts, 0 when unlimited.
    fn max_request_size(&self) -> u32 {
        0
    }

    fn report_image_valid(&mut self, valid: bool);

    fn report_progress(&mut self, _percent: u8) {}

    /// Tell the peer to leave upgrade mode.
    fn exit(&mut self);
}

pub struct BluetoothBackend<L: OtaLink> {
    link: L,
    opened: bool,
}

impl<L: OtaLink> BluetoothBackend<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            opened: false,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    fn check(&self) -> Result<(), Error> {
        if !self.opened {
            return Err(Error::NotOpen);
        }
        if self.link.connect_type() == ConnectType::None {
            return Err(Error::Disconnected);
        }
        Ok(())
    }
}

impl<L: OtaLink> Backend for BluetoothBackend<L> {
    type Error = Error;

    fn kind(&self) -> BackendType {
        BackendType::Bluetooth
    }

    fn open(&mut self) -> Result<(), Error> {
        if self.link.connect_type() == ConnectType::None {
            return Err(Error::Disconnected);
        }
        self.opened = true;
        Ok(())
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.read_prepare(offset, buf.len() as u32)?;
        self.read_complete(offset, buf)
    }

    fn read_prepare(&mut self, offset: u32, size: u32) -> Result<(), Error> {
        if size == 0 {
            // Cancelling is allowed on a dropped link.
            let _ = self.link.request(offset, 0);
            return Ok(());
        }
        self.check()?;
        self.link.request(offset, size).map_err(|e| {
            log::error!("bt request {:#x}+{:#x} failed: {:?}", offset, size, e);
            Error::Io
        })
    }

    fn read_complete(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.check()?;
        self.link.receive(buf).map_err(|e| {
            log::error!("bt receive at {:#x} failed: {:?}", offset, e);
            Error::Io
        })
    }

    fn ioctl(&mut self, cmd: Ioctl) -> Result<u32, Error> {
        match cmd {
            Ioctl::GetMaxSize => Ok(self.link.max_request_size()),
            Ioctl::GetUnitSize => Ok(self.link.unit_size()),
            Ioctl::ReportImageValid(valid) => {
                self.link.report_image_valid(valid);
                Ok(0)
            }
            Ioctl::ReportProgress(percent) => {
                self.link.report_progress(percent);
                Ok(0)
            }
            Ioctl::GetConnectType => Ok(self.link.connect_type() as u32),
            Ioctl::ExecuteExit => {
                self.link.exit();
                Ok(0)
            }
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.opened = false;
        Ok(())
    }
}
