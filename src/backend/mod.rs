//! # Transport backends
//!
//! A backend is where the upgrade image comes from. The engine only needs
//! random-access reads plus a handful of control requests ([`Ioctl`]), so
//! the [`Backend`] trait is small. Three concrete backends cover the
//! supported sources:
//!
//! - [`TempPartitionBackend`]: an image already staged in a flash partition
//! - [`SdCardBackend`]: an image file on removable media
//! - [`BluetoothBackend`]: an image pulled from a phone over a BLE/SPP link
//!
//! [`AnyBackend`] selects one of them at construction time when the source
//! is only known at runtime.
//!
//! Link-oriented backends announce each ranged request with
//! [`Backend::read_prepare`] and then deliver it in pieces through
//! [`Backend::read_complete`]; a prepare of size zero cancels the pending
//! request. File and flash backends keep the default pass-through behavior.

#![allow(missing_docs)]

mod bluetooth;
mod sdcard;
mod temp_part;


pub use bluetooth::{BluetoothBackend, OtaLink};
pub use sdcard::{FileSource, SdCardBackend};
pub use temp_part::TempPartitionBackend;

use crate::storage::ReadStorage;

/// Source of an upgrade, persisted in the breakpoint.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BackendType {
    #[default]
    Unknown = 0,
    SdCard = 1,
    Bluetooth = 2,
    TempPartition = 3,
}

impl BackendType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(BackendType::Unknown),
            1 => Some(BackendType::SdCard),
            2 => Some(BackendType::Bluetooth),
            3 => Some(BackendType::TempPartition),
            _ => None,
        }
    }
}

/// How a link backend is currently connected.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ConnectType {
    None = 0,
    Ble = 1,
    Spp = 2,
}

impl ConnectType {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => ConnectType::Ble,
            2 => ConnectType::Spp,
            _ => ConnectType::None,
        }
    }
}

/// Control requests understood by backends.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ioctl {
    /// Largest single request, 0 when unlimited.
    GetMaxSize,
    /// Transfer unit requests should be multiples of, 0 when unknown.
    GetUnitSize,
    ReportImageValid(bool),
    /// Transfer progress in percent.
    ReportProgress(u8),
    /// Returns a [`ConnectType`] discriminant.
    GetConnectType,
    /// Ask the remote side to leave upgrade mode.
    ExecuteExit,
}

/// Errors raised by the bundled backends.
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum Error {
    #[error("backend not open")]
    NotOpen,
    #[error("read outside the image")]
    OutOfRange,
    #[error("backend i/o failed")]
    Io,
    #[error("link disconnected")]
    Disconnected,
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::NotOpen => defmt::write!(f, "NotOpen"),
            Error::OutOfRange => defmt::write!(f, "OutOfRange"),
            Error::Io => defmt::write!(f, "Io"),
            Error::Disconnected => defmt::write!(f, "Disconnected"),
        }
    }
}

/// A source of upgrade images.
pub trait Backend {
    type Error: core::fmt::Debug;

    fn kind(&self) -> BackendType;

    fn open(&mut self) -> Result<(), Self::Error>;

    /// Random-access read of `buf.len()` bytes at `offset`.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Announce a request for `size` bytes at `offset`; zero cancels.
    fn read_prepare(&mut self, _offset: u32, _size: u32) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Receive the next piece of the prepared request.
    fn read_complete(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.read(offset, buf)
    }

    fn ioctl(&mut self, _cmd: Ioctl) -> Result<u32, Self::Error> {
        Ok(0)
    }

    fn close(&mut self) -> Result<(), Self::Error>;

    /// Whether requests are framed with `read_prepare`/`read_complete`.
    fn is_link(&self) -> bool {
        self.kind() == BackendType::Bluetooth
    }
}

/// One of the bundled backends, chosen at runtime.
pub enum AnyBackend<R: ReadStorage, S: FileSource, L: OtaLink> {
    TempPartition(TempPartitionBackend<R>),
    SdCard(SdCardBackend<S>),
    Bluetooth(BluetoothBackend<L>),
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $e:expr) => {
        match $self {
            AnyBackend::TempPartition($b) => $e,
            AnyBackend::SdCard($b) => $e,
            AnyBackend::Bluetooth($b) => $e,
        }
    };
}

impl<R: ReadStorage, S: FileSource, L: OtaLink> Backend for AnyBackend<R, S, L> {
    type Error = Error;

    fn kind(&self) -> BackendType {
        dispatch!(self, b => b.kind())
    }

    fn open(&mut self) -> Result<(), Error> {
        dispatch!(self, b => b.open())
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        dispatch!(self, b => b.read(offset, buf))
    }

    fn read_prepare(&mut self, offset: u32, size: u32) -> Result<(), Error> {
        dispatch!(self, b => b.read_prepare(offset, size))
    }

    fn read_complete(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        dispatch!(self, b => b.read_complete(offset, buf))
    }

    fn ioctl(&mut self, cmd: Ioctl) -> Result<u32, Error> {
        dispatch!(self, b => b.ioctl(cmd))
    }

    fn close(&mut self) -> Result<(), Error> {
        dispatch!(self, b => b.close())
    }
}
