//! Error taxonomy shared by every stage of an upgrade.
//!
//! Each [`Error`] falls into one [`ErrorClass`]. The class decides what the
//! orchestrator does with the breakpoint when an attempt is aborted:
//! resumable classes keep the per-file cursor so the next attempt continues
//! where this one stopped, everything else marks the upgrade failed.

#![allow(missing_docs)]

use core::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Flash operation that failed.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StorageOp {
    Read,
    Write,
    Erase,
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageOp::Read => "read",
            StorageOp::Write => "write",
            StorageOp::Erase => "erase",
        })
    }
}

/// Malformed data on the wire.
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum ProtocolError {
    #[error("bad block magic {0:#010x}")]
    BadMagic(u32),
    #[error("bad block header size {0}")]
    BadHeaderSize(u32),
    #[error("decoded length does not match block header")]
    LengthMismatch,
    #[error("corrupt compressed block")]
    CorruptBlock,
    #[error("bad image header")]
    BadImageHeader,
    #[error("manifest could not be parsed")]
    Manifest,
}

/// Why an image was refused before anything was erased.
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum Ineligible {
    #[error("image built for another board")]
    BoardMismatch,
    #[error("delta image base version differs from the running firmware")]
    BaseVersionMismatch,
    #[error("delta image requires version control")]
    PatchWithoutVersionControl,
}

/// Every failure the engine reports.
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum Error {
    #[error("image read failed at {offset:#x}")]
    TransportRead { offset: u32 },
    #[error("relay send failed at {offset:#x}")]
    TransportWrite { offset: u32 },
    #[error("transport backend not ready")]
    NotReady,
    #[error("flash {op} failed at {addr:#x}")]
    Storage { op: StorageOp, addr: u32 },
    #[error("key/value store access failed")]
    Nvram,
    #[error("protocol violation: {0}")]
    Protocol(ProtocolError),
    #[error("file {file_id} checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Verify {
        file_id: u8,
        expected: u32,
        actual: u32,
    },
    #[error("image data checksum mismatch")]
    ImageCorrupt,
    #[error("not eligible: {0}")]
    Ineligible(Ineligible),
    #[error("image differs from the one being resumed")]
    ImageChanged,
    #[error("compressed block of {0} bytes exceeds staging buffers")]
    BlockTooLarge(u32),
    #[error("file {file_id} does not fit its partition")]
    FileTooLarge { file_id: u8 },
    #[error("no partition for file {0}")]
    NoPartition(u8),
    #[error("no storage with id {0}")]
    NoStorage(u8),
    #[error("file missing from image directory")]
    MissingFile,
    #[error("breakpoint file table is full")]
    TableFull,
    #[error("file {0} cannot start writing while another file is mid-write")]
    ConcurrentWriter(u8),
    #[error("breakpoint record not found")]
    NotFound,
    #[error("image producer stalled")]
    WorkerStalled,
    #[error("patch application failed")]
    Patch,
    #[error("operation not supported")]
    Unsupported,
    #[error("operation not allowed in the current state")]
    InvalidState,
    #[error("a backend is already attached")]
    Busy,
    #[error("invalid configuration")]
    Config,
}

/// Coarse classification driving the propagation policy.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorClass {
    /// Read, write or erase failure, transport drop. Resumable.
    TransientIo,
    /// Malformed framing on the wire. Resumable.
    Protocol,
    /// Checksum mismatch after write.
    Verify,
    /// Board or base version mismatch. Nothing was erased.
    Eligibility,
    /// Image identity changed since the breakpoint was taken.
    ImageChanged,
    /// Everything else.
    Fatal,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::TransportRead { .. }
            | Error::TransportWrite { .. }
            | Error::NotReady
            | Error::Storage { .. }
            | Error::Nvram => ErrorClass::TransientIo,
            Error::Protocol(_) => ErrorClass::Protocol,
            Error::Verify { .. } | Error::ImageCorrupt => ErrorClass::Verify,
            Error::Ineligible(_) => ErrorClass::Eligibility,
            Error::ImageChanged => ErrorClass::ImageChanged,
            _ => ErrorClass::Fatal,
        }
    }

    /// Whether the breakpoint cursor should be kept for the next attempt.
    pub fn is_resumable(&self) -> bool {
        matches!(self.class(), ErrorClass::TransientIo | ErrorClass::Protocol)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<Ineligible> for Error {
    fn from(e: Ineligible) -> Self {
        Error::Ineligible(e)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for StorageOp {
    fn format(&self, f: defmt::Formatter) {
        match self {
            StorageOp::Read => defmt::write!(f, "read"),
            StorageOp::Write => defmt::write!(f, "write"),
            StorageOp::Erase => defmt::write!(f, "erase"),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ProtocolError {
    fn format(&self, f: defmt::Formatter) {
        match self {
            ProtocolError::BadMagic(m) => defmt::write!(f, "BadMagic({=u32:#x})", m),
            ProtocolError::BadHeaderSize(s) => defmt::write!(f, "BadHeaderSize({=u32})", s),
            ProtocolError::LengthMismatch => defmt::write!(f, "LengthMismatch"),
            ProtocolError::CorruptBlock => defmt::write!(f, "CorruptBlock"),
            ProtocolError::BadImageHeader => defmt::write!(f, "BadImageHeader"),
            ProtocolError::Manifest => defmt::write!(f, "Manifest"),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Ineligible {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Ineligible::BoardMismatch => defmt::write!(f, "BoardMismatch"),
            Ineligible::BaseVersionMismatch => defmt::write!(f, "BaseVersionMismatch"),
            Ineligible::PatchWithoutVersionControl => defmt::write!(f, "PatchWithoutVersionControl"),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::TransportRead { offset } => defmt::write!(f, "TransportRead({=u32:#x})", offset),
            Error::TransportWrite { offset } => defmt::write!(f, "TransportWrite({=u32:#x})", offset),
            Error::NotReady => defmt::write!(f, "NotReady"),
            Error::Storage { op, addr } => defmt::write!(f, "Storage({}, {=u32:#x})", op, addr),
            Error::Nvram => defmt::write!(f, "Nvram"),
            Error::Protocol(e) => defmt::write!(f, "Protocol({})", e),
            Error::Verify {
                file_id,
                expected,
                actual,
            } => defmt::write!(
                f,
                "Verify(file {=u8}, {=u32:#x} != {=u32:#x})",
                file_id,
                expected,
                actual
            ),
            Error::ImageCorrupt => defmt::write!(f, "ImageCorrupt"),
            Error::Ineligible(e) => defmt::write!(f, "Ineligible({})", e),
            Error::ImageChanged => defmt::write!(f, "ImageChanged"),
            Error::BlockTooLarge(n) => defmt::write!(f, "BlockTooLarge({=u32})", n),
            Error::FileTooLarge { file_id } => defmt::write!(f, "FileTooLarge({=u8})", file_id),
            Error::NoPartition(id) => defmt::write!(f, "NoPartition({=u8})", id),
            Error::NoStorage(id) => defmt::write!(f, "NoStorage({=u8})", id),
            Error::MissingFile => defmt::write!(f, "MissingFile"),
            Error::TableFull => defmt::write!(f, "TableFull"),
            Error::ConcurrentWriter(id) => defmt::write!(f, "ConcurrentWriter({=u8})", id),
            Error::NotFound => defmt::write!(f, "NotFound"),
            Error::WorkerStalled => defmt::write!(f, "WorkerStalled"),
            Error::Patch => defmt::write!(f, "Patch"),
            Error::Unsupported => defmt::write!(f, "Unsupported"),
            Error::InvalidState => defmt::write!(f, "InvalidState"),
            Error::Busy => defmt::write!(f, "Busy"),
            Error::Config => defmt::write!(f, "Config"),
        }
    }
}
