//! Error type reported by the bundled flash drivers

/// Failure of a single flash operation.
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum Error {
    #[error("address range outside the device")]
    OutOfBounds,
    /// Erase bounds are not multiples of the sector size.
    #[error("erase range not sector aligned")]
    Misaligned,
    #[error("program failed")]
    Program,
    #[error("read failed")]
    Read,
    #[error("erase failed")]
    Erase,
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::OutOfBounds => defmt::write!(f, "OutOfBounds"),
            Error::Misaligned => defmt::write!(f, "Misaligned"),
            Error::Program => defmt::write!(f, "Program"),
            Error::Read => defmt::write!(f, "Read"),
            Error::Erase => defmt::write!(f, "Erase"),
        }
    }
}
