//! Delta image support.
//!
//! A delta image ships a binary patch per file instead of the file itself.
//! The diff algorithm is provided by the integrator through [`FilePatcher`];
//! the engine hands it a [`PatchJob`] describing where the old file, the
//! patch and the new file live, and a [`PatchIo`] to reach them.

#![allow(missing_docs)]

use crate::error::Result;

/// Locations of one patch application. Offsets of `old_*` and `new_*` are
/// absolute flash addresses on the same storage; `patch_*` are image offsets.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PatchJob {
    pub file_id: u8,
    pub old_offset: u32,
    pub old_size: u32,
    pub new_offset: u32,
    pub new_size: u32,
    pub patch_offset: u32,
    pub patch_size: u32,
    pub use_crc: bool,
    pub use_encryption: bool,
}

/// Byte access handed to a patcher while it runs.
pub trait PatchIo {
    /// Read patch bytes, `offset` relative to the start of the patch.
    fn read_patch(&mut self, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Read the running file, `offset` relative to its start.
    fn read_old(&mut self, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Program the new file, `offset` relative to its start. Ascending order.
    fn write_new(&mut self, offset: u32, data: &[u8]) -> Result<()>;
}

/// Reconstructs a new file from the running one and a patch.
pub trait FilePatcher {
    type Error: core::fmt::Debug;

    fn apply(&mut self, job: &PatchJob, io: &mut dyn PatchIo) -> core::result::Result<(), Self::Error>;
}

/// Patcher for builds without delta support. Every delta image fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPatch;

impl FilePatcher for NoPatch {
    type Error = ();

    fn apply(&mut self, job: &PatchJob, _io: &mut dyn PatchIo) -> core::result::Result<(), ()> {
        log::error!("file {}: delta images are not supported", job.file_id);
        Err(())
    }
}
