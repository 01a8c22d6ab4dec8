//! Upgrade manifest: what an image contains and where each file goes.
//!
//! The manifest text format is owned by the image builder, so parsing is
//! delegated to a [`ManifestParser`] supplied by the integrator. The engine
//! only consumes the typed result.

#![allow(missing_docs)]

use heapless::{String, Vec};

use crate::backend::Backend;
use crate::config::MAX_FILES;
use crate::image::OtaImage;
use crate::partition::{FILE_ID_OTA_TEMP, PartitionType};

/// Firmware identity.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct FwVersion {
    pub version_code: u32,
    pub version_res: u32,
    pub version_name: String<32>,
    pub board_name: String<32>,
}

/// One file of the image and its target.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OtaFile {
    /// Name in the image directory. Empty means the whole data area.
    pub name: String<12>,
    pub file_id: u8,
    pub kind: PartitionType,
    pub storage_id: u8,
    /// Absolute flash address, resolved from the target partition.
    pub offset: u32,
    /// Bytes on the wire.
    pub size: u32,
    /// Bytes in flash once decompressed.
    pub orig_size: u32,
    /// CRC32 of the decompressed file.
    pub checksum: u32,
}

impl OtaFile {
    /// Stored without compression.
    pub fn is_raw(&self) -> bool {
        self.size == self.orig_size
    }
}

#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Manifest {
    pub fw_ver: FwVersion,
    /// Base version of a delta image, `version_code == 0` otherwise.
    pub old_fw_ver: FwVersion,
    pub files: Vec<OtaFile, MAX_FILES>,
}

impl Manifest {
    pub fn is_patch(&self) -> bool {
        self.old_fw_ver.version_code != 0
    }

    /// A recovery image that carries the OTA temp file is finished by the
    /// recovery loader, not by this run.
    pub fn carries_temp_image(&self) -> bool {
        self.files
            .iter()
            .any(|f| f.kind == PartitionType::Temp && f.file_id == FILE_ID_OTA_TEMP)
    }
}

/// Turns the manifest file inside an image into a [`Manifest`].
pub trait ManifestParser {
    type Error: core::fmt::Debug;

    fn parse<B: Backend>(
        &mut self,
        image: &mut OtaImage<B>,
        name: &str,
    ) -> Result<Manifest, Self::Error>;
}
