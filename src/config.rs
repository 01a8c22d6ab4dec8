//! Engine configuration.
//!
//! Runtime knobs live in [`OtaConfig`], which can be built in code or
//! deserialized from a small JSON document kept next to the firmware:
//!
//! ```rust
//! use libota::config::OtaConfig;
//!
//! let json = br#"{"bp_save_size": 65536, "use_recovery": true}"#;
//! let config = OtaConfig::from_json(json).unwrap();
//! assert_eq!(config.bp_save_size, 65536);
//! assert!(config.use_recovery);
//! assert_eq!(config.erase_block_size, libota::config::DEFAULT_ERASE_BLOCK_SIZE);
//! ```
//!
//! Buffer capacities are compile-time constants; the runtime sizes only
//! select how much of each buffer is used.

#![allow(missing_docs)]

use serde::Deserialize;

use crate::error::{Error, Result};

/// Segment scratch used by the image producer.
pub const DATA_BUF_SIZE: usize = 4 * 1024;
/// Ring buffer between producer and consumer.
pub const RX_RING_SIZE: usize = 8 * 1024;
/// Staging for one compressed block (or one raw chunk), header included.
pub const IN_BUF_SIZE: usize = 32 * 1024 + BLOCK_HEADER_SIZE;
/// Staging for one decompressed block.
pub const OUT_BUF_SIZE: usize = 32 * 1024;
/// Chunk buffer of the host relay.
pub const HOST_BUF_SIZE: usize = 16 * 1024;
/// Header in front of every compressed block.
pub const BLOCK_HEADER_SIZE: usize = 16;
/// Files per manifest and slots in the breakpoint file table.
pub const MAX_FILES: usize = 16;

pub const DEFAULT_BP_SAVE_SIZE: u32 = 512 * 1024;
pub const DEFAULT_ERASE_BLOCK_SIZE: u32 = 64 * 1024;
pub const DEFAULT_MAX_REQUEST_SIZE: u32 = 256 * 1024;
pub const DEFAULT_STALL_LIMIT: u32 = 64;

/// Manifest file name inside the image.
pub const MANIFEST_NAME: &str = "ota.xml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Minimum cursor advance between two persisted breakpoints.
    pub bp_save_size: u32,
    /// Size of the fast block erase used while streaming.
    pub erase_block_size: u32,
    /// Upper bound of a single backend request.
    pub max_request_size: u32,
    /// Bytes fetched per producer step.
    pub data_buf_size: u32,
    /// Bytes handed to flash per raw chunk.
    pub in_buf_size: u32,
    /// Bytes per chunk sent by the host relay.
    pub host_buf_size: u32,
    /// Consecutive producer steps without progress before giving up.
    pub stall_limit: u32,
    /// Storage holding the temp partitions in recovery mode.
    pub primary_storage_id: u8,
    pub no_version_control: bool,
    pub use_recovery: bool,
    pub use_recovery_app: bool,
    pub erase_part_for_upg: bool,
    pub keep_temp_part: bool,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            bp_save_size: DEFAULT_BP_SAVE_SIZE,
            erase_block_size: DEFAULT_ERASE_BLOCK_SIZE,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            data_buf_size: DATA_BUF_SIZE as u32,
            in_buf_size: (IN_BUF_SIZE - BLOCK_HEADER_SIZE) as u32,
            host_buf_size: HOST_BUF_SIZE as u32,
            stall_limit: DEFAULT_STALL_LIMIT,
            primary_storage_id: 0,
            no_version_control: false,
            use_recovery: false,
            use_recovery_app: false,
            erase_part_for_upg: false,
            keep_temp_part: false,
        }
    }
}

impl OtaConfig {
    /// Parses and validates a JSON configuration. Missing keys keep their defaults.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let (config, _) =
            serde_json_core::from_slice::<OtaConfig>(json).map_err(|_| Error::Config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.use_recovery_app && !self.use_recovery {
            log::error!("use_recovery_app requires use_recovery");
            return Err(Error::Config);
        }
        if self.data_buf_size == 0 || self.data_buf_size as usize > DATA_BUF_SIZE {
            return Err(Error::Config);
        }
        if self.in_buf_size == 0 || self.in_buf_size as usize > IN_BUF_SIZE - BLOCK_HEADER_SIZE {
            return Err(Error::Config);
        }
        if self.host_buf_size == 0 || self.host_buf_size as usize > HOST_BUF_SIZE {
            return Err(Error::Config);
        }
        if self.bp_save_size == 0
            || self.max_request_size == 0
            || self.stall_limit == 0
            || !self.erase_block_size.is_power_of_two()
        {
            return Err(Error::Config);
        }
        Ok(())
    }
}
