//! Persisted key/value store and the records the engine keeps in it.

#![allow(missing_docs)]

use crate::error::{Error, Result};

/// Key of the breakpoint blob.
pub const BREAKPOINT_KEY: &str = "OTA_BP";
/// Key of the firmware version record.
pub const FW_VERSION_KEY: &str = "FW_VERSION";
/// Key of the resource version record.
pub const RES_VERSION_KEY: &str = "FW_RES_VER";

/// Durable key/value storage. `set` must be atomic per key.
pub trait KvStore {
    type Error: core::fmt::Debug;

    /// Copy the value of `key` into `buf` and return its length.
    fn get(&mut self, key: &str, buf: &mut [u8]) -> core::result::Result<usize, Self::Error>;

    fn set(&mut self, key: &str, value: &[u8]) -> core::result::Result<(), Self::Error>;
}

/// Code and resource version pair, 8 bytes little endian.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VersionRecord {
    pub version_code: u32,
    pub version_res: u32,
}

impl VersionRecord {
    pub const SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.version_code.to_le_bytes());
        out[4..].copy_from_slice(&self.version_res.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            version_code: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            version_res: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    pub fn load<K: KvStore>(kv: &mut K, key: &str) -> Option<Self> {
        let mut buf = [0u8; Self::SIZE];
        match kv.get(key, &mut buf) {
            Ok(n) => Self::from_bytes(&buf[..n]),
            Err(_) => None,
        }
    }

    pub fn store<K: KvStore>(&self, kv: &mut K, key: &str) -> Result<()> {
        kv.set(key, &self.to_bytes()).map_err(|e| {
            log::error!("saving {} failed: {:?}", key, e);
            Error::Nvram
        })
    }
}
