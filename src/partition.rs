//! Partition table view used by the upgrade engine.
//!
//! The table itself belongs to the board; the engine only reads it. Files
//! that exist twice (A/B slots) carry a `mirror_id`, and the slot that is
//! not running is the one an upgrade writes to.

#![allow(missing_docs)]

use bitflags::bitflags;

use crate::storage::Region;

pub const FILE_ID_BOOT: u8 = 1;
pub const FILE_ID_PARAM: u8 = 2;
pub const FILE_ID_RECOVERY: u8 = 3;
pub const FILE_ID_SYSTEM: u8 = 4;
pub const FILE_ID_SDFS_BASE: u8 = 5;
pub const FILE_ID_SDFS_PART1: u8 = 6;
pub const FILE_ID_SDFS_PART2: u8 = 7;
pub const FILE_ID_OTA_TEMP: u8 = 8;

/// Whether `file_id` belongs to the resource (SDFS) family.
pub fn is_resource_file(file_id: u8) -> bool {
    matches!(
        file_id,
        FILE_ID_SDFS_BASE | FILE_ID_SDFS_PART1 | FILE_ID_SDFS_PART2
    )
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PartitionType {
    Normal = 0,
    Temp = 1,
    Boot = 2,
    Param = 3,
}

impl PartitionType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PartitionType::Normal),
            1 => Some(PartitionType::Temp),
            2 => Some(PartitionType::Boot),
            3 => Some(PartitionType::Param),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub struct PartitionFlags: u8 {
        /// Data is stored with inline CRC words.
        const CRC = 1 << 0;
        /// Data is stored encrypted.
        const ENCRYPTION = 1 << 1;
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Partition {
    pub name: &'static str,
    pub file_id: u8,
    pub storage_id: u8,
    /// Start of the partition on its storage.
    pub offset: u32,
    /// Where file data starts, at or after `offset`.
    pub file_offset: u32,
    pub size: u32,
    pub flags: PartitionFlags,
    pub kind: PartitionType,
    /// A/B slot, `None` when the partition is not mirrored.
    pub mirror_id: Option<u8>,
}

impl Partition {
    /// Largest file that fits behind `file_offset`.
    pub fn max_file_size(&self) -> u32 {
        self.size - (self.file_offset - self.offset)
    }

    pub fn is_boot(&self) -> bool {
        self.kind == PartitionType::Boot
    }

    pub fn is_param(&self) -> bool {
        self.kind == PartitionType::Param
    }
}

impl Region for Partition {
    fn start(&self) -> u32 {
        self.offset
    }

    fn end(&self) -> u32 {
        self.offset + self.size
    }
}

/// Read-only access to the board's partition table.
///
/// Only [`entries`](PartitionTable::entries), the running slot and the
/// running file id are required; lookups have default implementations over
/// the entry list.
pub trait PartitionTable {
    fn entries(&self) -> &[Partition];

    /// Slot the device booted from.
    fn current_mirror_id(&self) -> u8;

    /// File id of the firmware currently executing.
    fn current_file_id(&self) -> u8;

    /// Slot an upgrade writes to.
    fn mirror_slot(&self) -> u8 {
        self.current_mirror_id() ^ 1
    }

    /// Partition of `file_id` in use by the running firmware.
    fn part(&self, file_id: u8) -> Option<Partition> {
        let current = self.current_mirror_id();
        self.entries()
            .iter()
            .find(|p| p.file_id == file_id && p.mirror_id.is_none_or(|m| m == current))
            .copied()
    }

    /// Partition of `file_id` in the slot that is not running.
    fn mirror_part(&self, file_id: u8) -> Option<Partition> {
        let slot = self.mirror_slot();
        self.entries()
            .iter()
            .find(|p| p.file_id == file_id && p.mirror_id == Some(slot))
            .copied()
    }

    fn is_mirror_part(&self, part: &Partition) -> bool {
        part.mirror_id == Some(self.mirror_slot())
    }
}
