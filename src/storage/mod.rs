//! # Flash storage layer
//!
//! Byte-addressed storage traits plus the erase-aligned, wear-aware helpers
//! the upgrade engine writes through.
//!
//! The basic traits ([`ReadStorage`], [`Storage`], [`BlockingErase`]) are
//! deliberately small so that any flash driver can be adapted in a few lines.
//! [`FlashStorage`] adds what the engine needs to reason about erase
//! granularity, and [`StorageSet`] lets a board expose several devices under
//! numeric storage ids.
//!
//! ```text
//!   upgrade engine
//!        │  is_clean / erase_if_dirty / write / read / plan_stream_erase
//!        ▼
//!   StorageSet ── find(storage_id) ──► FlashStorage (NOR, SPI NOR, SD, ...)
//! ```
//!
//! ## Erase elision
//!
//! Every erase issued by the engine goes through [`erase_if_dirty`], which
//! blank-checks the range first. A partition that already reads as erased
//! is never erased again, so an interrupted upgrade can be replayed any
//! number of times without spending erase cycles on clean sectors.
//!
//! ```rust
//! use libota::storage::{erase_if_dirty, ram::RamFlash, Storage};
//!
//! let mut flash = RamFlash::<8192>::new(0, 4096);
//! let mut scratch = [0u8; 256];
//!
//! assert_eq!(erase_if_dirty(&mut flash, 0, 4096, &mut scratch), Ok(false));
//! flash.write(100, &[0x00]).unwrap();
//! assert_eq!(erase_if_dirty(&mut flash, 0, 4096, &mut scratch), Ok(true));
//! assert_eq!(flash.erase_count(), 1);
//! ```

#![allow(missing_docs)]
#![deny(unsafe_code)]

/// Common error types for storage operations
pub mod error;
/// RAM-backed flash with NOR programming semantics
pub mod ram;

#[cfg(test)]
mod tests;

use crate::error::{Error, Result, StorageOp};

/// Re-exports of common traits for convenient importing
pub mod prelude {
    pub use super::{BlockingErase, FlashStorage, ReadStorage, Region, Storage, StorageSet};
}

/// A contiguous address range with start and end boundaries.
pub trait Region {
    /// Start address of the region (inclusive).
    fn start(&self) -> u32;

    /// End address of the region (exclusive).
    fn end(&self) -> u32;

    fn contains(&self, address: u32) -> bool {
        (address >= self.start()) && (address < self.end())
    }
}

/// Trait for reading data from storage devices.
pub trait ReadStorage {
    /// Associated error type for read operations
    type Error: core::fmt::Debug;

    /// Fill `bytes` with the data stored at `offset`.
    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> core::result::Result<(), Self::Error>;

    /// Total capacity of the device in bytes.
    fn capacity(&self) -> usize;
}

/// Trait for storage devices that support both read and write operations.
pub trait Storage: ReadStorage {
    /// Program `bytes` at `offset`. On flash the range must have been erased.
    fn write(&mut self, offset: u32, bytes: &[u8]) -> core::result::Result<(), Self::Error>;
}

/// Trait for storage devices that support erase operations.
pub trait BlockingErase: Storage {
    /// Erase `[from, to)`. Both ends are multiples of the erase granularity.
    fn erase(&mut self, from: u32, to: u32) -> core::result::Result<(), Self::Error>;
}

/// A flash device the upgrade engine can write firmware to.
pub trait FlashStorage: BlockingErase {
    /// Identifier used by partition entries to refer to this device.
    fn storage_id(&self) -> u8;

    /// Smallest erasable unit (sector size), a power of two.
    fn erase_align(&self) -> u32;

    /// Value every byte reads back as after an erase.
    fn erased_byte(&self) -> u8 {
        0xFF
    }

    /// `false` for media where a blank check is meaningless (SD, NAND).
    /// Such devices are always treated as dirty.
    fn supports_blank_check(&self) -> bool {
        true
    }
}

/// A set of flash devices addressed by storage id.
pub trait StorageSet {
    type Flash: FlashStorage;

    fn find(&mut self, storage_id: u8) -> Option<&mut Self::Flash>;
}

impl<F: FlashStorage, const N: usize> StorageSet for [F; N] {
    type Flash = F;

    fn find(&mut self, storage_id: u8) -> Option<&mut F> {
        self.iter_mut().find(|f| f.storage_id() == storage_id)
    }
}

/// `align` must be a power of two.
pub const fn align_down(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// `align` must be a power of two.
pub const fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// The device's erase granularity, rejected unless it is a power of two.
pub fn erase_align<F: FlashStorage>(flash: &F) -> Result<u32> {
    let align = flash.erase_align();
    if !align.is_power_of_two() {
        log::error!("flash {}: bad erase alignment {:#x}", flash.storage_id(), align);
        return Err(Error::Config);
    }
    Ok(align)
}

/// Read `buf.len()` bytes at `addr`.
pub fn read<F: FlashStorage>(flash: &mut F, addr: u32, buf: &mut [u8]) -> Result<()> {
    flash.read(addr, buf).map_err(|e| {
        log::error!("flash {}: read {:#x}+{:#x} failed: {:?}", flash.storage_id(), addr, buf.len(), e);
        Error::Storage {
            op: StorageOp::Read,
            addr,
        }
    })
}

/// Program `data` at `addr`.
pub fn write<F: FlashStorage>(flash: &mut F, addr: u32, data: &[u8]) -> Result<()> {
    flash.write(addr, data).map_err(|e| {
        log::error!("flash {}: write {:#x}+{:#x} failed: {:?}", flash.storage_id(), addr, data.len(), e);
        Error::Storage {
            op: StorageOp::Write,
            addr,
        }
    })
}

/// Erase `[addr, addr + len)`, widened to the device's erase granularity.
pub fn erase<F: FlashStorage>(flash: &mut F, addr: u32, len: u32) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let align = erase_align(flash)?;
    let from = align_down(addr, align);
    let to = align_up(addr + len, align);
    log::debug!("flash {}: erase {:#x}..{:#x}", flash.storage_id(), from, to);
    flash.erase(from, to).map_err(|e| {
        log::error!("flash {}: erase {:#x}..{:#x} failed: {:?}", flash.storage_id(), from, to, e);
        Error::Storage {
            op: StorageOp::Erase,
            addr: from,
        }
    })
}

/// Whether `[addr, addr + len)` reads back as erased.
///
/// The range is read in `scratch`-sized pieces, so the scratch buffer bounds
/// the stack cost of the check.
pub fn is_clean<F: FlashStorage>(
    flash: &mut F,
    addr: u32,
    len: u32,
    scratch: &mut [u8],
) -> Result<bool> {
    if !flash.supports_blank_check() || scratch.is_empty() {
        return Ok(false);
    }
    let erased = flash.erased_byte();
    let mut pos = addr;
    let end = addr + len;
    while pos < end {
        let n = core::cmp::min(scratch.len() as u32, end - pos) as usize;
        read(flash, pos, &mut scratch[..n])?;
        if scratch[..n].iter().any(|b| *b != erased) {
            return Ok(false);
        }
        pos += n as u32;
    }
    Ok(true)
}

/// Erase the range unless it is already blank. Returns whether an erase was issued.
pub fn erase_if_dirty<F: FlashStorage>(
    flash: &mut F,
    addr: u32,
    len: u32,
    scratch: &mut [u8],
) -> Result<bool> {
    if len == 0 {
        return Ok(false);
    }
    let align = erase_align(flash)?;
    let from = align_down(addr, align);
    let to = align_up(addr + len, align);
    if is_clean(flash, from, to - from, scratch)? {
        log::debug!("flash {}: {:#x}..{:#x} already clean", flash.storage_id(), from, to);
        return Ok(false);
    }
    erase(flash, from, to - from)?;
    Ok(true)
}

/// Position of a streamed chunk relative to the erase blocks of its file area.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EraseRegion {
    /// Before the first whole erase block.
    First,
    /// Inside the block-aligned body; erased one block at a time.
    Middle,
    /// After the last whole erase block.
    Last,
}

/// Erase to issue before writing a streamed chunk.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EraseSpan {
    pub region: EraseRegion,
    pub addr: u32,
    pub len: u32,
}

/// Plans the erase that must precede writing `write_len` bytes at
/// `write_addr` inside a file area starting at `area_start` of `area_size`
/// bytes.
///
/// Chunks are expected in ascending order, and the sector holding
/// `write_addr` must already be erased when the cursor is not sector
/// aligned: either the span of the previous chunk covered it, or the resume
/// path erased it. The plan therefore never reaches below the first sector
/// boundary at or after `write_addr`, so bytes already written stay intact.
/// Inside the block-aligned body whole `block`-sized erases run ahead of the
/// write cursor, so a chunk that lands in a block erased for a previous chunk
/// plans nothing. The span is clipped to the end of the area.
pub fn plan_stream_erase(
    area_start: u32,
    area_size: u32,
    write_addr: u32,
    write_len: u32,
    align: u32,
    block: u32,
) -> Option<EraseSpan> {
    let area_end = area_start + area_size;
    let blk_start = align_up(area_start, block);
    let blk_end = align_down(area_end, block);

    let mut addr = align_up(write_addr, align);
    let end = align_up(write_addr + write_len, align);
    let mut len = end.saturating_sub(addr);
    let erase_blk_start = align_up(write_addr, block);
    let erase_blk_end = align_up(end, block);

    let region = if write_addr < blk_start {
        if end > blk_start && erase_blk_end <= blk_end {
            len = erase_blk_end - addr;
        }
        EraseRegion::First
    } else if write_addr < blk_end {
        addr = erase_blk_start;
        len = erase_blk_end.saturating_sub(erase_blk_start);
        EraseRegion::Middle
    } else {
        EraseRegion::Last
    };

    if addr >= area_end {
        return None;
    }
    if addr + len > area_end {
        len = area_end - addr;
    }
    if len == 0 {
        return None;
    }
    Some(EraseSpan { region, addr, len })
}
