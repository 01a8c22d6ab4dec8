//! # libota - resumable firmware updates
//!
//! A firmware update engine for embedded devices with internal flash. An
//! upgrade image is pulled from a transport backend (SD card, Bluetooth
//! link, or a staging partition), checked against the running firmware,
//! and written file by file into the partition slot that is not running.
//! Every step is recorded in a breakpoint kept in a key/value store, so a
//! power loss or a dropped link costs at most the last unsaved stretch of
//! data, never the running firmware.
//!
//! ## Features
//!
//! ### Upgrade engine
//! - **Breakpoint store**: persistent per-file cursors with a strictly increasing save id
//! - **Receive pipeline**: bounded ring between the image source and the flash writer,
//!   with LZ4 block decoding for compressed files
//! - **Storage writer**: erase-aligned resume, elision of erases on blank flash
//! - **Atomic tail**: boot and param files are switched last
//!
//! ### Transport backends
//! - Image staged in a flash partition
//! - Image file on removable media
//! - Image pulled over a BLE/SPP link
//!
//! ### Host relay
//! - Serves a held image to a peer device that runs its own engine
//!
//! ## Usage
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! libota = "0.1.0"
//! ```
//!
//! ### Running an upgrade
//!
//! ```rust,ignore
//! use libota::config::OtaConfig;
//! use libota::image::OtaImage;
//! use libota::upgrade::{OtaEngine, Outcome};
//!
//! let mut engine = OtaEngine::new([flash], table, kv, OtaConfig::default(), running, ())?;
//! let mut image = OtaImage::new(backend);
//! if engine.upgrade_check(&mut image, &mut parser)? == Outcome::Upgraded {
//!     reboot();
//! }
//! ```
//!
//! ## Platform Support
//!
//! This library is designed to work on:
//! - Embedded microcontrollers (ARM Cortex-M, RISC-V, etc.)
//! - Host machines, for packaging tools and simulation
//! - Any platform supporting Rust's `core` library
//!
//! ## Optional Features
//!
//! - `std`: Enable standard library support (default: disabled)
//! - `defmt`: Enable defmt formatting for embedded debugging

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(missing_docs)]
#![doc(html_root_url = "https://shishir-dey.github.io/libota/")]

#[cfg(test)]
extern crate std;

/// Error types and their resumability classes.
pub mod error;

/// Engine configuration and buffer capacities.
pub mod config;

/// Flash storage abstraction with erase-aware helpers.
///
/// Provides the [`storage::FlashStorage`] trait the engine writes through,
/// plus a RAM-backed implementation for tests and simulation.
pub mod storage;

/// Partition table: where each file of an image lands.
pub mod partition;

/// Typed upgrade manifest.
pub mod manifest;

/// Key/value store used for durable state.
pub mod nvram;

/// Binary patch hook for delta images.
pub mod patch;

/// Persistent upgrade progress.
pub mod breakpoint;

/// Image sources.
pub mod backend;

/// Image container format and progress reporting.
pub mod image;

/// Producer/consumer pipeline between backend and flash.
pub mod rx;

/// Upgrade orchestration.
pub mod upgrade;

/// Relay that serves an image to a peer device.
pub mod host;
