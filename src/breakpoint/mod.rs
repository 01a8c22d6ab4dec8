//! # Breakpoint
//!
//! The breakpoint is the only durable state of an upgrade. It records the
//! global progress ([`BpState`]), a per-file progress table
//! ([`FileState`]), and for the file being written a snapshot of its
//! manifest entry plus two write cursors: one into the on-wire stream and one
//! into the decompressed data already in flash.
//!
//! The record is kept in the key/value store under
//! [`BREAKPOINT_KEY`](crate::nvram::BREAKPOINT_KEY) as a packed 92-byte
//! little-endian blob:
//!
//! ```text
//!  0  bp_id            u32     36  cur_file.offset       u32
//!  4  mirror_id        u8      40  cur_file.size         u32
//!  5  backend_type     u8      44  cur_file.orig_size    u32
//!  6  state            u8      48  cur_file.checksum     u32
//!  7  reserved         u8      52  cur_file_write_offset u32
//!  8  old_version      u32     56  cur_orig_write_offset u32
//! 12  new_version      u32     60  16 x { file_id u8, state u8 }
//! 16  data_checksum    u32
//! 20  cur_file.name    [u8; 12]
//! 32  cur_file.file_id, storage_id, kind, reserved (u8 each)
//! ```
//!
//! Every save bumps `bp_id`. Writes are throttled: while a file is streaming
//! the cursor is persisted only after it advanced by more than the
//! configured save size, so a crash replays at most that many bytes.

#![allow(missing_docs)]


use heapless::String;

use crate::backend::BackendType;
use crate::config::MAX_FILES;
use crate::error::{Error, Result};
use crate::manifest::OtaFile;
use crate::nvram::{BREAKPOINT_KEY, KvStore};
use crate::partition::PartitionType;

/// Size of the persisted record.
pub const BREAKPOINT_SIZE: usize = 92;

/// Global upgrade progress.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BpState {
    #[default]
    Unknown = 0,
    Clean = 1,
    WritingImage = 2,
    UpgradePending = 3,
    UpgradeWriting = 4,
    UpgradeDone = 5,
    WritingImageFailed = 6,
    UpgradingFailed = 7,
}

impl BpState {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => BpState::Unknown,
            1 => BpState::Clean,
            2 => BpState::WritingImage,
            3 => BpState::UpgradePending,
            4 => BpState::UpgradeWriting,
            5 => BpState::UpgradeDone,
            6 => BpState::WritingImageFailed,
            7 => BpState::UpgradingFailed,
            _ => return None,
        })
    }

    /// Files are being written and their cursors are meaningful.
    pub fn is_writing(self) -> bool {
        matches!(self, BpState::UpgradeWriting | BpState::WritingImage)
    }
}

/// Per-file progress.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FileState {
    #[default]
    Unknown = 0,
    Clean = 1,
    WriteStart = 2,
    Writing = 3,
    WritingDirty = 4,
    WritingClean = 5,
    WriteDone = 6,
    VerifyPass = 7,
    WriteFail = 8,
    VerifyFail = 9,
}

impl FileState {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => FileState::Unknown,
            1 => FileState::Clean,
            2 => FileState::WriteStart,
            3 => FileState::Writing,
            4 => FileState::WritingDirty,
            5 => FileState::WritingClean,
            6 => FileState::WriteDone,
            7 => FileState::VerifyPass,
            8 => FileState::WriteFail,
            9 => FileState::VerifyFail,
            _ => return None,
        })
    }

    /// Only one file at a time may be in one of these states.
    pub fn is_writing(self) -> bool {
        matches!(
            self,
            FileState::WriteStart
                | FileState::Writing
                | FileState::WritingDirty
                | FileState::WritingClean
        )
    }

    /// Data is complete in flash.
    pub fn is_written(self) -> bool {
        matches!(self, FileState::WriteDone | FileState::VerifyPass)
    }
}

/// Snapshot of the manifest entry being written.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BpFile {
    pub name: String<12>,
    pub file_id: u8,
    pub storage_id: u8,
    pub kind: PartitionType,
    pub offset: u32,
    pub size: u32,
    pub orig_size: u32,
    pub checksum: u32,
}

impl Default for BpFile {
    fn default() -> Self {
        Self {
            name: String::new(),
            file_id: 0,
            storage_id: 0,
            kind: PartitionType::Normal,
            offset: 0,
            size: 0,
            orig_size: 0,
            checksum: 0,
        }
    }
}

impl From<&OtaFile> for BpFile {
    fn from(f: &OtaFile) -> Self {
        Self {
            name: f.name.clone(),
            file_id: f.file_id,
            storage_id: f.storage_id,
            kind: f.kind,
            offset: f.offset,
            size: f.size,
            orig_size: f.orig_size,
            checksum: f.checksum,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct FileSlot {
    /// Zero marks a free slot.
    pub file_id: u8,
    pub state: FileState,
}

#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Breakpoint {
    pub bp_id: u32,
    pub mirror_id: u8,
    pub backend_type: BackendType,
    pub state: BpState,
    pub old_version: u32,
    pub new_version: u32,
    pub data_checksum: u32,
    pub cur_file: BpFile,
    pub cur_file_write_offset: u32,
    pub cur_orig_write_offset: u32,
    pub file_state: [FileSlot; MAX_FILES],
}

impl Breakpoint {
    /// Fresh record for a device running `running_version`, targeting slot `mirror_id`.
    pub fn new_default(running_version: u32, mirror_id: u8) -> Self {
        Self {
            old_version: running_version,
            mirror_id,
            state: BpState::Clean,
            ..Default::default()
        }
    }

    pub fn file_state(&self, file_id: u8) -> FileState {
        self.file_state
            .iter()
            .find(|s| s.file_id == file_id && file_id != 0)
            .map_or(FileState::Unknown, |s| s.state)
    }

    /// File currently in a write state, if any.
    pub fn writing_file(&self) -> Option<u8> {
        self.file_state
            .iter()
            .find(|s| s.file_id != 0 && s.state.is_writing())
            .map(|s| s.file_id)
    }

    pub fn set_file_state(&mut self, file_id: u8, state: FileState) -> Result<()> {
        if state.is_writing() {
            if let Some(other) = self.writing_file() {
                if other != file_id {
                    log::error!("file {} still writing, refusing {:?} for file {}", other, state, file_id);
                    return Err(Error::ConcurrentWriter(file_id));
                }
            }
        }
        let idx = match self.file_state.iter().position(|s| s.file_id == file_id) {
            Some(i) => i,
            None => self
                .file_state
                .iter()
                .position(|s| s.file_id == 0)
                .ok_or(Error::TableFull)?,
        };
        self.file_state[idx] = FileSlot { file_id, state };
        Ok(())
    }

    /// Drop per-file progress and the current-file snapshot.
    pub fn clear_files(&mut self) {
        self.file_state = [FileSlot::default(); MAX_FILES];
        self.cur_file = BpFile::default();
        self.cur_file_write_offset = 0;
        self.cur_orig_write_offset = 0;
    }

    pub fn encode(&self) -> [u8; BREAKPOINT_SIZE] {
        let mut out = [0u8; BREAKPOINT_SIZE];
        let mut w = Cursor::new(&mut out);
        w.u32(self.bp_id);
        w.u8(self.mirror_id);
        w.u8(self.backend_type as u8);
        w.u8(self.state as u8);
        w.u8(0);
        w.u32(self.old_version);
        w.u32(self.new_version);
        w.u32(self.data_checksum);
        let mut name = [0u8; 12];
        name[..self.cur_file.name.len()].copy_from_slice(self.cur_file.name.as_bytes());
        w.bytes(&name);
        w.u8(self.cur_file.file_id);
        w.u8(self.cur_file.storage_id);
        w.u8(self.cur_file.kind as u8);
        w.u8(0);
        w.u32(self.cur_file.offset);
        w.u32(self.cur_file.size);
        w.u32(self.cur_file.orig_size);
        w.u32(self.cur_file.checksum);
        w.u32(self.cur_file_write_offset);
        w.u32(self.cur_orig_write_offset);
        for slot in &self.file_state {
            w.u8(slot.file_id);
            w.u8(slot.state as u8);
        }
        out
    }

    /// `None` for a blob of the wrong size or with out-of-range fields.
    pub fn decode(blob: &[u8]) -> Option<Self> {
        if blob.len() != BREAKPOINT_SIZE {
            return None;
        }
        let mut r = Reader { buf: blob, pos: 0 };
        let bp_id = r.u32();
        let mirror_id = r.u8();
        let backend_type = BackendType::from_u8(r.u8())?;
        let state = BpState::from_u8(r.u8())?;
        r.u8();
        let old_version = r.u32();
        let new_version = r.u32();
        let data_checksum = r.u32();
        let raw_name = r.bytes(12);
        let name_len = raw_name.iter().position(|b| *b == 0).unwrap_or(12);
        let name = core::str::from_utf8(&raw_name[..name_len]).ok()?;
        let name = String::try_from(name).ok()?;
        let file_id = r.u8();
        let storage_id = r.u8();
        let kind = PartitionType::from_u8(r.u8())?;
        r.u8();
        let cur_file = BpFile {
            name,
            file_id,
            storage_id,
            kind,
            offset: r.u32(),
            size: r.u32(),
            orig_size: r.u32(),
            checksum: r.u32(),
        };
        let cur_file_write_offset = r.u32();
        let cur_orig_write_offset = r.u32();
        let mut file_state = [FileSlot::default(); MAX_FILES];
        for slot in file_state.iter_mut() {
            let file_id = r.u8();
            let state = FileState::from_u8(r.u8())?;
            *slot = FileSlot { file_id, state };
        }
        Some(Self {
            bp_id,
            mirror_id,
            backend_type,
            state,
            old_version,
            new_version,
            data_checksum,
            cur_file,
            cur_file_write_offset,
            cur_orig_write_offset,
            file_state,
        })
    }
}

struct Cursor<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, data: &[u8]) {
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
    }

    fn u8(&mut self, v: u8) {
        self.bytes(&[v]);
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> &'a [u8] {
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    fn u8(&mut self) -> u8 {
        self.bytes(1)[0]
    }

    fn u32(&mut self) -> u32 {
        let b = self.bytes(4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }
}

/// The breakpoint together with the store it is persisted in.
pub struct BreakpointStore<K: KvStore> {
    kv: K,
    bp: Breakpoint,
    save_size: u32,
}

impl<K: KvStore> BreakpointStore<K> {
    /// Loads the persisted breakpoint, or starts from a default one.
    pub fn open(mut kv: K, save_size: u32, running_version: u32, mirror_slot: u8) -> Self {
        let bp = match Self::load(&mut kv) {
            Ok(bp) => {
                log::info!("breakpoint {}: state {:?}", bp.bp_id, bp.state);
                bp
            }
            Err(_) => {
                log::info!("no breakpoint, starting clean");
                Breakpoint::new_default(running_version, mirror_slot)
            }
        };
        Self { kv, bp, save_size }
    }

    pub fn load(kv: &mut K) -> Result<Breakpoint> {
        let mut blob = [0u8; BREAKPOINT_SIZE + 4];
        let len = kv.get(BREAKPOINT_KEY, &mut blob).map_err(|_| Error::NotFound)?;
        Breakpoint::decode(&blob[..len.min(blob.len())]).ok_or_else(|| {
            log::warn!("breakpoint blob of {} bytes rejected", len);
            Error::NotFound
        })
    }

    /// Reset the in-memory record. Not persisted until the next save.
    pub fn init_default(&mut self, running_version: u32, mirror_slot: u8) {
        let bp_id = self.bp.bp_id;
        self.bp = Breakpoint::new_default(running_version, mirror_slot);
        self.bp.bp_id = bp_id;
    }

    pub fn save(&mut self) -> Result<()> {
        self.bp.bp_id = self.bp.bp_id.wrapping_add(1);
        let blob = self.bp.encode();
        self.kv.set(BREAKPOINT_KEY, &blob).map_err(|e| {
            log::error!("breakpoint save failed: {:?}", e);
            Error::Nvram
        })
    }

    pub fn set_file_state(&mut self, file_id: u8, state: FileState) -> Result<()> {
        self.bp.set_file_state(file_id, state)
    }

    /// Set the global state and persist. Terminal states clear per-file progress.
    pub fn update_state(&mut self, state: BpState) -> Result<()> {
        log::info!("breakpoint state {:?} -> {:?}", self.bp.state, state);
        self.bp.state = state;
        if matches!(state, BpState::UpgradeDone | BpState::UpgradePending) {
            self.bp.clear_files();
        }
        self.save()
    }

    /// Record progress of `file`.
    ///
    /// `WriteStart` snapshots the file and sets both cursors. `Writing`
    /// persists only when forced, on the first sample (no cursor change), or
    /// once the cursor moved by more than the save size. Every other state
    /// persists unconditionally.
    pub fn update_file_state(
        &mut self,
        file: &OtaFile,
        state: FileState,
        file_offset: u32,
        orig_offset: u32,
        force: bool,
    ) -> Result<()> {
        match state {
            FileState::WriteStart => {
                self.bp.set_file_state(file.file_id, state)?;
                self.bp.cur_file = BpFile::from(file);
                self.bp.cur_file_write_offset = file_offset;
                self.bp.cur_orig_write_offset = orig_offset;
            }
            FileState::Writing => {
                let delta = orig_offset.abs_diff(self.bp.cur_orig_write_offset);
                if !force && delta != 0 && delta <= self.save_size {
                    return Ok(());
                }
                self.bp.set_file_state(file.file_id, state)?;
                self.bp.cur_file_write_offset = file_offset;
                self.bp.cur_orig_write_offset = orig_offset;
                log::debug!("file {} cursor {:#x}({:#x})", file.file_id, file_offset, orig_offset);
            }
            _ => self.bp.set_file_state(file.file_id, state)?,
        }
        self.save()
    }

    pub fn get(&self) -> &Breakpoint {
        &self.bp
    }

    pub fn get_mut(&mut self) -> &mut Breakpoint {
        &mut self.bp
    }

    pub fn kv_mut(&mut self) -> &mut K {
        &mut self.kv
    }

    pub fn into_inner(self) -> K {
        self.kv
    }
}
