#![allow(dead_code)]

use std::collections::HashMap;

use heapless::String;
use libota::backend::{self, Backend, BackendType, ConnectType, Ioctl};
use libota::breakpoint::Breakpoint;
use libota::config::OtaConfig;
use libota::image::{DirEntry, IMAGE_HEADER_SIZE, IMAGE_HEADER_VERSION, ImageHeader, OtaImage, pack_header};
use libota::manifest::{FwVersion, Manifest, ManifestParser, OtaFile};
use libota::nvram::{BREAKPOINT_KEY, KvStore};
use libota::partition::{
    FILE_ID_BOOT, FILE_ID_OTA_TEMP, FILE_ID_PARAM, FILE_ID_SYSTEM, Partition, PartitionFlags, PartitionTable,
    PartitionType,
};
use libota::rx::BlockHeader;
use libota::storage::error::Error as FlashError;
use libota::storage::{BlockingErase, FlashStorage, ReadStorage, Storage};
use libota::upgrade::{Listener, OtaEngine, OtaState};

pub const FLASH_SIZE: usize = 64 * 1024;
pub const BOARD: &str = "ats3089";
pub const RUNNING_VERSION: u32 = 0x100;

pub const BOOT_A: u32 = 0x0000;
pub const BOOT_B: u32 = 0x1000;
pub const SYSTEM_A: u32 = 0x2000;
pub const SYSTEM_B: u32 = 0x6000;
pub const TEMP: u32 = 0xA000;
pub const PARAM_A: u32 = 0xE000;
pub const PARAM_B: u32 = 0xF000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    Write { addr: u32, len: u32 },
    Erase { from: u32, to: u32 },
}

/// NOR flash simulator with an operation log and fault injection.
#[derive(Debug, Clone)]
pub struct SimFlash {
    pub mem: Vec<u8>,
    pub sector: u32,
    pub ops: Vec<FlashOp>,
    /// Writes touching this address fail.
    pub fail_write_at: Option<u32>,
    /// The first write touching this address stores a flipped byte.
    pub corrupt_once_at: Option<u32>,
}

impl SimFlash {
    pub fn new(sector: u32) -> Self {
        Self {
            mem: vec![0xFF; FLASH_SIZE],
            sector,
            ops: Vec::new(),
            fail_write_at: None,
            corrupt_once_at: None,
        }
    }

    pub fn slice(&self, addr: u32, len: usize) -> &[u8] {
        &self.mem[addr as usize..addr as usize + len]
    }

    pub fn erase_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, FlashOp::Erase { .. }))
            .count()
    }

    pub fn bytes_written(&self) -> u32 {
        self.ops
            .iter()
            .map(|op| match op {
                FlashOp::Write { len, .. } => *len,
                FlashOp::Erase { .. } => 0,
            })
            .sum()
    }

    /// Bytes written inside `[from, to)`.
    pub fn written_in(&self, from: u32, to: u32) -> u32 {
        self.ops
            .iter()
            .map(|op| match op {
                FlashOp::Write { addr, len } if *addr >= from && *addr < to => *len,
                _ => 0,
            })
            .sum()
    }
}

impl ReadStorage for SimFlash {
    type Error = FlashError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), FlashError> {
        let off = offset as usize;
        let src = self
            .mem
            .get(off..off + bytes.len())
            .ok_or(FlashError::OutOfBounds)?;
        bytes.copy_from_slice(src);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}

impl Storage for SimFlash {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), FlashError> {
        let end = offset + bytes.len() as u32;
        if let Some(at) = self.fail_write_at {
            if (offset..end).contains(&at) {
                return Err(FlashError::Program);
            }
        }
        let off = offset as usize;
        let dst = self
            .mem
            .get_mut(off..off + bytes.len())
            .ok_or(FlashError::OutOfBounds)?;
        for (d, s) in dst.iter_mut().zip(bytes) {
            *d &= *s;
        }
        if let Some(at) = self.corrupt_once_at {
            if (offset..end).contains(&at) {
                self.mem[at as usize] ^= 0xFF;
                self.corrupt_once_at = None;
            }
        }
        self.ops.push(FlashOp::Write {
            addr: offset,
            len: bytes.len() as u32,
        });
        Ok(())
    }
}

impl BlockingErase for SimFlash {
    fn erase(&mut self, from: u32, to: u32) -> Result<(), FlashError> {
        if from % self.sector != 0 || to % self.sector != 0 {
            return Err(FlashError::Misaligned);
        }
        self.mem
            .get_mut(from as usize..to as usize)
            .ok_or(FlashError::OutOfBounds)?
            .fill(0xFF);
        self.ops.push(FlashOp::Erase { from, to });
        Ok(())
    }
}

impl FlashStorage for SimFlash {
    fn storage_id(&self) -> u8 {
        0
    }

    fn erase_align(&self) -> u32 {
        self.sector
    }
}

/// Key/value store that checks every persisted breakpoint.
#[derive(Debug, Default, Clone)]
pub struct MemKv {
    pub map: HashMap<std::string::String, Vec<u8>>,
    pub breakpoints: Vec<Breakpoint>,
}

impl KvStore for MemKv {
    type Error = ();

    fn get(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, ()> {
        let value = self.map.get(key).ok_or(())?;
        let n = value.len().min(buf.len());
        buf[..n].copy_from_slice(&value[..n]);
        Ok(n)
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), ()> {
        if key == BREAKPOINT_KEY {
            let bp = Breakpoint::decode(value).expect("persisted breakpoint decodes");
            let writing = bp
                .file_state
                .iter()
                .filter(|s| s.file_id != 0 && s.state.is_writing())
                .count();
            assert!(writing <= 1, "two files in a writing state: {:?}", bp.file_state);
            if let Some(prev) = self.breakpoints.last() {
                assert!(bp.bp_id > prev.bp_id, "bp_id {} after {}", bp.bp_id, prev.bp_id);
            }
            self.breakpoints.push(bp);
        }
        self.map.insert(key.into(), value.to_vec());
        Ok(())
    }
}

pub struct Table {
    pub entries: Vec<Partition>,
}

fn part(
    name: &'static str,
    file_id: u8,
    kind: PartitionType,
    offset: u32,
    size: u32,
    mirror_id: u8,
) -> Partition {
    Partition {
        name,
        file_id,
        storage_id: 0,
        offset,
        file_offset: offset,
        size,
        flags: PartitionFlags::empty(),
        kind,
        mirror_id: Some(mirror_id),
    }
}

impl Table {
    /// Boot, system and param partitions in two slots, running from slot 0.
    pub fn ab() -> Self {
        Self {
            entries: vec![
                part("boot_a", FILE_ID_BOOT, PartitionType::Boot, BOOT_A, 0x1000, 0),
                part("boot_b", FILE_ID_BOOT, PartitionType::Boot, BOOT_B, 0x1000, 1),
                part("sys_a", FILE_ID_SYSTEM, PartitionType::Normal, SYSTEM_A, 0x4000, 0),
                part("sys_b", FILE_ID_SYSTEM, PartitionType::Normal, SYSTEM_B, 0x4000, 1),
                part("param_a", FILE_ID_PARAM, PartitionType::Param, PARAM_A, 0x1000, 0),
                part("param_b", FILE_ID_PARAM, PartitionType::Param, PARAM_B, 0x1000, 1),
            ],
        }
    }

    /// Slot layout plus an unmirrored staging partition for recovery mode.
    pub fn with_temp() -> Self {
        let mut table = Self::ab();
        table.entries.push(Partition {
            name: "ota_temp",
            file_id: FILE_ID_OTA_TEMP,
            storage_id: 0,
            offset: TEMP,
            file_offset: TEMP,
            size: 0x4000,
            flags: PartitionFlags::empty(),
            kind: PartitionType::Temp,
            mirror_id: None,
        });
        table
    }
}

impl PartitionTable for Table {
    fn entries(&self) -> &[Partition] {
        &self.entries
    }

    fn current_mirror_id(&self) -> u8 {
        0
    }

    fn current_file_id(&self) -> u8 {
        FILE_ID_SYSTEM
    }
}

#[derive(Debug, Default)]
pub struct Recorder {
    pub states: Vec<OtaState>,
    pub verified: Vec<u8>,
}

impl Listener for Recorder {
    fn state_changed(&mut self, new: OtaState, _old: OtaState) {
        self.states.push(new);
    }

    fn file_verified(&mut self, file_id: u8) {
        self.verified.push(file_id);
    }
}

pub type Engine = OtaEngine<[SimFlash; 1], Table, MemKv, Recorder>;

pub fn engine(flash: SimFlash, kv: MemKv, config: OtaConfig) -> Engine {
    engine_with(flash, Table::ab(), kv, config)
}

pub fn engine_with(flash: SimFlash, table: Table, kv: MemKv, config: OtaConfig) -> Engine {
    OtaEngine::new([flash], table, kv, config, running(), Recorder::default()).unwrap()
}

/// Tear the engine down and bring it back up on the same flash and store.
pub fn reboot(engine: Engine, config: OtaConfig) -> Engine {
    let ([flash], table, kv) = engine.into_parts();
    engine_with(flash, table, kv, config)
}

pub fn version(code: u32) -> FwVersion {
    FwVersion {
        version_code: code,
        version_res: 0,
        version_name: String::try_from("watch").unwrap(),
        board_name: String::try_from(BOARD).unwrap(),
    }
}

pub fn running() -> FwVersion {
    version(RUNNING_VERSION)
}

pub fn config() -> OtaConfig {
    OtaConfig {
        bp_save_size: 1024,
        erase_block_size: 4096,
        data_buf_size: 512,
        in_buf_size: 1024,
        ..Default::default()
    }
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + seed as usize * 7) % 253) as u8)
        .collect()
}

/// Literal-only LZ4 sequence for `data`.
pub fn lz4_literals(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    if data.len() >= 15 {
        out.push(0xF0);
        let mut rest = data.len() - 15;
        while rest >= 255 {
            out.push(255);
            rest -= 255;
        }
        out.push(rest as u8);
    } else {
        out.push((data.len() as u8) << 4);
    }
    out.extend_from_slice(data);
    out
}

/// LZ4 block for `len` copies of `byte`: one literal, one overlapping match.
pub fn lz4_run(byte: u8, len: usize) -> Vec<u8> {
    assert!(len >= 5);
    let m = len - 1 - 4;
    let mut out = vec![0x10 | m.min(15) as u8, byte, 0x01, 0x00];
    if m >= 15 {
        let mut rest = m - 15;
        while rest >= 255 {
            out.push(255);
            rest -= 255;
        }
        out.push(rest as u8);
    }
    out.push(0x00);
    out
}

/// Split `data` into compressed blocks of `block` bytes.
pub fn compress(data: &[u8], block: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in data.chunks(block) {
        let body = if chunk.iter().all(|b| *b == chunk[0]) && chunk.len() >= 5 {
            lz4_run(chunk[0], chunk.len())
        } else {
            lz4_literals(chunk)
        };
        out.extend_from_slice(&BlockHeader::new(body.len() as u32, chunk.len() as u32).to_bytes());
        out.extend_from_slice(&body);
    }
    out
}

/// A file as it appears in the image and in the manifest.
pub struct ImageFile {
    pub name: &'static str,
    pub file_id: u8,
    pub kind: PartitionType,
    /// Bytes as stored in the image.
    pub wire: Vec<u8>,
    /// Bytes as they end up in flash.
    pub data: Vec<u8>,
}

impl ImageFile {
    pub fn raw(name: &'static str, file_id: u8, kind: PartitionType, data: Vec<u8>) -> Self {
        Self {
            name,
            file_id,
            kind,
            wire: data.clone(),
            data,
        }
    }

    pub fn compressed(name: &'static str, file_id: u8, data: Vec<u8>, block: usize) -> Self {
        Self {
            name,
            file_id,
            kind: PartitionType::Normal,
            wire: compress(&data, block),
            data,
        }
    }
}

pub struct TestImage {
    pub bytes: Vec<u8>,
    pub manifest: Manifest,
    /// Image offset of each file's first wire byte.
    pub offsets: Vec<u32>,
}

pub fn build_image(version_code: u32, files: &[ImageFile]) -> TestImage {
    let mut data = Vec::new();
    let mut dir = Vec::new();
    let mut offsets = Vec::new();
    let mut manifest = Manifest {
        fw_ver: version(version_code),
        ..Default::default()
    };
    for f in files {
        let offset = (IMAGE_HEADER_SIZE + data.len()) as u32;
        offsets.push(offset);
        dir.push(DirEntry {
            name: String::try_from(f.name).unwrap(),
            offset,
            length: f.wire.len() as u32,
            checksum: crc32fast::hash(&f.wire),
        });
        data.extend_from_slice(&f.wire);
        manifest
            .files
            .push(OtaFile {
                name: String::try_from(f.name).unwrap(),
                file_id: f.file_id,
                kind: f.kind,
                storage_id: 0,
                offset: 0,
                size: f.wire.len() as u32,
                orig_size: f.data.len() as u32,
                checksum: crc32fast::hash(&f.data),
            })
            .unwrap();
    }
    let header = ImageHeader {
        header_version: IMAGE_HEADER_VERSION,
        data_offset: IMAGE_HEADER_SIZE as u16,
        data_size: (IMAGE_HEADER_SIZE + data.len()) as u32,
        data_checksum: crc32fast::hash(&data),
        ..Default::default()
    };
    let mut bytes = pack_header(&header, &manifest.fw_ver, &FwVersion::default(), &dir)
        .unwrap()
        .to_vec();
    bytes.extend_from_slice(&data);
    TestImage {
        bytes,
        manifest,
        offsets,
    }
}

/// Hands out a fixed manifest.
pub struct Parser(pub Manifest);

impl ManifestParser for Parser {
    type Error = ();

    fn parse<B: Backend>(&mut self, _image: &mut OtaImage<B>, _name: &str) -> Result<Manifest, ()> {
        Ok(self.0.clone())
    }
}

/// In-memory image source. Reads ending past `fail_at` fail.
#[derive(Debug)]
pub struct VecBackend {
    pub data: Vec<u8>,
    pub kind: BackendType,
    pub fail_at: Option<u32>,
    pub reads: Vec<(u32, u32)>,
    pub prepares: Vec<(u32, u32)>,
    pub ioctls: Vec<Ioctl>,
}

impl VecBackend {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            kind: BackendType::SdCard,
            fail_at: None,
            reads: Vec::new(),
            prepares: Vec::new(),
            ioctls: Vec::new(),
        }
    }

    /// Lowest offset read inside the data area.
    pub fn first_data_read(&self) -> Option<u32> {
        self.reads
            .iter()
            .map(|(off, _)| *off)
            .filter(|off| *off >= IMAGE_HEADER_SIZE as u32)
            .min()
    }

    pub fn progress(&self) -> Vec<u8> {
        self.ioctls
            .iter()
            .filter_map(|c| match c {
                Ioctl::ReportProgress(p) => Some(*p),
                _ => None,
            })
            .collect()
    }
}

impl Backend for VecBackend {
    type Error = backend::Error;

    fn kind(&self) -> BackendType {
        self.kind
    }

    fn open(&mut self) -> Result<(), backend::Error> {
        Ok(())
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), backend::Error> {
        if let Some(at) = self.fail_at {
            if offset + buf.len() as u32 > at {
                return Err(backend::Error::Disconnected);
            }
        }
        let off = offset as usize;
        let src = self
            .data
            .get(off..off + buf.len())
            .ok_or(backend::Error::OutOfRange)?;
        buf.copy_from_slice(src);
        self.reads.push((offset, buf.len() as u32));
        Ok(())
    }

    fn read_prepare(&mut self, offset: u32, size: u32) -> Result<(), backend::Error> {
        self.prepares.push((offset, size));
        Ok(())
    }

    fn ioctl(&mut self, cmd: Ioctl) -> Result<u32, backend::Error> {
        self.ioctls.push(cmd);
        Ok(match cmd {
            Ioctl::GetConnectType if self.kind == BackendType::Bluetooth => ConnectType::Ble as u32,
            _ => 0,
        })
    }

    fn close(&mut self) -> Result<(), backend::Error> {
        Ok(())
    }
}
