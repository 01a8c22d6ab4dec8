//! # OTA image container
//!
//! An image starts with a 1 KiB header followed by the data area holding
//! every file listed in its directory:
//!
//! ```text
//! 0x000  header     magic "AOTA", header crc, sizes, data crc
//! 0x040  new_ver    version name, board name, hw version, version code
//! 0x0a0  old_ver    base version of a delta image
//! 0x200  dir        16 x { name[12], offset, length, checksum }
//! 0x400  data ...
//! ```
//!
//! The header CRC covers bytes `8..0x400`. [`OtaImage`] wraps a backend,
//! validates the header on [`open`](OtaImage::open), resolves directory
//! entries, and reports transfer progress back through the backend.
//! [`pack_header`] produces a header for host-side packaging tools.

#![allow(missing_docs)]

#[cfg(test)]
mod tests;

use heapless::{String, Vec};

use crate::backend::{Backend, BackendType, Ioctl};
use crate::config::MAX_FILES;
use crate::error::{Error, ProtocolError, Result};
use crate::manifest::FwVersion;

pub const IMAGE_MAGIC: u32 = 0x4154_4f41;
pub const IMAGE_HEADER_SIZE: usize = 0x400;
pub const IMAGE_HEADER_VERSION: u16 = 1;

const NEW_VER_OFFSET: usize = 0x40;
const OLD_VER_OFFSET: usize = 0xa0;
const DIR_OFFSET: usize = 0x200;
const DIR_ENTRY_SIZE: usize = 32;
const CHECK_CHUNK: usize = 0x800;
const PROGRESS_UP_LIMIT: u8 = 99;

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct ImageHeader {
    pub header_checksum: u32,
    pub header_version: u16,
    pub file_cnt: u16,
    pub flag: u16,
    pub dir_offset: u16,
    pub data_offset: u16,
    /// End of the data area, counted from the start of the image.
    pub data_size: u32,
    pub data_checksum: u32,
}

#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct DirEntry {
    pub name: String<12>,
    pub offset: u32,
    pub length: u32,
    pub checksum: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    total: u32,
    current: u32,
    cursor: u8,
    on: bool,
}

pub struct OtaImage<B: Backend> {
    backend: B,
    header: Option<ImageHeader>,
    dir: Vec<DirEntry, MAX_FILES>,
    new_ver: FwVersion,
    old_ver: FwVersion,
    progress: Progress,
}

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn c_str<const N: usize>(raw: &[u8]) -> String<N> {
    let len = raw.iter().position(|b| *b == 0).unwrap_or(raw.len()).min(N);
    core::str::from_utf8(&raw[..len])
        .ok()
        .and_then(|s| String::try_from(s).ok())
        .unwrap_or_default()
}

fn parse_version(raw: &[u8]) -> FwVersion {
    FwVersion {
        version_name: c_str(&raw[0..32]),
        board_name: c_str(&raw[32..64]),
        version_code: le32(raw, 68),
        version_res: 0,
    }
}

fn put_str(out: &mut [u8], s: &str) {
    let n = s.len().min(out.len());
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
}

fn put_version(out: &mut [u8], ver: &FwVersion) {
    put_str(&mut out[0..32], &ver.version_name);
    put_str(&mut out[32..64], &ver.board_name);
    out[68..72].copy_from_slice(&ver.version_code.to_le_bytes());
}

/// Lays out a complete image header. `data_checksum` and `data_size` come
/// from `header`; the header checksum is computed here.
pub fn pack_header(
    header: &ImageHeader,
    new_ver: &FwVersion,
    old_ver: &FwVersion,
    dir: &[DirEntry],
) -> Result<[u8; IMAGE_HEADER_SIZE]> {
    if dir.len() > MAX_FILES {
        return Err(Error::TableFull);
    }
    let mut out = [0u8; IMAGE_HEADER_SIZE];
    out[0..4].copy_from_slice(&IMAGE_MAGIC.to_le_bytes());
    out[8..10].copy_from_slice(&header.header_version.to_le_bytes());
    out[10..12].copy_from_slice(&(IMAGE_HEADER_SIZE as u16).to_le_bytes());
    out[12..14].copy_from_slice(&(dir.len() as u16).to_le_bytes());
    out[14..16].copy_from_slice(&header.flag.to_le_bytes());
    out[16..18].copy_from_slice(&(DIR_OFFSET as u16).to_le_bytes());
    out[18..20].copy_from_slice(&header.data_offset.to_le_bytes());
    out[20..24].copy_from_slice(&header.data_size.to_le_bytes());
    out[24..28].copy_from_slice(&header.data_checksum.to_le_bytes());
    put_version(&mut out[NEW_VER_OFFSET..OLD_VER_OFFSET], new_ver);
    put_version(&mut out[OLD_VER_OFFSET..OLD_VER_OFFSET + 0x60], old_ver);
    for (i, entry) in dir.iter().enumerate() {
        let at = DIR_OFFSET + i * DIR_ENTRY_SIZE;
        put_str(&mut out[at..at + 12], &entry.name);
        out[at + 16..at + 20].copy_from_slice(&entry.offset.to_le_bytes());
        out[at + 20..at + 24].copy_from_slice(&entry.length.to_le_bytes());
        out[at + 28..at + 32].copy_from_slice(&entry.checksum.to_le_bytes());
    }
    let crc = crc32fast::hash(&out[8..]);
    out[4..8].copy_from_slice(&crc.to_le_bytes());
    Ok(out)
}

impl<B: Backend> OtaImage<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            header: None,
            dir: Vec::new(),
            new_ver: FwVersion::default(),
            old_ver: FwVersion::default(),
            progress: Progress::default(),
        }
    }

    pub fn kind(&self) -> BackendType {
        self.backend.kind()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn is_open(&self) -> bool {
        self.header.is_some()
    }

    /// Open the backend and validate the image header.
    pub fn open(&mut self) -> Result<()> {
        log::info!("open image, backend {:?}", self.backend.kind());
        self.backend.open().map_err(|e| {
            log::error!("backend open failed: {:?}", e);
            Error::NotReady
        })?;

        let mut raw = [0u8; IMAGE_HEADER_SIZE];
        if let Err(e) = self.read(0, &mut raw).and_then(|_| self.parse_header(&raw)) {
            let _ = self.backend.close();
            return Err(e);
        }
        Ok(())
    }

    fn parse_header(&mut self, raw: &[u8; IMAGE_HEADER_SIZE]) -> Result<()> {
        let magic = le32(raw, 0);
        if magic != IMAGE_MAGIC {
            log::error!("wrong image magic {:#010x}", magic);
            return Err(ProtocolError::BadImageHeader.into());
        }
        if le16(raw, 10) as usize != IMAGE_HEADER_SIZE {
            log::error!("invalid header size {}", le16(raw, 10));
            return Err(ProtocolError::BadImageHeader.into());
        }
        let header = ImageHeader {
            header_checksum: le32(raw, 4),
            header_version: le16(raw, 8),
            file_cnt: le16(raw, 12),
            flag: le16(raw, 14),
            dir_offset: le16(raw, 16),
            data_offset: le16(raw, 18),
            data_size: le32(raw, 20),
            data_checksum: le32(raw, 24),
        };
        let crc = crc32fast::hash(&raw[8..]);
        if crc != header.header_checksum {
            log::error!(
                "image head crc error, calc {:#010x}, stored {:#010x}",
                crc,
                header.header_checksum
            );
            return Err(ProtocolError::BadImageHeader.into());
        }
        if header.file_cnt as usize > MAX_FILES {
            return Err(ProtocolError::BadImageHeader.into());
        }

        self.dir.clear();
        for i in 0..header.file_cnt as usize {
            let at = DIR_OFFSET + i * DIR_ENTRY_SIZE;
            let entry = DirEntry {
                name: c_str(&raw[at..at + 12]),
                offset: le32(raw, at + 16),
                length: le32(raw, at + 20),
                checksum: le32(raw, at + 28),
            };
            // capacity checked against file_cnt above
            let _ = self.dir.push(entry);
        }
        self.new_ver = parse_version(&raw[NEW_VER_OFFSET..OLD_VER_OFFSET]);
        self.old_ver = parse_version(&raw[OLD_VER_OFFSET..OLD_VER_OFFSET + 0x60]);
        log::info!(
            "image {} v{:#x}: {} files, data crc {:#010x}",
            self.new_ver.version_name.as_str(),
            self.new_ver.version_code,
            header.file_cnt,
            header.data_checksum
        );
        self.header = Some(header);
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.header = None;
        self.progress = Progress::default();
        self.backend.close().map_err(|e| {
            log::warn!("backend close failed: {:?}", e);
            Error::NotReady
        })
    }

    pub fn header(&self) -> Option<&ImageHeader> {
        self.header.as_ref()
    }

    pub fn dir(&self) -> &[DirEntry] {
        &self.dir
    }

    pub fn new_version(&self) -> &FwVersion {
        &self.new_ver
    }

    pub fn old_version(&self) -> &FwVersion {
        &self.old_ver
    }

    /// Checksum of the data area, identifies the image.
    pub fn checksum(&self) -> u32 {
        self.header.map_or(0, |h| h.data_checksum)
    }

    pub fn head_crc(&self) -> u32 {
        self.header.map_or(0, |h| h.header_checksum)
    }

    pub fn image_size(&self) -> u32 {
        self.header.map_or(0, |h| h.data_size)
    }

    fn find(&self, name: &str) -> Option<&DirEntry> {
        self.dir.iter().find(|d| d.name.as_str() == name)
    }

    /// Image offset of `name`. The empty name addresses the image itself.
    pub fn file_offset(&self, name: &str) -> Option<u32> {
        if name.is_empty() {
            return Some(0);
        }
        self.find(name).map(|d| d.offset)
    }

    pub fn file_length(&self, name: &str) -> Option<u32> {
        self.find(name).map(|d| d.length)
    }

    /// Compare `data` against the directory checksum of `name`.
    pub fn check_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let entry = self.find(name).ok_or(Error::MissingFile)?;
        if crc32fast::hash(data) != entry.checksum {
            log::warn!("file {} checksum error", name);
            return Err(Error::ImageCorrupt);
        }
        Ok(())
    }

    /// Recompute the CRC of the whole data area.
    pub fn check_data(&mut self) -> Result<()> {
        let header = self.header.ok_or(Error::InvalidState)?;
        let mut addr = header.data_offset as u32;
        let end = header.data_size;
        let mut buf = [0u8; CHECK_CHUNK];
        let mut hasher = crc32fast::Hasher::new();
        while addr < end {
            let n = core::cmp::min(CHECK_CHUNK as u32, end - addr) as usize;
            self.read(addr, &mut buf[..n])?;
            hasher.update(&buf[..n]);
            addr += n as u32;
        }
        let crc = hasher.finalize();
        if crc != header.data_checksum {
            log::error!(
                "image data crc error, calc {:#010x}, stored {:#010x}",
                crc,
                header.data_checksum
            );
            return Err(Error::ImageCorrupt);
        }
        log::info!("image data check pass");
        Ok(())
    }

    pub fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.backend.read(offset, buf).map_err(|e| {
            log::error!("image read {:#x}+{:#x} failed: {:?}", offset, buf.len(), e);
            Error::TransportRead { offset }
        })?;
        self.report_progress(buf.len() as u32, false);
        Ok(())
    }

    pub fn read_prepare(&mut self, offset: u32, size: u32) -> Result<()> {
        self.backend.read_prepare(offset, size).map_err(|e| {
            log::error!("image request {:#x}+{:#x} failed: {:?}", offset, size, e);
            Error::TransportRead { offset }
        })
    }

    pub fn read_complete(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.backend.read_complete(offset, buf).map_err(|e| {
            log::error!("image receive {:#x} failed: {:?}", offset, e);
            Error::TransportRead { offset }
        })?;
        self.report_progress(buf.len() as u32, false);
        Ok(())
    }

    pub fn ioctl(&mut self, cmd: Ioctl) -> Result<u32> {
        self.backend.ioctl(cmd).map_err(|e| {
            log::warn!("ioctl {:?} failed: {:?}", cmd, e);
            Error::NotReady
        })
    }

    /// Start progress accounting. `start` bytes are already done.
    pub fn progress_on(&mut self, total: u32, start: u32) {
        if self.progress.on || total == 0 {
            return;
        }
        let cursor = (start as u64 * 100 / total as u64) as u8;
        self.progress = Progress {
            total,
            current: start,
            cursor,
            on: true,
        };
        log::info!("upgrade progress {}% of {} bytes", cursor, total);
    }

    pub fn progress_reset(&mut self) {
        self.progress.current = 0;
        self.progress.cursor = 0;
    }

    /// Percentage last reported, if accounting is on.
    pub fn progress(&self) -> Option<u8> {
        self.progress.on.then_some(self.progress.cursor)
    }

    /// Account `xfer` more bytes. Percentages are reported to the backend
    /// as they change and held at 99 until the final report.
    pub fn report_progress(&mut self, xfer: u32, is_final: bool) {
        let p = &mut self.progress;
        if !p.on {
            return;
        }
        if is_final {
            p.cursor = 100;
            let _ = self.backend.ioctl(Ioctl::ReportProgress(100));
            return;
        }
        if p.current.saturating_add(xfer) > p.total {
            log::warn!("progress overflow: {} + {} > {}", p.current, xfer, p.total);
            return;
        }
        p.current += xfer;
        let grade = (p.total / 100) * (p.cursor as u32 + 1);
        if p.current > grade {
            p.cursor = (p.current as u64 * 100 / p.total as u64) as u8;
            let percent = p.cursor.min(PROGRESS_UP_LIMIT);
            log::debug!("upgrade progress {}%", percent);
            let _ = self.backend.ioctl(Ioctl::ReportProgress(percent));
        }
    }
}
