//! # Image receive pipeline
//!
//! Moves one file's bytes from the image backend to the flash writer. A
//! producer fetches segments from the backend into a bounded ring buffer; the
//! consumer drains the ring either as raw chunks or as compressed blocks.
//!
//! The two sides are cooperative: every consumer call runs producer steps
//! until it has what it needs. Each [`Rx::produce`] call is one fetch and
//! reports whether it moved data, was blocked by a full ring, or has nothing
//! left to do. Read failures land in an error slot that the consumer checks
//! before it touches the ring again.
//!
//! Compressed files are a sequence of blocks, each preceded by a
//! [`BlockHeader`]:
//!
//! ```text
//! +-----------+-----------+-----------+-----------+----------------+
//! | magic u32 | hdr u32   | comp u32  | orig u32  | comp bytes ... |
//! | "LZMA"    | = 16      |           |           | LZ4 block      |
//! +-----------+-----------+-----------+-----------+----------------+
//! ```

#![allow(missing_docs)]

pub mod lz4;


use heapless::Deque;

use crate::backend::{Backend, Ioctl};
use crate::config::{BLOCK_HEADER_SIZE, DATA_BUF_SIZE, IN_BUF_SIZE, OUT_BUF_SIZE, RX_RING_SIZE};
use crate::error::{Error, ProtocolError, Result};
use crate::image::OtaImage;

pub const BLOCK_MAGIC: u32 = 0x414d_5a4c;

/// Header in front of each compressed block.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockHeader {
    pub magic: u32,
    pub hdr_size: u32,
    pub comp_size: u32,
    pub orig_size: u32,
}

impl BlockHeader {
    pub fn new(comp_size: u32, orig_size: u32) -> Self {
        Self {
            magic: BLOCK_MAGIC,
            hdr_size: BLOCK_HEADER_SIZE as u32,
            comp_size,
            orig_size,
        }
    }

    pub fn parse(raw: &[u8; BLOCK_HEADER_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            magic: word(0),
            hdr_size: word(4),
            comp_size: word(8),
            orig_size: word(12),
        }
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut out = [0u8; BLOCK_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.hdr_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.comp_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.orig_size.to_le_bytes());
        out
    }

    pub fn check(&self) -> Result<()> {
        if self.magic != BLOCK_MAGIC {
            log::error!("block magic error: {:#010x}", self.magic);
            return Err(ProtocolError::BadMagic(self.magic).into());
        }
        if self.hdr_size != BLOCK_HEADER_SIZE as u32 {
            log::error!("block header size error: {}", self.hdr_size);
            return Err(ProtocolError::BadHeaderSize(self.hdr_size).into());
        }
        Ok(())
    }
}

/// Working memory of one file write.
pub struct RxBuffers {
    pub ring: Deque<u8, RX_RING_SIZE>,
    pub seg: [u8; DATA_BUF_SIZE],
    pub input: [u8; IN_BUF_SIZE],
    pub output: [u8; OUT_BUF_SIZE],
}

impl RxBuffers {
    pub const fn new() -> Self {
        Self {
            ring: Deque::new(),
            seg: [0; DATA_BUF_SIZE],
            input: [0; IN_BUF_SIZE],
            output: [0; OUT_BUF_SIZE],
        }
    }
}

impl Default for RxBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one producer step.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    /// Bytes moved into the ring.
    Progress(usize),
    /// The ring lacks room for the next segment.
    Blocked,
    /// Everything was fetched, or a read failed.
    Finished,
}

/// Fetch parameters for one file.
#[derive(Debug, Clone, Copy)]
pub struct RxParams {
    /// Image offset of the first byte to fetch.
    pub offset: u32,
    /// Bytes to fetch.
    pub size: u32,
    /// Upper bound of one segment, trimmed to the backend's unit size.
    pub seg_size: u32,
    /// Upper bound of one backend request.
    pub max_request: u32,
    /// Producer steps without progress tolerated by the consumer.
    pub stall_limit: u32,
}

pub struct Rx<'a, B: Backend> {
    image: &'a mut OtaImage<B>,
    ring: &'a mut Deque<u8, RX_RING_SIZE>,
    seg: &'a mut [u8],
    offset: u32,
    remaining: u32,
    seg_size: usize,
    max_request: u32,
    request_left: u32,
    link: bool,
    stall_limit: u32,
    error: Option<Error>,
}

impl<'a, B: Backend> Rx<'a, B> {
    /// Start fetching. The ring is emptied and the segment size is rounded
    /// down to the backend's transfer unit.
    pub fn start(
        image: &'a mut OtaImage<B>,
        ring: &'a mut Deque<u8, RX_RING_SIZE>,
        seg: &'a mut [u8],
        params: RxParams,
    ) -> Self {
        ring.clear();
        let unit = match image.ioctl(Ioctl::GetUnitSize) {
            Ok(n) if n > 0 => n,
            _ => 1,
        };
        let seg_cap = core::cmp::min(params.seg_size, seg.len() as u32);
        let seg_size = (seg_cap / unit * unit) as usize;
        let max_request = match image.ioctl(Ioctl::GetMaxSize) {
            Ok(n) if n > 0 => n.min(params.max_request),
            _ => params.max_request,
        };
        let link = image.backend().is_link();
        log::debug!(
            "rx start {:#x}+{:#x}, seg {:#x}, max request {:#x}",
            params.offset,
            params.size,
            seg_size,
            max_request
        );
        Self {
            image,
            ring,
            seg,
            offset: params.offset,
            remaining: params.size,
            seg_size,
            max_request: max_request.max(1),
            request_left: 0,
            link,
            stall_limit: params.stall_limit.max(1),
            error: None,
        }
    }

    /// Image offset of the next byte the producer will fetch.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Bytes fetched but not consumed yet.
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    pub fn error(&self) -> Option<Error> {
        self.error
    }

    /// One producer step: fetch a single segment into the ring.
    pub fn produce(&mut self) -> Step {
        if self.error.is_some() || self.remaining == 0 {
            return Step::Finished;
        }

        if self.link && self.request_left == 0 {
            let request = core::cmp::min(self.remaining, self.max_request);
            if let Err(e) = self.image.read_prepare(self.offset, request) {
                self.error = Some(e);
                return Step::Finished;
            }
            self.request_left = request;
        }

        let mut len = core::cmp::min(self.seg_size as u32, self.remaining);
        if self.link {
            len = len.min(self.request_left);
        }
        let len = len as usize;
        if self.ring.capacity() - self.ring.len() < len {
            return Step::Blocked;
        }

        let buf = &mut self.seg[..len];
        let res = if self.link {
            self.image.read_complete(self.offset, buf)
        } else {
            self.image.read(self.offset, buf)
        };
        if let Err(e) = res {
            log::error!("cannot read data, offs {:#x}", self.offset);
            self.error = Some(e);
            return Step::Finished;
        }

        for b in buf.iter() {
            // room was checked above
            let _ = self.ring.push_back(*b);
        }
        self.offset += len as u32;
        self.remaining -= len as u32;
        if self.link {
            self.request_left -= len as u32;
        }
        Step::Progress(len)
    }

    /// Fill `dst` completely, running the producer as needed.
    pub fn take(&mut self, dst: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        let mut stalls = 0;
        while filled < dst.len() {
            if let Some(e) = self.error {
                return Err(e);
            }
            while filled < dst.len() {
                match self.ring.pop_front() {
                    Some(b) => {
                        dst[filled] = b;
                        filled += 1;
                    }
                    None => break,
                }
            }
            if filled == dst.len() {
                break;
            }
            match self.produce() {
                Step::Progress(n) if n > 0 => stalls = 0,
                Step::Progress(_) | Step::Blocked => {
                    stalls += 1;
                    if stalls >= self.stall_limit {
                        log::error!("rx producer stalled at {:#x}", self.offset);
                        return Err(Error::WorkerStalled);
                    }
                }
                Step::Finished => {
                    if let Some(e) = self.error {
                        return Err(e);
                    }
                    if self.ring.is_empty() {
                        log::error!(
                            "image data ended at {:#x}, {} bytes short",
                            self.offset,
                            dst.len() - filled
                        );
                        return Err(Error::TransportRead {
                            offset: self.offset,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Read one compressed block and decode it into `output`.
    ///
    /// `input` bounds the compressed payload. Returns the header so the
    /// caller can advance its stream cursor by `hdr_size + comp_size`, and
    /// the decoded length equals `orig_size`.
    pub fn read_block(&mut self, input: &mut [u8], output: &mut [u8]) -> Result<BlockHeader> {
        let mut raw = [0u8; BLOCK_HEADER_SIZE];
        self.take(&mut raw)?;
        let header = BlockHeader::parse(&raw);
        header.check()?;

        let comp = header.comp_size as usize;
        let orig = header.orig_size as usize;
        if comp > input.len() {
            log::error!("block input {:#x} exceeds buffer {:#x}", comp, input.len());
            return Err(Error::BlockTooLarge(header.comp_size));
        }
        if orig > output.len() {
            log::error!("block output {:#x} exceeds buffer {:#x}", orig, output.len());
            return Err(Error::BlockTooLarge(header.orig_size));
        }

        self.take(&mut input[..comp])?;
        let out_len = lz4::decompress_into(&input[..comp], output).ok_or_else(|| {
            log::error!("decode error, block size {:#x}", comp);
            Error::from(ProtocolError::CorruptBlock)
        })?;
        if out_len != orig {
            log::error!("decoded size mismatch: {:#x} != {:#x}", out_len, orig);
            return Err(ProtocolError::LengthMismatch.into());
        }
        log::debug!("block {:#x} -> {:#x}", comp, out_len);
        Ok(header)
    }

    /// Abandon the transfer. Link backends get their pending request cancelled.
    pub fn stop(self) {
        if self.link && self.request_left > 0 {
            let _ = self.image.read_prepare(self.offset, 0);
        }
    }
}
