//! Per-file write path: resume decision, streamed write, patch, verify.

use crate::backend::Backend;
use crate::breakpoint::FileState;
use crate::config::{DATA_BUF_SIZE, IN_BUF_SIZE};
use crate::error::{Error, ProtocolError, Result};
use crate::image::OtaImage;
use crate::manifest::OtaFile;
use crate::nvram::KvStore;
use crate::partition::{FILE_ID_SDFS_BASE, FILE_ID_SDFS_PART1, Partition, PartitionFlags, PartitionTable};
use crate::patch::{FilePatcher, PatchIo, PatchJob};
use crate::rx::{Rx, RxBuffers, RxParams};
use crate::storage::{self, FlashStorage, StorageSet, align_down};

use super::{Listener, OtaEngine, Session, erase_part};

/// Where a file write may continue after an interruption.
///
/// Raw files rewind both cursors to the erase unit holding the flash
/// cursor, so the partially written unit is erased and rewritten. A
/// compressed file can only continue at a block boundary that is also
/// erase aligned; otherwise it starts over.
pub fn resume_point(file_offset: u32, raw: bool, file_off: u32, orig_off: u32, align: u32) -> (u32, u32) {
    let addr = file_offset + orig_off;
    if raw {
        let orig = align_down(addr, align).saturating_sub(file_offset);
        (orig, orig)
    } else if addr % align == 0 {
        (file_off, orig_off)
    } else {
        (0, 0)
    }
}

/// Byte access for a patcher: patch bytes come from the image, old and new
/// files live on the same flash device.
struct PatchCtx<'a, B: Backend, F: FlashStorage> {
    image: &'a mut OtaImage<B>,
    flash: &'a mut F,
    job: PatchJob,
    written: u32,
}

impl<B: Backend, F: FlashStorage> PatchIo for PatchCtx<'_, B, F> {
    fn read_patch(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        if offset as u64 + buf.len() as u64 > self.job.patch_size as u64 {
            return Err(Error::Patch);
        }
        self.image.read(self.job.patch_offset + offset, buf)
    }

    fn read_old(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        if offset as u64 + buf.len() as u64 > self.job.old_size as u64 {
            return Err(Error::Patch);
        }
        storage::read(self.flash, self.job.old_offset + offset, buf)
    }

    fn write_new(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        if offset < self.written || offset as u64 + data.len() as u64 > self.job.new_size as u64 {
            return Err(Error::Patch);
        }
        storage::write(self.flash, self.job.new_offset + offset, data)?;
        self.written = offset + data.len() as u32;
        Ok(())
    }
}

impl<S: StorageSet, T: PartitionTable, K: KvStore, L: Listener> OtaEngine<S, T, K, L> {
    pub(super) fn write_and_verify<B: Backend, P: FilePatcher>(
        &mut self,
        s: &mut Session<'_, B, P>,
        part: &Partition,
        file: &OtaFile,
        verify: bool,
    ) -> Result<()> {
        let res = self.write_and_verify_inner(s, part, file, verify);
        if let Err(e) = res {
            log::error!("file {}: {}", file.name.as_str(), e);
            if !e.is_resumable() {
                let _ = self.bp.update_file_state(file, FileState::WriteFail, 0, 0, false);
            }
        }
        res
    }

    fn write_and_verify_inner<B: Backend, P: FilePatcher>(
        &mut self,
        s: &mut Session<'_, B, P>,
        part: &Partition,
        file: &OtaFile,
        verify: bool,
    ) -> Result<()> {
        let bp = self.bp.get();
        let state = bp.file_state(file.file_id);
        let own_cursor = bp.cur_file.file_id == file.file_id;
        let cursors = (bp.cur_file_write_offset, bp.cur_orig_write_offset);
        log::info!("file {}: id {}, bp file state {:?}", file.name.as_str(), file.file_id, state);

        let (file_off, orig_off, need_erase) = match state {
            FileState::WriteDone | FileState::VerifyPass => {
                log::info!("file {}: already written", file.name.as_str());
                (0, 0, None)
            }
            FileState::Clean => (0, 0, Some(false)),
            FileState::WritingClean if own_cursor => (cursors.0, cursors.1, Some(false)),
            FileState::Writing if own_cursor => (cursors.0, cursors.1, Some(true)),
            _ => (0, 0, Some(true)),
        };

        if let Some(need_erase) = need_erase {
            let flash = self
                .storages
                .find(part.storage_id)
                .ok_or(Error::NoStorage(part.storage_id))?;
            let (file_off, orig_off) =
                resume_point(file.offset, file.is_raw(), file_off, orig_off, storage::erase_align(flash)?);
            if need_erase {
                let mut scratch = [0u8; DATA_BUF_SIZE];
                let start = (file.offset + orig_off).max(part.offset) - part.offset;
                erase_part(&mut self.storages, part, start, &mut scratch)?;
            }
            log::info!("file {}: start at {:#x}({:#x})", file.name.as_str(), file_off, orig_off);

            self.bp
                .update_file_state(file, FileState::WriteStart, file_off, orig_off, false)?;
            if s.manifest.is_patch() {
                self.write_file_by_patch(s, part, file, file_off)?;
            } else {
                self.write_file_normal(s, part, file, file_off, orig_off)?;
            }

            if file.file_id == FILE_ID_SDFS_BASE {
                if let Some(res_b) = self.table.part(FILE_ID_SDFS_PART1) {
                    let mut scratch = [0u8; DATA_BUF_SIZE];
                    erase_part(&mut self.storages, &res_b, 0, &mut scratch)?;
                    log::info!("clear {} after base resource update", res_b.name);
                }
            }
            self.bp.update_file_state(file, FileState::WriteDone, 0, 0, false)?;
        }

        if verify {
            if let Err(e) = self.verify_file(file) {
                log::error!("file {}, verify failed", file.name.as_str());
                self.bp.update_file_state(file, FileState::VerifyFail, 0, 0, false)?;
                return Err(e);
            }
            log::info!("file {}, verify pass", file.name.as_str());
            self.bp.update_file_state(file, FileState::VerifyPass, 0, 0, false)?;
        }
        Ok(())
    }

    fn write_file_normal<B: Backend, P: FilePatcher>(
        &mut self,
        s: &mut Session<'_, B, P>,
        part: &Partition,
        file: &OtaFile,
        start_file_off: u32,
        start_orig_off: u32,
    ) -> Result<()> {
        log::info!(
            "write file {} size {:#x}({:#x}) to {:#x}, start {:#x}({:#x})",
            file.name.as_str(),
            file.size,
            file.orig_size,
            file.offset,
            start_file_off,
            start_orig_off
        );
        if file.orig_size > 0 && (start_file_off >= file.size || start_orig_off >= file.orig_size) {
            log::error!("file {}: start offset beyond file", file.name.as_str());
            return Err(Error::InvalidState);
        }
        let image_offset = s.image.file_offset(&file.name).ok_or_else(|| {
            log::error!("cannot find file {} in image", file.name.as_str());
            Error::MissingFile
        })?;

        let flash = self
            .storages
            .find(part.storage_id)
            .ok_or(Error::NoStorage(part.storage_id))?;
        let align = storage::erase_align(flash)?;
        let raw = file.is_raw();
        let in_size = core::cmp::min(self.config.in_buf_size as usize, IN_BUF_SIZE) as u32;
        let raw_chunk = match align_down(in_size, align) {
            0 => in_size,
            n => n,
        };
        let area_size = part.max_file_size();

        let mut bufs = RxBuffers::new();
        let RxBuffers {
            ring,
            seg,
            input,
            output,
        } = &mut bufs;
        let mut scratch = [0u8; 512];
        let mut rx = Rx::start(
            &mut *s.image,
            ring,
            seg,
            RxParams {
                offset: image_offset + start_file_off,
                size: file.size - start_file_off,
                seg_size: self.config.data_buf_size,
                max_request: self.config.max_request_size,
                stall_limit: self.config.stall_limit,
            },
        );

        let mut file_off = start_file_off;
        let mut orig_off = start_orig_off;
        let mut first = true;
        while orig_off < file.orig_size {
            self.bp
                .update_file_state(file, FileState::Writing, file_off, orig_off, first)?;
            first = false;

            let fetched = if raw {
                let n = core::cmp::min(raw_chunk, file.orig_size - orig_off) as usize;
                rx.take(&mut input[..n]).map(|_| (n as u32, &input[..n]))
            } else {
                rx.read_block(&mut input[..in_size as usize], &mut output[..])
                    .map(|h| (h.hdr_size + h.comp_size, &output[..h.orig_size as usize]))
            };
            let (consumed, data) = match fetched {
                Ok(v) => v,
                Err(e) => {
                    log::error!("file {}: receive failed at {:#x}: {}", file.name.as_str(), file_off, e);
                    let _ = self
                        .bp
                        .update_file_state(file, FileState::Writing, file_off, orig_off, true);
                    rx.stop();
                    return Err(e);
                }
            };
            if orig_off + data.len() as u32 > file.orig_size {
                log::error!("file {}: decoded data overruns file", file.name.as_str());
                rx.stop();
                return Err(ProtocolError::LengthMismatch.into());
            }

            let addr = file.offset + orig_off;
            if !self.config.erase_part_for_upg {
                if let Some(span) = storage::plan_stream_erase(
                    file.offset,
                    area_size,
                    addr,
                    data.len() as u32,
                    align,
                    self.config.erase_block_size,
                ) {
                    log::debug!("erase {:?} {:#x}+{:#x}", span.region, span.addr, span.len);
                    storage::erase_if_dirty(flash, span.addr, span.len, &mut scratch)?;
                }
            }
            storage::write(flash, addr, data)?;
            log::debug!("write {:#x} -> {:#x}({:#x})", file_off, orig_off, data.len());

            file_off += consumed;
            orig_off += data.len() as u32;
        }
        log::info!("write file {}: {} KB done", file.name.as_str(), file.orig_size / 1024);
        Ok(())
    }

    fn write_file_by_patch<B: Backend, P: FilePatcher>(
        &mut self,
        s: &mut Session<'_, B, P>,
        part: &Partition,
        file: &OtaFile,
        start_file_off: u32,
    ) -> Result<()> {
        log::info!("write file {} by patch to {:#x}", file.name.as_str(), file.offset);
        if start_file_off != 0 {
            log::error!("cannot resume a patched file");
            return Err(Error::Unsupported);
        }
        let patch_offset = s.image.file_offset(&file.name).ok_or(Error::MissingFile)?;
        let patch_size = s.image.file_length(&file.name).ok_or(Error::MissingFile)?;
        let old = self
            .table
            .part(file.file_id)
            .ok_or(Error::NoPartition(file.file_id))?;
        if old.storage_id != part.storage_id {
            log::error!("old and new file of {} on different storage", file.file_id);
            return Err(Error::Unsupported);
        }

        let flash = self
            .storages
            .find(part.storage_id)
            .ok_or(Error::NoStorage(part.storage_id))?;
        let mut scratch = [0u8; 512];
        if !storage::is_clean(flash, file.offset, file.orig_size, &mut scratch)? {
            log::error!("storage not clean, offs {:#x} size {:#x}", file.offset, file.orig_size);
            return Err(Error::InvalidState);
        }
        self.bp
            .update_file_state(file, FileState::WritingDirty, 0, 0, false)?;

        let job = PatchJob {
            file_id: file.file_id,
            old_offset: old.file_offset,
            old_size: old.max_file_size(),
            new_offset: file.offset,
            new_size: file.orig_size,
            patch_offset,
            patch_size,
            use_crc: old.flags.contains(PartitionFlags::CRC),
            use_encryption: old.flags.contains(PartitionFlags::ENCRYPTION),
        };
        let mut io = PatchCtx {
            image: &mut *s.image,
            flash,
            job,
            written: 0,
        };
        s.patcher.apply(&job, &mut io).map_err(|e| {
            log::error!("patch of file {} failed: {:?}", file.file_id, e);
            Error::Patch
        })
    }

    /// CRC32 of the file as stored in flash against the manifest checksum.
    pub(super) fn verify_file(&mut self, file: &OtaFile) -> Result<()> {
        let flash = self
            .storages
            .find(file.storage_id)
            .ok_or(Error::NoStorage(file.storage_id))?;
        let mut buf = [0u8; DATA_BUF_SIZE];
        let chunk = core::cmp::min(self.config.data_buf_size as usize, DATA_BUF_SIZE);
        let mut hasher = crc32fast::Hasher::new();
        let mut addr = file.offset;
        let end = file.offset + file.orig_size;
        while addr < end {
            let n = core::cmp::min(chunk as u32, end - addr) as usize;
            storage::read(flash, addr, &mut buf[..n])?;
            hasher.update(&buf[..n]);
            addr += n as u32;
        }
        let actual = hasher.finalize();
        log::info!(
            "check file {}: crc orig {:#010x}, calc {:#010x}",
            file.name.as_str(),
            file.checksum,
            actual
        );
        if actual != file.checksum {
            return Err(Error::Verify {
                file_id: file.file_id,
                expected: file.checksum,
                actual,
            });
        }
        Ok(())
    }
}
