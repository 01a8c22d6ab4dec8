//! # Upgrade orchestration
//!
//! [`OtaEngine`] drives one upgrade from an opened image to a durable
//! `UpgradeDone` breakpoint:
//!
//! ```text
//!  Init ─► Checking ─┬─► Skip ─────────────────────────────────────► Init
//!                    └─► ErasePrep ─► Writing ─► Verifying ─► WritingBootParam ─► Done
//!                                       (any failure) ─► Fail ─► Init
//! ```
//!
//! Everything the engine needs to continue after a reset lives in the
//! breakpoint. Files are written to the slot that is not running, boot and
//! param files last, so the running firmware stays bootable until the very
//! end. Transient failures keep the per-file cursor and the next
//! [`upgrade_check`](OtaEngine::upgrade_check) continues from it.
//!
//! ```rust,ignore
//! let mut engine = OtaEngine::new(flash, table, kv, config, running, ())?;
//! let mut image = OtaImage::new(backend);
//! match engine.upgrade_check(&mut image, &mut parser) {
//!     Ok(Outcome::Upgraded) => reboot(),
//!     Ok(Outcome::Skipped) => {}
//!     Err(e) if e.is_resumable() => retry_later(),
//!     Err(e) => report(e),
//! }
//! ```

#![allow(missing_docs)]

mod write;


pub use write::resume_point;

use crate::backend::{Backend, BackendType, ConnectType, Ioctl};
use crate::breakpoint::{BpState, Breakpoint, BreakpointStore, FileState};
use crate::config::{DATA_BUF_SIZE, MANIFEST_NAME, OtaConfig};
use crate::error::{Error, Ineligible, ProtocolError, Result};
use crate::image::OtaImage;
use crate::manifest::{FwVersion, Manifest, ManifestParser};
use crate::nvram::{FW_VERSION_KEY, KvStore, RES_VERSION_KEY, VersionRecord};
use crate::partition::{FILE_ID_OTA_TEMP, Partition, PartitionTable, PartitionType, is_resource_file};
use crate::patch::{FilePatcher, NoPatch};
use crate::storage::{self, FlashStorage, Region, StorageSet};

/// Phase of the engine, reported through [`Listener::state_changed`].
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OtaState {
    #[default]
    Init,
    Checking,
    Skip,
    ErasePrep,
    Writing,
    Verifying,
    WritingBootParam,
    Done,
    Fail,
}

/// How a successful check ended.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    Upgraded,
    /// The image is not newer than the running firmware.
    Skipped,
}

/// Upgrade notifications. Both methods default to no-ops.
pub trait Listener {
    fn state_changed(&mut self, _new: OtaState, _old: OtaState) {}

    fn file_verified(&mut self, _file_id: u8) {}
}

impl Listener for () {}

enum Decision {
    Proceed,
    Skip,
}

/// Per-check working set: the opened image, its manifest with resolved
/// offsets, and the patcher for delta images.
struct Session<'a, B: Backend, P: FilePatcher> {
    image: &'a mut OtaImage<B>,
    manifest: Manifest,
    patcher: &'a mut P,
}

pub struct OtaEngine<S: StorageSet, T: PartitionTable, K: KvStore, L: Listener = ()> {
    storages: S,
    table: T,
    bp: BreakpointStore<K>,
    config: OtaConfig,
    running: FwVersion,
    listener: L,
    state: OtaState,
}

/// Erase `part` from `start` (relative to the partition) to its end,
/// skipping ranges that are already blank.
fn erase_part<S: StorageSet>(
    storages: &mut S,
    part: &Partition,
    start: u32,
    scratch: &mut [u8],
) -> Result<bool> {
    let flash = storages
        .find(part.storage_id)
        .ok_or(Error::NoStorage(part.storage_id))?;
    log::info!(
        "erase part {}: offset {:#x} size {:#x}, start {:#x}",
        part.name,
        part.offset,
        part.size,
        start
    );
    if start >= part.size {
        return Ok(false);
    }
    storage::erase_if_dirty(flash, part.offset + start, part.size - start, scratch)
}

impl<S: StorageSet, T: PartitionTable, K: KvStore, L: Listener> OtaEngine<S, T, K, L> {
    /// Load the breakpoint and clean up after whatever the previous run left.
    pub fn new(
        storages: S,
        table: T,
        kv: K,
        config: OtaConfig,
        running: FwVersion,
        listener: L,
    ) -> Result<Self> {
        config.validate()?;
        let bp = BreakpointStore::open(
            kv,
            config.bp_save_size,
            running.version_code,
            table.mirror_slot(),
        );
        let mut engine = Self {
            storages,
            table,
            bp,
            config,
            running,
            listener,
            state: OtaState::Init,
        };
        if let Err(e) = engine.prepare_partitions() {
            log::warn!("partition prepare failed: {}", e);
        }
        Ok(engine)
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn breakpoint(&self) -> &Breakpoint {
        self.bp.get()
    }

    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    pub fn storages(&self) -> &S {
        &self.storages
    }

    pub fn storages_mut(&mut self) -> &mut S {
        &mut self.storages
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn into_parts(self) -> (S, T, K) {
        (self.storages, self.table, self.bp.into_inner())
    }

    /// A finished or pending upgrade is waiting for the next boot.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self.bp.get().state,
            BpState::UpgradePending | BpState::UpgradeWriting | BpState::UpgradeDone
        )
    }

    pub fn set_in_progress(&mut self) -> Result<()> {
        if self.is_in_progress() {
            return Ok(());
        }
        self.bp.update_state(BpState::UpgradePending)
    }

    fn notify(&mut self, state: OtaState) {
        let old = self.state;
        self.state = state;
        log::info!("ota state {:?} -> {:?}", old, state);
        self.listener.state_changed(state, old);
    }

    /// Writing into temp partitions for a recovery loader to finish.
    fn writes_recovery_image(&self) -> bool {
        self.config.use_recovery && !self.config.use_recovery_app
    }

    /// Target partition of `file_id`: the mirror slot, or with recovery
    /// enabled any partition the running firmware is not executing from.
    fn resolve_part(&self, file_id: u8) -> Result<Partition> {
        if let Some(part) = self.table.mirror_part(file_id) {
            return Ok(part);
        }
        if self.config.use_recovery {
            let running = self.table.current_file_id();
            if running != file_id {
                if let Some(part) = self.table.part(file_id) {
                    return Ok(part);
                }
            }
            log::error!("no part for file {}, running file {}", file_id, running);
        } else {
            log::error!("no mirror part for file {}", file_id);
        }
        Err(Error::NoPartition(file_id))
    }

    fn is_candidate(&self, part: &Partition) -> bool {
        if self.config.use_recovery {
            (part.kind == PartitionType::Temp || part.file_id == FILE_ID_OTA_TEMP)
                && part.storage_id == self.config.primary_storage_id
        } else {
            self.table.is_mirror_part(part)
        }
    }

    /// Bring the target partitions in line with the breakpoint.
    ///
    /// A partition whose file was mid-write keeps everything before the
    /// erase-aligned cursor; finished files are left alone; everything else
    /// is erased. Outside of a write the breakpoint is reset to `Clean`.
    pub fn prepare_partitions(&mut self) -> Result<()> {
        let state = self.bp.get().state;
        log::info!("prepare partitions, bp state {:?}", state);
        if state == BpState::Clean {
            return Ok(());
        }
        if self.config.use_recovery
            && matches!(
                state,
                BpState::UpgradePending | BpState::UpgradeWriting | BpState::UpgradingFailed
            )
        {
            log::info!("upgrade in process, temp part erased on write");
            return Ok(());
        }

        let writing = state.is_writing();
        let mirror_slot = self.table.mirror_slot();
        let mut scratch = [0u8; DATA_BUF_SIZE];
        let scratch = &mut scratch[..self.config.data_buf_size as usize];

        for part in self.table.entries() {
            if part.file_id == 0 || !self.is_candidate(part) {
                continue;
            }

            if writing {
                let bp = self.bp.get();
                match bp.file_state(part.file_id) {
                    FileState::Clean
                    | FileState::WriteDone
                    | FileState::VerifyPass
                    | FileState::WritingClean => {
                        log::debug!("part {}: keep", part.name);
                        continue;
                    }
                    FileState::Writing
                        if (self.config.use_recovery || bp.mirror_id == mirror_slot)
                            && bp.cur_file.file_id == part.file_id =>
                    {
                        let Some(flash) = self.storages.find(part.storage_id) else {
                            log::warn!("part {}: storage {} missing", part.name, part.storage_id);
                            continue;
                        };
                        let (file_off, orig_off) = resume_point(
                            bp.cur_file.offset,
                            bp.cur_file.size == bp.cur_file.orig_size,
                            bp.cur_file_write_offset,
                            bp.cur_orig_write_offset,
                            storage::erase_align(flash)?,
                        );
                        let start = (bp.cur_file.offset + orig_off).max(part.offset) - part.offset;
                        log::info!(
                            "part {}: writing, erase from {:#x}, cursor {:#x}({:#x})",
                            part.name,
                            start,
                            file_off,
                            orig_off
                        );
                        erase_part(&mut self.storages, part, start, scratch)?;
                        let bp = self.bp.get_mut();
                        bp.cur_file_write_offset = file_off;
                        bp.cur_orig_write_offset = orig_off;
                        bp.set_file_state(part.file_id, FileState::WritingClean)?;
                        continue;
                    }
                    _ => {}
                }
            }

            if !self.config.keep_temp_part {
                match erase_part(&mut self.storages, part, 0, scratch) {
                    Ok(_) => {}
                    Err(Error::NoStorage(id)) => {
                        log::warn!("part {}: storage {} missing", part.name, id);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
                if let Err(e) = self.bp.set_file_state(part.file_id, FileState::Clean) {
                    log::warn!("part {}: clean mark dropped: {}", part.name, e);
                }
            }
        }

        if !writing {
            if state != BpState::Unknown {
                log::info!("clear old bp status");
                self.bp.init_default(self.running.version_code, mirror_slot);
            }
            self.bp.get_mut().state = BpState::Clean;
        }
        self.bp.save()
    }

    fn eligibility<B: Backend>(&self, image: &OtaImage<B>, manifest: &Manifest) -> Result<Decision> {
        let img = &manifest.fw_ver;
        let cur = &self.running;
        log::info!(
            "image {} v{:#x} for {}, running v{:#x}",
            img.version_name.as_str(),
            img.version_code,
            img.board_name.as_str(),
            cur.version_code
        );

        if img.board_name != cur.board_name {
            log::error!("unmatched board name, skip ota");
            return Err(Ineligible::BoardMismatch.into());
        }
        if manifest.is_patch() {
            if manifest.old_fw_ver.version_code != cur.version_code {
                log::error!(
                    "unmatched fw ver, curr {:#x} but patch base is {:#x}",
                    cur.version_code,
                    manifest.old_fw_ver.version_code
                );
                return Err(Ineligible::BaseVersionMismatch.into());
            }
            if self.config.no_version_control {
                log::error!("delta image requires version control");
                return Err(Ineligible::PatchWithoutVersionControl.into());
            }
        }
        if !self.config.no_version_control && cur.version_code >= img.version_code {
            log::info!("ota image is same or older, skip ota");
            return Ok(Decision::Skip);
        }

        let bp = self.bp.get();
        let kind = image.kind();
        if kind != BackendType::TempPartition
            && !(kind == BackendType::SdCard && self.config.use_recovery_app)
            && bp.backend_type != BackendType::Unknown
            && bp.backend_type != kind
        {
            log::warn!("backend changed ({:?} -> {:?})", bp.backend_type, kind);
            return Err(Error::ImageChanged);
        }
        if matches!(
            bp.state,
            BpState::WritingImage | BpState::UpgradeWriting | BpState::UpgradePending
        ) && ((bp.new_version != 0 && bp.new_version != img.version_code)
            || bp.data_checksum != image.checksum())
        {
            log::warn!("breakpoint belongs to another image");
            return Err(Error::ImageChanged);
        }
        Ok(Decision::Proceed)
    }

    /// Start progress accounting, counting what earlier attempts already wrote.
    fn statistics<B: Backend>(&mut self, image: &mut OtaImage<B>, manifest: &Manifest) -> Result<()> {
        let mut total = 0u32;
        let mut start = 0u32;
        for file in &manifest.files {
            let part = self.resolve_part(file.file_id)?;
            let bp = self.bp.get();
            match bp.file_state(file.file_id) {
                FileState::WriteDone | FileState::VerifyPass => start += file.size,
                FileState::WritingClean | FileState::Writing | FileState::WriteStart
                    if bp.cur_file.file_id == file.file_id =>
                {
                    let align = self
                        .storages
                        .find(part.storage_id)
                        .map_or(Ok(1), |f| storage::erase_align(f))?;
                    let (file_off, _) = resume_point(
                        part.file_offset,
                        file.is_raw(),
                        bp.cur_file_write_offset,
                        bp.cur_orig_write_offset,
                        align,
                    );
                    start += file_off;
                }
                _ => {}
            }
            total += file.size;
        }
        if total > 0 {
            image.progress_on(total, start);
        }
        Ok(())
    }

    /// Check the image behind `image` and install it if it is newer.
    pub fn upgrade_check<B: Backend, M: ManifestParser>(
        &mut self,
        image: &mut OtaImage<B>,
        parser: &mut M,
    ) -> Result<Outcome> {
        self.upgrade_check_with_patcher(image, parser, &mut NoPatch)
    }

    /// [`upgrade_check`](Self::upgrade_check) for images that may carry
    /// binary patches.
    pub fn upgrade_check_with_patcher<B: Backend, M: ManifestParser, P: FilePatcher>(
        &mut self,
        image: &mut OtaImage<B>,
        parser: &mut M,
        patcher: &mut P,
    ) -> Result<Outcome> {
        if self.state != OtaState::Init {
            log::error!("ota state {:?} is not Init, skip upgrade", self.state);
            return Err(Error::InvalidState);
        }
        self.notify(OtaState::Checking);

        if let Err(e) = image.open() {
            log::error!("ota image open failed: {}", e);
            if image.backend().is_link() {
                let _ = image.read_prepare(0, 0);
            }
            self.notify(OtaState::Fail);
            self.notify(OtaState::Init);
            return Err(e);
        }

        let result = self.run(image, parser, patcher);
        match result {
            Ok(Outcome::Upgraded) => log::info!("upgrade successfully!"),
            Ok(Outcome::Skipped) => {
                self.notify(OtaState::Skip);
                self.notify(OtaState::Init);
            }
            Err(e) => self.abort(image, e),
        }

        if image.backend().is_link() {
            let _ = image.read_prepare(0, 0);
        }
        let _ = image.close();
        result
    }

    fn run<B: Backend, M: ManifestParser, P: FilePatcher>(
        &mut self,
        image: &mut OtaImage<B>,
        parser: &mut M,
        patcher: &mut P,
    ) -> Result<Outcome> {
        if self.config.use_recovery_app {
            if let Err(e) = image.check_data() {
                log::error!("bad data crc");
                self.bp.update_state(BpState::WritingImageFailed)?;
                return Err(e);
            }
        }

        let manifest = parser.parse(image, MANIFEST_NAME).map_err(|e| {
            log::error!("cannot get manifest file in image: {:?}", e);
            Error::from(ProtocolError::Manifest)
        })?;

        match self.eligibility(image, &manifest) {
            Ok(Decision::Skip) => return Ok(Outcome::Skipped),
            Err(Error::ImageChanged) => {
                log::warn!("{}, erase and restart", Error::ImageChanged);
                self.notify(OtaState::ErasePrep);
                self.bp.update_state(BpState::UpgradePending)?;
                self.prepare_partitions()?;
            }
            Err(e) => return Err(e),
            Ok(Decision::Proceed) => {
                self.notify(OtaState::ErasePrep);
                self.prepare_partitions()?;
            }
        }

        {
            let bp = self.bp.get_mut();
            bp.backend_type = image.kind();
            bp.new_version = manifest.fw_ver.version_code;
            bp.data_checksum = image.checksum();
        }
        self.statistics(image, &manifest)?;

        self.notify(OtaState::Writing);
        let recovery_image = self.writes_recovery_image();
        self.bp.update_state(if recovery_image {
            BpState::WritingImage
        } else {
            BpState::UpgradeWriting
        })?;

        let mut session = Session {
            image,
            manifest,
            patcher,
        };
        self.do_upgrade(&mut session)?;

        let manifest = &session.manifest;
        let has_res = manifest.files.iter().any(|f| is_resource_file(f.file_id));
        if has_res {
            VersionRecord {
                version_code: self.running.version_code,
                version_res: manifest.fw_ver.version_res,
            }
            .store(self.bp.kv_mut(), RES_VERSION_KEY)?;
        }
        if !recovery_image {
            VersionRecord {
                version_code: manifest.fw_ver.version_code,
                version_res: if has_res {
                    manifest.fw_ver.version_res
                } else {
                    self.running.version_res
                },
            }
            .store(self.bp.kv_mut(), FW_VERSION_KEY)?;
        }

        self.bp.update_state(if recovery_image && manifest.carries_temp_image() {
            BpState::UpgradePending
        } else {
            BpState::UpgradeDone
        })?;

        session.image.report_progress(0, true);
        let _ = session.image.ioctl(Ioctl::ReportImageValid(true));
        self.notify(OtaState::Done);
        Ok(Outcome::Upgraded)
    }

    fn abort<B: Backend>(&mut self, image: &mut OtaImage<B>, err: Error) {
        log::error!("upgrade failed: {} ({:?})", err, err.class());
        let _ = image.ioctl(Ioctl::ReportImageValid(false));
        self.notify(OtaState::Fail);

        if !err.is_resumable() {
            let failed = if self.writes_recovery_image() {
                BpState::WritingImageFailed
            } else {
                BpState::UpgradingFailed
            };
            self.bp.get_mut().clear_files();
            if let Err(e) = self.bp.update_state(failed) {
                log::error!("cannot record failure: {}", e);
            }
        }

        if image.backend().is_link() {
            let _ = image.read_prepare(0, 0);
            if image.ioctl(Ioctl::GetConnectType) == Ok(ConnectType::Ble as u32) {
                let _ = image.ioctl(Ioctl::ExecuteExit);
            }
        }

        log::info!("ota state -> Init, wait for upgrading resume");
        self.notify(OtaState::Init);
    }

    fn do_upgrade<B: Backend, P: FilePatcher>(&mut self, s: &mut Session<'_, B, P>) -> Result<()> {
        log::info!("ota file count {}", s.manifest.files.len());
        let mut retried = false;
        let mut tail: [Option<(Partition, usize)>; 2] = [None, None];

        loop {
            for i in 0..s.manifest.files.len() {
                let file_id = s.manifest.files[i].file_id;
                let part = self.resolve_part(file_id)?;
                let file = &mut s.manifest.files[i];
                if file.orig_size > part.max_file_size() {
                    log::error!(
                        "part {}: file size {:#x} > max {:#x}",
                        part.name,
                        file.orig_size,
                        part.max_file_size()
                    );
                    return Err(Error::FileTooLarge { file_id });
                }
                file.offset = part.file_offset;
                file.storage_id = part.storage_id;
                log::info!("[{}]: file {} id {} -> {:#x}", i, file.name.as_str(), file_id, file.offset);

                if part.is_boot() {
                    tail[0] = Some((part, i));
                    continue;
                }
                if part.is_param() {
                    tail[1] = Some((part, i));
                    continue;
                }
                let file = file.clone();
                self.write_and_verify(s, &part, &file, false)?;
            }

            self.notify(OtaState::Verifying);
            match self.verify_along(s) {
                Ok(()) => break,
                Err(e) if !retried => {
                    log::error!("upgrade retry after verify failed: {}", e);
                    retried = true;
                    s.image.progress_reset();
                    self.notify(OtaState::Writing);
                }
                Err(e) => return Err(e),
            }
        }

        self.notify(OtaState::WritingBootParam);
        let mut scratch = [0u8; DATA_BUF_SIZE];
        for (part, i) in tail.into_iter().flatten() {
            let file = s.manifest.files[i].clone();
            self.write_and_verify(s, &part, &file, true)?;
            if let Some(current) = self.table.part(file.file_id) {
                if current != part {
                    erase_part(&mut self.storages, &current, 0, &mut scratch)?;
                    self.bp.set_file_state(file.file_id, FileState::Clean)?;
                    self.bp.save()?;
                    log::info!("file {}: old copy at {:#x} erased", file.file_id, current.start());
                }
            }
        }
        Ok(())
    }

    fn verify_along<B: Backend, P: FilePatcher>(&mut self, s: &mut Session<'_, B, P>) -> Result<()> {
        for i in 0..s.manifest.files.len() {
            let file = &s.manifest.files[i];
            let part = self.resolve_part(file.file_id)?;
            if part.is_boot() || part.is_param() {
                continue;
            }
            if let Err(e) = self.verify_file(file) {
                log::error!("file {}, verify failed", file.name.as_str());
                self.bp.update_file_state(file, FileState::VerifyFail, 0, 0, false)?;
                return Err(e);
            }
            self.listener.file_verified(file.file_id);
            log::info!("file {}, verify pass", file.name.as_str());
            self.bp.update_file_state(file, FileState::VerifyPass, 0, 0, false)?;
        }
        Ok(())
    }
}
