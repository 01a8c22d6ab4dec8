//! # Host relay
//!
//! The device holds a complete image and feeds it to a peer that runs its
//! own [`OtaEngine`](crate::upgrade::OtaEngine). The image comes from an
//! attached [`Backend`], the peer is reached through a [`Trans`] link, and
//! the peer drives the session with [`TransEvent`]s:
//!
//! ```text
//! SdapResult ─► Connected ─► RequestUpgradeAck ─► ConnectNegotiationAck
//!     ─► NegotiationResultAck ─► RequestImageData* ─► ValidateReport
//! ```
//!
//! A disconnect at any point drops back to `Init` and raises the
//! [`is_upgrading`](HostUpgrade::is_upgrading) flag so a supervisor can
//! schedule another attempt.

#![allow(missing_docs)]


use crate::backend::{Backend, Ioctl};
use crate::config::{HOST_BUF_SIZE, MANIFEST_NAME, OtaConfig};
use crate::error::{Error, ProtocolError, Result};
use crate::image::OtaImage;
use crate::manifest::{FwVersion, ManifestParser};

/// Status code a peer sends when it already runs this image.
pub const PEER_UP_TO_DATE: u32 = 0x10;

/// Summary of the held image announced with the upgrade request.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HeadInfo {
    pub version: u32,
    pub head_crc: u32,
    pub image_size: u32,
}

/// Point-to-point link to the peer being upgraded.
pub trait Trans {
    type Error: core::fmt::Debug;

    fn open(&mut self) -> core::result::Result<(), Self::Error>;

    fn close(&mut self) -> core::result::Result<(), Self::Error>;

    /// Transfer unit of the link, 0 while the link cannot take data.
    fn unit_size(&mut self) -> u32;

    fn send_image(&mut self, data: &[u8]) -> core::result::Result<(), Self::Error>;

    fn request_upgrade(&mut self, head: &HeadInfo) -> core::result::Result<(), Self::Error>;

    fn connect_negotiation(&mut self) -> core::result::Result<(), Self::Error>;

    fn negotiation_result(&mut self) -> core::result::Result<(), Self::Error>;
}

/// Events raised by the link on behalf of the peer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransEvent {
    /// Service discovery finished, 0 on success.
    SdapResult(u16),
    Connected,
    RequestUpgradeAck,
    ConnectNegotiationAck,
    NegotiationResultAck,
    RequestImageData { offset: u32, len: u32 },
    ValidateReport(bool),
    UpgradeStatus(u32),
    Disconnected,
}

/// Relay state. Images are only served while `Running`.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HostState {
    #[default]
    Init,
    Running,
}

/// Position in the peer handshake.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    #[default]
    Idle,
    /// Upgrade requested, waiting for the ack.
    RequestUpgrade,
    ConnectNegotiation,
    NegotiationResult,
    /// Handshake done, the peer pulls data or reports.
    WaitRemoteCmd,
    /// The peer reported it already runs this image.
    PeerUpToDate,
}

pub struct HostUpgrade<B: Backend, T: Trans> {
    image: Option<OtaImage<B>>,
    trans: Option<T>,
    config: OtaConfig,
    state: HostState,
    phase: Phase,
    version: FwVersion,
    max_request: u32,
    upgrading: bool,
    validate_pending: bool,
    last_report: Option<bool>,
    peers_upgraded: u32,
    buf: [u8; HOST_BUF_SIZE],
}

impl<B: Backend, T: Trans> HostUpgrade<B, T> {
    pub fn new(config: OtaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            image: None,
            trans: None,
            config,
            state: HostState::Init,
            phase: Phase::Idle,
            version: FwVersion::default(),
            max_request: 0,
            upgrading: false,
            validate_pending: false,
            last_report: None,
            peers_upgraded: 0,
            buf: [0; HOST_BUF_SIZE],
        })
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Set after a dropped session; a supervisor should retry.
    pub fn is_upgrading(&self) -> bool {
        self.upgrading
    }

    pub fn clear_upgrading(&mut self) {
        self.upgrading = false;
    }

    /// Peers that reported a valid image after being served data.
    pub fn peers_upgraded(&self) -> u32 {
        self.peers_upgraded
    }

    pub fn last_report(&self) -> Option<bool> {
        self.last_report
    }

    pub fn trans(&self) -> Option<&T> {
        self.trans.as_ref()
    }

    pub fn image(&self) -> Option<&OtaImage<B>> {
        self.image.as_ref()
    }

    /// Bind the image source. Fails with `Busy` while another one is bound,
    /// in which case `backend` is dropped.
    pub fn attach_backend(&mut self, backend: B) -> Result<()> {
        if self.image.is_some() {
            log::warn!("backend already attached");
            return Err(Error::Busy);
        }
        log::info!("attach backend {:?}", backend.kind());
        self.image = Some(OtaImage::new(backend));
        Ok(())
    }

    /// Unbind the image source and stop serving it.
    pub fn detach_backend(&mut self) -> Option<B> {
        let mut image = self.image.take()?;
        if image.is_open() {
            let _ = image.close();
        }
        self.state = HostState::Init;
        log::info!("detach backend {:?}", image.kind());
        Some(image.into_backend())
    }

    pub fn attach_trans(&mut self, trans: T) {
        self.trans = Some(trans);
    }

    pub fn detach_trans(&mut self) -> Option<T> {
        self.trans.take()
    }

    /// Open the attached image and read its manifest. The relay serves data
    /// only after a successful check.
    pub fn check<M: ManifestParser>(&mut self, parser: &mut M) -> Result<()> {
        if self.state != HostState::Init {
            log::error!("host state {:?} is not Init", self.state);
            return Err(Error::InvalidState);
        }
        let image = self.image.as_mut().ok_or(Error::NotReady)?;
        image.open()?;

        let manifest = match parser.parse(image, MANIFEST_NAME) {
            Ok(m) => m,
            Err(e) => {
                log::error!("cannot get manifest file in image: {:?}", e);
                let _ = image.close();
                return Err(ProtocolError::Manifest.into());
            }
        };
        self.max_request = image.ioctl(Ioctl::GetMaxSize).unwrap_or(0);
        self.version = manifest.fw_ver;
        log::info!(
            "host image v{:#x}, size {:#x}, max request {:#x}",
            self.version.version_code,
            image.image_size(),
            self.max_request
        );
        self.state = HostState::Running;
        Ok(())
    }

    pub fn image_size(&self) -> u32 {
        self.image.as_ref().map_or(0, |i| i.image_size())
    }

    pub fn head_crc(&self) -> u32 {
        self.image.as_ref().map_or(0, |i| i.head_crc())
    }

    pub fn image_version(&self) -> u32 {
        self.version.version_code
    }

    pub fn head_info(&self) -> HeadInfo {
        HeadInfo {
            version: self.image_version(),
            head_crc: self.head_crc(),
            image_size: self.image_size(),
        }
    }

    /// Stream `len` bytes at `offset` to the peer in unit-aligned chunks.
    pub fn send_image(&mut self, offset: u32, len: u32) -> Result<()> {
        if self.state != HostState::Running {
            log::error!("host not running, state {:?}", self.state);
            return Err(Error::InvalidState);
        }
        let (Some(image), Some(trans)) = (self.image.as_mut(), self.trans.as_mut()) else {
            return Err(Error::NotReady);
        };

        let unit = trans.unit_size();
        if unit == 0 {
            log::warn!("link not ready, unit size 0");
            return Err(Error::NotReady);
        }
        let mut max = self.config.host_buf_size.min(HOST_BUF_SIZE as u32);
        if self.max_request > 0 {
            max = max.min(self.max_request);
        }
        let max = max / unit * unit;
        if max == 0 {
            log::error!("unit size {:#x} exceeds the send buffer", unit);
            return Err(Error::Config);
        }

        log::debug!("send image {:#x}+{:#x}, chunk {:#x}", offset, len, max);
        let mut offset = offset;
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(max);
            let buf = &mut self.buf[..chunk as usize];
            image.read(offset, buf)?;
            trans.send_image(buf).map_err(|e| {
                log::error!("send {:#x}+{:#x} failed: {:?}", offset, chunk, e);
                Error::TransportWrite { offset }
            })?;
            offset += chunk;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Advance the peer handshake.
    ///
    /// A failing link request drops the session like a disconnect does and
    /// returns the error.
    pub fn handle_event(&mut self, event: TransEvent) -> Result<()> {
        log::info!("trans event {:?} in {:?}", event, self.phase);
        match event {
            TransEvent::SdapResult(status) => {
                if status != 0 {
                    log::warn!("service discovery failed: {}", status);
                    self.upgrading = true;
                }
                Ok(())
            }
            TransEvent::Connected => self.step(Phase::RequestUpgrade, |t, head| {
                t.open()?;
                t.request_upgrade(head)
            }),
            TransEvent::RequestUpgradeAck => self.step(Phase::ConnectNegotiation, |t, _| {
                t.connect_negotiation()
            }),
            TransEvent::ConnectNegotiationAck => self.step(Phase::NegotiationResult, |t, _| {
                t.negotiation_result()
            }),
            TransEvent::NegotiationResultAck => {
                self.phase = Phase::WaitRemoteCmd;
                Ok(())
            }
            TransEvent::RequestImageData { offset, len } => {
                self.phase = Phase::WaitRemoteCmd;
                self.validate_pending = true;
                if let Err(e) = self.send_image(offset, len) {
                    self.drop_session();
                    return Err(e);
                }
                Ok(())
            }
            TransEvent::ValidateReport(ok) => {
                if ok && self.validate_pending {
                    self.peers_upgraded += 1;
                    log::info!("peer upgraded, total {}", self.peers_upgraded);
                }
                self.validate_pending = false;
                self.last_report = Some(ok);
                self.phase = Phase::WaitRemoteCmd;
                Ok(())
            }
            TransEvent::UpgradeStatus(PEER_UP_TO_DATE) => {
                log::info!("peer firmware is up to date");
                self.phase = Phase::PeerUpToDate;
                Ok(())
            }
            TransEvent::UpgradeStatus(status) => {
                log::info!("peer upgrade status {:#x}", status);
                Ok(())
            }
            TransEvent::Disconnected => {
                self.drop_session();
                Ok(())
            }
        }
    }

    /// Drop the current peer session, as on a link timeout.
    pub fn abort(&mut self) {
        self.drop_session();
    }

    fn step<F>(&mut self, next: Phase, f: F) -> Result<()>
    where
        F: FnOnce(&mut T, &HeadInfo) -> core::result::Result<(), T::Error>,
    {
        let head = self.head_info();
        let Some(trans) = self.trans.as_mut() else {
            log::error!("no link attached");
            return Err(Error::NotReady);
        };
        if let Err(e) = f(trans, &head) {
            log::error!("link request for {:?} failed: {:?}", next, e);
            self.drop_session();
            return Err(Error::TransportWrite { offset: 0 });
        }
        self.phase = next;
        Ok(())
    }

    fn drop_session(&mut self) {
        if let Some(mut trans) = self.trans.take() {
            let _ = trans.close();
        }
        if let Some(image) = self.image.as_mut() {
            if image.is_open() {
                let _ = image.close();
            }
        }
        self.state = HostState::Init;
        self.phase = Phase::Idle;
        self.validate_pending = false;
        self.upgrading = true;
        log::info!("host session dropped, waiting for retry");
    }
}
