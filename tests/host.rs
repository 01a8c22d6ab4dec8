mod support;

use std::cell::RefCell;
use std::rc::Rc;

use libota::backend::{Backend, BackendType};
use libota::error::Error;
use libota::host::{HeadInfo, HostState, HostUpgrade, PEER_UP_TO_DATE, Phase, Trans, TransEvent};
use libota::image::OtaImage;
use libota::partition::{FILE_ID_BOOT, FILE_ID_SYSTEM, PartitionType};
use libota::upgrade::Outcome;
use support::*;

/// Host side of a loopback link: everything sent lands in a shared buffer.
struct Pipe {
    unit: u32,
    wire: Rc<RefCell<Vec<u8>>>,
    requests: Vec<HeadInfo>,
}

impl Trans for Pipe {
    type Error = ();

    fn open(&mut self) -> Result<(), ()> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), ()> {
        Ok(())
    }

    fn unit_size(&mut self) -> u32 {
        self.unit
    }

    fn send_image(&mut self, data: &[u8]) -> Result<(), ()> {
        self.wire.borrow_mut().extend_from_slice(data);
        Ok(())
    }

    fn request_upgrade(&mut self, head: &HeadInfo) -> Result<(), ()> {
        self.requests.push(*head);
        Ok(())
    }

    fn connect_negotiation(&mut self) -> Result<(), ()> {
        Ok(())
    }

    fn negotiation_result(&mut self) -> Result<(), ()> {
        Ok(())
    }
}

type Host = HostUpgrade<VecBackend, Pipe>;

/// Peer side: every read becomes an image data request to the host.
struct Relay {
    host: Host,
    wire: Rc<RefCell<Vec<u8>>>,
    drop_at: Option<u32>,
}

impl Backend for Relay {
    type Error = Error;

    fn kind(&self) -> BackendType {
        BackendType::Bluetooth
    }

    fn open(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        if self.drop_at.is_some_and(|at| offset + buf.len() as u32 > at) {
            self.host.handle_event(TransEvent::Disconnected)?;
            return Err(Error::TransportRead { offset });
        }
        self.host.handle_event(TransEvent::RequestImageData {
            offset,
            len: buf.len() as u32,
        })?;
        let mut wire = self.wire.borrow_mut();
        assert_eq!(wire.len(), buf.len());
        buf.copy_from_slice(&wire);
        wire.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

fn image() -> TestImage {
    build_image(
        0x200,
        &[
            ImageFile::raw("app.bin", FILE_ID_SYSTEM, PartitionType::Normal, pattern(6000, 1)),
            ImageFile::raw("boot.bin", FILE_ID_BOOT, PartitionType::Boot, pattern(512, 2)),
        ],
    )
}

fn connected_host(img: &TestImage, wire: &Rc<RefCell<Vec<u8>>>) -> Host {
    let mut host = HostUpgrade::new(config()).unwrap();
    host.attach_backend(VecBackend::new(img.bytes.clone())).unwrap();
    host.attach_trans(Pipe {
        unit: 244,
        wire: wire.clone(),
        requests: Vec::new(),
    });
    host.check(&mut Parser(img.manifest.clone())).unwrap();

    host.handle_event(TransEvent::Connected).unwrap();
    host.handle_event(TransEvent::RequestUpgradeAck).unwrap();
    host.handle_event(TransEvent::ConnectNegotiationAck).unwrap();
    host.handle_event(TransEvent::NegotiationResultAck).unwrap();
    assert_eq!(host.phase(), Phase::WaitRemoteCmd);
    host
}

#[test]
fn test_host_serves_a_peer_upgrade() {
    let img = image();
    let wire = Rc::new(RefCell::new(Vec::new()));
    let host = connected_host(&img, &wire);

    let head = host.trans().unwrap().requests[0];
    assert_eq!(head.version, 0x200);
    assert_eq!(head.image_size, img.bytes.len() as u32);

    let mut peer = engine(SimFlash::new(512), MemKv::default(), config());
    let mut image = OtaImage::new(Relay {
        host,
        wire,
        drop_at: None,
    });
    let r = peer.upgrade_check(&mut image, &mut Parser(img.manifest.clone()));
    assert_eq!(r, Ok(Outcome::Upgraded));

    let flash = &peer.storages()[0];
    assert_eq!(flash.slice(SYSTEM_B, 6000), &pattern(6000, 1)[..]);
    assert_eq!(flash.slice(BOOT_B, 512), &pattern(512, 2)[..]);

    let mut host = image.into_backend().host;
    host.handle_event(TransEvent::ValidateReport(true)).unwrap();
    assert_eq!(host.peers_upgraded(), 1);
    assert_eq!(host.state(), HostState::Running);
}

#[test]
fn test_link_drop_mid_transfer_resumes_on_next_session() {
    let img = image();
    let wire = Rc::new(RefCell::new(Vec::new()));

    let mut peer = engine(SimFlash::new(512), MemKv::default(), config());
    let mut first = OtaImage::new(Relay {
        host: connected_host(&img, &wire),
        wire: wire.clone(),
        drop_at: Some(img.offsets[0] + 2560),
    });
    let r = peer.upgrade_check(&mut first, &mut Parser(img.manifest.clone()));
    assert!(matches!(r, Err(Error::TransportRead { .. })));
    let host = first.into_backend().host;
    assert_eq!(host.state(), HostState::Init);
    assert!(host.is_upgrading());
    assert!(host.trans().is_none());
    assert_eq!(peer.breakpoint().cur_orig_write_offset, 2048);

    let mut peer = reboot(peer, config());
    let mut second = OtaImage::new(Relay {
        host: connected_host(&img, &wire),
        wire,
        drop_at: None,
    });
    let r = peer.upgrade_check(&mut second, &mut Parser(img.manifest.clone()));
    assert_eq!(r, Ok(Outcome::Upgraded));
    assert_eq!(peer.storages()[0].slice(SYSTEM_B, 6000), &pattern(6000, 1)[..]);

    let served = second.into_backend().host.detach_backend().unwrap();
    assert_eq!(served.first_data_read(), Some(img.offsets[0] + 2048));
}

#[test]
fn test_peer_reports_up_to_date() {
    let img = image();
    let wire = Rc::new(RefCell::new(Vec::new()));
    let mut host = connected_host(&img, &wire);
    host.handle_event(TransEvent::UpgradeStatus(PEER_UP_TO_DATE)).unwrap();
    assert_eq!(host.phase(), Phase::PeerUpToDate);

    let served = host.detach_backend().unwrap();
    assert!(served.first_data_read().is_none());
}
