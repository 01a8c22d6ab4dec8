use super::*;
use crate::backend;
use std::vec::Vec as StdVec;

struct MemBackend {
    data: StdVec<u8>,
    progress: StdVec<u8>,
    closed: bool,
}

impl Backend for MemBackend {
    type Error = backend::Error;

    fn kind(&self) -> BackendType {
        BackendType::SdCard
    }

    fn open(&mut self) -> core::result::Result<(), backend::Error> {
        self.closed = false;
        Ok(())
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> core::result::Result<(), backend::Error> {
        let off = offset as usize;
        let src = self.data.get(off..off + buf.len()).ok_or(backend::Error::OutOfRange)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn ioctl(&mut self, cmd: Ioctl) -> core::result::Result<u32, backend::Error> {
        if let Ioctl::ReportProgress(p) = cmd {
            self.progress.push(p);
        }
        Ok(0)
    }

    fn close(&mut self) -> core::result::Result<(), backend::Error> {
        self.closed = true;
        Ok(())
    }
}

fn version(code: u32) -> FwVersion {
    FwVersion {
        version_code: code,
        version_res: 0,
        version_name: String::try_from("watch_v2").unwrap(),
        board_name: String::try_from("ats3089").unwrap(),
    }
}

fn build(files: &[(&str, &[u8])]) -> StdVec<u8> {
    let mut data = StdVec::new();
    let mut dir = StdVec::new();
    for (name, body) in files {
        dir.push(DirEntry {
            name: String::try_from(*name).unwrap(),
            offset: (IMAGE_HEADER_SIZE + data.len()) as u32,
            length: body.len() as u32,
            checksum: crc32fast::hash(body),
        });
        data.extend_from_slice(body);
    }
    let header = ImageHeader {
        header_version: IMAGE_HEADER_VERSION,
        data_offset: IMAGE_HEADER_SIZE as u16,
        data_size: (IMAGE_HEADER_SIZE + data.len()) as u32,
        data_checksum: crc32fast::hash(&data),
        ..Default::default()
    };
    let mut image = pack_header(&header, &version(0x200), &FwVersion::default(), &dir)
        .unwrap()
        .to_vec();
    image.extend_from_slice(&data);
    image
}

fn open(data: StdVec<u8>) -> (OtaImage<MemBackend>, Result<()>) {
    let mut img = OtaImage::new(MemBackend {
        data,
        progress: StdVec::new(),
        closed: false,
    });
    let r = img.open();
    (img, r)
}

#[test]
fn test_open_parses_directory_and_versions() {
    let (img, r) = open(build(&[("ota.xml", b"<ota/>"), ("app.bin", &[7u8; 300])]));
    r.unwrap();
    assert_eq!(img.dir().len(), 2);
    assert_eq!(img.file_offset("ota.xml"), Some(0x400));
    assert_eq!(img.file_offset("app.bin"), Some(0x406));
    assert_eq!(img.file_length("app.bin"), Some(300));
    assert_eq!(img.file_offset("missing"), None);
    assert_eq!(img.file_offset(""), Some(0));
    assert_eq!(img.new_version().version_code, 0x200);
    assert_eq!(img.new_version().board_name.as_str(), "ats3089");
    assert_eq!(img.image_size(), 0x400 + 306);
}

#[test]
fn test_corrupt_header_is_rejected_and_backend_closed() {
    let mut raw = build(&[("app.bin", &[1u8; 16])]);
    raw[0x210] ^= 0xFF;
    let (img, r) = open(raw);
    assert_eq!(r, Err(Error::Protocol(ProtocolError::BadImageHeader)));
    assert!(img.backend().closed);
    assert!(!img.is_open());
}

#[test]
fn test_wrong_magic_is_rejected() {
    let mut raw = build(&[("app.bin", &[1u8; 16])]);
    raw[0] = b'X';
    let (_, r) = open(raw);
    assert_eq!(r, Err(Error::Protocol(ProtocolError::BadImageHeader)));
}

#[test]
fn test_check_data_detects_payload_corruption() {
    let mut raw = build(&[("app.bin", &[0x5Au8; 5000])]);
    let (mut img, r) = open(raw.clone());
    r.unwrap();
    img.check_data().unwrap();

    let last = raw.len() - 1;
    raw[last] ^= 1;
    let (mut img, r) = open(raw);
    r.unwrap();
    assert_eq!(img.check_data(), Err(Error::ImageCorrupt));
}

#[test]
fn test_check_file_against_directory() {
    let (img, r) = open(build(&[("app.bin", b"hello")]));
    r.unwrap();
    assert_eq!(img.check_file("app.bin", b"hello"), Ok(()));
    assert_eq!(img.check_file("app.bin", b"hellO"), Err(Error::ImageCorrupt));
    assert_eq!(img.check_file("x.bin", b"hello"), Err(Error::MissingFile));
}

#[test]
fn test_progress_is_capped_until_final() {
    let (mut img, r) = open(build(&[("app.bin", &[0u8; 1000])]));
    r.unwrap();
    img.progress_on(1000, 500);
    assert_eq!(img.progress(), Some(50));
    img.report_progress(250, false);
    img.report_progress(250, false);
    assert_eq!(img.backend().progress, [75u8, 99]);
    img.report_progress(0, true);
    assert_eq!(img.backend().progress.last(), Some(&100));

    img.progress_reset();
    assert_eq!(img.progress(), Some(0));
}

#[test]
fn test_reads_before_progress_on_are_not_reported() {
    let (mut img, r) = open(build(&[("app.bin", &[0u8; 64])]));
    r.unwrap();
    let mut buf = [0u8; 64];
    img.read(0x400, &mut buf).unwrap();
    assert!(img.backend().progress.is_empty());
    assert_eq!(
        img.read(0x10_0000, &mut buf),
        Err(Error::TransportRead { offset: 0x10_0000 })
    );
}
