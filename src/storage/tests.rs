use super::ram::RamFlash;
use super::*;

const SECTOR: u32 = 512;
const BLOCK: u32 = 4096;

fn flash() -> RamFlash<16384> {
    RamFlash::new(0, SECTOR)
}

#[test]
fn test_alignment_helpers() {
    assert_eq!(align_down(0x1234, 0x1000), 0x1000);
    assert_eq!(align_up(0x1234, 0x1000), 0x2000);
    assert_eq!(align_up(0x2000, 0x1000), 0x2000);
    assert_eq!(align_down(511, 512), 0);
}

#[test]
fn test_is_clean_detects_single_programmed_byte() {
    let mut flash = flash();
    let mut scratch = [0u8; 64];
    assert_eq!(is_clean(&mut flash, 0, 16384, &mut scratch), Ok(true));

    flash.write(9000, &[0xFE]).unwrap();
    assert_eq!(is_clean(&mut flash, 0, 8192, &mut scratch), Ok(true));
    assert_eq!(is_clean(&mut flash, 8192, 1024, &mut scratch), Ok(false));
}

#[test]
fn test_erase_widens_to_sector_bounds() {
    let mut flash = flash();
    flash.write(1000, &[0u8; 100]).unwrap();
    erase(&mut flash, 1000, 10).unwrap();
    assert!(flash.as_slice()[512..1024].iter().all(|b| *b == 0xFF));
    assert_eq!(flash.as_slice()[1050], 0x00);
    assert_eq!(flash.erase_count(), 1);
}

#[test]
fn test_erase_if_dirty_elides_clean_ranges() {
    let mut flash = flash();
    let mut scratch = [0u8; 128];
    assert_eq!(erase_if_dirty(&mut flash, 0, 16384, &mut scratch), Ok(false));
    assert_eq!(flash.erase_count(), 0);

    flash.write(4096, &[0x00; 4]).unwrap();
    assert_eq!(erase_if_dirty(&mut flash, 0, 16384, &mut scratch), Ok(true));
    assert_eq!(flash.erase_count(), 1);
    assert_eq!(erase_if_dirty(&mut flash, 0, 16384, &mut scratch), Ok(false));
    assert_eq!(flash.erase_count(), 1);
}

#[test]
fn test_device_errors_map_to_storage_op() {
    let mut flash = flash();
    let mut buf = [0u8; 4];
    assert_eq!(
        read(&mut flash, 16383, &mut buf),
        Err(crate::error::Error::Storage {
            op: crate::error::StorageOp::Read,
            addr: 16383
        })
    );
    assert!(matches!(
        write(&mut flash, 16384, &buf),
        Err(crate::error::Error::Storage {
            op: crate::error::StorageOp::Write,
            ..
        })
    ));
}

#[test]
fn test_nor_write_only_clears_bits() {
    let mut flash = flash();
    flash.write(0, &[0xF0]).unwrap();
    flash.write(0, &[0x0F]).unwrap();
    assert_eq!(flash.as_slice()[0], 0x00);
}

#[test]
fn test_storage_set_lookup_by_id() {
    let mut set = [RamFlash::<1024>::new(0, SECTOR), RamFlash::<1024>::new(3, SECTOR)];
    assert_eq!(set.find(3).map(|f| f.storage_id()), Some(3));
    assert!(set.find(1).is_none());
}

#[test]
fn test_plan_first_region_extends_to_block_boundary() {
    // File area starts mid-block, the first chunk crosses into the block body.
    let span = plan_stream_erase(0x0800, 0x8000, 0x0800, 0x1000, SECTOR, BLOCK).unwrap();
    assert_eq!(span.region, EraseRegion::First);
    assert_eq!(span.addr, 0x0800);
    assert_eq!(span.len, 0x2000 - 0x0800);
}

#[test]
fn test_plan_middle_region_snaps_to_blocks() {
    let span = plan_stream_erase(0, 0x10000, 0x1000, 0x1000, SECTOR, BLOCK).unwrap();
    assert_eq!(
        span,
        EraseSpan {
            region: EraseRegion::Middle,
            addr: 0x1000,
            len: 0x1000
        }
    );

    // Chunk inside a block already erased ahead of the cursor.
    assert_eq!(plan_stream_erase(0, 0x10000, 0x1200, 0x200, SECTOR, BLOCK), None);

    // Chunk crossing into the next block erases only that block.
    let span = plan_stream_erase(0, 0x10000, 0x1E00, 0x400, SECTOR, BLOCK).unwrap();
    assert_eq!((span.addr, span.len), (0x2000, 0x1000));
}

#[test]
fn test_plan_last_region_clipped_to_area() {
    let span = plan_stream_erase(0, 0x2600, 0x2000, 0x800, SECTOR, BLOCK).unwrap();
    assert_eq!(span.region, EraseRegion::Last);
    assert_eq!((span.addr, span.len), (0x2000, 0x600));
}

#[test]
fn test_plan_never_reaches_below_an_unaligned_cursor() {
    // Area smaller than one erase block; the previous chunk ended mid-sector
    // at 0x62BC and that sector holds its tail.
    let span = plan_stream_erase(0x6000, 0x4000, 0x62BC, 700, SECTOR, 0x10000).unwrap();
    assert_eq!(span.region, EraseRegion::First);
    assert_eq!((span.addr, span.len), (0x6400, 0x0200));

    // A chunk ending inside the cursor's sector needs no erase at all.
    assert_eq!(plan_stream_erase(0x6000, 0x4000, 0x6210, 0x100, SECTOR, 0x10000), None);

    // Same in the tail after the last whole block.
    let span = plan_stream_erase(0, 0x1800, 0x1100, 0x300, SECTOR, BLOCK).unwrap();
    assert_eq!(span.region, EraseRegion::Last);
    assert_eq!((span.addr, span.len), (0x1200, 0x200));
}

#[test]
fn test_zero_erase_alignment_is_rejected() {
    let mut flash: RamFlash<4096> = RamFlash::new(0, 0);
    assert_eq!(erase_align(&flash), Err(Error::Config));
    assert_eq!(erase(&mut flash, 0, 512), Err(Error::Config));
    let mut scratch = [0u8; 64];
    assert_eq!(erase_if_dirty(&mut flash, 0, 512, &mut scratch), Err(Error::Config));
}
