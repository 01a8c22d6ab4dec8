use super::error::Error;
use super::{BlockingErase, FlashStorage, ReadStorage, Storage};

/// RAM-backed flash of `N` bytes.
///
/// Programming follows NOR rules: a write can only clear bits, so writing
/// over data that was not erased first corrupts it the way real flash
/// would. Erases must be sector aligned. The device counts erase calls and
/// programmed bytes, which makes it handy on a host for exercising upgrade
/// flows.
#[derive(Debug, Clone)]
pub struct RamFlash<const N: usize> {
    buf: [u8; N],
    storage_id: u8,
    sector_size: u32,
    erase_count: u32,
    bytes_written: u64,
}

impl<const N: usize> RamFlash<N> {
    /// A fully erased device.
    pub fn new(storage_id: u8, sector_size: u32) -> Self {
        Self {
            buf: [0xFF; N],
            storage_id,
            sector_size,
            erase_count: 0,
            bytes_written: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Overwrite contents directly, bypassing NOR rules and counters.
    pub fn load(&mut self, offset: u32, data: &[u8]) {
        let off = offset as usize;
        self.buf[off..off + data.len()].copy_from_slice(data);
    }

    pub fn erase_count(&self) -> u32 {
        self.erase_count
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn reset_counters(&mut self) {
        self.erase_count = 0;
        self.bytes_written = 0;
    }
}

impl<const N: usize> ReadStorage for RamFlash<N> {
    type Error = Error;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let off = offset as usize;
        if off + bytes.len() > N {
            return Err(Error::OutOfBounds);
        }
        bytes.copy_from_slice(&self.buf[off..off + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Storage for RamFlash<N> {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let off = offset as usize;
        if off + bytes.len() > N {
            return Err(Error::OutOfBounds);
        }
        for (dst, src) in self.buf[off..off + bytes.len()].iter_mut().zip(bytes) {
            *dst &= *src;
        }
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }
}

impl<const N: usize> BlockingErase for RamFlash<N> {
    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from % self.sector_size != 0 || to % self.sector_size != 0 {
            return Err(Error::Misaligned);
        }
        let (f, t) = (from as usize, to as usize);
        if f > t || t > N {
            return Err(Error::OutOfBounds);
        }
        self.buf[f..t].fill(0xFF);
        self.erase_count += 1;
        Ok(())
    }
}

impl<const N: usize> FlashStorage for RamFlash<N> {
    fn storage_id(&self) -> u8 {
        self.storage_id
    }

    fn erase_align(&self) -> u32 {
        self.sector_size
    }
}
