//! LZ4 block format decoder.
//!
//! Only the raw block format is understood (no frame header, no checksums);
//! the OTA block header carries sizes instead. Output goes to a [`Sink`] so
//! the decoder itself never indexes the output buffer.

pub trait Sink {
    fn literal(&mut self, data: &[u8]) -> Option<()>;
    fn backref(&mut self, offset: usize, length: usize) -> Option<()>;
}

fn extend_length<'a>(len: usize, it: &mut impl Iterator<Item = &'a u8>) -> Option<usize> {
    let mut length: usize = len;
    if length == 15 {
        loop {
            let len = it.next().map(|x| *x as usize)?;
            length = length.checked_add(len)?;
            if len != 255 {
                break;
            }
        }
    }
    Some(length)
}

/// Decode one block. `None` on truncated or malformed input, or when the
/// sink refuses data.
pub fn decompress(source: &[u8], sink: &mut impl Sink) -> Option<()> {
    let mut it = source.iter();

    loop {
        let token = it.next().map(|x| *x as usize)?;

        let literal_len = token >> 4;
        let match_len = token & 0x0f;

        let literal_len = extend_length(literal_len, &mut it)?;

        let (literals, more) = it.as_slice().split_at_checked(literal_len)?;

        sink.literal(literals)?;

        it = more.iter();

        let Some(offset_lsb) = it.next().map(|x| *x as usize) else {
            // last sequence carries literals only
            return Some(());
        };

        let offset_msb = it.next().map(|x| *x as usize)?;

        let offset = (offset_msb << 8) | offset_lsb;

        let match_len = extend_length(match_len, &mut it)?.checked_add(4)?;

        sink.backref(offset, match_len)?;
    }
}

/// Sink writing into a fixed output buffer.
pub struct SliceSink<'a> {
    buffer: &'a mut [u8],
    length: usize,
}

impl<'a> SliceSink<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, length: 0 }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl Sink for SliceSink<'_> {
    fn literal(&mut self, data: &[u8]) -> Option<()> {
        let end = self.length.checked_add(data.len())?;
        self.buffer.get_mut(self.length..end)?.copy_from_slice(data);
        self.length = end;
        Some(())
    }

    fn backref(&mut self, offset: usize, length: usize) -> Option<()> {
        if offset == 0 || offset > self.length {
            return None;
        }
        let end = self.length.checked_add(length)?;
        if end > self.buffer.len() {
            return None;
        }
        // overlapping copies repeat the window, so go byte by byte
        let from = self.length - offset;
        for i in 0..length {
            self.buffer[self.length + i] = self.buffer[from + i];
        }
        self.length = end;
        Some(())
    }
}

/// Decode `source` into `out`, returning the decoded length.
pub fn decompress_into(source: &[u8], out: &mut [u8]) -> Option<usize> {
    let mut sink = SliceSink::new(out);
    decompress(source, &mut sink)?;
    Some(sink.len())
}
