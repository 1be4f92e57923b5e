//! Bit cursors over a byte buffer.
//!
//! Bits are addressed LSB-first within each byte, so bit `n` lives in byte `n / 8` at mask
//! `1 << (n % 8)`. A nibblet is an 8-bit value written the same way, lowest bit first.

/// Width in bits of a nibblet. Large enough to index every bit of a [`GameInput`](crate::frame_info::GameInput).
pub const NIBBLET_SIZE: usize = 8;

/// Appends bits to a growable byte buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitWriter {
    bytes: Vec<u8>,
    offset: usize,
}

impl BitWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preallocates room for `bits` bits.
    #[must_use]
    pub fn with_capacity(bits: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(bits.div_ceil(8)),
            offset: 0,
        }
    }

    /// Number of bits written so far.
    #[inline]
    #[must_use]
    pub fn num_bits(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn set_bit(&mut self) {
        self.write_bit(true);
    }

    #[inline]
    pub fn clear_bit(&mut self) {
        self.write_bit(false);
    }

    #[inline]
    pub fn write_bit(&mut self, value: bool) {
        let byte_index = self.offset / 8;
        if byte_index == self.bytes.len() {
            self.bytes.push(0);
        }
        if value {
            self.bytes[byte_index] |= 1 << (self.offset % 8);
        }
        self.offset += 1;
    }

    pub fn write_nibblet(&mut self, nibblet: u8) {
        for i in 0..NIBBLET_SIZE {
            self.write_bit(nibblet & (1 << i) != 0);
        }
    }

    /// The written bytes. Unused bits of the last byte are zero.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Reads bits from a byte slice, stopping at a declared bit count.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    bytes: &'a [u8],
    offset: usize,
    num_bits: usize,
}

impl<'a> BitReader<'a> {
    /// Creates a reader over the first `num_bits` bits of `bytes`.
    ///
    /// `num_bits` is clamped to what `bytes` can actually hold.
    #[must_use]
    pub fn new(bytes: &'a [u8], num_bits: usize) -> Self {
        Self {
            bytes,
            offset: 0,
            num_bits: num_bits.min(bytes.len() * 8),
        }
    }

    /// Current read position in bits.
    #[inline]
    #[must_use]
    pub fn position(&self) -> usize {
        self.offset
    }

    #[inline]
    #[must_use]
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// True once every declared bit has been consumed.
    #[inline]
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.offset >= self.num_bits
    }

    /// Reads one bit, or `None` past the end of the stream.
    #[inline]
    pub fn read_bit(&mut self) -> Option<bool> {
        if self.is_exhausted() {
            return None;
        }
        let byte = self.bytes.get(self.offset / 8)?;
        let value = byte & (1 << (self.offset % 8)) != 0;
        self.offset += 1;
        Some(value)
    }

    pub fn read_nibblet(&mut self) -> Option<u8> {
        let mut nibblet = 0u8;
        for i in 0..NIBBLET_SIZE {
            if self.read_bit()? {
                nibblet |= 1 << i;
            }
        }
        Some(nibblet)
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_lsb_first() {
        let mut writer = BitWriter::new();
        writer.set_bit();
        writer.clear_bit();
        writer.set_bit();
        assert_eq!(writer.num_bits(), 3);
        assert_eq!(writer.as_bytes(), &[0b0000_0101]);
    }

    #[test]
    fn nibblet_spans_bytes() {
        let mut writer = BitWriter::new();
        writer.set_bit();
        writer.write_nibblet(0xA5);
        assert_eq!(writer.num_bits(), 9);
        // 0xA5 shifted left by one, carry into the second byte.
        assert_eq!(writer.as_bytes(), &[0x4B, 0x01]);

        let bytes = writer.into_bytes();
        let mut reader = BitReader::new(&bytes, 9);
        assert_eq!(reader.read_bit(), Some(true));
        assert_eq!(reader.read_nibblet(), Some(0xA5));
        assert!(reader.is_exhausted());
    }

    #[test]
    fn reader_stops_at_declared_length() {
        let bytes = [0xFF];
        let mut reader = BitReader::new(&bytes, 3);
        assert_eq!(reader.read_bit(), Some(true));
        assert_eq!(reader.read_bit(), Some(true));
        assert_eq!(reader.read_bit(), Some(true));
        assert_eq!(reader.read_bit(), None);
        assert_eq!(reader.position(), 3);
    }

    #[test]
    fn reader_clamps_declared_length_to_buffer() {
        let bytes = [0u8; 2];
        let mut reader = BitReader::new(&bytes, 100);
        assert_eq!(reader.num_bits(), 16);
        assert!(reader.read_nibblet().is_some());
        assert!(reader.read_nibblet().is_some());
        assert!(reader.read_nibblet().is_none());
    }

    #[test]
    fn truncated_nibblet_is_none() {
        let bytes = [0xFF];
        let mut reader = BitReader::new(&bytes, 5);
        assert_eq!(reader.read_nibblet(), None);
    }
}
