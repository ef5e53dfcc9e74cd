//! MSB-first bit packing shared by the Rice and H-compress codecs.

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    acc: u8,
    used: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        BitWriter::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        BitWriter {
            bytes: Vec::with_capacity(bytes),
            ..BitWriter::default()
        }
    }

    pub fn write_bit(&mut self, bit: bool) {
        self.acc = (self.acc << 1) | bit as u8;
        self.used += 1;
        if self.used == 8 {
            self.bytes.push(self.acc);
            self.acc = 0;
            self.used = 0;
        }
    }

    /// Write the low `n` bits of `value`, most significant first.
    pub fn write_bits(&mut self, value: u64, n: u32) {
        debug_assert!(n <= 64);
        for i in (0..n).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    /// `n` zero bits followed by a one.
    pub fn write_unary(&mut self, n: u64) {
        for _ in 0..n {
            self.write_bit(false);
        }
        self.write_bit(true);
    }

    /// Raw bytes at the current position; the writer must be byte aligned.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.used == 0 {
            self.bytes.extend_from_slice(bytes);
        } else {
            bytes.iter().for_each(|&b| self.write_bits(b as u64, 8));
        }
    }

    /// Flush a partial byte, padding its low bits with zeros.
    pub fn align(&mut self) {
        if self.used > 0 {
            self.bytes.push(self.acc << (8 - self.used));
            self.acc = 0;
            self.used = 0;
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.align();
        self.bytes
    }
}

#[derive(Debug)]
pub(crate) struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    bit: u32,
}

impl<'a> BitReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        BitReader { bytes, pos: 0, bit: 0 }
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| Error::InvalidStream("compressed data ends early".into()))?;
        let bit = (byte >> (7 - self.bit)) & 1 == 1;
        self.bit += 1;
        if self.bit == 8 {
            self.bit = 0;
            self.pos += 1;
        }
        Ok(bit)
    }

    pub fn read_bits(&mut self, n: u32) -> Result<u64> {
        debug_assert!(n <= 64);
        let mut v = 0u64;
        for _ in 0..n {
            v = (v << 1) | self.read_bit()? as u64;
        }
        Ok(v)
    }

    /// Count zero bits up to and including the next one bit.
    pub fn read_unary(&mut self, limit: u64) -> Result<u64> {
        let mut n = 0u64;
        while !self.read_bit()? {
            n += 1;
            if n > limit {
                return Err(Error::InvalidStream("unary code too long".into()));
            }
        }
        Ok(n)
    }

    /// Skip to the next byte boundary.
    pub fn align(&mut self) {
        if self.bit > 0 {
            self.bit = 0;
            self.pos += 1;
        }
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.align();
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.bytes.len())
            .ok_or_else(|| Error::InvalidStream("compressed data ends early".into()))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_msb_first() {
        let mut w = BitWriter::new();
        w.write_bits(0b101, 3);
        w.write_unary(2);
        w.write_bits(0xAB, 8);
        let bytes = w.finish();
        assert_eq!(bytes, vec![0b1010_0110, 0b1010_1100]);

        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_bits(3).unwrap(), 0b101);
        assert_eq!(r.read_unary(64).unwrap(), 2);
        assert_eq!(r.read_bits(8).unwrap(), 0xAB);
    }

    #[test]
    fn reading_past_end_is_invalid_stream() {
        let mut r = BitReader::new(&[0xFF]);
        assert_eq!(r.read_bits(8).unwrap(), 0xFF);
        assert!(matches!(r.read_bit(), Err(Error::InvalidStream(_))));
    }

    #[test]
    fn sixty_four_bit_values() {
        let mut w = BitWriter::new();
        w.write_bit(true);
        w.write_bits(u64::MAX - 5, 64);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert!(r.read_bit().unwrap());
        assert_eq!(r.read_bits(64).unwrap(), u64::MAX - 5);
    }

    #[test]
    fn byte_reads_align() {
        let mut w = BitWriter::new();
        w.write_bits(1, 2);
        w.align();
        w.write_bytes(&[7, 8]);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_bits(2).unwrap(), 1);
        assert_eq!(r.read_bytes(2).unwrap(), &[7, 8]);
        assert!(r.read_bytes(1).is_err());
    }
}
