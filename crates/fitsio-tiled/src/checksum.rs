//! FITS CHECKSUM and DATASUM keyword support.
//!
//! Implements the ones'-complement 32-bit checksum convention: the sum of all
//! big-endian 32-bit words of a unit, with end-around carry, and its
//! 16-character printable encoding.

use crate::error::{Error, Result};
use crate::header::{Card, Header};
use crate::value::Value;

/// Placeholder CHECKSUM value used while the header sum is computed.
pub const CHECKSUM_PLACEHOLDER: &str = "0000000000000000";

const CHECKSUM_COMMENT: &str = "HDU checksum";
const DATASUM_COMMENT: &str = "data unit checksum";

// ---------------------------------------------------------------------------
// Ones'-complement sums
// ---------------------------------------------------------------------------

fn fold(mut sum: u64) -> u32 {
    while sum >> 32 != 0 {
        sum = (sum & 0xFFFF_FFFF) + (sum >> 32);
    }
    sum as u32
}

/// Ones'-complement addition of two checksums.
pub fn sum_of(a: u32, b: u32) -> u32 {
    fold(a as u64 + b as u64)
}

/// The checksum that, added to `b`, gives `sum`.
pub fn difference_of(sum: u32, b: u32) -> u32 {
    sum_of(sum, !b)
}

/// Incremental checksum over a byte stream of any chunking.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    sum: u64,
    pending: [u8; 4],
    npending: usize,
}

impl Accumulator {
    pub fn new() -> Self {
        Accumulator::default()
    }

    pub fn update(&mut self, mut bytes: &[u8]) {
        if self.npending > 0 {
            let take = (4 - self.npending).min(bytes.len());
            self.pending[self.npending..self.npending + take].copy_from_slice(&bytes[..take]);
            self.npending += take;
            bytes = &bytes[take..];
            if self.npending < 4 {
                return;
            }
            self.add_word(u32::from_be_bytes(self.pending));
            self.npending = 0;
        }
        let mut words = bytes.chunks_exact(4);
        for w in &mut words {
            self.add_word(u32::from_be_bytes([w[0], w[1], w[2], w[3]]));
        }
        let rest = words.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
        self.npending = rest.len();
    }

    fn add_word(&mut self, word: u32) {
        self.sum += word as u64;
        if self.sum >> 62 != 0 {
            self.sum = fold(self.sum) as u64;
        }
    }

    /// Final sum; a trailing partial word is zero padded.
    pub fn finish(&self) -> u32 {
        let mut sum = self.sum;
        if self.npending > 0 {
            let mut last = [0u8; 4];
            last[..self.npending].copy_from_slice(&self.pending[..self.npending]);
            sum += u32::from_be_bytes(last) as u64;
        }
        fold(sum)
    }
}

/// Checksum of a byte sequence of any length.
pub fn checksum(bytes: &[u8]) -> u32 {
    let mut acc = Accumulator::new();
    acc.update(bytes);
    acc.finish()
}

// ---------------------------------------------------------------------------
// ASCII encoding
// ---------------------------------------------------------------------------

/// Punctuation between digits, upper and lower case letters.
const EXCLUDE: [u8; 13] = [
    b':', b';', b'<', b'=', b'>', b'?', b'@', b'[', b'\\', b']', b'^', b'_', b'`',
];
const ASCII_OFFSET: i32 = 0x30;

/// Encode a checksum (or its complement) as 16 printable characters.
pub fn encode(sum: u32, complement: bool) -> String {
    let value = if complement { !sum } else { sum };
    let mut asc = [0u8; 16];
    for (i, byte) in value.to_be_bytes().into_iter().enumerate() {
        let quotient = byte as i32 / 4 + ASCII_OFFSET;
        let mut ch = [quotient; 4];
        ch[0] += byte as i32 % 4;
        for pair in ch.chunks_exact_mut(2) {
            while EXCLUDE.iter().any(|&x| pair[0] == x as i32 || pair[1] == x as i32) {
                pair[0] += 1;
                pair[1] -= 1;
            }
        }
        for (j, c) in ch.into_iter().enumerate() {
            asc[4 * j + i] = c as u8;
        }
    }
    // Rotate right by one character.
    (0..16).map(|i| asc[(i + 15) % 16] as char).collect()
}

/// Decode a 16-character checksum string.
pub fn decode(text: &str, complement: bool) -> Result<u32> {
    let bytes = text.as_bytes();
    if bytes.len() != 16 {
        return Err(Error::InvalidChecksumLength(bytes.len()));
    }
    // the encoding only emits digits and letters
    if let Some(&bad) = bytes.iter().find(|&&b| !b.is_ascii_alphanumeric()) {
        return Err(Error::InvalidChecksumCharacter(bad));
    }
    let mut hi: u32 = 0;
    let mut lo: u32 = 0;
    for k in (0..16).step_by(4) {
        let c = |n: usize| bytes[(k + n + 1) % 16] as u32 - ASCII_OFFSET as u32;
        hi += (c(0) << 8) + c(1);
        lo += (c(2) << 8) + c(3);
    }
    while (hi | lo) >> 16 != 0 {
        let (hc, lc) = (hi >> 16, lo >> 16);
        hi = (hi & 0xFFFF) + lc;
        lo = (lo & 0xFFFF) + hc;
    }
    let sum = (hi << 16) | lo;
    Ok(if complement { !sum } else { sum })
}

// ---------------------------------------------------------------------------
// Header keywords
// ---------------------------------------------------------------------------

/// Outcome of a checksum verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStatus {
    Valid,
    /// DATASUM does not match the data.
    DataMismatch,
    /// The data matches but the whole unit does not sum to zero.
    HeaderMismatch,
}

/// Encoded CHECKSUM value, if present.
pub fn stored_checksum(header: &Header) -> Option<&str> {
    header.get_str("CHECKSUM")
}

/// DATASUM value, if present. It is a decimal string but bare integers are accepted.
pub fn stored_datasum(header: &Header) -> Result<Option<u32>> {
    let parsed = match header.get("DATASUM") {
        None => return Ok(None),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(Value::Integer(n)) => u64::try_from(*n).ok(),
        Some(_) => None,
    };
    match parsed {
        Some(n) if n <= u32::MAX as u64 => Ok(Some(n as u32)),
        _ => Err(Error::InvalidValue("DATASUM".into())),
    }
}

/// Add a placeholder CHECKSUM card when none exists. An existing value is kept.
pub fn ensure_checksum_keyword(header: &mut Header) {
    if !header.contains("CHECKSUM") {
        header.push(Card::new("CHECKSUM", CHECKSUM_PLACEHOLDER, Some(CHECKSUM_COMMENT)));
    }
}

/// Write DATASUM and CHECKSUM so the unit (header plus data with sum
/// `datasum`) sums to all ones.
pub fn stamp(header: &mut Header, datasum: u32) -> Result<()> {
    if header.contains("DATASUM") {
        header.set("DATASUM", datasum.to_string());
    } else {
        header.push(Card::new("DATASUM", datasum.to_string(), Some(DATASUM_COMMENT)));
    }
    if header.contains("CHECKSUM") {
        header.set("CHECKSUM", CHECKSUM_PLACEHOLDER);
    } else {
        header.push(Card::new("CHECKSUM", CHECKSUM_PLACEHOLDER, Some(CHECKSUM_COMMENT)));
    }
    let header_sum = checksum(&header.to_bytes()?);
    let total = sum_of(header_sum, datasum);
    header.set("CHECKSUM", encode(total, true));
    Ok(())
}

/// Check the stored keywords against the header and a data sum.
pub fn verify(header: &Header, datasum: u32) -> Result<ChecksumStatus> {
    if stored_checksum(header).is_none() {
        return Err(Error::MissingChecksum("CHECKSUM"));
    }
    let stored = stored_datasum(header)?.ok_or(Error::MissingChecksum("DATASUM"))?;
    if stored != datasum {
        return Ok(ChecksumStatus::DataMismatch);
    }
    let total = sum_of(checksum(&header.to_bytes()?), datasum);
    if total == u32::MAX || total == 0 {
        Ok(ChecksumStatus::Valid)
    } else {
        Ok(ChecksumStatus::HeaderMismatch)
    }
}
