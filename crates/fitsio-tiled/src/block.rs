//! Fixed 2880-byte record layout shared by headers and data units.

use std::io::Write;

use crate::error::Result;

/// Every header and data unit occupies a whole number of these.
pub const BLOCK_SIZE: usize = 2880;

/// One header card.
pub const CARD_SIZE: usize = 80;

pub const CARDS_PER_BLOCK: usize = BLOCK_SIZE / CARD_SIZE;

/// Headers are filled with ASCII blanks.
pub const HEADER_PAD_BYTE: u8 = b' ';

/// Data units are filled with zeros.
pub const DATA_PAD_BYTE: u8 = 0;

/// Length of `len` bytes rounded up to whole blocks. An empty unit takes no blocks.
pub const fn padded_byte_len(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// Fill bytes needed after `len` bytes.
pub const fn padding_len(len: usize) -> usize {
    padded_byte_len(len) - len
}

/// Complete a unit of `written` bytes with `fill`, returning how many bytes were added.
pub fn write_padding<W: Write>(writer: &mut W, written: usize, fill: u8) -> Result<usize> {
    let n = padding_len(written);
    if n > 0 {
        writer.write_all(&vec![fill; n])?;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_holds_36_cards() {
        assert_eq!(CARDS_PER_BLOCK, 36);
        assert_eq!(CARDS_PER_BLOCK * CARD_SIZE, BLOCK_SIZE);
    }

    // ---- rounding ----

    #[test]
    fn empty_unit_takes_no_blocks() {
        assert_eq!(padded_byte_len(0), 0);
        assert_eq!(padding_len(0), 0);
    }

    #[test]
    fn rounds_up_to_whole_blocks() {
        for (len, padded) in [(1, 2880), (2880, 2880), (2881, 5760), (5760, 5760), (5761, 8640)] {
            assert_eq!(padded_byte_len(len), padded, "{len}");
            assert_eq!(padding_len(len), padded - len, "{len}");
        }
    }

    // ---- write_padding ----

    #[test]
    fn pads_a_partial_data_block() {
        let mut out = Vec::new();
        let n = write_padding(&mut out, 2 * BLOCK_SIZE + 100, DATA_PAD_BYTE).unwrap();
        assert_eq!(n, BLOCK_SIZE - 100);
        assert_eq!(out, vec![0u8; BLOCK_SIZE - 100]);
    }

    #[test]
    fn aligned_unit_gets_nothing() {
        let mut out = Vec::new();
        assert_eq!(write_padding(&mut out, BLOCK_SIZE, HEADER_PAD_BYTE).unwrap(), 0);
        assert!(out.is_empty());
    }
}
