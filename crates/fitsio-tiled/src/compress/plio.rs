//! IRAF pixel-list (line list) coding of non-negative integer masks (`PLIO_1`).
//!
//! A line list is a sequence of 16-bit words. Each word carries a 4-bit
//! opcode and 12 bits of data; the 7-word header records the list length.

use crate::error::{Error, Result};

/// Largest value a line list can carry, exclusive.
pub const MAX_VALUE: i64 = 1 << 24;

const HEADER_LEN: usize = 7;
const MAX_RUN: usize = 4095;

const OP_ZERO_RUN: u16 = 0;
const OP_SET_HIGH: u16 = 1;
const OP_INC: u16 = 2;
const OP_DEC: u16 = 3;
const OP_RUN: u16 = 4;
const OP_ZERO_RUN_PIXEL: u16 = 5;
const OP_INC_PIXEL: u16 = 6;
const OP_DEC_PIXEL: u16 = 7;

fn word(op: u16, data: usize) -> i16 {
    ((op << 12) | data as u16) as i16
}

fn push_runs(words: &mut Vec<i16>, op: u16, mut n: usize) {
    while n > 0 {
        let k = n.min(MAX_RUN);
        words.push(word(op, k));
        n -= k;
    }
}

/// Encode `values` as a line list of 16-bit words.
pub fn encode(values: &[i64]) -> Result<Vec<i16>> {
    if let Some(&bad) = values.iter().find(|&&v| !(0..MAX_VALUE).contains(&v)) {
        return Err(Error::ValueOutOfRange(bad));
    }
    let mut words: Vec<i16> = vec![0, HEADER_LEN as i16, -100, 0, 0, 0, 0];
    let n = values.len();

    let mut hi = 1i64;
    let mut pv = values.first().copied().unwrap_or(0);
    let mut x1 = 0usize;
    let mut iz = 0usize;

    for ip in 0..n {
        let nv = values.get(ip + 1).copied();
        match nv {
            Some(nv) if nv == pv => continue,
            Some(nv) if pv == 0 => {
                pv = nv;
                x1 = ip + 1;
                continue;
            }
            None if pv == 0 => x1 = n,
            _ => {}
        }

        // pixels of value pv in x1..=ip, preceded by zeros in iz..x1
        let np = ip + 1 - x1;
        let nz = x1 - iz;
        let mut single_done = false;

        if pv > 0 && pv != hi {
            let dv = pv - hi;
            hi = pv;
            if dv.abs() > MAX_RUN as i64 {
                words.push(word(OP_SET_HIGH, (pv & 4095) as usize));
                words.push((pv >> 12) as i16);
            } else {
                let op = if dv < 0 { OP_DEC } else { OP_INC };
                words.push(word(op, dv.unsigned_abs() as usize));
                if np == 1 && nz == 0 {
                    if let Some(last) = words.last_mut() {
                        *last |= word(OP_RUN, 0);
                    }
                    single_done = true;
                }
            }
        }

        if !single_done && nz > 0 {
            push_runs(&mut words, OP_ZERO_RUN, nz);
            if np == 1 && pv > 0 {
                if let Some(last) = words.last_mut().filter(|w| (**w as usize) < MAX_RUN) {
                    *last = word(OP_ZERO_RUN_PIXEL, *last as usize + 1);
                    single_done = true;
                }
            }
        }
        if !single_done {
            push_runs(&mut words, OP_RUN, np);
        }

        x1 = ip + 1;
        iz = x1;
        if let Some(nv) = nv {
            pv = nv;
        }
    }

    let len = words.len();
    words[3] = (len % 32768) as i16;
    words[4] = (len / 32768) as i16;
    Ok(words)
}

/// Decode a line list into `out`; pixels past the end of the list are zero.
pub fn decode(words: &[i16], out: &mut [i64]) -> Result<()> {
    let bad = |msg: &str| Error::InvalidStream(format!("PLIO_1 {msg}"));
    if words.len() < 3 {
        return Err(bad("header too short"));
    }
    let (len, first) = if words[2] > 0 {
        (words[2] as usize, 3)
    } else {
        if words.len() < 5 || words[3] < 0 || words[4] < 0 {
            return Err(bad("header too short"));
        }
        let len = ((words[4] as usize) << 15) + words[3] as usize;
        (len, words[1].max(0) as usize)
    };
    if len > words.len() || first > len {
        return Err(bad("list length exceeds data"));
    }

    let n = out.len();
    let mut pv = 1i64;
    let mut x1 = 0usize;
    let mut ip = first;
    while ip < len && x1 < n {
        let w = words[ip];
        if w < 0 {
            return Err(bad("invalid opcode"));
        }
        let op = (w as u16) >> 12;
        let data = (w & 4095) as i64;
        match op {
            OP_ZERO_RUN | OP_RUN | OP_ZERO_RUN_PIXEL => {
                let x2 = x1 + data as usize;
                let end = x2.min(n);
                let fill = if op == OP_RUN { pv } else { 0 };
                out[x1..end].fill(fill);
                if op == OP_ZERO_RUN_PIXEL && data > 0 && x2 <= n {
                    out[x2 - 1] = pv;
                }
                x1 = x2;
            }
            OP_SET_HIGH => {
                let next = *words.get(ip + 1).filter(|_| ip + 1 < len).ok_or_else(|| bad("truncated"))?;
                pv = ((next as i64) << 12) + data;
                ip += 1;
            }
            OP_INC => pv += data,
            OP_DEC => pv -= data,
            OP_INC_PIXEL | OP_DEC_PIXEL => {
                pv += if op == OP_INC_PIXEL { data } else { -data };
                out[x1] = pv;
                x1 += 1;
            }
            _ => return Err(bad("invalid opcode")),
        }
        ip += 1;
    }
    if x1 < n {
        out[x1..].fill(0);
    }
    Ok(())
}

/// Words as big-endian bytes, the on-disk form of a `1PI` cell.
pub fn to_bytes(words: &[i16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

pub fn from_bytes(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(Error::InvalidStream("PLIO_1 data has an odd byte count".into()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_be_bytes([c[0], c[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(values: &[i64]) -> Vec<i16> {
        let words = encode(values).unwrap();
        let mut out = vec![-1i64; values.len()];
        decode(&words, &mut out).unwrap();
        assert_eq!(out, values);
        words
    }

    // ---- header ----

    #[test]
    fn header_records_length() {
        let words = encode(&[0, 0, 3, 3, 3, 0]).unwrap();
        assert_eq!(&words[..3], &[0, 7, -100]);
        assert_eq!(words[3] as usize, words.len());
        assert_eq!(words[4], 0);
    }

    #[test]
    fn all_zero_is_one_run() {
        let words = roundtrip(&[0; 100]);
        assert_eq!(&words[7..], &[100]);
    }

    // ---- opcodes ----

    #[test]
    fn run_of_initial_high_value() {
        let words = roundtrip(&[1, 1, 1, 1]);
        assert_eq!(&words[7..], &[word(OP_RUN, 4)]);
    }

    #[test]
    fn increment_then_single_pixel() {
        let words = roundtrip(&[5]);
        assert_eq!(&words[7..], &[word(OP_INC_PIXEL, 4)]);
        let words = roundtrip(&[3, 1]);
        assert_eq!(&words[7..], &[word(OP_INC_PIXEL, 2), word(OP_DEC_PIXEL, 2)]);
    }

    #[test]
    fn zeros_then_single_pixel() {
        let words = roundtrip(&[0, 0, 0, 1, 0]);
        assert_eq!(&words[7..], &[word(OP_ZERO_RUN_PIXEL, 4), word(OP_ZERO_RUN, 1)]);
    }

    #[test]
    fn large_jump_sets_high_value() {
        let big = 0x12_3456;
        let words = roundtrip(&[big, big, 0, 7]);
        assert_eq!(words[7], word(OP_SET_HIGH, 0x456));
        assert_eq!(words[8], 0x123);
    }

    #[test]
    fn long_runs_are_split() {
        let mut values = vec![0i64; 5000];
        values.extend(vec![2i64; 9000]);
        roundtrip(&values);
    }

    #[test]
    fn zero_run_of_max_length_before_single_pixel() {
        let mut values = vec![0i64; MAX_RUN];
        values.push(9);
        roundtrip(&values);
    }

    #[test]
    fn mask_like_data() {
        let values: Vec<i64> = (0..1000).map(|i| ((i / 37) % 4) * ((i / 11) % 3)).collect();
        roundtrip(&values);
    }

    // ---- errors ----

    #[test]
    fn out_of_range_values() {
        assert!(matches!(encode(&[0, -1]), Err(Error::ValueOutOfRange(-1))));
        assert!(matches!(encode(&[MAX_VALUE]), Err(Error::ValueOutOfRange(_))));
    }

    #[test]
    fn malformed_lists() {
        let mut out = [0i64; 4];
        assert!(matches!(decode(&[0, 7], &mut out), Err(Error::InvalidStream(_))));
        assert!(matches!(
            decode(&[0, 7, -100, 50, 0, 0, 0], &mut out),
            Err(Error::InvalidStream(_))
        ));
        assert!(from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn bytes_are_big_endian() {
        let words = encode(&[0, 2]).unwrap();
        let bytes = to_bytes(&words);
        assert_eq!(&bytes[..6], &[0, 0, 0, 7, 0xFF, 0x9C]);
        assert_eq!(from_bytes(&bytes).unwrap(), words);
    }
}
