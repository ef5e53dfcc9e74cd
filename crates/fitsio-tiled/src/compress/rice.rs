//! Rice coding of integer tiles (`RICE_1`).
//!
//! The stream starts with the first sample in `bbits` raw bits. Each block of
//! `block_size` samples follows as a `fsbits` split code, then either nothing
//! (all differences zero), raw mapped differences, or Rice codes.

use super::bits::{BitReader, BitWriter};
use crate::error::{Error, Result};

pub const DEFAULT_BLOCK_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RiceParams {
    pub fsbits: u32,
    pub fsmax: u32,
    pub bbits: u32,
}

impl RiceParams {
    pub fn for_bytepix(bytepix: usize) -> Result<Self> {
        match bytepix {
            1 => Ok(RiceParams {
                fsbits: 3,
                fsmax: 6,
                bbits: 8,
            }),
            2 => Ok(RiceParams {
                fsbits: 4,
                fsmax: 14,
                bbits: 16,
            }),
            4 => Ok(RiceParams {
                fsbits: 5,
                fsmax: 25,
                bbits: 32,
            }),
            8 => Ok(RiceParams {
                fsbits: 6,
                fsmax: 58,
                bbits: 64,
            }),
            other => Err(Error::UnsupportedCompression(format!(
                "RICE_1 BYTEPIX {other}"
            ))),
        }
    }

    fn mask(&self) -> u64 {
        if self.bbits == 64 {
            u64::MAX
        } else {
            (1u64 << self.bbits) - 1
        }
    }

    /// Sign-extend the low `bbits` of `v`.
    fn extend(&self, v: u64) -> i64 {
        let shift = 64 - self.bbits;
        ((v << shift) as i64) >> shift
    }

    /// Zig-zag map the wrapping difference `next - last`.
    fn map_diff(&self, next: i64, last: i64) -> u64 {
        let d = self.extend(next.wrapping_sub(last) as u64);
        (((d << 1) ^ (d >> 63)) as u64) & self.mask()
    }

    fn unmap_diff(&self, m: u64) -> i64 {
        let d = if m & 1 == 0 { m >> 1 } else { !(m >> 1) };
        self.extend(d)
    }
}

/// Compress `values`, each representable in `bytepix` bytes.
pub fn compress(values: &[i64], block_size: usize, bytepix: usize) -> Result<Vec<u8>> {
    let params = RiceParams::for_bytepix(bytepix)?;
    if block_size == 0 {
        return Err(Error::CompressionFailed("RICE_1 block size must be positive".into()));
    }
    let Some(&first) = values.first() else {
        return Ok(Vec::new());
    };

    let mut out = BitWriter::with_capacity(values.len() * bytepix / 2 + 16);
    out.write_bits(first as u64 & params.mask(), params.bbits);

    let mut diff = vec![0u64; block_size];
    let mut last = first;
    for block in values.chunks(block_size) {
        let diff = &mut diff[..block.len()];
        let mut pixelsum = 0f64;
        for (d, &next) in diff.iter_mut().zip(block) {
            *d = params.map_diff(next, last);
            pixelsum += *d as f64;
            last = next;
        }

        let n = block.len() as f64;
        let dpsum = ((pixelsum - (block.len() / 2) as f64 - 1.0) / n).max(0.0);
        let psum = (dpsum as u64) >> 1;
        let fs = 64 - psum.leading_zeros();

        if fs >= params.fsmax {
            out.write_bits(params.fsmax as u64 + 1, params.fsbits);
            diff.iter().for_each(|&d| out.write_bits(d, params.bbits));
        } else if fs == 0 && pixelsum == 0.0 {
            out.write_bits(0, params.fsbits);
        } else {
            out.write_bits(fs as u64 + 1, params.fsbits);
            let low = (1u64 << fs) - 1;
            for &d in diff.iter() {
                out.write_unary(d >> fs);
                if fs > 0 {
                    out.write_bits(d & low, fs);
                }
            }
        }
    }
    Ok(out.finish())
}

/// Decompress exactly `out.len()` samples.
pub fn decompress(bytes: &[u8], out: &mut [i64], block_size: usize, bytepix: usize) -> Result<()> {
    let params = RiceParams::for_bytepix(bytepix)?;
    if block_size == 0 {
        return Err(Error::InvalidStream("RICE_1 block size must be positive".into()));
    }
    if out.is_empty() {
        return Ok(());
    }

    let mut r = BitReader::new(bytes);
    let mut last = params.extend(r.read_bits(params.bbits)?);
    let limit = 1u64 << params.bbits.min(40);

    for block in out.chunks_mut(block_size) {
        let code = r.read_bits(params.fsbits)? as u32;
        if code == 0 {
            block.fill(last);
            continue;
        }
        let fs = code - 1;
        if fs > params.fsmax {
            return Err(Error::InvalidStream(format!("RICE_1 split level {fs}")));
        }
        for px in block.iter_mut() {
            let m = if fs == params.fsmax {
                r.read_bits(params.bbits)?
            } else {
                let top = r.read_unary(limit)?;
                let low = if fs > 0 { r.read_bits(fs)? } else { 0 };
                top.checked_shl(fs)
                    .filter(|t| t >> fs == top)
                    .ok_or_else(|| Error::InvalidStream("RICE_1 code overflow".into()))?
                    | low
            };
            last = params.extend(last.wrapping_add(params.unmap_diff(m)) as u64);
            *px = last;
        }
    }
    Ok(())
}
