//! Lossy mapping of floating point tiles onto 32-bit integers.
//!
//! Dithered quantization draws its offsets from the standard table of
//! 10000 Park-Miller uniform deviates, starting at a position derived from
//! the tile number and `ZDITHER0`, so any reader regenerates the same
//! sequence.

use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Quantized value standing for a null or NaN pixel.
pub const NULL_VALUE: i32 = -2147483647;
/// Quantized value standing for an exact zero under `SUBTRACTIVE_DITHER_2`.
pub const ZERO_VALUE: i32 = -2147483646;
/// Integer codes kept out of the quantized range.
const N_RESERVED_VALUES: f64 = 10.0;

pub const N_RANDOM: usize = 10000;
pub const DEFAULT_QUANTIZE_LEVEL: f64 = 4.0;

/// Scale from the median absolute deviation to a Gaussian sigma.
const MAD_TO_SIGMA: f64 = 0.6052697;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DitherMethod {
    NoDither,
    #[default]
    SubtractiveDither1,
    SubtractiveDither2,
}

impl DitherMethod {
    pub fn name(self) -> &'static str {
        match self {
            DitherMethod::NoDither => "NO_DITHER",
            DitherMethod::SubtractiveDither1 => "SUBTRACTIVE_DITHER_1",
            DitherMethod::SubtractiveDither2 => "SUBTRACTIVE_DITHER_2",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim() {
            "NO_DITHER" | "NONE" => Ok(DitherMethod::NoDither),
            "SUBTRACTIVE_DITHER_1" => Ok(DitherMethod::SubtractiveDither1),
            "SUBTRACTIVE_DITHER_2" => Ok(DitherMethod::SubtractiveDither2),
            other => Err(Error::UnsupportedCompression(format!("ZQUANTIZ {other}"))),
        }
    }
}

/// The shared table of uniform deviates in `[0, 1)`.
pub fn random_table() -> &'static [f32] {
    static TABLE: OnceLock<Vec<f32>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let a = 16807.0f64;
        let m = 2147483647.0f64;
        let mut seed = 1.0f64;
        (0..N_RANDOM)
            .map(|_| {
                let temp = a * seed;
                seed = temp - m * (temp / m).trunc();
                (seed / m) as f32
            })
            .collect()
    })
}

/// Walks the random table the way every reader and writer must.
#[derive(Debug, Clone)]
struct Dither {
    iseed: usize,
    next: usize,
}

impl Dither {
    /// `seed` is the 1-based tile row plus `ZDITHER0 - 1`.
    fn new(seed: i64) -> Self {
        let iseed = (seed - 1).rem_euclid(N_RANDOM as i64) as usize;
        let next = (random_table()[iseed] * 500.0) as usize;
        Dither { iseed, next }
    }

    fn current(&self) -> f64 {
        random_table()[self.next] as f64
    }

    fn advance(&mut self) {
        self.next += 1;
        if self.next == N_RANDOM {
            self.iseed = (self.iseed + 1) % N_RANDOM;
            self.next = (random_table()[self.iseed] * 500.0) as usize;
        }
    }
}

/// Per-tile quantization parameters, stored as `ZSCALE` and `ZZERO`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizeParams {
    pub scale: f64,
    pub zero: f64,
    pub method: DitherMethod,
    /// Dither seed of the tile: 1-based tile row plus `ZDITHER0 - 1`.
    pub seed: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Quantized {
    Values { values: Vec<i32>, params: QuantizeParams },
    /// Constant data or a range too wide for 32 bits; store the tile losslessly.
    NotQuantizable,
}

fn is_null(v: f64, null: Option<f64>) -> bool {
    v.is_nan() || null.is_some_and(|n| v == n)
}

fn nint(x: f64) -> i32 {
    if x >= 0.0 {
        (x + 0.5) as i32
    } else {
        (x - 0.5) as i32
    }
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Background noise from the median of `|2 v[i] - v[i-2] - v[i+2]|` along
/// each row of `row_len` samples; rows are combined by their median.
pub fn noise_estimate(values: &[f64], row_len: usize, null: Option<f64>) -> f64 {
    let row_len = row_len.max(1);
    let mut row_noise: Vec<f64> = values
        .chunks(row_len)
        .filter_map(|row| {
            let good: Vec<f64> = row.iter().copied().filter(|&v| !is_null(v, null)).collect();
            if good.len() < 5 {
                return None;
            }
            let mut diffs: Vec<f64> = good
                .windows(5)
                .map(|w| (2.0 * w[2] - w[0] - w[4]).abs())
                .collect();
            Some(median(&mut diffs))
        })
        .collect();
    if row_noise.is_empty() {
        // short rows: treat the tile as a single sequence
        if row_len < values.len() {
            return noise_estimate(values, values.len(), null);
        }
        return 0.0;
    }
    MAD_TO_SIGMA * median(&mut row_noise)
}

/// Quantize one tile. `level` is the quantize level: the noise is divided by
/// it, or `-level` is the step itself when negative.
pub fn quantize(
    values: &[f64],
    row_len: usize,
    level: f64,
    method: DitherMethod,
    seed: i64,
    null: Option<f64>,
) -> Quantized {
    let good = values.iter().copied().filter(|&v| !is_null(v, null));
    let (min, max, ngood) = good.fold((f64::INFINITY, f64::NEG_INFINITY, 0usize), |(lo, hi, n), v| {
        (lo.min(v), hi.max(v), n + 1)
    });

    let (scale, zero) = if ngood == 0 {
        (1.0, 0.0)
    } else {
        let delta = if level < 0.0 {
            -level
        } else {
            let noise = noise_estimate(values, row_len, null);
            if noise == 0.0 || level == 0.0 {
                return Quantized::NotQuantizable;
            }
            noise / level
        };
        if !delta.is_finite() || delta <= 0.0 {
            return Quantized::NotQuantizable;
        }
        if (max - min) / delta > 2.0 * 2147483647.0 - N_RESERVED_VALUES {
            return Quantized::NotQuantizable;
        }
        let zero = if (max - min) / delta < 2147483647.0 - N_RESERVED_VALUES {
            // offset so quantized values start near zero, on a whole step
            (min / delta + 0.5).floor() * delta
        } else {
            (min + max) / 2.0
        };
        (delta, zero)
    };

    let params = QuantizeParams {
        scale,
        zero,
        method,
        seed,
    };
    let mut dither = Dither::new(seed);
    let out = values
        .iter()
        .map(|&v| {
            let q = if is_null(v, null) {
                NULL_VALUE
            } else if method == DitherMethod::SubtractiveDither2 && v == 0.0 {
                ZERO_VALUE
            } else if method == DitherMethod::NoDither {
                nint((v - zero) / scale)
            } else {
                nint((v - zero) / scale + dither.current() - 0.5)
            };
            if method != DitherMethod::NoDither {
                dither.advance();
            }
            q
        })
        .collect();
    Quantized::Values {
        values: out,
        params,
    }
}

/// Restore floating point values; null codes become `null` (NaN by default).
pub fn dequantize(values: &[i32], params: &QuantizeParams, null: f64, out: &mut [f64]) -> Result<()> {
    if values.len() != out.len() {
        return Err(Error::SizeMismatch {
            expected: out.len(),
            actual: values.len(),
        });
    }
    let mut dither = Dither::new(params.seed);
    for (dst, &q) in out.iter_mut().zip(values) {
        *dst = if q == NULL_VALUE {
            null
        } else if params.method == DitherMethod::SubtractiveDither2 && q == ZERO_VALUE {
            0.0
        } else if params.method == DitherMethod::NoDither {
            q as f64 * params.scale + params.zero
        } else {
            (q as f64 - dither.current() + 0.5) * params.scale + params.zero
        };
        if params.method != DitherMethod::NoDither {
            dither.advance();
        }
    }
    Ok(())
}
