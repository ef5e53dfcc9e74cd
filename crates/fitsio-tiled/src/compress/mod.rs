//! Tile compression algorithms and their `ZCMPTYPE` names.
//!
//! Every algorithm takes one tile as a typed [`Array`] and produces the bytes
//! of a heap cell; decompression fills a destination array of the tile's
//! shape and type. Integer algorithms (Rice, H-compress, PLIO) widen the tile
//! to `i64` on the way in and narrow it on the way out.

mod bits;
pub mod gzip;
pub mod hcompress;
pub mod plio;
pub mod quantize;
pub mod rice;

use std::fmt;

use crate::codec::{self, Array, ElementType};
use crate::error::{Error, Result};
use crate::header::Header;
use crate::value::Value;

/// A tile compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Rice,
    HCompress,
    Plio,
    Gzip1,
    Gzip2,
    NoCompress,
}

/// `ZCMPTYPE` spellings. The first entry for an algorithm is the one written.
const NAMES: &[(&str, Algorithm)] = &[
    ("RICE_1", Algorithm::Rice),
    ("RICE_ONE", Algorithm::Rice),
    ("HCOMPRESS_1", Algorithm::HCompress),
    ("PLIO_1", Algorithm::Plio),
    ("GZIP_1", Algorithm::Gzip1),
    ("GZIP_2", Algorithm::Gzip2),
    ("NOCOMPRESS", Algorithm::NoCompress),
];

impl Algorithm {
    pub fn from_name(name: &str) -> Result<Self> {
        let name = name.trim();
        NAMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, a)| a)
            .ok_or_else(|| Error::UnsupportedCompression(name.to_string()))
    }

    pub fn name(self) -> &'static str {
        NAMES
            .iter()
            .find(|&&(_, a)| a == self)
            .map_or("NOCOMPRESS", |&(n, _)| n)
    }

    /// Whether decompression may not reproduce the input exactly. A negative
    /// scale is relative to the noise of each tile, see [`Algorithm::is_lossy_for`].
    pub fn is_lossy(self, options: &AlgorithmOptions) -> bool {
        self == Algorithm::HCompress && (options.scale < 0.0 || options.scale.round() > 1.0)
    }

    /// Whether compressing `tile` loses information, with a noise-relative
    /// scale resolved against the tile's own pixels.
    pub fn is_lossy_for(self, tile: &Array, options: &AlgorithmOptions) -> Result<bool> {
        if !self.is_lossy(options) {
            return Ok(false);
        }
        if options.scale >= 0.0 {
            return Ok(true);
        }
        let (_, row_len) = hcompress_dims(tile.shape());
        Ok(options.scale_for(&tile.to_i64()?, row_len) > 0)
    }

    /// Whether the algorithm only accepts integer tiles.
    pub fn needs_integers(self) -> bool {
        matches!(self, Algorithm::Rice | Algorithm::HCompress | Algorithm::Plio)
    }

    /// TFORM of the variable-length column holding the compressed cells.
    pub fn column_format(self) -> &'static str {
        match self {
            Algorithm::Plio => "1PI",
            _ => "1PB",
        }
    }

    /// Bytes per heap element of [`Algorithm::column_format`].
    pub fn heap_element_width(self) -> usize {
        match self {
            Algorithm::Plio => 2,
            _ => 1,
        }
    }

    /// Compress one tile.
    pub fn compress(self, tile: &Array, options: &AlgorithmOptions) -> Result<Vec<u8>> {
        let ty = tile.element_type();
        match self {
            Algorithm::Rice => {
                let bytepix = options.bytepix.unwrap_or(ty.width());
                if bytepix < ty.width() {
                    return Err(Error::CompressionFailed(format!(
                        "RICE_1 BYTEPIX {bytepix} is narrower than {ty:?}"
                    )));
                }
                rice::compress(&tile.to_i64()?, options.block_size, bytepix)
            }
            Algorithm::HCompress => {
                let values = tile.to_i64()?;
                let (nx, ny) = hcompress_dims(tile.shape());
                let scale = options.scale_for(&values, ny);
                hcompress::compress(&values, nx, ny, scale)
            }
            Algorithm::Plio => Ok(plio::to_bytes(&plio::encode(&tile.to_i64()?)?)),
            Algorithm::Gzip1 => Ok(gzip::compress(&codec::encode(tile)?)),
            Algorithm::Gzip2 => {
                let raw = codec::encode(tile)?;
                Ok(gzip::compress(&gzip::shuffle(&raw, ty.scalar_width())))
            }
            Algorithm::NoCompress => codec::encode(tile),
        }
    }

    /// Decompress one cell into `dst`, whose shape and type describe the tile.
    pub fn decompress(self, bytes: &[u8], dst: &mut Array, options: &AlgorithmOptions) -> Result<()> {
        let ty = dst.element_type();
        match self {
            Algorithm::Rice => {
                let mut values = vec![0i64; dst.len()];
                let bytepix = options.bytepix.unwrap_or(ty.width());
                rice::decompress(bytes, &mut values, options.block_size, bytepix)?;
                dst.fill_from_i64(&values)
            }
            Algorithm::HCompress => {
                let mut values = vec![0i64; dst.len()];
                let (nx, ny) = hcompress_dims(dst.shape());
                hcompress::decompress(bytes, &mut values, nx, ny, options.smooth)?;
                dst.fill_from_i64(&values)
            }
            Algorithm::Plio => {
                let mut values = vec![0i64; dst.len()];
                plio::decode(&plio::from_bytes(bytes)?, &mut values)?;
                dst.fill_from_i64(&values)
            }
            Algorithm::Gzip1 | Algorithm::Gzip2 => {
                let mut raw = gzip::decompress(bytes)?;
                if self == Algorithm::Gzip2 {
                    raw = gzip::unshuffle(&raw, ty.scalar_width())?;
                }
                replace_from_bytes(dst, &raw, self)
            }
            Algorithm::NoCompress => replace_from_bytes(dst, bytes, self),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// H-compress sees a tile as `nx` rows of `ny` samples, `ny` along NAXIS1.
fn hcompress_dims(shape: &[usize]) -> (usize, usize) {
    let ny = shape.first().copied().unwrap_or(1);
    let nx = shape.iter().skip(1).product::<usize>();
    (nx.max(1), ny)
}

fn replace_from_bytes(dst: &mut Array, bytes: &[u8], algorithm: Algorithm) -> Result<()> {
    let ty = dst.element_type();
    let expected = dst.len() * ty.width();
    if bytes.len() != expected {
        return Err(Error::InvalidStream(format!(
            "{algorithm} tile holds {} bytes, expected {expected}",
            bytes.len()
        )));
    }
    *dst = codec::decode(bytes, dst.shape(), ty)?;
    Ok(())
}

/// Algorithm parameters, recorded as `ZNAMEn`/`ZVALn` pairs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlgorithmOptions {
    /// Rice samples per block.
    pub block_size: usize,
    /// Rice bytes per sample; the tile's element width when `None`.
    pub bytepix: Option<usize>,
    /// H-compress scale. 0 or 1 is lossless; a negative value is a multiple
    /// of the tile's noise estimate.
    pub scale: f64,
    /// Smooth H-compressed tiles while decompressing.
    pub smooth: bool,
}

impl Default for AlgorithmOptions {
    fn default() -> Self {
        AlgorithmOptions {
            block_size: rice::DEFAULT_BLOCK_SIZE,
            bytepix: None,
            scale: 0.0,
            smooth: false,
        }
    }
}

impl AlgorithmOptions {
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_bytepix(mut self, bytepix: usize) -> Self {
        self.bytepix = Some(bytepix);
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_smooth(mut self, smooth: bool) -> Self {
        self.smooth = smooth;
        self
    }

    /// Integer H-compress scale for a tile; 0 means lossless.
    fn scale_for(&self, values: &[i64], row_len: usize) -> i64 {
        let scale = if self.scale < 0.0 {
            let samples: Vec<f64> = values.iter().map(|&v| v as f64).collect();
            -self.scale * quantize::noise_estimate(&samples, row_len, None)
        } else {
            self.scale
        };
        match scale.round() as i64 {
            s if s > 1 => s,
            _ => 0,
        }
    }

    /// `ZNAMEn`/`ZVALn` pairs for `algorithm` compressing `ty` tiles.
    pub fn parameters(&self, algorithm: Algorithm, ty: ElementType) -> Vec<(&'static str, Value)> {
        match algorithm {
            Algorithm::Rice => vec![
                ("BLOCKSIZE", Value::from(self.block_size)),
                ("BYTEPIX", Value::from(self.bytepix.unwrap_or(ty.width()))),
            ],
            Algorithm::HCompress => vec![
                ("SCALE", Value::from(self.scale)),
                ("SMOOTH", Value::from(self.smooth as i64)),
            ],
            _ => Vec::new(),
        }
    }

    /// Write the parameters as `ZNAMEn`/`ZVALn` cards.
    pub fn write_keywords(&self, header: &mut Header, algorithm: Algorithm, ty: ElementType) {
        for (i, (name, value)) in self.parameters(algorithm, ty).into_iter().enumerate() {
            header.set(&format!("ZNAME{}", i + 1), name);
            header.set(&format!("ZVAL{}", i + 1), value);
        }
    }

    /// Read `ZNAMEn`/`ZVALn` cards; unknown names are ignored.
    pub fn from_header(header: &Header) -> Result<Self> {
        let mut options = AlgorithmOptions::default();
        for i in 1.. {
            let Some(name) = header.get_str(&format!("ZNAME{i}")) else {
                break;
            };
            let key = format!("ZVAL{i}");
            let value = header.get(&key).ok_or_else(|| Error::MissingKeyword(key.clone()))?;
            let invalid = || Error::InvalidValue(key.clone());
            let count = || {
                value
                    .as_int()
                    .and_then(|v| usize::try_from(v).ok())
                    .ok_or_else(invalid)
            };
            match name.trim().to_ascii_uppercase().as_str() {
                "BLOCKSIZE" => options.block_size = count()?,
                "BYTEPIX" => options.bytepix = Some(count()?),
                "SCALE" => options.scale = value.as_float().ok_or_else(invalid)?,
                "SMOOTH" => options.smooth = count()? != 0,
                _ => {}
            }
        }
        Ok(options)
    }
}
