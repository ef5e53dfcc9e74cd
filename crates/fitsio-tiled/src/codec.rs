//! Typed arrays and their big-endian on-disk representation.

use std::io::{Read, Write};

use bytemuck::{pod_collect_to_vec, Pod};

use crate::block::{padding_len, BLOCK_SIZE, DATA_PAD_BYTE};
use crate::error::{Error, Result};
use crate::header::read_full;

/// Element type of a typed array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Byte,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// `T`/`F` bytes.
    Logical,
    /// Single byte characters.
    Char,
    /// Fixed-width space padded strings.
    Str(usize),
    ComplexF32,
    ComplexF64,
}

impl ElementType {
    /// Bytes per element on disk.
    pub fn width(self) -> usize {
        match self {
            ElementType::Byte | ElementType::I8 | ElementType::Logical | ElementType::Char => 1,
            ElementType::I16 => 2,
            ElementType::I32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::F64 | ElementType::ComplexF32 => 8,
            ElementType::ComplexF64 => 16,
            ElementType::Str(w) => w,
        }
    }

    /// Width of one scalar component, used for byte shuffling.
    pub fn scalar_width(self) -> usize {
        match self {
            ElementType::ComplexF32 => 4,
            ElementType::ComplexF64 => 8,
            ElementType::Str(_) => 1,
            other => other.width(),
        }
    }

    /// Types that may appear in an image data unit.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ElementType::Byte
                | ElementType::I8
                | ElementType::I16
                | ElementType::I32
                | ElementType::I64
                | ElementType::F32
                | ElementType::F64
        )
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ElementType::Byte | ElementType::I8 | ElementType::I16 | ElementType::I32 | ElementType::I64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }

    pub fn from_bitpix(bitpix: i64) -> Result<Self> {
        match bitpix {
            8 => Ok(ElementType::Byte),
            16 => Ok(ElementType::I16),
            32 => Ok(ElementType::I32),
            64 => Ok(ElementType::I64),
            -32 => Ok(ElementType::F32),
            -64 => Ok(ElementType::F64),
            other => Err(Error::InvalidBitpix(other)),
        }
    }

    /// BITPIX of an image element type.
    pub fn bitpix(self) -> Result<i64> {
        match self {
            ElementType::Byte => Ok(8),
            ElementType::I16 => Ok(16),
            ElementType::I32 => Ok(32),
            ElementType::I64 => Ok(64),
            ElementType::F32 => Ok(-32),
            ElementType::F64 => Ok(-64),
            other => Err(Error::UnsupportedImageType(format!("{other:?}"))),
        }
    }
}

/// Element storage of a typed array.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Byte(Vec<u8>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Logical(Vec<bool>),
    Char(Vec<u8>),
    Str { width: usize, values: Vec<String> },
    ComplexF32(Vec<[f32; 2]>),
    ComplexF64(Vec<[f64; 2]>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            ArrayData::Byte(v) | ArrayData::Char(v) => v.len(),
            ArrayData::I8(v) => v.len(),
            ArrayData::I16(v) => v.len(),
            ArrayData::I32(v) => v.len(),
            ArrayData::I64(v) => v.len(),
            ArrayData::F32(v) => v.len(),
            ArrayData::F64(v) => v.len(),
            ArrayData::Logical(v) => v.len(),
            ArrayData::Str { values, .. } => values.len(),
            ArrayData::ComplexF32(v) => v.len(),
            ArrayData::ComplexF64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            ArrayData::Byte(_) => ElementType::Byte,
            ArrayData::I8(_) => ElementType::I8,
            ArrayData::I16(_) => ElementType::I16,
            ArrayData::I32(_) => ElementType::I32,
            ArrayData::I64(_) => ElementType::I64,
            ArrayData::F32(_) => ElementType::F32,
            ArrayData::F64(_) => ElementType::F64,
            ArrayData::Logical(_) => ElementType::Logical,
            ArrayData::Char(_) => ElementType::Char,
            ArrayData::Str { width, .. } => ElementType::Str(*width),
            ArrayData::ComplexF32(_) => ElementType::ComplexF32,
            ArrayData::ComplexF64(_) => ElementType::ComplexF64,
        }
    }

    fn zeros(ty: ElementType, n: usize) -> Self {
        match ty {
            ElementType::Byte => ArrayData::Byte(vec![0; n]),
            ElementType::I8 => ArrayData::I8(vec![0; n]),
            ElementType::I16 => ArrayData::I16(vec![0; n]),
            ElementType::I32 => ArrayData::I32(vec![0; n]),
            ElementType::I64 => ArrayData::I64(vec![0; n]),
            ElementType::F32 => ArrayData::F32(vec![0.0; n]),
            ElementType::F64 => ArrayData::F64(vec![0.0; n]),
            ElementType::Logical => ArrayData::Logical(vec![false; n]),
            ElementType::Char => ArrayData::Char(vec![b' '; n]),
            ElementType::Str(width) => ArrayData::Str {
                width,
                values: vec![String::new(); n],
            },
            ElementType::ComplexF32 => ArrayData::ComplexF32(vec![[0.0; 2]; n]),
            ElementType::ComplexF64 => ArrayData::ComplexF64(vec![[0.0; 2]; n]),
        }
    }
}

/// An n-dimensional typed array. `shape` is in FITS order, first axis fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    shape: Vec<usize>,
    data: ArrayData,
}

macro_rules! array_from {
    ($name:ident, $ty:ty, $variant:ident) => {
        pub fn $name(shape: &[usize], values: Vec<$ty>) -> Result<Self> {
            Array::new(shape, ArrayData::$variant(values))
        }
    };
}

impl Array {
    /// Bind data to a shape, checking the element count.
    pub fn new(shape: &[usize], data: ArrayData) -> Result<Self> {
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            return Err(Error::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Array {
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn zeros(shape: &[usize], ty: ElementType) -> Self {
        let n = shape.iter().product();
        Array {
            shape: shape.to_vec(),
            data: ArrayData::zeros(ty, n),
        }
    }

    array_from!(from_u8, u8, Byte);
    array_from!(from_i8, i8, I8);
    array_from!(from_i16, i16, I16);
    array_from!(from_i32, i32, I32);
    array_from!(from_i64, i64, I64);
    array_from!(from_f32, f32, F32);
    array_from!(from_f64, f64, F64);
    array_from!(from_bool, bool, Logical);
    array_from!(from_complex_f32, [f32; 2], ComplexF32);
    array_from!(from_complex_f64, [f64; 2], ComplexF64);

    pub fn from_strings(shape: &[usize], width: usize, values: Vec<String>) -> Result<Self> {
        Array::new(shape, ArrayData::Str { width, values })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn element_type(&self) -> ElementType {
        self.data.element_type()
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn into_data(self) -> ArrayData {
        self.data
    }

    /// Integer elements widened to `i64`.
    pub fn to_i64(&self) -> Result<Vec<i64>> {
        Ok(match &self.data {
            ArrayData::Byte(v) => v.iter().map(|&x| x as i64).collect(),
            ArrayData::I8(v) => v.iter().map(|&x| x as i64).collect(),
            ArrayData::I16(v) => v.iter().map(|&x| x as i64).collect(),
            ArrayData::I32(v) => v.iter().map(|&x| x as i64).collect(),
            ArrayData::I64(v) => v.clone(),
            other => {
                return Err(Error::UnsupportedElementType(format!(
                    "{:?} is not an integer type",
                    other.element_type()
                )))
            }
        })
    }

    /// Overwrite integer elements from `i64` values, narrowing to the element width.
    pub fn fill_from_i64(&mut self, values: &[i64]) -> Result<()> {
        if values.len() != self.len() {
            return Err(Error::SizeMismatch {
                expected: self.len(),
                actual: values.len(),
            });
        }
        match &mut self.data {
            ArrayData::Byte(v) => v.iter_mut().zip(values).for_each(|(d, &s)| *d = s as u8),
            ArrayData::I8(v) => v.iter_mut().zip(values).for_each(|(d, &s)| *d = s as i8),
            ArrayData::I16(v) => v.iter_mut().zip(values).for_each(|(d, &s)| *d = s as i16),
            ArrayData::I32(v) => v.iter_mut().zip(values).for_each(|(d, &s)| *d = s as i32),
            ArrayData::I64(v) => v.copy_from_slice(values),
            other => {
                return Err(Error::UnsupportedElementType(format!(
                    "{:?} is not an integer type",
                    other.element_type()
                )))
            }
        }
        Ok(())
    }

    /// Floating point elements widened to `f64`.
    pub fn to_f64(&self) -> Result<Vec<f64>> {
        match &self.data {
            ArrayData::F32(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            ArrayData::F64(v) => Ok(v.clone()),
            other => Err(Error::UnsupportedElementType(format!(
                "{:?} is not a floating point type",
                other.element_type()
            ))),
        }
    }

    pub fn fill_from_f64(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.len() {
            return Err(Error::SizeMismatch {
                expected: self.len(),
                actual: values.len(),
            });
        }
        match &mut self.data {
            ArrayData::F32(v) => v.iter_mut().zip(values).for_each(|(d, &s)| *d = s as f32),
            ArrayData::F64(v) => v.copy_from_slice(values),
            other => {
                return Err(Error::UnsupportedElementType(format!(
                    "{:?} is not a floating point type",
                    other.element_type()
                )))
            }
        }
        Ok(())
    }
}

// ── Byte order ──

trait BigEndian: Pod {
    fn swap_be(self) -> Self;
}

macro_rules! big_endian_int {
    ($($t:ty),*) => {$(
        impl BigEndian for $t {
            fn swap_be(self) -> Self {
                self.to_be()
            }
        }
    )*};
}

big_endian_int!(i16, i32, i64);

impl BigEndian for f32 {
    fn swap_be(self) -> Self {
        f32::from_bits(self.to_bits().to_be())
    }
}

impl BigEndian for f64 {
    fn swap_be(self) -> Self {
        f64::from_bits(self.to_bits().to_be())
    }
}

impl<T: BigEndian> BigEndian for [T; 2]
where
    [T; 2]: Pod,
{
    fn swap_be(self) -> Self {
        [self[0].swap_be(), self[1].swap_be()]
    }
}

fn to_be_bytes<T: BigEndian>(values: &[T]) -> Vec<u8> {
    let swapped: Vec<T> = values.iter().map(|v| v.swap_be()).collect();
    pod_collect_to_vec(&swapped)
}

fn from_be_bytes<T: BigEndian>(bytes: &[u8]) -> Vec<T> {
    let mut values: Vec<T> = pod_collect_to_vec(bytes);
    for v in &mut values {
        *v = v.swap_be();
    }
    values
}

fn encode_text(values: &[String], width: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * width);
    for s in values {
        let bytes = s.as_bytes();
        let n = bytes.len().min(width);
        out.extend_from_slice(&bytes[..n]);
        out.resize(out.len() + width - n, b' ');
    }
    out
}

fn decode_text(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).trim().to_string()
}

/// Big-endian bytes of an array.
pub fn encode(array: &Array) -> Result<Vec<u8>> {
    let expected = array.shape.iter().product::<usize>();
    if array.len() != expected {
        return Err(Error::SizeMismatch {
            expected,
            actual: array.len(),
        });
    }
    Ok(match &array.data {
        ArrayData::Byte(v) | ArrayData::Char(v) => v.clone(),
        ArrayData::I8(v) => pod_collect_to_vec(v),
        ArrayData::I16(v) => to_be_bytes(v),
        ArrayData::I32(v) => to_be_bytes(v),
        ArrayData::I64(v) => to_be_bytes(v),
        ArrayData::F32(v) => to_be_bytes(v),
        ArrayData::F64(v) => to_be_bytes(v),
        ArrayData::Logical(v) => v.iter().map(|&b| if b { b'T' } else { b'F' }).collect(),
        ArrayData::Str { width, values } => encode_text(values, *width),
        ArrayData::ComplexF32(v) => to_be_bytes(v),
        ArrayData::ComplexF64(v) => to_be_bytes(v),
    })
}

/// Typed array from big-endian bytes. The byte count must match the shape exactly.
pub fn decode(bytes: &[u8], shape: &[usize], ty: ElementType) -> Result<Array> {
    let count = shape.iter().product::<usize>();
    let expected = count * ty.width();
    if bytes.len() != expected {
        return Err(Error::SizeMismatch {
            expected,
            actual: bytes.len(),
        });
    }
    let data = match ty {
        ElementType::Byte => ArrayData::Byte(bytes.to_vec()),
        ElementType::Char => ArrayData::Char(bytes.to_vec()),
        ElementType::I8 => ArrayData::I8(pod_collect_to_vec(bytes)),
        ElementType::I16 => ArrayData::I16(from_be_bytes(bytes)),
        ElementType::I32 => ArrayData::I32(from_be_bytes(bytes)),
        ElementType::I64 => ArrayData::I64(from_be_bytes(bytes)),
        ElementType::F32 => ArrayData::F32(from_be_bytes(bytes)),
        ElementType::F64 => ArrayData::F64(from_be_bytes(bytes)),
        ElementType::Logical => ArrayData::Logical(bytes.iter().map(|&b| b == b'T').collect()),
        ElementType::Str(width) => ArrayData::Str {
            width,
            values: if width == 0 {
                vec![String::new(); count]
            } else {
                bytes.chunks_exact(width).map(decode_text).collect()
            },
        },
        ElementType::ComplexF32 => ArrayData::ComplexF32(from_be_bytes(bytes)),
        ElementType::ComplexF64 => ArrayData::ComplexF64(from_be_bytes(bytes)),
    };
    Array::new(shape, data)
}

// ── Streams ──

/// Writes typed arrays to a byte sink, tracking the position.
pub struct ArrayWriter<W: Write> {
    inner: W,
    position: u64,
}

impl<W: Write> ArrayWriter<W> {
    pub fn new(inner: W) -> Self {
        ArrayWriter { inner, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    pub fn write_array(&mut self, array: &Array) -> Result<()> {
        let bytes = encode(array)?;
        self.write_bytes(&bytes)
    }

    /// Write an array as a whole data unit, zero padded to the block boundary.
    pub fn write_unit(&mut self, array: &Array) -> Result<()> {
        self.write_array(array)?;
        self.pad_to_block()
    }

    /// Zero fill up to the next block boundary.
    pub fn pad_to_block(&mut self) -> Result<()> {
        let fill = padding_len((self.position % BLOCK_SIZE as u64) as usize);
        if fill > 0 {
            self.write_bytes(&vec![DATA_PAD_BYTE; fill])?;
        }
        Ok(())
    }

    /// Flush and hand back the sink.
    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Reads typed arrays from a byte source, tracking the position.
pub struct ArrayReader<R: Read> {
    inner: R,
    position: u64,
}

impl<R: Read> ArrayReader<R> {
    pub fn new(inner: R) -> Self {
        ArrayReader { inner, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let got = read_full(&mut self.inner, &mut buf)?;
        self.position += got as u64;
        if got < len {
            return Err(Error::UnexpectedEof);
        }
        Ok(buf)
    }

    /// Read one array. Block padding after it is left in the stream.
    pub fn read_array(&mut self, shape: &[usize], ty: ElementType) -> Result<Array> {
        let len = shape.iter().product::<usize>() * ty.width();
        let bytes = self.read_bytes(len)?;
        decode(&bytes, shape, ty)
    }

    /// Like [`read_array`](Self::read_array) but only for image element types.
    pub fn read_image(&mut self, shape: &[usize], ty: ElementType) -> Result<Array> {
        if !ty.is_numeric() {
            return Err(Error::UnsupportedImageType(format!("{ty:?}")));
        }
        self.read_array(shape, ty)
    }

    /// Skip to the next block boundary.
    pub fn skip_padding(&mut self) -> Result<()> {
        let fill = padding_len((self.position % BLOCK_SIZE as u64) as usize);
        self.read_bytes(fill).map(|_| ())
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
