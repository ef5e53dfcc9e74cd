//! Header/data units and the multi-unit container.

use std::fs::File;
use std::io::{BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::block::{padded_byte_len, write_padding, DATA_PAD_BYTE};
use crate::checksum::{self, ChecksumStatus};
use crate::codec::{self, Array, ElementType};
use crate::data::{DataUnit, SharedSource, Source};
use crate::error::{Error, Result};
use crate::header::{Card, HduKind, Header};
use crate::tiled::{self, CompressionOptions};

/// One header/data unit.
#[derive(Debug, Clone)]
pub struct Hdu {
    header: Header,
    data: DataUnit,
}

impl Hdu {
    pub fn new(header: Header, data: DataUnit) -> Self {
        Hdu { header, data }
    }

    /// Build an image unit from an array. A primary unit also gets `EXTEND = T`.
    pub fn from_array(array: &Array, primary: bool) -> Result<Self> {
        let bitpix = array.element_type().bitpix()?;
        let mut header = image_header(primary, bitpix, array.shape());
        if primary {
            header.push(Card::new("EXTEND", true, None));
        }
        let data = if array.is_empty() {
            DataUnit::Empty
        } else {
            DataUnit::Realized(codec::encode(array)?)
        };
        Ok(Hdu { header, data })
    }

    /// A primary unit without data.
    pub fn empty_primary() -> Self {
        let mut header = image_header(true, 8, &[]);
        header.push(Card::new("EXTEND", true, None));
        Hdu {
            header,
            data: DataUnit::Empty,
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn data(&self) -> &DataUnit {
        &self.data
    }

    pub fn into_parts(self) -> (Header, DataUnit) {
        (self.header, self.data)
    }

    pub fn kind(&self) -> HduKind {
        self.header.kind()
    }

    /// Image units (primary or extension) with a non-empty data array.
    pub fn is_image(&self) -> bool {
        matches!(self.kind(), HduKind::Primary | HduKind::Image)
            && self.header.axes().map(|a| !a.is_empty()).unwrap_or(false)
    }

    pub fn is_compressed_image(&self) -> bool {
        self.kind() == HduKind::BinaryTable && self.header.get_bool("ZIMAGE") == Some(true)
    }

    pub fn is_compressed_table(&self) -> bool {
        self.kind() == HduKind::BinaryTable && self.header.get_bool("ZTABLE") == Some(true)
    }

    /// Load deferred data into memory.
    pub fn realize(&mut self) -> Result<()> {
        self.data.realize()
    }

    /// Element type of an image unit.
    pub fn element_type(&self) -> Result<ElementType> {
        ElementType::from_bitpix(self.header.bitpix()?)
    }

    /// Decode the data of an image unit.
    pub fn read_image(&self) -> Result<Array> {
        let ty = self.element_type()?;
        let shape = self.header.axes()?;
        let len = shape.iter().product::<usize>() * ty.width();
        let bytes = self.data.read_range(0, len)?;
        codec::decode(&bytes, &shape, ty)
    }

    fn check_size(&self) -> Result<()> {
        let expected = self.header.data_len()?;
        if expected != self.data.len() {
            return Err(Error::SizeMismatch {
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Serialize the unit. The header is validated and rendered before
    /// anything is written.
    pub fn write_to<W: Write>(&self, writer: &mut W, primary: bool) -> Result<()> {
        self.header.validate(primary)?;
        self.check_size()?;
        let header_bytes = self.header.to_bytes()?;
        writer.write_all(&header_bytes)?;
        self.data.for_each_chunk(0, self.data.len(), |chunk| {
            writer.write_all(chunk)?;
            Ok(())
        })?;
        write_padding(writer, self.data.len(), DATA_PAD_BYTE)?;
        Ok(())
    }

    /// Serialized size including padding.
    pub fn byte_len(&self) -> usize {
        self.header.byte_len() + padded_byte_len(self.data.len())
    }

    // ── Checksums ──

    /// Checksum of the data area.
    pub fn data_checksum(&self) -> Result<u32> {
        self.data.checksum()
    }

    /// Checksum of the whole unit as it would be written.
    pub fn calc_checksum(&self) -> Result<u32> {
        let header_sum = checksum::checksum(&self.header.to_bytes()?);
        Ok(checksum::sum_of(header_sum, self.data_checksum()?))
    }

    /// Stamp DATASUM and CHECKSUM. Deferred data is streamed, not loaded.
    pub fn set_checksum(&mut self) -> Result<()> {
        let datasum = self.data_checksum()?;
        checksum::stamp(&mut self.header, datasum)
    }

    pub fn verify_checksum(&self) -> Result<ChecksumStatus> {
        checksum::verify(&self.header, self.data_checksum()?)
    }
}

/// Minimal image header with the mandatory keywords.
pub(crate) fn image_header(primary: bool, bitpix: i64, shape: &[usize]) -> Header {
    let mut h = Header::new();
    if primary {
        h.push(Card::new("SIMPLE", true, Some("conforms to FITS standard")));
    } else {
        h.push(Card::new("XTENSION", "IMAGE", Some("image extension")));
    }
    h.push(Card::new("BITPIX", bitpix, Some("array data type")));
    h.push(Card::new("NAXIS", shape.len(), Some("number of array dimensions")));
    for (i, &n) in shape.iter().enumerate() {
        h.push(Card::new(&format!("NAXIS{}", i + 1), n, None));
    }
    if !primary {
        h.push(Card::new("PCOUNT", 0i64, None));
        h.push(Card::new("GCOUNT", 1i64, None));
    }
    h
}

/// A sequence of units: one primary followed by extensions.
#[derive(Debug, Clone, Default)]
pub struct Fits {
    units: Vec<Hdu>,
}

impl Fits {
    pub fn new() -> Self {
        Fits::default()
    }

    /// Parse a container held in memory.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let mut fits = Fits::from_reader(Cursor::new(bytes))?;
        for hdu in &mut fits.units {
            hdu.realize()?;
        }
        Ok(fits)
    }

    /// Read every header; data stays in the source until needed.
    pub fn from_reader<S: Source + 'static>(source: S) -> Result<Self> {
        let shared: SharedSource = Arc::new(Mutex::new(source));
        let mut units = Vec::new();
        let mut guard = shared
            .lock()
            .map_err(|_| Error::Io(std::io::Error::other("data source lock poisoned")))?;
        let total = guard.seek(SeekFrom::End(0))?;
        let mut offset = 0u64;
        while offset < total {
            guard.seek(SeekFrom::Start(offset))?;
            let Some((header, header_len)) = Header::read_from(&mut *guard)? else {
                break;
            };
            let len = header.data_len()?;
            let data_start = offset + header_len as u64;
            if data_start + len as u64 > total {
                return Err(Error::UnexpectedEof);
            }
            debug!(index = units.len(), kind = ?header.kind(), data_len = len, "read header");
            let data = if len == 0 {
                DataUnit::Empty
            } else {
                DataUnit::Deferred {
                    source: Arc::clone(&shared),
                    offset: data_start,
                    len,
                }
            };
            units.push(Hdu { header, data });
            offset = data_start + padded_byte_len(len) as u64;
        }
        drop(guard);
        if units.is_empty() {
            return Err(Error::UnexpectedEof);
        }
        if units[0].kind() != HduKind::Primary {
            return Err(Error::MissingKeyword("SIMPLE".into()));
        }
        Ok(Fits { units })
    }

    /// Open a file; data is read on demand.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Fits::from_reader(File::open(path)?)
    }

    pub fn push(&mut self, hdu: Hdu) {
        self.units.push(hdu);
    }

    pub fn units(&self) -> &[Hdu] {
        &self.units
    }

    pub fn units_mut(&mut self) -> &mut [Hdu] {
        &mut self.units
    }

    pub fn get(&self, index: usize) -> Option<&Hdu> {
        self.units.get(index)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hdu> {
        self.units.iter()
    }

    /// Serialize every unit in order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for (i, hdu) in self.units.iter().enumerate() {
            hdu.write_to(writer, i == 0)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.units.iter().map(Hdu::byte_len).sum());
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Write to `path` through a sibling temporary file that replaces the
    /// target only after the whole container was written.
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let tmp = temp_sibling(path);
        let result = (|| -> Result<()> {
            let mut w = BufWriter::new(File::create(&tmp)?);
            self.write_to(&mut w)?;
            w.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            std::fs::rename(&tmp, path)?;
            Ok(())
        })();
        if result.is_err() {
            if let Err(e) = std::fs::remove_file(&tmp) {
                warn!(path = %tmp.display(), error = %e, "could not remove temporary file");
            }
        }
        result
    }

    pub fn set_checksum(&mut self) -> Result<()> {
        for hdu in &mut self.units {
            hdu.set_checksum()?;
        }
        Ok(())
    }

    pub fn verify_checksum(&self) -> Result<Vec<ChecksumStatus>> {
        self.units.iter().map(Hdu::verify_checksum).collect()
    }

    /// Compress every image unit (and binary tables when the options ask
    /// for it). A primary image moves into the first extension behind an
    /// empty primary unit.
    pub fn compress(&self, options: &CompressionOptions) -> Result<Fits> {
        let mut out = Fits::new();
        for (i, hdu) in self.units.iter().enumerate() {
            let converted = if hdu.is_image() {
                Some(tiled::compress_image(hdu, options)?)
            } else if tiled::table_is_compressible(hdu) {
                match options.table_options() {
                    Some(table) => Some(tiled::compress_table(hdu, table)?),
                    None => None,
                }
            } else {
                None
            };
            match converted {
                Some(c) if i == 0 => {
                    out.push(Hdu::empty_primary());
                    out.push(c);
                }
                Some(c) => out.push(c),
                None if i == 0 && hdu.kind() != HduKind::Primary => {
                    out.push(Hdu::empty_primary());
                    out.push(hdu.clone());
                }
                None => out.push(hdu.clone()),
            }
        }
        info!(units = out.len(), "compressed container");
        Ok(out)
    }

    /// Decompress every compressed unit. A compressed primary image in the
    /// first extension behind an empty primary becomes the primary again.
    pub fn decompress(&self) -> Result<Fits> {
        let mut out = Fits::new();
        for (i, hdu) in self.units.iter().enumerate() {
            if hdu.is_compressed_image() {
                let restored = tiled::decompress_image(hdu)?;
                let lifts_primary = i == 1
                    && restored.kind() == HduKind::Primary
                    && out.units.len() == 1
                    && out.units[0].data.is_empty()
                    && out.units[0].header.get_int("NAXIS") == Some(0);
                if lifts_primary {
                    out.units[0] = restored;
                } else if restored.kind() == HduKind::Primary {
                    out.push(tiled::as_extension(restored));
                } else {
                    out.push(restored);
                }
            } else if hdu.is_compressed_table() {
                out.push(tiled::decompress_table(hdu)?);
            } else {
                out.push(hdu.clone());
            }
        }
        info!(units = out.len(), "decompressed container");
        Ok(out)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "fits".to_string());
    path.with_file_name(format!(".{name}.{}.tmp", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCK_SIZE;

    fn sample() -> Fits {
        let mut fits = Fits::new();
        let image = Array::from_i16(&[4, 3], (0..12).collect()).unwrap();
        fits.push(Hdu::from_array(&image, true).unwrap());
        let ext = Array::from_f32(&[2], vec![1.5, -2.5]).unwrap();
        let mut hdu = Hdu::from_array(&ext, false).unwrap();
        hdu.header_mut().set("EXTNAME", "SECOND");
        fits.push(hdu);
        fits
    }

    // ---- container ----

    #[test]
    fn bytes_round_trip() {
        let fits = sample();
        let bytes = fits.to_bytes().unwrap();
        assert_eq!(bytes.len(), 4 * BLOCK_SIZE);
        let back = Fits::from_bytes(bytes).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.units()[0].read_image().unwrap(), fits.units()[0].read_image().unwrap());
        assert_eq!(back.units()[1].header().get_str("EXTNAME"), Some("SECOND"));
        assert!(!back.units()[1].data().is_deferred());
    }

    #[test]
    fn reader_defers_data() {
        let bytes = sample().to_bytes().unwrap();
        let fits = Fits::from_reader(Cursor::new(bytes)).unwrap();
        assert!(fits.units()[0].data().is_deferred());
        let image = fits.units()[1].read_image().unwrap();
        assert_eq!(image, Array::from_f32(&[2], vec![1.5, -2.5]).unwrap());
    }

    #[test]
    fn truncated_data_is_eof() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes.truncate(BLOCK_SIZE + 10);
        assert!(matches!(Fits::from_bytes(bytes), Err(Error::UnexpectedEof)));
    }

    #[test]
    fn first_unit_must_be_primary() {
        let mut out = Vec::new();
        let ext = Hdu::from_array(&Array::from_u8(&[1], vec![1]).unwrap(), false).unwrap();
        ext.write_to(&mut out, false).unwrap();
        assert!(matches!(Fits::from_bytes(out), Err(Error::MissingKeyword(_))));
    }

    #[test]
    fn write_rejects_size_mismatch() {
        let mut hdu = sample().units()[0].clone();
        hdu.header_mut().set("NAXIS2", 5i64);
        let mut out = Vec::new();
        let err = hdu.write_to(&mut out, true).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 40, actual: 24 }));
        assert!(out.is_empty());
    }

    #[test]
    fn non_numeric_image_rejected() {
        let a = Array::from_bool(&[2], vec![true, false]).unwrap();
        assert!(matches!(Hdu::from_array(&a, true), Err(Error::UnsupportedImageType(_))));
    }

    // ---- checksums ----

    #[test]
    fn stamp_and_verify_container() {
        let mut fits = sample();
        fits.set_checksum().unwrap();
        assert!(fits
            .verify_checksum()
            .unwrap()
            .iter()
            .all(|s| *s == ChecksumStatus::Valid));
        let bytes = fits.to_bytes().unwrap();
        assert_eq!(checksum::checksum(&bytes[..2 * BLOCK_SIZE]), u32::MAX);
    }

    #[test]
    fn deferred_and_realized_stamp_identically() {
        let bytes = sample().to_bytes().unwrap();
        let mut deferred = Fits::from_reader(Cursor::new(bytes)).unwrap();
        deferred.set_checksum().unwrap();
        let first = deferred.units()[0].header().get_str("CHECKSUM").map(str::to_string);
        deferred.units_mut()[0].realize().unwrap();
        deferred.set_checksum().unwrap();
        let second = deferred.units()[0].header().get_str("CHECKSUM").map(str::to_string);
        assert_eq!(first, second);
        assert_eq!(deferred.units()[0].calc_checksum().unwrap(), u32::MAX);
    }
}
