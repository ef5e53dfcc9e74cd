//! Tiled compression of images (`ZIMAGE`) and binary tables (`ZTABLE`).
//!
//! A compressed unit is a binary table with one row per tile. The
//! compressed bytes of a tile live in the heap and are reached through
//! variable-length array descriptors in the row.

mod image;
mod table;

pub use image::{compress_image, decompress_image, read_compressed_image, read_compressed_region};
pub use table::{
    column_data, compress_table, decompress_table, decompress_table_tiles, table_header,
    table_is_compressible, TableCompressionOptions, TableTileWork,
};

use crate::bintable::{self, parse_tform, ColumnType, TableLayout};
use crate::compress::quantize::{DitherMethod, DEFAULT_QUANTIZE_LEVEL};
use crate::compress::{Algorithm, AlgorithmOptions};
use crate::data::DataUnit;
use crate::error::{Error, Result};
use crate::hdu::Hdu;
use crate::header::{Card, HduKind, Header};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Null pixels of integer images kept exact under lossy compression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NullPreservation {
    /// The image's BLANK value.
    pub blank: i64,
    /// Algorithm for the per-tile `NULL_PIXEL_MASK` cells.
    pub mask_algorithm: Algorithm,
}

/// Parameters of one compression pass over an image or a container.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionOptions {
    pub algorithm: Algorithm,
    /// Tile extents in FITS order; one image row per tile when `None`.
    pub tile_shape: Option<Vec<usize>>,
    pub algorithm_options: AlgorithmOptions,
    /// Quantize level for floating point images; `None` keeps them lossless.
    pub quantize_level: Option<f64>,
    pub dither: DitherMethod,
    /// `ZDITHER0`, the first dither seed, in `1..=10000`.
    pub dither_seed: i64,
    /// Regions (corner, lengths) whose tiles are never stored lossily.
    pub no_loss: Vec<(Vec<usize>, Vec<usize>)>,
    pub nulls: Option<NullPreservation>,
    /// Binary tables are compressed too when set.
    pub tables: Option<TableCompressionOptions>,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        CompressionOptions {
            algorithm: Algorithm::Rice,
            tile_shape: None,
            algorithm_options: AlgorithmOptions::default(),
            quantize_level: Some(DEFAULT_QUANTIZE_LEVEL),
            dither: DitherMethod::default(),
            dither_seed: 1,
            no_loss: Vec::new(),
            nulls: None,
            tables: None,
        }
    }
}

impl CompressionOptions {
    pub fn new(algorithm: Algorithm) -> Self {
        CompressionOptions {
            algorithm,
            ..Default::default()
        }
    }

    pub fn with_tile_shape(mut self, shape: &[usize]) -> Self {
        self.tile_shape = Some(shape.to_vec());
        self
    }

    pub fn with_algorithm_options(mut self, options: AlgorithmOptions) -> Self {
        self.algorithm_options = options;
        self
    }

    pub fn with_quantize_level(mut self, level: Option<f64>) -> Self {
        self.quantize_level = level;
        self
    }

    pub fn with_dither(mut self, method: DitherMethod, seed: i64) -> Self {
        self.dither = method;
        self.dither_seed = seed;
        self
    }

    /// Store every tile intersecting the region without loss.
    pub fn force_no_loss(mut self, corner: &[usize], lengths: &[usize]) -> Self {
        self.no_loss.push((corner.to_vec(), lengths.to_vec()));
        self
    }

    pub fn preserve_nulls(mut self, blank: i64, mask_algorithm: Algorithm) -> Self {
        self.nulls = Some(NullPreservation {
            blank,
            mask_algorithm,
        });
        self
    }

    pub fn with_tables(mut self, tables: TableCompressionOptions) -> Self {
        self.tables = Some(tables);
        self
    }

    pub fn table_options(&self) -> Option<&TableCompressionOptions> {
        self.tables.as_ref()
    }

    /// Tile shape for an image with `axes`: missing extents are 1, extra
    /// extents are dropped.
    pub(crate) fn tile_shape_for(&self, axes: &[usize]) -> Option<Vec<usize>> {
        self.tile_shape.as_ref().map(|shape| {
            (0..axes.len())
                .map(|i| shape.get(i).copied().unwrap_or(1))
                .collect()
        })
    }
}

// ---------------------------------------------------------------------------
// Output tables
// ---------------------------------------------------------------------------

/// One cell of a table being built.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Cell {
    /// Bytes placed in the heap, reached through a `P` descriptor.
    Heap(Vec<u8>),
    /// A fixed-width big-endian cell.
    Fixed(Vec<u8>),
}

#[derive(Debug, Clone)]
pub(crate) struct OutputColumn {
    pub name: String,
    /// `1P?` for heap columns (the maximum length is added here).
    pub tform: String,
    pub cells: Vec<Cell>,
}

impl OutputColumn {
    pub fn new(name: &str, tform: &str, cells: Vec<Cell>) -> Self {
        OutputColumn {
            name: name.to_string(),
            tform: tform.to_string(),
            cells,
        }
    }
}

/// Bytes per heap element of a variable-length column, `None` for fixed columns.
pub(crate) fn heap_element_width(tform: &str) -> Result<Option<usize>> {
    match parse_tform(tform)?.1 {
        ColumnType::VarP(code) | ColumnType::VarQ(code) => {
            let (_, element) = parse_tform(&char::from(code).to_string())?;
            Ok(Some(element.row_bytes(1).max(1)))
        }
        _ => Ok(None),
    }
}

/// Lay out rows and heap for `nrows` rows of `columns`. The header carries
/// the structural keywords only.
pub(crate) fn build_table(columns: &[OutputColumn], nrows: usize) -> Result<(Header, DataUnit)> {
    let mut forms = Vec::with_capacity(columns.len());
    let mut widths = Vec::with_capacity(columns.len());
    for column in columns {
        if column.cells.len() != nrows {
            return Err(Error::SizeMismatch {
                expected: nrows,
                actual: column.cells.len(),
            });
        }
        let width = heap_element_width(&column.tform)?;
        let tform = match width {
            Some(w) => {
                let longest = column
                    .cells
                    .iter()
                    .map(|c| match c {
                        Cell::Heap(b) | Cell::Fixed(b) => b.len() / w,
                    })
                    .max()
                    .unwrap_or(0);
                format!("{}({longest})", column.tform)
            }
            None => column.tform.clone(),
        };
        forms.push((column.name.as_str(), tform));
        widths.push(width);
    }
    let specs: Vec<(&str, &str)> = forms.iter().map(|(n, t)| (*n, t.as_str())).collect();
    let mut header = bintable::table_header(&specs, nrows, 0)?;
    let layout = TableLayout::from_header(&header)?;

    let mut rows = vec![0u8; layout.row_width * nrows];
    let mut heap = Vec::new();
    for r in 0..nrows {
        for ((column, spec), width) in columns.iter().zip(&layout.columns).zip(&widths) {
            let start = r * layout.row_width + spec.offset;
            let dst = &mut rows[start..start + spec.width];
            match (&column.cells[r], width) {
                (Cell::Heap(bytes), Some(w)) => {
                    if bytes.len() % w != 0 {
                        return Err(Error::SizeMismatch {
                            expected: bytes.len() / w * w,
                            actual: bytes.len(),
                        });
                    }
                    let count = i32::try_from(bytes.len() / w);
                    let offset = i32::try_from(heap.len());
                    let (Ok(count), Ok(offset)) = (count, offset) else {
                        return Err(Error::CompressionFailed(
                            "heap exceeds 32-bit descriptors".into(),
                        ));
                    };
                    dst[..4].copy_from_slice(&count.to_be_bytes());
                    dst[4..8].copy_from_slice(&offset.to_be_bytes());
                    heap.extend_from_slice(bytes);
                }
                (Cell::Fixed(bytes), None) if bytes.len() == spec.width => dst.copy_from_slice(bytes),
                (Cell::Fixed(bytes), None) => {
                    return Err(Error::SizeMismatch {
                        expected: spec.width,
                        actual: bytes.len(),
                    })
                }
                _ => {
                    return Err(Error::InvalidValue(format!(
                        "cell kind does not match TFORM of {}",
                        column.name
                    )))
                }
            }
        }
    }
    header.set("PCOUNT", heap.len());
    rows.extend_from_slice(&heap);
    let data = if rows.is_empty() {
        DataUnit::Empty
    } else {
        DataUnit::Realized(rows)
    };
    Ok((header, data))
}

// ---------------------------------------------------------------------------
// Reading cells
// ---------------------------------------------------------------------------

/// Random access to the cells of a binary table held in memory.
pub(crate) struct CellReader {
    pub layout: TableLayout,
    rows: Vec<u8>,
    heap: Vec<u8>,
}

impl CellReader {
    pub fn new(hdu: &Hdu) -> Result<Self> {
        let layout = TableLayout::from_header(hdu.header())?;
        let main = layout.row_width * layout.nrows;
        let data = hdu.data();
        let rows = data.read_range(0, main)?;
        let heap_end = (main + layout.pcount).min(data.len());
        let heap = if heap_end > layout.heap_offset {
            data.read_range(layout.heap_offset, heap_end - layout.heap_offset)?
        } else {
            Vec::new()
        };
        Ok(CellReader { layout, rows, heap })
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.layout.find(name)
    }

    fn cell(&self, col: usize, row: usize) -> Result<&[u8]> {
        let c = self.layout.column(col)?;
        if row >= self.layout.nrows {
            return Err(Error::InvalidTile(format!(
                "row {row} outside table of {} rows",
                self.layout.nrows
            )));
        }
        let start = row * self.layout.row_width + c.offset;
        self.rows.get(start..start + c.width).ok_or(Error::UnexpectedEof)
    }

    /// Heap bytes of a variable-length cell.
    pub fn heap_cell(&self, col: usize, row: usize) -> Result<&[u8]> {
        let c = self.layout.column(col)?;
        let d = self.cell(col, row)?;
        let (count, offset, code) = match c.col_type {
            ColumnType::VarP(code) => (
                u32::from_be_bytes([d[0], d[1], d[2], d[3]]) as u64,
                u32::from_be_bytes([d[4], d[5], d[6], d[7]]) as u64,
                code,
            ),
            ColumnType::VarQ(code) => (
                u64::from_be_bytes([d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]]),
                u64::from_be_bytes([d[8], d[9], d[10], d[11], d[12], d[13], d[14], d[15]]),
                code,
            ),
            _ => {
                return Err(Error::InvalidValue(format!(
                    "TFORM{} is not a variable-length column",
                    col + 1
                )))
            }
        };
        let width = heap_element_width(&format!("1P{}", char::from(code)))?.unwrap_or(1) as u64;
        let outside = || Error::InvalidStream(format!("heap cell of row {} lies outside the heap", row + 1));
        let start = usize::try_from(offset).map_err(|_| outside())?;
        let len = count
            .checked_mul(width)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(outside)?;
        let end = start.checked_add(len).ok_or_else(outside)?;
        self.heap.get(start..end).ok_or_else(outside)
    }

    /// A scalar numeric cell as `f64`.
    pub fn float(&self, col: usize, row: usize) -> Result<f64> {
        let c = self.layout.column(col)?;
        let b = self.cell(col, row)?;
        Ok(match c.col_type {
            ColumnType::Double => f64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            ColumnType::Float => f32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64,
            _ => self.int(col, row)? as f64,
        })
    }

    /// A scalar integer cell.
    pub fn int(&self, col: usize, row: usize) -> Result<i64> {
        let c = self.layout.column(col)?;
        let b = self.cell(col, row)?;
        match c.col_type {
            ColumnType::Byte => Ok(b[0] as i64),
            ColumnType::Short => Ok(i16::from_be_bytes([b[0], b[1]]) as i64),
            ColumnType::Int => Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]) as i64),
            ColumnType::Long => Ok(i64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])),
            _ => Err(Error::InvalidValue(format!("TFORM{} is not numeric", col + 1))),
        }
    }
}

// ---------------------------------------------------------------------------
// Header helpers
// ---------------------------------------------------------------------------

/// `keyword` is `prefix` followed by a column or axis number.
pub(crate) fn is_indexed(keyword: &str, prefix: &str) -> bool {
    keyword
        .strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

/// Append the cards of `src` that `skip` does not reject and `dst` does not
/// already hold. Commentary cards are always copied.
pub(crate) fn copy_cards(src: &Header, dst: &mut Header, skip: impl Fn(&str) -> bool) {
    for card in src.iter() {
        if card.is_commentary() || (!skip(&card.keyword) && !dst.contains(&card.keyword)) {
            dst.push(card.clone());
        }
    }
}

/// Copy a card of `src` into `dst` under another keyword.
pub(crate) fn rename_card(src: &Header, dst: &mut Header, from: &str, to: &str) {
    if let Some(card) = src.card(from) {
        dst.push(Card {
            keyword: to.to_string(),
            ..card.clone()
        });
    }
}

/// Join per-tile results in tile order, attributing the first failure to
/// its tile.
pub(crate) fn join_tiles<T>(results: impl IntoIterator<Item = (usize, Result<T>)>) -> Result<Vec<T>> {
    results
        .into_iter()
        .map(|(index, r)| r.map_err(|e| e.in_tile(index)))
        .collect()
}

/// Turn a primary image unit into an image extension.
pub fn as_extension(hdu: Hdu) -> Hdu {
    if hdu.kind() != HduKind::Primary {
        return hdu;
    }
    let (mut header, data) = hdu.into_parts();
    let naxis = header.get_int("NAXIS").unwrap_or(0);
    header.remove("SIMPLE");
    header.remove("EXTEND");
    header.insert(0, Card::new("XTENSION", "IMAGE", Some("image extension")));
    let last_axis = if naxis > 0 {
        format!("NAXIS{naxis}")
    } else {
        "NAXIS".to_string()
    };
    header.set_after(&last_axis, Card::new("PCOUNT", 0i64, None));
    header.set_after("PCOUNT", Card::new("GCOUNT", 1i64, None));
    Hdu::new(header, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Array;

    // ---- options ----

    #[test]
    fn default_options() {
        let options = CompressionOptions::default();
        assert_eq!(options.algorithm, Algorithm::Rice);
        assert_eq!(options.quantize_level, Some(4.0));
        assert_eq!(options.dither, DitherMethod::SubtractiveDither1);
        assert_eq!(options.dither_seed, 1);
        assert!(options.table_options().is_none());
        assert_eq!(options.tile_shape_for(&[10, 10]), None);
    }

    #[test]
    fn tile_shape_adapts_to_dimensions() {
        let options = CompressionOptions::new(Algorithm::Gzip1).with_tile_shape(&[8, 4]);
        assert_eq!(options.tile_shape_for(&[100, 50, 3]), Some(vec![8, 4, 1]));
        assert_eq!(options.tile_shape_for(&[100]), Some(vec![8]));
    }

    #[test]
    fn builders_accumulate() {
        let options = CompressionOptions::new(Algorithm::HCompress)
            .force_no_loss(&[0, 0], &[4, 4])
            .force_no_loss(&[10, 10], &[1, 1])
            .preserve_nulls(-32768, Algorithm::Plio)
            .with_tables(TableCompressionOptions::default());
        assert_eq!(options.no_loss.len(), 2);
        assert_eq!(options.nulls.map(|n| n.blank), Some(-32768));
        assert!(options.table_options().is_some());
    }

    // ---- output tables ----

    #[test]
    fn heap_cells_roundtrip() {
        let columns = vec![
            OutputColumn::new(
                "COMPRESSED_DATA",
                "1PB",
                vec![Cell::Heap(vec![1, 2, 3]), Cell::Heap(vec![]), Cell::Heap(vec![9])],
            ),
            OutputColumn::new(
                "MASK",
                "1PI",
                vec![Cell::Heap(vec![0, 1, 0, 2]), Cell::Heap(vec![0, 7]), Cell::Heap(vec![])],
            ),
            OutputColumn::new(
                "ZSCALE",
                "1D",
                (0..3).map(|i| Cell::Fixed((i as f64 * 0.5).to_be_bytes().to_vec())).collect(),
            ),
        ];
        let (header, data) = build_table(&columns, 3).unwrap();
        assert_eq!(header.get_str("TFORM1"), Some("1PB(3)"));
        assert_eq!(header.get_str("TFORM2"), Some("1PI(2)"));
        assert_eq!(header.get_int("NAXIS1"), Some(24));
        assert_eq!(header.get_int("PCOUNT"), Some(10));
        let hdu = Hdu::new(header, data);
        let cells = CellReader::new(&hdu).unwrap();
        assert_eq!(cells.heap_cell(0, 0).unwrap(), &[1, 2, 3]);
        assert!(cells.heap_cell(0, 1).unwrap().is_empty());
        assert_eq!(cells.heap_cell(1, 0).unwrap(), &[0, 1, 0, 2]);
        assert_eq!(cells.heap_cell(1, 1).unwrap(), &[0, 7]);
        assert_eq!(cells.float(2, 2).unwrap(), 1.0);
        assert_eq!(cells.find("zscale"), Some(2));
        assert!(cells.heap_cell(2, 0).is_err());
        assert!(cells.int(0, 0).is_err());
    }

    #[test]
    fn odd_short_cell_rejected() {
        let columns = vec![OutputColumn::new("M", "1PI", vec![Cell::Heap(vec![1, 2, 3])])];
        assert!(matches!(build_table(&columns, 1), Err(Error::SizeMismatch { .. })));
        let columns = vec![OutputColumn::new("M", "1PB", vec![])];
        assert!(matches!(build_table(&columns, 1), Err(Error::SizeMismatch { .. })));
    }

    #[test]
    fn descriptor_outside_heap() {
        let columns = vec![OutputColumn::new("C", "1PB", vec![Cell::Heap(vec![5; 4])])];
        let (header, data) = build_table(&columns, 1).unwrap();
        let DataUnit::Realized(mut bytes) = data else {
            panic!("table data should be in memory");
        };
        bytes[3] = 40;
        bytes.truncate(12);
        let hdu = Hdu::new(header, DataUnit::Realized(bytes));
        let cells = CellReader::new(&hdu).unwrap();
        assert!(matches!(cells.heap_cell(0, 0), Err(Error::InvalidStream(_))));
    }

    // ---- header helpers ----

    #[test]
    fn indexed_keywords() {
        assert!(is_indexed("ZTILE12", "ZTILE"));
        assert!(!is_indexed("ZTILE", "ZTILE"));
        assert!(!is_indexed("ZTILEX", "ZTILE"));
    }

    #[test]
    fn copy_skips_and_keeps_commentary() {
        let mut src = Header::new();
        src.set("OBJECT", "M31");
        src.set("NAXIS", 2i64);
        src.add_history("first");
        let mut dst = Header::new();
        dst.set("OBJECT", "kept");
        copy_cards(&src, &mut dst, |k| k == "NAXIS");
        assert_eq!(dst.get_str("OBJECT"), Some("kept"));
        assert!(!dst.contains("NAXIS"));
        assert!(dst.iter().any(|c| c.keyword == "HISTORY"));
        rename_card(&src, &mut dst, "OBJECT", "ZOBJECT");
        assert_eq!(dst.get_str("ZOBJECT"), Some("M31"));
    }

    #[test]
    fn lowest_failing_tile_wins() {
        let results = vec![
            (0, Ok(1)),
            (1, Err(Error::ValueOutOfRange(-1))),
            (2, Err(Error::CompressionFailed("late".into()))),
        ];
        match join_tiles(results) {
            Err(Error::Tile { index, source }) => {
                assert_eq!(index, 1);
                assert!(matches!(*source, Error::ValueOutOfRange(-1)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn primary_becomes_extension() {
        let image = Array::from_i16(&[3, 2], vec![1, 2, 3, 4, 5, 6]).unwrap();
        let hdu = as_extension(Hdu::from_array(&image, true).unwrap());
        let h = hdu.header();
        assert_eq!(hdu.kind(), HduKind::Image);
        assert!(!h.contains("EXTEND"));
        assert_eq!(h.position("PCOUNT"), Some(5));
        assert_eq!(h.position("GCOUNT"), Some(6));
        h.validate(false).unwrap();
        assert_eq!(hdu.read_image().unwrap(), image);
    }
}
