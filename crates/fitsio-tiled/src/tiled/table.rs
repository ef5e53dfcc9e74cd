//! Binary tables stored column by column in a `ZTABLE` binary table.
//!
//! Every row of the compressed table is a tile of consecutive rows of the
//! original, and every column holds one compressed cell per tile with that
//! column's values for those rows.

use rayon::prelude::*;
use tracing::{debug, info};

use super::{build_table, copy_cards, is_indexed, join_tiles, rename_card, Cell, CellReader, OutputColumn};
use crate::bintable::{self, Column, ColumnType, TableLayout};
use crate::codec::{self, Array, ElementType};
use crate::compress::{Algorithm, AlgorithmOptions};
use crate::data::DataUnit;
use crate::error::{Error, Result};
use crate::hdu::Hdu;
use crate::header::{Card, HduKind, Header};
use crate::tile::{table_tiles, TableTile};

/// Parameters of a table compression pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableCompressionOptions {
    /// Rows per tile; the whole table is one tile when `None`.
    pub rows_per_tile: Option<usize>,
    /// Used for every column it can compress instead of the per-type default.
    pub default_algorithm: Option<Algorithm>,
    /// Algorithms for single columns, by 0-based column index.
    pub overrides: Vec<(usize, Algorithm)>,
}

impl TableCompressionOptions {
    pub fn with_rows_per_tile(mut self, rows: usize) -> Self {
        self.rows_per_tile = Some(rows);
        self
    }

    pub fn with_default_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.default_algorithm = Some(algorithm);
        self
    }

    pub fn with_column_algorithm(mut self, column: usize, algorithm: Algorithm) -> Self {
        self.overrides.retain(|(c, _)| *c != column);
        self.overrides.push((column, algorithm));
        self
    }

    fn algorithm_for(&self, index: usize, column: &Column) -> Result<Algorithm> {
        let (ty, _) = storage(column)?;
        let suits = |algorithm: Algorithm| match algorithm {
            Algorithm::Rice => ty.is_integer(),
            Algorithm::Gzip1 | Algorithm::Gzip2 | Algorithm::NoCompress => true,
            Algorithm::HCompress | Algorithm::Plio => false,
        };
        if let Some(&(_, algorithm)) = self.overrides.iter().find(|(c, _)| *c == index) {
            if !suits(algorithm) {
                return Err(Error::UnsupportedCompression(format!(
                    "{algorithm} cannot compress column {} ({})",
                    index + 1,
                    column.tform
                )));
            }
            return Ok(algorithm);
        }
        if let Some(algorithm) = self.default_algorithm.filter(|&a| suits(a)) {
            return Ok(algorithm);
        }
        Ok(match column.col_type {
            ColumnType::Short | ColumnType::Int if column.repeat == 1 => Algorithm::Rice,
            _ => Algorithm::Gzip2,
        })
    }
}

/// Element type and count per row used to compress a column's bytes.
fn storage(column: &Column) -> Result<(ElementType, usize)> {
    let repeat = column.repeat;
    Ok(match column.col_type {
        ColumnType::Logical | ColumnType::Bit | ColumnType::Byte | ColumnType::Ascii => {
            (ElementType::Byte, column.width)
        }
        ColumnType::Short => (ElementType::I16, repeat),
        ColumnType::Int => (ElementType::I32, repeat),
        ColumnType::Long => (ElementType::I64, repeat),
        ColumnType::Float => (ElementType::F32, repeat),
        ColumnType::Double => (ElementType::F64, repeat),
        ColumnType::ComplexFloat => (ElementType::F32, 2 * repeat),
        ColumnType::ComplexDouble => (ElementType::F64, 2 * repeat),
        ColumnType::VarP(_) | ColumnType::VarQ(_) => {
            return Err(Error::UnsupportedCompression(format!(
                "variable-length column {}",
                column.tform
            )))
        }
    })
}

/// A binary table this module can compress: no variable-length columns.
pub fn table_is_compressible(hdu: &Hdu) -> bool {
    if hdu.kind() != HduKind::BinaryTable || hdu.is_compressed_image() || hdu.is_compressed_table() {
        return false;
    }
    TableLayout::from_header(hdu.header()).is_ok_and(|layout| {
        layout
            .columns
            .iter()
            .all(|c| !matches!(c.col_type, ColumnType::VarP(_) | ColumnType::VarQ(_)))
    })
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

fn compress_cell(rows: &[u8], layout: &TableLayout, col: usize, tile: &TableTile, algorithm: Algorithm) -> Result<Vec<u8>> {
    let (ty, per_row) = storage(layout.column(col)?)?;
    let bytes = layout.column_bytes(rows, col, 0..tile.nrows)?;
    let values = codec::decode(&bytes, &[tile.nrows * per_row], ty)?;
    algorithm.compress(&values, &AlgorithmOptions::default())
}

fn is_table_structural(keyword: &str) -> bool {
    matches!(
        keyword,
        "XTENSION" | "BITPIX" | "NAXIS" | "PCOUNT" | "GCOUNT" | "TFIELDS" | "THEAP" | "CHECKSUM" | "DATASUM"
    ) || ["NAXIS", "TTYPE", "TFORM"].iter().any(|p| is_indexed(keyword, p))
}

/// Compress a binary table unit into a `ZTABLE` binary table.
pub fn compress_table(hdu: &Hdu, options: &TableCompressionOptions) -> Result<Hdu> {
    let header = hdu.header();
    let layout = TableLayout::from_header(header)?;
    let algorithms = layout
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| options.algorithm_for(i, c))
        .collect::<Result<Vec<_>>>()?;
    let tiles = table_tiles(layout.nrows, options.rows_per_tile)?;
    let tile_len = options.rows_per_tile.unwrap_or(layout.nrows.max(1));
    debug!(tiles = tiles.len(), columns = layout.columns.len(), "compressing table");

    let results: Vec<(usize, Result<Vec<Vec<u8>>>)> = tiles
        .par_iter()
        .map(|tile| {
            let cells = hdu
                .data()
                .read_range(tile.first_row * layout.row_width, tile.nrows * layout.row_width)
                .and_then(|rows| {
                    algorithms
                        .iter()
                        .enumerate()
                        .map(|(col, &algorithm)| compress_cell(&rows, &layout, col, tile, algorithm))
                        .collect::<Result<Vec<_>>>()
                });
            (tile.index, cells)
        })
        .collect();
    let mut per_tile = join_tiles(results)?;

    let mut columns = Vec::with_capacity(layout.columns.len());
    for (i, (column, algorithm)) in layout.columns.iter().zip(&algorithms).enumerate() {
        let cells = per_tile
            .iter_mut()
            .map(|cells| Cell::Heap(std::mem::take(&mut cells[i])))
            .collect();
        let name = column.name.clone().unwrap_or_else(|| format!("COL{}", i + 1));
        columns.push(OutputColumn::new(&name, algorithm.column_format(), cells));
    }
    let (mut out, data) = build_table(&columns, tiles.len())?;

    out.push(Card::new("ZTABLE", true, Some("extension contains compressed table")));
    out.push(Card::new("ZTILELEN", tile_len, Some("number of rows in each tile")));
    out.push(Card::new("ZNAXIS1", layout.row_width, Some("width of uncompressed rows")));
    out.push(Card::new("ZNAXIS2", layout.nrows, Some("number of uncompressed rows")));
    out.push(Card::new("ZPCOUNT", 0i64, Some("heap size of uncompressed table")));
    for (i, (column, algorithm)) in layout.columns.iter().zip(&algorithms).enumerate() {
        out.push(Card::new(&format!("ZFORM{}", i + 1), column.tform.as_str(), Some("original column format")));
        out.push(Card::new(&format!("ZCTYP{}", i + 1), algorithm.name(), Some("compression algorithm for column")));
    }
    copy_cards(header, &mut out, is_table_structural);
    rename_card(header, &mut out, "CHECKSUM", "ZHECKSUM");
    rename_card(header, &mut out, "DATASUM", "ZDATASUM");

    info!(
        tiles = tiles.len(),
        rows = layout.nrows,
        bytes = data.len(),
        original = layout.row_width * layout.nrows,
        "compressed table"
    );
    Ok(Hdu::new(out, data))
}

// ---------------------------------------------------------------------------
// Decompression
// ---------------------------------------------------------------------------

/// Decoding of one compressed cell into the rows of its tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TableTileWork {
    pub tile: TableTile,
    /// Column of the original table the cell belongs to.
    pub column: usize,
    /// Column of the destination rows that receives the values.
    pub target_column: usize,
}

impl TableTileWork {
    pub fn new(tile: TableTile, column: usize) -> Self {
        TableTileWork {
            tile,
            column,
            target_column: column,
        }
    }

    /// Send the values to another column of the destination.
    pub fn decompress_to_column(&mut self, index: usize) {
        self.target_column = index;
    }

    /// Write the decoded cell into `rows`, the destination rows of this tile.
    fn execute(&self, table: &CompressedTable, target: &TableLayout, rows: &mut [u8]) -> Result<()> {
        let bytes = table.decode_cell(&self.tile, self.column)?;
        target.put_column_bytes(rows, self.target_column, &bytes)
    }
}

struct CompressedTable {
    cells: CellReader,
    header: Header,
    layout: TableLayout,
    tiles: Vec<TableTile>,
    algorithms: Vec<Algorithm>,
}

impl CompressedTable {
    fn open(hdu: &Hdu) -> Result<Self> {
        let header = table_header(hdu)?;
        let layout = TableLayout::from_header(&header)?;
        let h = hdu.header();
        let tiles = table_tiles(layout.nrows, Some(h.require_usize("ZTILELEN")?))?;
        let cells = CellReader::new(hdu)?;
        if cells.layout.nrows != tiles.len() || cells.layout.columns.len() != layout.columns.len() {
            return Err(Error::SizeMismatch {
                expected: tiles.len(),
                actual: cells.layout.nrows,
            });
        }
        let algorithms = (1..=layout.columns.len())
            .map(|i| {
                let key = format!("ZCTYP{i}");
                let name = h
                    .get_str(&key)
                    .or_else(|| h.get_str("ZCMPTYPE"))
                    .ok_or(Error::MissingKeyword(key))?;
                Algorithm::from_name(name)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CompressedTable {
            cells,
            header,
            layout,
            tiles,
            algorithms,
        })
    }

    /// Column bytes of one tile's rows, row after row.
    fn decode_cell(&self, tile: &TableTile, col: usize) -> Result<Vec<u8>> {
        let (ty, per_row) = storage(self.layout.column(col)?)?;
        let cell = self.cells.heap_cell(col, tile.index)?;
        let mut values = Array::zeros(&[tile.nrows * per_row], ty);
        self.algorithms[col].decompress(cell, &mut values, &AlgorithmOptions::default())?;
        codec::encode(&values)
    }

    fn tile_range(&self, from: usize, to: usize) -> Result<&[TableTile]> {
        self.tiles.get(from..to).ok_or_else(|| {
            Error::InvalidTile(format!("tiles {from}..{to} outside 0..{}", self.tiles.len()))
        })
    }

    /// Run the work units of `tiles` into fresh rows of `target`, one band
    /// of rows per tile.
    fn run<F>(&self, tiles: &[TableTile], target: &TableLayout, works: F) -> Result<Vec<u8>>
    where
        F: Fn(&TableTile) -> Vec<TableTileWork> + Sync,
    {
        let nrows: usize = tiles.iter().map(|t| t.nrows).sum();
        let mut rows = vec![0u8; nrows * target.row_width];
        let Some(first) = tiles.first() else {
            return Ok(rows);
        };
        if rows.is_empty() {
            return Ok(rows);
        }
        let results: Vec<Result<()>> = rows
            .par_chunks_mut(first.nrows * target.row_width)
            .zip(tiles)
            .map(|(band, tile)| {
                for work in works(tile) {
                    work.execute(self, target, band).map_err(|e| e.in_tile(tile.index))?;
                }
                Ok(())
            })
            .collect();
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(rows)
    }

    fn all_columns(&self, tile: &TableTile) -> Vec<TableTileWork> {
        (0..self.layout.columns.len())
            .map(|c| TableTileWork::new(tile.clone(), c))
            .collect()
    }
}

fn is_ztable_keyword(keyword: &str) -> bool {
    const FIXED: &[&str] = &[
        "XTENSION", "BITPIX", "NAXIS", "PCOUNT", "GCOUNT", "TFIELDS", "THEAP", "CHECKSUM", "DATASUM",
        "ZTABLE", "ZTILELEN", "ZPCOUNT", "ZTHEAP", "ZCMPTYPE", "ZHECKSUM", "ZDATASUM",
    ];
    const INDEXED: &[&str] = &["NAXIS", "ZNAXIS", "TTYPE", "TFORM", "ZFORM", "ZCTYP"];
    FIXED.contains(&keyword) || INDEXED.iter().any(|p| is_indexed(keyword, p))
}

/// Header of the table a `ZTABLE` unit was made from.
pub fn table_header(hdu: &Hdu) -> Result<Header> {
    if !hdu.is_compressed_table() {
        return Err(Error::InvalidHeader("not a compressed table (ZTABLE = T)".into()));
    }
    let h = hdu.header();
    let nfields = h.require_usize("TFIELDS")?;
    let mut specs = Vec::with_capacity(nfields);
    for i in 1..=nfields {
        let name = h.get_str(&format!("TTYPE{i}")).unwrap_or("").trim();
        let form = h.require_str(&format!("ZFORM{i}"))?.trim();
        specs.push((name, form));
    }
    let mut out = bintable::table_header(&specs, h.require_usize("ZNAXIS2")?, 0)?;
    let width = h.require_usize("ZNAXIS1")?;
    if out.get_int("NAXIS1") != Some(width as i64) {
        return Err(Error::SizeMismatch {
            expected: width,
            actual: out.get_int("NAXIS1").unwrap_or(0) as usize,
        });
    }
    copy_cards(h, &mut out, is_ztable_keyword);
    rename_card(h, &mut out, "ZHECKSUM", "CHECKSUM");
    rename_card(h, &mut out, "ZDATASUM", "DATASUM");
    Ok(out)
}

/// Restore the binary table a `ZTABLE` unit was made from.
pub fn decompress_table(hdu: &Hdu) -> Result<Hdu> {
    let table = CompressedTable::open(hdu)?;
    let rows = table.run(&table.tiles, &table.layout, |t| table.all_columns(t))?;
    info!(rows = table.layout.nrows, tiles = table.tiles.len(), "decompressed table");
    let data = if rows.is_empty() {
        DataUnit::Empty
    } else {
        DataUnit::Realized(rows)
    };
    Ok(Hdu::new(table.header, data))
}

/// The rows of tiles `from..to` as a table of their own. Checksum keywords
/// are dropped since they describe the whole table.
pub fn decompress_table_tiles(hdu: &Hdu, from: usize, to: usize) -> Result<Hdu> {
    let table = CompressedTable::open(hdu)?;
    let tiles = table.tile_range(from, to)?;
    let rows = table.run(tiles, &table.layout, |t| table.all_columns(t))?;
    let nrows: usize = tiles.iter().map(|t| t.nrows).sum();
    debug!(from, to, rows = nrows, "decompressed table tiles");

    let mut header = table.header.clone();
    header.set("NAXIS2", nrows);
    header.remove("CHECKSUM");
    header.remove("DATASUM");
    let data = if rows.is_empty() {
        DataUnit::Empty
    } else {
        DataUnit::Realized(rows)
    };
    Ok(Hdu::new(header, data))
}

/// Values of one column over tiles `from..to`.
pub fn column_data(hdu: &Hdu, column: usize, from: usize, to: usize) -> Result<Array> {
    let table = CompressedTable::open(hdu)?;
    let tiles = table.tile_range(from, to)?;
    let c = table.layout.column(column)?;
    let nrows: usize = tiles.iter().map(|t| t.nrows).sum();
    let single = TableLayout::from_header(&bintable::table_header(&[("", c.tform.as_str())], nrows, 0)?)?;
    let rows = table.run(tiles, &single, |tile| {
        let mut work = TableTileWork::new(tile.clone(), column);
        work.decompress_to_column(0);
        vec![work]
    })?;
    single.column_array(&rows, 0, 0..nrows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bintable::table_from_columns;
    use crate::checksum::ChecksumStatus;

    fn sample(nrows: usize) -> Hdu {
        let n = nrows;
        let ints = Array::from_i32(&[n], (0..n as i32).map(|i| i * 1000 - 3).collect()).unwrap();
        let shorts = Array::from_i16(&[n], (0..n as i16).map(|i| 7 - i).collect()).unwrap();
        let floats = Array::from_f32(&[3 * n], (0..3 * n).map(|i| i as f32 * 0.25).collect()).unwrap();
        let names = Array::from_strings(&[n], 8, (0..n).map(|i| format!("star{i}")).collect()).unwrap();
        let flags = Array::from_bool(&[n], (0..n).map(|i| i % 3 == 0).collect()).unwrap();
        let complex = Array::from_complex_f64(&[n], (0..n).map(|i| [i as f64, -(i as f64)]).collect()).unwrap();
        let longs = Array::from_i64(&[2 * n], (0..2 * n as i64).map(|i| i << 40).collect()).unwrap();
        table_from_columns(&[
            ("ID", "1J", &ints),
            ("OFFSET", "1I", &shorts),
            ("FLUX", "3E", &floats),
            ("NAME", "8A", &names),
            ("FLAG", "1L", &flags),
            ("PHASE", "1M", &complex),
            ("TIME", "2K", &longs),
        ])
        .unwrap()
    }

    fn rows(hdu: &Hdu) -> Vec<u8> {
        hdu.data().bytes().unwrap().into_owned()
    }

    // ---- algorithm choice ----

    #[test]
    fn default_algorithms_by_column_type() {
        let compressed = compress_table(&sample(5), &TableCompressionOptions::default()).unwrap();
        let h = compressed.header();
        assert_eq!(h.get_str("ZCTYP1"), Some("RICE_1"));
        assert_eq!(h.get_str("ZCTYP2"), Some("RICE_1"));
        for i in 3..=7 {
            assert_eq!(h.get_str(&format!("ZCTYP{i}")), Some("GZIP_2"));
        }
        assert_eq!(h.get_str("ZFORM3"), Some("3E"));
        assert_eq!(h.get_str("TTYPE4"), Some("NAME"));
        assert_eq!(h.get_int("ZTILELEN"), Some(5));
        assert_eq!(h.get_int("NAXIS2"), Some(1));
    }

    #[test]
    fn default_algorithm_only_where_it_fits() {
        let options = TableCompressionOptions::default().with_default_algorithm(Algorithm::Rice);
        let compressed = compress_table(&sample(4), &options).unwrap();
        let h = compressed.header();
        assert_eq!(h.get_str("ZCTYP4"), Some("RICE_1"));
        assert_eq!(h.get_str("ZCTYP7"), Some("RICE_1"));
        assert_eq!(h.get_str("ZCTYP3"), Some("GZIP_2"));

        let options = TableCompressionOptions::default().with_column_algorithm(2, Algorithm::Rice);
        assert!(matches!(
            compress_table(&sample(4), &options),
            Err(Error::UnsupportedCompression(_))
        ));
        let options = TableCompressionOptions::default().with_column_algorithm(0, Algorithm::Plio);
        assert!(compress_table(&sample(4), &options).is_err());
    }

    // ---- round trips ----

    #[test]
    fn every_column_type_survives() {
        let table = sample(10);
        for options in [
            TableCompressionOptions::default().with_rows_per_tile(4),
            TableCompressionOptions::default().with_default_algorithm(Algorithm::Gzip1),
            TableCompressionOptions::default()
                .with_rows_per_tile(3)
                .with_default_algorithm(Algorithm::NoCompress),
        ] {
            let compressed = compress_table(&table, &options).unwrap();
            assert!(compressed.is_compressed_table());
            compressed.header().validate(false).unwrap();
            let restored = decompress_table(&compressed).unwrap();
            assert_eq!(rows(&restored), rows(&table));
            assert_eq!(restored.header().get_int("NAXIS1"), table.header().get_int("NAXIS1"));
            assert_eq!(restored.header().get_str("TFORM7"), Some("2K"));
        }
    }

    #[test]
    fn checksums_are_carried_through() {
        let mut table = sample(6);
        table.header_mut().set("TELESCOP", "ORBITER");
        table.set_checksum().unwrap();
        let compressed = compress_table(&table, &TableCompressionOptions::default().with_rows_per_tile(4)).unwrap();
        assert!(compressed.header().contains("ZHECKSUM"));
        assert!(!compressed.header().contains("CHECKSUM"));
        let restored = decompress_table(&compressed).unwrap();
        assert_eq!(restored.header().get_str("TELESCOP"), Some("ORBITER"));
        assert!(!restored.header().contains("ZTABLE"));
        assert_eq!(restored.verify_checksum().unwrap(), ChecksumStatus::Valid);
    }

    #[test]
    fn empty_table() {
        let table = sample(0);
        let compressed = compress_table(&table, &TableCompressionOptions::default()).unwrap();
        assert_eq!(compressed.header().get_int("NAXIS2"), Some(0));
        let restored = decompress_table(&compressed).unwrap();
        assert_eq!(restored.header().get_int("NAXIS2"), Some(0));
        assert!(restored.data().is_empty());
    }

    // ---- partial reads ----

    #[test]
    fn tile_range_becomes_its_own_table() {
        let mut table = sample(10);
        table.set_checksum().unwrap();
        let compressed = compress_table(&table, &TableCompressionOptions::default().with_rows_per_tile(4)).unwrap();
        let part = decompress_table_tiles(&compressed, 1, 3).unwrap();
        assert_eq!(part.header().get_int("NAXIS2"), Some(6));
        assert!(!part.header().contains("CHECKSUM"));
        let width = table.header().get_int("NAXIS1").unwrap() as usize;
        assert_eq!(rows(&part), rows(&table)[4 * width..]);
        assert!(matches!(
            decompress_table_tiles(&compressed, 2, 4),
            Err(Error::InvalidTile(_))
        ));
    }

    #[test]
    fn single_column_over_tiles() {
        let table = sample(10);
        let compressed = compress_table(&table, &TableCompressionOptions::default().with_rows_per_tile(4)).unwrap();
        let ids = column_data(&compressed, 0, 0, 2).unwrap();
        assert_eq!(ids.to_i64().unwrap(), (0..8).map(|i| i * 1000 - 3).collect::<Vec<i64>>());
        let flux = column_data(&compressed, 2, 2, 3).unwrap();
        assert_eq!(flux.shape(), &[6]);
        assert_eq!(flux.to_f64().unwrap()[0], 24.0 * 0.25);
    }

    #[test]
    fn work_unit_retargets_its_column() {
        let table = sample(4);
        let compressed = compress_table(&table, &TableCompressionOptions::default()).unwrap();
        let opened = CompressedTable::open(&compressed).unwrap();
        let tile = opened.tiles[0].clone();

        let mut rows = vec![0u8; opened.layout.row_width * 4];
        let mut work = TableTileWork::new(tile.clone(), 0);
        work.decompress_to_column(0);
        work.execute(&opened, &opened.layout, &mut rows).unwrap();
        assert_eq!(
            opened.layout.column_bytes(&rows, 0, 0..4).unwrap(),
            opened.layout.column_bytes(&table.data().bytes().unwrap(), 0, 0..4).unwrap()
        );

        let mut wrong = TableTileWork::new(tile, 0);
        wrong.decompress_to_column(1);
        assert!(matches!(
            wrong.execute(&opened, &opened.layout, &mut rows),
            Err(Error::SizeMismatch { .. })
        ));
    }

    // ---- eligibility ----

    #[test]
    fn variable_length_tables_stay_uncompressed() {
        let table = sample(3);
        assert!(table_is_compressible(&table));
        let compressed = compress_table(&table, &TableCompressionOptions::default()).unwrap();
        assert!(!table_is_compressible(&compressed));

        let image = Hdu::from_array(&Array::from_u8(&[2], vec![1, 2]).unwrap(), false).unwrap();
        assert!(!table_is_compressible(&image));
        assert!(matches!(compress_table(&compressed, &TableCompressionOptions::default()), Err(Error::UnsupportedCompression(_))));
    }

    #[test]
    fn failing_cell_names_its_tile() {
        let table = sample(8);
        let compressed = compress_table(&table, &TableCompressionOptions::default().with_rows_per_tile(2)).unwrap();
        let (header, data) = compressed.into_parts();
        let mut bytes = data.bytes().unwrap().into_owned();
        let width = header.get_int("NAXIS1").unwrap() as usize;
        // grow the count of the first cell of tile 1 past the heap
        bytes[width] = 0x7f;
        let broken = Hdu::new(header, DataUnit::Realized(bytes));
        match decompress_table(&broken).unwrap_err() {
            Error::Tile { index, source } => {
                assert_eq!(index, 1);
                assert!(matches!(*source, Error::InvalidStream(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
