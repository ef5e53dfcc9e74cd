//! Binary table layout, column access and construction.

use std::ops::Range;

use crate::codec::{self, Array, ElementType};
use crate::data::DataUnit;
use crate::error::{Error, Result};
use crate::hdu::Hdu;
use crate::header::{Card, Header};

/// Data type of a binary table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// L
    Logical,
    /// X, packed bits.
    Bit,
    /// B
    Byte,
    /// I
    Short,
    /// J
    Int,
    /// K
    Long,
    /// E
    Float,
    /// D
    Double,
    /// C
    ComplexFloat,
    /// M
    ComplexDouble,
    /// A
    Ascii,
    /// P descriptor (count, offset as 32-bit) with the heap element code.
    VarP(u8),
    /// Q descriptor (count, offset as 64-bit) with the heap element code.
    VarQ(u8),
}

impl ColumnType {
    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            b'L' => ColumnType::Logical,
            b'X' => ColumnType::Bit,
            b'B' => ColumnType::Byte,
            b'I' => ColumnType::Short,
            b'J' => ColumnType::Int,
            b'K' => ColumnType::Long,
            b'E' => ColumnType::Float,
            b'D' => ColumnType::Double,
            b'C' => ColumnType::ComplexFloat,
            b'M' => ColumnType::ComplexDouble,
            b'A' => ColumnType::Ascii,
            _ => return None,
        })
    }

    pub fn code(self) -> char {
        match self {
            ColumnType::Logical => 'L',
            ColumnType::Bit => 'X',
            ColumnType::Byte => 'B',
            ColumnType::Short => 'I',
            ColumnType::Int => 'J',
            ColumnType::Long => 'K',
            ColumnType::Float => 'E',
            ColumnType::Double => 'D',
            ColumnType::ComplexFloat => 'C',
            ColumnType::ComplexDouble => 'M',
            ColumnType::Ascii => 'A',
            ColumnType::VarP(_) => 'P',
            ColumnType::VarQ(_) => 'Q',
        }
    }

    /// Bytes per row for `repeat` elements.
    pub fn row_bytes(self, repeat: usize) -> usize {
        match self {
            ColumnType::Bit => repeat.div_ceil(8),
            ColumnType::VarP(_) => 8 * repeat,
            ColumnType::VarQ(_) => 16 * repeat,
            ColumnType::Ascii => repeat,
            other => repeat * other.element_type(repeat).width(),
        }
    }

    /// Element type used to decode the column's cells.
    pub fn element_type(self, repeat: usize) -> ElementType {
        match self {
            ColumnType::Logical => ElementType::Logical,
            ColumnType::Bit | ColumnType::Byte => ElementType::Byte,
            ColumnType::Short => ElementType::I16,
            ColumnType::Int | ColumnType::VarP(_) => ElementType::I32,
            ColumnType::Long | ColumnType::VarQ(_) => ElementType::I64,
            ColumnType::Float => ElementType::F32,
            ColumnType::Double => ElementType::F64,
            ColumnType::ComplexFloat => ElementType::ComplexF32,
            ColumnType::ComplexDouble => ElementType::ComplexF64,
            ColumnType::Ascii => ElementType::Str(repeat),
        }
    }

    /// Number of decoded elements in one row.
    pub fn elements_per_row(self, repeat: usize) -> usize {
        match self {
            ColumnType::Ascii => 1,
            ColumnType::Bit => repeat.div_ceil(8),
            ColumnType::VarP(_) | ColumnType::VarQ(_) => 2 * repeat,
            _ => repeat,
        }
    }
}

/// Parse a TFORMn value like `1J`, `20A`, `16X` or `1PB(200)`.
pub fn parse_tform(tform: &str) -> Result<(usize, ColumnType)> {
    let invalid = || Error::InvalidValue(format!("TFORM {tform:?}"));
    let s = tform.trim();
    let s = s.split('(').next().unwrap_or(s);
    let split = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
    let repeat = if split == 0 {
        1
    } else {
        s[..split].parse::<usize>().map_err(|_| invalid())?
    };
    let code = s.as_bytes();
    let ty = match &code[split..] {
        [b'P', t] if ColumnType::from_code(*t).is_some() => ColumnType::VarP(*t),
        [b'Q', t] if ColumnType::from_code(*t).is_some() => ColumnType::VarQ(*t),
        [t] => ColumnType::from_code(*t).ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };
    Ok((repeat, ty))
}

/// One column of a table and its place within a row.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: Option<String>,
    pub tform: String,
    pub repeat: usize,
    pub col_type: ColumnType,
    /// Byte offset within a row.
    pub offset: usize,
    /// Bytes per row.
    pub width: usize,
}

impl Column {
    pub fn element_type(&self) -> ElementType {
        self.col_type.element_type(self.repeat)
    }

    pub fn elements_per_row(&self) -> usize {
        self.col_type.elements_per_row(self.repeat)
    }
}

/// Row layout of a binary table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableLayout {
    pub row_width: usize,
    pub nrows: usize,
    pub columns: Vec<Column>,
    /// Offset of the heap from the start of the data area.
    pub heap_offset: usize,
    /// Heap size including any gap (PCOUNT).
    pub pcount: usize,
}

impl TableLayout {
    pub fn from_header(header: &Header) -> Result<Self> {
        let row_width = header.require_usize("NAXIS1")?;
        let nrows = header.require_usize("NAXIS2")?;
        let nfields = header.require_usize("TFIELDS")?;
        let mut columns = Vec::with_capacity(nfields);
        let mut offset = 0;
        for i in 1..=nfields {
            let tform = header.require_str(&format!("TFORM{i}"))?.trim().to_string();
            let (repeat, col_type) = parse_tform(&tform)?;
            let width = col_type.row_bytes(repeat);
            columns.push(Column {
                name: header.get_str(&format!("TTYPE{i}")).map(|s| s.trim().to_string()),
                tform,
                repeat,
                col_type,
                offset,
                width,
            });
            offset += width;
        }
        if offset != row_width {
            return Err(Error::SizeMismatch {
                expected: row_width,
                actual: offset,
            });
        }
        let main = row_width * nrows;
        let heap_offset = header.get_int("THEAP").map_or(main, |t| t.max(0) as usize);
        Ok(TableLayout {
            row_width,
            nrows,
            columns,
            heap_offset,
            pcount: header.get_int("PCOUNT").unwrap_or(0).max(0) as usize,
        })
    }

    pub fn column(&self, index: usize) -> Result<&Column> {
        self.columns
            .get(index)
            .ok_or_else(|| Error::InvalidValue(format!("column {index} out of range")))
    }

    /// Index of a column by TTYPE name (case-insensitive).
    pub fn find(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| {
            c.name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
    }

    fn check_rows(&self, rows: &Range<usize>) -> Result<()> {
        if rows.start > rows.end || rows.end > self.nrows {
            return Err(Error::InvalidTile(format!(
                "rows {}..{} outside table of {} rows",
                rows.start, rows.end, self.nrows
            )));
        }
        Ok(())
    }

    /// Gather the bytes of one column for a range of rows, row after row.
    pub fn column_bytes(&self, table: &[u8], col: usize, rows: Range<usize>) -> Result<Vec<u8>> {
        self.check_rows(&rows)?;
        let c = self.column(col)?;
        let mut out = Vec::with_capacity(c.width * rows.len());
        for r in rows {
            let start = r * self.row_width + c.offset;
            let cell = table.get(start..start + c.width).ok_or(Error::UnexpectedEof)?;
            out.extend_from_slice(cell);
        }
        Ok(out)
    }

    /// Scatter gathered column bytes back into row storage starting at `first_row`.
    /// `rows` is the row storage of just those rows.
    pub fn put_column_bytes(&self, rows: &mut [u8], col: usize, bytes: &[u8]) -> Result<()> {
        let c = self.column(col)?;
        let nrows = rows.len() / self.row_width.max(1);
        if bytes.len() != c.width * nrows {
            return Err(Error::SizeMismatch {
                expected: c.width * nrows,
                actual: bytes.len(),
            });
        }
        for (r, cell) in bytes.chunks_exact(c.width.max(1)).enumerate() {
            let start = r * self.row_width + c.offset;
            rows[start..start + c.width].copy_from_slice(cell);
        }
        Ok(())
    }

    /// Decode one column of a row range.
    pub fn column_array(&self, table: &[u8], col: usize, rows: Range<usize>) -> Result<Array> {
        let c = self.column(col)?;
        let n = rows.len() * c.elements_per_row();
        let bytes = self.column_bytes(table, col, rows)?;
        codec::decode(&bytes, &[n], c.element_type())
    }
}

/// Read one column of a binary table unit.
pub fn read_column(hdu: &Hdu, col: usize, rows: Range<usize>) -> Result<Array> {
    let layout = TableLayout::from_header(hdu.header())?;
    layout.check_rows(&rows)?;
    let start = rows.start * layout.row_width;
    let len = rows.len() * layout.row_width;
    let bytes = hdu.data().read_range(start, len)?;
    layout.column_array(&bytes, col, 0..rows.len())
}

/// Header of a binary table with the given columns.
pub fn table_header(columns: &[(&str, &str)], nrows: usize, heap_len: usize) -> Result<Header> {
    let mut width = 0;
    for (_, tform) in columns {
        let (repeat, ty) = parse_tform(tform)?;
        width += ty.row_bytes(repeat);
    }
    let mut h = Header::new();
    h.push(Card::new("XTENSION", "BINTABLE", Some("binary table extension")));
    h.push(Card::new("BITPIX", 8i64, None));
    h.push(Card::new("NAXIS", 2i64, None));
    h.push(Card::new("NAXIS1", width, Some("width of table in bytes")));
    h.push(Card::new("NAXIS2", nrows, Some("number of rows in table")));
    h.push(Card::new("PCOUNT", heap_len, Some("size of special data area")));
    h.push(Card::new("GCOUNT", 1i64, None));
    h.push(Card::new("TFIELDS", columns.len(), Some("number of fields in each row")));
    for (i, (name, tform)) in columns.iter().enumerate() {
        h.push(Card::new(&format!("TTYPE{}", i + 1), *name, None));
        h.push(Card::new(&format!("TFORM{}", i + 1), *tform, None));
    }
    Ok(h)
}

/// Build a binary table unit from one array per column.
///
/// Each array holds `nrows * elements_per_row` elements of the column type.
pub fn table_from_columns(columns: &[(&str, &str, &Array)]) -> Result<Hdu> {
    let specs: Vec<(&str, &str)> = columns.iter().map(|(n, t, _)| (*n, *t)).collect();
    let header = table_header(&specs, 0, 0)?;
    let empty_layout = TableLayout::from_header(&header)?;
    let nrows = match (columns.first(), empty_layout.columns.first()) {
        (Some((_, _, a)), Some(c)) => a.len() / c.elements_per_row().max(1),
        _ => 0,
    };
    let mut header = header;
    header.set("NAXIS2", nrows);
    let layout = TableLayout::from_header(&header)?;
    let mut rows = vec![0u8; layout.row_width * nrows];
    for (i, (_, _, array)) in columns.iter().enumerate() {
        let c = &layout.columns[i];
        if array.element_type() != c.element_type() || array.len() != nrows * c.elements_per_row() {
            return Err(Error::SizeMismatch {
                expected: nrows * c.elements_per_row(),
                actual: array.len(),
            });
        }
        layout.put_column_bytes(&mut rows, i, &codec::encode(array)?)?;
    }
    let data = if rows.is_empty() {
        DataUnit::Empty
    } else {
        DataUnit::Realized(rows)
    };
    Ok(Hdu::new(header, data))
}
