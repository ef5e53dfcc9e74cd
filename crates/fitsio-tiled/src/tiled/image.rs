//! Images stored tile by tile in a `ZIMAGE` binary table.

use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::{
    build_table, copy_cards, is_indexed, join_tiles, rename_card, Cell, CellReader,
    CompressionOptions, NullPreservation, OutputColumn,
};
use crate::codec::{self, Array, ElementType};
use crate::compress::quantize::{self, DitherMethod, QuantizeParams, Quantized, NULL_VALUE};
use crate::compress::{gzip, Algorithm, AlgorithmOptions};
use crate::data::DataUnit;
use crate::error::{Error, Result};
use crate::hdu::{image_header, Hdu};
use crate::header::{Card, HduKind, Header};
use crate::tile::{default_tile_shape, image_tiles, validate_region, ImageTile, ImageTiler, Tiler};

const COMPRESSED: &str = "COMPRESSED_DATA";
const GZIP_COMPRESSED: &str = "GZIP_COMPRESSED_DATA";
const UNCOMPRESSED: &str = "UNCOMPRESSED_DATA";
const NULL_MASK: &str = "NULL_PIXEL_MASK";

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

/// Where the bytes of one tile went.
enum Stored {
    Compressed(Vec<u8>),
    /// Floating point pixels that could not be quantized, gzipped.
    Gzip(Vec<u8>),
    /// Pixels of a lossy tile inside a no-loss region, big-endian.
    Raw(Vec<u8>),
}

struct TileOutput {
    stored: Stored,
    params: Option<QuantizeParams>,
    mask: Option<Vec<u8>>,
}

impl TileOutput {
    fn plain(stored: Stored) -> Self {
        TileOutput {
            stored,
            params: None,
            mask: None,
        }
    }
}

struct ImagePass<'a> {
    options: &'a CompressionOptions,
    /// Quantize level when floating point pixels are quantized.
    quantize: Option<f64>,
    /// The pixel algorithm itself loses information.
    lossy: bool,
}

impl ImagePass<'_> {
    fn compress_tile(&self, tiler: &ImageTiler<'_>, tile: &ImageTile) -> Result<TileOutput> {
        let pixels = tiler.get_tile_strided(&tile.corner, &tile.lengths, &tile.step)?;
        let algorithm = self.options.algorithm;
        let algorithm_options = &self.options.algorithm_options;

        let lossy = match self.quantize {
            Some(_) => true,
            None => self.lossy && algorithm.is_lossy_for(&pixels, algorithm_options)?,
        };
        if lossy && self.options.no_loss.iter().any(|(c, l)| tile.intersects(c, l)) {
            debug!(tile = tile.index, "tile inside a no-loss region stored uncompressed");
            return Ok(TileOutput::plain(Stored::Raw(codec::encode(&pixels)?)));
        }

        if let Some(level) = self.quantize {
            let values = pixels.to_f64()?;
            // seed of the 1-based tile row is row + ZDITHER0 - 1
            let seed = tile.index as i64 + self.options.dither_seed;
            let row_len = tile.lengths.first().copied().unwrap_or(1);
            return match quantize::quantize(&values, row_len, level, self.options.dither, seed, None) {
                Quantized::Values { values, params } => {
                    let ints = Array::from_i32(&tile.lengths, values)?;
                    let bytes = algorithm.compress(&ints, algorithm_options)?;
                    debug!(tile = tile.index, bytes = bytes.len(), scale = params.scale, "quantized tile");
                    Ok(TileOutput {
                        stored: Stored::Compressed(bytes),
                        params: Some(params),
                        mask: None,
                    })
                }
                Quantized::NotQuantizable => {
                    warn!(tile = tile.index, "tile cannot be quantized, storing it losslessly");
                    Ok(TileOutput::plain(Stored::Gzip(gzip::compress(&codec::encode(&pixels)?))))
                }
            };
        }

        let mask = match self.options.nulls {
            Some(nulls) if lossy => null_mask(&pixels, nulls)?,
            _ => None,
        };
        let bytes = algorithm.compress(&pixels, algorithm_options)?;
        debug!(tile = tile.index, bytes = bytes.len(), "compressed tile");
        Ok(TileOutput {
            stored: Stored::Compressed(bytes),
            params: None,
            mask,
        })
    }
}

/// Compressed flags of the BLANK pixels of a tile, `None` when it has none.
fn null_mask(pixels: &Array, nulls: NullPreservation) -> Result<Option<Vec<u8>>> {
    let values = pixels.to_i64()?;
    if !values.contains(&nulls.blank) {
        return Ok(None);
    }
    let flags = values.iter().map(|&v| (v == nulls.blank) as i16).collect();
    let mask = Array::from_i16(pixels.shape(), flags)?;
    nulls
        .mask_algorithm
        .compress(&mask, &AlgorithmOptions::default())
        .map(Some)
}

fn heap_cells(outputs: &[TileOutput], pick: impl Fn(&Stored) -> Option<&Vec<u8>>) -> Vec<Cell> {
    outputs
        .iter()
        .map(|o| Cell::Heap(pick(&o.stored).cloned().unwrap_or_default()))
        .collect()
}

fn fixed_cells(outputs: &[TileOutput], field: impl Fn(&QuantizeParams) -> f64, missing: f64) -> Vec<Cell> {
    outputs
        .iter()
        .map(|o| Cell::Fixed(o.params.as_ref().map_or(missing, &field).to_be_bytes().to_vec()))
        .collect()
}

fn tform_code(ty: ElementType) -> Result<char> {
    Ok(match ty.bitpix()? {
        8 => 'B',
        16 => 'I',
        32 => 'J',
        64 => 'K',
        -32 => 'E',
        _ => 'D',
    })
}

/// Keywords of an image header rebuilt from the `Z` keywords.
fn is_image_structural(keyword: &str) -> bool {
    matches!(
        keyword,
        "SIMPLE" | "XTENSION" | "BITPIX" | "NAXIS" | "PCOUNT" | "GCOUNT" | "EXTEND" | "CHECKSUM" | "DATASUM"
    ) || is_indexed(keyword, "NAXIS")
}

/// Compress an image unit into a `ZIMAGE` binary table.
pub fn compress_image(hdu: &Hdu, options: &CompressionOptions) -> Result<Hdu> {
    let header = hdu.header();
    let axes = header.axes()?;
    let ty = hdu.element_type()?;
    let algorithm = options.algorithm;

    let quantize = match (ty.is_float(), options.quantize_level) {
        (true, Some(level)) => Some(level),
        (true, None) if algorithm.needs_integers() => {
            return Err(Error::UnsupportedCompression(format!(
                "{algorithm} needs integer pixels; quantize the {ty:?} image or use GZIP"
            )))
        }
        _ => None,
    };
    let pass = ImagePass {
        options,
        quantize,
        lossy: algorithm.is_lossy(&options.algorithm_options),
    };

    let tiler = ImageTiler::new(hdu)?;
    let tile_shape = options.tile_shape_for(&axes);
    let tiles = image_tiles(&axes, tile_shape.as_deref())?;
    debug!(tiles = tiles.len(), %algorithm, "compressing image");

    let results: Vec<(usize, Result<TileOutput>)> = tiles
        .par_iter()
        .map(|tile| (tile.index, pass.compress_tile(&tiler, tile)))
        .collect();
    let outputs = join_tiles(results)?;

    // ── Table ──

    let n = outputs.len();
    let mut columns = vec![OutputColumn::new(
        COMPRESSED,
        algorithm.column_format(),
        heap_cells(&outputs, |s| match s {
            Stored::Compressed(b) => Some(b),
            _ => None,
        }),
    )];
    if outputs.iter().any(|o| matches!(o.stored, Stored::Gzip(_))) {
        let cells = heap_cells(&outputs, |s| match s {
            Stored::Gzip(b) => Some(b),
            _ => None,
        });
        columns.push(OutputColumn::new(GZIP_COMPRESSED, "1PB", cells));
    }
    if outputs.iter().any(|o| matches!(o.stored, Stored::Raw(_))) {
        let cells = heap_cells(&outputs, |s| match s {
            Stored::Raw(b) => Some(b),
            _ => None,
        });
        columns.push(OutputColumn::new(UNCOMPRESSED, &format!("1P{}", tform_code(ty)?), cells));
    }
    if quantize.is_some() {
        columns.push(OutputColumn::new("ZSCALE", "1D", fixed_cells(&outputs, |p| p.scale, 1.0)));
        columns.push(OutputColumn::new("ZZERO", "1D", fixed_cells(&outputs, |p| p.zero, 0.0)));
    }
    let masked = match options.nulls {
        Some(nulls) if pass.lossy && outputs.iter().any(|o| o.mask.is_some()) => Some(nulls),
        _ => None,
    };
    if let Some(nulls) = masked {
        let cells = outputs
            .iter()
            .map(|o| Cell::Heap(o.mask.clone().unwrap_or_default()))
            .collect();
        columns.push(OutputColumn::new(NULL_MASK, nulls.mask_algorithm.column_format(), cells));
    }
    let (mut out, data) = build_table(&columns, n)?;

    // ── Keywords ──

    out.push(Card::new("ZIMAGE", true, Some("extension contains compressed image")));
    match hdu.kind() {
        HduKind::Primary => out.push(Card::new("ZSIMPLE", true, Some("file does conform to FITS standard"))),
        _ => out.push(Card::new("ZTENSION", "IMAGE", Some("image extension"))),
    }
    out.push(Card::new("ZBITPIX", ty.bitpix()?, Some("data type of original image")));
    out.push(Card::new("ZNAXIS", axes.len(), Some("dimension of original image")));
    for (i, &len) in axes.iter().enumerate() {
        out.push(Card::new(&format!("ZNAXIS{}", i + 1), len, Some("length of original image axis")));
    }
    if hdu.kind() == HduKind::Primary {
        if let Some(extend) = header.get_bool("EXTEND") {
            out.push(Card::new("ZEXTEND", extend, None));
        }
    } else {
        out.push(Card::new("ZPCOUNT", header.get_int("PCOUNT").unwrap_or(0), None));
        out.push(Card::new("ZGCOUNT", header.get_int("GCOUNT").unwrap_or(1), None));
    }
    let nominal = tiles
        .first()
        .map(|t| t.lengths.clone())
        .unwrap_or_else(|| default_tile_shape(&axes));
    for (i, &len) in nominal.iter().enumerate() {
        out.push(Card::new(&format!("ZTILE{}", i + 1), len, Some("size of tiles to be compressed")));
    }
    out.push(Card::new("ZCMPTYPE", algorithm.name(), Some("compression algorithm")));
    let compressed_type = if quantize.is_some() { ElementType::I32 } else { ty };
    options
        .algorithm_options
        .write_keywords(&mut out, algorithm, compressed_type);
    if quantize.is_some() {
        out.push(Card::new("ZQUANTIZ", options.dither.name(), Some("pixel quantization method")));
        if options.dither != DitherMethod::NoDither {
            out.push(Card::new("ZDITHER0", options.dither_seed, Some("dithering offset")));
        }
        out.push(Card::new("ZBLANK", NULL_VALUE as i64, Some("null value of quantized pixels")));
    }
    if let Some(nulls) = masked {
        out.push(Card::new("ZBLANK", nulls.blank, Some("null value of the image")));
        out.push(Card::new("ZMASKCMP", nulls.mask_algorithm.name(), Some("null pixel mask compression")));
    }
    copy_cards(header, &mut out, is_image_structural);
    rename_card(header, &mut out, "CHECKSUM", "ZHECKSUM");
    rename_card(header, &mut out, "DATASUM", "ZDATASUM");

    info!(
        tiles = n,
        %algorithm,
        bytes = data.len(),
        original = header.data_len().unwrap_or(0),
        "compressed image"
    );
    Ok(Hdu::new(out, data))
}

// ---------------------------------------------------------------------------
// Decompression
// ---------------------------------------------------------------------------

/// What it takes to decode any tile of one compressed image.
struct CompressedImage {
    cells: CellReader,
    ty: ElementType,
    axes: Vec<usize>,
    tiles: Vec<ImageTile>,
    algorithm: Algorithm,
    options: AlgorithmOptions,
    compressed: usize,
    gzip: Option<usize>,
    raw: Option<usize>,
    zscale: Option<usize>,
    zzero: Option<usize>,
    zblank_column: Option<usize>,
    zblank: Option<i64>,
    dither: DitherMethod,
    dither_seed: i64,
    mask: Option<(usize, Algorithm)>,
}

impl CompressedImage {
    fn open(hdu: &Hdu) -> Result<Self> {
        if !hdu.is_compressed_image() {
            return Err(Error::InvalidHeader("not a compressed image (ZIMAGE = T)".into()));
        }
        let h = hdu.header();
        let ty = ElementType::from_bitpix(h.require_int("ZBITPIX")?)?;
        let naxis = h.require_usize("ZNAXIS")?;
        let axes = (1..=naxis)
            .map(|i| h.require_usize(&format!("ZNAXIS{i}")))
            .collect::<Result<Vec<_>>>()?;
        let defaults = default_tile_shape(&axes);
        let tile_shape = (1..=naxis)
            .map(|i| match h.get_int(&format!("ZTILE{i}")) {
                Some(t) => usize::try_from(t).map_err(|_| Error::InvalidValue(format!("ZTILE{i}"))),
                None => Ok(defaults[i - 1]),
            })
            .collect::<Result<Vec<_>>>()?;
        let tiles = image_tiles(&axes, Some(&tile_shape))?;

        let cells = CellReader::new(hdu)?;
        if cells.layout.nrows != tiles.len() {
            return Err(Error::SizeMismatch {
                expected: tiles.len(),
                actual: cells.layout.nrows,
            });
        }
        let compressed = cells
            .find(COMPRESSED)
            .ok_or_else(|| Error::MissingKeyword(format!("TTYPEn = '{COMPRESSED}'")))?;
        let dither = match h.get_str("ZQUANTIZ") {
            Some(name) => DitherMethod::from_name(name)?,
            None => DitherMethod::NoDither,
        };
        let mask = match cells.find(NULL_MASK) {
            Some(col) => {
                let algorithm = match h.get_str("ZMASKCMP") {
                    Some(name) => Algorithm::from_name(name)?,
                    None => Algorithm::Rice,
                };
                Some((col, algorithm))
            }
            None => None,
        };
        Ok(CompressedImage {
            ty,
            axes,
            tiles,
            algorithm: Algorithm::from_name(h.require_str("ZCMPTYPE")?)?,
            options: AlgorithmOptions::from_header(h)?,
            compressed,
            gzip: cells.find(GZIP_COMPRESSED),
            raw: cells.find(UNCOMPRESSED),
            zscale: cells.find("ZSCALE"),
            zzero: cells.find("ZZERO"),
            zblank_column: cells.find("ZBLANK"),
            zblank: h.get_int("ZBLANK"),
            dither,
            dither_seed: h.get_int("ZDITHER0").unwrap_or(1),
            mask,
            cells,
        })
    }

    fn blank(&self, row: usize) -> Result<Option<i64>> {
        match self.zblank_column {
            Some(col) => self.cells.int(col, row).map(Some),
            None => Ok(self.zblank),
        }
    }

    fn non_empty(&self, col: Option<usize>, row: usize) -> Result<Option<&[u8]>> {
        match col {
            Some(col) => Ok(Some(self.cells.heap_cell(col, row)?).filter(|c| !c.is_empty())),
            None => Ok(None),
        }
    }

    fn decode_tile(&self, tile: &ImageTile) -> Result<Array> {
        let row = tile.index;
        if let Some(cell) = self.non_empty(self.raw, row)? {
            return codec::decode(cell, &tile.lengths, self.ty);
        }
        if let Some(cell) = self.non_empty(self.gzip, row)? {
            return codec::decode(&gzip::decompress(cell)?, &tile.lengths, self.ty);
        }
        let cell = self.cells.heap_cell(self.compressed, row)?;

        if let (Some(zscale), true) = (self.zscale, self.ty.is_float()) {
            let mut ints = Array::zeros(&tile.lengths, ElementType::I32);
            self.algorithm.decompress(cell, &mut ints, &self.options)?;
            let null_code = self.blank(row)?;
            let q: Vec<i32> = ints
                .to_i64()?
                .into_iter()
                .map(|v| if Some(v) == null_code { NULL_VALUE } else { v as i32 })
                .collect();
            let params = QuantizeParams {
                scale: self.cells.float(zscale, row)?,
                zero: match self.zzero {
                    Some(col) => self.cells.float(col, row)?,
                    None => 0.0,
                },
                method: self.dither,
                seed: row as i64 + self.dither_seed,
            };
            let mut values = vec![0f64; q.len()];
            quantize::dequantize(&q, &params, f64::NAN, &mut values)?;
            let mut out = Array::zeros(&tile.lengths, self.ty);
            out.fill_from_f64(&values)?;
            return Ok(out);
        }

        let mut out = Array::zeros(&tile.lengths, self.ty);
        self.algorithm.decompress(cell, &mut out, &self.options)?;
        if let Some((col, mask_algorithm)) = self.mask {
            let cell = self.cells.heap_cell(col, row)?;
            if !cell.is_empty() {
                let blank = self.blank(row)?.ok_or_else(|| Error::MissingKeyword("ZBLANK".into()))?;
                let mut flags = Array::zeros(&tile.lengths, ElementType::I16);
                mask_algorithm.decompress(cell, &mut flags, &AlgorithmOptions::default())?;
                let mut values = out.to_i64()?;
                for (v, f) in values.iter_mut().zip(flags.to_i64()?) {
                    if f != 0 {
                        *v = blank;
                    }
                }
                out.fill_from_i64(&values)?;
            }
        }
        Ok(out)
    }
}

/// Copy the overlap of two pixel boxes. Corners are absolute image
/// coordinates and lengths are each buffer's extents, first axis fastest.
fn copy_overlap(
    src: &[u8],
    (src_corner, src_lengths): (&[usize], &[usize]),
    dst: &mut [u8],
    (dst_corner, dst_lengths): (&[usize], &[usize]),
    width: usize,
) {
    let n = src_corner.len();
    let lo: Vec<usize> = (0..n).map(|k| src_corner[k].max(dst_corner[k])).collect();
    let hi: Vec<usize> = (0..n)
        .map(|k| (src_corner[k] + src_lengths[k]).min(dst_corner[k] + dst_lengths[k]))
        .collect();
    if n == 0 || (0..n).any(|k| lo[k] >= hi[k]) {
        return;
    }
    let offset = |corner: &[usize], lengths: &[usize], at: &[usize]| {
        let mut offset = 0;
        let mut stride = 1;
        for k in 0..n {
            offset += (at[k] - corner[k]) * stride;
            stride *= lengths[k];
        }
        offset * width
    };
    let span = (hi[0] - lo[0]) * width;
    let mut at = lo.clone();
    loop {
        let s = offset(src_corner, src_lengths, &at);
        let d = offset(dst_corner, dst_lengths, &at);
        dst[d..d + span].copy_from_slice(&src[s..s + span]);
        let mut k = 1;
        loop {
            if k == n {
                return;
            }
            at[k] += 1;
            if at[k] < hi[k] {
                break;
            }
            at[k] = lo[k];
            k += 1;
        }
    }
}

/// Decompress a `ZIMAGE` table into an array.
///
/// The destination is split into bands along the last axis, one band per
/// row of tiles, and bands are filled in parallel.
pub fn read_compressed_image(hdu: &Hdu) -> Result<Array> {
    let image = CompressedImage::open(hdu)?;
    let width = image.ty.width();
    let axes = &image.axes;
    let mut bytes = vec![0u8; axes.iter().product::<usize>() * width];
    let Some(first) = image.tiles.first() else {
        return codec::decode(&bytes, axes, image.ty);
    };

    let last = axes.len() - 1;
    let band_extent = first.lengths[last];
    let plane = axes[..last].iter().product::<usize>() * width;
    let per_band = image.tiles.len() / axes[last].div_ceil(band_extent);

    let results: Vec<Result<()>> = bytes
        .par_chunks_mut(band_extent * plane)
        .enumerate()
        .map(|(b, band)| {
            let mut corner = vec![0; axes.len()];
            corner[last] = b * band_extent;
            let mut lengths = axes.clone();
            lengths[last] = band.len() / plane;
            for tile in &image.tiles[b * per_band..(b + 1) * per_band] {
                let pixels = image
                    .decode_tile(tile)
                    .and_then(|a| codec::encode(&a))
                    .map_err(|e| e.in_tile(tile.index))?;
                copy_overlap(
                    &pixels,
                    (&tile.corner, &tile.lengths),
                    band,
                    (&corner, &lengths),
                    width,
                );
            }
            Ok(())
        })
        .collect();
    results.into_iter().collect::<Result<Vec<()>>>()?;
    debug!(tiles = image.tiles.len(), "decompressed image");
    codec::decode(&bytes, axes, image.ty)
}

/// Decompress only the tiles overlapping `corner..corner+lengths`.
pub fn read_compressed_region(hdu: &Hdu, corner: &[usize], lengths: &[usize]) -> Result<Array> {
    let image = CompressedImage::open(hdu)?;
    let steps = vec![1; image.axes.len()];
    validate_region(&image.axes, corner, lengths, &steps)?;
    let width = image.ty.width();

    let wanted: Vec<&ImageTile> = image
        .tiles
        .iter()
        .filter(|t| t.intersects(corner, lengths))
        .collect();
    let results: Vec<(usize, Result<Vec<u8>>)> = wanted
        .par_iter()
        .map(|t| (t.index, image.decode_tile(t).and_then(|a| codec::encode(&a))))
        .collect();
    let decoded = join_tiles(results)?;

    let mut bytes = vec![0u8; lengths.iter().product::<usize>() * width];
    for (tile, pixels) in wanted.iter().zip(&decoded) {
        copy_overlap(
            pixels,
            (&tile.corner, &tile.lengths),
            &mut bytes,
            (corner, lengths),
            width,
        );
    }
    debug!(tiles = wanted.len(), of = image.tiles.len(), "decompressed region");
    codec::decode(&bytes, lengths, image.ty)
}

/// Keywords that describe the compressed table rather than the image.
fn is_compression_keyword(keyword: &str) -> bool {
    const FIXED: &[&str] = &[
        "SIMPLE", "XTENSION", "BITPIX", "NAXIS", "PCOUNT", "GCOUNT", "TFIELDS", "THEAP", "EXTEND",
        "CHECKSUM", "DATASUM", "ZIMAGE", "ZCMPTYPE", "ZBITPIX", "ZNAXIS", "ZQUANTIZ", "ZDITHER0",
        "ZSIMPLE", "ZTENSION", "ZPCOUNT", "ZGCOUNT", "ZEXTEND", "ZBLANK", "ZMASKCMP", "ZHECKSUM",
        "ZDATASUM",
    ];
    const INDEXED: &[&str] = &[
        "NAXIS", "ZNAXIS", "ZTILE", "ZNAME", "ZVAL", "TTYPE", "TFORM", "TUNIT", "TDIM", "TNULL",
        "TSCAL", "TZERO", "TDISP",
    ];
    FIXED.contains(&keyword) || INDEXED.iter().any(|p| is_indexed(keyword, p))
}

/// Restore the image unit a `ZIMAGE` table was made from.
pub fn decompress_image(hdu: &Hdu) -> Result<Hdu> {
    let array = read_compressed_image(hdu)?;
    let h = hdu.header();
    let primary = h.get_bool("ZSIMPLE") == Some(true);
    let mut out: Header = image_header(primary, array.element_type().bitpix()?, array.shape());
    if primary {
        if let Some(extend) = h.get_bool("ZEXTEND") {
            out.push(Card::new("EXTEND", extend, None));
        }
    } else {
        if let Some(pcount) = h.get_int("ZPCOUNT") {
            out.set("PCOUNT", pcount);
        }
        if let Some(gcount) = h.get_int("ZGCOUNT") {
            out.set("GCOUNT", gcount);
        }
    }
    copy_cards(h, &mut out, is_compression_keyword);
    rename_card(h, &mut out, "ZHECKSUM", "CHECKSUM");
    rename_card(h, &mut out, "ZDATASUM", "DATASUM");

    let data = if array.is_empty() {
        DataUnit::Empty
    } else {
        DataUnit::Realized(codec::encode(&array)?)
    };
    info!(shape = ?array.shape(), primary, "decompressed image");
    Ok(Hdu::new(out, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumStatus;

    fn noise(n: usize, seed: u64) -> Vec<f64> {
        let mut x = seed;
        (0..n)
            .map(|_| {
                x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((x >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
            })
            .collect()
    }

    fn int_image(shape: &[usize]) -> Array {
        let n: usize = shape.iter().product();
        Array::from_i32(shape, (0..n as i32).map(|i| (i * 37) % 1001 - 500).collect()).unwrap()
    }

    fn roundtrip(hdu: &Hdu, options: &CompressionOptions) -> Hdu {
        let compressed = compress_image(hdu, options).unwrap();
        assert!(compressed.is_compressed_image());
        compressed.header().validate(false).unwrap();
        compressed
    }

    // ---- keywords ----

    #[test]
    fn rice_tiles_and_keywords() {
        let image = Array::from_i16(&[13, 9], (0..117).map(|i| (i * 11 % 300) as i16).collect()).unwrap();
        let hdu = Hdu::from_array(&image, false).unwrap();
        let options = CompressionOptions::new(Algorithm::Rice).with_tile_shape(&[5, 4]);
        let compressed = roundtrip(&hdu, &options);
        let h = compressed.header();
        assert_eq!(h.get_int("NAXIS2"), Some(9));
        assert_eq!(h.get_int("ZTILE1"), Some(5));
        assert_eq!(h.get_int("ZTILE2"), Some(4));
        assert_eq!(h.get_str("ZCMPTYPE"), Some("RICE_1"));
        assert_eq!(h.get_int("ZBITPIX"), Some(16));
        assert_eq!(h.get_int("ZNAXIS1"), Some(13));
        assert_eq!(h.get_str("ZTENSION"), Some("IMAGE"));
        assert_eq!(h.get_str("ZNAME2"), Some("BYTEPIX"));
        assert_eq!(h.get_int("ZVAL2"), Some(2));
        assert!(!h.contains("ZQUANTIZ"));
        assert_eq!(read_compressed_image(&compressed).unwrap(), image);
    }

    #[test]
    fn every_algorithm_is_exact_on_integers() {
        let image = int_image(&[20, 6]);
        let hdu = Hdu::from_array(&image, false).unwrap();
        for algorithm in [
            Algorithm::Rice,
            Algorithm::HCompress,
            Algorithm::Gzip1,
            Algorithm::Gzip2,
            Algorithm::NoCompress,
        ] {
            let options = CompressionOptions::new(algorithm).with_tile_shape(&[8, 3]);
            let compressed = roundtrip(&hdu, &options);
            assert_eq!(read_compressed_image(&compressed).unwrap(), image, "{algorithm}");
        }
        let mask = Array::from_u8(&[30, 4], (0..120).map(|i| (i / 9 % 3) as u8).collect()).unwrap();
        let hdu = Hdu::from_array(&mask, false).unwrap();
        let compressed = roundtrip(&hdu, &CompressionOptions::new(Algorithm::Plio));
        assert_eq!(compressed.header().get_str("TFORM1").map(|t| &t[..3]), Some("1PI"));
        assert_eq!(read_compressed_image(&compressed).unwrap(), mask);
    }

    #[test]
    fn three_dimensional_edge_tiles() {
        let image = int_image(&[7, 5, 3]);
        let hdu = Hdu::from_array(&image, false).unwrap();
        let options = CompressionOptions::new(Algorithm::Gzip2).with_tile_shape(&[4, 2, 2]);
        let compressed = roundtrip(&hdu, &options);
        assert_eq!(compressed.header().get_int("NAXIS2"), Some(2 * 3 * 2));
        assert_eq!(read_compressed_image(&compressed).unwrap(), image);
    }

    // ---- quantization ----

    #[test]
    fn quantized_floats_within_half_a_step() {
        let values: Vec<f32> = noise(64 * 16, 7).iter().map(|v| (100.0 + 3.0 * v) as f32).collect();
        let mut with_nan = values.clone();
        with_nan[17] = f32::NAN;
        let image = Array::from_f32(&[64, 16], with_nan.clone()).unwrap();
        let hdu = Hdu::from_array(&image, false).unwrap();
        let options = CompressionOptions::new(Algorithm::Rice).with_tile_shape(&[64, 4]);
        let compressed = roundtrip(&hdu, &options);
        let h = compressed.header();
        assert_eq!(h.get_str("ZQUANTIZ"), Some("SUBTRACTIVE_DITHER_1"));
        assert_eq!(h.get_int("ZDITHER0"), Some(1));
        assert_eq!(h.get_int("ZVAL2"), Some(4));

        let cells = CellReader::new(&compressed).unwrap();
        let zscale = cells.find("ZSCALE").unwrap();
        let back = read_compressed_image(&compressed).unwrap().to_f64().unwrap();
        assert!(back[17].is_nan());
        for (i, (&orig, &got)) in with_nan.iter().zip(&back).enumerate() {
            if i == 17 {
                continue;
            }
            let step = cells.float(zscale, i / (64 * 4)).unwrap();
            assert!(step > 0.0);
            assert!((orig as f64 - got).abs() <= 0.5 * step + 1e-4, "pixel {i}");
        }
    }

    #[test]
    fn dithering_is_reproducible() {
        let values: Vec<f64> = noise(50 * 10, 3).iter().map(|v| v * 10.0).collect();
        let hdu = Hdu::from_array(&Array::from_f64(&[50, 10], values).unwrap(), false).unwrap();
        let options = CompressionOptions::new(Algorithm::Gzip1)
            .with_dither(DitherMethod::SubtractiveDither2, 42)
            .with_tile_shape(&[50, 5]);
        let a = compress_image(&hdu, &options).unwrap();
        let b = compress_image(&hdu, &options).unwrap();
        assert_eq!(a.data().bytes().unwrap(), b.data().bytes().unwrap());
        assert_eq!(a.header().get_int("ZDITHER0"), Some(42));
        let first = read_compressed_image(&a).unwrap();
        assert_eq!(first, read_compressed_image(&b).unwrap());
    }

    #[test]
    fn constant_float_tile_falls_back_to_gzip() {
        let mut values = vec![2.5f32; 40];
        values.extend(noise(40, 9).iter().map(|&v| v as f32));
        let image = Array::from_f32(&[40, 2], values).unwrap();
        let hdu = Hdu::from_array(&image, false).unwrap();
        let compressed = roundtrip(&hdu, &CompressionOptions::new(Algorithm::Rice));
        let cells = CellReader::new(&compressed).unwrap();
        let gz = cells.find(GZIP_COMPRESSED).unwrap();
        assert!(!cells.heap_cell(gz, 0).unwrap().is_empty());
        assert!(cells.heap_cell(gz, 1).unwrap().is_empty());
        let back = read_compressed_image(&compressed).unwrap().to_f64().unwrap();
        assert!(back[..40].iter().all(|&v| v == 2.5));
    }

    #[test]
    fn lossless_floats_need_a_byte_algorithm() {
        let image = Array::from_f64(&[4, 2], vec![0.1, 0.2, -3.0, 1e-300, 5.0, 6.0, 7.0, f64::MAX]).unwrap();
        let hdu = Hdu::from_array(&image, false).unwrap();
        let gzip = CompressionOptions::new(Algorithm::Gzip2).with_quantize_level(None);
        let compressed = roundtrip(&hdu, &gzip);
        assert_eq!(read_compressed_image(&compressed).unwrap(), image);
        let rice = CompressionOptions::new(Algorithm::Rice).with_quantize_level(None);
        assert!(matches!(
            compress_image(&hdu, &rice),
            Err(Error::UnsupportedCompression(_))
        ));
    }

    // ---- lossy integer tiles ----

    #[test]
    fn no_loss_region_keeps_tiles_exact() {
        let image = int_image(&[16, 16]);
        let hdu = Hdu::from_array(&image, false).unwrap();
        let options = CompressionOptions::new(Algorithm::HCompress)
            .with_algorithm_options(AlgorithmOptions::default().with_scale(16.0))
            .with_tile_shape(&[16, 4])
            .force_no_loss(&[2, 5], &[3, 2]);
        let compressed = roundtrip(&hdu, &options);
        let cells = CellReader::new(&compressed).unwrap();
        let raw = cells.find(UNCOMPRESSED).unwrap();
        assert_eq!(compressed.header().get_str("TFORM2").map(|t| &t[..3]), Some("1PJ"));
        assert!(cells.heap_cell(raw, 0).unwrap().is_empty());
        assert!(!cells.heap_cell(raw, 1).unwrap().is_empty());

        let back = read_compressed_image(&compressed).unwrap().to_i64().unwrap();
        let orig = image.to_i64().unwrap();
        assert_eq!(back[16 * 4..16 * 8], orig[16 * 4..16 * 8]);
        assert_ne!(back[..16 * 4], orig[..16 * 4]);
    }

    #[test]
    fn noise_relative_scale_on_smooth_tiles_stays_compressed() {
        // rows are linear ramps, so a scale relative to the noise resolves to 0
        let image = Array::from_i32(&[16, 8], (0..128).collect()).unwrap();
        let hdu = Hdu::from_array(&image, false).unwrap();
        let options = CompressionOptions::new(Algorithm::HCompress)
            .with_algorithm_options(AlgorithmOptions::default().with_scale(-2.0))
            .with_tile_shape(&[16, 4])
            .force_no_loss(&[0, 0], &[16, 8]);
        let compressed = roundtrip(&hdu, &options);
        let cells = CellReader::new(&compressed).unwrap();
        let packed = cells.find(COMPRESSED).unwrap();
        for tile in 0..2 {
            assert!(!cells.heap_cell(packed, tile).unwrap().is_empty());
        }
        assert!(cells.find(UNCOMPRESSED).is_none());
        assert_eq!(read_compressed_image(&compressed).unwrap(), image);
    }

    #[test]
    fn null_mask_restores_blank_pixels() {
        let blank = -999i64;
        let mut values: Vec<i32> = (0..256).map(|i| ((i * 53) % 400) as i32).collect();
        for i in [3, 40, 41, 200] {
            values[i] = blank as i32;
        }
        let image = Array::from_i32(&[16, 16], values.clone()).unwrap();
        let hdu = Hdu::from_array(&image, false).unwrap();
        let options = CompressionOptions::new(Algorithm::HCompress)
            .with_algorithm_options(AlgorithmOptions::default().with_scale(8.0))
            .with_tile_shape(&[16, 8])
            .preserve_nulls(blank, Algorithm::Plio);
        let compressed = roundtrip(&hdu, &options);
        let h = compressed.header();
        assert_eq!(h.get_int("ZBLANK"), Some(blank));
        assert_eq!(h.get_str("ZMASKCMP"), Some("PLIO_1"));
        let back = read_compressed_image(&compressed).unwrap().to_i64().unwrap();
        for i in 0..256 {
            if values[i] as i64 == blank {
                assert_eq!(back[i], blank);
            } else {
                assert_ne!(back[i], blank);
            }
        }
    }

    // ---- errors ----

    #[test]
    fn lowest_failing_tile_is_reported() {
        let mut values: Vec<i32> = vec![1; 40];
        values[25] = -1;
        values[35] = -2;
        let hdu = Hdu::from_array(&Array::from_i32(&[10, 4], values).unwrap(), false).unwrap();
        let err = compress_image(&hdu, &CompressionOptions::new(Algorithm::Plio)).unwrap_err();
        match err {
            Error::Tile { index, source } => {
                assert_eq!(index, 2);
                assert!(matches!(*source, Error::ValueOutOfRange(-1)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn plain_tables_are_not_compressed_images() {
        let hdu = Hdu::from_array(&int_image(&[4]), false).unwrap();
        assert!(matches!(read_compressed_image(&hdu), Err(Error::InvalidHeader(_))));
    }

    // ---- regions and headers ----

    #[test]
    fn region_decodes_only_what_it_needs() {
        let image = int_image(&[12, 10]);
        let hdu = Hdu::from_array(&image, false).unwrap();
        let compressed = roundtrip(&hdu, &CompressionOptions::new(Algorithm::Rice).with_tile_shape(&[5, 3]));
        let region = read_compressed_region(&compressed, &[3, 2], &[6, 5]).unwrap();
        assert_eq!(region.shape(), &[6, 5]);
        let all = image.to_i64().unwrap();
        let got = region.to_i64().unwrap();
        for y in 0..5 {
            for x in 0..6 {
                assert_eq!(got[y * 6 + x], all[(y + 2) * 12 + x + 3]);
            }
        }
        assert!(matches!(
            read_compressed_region(&compressed, &[10, 0], &[5, 1]),
            Err(Error::InvalidTile(_))
        ));
    }

    #[test]
    fn primary_keywords_are_backed_up_and_restored() {
        let image = int_image(&[6, 4]);
        let mut hdu = Hdu::from_array(&image, true).unwrap();
        hdu.header_mut().set("OBJECT", "NGC 1300");
        hdu.set_checksum().unwrap();
        let compressed = roundtrip(&hdu, &CompressionOptions::new(Algorithm::Gzip1));
        let h = compressed.header();
        assert_eq!(h.get_bool("ZSIMPLE"), Some(true));
        assert_eq!(h.get_bool("ZEXTEND"), Some(true));
        assert!(h.contains("ZHECKSUM"));
        assert!(h.contains("ZDATASUM"));
        assert!(!h.contains("CHECKSUM"));
        assert_eq!(h.get_str("OBJECT"), Some("NGC 1300"));

        let restored = decompress_image(&compressed).unwrap();
        assert_eq!(restored.kind(), HduKind::Primary);
        assert_eq!(restored.read_image().unwrap(), image);
        assert_eq!(restored.header().get_str("OBJECT"), Some("NGC 1300"));
        assert!(!restored.header().contains("ZIMAGE"));
        assert!(!restored.header().contains("TFIELDS"));
        assert_eq!(restored.verify_checksum().unwrap(), ChecksumStatus::Valid);
    }
}
