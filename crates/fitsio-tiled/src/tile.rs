//! Tile partitioning and random access to image regions.

use crate::codec::{self, Array, ElementType};
use crate::error::{Error, Result};
use crate::hdu::Hdu;

/// One tile of an image. Corner, lengths and step are in FITS axis order.
///
/// Tiles from [`image_tiles`] always have a unit step: they cover the image
/// exactly and never overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTile {
    pub index: usize,
    pub corner: Vec<usize>,
    pub lengths: Vec<usize>,
    pub step: Vec<usize>,
}

impl ImageTile {
    pub fn len(&self) -> usize {
        self.lengths.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the tile overlaps the region `corner..corner+lengths`.
    pub fn intersects(&self, corner: &[usize], lengths: &[usize]) -> bool {
        self.corner
            .iter()
            .zip(&self.lengths)
            .zip(corner.iter().zip(lengths))
            .all(|((&tc, &tl), (&rc, &rl))| tc < rc + rl && rc < tc + tl)
    }
}

/// A run of table rows compressed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTile {
    pub index: usize,
    pub first_row: usize,
    pub nrows: usize,
}

/// Tile shape used when none is given: one row along the first axis.
pub fn default_tile_shape(axes: &[usize]) -> Vec<usize> {
    axes.iter()
        .enumerate()
        .map(|(i, &n)| if i == 0 { n.max(1) } else { 1 })
        .collect()
}

/// Partition an image into tiles. Edge tiles are truncated. A zero tile
/// extent stands for the whole axis.
pub fn image_tiles(axes: &[usize], tile_shape: Option<&[usize]>) -> Result<Vec<ImageTile>> {
    let shape: Vec<usize> = match tile_shape {
        None => default_tile_shape(axes),
        Some(s) if s.len() == axes.len() => s
            .iter()
            .zip(axes)
            .map(|(&t, &n)| if t == 0 { n.max(1) } else { t.min(n.max(1)) })
            .collect(),
        Some(s) => {
            return Err(Error::InvalidTile(format!(
                "tile shape has {} axes, image has {}",
                s.len(),
                axes.len()
            )))
        }
    };
    if axes.is_empty() || axes.iter().any(|&n| n == 0) {
        return Ok(Vec::new());
    }
    let counts: Vec<usize> = axes.iter().zip(&shape).map(|(&n, &t)| n.div_ceil(t)).collect();
    let total: usize = counts.iter().product();
    let mut tiles = Vec::with_capacity(total);
    let mut pos = vec![0usize; axes.len()];
    for index in 0..total {
        let corner: Vec<usize> = pos.iter().zip(&shape).map(|(&p, &t)| p * t).collect();
        let lengths = corner
            .iter()
            .zip(&shape)
            .zip(axes)
            .map(|((&c, &t), &n)| t.min(n - c))
            .collect();
        tiles.push(ImageTile {
            index,
            corner,
            lengths,
            step: vec![1; axes.len()],
        });
        for (p, &c) in pos.iter_mut().zip(&counts) {
            *p += 1;
            if *p < c {
                break;
            }
            *p = 0;
        }
    }
    Ok(tiles)
}

/// Partition `nrows` rows into tiles of `rows_per_tile` (all rows when `None`).
pub fn table_tiles(nrows: usize, rows_per_tile: Option<usize>) -> Result<Vec<TableTile>> {
    let per = match rows_per_tile {
        Some(0) => return Err(Error::InvalidTile("zero rows per tile".into())),
        Some(n) => n,
        None => nrows.max(1),
    };
    Ok((0..nrows.div_ceil(per))
        .map(|index| {
            let first_row = index * per;
            TableTile {
                index,
                first_row,
                nrows: per.min(nrows - first_row),
            }
        })
        .collect())
}

/// Check a region request against the image axes.
pub fn validate_region(
    axes: &[usize],
    corners: &[usize],
    lengths: &[usize],
    steps: &[usize],
) -> Result<()> {
    if corners.len() != axes.len() || lengths.len() != axes.len() || steps.len() != axes.len() {
        return Err(Error::InvalidTile(format!(
            "region needs {} axes, got corners {}, lengths {}, steps {}",
            axes.len(),
            corners.len(),
            lengths.len(),
            steps.len()
        )));
    }
    for (i, (((&n, &c), &l), &s)) in axes.iter().zip(corners).zip(lengths).zip(steps).enumerate() {
        if s == 0 {
            return Err(Error::InvalidTile(format!("step on axis {} must be positive", i + 1)));
        }
        if c.checked_add(l).is_none_or(|end| end > n) {
            return Err(Error::InvalidTile(format!(
                "axis {}: {}..{} outside 0..{}",
                i + 1,
                c,
                c.saturating_add(l),
                n
            )));
        }
    }
    Ok(())
}

/// Output extents of a strided region.
pub fn strided_shape(lengths: &[usize], steps: &[usize]) -> Vec<usize> {
    lengths.iter().zip(steps).map(|(&l, &s)| l.div_ceil(s)).collect()
}

/// Element offsets of the first element of every output row of a strided
/// region, in output order.
pub(crate) fn row_starts(
    axes: &[usize],
    corners: &[usize],
    lengths: &[usize],
    steps: &[usize],
) -> Vec<usize> {
    if axes.is_empty() {
        return Vec::new();
    }
    let mut strides = vec![1usize; axes.len()];
    for k in 1..axes.len() {
        strides[k] = strides[k - 1] * axes[k - 1];
    }
    let out = strided_shape(lengths, steps);
    if out.iter().any(|&n| n == 0) {
        return Vec::new();
    }
    let nrows: usize = out[1..].iter().product();
    let mut starts = Vec::with_capacity(nrows);
    let mut idx = vec![0usize; axes.len()];
    for _ in 0..nrows {
        let offset = (0..axes.len())
            .map(|k| (corners[k] + idx[k] * steps[k]) * strides[k])
            .sum();
        starts.push(offset);
        for k in 1..axes.len() {
            idx[k] += 1;
            if idx[k] < out[k] {
                break;
            }
            idx[k] = 0;
        }
    }
    starts
}

/// Gather a strided region. `read_span(first_element, count)` returns the
/// bytes of `count` consecutive elements.
fn gather<F>(
    axes: &[usize],
    ty: ElementType,
    corners: &[usize],
    lengths: &[usize],
    steps: &[usize],
    mut read_span: F,
) -> Result<Array>
where
    F: FnMut(usize, usize) -> Result<Vec<u8>>,
{
    validate_region(axes, corners, lengths, steps)?;
    let width = ty.width();
    let shape = strided_shape(lengths, steps);
    let per_row = shape.first().copied().unwrap_or(0);
    let mut bytes = Vec::with_capacity(shape.iter().product::<usize>() * width);
    for start in row_starts(axes, corners, lengths, steps) {
        let span = read_span(start, lengths[0])?;
        if steps[0] == 1 {
            bytes.extend_from_slice(&span);
        } else {
            for i in 0..per_row {
                let at = i * steps[0] * width;
                bytes.extend_from_slice(&span[at..at + width]);
            }
        }
    }
    codec::decode(&bytes, &shape, ty)
}

/// Random access to rectangular regions of an image.
pub trait Tiler {
    fn axes(&self) -> &[usize];

    fn element_type(&self) -> ElementType;

    fn get_tile(&self, corners: &[usize], lengths: &[usize]) -> Result<Array>;

    /// Strided read; only unit steps are supported unless overridden.
    fn get_tile_strided(&self, corners: &[usize], lengths: &[usize], steps: &[usize]) -> Result<Array> {
        if steps.iter().all(|&s| s == 1) {
            self.get_tile(corners, lengths)
        } else {
            Err(Error::StridingUnsupported)
        }
    }

    fn complete_image(&self) -> Result<Array> {
        let corners = vec![0; self.axes().len()];
        let axes = self.axes().to_vec();
        self.get_tile(&corners, &axes)
    }
}

/// Tiler over an image unit that reads only the requested rows.
pub struct ImageTiler<'a> {
    hdu: &'a Hdu,
    axes: Vec<usize>,
    ty: ElementType,
}

impl<'a> ImageTiler<'a> {
    pub fn new(hdu: &'a Hdu) -> Result<Self> {
        Ok(ImageTiler {
            axes: hdu.header().axes()?,
            ty: hdu.element_type()?,
            hdu,
        })
    }

    /// New image unit holding a strided region. NAXISn are the strided extents.
    pub fn cutout(&self, corners: &[usize], lengths: &[usize], steps: &[usize]) -> Result<Hdu> {
        let array = self.get_tile_strided(corners, lengths, steps)?;
        let mut hdu = Hdu::from_array(&array, false)?;
        for key in ["BSCALE", "BZERO", "BUNIT", "BLANK", "OBJECT"] {
            if let Some(card) = self.hdu.header().card(key) {
                hdu.header_mut().push(card.clone());
            }
        }
        Ok(hdu)
    }
}

impl Tiler for ImageTiler<'_> {
    fn axes(&self) -> &[usize] {
        &self.axes
    }

    fn element_type(&self) -> ElementType {
        self.ty
    }

    fn get_tile(&self, corners: &[usize], lengths: &[usize]) -> Result<Array> {
        let steps = vec![1; self.axes.len()];
        self.get_tile_strided(corners, lengths, &steps)
    }

    fn get_tile_strided(&self, corners: &[usize], lengths: &[usize], steps: &[usize]) -> Result<Array> {
        let width = self.ty.width();
        let data = self.hdu.data();
        gather(&self.axes, self.ty, corners, lengths, steps, |first, count| {
            data.read_range(first * width, count * width)
        })
    }
}

/// Tiler over an in-memory array. Striding is not supported.
pub struct MemoryTiler<'a> {
    array: &'a Array,
    bytes: Vec<u8>,
}

impl<'a> MemoryTiler<'a> {
    pub fn new(array: &'a Array) -> Result<Self> {
        if !array.element_type().is_numeric() {
            return Err(Error::UnsupportedImageType(format!("{:?}", array.element_type())));
        }
        Ok(MemoryTiler {
            bytes: codec::encode(array)?,
            array,
        })
    }
}

impl Tiler for MemoryTiler<'_> {
    fn axes(&self) -> &[usize] {
        self.array.shape()
    }

    fn element_type(&self) -> ElementType {
        self.array.element_type()
    }

    fn get_tile(&self, corners: &[usize], lengths: &[usize]) -> Result<Array> {
        let width = self.element_type().width();
        let steps = vec![1; self.axes().len()];
        gather(self.axes(), self.element_type(), corners, lengths, &steps, |first, count| {
            Ok(self.bytes[first * width..(first + count) * width].to_vec())
        })
    }
}
