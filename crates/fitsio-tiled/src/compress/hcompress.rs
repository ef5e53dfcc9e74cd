//! H-transform compression of 2-D integer tiles (`HCOMPRESS_1`).
//!
//! Arrays are indexed `a[i * ny + j]` with `i < nx` the slow axis (tile rows)
//! and `j < ny` the fast axis. The stream layout is the one written by
//! cfitsio: magic, `nx`, `ny`, `scale`, the 64-bit sum coefficient, three
//! bit-plane counts, the quadtree-coded planes of the four quadrants, an EOF
//! nybble and finally the sign bits.

use super::bits::{BitReader, BitWriter};
use crate::error::{Error, Result};

const MAGIC: [u8; 2] = [0xDD, 0x99];

/// Huffman codes for the 16 quadtree nybbles and their bit lengths.
const CODE: [u64; 16] = [
    0x3e, 0x00, 0x01, 0x08, 0x02, 0x09, 0x1a, 0x1b, 0x03, 0x1c, 0x0a, 0x1d, 0x0b, 0x1e, 0x3f, 0x0c,
];
const NCODE: [u32; 16] = [6, 3, 3, 4, 3, 4, 5, 5, 3, 5, 4, 5, 4, 5, 6, 4];

fn invalid(msg: &str) -> Error {
    Error::InvalidStream(format!("HCOMPRESS_1 {msg}"))
}

/// `ceil(log2(n))`, 0 for `n <= 1`.
fn log2_ceil(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

// ---------------------------------------------------------------------------
// H-transform
// ---------------------------------------------------------------------------

/// Move the odd elements of a strided run behind the even ones.
fn shuffle(a: &mut [i64], base: usize, n: usize, n2: usize, tmp: &mut [i64]) {
    let mut odd = 0;
    for i in (1..n).step_by(2) {
        tmp[odd] = a[base + i * n2];
        odd += 1;
    }
    let mut p = base + n2;
    for i in (2..n).step_by(2) {
        a[p] = a[base + i * n2];
        p += n2;
    }
    for &v in &tmp[..odd] {
        a[p] = v;
        p += n2;
    }
}

fn unshuffle(a: &mut [i64], base: usize, n: usize, n2: usize, tmp: &mut [i64]) {
    let nhalf = (n + 1) >> 1;
    for (k, i) in (nhalf..n).enumerate() {
        tmp[k] = a[base + i * n2];
    }
    for i in (0..nhalf).rev() {
        a[base + 2 * i * n2] = a[base + i * n2];
    }
    for (k, i) in (1..n).step_by(2).enumerate() {
        a[base + i * n2] = tmp[k];
    }
}

fn htrans(a: &mut [i64], nx: usize, ny: usize) {
    let nmax = nx.max(ny);
    let log2n = log2_ceil(nmax);
    let mut tmp = vec![0i64; nmax.div_ceil(2)];

    let mut shift = 0u32;
    let mut mask: i64 = -2;
    let mut mask2 = mask << 1;
    let mut prnd: i64 = 1;
    let mut prnd2 = prnd << 1;
    let mut nrnd2 = prnd2 - 1;

    // positive values round up, negative ones down, so the inverse can restore
    // the dropped low bits from hc
    let round1 = |h: i64, prnd: i64, mask: i64| (if h >= 0 { h + prnd } else { h }) & mask;
    let round2 = |h: i64, prnd2: i64, nrnd2: i64, mask2: i64| {
        (if h >= 0 { h + prnd2 } else { h + nrnd2 }) & mask2
    };

    let (mut nxtop, mut nytop) = (nx, ny);
    for _ in 0..log2n {
        let oddx = nxtop % 2;
        let oddy = nytop % 2;
        let mut i = 0;
        while i < nxtop - oddx {
            let mut s00 = i * ny;
            let mut s10 = s00 + ny;
            let mut j = 0;
            while j < nytop - oddy {
                let (a00, a01, a10, a11) = (a[s00], a[s00 + 1], a[s10], a[s10 + 1]);
                let h0 = (a11 + a10 + a01 + a00) >> shift;
                let hx = (a11 + a10 - a01 - a00) >> shift;
                let hy = (a11 - a10 + a01 - a00) >> shift;
                let hc = (a11 - a10 - a01 + a00) >> shift;
                a[s10 + 1] = hc;
                a[s10] = round1(hx, prnd, mask);
                a[s00 + 1] = round1(hy, prnd, mask);
                a[s00] = round2(h0, prnd2, nrnd2, mask2);
                s00 += 2;
                s10 += 2;
                j += 2;
            }
            if oddy == 1 {
                let h0 = (a[s10] + a[s00]) << (1 - shift);
                let hx = (a[s10] - a[s00]) << (1 - shift);
                a[s10] = round1(hx, prnd, mask);
                a[s00] = round2(h0, prnd2, nrnd2, mask2);
            }
            i += 2;
        }
        if oddx == 1 {
            let mut s00 = i * ny;
            let mut j = 0;
            while j < nytop - oddy {
                let h0 = (a[s00 + 1] + a[s00]) << (1 - shift);
                let hy = (a[s00 + 1] - a[s00]) << (1 - shift);
                a[s00 + 1] = round1(hy, prnd, mask);
                a[s00] = round2(h0, prnd2, nrnd2, mask2);
                s00 += 2;
                j += 2;
            }
            if oddy == 1 {
                let h0 = a[s00] << (2 - shift);
                a[s00] = round2(h0, prnd2, nrnd2, mask2);
            }
        }

        for i in 0..nxtop {
            shuffle(a, ny * i, nytop, 1, &mut tmp);
        }
        for j in 0..nytop {
            shuffle(a, j, nxtop, ny, &mut tmp);
        }

        nxtop = (nxtop + 1) >> 1;
        nytop = (nytop + 1) >> 1;
        shift = 1;
        mask = mask2;
        prnd = prnd2;
        mask2 <<= 1;
        prnd2 <<= 1;
        nrnd2 = prnd2 - 1;
    }
}

/// Nudge the coefficients of one level towards a smooth surface, within
/// the rounding error `scale / 2` introduced by digitizing.
fn hsmooth(a: &mut [i64], nxtop: usize, nytop: usize, ny: usize, scale: i64) {
    let smax = scale >> 1;
    if smax <= 0 {
        return;
    }
    let ny2 = ny << 1;
    let clamp = |s: i64| s.clamp(-smax, smax);

    // x differences
    for i in (2..nxtop.saturating_sub(2)).step_by(2) {
        let mut s00 = ny * i;
        let mut s10 = s00 + ny;
        for _ in (0..nytop).step_by(2) {
            let (hm, h0, hp) = (a[s00 - ny2], a[s00], a[s00 + ny2]);
            let dmax = (hp - h0).min(h0 - hm).max(0) << 2;
            let dmin = (hp - h0).max(h0 - hm).min(0) << 2;
            if dmin < dmax {
                let diff = (hp - hm).min(dmax).max(dmin);
                let s = diff - (a[s10] << 3);
                let s = if s >= 0 { s >> 3 } else { (s + 7) >> 3 };
                a[s10] += clamp(s);
            }
            s00 += 2;
            s10 += 2;
        }
    }
    // y differences
    for i in (0..nxtop).step_by(2) {
        let mut s00 = ny * i + 2;
        for _ in (2..nytop.saturating_sub(2)).step_by(2) {
            let (hm, h0, hp) = (a[s00 - 2], a[s00], a[s00 + 2]);
            let dmax = (hp - h0).min(h0 - hm).max(0) << 2;
            let dmin = (hp - h0).max(h0 - hm).min(0) << 2;
            if dmin < dmax {
                let diff = (hp - hm).min(dmax).max(dmin);
                let s = diff - (a[s00 + 1] << 3);
                let s = if s >= 0 { s >> 3 } else { (s + 7) >> 3 };
                a[s00 + 1] += clamp(s);
            }
            s00 += 2;
        }
    }
    // curvature
    for i in (2..nxtop.saturating_sub(2)).step_by(2) {
        let mut s00 = ny * i + 2;
        let mut s10 = s00 + ny;
        for _ in (2..nytop.saturating_sub(2)).step_by(2) {
            let hmm = a[s00 - ny2 - 2];
            let hpm = a[s00 + ny2 - 2];
            let hmp = a[s00 - ny2 + 2];
            let hpp = a[s00 + ny2 + 2];
            let h0 = a[s00];
            let hx2 = a[s10] << 1;
            let hy2 = a[s00 + 1] << 1;
            let m1 = ((hpp - h0).max(0) - hx2 - hy2).min((h0 - hpm).max(0) + hx2 - hy2);
            let m2 = ((h0 - hmp).max(0) - hx2 + hy2).min((hmm - h0).max(0) + hx2 + hy2);
            let dmax = m1.min(m2) << 4;
            let m1 = ((hpp - h0).min(0) - hx2 - hy2).max((h0 - hpm).min(0) + hx2 - hy2);
            let m2 = ((h0 - hmp).min(0) - hx2 + hy2).max((hmm - h0).min(0) + hx2 + hy2);
            let dmin = m1.max(m2) << 4;
            if dmin < dmax {
                let diff = (hpp + hmm - hmp - hpm).min(dmax).max(dmin);
                let s = diff - (a[s10 + 1] << 6);
                let s = if s >= 0 { s >> 6 } else { (s + 63) >> 6 };
                a[s10 + 1] += clamp(s);
            }
            s00 += 2;
            s10 += 2;
        }
    }
}

fn hinv(a: &mut [i64], nx: usize, ny: usize, smooth: bool, scale: i64) {
    let nmax = nx.max(ny);
    let log2n = log2_ceil(nmax);
    if log2n == 0 {
        return;
    }
    let mut tmp = vec![0i64; nmax.div_ceil(2)];

    let mut shift = 1u32;
    let mut bit0: i64 = 1 << (log2n - 1);
    let mut bit1 = bit0 << 1;
    let mut mask0 = -bit0;
    let mut mask1 = mask0 << 1;
    let mask2 = mask0 << 2;
    let mut prnd0 = bit0 >> 1;
    let mut prnd1 = bit1 >> 1;
    let prnd2 = bit1;
    let mut nrnd0 = prnd0 - 1;
    let mut nrnd1 = prnd1 - 1;
    let nrnd2 = prnd2 - 1;

    a[0] = (a[0] + if a[0] >= 0 { prnd2 } else { nrnd2 }) & mask2;

    let (mut nxtop, mut nytop) = (1usize, 1usize);
    let (mut nxf, mut nyf) = (nx, ny);
    let mut c = 1usize << log2n;
    for k in (0..log2n).rev() {
        c >>= 1;
        nxtop <<= 1;
        nytop <<= 1;
        if nxf <= c {
            nxtop -= 1;
        } else {
            nxf -= c;
        }
        if nyf <= c {
            nytop -= 1;
        } else {
            nyf -= c;
        }
        if k == 0 {
            nrnd0 = 0;
            shift = 2;
        }

        for i in 0..nxtop {
            unshuffle(a, ny * i, nytop, 1, &mut tmp);
        }
        for j in 0..nytop {
            unshuffle(a, j, nxtop, ny, &mut tmp);
        }
        if smooth {
            hsmooth(a, nxtop, nytop, ny, scale);
        }

        let oddx = nxtop % 2;
        let oddy = nytop % 2;
        let mut i = 0;
        while i < nxtop - oddx {
            let mut s00 = ny * i;
            let mut s10 = s00 + ny;
            let mut j = 0;
            while j < nytop - oddy {
                let mut h0 = a[s00];
                let mut hx = a[s10];
                let mut hy = a[s00 + 1];
                let mut hc = a[s10 + 1];
                hx = (hx + if hx >= 0 { prnd1 } else { nrnd1 }) & mask1;
                hy = (hy + if hy >= 0 { prnd1 } else { nrnd1 }) & mask1;
                hc = (hc + if hc >= 0 { prnd0 } else { nrnd0 }) & mask0;
                // bit0 of hc goes back into hx and hy, bits 0 and 1 into h0
                let lowbit0 = hc & bit0;
                hx = if hx >= 0 { hx - lowbit0 } else { hx + lowbit0 };
                hy = if hy >= 0 { hy - lowbit0 } else { hy + lowbit0 };
                let lowbit1 = (hc ^ hx ^ hy) & bit1;
                h0 = if h0 >= 0 {
                    h0 + lowbit0 - lowbit1
                } else if lowbit0 == 0 {
                    h0 + lowbit1
                } else {
                    h0 + lowbit0 - lowbit1
                };
                a[s10 + 1] = (h0 + hx + hy + hc) >> shift;
                a[s10] = (h0 + hx - hy - hc) >> shift;
                a[s00 + 1] = (h0 - hx + hy - hc) >> shift;
                a[s00] = (h0 - hx - hy + hc) >> shift;
                s00 += 2;
                s10 += 2;
                j += 2;
            }
            if oddy == 1 {
                let mut h0 = a[s00];
                let hx = (a[s10] + if a[s10] >= 0 { prnd1 } else { nrnd1 }) & mask1;
                let lowbit1 = hx & bit1;
                h0 = if h0 >= 0 { h0 - lowbit1 } else { h0 + lowbit1 };
                a[s10] = (h0 + hx) >> shift;
                a[s00] = (h0 - hx) >> shift;
            }
            i += 2;
        }
        if oddx == 1 {
            let mut s00 = ny * (nxtop - 1);
            let mut j = 0;
            while j < nytop - oddy {
                let mut h0 = a[s00];
                let hy = (a[s00 + 1] + if a[s00 + 1] >= 0 { prnd1 } else { nrnd1 }) & mask1;
                let lowbit1 = hy & bit1;
                h0 = if h0 >= 0 { h0 - lowbit1 } else { h0 + lowbit1 };
                a[s00 + 1] = (h0 + hy) >> shift;
                a[s00] = (h0 - hy) >> shift;
                s00 += 2;
                j += 2;
            }
            if oddy == 1 {
                a[s00] >>= shift;
            }
        }

        bit1 = bit0;
        bit0 >>= 1;
        mask1 = mask0;
        mask0 >>= 1;
        prnd1 = prnd0;
        prnd0 >>= 1;
        nrnd1 = nrnd0;
        nrnd0 = prnd0 - 1;
    }
}

fn digitize(a: &mut [i64], scale: i64) {
    if scale <= 1 {
        return;
    }
    let d = (scale + 1) / 2 - 1;
    for v in a.iter_mut() {
        *v = (if *v > 0 { *v + d } else { *v - d }) / scale;
    }
}

fn undigitize(a: &mut [i64], scale: i64) {
    if scale > 1 {
        a.iter_mut().for_each(|v| *v *= scale);
    }
}

// ---------------------------------------------------------------------------
// Quadtree coding
// ---------------------------------------------------------------------------

/// A quadrant of the coefficient array: `nqx` rows of `nqy` values starting
/// at `base`, rows `n` apart.
#[derive(Debug, Clone, Copy)]
struct Quadrant {
    base: usize,
    n: usize,
    nqx: usize,
    nqy: usize,
}

/// Pack 2x2 blocks of `bit(i, j)` into nybbles, upper-left in bit 3.
fn pack_nybbles(nx: usize, ny: usize, bit: impl Fn(usize, usize) -> bool) -> Vec<u8> {
    let (nx2, ny2) = (nx.div_ceil(2), ny.div_ceil(2));
    let at = |i: usize, j: usize| (i < nx && j < ny && bit(i, j)) as u8;
    let mut out = Vec::with_capacity(nx2 * ny2);
    for qi in 0..nx2 {
        for qj in 0..ny2 {
            let (i, j) = (2 * qi, 2 * qj);
            out.push(at(i, j) << 3 | at(i, j + 1) << 2 | at(i + 1, j) << 1 | at(i + 1, j + 1));
        }
    }
    out
}

/// Bit of the nybble grid `codes` (row length `ny2`) that covers `(i, j)`.
fn nybble_bit(codes: &[u8], ny2: usize, i: usize, j: usize) -> bool {
    let pos = 3 - ((i & 1) << 1 | (j & 1));
    (codes[(i >> 1) * ny2 + (j >> 1)] >> pos) & 1 == 1
}

fn qtree_encode(out: &mut BitWriter, a: &[i64], q: Quadrant, nbitplanes: u8) {
    let log2n = log2_ceil(q.nqx.max(q.nqy));
    let (nqx2, nqy2) = (q.nqx.div_ceil(2), q.nqy.div_ceil(2));
    let bmax = (nqx2 * nqy2).div_ceil(2).max(1);

    for bit in (0..nbitplanes as u32).rev() {
        let plane = pack_nybbles(q.nqx, q.nqy, |i, j| (a[q.base + i * q.n + j] >> bit) & 1 == 1);

        // codes of every level, bottom level first
        let mut codes: Vec<u8> = Vec::new();
        let mut nbits = 0usize;
        let mut push = |level: &[u8], codes: &mut Vec<u8>| {
            for &v in level.iter().filter(|&&v| v != 0) {
                codes.push(v);
                nbits += NCODE[v as usize] as usize;
            }
            nbits / 8 < bmax
        };

        let mut fits = push(&plane, &mut codes);
        let (mut nx, mut ny) = (nqx2, nqy2);
        let mut level = plane.clone();
        for _ in 1..log2n {
            if !fits {
                break;
            }
            level = pack_nybbles(nx, ny, |i, j| level[i * ny + j] != 0);
            nx = nx.div_ceil(2);
            ny = ny.div_ceil(2);
            fits = push(&level, &mut codes);
        }

        if !fits {
            // quadtree would expand the plane: write the bitmap directly
            out.write_bits(0x0, 4);
            plane.iter().for_each(|&v| out.write_bits(v as u64, 4));
        } else {
            out.write_bits(0xF, 4);
            if codes.is_empty() {
                out.write_bits(CODE[0], NCODE[0]);
            }
            for &v in codes.iter().rev() {
                out.write_bits(CODE[v as usize], NCODE[v as usize]);
            }
        }
    }
}

fn read_huffman(r: &mut BitReader<'_>) -> Result<u8> {
    let mut c = r.read_bits(3)?;
    let mut len = 3;
    loop {
        if let Some(v) = (0..16).find(|&v| NCODE[v] == len && CODE[v] == c) {
            return Ok(v as u8);
        }
        if len == 6 {
            return Err(invalid("bad Huffman code"));
        }
        c = (c << 1) | r.read_bit()? as u64;
        len += 1;
    }
}

fn qtree_decode(r: &mut BitReader<'_>, a: &mut [i64], q: Quadrant, nbitplanes: u8) -> Result<()> {
    let log2n = log2_ceil(q.nqx.max(q.nqy));
    let (nqx2, nqy2) = (q.nqx.div_ceil(2), q.nqy.div_ceil(2));

    for bit in (0..nbitplanes as u32).rev() {
        let codes = match r.read_bits(4)? {
            0x0 => (0..nqx2 * nqy2)
                .map(|_| r.read_bits(4).map(|v| v as u8))
                .collect::<Result<Vec<u8>>>()?,
            0xF => {
                let mut codes = vec![read_huffman(r)?];
                let (mut nx, mut ny) = (1usize, 1usize);
                let (mut nfx, mut nfy) = (q.nqx, q.nqy);
                let mut c = 1usize << log2n;
                for _ in 1..log2n {
                    // n[k-1] = (n[k] + 1) / 2 with n[log2n] = nqx or nqy
                    c >>= 1;
                    nx <<= 1;
                    ny <<= 1;
                    if nfx <= c {
                        nx -= 1;
                    } else {
                        nfx -= c;
                    }
                    if nfy <= c {
                        ny -= 1;
                    } else {
                        nfy -= c;
                    }
                    let ny2 = ny.div_ceil(2);
                    let mut next: Vec<u8> = (0..nx * ny)
                        .map(|k| nybble_bit(&codes, ny2, k / ny, k % ny) as u8)
                        .collect();
                    for v in next.iter_mut().rev() {
                        if *v != 0 {
                            *v = read_huffman(r)?;
                        }
                    }
                    codes = next;
                }
                codes
            }
            _ => return Err(invalid("bad bit plane format code")),
        };
        if codes.len() < nqx2 * nqy2 {
            return Err(invalid("quadtree size mismatch"));
        }
        for i in 0..q.nqx {
            for j in 0..q.nqy {
                if nybble_bit(&codes, nqy2, i, j) {
                    a[q.base + i * q.n + j] |= 1 << bit;
                }
            }
        }
    }
    Ok(())
}

fn quadrants(nx: usize, ny: usize) -> [Quadrant; 4] {
    let (nx2, ny2) = (nx.div_ceil(2), ny.div_ceil(2));
    let q = |base, nqx, nqy| Quadrant {
        base,
        n: ny,
        nqx,
        nqy,
    };
    [
        q(0, nx2, ny2),
        q(ny2, nx2, ny / 2),
        q(ny * nx2, nx / 2, ny2),
        q(ny * nx2 + ny2, nx / 2, ny / 2),
    ]
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// Compress an `nx` by `ny` tile. `scale <= 1` is lossless.
pub fn compress(values: &[i64], nx: usize, ny: usize, scale: i64) -> Result<Vec<u8>> {
    if values.len() != nx * ny {
        return Err(Error::SizeMismatch {
            expected: nx * ny,
            actual: values.len(),
        });
    }
    if nx == 0 || ny == 0 {
        return Err(Error::CompressionFailed("HCOMPRESS_1 tile is empty".into()));
    }
    if let Some(&v) = values.iter().find(|&&v| i32::try_from(v).is_err()) {
        return Err(Error::ValueOutOfRange(v));
    }
    let (nx32, ny32, scale32) = match (i32::try_from(nx), i32::try_from(ny), i32::try_from(scale)) {
        (Ok(a), Ok(b), Ok(c)) => (a, b, c),
        _ => return Err(Error::CompressionFailed("HCOMPRESS_1 tile too large".into())),
    };

    let mut a = values.to_vec();
    htrans(&mut a, nx, ny);
    digitize(&mut a, scale);

    let mut out = BitWriter::with_capacity(values.len());
    out.write_bytes(&MAGIC);
    out.write_bytes(&nx32.to_be_bytes());
    out.write_bytes(&ny32.to_be_bytes());
    out.write_bytes(&scale32.to_be_bytes());
    out.write_bytes(&a[0].to_be_bytes());
    a[0] = 0;

    let mut signs = Vec::new();
    for v in a.iter_mut().filter(|v| **v != 0) {
        signs.push(*v < 0);
        *v = v.abs();
    }

    let mut vmax = [0i64; 3];
    let (nx2, ny2) = (nx.div_ceil(2), ny.div_ceil(2));
    for (k, &v) in a.iter().enumerate() {
        let q = (k % ny >= ny2) as usize + (k / ny >= nx2) as usize;
        vmax[q] = vmax[q].max(v);
    }
    let nbitplanes = vmax.map(|v| (64 - v.leading_zeros()) as u8);
    out.write_bytes(&nbitplanes);

    let [q0, q1, q2, q3] = quadrants(nx, ny);
    qtree_encode(&mut out, &a, q0, nbitplanes[0]);
    qtree_encode(&mut out, &a, q1, nbitplanes[1]);
    qtree_encode(&mut out, &a, q2, nbitplanes[1]);
    qtree_encode(&mut out, &a, q3, nbitplanes[2]);
    out.write_bits(0, 4);
    out.align();

    signs.into_iter().for_each(|s| out.write_bit(s));
    Ok(out.finish())
}

/// Decompress a stream whose tile must be `nx` rows of `ny` values.
pub fn decompress(bytes: &[u8], out: &mut [i64], nx: usize, ny: usize, smooth: bool) -> Result<()> {
    if out.len() != nx * ny {
        return Err(Error::SizeMismatch {
            expected: nx * ny,
            actual: out.len(),
        });
    }
    let mut r = BitReader::new(bytes);
    if r.read_bytes(2)? != MAGIC {
        return Err(invalid("bad magic"));
    }
    let int = |r: &mut BitReader<'_>| -> Result<i32> {
        let b = r.read_bytes(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    };
    let (snx, sny, scale) = (int(&mut r)?, int(&mut r)?, int(&mut r)?);
    if snx as i64 != nx as i64 || sny as i64 != ny as i64 {
        return Err(invalid(&format!("stream is {snx}x{sny}, tile is {nx}x{ny}")));
    }
    if nx == 0 || ny == 0 {
        return Err(invalid("empty tile"));
    }
    let s = r.read_bytes(8)?;
    let sumall = i64::from_be_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]]);
    let planes = r.read_bytes(3)?;
    let nbitplanes = [planes[0], planes[1], planes[2]];
    if nbitplanes.iter().any(|&p| p > 62) {
        return Err(invalid("too many bit planes"));
    }

    out.fill(0);
    let [q0, q1, q2, q3] = quadrants(nx, ny);
    qtree_decode(&mut r, out, q0, nbitplanes[0])?;
    qtree_decode(&mut r, out, q1, nbitplanes[1])?;
    qtree_decode(&mut r, out, q2, nbitplanes[1])?;
    qtree_decode(&mut r, out, q3, nbitplanes[2])?;
    if r.read_bits(4)? != 0 {
        return Err(invalid("missing end of planes"));
    }
    r.align();
    for v in out.iter_mut().filter(|v| **v != 0) {
        if r.read_bit()? {
            *v = -*v;
        }
    }
    out[0] = sumall;

    let scale = scale as i64;
    undigitize(out, scale);
    hinv(out, nx, ny, smooth, scale);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM_4X4: [u8; 48] = [
        221, 153, 0, 0, 0, 4, 0, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 32, 5, 5, 5, 245, 231,
        227, 199, 253, 227, 199, 253, 247, 255, 120, 249, 245, 239, 254, 241, 255, 124, 120, 251, 0,
        68, 200,
    ];
    const PIXELS_4X4: [i64; 16] = [2, 2, 1, 2, 3, 2, 7, 7, 4, 2, 2, 1, 2, 4, 25, 2];

    fn roundtrip(values: &[i64], nx: usize, ny: usize) {
        let packed = compress(values, nx, ny, 0).unwrap();
        let mut out = vec![0i64; values.len()];
        decompress(&packed, &mut out, nx, ny, false).unwrap();
        assert_eq!(out, values, "{nx}x{ny}");
    }

    // ---- transform ----

    #[test]
    fn inverse_transform_vector() {
        let mut a = [32, 16, -2, 2, 12, 6, 0, -24, 2, 12, -1, -1, 0, 24, 4, -22];
        hinv(&mut a, 4, 4, false, 0);
        assert_eq!(a, PIXELS_4X4);
    }

    #[test]
    fn forward_transform_inverts() {
        let mut a = PIXELS_4X4;
        htrans(&mut a, 4, 4);
        assert_eq!(a, [32, 16, -2, 2, 12, 6, 0, -24, 2, 12, -1, -1, 0, 24, 4, -22]);
    }

    #[test]
    fn shuffle_pairs_with_unshuffle() {
        let mut a: Vec<i64> = (0..7).collect();
        let mut tmp = vec![0; 4];
        shuffle(&mut a, 0, 7, 1, &mut tmp);
        assert_eq!(a, vec![0, 2, 4, 6, 1, 3, 5]);
        unshuffle(&mut a, 0, 7, 1, &mut tmp);
        assert_eq!(a, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn log2_rounds_up() {
        assert_eq!(log2_ceil(1), 0);
        assert_eq!(log2_ceil(2), 1);
        assert_eq!(log2_ceil(3), 2);
        assert_eq!(log2_ceil(4), 2);
        assert_eq!(log2_ceil(5), 3);
        assert_eq!(log2_ceil(200), 8);
    }

    // ---- known streams ----

    #[test]
    fn decode_reference_stream() {
        let mut out = [0i64; 16];
        decompress(&STREAM_4X4, &mut out, 4, 4, false).unwrap();
        assert_eq!(out, PIXELS_4X4);
    }

    #[test]
    fn decode_single_column_stream() {
        let input: [u8; 101] = [
            221, 153, 0, 0, 0, 10, 0, 0, 0, 1, 0, 0, 0, 0, 255, 255, 255, 255, 255, 255, 109, 64,
            16, 17, 0, 2, 136, 255, 191, 224, 40, 143, 251, 254, 246, 207, 253, 238, 168, 251, 53,
            238, 168, 255, 223, 247, 253, 255, 127, 223, 247, 253, 255, 127, 223, 247, 253, 255,
            127, 223, 247, 253, 255, 127, 223, 247, 253, 255, 127, 223, 247, 178, 255, 239, 251,
            217, 127, 247, 178, 253, 151, 255, 127, 222, 234, 143, 186, 163, 255, 123, 170, 62,
            234, 143, 186, 163, 238, 168, 255, 192, 100,
        ];
        let mut out = [0i64; 10];
        decompress(&input, &mut out, 10, 1, false).unwrap();
        assert_eq!(out, [-1, -1, -112, -1, 9983, -28528, -112, -1, -1, -1]);
    }

    #[test]
    fn encode_matches_reference_header() {
        let packed = compress(&PIXELS_4X4, 4, 4, 0).unwrap();
        assert_eq!(&packed[..25], &STREAM_4X4[..25]);
    }

    // ---- round trips ----

    #[test]
    fn lossless_roundtrips() {
        roundtrip(&PIXELS_4X4, 4, 4);
        let ramp: Vec<i64> = (0..35).map(|i| i * 3 - 40).collect();
        roundtrip(&ramp, 5, 7);
        roundtrip(&ramp, 7, 5);
        let image: Vec<i64> = (0..64 * 48)
            .map(|k| ((k % 64) as i64 - 30).pow(2) + (k / 64) as i64 * 5 - 1000)
            .collect();
        roundtrip(&image, 48, 64);
        roundtrip(&[i32::MAX as i64, i32::MIN as i64, 0, -1, 1, 7], 2, 3);
        roundtrip(&[42], 1, 1);
        roundtrip(&[0; 16], 4, 4);
    }

    #[test]
    fn noisy_roundtrip_uses_direct_planes() {
        let mut x = 7u64;
        let values: Vec<i64> = (0..256)
            .map(|_| {
                x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (x >> 48) as i64 - 32768
            })
            .collect();
        roundtrip(&values, 16, 16);
    }

    #[test]
    fn lossy_scale_stays_close() {
        let values: Vec<i64> = (0..32 * 32)
            .map(|k| 1000 + ((k % 32) as i64) * 10 + ((k / 32) as i64) * 7)
            .collect();
        let scale = 8;
        let packed = compress(&values, 32, 32, scale).unwrap();
        let lossless = compress(&values, 32, 32, 0).unwrap();
        assert!(packed.len() < lossless.len());
        for smooth in [false, true] {
            let mut out = vec![0i64; values.len()];
            decompress(&packed, &mut out, 32, 32, smooth).unwrap();
            let worst = values.iter().zip(&out).map(|(a, b)| (a - b).abs()).max().unwrap();
            assert!(worst <= 4 * scale, "error {worst}");
        }
    }

    // ---- errors ----

    #[test]
    fn rejects_bad_streams() {
        let mut out = [0i64; 16];
        let mut bad = STREAM_4X4;
        bad[0] = 0;
        assert!(matches!(decompress(&bad, &mut out, 4, 4, false), Err(Error::InvalidStream(_))));
        assert!(matches!(
            decompress(&STREAM_4X4, &mut [0i64; 16], 2, 8, false),
            Err(Error::InvalidStream(_))
        ));
        assert!(matches!(
            decompress(&STREAM_4X4[..30], &mut out, 4, 4, false),
            Err(Error::InvalidStream(_))
        ));
    }

    #[test]
    fn rejects_values_beyond_32_bits() {
        let err = compress(&[1 << 40, 0, 0, 0], 2, 2, 0).unwrap_err();
        assert!(matches!(err, Error::ValueOutOfRange(v) if v == 1 << 40));
        let err = compress(&[0, i64::MAX, 0, 0], 2, 2, 0).unwrap_err();
        assert!(matches!(err, Error::ValueOutOfRange(i64::MAX)));
        assert!(matches!(
            compress(&[i32::MIN as i64 - 1], 1, 1, 0),
            Err(Error::ValueOutOfRange(_))
        ));
    }
}
