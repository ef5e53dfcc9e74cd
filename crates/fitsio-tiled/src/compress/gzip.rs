//! Deflate payloads in gzip members (`GZIP_1`), optionally byte-shuffled (`GZIP_2`).

use miniz_oxide::deflate::compress_to_vec;
use miniz_oxide::inflate::{decompress_to_vec, decompress_to_vec_zlib};

use crate::error::{Error, Result};

const LEVEL: u8 = 6;
const MAGIC: [u8; 2] = [0x1f, 0x8b];

/// CRC-32 (IEEE) as stored in the gzip trailer.
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Deflate `bytes` into a single gzip member.
pub fn compress(bytes: &[u8]) -> Vec<u8> {
    let deflated = compress_to_vec(bytes, LEVEL);
    let mut out = Vec::with_capacity(deflated.len() + 18);
    out.extend_from_slice(&MAGIC);
    // CM = deflate, no flags, no mtime, XFL = 0, OS = unknown
    out.extend_from_slice(&[8, 0, 0, 0, 0, 0, 0, 255]);
    out.extend_from_slice(&deflated);
    out.extend_from_slice(&crc32(bytes).to_le_bytes());
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out
}

/// The deflate body of a gzip member, with its CRC and size.
fn split_member(data: &[u8]) -> Result<(&[u8], u32, u32)> {
    let bad = || Error::InvalidStream("malformed gzip header".into());
    if data.len() < 18 || data[2] != 8 {
        return Err(bad());
    }
    let flags = data[3];
    let mut pos = 10usize;
    if flags & 0x04 != 0 {
        let xlen = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize;
        pos += 2 + xlen;
    }
    for flag in [0x08, 0x10] {
        if flags & flag != 0 {
            let nul = data.get(pos..).and_then(|rest| rest.iter().position(|&b| b == 0));
            pos += nul.ok_or_else(bad)? + 1;
        }
    }
    if flags & 0x02 != 0 {
        pos += 2;
    }
    if pos + 8 > data.len() {
        return Err(bad());
    }
    let trailer = &data[data.len() - 8..];
    let crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let size = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
    Ok((&data[pos..data.len() - 8], crc, size))
}

/// Inflate a gzip member, a zlib stream, or raw deflate.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.starts_with(&MAGIC) {
        let (body, crc, size) = split_member(data)?;
        let out = decompress_to_vec(body)
            .map_err(|e| Error::InvalidStream(format!("inflate failed: {:?}", e.status)))?;
        if crc32(&out) != crc || out.len() as u32 != size {
            return Err(Error::InvalidStream("gzip CRC or size mismatch".into()));
        }
        return Ok(out);
    }
    decompress_to_vec_zlib(data)
        .or_else(|_| decompress_to_vec(data))
        .map_err(|e| Error::InvalidStream(format!("inflate failed: {:?}", e.status)))
}

/// Group the bytes of `width`-byte values by significance, most significant first.
pub fn shuffle(bytes: &[u8], width: usize) -> Vec<u8> {
    if width <= 1 {
        return bytes.to_vec();
    }
    let n = bytes.len() / width;
    let mut out = vec![0u8; bytes.len()];
    for (i, value) in bytes.chunks_exact(width).enumerate() {
        for (k, &b) in value.iter().enumerate() {
            out[k * n + i] = b;
        }
    }
    out
}

pub fn unshuffle(bytes: &[u8], width: usize) -> Result<Vec<u8>> {
    if width <= 1 {
        return Ok(bytes.to_vec());
    }
    if bytes.len() % width != 0 {
        return Err(Error::InvalidStream(format!(
            "GZIP_2 payload of {} bytes is not a multiple of {width}",
            bytes.len()
        )));
    }
    let n = bytes.len() / width;
    let mut out = vec![0u8; bytes.len()];
    for (i, value) in out.chunks_exact_mut(width).enumerate() {
        for (k, b) in value.iter_mut().enumerate() {
            *b = bytes[k * n + i];
        }
    }
    Ok(out)
}
