//! FITS tiled image and table compression.
//!
//! Units are read into a [`Fits`] container, converted with
//! [`Fits::compress`] and [`Fits::decompress`] or the functions in
//! [`tiled`], and written back with their checksums kept current.

pub mod bintable;
pub mod block;
pub mod checksum;
pub mod codec;
pub mod compress;
pub mod data;
pub mod error;
pub mod hdu;
pub mod header;
pub mod tile;
pub mod tiled;
pub mod value;

#[cfg(feature = "array")]
pub mod array;

pub use block::{BLOCK_SIZE, CARDS_PER_BLOCK, CARD_SIZE};
pub use codec::{Array, ArrayData, ElementType};
pub use compress::{Algorithm, AlgorithmOptions};
pub use error::{Error, Result};
pub use hdu::{Fits, Hdu};
pub use header::{Card, HduKind, Header};
pub use tiled::{CompressionOptions, TableCompressionOptions};
pub use value::Value;
