use thiserror::Error;

/// All errors that can occur while encoding, compressing or checksumming FITS data.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed FITS header block.
    #[error("invalid FITS header: {0}")]
    InvalidHeader(String),
    /// Premature end of data while reading.
    #[error("unexpected end of file")]
    UnexpectedEof,
    /// Unrecognized BITPIX value.
    #[error("invalid BITPIX value: {0}")]
    InvalidBitpix(i64),
    /// Malformed keyword name in a header card.
    #[error("invalid keyword name: {0:?}")]
    InvalidKeyword(String),
    /// A header value could not be parsed or has the wrong type.
    #[error("invalid header value for {0}")]
    InvalidValue(String),
    /// A required keyword was not found in the header.
    #[error("missing required keyword: {0}")]
    MissingKeyword(String),

    /// The element type cannot be used for the requested conversion.
    #[error("unsupported element type: {0}")]
    UnsupportedElementType(String),
    /// A non-numeric element type was passed to the image path.
    #[error("unsupported for image decode: {0}")]
    UnsupportedImageType(String),
    /// Declared shape and actual byte or element count disagree.
    #[error("size mismatch: expected {expected}, found {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// An encoded checksum was not exactly 16 characters long.
    #[error("invalid checksum length: {0} (expected 16)")]
    InvalidChecksumLength(usize),
    /// An encoded checksum contains a byte outside the accepted range.
    #[error("invalid checksum character: 0x{0:02x}")]
    InvalidChecksumCharacter(u8),
    /// CHECKSUM or DATASUM is absent from the header.
    #[error("missing checksum field: {0}")]
    MissingChecksum(&'static str),

    /// Tile corners, lengths or steps are out of range.
    #[error("invalid tile: {0}")]
    InvalidTile(String),
    /// The tiler cannot honour a stride other than 1.
    #[error("striding unsupported by this tiler")]
    StridingUnsupported,

    /// The compression algorithm name or option is not supported.
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),
    /// An algorithm could not represent the tile contents.
    #[error("compression failed: {0}")]
    CompressionFailed(String),
    /// Compressed input is malformed.
    #[error("invalid stream: {0}")]
    InvalidStream(String),
    /// A value lies outside the representable range of the algorithm.
    #[error("value out of range: {0}")]
    ValueOutOfRange(i64),
    /// A per-tile failure, attributed to the originating tile.
    #[error("tile {index}: {source}")]
    Tile {
        index: usize,
        #[source]
        source: Box<Error>,
    },

    /// An I/O error from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap this error with the index of the tile that produced it.
    pub fn in_tile(self, index: usize) -> Self {
        match self {
            Error::Tile { .. } => self,
            other => Error::Tile {
                index,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through tile attribution.
    pub fn root(&self) -> &Error {
        match self {
            Error::Tile { source, .. } => source.root(),
            other => other,
        }
    }
}
