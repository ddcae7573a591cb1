//! Error types for the on-disk format layer

use thiserror::Error;

/// Result type for format operations
pub type Result<T> = std::result::Result<T, FormatError>;

/// Errors raised while encoding or decoding block images
#[derive(Debug, Error)]
pub enum FormatError {
    /// IO error from an underlying reader/writer
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Block signature did not match the expected magic bytes
    #[error("invalid block magic: expected {expected:02X?}, got {actual:02X?}")]
    InvalidMagic {
        /// The magic the block type requires
        expected: [u8; 4],
        /// The bytes found in the image
        actual: [u8; 4],
    },

    /// Block format version is not one this crate understands
    #[error("unsupported block version: expected {expected}, got {actual}")]
    UnsupportedVersion {
        /// Version this implementation writes
        expected: u8,
        /// Version found in the image
        actual: u8,
    },

    /// Image ended before a complete block could be read
    #[error("truncated image: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes needed to finish decoding
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// A value cannot be represented in the configured field width
    #[error("field value {value} does not fit in {width} bytes")]
    FieldOverflow {
        /// The value being encoded
        value: u64,
        /// Field width in bytes
        width: u8,
    },

    /// Field widths must be between 1 and 8 bytes
    #[error("invalid field width: {0} (must be 1..=8)")]
    InvalidFieldWidth(u8),

    /// Doubling-table parameters violate a structural constraint
    #[error("invalid doubling table: {0}")]
    InvalidDoublingTable(String),
}
