//! Reversible I/O filter pipeline for direct-block payloads.
//!
//! A filtered heap stores each direct block through a pipeline: the forward
//! pass runs at write time over the block's logical bytes, the reverse pass
//! at read time over the on-disk bytes. Alongside the transformed bytes
//! every filtered block records a *filter mask*: bit N set means filter N
//! was skipped for that block, so the reverse pass must skip it too.
//!
//! The pipeline descriptor is embedded in the heap header so a reader needs
//! nothing but the file to decode the heap.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use thiserror::Error;
use tracing::trace;

/// Descriptor version written into the header
const FILTER_INFO_VERSION: u8 = 1;

/// Filter identifier for deflate
const FILTER_ID_DEFLATE: u16 = 1;

/// Errors raised by the filter pipeline
#[derive(Debug, Error)]
pub enum FilterError {
    /// IO error from the underlying codec
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Descriptor version this crate does not understand
    #[error("unsupported filter info version: {0}")]
    UnsupportedVersion(u8),

    /// Descriptor names a filter this crate has no implementation for
    #[error("unknown filter id: {0}")]
    UnknownFilter(u16),

    /// Deflate level outside 0..=9
    #[error("invalid deflate level: {0}")]
    InvalidLevel(u32),
}

/// A pipeline applied between a block's logical bytes and its disk image.
pub trait FilterPipeline {
    /// Transform logical bytes into their on-disk form.
    ///
    /// Returns the transformed bytes and the filter mask that applied.
    fn forward(&self, data: &[u8]) -> Result<(Vec<u8>, u32), FilterError>;

    /// Undo the forward pass, honoring the stored filter mask.
    fn reverse(&self, data: &[u8], mask: u32) -> Result<Vec<u8>, FilterError>;
}

/// The encodable pipeline description stored in the heap header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSpec {
    /// zlib deflate at the given level (0..=9)
    Deflate {
        /// Compression level
        level: u32,
    },
}

impl FilterSpec {
    /// Size of the encoded descriptor in bytes.
    pub fn encoded_size(&self) -> usize {
        // version + filter id + parameter count + one u32 parameter
        match self {
            Self::Deflate { .. } => 1 + 2 + 2 + 4,
        }
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), FilterError> {
        w.write_u8(FILTER_INFO_VERSION)?;
        match self {
            Self::Deflate { level } => {
                if *level > 9 {
                    return Err(FilterError::InvalidLevel(*level));
                }
                w.write_u16::<LittleEndian>(FILTER_ID_DEFLATE)?;
                w.write_u16::<LittleEndian>(1)?;
                w.write_u32::<LittleEndian>(*level)?;
            }
        }
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self, FilterError> {
        let version = r.read_u8()?;
        if version != FILTER_INFO_VERSION {
            return Err(FilterError::UnsupportedVersion(version));
        }
        let id = r.read_u16::<LittleEndian>()?;
        match id {
            FILTER_ID_DEFLATE => {
                let nparams = r.read_u16::<LittleEndian>()?;
                let mut level = 6;
                for i in 0..nparams {
                    let param = r.read_u32::<LittleEndian>()?;
                    if i == 0 {
                        level = param;
                    }
                }
                if level > 9 {
                    return Err(FilterError::InvalidLevel(level));
                }
                trace!(level, "decoded deflate filter descriptor");
                Ok(Self::Deflate { level })
            }
            other => Err(FilterError::UnknownFilter(other)),
        }
    }

    /// Decode from a byte slice of exactly the encoded descriptor.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FilterError> {
        Self::decode(&mut Cursor::new(bytes))
    }
}

impl FilterPipeline for FilterSpec {
    fn forward(&self, data: &[u8]) -> Result<(Vec<u8>, u32), FilterError> {
        match self {
            Self::Deflate { level } => {
                if *level > 9 {
                    return Err(FilterError::InvalidLevel(*level));
                }
                let mut encoder =
                    ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(*level));
                encoder.write_all(data)?;
                let out = encoder.finish()?;
                trace!("deflate forward: {} -> {} bytes", data.len(), out.len());
                Ok((out, 0))
            }
        }
    }

    fn reverse(&self, data: &[u8], mask: u32) -> Result<Vec<u8>, FilterError> {
        match self {
            Self::Deflate { .. } => {
                if mask & 0x1 != 0 {
                    // Filter was skipped when the block was written
                    return Ok(data.to_vec());
                }
                let mut decoder = ZlibDecoder::new(data);
                let mut out = Vec::with_capacity(data.len() * 2);
                decoder.read_to_end(&mut out)?;
                trace!("deflate reverse: {} -> {} bytes", data.len(), out.len());
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn deflate_round_trip() {
        let spec = FilterSpec::Deflate { level: 6 };
        let data = vec![0xABu8; 4096];
        let (compressed, mask) = spec.forward(&data).unwrap();
        assert_eq!(mask, 0);
        assert!(compressed.len() < data.len());
        let restored = spec.reverse(&compressed, mask).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn mask_bit_skips_the_filter() {
        let spec = FilterSpec::Deflate { level: 6 };
        let raw = b"stored without compression".to_vec();
        let restored = spec.reverse(&raw, 0x1).unwrap();
        assert_eq!(restored, raw);
    }

    #[test]
    fn descriptor_round_trip() {
        let spec = FilterSpec::Deflate { level: 9 };
        let mut buf = Vec::new();
        spec.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), spec.encoded_size());
        assert_eq!(FilterSpec::from_bytes(&buf).unwrap(), spec);
    }

    #[test]
    fn descriptor_rejects_unknown_filter() {
        let mut buf = Vec::new();
        buf.push(FILTER_INFO_VERSION);
        buf.extend_from_slice(&0x7777u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        assert!(matches!(
            FilterSpec::from_bytes(&buf),
            Err(FilterError::UnknownFilter(0x7777))
        ));
    }

    #[test]
    fn descriptor_rejects_bad_level() {
        let spec = FilterSpec::Deflate { level: 12 };
        let mut buf = Vec::new();
        assert!(matches!(
            spec.encode(&mut buf),
            Err(FilterError::InvalidLevel(12))
        ));
    }

    #[test]
    fn reverse_of_garbage_fails() {
        let spec = FilterSpec::Deflate { level: 6 };
        assert!(spec.reverse(b"not zlib data", 0).is_err());
    }
}
