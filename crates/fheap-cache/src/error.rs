//! Error types for the cache layer

use thiserror::Error;

use crate::client::Addr;

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, HeapError>;

/// Errors surfaced to callers of the block cache protocol.
///
/// Internal-consistency violations (size mismatches, structurally invalid
/// blocks) are deliberately not represented here; they are bugs and fail
/// via assertions instead of propagating.
#[derive(Debug, Error)]
pub enum HeapError {
    /// A block image failed to encode or decode
    #[error("format error: {0}")]
    Format(#[from] fheap_format::FormatError),

    /// The filter pipeline failed on a forward or reverse pass
    #[error("filter error: {0}")]
    Filter(#[from] fheap_format::FilterError),

    /// A block image's stored checksum does not match its contents
    #[error("checksum mismatch at {addr:#x}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Address of the block that failed verification
        addr: Addr,
        /// Checksum recorded in the image
        stored: u32,
        /// Checksum computed over the image
        computed: u32,
    },

    /// Durable file space could not be allocated
    #[error("allocation failure: {requested} bytes")]
    AllocationFailure {
        /// Size of the failed request
        requested: u64,
    },

    /// A block image names a different owning heap
    #[error("wrong heap address: expected {expected:#x}, found {actual:#x}")]
    WrongHeapAddress {
        /// Address of the heap the block was loaded for
        expected: Addr,
        /// Address recorded in the block image
        actual: Addr,
    },

    /// No block image or cache entry exists at the address
    #[error("no block at address {0:#x}")]
    BlockMissing(Addr),

    /// The object exceeds the heap's managed-object size cap
    #[error("object of {size} bytes exceeds the managed-object limit of {max}")]
    ObjectTooLarge {
        /// Size of the rejected object
        size: usize,
        /// The heap's configured cap
        max: u32,
    },

    /// The heap's root block table cannot grow any further
    #[error("heap address space exhausted")]
    HeapFull,
}

impl From<std::io::Error> for HeapError {
    fn from(err: std::io::Error) -> Self {
        Self::Format(fheap_format::FormatError::Io(err))
    }
}
