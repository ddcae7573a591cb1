//! On-disk format primitives for doubling-table heaps.
//!
//! This crate holds the stateless binary layer shared by every heap block:
//!
//! - [`codec`] — variable-width little-endian field codecs and the
//!   [`FileLayout`] that configures length/address field widths per file
//! - [`dtable`] — the [`DoublingTable`] parameters and the block geometry
//!   derived from them
//! - [`checksum`] — the Jenkins lookup3 metadata checksum that terminates
//!   header and indirect-block images
//! - [`filter`] — the reversible [`FilterPipeline`] (deflate) applied to
//!   direct-block payloads of filtered heaps
//!
//! Block images themselves (header, indirect, direct) live in the cache
//! crate; everything here is pure data with no collaborators.

pub mod checksum;
pub mod codec;
pub mod dtable;
pub mod error;
pub mod filter;

pub use checksum::{CHECKSUM_SIZE, metadata_checksum, verify_trailing};
pub use codec::FileLayout;
pub use dtable::DoublingTable;
pub use error::{FormatError, Result};
pub use filter::{FilterError, FilterPipeline, FilterSpec};
