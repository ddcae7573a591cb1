//! Block cache clients for doubling-table ("fractal") heaps.
//!
//! A fractal heap persists as three block kinds: a [`HeaderBlock`] root
//! descriptor, a tree of [`IndirectBlock`]s, and [`DirectBlock`] leaves
//! holding object bytes. Each speaks the same cache-client protocol:
//! probe size, verify checksum, deserialize, report image length,
//! pre-serialize, serialize, plus lifecycle notifications and release.
//!
//! The interesting parts of the protocol:
//!
//! - **Speculative header loads** — the header's length depends on a field
//!   inside it, so the first read is sized without a filter assumed and the
//!   load retries at the corrected size
//!   ([`HeaderLoad::Incomplete`](header::HeaderLoad)).
//! - **Flush dependencies** — parent blocks must not be finalized before
//!   their children are written; the [`deps::FlushDependencyGraph`] tracks
//!   the edges, created at insert/load and destroyed at evict using a
//!   parent snapshot taken when the block entered the cache.
//! - **Address promotion** — blocks are born at provisional addresses and
//!   move to durable file space lazily at first write-back, with the move
//!   recorded on the parent.
//! - **Filtered direct blocks** — a compressed disk image distinct from
//!   the logical buffer, whose size lives on the parent rather than in the
//!   image.
//!
//! [`cache::MemoryCache`] is a single-writer in-memory cache manager used
//! to drive the protocol end to end, and [`heap::FractalHeap`] a minimal
//! insertion layer on top of it.

pub mod cache;
pub mod client;
pub mod deps;
pub mod direct;
pub mod error;
pub mod header;
pub mod heap;
pub mod indirect;

pub use cache::{FileSpace, MemoryCache};
pub use client::{Addr, Allocator, BlockKind, EntryStatus, NotifyAction, Parent, PreSerializeOutcome};
pub use direct::{DirectBlock, DirectLoadContext};
pub use error::{HeapError, Result};
pub use header::{HeaderBlock, HeaderLoad, HeapStats};
pub use heap::{FractalHeap, HeapId, HeapParams};
pub use indirect::{IndirectBlock, IndirectLoadContext};
