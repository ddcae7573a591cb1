//! Shared vocabulary of the block cache protocol.
//!
//! Every block type speaks the same six-operation protocol to the cache
//! manager: probe size, verify checksum, deserialize, report image length,
//! pre-serialize, serialize, plus lifecycle notifications and a final
//! release. The types here are the protocol's nouns; the per-block verbs
//! live in [`header`], [`indirect`] and [`direct`].
//!
//! [`header`]: crate::header
//! [`indirect`]: crate::indirect
//! [`direct`]: crate::direct

use crate::error::Result;

/// A file address.
pub type Addr = u64;

/// The three kinds of persistent heap blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// The heap header
    Header,
    /// An indirect (tree) block
    Indirect,
    /// A direct (leaf) block
    Direct,
}

/// Identity of a block's flush-dependency parent.
///
/// Each non-header block carries two of these: a mutable live parent and an
/// immutable snapshot captured when the block entered the cache. Eviction
/// tears down the snapshot's edge even if the live parent was cleared in the
/// meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    /// Parented directly by the heap header (root blocks)
    Header,
    /// Parented by an indirect block, occupying the given slot
    Indirect {
        /// Address of the parent indirect block
        addr: Addr,
        /// Slot index within the parent
        entry: usize,
    },
}

/// Lifecycle events delivered to a block by the cache manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    /// The block was inserted into the cache as a new entry
    AfterInsert,
    /// The block was loaded from disk into the cache
    AfterLoad,
    /// The block's image was written to disk
    AfterFlush,
    /// The block is about to leave the cache
    BeforeEvict,
}

/// What `pre_serialize` asks the cache manager to do before `serialize`.
///
/// A block never remaps or resizes its own cache entry; it reports the
/// move here and the manager applies it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PreSerializeOutcome {
    /// The block moved to this durable address
    pub new_addr: Option<Addr>,
    /// The on-disk image length changed (filtered direct blocks only)
    pub new_filtered_len: Option<usize>,
    /// The parent block recorded the move and must be marked dirty
    pub parent_dirty: bool,
}

/// File-space allocation, as consumed by address promotion.
///
/// `free` is never called for provisional addresses; callers check
/// `is_provisional` first.
pub trait Allocator {
    /// Allocate durable space for a block image.
    fn allocate(&mut self, kind: BlockKind, size: u64) -> Result<Addr>;

    /// Release durable space previously allocated.
    fn free(&mut self, kind: BlockKind, addr: Addr, size: u64);

    /// Whether an address lies in the provisional range.
    fn is_provisional(&self, addr: Addr) -> bool;
}

/// Cache-entry flags reported by `get_entry_status`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EntryStatus {
    /// An entry exists at the address
    pub in_cache: bool,
    /// The entry has unwritten changes
    pub dirty: bool,
    /// The entry is pinned in the cache
    pub pinned: bool,
    /// The entry is protected by an active access
    pub protected: bool,
    /// The entry has at least one flush-dependency child
    pub flush_dep_parent: bool,
    /// The entry is some other entry's flush-dependency child
    pub flush_dep_child: bool,
}
