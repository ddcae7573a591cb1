//! Single-writer in-memory cache manager.
//!
//! This is the harness side of the block protocol: it owns the resident
//! blocks, the dirty flags, the flush-dependency graph, the file-space
//! allocator and a backing image map standing in for the file. Eviction
//! policy, reference-counted protect/unprotect locking and concurrent
//! readers belong to a full cache manager and are out of scope here; every
//! call is serialized by `&mut self`.
//!
//! Flush order is children-first: an entry is only written once none of its
//! flush-dependency children are resident and dirty, and the header goes
//! last. Address promotion reported by `pre_serialize` is applied here by
//! re-keying the entry, the dependency graph, and any resident child's
//! parent reference.

use std::collections::HashMap;

use tracing::{debug, trace};

use fheap_format::checksum::{metadata_checksum, split_trailing};
use fheap_format::codec::FileLayout;
use fheap_format::error::FormatError;

use crate::client::{Addr, Allocator, BlockKind, EntryStatus, NotifyAction, Parent};
use crate::deps::FlushDependencyGraph;
use crate::direct::{DirectBlock, DirectLoadContext};
use crate::error::{HeapError, Result};
use crate::header::{HeaderBlock, HeaderLoad};
use crate::indirect::{IndirectBlock, IndirectLoadContext};

/// Start of the provisional address range.
///
/// Provisional addresses are handed out above this mark and never reach
/// disk; address promotion replaces them before the first write.
pub const PROVISIONAL_BASE: Addr = 0xFFFF_0000_0000_0000;

/// Bump allocator over a simulated file, with a separate provisional range.
#[derive(Debug)]
pub struct FileSpace {
    next_durable: Addr,
    next_provisional: Addr,
    freed: u64,
}

impl FileSpace {
    /// Durable allocations start at `base`.
    pub fn new(base: Addr) -> Self {
        assert!(base < PROVISIONAL_BASE);
        Self {
            next_durable: base,
            next_provisional: PROVISIONAL_BASE,
            freed: 0,
        }
    }

    /// Hand out a provisional address for a block not yet written.
    pub fn allocate_provisional(&mut self, size: u64) -> Addr {
        let addr = self.next_provisional;
        self.next_provisional += size;
        addr
    }

    /// Bytes released back so far.
    pub fn freed_bytes(&self) -> u64 {
        self.freed
    }
}

impl Allocator for FileSpace {
    fn allocate(&mut self, _kind: BlockKind, size: u64) -> Result<Addr> {
        let addr = self.next_durable;
        let next = addr.checked_add(size).filter(|n| *n < PROVISIONAL_BASE);
        match next {
            Some(n) => {
                self.next_durable = n;
                Ok(addr)
            }
            None => Err(HeapError::AllocationFailure { requested: size }),
        }
    }

    fn free(&mut self, _kind: BlockKind, addr: Addr, size: u64) {
        debug_assert!(!self.is_provisional(addr), "freeing a provisional address");
        self.freed += size;
    }

    fn is_provisional(&self, addr: Addr) -> bool {
        addr >= PROVISIONAL_BASE
    }
}

/// A resident non-header block.
#[derive(Debug)]
pub enum Block {
    Indirect(IndirectBlock),
    Direct(DirectBlock),
}

impl Block {
    fn parent(&self) -> Option<Parent> {
        match self {
            Self::Indirect(b) => b.parent,
            Self::Direct(b) => b.parent,
        }
    }

    fn notify(&self, action: NotifyAction, hdr: &HeaderBlock, graph: &mut FlushDependencyGraph) {
        match self {
            Self::Indirect(b) => b.notify(action, hdr, graph),
            Self::Direct(b) => b.notify(action, hdr, graph),
        }
    }

    fn rename_parent(&mut self, old: Addr, new: Addr) {
        match self {
            Self::Indirect(b) => b.rename_parent(old, new),
            Self::Direct(b) => b.rename_parent(old, new),
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    block: Block,
    dirty: bool,
    pinned: bool,
}

/// The cache manager realization used to drive the block protocol.
#[derive(Debug)]
pub struct MemoryCache {
    /// Field widths of the simulated file
    pub layout: FileLayout,
    /// File-space allocator
    pub space: FileSpace,
    /// Flush-dependency edges among resident blocks
    pub deps: FlushDependencyGraph,
    header: Option<HeaderBlock>,
    header_dirty: bool,
    entries: HashMap<Addr, CacheEntry>,
    disk: HashMap<Addr, Vec<u8>>,
}

impl MemoryCache {
    pub fn new(layout: FileLayout) -> Self {
        Self {
            layout,
            space: FileSpace::new(0x100),
            deps: FlushDependencyGraph::new(),
            header: None,
            header_dirty: false,
            entries: HashMap::new(),
            disk: HashMap::new(),
        }
    }

    /// The resident header.
    ///
    /// # Panics
    /// Panics if no header is resident.
    pub fn header(&self) -> &HeaderBlock {
        self.header
            .as_ref()
            .unwrap_or_else(|| panic!("heap header not resident"))
    }

    /// Mutable access to the header; marks it dirty.
    pub fn header_mut(&mut self) -> &mut HeaderBlock {
        self.header_dirty = true;
        self.header
            .as_mut()
            .unwrap_or_else(|| panic!("heap header not resident"))
    }

    pub fn is_resident(&self, addr: Addr) -> bool {
        self.entries.contains_key(&addr)
    }

    /// Shared view of a resident indirect block.
    pub fn iblock(&self, addr: Addr) -> Option<&IndirectBlock> {
        match self.entries.get(&addr) {
            Some(CacheEntry { block: Block::Indirect(b), .. }) => Some(b),
            _ => None,
        }
    }

    /// Mutable view of a resident indirect block; pair with `mark_dirty`.
    pub fn iblock_mut(&mut self, addr: Addr) -> Option<&mut IndirectBlock> {
        match self.entries.get_mut(&addr) {
            Some(CacheEntry { block: Block::Indirect(b), .. }) => Some(b),
            _ => None,
        }
    }

    /// Shared view of a resident direct block.
    pub fn dblock(&self, addr: Addr) -> Option<&DirectBlock> {
        match self.entries.get(&addr) {
            Some(CacheEntry { block: Block::Direct(b), .. }) => Some(b),
            _ => None,
        }
    }

    /// Mutable view of a resident direct block; pair with `mark_dirty`.
    pub fn dblock_mut(&mut self, addr: Addr) -> Option<&mut DirectBlock> {
        match self.entries.get_mut(&addr) {
            Some(CacheEntry { block: Block::Direct(b), .. }) => Some(b),
            _ => None,
        }
    }

    /// The written image at an address, if any.
    pub fn disk_image(&self, addr: Addr) -> Option<&[u8]> {
        self.disk.get(&addr).map(Vec::as_slice)
    }

    /// Mutable access to a written image, for simulating file corruption.
    pub fn disk_image_mut(&mut self, addr: Addr) -> Option<&mut Vec<u8>> {
        self.disk.get_mut(&addr)
    }

    /// Make a fresh header resident and dirty.
    pub fn insert_header(&mut self, hdr: HeaderBlock) {
        assert!(self.header.is_none(), "header already resident");
        debug!(heap_addr = format_args!("{:#x}", hdr.heap_addr), "header inserted");
        self.header = Some(hdr);
        self.header_dirty = true;
    }

    /// Make a fresh indirect block resident and dirty.
    pub fn insert_iblock(&mut self, block: IndirectBlock) {
        let hdr = self
            .header
            .as_ref()
            .unwrap_or_else(|| panic!("heap header not resident"));
        block.notify(NotifyAction::AfterInsert, hdr, &mut self.deps);
        let prev = self.entries.insert(
            block.addr,
            CacheEntry { block: Block::Indirect(block), dirty: true, pinned: false },
        );
        assert!(prev.is_none(), "address already occupied");
    }

    /// Make a fresh direct block resident and dirty.
    pub fn insert_dblock(&mut self, block: DirectBlock) {
        let hdr = self
            .header
            .as_ref()
            .unwrap_or_else(|| panic!("heap header not resident"));
        block.notify(NotifyAction::AfterInsert, hdr, &mut self.deps);
        let prev = self.entries.insert(
            block.addr,
            CacheEntry { block: Block::Direct(block), dirty: true, pinned: false },
        );
        assert!(prev.is_none(), "address already occupied");
    }

    /// Speculative header load.
    ///
    /// Sizes the first read without assuming a filter, re-probes with the
    /// first bytes in hand, and re-reads at the corrected size when either
    /// the probe or `deserialize` reports the image short.
    pub fn load_header(&mut self, addr: Addr) -> Result<()> {
        assert!(self.header.is_none(), "header already resident");
        let stored = self.disk.get(&addr).ok_or(HeapError::BlockMissing(addr))?;

        let base = HeaderBlock::probe_size(self.layout, None)?;
        let mut len = base;
        let first = Self::read_prefix(stored, len)?;
        len = HeaderBlock::probe_size(self.layout, Some(first))?;
        let mut image = Self::read_prefix(stored, len)?;

        loop {
            Self::check_trailing(addr, image)?;
            match HeaderBlock::deserialize(image, addr, self.layout)? {
                HeaderLoad::Complete(hdr) => {
                    debug!(
                        heap_addr = format_args!("{addr:#x}"),
                        size = hdr.image_len(),
                        "header loaded"
                    );
                    self.header = Some(*hdr);
                    self.header_dirty = false;
                    return Ok(());
                }
                HeaderLoad::Incomplete { required_size } => {
                    trace!(required_size, "header image too small, re-reading");
                    image = Self::read_prefix(stored, required_size)?;
                }
            }
        }
    }

    /// Load an indirect block from disk.
    pub fn load_iblock(&mut self, addr: Addr, nrows: u16, parent: Parent) -> Result<()> {
        let hdr = self
            .header
            .as_mut()
            .unwrap_or_else(|| panic!("heap header not resident"));
        let size = IndirectBlock::probe_size(hdr, nrows);
        let stored = self.disk.get(&addr).ok_or(HeapError::BlockMissing(addr))?;
        let image = Self::read_prefix(stored, size)?;
        Self::check_trailing(addr, image)?;

        let ctx = IndirectLoadContext { addr, nrows, parent };
        let block = IndirectBlock::deserialize(image, hdr, &ctx)?;
        block.notify(NotifyAction::AfterLoad, hdr, &mut self.deps);
        let prev = self.entries.insert(
            addr,
            CacheEntry { block: Block::Indirect(block), dirty: false, pinned: false },
        );
        assert!(prev.is_none(), "address already occupied");
        Ok(())
    }

    /// Load a direct block from disk.
    ///
    /// `size` is the logical block size, known from the doubling-table row
    /// the parent used to reach this block.
    pub fn load_dblock(&mut self, addr: Addr, parent: Parent, size: u64) -> Result<()> {
        // The on-disk length and filter mask live on the parent's record
        let (disk_len, filter_mask) = {
            let hdr = self
                .header
                .as_ref()
                .unwrap_or_else(|| panic!("heap header not resident"));
            let parent_ib = match parent {
                Parent::Header => None,
                Parent::Indirect { addr: paddr, .. } => Some(
                    self.iblock(paddr)
                        .unwrap_or_else(|| panic!("parent iblock not resident")),
                ),
            };
            let probe_ctx = DirectLoadContext {
                addr,
                parent,
                size,
                filter_mask: 0,
                cached: None,
            };
            let disk_len = DirectBlock::probe_size(hdr, parent_ib, &probe_ctx);
            let mask = match parent {
                Parent::Header => hdr.filter.map_or(0, |f| f.root.filter_mask),
                Parent::Indirect { entry, .. } => parent_ib
                    .and_then(|p| p.filt_ents.as_ref())
                    .map_or(0, |filt| filt[entry].filter_mask),
            };
            (disk_len, mask)
        };

        let hdr = self
            .header
            .as_mut()
            .unwrap_or_else(|| panic!("heap header not resident"));
        let stored = self.disk.get(&addr).ok_or(HeapError::BlockMissing(addr))?;
        let image = Self::read_prefix(stored, disk_len)?;

        let mut ctx = DirectLoadContext {
            addr,
            parent,
            size,
            filter_mask,
            cached: None,
        };
        if !DirectBlock::verify_checksum(image, hdr, &mut ctx)? {
            let buf = ctx
                .cached
                .as_deref()
                .unwrap_or_else(|| unreachable!("checksum failed without a decoded buffer"));
            let (stored_sum, computed) = DirectBlock::checksum_parts(buf, hdr);
            return Err(HeapError::ChecksumMismatch {
                addr,
                stored: stored_sum,
                computed,
            });
        }
        let block = DirectBlock::deserialize(image, hdr, &mut ctx)?;
        block.notify(NotifyAction::AfterLoad, hdr, &mut self.deps);
        let prev = self.entries.insert(
            addr,
            CacheEntry { block: Block::Direct(block), dirty: false, pinned: false },
        );
        assert!(prev.is_none(), "address already occupied");
        Ok(())
    }

    /// Mark a resident entry dirty.
    pub fn mark_dirty(&mut self, addr: Addr) {
        let entry = self
            .entries
            .get_mut(&addr)
            .unwrap_or_else(|| panic!("no entry at {addr:#x}"));
        entry.dirty = true;
    }

    pub fn mark_header_dirty(&mut self) {
        assert!(self.header.is_some(), "heap header not resident");
        self.header_dirty = true;
    }

    /// Move a resident direct block under a new parent.
    pub fn reparent_dblock(&mut self, addr: Addr, new_parent: Parent) {
        let hdr = self
            .header
            .as_ref()
            .unwrap_or_else(|| panic!("heap header not resident"));
        match self.entries.get_mut(&addr) {
            Some(CacheEntry { block: Block::Direct(db), .. }) => {
                db.reparent(new_parent, hdr, &mut self.deps);
            }
            _ => panic!("no direct block at {addr:#x}"),
        }
    }

    /// Write one entry back to disk, promoting its address if needed.
    ///
    /// A clean entry is left untouched. Flushing an entry whose
    /// flush-dependency children are still dirty is a caller bug.
    pub fn flush_entry(&mut self, addr: Addr) -> Result<()> {
        let mut entry = self
            .entries
            .remove(&addr)
            .ok_or(HeapError::BlockMissing(addr))?;
        if !entry.dirty {
            self.entries.insert(addr, entry);
            return Ok(());
        }
        for child in self.deps.children_of(addr) {
            assert!(
                self.entries.get(&child).is_none_or(|e| !e.dirty),
                "flushing {addr:#x} while dependency child {child:#x} is dirty"
            );
        }

        let parent_live = entry.block.parent();
        let hdr = self
            .header
            .as_mut()
            .unwrap_or_else(|| panic!("heap header not resident"));

        let (outcome, image) = match &mut entry.block {
            Block::Indirect(ib) => {
                let len = ib.image_len(hdr);
                let parent_ib = Self::parent_iblock_mut(&mut self.entries, parent_live);
                let outcome = ib.pre_serialize(hdr, parent_ib, &mut self.space, addr, len)?;
                let mut image = vec![0u8; len];
                ib.serialize(hdr, &mut image)?;
                (outcome, image)
            }
            Block::Direct(db) => {
                let len = {
                    let parent_ib = Self::parent_iblock_mut(&mut self.entries, parent_live);
                    db.image_len(hdr, parent_ib.as_deref())
                };
                let parent_ib = Self::parent_iblock_mut(&mut self.entries, parent_live);
                let outcome = db.pre_serialize(hdr, parent_ib, &mut self.space, addr, len)?;
                let mut image = vec![0u8; outcome.new_filtered_len.unwrap_or(len)];
                db.serialize(&mut image);
                (outcome, image)
            }
        };

        let new_addr = outcome.new_addr.unwrap_or(addr);
        if outcome.new_addr.is_some() {
            self.apply_move(addr, new_addr);
        }
        if outcome.parent_dirty {
            match parent_live {
                Some(Parent::Indirect { addr: paddr, .. }) => self.mark_dirty(paddr),
                Some(Parent::Header) | None => self.header_dirty = true,
            }
        }

        trace!(
            addr = format_args!("{new_addr:#x}"),
            len = image.len(),
            "block flushed"
        );
        self.disk.insert(new_addr, image);
        entry.dirty = false;
        let hdr = self
            .header
            .as_ref()
            .unwrap_or_else(|| panic!("heap header not resident"));
        entry.block.notify(NotifyAction::AfterFlush, hdr, &mut self.deps);
        let prev = self.entries.insert(new_addr, entry);
        assert!(prev.is_none(), "address already occupied");
        Ok(())
    }

    /// Flush every dirty entry, children first, then the header.
    pub fn flush_all(&mut self) -> Result<()> {
        loop {
            let ready: Vec<Addr> = self
                .entries
                .iter()
                .filter(|(addr, entry)| entry.dirty && self.children_clean(**addr))
                .map(|(addr, _)| *addr)
                .collect();
            if ready.is_empty() {
                break;
            }
            for addr in ready {
                self.flush_entry(addr)?;
            }
        }
        debug_assert!(self.entries.values().all(|e| !e.dirty));
        if self.header_dirty {
            self.flush_header()?;
        }
        Ok(())
    }

    /// Write the header image; all descendants must already be clean.
    pub fn flush_header(&mut self) -> Result<()> {
        let hdr = self
            .header
            .as_ref()
            .unwrap_or_else(|| panic!("heap header not resident"));
        for child in self.deps.children_of(hdr.heap_addr) {
            assert!(
                self.entries.get(&child).is_none_or(|e| !e.dirty),
                "flushing header while dependency child {child:#x} is dirty"
            );
        }
        let len = hdr.image_len();
        let outcome = hdr.pre_serialize(&self.space, hdr.heap_addr, len);
        debug_assert_eq!(outcome, crate::client::PreSerializeOutcome::default());
        let mut image = vec![0u8; len];
        hdr.serialize(&mut image)?;
        self.disk.insert(hdr.heap_addr, image);
        self.header_dirty = false;
        Ok(())
    }

    /// Drop a clean entry from the cache, tearing down its dependency edge.
    pub fn evict(&mut self, addr: Addr) -> Result<()> {
        let entry = self
            .entries
            .remove(&addr)
            .ok_or(HeapError::BlockMissing(addr))?;
        assert!(!entry.dirty, "evicting dirty entry {addr:#x}");
        assert!(!entry.pinned, "evicting pinned entry {addr:#x}");
        let hdr = self
            .header
            .as_mut()
            .unwrap_or_else(|| panic!("heap header not resident"));
        entry.block.notify(NotifyAction::BeforeEvict, hdr, &mut self.deps);
        match entry.block {
            Block::Indirect(ib) => ib.release(hdr),
            Block::Direct(db) => db.release(hdr),
        }
        Ok(())
    }

    /// Drop the header once every block has released its handle.
    pub fn evict_header(&mut self) {
        assert!(!self.header_dirty, "evicting dirty header");
        let hdr = self
            .header
            .take()
            .unwrap_or_else(|| panic!("heap header not resident"));
        hdr.release();
    }

    /// Cache-entry flags at an address; the header reports under its own.
    pub fn get_entry_status(&self, addr: Addr) -> EntryStatus {
        let mut status = EntryStatus {
            flush_dep_parent: self.deps.is_flush_dep_parent(addr),
            flush_dep_child: self.deps.is_flush_dep_child(addr),
            ..EntryStatus::default()
        };
        if let Some(hdr) = &self.header
            && hdr.heap_addr == addr
        {
            status.in_cache = true;
            status.dirty = self.header_dirty;
            status.pinned = true;
            return status;
        }
        if let Some(entry) = self.entries.get(&addr) {
            status.in_cache = true;
            status.dirty = entry.dirty;
            status.pinned = entry.pinned;
        }
        status
    }

    fn children_clean(&self, addr: Addr) -> bool {
        self.deps
            .children_of(addr)
            .all(|c| self.entries.get(&c).is_none_or(|e| !e.dirty))
    }

    /// Move a resident entry to a new address outside the flush path.
    ///
    /// Used when a root indirect block grows and its durable allocation is
    /// replaced. The caller updates whatever points at the entry.
    pub(crate) fn move_entry(&mut self, old: Addr, new: Addr) {
        let mut entry = self
            .entries
            .remove(&old)
            .unwrap_or_else(|| panic!("no entry at {old:#x}"));
        match &mut entry.block {
            Block::Indirect(b) => b.addr = new,
            Block::Direct(b) => b.addr = new,
        }
        self.apply_move(old, new);
        let prev = self.entries.insert(new, entry);
        assert!(prev.is_none(), "address already occupied");
    }

    /// Re-key an entry's surroundings after address promotion.
    fn apply_move(&mut self, old: Addr, new: Addr) {
        debug!(
            old = format_args!("{old:#x}"),
            new = format_args!("{new:#x}"),
            "cache entry moved"
        );
        self.deps.rename_node(old, new);
        for entry in self.entries.values_mut() {
            entry.block.rename_parent(old, new);
        }
        self.disk.remove(&old);
    }

    fn parent_iblock_mut(
        entries: &mut HashMap<Addr, CacheEntry>,
        parent: Option<Parent>,
    ) -> Option<&mut IndirectBlock> {
        match parent {
            Some(Parent::Indirect { addr, .. }) => match entries.get_mut(&addr) {
                Some(CacheEntry { block: Block::Indirect(b), .. }) => Some(b),
                Some(_) => panic!("parent at {addr:#x} is not an indirect block"),
                None => panic!("parent iblock at {addr:#x} not resident"),
            },
            _ => None,
        }
    }

    fn read_prefix(stored: &[u8], len: usize) -> Result<&[u8]> {
        stored.get(..len).ok_or(HeapError::Format(FormatError::Truncated {
            expected: len,
            actual: stored.len(),
        }))
    }

    fn check_trailing(addr: Addr, image: &[u8]) -> Result<()> {
        let (body, stored) = split_trailing(image);
        let computed = metadata_checksum(body);
        if stored == computed {
            Ok(())
        } else {
            Err(HeapError::ChecksumMismatch { addr, stored, computed })
        }
    }
}
