//! The direct block cache client.
//!
//! A direct block is a leaf: a flat buffer of `size` logical bytes holding
//! a small header followed by raw object payload. On a filtered heap the
//! disk image is the forward-filtered form of that buffer and its length is
//! recorded on the parent, not in the image itself, so sizing a load always
//! consults the parent. The optional checksum covers the logical bytes,
//! never the compressed ones.
//!
//! Write-back is two-phase: `pre_serialize` refreshes the logical header,
//! runs the forward filter, performs any address promotion or relocation,
//! and stages the outgoing buffer; `serialize` only copies the staged bytes
//! out. The split exists because the final address and size are unknown
//! until the filter pass and allocation complete.

use std::io::Cursor;

use tracing::{debug, trace};

use fheap_format::checksum::metadata_checksum;
use fheap_format::codec::{self, read_uint_var, write_uint_var};
use fheap_format::error::FormatError;
use fheap_format::filter::FilterPipeline;

use crate::client::{Addr, Allocator, BlockKind, NotifyAction, Parent, PreSerializeOutcome};
use crate::deps::FlushDependencyGraph;
use crate::error::{HeapError, Result};
use crate::header::{FilteredRoot, HeaderBlock};
use crate::indirect::{FilteredEntry, IndirectBlock};

/// Direct block signature
pub const DIRECT_MAGIC: [u8; 4] = *b"FHDB";
/// Direct block format version
pub const DIRECT_VERSION: u8 = 0;

/// Load context supplied by the cache manager.
#[derive(Debug)]
pub struct DirectLoadContext {
    /// Address the image was read from
    pub addr: Addr,
    /// Identity of the pointing parent
    pub parent: Parent,
    /// Logical block size, known from the doubling-table row
    pub size: u64,
    /// Filter mask recorded on the parent (0 for unfiltered heaps)
    pub filter_mask: u32,
    /// Logical bytes recovered by `verify_checksum`, consumed by
    /// `deserialize` so the reverse filter pass runs once
    pub cached: Option<Vec<u8>>,
}

/// Buffer staged between `pre_serialize` and `serialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StagedBuf {
    /// The block's own logical buffer goes out as-is
    Own,
    /// A separate filtered allocation goes out and is then dropped
    Filtered(Vec<u8>),
}

/// A leaf block of the heap.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectBlock {
    /// Current cache-entry address
    pub addr: Addr,
    /// Heap offset of this block's first byte
    pub block_off: u64,
    /// Logical size
    pub size: u64,
    /// Logical bytes: block header then object payload
    pub blk: Vec<u8>,
    /// On-disk size at last write, 0 if never serialized
    pub file_size: u64,
    /// Live parent, cleared when the parent lets go first
    pub parent: Option<Parent>,
    /// Parent identity snapshot taken when this block entered the cache
    fd_parent: Parent,
    staged: Option<StagedBuf>,
}

impl DirectBlock {
    /// Bytes of block header preceding the payload.
    pub fn header_size(hdr: &HeaderBlock) -> usize {
        4 + 1
            + usize::from(hdr.layout.addr_size)
            + usize::from(hdr.table.heap_off_size())
            + if hdr.checksum_dblocks { 4 } else { 0 }
    }

    /// Create a fresh, zeroed direct block and take a header handle.
    pub fn new(
        hdr: &mut HeaderBlock,
        addr: Addr,
        block_off: u64,
        size: u64,
        parent: Parent,
    ) -> Self {
        hdr.share();
        Self {
            addr,
            block_off,
            size,
            blk: vec![0u8; size as usize],
            file_size: 0,
            parent: Some(parent),
            fd_parent: parent,
            staged: None,
        }
    }

    /// The parent identity captured at insert/load time.
    pub fn fd_parent(&self) -> Parent {
        self.fd_parent
    }

    /// On-disk image length for a load.
    ///
    /// Unfiltered blocks are their logical size. Filtered blocks are the
    /// compressed size the parent recorded at last write; the image is not
    /// self-describing.
    pub fn probe_size(
        hdr: &HeaderBlock,
        parent: Option<&IndirectBlock>,
        ctx: &DirectLoadContext,
    ) -> usize {
        if hdr.filter.is_none() {
            return ctx.size as usize;
        }
        match ctx.parent {
            Parent::Header => hdr
                .filter
                .as_ref()
                .map_or(ctx.size as usize, |f| f.root.size as usize),
            Parent::Indirect { entry, .. } => {
                let parent =
                    parent.unwrap_or_else(|| panic!("parent iblock not supplied for load"));
                parent
                    .filt_ents
                    .as_ref()
                    .map_or(ctx.size as usize, |filt| filt[entry].size as usize)
            }
        }
    }

    /// Validate the logical checksum, reversing the filter pipeline first.
    ///
    /// The recovered logical buffer is cached on `ctx` so `deserialize`
    /// does not repeat the filter pass. Returns `true` unconditionally when
    /// the heap does not checksum direct blocks.
    pub fn verify_checksum(
        image: &[u8],
        hdr: &HeaderBlock,
        ctx: &mut DirectLoadContext,
    ) -> Result<bool> {
        if !hdr.checksum_dblocks {
            return Ok(true);
        }
        let mut buf = match &hdr.filter {
            Some(f) => f.spec.reverse(image, ctx.filter_mask)?,
            None => image.to_vec(),
        };
        if buf.len() != ctx.size as usize {
            return Err(FormatError::Truncated {
                expected: ctx.size as usize,
                actual: buf.len(),
            }
            .into());
        }
        // The stored checksum covers the block with its own field zeroed
        let off = Self::header_size(hdr) - 4;
        let stored = u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        buf[off..off + 4].fill(0);
        let computed = metadata_checksum(&buf);
        buf[off..off + 4].copy_from_slice(&stored.to_le_bytes());
        ctx.cached = Some(buf);
        Ok(stored == computed)
    }

    /// Decode a direct image into its logical form.
    pub fn deserialize(
        image: &[u8],
        hdr: &mut HeaderBlock,
        ctx: &mut DirectLoadContext,
    ) -> Result<Self> {
        let blk = match ctx.cached.take() {
            Some(buf) => buf,
            None => match &hdr.filter {
                Some(f) => f.spec.reverse(image, ctx.filter_mask)?,
                None => image.to_vec(),
            },
        };
        if blk.len() != ctx.size as usize {
            return Err(FormatError::Truncated {
                expected: ctx.size as usize,
                actual: blk.len(),
            }
            .into());
        }

        let mut r = Cursor::new(blk.as_slice());
        codec::expect_magic(&mut r, DIRECT_MAGIC)?;
        codec::expect_version(&mut r, DIRECT_VERSION)?;
        let owner = hdr.layout.read_addr(&mut r)?;
        if owner != Some(hdr.heap_addr) {
            return Err(HeapError::WrongHeapAddress {
                expected: hdr.heap_addr,
                actual: owner.unwrap_or(u64::MAX),
            });
        }
        let block_off = read_uint_var(&mut r, hdr.table.heap_off_size())?;

        let file_size = if hdr.filter.is_some() {
            image.len() as u64
        } else {
            0
        };
        hdr.share();
        trace!(
            addr = format_args!("{:#x}", ctx.addr),
            block_off,
            size = ctx.size,
            "direct block loaded"
        );
        Ok(Self {
            addr: ctx.addr,
            block_off,
            size: ctx.size,
            blk,
            file_size,
            parent: Some(ctx.parent),
            fd_parent: ctx.parent,
            staged: None,
        })
    }

    /// Best-known on-disk image length.
    ///
    /// For filtered heaps: the last written size if this block was ever
    /// serialized, else the parent's recorded entry, else the logical size
    /// as a placeholder.
    pub fn image_len(&self, hdr: &HeaderBlock, parent: Option<&IndirectBlock>) -> usize {
        if hdr.filter.is_none() {
            return self.size as usize;
        }
        if self.file_size > 0 {
            return self.file_size as usize;
        }
        match self.parent {
            Some(Parent::Header) | None => hdr
                .filter
                .as_ref()
                .map_or(self.size as usize, |f| f.root.size as usize),
            Some(Parent::Indirect { entry, .. }) => parent
                .and_then(|p| p.filt_ents.as_ref())
                .map_or(self.size as usize, |filt| filt[entry].size as usize),
        }
    }

    /// Refresh the logical header, filter, relocate, and stage the image.
    pub fn pre_serialize(
        &mut self,
        hdr: &mut HeaderBlock,
        mut parent: Option<&mut IndirectBlock>,
        alloc: &mut dyn Allocator,
        addr: Addr,
        len: usize,
    ) -> Result<PreSerializeOutcome> {
        self.encode_prefix(hdr)?;

        let mut out = PreSerializeOutcome::default();
        let at_tmp = alloc.is_provisional(addr);
        let filter_spec = hdr.filter.map(|f| f.spec);

        if let Some(spec) = filter_spec {
            let (compressed, mask) = spec.forward(&self.blk)?;
            let new_size = compressed.len() as u64;

            let (rec_size, rec_mask) = match self.parent {
                Some(Parent::Header) | None => hdr
                    .filter
                    .map_or((0, 0), |f| (f.root.size, f.root.filter_mask)),
                Some(Parent::Indirect { entry, .. }) => parent
                    .as_deref()
                    .and_then(|p| p.filt_ents.as_ref())
                    .map_or((0, 0), |filt| (filt[entry].size, filt[entry].filter_mask)),
            };

            if at_tmp || new_size != rec_size || mask != rec_mask {
                if !at_tmp {
                    alloc.free(BlockKind::Direct, addr, rec_size);
                }
                let durable = alloc.allocate(BlockKind::Direct, new_size)?;
                debug!(
                    old = format_args!("{addr:#x}"),
                    new = format_args!("{durable:#x}"),
                    size = new_size,
                    "filtered direct block relocated"
                );
                self.addr = durable;
                self.record_location(hdr, parent.as_deref_mut(), durable, new_size, mask);
                out.parent_dirty = true;
                if durable != addr {
                    out.new_addr = Some(durable);
                }
                if new_size as usize != len {
                    out.new_filtered_len = Some(new_size as usize);
                }
            }
            self.file_size = new_size;
            self.staged = Some(StagedBuf::Filtered(compressed));
        } else {
            assert_eq!(len, self.size as usize, "direct image length mismatch");
            if at_tmp {
                let durable = alloc.allocate(BlockKind::Direct, self.size)?;
                debug!(
                    old = format_args!("{addr:#x}"),
                    new = format_args!("{durable:#x}"),
                    "direct block promoted to durable space"
                );
                self.addr = durable;
                self.record_location(hdr, parent.as_deref_mut(), durable, self.size, 0);
                out.new_addr = Some(durable);
                out.parent_dirty = true;
            }
            self.staged = Some(StagedBuf::Own);
        }
        Ok(out)
    }

    /// Copy the staged buffer into the cache manager's image buffer.
    pub fn serialize(&mut self, image: &mut [u8]) {
        match self.staged.take() {
            Some(StagedBuf::Own) => {
                assert_eq!(image.len(), self.blk.len(), "direct image length mismatch");
                image.copy_from_slice(&self.blk);
            }
            Some(StagedBuf::Filtered(buf)) => {
                assert_eq!(image.len(), buf.len(), "filtered image length mismatch");
                image.copy_from_slice(&buf);
                // buf dropped here; the logical buffer stays resident
            }
            None => panic!("serialize without a staged image"),
        }
    }

    /// Flush-dependency edge management; see `IndirectBlock::notify`.
    pub fn notify(
        &self,
        action: NotifyAction,
        hdr: &HeaderBlock,
        graph: &mut FlushDependencyGraph,
    ) {
        let parent_addr = match self.fd_parent {
            Parent::Header => hdr.heap_addr,
            Parent::Indirect { addr, .. } => addr,
        };
        match action {
            NotifyAction::AfterInsert | NotifyAction::AfterLoad => {
                assert_eq!(
                    self.parent,
                    Some(self.fd_parent),
                    "live parent diverged from snapshot at registration"
                );
                graph.create_edge(parent_addr, self.addr);
            }
            NotifyAction::AfterFlush => {}
            NotifyAction::BeforeEvict => graph.destroy_edge(parent_addr, self.addr),
        }
    }

    /// Move this block under a new parent, re-wiring its dependency edge.
    ///
    /// Used when the root direct block is pushed down into a freshly
    /// created root indirect block.
    pub fn reparent(
        &mut self,
        new_parent: Parent,
        hdr: &HeaderBlock,
        graph: &mut FlushDependencyGraph,
    ) {
        let old_addr = match self.fd_parent {
            Parent::Header => hdr.heap_addr,
            Parent::Indirect { addr, .. } => addr,
        };
        graph.destroy_edge(old_addr, self.addr);
        self.parent = Some(new_parent);
        self.fd_parent = new_parent;
        let new_addr = match new_parent {
            Parent::Header => hdr.heap_addr,
            Parent::Indirect { addr, .. } => addr,
        };
        graph.create_edge(new_addr, self.addr);
    }

    /// Re-point parent references after the parent iblock moved.
    pub fn rename_parent(&mut self, old: Addr, new: Addr) {
        if let Some(Parent::Indirect { addr, entry }) = self.parent
            && addr == old
        {
            self.parent = Some(Parent::Indirect { addr: new, entry });
        }
        if let Parent::Indirect { addr, entry } = self.fd_parent
            && addr == old
        {
            self.fd_parent = Parent::Indirect { addr: new, entry };
        }
    }

    /// Drop the block's buffers and the header handle.
    pub fn release(self, hdr: &mut HeaderBlock) {
        hdr.unshare();
    }

    /// Record a new location (and, for filtered heaps, size and mask) on
    /// whichever parent points at this block.
    fn record_location(
        &self,
        hdr: &mut HeaderBlock,
        parent: Option<&mut IndirectBlock>,
        addr: Addr,
        size: u64,
        filter_mask: u32,
    ) {
        match self.parent {
            Some(Parent::Header) | None => {
                if let Some(f) = hdr.filter.as_mut() {
                    f.root = FilteredRoot { size, filter_mask };
                }
                hdr.table.table_addr = Some(addr);
            }
            Some(Parent::Indirect { entry, .. }) => {
                let parent =
                    parent.unwrap_or_else(|| panic!("parent iblock not supplied for relocation"));
                parent.ents[entry] = Some(addr);
                if let Some(filt) = parent.filt_ents.as_mut() {
                    filt[entry] = FilteredEntry { size, filter_mask };
                }
            }
        }
    }

    /// Stored and computed checksums of a decoded logical buffer, for
    /// error reporting after a failed verification.
    pub(crate) fn checksum_parts(buf: &[u8], hdr: &HeaderBlock) -> (u32, u32) {
        let off = Self::header_size(hdr) - 4;
        let stored = u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        let mut tmp = buf.to_vec();
        tmp[off..off + 4].fill(0);
        (stored, metadata_checksum(&tmp))
    }

    /// Re-encode the block header fields (and checksum) into `blk`.
    fn encode_prefix(&mut self, hdr: &HeaderBlock) -> Result<()> {
        let mut w = Vec::with_capacity(Self::header_size(hdr));
        w.extend_from_slice(&DIRECT_MAGIC);
        w.push(DIRECT_VERSION);
        hdr.layout.write_addr(&mut w, Some(hdr.heap_addr))?;
        write_uint_var(&mut w, self.block_off, hdr.table.heap_off_size())?;
        if hdr.checksum_dblocks {
            w.extend_from_slice(&[0u8; 4]);
        }
        assert!(w.len() <= self.blk.len(), "block smaller than its header");
        self.blk[..w.len()].copy_from_slice(&w);

        if hdr.checksum_dblocks {
            let off = Self::header_size(hdr) - 4;
            let sum = metadata_checksum(&self.blk);
            self.blk[off..off + 4].copy_from_slice(&sum.to_le_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use fheap_format::codec::FileLayout;
    use fheap_format::{DoublingTable, FilterSpec};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cache::FileSpace;

    fn header(filtered: bool) -> HeaderBlock {
        let table = DoublingTable {
            width: 4,
            start_block_size: 512,
            max_direct_size: 65536,
            max_index: 40,
            start_root_rows: 2,
            table_addr: None,
            curr_root_rows: 0,
        };
        HeaderBlock::new(
            0x1000,
            FileLayout::default(),
            table,
            4096,
            true,
            filtered.then_some(FilterSpec::Deflate { level: 6 }),
        )
        .unwrap()
    }

    fn fill_payload(db: &mut DirectBlock, hdr: &HeaderBlock) {
        let start = DirectBlock::header_size(hdr);
        for (i, byte) in db.blk[start..].iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
    }

    #[test]
    fn unfiltered_round_trip() {
        let mut hdr = header(false);
        let mut space = FileSpace::new(0x10000);
        let tmp = space.allocate_provisional(512);
        let mut db = DirectBlock::new(&mut hdr, tmp, 0, 512, Parent::Header);
        fill_payload(&mut db, &hdr);

        let out = db
            .pre_serialize(&mut hdr, None, &mut space, tmp, 512)
            .unwrap();
        assert!(out.new_addr.is_some());
        assert!(out.parent_dirty);
        assert_eq!(hdr.table.table_addr, out.new_addr);

        let mut image = vec![0u8; 512];
        db.serialize(&mut image);

        let mut ctx = DirectLoadContext {
            addr: db.addr,
            parent: Parent::Header,
            size: 512,
            filter_mask: 0,
            cached: None,
        };
        assert!(DirectBlock::verify_checksum(&image, &hdr, &mut ctx).unwrap());
        assert!(ctx.cached.is_some());
        let loaded = DirectBlock::deserialize(&image, &mut hdr, &mut ctx).unwrap();
        assert_eq!(loaded.blk, db.blk);
        assert_eq!(loaded.block_off, db.block_off);
    }

    #[test]
    fn filtered_round_trip_via_header_record() {
        let mut hdr = header(true);
        let mut space = FileSpace::new(0x10000);
        let tmp = space.allocate_provisional(512);
        let mut db = DirectBlock::new(&mut hdr, tmp, 0, 512, Parent::Header);
        fill_payload(&mut db, &hdr);

        let placeholder = db.image_len(&hdr, None);
        let out = db
            .pre_serialize(&mut hdr, None, &mut space, tmp, placeholder)
            .unwrap();
        assert!(out.parent_dirty);
        let filtered_len = out.new_filtered_len.unwrap();
        assert!(filtered_len < 512, "payload should compress");
        assert_eq!(hdr.filter.unwrap().root.size, filtered_len as u64);

        let mut image = vec![0u8; filtered_len];
        db.serialize(&mut image);

        let mut ctx = DirectLoadContext {
            addr: db.addr,
            parent: Parent::Header,
            size: 512,
            filter_mask: hdr.filter.unwrap().root.filter_mask,
            cached: None,
        };
        assert_eq!(DirectBlock::probe_size(&hdr, None, &ctx), filtered_len);
        assert!(DirectBlock::verify_checksum(&image, &hdr, &mut ctx).unwrap());
        let loaded = DirectBlock::deserialize(&image, &mut hdr, &mut ctx).unwrap();
        assert_eq!(loaded.blk, db.blk);
        assert_eq!(loaded.file_size, filtered_len as u64);
    }

    #[test]
    fn second_pre_serialize_is_a_no_op() {
        let mut hdr = header(false);
        let mut space = FileSpace::new(0x10000);
        let tmp = space.allocate_provisional(512);
        let mut db = DirectBlock::new(&mut hdr, tmp, 0, 512, Parent::Header);
        fill_payload(&mut db, &hdr);

        let first = db
            .pre_serialize(&mut hdr, None, &mut space, tmp, 512)
            .unwrap();
        let durable = first.new_addr.unwrap();

        let second = db
            .pre_serialize(&mut hdr, None, &mut space, durable, 512)
            .unwrap();
        assert_eq!(second, PreSerializeOutcome::default());
        assert_eq!(db.addr, durable);
    }

    #[test]
    fn filtered_idempotent_when_content_unchanged() {
        let mut hdr = header(true);
        let mut space = FileSpace::new(0x10000);
        let tmp = space.allocate_provisional(512);
        let mut db = DirectBlock::new(&mut hdr, tmp, 0, 512, Parent::Header);
        fill_payload(&mut db, &hdr);

        let len = db.image_len(&hdr, None);
        let first = db.pre_serialize(&mut hdr, None, &mut space, tmp, len).unwrap();
        let durable = first.new_addr.unwrap();
        let flen = first.new_filtered_len.unwrap();
        let mut image = vec![0u8; flen];
        db.serialize(&mut image);

        let second = db
            .pre_serialize(&mut hdr, None, &mut space, durable, flen)
            .unwrap();
        assert_eq!(second, PreSerializeOutcome::default());
    }

    #[test]
    fn corruption_fails_logical_checksum() {
        let mut hdr = header(false);
        let mut space = FileSpace::new(0x10000);
        let tmp = space.allocate_provisional(512);
        let mut db = DirectBlock::new(&mut hdr, tmp, 0, 512, Parent::Header);
        fill_payload(&mut db, &hdr);
        db.pre_serialize(&mut hdr, None, &mut space, tmp, 512).unwrap();
        let mut image = vec![0u8; 512];
        db.serialize(&mut image);

        *image.last_mut().unwrap() ^= 0xFF;
        let mut ctx = DirectLoadContext {
            addr: db.addr,
            parent: Parent::Header,
            size: 512,
            filter_mask: 0,
            cached: None,
        };
        assert!(!DirectBlock::verify_checksum(&image, &hdr, &mut ctx).unwrap());
    }

    #[test]
    fn reparent_rewires_dependency_edge() {
        let mut hdr = header(false);
        let mut graph = FlushDependencyGraph::new();
        let mut db = DirectBlock::new(&mut hdr, 0x3000, 0, 512, Parent::Header);
        db.notify(NotifyAction::AfterInsert, &hdr, &mut graph);
        assert_eq!(graph.parent_of(0x3000), Some(hdr.heap_addr));

        db.reparent(Parent::Indirect { addr: 0x2000, entry: 0 }, &hdr, &mut graph);
        assert_eq!(graph.parent_of(0x3000), Some(0x2000));
        assert!(!graph.is_flush_dep_parent(hdr.heap_addr));
    }
}
