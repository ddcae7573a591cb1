//! The indirect block cache client.
//!
//! An indirect block is an internal tree node holding `nrows * width` child
//! slots. Direct-block rows carry, for filtered heaps, a compressed-size
//! and filter-mask pair next to each address; indirect-block rows never do,
//! since indirect images are not filtered. The image is fully sized by
//! `nrows` and the owning header, so loads are never speculative.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, trace};

use fheap_format::checksum::metadata_checksum;
use fheap_format::codec::{self, read_uint_var, write_uint_var};
use fheap_format::error::FormatError;

use crate::client::{Addr, Allocator, BlockKind, NotifyAction, Parent, PreSerializeOutcome};
use crate::deps::FlushDependencyGraph;
use crate::error::{HeapError, Result};
use crate::header::HeaderBlock;

/// Indirect block signature
pub const INDIRECT_MAGIC: [u8; 4] = *b"FHIB";
/// Indirect block format version
pub const INDIRECT_VERSION: u8 = 0;

/// Compressed size and filter mask recorded for a direct-block child.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FilteredEntry {
    /// On-disk size of the child's image
    pub size: u64,
    /// Filter mask recorded at the child's last write
    pub filter_mask: u32,
}

/// Load context supplied by the cache manager.
///
/// An indirect image does not record its own row count or position; the
/// parent that pointed at it does.
#[derive(Debug, Clone, Copy)]
pub struct IndirectLoadContext {
    /// Address the image was read from
    pub addr: Addr,
    /// Row count, known from the parent (or the header, for the root)
    pub nrows: u16,
    /// Identity of the pointing parent
    pub parent: Parent,
}

/// An internal node of the heap's block tree.
#[derive(Debug, Clone, PartialEq)]
pub struct IndirectBlock {
    /// Current cache-entry address
    pub addr: Addr,
    /// Heap offset of the space this block covers
    pub block_off: u64,
    /// Current row count
    pub nrows: u16,
    /// Largest row count this block may grow to
    pub max_rows: u16,
    /// Number of defined child slots
    pub nchildren: usize,
    /// Highest defined slot index
    pub max_child: usize,
    /// Child addresses, row-major, `nrows * width` long
    pub ents: Vec<Option<Addr>>,
    /// Filtered pairs for direct-block rows, present only on filtered heaps
    pub filt_ents: Option<Vec<FilteredEntry>>,
    /// Resident child indirect blocks, present only when indirect rows
    /// exist. Sized and carried through resizes here, but populated only
    /// once child indirect blocks can actually be created and loaded; the
    /// insertion layer currently stops at the root's direct rows.
    pub child_iblocks: Option<Vec<Option<Addr>>>,
    /// Live parent, cleared when the parent lets go first
    pub parent: Option<Parent>,
    /// Parent identity snapshot taken when this block entered the cache
    fd_parent: Parent,
}

impl IndirectBlock {
    /// Create a fresh, empty indirect block and take a header handle.
    pub fn new(
        hdr: &mut HeaderBlock,
        addr: Addr,
        block_off: u64,
        nrows: u16,
        parent: Parent,
    ) -> Self {
        let max_rows = match parent {
            Parent::Header => hdr.table.max_root_rows(),
            Parent::Indirect { .. } => nrows,
        };
        let nslots = usize::from(nrows) * usize::from(hdr.table.width);
        let filt_ents = hdr.filter.is_some().then(|| {
            let ndirect = usize::from(nrows.min(hdr.table.max_direct_rows()));
            vec![FilteredEntry::default(); ndirect * usize::from(hdr.table.width)]
        });
        let child_iblocks =
            (nrows > hdr.table.max_direct_rows()).then(|| vec![None; nslots]);
        hdr.share();
        Self {
            addr,
            block_off,
            nrows,
            max_rows,
            nchildren: 0,
            max_child: 0,
            ents: vec![None; nslots],
            filt_ents,
            child_iblocks,
            parent: Some(parent),
            fd_parent: parent,
        }
    }

    /// The parent identity captured at insert/load time.
    pub fn fd_parent(&self) -> Parent {
        self.fd_parent
    }

    /// Exact image length for a block of `nrows` rows under this header.
    pub fn probe_size(hdr: &HeaderBlock, nrows: u16) -> usize {
        let addr = usize::from(hdr.layout.addr_size);
        let len = usize::from(hdr.layout.len_size);
        let width = usize::from(hdr.table.width);
        let ndirect = usize::from(nrows.min(hdr.table.max_direct_rows()));
        let nindirect = usize::from(nrows.saturating_sub(hdr.table.max_direct_rows()));
        let dir_entry = addr + if hdr.filter.is_some() { len + 4 } else { 0 };
        4 + 1
            + addr
            + usize::from(hdr.table.heap_off_size())
            + ndirect * width * dir_entry
            + nindirect * width * addr
            + 4
    }

    /// Validate the trailing checksum of an indirect image.
    pub fn verify_checksum(image: &[u8]) -> bool {
        fheap_format::verify_trailing(image)
    }

    /// Decode an indirect image.
    ///
    /// # Panics
    /// Panics if the decoded block has no defined children; such a block
    /// must never exist on disk.
    pub fn deserialize(
        image: &[u8],
        hdr: &mut HeaderBlock,
        ctx: &IndirectLoadContext,
    ) -> Result<Self> {
        let expected = Self::probe_size(hdr, ctx.nrows);
        if image.len() < expected {
            return Err(FormatError::Truncated {
                expected,
                actual: image.len(),
            }
            .into());
        }
        let mut r = Cursor::new(image);
        codec::expect_magic(&mut r, INDIRECT_MAGIC)?;
        codec::expect_version(&mut r, INDIRECT_VERSION)?;
        let owner = hdr.layout.read_addr(&mut r)?;
        if owner != Some(hdr.heap_addr) {
            return Err(HeapError::WrongHeapAddress {
                expected: hdr.heap_addr,
                actual: owner.unwrap_or(u64::MAX),
            });
        }
        let block_off = read_uint_var(&mut r, hdr.table.heap_off_size())?;

        let width = usize::from(hdr.table.width);
        let max_direct_rows = hdr.table.max_direct_rows();
        let nslots = usize::from(ctx.nrows) * width;
        let mut ents = Vec::with_capacity(nslots);
        let mut filt_ents = hdr
            .filter
            .is_some()
            .then(|| Vec::with_capacity(usize::from(ctx.nrows.min(max_direct_rows)) * width));
        let mut nchildren = 0usize;
        let mut max_child = 0usize;
        for idx in 0..nslots {
            let row = (idx / width) as u16;
            let child = hdr.layout.read_addr(&mut r)?;
            if let Some(filt) = filt_ents.as_mut()
                && row < max_direct_rows
            {
                filt.push(FilteredEntry {
                    size: hdr.layout.read_len(&mut r)?,
                    filter_mask: r.read_u32::<LittleEndian>()?,
                });
            }
            if child.is_some() {
                nchildren += 1;
                max_child = idx;
            }
            ents.push(child);
        }
        assert!(nchildren > 0, "indirect block at {:#x} has no children", ctx.addr);

        let child_iblocks = (ctx.nrows > max_direct_rows).then(|| vec![None; nslots]);
        let max_rows = match ctx.parent {
            Parent::Header => hdr.table.max_root_rows(),
            Parent::Indirect { .. } => ctx.nrows,
        };
        hdr.share();
        trace!(
            addr = format_args!("{:#x}", ctx.addr),
            nrows = ctx.nrows,
            nchildren,
            "indirect block loaded"
        );
        Ok(Self {
            addr: ctx.addr,
            block_off,
            nrows: ctx.nrows,
            max_rows,
            nchildren,
            max_child,
            ents,
            filt_ents,
            child_iblocks,
            parent: Some(ctx.parent),
            fd_parent: ctx.parent,
        })
    }

    /// The image length; deterministic for indirect blocks.
    pub fn image_len(&self, hdr: &HeaderBlock) -> usize {
        Self::probe_size(hdr, self.nrows)
    }

    /// Promote a provisional address to durable space before first write.
    ///
    /// Reports the move; the cache manager remaps the entry. The parent's
    /// recorded address (header `table_addr` for the root, parent slot
    /// otherwise) is updated here and the parent reported dirty. At a
    /// durable address this is a no-op.
    pub fn pre_serialize(
        &mut self,
        hdr: &mut HeaderBlock,
        parent: Option<&mut Self>,
        alloc: &mut dyn Allocator,
        addr: Addr,
        len: usize,
    ) -> Result<PreSerializeOutcome> {
        assert_eq!(len, self.image_len(hdr), "indirect image length mismatch");
        let mut out = PreSerializeOutcome::default();
        if !alloc.is_provisional(addr) {
            return Ok(out);
        }

        let durable = alloc.allocate(BlockKind::Indirect, len as u64)?;
        debug!(
            old = format_args!("{addr:#x}"),
            new = format_args!("{durable:#x}"),
            "indirect block promoted to durable space"
        );
        self.addr = durable;
        match self.parent {
            Some(Parent::Header) => {
                hdr.table.table_addr = Some(durable);
            }
            Some(Parent::Indirect { entry, .. }) => {
                let parent = parent
                    .unwrap_or_else(|| panic!("parent iblock not supplied for {addr:#x}"));
                parent.ents[entry] = Some(durable);
            }
            None => panic!("unparented indirect block at {addr:#x}"),
        }
        out.new_addr = Some(durable);
        out.parent_dirty = true;
        Ok(out)
    }

    /// Encode the block into `image`, which must be exactly `image_len()`.
    pub fn serialize(&self, hdr: &HeaderBlock, image: &mut [u8]) -> Result<()> {
        let mut w = Vec::with_capacity(image.len());
        w.extend_from_slice(&INDIRECT_MAGIC);
        w.push(INDIRECT_VERSION);
        hdr.layout.write_addr(&mut w, Some(hdr.heap_addr))?;
        write_uint_var(&mut w, self.block_off, hdr.table.heap_off_size())?;

        let width = usize::from(hdr.table.width);
        let max_direct_rows = hdr.table.max_direct_rows();
        let mut recount = 0usize;
        for (idx, child) in self.ents.iter().enumerate() {
            let row = (idx / width) as u16;
            hdr.layout.write_addr(&mut w, *child)?;
            if let Some(filt) = &self.filt_ents
                && row < max_direct_rows
            {
                hdr.layout.write_len(&mut w, filt[idx].size)?;
                w.write_u32::<LittleEndian>(filt[idx].filter_mask)
                    .map_err(FormatError::from)?;
            }
            if child.is_some() {
                recount += 1;
            }
        }
        debug_assert_eq!(recount, self.nchildren, "child count drifted");

        let sum = metadata_checksum(&w);
        w.extend_from_slice(&sum.to_le_bytes());
        assert_eq!(w.len(), image.len(), "indirect image length mismatch");
        image.copy_from_slice(&w);
        Ok(())
    }

    /// Flush-dependency edge management.
    ///
    /// Insert and load create the edge to the parent; eviction destroys
    /// exactly the edge recorded in the snapshot, which survives the live
    /// parent being cleared.
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

    /// Drop the block's in-memory resources and the header handle.
    pub fn release(self, hdr: &mut HeaderBlock) {
        hdr.unshare();
    }
}

#[cfg(test)]
mod tests {
    use fheap_format::codec::FileLayout;
    use fheap_format::{DoublingTable, FilterSpec};
    use pretty_assertions::assert_eq;

    use super::*;

    fn header(filtered: bool) -> HeaderBlock {
        let table = DoublingTable {
            width: 4,
            start_block_size: 512,
            max_direct_size: 65536,
            max_index: 40,
            start_root_rows: 2,
            table_addr: Some(0x2000),
            curr_root_rows: 2,
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

    fn sample_iblock(hdr: &mut HeaderBlock) -> IndirectBlock {
        let mut ib = IndirectBlock::new(hdr, 0x2000, 0, 2, Parent::Header);
        ib.ents[0] = Some(0x3000);
        ib.ents[2] = Some(0x3400);
        ib.nchildren = 2;
        ib.max_child = 2;
        if let Some(filt) = &mut ib.filt_ents {
            filt[0] = FilteredEntry { size: 300, filter_mask: 0 };
            filt[2] = FilteredEntry { size: 280, filter_mask: 1 };
        }
        ib
    }

    #[test]
    fn round_trip_unfiltered() {
        let mut hdr = header(false);
        let ib = sample_iblock(&mut hdr);

        let mut image = vec![0u8; ib.image_len(&hdr)];
        ib.serialize(&hdr, &mut image).unwrap();
        assert!(IndirectBlock::verify_checksum(&image));

        let ctx = IndirectLoadContext {
            addr: 0x2000,
            nrows: 2,
            parent: Parent::Header,
        };
        let loaded = IndirectBlock::deserialize(&image, &mut hdr, &ctx).unwrap();
        assert_eq!(loaded, ib);
    }

    #[test]
    fn round_trip_filtered_pairs() {
        let mut hdr = header(true);
        let ib = sample_iblock(&mut hdr);
        assert!(ib.filt_ents.is_some());

        let mut image = vec![0u8; ib.image_len(&hdr)];
        ib.serialize(&hdr, &mut image).unwrap();

        let ctx = IndirectLoadContext {
            addr: 0x2000,
            nrows: 2,
            parent: Parent::Header,
        };
        let loaded = IndirectBlock::deserialize(&image, &mut hdr, &ctx).unwrap();
        assert_eq!(loaded, ib);
        assert_eq!(loaded.filt_ents.as_ref().unwrap()[2].filter_mask, 1);
    }

    #[test]
    fn filtered_image_is_larger() {
        let plain = header(false);
        let filtered = header(true);
        assert!(
            IndirectBlock::probe_size(&filtered, 2) > IndirectBlock::probe_size(&plain, 2)
        );
    }

    #[test]
    fn wrong_owner_is_rejected() {
        let mut hdr = header(false);
        let ib = sample_iblock(&mut hdr);
        let mut image = vec![0u8; ib.image_len(&hdr)];
        ib.serialize(&hdr, &mut image).unwrap();

        let mut other = header(false);
        other.heap_addr = 0x9999;
        let ctx = IndirectLoadContext {
            addr: 0x2000,
            nrows: 2,
            parent: Parent::Header,
        };
        assert!(matches!(
            IndirectBlock::deserialize(&image, &mut other, &ctx),
            Err(HeapError::WrongHeapAddress { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "has no children")]
    fn zero_children_is_rejected() {
        let mut hdr = header(false);
        // Hand-build an image with every slot undefined
        let mut w = Vec::new();
        w.extend_from_slice(&INDIRECT_MAGIC);
        w.push(INDIRECT_VERSION);
        hdr.layout.write_addr(&mut w, Some(hdr.heap_addr)).unwrap();
        write_uint_var(&mut w, 0, hdr.table.heap_off_size()).unwrap();
        for _ in 0..8 {
            hdr.layout.write_addr(&mut w, None).unwrap();
        }
        let sum = metadata_checksum(&w);
        w.extend_from_slice(&sum.to_le_bytes());

        let ctx = IndirectLoadContext {
            addr: 0x2000,
            nrows: 2,
            parent: Parent::Header,
        };
        let _ = IndirectBlock::deserialize(&w, &mut hdr, &ctx);
    }

    #[test]
    fn second_pre_serialize_is_a_no_op() {
        use crate::cache::FileSpace;
        use crate::client::Allocator;

        let mut hdr = header(false);
        let mut space = FileSpace::new(0x10000);
        let len = IndirectBlock::probe_size(&hdr, 2);
        let tmp = space.allocate_provisional(len as u64);
        let mut ib = sample_iblock(&mut hdr);
        ib.addr = tmp;

        let first = ib
            .pre_serialize(&mut hdr, None, &mut space, tmp, len)
            .unwrap();
        let durable = first.new_addr.unwrap();
        assert!(first.parent_dirty);
        assert!(!space.is_provisional(durable));
        assert_eq!(hdr.table.table_addr, Some(durable));

        let second = ib
            .pre_serialize(&mut hdr, None, &mut space, durable, len)
            .unwrap();
        assert_eq!(second, PreSerializeOutcome::default());
        assert_eq!(ib.addr, durable);
    }

    #[test]
    fn nonroot_max_rows_is_own_row_count() {
        let mut hdr = header(false);
        let ib = IndirectBlock::new(
            &mut hdr,
            0x5000,
            4096,
            3,
            Parent::Indirect { addr: 0x2000, entry: 9 },
        );
        assert_eq!(ib.max_rows, 3);
        let root = IndirectBlock::new(&mut hdr, 0x2000, 0, 2, Parent::Header);
        assert_eq!(root.max_rows, hdr.table.max_root_rows());
    }
}
