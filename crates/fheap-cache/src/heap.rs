//! Managed-object insertion over the block cache.
//!
//! A deliberately small layer: enough bump allocation to create direct
//! blocks, overflow the root into a root indirect block, and grow the root
//! row count, which together exercise every client operation. Huge and
//! tiny object stores, the free-space manager, and reads by ID stay out.

use tracing::{debug, trace};

use fheap_format::codec::{FileLayout, read_uint_var, write_uint_var};
use fheap_format::error::FormatError;
use fheap_format::{DoublingTable, FilterSpec};

use crate::cache::MemoryCache;
use crate::client::{Addr, Allocator, BlockKind, Parent};
use crate::direct::DirectBlock;
use crate::error::{HeapError, Result};
use crate::header::HeaderBlock;
use crate::indirect::{FilteredEntry, IndirectBlock};

/// Creation parameters for a fresh heap.
#[derive(Debug, Clone, Copy)]
pub struct HeapParams {
    pub layout: FileLayout,
    pub width: u16,
    pub start_block_size: u64,
    pub max_direct_size: u64,
    pub max_index: u16,
    pub start_root_rows: u16,
    /// Largest object accepted by the managed store
    pub max_man_size: u32,
    pub checksum_dblocks: bool,
    pub filter: Option<FilterSpec>,
}

impl Default for HeapParams {
    fn default() -> Self {
        Self {
            layout: FileLayout::default(),
            width: 4,
            start_block_size: 512,
            max_direct_size: 65536,
            max_index: 40,
            start_root_rows: 2,
            max_man_size: 4096,
            checksum_dblocks: true,
            filter: None,
        }
    }
}

/// Identity of a managed object: heap offset and length.
///
/// Encodes at the header's `id_len`: one flag byte, the offset at the
/// heap-offset width, the length at the largest direct-block offset width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapId {
    pub offset: u64,
    pub len: u64,
}

/// Flag byte of a managed-object ID (version 0, managed type)
const ID_FLAGS_MAN: u8 = 0x00;

impl HeapId {
    pub fn encode(&self, hdr: &HeaderBlock) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(usize::from(hdr.id_len));
        buf.push(ID_FLAGS_MAN);
        write_uint_var(&mut buf, self.offset, hdr.table.heap_off_size())?;
        write_uint_var(&mut buf, self.len, hdr.table.max_dir_blk_off_size())?;
        debug_assert_eq!(buf.len(), usize::from(hdr.id_len));
        Ok(buf)
    }

    pub fn decode(bytes: &[u8], hdr: &HeaderBlock) -> Result<Self> {
        if bytes.len() < usize::from(hdr.id_len) {
            return Err(FormatError::Truncated {
                expected: usize::from(hdr.id_len),
                actual: bytes.len(),
            }
            .into());
        }
        let mut r = std::io::Cursor::new(&bytes[..]);
        let flags = byteorder::ReadBytesExt::read_u8(&mut r)?;
        if flags != ID_FLAGS_MAN {
            return Err(FormatError::UnsupportedVersion {
                expected: ID_FLAGS_MAN,
                actual: flags,
            }
            .into());
        }
        let offset = read_uint_var(&mut r, hdr.table.heap_off_size())?;
        let len = read_uint_var(&mut r, hdr.table.max_dir_blk_off_size())?;
        Ok(Self { offset, len })
    }
}

/// A writable fractal heap backed by the in-memory cache.
#[derive(Debug)]
pub struct FractalHeap {
    cache: MemoryCache,
    heap_addr: Addr,
}

impl FractalHeap {
    /// Create an empty heap: a durable header, no root block yet.
    pub fn create(params: HeapParams) -> Result<Self> {
        let table = DoublingTable {
            width: params.width,
            start_block_size: params.start_block_size,
            max_direct_size: params.max_direct_size,
            max_index: params.max_index,
            start_root_rows: params.start_root_rows,
            table_addr: None,
            curr_root_rows: 0,
        };
        table.validate()?;

        let mut cache = MemoryCache::new(params.layout);
        let header_size = HeaderBlock::base_size(params.layout)
            + params.filter.map_or(0, |spec| {
                usize::from(params.layout.len_size) + 4 + spec.encoded_size()
            });
        let heap_addr = cache
            .space
            .allocate(BlockKind::Header, header_size as u64)?;
        let hdr = HeaderBlock::new(
            heap_addr,
            params.layout,
            table,
            params.max_man_size,
            params.checksum_dblocks,
            params.filter,
        )?;
        debug_assert_eq!(hdr.image_len(), header_size);
        cache.insert_header(hdr);
        debug!(heap_addr = format_args!("{heap_addr:#x}"), "heap created");
        Ok(Self { cache, heap_addr })
    }

    pub fn heap_addr(&self) -> Addr {
        self.heap_addr
    }

    pub fn cache(&self) -> &MemoryCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut MemoryCache {
        &mut self.cache
    }

    /// Insert a managed object, growing the block tree as needed.
    pub fn insert(&mut self, data: &[u8]) -> Result<HeapId> {
        let max = self.cache.header().max_man_size;
        if data.len() > max as usize {
            return Err(HeapError::ObjectTooLarge {
                size: data.len(),
                max,
            });
        }
        let needed = data.len() as u64;

        loop {
            let hdr = self.cache.header();
            if hdr.table.table_addr.is_none() {
                self.create_root_dblock();
                continue;
            }
            let iter = hdr.stats.man_iter_off;
            if iter >= hdr.stats.man_size {
                // Past every allocated block; grow the heap
                self.extend_heap()?;
                continue;
            }
            let (row, col) = hdr.table.lookup(iter);
            let bsize = hdr.table.row_block_size(row);
            let boff = hdr.table.row_offset(row) + u64::from(col) * bsize;
            let free = boff + bsize - iter;
            if free < needed {
                // Tail too small for this object; retire the block
                let hdr = self.cache.header_mut();
                hdr.total_man_free -= free;
                hdr.stats.man_iter_off = boff + bsize;
                trace!(block_off = boff, wasted = free, "direct block retired");
                continue;
            }

            let dblock_addr = self.current_dblock_addr(row, col);
            let db = self
                .cache
                .dblock_mut(dblock_addr)
                .unwrap_or_else(|| panic!("current direct block not resident"));
            let intra = (iter - boff) as usize;
            db.blk[intra..intra + data.len()].copy_from_slice(data);
            self.cache.mark_dirty(dblock_addr);

            let hdr = self.cache.header_mut();
            hdr.stats.man_iter_off = iter + needed;
            hdr.stats.man_nobjs += 1;
            hdr.total_man_free -= needed;
            trace!(offset = iter, len = needed, "object inserted");
            return Ok(HeapId {
                offset: iter,
                len: needed,
            });
        }
    }

    /// Address of the direct block covering row/col of the root table.
    fn current_dblock_addr(&self, row: u16, col: u16) -> Addr {
        let hdr = self.cache.header();
        let root = hdr
            .table
            .table_addr
            .unwrap_or_else(|| panic!("heap has no root block"));
        if hdr.table.curr_root_rows == 0 {
            assert_eq!((row, col), (0, 0), "lone root covers only the first slot");
            return root;
        }
        let idx = usize::from(row) * usize::from(hdr.table.width) + usize::from(col);
        let ib = self
            .cache
            .iblock(root)
            .unwrap_or_else(|| panic!("root indirect block not resident"));
        ib.ents[idx].unwrap_or_else(|| panic!("no direct block in slot {idx}"))
    }

    /// First insertion: a lone root direct block parented by the header.
    fn create_root_dblock(&mut self) {
        let size = self.cache.header().table.start_block_size;
        let tmp = self.cache.space.allocate_provisional(size);
        let hdr = self.cache.header_mut();
        let hs = DirectBlock::header_size(hdr) as u64;
        let db = DirectBlock::new(hdr, tmp, 0, size, Parent::Header);
        hdr.table.table_addr = Some(tmp);
        hdr.stats.man_size = size;
        hdr.stats.man_alloc_size = size;
        hdr.stats.man_iter_off = hs;
        hdr.total_man_free += size - hs;
        debug!(size, "root direct block created");
        self.cache.insert_dblock(db);
    }

    /// Add the next direct block, transitioning or growing the root first
    /// when the table is out of slots.
    fn extend_heap(&mut self) -> Result<()> {
        let hdr = self.cache.header();
        if hdr.table.curr_root_rows == 0 {
            self.root_to_iblock();
            return Ok(());
        }
        let next_off = hdr.stats.man_size;
        let (row, col) = hdr.table.lookup(next_off);
        if row >= hdr.table.max_direct_rows() {
            // Indirect-block rows are beyond this layer
            return Err(HeapError::HeapFull);
        }
        if row >= hdr.table.curr_root_rows {
            if hdr.table.curr_root_rows == hdr.table.max_root_rows() {
                return Err(HeapError::HeapFull);
            }
            self.double_root()?;
            return Ok(());
        }
        self.create_dblock(row, col);
        Ok(())
    }

    /// Push the lone root direct block down into a fresh root indirect
    /// block, re-wiring its flush dependency.
    fn root_to_iblock(&mut self) {
        let (old_root, nrows) = {
            let hdr = self.cache.header();
            (
                hdr.table
                    .table_addr
                    .unwrap_or_else(|| panic!("heap has no root block")),
                hdr.table.start_root_rows,
            )
        };
        let size = IndirectBlock::probe_size(self.cache.header(), nrows);
        let tmp = self.cache.space.allocate_provisional(size as u64);

        let hdr = self.cache.header_mut();
        let mut ib = IndirectBlock::new(hdr, tmp, 0, nrows, Parent::Header);
        ib.ents[0] = Some(old_root);
        ib.nchildren = 1;
        ib.max_child = 0;
        if let Some(filt) = ib.filt_ents.as_mut() {
            let root = hdr
                .filter
                .as_ref()
                .map_or_else(|| unreachable!("filtered entries without a filter"), |f| f.root);
            filt[0] = FilteredEntry {
                size: root.size,
                filter_mask: root.filter_mask,
            };
        }
        hdr.table.table_addr = Some(tmp);
        hdr.table.curr_root_rows = nrows;
        debug!(
            nrows,
            old_root = format_args!("{old_root:#x}"),
            "root grew into an indirect block"
        );
        self.cache.insert_iblock(ib);
        self.cache
            .reparent_dblock(old_root, Parent::Indirect { addr: tmp, entry: 0 });
    }

    /// Double the root indirect block's row count, relocating it if it
    /// already occupies durable space.
    fn double_root(&mut self) -> Result<()> {
        let (mut root, old_rows, new_rows, width, max_direct_rows, old_size) = {
            let hdr = self.cache.header();
            let root = hdr
                .table
                .table_addr
                .unwrap_or_else(|| panic!("heap has no root block"));
            let old_rows = hdr.table.curr_root_rows;
            let new_rows = (old_rows * 2).min(hdr.table.max_root_rows());
            (
                root,
                old_rows,
                new_rows,
                usize::from(hdr.table.width),
                hdr.table.max_direct_rows(),
                IndirectBlock::probe_size(hdr, old_rows) as u64,
            )
        };
        debug!(old_rows, new_rows, "root indirect block doubled");

        if !self.cache.space.is_provisional(root) {
            // The larger image will not fit the old allocation
            let hdr_ref = self.cache.header();
            let new_size = IndirectBlock::probe_size(hdr_ref, new_rows) as u64;
            self.cache.space.free(BlockKind::Indirect, root, old_size);
            let new_addr = self.cache.space.allocate(BlockKind::Indirect, new_size)?;
            self.cache.move_entry(root, new_addr);
            self.cache.header_mut().table.table_addr = Some(new_addr);
            root = new_addr;
        }

        let ib = self
            .cache
            .iblock_mut(root)
            .unwrap_or_else(|| panic!("root indirect block not resident"));
        let nslots = usize::from(new_rows) * width;
        ib.ents.resize(nslots, None);
        if let Some(filt) = ib.filt_ents.as_mut() {
            let ndirect = usize::from(new_rows.min(max_direct_rows));
            filt.resize(ndirect * width, FilteredEntry::default());
        }
        if new_rows > max_direct_rows {
            match ib.child_iblocks.as_mut() {
                Some(kids) => kids.resize(nslots, None),
                None => ib.child_iblocks = Some(vec![None; nslots]),
            }
        }
        ib.nrows = new_rows;
        self.cache.mark_dirty(root);
        self.cache.header_mut().table.curr_root_rows = new_rows;
        Ok(())
    }

    /// Create an empty direct block in the root table slot at row/col.
    fn create_dblock(&mut self, row: u16, col: u16) {
        let (root, bsize, boff, idx) = {
            let hdr = self.cache.header();
            let bsize = hdr.table.row_block_size(row);
            let boff = hdr.table.row_offset(row) + u64::from(col) * bsize;
            let idx = usize::from(row) * usize::from(hdr.table.width) + usize::from(col);
            let root = hdr
                .table
                .table_addr
                .unwrap_or_else(|| panic!("heap has no root block"));
            (root, bsize, boff, idx)
        };
        let tmp = self.cache.space.allocate_provisional(bsize);

        let hdr = self.cache.header_mut();
        let hs = DirectBlock::header_size(hdr) as u64;
        let db = DirectBlock::new(
            hdr,
            tmp,
            boff,
            bsize,
            Parent::Indirect { addr: root, entry: idx },
        );
        hdr.stats.man_size = boff + bsize;
        hdr.stats.man_alloc_size += bsize;
        hdr.stats.man_iter_off = boff + hs;
        hdr.total_man_free += bsize - hs;

        let ib = self
            .cache
            .iblock_mut(root)
            .unwrap_or_else(|| panic!("root indirect block not resident"));
        ib.ents[idx] = Some(tmp);
        ib.nchildren += 1;
        ib.max_child = ib.max_child.max(idx);
        if let Some(filt) = ib.filt_ents.as_mut() {
            // Logical size as placeholder until the block is first filtered
            filt[idx] = FilteredEntry {
                size: bsize,
                filter_mask: 0,
            };
        }
        self.cache.mark_dirty(root);
        trace!(row, col, block_off = boff, size = bsize, "direct block created");
        self.cache.insert_dblock(db);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn create_leaves_heap_empty() {
        let heap = FractalHeap::create(HeapParams::default()).unwrap();
        let hdr = heap.cache().header();
        assert_eq!(hdr.table.table_addr, None);
        assert_eq!(hdr.stats.man_nobjs, 0);
        assert_eq!(hdr.table.curr_root_rows, 0);
    }

    #[test]
    fn first_insert_creates_root_dblock() {
        let mut heap = FractalHeap::create(HeapParams::default()).unwrap();
        let id = heap.insert(b"hello heap").unwrap();
        let hdr = heap.cache().header();
        assert_eq!(hdr.stats.man_nobjs, 1);
        assert_eq!(hdr.table.curr_root_rows, 0);
        assert_eq!(id.len, 10);
        assert_eq!(id.offset, DirectBlock::header_size(hdr) as u64);
        // Object bytes land in the root block's payload
        let root = hdr.table.table_addr.unwrap();
        let db = heap.cache().dblock(root).unwrap();
        let at = id.offset as usize;
        assert_eq!(&db.blk[at..at + 10], b"hello heap");
    }

    #[test]
    fn id_round_trips_at_id_len() {
        let heap = FractalHeap::create(HeapParams::default()).unwrap();
        let hdr = heap.cache().header();
        let id = HeapId { offset: 0x1234, len: 77 };
        let encoded = id.encode(hdr).unwrap();
        assert_eq!(encoded.len(), usize::from(hdr.id_len));
        assert_eq!(HeapId::decode(&encoded, hdr).unwrap(), id);
    }

    #[test]
    fn oversized_object_is_rejected() {
        let mut heap = FractalHeap::create(HeapParams::default()).unwrap();
        let big = vec![0u8; 5000];
        assert!(matches!(
            heap.insert(&big),
            Err(HeapError::ObjectTooLarge { size: 5000, max: 4096 })
        ));
    }
}
