//! The heap header cache client.
//!
//! The header is the root descriptor of a heap: doubling-table parameters,
//! running statistics, huge/tiny-object bookkeeping, and, for filtered
//! heaps, the embedded filter-pipeline descriptor plus the compressed size
//! and mask of the root direct block.
//!
//! Its on-disk length is not knowable up front: the filter descriptor sits
//! after the fixed prefix and its presence is announced by a field inside
//! that prefix. Loads are therefore speculative: size the image without
//! assuming a filter, and re-probe once the first bytes are in hand. The
//! too-small first read is reported as [`HeaderLoad::Incomplete`] with the
//! corrected size, never as an error and never as a partial success.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use fheap_format::checksum::{CHECKSUM_SIZE, metadata_checksum, verify_trailing};
use fheap_format::codec::{self, FileLayout};
use fheap_format::error::FormatError;
use fheap_format::{DoublingTable, FilterSpec};

use crate::client::{Addr, Allocator, PreSerializeOutcome};
use crate::error::Result;

/// Header block signature
pub const HEADER_MAGIC: [u8; 4] = *b"FRHP";
/// Header format version
pub const HEADER_VERSION: u8 = 0;

const FLAG_HUGE_IDS_WRAPPED: u8 = 0x01;
const FLAG_CHECKSUM_DBLOCKS: u8 = 0x02;

/// Running totals maintained across insertions and removals.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Managed space in the heap
    pub man_size: u64,
    /// Managed space actually allocated in the file
    pub man_alloc_size: u64,
    /// Heap offset of the managed-space insertion iterator
    pub man_iter_off: u64,
    /// Number of managed objects
    pub man_nobjs: u64,
    /// Total size of huge objects
    pub huge_size: u64,
    /// Number of huge objects
    pub huge_nobjs: u64,
    /// Total size of tiny objects
    pub tiny_size: u64,
    /// Number of tiny objects
    pub tiny_nobjs: u64,
}

/// Compressed size and filter mask of the root direct block.
///
/// Only meaningful while the heap's root is a lone direct block; tracked on
/// the header because that block's image is not self-describing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilteredRoot {
    /// On-disk (compressed) size of the root direct block
    pub size: u64,
    /// Filter mask recorded at its last write
    pub filter_mask: u32,
}

/// Filter state of a filtered heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapFilter {
    /// The pipeline descriptor, embedded in the header image
    pub spec: FilterSpec,
    /// Root direct-block compressed size and mask
    pub root: FilteredRoot,
}

/// Outcome of a header deserialization.
#[derive(Debug)]
pub enum HeaderLoad {
    /// The image held the whole header
    Complete(Box<HeaderBlock>),
    /// The image was the filterless base size but the heap is filtered;
    /// re-read with a buffer of `required_size` bytes
    Incomplete {
        /// True image length of this header
        required_size: usize,
    },
}

/// The heap's root descriptor and its cache client.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderBlock {
    /// File address of the header itself (doubles as the heap's identity)
    pub heap_addr: Addr,
    /// Field widths of the containing file
    pub layout: FileLayout,
    /// Encoded width of a heap object ID
    pub id_len: u16,
    /// Huge-object IDs have wrapped around
    pub huge_ids_wrapped: bool,
    /// Direct blocks carry a checksum over their logical bytes
    pub checksum_dblocks: bool,
    /// Largest object the managed (doubling-table) store accepts
    pub max_man_size: u32,
    /// Next huge-object ID to hand out
    pub huge_next_id: u64,
    /// Address of the huge-object index tree
    pub huge_bt2_addr: Option<Addr>,
    /// Free bytes across all managed direct blocks
    pub total_man_free: u64,
    /// Address of the free-space manager
    pub fs_addr: Option<Addr>,
    /// Running totals
    pub stats: HeapStats,
    /// Doubling-table parameters and root state
    pub table: DoublingTable,
    /// Filter pipeline, absent for uncompressed heaps
    pub filter: Option<HeapFilter>,
    /// Recorded true image length
    heap_size: usize,
    /// Count of live indirect/direct blocks holding a handle to this header
    rc: usize,
}

impl HeaderBlock {
    pub fn new(
        heap_addr: Addr,
        layout: FileLayout,
        table: DoublingTable,
        max_man_size: u32,
        checksum_dblocks: bool,
        filter_spec: Option<FilterSpec>,
    ) -> Result<Self> {
        table.validate()?;
        let filter = filter_spec.map(|spec| HeapFilter {
            spec,
            // Placeholder until the root direct block is first written
            root: FilteredRoot {
                size: table.start_block_size,
                filter_mask: 0,
            },
        });
        let id_len = 1 + u16::from(table.heap_off_size()) + u16::from(table.max_dir_blk_off_size());
        let mut hdr = Self {
            heap_addr,
            layout,
            id_len,
            huge_ids_wrapped: false,
            checksum_dblocks,
            max_man_size,
            huge_next_id: 0,
            huge_bt2_addr: None,
            total_man_free: 0,
            fs_addr: None,
            stats: HeapStats::default(),
            table,
            filter,
            heap_size: 0,
            rc: 0,
        };
        hdr.heap_size = Self::base_size(layout) + hdr.filter_info_size();
        Ok(hdr)
    }

    /// Image length assuming no filter descriptor.
    pub fn base_size(layout: FileLayout) -> usize {
        let len = usize::from(layout.len_size);
        let addr = usize::from(layout.addr_size);
        // magic, version, id len, filter len, flags, max managed size
        4 + 1 + 2 + 2 + 1 + 4
            // huge next id, huge index addr, managed free space, free-space addr
            + len + addr + len + addr
            + 8 * len
            + DoublingTable::encoded_size(layout)
            + CHECKSUM_SIZE
    }

    /// Encoded length of the filter descriptor, 0 for uncompressed heaps.
    pub fn filter_len(&self) -> u16 {
        self.filter.map_or(0, |f| f.spec.encoded_size() as u16)
    }

    fn filter_info_size(&self) -> usize {
        if self.filter.is_some() {
            usize::from(self.layout.len_size) + 4 + usize::from(self.filter_len())
        } else {
            0
        }
    }

    /// Two-phase image sizing.
    ///
    /// With no bytes in hand, returns the base size (no filter assumed).
    /// Given the first read's bytes, re-reads the fixed prefix and adds the
    /// filter-info size when the heap turns out to be filtered.
    pub fn probe_size(layout: FileLayout, image: Option<&[u8]>) -> Result<usize> {
        let base = Self::base_size(layout);
        let Some(img) = image else {
            return Ok(base);
        };
        if img.len() < 9 {
            return Err(FormatError::Truncated {
                expected: 9,
                actual: img.len(),
            }
            .into());
        }
        let mut r = Cursor::new(img);
        codec::expect_magic(&mut r, HEADER_MAGIC)?;
        codec::expect_version(&mut r, HEADER_VERSION)?;
        let _id_len = r.read_u16::<LittleEndian>()?;
        let filter_len = r.read_u16::<LittleEndian>()?;
        if filter_len == 0 {
            Ok(base)
        } else {
            Ok(base + usize::from(layout.len_size) + 4 + usize::from(filter_len))
        }
    }

    /// Validate the trailing checksum of a header image.
    pub fn verify_checksum(image: &[u8]) -> bool {
        verify_trailing(image)
    }

    /// Decode a header image.
    ///
    /// Returns [`HeaderLoad::Incomplete`] when the heap is filtered but the
    /// image is only the base size; the caller re-reads at the corrected
    /// size and deserializes again.
    pub fn deserialize(image: &[u8], heap_addr: Addr, layout: FileLayout) -> Result<HeaderLoad> {
        let mut r = Cursor::new(image);
        codec::expect_magic(&mut r, HEADER_MAGIC)?;
        codec::expect_version(&mut r, HEADER_VERSION)?;
        let id_len = r.read_u16::<LittleEndian>()?;
        let filter_len = r.read_u16::<LittleEndian>()?;
        let flags = r.read_u8()?;
        let max_man_size = r.read_u32::<LittleEndian>()?;
        let huge_next_id = layout.read_len(&mut r)?;
        let huge_bt2_addr = layout.read_addr(&mut r)?;
        let total_man_free = layout.read_len(&mut r)?;
        let fs_addr = layout.read_addr(&mut r)?;
        let stats = HeapStats {
            man_size: layout.read_len(&mut r)?,
            man_alloc_size: layout.read_len(&mut r)?,
            man_iter_off: layout.read_len(&mut r)?,
            man_nobjs: layout.read_len(&mut r)?,
            huge_size: layout.read_len(&mut r)?,
            huge_nobjs: layout.read_len(&mut r)?,
            tiny_size: layout.read_len(&mut r)?,
            tiny_nobjs: layout.read_len(&mut r)?,
        };
        let table = DoublingTable::decode(&mut r, layout)?;

        let base = Self::base_size(layout);
        let heap_size =
            base + if filter_len == 0 {
                0
            } else {
                usize::from(layout.len_size) + 4 + usize::from(filter_len)
            };

        if filter_len > 0 && image.len() == base {
            // First pass of a speculative load sized without the filter info
            debug!(
                heap_addr = format_args!("{heap_addr:#x}"),
                required = heap_size,
                "filtered header needs a larger image"
            );
            return Ok(HeaderLoad::Incomplete {
                required_size: heap_size,
            });
        }
        if image.len() < heap_size {
            return Err(FormatError::Truncated {
                expected: heap_size,
                actual: image.len(),
            }
            .into());
        }

        let filter = if filter_len > 0 {
            let size = layout.read_len(&mut r)?;
            let filter_mask = r.read_u32::<LittleEndian>()?;
            let mut encoded = vec![0u8; usize::from(filter_len)];
            r.read_exact(&mut encoded)
                .map_err(FormatError::from)?;
            let spec = FilterSpec::from_bytes(&encoded)?;
            Some(HeapFilter {
                spec,
                root: FilteredRoot { size, filter_mask },
            })
        } else {
            None
        };

        Ok(HeaderLoad::Complete(Box::new(Self {
            heap_addr,
            layout,
            id_len,
            huge_ids_wrapped: flags & FLAG_HUGE_IDS_WRAPPED != 0,
            checksum_dblocks: flags & FLAG_CHECKSUM_DBLOCKS != 0,
            max_man_size,
            huge_next_id,
            huge_bt2_addr,
            total_man_free,
            fs_addr,
            stats,
            table,
            filter,
            heap_size,
            rc: 0,
        })))
    }

    /// The header's recorded true image length.
    pub fn image_len(&self) -> usize {
        self.heap_size
    }

    /// Headers are allocated durably from the start and never move.
    pub fn pre_serialize(&self, alloc: &dyn Allocator, addr: Addr, len: usize) -> PreSerializeOutcome {
        assert!(
            !alloc.is_provisional(addr),
            "header at a provisional address"
        );
        assert_eq!(len, self.heap_size, "header image length mismatch");
        PreSerializeOutcome::default()
    }

    /// Encode the header into `image`, which must be exactly `image_len()`.
    pub fn serialize(&self, image: &mut [u8]) -> Result<()> {
        let mut w = Vec::with_capacity(self.heap_size);
        w.extend_from_slice(&HEADER_MAGIC);
        w.push(HEADER_VERSION);
        w.write_u16::<LittleEndian>(self.id_len)
            .map_err(FormatError::from)?;
        w.write_u16::<LittleEndian>(self.filter_len())
            .map_err(FormatError::from)?;
        let mut flags = 0u8;
        if self.huge_ids_wrapped {
            flags |= FLAG_HUGE_IDS_WRAPPED;
        }
        if self.checksum_dblocks {
            flags |= FLAG_CHECKSUM_DBLOCKS;
        }
        w.push(flags);
        w.write_u32::<LittleEndian>(self.max_man_size)
            .map_err(FormatError::from)?;
        self.layout.write_len(&mut w, self.huge_next_id)?;
        self.layout.write_addr(&mut w, self.huge_bt2_addr)?;
        self.layout.write_len(&mut w, self.total_man_free)?;
        self.layout.write_addr(&mut w, self.fs_addr)?;
        for value in [
            self.stats.man_size,
            self.stats.man_alloc_size,
            self.stats.man_iter_off,
            self.stats.man_nobjs,
            self.stats.huge_size,
            self.stats.huge_nobjs,
            self.stats.tiny_size,
            self.stats.tiny_nobjs,
        ] {
            self.layout.write_len(&mut w, value)?;
        }
        self.table.encode(&mut w, self.layout)?;
        if let Some(filter) = &self.filter {
            self.layout.write_len(&mut w, filter.root.size)?;
            w.write_u32::<LittleEndian>(filter.root.filter_mask)
                .map_err(FormatError::from)?;
            filter.spec.encode(&mut w)?;
        }
        let sum = metadata_checksum(&w);
        w.extend_from_slice(&sum.to_le_bytes());

        assert_eq!(w.len(), image.len(), "header image length mismatch");
        image.copy_from_slice(&w);
        Ok(())
    }

    /// Take a handle on behalf of a live indirect/direct block.
    pub fn share(&mut self) {
        self.rc += 1;
    }

    /// Drop a block's handle.
    pub fn unshare(&mut self) {
        assert!(self.rc > 0, "header handle count underflow");
        self.rc -= 1;
    }

    pub fn refcount(&self) -> usize {
        self.rc
    }

    /// Tear down the header's in-memory resources.
    ///
    /// Collaborators the header points to (huge-object index, free-space
    /// manager, descendant blocks) are not touched.
    pub fn release(self) {
        assert_eq!(self.rc, 0, "header released with live block handles");
    }
}
