//! Doubling-table parameters and the geometry derived from them.
//!
//! The table describes how a heap's address space is carved into rows of
//! direct blocks: every row holds `width` blocks, rows 0 and 1 use the
//! starting block size, and each later row doubles it. Once a row's block
//! size would exceed `max_direct_size`, the row holds indirect blocks
//! instead.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::trace;

use crate::codec::FileLayout;
use crate::error::{FormatError, Result};

/// Creation parameters plus the current state of a heap's doubling table.
///
/// Serialized inside the heap header, between the statistics and the
/// optional filter information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoublingTable {
    /// Number of block slots per row, a power of two
    pub width: u16,
    /// Block size for rows 0 and 1, a power of two
    pub start_block_size: u64,
    /// Largest direct-block size, a power of two
    pub max_direct_size: u64,
    /// Number of bits in a heap offset
    pub max_index: u16,
    /// Row count of the root indirect block when first created
    pub start_root_rows: u16,
    /// Address of the root block, `None` while the heap is empty
    pub table_addr: Option<u64>,
    /// Current row count of the root indirect block, 0 while the root is
    /// a lone direct block or absent
    pub curr_root_rows: u16,
}

impl DoublingTable {
    /// Decode from the header image.
    pub fn decode<R: Read>(r: &mut R, layout: FileLayout) -> Result<Self> {
        let width = r.read_u16::<LittleEndian>()?;
        let start_block_size = layout.read_len(r)?;
        let max_direct_size = layout.read_len(r)?;
        let max_index = r.read_u16::<LittleEndian>()?;
        let start_root_rows = r.read_u16::<LittleEndian>()?;
        let table_addr = layout.read_addr(r)?;
        let curr_root_rows = r.read_u16::<LittleEndian>()?;

        let table = Self {
            width,
            start_block_size,
            max_direct_size,
            max_index,
            start_root_rows,
            table_addr,
            curr_root_rows,
        };
        table.validate()?;
        trace!(
            width,
            start_block_size,
            max_direct_size,
            curr_root_rows,
            "decoded doubling table"
        );
        Ok(table)
    }

    /// Encode into the header image, same field order as [`decode`].
    ///
    /// [`decode`]: Self::decode
    pub fn encode<W: Write>(&self, w: &mut W, layout: FileLayout) -> Result<()> {
        w.write_u16::<LittleEndian>(self.width)?;
        layout.write_len(w, self.start_block_size)?;
        layout.write_len(w, self.max_direct_size)?;
        w.write_u16::<LittleEndian>(self.max_index)?;
        w.write_u16::<LittleEndian>(self.start_root_rows)?;
        layout.write_addr(w, self.table_addr)?;
        w.write_u16::<LittleEndian>(self.curr_root_rows)?;
        Ok(())
    }

    /// Encoded size of the table at the given field widths.
    pub fn encoded_size(layout: FileLayout) -> usize {
        2 + usize::from(layout.len_size) * 2 + 2 + 2 + usize::from(layout.addr_size) + 2
    }

    /// Check the structural constraints the geometry math relies on.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || !self.width.is_power_of_two() {
            return Err(FormatError::InvalidDoublingTable(format!(
                "width {} is not a power of two",
                self.width
            )));
        }
        if self.start_block_size == 0 || !self.start_block_size.is_power_of_two() {
            return Err(FormatError::InvalidDoublingTable(format!(
                "starting block size {} is not a power of two",
                self.start_block_size
            )));
        }
        if self.max_direct_size == 0 || !self.max_direct_size.is_power_of_two() {
            return Err(FormatError::InvalidDoublingTable(format!(
                "max direct size {} is not a power of two",
                self.max_direct_size
            )));
        }
        if self.start_block_size > self.max_direct_size {
            return Err(FormatError::InvalidDoublingTable(format!(
                "starting block size {} exceeds max direct size {}",
                self.start_block_size, self.max_direct_size
            )));
        }
        if self.curr_root_rows > self.max_root_rows() {
            return Err(FormatError::InvalidDoublingTable(format!(
                "current root rows {} exceeds the maximum {}",
                self.curr_root_rows,
                self.max_root_rows()
            )));
        }
        Ok(())
    }

    /// log2 of the starting block size.
    fn start_bits(&self) -> u16 {
        self.start_block_size.ilog2() as u16
    }

    /// Heap-offset bits consumed by the first row of the root block.
    fn first_row_bits(&self) -> u16 {
        self.start_bits() + self.width.ilog2() as u16
    }

    /// Rows of the root indirect block that hold direct blocks.
    ///
    /// Rows 0 and 1 share the starting size, hence the `+ 2`.
    pub fn max_direct_rows(&self) -> u16 {
        (self.max_direct_size.ilog2() as u16 - self.start_bits()) + 2
    }

    /// Largest row count the root indirect block can reach.
    pub fn max_root_rows(&self) -> u16 {
        (self.max_index - self.first_row_bits()) + 1
    }

    /// Width in bytes of a heap-offset field.
    pub fn heap_off_size(&self) -> u8 {
        byte_width(self.max_index)
    }

    /// Width in bytes of an offset within the largest direct block.
    pub fn max_dir_blk_off_size(&self) -> u8 {
        byte_width(self.max_direct_size.ilog2() as u16)
    }

    /// Block size for the given row.
    pub fn row_block_size(&self, row: u16) -> u64 {
        if row < 2 {
            self.start_block_size
        } else {
            self.start_block_size << (row - 1)
        }
    }

    /// Heap offset at which the given row starts.
    pub fn row_offset(&self, row: u16) -> u64 {
        if row == 0 {
            0
        } else {
            u64::from(self.width) * self.start_block_size * (1u64 << (row - 1))
        }
    }

    /// Row and column of the block covering a heap offset.
    pub fn lookup(&self, offset: u64) -> (u16, u16) {
        let first_row_span = u64::from(self.width) * self.start_block_size;
        if offset < first_row_span {
            (0, (offset / self.start_block_size) as u16)
        } else {
            let high_bit = offset.ilog2() as u16;
            let row = (high_bit - self.first_row_bits()) + 1;
            let col = ((offset - (1u64 << high_bit)) / self.row_block_size(row)) as u16;
            (row, col)
        }
    }
}

/// Bytes needed to hold `bits` bits.
fn byte_width(bits: u16) -> u8 {
    ((bits + 7) / 8) as u8
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn sample() -> DoublingTable {
        DoublingTable {
            width: 4,
            start_block_size: 512,
            max_direct_size: 65536,
            max_index: 40,
            start_root_rows: 2,
            table_addr: Some(0x1000),
            curr_root_rows: 2,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let layout = FileLayout::default();
        let table = sample();
        let mut buf = Vec::new();
        table.encode(&mut buf, layout).unwrap();
        assert_eq!(buf.len(), DoublingTable::encoded_size(layout));
        let decoded = DoublingTable::decode(&mut Cursor::new(&buf), layout).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn empty_heap_has_undefined_root() {
        let layout = FileLayout::new(4, 4).unwrap();
        let table = DoublingTable {
            table_addr: None,
            curr_root_rows: 0,
            ..sample()
        };
        let mut buf = Vec::new();
        table.encode(&mut buf, layout).unwrap();
        let decoded = DoublingTable::decode(&mut Cursor::new(&buf), layout).unwrap();
        assert_eq!(decoded.table_addr, None);
    }

    #[test]
    fn derived_geometry() {
        let table = sample();
        // 512 << 7 == 65536, plus the doubled starting row
        assert_eq!(table.max_direct_rows(), 9);
        // 40 - (9 + 2) + 1
        assert_eq!(table.max_root_rows(), 30);
        assert_eq!(table.heap_off_size(), 5);
        assert_eq!(table.max_dir_blk_off_size(), 2);
    }

    #[test]
    fn row_sizes_double_after_row_one() {
        let table = sample();
        assert_eq!(table.row_block_size(0), 512);
        assert_eq!(table.row_block_size(1), 512);
        assert_eq!(table.row_block_size(2), 1024);
        assert_eq!(table.row_block_size(3), 2048);
    }

    #[test]
    fn row_offsets_are_cumulative() {
        let table = sample();
        assert_eq!(table.row_offset(0), 0);
        assert_eq!(table.row_offset(1), 4 * 512);
        assert_eq!(table.row_offset(2), 2 * 4 * 512);
        assert_eq!(table.row_offset(3), 4 * 4 * 512);
        // Each row's span is width blocks of its size
        for row in 1..8 {
            assert_eq!(
                table.row_offset(row + 1),
                table.row_offset(row) + 4 * table.row_block_size(row)
            );
        }
    }

    #[test]
    fn lookup_inverts_row_offsets() {
        let table = sample();
        for row in 0..8u16 {
            for col in 0..4u16 {
                let off = table.row_offset(row) + u64::from(col) * table.row_block_size(row);
                assert_eq!(table.lookup(off), (row, col), "row {row} col {col}");
                // Last byte of the block maps to the same slot
                let last = off + table.row_block_size(row) - 1;
                assert_eq!(table.lookup(last), (row, col));
            }
        }
    }

    #[test]
    fn rejects_non_power_of_two_sizes() {
        let table = DoublingTable {
            start_block_size: 500,
            ..sample()
        };
        assert!(table.validate().is_err());
    }

    #[test]
    fn rejects_start_larger_than_max_direct() {
        let table = DoublingTable {
            start_block_size: 1 << 20,
            max_direct_size: 1 << 16,
            ..sample()
        };
        assert!(table.validate().is_err());
    }

    #[test]
    fn rejects_too_many_root_rows() {
        let table = DoublingTable {
            curr_root_rows: 31,
            ..sample()
        };
        assert!(table.validate().is_err());
    }

    proptest! {
        #[test]
        fn round_trip_any_valid_table(
            width_log in 0u32..6,
            start_log in 4u32..12,
            extra_direct_log in 0u32..8,
            addr in proptest::option::of(0u64..0xFFFF_FFFF),
        ) {
            let table = DoublingTable {
                width: 1u16 << width_log,
                start_block_size: 1u64 << start_log,
                max_direct_size: 1u64 << (start_log + extra_direct_log),
                max_index: 48,
                start_root_rows: 1,
                table_addr: addr,
                curr_root_rows: 0,
            };
            prop_assume!(table.validate().is_ok());

            let layout = FileLayout::default();
            let mut buf = Vec::new();
            table.encode(&mut buf, layout).unwrap();
            let decoded = DoublingTable::decode(&mut Cursor::new(&buf), layout).unwrap();
            prop_assert_eq!(decoded, table);
        }
    }
}
