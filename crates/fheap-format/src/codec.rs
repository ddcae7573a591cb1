//! Variable-width field codecs shared by every block image.
//!
//! All multi-byte fields are little-endian. Length fields and file addresses
//! are written at a width configured per file; heap offsets are written at a
//! width derived from the heap's maximum index bits. An address with all bits
//! set at its configured width is the *undefined* address.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{FormatError, Result};

/// Field widths for a file, in bytes.
///
/// Mirrors the file-wide "size of sizes" / "size of addresses" settings that
/// every length and address field is encoded against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLayout {
    /// Width of length fields
    pub len_size: u8,
    /// Width of address fields
    pub addr_size: u8,
}

impl Default for FileLayout {
    fn default() -> Self {
        Self {
            len_size: 8,
            addr_size: 8,
        }
    }
}

impl FileLayout {
    /// Create a layout, validating both widths.
    pub fn new(len_size: u8, addr_size: u8) -> Result<Self> {
        check_width(len_size)?;
        check_width(addr_size)?;
        Ok(Self { len_size, addr_size })
    }

    /// Read a length field at this layout's width.
    pub fn read_len<R: Read>(&self, r: &mut R) -> Result<u64> {
        read_uint_var(r, self.len_size)
    }

    /// Write a length field at this layout's width.
    pub fn write_len<W: Write>(&self, w: &mut W, value: u64) -> Result<()> {
        write_uint_var(w, value, self.len_size)
    }

    /// Read an address field; all-ones decodes to `None`.
    pub fn read_addr<R: Read>(&self, r: &mut R) -> Result<Option<u64>> {
        let raw = read_uint_var(r, self.addr_size)?;
        if raw == max_for_width(self.addr_size) {
            Ok(None)
        } else {
            Ok(Some(raw))
        }
    }

    /// Write an address field; `None` encodes as all-ones.
    pub fn write_addr<W: Write>(&self, w: &mut W, addr: Option<u64>) -> Result<()> {
        match addr {
            Some(a) => {
                // The undefined encoding must stay distinguishable.
                if a >= max_for_width(self.addr_size) {
                    return Err(FormatError::FieldOverflow {
                        value: a,
                        width: self.addr_size,
                    });
                }
                write_uint_var(w, a, self.addr_size)
            }
            None => {
                for _ in 0..self.addr_size {
                    w.write_u8(0xFF)?;
                }
                Ok(())
            }
        }
    }
}

/// Largest value representable in `width` bytes.
pub fn max_for_width(width: u8) -> u64 {
    debug_assert!((1..=8).contains(&width));
    if width == 8 {
        u64::MAX
    } else {
        (1u64 << (u32::from(width) * 8)) - 1
    }
}

fn check_width(width: u8) -> Result<()> {
    if (1..=8).contains(&width) {
        Ok(())
    } else {
        Err(FormatError::InvalidFieldWidth(width))
    }
}

/// Read an unsigned little-endian integer of `width` bytes.
pub fn read_uint_var<R: Read>(r: &mut R, width: u8) -> Result<u64> {
    check_width(width)?;
    Ok(r.read_uint::<LittleEndian>(usize::from(width))?)
}

/// Write an unsigned little-endian integer into `width` bytes.
pub fn write_uint_var<W: Write>(w: &mut W, value: u64, width: u8) -> Result<()> {
    check_width(width)?;
    if width < 8 && value > max_for_width(width) {
        return Err(FormatError::FieldOverflow { value, width });
    }
    w.write_uint::<LittleEndian>(value, usize::from(width))?;
    Ok(())
}

/// Read a block signature and match it against the expected magic.
pub fn expect_magic<R: Read>(r: &mut R, expected: [u8; 4]) -> Result<()> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != expected {
        return Err(FormatError::InvalidMagic {
            expected,
            actual: magic,
        });
    }
    Ok(())
}

/// Read a one-byte version field and match it against the expected version.
pub fn expect_version<R: Read>(r: &mut R, expected: u8) -> Result<()> {
    let actual = r.read_u8()?;
    if actual != expected {
        return Err(FormatError::UnsupportedVersion { expected, actual });
    }
    Ok(())
}
