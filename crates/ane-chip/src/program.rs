// SPDX-License-Identifier: AGPL-3.0-only

//! HWX program container layout.
//!
//! ## Format summary
//!
//! ```text
//! 0x0000  header (0x40 bytes)
//! 0x0040  relocation table, 0x40 bytes per entry
//! 0x4000  Tile Descriptor array, 0x300 bytes per record, chained by
//!         Header.NextPointer (absolute file offset, 0 terminates)
//! ....    data section (weights, LUTs), 0x40-aligned
//! ```
//!
//! All integers are little-endian.
//!
//! | Header offset | Width | Field |
//! |---------------|-------|-------|
//! | 0x00 | u32 | magic `0xBEEFFACE` |
//! | 0x04 | u32 | format version |
//! | 0x08 | u32 | TD array offset (always 0x4000) |
//! | 0x0C | u32 | TD count |
//! | 0x10 | u32 | relocation count |
//! | 0x14 | u32 | flags (reserved) |
//! | 0x18 | u64 | data section offset |
//! | 0x20 | u64 | data section size |
//! | 0x28 | 24 B | reserved |
//!
//! | Relocation offset | Width | Field |
//! |-------------------|-------|-------|
//! | 0x00 | u32 | kind |
//! | 0x04 | u32 | record index (or `u32::MAX` for program-level surfaces) |
//! | 0x08 | u64 | offset (device address or data-section offset) |
//! | 0x10 | u64 | size in bytes |
//! | 0x18 | 40 B | NUL-padded name |

use crate::regs::TD_SIZE;

/// Container magic.
pub const HWX_MAGIC: u32 = 0xBEEF_FACE;

/// Current format version.
pub const HWX_VERSION: u32 = 1;

/// Size of the fixed header.
pub const HEADER_SIZE: usize = 0x40;

/// File offset of the first Tile Descriptor.
pub const TD_ARRAY_OFFSET: usize = 0x4000;

/// Size of one relocation entry.
pub const RELOC_ENTRY_SIZE: usize = 0x40;

/// Longest relocation name (bytes, without NUL).
pub const RELOC_NAME_LEN: usize = 40;

/// Relocation entries that fit between the header and the TD array.
pub const MAX_RELOCATIONS: usize = (TD_ARRAY_OFFSET - HEADER_SIZE) / RELOC_ENTRY_SIZE;

/// Alignment of the data section and of every blob inside it.
pub const DATA_ALIGN: usize = 0x40;

/// Record index used by relocations that belong to the whole program.
pub const PROGRAM_LEVEL: u32 = u32::MAX;

/// Header field offsets.
pub mod header {
    /// Magic.
    pub const MAGIC: usize = 0x00;
    /// Format version.
    pub const VERSION: usize = 0x04;
    /// TD array offset.
    pub const TD_OFFSET: usize = 0x08;
    /// TD count.
    pub const TD_COUNT: usize = 0x0C;
    /// Relocation count.
    pub const RELOC_COUNT: usize = 0x10;
    /// Flags.
    pub const FLAGS: usize = 0x14;
    /// Data section offset.
    pub const DATA_OFFSET: usize = 0x18;
    /// Data section size.
    pub const DATA_SIZE: usize = 0x20;
    /// Start of the reserved tail; must be zero.
    pub const RESERVED: usize = 0x28;
}

/// What a relocation entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocationKind {
    /// Weight blob in the data section.
    Weight,
    /// Shared input/output memory surface.
    Surface,
    /// Lookup-table payload for one record, in the data section.
    Lut,
}

impl RelocationKind {
    /// On-disk encoding.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Weight => 1,
            Self::Surface => 2,
            Self::Lut => 3,
        }
    }

    /// Decode; `None` for unknown kinds.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Weight),
            2 => Some(Self::Surface),
            3 => Some(Self::Lut),
            _ => None,
        }
    }
}

/// File offset of record `index` in a well-formed container.
#[must_use]
pub const fn record_offset(index: usize) -> usize {
    TD_ARRAY_OFFSET + index * TD_SIZE
}

/// Round `value` up to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relocation_table_fits_before_td_array() {
        assert_eq!(MAX_RELOCATIONS, 255);
        assert!(HEADER_SIZE + MAX_RELOCATIONS * RELOC_ENTRY_SIZE <= TD_ARRAY_OFFSET);
        assert_eq!(0x18 + RELOC_NAME_LEN, RELOC_ENTRY_SIZE);
    }

    #[test]
    fn record_offsets() {
        assert_eq!(record_offset(0), 0x4000);
        assert_eq!(record_offset(2), 0x4600);
    }

    #[test]
    fn kinds_round_trip() {
        for kind in [RelocationKind::Weight, RelocationKind::Surface, RelocationKind::Lut] {
            assert_eq!(RelocationKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(RelocationKind::from_code(0), None);
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, 0x40), 0);
        assert_eq!(align_up(1, 0x40), 0x40);
        assert_eq!(align_up(0x80, 0x40), 0x80);
    }
}
