// SPDX-License-Identifier: AGPL-3.0-only

//! L2 scratch-cache residency hints.
//!
//! The L2 section carries one 2-bit hint per port (Src1, Src2, Result).
//! The semantics are inferred from field names and observed flag patterns:
//!
//! | Hint | On a source port | On the result port |
//! |------|------------------|--------------------|
//! | `Allocate` | read from L2, keep resident | make output resident |
//! | `NoAllocate` | read from DRAM | write through, not resident |
//! | `Drop` | read from L2, evict afterwards | (not emitted) |
//! | `Deprioritize` | read from L2, first to evict | resident, low priority |

use std::fmt;

/// Residency hint for one L2 port.
///
/// Codes are `Allocate` = 0, `NoAllocate` = 1, `Drop` = 2,
/// `Deprioritize` = 3. A zeroed field reads as `Allocate`, which is also the
/// `Default`; callers that want a DRAM read must set `NoAllocate` explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Residency {
    /// Keep the surface in L2.
    #[default]
    Allocate,
    /// Bypass L2.
    NoAllocate,
    /// Evict after this access.
    Drop,
    /// Keep, but evict first under pressure.
    Deprioritize,
}

impl Residency {
    /// All four hints.
    pub const ALL: [Self; 4] = [Self::Allocate, Self::NoAllocate, Self::Drop, Self::Deprioritize];

    /// 2-bit field encoding.
    #[must_use]
    pub const fn code(self) -> u64 {
        match self {
            Self::Allocate => 0,
            Self::NoAllocate => 1,
            Self::Drop => 2,
            Self::Deprioritize => 3,
        }
    }

    /// Decode a 2-bit field value.
    #[must_use]
    pub const fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Allocate),
            1 => Some(Self::NoAllocate),
            2 => Some(Self::Drop),
            3 => Some(Self::Deprioritize),
            _ => None,
        }
    }

    /// A source port with this hint expects the surface to already be in L2.
    #[must_use]
    pub const fn assumes_resident(self) -> bool {
        !matches!(self, Self::NoAllocate)
    }
}

impl fmt::Display for Residency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Allocate => "allocate",
            Self::NoAllocate => "no-allocate",
            Self::Drop => "drop",
            Self::Deprioritize => "deprioritize",
        };
        f.write_str(s)
    }
}

/// L2 port a hint applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L2Port {
    /// First source.
    Src1,
    /// Second source.
    Src2,
    /// Result.
    Result,
}

impl L2Port {
    pub(crate) const fn field(self) -> &'static str {
        match self {
            Self::Src1 => "L2.Residency.Src1",
            Self::Src2 => "L2.Residency.Src2",
            Self::Result => "L2.Residency.Result",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for hint in Residency::ALL {
            assert_eq!(Residency::from_code(hint.code()), Some(hint));
        }
        assert_eq!(Residency::from_code(4), None);
    }

    #[test]
    fn default_is_code_zero() {
        assert_eq!(Residency::from_code(0), Some(Residency::default()));
        assert_eq!(Residency::default().code(), 0);
    }

    #[test]
    fn only_no_allocate_reads_dram() {
        assert!(!Residency::NoAllocate.assumes_resident());
        assert!(Residency::Drop.assumes_resident());
        assert!(Residency::Deprioritize.assumes_resident());
    }
}
