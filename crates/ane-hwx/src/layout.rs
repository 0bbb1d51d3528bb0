// SPDX-License-Identifier: AGPL-3.0-only

//! Memory layout policy and L2 residency tracking.
//!
//! Surfaces are placed by a bump allocator starting at the policy's base
//! address. Strides are derived from the shape: the row pitch is rounded up
//! to the surface alignment, and every outer stride is a multiple of it.
//!
//! ## Residency
//!
//! The L2 scratch cache is managed by hints on each record's three ports.
//! The policy is conservative:
//!
//! - a result is `Allocate`d only when the very next record reads it
//! - a source that is resident is `Drop`ped at its last reader, kept with
//!   `Allocate` when the next record reads it again, and `Deprioritize`d
//!   when it will sit idle for at least one record
//! - a source that is not resident is read with `NoAllocate`
//!
//! [`verify_residency`] replays the hints of a record sequence and rejects
//! any source that assumes residency nothing established.

use crate::error::{HwxError, Result};
use ane_chip::program::align_up;
use ane_chip::td::STRIDE_ALIGN;
use ane_chip::{DmaSurface, L2Port, Residency, SourcePort, Strides, TensorDesc, TileDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::ops::StageResidency;

/// Memory-layout policy for the assembler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutPolicy {
    /// Device address of the first surface.
    pub base_address: u32,
    /// Surface and row alignment (multiple of 0x40, power of two).
    pub alignment: u32,
    /// Weight blob alignment inside the data section (power of two).
    pub weight_alignment: u32,
    /// Fold bias / activation / element-wise stages into the preceding
    /// convolution or pooling record.
    pub fusion: bool,
}

impl Default for LayoutPolicy {
    fn default() -> Self {
        Self {
            base_address: 0,
            alignment: 0x40,
            weight_alignment: 0x40,
            fusion: true,
        }
    }
}

impl LayoutPolicy {
    /// Policy with fusion disabled.
    #[must_use]
    pub fn without_fusion() -> Self {
        Self {
            fusion: false,
            ..Self::default()
        }
    }

    /// Check alignments.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperand` if an alignment is not a power of two or the
    /// surface alignment is not a multiple of 0x40.
    pub fn validate(&self) -> Result<()> {
        let a = u64::from(self.alignment);
        if !a.is_power_of_two() || a % STRIDE_ALIGN != 0 {
            return Err(HwxError::invalid_operand(
                0,
                format!("surface alignment {a:#x} must be a power-of-two multiple of 0x40"),
            ));
        }
        if !self.weight_alignment.is_power_of_two() {
            return Err(HwxError::invalid_operand(
                0,
                format!("weight alignment {:#x} must be a power of two", self.weight_alignment),
            ));
        }
        if u64::from(self.base_address) % a != 0 {
            return Err(HwxError::invalid_operand(
                0,
                format!("base address {:#x} is not aligned to {a:#x}", self.base_address),
            ));
        }
        Ok(())
    }

    /// Strides and padded size of a surface holding `desc`.
    pub fn strides(&self, desc: &TensorDesc) -> (Strides, u64) {
        let s = desc.shape;
        let row = align_up(u64::from(s.column) * desc.dtype.size_bytes() as u64, u64::from(self.alignment));
        let plane = row * u64::from(s.row);
        let depth = plane * u64::from(s.plane);
        let batch = depth * u64::from(s.depth);
        let size = batch * u64::from(s.group);
        let clamp = |v: u64| u32::try_from(v).unwrap_or(u32::MAX);
        (
            Strides {
                row: clamp(row),
                plane: clamp(plane),
                depth: clamp(depth),
                batch: clamp(batch),
            },
            size,
        )
    }
}

/// Bump allocator over the device address space.
#[derive(Debug, Clone)]
pub struct SurfaceAllocator {
    next: u64,
    align: u64,
}

impl SurfaceAllocator {
    /// Start at the policy's base address.
    pub fn new(policy: &LayoutPolicy) -> Self {
        Self {
            next: u64::from(policy.base_address),
            align: u64::from(policy.alignment),
        }
    }

    /// Reserve `size` bytes; `None` once the 32-bit address space is exhausted.
    pub fn alloc(&mut self, size: u64) -> Option<u32> {
        let base = u32::try_from(self.next).ok()?;
        let end = align_up(self.next + size.max(1), self.align);
        if end > u64::from(u32::MAX) + 1 {
            return None;
        }
        self.next = end;
        Some(base)
    }

    /// Bytes reserved so far, measured from address 0.
    pub fn high_water(&self) -> u64 {
        self.next
    }
}

/// Identity of a surface for residency planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SurfaceId {
    /// Program input.
    Input(usize),
    /// Output of a stage.
    Stage(usize),
}

/// Compute L2 hints for a stage sequence.
///
/// `reads[s]` lists the surfaces stage `s` reads, in port order; only the
/// first two are bound to L2 ports. Stage `s` writes `SurfaceId::Stage(s)`.
pub fn plan_residency(reads: &[Vec<SurfaceId>]) -> Vec<StageResidency> {
    fn on_ports(reads: &[Vec<SurfaceId>], s: usize) -> &[SurfaceId] {
        reads.get(s).map_or(&[][..], |r| &r[..r.len().min(2)])
    }
    let ports = |s: usize| on_ports(reads, s);

    let mut last_read: HashMap<SurfaceId, usize> = HashMap::new();
    for s in 0..reads.len() {
        for &id in ports(s) {
            last_read.insert(id, s);
        }
    }

    let mut resident: HashSet<SurfaceId> = HashSet::new();
    let mut plan = Vec::with_capacity(reads.len());

    for s in 0..reads.len() {
        let source_hint = |id: SurfaceId| {
            if !resident.contains(&id) {
                Residency::NoAllocate
            } else if last_read.get(&id) == Some(&s) {
                Residency::Drop
            } else if ports(s + 1).contains(&id) {
                Residency::Allocate
            } else {
                Residency::Deprioritize
            }
        };
        let here = ports(s);
        let src1 = here.first().map_or(Residency::NoAllocate, |&id| source_hint(id));
        let src2 = here.get(1).map_or(Residency::NoAllocate, |&id| source_hint(id));

        for (&id, hint) in here.iter().zip([src1, src2]) {
            if hint == Residency::Drop {
                resident.remove(&id);
            }
        }

        let out = SurfaceId::Stage(s);
        let result = if ports(s + 1).contains(&out) {
            resident.insert(out);
            Residency::Allocate
        } else {
            Residency::NoAllocate
        };

        plan.push(StageResidency { src1, src2, result });
    }
    plan
}

/// Replay the L2 hints of a record sequence.
///
/// Surfaces are identified by base address. A result hinted `Allocate` or
/// `Deprioritize` becomes resident; `NoAllocate` or `Drop` on a result, and
/// `Drop` on a source, make it non-resident.
///
/// # Errors
///
/// Returns `ResidencyViolation` if an enabled source port assumes residency
/// for a surface that was never made resident or was dropped earlier.
pub fn verify_residency<'a, I>(records: I) -> Result<()>
where
    I: IntoIterator<Item = &'a TileDescriptor>,
{
    let mut resident: HashSet<u32> = HashSet::new();

    for (index, td) in records.into_iter().enumerate() {
        let record = |e| HwxError::record(index, e);
        let mut dropped = Vec::new();

        for (port, l2, name) in [
            (SourcePort::Src1, L2Port::Src1, "Src1"),
            (SourcePort::Src2, L2Port::Src2, "Src2"),
        ] {
            let Some(surface) = td.source(port).map_err(record)? else {
                continue;
            };
            let hint = td.residency(l2).map_err(record)?;
            if hint.assumes_resident() && !resident.contains(&surface.base) {
                return Err(HwxError::ResidencyViolation {
                    index,
                    port: name,
                    reason: format!(
                        "hint {hint} assumes surface {:#x} is resident, but it was never allocated or was dropped",
                        surface.base
                    ),
                });
            }
            if hint == Residency::Drop {
                dropped.push(surface.base);
            }
        }
        for base in dropped {
            resident.remove(&base);
        }

        if let Some(DmaSurface { base, .. }) = td.destination().map_err(record)? {
            match td.residency(L2Port::Result).map_err(record)? {
                Residency::Allocate | Residency::Deprioritize => {
                    resident.insert(base);
                }
                Residency::NoAllocate | Residency::Drop => {
                    resident.remove(&base);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ane_chip::{DType, TensorShape};

    #[test]
    fn strides_are_aligned() {
        let policy = LayoutPolicy::default();
        let desc = TensorDesc::new(TensorShape::from_dims([2, 1, 3, 5, 7]), DType::Float16);
        let (s, size) = policy.strides(&desc);
        assert_eq!(s.row, 0x40);
        assert_eq!(s.plane, 0x40 * 5);
        assert_eq!(s.depth, 0x40 * 15);
        assert_eq!(s.batch, 0x40 * 15);
        assert_eq!(size, 0x40 * 30);
        for v in [s.row, s.plane, s.depth, s.batch] {
            assert_eq!(u64::from(v) % STRIDE_ALIGN, 0);
        }
    }

    #[test]
    fn policy_validation() {
        LayoutPolicy::default().validate().unwrap();
        let bad = LayoutPolicy { alignment: 0x20, ..LayoutPolicy::default() };
        assert!(bad.validate().is_err());
        let bad = LayoutPolicy { base_address: 0x10, ..LayoutPolicy::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn allocator_bumps_and_aligns() {
        let mut alloc = SurfaceAllocator::new(&LayoutPolicy { base_address: 0x1000, ..LayoutPolicy::default() });
        assert_eq!(alloc.alloc(10), Some(0x1000));
        assert_eq!(alloc.alloc(0x40), Some(0x1040));
        assert_eq!(alloc.alloc(0), Some(0x1080));
        assert_eq!(alloc.high_water(), 0x10C0);
        assert_eq!(alloc.alloc(u64::from(u32::MAX)), None);
    }

    #[test]
    fn chain_keeps_intermediates_resident() {
        use SurfaceId::{Input, Stage};
        // s0 reads in0; s1 reads s0; s2 reads s1 and s0 is not reused.
        let reads = vec![vec![Input(0)], vec![Stage(0)], vec![Stage(1)]];
        let plan = plan_residency(&reads);
        assert_eq!(plan[0].src1, Residency::NoAllocate);
        assert_eq!(plan[0].result, Residency::Allocate);
        assert_eq!(plan[1].src1, Residency::Drop);
        assert_eq!(plan[1].result, Residency::Allocate);
        assert_eq!(plan[2].src1, Residency::Drop);
        assert_eq!(plan[2].result, Residency::NoAllocate);
    }

    #[test]
    fn surface_read_twice_is_dropped_only_at_last_reader() {
        use SurfaceId::{Input, Stage};
        // s1 and s2 both read s0; s3 reads s2 and s0 again.
        let reads = vec![
            vec![Input(0)],
            vec![Stage(0)],
            vec![Stage(0), Stage(1)],
            vec![Stage(2), Stage(0)],
        ];
        let plan = plan_residency(&reads);
        assert_eq!(plan[1].src1, Residency::Allocate);
        assert_eq!(plan[2].src1, Residency::Allocate);
        assert_eq!(plan[3].src2, Residency::Drop);
        let drops = plan
            .iter()
            .flat_map(|p| [p.src1, p.src2])
            .filter(|&h| h == Residency::Drop)
            .count();
        assert_eq!(drops, 3);
    }

    #[test]
    fn idle_surface_is_deprioritized() {
        use SurfaceId::{Input, Stage};
        let reads = vec![
            vec![Input(0)],
            vec![Stage(0)],
            vec![Input(0)],
            vec![Stage(0)],
        ];
        let plan = plan_residency(&reads);
        assert_eq!(plan[1].src1, Residency::Deprioritize);
        assert_eq!(plan[3].src1, Residency::Drop);
    }
}
