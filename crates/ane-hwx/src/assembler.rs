// SPDX-License-Identifier: AGPL-3.0-only

//! Program assembler: network description in, HWX container out.
//!
//! ## Pipeline
//!
//! ```text
//! Network ─ validate ─ plan stages (fusion) ─ place surfaces ─ residency
//!        ─ encode one TD per stage ─ chain ─ validate every TD ─ container
//! ```
//!
//! ## Fusion
//!
//! A scale-bias, activation or element-wise operation immediately following
//! a convolution or pooling stage is folded into that stage's record when:
//!
//! - the policy enables fusion
//! - it reads the stage's output, and nothing else reads that output
//! - the stage has no activation yet, and at most one element-wise and one
//!   scale-bias fold
//! - fewer than 7 stages are already folded
//!
//! A candidate meeting these conditions whose shape differs from the stage
//! output is an error (`FusionShapeMismatch`), never a silent split.
//!
//! Output is deterministic: the same network and policy always produce the
//! same bytes.

use crate::container::{HwxContainer, Relocation};
use crate::error::{HwxError, Result};
use crate::layout::{plan_residency, verify_residency, LayoutPolicy, SurfaceAllocator, SurfaceId};
use crate::network::{Network, OpRequest, Operand};
use crate::ops::{self, OpKind, Placed, StageBinding};
use ane_chip::program::{self, align_up, RelocationKind};
use ane_chip::tensor::f32_to_f16_bytes;
use ane_chip::{ChipError, DmaSurface, KernelChannel, TensorDesc, TileDescriptor};
use bytes::Bytes;

/// Most secondary stages one record can fold (`Common.OpCfg.FusedStages`).
pub const MAX_FUSED_STAGES: usize = 7;

/// A primary operation plus the operations folded into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Index of the primary operation.
    pub primary: usize,
    /// Indices of folded operations, in order.
    pub fused: Vec<usize>,
}

impl Stage {
    fn new(primary: usize) -> Self {
        Self {
            primary,
            fused: Vec::new(),
        }
    }

    /// Operation whose output is the stage output.
    pub fn output_op(&self) -> usize {
        self.fused.last().copied().unwrap_or(self.primary)
    }

    /// All operation indices, primary first.
    pub fn ops(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::once(self.primary).chain(self.fused.iter().copied())
    }
}

/// Turns a [`Network`] into an [`HwxContainer`].
#[derive(Debug, Clone, Default)]
pub struct Assembler {
    policy: LayoutPolicy,
}

impl Assembler {
    /// Assembler with the given layout policy.
    pub fn new(policy: LayoutPolicy) -> Self {
        Self { policy }
    }

    /// Layout policy in use.
    pub fn policy(&self) -> &LayoutPolicy {
        &self.policy
    }

    /// Group operations into stages, applying fusion.
    ///
    /// # Errors
    ///
    /// Returns `FusionShapeMismatch` if a fusable candidate's shape does not
    /// match the stage it would fold into.
    pub fn plan(&self, network: &Network) -> Result<Vec<Stage>> {
        let consumers = network.consumer_counts();
        let mut stages: Vec<Stage> = Vec::new();

        for index in 0..network.ops.len() {
            if self.policy.fusion {
                if let Some(stage) = stages.last_mut() {
                    if Self::fusable(network, stage, index, &consumers)? {
                        tracing::debug!("op {} folded into stage with primary op {}", index, stage.primary);
                        stage.fused.push(index);
                        continue;
                    }
                }
            }
            stages.push(Stage::new(index));
        }
        Ok(stages)
    }

    fn fusable(network: &Network, stage: &Stage, index: usize, consumers: &[usize]) -> Result<bool> {
        let ops = &network.ops;
        let op = &ops[index];
        let tail = stage.output_op();

        if !ops[stage.primary].kind.is_fusion_primary() || !op.kind.is_fusion_secondary() {
            return Ok(false);
        }
        if stage.fused.len() >= MAX_FUSED_STAGES || consumers[tail] != 1 {
            return Ok(false);
        }
        if stage.ops().any(|i| !ops[i].activation.is_none()) {
            return Ok(false);
        }
        let reads_tail = op.inputs.iter().filter(|&&o| o == Operand::Op(tail)).count();
        if reads_tail != 1 {
            return Ok(false);
        }

        let expected = ops[tail].output.shape;
        let mismatch = |found| HwxError::FusionShapeMismatch {
            index,
            expected,
            found,
        };

        // The NE section holds one element-wise mode and one scale/bias pair.
        let single_slot = matches!(op.kind, OpKind::ElementWise { .. } | OpKind::ScaleBias { .. });
        let kind = std::mem::discriminant(&op.kind);
        if single_slot && stage.fused.iter().any(|&i| std::mem::discriminant(&ops[i].kind) == kind) {
            return Ok(false);
        }

        if let OpKind::ElementWise { .. } = op.kind {
            let other = op.inputs.iter().find(|&&o| o != Operand::Op(tail));
            if let Some(desc) = other.and_then(|&o| network.operand_desc(o)) {
                if desc.shape != expected {
                    return Err(mismatch(desc.shape));
                }
            }
        }
        if op.output.shape != expected {
            return Err(mismatch(op.output.shape));
        }
        Ok(true)
    }

    /// Assemble a network into a container.
    ///
    /// # Errors
    ///
    /// Returns the first structural error: operand and arity errors,
    /// `FusionShapeMismatch`, `ShapeMismatch`, `ChannelOverflow`, or
    /// `InvalidRecord` naming the index of the first record that fails
    /// encoding or `validate()`.
    pub fn assemble(&self, network: &Network) -> Result<HwxContainer> {
        self.policy.validate()?;
        network.validate()?;
        let stages = self.plan(network)?;

        // op index -> stage producing its output
        let mut producer = vec![None; network.ops.len()];
        for (s, stage) in stages.iter().enumerate() {
            producer[stage.output_op()] = Some(s);
        }
        let surface_of = |index: usize, operand: Operand| -> Result<SurfaceId> {
            match operand {
                Operand::Input(n) => Ok(SurfaceId::Input(n)),
                Operand::Op(n) => producer[n].map(SurfaceId::Stage).ok_or_else(|| {
                    HwxError::invalid_operand(index, format!("op {n} was folded and has no surface"))
                }),
            }
        };

        let mut reads: Vec<Vec<SurfaceId>> = Vec::with_capacity(stages.len());
        for stage in &stages {
            let mut ids = Vec::new();
            for i in stage.ops() {
                let tail_reads = if i == stage.primary { None } else { Some(Operand::Op(i - 1)) };
                for &operand in &network.ops[i].inputs {
                    if Some(operand) != tail_reads {
                        ids.push(surface_of(i, operand)?);
                    }
                }
            }
            reads.push(ids);
        }

        let mut allocator = SurfaceAllocator::new(&self.policy);
        let mut placed_inputs = Vec::with_capacity(network.inputs.len());
        for desc in &network.inputs {
            placed_inputs.push(self.place(&mut allocator, *desc, 0)?);
        }
        let mut placed_stages = Vec::with_capacity(stages.len());
        for (s, stage) in stages.iter().enumerate() {
            let desc = network.ops[stage.output_op()].output;
            placed_stages.push(self.place(&mut allocator, desc, s)?);
        }
        let lookup = |id: SurfaceId| match id {
            SurfaceId::Input(n) => placed_inputs[n],
            SurfaceId::Stage(s) => placed_stages[s],
        };

        let residency = plan_residency(&reads);
        let mut data: Vec<u8> = Vec::new();
        let mut relocations = Vec::new();
        let mut records = Vec::with_capacity(stages.len());

        for (n, p) in placed_inputs.iter().enumerate() {
            relocations.push(Relocation::surface(format!("input{n}"), u64::from(p.surface.base), u64::from(p.size)));
        }

        for (s, stage) in stages.iter().enumerate() {
            let stage_ops: Vec<&OpRequest> = stage.ops().map(|i| &network.ops[i]).collect();
            let inputs: Vec<Placed> = reads[s].iter().map(|&id| lookup(id)).collect();

            let weights = match &stage_ops[0].weights {
                Some(w) => {
                    let blob = f32_to_f16_bytes(w);
                    let channel = self.push_blob(&mut data, &blob, s)?;
                    relocations.push(Relocation::blob(
                        RelocationKind::Weight,
                        record_index(s)?,
                        format!("weights{s}"),
                        u64::from(channel.offset),
                        u64::from(channel.length),
                    ));
                    Some(channel)
                }
                None => None,
            };

            let binding = StageBinding {
                inputs: &inputs,
                output: placed_stages[s],
                weights,
                residency: residency[s],
            };
            let td = ops::encode_stage(s, &stage_ops, &binding)?;

            if let Some(lut) = td.lut() {
                let channel = self.push_blob(&mut data, &lut.to_le_bytes(), s)?;
                relocations.push(Relocation::blob(
                    RelocationKind::Lut,
                    record_index(s)?,
                    format!("lut{s}"),
                    u64::from(channel.offset),
                    u64::from(channel.length),
                ));
            }
            records.push(td);
        }

        for (n, &op) in network.output_ops().iter().enumerate() {
            let Some(s) = producer[op] else { continue };
            let p = placed_stages[s];
            relocations.push(Relocation::surface(format!("output{n}"), u64::from(p.surface.base), u64::from(p.size)));
        }

        Self::chain(&mut records)?;
        for (i, td) in records.iter().enumerate() {
            td.validate().map_err(|e| HwxError::record(i, e))?;
        }
        verify_residency(&records)?;

        tracing::info!(
            "✅ Assembled {} op(s) into {} TD(s), {} relocation(s), {} data bytes",
            network.ops.len(),
            records.len(),
            relocations.len(),
            data.len()
        );
        HwxContainer::from_records(records, relocations, Bytes::from(data))
    }

    fn place(&self, allocator: &mut SurfaceAllocator, desc: TensorDesc, index: usize) -> Result<Placed> {
        let (strides, size) = self.policy.strides(&desc);
        let too_large = |what| HwxError::record(index, ChipError::field_overflow(what, i128::from(size), 32));
        let size32 = u32::try_from(size).map_err(|_| too_large("TileDMADst.DstBatchStride"))?;
        let base = allocator
            .alloc(size)
            .ok_or_else(|| too_large("TileDMADst.DstBaseAddr"))?;
        Ok(Placed {
            desc,
            surface: DmaSurface {
                base,
                strides,
                interleave: 1,
            },
            size: size32,
        })
    }

    fn push_blob(&self, data: &mut Vec<u8>, blob: &[u8], index: usize) -> Result<KernelChannel> {
        let start = align_up(data.len() as u64, u64::from(self.policy.weight_alignment));
        let overflow = |v: u64| HwxError::record(index, ChipError::field_overflow("KernelDMASrc.CoeffBaseAddr", i128::from(v), 32));
        let offset = u32::try_from(start).map_err(|_| overflow(start))?;
        let length = u32::try_from(blob.len()).map_err(|_| overflow(blob.len() as u64))?;
        data.resize(offset as usize, 0);
        data.extend_from_slice(blob);
        Ok(KernelChannel { offset, length })
    }

    /// Link records in order and mark the last one.
    fn chain(records: &mut [TileDescriptor]) -> Result<()> {
        let count = records.len();
        for (i, td) in records.iter_mut().enumerate() {
            let id = u16::try_from(i)
                .map_err(|_| HwxError::record(i, ChipError::field_overflow("Header.TID", i as i128, 16)))?;
            td.set_task_id(id).map_err(|e| HwxError::record(i, e))?;
            if i + 1 < count {
                let next = u32::try_from(program::record_offset(i + 1)).map_err(|_| {
                    HwxError::record(i, ChipError::field_overflow("Header.NextPointer", (i + 1) as i128, 32))
                })?;
                td.set_next(next).map_err(|e| HwxError::record(i, e))?;
            } else {
                td.set_last().map_err(|e| HwxError::record(i, e))?;
            }
        }
        Ok(())
    }
}

fn record_index(stage: usize) -> Result<u32> {
    u32::try_from(stage).map_err(|_| HwxError::invalid_container(format!("record index {stage} too large")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ElementWiseOp;
    use ane_chip::tensor::f16_bits;
    use ane_chip::{Activation, ActivationKind, DType, L2Port, Residency, TensorShape};

    fn f16(dims: [u32; 5]) -> TensorDesc {
        TensorDesc::new(TensorShape::from_dims(dims), DType::Float16)
    }

    fn conv(input: Operand, out: TensorDesc) -> OpRequest {
        OpRequest::new(
            OpKind::Convolution { kernel: [3, 3], stride: [1, 1], padding: [1, 1], groups: 1 },
            vec![input],
            out,
        )
        .with_weights(vec![0.5; 9 * 4 * 4])
    }

    fn conv_bias_relu() -> Network {
        let t = f16([1, 1, 4, 8, 8]);
        Network {
            inputs: vec![t],
            ops: vec![
                conv(Operand::Input(0), t),
                OpRequest::new(OpKind::ScaleBias { scale: 1.0, bias: 0.5 }, vec![Operand::Op(0)], t),
                OpRequest::new(OpKind::Activation, vec![Operand::Op(1)], t)
                    .with_activation(Activation::of(ActivationKind::Relu)),
            ],
        }
    }

    #[test]
    fn fusion_folds_bias_and_activation() {
        let net = conv_bias_relu();
        let stages = Assembler::default().plan(&net).unwrap();
        assert_eq!(stages, vec![Stage { primary: 0, fused: vec![1, 2] }]);

        let c = Assembler::default().assemble(&net).unwrap();
        assert_eq!(c.len(), 1);
        let td = &c.records()[0].td;
        assert_eq!(td.activation().unwrap().kind, ActivationKind::Relu);
        assert_eq!(td.get("Common.OpCfg.FusedStages").unwrap(), 2);
        assert_eq!(td.used_kernel_channels().unwrap(), vec![0, 1]);
        assert!(c.relocations().iter().any(|r| r.kind == RelocationKind::Weight));
    }

    #[test]
    fn fusion_disabled_emits_one_record_per_op() {
        let c = Assembler::new(LayoutPolicy::without_fusion())
            .assemble(&conv_bias_relu())
            .unwrap();
        assert_eq!(c.len(), 3);
        assert_eq!(c.chain_len(), 3);
        c.validate().unwrap();
        // Intermediates stay in L2 between consecutive records.
        assert_eq!(c.records()[0].td.residency(L2Port::Result).unwrap(), Residency::Allocate);
        assert_eq!(c.records()[1].td.residency(L2Port::Src1).unwrap(), Residency::Drop);
    }

    #[test]
    fn fusion_shape_mismatch_is_an_error() {
        let mut net = conv_bias_relu();
        net.ops[1].output = f16([1, 1, 4, 8, 4]);
        assert!(matches!(
            Assembler::default().assemble(&net),
            Err(HwxError::FusionShapeMismatch { index: 1, .. })
        ));
        // Without fusion the same network is a plain shape error.
        assert!(matches!(
            Assembler::new(LayoutPolicy::without_fusion()).assemble(&net),
            Err(HwxError::ShapeMismatch { index: 1, .. })
        ));
    }

    #[test]
    fn second_scale_bias_gets_its_own_record() {
        let t = f16([1, 1, 4, 8, 8]);
        let net = Network {
            inputs: vec![t],
            ops: vec![
                conv(Operand::Input(0), t),
                OpRequest::new(OpKind::ScaleBias { scale: 2.0, bias: 1.0 }, vec![Operand::Op(0)], t),
                OpRequest::new(OpKind::ScaleBias { scale: 3.0, bias: 5.0 }, vec![Operand::Op(1)], t),
            ],
        };
        let stages = Assembler::default().plan(&net).unwrap();
        assert_eq!(stages, vec![Stage { primary: 0, fused: vec![1] }, Stage { primary: 2, fused: vec![] }]);

        let c = Assembler::default().assemble(&net).unwrap();
        assert_eq!(c.len(), 2);
        c.validate().unwrap();
        let (first, second) = (&c.records()[0].td, &c.records()[1].td);
        assert_eq!(first.get("Common.OpCfg.FusedStages").unwrap(), 1);
        assert_eq!(first.get("NE.PostScale").unwrap(), f16_bits(2.0));
        assert_eq!(first.get("NE.AccBias").unwrap(), f16_bits(1.0));
        assert_eq!(second.get("Common.OpCfg.OpType").unwrap(), 8);
        assert_eq!(second.get("NE.PostScale").unwrap(), f16_bits(3.0));
        assert_eq!(second.get("NE.AccBias").unwrap(), f16_bits(5.0));
    }

    #[test]
    fn second_element_wise_gets_its_own_record() {
        let t = f16([1, 1, 4, 8, 8]);
        let net = Network {
            inputs: vec![t, t],
            ops: vec![
                conv(Operand::Input(0), t),
                OpRequest::new(
                    OpKind::ElementWise { op: ElementWiseOp::Add },
                    vec![Operand::Op(0), Operand::Input(1)],
                    t,
                ),
                OpRequest::new(
                    OpKind::ElementWise { op: ElementWiseOp::Mul },
                    vec![Operand::Op(1), Operand::Input(1)],
                    t,
                ),
            ],
        };
        let stages = Assembler::default().plan(&net).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].fused, vec![1]);
        let c = Assembler::default().assemble(&net).unwrap();
        assert_eq!(c.records()[0].td.get("NE.MACCfg.OpMode").unwrap(), 1);
    }

    #[test]
    fn shared_intermediate_is_not_fused() {
        let t = f16([1, 1, 4, 8, 8]);
        let net = Network {
            inputs: vec![t],
            ops: vec![
                conv(Operand::Input(0), t),
                OpRequest::new(OpKind::Activation, vec![Operand::Op(0)], t)
                    .with_activation(Activation::of(ActivationKind::Sigmoid)),
                OpRequest::new(
                    OpKind::ElementWise { op: ElementWiseOp::Mul },
                    vec![Operand::Op(0), Operand::Op(1)],
                    t,
                ),
            ],
        };
        let stages = Assembler::default().plan(&net).unwrap();
        assert_eq!(stages.len(), 3);
        let c = Assembler::default().assemble(&net).unwrap();
        c.validate().unwrap();
        assert_eq!(c.outputs().len(), 1);
    }

    #[test]
    fn deterministic_output() {
        let net = conv_bias_relu();
        let a = Assembler::default().assemble(&net).unwrap().write();
        let b = Assembler::default().assemble(&net).unwrap().write();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_record_reports_index() {
        let t = f16([1, 1, 1, 1, 8]);
        let net = Network {
            inputs: vec![t],
            ops: vec![
                OpRequest::new(OpKind::Activation, vec![Operand::Input(0)], t)
                    .with_activation(Activation::of(ActivationKind::Relu)),
                OpRequest::new(OpKind::Activation, vec![Operand::Op(0)], t)
                    .with_activation(Activation::of(ActivationKind::Lut)),
            ],
        };
        assert!(matches!(
            Assembler::default().assemble(&net),
            Err(HwxError::InvalidRecord { index: 1, source: ChipError::MissingLut })
        ));
    }

    #[test]
    fn lut_and_surfaces_are_relocated() {
        let t = f16([1, 1, 1, 1, 8]);
        let net = Network {
            inputs: vec![t],
            ops: vec![OpRequest::new(OpKind::Activation, vec![Operand::Input(0)], t)
                .with_activation(Activation::of(ActivationKind::Lut))
                .with_lut(vec![0.0, 1.0])],
        };
        let c = Assembler::default().assemble(&net).unwrap();
        let kinds: Vec<_> = c.relocations().iter().map(|r| (r.kind, r.name.as_str())).collect();
        assert_eq!(
            kinds,
            vec![
                (RelocationKind::Surface, "input0"),
                (RelocationKind::Lut, "lut0"),
                (RelocationKind::Surface, "output0"),
            ]
        );
        let back = HwxContainer::read(&c.write()).unwrap();
        assert_eq!(back, c);
    }
}
