// SPDX-License-Identifier: AGPL-3.0-only

//! Op catalog: the closed set of operation kinds and their encoding.
//!
//! Every kind maps to one Tile Descriptor. A stage is a primary operation
//! plus zero or more secondary operations folded into the same record's NE
//! section (see [`crate::assembler`] for when folding happens).
//!
//! | Kind | `OpCfg.OpType` | `OpCfg.SubOp` | Operands |
//! |------|----------------|---------------|----------|
//! | convolution | 1 | - | 1 (+ weights) |
//! | pooling | 2 | pool mode | 1 |
//! | element_wise | 3 | element-wise op | 2 |
//! | concat | 4 | - | 2 or more |
//! | reshape | 5 | - | 1 |
//! | transpose | 6 | - | 1 |
//! | mat_mul | 7 | - | 2, or 1 + weights |
//! | scale_bias | 8 | - | 1 |
//! | broadcast | 9 | - | 1 |
//! | softmax | 10 | - | 1 |
//! | normalization | 11 | norm kind | 1 |
//! | activation | 12 | - | 1 |
//!
//! Operand `i` occupies kernel DMA channel `i`; a weight blob takes the next
//! channel. Operands 0 and 1 are also bound to the Src1 / Src2 tile DMA
//! ports and their L2 views.

use crate::error::{HwxError, Result};
use crate::network::OpRequest;
use ane_chip::td::KERNEL_CHANNELS;
use ane_chip::tensor::f16_bits;
use ane_chip::{
    ActivationKind, DmaSurface, KernelChannel, L2Port, Lut, Residency, SourcePort, TensorDesc,
    TileDescriptor,
};
use serde::{Deserialize, Serialize};

/// Pooling reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    /// Maximum.
    Max,
    /// Mean.
    Avg,
}

/// Binary element-wise operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementWiseOp {
    /// a + b
    Add,
    /// a - b
    Sub,
    /// a · b
    Mul,
    /// max(a, b)
    Max,
    /// min(a, b)
    Min,
}

impl ElementWiseOp {
    /// Sub-operation code.
    pub const fn code(self) -> u8 {
        match self {
            Self::Add => 0,
            Self::Sub => 1,
            Self::Mul => 2,
            Self::Max => 3,
            Self::Min => 4,
        }
    }
}

/// Normalization variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    /// Over all non-batch axes.
    Layer,
    /// Per channel, per sample.
    Instance,
    /// Per channel, across the batch.
    Batch,
    /// L2 norm.
    L2,
}

impl NormKind {
    const fn code(self) -> u8 {
        match self {
            Self::Layer => 0,
            Self::Instance => 1,
            Self::Batch => 2,
            Self::L2 => 3,
        }
    }
}

fn unit_pair() -> [u32; 2] {
    [1, 1]
}

fn one() -> u32 {
    1
}

fn default_eps() -> f32 {
    1.0e-5
}

/// Operation kind with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpKind {
    /// 2-D convolution.
    Convolution {
        /// Kernel `[width, height]`.
        kernel: [u32; 2],
        /// Stride `[x, y]`.
        #[serde(default = "unit_pair")]
        stride: [u32; 2],
        /// Padding `[x, y]`; negative values crop.
        #[serde(default)]
        padding: [i32; 2],
        /// Channel groups.
        #[serde(default = "one")]
        groups: u32,
    },
    /// Spatial pooling.
    Pooling {
        /// Reduction.
        mode: PoolMode,
        /// Window `[width, height]`.
        kernel: [u32; 2],
        /// Stride `[x, y]`.
        #[serde(default = "unit_pair")]
        stride: [u32; 2],
    },
    /// Binary element-wise.
    ElementWise {
        /// Operation.
        op: ElementWiseOp,
    },
    /// Concatenation along an axis.
    Concat {
        /// Axis index, outermost first (0 = group .. 4 = column).
        axis: u8,
    },
    /// Reinterpret the shape; element count is preserved.
    Reshape,
    /// Axis permutation.
    Transpose {
        /// Permutation code.
        mode: u8,
    },
    /// Matrix multiply.
    MatMul,
    /// `x · scale + bias` with scalar parameters.
    ScaleBias {
        /// Scale.
        scale: f32,
        /// Bias.
        bias: f32,
    },
    /// Broadcast along the masked axes.
    Broadcast {
        /// One bit per axis, bit 0 = column.
        mask: u8,
    },
    /// Softmax along an axis.
    Softmax {
        /// Axis index.
        axis: u8,
    },
    /// Normalization variants.
    Normalization {
        /// Variant.
        kind: NormKind,
        /// Epsilon.
        #[serde(default = "default_eps")]
        eps: f32,
    },
    /// Activation only.
    Activation,
}

impl OpKind {
    /// `Common.OpCfg.OpType` code.
    pub const fn op_type(&self) -> u8 {
        match self {
            Self::Convolution { .. } => 1,
            Self::Pooling { .. } => 2,
            Self::ElementWise { .. } => 3,
            Self::Concat { .. } => 4,
            Self::Reshape => 5,
            Self::Transpose { .. } => 6,
            Self::MatMul => 7,
            Self::ScaleBias { .. } => 8,
            Self::Broadcast { .. } => 9,
            Self::Softmax { .. } => 10,
            Self::Normalization { .. } => 11,
            Self::Activation => 12,
        }
    }

    /// `Common.OpCfg.SubOp` code.
    pub const fn sub_op(&self) -> u8 {
        match self {
            Self::Pooling { mode, .. } => match mode {
                PoolMode::Max => 0,
                PoolMode::Avg => 1,
            },
            Self::ElementWise { op } => op.code(),
            Self::Normalization { kind, .. } => kind.code(),
            _ => 0,
        }
    }

    /// Kinds a secondary stage may be folded into.
    pub const fn is_fusion_primary(&self) -> bool {
        matches!(self, Self::Convolution { .. } | Self::Pooling { .. })
    }

    /// Kinds that may be folded into a primary stage.
    pub const fn is_fusion_secondary(&self) -> bool {
        matches!(self, Self::ScaleBias { .. } | Self::Activation | Self::ElementWise { .. })
    }

    /// Check the operand count for this kind.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperand` if the count is wrong.
    pub fn check_arity(&self, index: usize, operands: usize, has_weights: bool) -> Result<()> {
        let ok = match self {
            Self::ElementWise { .. } => operands == 2,
            Self::Concat { .. } => operands >= 2,
            Self::MatMul => operands == 2 || (operands == 1 && has_weights),
            _ => operands == 1,
        };
        if ok {
            Ok(())
        } else {
            Err(HwxError::invalid_operand(
                index,
                format!("{} operand(s) is not valid for {self:?}", operands),
            ))
        }
    }
}

/// A tensor placed in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placed {
    /// Logical tensor.
    pub desc: TensorDesc,
    /// Address and strides.
    pub surface: DmaSurface,
    /// Padded size in bytes.
    pub size: u32,
}

/// Residency hints for one record's three L2 ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageResidency {
    /// First source.
    pub src1: Residency,
    /// Second source.
    pub src2: Residency,
    /// Result.
    pub result: Residency,
}

/// Memory placement for one stage.
#[derive(Debug, Clone)]
pub struct StageBinding<'a> {
    /// Operands in port order: primary operands, then the operand of a
    /// folded element-wise stage.
    pub inputs: &'a [Placed],
    /// Stage output.
    pub output: Placed,
    /// Weight blob (data-section offset and length).
    pub weights: Option<KernelChannel>,
    /// L2 hints.
    pub residency: StageResidency,
}

/// Encode one stage into a fresh Tile Descriptor.
///
/// `ops[0]` is the primary operation; the rest are folded into its NE
/// section in order. Header chaining is left to the assembler.
///
/// # Errors
///
/// - `InvalidOperand` for an empty stage
/// - `ChannelOverflow` if operands plus weights exceed 16 channels
/// - `ShapeMismatch` if operand shapes do not fit the primary kind
/// - `InvalidRecord` for any field that does not fit
pub fn encode_stage(index: usize, ops: &[&OpRequest], binding: &StageBinding<'_>) -> Result<TileDescriptor> {
    let (primary, secondary) = ops
        .split_first()
        .ok_or_else(|| HwxError::invalid_operand(index, "empty stage"))?;

    let needed = binding.inputs.len() + usize::from(binding.weights.is_some());
    if needed > KERNEL_CHANNELS {
        return Err(HwxError::ChannelOverflow {
            index,
            needed,
            max: KERNEL_CHANNELS,
        });
    }
    check_shapes(index, primary, &binding.inputs[..binding.inputs.len().min(primary.inputs.len())])?;

    let mut td = TileDescriptor::new();
    encode_into(&mut td, primary, secondary, binding).map_err(|e| HwxError::record(index, e))?;

    tracing::debug!(
        "TD[{}]: {:?} with {} fused stage(s), {} channel(s)",
        index,
        primary.kind,
        secondary.len(),
        needed
    );
    Ok(td)
}

fn check_shapes(index: usize, op: &OpRequest, inputs: &[Placed]) -> Result<()> {
    let out = op.output.shape;
    match op.kind {
        OpKind::ElementWise { .. } | OpKind::ScaleBias { .. } | OpKind::Activation => {
            if let Some(bad) = inputs.iter().find(|p| p.desc.shape != out) {
                return Err(HwxError::shape_mismatch(
                    index,
                    format!("operand {} differs from output {out}", bad.desc.shape),
                ));
            }
        }
        OpKind::Reshape => {
            if let Some(input) = inputs.first() {
                if input.desc.shape.element_count() != out.element_count() {
                    return Err(HwxError::shape_mismatch(
                        index,
                        format!("reshape {} -> {out} changes element count", input.desc.shape),
                    ));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn encode_into(
    td: &mut TileDescriptor,
    primary: &OpRequest,
    secondary: &[&OpRequest],
    binding: &StageBinding<'_>,
) -> ane_chip::Result<()> {
    for (channel, input) in binding.inputs.iter().enumerate() {
        td.set_kernel_channel(
            channel,
            KernelChannel {
                offset: input.surface.base,
                length: input.size,
            },
        )?;
    }
    if let Some(weights) = binding.weights {
        td.set_kernel_channel(binding.inputs.len(), weights)?;
    }

    let src1 = binding.inputs.first();
    let src2 = binding.inputs.get(1);
    if let Some(a) = src1 {
        td.set_source(SourcePort::Src1, &a.surface)?;
        td.set_l2_source(SourcePort::Src1, &a.surface)?;
        td.set_input_dims(&a.desc.shape)?;
    }
    if let Some(b) = src2 {
        td.set_source(SourcePort::Src2, &b.surface)?;
        td.set_l2_source(SourcePort::Src2, &b.surface)?;
    }
    let in_dtype = src1.map_or(binding.output.desc.dtype, |a| a.desc.dtype);
    let src2_dtype = src2.map_or(in_dtype, |b| b.desc.dtype);
    td.set_dtypes(in_dtype, src2_dtype, binding.output.desc.dtype)?;

    td.set_output_dims(&binding.output.desc.shape)?;
    td.set_destination(&binding.output.surface)?;
    td.set_l2_result(&binding.output.surface)?;

    td.set_residency(L2Port::Src1, binding.residency.src1)?;
    td.set_residency(L2Port::Src2, binding.residency.src2)?;
    td.set_residency(L2Port::Result, binding.residency.result)?;

    encode_kind(td, &primary.kind)?;
    apply_activation(td, primary)?;

    for op in secondary {
        match op.kind {
            OpKind::ScaleBias { scale, bias } => {
                td.set_post_scale(scale)?;
                td.set_bias(bias)?;
            }
            OpKind::ElementWise { op: ew } => {
                td.set("NE.MACCfg.OpMode", u64::from(ew.code()) + 1)?;
            }
            _ => {}
        }
        apply_activation(td, op)?;
    }

    #[allow(clippy::cast_possible_truncation)]
    let fused = secondary.len().min(u8::MAX as usize) as u8;
    td.set_op(primary.kind.op_type(), primary.kind.sub_op(), fused)
}

fn encode_kind(td: &mut TileDescriptor, kind: &OpKind) -> ane_chip::Result<()> {
    match *kind {
        OpKind::Convolution {
            kernel,
            stride,
            padding,
            groups,
        } => {
            td.set_conv_geometry((kernel[0], kernel[1]), (stride[0], stride[1]), (padding[0], padding[1]))?;
            td.set("Common.GroupConvCfg.NumGroups", u64::from(groups))
        }
        OpKind::Pooling { kernel, stride, .. } => {
            td.set("Common.OpCfg.PoolKw", u64::from(kernel[0]))?;
            td.set("Common.OpCfg.PoolKh", u64::from(kernel[1]))?;
            td.set("Common.ConvCfg.Sx", u64::from(stride[0]))?;
            td.set("Common.ConvCfg.Sy", u64::from(stride[1]))
        }
        OpKind::ElementWise { op } => {
            if op == ElementWiseOp::Mul {
                td.set("Common.GroupConvCfg.ElemMultMode", 1)?;
            }
            Ok(())
        }
        OpKind::Concat { axis } | OpKind::Softmax { axis } => td.set("Common.OpCfg.Axis", u64::from(axis)),
        OpKind::Transpose { mode } => td.set("Common.OpCfg.TransposeMode", u64::from(mode)),
        OpKind::Broadcast { mask } => td.set("Common.OpCfg.BroadcastMask", u64::from(mask)),
        OpKind::ScaleBias { scale, bias } => {
            td.set_post_scale(scale)?;
            td.set_bias(bias)
        }
        OpKind::Normalization { eps, .. } => td.set("Common.OpCfg.NormEps", f16_bits(eps)),
        OpKind::Reshape | OpKind::MatMul | OpKind::Activation => Ok(()),
    }
}

fn apply_activation(td: &mut TileDescriptor, op: &OpRequest) -> ane_chip::Result<()> {
    if op.activation.is_none() {
        return Ok(());
    }
    td.set_activation(&op.activation)?;
    if op.activation.kind == ActivationKind::Lut {
        if let Some(samples) = &op.lut {
            td.attach_lut(Lut::from_f32(samples))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Operand;
    use ane_chip::{Activation, ChipError, DType, Strides, TensorShape};

    fn placed(base: u32, dims: [u32; 5]) -> Placed {
        let desc = TensorDesc::new(TensorShape::from_dims(dims), DType::Float16);
        let row = ((desc.shape.column * 2 + 0x3F) / 0x40) * 0x40;
        let plane = row * desc.shape.row;
        Placed {
            desc,
            surface: DmaSurface {
                base,
                strides: Strides { row, plane, depth: plane * desc.shape.plane, batch: plane * desc.shape.plane },
                interleave: 1,
            },
            size: plane * desc.shape.plane,
        }
    }

    fn binding(inputs: &[Placed], output: Placed) -> StageBinding<'_> {
        StageBinding {
            inputs,
            output,
            weights: None,
            residency: StageResidency::default(),
        }
    }

    #[test]
    fn element_wise_add_uses_two_channels() {
        let a = placed(0x0, [1, 1, 1, 1, 64]);
        let b = placed(0x80, [1, 1, 1, 1, 64]);
        let out = placed(0x100, [1, 1, 1, 1, 64]);
        let op = OpRequest::new(
            OpKind::ElementWise { op: ElementWiseOp::Add },
            vec![Operand::Input(0), Operand::Input(1)],
            out.desc,
        );
        let inputs = [a, b];
        let td = encode_stage(0, &[&op], &binding(&inputs, out)).unwrap();
        assert_eq!(td.used_kernel_channels().unwrap(), vec![0, 1]);
        assert_eq!(td.input_dtype().unwrap(), DType::Float16);
        assert_eq!(td.activation().unwrap(), Activation::NONE);
        assert_eq!(td.get("Common.OpCfg.OpType").unwrap(), 3);
        td.validate().unwrap();
    }

    #[test]
    fn fused_stage_folds_into_ne() {
        let x = placed(0x0, [1, 1, 8, 8, 8]);
        let out = placed(0x1000, [1, 1, 8, 8, 8]);
        let conv = OpRequest::new(
            OpKind::Convolution { kernel: [3, 3], stride: [1, 1], padding: [1, 1], groups: 1 },
            vec![Operand::Input(0)],
            out.desc,
        );
        let bias = OpRequest::new(OpKind::ScaleBias { scale: 0.5, bias: 1.0 }, vec![Operand::Op(0)], out.desc);
        let act = OpRequest::new(OpKind::Activation, vec![Operand::Op(1)], out.desc)
            .with_activation(Activation::of(ActivationKind::Relu));
        let inputs = [x];
        let td = encode_stage(0, &[&conv, &bias, &act], &binding(&inputs, out)).unwrap();
        assert_eq!(td.get("Common.OpCfg.FusedStages").unwrap(), 2);
        assert_eq!(td.get("NE.MACCfg.BiasMode").unwrap(), 1);
        assert_eq!(td.get("NE.MACCfg.PostScaleMode").unwrap(), 1);
        assert_eq!(td.activation().unwrap().kind, ActivationKind::Relu);
        assert_eq!(td.get_signed("Common.ConvCfg.Px").unwrap(), 1);
    }

    #[test]
    fn channel_overflow() {
        let inputs: Vec<Placed> = (0..17).map(|i| placed(i * 0x40, [1, 1, 1, 1, 8])).collect();
        let operands = (0..17).map(Operand::Input).collect();
        let out = placed(0x8000, [1, 1, 1, 1, 136]);
        let op = OpRequest::new(OpKind::Concat { axis: 4 }, operands, out.desc);
        let err = encode_stage(2, &[&op], &binding(&inputs, out)).unwrap_err();
        assert!(matches!(err, HwxError::ChannelOverflow { index: 2, needed: 17, max: 16 }));
    }

    #[test]
    fn lut_activation_without_payload_fails_validation() {
        let x = placed(0, [1, 1, 1, 1, 8]);
        let out = placed(0x40, [1, 1, 1, 1, 8]);
        let op = OpRequest::new(OpKind::Activation, vec![Operand::Input(0)], out.desc)
            .with_activation(Activation::of(ActivationKind::Lut));
        let inputs = [x];
        let td = encode_stage(0, &[&op], &binding(&inputs, out)).unwrap();
        assert_eq!(td.validate(), Err(ChipError::MissingLut));

        let op = op.with_lut(vec![0.0, 0.5, 1.0]);
        let td = encode_stage(0, &[&op], &binding(&inputs, out)).unwrap();
        td.validate().unwrap();
        assert_eq!(td.lut().map(Lut::len), Some(3));
    }

    #[test]
    fn reshape_must_preserve_elements() {
        let x = placed(0, [1, 1, 1, 4, 4]);
        let out = placed(0x400, [1, 1, 1, 1, 15]);
        let op = OpRequest::new(OpKind::Reshape, vec![Operand::Input(0)], out.desc);
        let inputs = [x];
        assert!(matches!(
            encode_stage(0, &[&op], &binding(&inputs, out)),
            Err(HwxError::ShapeMismatch { index: 0, .. })
        ));
    }

    #[test]
    fn arity() {
        assert!(OpKind::MatMul.check_arity(0, 1, true).is_ok());
        assert!(OpKind::MatMul.check_arity(0, 1, false).is_err());
        assert!(OpKind::Concat { axis: 0 }.check_arity(0, 1, false).is_err());
        assert!(OpKind::Reshape.check_arity(0, 2, false).is_err());
    }

    #[test]
    fn kind_serde_tag() {
        let kind: OpKind = serde_json::from_str(r#"{"type": "convolution", "kernel": [3, 3]}"#).unwrap();
        assert_eq!(
            kind,
            OpKind::Convolution { kernel: [3, 3], stride: [1, 1], padding: [0, 0], groups: 1 }
        );
    }
}
