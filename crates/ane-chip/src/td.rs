// SPDX-License-Identifier: AGPL-3.0-only

//! Tile Descriptor: one 0x300-byte accelerator instruction record.
//!
//! All access funnels through the register table and the bitfield codec;
//! the typed accessors below are thin wrappers naming the fields each
//! section uses. Bytes not covered by any field are preserved as-is.

use crate::activation::{Activation, ActivationKind, Lut};
use crate::bitfield;
use crate::error::{ChipError, Result};
use crate::regs::{RegisterField, RegisterTable, Section, TD_SIZE};
use crate::residency::{L2Port, Residency};
use crate::tensor::{f16_bits, f16_value, DType, TensorShape};
use std::fmt;

/// Number of kernel DMA channels.
pub const KERNEL_CHANNELS: usize = 16;

/// Alignment the DMA engine imposes on every stride.
pub const STRIDE_ALIGN: u64 = 0x40;

/// `Header.NextPointer` value marking the end of the chain.
///
/// The TD array never starts at offset 0, so 0 is never a valid successor.
pub const NEXT_TERMINATOR: u32 = 0;

/// Format fields checked against the closed dtype set.
const DTYPE_FIELDS: [&str; 3] = [
    "Common.ChCfg.InFmt",
    "Common.ChCfg.Src2InFmt",
    "Common.ChCfg.OutFmt",
];

/// One kernel DMA channel slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelChannel {
    /// Data offset (device address or blob offset).
    pub offset: u32,
    /// Data length in bytes.
    pub length: u32,
}

/// Per-axis strides in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Strides {
    /// Between rows.
    pub row: u32,
    /// Between planes (channels).
    pub plane: u32,
    /// Between depth slices.
    pub depth: u32,
    /// Between batch groups.
    pub batch: u32,
}

/// A strided surface as seen by a tile DMA port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaSurface {
    /// Base device address.
    pub base: u32,
    /// Per-axis strides.
    pub strides: Strides,
    /// Interleave factor (4 bits).
    pub interleave: u8,
}

/// Tile DMA source port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePort {
    /// First operand.
    Src1,
    /// Second operand.
    Src2,
}

impl SourcePort {
    const fn prefix(self) -> &'static str {
        match self {
            Self::Src1 => "Src1",
            Self::Src2 => "Src2",
        }
    }
}

/// A fixed-size accelerator instruction record.
#[derive(Clone)]
pub struct TileDescriptor {
    bytes: Box<[u8; TD_SIZE]>,
    lut: Option<Lut>,
    table: &'static RegisterTable,
}

impl TileDescriptor {
    /// Zero-filled record described by the built-in table.
    #[must_use]
    pub fn new() -> Self {
        Self::with_table(RegisterTable::builtin())
    }

    /// Zero-filled record described by `table`.
    #[must_use]
    pub fn with_table(table: &'static RegisterTable) -> Self {
        Self {
            bytes: Box::new([0u8; TD_SIZE]),
            lut: None,
            table,
        }
    }

    /// Wrap existing record bytes.
    #[must_use]
    pub fn from_record(record: &[u8; TD_SIZE]) -> Self {
        let mut td = Self::new();
        td.bytes.copy_from_slice(record);
        td
    }

    /// Raw record bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; TD_SIZE] {
        &self.bytes
    }

    /// Bytes of one section.
    #[must_use]
    pub fn section_bytes(&self, section: Section) -> &[u8] {
        &self.bytes[section.range()]
    }

    /// Table describing this record.
    #[must_use]
    pub fn table(&self) -> &'static RegisterTable {
        self.table
    }

    // ── Generic access ───────────────────────────────────────────────────────

    fn field(&self, name: &str) -> Result<&'static RegisterField> {
        self.table.lookup(name)
    }

    /// Read a field by qualified name.
    ///
    /// # Errors
    ///
    /// Returns `UnknownField` if the name is not in the table.
    pub fn get(&self, name: &str) -> Result<u64> {
        let field = self.field(name)?;
        Ok(bitfield::unpack(&self.bytes[..], field))
    }

    /// Read a signed field by qualified name.
    ///
    /// # Errors
    ///
    /// Returns `UnknownField` if the name is not in the table.
    pub fn get_signed(&self, name: &str) -> Result<i64> {
        let field = self.field(name)?;
        Ok(bitfield::unpack_signed(&self.bytes[..], field))
    }

    /// Write a field by qualified name.
    ///
    /// # Errors
    ///
    /// Returns `UnknownField` or `FieldOverflow`.
    pub fn set(&mut self, name: &str, value: u64) -> Result<()> {
        let field = self.field(name)?;
        bitfield::pack(&mut self.bytes[..], field, value)
    }

    /// Write a signed field by qualified name.
    ///
    /// # Errors
    ///
    /// Returns `UnknownField` or `FieldOverflow`.
    pub fn set_signed(&mut self, name: &str, value: i64) -> Result<()> {
        let field = self.field(name)?;
        bitfield::pack_signed(&mut self.bytes[..], field, value)
    }

    /// Every field with a non-zero value, in table order.
    pub fn fields(&self) -> impl Iterator<Item = (&'static RegisterField, u64)> + '_ {
        self.table.iter().filter_map(move |f| {
            let value = bitfield::unpack(&self.bytes[..], f);
            (value != 0).then_some((f, value))
        })
    }

    // ── Header ───────────────────────────────────────────────────────────────

    /// Task id.
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn set_task_id(&mut self, id: u16) -> Result<()> {
        self.set("Header.TID", u64::from(id))
    }

    /// Link to the successor record at file offset `next`.
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn set_next(&mut self, next: u32) -> Result<()> {
        self.set("Header.NextPointer", u64::from(next))?;
        self.set("Header.NextSize", (TD_SIZE / 4) as u64)?;
        self.set("Header.LNID", 0)?;
        self.set("Header.EON", 0)
    }

    /// Mark this record as the last in its chain.
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn set_last(&mut self) -> Result<()> {
        self.set("Header.NextPointer", u64::from(NEXT_TERMINATOR))?;
        self.set("Header.NextSize", 0)?;
        self.set("Header.LNID", 1)?;
        self.set("Header.EON", 1)
    }

    /// File offset of the successor, or [`NEXT_TERMINATOR`].
    ///
    /// # Errors
    ///
    /// Returns `UnknownField` if the table has no `Header.NextPointer`.
    pub fn next_pointer(&self) -> Result<u32> {
        let raw = self.get("Header.NextPointer")?;
        u32::try_from(raw).map_err(|_| ChipError::field_overflow("Header.NextPointer", i128::from(raw), 32))
    }

    // ── KernelDMASrc ─────────────────────────────────────────────────────────

    fn check_channel(channel: usize) -> Result<()> {
        if channel >= KERNEL_CHANNELS {
            return Err(ChipError::ChannelOutOfRange {
                channel,
                max: KERNEL_CHANNELS,
            });
        }
        Ok(())
    }

    /// Mark a kernel channel used and point it at `data`.
    ///
    /// # Errors
    ///
    /// Returns `ChannelOutOfRange` or codec errors.
    pub fn set_kernel_channel(&mut self, channel: usize, data: KernelChannel) -> Result<()> {
        Self::check_channel(channel)?;
        self.set(&format!("KernelDMASrc.CoeffDMAConfig[{channel}].En"), 1)?;
        self.set(&format!("KernelDMASrc.CoeffBaseAddr[{channel}]"), u64::from(data.offset))?;
        self.set(&format!("KernelDMASrc.CoeffBfrSize[{channel}]"), u64::from(data.length))
    }

    /// Channel contents, if the channel is marked used.
    ///
    /// # Errors
    ///
    /// Returns `ChannelOutOfRange` or `UnknownField`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn kernel_channel(&self, channel: usize) -> Result<Option<KernelChannel>> {
        Self::check_channel(channel)?;
        if self.get(&format!("KernelDMASrc.CoeffDMAConfig[{channel}].En"))? == 0 {
            return Ok(None);
        }
        Ok(Some(KernelChannel {
            offset: self.get(&format!("KernelDMASrc.CoeffBaseAddr[{channel}]"))? as u32,
            length: self.get(&format!("KernelDMASrc.CoeffBfrSize[{channel}]"))? as u32,
        }))
    }

    /// Indices of channels marked used.
    ///
    /// # Errors
    ///
    /// Returns `UnknownField` if the table lacks channel fields.
    pub fn used_kernel_channels(&self) -> Result<Vec<usize>> {
        let mut used = Vec::new();
        for channel in 0..KERNEL_CHANNELS {
            if self.get(&format!("KernelDMASrc.CoeffDMAConfig[{channel}].En"))? != 0 {
                used.push(channel);
            }
        }
        Ok(used)
    }

    // ── Common ───────────────────────────────────────────────────────────────

    /// Input dimensions (`group` goes to the batch count).
    ///
    /// # Errors
    ///
    /// Returns `FieldOverflow` if a dimension exceeds its field.
    pub fn set_input_dims(&mut self, shape: &TensorShape) -> Result<()> {
        self.set("Common.InDim.Win", u64::from(shape.column))?;
        self.set("Common.InDim.Hin", u64::from(shape.row))?;
        self.set("Common.Cin", u64::from(shape.plane))?;
        self.set("Common.InDim.Din", u64::from(shape.depth))?;
        self.set("Common.Batch", u64::from(shape.group))
    }

    /// Output dimensions.
    ///
    /// # Errors
    ///
    /// Returns `FieldOverflow` if a dimension exceeds its field.
    pub fn set_output_dims(&mut self, shape: &TensorShape) -> Result<()> {
        self.set("Common.OutDim.Wout", u64::from(shape.column))?;
        self.set("Common.OutDim.Hout", u64::from(shape.row))?;
        self.set("Common.Cout", u64::from(shape.plane))?;
        self.set("Common.OutDim.Dout", u64::from(shape.depth))
    }

    /// Input dimensions as stored.
    ///
    /// # Errors
    ///
    /// Returns `UnknownField` if the table lacks the dimension fields.
    #[allow(clippy::cast_possible_truncation)]
    pub fn input_dims(&self) -> Result<TensorShape> {
        Ok(TensorShape {
            column: self.get("Common.InDim.Win")? as u32,
            row: self.get("Common.InDim.Hin")? as u32,
            plane: self.get("Common.Cin")? as u32,
            depth: self.get("Common.InDim.Din")? as u32,
            group: self.get("Common.Batch")? as u32,
        })
    }

    /// Output dimensions as stored (batch shared with the input).
    ///
    /// # Errors
    ///
    /// Returns `UnknownField` if the table lacks the dimension fields.
    #[allow(clippy::cast_possible_truncation)]
    pub fn output_dims(&self) -> Result<TensorShape> {
        Ok(TensorShape {
            column: self.get("Common.OutDim.Wout")? as u32,
            row: self.get("Common.OutDim.Hout")? as u32,
            plane: self.get("Common.Cout")? as u32,
            depth: self.get("Common.OutDim.Dout")? as u32,
            group: self.get("Common.Batch")? as u32,
        })
    }

    /// Input, second-source and output element types.
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn set_dtypes(&mut self, input: DType, src2: DType, output: DType) -> Result<()> {
        self.set("Common.ChCfg.InFmt", input.code())?;
        self.set("Common.ChCfg.Src2InFmt", src2.code())?;
        self.set("Common.ChCfg.OutFmt", output.code())
    }

    /// Input element type.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedDType` for a code outside the closed set.
    pub fn input_dtype(&self) -> Result<DType> {
        DType::from_code(DTYPE_FIELDS[0], self.get(DTYPE_FIELDS[0])?)
    }

    /// Output element type.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedDType` for a code outside the closed set.
    pub fn output_dtype(&self) -> Result<DType> {
        DType::from_code(DTYPE_FIELDS[2], self.get(DTYPE_FIELDS[2])?)
    }

    /// Convolution window geometry. Padding is signed (negative crops).
    ///
    /// # Errors
    ///
    /// Returns `FieldOverflow` if any value exceeds its field.
    pub fn set_conv_geometry(&mut self, kernel: (u32, u32), stride: (u32, u32), padding: (i32, i32)) -> Result<()> {
        self.set("Common.ConvCfg.Kw", u64::from(kernel.0))?;
        self.set("Common.ConvCfg.Kh", u64::from(kernel.1))?;
        self.set("Common.ConvCfg.Sx", u64::from(stride.0))?;
        self.set("Common.ConvCfg.Sy", u64::from(stride.1))?;
        self.set_signed("Common.ConvCfg.Px", i64::from(padding.0))?;
        self.set_signed("Common.ConvCfg.Py", i64::from(padding.1))
    }

    /// Operation class, sub-operation and number of folded stages.
    ///
    /// # Errors
    ///
    /// Returns `FieldOverflow` if any value exceeds its field.
    pub fn set_op(&mut self, op_type: u8, sub_op: u8, fused_stages: u8) -> Result<()> {
        self.set("Common.OpCfg.OpType", u64::from(op_type))?;
        self.set("Common.OpCfg.SubOp", u64::from(sub_op))?;
        self.set("Common.OpCfg.FusedStages", u64::from(fused_stages))
    }

    // ── TileDMASrc / TileDMADst ──────────────────────────────────────────────

    /// Enable a tile DMA source and describe its surface.
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn set_source(&mut self, port: SourcePort, surface: &DmaSurface) -> Result<()> {
        let p = port.prefix();
        self.set(&format!("TileDMASrc.{p}DmaConfig.En"), 1)?;
        self.set(&format!("TileDMASrc.{p}BaseAddr"), u64::from(surface.base))?;
        self.set_strides("TileDMASrc", p, &surface.strides)?;
        self.set(&format!("TileDMASrc.{p}Fmt.Interleave"), u64::from(surface.interleave))
    }

    /// Tile DMA source surface, if enabled.
    ///
    /// # Errors
    ///
    /// Returns `UnknownField` if the table lacks the source fields.
    #[allow(clippy::cast_possible_truncation)]
    pub fn source(&self, port: SourcePort) -> Result<Option<DmaSurface>> {
        let p = port.prefix();
        if self.get(&format!("TileDMASrc.{p}DmaConfig.En"))? == 0 {
            return Ok(None);
        }
        Ok(Some(DmaSurface {
            base: self.get(&format!("TileDMASrc.{p}BaseAddr"))? as u32,
            strides: self.strides("TileDMASrc", p)?,
            interleave: self.get(&format!("TileDMASrc.{p}Fmt.Interleave"))? as u8,
        }))
    }

    /// Enable the tile DMA destination and describe its surface.
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn set_destination(&mut self, surface: &DmaSurface) -> Result<()> {
        self.set("TileDMADst.DstDmaConfig.En", 1)?;
        self.set("TileDMADst.DstBaseAddr", u64::from(surface.base))?;
        self.set_strides("TileDMADst", "Dst", &surface.strides)?;
        self.set("TileDMADst.DstFmt.Interleave", u64::from(surface.interleave))
    }

    /// Destination surface, if enabled.
    ///
    /// # Errors
    ///
    /// Returns `UnknownField` if the table lacks the destination fields.
    #[allow(clippy::cast_possible_truncation)]
    pub fn destination(&self) -> Result<Option<DmaSurface>> {
        if self.get("TileDMADst.DstDmaConfig.En")? == 0 {
            return Ok(None);
        }
        Ok(Some(DmaSurface {
            base: self.get("TileDMADst.DstBaseAddr")? as u32,
            strides: self.strides("TileDMADst", "Dst")?,
            interleave: self.get("TileDMADst.DstFmt.Interleave")? as u8,
        }))
    }

    fn set_strides(&mut self, section: &str, prefix: &str, strides: &Strides) -> Result<()> {
        self.set(&format!("{section}.{prefix}RowStride"), u64::from(strides.row))?;
        self.set(&format!("{section}.{prefix}PlaneStride"), u64::from(strides.plane))?;
        self.set(&format!("{section}.{prefix}DepthStride"), u64::from(strides.depth))?;
        self.set(&format!("{section}.{prefix}BatchStride"), u64::from(strides.batch))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn strides(&self, section: &str, prefix: &str) -> Result<Strides> {
        Ok(Strides {
            row: self.get(&format!("{section}.{prefix}RowStride"))? as u32,
            plane: self.get(&format!("{section}.{prefix}PlaneStride"))? as u32,
            depth: self.get(&format!("{section}.{prefix}DepthStride"))? as u32,
            batch: self.get(&format!("{section}.{prefix}BatchStride"))? as u32,
        })
    }

    // ── L2 ───────────────────────────────────────────────────────────────────

    /// Residency hint for one port.
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn set_residency(&mut self, port: L2Port, hint: Residency) -> Result<()> {
        self.set(port.field(), hint.code())
    }

    /// Residency hint for one port.
    ///
    /// # Errors
    ///
    /// Returns `UnknownField` if the table lacks the residency fields.
    pub fn residency(&self, port: L2Port) -> Result<Residency> {
        let code = self.get(port.field())?;
        // 2-bit field: every value decodes, and 0 is the default.
        Ok(Residency::from_code(code).unwrap_or_default())
    }

    /// L2 view of a source surface (base, channel stride, row stride).
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn set_l2_source(&mut self, port: SourcePort, surface: &DmaSurface) -> Result<()> {
        let p = match port {
            SourcePort::Src1 => "Source",
            SourcePort::Src2 => "Source2",
        };
        self.set(&format!("L2.{p}Base"), u64::from(surface.base))?;
        self.set(&format!("L2.{p}ChannelStride"), u64::from(surface.strides.plane))?;
        self.set(&format!("L2.{p}RowStride"), u64::from(surface.strides.row))
    }

    /// L2 view of the result surface.
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn set_l2_result(&mut self, surface: &DmaSurface) -> Result<()> {
        self.set("L2.ResultBase", u64::from(surface.base))?;
        self.set("L2.ResultChannelStride", u64::from(surface.strides.plane))?;
        self.set("L2.ResultRowStride", u64::from(surface.strides.row))
    }

    // ── NE ───────────────────────────────────────────────────────────────────

    /// Activation selector and its scalar parameters.
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn set_activation(&mut self, activation: &Activation) -> Result<()> {
        self.set("NE.MACCfg.NonlinearMode", activation.kind.code())?;
        self.set("NE.ActParamA", f16_bits(activation.a))?;
        self.set("NE.ActParamB", f16_bits(activation.b))
    }

    /// Activation as stored.
    ///
    /// # Errors
    ///
    /// Returns `UnknownActivation` for an unrecognised selector.
    pub fn activation(&self) -> Result<Activation> {
        Ok(Activation {
            kind: ActivationKind::from_code(self.get("NE.MACCfg.NonlinearMode")?)?,
            a: f16_value(self.get("NE.ActParamA")?),
            b: f16_value(self.get("NE.ActParamB")?),
        })
    }

    /// Scalar accumulator bias (enables bias mode).
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn set_bias(&mut self, bias: f32) -> Result<()> {
        self.set("NE.MACCfg.BiasMode", 1)?;
        self.set("NE.AccBias", f16_bits(bias))
    }

    /// Scalar post-scale (enables post-scale mode).
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn set_post_scale(&mut self, scale: f32) -> Result<()> {
        self.set("NE.MACCfg.PostScaleMode", 1)?;
        self.set("NE.PostScale", f16_bits(scale))
    }

    /// Attach a lookup-table payload and record its length.
    ///
    /// # Errors
    ///
    /// Returns `FieldOverflow` if the LUT has more entries than
    /// `NE.LutEntries` can describe.
    pub fn attach_lut(&mut self, lut: Lut) -> Result<()> {
        self.set("NE.LutEntries", lut.len() as u64)?;
        self.lut = Some(lut);
        Ok(())
    }

    /// Attached lookup table.
    #[must_use]
    pub fn lut(&self) -> Option<&Lut> {
        self.lut.as_ref()
    }

    // ── Validation ───────────────────────────────────────────────────────────

    /// Structural checks run before a record is serialized.
    ///
    /// # Errors
    ///
    /// - `InvalidStride` if any stride field is not a multiple of 0x40
    /// - `UnsupportedDType` if a format field is outside {uint8, int8, float16}
    /// - `UnknownActivation` if the selector is not recognised
    /// - `MissingLut` if the LUT activation is selected without a payload
    pub fn validate(&self) -> Result<()> {
        for field in self.table.iter().filter(|f| f.name.contains("Stride")) {
            let value = bitfield::unpack(&self.bytes[..], field);
            if value % STRIDE_ALIGN != 0 {
                return Err(ChipError::InvalidStride {
                    field: field.qualified_name(),
                    value,
                });
            }
        }

        for name in DTYPE_FIELDS {
            if let Some(field) = self.table.get(name) {
                DType::from_code(name, bitfield::unpack(&self.bytes[..], field))?;
            }
        }

        if let Some(field) = self.table.get("NE.MACCfg.NonlinearMode") {
            let kind = ActivationKind::from_code(bitfield::unpack(&self.bytes[..], field))?;
            if kind.needs_lut() && self.lut.is_none() {
                return Err(ChipError::MissingLut);
            }
        }

        Ok(())
    }
}

impl Default for TileDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for TileDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes && self.lut == other.lut
    }
}

impl fmt::Debug for TileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileDescriptor")
            .field("tid", &self.get("Header.TID").ok())
            .field("next", &format_args!("{:#x}", self.next_pointer().unwrap_or(0)))
            .field("nonzero_fields", &self.fields().count())
            .field("lut", &self.lut.as_ref().map(Lut::len))
            .finish_non_exhaustive()
    }
}
