// SPDX-License-Identifier: AGPL-3.0-only

//! Tensor descriptors: 5-D shape plus element type.
//!
//! Axis names follow the DMA engine: `column` is innermost (contiguous),
//! then `row`, `plane` (channel), `depth`, and `group` (batch) outermost.

use crate::error::{ChipError, Result};
use half::f16;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type accepted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// Unsigned 8-bit integer.
    UInt8,
    /// Signed 8-bit integer.
    Int8,
    /// IEEE 754 half precision.
    Float16,
}

impl DType {
    /// Encoding used by the `ChCfg` format fields.
    #[must_use]
    pub const fn code(self) -> u64 {
        match self {
            Self::UInt8 => 0,
            Self::Int8 => 1,
            Self::Float16 => 2,
        }
    }

    /// Decode a format field value.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedDType` for any code outside the closed set.
    pub fn from_code(field: &str, code: u64) -> Result<Self> {
        match code {
            0 => Ok(Self::UInt8),
            1 => Ok(Self::Int8),
            2 => Ok(Self::Float16),
            _ => Err(ChipError::UnsupportedDType {
                field: field.to_string(),
                code,
            }),
        }
    }

    /// Bytes per element.
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::UInt8 | Self::Int8 => 1,
            Self::Float16 => 2,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UInt8 => write!(f, "uint8"),
            Self::Int8 => write!(f, "int8"),
            Self::Float16 => write!(f, "float16"),
        }
    }
}

/// Logical 5-D shape.
///
/// Serialized outermost first: `[group, depth, plane, row, column]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u32; 5]", into = "[u32; 5]")]
pub struct TensorShape {
    /// Innermost axis (width).
    pub column: u32,
    /// Height.
    pub row: u32,
    /// Channels.
    pub plane: u32,
    /// Depth.
    pub depth: u32,
    /// Batch / group, outermost.
    pub group: u32,
}

impl TensorShape {
    /// Build from `[group, depth, plane, row, column]`.
    #[must_use]
    pub const fn from_dims(dims: [u32; 5]) -> Self {
        Self {
            group: dims[0],
            depth: dims[1],
            plane: dims[2],
            row: dims[3],
            column: dims[4],
        }
    }

    /// `[group, depth, plane, row, column]`.
    #[must_use]
    pub const fn dims(&self) -> [u32; 5] {
        [self.group, self.depth, self.plane, self.row, self.column]
    }

    /// Total element count.
    #[must_use]
    pub fn element_count(&self) -> u64 {
        self.dims().iter().map(|&d| u64::from(d)).product()
    }
}

impl From<[u32; 5]> for TensorShape {
    fn from(dims: [u32; 5]) -> Self {
        Self::from_dims(dims)
    }
}

impl From<TensorShape> for [u32; 5] {
    fn from(shape: TensorShape) -> Self {
        shape.dims()
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [g, d, p, r, c] = self.dims();
        write!(f, "({g},{d},{p},{r},{c})")
    }
}

/// Shape plus element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDesc {
    /// Logical shape.
    pub shape: TensorShape,
    /// Element type.
    pub dtype: DType,
}

impl TensorDesc {
    /// Create a descriptor.
    #[must_use]
    pub const fn new(shape: TensorShape, dtype: DType) -> Self {
        Self { shape, dtype }
    }

    /// Unpadded size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.shape.element_count() * self.dtype.size_bytes() as u64
    }
}

/// Down-convert float32 values to little-endian float16 bytes.
///
/// Lossy and one-way: values outside the float16 range saturate to infinity
/// and mantissa bits are rounded away. There is no inverse in this crate.
#[must_use]
pub fn f32_to_f16_bytes(values: &[f32]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|&v| f16::from_f32(v).to_le_bytes())
        .collect()
}

/// Raw float16 bits for a single scalar parameter.
#[must_use]
pub fn f16_bits(value: f32) -> u64 {
    u64::from(f16::from_f32(value).to_bits())
}

/// Scalar parameter back from its float16 bits.
#[must_use]
pub fn f16_value(bits: u64) -> f32 {
    #[allow(clippy::cast_possible_truncation)]
    let raw = bits as u16;
    f16::from_bits(raw).to_f32()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_codes_are_closed() {
        for dtype in [DType::UInt8, DType::Int8, DType::Float16] {
            assert_eq!(DType::from_code("f", dtype.code()).unwrap(), dtype);
        }
        assert!(matches!(
            DType::from_code("Common.ChCfg.InFmt", 3),
            Err(ChipError::UnsupportedDType { code: 3, .. })
        ));
    }

    #[test]
    fn shape_order_is_outermost_first() {
        let s = TensorShape::from_dims([1, 1, 1, 1, 64]);
        assert_eq!(s.column, 64);
        assert_eq!(s.group, 1);
        assert_eq!(s.element_count(), 64);
        assert_eq!(TensorDesc::new(s, DType::Float16).byte_size(), 128);
        assert_eq!(s.to_string(), "(1,1,1,1,64)");
    }

    #[test]
    fn shape_serializes_as_array() {
        let desc = TensorDesc::new(TensorShape::from_dims([1, 2, 3, 4, 5]), DType::Int8);
        let json = serde_json::to_string(&desc).unwrap();
        assert_eq!(json, r#"{"shape":[1,2,3,4,5],"dtype":"int8"}"#);
        let back: TensorDesc = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn f32_down_conversion_is_lossy() {
        let bytes = f32_to_f16_bytes(&[1.0, 0.1, 1.0e6]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[0..2], &[0x00, 0x3C]);
        let back = f16::from_le_bytes([bytes[2], bytes[3]]).to_f32();
        assert!((back - 0.1).abs() < 1e-3);
        assert_ne!(back, 0.1);
        assert!(f16::from_le_bytes([bytes[4], bytes[5]]).is_infinite());
    }

    #[test]
    fn scalar_params_round_trip_through_half() {
        assert!((f16_value(f16_bits(0.25)) - 0.25).abs() < f32::EPSILON);
        assert_eq!(f16_bits(1.0), 0x3C00);
    }
}
