// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for register-level operations

use thiserror::Error;

/// Result type alias for register-level operations
pub type Result<T> = std::result::Result<T, ChipError>;

/// Structural errors raised while encoding or validating a Tile Descriptor.
///
/// None of these are ever coerced: a value that does not fit is reported,
/// not truncated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChipError {
    /// Value does not fit in the field's bit width
    #[error("{field}: value {value} does not fit in {width} bit(s)")]
    FieldOverflow {
        /// Qualified field name
        field: String,
        /// Offending value (as written by the caller)
        value: i128,
        /// Field width in bits
        width: u8,
    },

    /// Stride is not a multiple of the DMA alignment (0x40)
    #[error("{field}: stride {value:#x} is not a multiple of 0x40")]
    InvalidStride {
        /// Qualified field name
        field: String,
        /// Offending stride
        value: u64,
    },

    /// Data-type code outside {uint8, int8, float16}
    #[error("{field}: unsupported data type code {code}")]
    UnsupportedDType {
        /// Qualified field name
        field: String,
        /// Raw code
        code: u64,
    },

    /// Activation selector is not a recognised value
    #[error("unknown activation selector {code}")]
    UnknownActivation {
        /// Raw selector
        code: u64,
    },

    /// Lookup-table activation selected without a LUT payload
    #[error("lookup-table activation selected but no LUT payload is attached")]
    MissingLut,

    /// Field name not present in the register table
    #[error("unknown register field: {name}")]
    UnknownField {
        /// Name that was looked up
        name: String,
    },

    /// Kernel DMA channel index out of range
    #[error("kernel DMA channel {channel} out of range (max {max})")]
    ChannelOutOfRange {
        /// Requested channel
        channel: usize,
        /// Number of channels
        max: usize,
    },

    /// Register table failed validation
    #[error("invalid register table: {reason}")]
    InvalidTable {
        /// Reason for failure
        reason: String,
    },
}

impl ChipError {
    /// Create a field overflow error
    pub fn field_overflow(field: impl Into<String>, value: i128, width: u8) -> Self {
        Self::FieldOverflow {
            field: field.into(),
            value,
            width,
        }
    }

    /// Create an unknown field error
    pub fn unknown_field(name: impl Into<String>) -> Self {
        Self::UnknownField { name: name.into() }
    }

    /// Create an invalid table error
    pub fn invalid_table(reason: impl Into<String>) -> Self {
        Self::InvalidTable {
            reason: reason.into(),
        }
    }
}
