// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for program assembly and HWX container handling

use ane_chip::{ChipError, TensorShape};
use thiserror::Error;

/// Result type alias for program and container operations
pub type Result<T> = std::result::Result<T, HwxError>;

/// Errors raised while assembling, reading or writing HWX programs
#[derive(Debug, Error)]
pub enum HwxError {
    /// A record failed encoding or validation
    #[error("TD[{index}]: {source}")]
    InvalidRecord {
        /// Position in the emitted sequence
        index: usize,
        /// Underlying structural error
        #[source]
        source: ChipError,
    },

    /// A fusable stage does not match the shape of the stage it would fold into
    #[error("op {index}: cannot fuse, shape {found} does not match {expected}")]
    FusionShapeMismatch {
        /// Operation index in the request sequence
        index: usize,
        /// Output shape of the stage being extended
        expected: TensorShape,
        /// Shape of the candidate stage
        found: TensorShape,
    },

    /// Operand shapes are inconsistent with the operation
    #[error("TD[{index}]: shape mismatch: {reason}")]
    ShapeMismatch {
        /// Position in the emitted sequence
        index: usize,
        /// Reason for failure
        reason: String,
    },

    /// More operands and weight blobs than kernel DMA channels
    #[error("TD[{index}]: needs {needed} kernel DMA channels, only {max} available")]
    ChannelOverflow {
        /// Position in the emitted sequence
        index: usize,
        /// Channels required
        needed: usize,
        /// Channels available
        max: usize,
    },

    /// An L2 residency assumption is not backed by an earlier decision
    #[error("TD[{index}] {port}: {reason}")]
    ResidencyViolation {
        /// Position in the sequence
        index: usize,
        /// Port name
        port: &'static str,
        /// Reason for failure
        reason: String,
    },

    /// Operand reference or arity is invalid
    #[error("op {index}: invalid operand: {reason}")]
    InvalidOperand {
        /// Operation index in the request sequence
        index: usize,
        /// Reason for failure
        reason: String,
    },

    /// A record or blob extends past the end of the buffer
    #[error("container truncated: {what} at {offset:#x} needs {needed} bytes, {len} available")]
    TruncatedContainer {
        /// What was being read
        what: &'static str,
        /// File offset
        offset: u64,
        /// Bytes required from `offset`
        needed: u64,
        /// Buffer length
        len: usize,
    },

    /// The next-offset chain revisits a record
    #[error("next-offset chain revisits record at {offset:#x}")]
    CyclicChain {
        /// File offset of the revisited record
        offset: u64,
    },

    /// Structurally invalid container
    #[error("invalid container: {reason}")]
    InvalidContainer {
        /// Reason for failure
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Network description could not be parsed
    #[error("invalid network description: {source}")]
    Description {
        /// Underlying JSON error
        #[from]
        source: serde_json::Error,
    },
}

impl HwxError {
    /// Attach a record index to a structural error
    pub fn record(index: usize, source: ChipError) -> Self {
        Self::InvalidRecord { index, source }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(index: usize, reason: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            index,
            reason: reason.into(),
        }
    }

    /// Create an invalid operand error
    pub fn invalid_operand(index: usize, reason: impl Into<String>) -> Self {
        Self::InvalidOperand {
            index,
            reason: reason.into(),
        }
    }

    /// Create an invalid container error
    pub fn invalid_container(reason: impl Into<String>) -> Self {
        Self::InvalidContainer {
            reason: reason.into(),
        }
    }

    /// Stable process exit code for this error kind.
    ///
    /// 3 for structural errors, 4 for container errors, 6 for I/O.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidRecord { .. }
            | Self::FusionShapeMismatch { .. }
            | Self::ShapeMismatch { .. }
            | Self::ChannelOverflow { .. }
            | Self::ResidencyViolation { .. }
            | Self::InvalidOperand { .. }
            | Self::Description { .. } => 3,
            Self::TruncatedContainer { .. } | Self::CyclicChain { .. } | Self::InvalidContainer { .. } => 4,
            Self::Io { .. } => 6,
        }
    }

    /// True for errors returned by `read` on malformed input.
    pub fn is_container_error(&self) -> bool {
        self.exit_code() == 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_by_category() {
        assert_eq!(HwxError::record(2, ChipError::MissingLut).exit_code(), 3);
        assert_eq!(HwxError::shape_mismatch(0, "x").exit_code(), 3);
        assert_eq!(HwxError::invalid_operand(0, "x").exit_code(), 3);
        assert_eq!(HwxError::CyclicChain { offset: 0x4000 }.exit_code(), 4);
        assert!(HwxError::invalid_container("x").is_container_error());
        let io = HwxError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "x"));
        assert_eq!(io.exit_code(), 6);
        assert!(!io.is_container_error());
    }
}
