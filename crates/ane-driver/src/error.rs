// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for session and service operations

use ane_hwx::HwxError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, AneError>;

/// Errors that can occur while talking to an accelerator service
#[derive(Debug, Error)]
pub enum AneError {
    /// Service unreachable or capability not entitled
    #[error("Device unavailable: {reason}")]
    DeviceUnavailable {
        /// Reason for failure
        reason: String,
    },

    /// Operation not allowed in the session's capability mode
    #[error("{operation} is not available in {mode} mode")]
    ModeMismatch {
        /// Operation attempted
        operation: &'static str,
        /// Mode the session was opened in
        mode: String,
    },

    /// Operation not allowed in the current session state
    #[error("Session in invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// A request is already pending
    #[error("Session busy: request {request_id} is pending")]
    SessionBusy {
        /// Pending request
        request_id: u64,
    },

    /// Completion not delivered in time
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Service reported a failure for the request
    #[error("Device error: {reason}")]
    DeviceError {
        /// Reason for failure
        reason: String,
    },

    /// Session closed while the request was pending
    #[error("Request {request_id} cancelled")]
    Cancelled {
        /// Cancelled request
        request_id: u64,
    },

    /// Program rejected by the container codec
    #[error("Invalid container: {source}")]
    InvalidContainer {
        /// Underlying container error
        #[from]
        source: HwxError,
    },

    /// A surface does not match what the program declares
    #[error("Surface {index}: {reason}")]
    InvalidSurface {
        /// Surface position in the request
        index: usize,
        /// Reason for failure
        reason: String,
    },

    /// Request does not fit the fixed request record
    #[error("Request needs {needed} surfaces, at most {max} fit")]
    RequestTooLarge {
        /// Surfaces required
        needed: usize,
        /// Surfaces allowed
        max: usize,
    },

    /// External compiler failed
    #[error("Compiler {} failed: {reason}", compiler.display())]
    CompilerFailed {
        /// Compiler binary
        compiler: PathBuf,
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
}

impl AneError {
    /// Create a device unavailable error
    pub fn device_unavailable(reason: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a device error
    pub fn device_error(reason: impl Into<String>) -> Self {
        Self::DeviceError {
            reason: reason.into(),
        }
    }

    /// Create an invalid surface error
    pub fn invalid_surface(index: usize, reason: impl Into<String>) -> Self {
        Self::InvalidSurface {
            index,
            reason: reason.into(),
        }
    }

    /// Create a compiler failure
    pub fn compiler_failed(compiler: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CompilerFailed {
            compiler: compiler.into(),
            reason: reason.into(),
        }
    }

    /// Stable process exit code for this error kind.
    ///
    /// Session and device kinds share 5; container errors keep the code of
    /// the wrapped [`HwxError`].
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::DeviceUnavailable { .. }
            | Self::ModeMismatch { .. }
            | Self::InvalidState { .. }
            | Self::SessionBusy { .. }
            | Self::Timeout { .. }
            | Self::DeviceError { .. }
            | Self::Cancelled { .. }
            | Self::InvalidSurface { .. }
            | Self::RequestTooLarge { .. } => 5,
            Self::InvalidContainer { source } => source.exit_code(),
            Self::Io { .. } => 6,
            Self::CompilerFailed { .. } => 7,
        }
    }
}
