// SPDX-License-Identifier: AGPL-3.0-only

//! Accelerator service abstraction
//!
//! A service is the external collaborator that owns the device: it accepts
//! connections in one capability mode, loads programs, and executes request
//! records, reporting each outcome through a [`Completer`].

use crate::completion::Completer;
use crate::error::Result;
use crate::request::REQUEST_SIZE;
use crate::surface::SharedSurface;
use ane_hwx::HwxContainer;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Capability selected when a session is opened. Fixed for the session's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityMode {
    /// Compile network descriptions into programs.
    CompileOnly,
    /// Load and execute programs.
    ProgramExecution,
}

impl fmt::Display for CapabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CompileOnly => write!(f, "compile-only"),
            Self::ProgramExecution => write!(f, "program-execution"),
        }
    }
}

/// Connection handle issued by [`AneService::open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle(u32);

impl ServiceHandle {
    /// Create new connection handle
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get connection ID
    pub const fn id(&self) -> u32 {
        self.0
    }
}

/// Program handle returned after loading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(u32);

impl ProgramHandle {
    /// Create new program handle
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get program ID
    pub const fn id(&self) -> u32 {
        self.0
    }
}

/// Accelerator service trait
///
/// `submit` and `compile` must not block on the work itself: they queue the
/// request and return, and the outcome arrives later through the completer.
pub trait AneService: Debug + Send + Sync {
    /// Service name for logging
    fn name(&self) -> &str;

    /// Open a connection in `mode`
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the service cannot be reached or the
    /// capability is not entitled.
    fn open(&self, mode: CapabilityMode) -> Result<ServiceHandle>;

    /// Load a validated program
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or cannot execute.
    fn load(&self, connection: ServiceHandle, program: &HwxContainer) -> Result<ProgramHandle>;

    /// Queue an execution request
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be queued; once queued, every
    /// failure is reported through `completer`.
    fn submit(
        &self,
        connection: ServiceHandle,
        request: &[u8; REQUEST_SIZE],
        inputs: Vec<SharedSurface>,
        outputs: Vec<SharedSurface>,
        completer: Completer,
    ) -> Result<()>;

    /// Queue a compile request; the program is delivered as the single
    /// output surface
    ///
    /// # Errors
    ///
    /// Same contract as [`AneService::submit`].
    fn compile(
        &self,
        connection: ServiceHandle,
        request: &[u8; REQUEST_SIZE],
        description: SharedSurface,
        completer: Completer,
    ) -> Result<()>;

    /// Release a connection and any programs loaded through it
    fn close(&self, connection: ServiceHandle);
}
