// SPDX-License-Identifier: AGPL-3.0-only

//! Execution sessions
//!
//! ```text
//! Closed → Opened ──load──→ ProgramLoaded ─┐
//!        └→ CompileReady ─────────────────┤
//!                                          submit
//!                                          ↓
//!               Completed ←─wait── Pending ──wait──→ Failed
//! ```
//!
//! A session is opened in one [`CapabilityMode`] and keeps it until it is
//! closed. At most one request is pending at a time; it stays pending until
//! its outcome is consumed through [`Session::wait`] or its handle. After
//! `Completed` the session accepts new requests; after `Failed` only
//! [`Session::close`] is accepted. Closing cancels a pending request and
//! wakes whoever is waiting on it.

use crate::completion::{self, CompletionHandle, RequestOutput, Slot, SlotStatus};
use crate::config::SessionConfig;
use crate::error::{AneError, Result};
use crate::request::{RequestRecord, SurfaceRef};
use crate::service::{AneService, CapabilityMode, ProgramHandle, ServiceHandle};
use crate::surface::SharedSurface;
use ane_hwx::HwxContainer;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Released
    Closed,
    /// Connected for execution, no program yet
    Opened,
    /// Connected for compilation
    CompileReady,
    /// Program loaded, ready to submit
    ProgramLoaded,
    /// A request is outstanding
    Pending,
    /// Last request succeeded
    Completed,
    /// Last request failed; only close is accepted
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opened => "opened",
            Self::CompileReady => "compile-ready",
            Self::ProgramLoaded => "program-loaded",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct LoadedProgram {
    handle: ProgramHandle,
    inputs: Vec<u64>,
    outputs: Vec<u64>,
}

/// One open connection to an accelerator service.
#[derive(Debug)]
pub struct Session {
    service: Arc<dyn AneService>,
    connection: ServiceHandle,
    mode: CapabilityMode,
    config: SessionConfig,
    state: SessionState,
    program: Option<LoadedProgram>,
    pending: Option<Arc<Slot>>,
    next_request: u64,
    next_surface: u64,
}

impl Session {
    /// Open a session in `mode`.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the service refuses the connection.
    pub fn open(service: Arc<dyn AneService>, mode: CapabilityMode, config: SessionConfig) -> Result<Self> {
        let connection = service.open(mode)?;
        info!(
            "Session {} opened on {} service ({mode})",
            connection.id(),
            service.name()
        );
        let state = match mode {
            CapabilityMode::CompileOnly => SessionState::CompileReady,
            CapabilityMode::ProgramExecution => SessionState::Opened,
        };
        Ok(Self {
            service,
            connection,
            mode,
            config,
            state,
            program: None,
            pending: None,
            next_request: 1,
            next_surface: 1,
        })
    }

    /// Capability mode selected at open.
    pub const fn mode(&self) -> CapabilityMode {
        self.mode
    }

    /// Configuration in use.
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current state, including an outcome consumed through a handle.
    pub fn state(&self) -> SessionState {
        match (&self.pending, self.state) {
            (Some(slot), SessionState::Pending) => match slot.status() {
                SlotStatus::Pending => SessionState::Pending,
                SlotStatus::Succeeded => SessionState::Completed,
                SlotStatus::Failed => SessionState::Failed,
                SlotStatus::Cancelled => SessionState::Closed,
            },
            (_, state) => state,
        }
    }

    fn settle(&mut self) {
        let state = self.state();
        if state != SessionState::Pending {
            self.pending = None;
        }
        self.state = state;
    }

    fn require_mode(&self, wanted: CapabilityMode, operation: &'static str) -> Result<()> {
        if self.mode == wanted {
            Ok(())
        } else {
            Err(AneError::ModeMismatch {
                operation,
                mode: self.mode.to_string(),
            })
        }
    }

    /// Common gate for submit and compile: not busy, not failed, in one of `ready`.
    fn require_idle(&mut self, ready: &[SessionState]) -> Result<()> {
        self.settle();
        match self.state {
            SessionState::Pending => Err(AneError::SessionBusy {
                request_id: self.pending.as_ref().map_or(0, |slot| slot.request_id()),
            }),
            SessionState::Failed => Err(AneError::invalid_state("failed; only close is accepted")),
            state if ready.contains(&state) => Ok(()),
            state => Err(AneError::invalid_state(state.to_string())),
        }
    }

    fn surface_id(&mut self) -> u64 {
        let id = self.next_surface;
        self.next_surface += 1;
        id
    }

    fn request_id(&mut self) -> u64 {
        let id = self.next_request;
        self.next_request += 1;
        id
    }

    /// Parse, validate and load a program.
    ///
    /// # Errors
    ///
    /// - `ModeMismatch` in compile-only mode
    /// - `InvalidContainer` if the bytes do not parse or validate
    /// - `InvalidState` while a request is pending or after a failure
    pub fn load_program(&mut self, bytes: &[u8]) -> Result<()> {
        self.require_mode(CapabilityMode::ProgramExecution, "load_program")?;
        let program = HwxContainer::read(bytes)?;
        self.load_container(&program)
    }

    /// Load a program from a file.
    ///
    /// # Errors
    ///
    /// As [`Session::load_program`], plus `Io`.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.require_mode(CapabilityMode::ProgramExecution, "load_program")?;
        let bytes = std::fs::read(path)?;
        self.load_program(&bytes)
    }

    /// Load an already parsed program.
    ///
    /// # Errors
    ///
    /// As [`Session::load_program`].
    pub fn load_container(&mut self, program: &HwxContainer) -> Result<()> {
        self.require_mode(CapabilityMode::ProgramExecution, "load_program")?;
        self.require_idle(&[
            SessionState::Opened,
            SessionState::ProgramLoaded,
            SessionState::Completed,
        ])?;
        program.validate()?;

        let handle = self.service.load(self.connection, program)?;
        self.program = Some(LoadedProgram {
            handle,
            inputs: program.inputs().iter().map(|r| r.size).collect(),
            outputs: program.outputs().iter().map(|r| r.size).collect(),
        });
        self.state = SessionState::ProgramLoaded;
        info!("Session {}: program {} loaded", self.connection.id(), handle.id());
        Ok(())
    }

    /// Submit the loaded program with `inputs`. Ownership of the surfaces
    /// passes to the service until the request completes.
    ///
    /// # Errors
    ///
    /// - `ModeMismatch` in compile-only mode
    /// - `InvalidState` before a program is loaded or after a failure
    /// - `SessionBusy` while another request is pending
    /// - `InvalidSurface` if the inputs do not match the program
    /// - `RequestTooLarge` if the surfaces exceed the configured limit
    pub fn submit(&mut self, inputs: Vec<SharedSurface>) -> Result<CompletionHandle> {
        self.require_mode(CapabilityMode::ProgramExecution, "submit")?;
        self.require_idle(&[SessionState::ProgramLoaded, SessionState::Completed])?;
        let Some(program) = &self.program else {
            return Err(AneError::invalid_state("no program loaded"));
        };

        if inputs.len() != program.inputs.len() {
            return Err(AneError::invalid_surface(
                inputs.len().min(program.inputs.len()),
                format!("program takes {} inputs, {} supplied", program.inputs.len(), inputs.len()),
            ));
        }
        for (index, (surface, &size)) in inputs.iter().zip(&program.inputs).enumerate() {
            if surface.len() as u64 != size {
                return Err(AneError::invalid_surface(
                    index,
                    format!("{} bytes, program expects {size}", surface.len()),
                ));
            }
        }
        let needed = program.inputs.len() + program.outputs.len();
        if needed > self.config.surface_limit() {
            return Err(AneError::RequestTooLarge {
                needed,
                max: self.config.surface_limit(),
            });
        }

        let program_handle = program.handle;
        let output_sizes = program.outputs.clone();
        let inputs: Vec<SharedSurface> = inputs.into_iter().map(|s| s.with_id(self.surface_id())).collect();
        let mut outputs = Vec::with_capacity(output_sizes.len());
        for size in output_sizes {
            let size = usize::try_from(size)
                .map_err(|_| AneError::invalid_state(format!("output surface of {size} bytes")))?;
            outputs.push(SharedSurface::zeroed(size).with_id(self.surface_id()));
        }

        let request_id = self.request_id();
        let record = RequestRecord {
            request_id,
            program: program_handle.id(),
            compile: false,
            inputs: refs(&inputs),
            outputs: refs(&outputs),
        };
        let raw = record.encode()?;
        let (completer, handle) = completion::channel(request_id);
        self.service
            .submit(self.connection, &raw, inputs, outputs, completer)?;

        self.pending = Some(handle.slot());
        self.state = SessionState::Pending;
        debug!("Session {}: request {request_id} submitted", self.connection.id());
        Ok(handle)
    }

    /// Submit a network description for compilation. The compiled program
    /// arrives as the single output surface.
    ///
    /// # Errors
    ///
    /// - `ModeMismatch` in program-execution mode
    /// - `SessionBusy` while another request is pending
    /// - `InvalidState` after a failure
    pub fn submit_compile(&mut self, description: &[u8]) -> Result<CompletionHandle> {
        self.require_mode(CapabilityMode::CompileOnly, "submit_compile")?;
        self.require_idle(&[SessionState::CompileReady, SessionState::Completed])?;

        let description = SharedSurface::from_bytes(description).with_id(self.surface_id());
        let request_id = self.request_id();
        let record = RequestRecord {
            request_id,
            program: 0,
            compile: true,
            inputs: refs(std::slice::from_ref(&description)),
            outputs: Vec::new(),
        };
        let raw = record.encode()?;
        let (completer, handle) = completion::channel(request_id);
        self.service
            .compile(self.connection, &raw, description, completer)?;

        self.pending = Some(handle.slot());
        self.state = SessionState::Pending;
        debug!("Session {}: compile request {request_id} submitted", self.connection.id());
        Ok(handle)
    }

    /// Block until the pending request completes or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if `handle` is not the pending request
    /// - `Timeout` or `DeviceError`; the session moves to `Failed`
    pub fn wait(&mut self, handle: CompletionHandle, timeout: Duration) -> Result<RequestOutput> {
        let pending = self.pending.as_ref().map(|slot| slot.request_id());
        if self.state != SessionState::Pending || pending != Some(handle.request_id()) {
            return Err(AneError::invalid_state(format!(
                "request {} is not pending on this session",
                handle.request_id()
            )));
        }

        let outcome = handle.wait(timeout);
        self.settle();
        match &outcome {
            Ok(out) => debug!(
                "Session {}: request {} completed with {} output(s)",
                self.connection.id(),
                out.request_id,
                out.outputs.len()
            ),
            Err(e) => warn!("Session {}: request failed: {e}", self.connection.id()),
        }
        outcome
    }

    /// [`Session::wait`] with the configured timeout.
    ///
    /// # Errors
    ///
    /// As [`Session::wait`].
    pub fn wait_default(&mut self, handle: CompletionHandle) -> Result<RequestOutput> {
        let timeout = self.config.timeout();
        self.wait(handle, timeout)
    }

    /// Release the session from any state. A pending request is cancelled.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(slot) = self.pending.take() {
            if slot.cancel() {
                info!(
                    "Session {}: request {} cancelled by close",
                    self.connection.id(),
                    slot.request_id()
                );
            }
        }
        self.service.close(self.connection);
        self.program = None;
        self.state = SessionState::Closed;
        info!("Session {} closed", self.connection.id());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn refs(surfaces: &[SharedSurface]) -> Vec<SurfaceRef> {
    surfaces
        .iter()
        .map(|s| SurfaceRef {
            id: s.id(),
            size: s.len() as u64,
        })
        .collect()
}
