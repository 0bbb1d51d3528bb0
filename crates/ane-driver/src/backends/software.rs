// SPDX-License-Identifier: AGPL-3.0-only

//! Software (virtual ANE) service
//!
//! Implements [`AneService`] on worker threads so the session protocol can
//! be exercised without a device. Execution is loopback: each output surface
//! is filled by cycling through the concatenated input bytes. Compile
//! requests take a JSON network description and run the in-crate assembler.
//!
//! Knobs reproduce the failure modes a real service exhibits:
//!
//! | Knob | Effect |
//! |------|--------|
//! | `with_latency` | delay before each completion |
//! | `stalled` | requests are accepted and never completed |
//! | `failing` | every request completes with `DeviceError` |
//! | `without_entitlement` | `open` refuses that capability mode |
//! | `unreachable` | `open` always fails |

use crate::completion::{Completer, RequestOutput};
use crate::error::{AneError, Result};
use crate::request::{RequestRecord, SurfaceRef, REQUEST_SIZE};
use crate::service::{AneService, CapabilityMode, ProgramHandle, ServiceHandle};
use crate::surface::SharedSurface;
use ane_hwx::{Assembler, HwxContainer, Network};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Name reported by the software assembler when a compile fails.
const SOFTWARE_COMPILER: &str = "ane-hwx assembler";

/// Software (virtual ANE) service.
#[derive(Debug, Default)]
pub struct SoftwareService {
    latency: Duration,
    stalled: bool,
    fault: Option<String>,
    unentitled: HashSet<CapabilityMode>,
    unreachable: bool,

    next_handle: AtomicU32,
    connections: Mutex<HashMap<ServiceHandle, CapabilityMode>>,
    programs: Mutex<HashMap<ProgramHandle, (ServiceHandle, Arc<HwxContainer>)>>,
    /// Completers of stalled requests by connection; dropping them reports
    /// a device error.
    parked: Mutex<Vec<(ServiceHandle, Completer)>>,
}

impl SoftwareService {
    /// Service that completes every request immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every completion by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Accept requests but never complete them.
    #[must_use]
    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    /// Complete every request with a device error.
    #[must_use]
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.fault = Some(reason.into());
        self
    }

    /// Refuse connections in `mode`.
    #[must_use]
    pub fn without_entitlement(mut self, mode: CapabilityMode) -> Self {
        self.unentitled.insert(mode);
        self
    }

    /// Refuse every connection.
    #[must_use]
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Number of loaded programs.
    pub fn program_count(&self) -> usize {
        self.programs.lock().len()
    }

    /// Number of stalled requests still held.
    pub fn parked_count(&self) -> usize {
        self.parked.lock().len()
    }

    fn next_id(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn connection_mode(&self, connection: ServiceHandle) -> Result<CapabilityMode> {
        self.connections
            .lock()
            .get(&connection)
            .copied()
            .ok_or_else(|| AneError::invalid_state(format!("connection {} is not open", connection.id())))
    }

    fn expect_mode(&self, connection: ServiceHandle, wanted: CapabilityMode, operation: &'static str) -> Result<()> {
        let mode = self.connection_mode(connection)?;
        if mode == wanted {
            Ok(())
        } else {
            Err(AneError::ModeMismatch {
                operation,
                mode: mode.to_string(),
            })
        }
    }

    /// Hand the work to a worker thread, or park it when stalled.
    fn dispatch<F>(&self, connection: ServiceHandle, completer: Completer, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<RequestOutput> + Send + 'static,
    {
        if self.stalled {
            debug!("SoftwareService: parking request {}", completer.request_id());
            self.parked.lock().push((connection, completer));
            return Ok(());
        }

        let latency = self.latency;
        let fault = self.fault.clone();
        thread::Builder::new()
            .name(format!("ane-sw-{}", completer.request_id()))
            .spawn(move || {
                if !latency.is_zero() {
                    thread::sleep(latency);
                }
                let outcome = match fault {
                    Some(reason) => Err(AneError::device_error(reason)),
                    None => work(),
                };
                completer.complete(outcome);
            })?;
        Ok(())
    }
}

fn check_refs(what: &str, refs: &[SurfaceRef], surfaces: &[SharedSurface]) -> Result<()> {
    if refs.len() != surfaces.len() {
        return Err(AneError::device_error(format!(
            "request lists {} {what} surfaces, {} supplied",
            refs.len(),
            surfaces.len()
        )));
    }
    for (index, (r, s)) in refs.iter().zip(surfaces).enumerate() {
        if r.id != s.id() || r.size != s.len() as u64 {
            return Err(AneError::invalid_surface(
                index,
                format!("{what} surface {} does not match the request record", s.id()),
            ));
        }
    }
    Ok(())
}

/// Fill every output by cycling through the concatenated inputs.
fn loopback(request_id: u64, inputs: Vec<SharedSurface>, mut outputs: Vec<SharedSurface>) -> RequestOutput {
    let source: Vec<u8> = inputs.iter().flat_map(|s| s.as_slice().iter().copied()).collect();
    if !source.is_empty() {
        for out in &mut outputs {
            for (dst, &src) in out.as_mut_slice().iter_mut().zip(source.iter().cycle()) {
                *dst = src;
            }
        }
    }
    RequestOutput {
        request_id,
        inputs,
        outputs,
    }
}

fn compile_description(request_id: u64, description: SharedSurface) -> Result<RequestOutput> {
    let failed = |reason: String| AneError::compiler_failed(SOFTWARE_COMPILER, reason);
    let text = std::str::from_utf8(description.as_slice())
        .map_err(|e| failed(format!("description is not UTF-8: {e}")))?;
    let network = Network::from_json(text).map_err(|e| failed(e.to_string()))?;
    let program = Assembler::default()
        .assemble(&network)
        .map_err(|e| failed(e.to_string()))?;
    Ok(RequestOutput {
        request_id,
        inputs: vec![description],
        outputs: vec![SharedSurface::from_bytes(program.write())],
    })
}

impl AneService for SoftwareService {
    fn name(&self) -> &str {
        "software"
    }

    fn open(&self, mode: CapabilityMode) -> Result<ServiceHandle> {
        if self.unreachable {
            return Err(AneError::device_unavailable("software service is not reachable"));
        }
        if self.unentitled.contains(&mode) {
            return Err(AneError::device_unavailable(format!("{mode} capability is not entitled")));
        }
        let handle = ServiceHandle::new(self.next_id());
        self.connections.lock().insert(handle, mode);
        info!("SoftwareService: connection {} opened ({mode})", handle.id());
        Ok(handle)
    }

    fn load(&self, connection: ServiceHandle, program: &HwxContainer) -> Result<ProgramHandle> {
        self.expect_mode(connection, CapabilityMode::ProgramExecution, "load")?;
        let handle = ProgramHandle::new(self.next_id());
        self.programs
            .lock()
            .insert(handle, (connection, Arc::new(program.clone())));
        info!(
            "SoftwareService: program {} loaded ({} records, {} inputs, {} outputs)",
            handle.id(),
            program.len(),
            program.inputs().len(),
            program.outputs().len()
        );
        Ok(handle)
    }

    fn submit(
        &self,
        connection: ServiceHandle,
        request: &[u8; REQUEST_SIZE],
        inputs: Vec<SharedSurface>,
        outputs: Vec<SharedSurface>,
        completer: Completer,
    ) -> Result<()> {
        self.expect_mode(connection, CapabilityMode::ProgramExecution, "submit")?;
        let record = RequestRecord::decode(request)?;
        if record.compile {
            return Err(AneError::device_error("compile request submitted for execution"));
        }
        let known = self
            .programs
            .lock()
            .get(&ProgramHandle::new(record.program))
            .is_some_and(|(owner, _)| *owner == connection);
        if !known {
            return Err(AneError::invalid_state(format!("program {} is not loaded", record.program)));
        }
        check_refs("input", &record.inputs, &inputs)?;
        check_refs("output", &record.outputs, &outputs)?;

        let request_id = record.request_id;
        debug!("SoftwareService: request {request_id} queued for program {}", record.program);
        self.dispatch(connection, completer, move || Ok(loopback(request_id, inputs, outputs)))
    }

    fn compile(
        &self,
        connection: ServiceHandle,
        request: &[u8; REQUEST_SIZE],
        description: SharedSurface,
        completer: Completer,
    ) -> Result<()> {
        self.expect_mode(connection, CapabilityMode::CompileOnly, "compile")?;
        let record = RequestRecord::decode(request)?;
        if !record.compile {
            return Err(AneError::device_error("execution request submitted for compile"));
        }
        check_refs("input", &record.inputs, std::slice::from_ref(&description))?;

        let request_id = record.request_id;
        debug!("SoftwareService: compile request {request_id} queued ({} bytes)", description.len());
        self.dispatch(connection, completer, move || compile_description(request_id, description))
    }

    fn close(&self, connection: ServiceHandle) {
        if self.connections.lock().remove(&connection).is_some() {
            self.programs.lock().retain(|_, (owner, _)| *owner != connection);
            let released = {
                let mut parked = self.parked.lock();
                let (mine, rest): (Vec<_>, Vec<_>) = parked.drain(..).partition(|(owner, _)| *owner == connection);
                *parked = rest;
                mine
            };
            if !released.is_empty() {
                debug!(
                    "SoftwareService: releasing {} stalled request(s) of connection {}",
                    released.len(),
                    connection.id()
                );
            }
            drop(released);
            info!("SoftwareService: connection {} closed", connection.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::channel;

    fn record(request_id: u64, program: u32, inputs: &[SharedSurface], outputs: &[SharedSurface]) -> [u8; REQUEST_SIZE] {
        let refs = |s: &[SharedSurface]| {
            s.iter()
                .map(|s| SurfaceRef { id: s.id(), size: s.len() as u64 })
                .collect()
        };
        RequestRecord {
            request_id,
            program,
            compile: false,
            inputs: refs(inputs),
            outputs: refs(outputs),
        }
        .encode()
        .unwrap()
    }

    fn relu_program() -> HwxContainer {
        use ane_chip::{Activation, ActivationKind, DType, TensorDesc, TensorShape};
        use ane_hwx::{OpKind, OpRequest, Operand};
        let t = TensorDesc::new(TensorShape::from_dims([1, 1, 1, 1, 32]), DType::Float16);
        let network = Network {
            inputs: vec![t],
            ops: vec![OpRequest::new(OpKind::Activation, vec![Operand::Input(0)], t)
                .with_activation(Activation::of(ActivationKind::Relu))],
        };
        Assembler::default().assemble(&network).unwrap()
    }

    #[test]
    fn loopback_cycles_inputs() {
        let out = loopback(
            1,
            vec![SharedSurface::from_bytes([1, 2]), SharedSurface::from_bytes([3])],
            vec![SharedSurface::zeroed(7)],
        );
        assert_eq!(out.outputs[0].as_slice(), &[1, 2, 3, 1, 2, 3, 1]);
        assert_eq!(out.inputs.len(), 2);
    }

    #[test]
    fn entitlement_and_reachability() {
        let svc = SoftwareService::new().without_entitlement(CapabilityMode::CompileOnly);
        assert!(matches!(
            svc.open(CapabilityMode::CompileOnly),
            Err(AneError::DeviceUnavailable { .. })
        ));
        assert!(svc.open(CapabilityMode::ProgramExecution).is_ok());
        assert!(SoftwareService::new().unreachable().open(CapabilityMode::ProgramExecution).is_err());
    }

    #[test]
    fn submit_requires_loaded_program() {
        let svc = SoftwareService::new();
        let conn = svc.open(CapabilityMode::ProgramExecution).unwrap();
        let (completer, _handle) = channel(1);
        let raw = record(1, 99, &[], &[]);
        assert!(matches!(
            svc.submit(conn, &raw, Vec::new(), Vec::new(), completer),
            Err(AneError::InvalidState { .. })
        ));
    }

    #[test]
    fn close_releases_programs() {
        let svc = SoftwareService::new();
        let conn = svc.open(CapabilityMode::ProgramExecution).unwrap();
        svc.load(conn, &relu_program()).unwrap();
        assert_eq!(svc.program_count(), 1);
        svc.close(conn);
        assert_eq!(svc.program_count(), 0);
        assert_eq!(svc.connection_count(), 0);
    }

    #[test]
    fn close_releases_stalled_requests() {
        let svc = SoftwareService::new().stalled();
        let conn = svc.open(CapabilityMode::ProgramExecution).unwrap();
        let other = svc.open(CapabilityMode::ProgramExecution).unwrap();
        let program = svc.load(conn, &relu_program()).unwrap();
        let theirs = svc.load(other, &relu_program()).unwrap();

        let mut handles = Vec::new();
        for (request_id, owner, handle) in [(1, conn, program), (2, conn, program), (3, other, theirs)] {
            let inputs = vec![SharedSurface::zeroed(64).with_id(request_id * 10)];
            let outputs = vec![SharedSurface::zeroed(64).with_id(request_id * 10 + 1)];
            let raw = record(request_id, handle.id(), &inputs, &outputs);
            let (completer, waiter) = channel(request_id);
            svc.submit(owner, &raw, inputs, outputs, completer).unwrap();
            handles.push(waiter);
        }
        assert_eq!(svc.parked_count(), 3);

        svc.close(conn);
        assert_eq!(svc.parked_count(), 1);
        let mut handles = handles.into_iter();
        for waiter in handles.by_ref().take(2) {
            assert!(matches!(waiter.wait(Duration::from_secs(1)), Err(AneError::DeviceError { .. })));
        }
        assert!(!handles.next().unwrap().is_ready());
    }

    #[test]
    fn compile_reports_bad_descriptions() {
        let svc = SoftwareService::new();
        let conn = svc.open(CapabilityMode::CompileOnly).unwrap();
        let description = SharedSurface::from_bytes(b"{\"inputs\": 1}").with_id(1);
        let raw = RequestRecord {
            request_id: 5,
            program: 0,
            compile: true,
            inputs: vec![SurfaceRef { id: 1, size: description.len() as u64 }],
            outputs: Vec::new(),
        }
        .encode()
        .unwrap();
        let (completer, handle) = channel(5);
        svc.compile(conn, &raw, description, completer).unwrap();
        assert!(matches!(
            handle.wait(Duration::from_secs(5)),
            Err(AneError::CompilerFailed { .. })
        ));
    }
}
