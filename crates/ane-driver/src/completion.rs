// SPDX-License-Identifier: AGPL-3.0-only

//! One-shot completion slots.
//!
//! Every submitted request gets exactly one outcome: the service completes
//! it, the waiter times out, or the session cancels it. Whichever happens
//! first wins; anything delivered later is logged and discarded.

use crate::error::{AneError, Result};
use crate::surface::SharedSurface;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Surfaces returned to the caller when a request completes.
#[derive(Debug)]
pub struct RequestOutput {
    /// Request this output belongs to.
    pub request_id: u64,
    /// Input surfaces, handed back to the caller.
    pub inputs: Vec<SharedSurface>,
    /// Output surfaces written by the service.
    pub outputs: Vec<SharedSurface>,
}

#[derive(Debug)]
enum SlotState {
    Waiting,
    Ready(Result<RequestOutput>),
    Taken { ok: bool },
    TimedOut,
    Cancelled,
}

/// Outcome of a slot as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotStatus {
    /// Not yet consumed by a waiter.
    Pending,
    /// Waiter received outputs.
    Succeeded,
    /// Waiter received an error or timed out.
    Failed,
    /// Session closed first.
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct Slot {
    request_id: u64,
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Slot {
    fn deliver(&self, outcome: Result<RequestOutput>) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Waiting) {
            *state = SlotState::Ready(outcome);
            self.ready.notify_all();
            true
        } else {
            tracing::warn!("request {}: late completion discarded", self.request_id);
            false
        }
    }

    pub(crate) fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Cancel a request nobody has consumed yet; wakes any waiter.
    pub(crate) fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            SlotState::Waiting | SlotState::Ready(_) => {
                *state = SlotState::Cancelled;
                self.ready.notify_all();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn status(&self) -> SlotStatus {
        match *self.state.lock() {
            SlotState::Waiting | SlotState::Ready(_) => SlotStatus::Pending,
            SlotState::Taken { ok: true } => SlotStatus::Succeeded,
            SlotState::Taken { ok: false } | SlotState::TimedOut => SlotStatus::Failed,
            SlotState::Cancelled => SlotStatus::Cancelled,
        }
    }
}

/// Service side of a slot. Dropping it without completing reports a
/// device error.
#[derive(Debug)]
pub struct Completer {
    slot: Arc<Slot>,
    delivered: bool,
}

impl Completer {
    /// Request being completed.
    pub fn request_id(&self) -> u64 {
        self.slot.request_id
    }

    /// Deliver the outcome. Returns `false` if the waiter already timed out
    /// or the request was cancelled.
    pub fn complete(mut self, outcome: Result<RequestOutput>) -> bool {
        self.delivered = true;
        self.slot.deliver(outcome)
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if !self.delivered {
            self.slot
                .deliver(Err(AneError::device_error("service dropped the request")));
        }
    }
}

/// Caller side of a slot, returned by submit.
#[derive(Debug)]
pub struct CompletionHandle {
    slot: Arc<Slot>,
}

impl CompletionHandle {
    /// Request this handle waits for.
    pub fn request_id(&self) -> u64 {
        self.slot.request_id
    }

    /// True once an outcome is available without blocking.
    pub fn is_ready(&self) -> bool {
        !matches!(*self.slot.state.lock(), SlotState::Waiting)
    }

    /// Block until the outcome arrives or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// - `Timeout` if nothing arrives in time; a later completion is discarded
    /// - `Cancelled` if the session was closed
    /// - whatever error the service delivered, typically `DeviceError`
    pub fn wait(self, timeout: Duration) -> Result<RequestOutput> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.slot.state.lock();
        loop {
            match std::mem::replace(&mut *state, SlotState::Waiting) {
                SlotState::Waiting => {
                    let timed_out = match deadline {
                        Some(deadline) if Instant::now() >= deadline => true,
                        Some(deadline) => self.slot.ready.wait_until(&mut state, deadline).timed_out(),
                        None => {
                            self.slot.ready.wait(&mut state);
                            false
                        }
                    };
                    if timed_out && matches!(*state, SlotState::Waiting) {
                        *state = SlotState::TimedOut;
                    }
                }
                SlotState::Ready(outcome) => {
                    *state = SlotState::Taken { ok: outcome.is_ok() };
                    return outcome;
                }
                settled => {
                    let err = match settled {
                        SlotState::TimedOut => AneError::Timeout {
                            duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        },
                        SlotState::Cancelled => AneError::Cancelled {
                            request_id: self.slot.request_id,
                        },
                        _ => AneError::invalid_state("completion already consumed"),
                    };
                    *state = settled;
                    return Err(err);
                }
            }
        }
    }

    pub(crate) fn slot(&self) -> Arc<Slot> {
        Arc::clone(&self.slot)
    }
}

/// Create a connected completer/handle pair.
pub fn channel(request_id: u64) -> (Completer, CompletionHandle) {
    let slot = Arc::new(Slot {
        request_id,
        state: Mutex::new(SlotState::Waiting),
        ready: Condvar::new(),
    });
    (
        Completer {
            slot: Arc::clone(&slot),
            delivered: false,
        },
        CompletionHandle { slot },
    )
}
