// SPDX-License-Identifier: AGPL-3.0-only

//! Execution sessions for the Apple Neural Engine.
//!
//! The device itself is owned by an external service. This crate models the
//! protocol spoken to it: open a session in one capability mode, load a
//! program or submit a compile request, wait for the asynchronous
//! completion, close.
//!
//! # Services
//!
//! ```text
//! AneService (trait)
//!   SoftwareService   worker-thread loopback, fault injection, in-crate compiler
//! ExternalCompiler    vendor compiler binary, output checked by the container codec
//! ```
//!
//! # Quick start
//!
//! ```
//! use ane_driver::{CapabilityMode, Session, SessionConfig, SoftwareService};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = Arc::new(SoftwareService::new());
//! let mut compiler = Session::open(service, CapabilityMode::CompileOnly, SessionConfig::default())?;
//!
//! let description = r#"{
//!     "inputs": [{"shape": [1, 1, 1, 1, 64], "dtype": "float16"}],
//!     "ops": [{
//!         "kind": {"type": "activation"},
//!         "inputs": [{"input": 0}],
//!         "output": {"shape": [1, 1, 1, 1, 64], "dtype": "float16"},
//!         "activation": {"kind": "relu"}
//!     }]
//! }"#;
//! let handle = compiler.submit_compile(description.as_bytes())?;
//! let compiled = compiler.wait(handle, Duration::from_secs(5))?;
//! assert_eq!(compiled.outputs.len(), 1);
//! compiler.close();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
mod completion;
mod compiler;
mod config;
mod error;
pub mod request;
mod service;
mod session;
mod surface;

pub use backends::software::SoftwareService;
pub use completion::{channel, Completer, CompletionHandle, RequestOutput};
pub use compiler::{CompilerOptions, ExternalCompiler};
pub use config::SessionConfig;
pub use error::{AneError, Result};
pub use request::{RequestRecord, SurfaceRef, MAX_SURFACES, REQUEST_SIZE};
pub use service::{AneService, CapabilityMode, ProgramHandle, ServiceHandle};
pub use session::{Session, SessionState};
pub use surface::SharedSurface;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AneError, AneService, CapabilityMode, CompletionHandle, RequestOutput, Result, Session,
        SessionConfig, SessionState, SharedSurface, SoftwareService,
    };
}
