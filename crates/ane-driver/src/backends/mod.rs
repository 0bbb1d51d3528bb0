// SPDX-License-Identifier: AGPL-3.0-only

//! Service implementations
//!
//! - **Software**: worker-thread loopback service with fault injection, used
//!   when no device service is reachable and in tests

pub mod software;

pub use software::SoftwareService;
