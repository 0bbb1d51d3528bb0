// SPDX-License-Identifier: AGPL-3.0-only

//! Neural engine program builder and HWX container codec
//!
//! This crate turns an ordered list of operation requests into a chain of
//! Tile Descriptors, and reads, writes and diffs the HWX container that
//! holds them.
//!
//! # Format
//!
//! - **Header** (0x40 bytes): magic, version, counts, data section bounds
//! - **Relocations**: named weight blobs, LUTs and shared surfaces
//! - **TD array** at 0x4000: 0x300-byte records chained by `Header.NextPointer`
//! - **Data**: float16 weights and LUT payloads
//!
//! # Example
//!
//! ```
//! use ane_chip::{DType, TensorDesc, TensorShape};
//! use ane_hwx::{diff, Assembler, ElementWiseOp, HwxContainer, Network, OpKind, OpRequest, Operand};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let t = TensorDesc::new(TensorShape::from_dims([1, 1, 1, 1, 64]), DType::Float16);
//! let network = Network {
//!     inputs: vec![t, t],
//!     ops: vec![OpRequest::new(
//!         OpKind::ElementWise { op: ElementWiseOp::Add },
//!         vec![Operand::Input(0), Operand::Input(1)],
//!         t,
//!     )],
//! };
//!
//! let program = Assembler::default().assemble(&network)?;
//! let bytes = program.write();
//! let parsed = HwxContainer::read(&bytes)?;
//! assert!(diff(&program, &parsed).is_empty());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod assembler;
pub mod container;
mod diff;
mod error;
pub mod layout;
mod network;
pub mod ops;

pub use assembler::{Assembler, Stage};
pub use container::{HwxContainer, Record, Relocation};
pub use diff::{diff, diff_records, FieldDifference};
pub use error::{HwxError, Result};
pub use layout::{verify_residency, LayoutPolicy};
pub use network::{Network, OpRequest, Operand};
pub use ops::{ElementWiseOp, NormKind, OpKind, PoolMode};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{Assembler, HwxContainer, LayoutPolicy, Network, OpKind, OpRequest, Operand, Result};
}
