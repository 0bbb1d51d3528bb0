// SPDX-License-Identifier: AGPL-3.0-only

//! Silicon model for the neural engine's Tile Descriptor format.
//!
//! This crate has **no hardware access**: it is a pure model of the
//! instruction record, the register table that describes it, the bitfield
//! codec over that table, and the HWX container layout constants.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | Sections, register fields, the built-in register table |
//! | [`bitfield`] | `pack` / `unpack` over table entries |
//! | [`td`] | [`TileDescriptor`]: section accessors and `validate()` |
//! | [`tensor`] | 5-D shapes, the closed dtype set, float32 down-conversion |
//! | [`activation`] | Activation selector catalogue and LUT payloads |
//! | [`residency`] | L2 residency hints |
//! | [`program`] | HWX header / relocation / TD array layout |
//!
//! # Example
//!
//! ```
//! use ane_chip::{DType, TileDescriptor};
//!
//! let mut td = TileDescriptor::new();
//! td.set_dtypes(DType::Float16, DType::Float16, DType::Float16)?;
//! td.set("TileDMASrc.Src1RowStride", 0x40)?;
//! td.validate()?;
//! assert_eq!(td.get("Common.ChCfg.OutFmt")?, 2);
//! # Ok::<(), ane_chip::ChipError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod activation;
pub mod bitfield;
mod error;
pub mod program;
pub mod regs;
pub mod residency;
pub mod td;
pub mod tensor;

pub use activation::{Activation, ActivationKind, Lut};
pub use error::{ChipError, Result};
pub use regs::{RegisterField, RegisterTable, Section, TD_SIZE};
pub use residency::{L2Port, Residency};
pub use td::{DmaSurface, KernelChannel, SourcePort, Strides, TileDescriptor};
pub use tensor::{DType, TensorDesc, TensorShape};
