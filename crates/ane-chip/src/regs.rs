// SPDX-License-Identifier: AGPL-3.0-only

//! Register table for the Tile Descriptor.
//!
//! A Tile Descriptor is a 0x300-byte record. Every named field is described
//! by data, not by code: `(section, byte offset, bit offset, width)`. The
//! built-in table ships as `data/regs_v1.json` and is loaded once into
//! process-wide immutable state on first use.
//!
//! ## Section layout
//!
//! ```text
//! 0x000..0x02c  Header        task id, next pointer, chain flags
//! 0x02c..0x128  KernelDMASrc  16 coefficient channels (en, base, size)
//! 0x128..0x16c  Common        dims, formats, conv geometry, op config
//! 0x16c..0x1e0  TileDMASrc    Src1/Src2 base + row/plane/depth/batch strides
//! 0x1e0..0x22c  L2            source/result bases, residency hints
//! 0x22c..0x240  NE            kernel format, MAC config, activation
//! 0x240..0x258  (unmapped)
//! 0x258..0x274  TileDMADst    destination base + strides, format
//! 0x274..0x300  (unmapped)
//! ```
//!
//! Unmapped ranges are carried through untouched so records round-trip
//! byte for byte.

use crate::error::{ChipError, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

/// Size of one Tile Descriptor record in bytes.
pub const TD_SIZE: usize = 0x300;

/// Widest field the codec supports.
pub const MAX_FIELD_WIDTH: u8 = 64;

/// Built-in table for the first hardware generation.
const BUILTIN_V1: &str = include_str!("../data/regs_v1.json");

// ── Sections ─────────────────────────────────────────────────────────────────

/// Logical section of a Tile Descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
    /// Task header and chain link.
    Header,
    /// Coefficient / operand DMA channels.
    KernelDmaSrc,
    /// Shapes, formats and operation configuration.
    Common,
    /// Tile DMA source strides.
    TileDmaSrc,
    /// L2 scratch-cache configuration and residency hints.
    L2,
    /// Neuron engine: MAC config, bias, scale, activation.
    Ne,
    /// Tile DMA destination strides.
    TileDmaDst,
}

impl Section {
    /// All sections in record order.
    pub const ALL: [Self; 7] = [
        Self::Header,
        Self::KernelDmaSrc,
        Self::Common,
        Self::TileDmaSrc,
        Self::L2,
        Self::Ne,
        Self::TileDmaDst,
    ];

    /// Byte range of the section inside the record.
    #[must_use]
    pub const fn range(self) -> Range<usize> {
        match self {
            Self::Header => 0x000..0x02C,
            Self::KernelDmaSrc => 0x02C..0x128,
            Self::Common => 0x128..0x16C,
            Self::TileDmaSrc => 0x16C..0x1E0,
            Self::L2 => 0x1E0..0x22C,
            Self::Ne => 0x22C..0x240,
            Self::TileDmaDst => 0x258..0x274,
        }
    }

    /// Name used as the prefix of qualified field names.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Header => "Header",
            Self::KernelDmaSrc => "KernelDMASrc",
            Self::Common => "Common",
            Self::TileDmaSrc => "TileDMASrc",
            Self::L2 => "L2",
            Self::Ne => "NE",
            Self::TileDmaDst => "TileDMADst",
        }
    }

    /// Parse a section prefix.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Fields ───────────────────────────────────────────────────────────────────

/// One named bit range inside a Tile Descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterField {
    /// Section the field belongs to.
    pub section: Section,
    /// Name within the section, e.g. `MACCfg.NonlinearMode`.
    pub name: String,
    /// Byte offset from the start of the record.
    pub byte_offset: u16,
    /// Bit offset within that byte (little-endian bit order).
    pub bit_offset: u8,
    /// Width in bits (1..=64), may straddle byte boundaries.
    pub width: u8,
    /// Two's complement field.
    pub signed: bool,
    /// Alias of another field; exempt from the overlap check.
    pub alias: bool,
}

impl RegisterField {
    /// Describe an unsigned field.
    pub fn new(
        section: Section,
        name: impl Into<String>,
        byte_offset: u16,
        bit_offset: u8,
        width: u8,
    ) -> Self {
        Self {
            section,
            name: name.into(),
            byte_offset,
            bit_offset,
            width,
            signed: false,
            alias: false,
        }
    }

    /// Mark the field as two's complement.
    #[must_use]
    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    /// `Section.Name` form used by lookups and diffs.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.section, self.name)
    }

    /// First bit of the field, counted from bit 0 of byte 0.
    #[must_use]
    pub const fn bit_start(&self) -> usize {
        self.byte_offset as usize * 8 + self.bit_offset as usize
    }

    /// One past the last bit of the field.
    #[must_use]
    pub const fn bit_end(&self) -> usize {
        self.bit_start() + self.width as usize
    }

    /// Number of bytes touched by the field.
    #[must_use]
    pub const fn span_bytes(&self) -> usize {
        (self.bit_offset as usize + self.width as usize).div_ceil(8)
    }

    /// Largest unsigned value the field can hold.
    #[must_use]
    pub const fn max_unsigned(&self) -> u64 {
        if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }

    /// Inclusive signed range of the field.
    #[must_use]
    pub const fn signed_range(&self) -> (i64, i64) {
        if self.width >= 64 {
            (i64::MIN, i64::MAX)
        } else {
            let half = 1i64 << (self.width - 1);
            (-half, half - 1)
        }
    }

    fn check_shape(&self) -> Result<()> {
        let qualified = self.qualified_name();
        if self.width == 0 || self.width > MAX_FIELD_WIDTH {
            return Err(ChipError::invalid_table(format!(
                "{qualified}: width {} outside 1..=64",
                self.width
            )));
        }
        if self.bit_offset > 7 {
            return Err(ChipError::invalid_table(format!(
                "{qualified}: bit offset {} outside 0..=7",
                self.bit_offset
            )));
        }
        if self.bit_end() > TD_SIZE * 8 {
            return Err(ChipError::invalid_table(format!(
                "{qualified}: ends past the {TD_SIZE:#x}-byte record"
            )));
        }
        let range = self.section.range();
        if self.bit_start() < range.start * 8 || self.bit_end() > range.end * 8 {
            return Err(ChipError::invalid_table(format!(
                "{qualified}: outside section range {:#x}..{:#x}",
                range.start, range.end
            )));
        }
        Ok(())
    }
}

/// On-disk record: `{name, byte_offset, bit_offset, width}` plus optional flags.
#[derive(Debug, Deserialize)]
struct RawField {
    name: String,
    byte_offset: u16,
    bit_offset: u8,
    width: u8,
    #[serde(default)]
    signed: bool,
    #[serde(default)]
    alias: bool,
}

impl RawField {
    fn into_field(self) -> Result<RegisterField> {
        let (prefix, name) = self
            .name
            .split_once('.')
            .ok_or_else(|| ChipError::invalid_table(format!("{}: missing section prefix", self.name)))?;
        let section = Section::from_name(prefix)
            .ok_or_else(|| ChipError::invalid_table(format!("{}: unknown section {prefix}", self.name)))?;
        Ok(RegisterField {
            section,
            name: name.to_string(),
            byte_offset: self.byte_offset,
            bit_offset: self.bit_offset,
            width: self.width,
            signed: self.signed,
            alias: self.alias,
        })
    }
}

// ── Table ────────────────────────────────────────────────────────────────────

/// Ordered, validated collection of register fields.
#[derive(Debug, Clone)]
pub struct RegisterTable {
    fields: Vec<RegisterField>,
    index: HashMap<String, usize>,
}

static BUILTIN: Lazy<RegisterTable> = Lazy::new(|| {
    // A broken built-in table is an invariant break, not a runtime condition.
    let table = RegisterTable::from_json(BUILTIN_V1)
        .unwrap_or_else(|e| panic!("built-in register table is invalid: {e}"));
    tracing::debug!("Loaded built-in register table ({} fields)", table.len());
    table
});

impl RegisterTable {
    /// The built-in table, loaded on first use.
    pub fn builtin() -> &'static Self {
        &BUILTIN
    }

    /// Parse and validate a JSON table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTable` if the JSON is malformed or any field is out of
    /// bounds, duplicated, or overlaps a non-alias field of its section.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: Vec<RawField> = serde_json::from_str(json)
            .map_err(|e| ChipError::invalid_table(format!("malformed JSON: {e}")))?;
        let fields = raw
            .into_iter()
            .map(RawField::into_field)
            .collect::<Result<Vec<_>>>()?;
        Self::from_fields(fields)
    }

    /// Build a table from already-parsed fields.
    ///
    /// # Errors
    ///
    /// Same validation as [`RegisterTable::from_json`].
    pub fn from_fields(fields: Vec<RegisterField>) -> Result<Self> {
        let mut index = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            field.check_shape()?;
            if index.insert(field.qualified_name(), i).is_some() {
                return Err(ChipError::invalid_table(format!(
                    "duplicate field {}",
                    field.qualified_name()
                )));
            }
        }

        for section in Section::ALL {
            let mut spans: Vec<&RegisterField> = fields
                .iter()
                .filter(|f| f.section == section && !f.alias)
                .collect();
            spans.sort_by_key(|f| f.bit_start());
            for pair in spans.windows(2) {
                if pair[0].bit_end() > pair[1].bit_start() {
                    return Err(ChipError::invalid_table(format!(
                        "{} overlaps {}",
                        pair[0].qualified_name(),
                        pair[1].qualified_name()
                    )));
                }
            }
        }

        Ok(Self { fields, index })
    }

    /// Promote a table to process-wide lifetime.
    ///
    /// Tables are loaded once at start-up and never freed; records keep a
    /// `&'static` reference to the table that describes them.
    #[must_use]
    pub fn leak(self) -> &'static Self {
        Box::leak(Box::new(self))
    }

    /// Look up a field by qualified name.
    pub fn get(&self, qualified: &str) -> Option<&RegisterField> {
        self.index.get(qualified).map(|&i| &self.fields[i])
    }

    /// Look up a field by qualified name.
    ///
    /// # Errors
    ///
    /// Returns `UnknownField` if the name is not in the table.
    pub fn lookup(&self, qualified: &str) -> Result<&RegisterField> {
        self.get(qualified)
            .ok_or_else(|| ChipError::unknown_field(qualified))
    }

    /// All fields in table order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterField> {
        self.fields.iter()
    }

    /// Fields belonging to one section, in table order.
    pub fn fields_in(&self, section: Section) -> impl Iterator<Item = &RegisterField> {
        self.fields.iter().filter(move |f| f.section == section)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the table has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
