// SPDX-License-Identifier: AGPL-3.0-only

//! Fixed-size request record handed to the service at submit.
//!
//! ```text
//! 0x00  magic        u32   0x5145_4E41
//! 0x04  flags        u32   bit 0: compile request
//! 0x08  request id   u64
//! 0x10  program      u32
//! 0x14  inputs       u16
//! 0x16  outputs      u16
//! 0x18  reserved     8 bytes
//! 0x20  surfaces     14 × {id u64, size u64}, inputs first
//! ```

use crate::error::{AneError, Result};

/// Size of one encoded record.
pub const REQUEST_SIZE: usize = 0x100;

/// Surface descriptors that fit in one record.
pub const MAX_SURFACES: usize = (REQUEST_SIZE - SURFACES_OFFSET) / SURFACE_ENTRY_SIZE;

const REQUEST_MAGIC: u32 = 0x5145_4E41;
const FLAG_COMPILE: u32 = 1;
const SURFACES_OFFSET: usize = 0x20;
const SURFACE_ENTRY_SIZE: usize = 0x10;

/// Surface reference inside a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceRef {
    /// Surface id.
    pub id: u64,
    /// Size in bytes.
    pub size: u64,
}

/// Decoded request record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    /// Session-unique request id.
    pub request_id: u64,
    /// Program handle returned by the service at load, 0 for compile requests.
    pub program: u32,
    /// Compile request rather than program execution.
    pub compile: bool,
    /// Input surfaces.
    pub inputs: Vec<SurfaceRef>,
    /// Output surfaces.
    pub outputs: Vec<SurfaceRef>,
}

impl RequestRecord {
    /// Encode into the fixed record.
    ///
    /// # Errors
    ///
    /// Returns `RequestTooLarge` if the surfaces do not fit.
    pub fn encode(&self) -> Result<[u8; REQUEST_SIZE]> {
        let needed = self.inputs.len() + self.outputs.len();
        if needed > MAX_SURFACES {
            return Err(AneError::RequestTooLarge {
                needed,
                max: MAX_SURFACES,
            });
        }

        let mut out = [0u8; REQUEST_SIZE];
        out[0x00..0x04].copy_from_slice(&REQUEST_MAGIC.to_le_bytes());
        let flags = if self.compile { FLAG_COMPILE } else { 0 };
        out[0x04..0x08].copy_from_slice(&flags.to_le_bytes());
        out[0x08..0x10].copy_from_slice(&self.request_id.to_le_bytes());
        out[0x10..0x14].copy_from_slice(&self.program.to_le_bytes());
        // Both counts are <= MAX_SURFACES.
        #[allow(clippy::cast_possible_truncation)]
        let counts = [self.inputs.len() as u16, self.outputs.len() as u16];
        out[0x14..0x16].copy_from_slice(&counts[0].to_le_bytes());
        out[0x16..0x18].copy_from_slice(&counts[1].to_le_bytes());

        for (i, s) in self.inputs.iter().chain(&self.outputs).enumerate() {
            let at = SURFACES_OFFSET + i * SURFACE_ENTRY_SIZE;
            out[at..at + 8].copy_from_slice(&s.id.to_le_bytes());
            out[at + 8..at + 16].copy_from_slice(&s.size.to_le_bytes());
        }
        Ok(out)
    }

    /// Decode a record.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError` for a bad magic or surface count.
    pub fn decode(raw: &[u8; REQUEST_SIZE]) -> Result<Self> {
        let u32_at = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[at..at + 8]);
            u64::from_le_bytes(b)
        };

        if u32_at(0x00) != REQUEST_MAGIC {
            return Err(AneError::device_error("request record has a bad magic"));
        }
        let inputs = usize::from(u16::from_le_bytes([raw[0x14], raw[0x15]]));
        let outputs = usize::from(u16::from_le_bytes([raw[0x16], raw[0x17]]));
        if inputs + outputs > MAX_SURFACES {
            return Err(AneError::device_error(format!(
                "request record lists {} surfaces",
                inputs + outputs
            )));
        }

        let mut surfaces = (0..inputs + outputs).map(|i| {
            let at = SURFACES_OFFSET + i * SURFACE_ENTRY_SIZE;
            SurfaceRef {
                id: u64_at(at),
                size: u64_at(at + 8),
            }
        });
        Ok(Self {
            request_id: u64_at(0x08),
            program: u32_at(0x10),
            compile: u32_at(0x04) & FLAG_COMPILE != 0,
            inputs: surfaces.by_ref().take(inputs).collect(),
            outputs: surfaces.collect(),
        })
    }
}
