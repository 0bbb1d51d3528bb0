// SPDX-License-Identifier: AGPL-3.0-only

//! Table-driven bitfield codec.
//!
//! Fields are little-endian within and across bytes: bit 0 of a field is
//! bit `bit_offset` of byte `byte_offset`, and higher bits continue into the
//! following bytes. A field of up to 64 bits starting at bit 7 touches nine
//! bytes, so the working window is a `u128`.
//!
//! Values are checked against the field width before anything is written.
//! Signed fields store two's complement truncated to the field width.

use crate::error::{ChipError, Result};
use crate::regs::RegisterField;

fn window_mask(width: u8) -> u128 {
    (1u128 << width) - 1
}

fn read_window(buf: &[u8], field: &RegisterField) -> u128 {
    let start = field.byte_offset as usize;
    let end = start + field.span_bytes();
    assert!(end <= buf.len(), "field {} past end of buffer", field.qualified_name());
    buf[start..end]
        .iter()
        .rev()
        .fold(0u128, |acc, &b| (acc << 8) | u128::from(b))
}

#[allow(clippy::cast_possible_truncation)]
fn write_window(buf: &mut [u8], field: &RegisterField, bits: u64) {
    let start = field.byte_offset as usize;
    let span = field.span_bytes();
    let shift = u32::from(field.bit_offset);
    let mask = window_mask(field.width) << shift;

    let current = read_window(buf, field);
    let updated = (current & !mask) | ((u128::from(bits) << shift) & mask);

    for (i, byte) in buf[start..start + span].iter_mut().enumerate() {
        *byte = (updated >> (8 * i)) as u8;
    }
}

/// Write an unsigned value into `field`.
///
/// # Errors
///
/// Returns `FieldOverflow` if `value` exceeds `2^width - 1`. The buffer is
/// left untouched in that case.
///
/// # Panics
///
/// Panics if the field extends past the end of `buf`.
pub fn pack(buf: &mut [u8], field: &RegisterField, value: u64) -> Result<()> {
    if value > field.max_unsigned() {
        return Err(ChipError::field_overflow(
            field.qualified_name(),
            i128::from(value),
            field.width,
        ));
    }
    write_window(buf, field, value);
    Ok(())
}

/// Write a signed value into `field` as two's complement.
///
/// # Errors
///
/// Returns `FieldOverflow` if `value` is outside the field's signed range.
///
/// # Panics
///
/// Panics if the field extends past the end of `buf`.
pub fn pack_signed(buf: &mut [u8], field: &RegisterField, value: i64) -> Result<()> {
    let (min, max) = field.signed_range();
    if value < min || value > max {
        return Err(ChipError::field_overflow(
            field.qualified_name(),
            i128::from(value),
            field.width,
        ));
    }
    #[allow(clippy::cast_sign_loss)]
    let bits = (value as u64) & field.max_unsigned();
    write_window(buf, field, bits);
    Ok(())
}

/// Read `field` as an unsigned, right-justified value.
///
/// # Panics
///
/// Panics if the field extends past the end of `buf`.
#[must_use]
pub fn unpack(buf: &[u8], field: &RegisterField) -> u64 {
    let window = read_window(buf, field) >> field.bit_offset;
    #[allow(clippy::cast_possible_truncation)]
    let value = (window & window_mask(field.width)) as u64;
    value
}

/// Read `field` and sign-extend it from its width.
///
/// # Panics
///
/// Panics if the field extends past the end of `buf`.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn unpack_signed(buf: &[u8], field: &RegisterField) -> i64 {
    let raw = unpack(buf, field);
    let width = u32::from(field.width);
    if width >= 64 {
        raw as i64
    } else {
        let shift = 64 - width;
        ((raw << shift) as i64) >> shift
    }
}
