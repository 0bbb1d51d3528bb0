// SPDX-License-Identifier: AGPL-3.0-only

//! Memory surfaces shared between the caller and the accelerator.
//!
//! A surface is moved into the session at submit and handed back with the
//! completion; while a request is pending the caller holds no reference to it.

use ane_chip::tensor::{f16_value, f32_to_f16_bytes};
use bytes::{Bytes, BytesMut};

/// One shared memory surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedSurface {
    id: u64,
    data: BytesMut,
}

impl SharedSurface {
    /// Surface holding `data`. The id is assigned when it is submitted.
    pub fn from_bytes(data: impl AsRef<[u8]>) -> Self {
        Self {
            id: 0,
            data: BytesMut::from(data.as_ref()),
        }
    }

    /// Zero-filled surface of `size` bytes.
    pub fn zeroed(size: usize) -> Self {
        Self {
            id: 0,
            data: BytesMut::zeroed(size),
        }
    }

    /// Float32 values down-converted to float16.
    pub fn from_f32(values: &[f32]) -> Self {
        Self::from_bytes(f32_to_f16_bytes(values))
    }

    /// Identifier referenced by the request record.
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-sized surface.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Contents interpreted as little-endian float16.
    pub fn to_f32(&self) -> Vec<f32> {
        self.data
            .chunks_exact(2)
            .map(|b| f16_value(u64::from(u16::from_le_bytes([b[0], b[1]]))))
            .collect()
    }

    /// Freeze into immutable bytes.
    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f16_round_trip() {
        let s = SharedSurface::from_f32(&[1.0, -2.5, 0.0]);
        assert_eq!(s.len(), 6);
        assert_eq!(s.to_f32(), vec![1.0, -2.5, 0.0]);
    }

    #[test]
    fn zeroed_and_ids() {
        let s = SharedSurface::zeroed(64).with_id(7);
        assert_eq!(s.id(), 7);
        assert!(s.as_slice().iter().all(|&b| b == 0));
        assert_eq!(s.into_bytes().len(), 64);
    }
}
