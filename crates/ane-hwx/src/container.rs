// SPDX-License-Identifier: AGPL-3.0-only

//! HWX container codec.
//!
//! [`HwxContainer::read`] parses the header and relocation table, then walks
//! the `Header.NextPointer` chain from the fixed TD array offset into an
//! arena of records with explicit successor indices. It never panics on
//! malformed input: out-of-bounds links are `TruncatedContainer`, revisits
//! are `CyclicChain`, everything else is `InvalidContainer`.
//!
//! Reserved header bytes, relocation-name padding and every gap between the
//! relocation table, the records and the data section must be zero, so
//! [`HwxContainer::write`] reproduces any buffer `read` accepts byte for
//! byte.

use crate::error::{HwxError, Result};
use crate::layout::verify_residency;
use ane_chip::program::{
    self, align_up, header, RelocationKind, DATA_ALIGN, HEADER_SIZE, HWX_MAGIC, HWX_VERSION,
    MAX_RELOCATIONS, PROGRAM_LEVEL, RELOC_ENTRY_SIZE, RELOC_NAME_LEN, TD_ARRAY_OFFSET,
};
use ane_chip::td::NEXT_TERMINATOR;
use ane_chip::{Lut, TileDescriptor, TD_SIZE};
use bytes::Bytes;
use std::collections::HashSet;
use std::path::Path;

/// One relocation table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// What the entry refers to.
    pub kind: RelocationKind,
    /// Record index, or [`PROGRAM_LEVEL`].
    pub record: u32,
    /// Device address (surfaces) or data-section offset (blobs).
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
    /// Symbol name, at most 40 bytes.
    pub name: String,
}

impl Relocation {
    /// Program-level shared surface.
    pub fn surface(name: impl Into<String>, address: u64, size: u64) -> Self {
        Self {
            kind: RelocationKind::Surface,
            record: PROGRAM_LEVEL,
            offset: address,
            size,
            name: name.into(),
        }
    }

    /// Blob in the data section belonging to `record`.
    pub fn blob(kind: RelocationKind, record: u32, name: impl Into<String>, offset: u64, size: u64) -> Self {
        Self {
            kind,
            record,
            offset,
            size,
            name: name.into(),
        }
    }

    fn encode(&self, out: &mut [u8]) {
        out[0x00..0x04].copy_from_slice(&self.kind.code().to_le_bytes());
        out[0x04..0x08].copy_from_slice(&self.record.to_le_bytes());
        out[0x08..0x10].copy_from_slice(&self.offset.to_le_bytes());
        out[0x10..0x18].copy_from_slice(&self.size.to_le_bytes());
        let name = self.name.as_bytes();
        out[0x18..0x18 + name.len()].copy_from_slice(name);
    }

    fn decode(index: usize, raw: &[u8]) -> Result<Self> {
        let kind_code = le_u32(raw, 0x00);
        let kind = RelocationKind::from_code(kind_code).ok_or_else(|| {
            HwxError::invalid_container(format!("relocation {index}: unknown kind {kind_code}"))
        })?;
        let name_bytes = &raw[0x18..0x18 + RELOC_NAME_LEN];
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(RELOC_NAME_LEN);
        if name_bytes[end..].iter().any(|&b| b != 0) {
            return Err(HwxError::invalid_container(format!(
                "relocation {index}: non-zero bytes after the name"
            )));
        }
        let name = std::str::from_utf8(&name_bytes[..end])
            .map_err(|_| HwxError::invalid_container(format!("relocation {index}: name is not UTF-8")))?
            .to_string();
        Ok(Self {
            kind,
            record: le_u32(raw, 0x04),
            offset: le_u64(raw, 0x08),
            size: le_u64(raw, 0x10),
            name,
        })
    }
}

/// One record in the arena.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// File offset.
    pub offset: u64,
    /// Decoded Tile Descriptor.
    pub td: TileDescriptor,
    /// Index of the successor, `None` for the last record.
    pub next: Option<usize>,
}

/// A parsed or assembled HWX program.
#[derive(Debug, Clone, PartialEq)]
pub struct HwxContainer {
    version: u32,
    flags: u32,
    relocations: Vec<Relocation>,
    records: Vec<Record>,
    data: Bytes,
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn require_zero(what: &str, bytes: &[u8], range: std::ops::Range<usize>) -> Result<()> {
    match bytes[range.clone()].iter().position(|&b| b != 0) {
        Some(at) => Err(HwxError::invalid_container(format!(
            "non-zero {what} byte at {:#x}",
            range.start + at
        ))),
        None => Ok(()),
    }
}

fn checked_range(what: &'static str, offset: u64, needed: u64, len: usize) -> Result<std::ops::Range<usize>> {
    let truncated = || HwxError::TruncatedContainer {
        what,
        offset,
        needed,
        len,
    };
    let end = offset.checked_add(needed).ok_or_else(truncated)?;
    if end > len as u64 {
        return Err(truncated());
    }
    // Both bounds are <= len, so they fit in usize.
    #[allow(clippy::cast_possible_truncation)]
    Ok(offset as usize..end as usize)
}

impl HwxContainer {
    /// Build a container from records laid out back to back from the TD
    /// array offset. Header chaining must already be set on the records.
    ///
    /// # Errors
    ///
    /// Returns `InvalidContainer` if there are no records, too many
    /// relocations, a relocation name is longer than 40 bytes, or a record
    /// chain does not match the contiguous layout.
    pub fn from_records(records: Vec<TileDescriptor>, relocations: Vec<Relocation>, data: Bytes) -> Result<Self> {
        if records.is_empty() {
            return Err(HwxError::invalid_container("program has no records"));
        }
        if relocations.len() > MAX_RELOCATIONS {
            return Err(HwxError::invalid_container(format!(
                "{} relocations, at most {MAX_RELOCATIONS} fit before the TD array",
                relocations.len()
            )));
        }
        if let Some(r) = relocations
            .iter()
            .find(|r| r.name.len() > RELOC_NAME_LEN || r.name.contains('\0'))
        {
            return Err(HwxError::invalid_container(format!(
                "relocation name {:?} longer than {RELOC_NAME_LEN} bytes or holds a NUL",
                r.name
            )));
        }

        let count = records.len();
        let records = records
            .into_iter()
            .enumerate()
            .map(|(i, td)| {
                let next = (i + 1 < count).then_some(i + 1);
                let expected = next.map_or(u64::from(NEXT_TERMINATOR), |n| program::record_offset(n) as u64);
                let actual = td.next_pointer().map_err(|e| HwxError::record(i, e))?;
                if u64::from(actual) != expected {
                    return Err(HwxError::invalid_container(format!(
                        "TD[{i}] links to {actual:#x}, expected {expected:#x}"
                    )));
                }
                Ok(Record {
                    offset: program::record_offset(i) as u64,
                    td,
                    next,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            version: HWX_VERSION,
            flags: 0,
            relocations,
            records,
            data,
        })
    }

    /// Read and parse a container file.
    ///
    /// # Errors
    ///
    /// Returns `Io` or any error of [`HwxContainer::read`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Loading HWX container from: {}", path.display());
        let bytes = std::fs::read(path)?;
        Self::read(&bytes)
    }

    /// Parse a container.
    ///
    /// # Errors
    ///
    /// - `TruncatedContainer` if the header, a relocation, a record or a blob
    ///   lies outside the buffer
    /// - `CyclicChain` if the next-offset chain revisits a record
    /// - `InvalidContainer` for a bad magic, version or TD offset, a backward
    ///   or misaligned link, a count mismatch, or a bad relocation
    #[allow(clippy::too_many_lines)]
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let len = bytes.len();
        tracing::debug!("Parsing HWX container ({} bytes)", len);
        checked_range("header", 0, HEADER_SIZE as u64, len)?;

        let magic = le_u32(bytes, header::MAGIC);
        if magic != HWX_MAGIC {
            tracing::error!("Invalid HWX magic: {:#010x}", magic);
            return Err(HwxError::invalid_container(format!("bad magic {magic:#010x}")));
        }
        let version = le_u32(bytes, header::VERSION);
        if version != HWX_VERSION {
            return Err(HwxError::invalid_container(format!("unsupported version {version}")));
        }
        let td_offset = le_u32(bytes, header::TD_OFFSET) as usize;
        if td_offset != TD_ARRAY_OFFSET {
            return Err(HwxError::invalid_container(format!(
                "TD array at {td_offset:#x}, expected {TD_ARRAY_OFFSET:#x}"
            )));
        }
        let td_count = le_u32(bytes, header::TD_COUNT) as usize;
        let reloc_count = le_u32(bytes, header::RELOC_COUNT) as usize;
        let flags = le_u32(bytes, header::FLAGS);
        let data_offset = le_u64(bytes, header::DATA_OFFSET);
        let data_size = le_u64(bytes, header::DATA_SIZE);
        require_zero("reserved header", bytes, header::RESERVED..HEADER_SIZE)?;

        if reloc_count > MAX_RELOCATIONS {
            return Err(HwxError::invalid_container(format!(
                "{reloc_count} relocations, at most {MAX_RELOCATIONS}"
            )));
        }
        let relocations = (0..reloc_count)
            .map(|i| {
                let at = (HEADER_SIZE + i * RELOC_ENTRY_SIZE) as u64;
                let range = checked_range("relocation", at, RELOC_ENTRY_SIZE as u64, len)?;
                Relocation::decode(i, &bytes[range])
            })
            .collect::<Result<Vec<_>>>()?;

        let records = Self::walk_chain(bytes)?;
        if records.len() != td_count {
            return Err(HwxError::invalid_container(format!(
                "header declares {td_count} records, chain has {}",
                records.len()
            )));
        }

        let records_end = records
            .last()
            .map_or(TD_ARRAY_OFFSET as u64, |r| r.offset + TD_SIZE as u64);
        let expected_data = align_up(records_end, DATA_ALIGN as u64);
        if data_offset != expected_data {
            return Err(HwxError::invalid_container(format!(
                "data section at {data_offset:#x}, expected {expected_data:#x}"
            )));
        }
        let data_range = checked_range("data section", data_offset, data_size, len)?;
        if data_range.end != len {
            return Err(HwxError::invalid_container(format!(
                "{} trailing bytes after the data section",
                len - data_range.end
            )));
        }
        Self::check_gaps(bytes, reloc_count, &records, data_range.start)?;
        let data = Bytes::copy_from_slice(&bytes[data_range]);

        let mut container = Self {
            version,
            flags,
            relocations,
            records,
            data,
        };
        container.attach_luts()?;

        tracing::debug!(
            "HWX container: {} record(s), {} relocation(s), {} data bytes",
            container.records.len(),
            container.relocations.len(),
            container.data.len()
        );
        Ok(container)
    }

    fn walk_chain(bytes: &[u8]) -> Result<Vec<Record>> {
        let len = bytes.len();
        let mut records: Vec<Record> = Vec::new();
        let mut visited: HashSet<u64> = HashSet::new();
        let mut offset = TD_ARRAY_OFFSET as u64;

        loop {
            let range = checked_range("record", offset, TD_SIZE as u64, len)?;
            visited.insert(offset);

            let mut raw = [0u8; TD_SIZE];
            raw.copy_from_slice(&bytes[range]);
            let td = TileDescriptor::from_record(&raw);
            let next = td.next_pointer().map_err(|e| HwxError::record(records.len(), e))?;

            let index = records.len();
            if next == NEXT_TERMINATOR {
                records.push(Record { offset, td, next: None });
                return Ok(records);
            }

            let next = u64::from(next);
            checked_range("record", next, TD_SIZE as u64, len)?;
            if visited.contains(&next) {
                return Err(HwxError::CyclicChain { offset: next });
            }
            if next < offset + TD_SIZE as u64 {
                return Err(HwxError::invalid_container(format!(
                    "TD[{index}] at {offset:#x} links backward or into itself ({next:#x})"
                )));
            }
            if (next - TD_ARRAY_OFFSET as u64) % TD_SIZE as u64 != 0 {
                return Err(HwxError::invalid_container(format!(
                    "TD[{index}] links to misaligned offset {next:#x}"
                )));
            }

            records.push(Record {
                offset,
                td,
                next: Some(index + 1),
            });
            offset = next;
        }
    }

    /// Everything outside the header fields, relocations, records and data
    /// section must be zero. `records` lie inside `bytes` and end at or
    /// before `data_start`.
    fn check_gaps(bytes: &[u8], reloc_count: usize, records: &[Record], data_start: usize) -> Result<()> {
        require_zero(
            "relocation table padding",
            bytes,
            HEADER_SIZE + reloc_count * RELOC_ENTRY_SIZE..TD_ARRAY_OFFSET,
        )?;
        let mut cursor = TD_ARRAY_OFFSET;
        for record in records {
            #[allow(clippy::cast_possible_truncation)]
            let start = record.offset as usize;
            require_zero("TD array gap", bytes, cursor..start)?;
            cursor = start + TD_SIZE;
        }
        require_zero("data section padding", bytes, cursor..data_start)
    }

    fn attach_luts(&mut self) -> Result<()> {
        for (i, reloc) in self.relocations.iter().enumerate() {
            if reloc.kind != RelocationKind::Lut {
                continue;
            }
            let record = self
                .records
                .get_mut(reloc.record as usize)
                .ok_or_else(|| HwxError::invalid_container(format!("relocation {i}: no record {}", reloc.record)))?;
            let range = checked_range("LUT", reloc.offset, reloc.size, self.data.len())?;
            let lut = Lut::from_le_bytes(&self.data[range]);
            let declared = record
                .td
                .get("NE.LutEntries")
                .map_err(|e| HwxError::record(reloc.record as usize, e))?;
            if declared != lut.len() as u64 {
                return Err(HwxError::invalid_container(format!(
                    "TD[{}] declares {declared} LUT entries, relocation {i} holds {}",
                    reloc.record,
                    lut.len()
                )));
            }
            record
                .td
                .attach_lut(lut)
                .map_err(|e| HwxError::record(reloc.record as usize, e))?;
        }
        Ok(())
    }

    /// Serialize to the on-disk layout.
    pub fn write(&self) -> Vec<u8> {
        let records_end = self
            .records
            .iter()
            .map(|r| r.offset as usize + TD_SIZE)
            .max()
            .unwrap_or(TD_ARRAY_OFFSET);
        #[allow(clippy::cast_possible_truncation)]
        let data_offset = align_up(records_end as u64, DATA_ALIGN as u64) as usize;
        let mut out = vec![0u8; data_offset + self.data.len()];

        out[header::MAGIC..header::MAGIC + 4].copy_from_slice(&HWX_MAGIC.to_le_bytes());
        out[header::VERSION..header::VERSION + 4].copy_from_slice(&self.version.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        let counts = [
            (header::TD_OFFSET, TD_ARRAY_OFFSET as u32),
            (header::TD_COUNT, self.records.len() as u32),
            (header::RELOC_COUNT, self.relocations.len() as u32),
            (header::FLAGS, self.flags),
        ];
        for (at, value) in counts {
            out[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
        out[header::DATA_OFFSET..header::DATA_OFFSET + 8].copy_from_slice(&(data_offset as u64).to_le_bytes());
        out[header::DATA_SIZE..header::DATA_SIZE + 8].copy_from_slice(&(self.data.len() as u64).to_le_bytes());

        for (i, reloc) in self.relocations.iter().enumerate() {
            let at = HEADER_SIZE + i * RELOC_ENTRY_SIZE;
            reloc.encode(&mut out[at..at + RELOC_ENTRY_SIZE]);
        }

        for record in &self.records {
            let at = record.offset as usize;
            out[at..at + TD_SIZE].copy_from_slice(record.td.as_bytes());
        }

        out[data_offset..].copy_from_slice(&self.data);
        out
    }

    /// Write the container to a file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be written.
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.write())?;
        tracing::info!("Wrote HWX container: {} ({} records)", path.display(), self.records.len());
        Ok(())
    }

    /// Run record validation and the residency replay.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` with the first failing index, or
    /// `ResidencyViolation`.
    pub fn validate(&self) -> Result<()> {
        for (i, record) in self.records.iter().enumerate() {
            record.td.validate().map_err(|e| HwxError::record(i, e))?;
        }
        verify_residency(self.tds())
    }

    /// Records in chain order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Tile Descriptors in chain order.
    pub fn tds(&self) -> impl Iterator<Item = &TileDescriptor> {
        self.records.iter().map(|r| &r.td)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if there are no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Follow successor indices from the first record; returns the number
    /// of records visited.
    pub fn chain_len(&self) -> usize {
        let mut count = 0;
        let mut cursor = (!self.records.is_empty()).then_some(0);
        while let Some(i) = cursor {
            count += 1;
            if count > self.records.len() {
                break;
            }
            cursor = self.records.get(i).and_then(|r| r.next);
        }
        count
    }

    /// Relocation table.
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Shared surfaces whose name starts with `prefix`, ordered by name suffix.
    fn surfaces(&self, prefix: &str) -> Vec<&Relocation> {
        let mut found: Vec<(usize, &Relocation)> = self
            .relocations
            .iter()
            .filter(|r| r.kind == RelocationKind::Surface)
            .filter_map(|r| {
                let n = r.name.strip_prefix(prefix)?.parse().ok()?;
                Some((n, r))
            })
            .collect();
        found.sort_by_key(|&(n, _)| n);
        found.into_iter().map(|(_, r)| r).collect()
    }

    /// Program input surfaces (`input0`, `input1`, ...).
    pub fn inputs(&self) -> Vec<&Relocation> {
        self.surfaces("input")
    }

    /// Program output surfaces (`output0`, `output1`, ...).
    pub fn outputs(&self) -> Vec<&Relocation> {
        self.surfaces("output")
    }

    /// Data section (weights, LUTs).
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Header flags.
    pub fn flags(&self) -> u32 {
        self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ane_chip::{Activation, ActivationKind};

    fn chained(n: usize) -> Vec<TileDescriptor> {
        (0..n)
            .map(|i| {
                let mut td = TileDescriptor::new();
                td.set_task_id(i as u16).unwrap();
                if i + 1 < n {
                    td.set_next(program::record_offset(i + 1) as u32).unwrap();
                } else {
                    td.set_last().unwrap();
                }
                td
            })
            .collect()
    }

    fn sample(n: usize) -> HwxContainer {
        let relocs = vec![
            Relocation::surface("input0", 0, 0x80),
            Relocation::surface("output0", 0x80, 0x80),
        ];
        HwxContainer::from_records(chained(n), relocs, Bytes::new()).unwrap()
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let c = sample(3);
        let bytes = c.write();
        assert_eq!(bytes.len(), TD_ARRAY_OFFSET + 3 * TD_SIZE);
        let back = HwxContainer::read(&bytes).unwrap();
        assert_eq!(back, c);
        assert_eq!(back.write(), bytes);
        assert_eq!(back.chain_len(), 3);
        assert_eq!(back.inputs()[0].name, "input0");
        assert_eq!(back.outputs()[0].offset, 0x80);
    }

    #[test]
    fn lut_travels_through_data_section() {
        let mut tds = chained(1);
        tds[0].set_activation(&Activation::of(ActivationKind::Lut)).unwrap();
        let lut = Lut::from_f32(&[0.0, 0.25, 0.5, 1.0]);
        tds[0].attach_lut(lut.clone()).unwrap();
        let data = Bytes::from(lut.to_le_bytes());
        let relocs = vec![Relocation::blob(RelocationKind::Lut, 0, "lut0", 0, data.len() as u64)];
        let c = HwxContainer::from_records(tds, relocs, data).unwrap();
        let bytes = c.write();
        let back = HwxContainer::read(&bytes).unwrap();
        assert_eq!(back.records()[0].td.lut(), Some(&lut));
        back.validate().unwrap();
        assert_eq!(back.write(), bytes);
    }

    #[test]
    fn bad_magic() {
        let mut bytes = sample(1).write();
        bytes[0] ^= 0xFF;
        assert!(matches!(HwxContainer::read(&bytes), Err(HwxError::InvalidContainer { .. })));
    }

    #[test]
    fn short_buffer_is_truncated() {
        assert!(matches!(
            HwxContainer::read(&[0u8; 8]),
            Err(HwxError::TruncatedContainer { what: "header", .. })
        ));
        let bytes = sample(2).write();
        assert!(matches!(
            HwxContainer::read(&bytes[..TD_ARRAY_OFFSET + TD_SIZE + 10]),
            Err(HwxError::TruncatedContainer { what: "record", .. })
        ));
    }

    #[test]
    fn link_past_end_is_truncated() {
        let mut bytes = sample(1).write();
        let mut td = TileDescriptor::from_record(bytes[TD_ARRAY_OFFSET..TD_ARRAY_OFFSET + TD_SIZE].try_into().unwrap());
        td.set_next(0x10_0000).unwrap();
        bytes[TD_ARRAY_OFFSET..TD_ARRAY_OFFSET + TD_SIZE].copy_from_slice(td.as_bytes());
        assert!(matches!(HwxContainer::read(&bytes), Err(HwxError::TruncatedContainer { .. })));
    }

    #[test]
    fn self_link_is_cyclic() {
        let mut bytes = sample(2).write();
        let at = TD_ARRAY_OFFSET + TD_SIZE;
        let mut td = TileDescriptor::from_record(bytes[at..at + TD_SIZE].try_into().unwrap());
        td.set_next(at as u32).unwrap();
        bytes[at..at + TD_SIZE].copy_from_slice(td.as_bytes());
        assert!(matches!(
            HwxContainer::read(&bytes),
            Err(HwxError::CyclicChain { offset }) if offset == at as u64
        ));
    }

    #[test]
    fn back_link_is_cyclic() {
        let mut bytes = sample(3).write();
        let at = TD_ARRAY_OFFSET + 2 * TD_SIZE;
        let mut td = TileDescriptor::from_record(bytes[at..at + TD_SIZE].try_into().unwrap());
        td.set_next(TD_ARRAY_OFFSET as u32).unwrap();
        bytes[at..at + TD_SIZE].copy_from_slice(td.as_bytes());
        assert!(matches!(HwxContainer::read(&bytes), Err(HwxError::CyclicChain { .. })));
    }

    #[test]
    fn count_mismatch_is_invalid() {
        let mut bytes = sample(2).write();
        bytes[header::TD_COUNT] = 5;
        assert!(matches!(HwxContainer::read(&bytes), Err(HwxError::InvalidContainer { .. })));
    }

    #[test]
    fn unknown_relocation_kind_is_invalid() {
        let mut bytes = sample(1).write();
        bytes[HEADER_SIZE] = 9;
        assert!(matches!(HwxContainer::read(&bytes), Err(HwxError::InvalidContainer { .. })));
    }

    #[test]
    fn trailing_bytes_are_invalid() {
        let mut bytes = sample(1).write();
        bytes.push(0);
        assert!(matches!(HwxContainer::read(&bytes), Err(HwxError::InvalidContainer { .. })));
    }

    #[test]
    fn non_zero_padding_is_invalid() {
        let relocs = vec![Relocation::blob(RelocationKind::Weight, 0, "w0", 0, 2)];
        let clean = HwxContainer::from_records(chained(2), relocs, Bytes::from_static(&[1, 2])).unwrap().write();
        let name_pad = HEADER_SIZE + 0x18 + 8;
        let reloc_gap = HEADER_SIZE + RELOC_ENTRY_SIZE;
        for at in [header::RESERVED, HEADER_SIZE - 1, name_pad, reloc_gap, 0x2000, TD_ARRAY_OFFSET - 1] {
            let mut bytes = clean.clone();
            bytes[at] = 0xAB;
            assert!(
                matches!(HwxContainer::read(&bytes), Err(HwxError::InvalidContainer { .. })),
                "byte {at:#x} accepted"
            );
        }
    }

    #[test]
    fn skipped_record_slot_must_be_zero() {
        // Record 0 links over one empty slot to record 1.
        let mut first = TileDescriptor::new();
        first.set_next(program::record_offset(2) as u32).unwrap();
        let mut second = TileDescriptor::new();
        second.set_task_id(1).unwrap();
        second.set_last().unwrap();

        let mut bytes = vec![0u8; TD_ARRAY_OFFSET + 3 * TD_SIZE];
        bytes[header::MAGIC..header::MAGIC + 4].copy_from_slice(&HWX_MAGIC.to_le_bytes());
        bytes[header::VERSION..header::VERSION + 4].copy_from_slice(&HWX_VERSION.to_le_bytes());
        bytes[header::TD_OFFSET..header::TD_OFFSET + 4].copy_from_slice(&(TD_ARRAY_OFFSET as u32).to_le_bytes());
        bytes[header::TD_COUNT..header::TD_COUNT + 4].copy_from_slice(&2u32.to_le_bytes());
        let data_offset = bytes.len() as u64;
        bytes[header::DATA_OFFSET..header::DATA_OFFSET + 8].copy_from_slice(&data_offset.to_le_bytes());
        bytes[program::record_offset(0)..program::record_offset(1)].copy_from_slice(first.as_bytes());
        bytes[program::record_offset(2)..].copy_from_slice(second.as_bytes());

        let back = HwxContainer::read(&bytes).unwrap();
        assert_eq!(back.chain_len(), 2);
        assert_eq!(back.write(), bytes);

        bytes[program::record_offset(1) + 5] = 1;
        assert!(matches!(HwxContainer::read(&bytes), Err(HwxError::InvalidContainer { .. })));
    }

    #[test]
    fn long_relocation_name_rejected() {
        let relocs = vec![Relocation::surface("x".repeat(41), 0, 0)];
        assert!(HwxContainer::from_records(chained(1), relocs, Bytes::new()).is_err());
    }

    #[test]
    fn unlinked_records_rejected() {
        let mut tds = chained(2);
        tds[0].set_last().unwrap();
        assert!(matches!(
            HwxContainer::from_records(tds, Vec::new(), Bytes::new()),
            Err(HwxError::InvalidContainer { .. })
        ));
    }
}
