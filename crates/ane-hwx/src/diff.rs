// SPDX-License-Identifier: AGPL-3.0-only

//! Field-level structural diff between two containers.
//!
//! Records are paired by chain position and compared field by field through
//! the register table, so differences read as `TD[0] NE.MACCfg.NonlinearMode:
//! 3 vs 7` rather than byte offsets. A record present on one side only is
//! reported as every non-zero field against `-`. Alias fields are skipped so
//! a change is reported once.

use crate::container::HwxContainer;
use ane_chip::{bitfield, RegisterField, Section, TileDescriptor};
use std::fmt;

/// One differing field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDifference {
    /// Record position in the chain.
    pub record: usize,
    /// Section of the field.
    pub section: Section,
    /// Field name within the section.
    pub field: String,
    /// Raw value in the first container (`None` if the record is missing).
    pub a: Option<u64>,
    /// Raw value in the second container.
    pub b: Option<u64>,
    /// Field width, for sign extension of signed fields.
    width: u8,
    signed: bool,
}

impl FieldDifference {
    fn new(record: usize, field: &RegisterField, a: Option<u64>, b: Option<u64>) -> Self {
        Self {
            record,
            section: field.section,
            field: field.name.clone(),
            a,
            b,
            width: field.width,
            signed: field.signed,
        }
    }

    /// `Section.Field`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.section, self.field)
    }

    /// The same difference seen from the other side.
    #[must_use]
    pub fn swapped(&self) -> Self {
        Self {
            a: self.b,
            b: self.a,
            ..self.clone()
        }
    }

    fn render(&self, value: Option<u64>) -> String {
        match value {
            None => "-".to_string(),
            Some(raw) if self.signed && self.width < 64 => {
                let shift = 64 - u32::from(self.width);
                #[allow(clippy::cast_possible_wrap)]
                let v = ((raw << shift) as i64) >> shift;
                v.to_string()
            }
            #[allow(clippy::cast_possible_wrap)]
            Some(raw) if self.signed => (raw as i64).to_string(),
            Some(raw) if raw > 0xFFFF => format!("{raw:#x}"),
            Some(raw) => raw.to_string(),
        }
    }
}

impl fmt::Display for FieldDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TD[{}] {}: {} vs {}",
            self.record,
            self.qualified_name(),
            self.render(self.a),
            self.render(self.b)
        )
    }
}

/// Compare two containers record by record.
pub fn diff(a: &HwxContainer, b: &HwxContainer) -> Vec<FieldDifference> {
    let a_tds: Vec<&TileDescriptor> = a.tds().collect();
    let b_tds: Vec<&TileDescriptor> = b.tds().collect();
    let mut out = Vec::new();

    for index in 0..a_tds.len().max(b_tds.len()) {
        diff_records(index, a_tds.get(index).copied(), b_tds.get(index).copied(), &mut out);
    }

    tracing::debug!("diff: {} field difference(s)", out.len());
    out
}

/// Compare two records; either side may be missing.
pub fn diff_records(
    index: usize,
    a: Option<&TileDescriptor>,
    b: Option<&TileDescriptor>,
    out: &mut Vec<FieldDifference>,
) {
    let Some(table) = a.or(b).map(TileDescriptor::table) else {
        return;
    };
    for field in table.iter().filter(|f| !f.alias) {
        let va = a.map(|td| bitfield::unpack(&td.as_bytes()[..], field));
        let vb = b.map(|td| bitfield::unpack(&td.as_bytes()[..], field));
        let differs = match (va, vb) {
            (Some(x), Some(y)) => x != y,
            (Some(v), None) | (None, Some(v)) => v != 0,
            (None, None) => false,
        };
        if differs {
            out.push(FieldDifference::new(index, field, va, vb));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Relocation;
    use ane_chip::program::record_offset;
    use ane_chip::{Activation, ActivationKind};
    use bytes::Bytes;

    fn container(tds: Vec<TileDescriptor>) -> HwxContainer {
        let n = tds.len();
        let tds = tds
            .into_iter()
            .enumerate()
            .map(|(i, mut td)| {
                if i + 1 < n {
                    td.set_next(record_offset(i + 1) as u32).unwrap();
                } else {
                    td.set_last().unwrap();
                }
                td
            })
            .collect();
        HwxContainer::from_records(tds, Vec::<Relocation>::new(), Bytes::new()).unwrap()
    }

    #[test]
    fn identical_is_empty() {
        let mut td = TileDescriptor::new();
        td.set_activation(&Activation::of(ActivationKind::Relu)).unwrap();
        let c = container(vec![td]);
        assert!(diff(&c, &c).is_empty());
    }

    #[test]
    fn reports_field_names_and_values() {
        let mut a = TileDescriptor::new();
        a.set("NE.MACCfg.NonlinearMode", 3).unwrap();
        let mut b = TileDescriptor::new();
        b.set("NE.MACCfg.NonlinearMode", 7).unwrap();
        let d = diff(&container(vec![a]), &container(vec![b]));
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].to_string(), "TD[0] NE.MACCfg.NonlinearMode: 3 vs 7");
    }

    #[test]
    fn signed_fields_render_signed() {
        let a = TileDescriptor::new();
        let mut b = TileDescriptor::new();
        b.set_signed("Common.ConvCfg.Px", -2).unwrap();
        let d = diff(&container(vec![a]), &container(vec![b]));
        assert_eq!(d[0].to_string(), "TD[0] Common.ConvCfg.Px: 0 vs -2");
    }

    #[test]
    fn symmetric() {
        let mut a = TileDescriptor::new();
        a.set_task_id(4).unwrap();
        a.set("Common.Cin", 9).unwrap();
        let mut b = TileDescriptor::new();
        b.set("TileDMADst.DstRowStride", 0x80).unwrap();
        let (ca, cb) = (container(vec![a.clone(), a]), container(vec![b]));
        let ab = diff(&ca, &cb);
        let ba: Vec<_> = diff(&cb, &ca).iter().map(FieldDifference::swapped).collect();
        assert_eq!(ab, ba);
        assert!(ab.iter().any(|d| d.record == 1 && d.b.is_none()));
    }
}
