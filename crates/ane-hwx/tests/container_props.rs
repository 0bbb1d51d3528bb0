// SPDX-License-Identifier: AGPL-3.0-only

//! Property tests for the container codec and diff.

use ane_chip::{Activation, ActivationKind, DType, TensorDesc, TensorShape};
use ane_chip::program::{self, header};
use ane_hwx::{
    diff, Assembler, ElementWiseOp, HwxContainer, HwxError, LayoutPolicy, Network, OpKind, OpRequest, Operand,
};
use proptest::prelude::*;

fn activation() -> impl Strategy<Value = Activation> {
    let kinds: Vec<ActivationKind> = ActivationKind::ALL
        .iter()
        .copied()
        .filter(|k| !k.needs_lut())
        .collect();
    prop::sample::select(kinds).prop_map(Activation::of)
}

fn network() -> impl Strategy<Value = Network> {
    (1u32..=8, prop::collection::vec((any::<bool>(), activation()), 1..8)).prop_map(|(cols, steps)| {
        let t = TensorDesc::new(TensorShape::from_dims([1, 1, 2, 2, cols * 16]), DType::Float16);
        let ops = steps
            .into_iter()
            .enumerate()
            .map(|(i, (binary, act))| {
                let prev = if i == 0 { Operand::Input(0) } else { Operand::Op(i - 1) };
                let req = if binary {
                    OpRequest::new(
                        OpKind::ElementWise { op: ElementWiseOp::Max },
                        vec![prev, Operand::Input(1)],
                        t,
                    )
                } else {
                    OpRequest::new(OpKind::Activation, vec![prev], t)
                };
                req.with_activation(act)
            })
            .collect();
        Network { inputs: vec![t, t], ops }
    })
}

proptest! {
    #[test]
    fn write_read_is_exact(net in network(), fusion in any::<bool>()) {
        let policy = if fusion { LayoutPolicy::default() } else { LayoutPolicy::without_fusion() };
        let bytes = Assembler::new(policy).assemble(&net).unwrap().write();
        let parsed = HwxContainer::read(&bytes).unwrap();
        prop_assert_eq!(parsed.write(), bytes);
        prop_assert_eq!(parsed.chain_len(), parsed.len());
    }

    #[test]
    fn self_diff_is_empty(net in network()) {
        let c = Assembler::default().assemble(&net).unwrap();
        prop_assert!(diff(&c, &c).is_empty());
    }

    #[test]
    fn diff_is_symmetric(a in network(), b in network()) {
        let (a, b) = (Assembler::default().assemble(&a).unwrap(), Assembler::default().assemble(&b).unwrap());
        let ab = diff(&a, &b);
        let ba: Vec<_> = diff(&b, &a).iter().map(|d| d.swapped()).collect();
        prop_assert_eq!(ab, ba);
    }

    #[test]
    fn accepted_bytes_write_back_unchanged(net in network(), at in any::<prop::sample::Index>(), flip in 1u8..=255) {
        let mut bytes = Assembler::default().assemble(&net).unwrap().write();
        let i = at.index(bytes.len());
        bytes[i] ^= flip;
        if let Ok(parsed) = HwxContainer::read(&bytes) {
            prop_assert_eq!(parsed.write(), bytes);
        }
    }

    #[test]
    fn non_zero_reserved_bytes_are_rejected(
        net in network(),
        at in prop_oneof![
            header::RESERVED..program::HEADER_SIZE,
            0x1000usize..program::TD_ARRAY_OFFSET,
        ],
        value in 1u8..=255,
    ) {
        let mut bytes = Assembler::default().assemble(&net).unwrap().write();
        bytes[at] = value;
        let is_invalid_container = matches!(HwxContainer::read(&bytes), Err(HwxError::InvalidContainer { .. }));
        prop_assert!(is_invalid_container);
    }

    #[test]
    fn read_never_panics(mut bytes in prop::collection::vec(any::<u8>(), 0..0x5000), keep_magic in any::<bool>()) {
        if keep_magic && bytes.len() >= 8 {
            bytes[..4].copy_from_slice(&ane_chip::program::HWX_MAGIC.to_le_bytes());
            bytes[4..8].copy_from_slice(&ane_chip::program::HWX_VERSION.to_le_bytes());
        }
        if let Err(e) = HwxContainer::read(&bytes) {
            prop_assert!(e.is_container_error());
        }
    }

    #[test]
    fn corrupted_links_are_rejected(net in network(), link in any::<u32>()) {
        let c = Assembler::new(LayoutPolicy::without_fusion()).assemble(&net).unwrap();
        let mut bytes = c.write();
        let field = ane_chip::RegisterTable::builtin().lookup("Header.NextPointer").unwrap();
        let first = ane_chip::program::TD_ARRAY_OFFSET;
        ane_chip::bitfield::pack(&mut bytes[first..first + ane_chip::TD_SIZE], field, u64::from(link)).unwrap();
        match HwxContainer::read(&bytes) {
            Ok(parsed) => prop_assert_eq!(parsed.chain_len(), parsed.len()),
            Err(e) => prop_assert!(e.is_container_error()),
        }
    }
}
