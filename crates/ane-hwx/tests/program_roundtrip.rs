// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end: assemble → write → read → diff.

use ane_chip::{Activation, ActivationKind, DType, Section, TensorDesc, TensorShape};
use ane_hwx::{diff, Assembler, ElementWiseOp, HwxContainer, LayoutPolicy, Network, OpKind, OpRequest, Operand};

fn f16(dims: [u32; 5]) -> TensorDesc {
    TensorDesc::new(TensorShape::from_dims(dims), DType::Float16)
}

fn elementwise_add() -> Network {
    let t = f16([1, 1, 1, 1, 64]);
    Network {
        inputs: vec![t, t],
        ops: vec![OpRequest::new(
            OpKind::ElementWise { op: ElementWiseOp::Add },
            vec![Operand::Input(0), Operand::Input(1)],
            t,
        )],
    }
}

#[test]
fn elementwise_add_scenario() {
    let program = Assembler::default().assemble(&elementwise_add()).unwrap();
    assert_eq!(program.len(), 1);

    let td = &program.records()[0].td;
    let used = td.used_kernel_channels().unwrap();
    assert!(used.contains(&0) && used.contains(&1));
    assert_eq!(td.input_dtype().unwrap(), DType::Float16);
    assert_eq!(td.output_dtype().unwrap(), DType::Float16);
    assert_eq!(td.activation().unwrap().kind, ActivationKind::None);
    assert_eq!(td.next_pointer().unwrap(), 0);

    let parsed = HwxContainer::read(&program.write()).unwrap();
    let before: Vec<_> = td.fields().collect();
    let after: Vec<_> = parsed.records()[0].td.fields().collect();
    assert_eq!(before, after);
    assert!(diff(&program, &parsed).is_empty());
}

#[test]
fn written_bytes_are_stable_through_read() {
    let bytes = Assembler::default().assemble(&elementwise_add()).unwrap().write();
    let again = HwxContainer::read(&bytes).unwrap().write();
    assert_eq!(again, bytes);
}

#[test]
fn chain_length_matches_record_count() {
    let t = f16([1, 1, 2, 4, 16]);
    let mut ops = vec![OpRequest::new(OpKind::Activation, vec![Operand::Input(0)], t)
        .with_activation(Activation::of(ActivationKind::Relu))];
    for i in 0..5 {
        ops.push(OpRequest::new(
            OpKind::ElementWise { op: ElementWiseOp::Add },
            vec![Operand::Op(i), Operand::Input(0)],
            t,
        ));
    }
    let net = Network { inputs: vec![t], ops };

    for policy in [LayoutPolicy::default(), LayoutPolicy::without_fusion()] {
        let program = Assembler::new(policy).assemble(&net).unwrap();
        let parsed = HwxContainer::read(&program.write()).unwrap();
        assert_eq!(parsed.chain_len(), parsed.len());
        let terminators = parsed.tds().filter(|td| td.next_pointer().unwrap() == 0).count();
        assert_eq!(terminators, 1);
        parsed.validate().unwrap();
    }
}

#[test]
fn diff_reports_changed_activation() {
    let a = Assembler::default().assemble(&elementwise_add()).unwrap();
    let mut net = elementwise_add();
    net.ops[0].activation = Activation::of(ActivationKind::Tanh);
    let b = Assembler::default().assemble(&net).unwrap();

    let d = diff(&a, &b);
    assert!(!d.is_empty());
    assert!(d.iter().all(|f| f.record == 0));
    assert!(d.iter().any(|f| f.section == Section::Ne));
}

#[test]
fn program_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("add.hwx");
    let program = Assembler::default().assemble(&elementwise_add()).unwrap();
    program.write_file(&path).unwrap();
    let loaded = HwxContainer::from_file(&path).unwrap();
    assert_eq!(loaded, program);
}

#[test]
fn network_file_compiles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("net.json");
    std::fs::write(&path, elementwise_add().to_json().unwrap()).unwrap();
    let net = Network::from_file(&path).unwrap();
    assert_eq!(net, elementwise_add());
    assert_eq!(Assembler::default().assemble(&net).unwrap().len(), 1);
}
