// SPDX-License-Identifier: AGPL-3.0-only

//! Network description: the ordered operation requests a program is built from.
//!
//! This is the input of the assembler and the JSON document accepted by the
//! compile path:
//!
//! ```json
//! {
//!   "inputs": [
//!     {"shape": [1, 1, 1, 1, 64], "dtype": "float16"},
//!     {"shape": [1, 1, 1, 1, 64], "dtype": "float16"}
//!   ],
//!   "ops": [
//!     {
//!       "kind": {"type": "element_wise", "op": "add"},
//!       "inputs": [{"input": 0}, {"input": 1}],
//!       "output": {"shape": [1, 1, 1, 1, 64], "dtype": "float16"}
//!     }
//!   ]
//! }
//! ```

use crate::error::{HwxError, Result};
use crate::ops::OpKind;
use ane_chip::{Activation, TensorDesc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where an operation reads an operand from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// Program input `n`.
    Input(usize),
    /// Output of an earlier operation.
    Op(usize),
}

/// One abstract operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpRequest {
    /// Operation kind and its parameters.
    pub kind: OpKind,
    /// Operands, in port order.
    pub inputs: Vec<Operand>,
    /// Output tensor.
    pub output: TensorDesc,
    /// Activation applied to the output.
    #[serde(default)]
    pub activation: Activation,
    /// Float32 coefficients, down-converted to float16 when assembled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f32>>,
    /// Lookup-table samples for the LUT activation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lut: Option<Vec<f32>>,
}

impl OpRequest {
    /// Request with no activation, weights or LUT.
    pub fn new(kind: OpKind, inputs: Vec<Operand>, output: TensorDesc) -> Self {
        Self {
            kind,
            inputs,
            output,
            activation: Activation::NONE,
            weights: None,
            lut: None,
        }
    }

    /// Builder: set the activation.
    #[must_use]
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Builder: attach weights.
    #[must_use]
    pub fn with_weights(mut self, weights: Vec<f32>) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Builder: attach LUT samples.
    #[must_use]
    pub fn with_lut(mut self, lut: Vec<f32>) -> Self {
        self.lut = Some(lut);
        self
    }
}

/// Program inputs plus the ordered operation sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    /// Program input tensors.
    pub inputs: Vec<TensorDesc>,
    /// Operations in execution order.
    pub ops: Vec<OpRequest>,
}

impl Network {
    /// Parse a JSON description.
    ///
    /// # Errors
    ///
    /// Returns `Description` if the JSON does not match the schema.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON description file.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `Description`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Loading network description from: {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Serialize to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns `Description` if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Tensor an operand refers to.
    pub fn operand_desc(&self, operand: Operand) -> Option<&TensorDesc> {
        match operand {
            Operand::Input(n) => self.inputs.get(n),
            Operand::Op(n) => self.ops.get(n).map(|op| &op.output),
        }
    }

    /// How many times each operation's output is read by later operations.
    pub fn consumer_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.ops.len()];
        for op in &self.ops {
            for operand in &op.inputs {
                if let Operand::Op(n) = *operand {
                    if let Some(c) = counts.get_mut(n) {
                        *c += 1;
                    }
                }
            }
        }
        counts
    }

    /// Operations whose output no later operation reads.
    pub fn output_ops(&self) -> Vec<usize> {
        self.consumer_counts()
            .iter()
            .enumerate()
            .filter_map(|(i, &c)| (c == 0).then_some(i))
            .collect()
    }

    /// Check operand references, arity and tensor extents.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperand` for a forward or dangling reference, a wrong
    /// operand count, an empty tensor, or an empty network.
    pub fn validate(&self) -> Result<()> {
        if self.ops.is_empty() {
            return Err(HwxError::invalid_operand(0, "network has no operations"));
        }
        for (n, desc) in self.inputs.iter().enumerate() {
            if desc.shape.element_count() == 0 {
                return Err(HwxError::invalid_operand(0, format!("input {n} has an empty shape")));
            }
        }

        for (index, op) in self.ops.iter().enumerate() {
            for operand in &op.inputs {
                let ok = match *operand {
                    Operand::Input(n) => n < self.inputs.len(),
                    Operand::Op(n) => n < index,
                };
                if !ok {
                    return Err(HwxError::invalid_operand(
                        index,
                        format!("{operand:?} does not refer to an input or an earlier op"),
                    ));
                }
            }
            op.kind.check_arity(index, op.inputs.len(), op.weights.is_some())?;
            if op.output.shape.element_count() == 0 {
                return Err(HwxError::invalid_operand(index, "output shape is empty"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ElementWiseOp;
    use ane_chip::{ActivationKind, DType, TensorShape};

    fn f16(dims: [u32; 5]) -> TensorDesc {
        TensorDesc::new(TensorShape::from_dims(dims), DType::Float16)
    }

    #[test]
    fn parses_documented_example() {
        let json = r#"{
            "inputs": [
                {"shape": [1, 1, 1, 1, 64], "dtype": "float16"},
                {"shape": [1, 1, 1, 1, 64], "dtype": "float16"}
            ],
            "ops": [{
                "kind": {"type": "element_wise", "op": "add"},
                "inputs": [{"input": 0}, {"input": 1}],
                "output": {"shape": [1, 1, 1, 1, 64], "dtype": "float16"},
                "activation": {"kind": "relu"}
            }]
        }"#;
        let net = Network::from_json(json).unwrap();
        assert_eq!(net.ops.len(), 1);
        assert_eq!(net.ops[0].kind, OpKind::ElementWise { op: ElementWiseOp::Add });
        assert_eq!(net.ops[0].activation.kind, ActivationKind::Relu);
        net.validate().unwrap();
    }

    #[test]
    fn json_round_trip() {
        let net = Network {
            inputs: vec![f16([1, 1, 4, 8, 8])],
            ops: vec![OpRequest::new(OpKind::Reshape, vec![Operand::Input(0)], f16([1, 1, 1, 16, 16]))],
        };
        let back = Network::from_json(&net.to_json().unwrap()).unwrap();
        assert_eq!(back, net);
    }

    #[test]
    fn malformed_json_is_a_description_error() {
        assert!(matches!(
            Network::from_json(r#"{"inputs": 3}"#),
            Err(HwxError::Description { .. })
        ));
    }

    #[test]
    fn forward_references_rejected() {
        let net = Network {
            inputs: vec![f16([1, 1, 1, 1, 8])],
            ops: vec![
                OpRequest::new(OpKind::Activation, vec![Operand::Op(1)], f16([1, 1, 1, 1, 8])),
                OpRequest::new(OpKind::Activation, vec![Operand::Input(0)], f16([1, 1, 1, 1, 8])),
            ],
        };
        assert!(matches!(net.validate(), Err(HwxError::InvalidOperand { index: 0, .. })));
    }

    #[test]
    fn consumers_and_outputs() {
        let net = Network {
            inputs: vec![f16([1, 1, 1, 1, 8])],
            ops: vec![
                OpRequest::new(OpKind::Activation, vec![Operand::Input(0)], f16([1, 1, 1, 1, 8])),
                OpRequest::new(
                    OpKind::ElementWise { op: ElementWiseOp::Mul },
                    vec![Operand::Op(0), Operand::Op(0)],
                    f16([1, 1, 1, 1, 8]),
                ),
            ],
        };
        assert_eq!(net.consumer_counts(), vec![2, 0]);
        assert_eq!(net.output_ops(), vec![1]);
    }
}
