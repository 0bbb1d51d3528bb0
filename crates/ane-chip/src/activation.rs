// SPDX-License-Identifier: AGPL-3.0-only

//! Neuron-engine activation catalogue.
//!
//! The selector lives in `NE.MACCfg.NonlinearMode` (6 bits). Only the codes
//! listed here are recognised; anything else is rejected by validation.
//! Scalar parameters go to `NE.ActParamA` / `NE.ActParamB` as float16.

use crate::error::{ChipError, Result};
use half::f16;
use serde::{Deserialize, Serialize};

macro_rules! activation_kinds {
    ($($(#[$doc:meta])* $name:ident = $code:literal),+ $(,)?) => {
        /// Activation selector.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum ActivationKind {
            $($(#[$doc])* $name,)+
        }

        impl ActivationKind {
            /// Every recognised selector.
            pub const ALL: &'static [Self] = &[$(Self::$name,)+];

            /// Selector code.
            #[must_use]
            pub const fn code(self) -> u64 {
                match self {
                    $(Self::$name => $code,)+
                }
            }

            /// Decode a selector.
            ///
            /// # Errors
            ///
            /// Returns `UnknownActivation` for unrecognised codes.
            pub fn from_code(code: u64) -> Result<Self> {
                match code {
                    $($code => Ok(Self::$name),)+
                    _ => Err(ChipError::UnknownActivation { code }),
                }
            }
        }
    };
}

activation_kinds! {
    /// Identity.
    #[default]
    None = 0,
    /// max(x, 0).
    Relu = 1,
    /// min(max(x, 0), 6).
    Relu6 = 2,
    /// x for x > 0, `a`·x otherwise.
    LeakyRelu = 3,
    /// Clamp to [`a`, `b`].
    Clamp = 4,
    /// Logistic.
    Sigmoid = 5,
    /// Hyperbolic tangent.
    Tanh = 6,
    /// Piecewise-linear sigmoid, slope `a`, offset `b`.
    HardSigmoid = 7,
    /// x · hard_sigmoid(x).
    HardSwish = 8,
    /// Exponential linear unit, scale `a`.
    Elu = 9,
    /// Scaled ELU.
    Selu = 10,
    /// Gaussian error linear unit.
    Gelu = 11,
    /// x · sigmoid(x).
    Silu = 12,
    /// x · tanh(softplus(x)).
    Mish = 13,
    /// ln(1 + eˣ).
    Softplus = 14,
    /// x / (1 + |x|).
    Softsign = 15,
    /// eˣ.
    Exp = 16,
    /// Natural log.
    Log = 17,
    /// Square root.
    Sqrt = 18,
    /// Reciprocal square root.
    Rsqrt = 19,
    /// 1 / x.
    Reciprocal = 20,
    /// x².
    Square = 21,
    /// |x|.
    Abs = 22,
    /// Sign.
    Sign = 23,
    /// Floor.
    Floor = 24,
    /// Ceil.
    Ceil = 25,
    /// Round half to even.
    Round = 26,
    /// Sine.
    Sin = 27,
    /// Cosine.
    Cos = 28,
    /// Error function.
    Erf = 29,
    /// 1 if x > `a` else 0.
    Threshold = 30,
    /// Custom lookup table; requires a LUT payload.
    Lut = 31,
}

impl ActivationKind {
    /// True for the kind that needs a LUT payload.
    #[must_use]
    pub const fn needs_lut(self) -> bool {
        matches!(self, Self::Lut)
    }
}

/// Activation selector with its scalar parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Activation {
    /// Selector.
    pub kind: ActivationKind,
    /// First parameter (slope, minimum, alpha, threshold).
    #[serde(default)]
    pub a: f32,
    /// Second parameter (maximum, offset).
    #[serde(default)]
    pub b: f32,
}

impl Activation {
    /// No activation.
    pub const NONE: Self = Self::of(ActivationKind::None);

    /// Parameterless activation.
    #[must_use]
    pub const fn of(kind: ActivationKind) -> Self {
        Self { kind, a: 0.0, b: 0.0 }
    }

    /// Leaky ReLU with the given negative slope.
    #[must_use]
    pub const fn leaky_relu(slope: f32) -> Self {
        Self { kind: ActivationKind::LeakyRelu, a: slope, b: 0.0 }
    }

    /// Clamp to `[min, max]`.
    #[must_use]
    pub const fn clamp(min: f32, max: f32) -> Self {
        Self { kind: ActivationKind::Clamp, a: min, b: max }
    }

    /// True if this is the identity.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.kind == ActivationKind::None
    }
}

/// Lookup-table payload for [`ActivationKind::Lut`].
#[derive(Debug, Clone, PartialEq)]
pub struct Lut(Vec<f16>);

impl Lut {
    /// Most entries the `NE.LutEntries` field can describe.
    pub const MAX_ENTRIES: usize = 1023;

    /// Build from float32 samples (down-converted to float16).
    #[must_use]
    pub fn from_f32(samples: &[f32]) -> Self {
        Self(samples.iter().map(|&v| f16::from_f32(v)).collect())
    }

    /// Parse little-endian float16 bytes; an odd trailing byte is ignored.
    #[must_use]
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        Self(
            bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]))
                .collect(),
        )
    }

    /// Little-endian float16 bytes.
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
