//! Neutrosophic value type.
//!
//! Every evaluator reply reduces to a triple of independent coordinates:
//! truth (clarity, reciprocity), indeterminacy (ambiguity), and falsehood
//! (manipulation, extraction). There is no sum-to-one constraint; the three
//! axes are assessed independently.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An immutable truth/indeterminacy/falsehood triple, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTriple")]
pub struct NeutrosophicValue {
    truth: f64,
    indeterminacy: f64,
    falsehood: f64,
}

/// Unvalidated wire form used for deserialization.
#[derive(Debug, Clone, Copy, Deserialize)]
struct RawTriple {
    truth: f64,
    indeterminacy: f64,
    falsehood: f64,
}

impl TryFrom<RawTriple> for NeutrosophicValue {
    type Error = Error;

    fn try_from(raw: RawTriple) -> Result<Self> {
        Self::new(raw.truth, raw.indeterminacy, raw.falsehood)
    }
}

fn in_unit_range(v: f64) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

impl NeutrosophicValue {
    /// Construct a validated triple.
    ///
    /// Rejects any coordinate that is non-finite or outside [0, 1].
    pub fn new(truth: f64, indeterminacy: f64, falsehood: f64) -> Result<Self> {
        if !in_unit_range(truth) || !in_unit_range(indeterminacy) || !in_unit_range(falsehood) {
            return Err(Error::InvalidNeutrosophic {
                truth,
                indeterminacy,
                falsehood,
            });
        }
        Ok(Self {
            truth,
            indeterminacy,
            falsehood,
        })
    }

    /// Construct by clamping each coordinate into [0, 1].
    ///
    /// Returns the value plus a flag indicating whether any coordinate was
    /// actually clamped (non-finite input still fails).
    pub fn clamped(truth: f64, indeterminacy: f64, falsehood: f64) -> Result<(Self, bool)> {
        if !truth.is_finite() || !indeterminacy.is_finite() || !falsehood.is_finite() {
            return Err(Error::InvalidNeutrosophic {
                truth,
                indeterminacy,
                falsehood,
            });
        }
        let t = truth.clamp(0.0, 1.0);
        let i = indeterminacy.clamp(0.0, 1.0);
        let f = falsehood.clamp(0.0, 1.0);
        let coerced = t != truth || i != indeterminacy || f != falsehood;
        Ok((
            Self {
                truth: t,
                indeterminacy: i,
                falsehood: f,
            },
            coerced,
        ))
    }

    pub fn truth(&self) -> f64 {
        self.truth
    }

    pub fn indeterminacy(&self) -> f64 {
        self.indeterminacy
    }

    pub fn falsehood(&self) -> f64 {
        self.falsehood
    }

    /// Quick directional signal: positive leans reciprocal, negative leans
    /// extractive. Not the full ayni balance; aggregation happens elsewhere.
    pub fn balance_hint(&self) -> f64 {
        self.truth - self.falsehood
    }
}

impl std::fmt::Display for NeutrosophicValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "T={:.2} I={:.2} F={:.2}",
            self.truth, self.indeterminacy, self.falsehood
        )
    }
}
