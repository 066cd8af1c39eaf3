//! Ayni balance and trust field arithmetic.
//!
//! Everything downstream of the evaluators is pure arithmetic over
//! neutrosophic values, and all of it lives here: balance, exchange
//! classification, trust strength, and the closed violation rule set.
//! Analysis code consumes these metrics; it never re-derives them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::context::{LayerRole, PromptContext};
use crate::markers;
use crate::neutrosophic::NeutrosophicValue;

/// Classification of what kind of exchange the context represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeType {
    Generative,
    Reciprocal,
    Neutral,
    Extractive,
    Manipulative,
}

/// Closed set of trust violations the rule set can derive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustViolationKind {
    RoleConfusion,
    ContextSaturation,
    PoliteExtraction,
    TemporalInconsistency,
    AuthorityClaim,
    EncodingObfuscation,
    TrustCollapse,
    TrustDegradation,
    InappropriateCompliance,
}

impl TrustViolationKind {
    /// Map an evaluator-reported pattern name onto a violation kind.
    pub fn from_pattern_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "role_confusion" | "role_reversal" => Some(Self::RoleConfusion),
            "context_saturation" => Some(Self::ContextSaturation),
            "polite_extraction" => Some(Self::PoliteExtraction),
            "temporal_inconsistency" | "fabricated_history" => Some(Self::TemporalInconsistency),
            "authority_claim" => Some(Self::AuthorityClaim),
            "encoding_obfuscation" | "homoglyph" | "obfuscation" => Some(Self::EncodingObfuscation),
            "inappropriate_compliance" => Some(Self::InappropriateCompliance),
            _ => None,
        }
    }
}

/// Trust field: how much relational trust the context supports, and which
/// violations undermine it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustField {
    /// max(0, T − F − I/2), clamped to [0, 1]
    pub strength: f64,
    pub violations: BTreeSet<TrustViolationKind>,
}

/// Per-layer neutrosophic assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerAssessment {
    pub role: LayerRole,
    pub value: NeutrosophicValue,
    /// Whether this layer's value came from evaluators targeting it, as
    /// opposed to a whole-context value attributed uniformly.
    pub directly_evaluated: bool,
}

/// Reciprocity metrics for one evaluated prompt context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReciprocityMetrics {
    /// Aggregated value across all layers and evaluators
    pub overall: NeutrosophicValue,
    pub layers: Vec<LayerAssessment>,
    /// T − F, clamped to [−1, 1]
    pub ayni_balance: f64,
    pub exchange_type: ExchangeType,
    pub trust_field: TrustField,
    /// High truth with meaningful indeterminacy and low falsehood:
    /// productive creative tension rather than a violation
    pub tension_productive: bool,
    pub needs_adjustment: bool,
    /// Concatenated evaluator reasoning, tagged by model
    pub reasoning: String,
    /// Labels of evaluators that failed and were dropped from aggregation
    pub warnings: Vec<String>,
}

/// Session facts the violation rules need.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViolationContext {
    /// The conversation already holds at least one recorded turn
    pub session_has_prior_turns: bool,
    /// Balance of the paired pre-evaluation, when scoring a response
    pub pre_balance: Option<f64>,
}

/// Element-wise max across evaluator values: the dominant-signal rule.
/// If any evaluator sees manipulation, the pipeline should too.
pub fn aggregate(values: &[NeutrosophicValue]) -> Option<NeutrosophicValue> {
    if values.is_empty() {
        return None;
    }
    let t = values.iter().map(|v| v.truth()).fold(0.0f64, f64::max);
    let i = values.iter().map(|v| v.indeterminacy()).fold(0.0f64, f64::max);
    let f = values.iter().map(|v| v.falsehood()).fold(0.0f64, f64::max);
    NeutrosophicValue::new(t, i, f).ok()
}

/// T − F, clamped to [−1, 1].
pub fn ayni_balance(value: &NeutrosophicValue) -> f64 {
    (value.truth() - value.falsehood()).clamp(-1.0, 1.0)
}

/// Classify the exchange from the aggregated value.
pub fn classify_exchange(value: &NeutrosophicValue) -> ExchangeType {
    let t = value.truth();
    let i = value.indeterminacy();
    let f = value.falsehood();

    if f >= 0.7 {
        ExchangeType::Manipulative
    } else if f >= 0.5 {
        ExchangeType::Extractive
    } else if t >= 0.7 && i <= 0.3 {
        ExchangeType::Generative
    } else if t >= 0.5 {
        ExchangeType::Reciprocal
    } else {
        ExchangeType::Neutral
    }
}

/// Trust strength: max(0, T − F − I/2), clamped to [0, 1].
pub fn trust_strength(value: &NeutrosophicValue) -> f64 {
    (value.truth() - value.falsehood() - value.indeterminacy() / 2.0).clamp(0.0, 1.0)
}

/// Derive trust violations from per-layer values, auxiliary phrase markers,
/// evaluator-observed patterns, and session deltas. A small closed rule set,
/// not free-form inference; markers gate the authority-claim and
/// fabricated-history rules, they never score. Every other violation kind
/// arrives through evaluator pattern reports or the balance-delta rules.
pub fn derive_violations(
    layers: &[LayerAssessment],
    context: &PromptContext,
    vctx: &ViolationContext,
    observed_patterns: &[String],
    overall_balance: f64,
) -> BTreeSet<TrustViolationKind> {
    let mut violations = BTreeSet::new();

    for assessment in layers {
        let f = assessment.value.falsehood();
        match assessment.role {
            LayerRole::User => {
                let Some(layer) = context.layer(LayerRole::User) else {
                    continue;
                };
                if f >= 0.6 && markers::has_authority_marker(&layer.content) {
                    violations.insert(TrustViolationKind::AuthorityClaim);
                }
                if !vctx.session_has_prior_turns && markers::claims_prior_turns(&layer.content) {
                    violations.insert(TrustViolationKind::TemporalInconsistency);
                }
            }
            LayerRole::System => {
                if assessment.directly_evaluated && f >= 0.5 {
                    violations.insert(TrustViolationKind::RoleConfusion);
                }
            }
            LayerRole::Application | LayerRole::PriorAssistant => {}
        }
    }

    for pattern in observed_patterns {
        if let Some(kind) = TrustViolationKind::from_pattern_name(pattern) {
            violations.insert(kind);
        }
    }

    if let Some(pre) = vctx.pre_balance {
        if overall_balance < pre - 0.7 {
            // Collapse supersedes degradation
            violations.insert(TrustViolationKind::TrustCollapse);
        } else if overall_balance < pre - 0.5 {
            violations.insert(TrustViolationKind::TrustDegradation);
        }
    }

    violations
}

/// Assemble the full metrics record from an aggregated value.
pub fn build_metrics(
    overall: NeutrosophicValue,
    layers: Vec<LayerAssessment>,
    context: &PromptContext,
    vctx: &ViolationContext,
    observed_patterns: &[String],
    reasoning: String,
    warnings: Vec<String>,
) -> ReciprocityMetrics {
    let balance = ayni_balance(&overall);
    let violations = derive_violations(&layers, context, vctx, observed_patterns, balance);
    let tension_productive =
        overall.truth() > 0.5 && overall.indeterminacy() > 0.3 && overall.falsehood() < 0.3;
    let needs_adjustment = balance < 0.0 || !violations.is_empty();

    ReciprocityMetrics {
        exchange_type: classify_exchange(&overall),
        trust_field: TrustField {
            strength: trust_strength(&overall),
            violations,
        },
        ayni_balance: balance,
        tension_productive,
        needs_adjustment,
        overall,
        layers,
        reasoning,
        warnings,
    }
}

/// Downstream decision hint derived from metrics and the session trust
/// delta. Consumption of the metrics, not a second aggregation; callers
/// remain free to apply their own policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Flag,
    Reject,
}

/// Apply the canonical decision thresholds.
pub fn decide(metrics: &ReciprocityMetrics, trust_delta: Option<f64>) -> Decision {
    if let Some(delta) = trust_delta {
        if delta < -0.7 {
            return Decision::Reject;
        }
        if delta < -0.5 {
            return Decision::Flag;
        }
    }

    let f = metrics.overall.falsehood();
    let violations = &metrics.trust_field.violations;

    if f > 0.7
        || violations.len() >= 3
        || violations.contains(&TrustViolationKind::InappropriateCompliance)
        || violations.contains(&TrustViolationKind::TrustCollapse)
    {
        return Decision::Reject;
    }

    if f > 0.5 || metrics.ayni_balance < -0.3 || !violations.is_empty() {
        return Decision::Flag;
    }

    Decision::Accept
}
