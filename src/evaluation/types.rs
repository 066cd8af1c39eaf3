//! Evaluation record types: requests, replies, and evaluator output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::context::LayerRole;
use crate::error::Error;
use crate::evaluation::prompts::TemplateId;
use crate::neutrosophic::NeutrosophicValue;

/// Failure category attached to an unsuccessful evaluation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    HttpStatus,
    Timeout,
    Parse,
    EmptyResponse,
    Refusal,
}

impl ErrorKind {
    /// Classify a client/parser error into a record-level kind.
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Network(_) => Self::Network,
            Error::HttpStatus { .. } => Self::HttpStatus,
            Error::Timeout { .. } => Self::Timeout,
            Error::EmptyResponse => Self::EmptyResponse,
            Error::Refusal(_) => Self::Refusal,
            _ => Self::Parse,
        }
    }

    /// Whether a fresh attempt against the provider could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::HttpStatus | Self::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "NETWORK",
            Self::HttpStatus => "HTTP_STATUS",
            Self::Timeout => "TIMEOUT",
            Self::Parse => "PARSE",
            Self::EmptyResponse => "EMPTY_RESPONSE",
            Self::Refusal => "REFUSAL",
        };
        write!(f, "{s}")
    }
}

/// Token usage for a single model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Request handed to a model client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Provider model identifier
    pub model: String,
    /// Fully rendered evaluation prompt
    pub prompt: String,
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// Sampling temperature (0.0 for deterministic evaluation)
    pub temperature: f64,
    /// Per-call deadline in milliseconds
    pub timeout_ms: u64,
}

impl ModelRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            max_tokens: 1024,
            temperature: 0.0,
            timeout_ms: 60_000,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Raw reply from a model client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelReply {
    pub raw_text: String,
    pub usage: TokenUsage,
    pub elapsed_ms: u64,
    /// Cost in USD, when the provider reports enough to compute it
    pub cost: Option<f64>,
}

/// Structured fields recovered from a model reply by the tolerant parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedEvaluation {
    pub truth: f64,
    pub indeterminacy: f64,
    pub falsehood: f64,
    pub reasoning: String,
    #[serde(default)]
    pub patterns_observed: Vec<String>,
    #[serde(default)]
    pub consensus_patterns: Vec<String>,
    pub exchange_type: Option<String>,
    pub trust_established: Option<String>,
    pub trust_claimed: Option<String>,
    pub trust_gap: Option<String>,
    /// Set when any coordinate was coerced from a string or clamped into range
    #[serde(default)]
    pub coerced: bool,
}

/// One evaluator's output: a single (template, model, layer) assessment.
///
/// Immutable once emitted. Failed calls still produce a record, with
/// `success=false` and the error kind set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    /// Unique record id
    pub id: Uuid,
    /// Parsed neutrosophic value; present iff `success`
    pub value: Option<NeutrosophicValue>,
    /// Evaluator's free-text reasoning
    pub reasoning: String,
    /// Evaluator-suggested exchange type, if any
    pub exchange_type: Option<String>,
    /// Patterns the evaluator reported observing
    pub patterns_observed: Vec<String>,
    /// Patterns the evaluator reported as consensus (dialogue rounds)
    pub consensus_patterns: Vec<String>,
    /// Trust-trajectory structured fields, when the template requests them
    pub trust_established: Option<String>,
    pub trust_claimed: Option<String>,
    pub trust_gap: Option<String>,
    /// Template that produced this record
    pub template: TemplateId,
    /// Model that produced this record
    pub model: String,
    /// Layer adjudicated, when the call targeted a single layer
    pub layer: Option<LayerRole>,
    /// Dialogue round (1 for single-shot evaluation)
    pub round: u32,
    pub success: bool,
    pub error: Option<ErrorKind>,
    /// Any coordinate was coerced or clamped during parsing
    pub coerced: bool,
    /// Record was served from the cache
    pub cached: bool,
    pub usage: TokenUsage,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl EvaluationRecord {
    /// Build a successful record from a parsed reply.
    pub fn success(
        template: TemplateId,
        model: impl Into<String>,
        layer: Option<LayerRole>,
        round: u32,
        value: NeutrosophicValue,
        parsed: ParsedEvaluation,
        usage: TokenUsage,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            value: Some(value),
            reasoning: parsed.reasoning,
            exchange_type: parsed.exchange_type,
            patterns_observed: parsed.patterns_observed,
            consensus_patterns: parsed.consensus_patterns,
            trust_established: parsed.trust_established,
            trust_claimed: parsed.trust_claimed,
            trust_gap: parsed.trust_gap,
            template,
            model: model.into(),
            layer,
            round,
            success: true,
            error: None,
            coerced: parsed.coerced,
            cached: false,
            usage,
            elapsed_ms,
            timestamp: Utc::now(),
        }
    }

    /// Build a failed record carrying only the error kind.
    pub fn failure(
        template: TemplateId,
        model: impl Into<String>,
        layer: Option<LayerRole>,
        round: u32,
        kind: ErrorKind,
        detail: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            value: None,
            reasoning: detail.into(),
            exchange_type: None,
            patterns_observed: Vec::new(),
            consensus_patterns: Vec::new(),
            trust_established: None,
            trust_claimed: None,
            trust_gap: None,
            template,
            model: model.into(),
            layer,
            round,
            success: false,
            error: Some(kind),
            coerced: false,
            cached: false,
            usage: TokenUsage::default(),
            elapsed_ms,
            timestamp: Utc::now(),
        }
    }

    /// Short "model/template" label used in warnings and peer context.
    pub fn evaluator_label(&self) -> String {
        format!("{}/{}", self.model, self.template.id())
    }
}

/// Aggregate token/cost accounting across an engine's lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageTracker {
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_cost: f64,
    pub request_count: u64,
    pub by_model: HashMap<String, ModelUsage>,
}

/// Usage for a specific model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub request_count: u64,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record usage from one model reply.
    pub fn record(&mut self, model: &str, usage: &TokenUsage, cost: Option<f64>) {
        self.total_prompt_tokens += usage.prompt_tokens;
        self.total_completion_tokens += usage.completion_tokens;
        self.request_count += 1;
        if let Some(c) = cost {
            self.total_cost += c;
        }

        let entry = self.by_model.entry(model.to_string()).or_default();
        entry.prompt_tokens += usage.prompt_tokens;
        entry.completion_tokens += usage.completion_tokens;
        entry.request_count += 1;
        if let Some(c) = cost {
            entry.cost += c;
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_prompt_tokens + self.total_completion_tokens
    }
}
