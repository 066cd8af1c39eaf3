//! # promptguard
//!
//! A relational prompt evaluation engine. Conversational prompts are scored
//! for reciprocity violations (manipulation, extraction, role reversal,
//! encoded adversarial construction) on a three-dimensional neutrosophic
//! basis and aggregated into an ayni balance and trust field. Safety is
//! treated as a measurable relational property, not a keyword filter: the
//! engine measures, downstream systems decide.
//!
//! ## Core Components
//!
//! - **Neutrosophic**: validated truth/indeterminacy/falsehood triples
//! - **Evaluation**: prompt templates, tolerant parsing, caching, evaluators
//! - **Circle**: fire-circle multi-round dialogue with empty-chair rotation
//! - **Ayni**: balance, exchange type, trust field, and violation rules
//! - **Session**: turn-by-turn trust EMA and trajectory classification
//! - **Pipeline**: the engine handle with pre/post evaluation
//!
//! ## Example
//!
//! ```rust,ignore
//! use promptguard::{PromptContext, PromptGuard, PromptGuardConfig};
//!
//! let guard = PromptGuard::new(PromptGuardConfig::default())?;
//! let context = PromptContext::new()
//!     .with_system("You are a helpful assistant.")
//!     .with_user("Please explain how rate limiting works.");
//!
//! let metrics = guard.evaluate(&context).await?;
//! if metrics.needs_adjustment {
//!     println!("violations: {:?}", metrics.trust_field.violations);
//! }
//! ```

pub mod ayni;
pub mod circle;
pub mod config;
pub mod context;
pub mod error;
pub mod evaluation;
pub mod markers;
pub mod neutrosophic;
pub mod pipeline;
pub mod retry;
pub mod session;

// Re-exports for convenience
pub use ayni::{
    aggregate, ayni_balance, classify_exchange, decide, derive_violations, trust_strength,
    Decision, ExchangeType, LayerAssessment, ReciprocityMetrics, TrustField, TrustViolationKind,
    ViolationContext,
};
pub use circle::{
    run_fire_circle, CircleEvent, CircleEventType, FireCircleReport, FireCircleState, RoundRecord,
    MIN_VIABLE_CIRCLE,
};
pub use config::{
    ApiConfig, CacheBackend, CacheConfig, EvaluationMode, FailureMode, PromptGuardConfig,
};
pub use context::{Layer, LayerRole, PromptContext};
pub use error::{Error, Result};
pub use evaluation::{
    cache_key, parse_evaluation, ErrorKind, EvaluationCache, EvaluationJob, EvaluationRecord,
    LayerEvaluator, ModelClient, ModelReply, ModelRequest, OpenRouterClient, ParsedEvaluation,
    TemplateId, TokenUsage, UsageTracker,
};
pub use neutrosophic::NeutrosophicValue;
pub use pipeline::{PromptGuard, TurnEvaluation};
pub use retry::{with_retries, RetryConfig};
pub use session::{
    classify_trajectory, Session, SessionSnapshot, SessionStore, Trajectory, TurnRecord,
};
