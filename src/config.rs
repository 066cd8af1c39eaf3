//! Engine configuration.
//!
//! One immutable configuration object per engine instance, validated at
//! construction. Every threshold the evaluation arithmetic uses lives here;
//! nothing is hard-coded at call sites.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::evaluation::prompts::TemplateId;

/// How evaluators are orchestrated over a prompt context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    /// One (template, model) pair
    Single,
    /// N pairs concurrently, dominant-signal aggregation
    Parallel,
    /// Multi-round dialogue with baseline, pattern discussion, and consensus
    FireCircle,
}

/// What an unrecovered evaluator failure does to the evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Aggregate over the records that succeeded
    Resilient,
    /// Any unrecovered failure fails the whole evaluation
    Strict,
}

/// Storage backing the evaluation cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    Memory,
    Disk,
}

/// Configuration for evaluation result caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub backend: CacheBackend,
    /// Directory holding the disk cache; `None` uses `./.promptguard/cache`
    pub location: Option<PathBuf>,
    pub ttl_seconds: u64,
    /// Disk usage limit for the disk backend
    pub max_size_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackend::Memory,
            location: None,
            // 7 days
            ttl_seconds: 604_800,
            max_size_mb: 100,
        }
    }
}

impl CacheConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn on_disk(location: impl Into<PathBuf>) -> Self {
        Self {
            backend: CacheBackend::Disk,
            location: Some(location.into()),
            ..Self::default()
        }
    }

    /// Directory for the disk backend.
    pub fn resolved_location(&self) -> PathBuf {
        self.location
            .clone()
            .unwrap_or_else(|| PathBuf::from(".promptguard").join("cache"))
    }
}

/// Model provider API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Chat-completions base URL
    pub base_url: String,
    /// API key; when `None`, `OPENROUTER_API_KEY` is consulted
    pub api_key: Option<String>,
    pub per_call_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            per_call_timeout_secs: 60,
            max_retries: 2,
        }
    }
}

impl ApiConfig {
    /// Resolve the API key: programmatic value first, then the environment.
    pub fn resolve_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptGuardConfig {
    pub mode: EvaluationMode,
    /// Circle members, the parallel set, or the singleton
    pub models: Vec<String>,
    /// Matched positionally to `models`; length 1 means "same for all"
    pub templates: Vec<TemplateId>,
    /// Fire circle rounds; must be in 2..=5
    pub max_rounds: u32,
    /// Fraction of active models that must name a pattern for agreement
    pub pattern_threshold: f64,
    pub failure_mode: FailureMode,
    pub cache: CacheConfig,
    pub session_window_turns: usize,
    pub trust_ema_alpha: f64,
    pub api: ApiConfig,
    /// Bound on concurrent in-flight evaluator calls
    pub max_concurrency: usize,
}

impl Default for PromptGuardConfig {
    fn default() -> Self {
        Self {
            mode: EvaluationMode::Single,
            models: vec!["anthropic/claude-3.5-sonnet".to_string()],
            templates: vec![TemplateId::AyniRelational],
            max_rounds: 3,
            pattern_threshold: 0.5,
            failure_mode: FailureMode::Resilient,
            cache: CacheConfig::default(),
            session_window_turns: 20,
            trust_ema_alpha: 0.3,
            api: ApiConfig::default(),
            max_concurrency: 5,
        }
    }
}

impl PromptGuardConfig {
    pub fn new(mode: EvaluationMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_models<S: Into<String>>(mut self, models: impl IntoIterator<Item = S>) -> Self {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_templates(mut self, templates: impl IntoIterator<Item = TemplateId>) -> Self {
        self.templates = templates.into_iter().collect();
        self
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_pattern_threshold(mut self, threshold: f64) -> Self {
        self.pattern_threshold = threshold;
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_api(mut self, api: ApiConfig) -> Self {
        self.api = api;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// The template paired with the model at `index`.
    ///
    /// A single configured template applies to every model.
    pub fn template_for(&self, index: usize) -> TemplateId {
        if self.templates.len() == 1 {
            self.templates[0]
        } else {
            self.templates[index]
        }
    }

    /// Check the configuration. Called once at engine construction; a config
    /// that passes here never fails mid-call.
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(Error::config("at least one model is required"));
        }
        if self.templates.is_empty() {
            return Err(Error::config("at least one template is required"));
        }
        if self.templates.len() != 1 && self.templates.len() != self.models.len() {
            return Err(Error::config(format!(
                "templates must have length 1 or match models ({} templates, {} models)",
                self.templates.len(),
                self.models.len()
            )));
        }
        if self.mode == EvaluationMode::FireCircle {
            if self.models.len() < 2 {
                return Err(Error::config(
                    "fire circle requires at least 2 models",
                ));
            }
            if !(2..=5).contains(&self.max_rounds) {
                return Err(Error::config(format!(
                    "max_rounds must be in 2..=5, got {}",
                    self.max_rounds
                )));
            }
        }
        if !(self.pattern_threshold > 0.0 && self.pattern_threshold <= 1.0) {
            return Err(Error::config(format!(
                "pattern_threshold must be in (0, 1], got {}",
                self.pattern_threshold
            )));
        }
        if !(self.trust_ema_alpha > 0.0 && self.trust_ema_alpha < 1.0) {
            return Err(Error::config(format!(
                "trust_ema_alpha must be in (0, 1), got {}",
                self.trust_ema_alpha
            )));
        }
        if self.session_window_turns == 0 {
            return Err(Error::config("session_window_turns must be at least 1"));
        }
        if self.max_concurrency == 0 {
            return Err(Error::config("max_concurrency must be at least 1"));
        }
        if self.api.per_call_timeout_secs == 0 {
            return Err(Error::config("per_call_timeout_secs must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PromptGuardConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_models_rejected() {
        let config = PromptGuardConfig::default().with_models(Vec::<String>::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_template_length_mismatch_rejected() {
        let config = PromptGuardConfig::default()
            .with_models(["a", "b", "c"])
            .with_templates([TemplateId::Observer, TemplateId::Forensic]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_single_template_broadcasts() {
        let config = PromptGuardConfig::default()
            .with_models(["a", "b", "c"])
            .with_templates([TemplateId::Observer]);
        assert!(config.validate().is_ok());
        assert_eq!(config.template_for(2), TemplateId::Observer);
    }

    #[test]
    fn test_fire_circle_requires_two_models() {
        let config = PromptGuardConfig::new(EvaluationMode::FireCircle).with_models(["solo"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fire_circle_round_bounds() {
        let base = PromptGuardConfig::new(EvaluationMode::FireCircle).with_models(["a", "b"]);
        assert!(base.clone().with_max_rounds(1).validate().is_err());
        assert!(base.clone().with_max_rounds(6).validate().is_err());
        for rounds in 2..=5 {
            assert!(base.clone().with_max_rounds(rounds).validate().is_ok());
        }
    }

    #[test]
    fn test_threshold_bounds() {
        let config = PromptGuardConfig::default().with_pattern_threshold(0.0);
        assert!(config.validate().is_err());
        let config = PromptGuardConfig::default().with_pattern_threshold(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cache_location_default() {
        let cache = CacheConfig::default();
        assert_eq!(
            cache.resolved_location(),
            PathBuf::from(".promptguard").join("cache")
        );
        let cache = CacheConfig::on_disk("/tmp/pgcache");
        assert_eq!(cache.resolved_location(), PathBuf::from("/tmp/pgcache"));
    }
}
