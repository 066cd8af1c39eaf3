//! Pre/post evaluation pipeline and the engine handle.
//!
//! `PromptGuard` owns the configuration, HTTP client, cache, sessions, and
//! the shared concurrency limiter; there is no process-wide state. All
//! public entry points are total under RESILIENT mode: they return metrics
//! with warnings, or a typed error, and never panic across the boundary.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, instrument};

use crate::ayni::{
    self, Decision, LayerAssessment, ReciprocityMetrics, TrustViolationKind, ViolationContext,
};
use crate::circle::run_fire_circle;
use crate::config::{EvaluationMode, FailureMode, PromptGuardConfig};
use crate::context::PromptContext;
use crate::error::{Error, Result};
use crate::evaluation::cache::EvaluationCache;
use crate::evaluation::client::{ModelClient, OpenRouterClient};
use crate::evaluation::evaluator::{EvaluationJob, LayerEvaluator};
use crate::evaluation::types::{EvaluationRecord, UsageTracker};
use crate::retry::RetryConfig;
use crate::session::{SessionSnapshot, SessionStore};

/// A response evaluation is inappropriate compliance when the response
/// itself scores this high on falsehood...
const COMPLIANCE_POST_F: f64 = 0.7;
/// ...in a context whose request was already at least borderline.
const COMPLIANCE_PRE_F: f64 = 0.4;

/// Result of a session-aware turn evaluation.
#[derive(Debug, Clone)]
pub struct TurnEvaluation {
    pub pre: ReciprocityMetrics,
    pub post: Option<ReciprocityMetrics>,
    /// post.ayni_balance − pre.ayni_balance, in [−2, 2]
    pub divergence: Option<f64>,
    pub session: SessionSnapshot,
    /// Decision hint from metrics plus the session trust delta
    pub decision: Decision,
}

/// The evaluation engine.
pub struct PromptGuard {
    config: PromptGuardConfig,
    evaluator: LayerEvaluator,
    sessions: SessionStore,
}

impl PromptGuard {
    /// Build an engine talking to the configured provider.
    pub fn new(config: PromptGuardConfig) -> Result<Self> {
        config.validate()?;
        let client = Arc::new(OpenRouterClient::new(config.api.clone())?);
        Self::assemble(config, client)
    }

    /// Build an engine over a caller-supplied model client.
    pub fn with_client(config: PromptGuardConfig, client: Arc<dyn ModelClient>) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, client)
    }

    fn assemble(config: PromptGuardConfig, client: Arc<dyn ModelClient>) -> Result<Self> {
        let cache = Arc::new(EvaluationCache::from_config(&config.cache)?);
        let limiter = Arc::new(Semaphore::new(config.max_concurrency));
        let retry = RetryConfig::new(config.api.max_retries);
        let evaluator = LayerEvaluator::new(
            client,
            cache,
            limiter,
            retry,
            config.api.per_call_timeout_secs * 1000,
        );
        let sessions = SessionStore::new(config.session_window_turns, config.trust_ema_alpha);

        Ok(Self {
            config,
            evaluator,
            sessions,
        })
    }

    pub fn config(&self) -> &PromptGuardConfig {
        &self.config
    }

    /// Aggregate token and cost accounting across the engine's lifetime.
    pub async fn usage(&self) -> UsageTracker {
        self.evaluator.usage().await
    }

    /// Evaluate a prompt context with the configured policy.
    #[instrument(skip_all)]
    pub async fn evaluate(&self, context: &PromptContext) -> Result<ReciprocityMetrics> {
        context.validate()?;
        self.run_policy(self.config.mode, context, &ViolationContext::default())
            .await
    }

    /// Evaluate with an ad-hoc policy override.
    #[instrument(skip_all, fields(mode = ?mode))]
    pub async fn evaluate_custom(
        &self,
        context: &PromptContext,
        mode: EvaluationMode,
    ) -> Result<ReciprocityMetrics> {
        context.validate()?;
        if mode == EvaluationMode::FireCircle && self.config.models.len() < 2 {
            return Err(Error::config("fire circle override requires at least 2 models"));
        }
        self.run_policy(mode, context, &ViolationContext::default())
            .await
    }

    /// Session-aware evaluation: score the request, optionally score the
    /// response, derive divergence, and record the turn.
    #[instrument(skip_all, fields(conversation_id))]
    pub async fn evaluate_turn(
        &self,
        conversation_id: &str,
        context: &PromptContext,
        response: Option<&str>,
    ) -> Result<TurnEvaluation> {
        context.validate()?;

        let has_prior_turns = self
            .sessions
            .with_session(conversation_id, |s| s.has_prior_turns())
            .await;

        let pre_vctx = ViolationContext {
            session_has_prior_turns: has_prior_turns,
            pre_balance: None,
        };
        let pre = self.run_policy(self.config.mode, context, &pre_vctx).await?;

        let (post, divergence) = match response {
            None => (None, None),
            Some(response) => {
                let post_context = context.with_response(response);
                let post_vctx = ViolationContext {
                    session_has_prior_turns: has_prior_turns,
                    pre_balance: Some(pre.ayni_balance),
                };
                let mut post = self
                    .run_policy(self.config.mode, &post_context, &post_vctx)
                    .await?;
                let divergence = post.ayni_balance - pre.ayni_balance;

                if post.overall.falsehood() >= COMPLIANCE_POST_F
                    && pre.overall.falsehood() >= COMPLIANCE_PRE_F
                {
                    post.trust_field
                        .violations
                        .insert(TrustViolationKind::InappropriateCompliance);
                    post.needs_adjustment = true;
                }

                (Some(post), Some(divergence))
            }
        };

        let (snapshot, trust_delta) = self
            .sessions
            .with_session(conversation_id, |session| {
                session.record_turn(pre.clone(), post.clone(), divergence);
                (session.snapshot(), session.last_delta())
            })
            .await;

        let decision = ayni::decide(post.as_ref().unwrap_or(&pre), trust_delta);
        info!(
            turn = snapshot.turns.last().map(|t| t.turn_number).unwrap_or(0),
            balance = pre.ayni_balance,
            ?decision,
            "turn evaluated"
        );

        Ok(TurnEvaluation {
            pre,
            post,
            divergence,
            session: snapshot,
            decision,
        })
    }

    async fn run_policy(
        &self,
        mode: EvaluationMode,
        context: &PromptContext,
        vctx: &ViolationContext,
    ) -> Result<ReciprocityMetrics> {
        match mode {
            EvaluationMode::Single | EvaluationMode::Parallel => {
                let mut pairs: Vec<(usize, &str)> = self
                    .config
                    .models
                    .iter()
                    .enumerate()
                    .map(|(i, m)| (i, m.as_str()))
                    .collect();
                if mode == EvaluationMode::Single {
                    pairs.truncate(1);
                }
                self.run_layerwise(&pairs, context, vctx).await
            }
            EvaluationMode::FireCircle => self.run_circle(context, vctx).await,
        }
    }

    /// SINGLE and PARALLEL: every (template, model) pair adjudicates every
    /// layer; per-layer values are the element-wise max across evaluators.
    async fn run_layerwise(
        &self,
        pairs: &[(usize, &str)],
        context: &PromptContext,
        vctx: &ViolationContext,
    ) -> Result<ReciprocityMetrics> {
        let mut jobs = Vec::new();
        for (layer_index, layer) in context.layers().iter().enumerate() {
            for &(pair_index, model) in pairs {
                jobs.push((
                    layer_index,
                    EvaluationJob::new(self.config.template_for(pair_index), model, context)
                        .with_layer(layer.role),
                ));
            }
        }

        let records: Vec<(usize, EvaluationRecord)> = join_all(
            jobs.into_iter()
                .map(|(layer_index, job)| async move {
                    (layer_index, self.evaluator.evaluate(job).await)
                }),
        )
        .await;

        let failed: Vec<&EvaluationRecord> = records
            .iter()
            .filter(|(_, r)| !r.success)
            .map(|(_, r)| r)
            .collect();
        if self.config.failure_mode == FailureMode::Strict && !failed.is_empty() {
            return Err(Error::EvaluationFailed(format!(
                "{} evaluator(s) failed under strict mode: {}",
                failed.len(),
                failed
                    .iter()
                    .map(|r| r.evaluator_label())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        let warnings: Vec<String> = failed.iter().map(|r| r.evaluator_label()).collect();

        // Per-layer dominant-signal aggregation over successful records.
        let mut layers = Vec::new();
        for (layer_index, layer) in context.layers().iter().enumerate() {
            let values: Vec<_> = records
                .iter()
                .filter(|(idx, r)| *idx == layer_index && r.success)
                .filter_map(|(_, r)| r.value)
                .collect();
            if let Some(value) = ayni::aggregate(&values) {
                layers.push(LayerAssessment {
                    role: layer.role,
                    value,
                    directly_evaluated: true,
                });
            }
        }

        let overall = ayni::aggregate(
            &layers.iter().map(|l| l.value).collect::<Vec<_>>(),
        )
        .ok_or_else(|| {
            Error::EvaluationFailed("no evaluator produced a usable record".to_string())
        })?;

        let successful: Vec<&EvaluationRecord> = records
            .iter()
            .filter(|(_, r)| r.success)
            .map(|(_, r)| r)
            .collect();
        let patterns: Vec<String> = successful
            .iter()
            .flat_map(|r| r.patterns_observed.iter().cloned())
            .collect();
        let reasoning = combine_reasoning(&successful);

        Ok(ayni::build_metrics(
            overall,
            layers,
            context,
            vctx,
            &patterns,
            reasoning,
            warnings,
        ))
    }

    /// FIRE_CIRCLE: the circle adjudicates the context as a whole; its
    /// consensus is attributed uniformly across layers.
    async fn run_circle(
        &self,
        context: &PromptContext,
        vctx: &ViolationContext,
    ) -> Result<ReciprocityMetrics> {
        let report = run_fire_circle(&self.evaluator, &self.config, context).await?;

        if self.config.failure_mode == FailureMode::Strict && !report.warnings.is_empty() {
            return Err(Error::EvaluationFailed(format!(
                "{} circle member(s) failed under strict mode: {}",
                report.warnings.len(),
                report.warnings.join(", ")
            )));
        }

        let layers: Vec<LayerAssessment> = context
            .layers()
            .iter()
            .map(|layer| LayerAssessment {
                role: layer.role,
                value: report.consensus,
                directly_evaluated: false,
            })
            .collect();

        let surviving = report.state.surviving_records();
        let reasoning = combine_reasoning(&surviving);

        Ok(ayni::build_metrics(
            report.consensus,
            layers,
            context,
            vctx,
            &report.agreed_patterns,
            reasoning,
            report.warnings,
        ))
    }
}

fn combine_reasoning(records: &[&EvaluationRecord]) -> String {
    records
        .iter()
        .filter(|r| !r.reasoning.is_empty())
        .map(|r| format!("[{}] {}", r.evaluator_label(), r.reasoning))
        .collect::<Vec<_>>()
        .join("\n")
}
