//! Layer evaluator: one (template, model) assessment of a prompt context.
//!
//! Renders the template, consults the cache, calls the model client under
//! the shared concurrency limiter, and parses the reply. Failures of any
//! kind become records with `success=false`; nothing propagates as an error
//! across this boundary.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLock, Semaphore};
use tracing::debug;

use crate::context::{LayerRole, PromptContext};
use crate::evaluation::cache::{cache_key, EvaluationCache};
use crate::evaluation::client::ModelClient;
use crate::evaluation::parser::parse_evaluation;
use crate::evaluation::prompts::{render, RenderOptions, TemplateId};
use crate::evaluation::types::{ErrorKind, EvaluationRecord, ModelRequest, UsageTracker};
use crate::neutrosophic::NeutrosophicValue;
use crate::retry::{with_retries, RetryConfig};

/// One evaluator invocation.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationJob<'a> {
    pub template: TemplateId,
    pub model: &'a str,
    pub context: &'a PromptContext,
    /// Layer adjudicated; `None` evaluates the whole context
    pub layer: Option<LayerRole>,
    /// Dialogue round, 1-based
    pub round: u32,
    /// Peer evaluations from earlier rounds, already formatted
    pub peer_context: Option<&'a str>,
    /// This evaluator holds the empty chair for the round
    pub empty_chair: bool,
}

impl<'a> EvaluationJob<'a> {
    pub fn new(template: TemplateId, model: &'a str, context: &'a PromptContext) -> Self {
        Self {
            template,
            model,
            context,
            layer: None,
            round: 1,
            peer_context: None,
            empty_chair: false,
        }
    }

    pub fn with_layer(mut self, layer: LayerRole) -> Self {
        self.layer = Some(layer);
        self
    }

    pub fn with_round(mut self, round: u32) -> Self {
        self.round = round;
        self
    }

    pub fn with_peer_context(mut self, peers: &'a str) -> Self {
        self.peer_context = Some(peers);
        self
    }

    pub fn as_empty_chair(mut self) -> Self {
        self.empty_chair = true;
        self
    }
}

/// Runs evaluator calls against one model client.
pub struct LayerEvaluator {
    client: Arc<dyn ModelClient>,
    cache: Arc<EvaluationCache>,
    limiter: Arc<Semaphore>,
    usage: Arc<RwLock<UsageTracker>>,
    retry: RetryConfig,
    timeout_ms: u64,
    max_tokens: u32,
}

impl LayerEvaluator {
    pub fn new(
        client: Arc<dyn ModelClient>,
        cache: Arc<EvaluationCache>,
        limiter: Arc<Semaphore>,
        retry: RetryConfig,
        timeout_ms: u64,
    ) -> Self {
        Self {
            client,
            cache,
            limiter,
            usage: Arc::new(RwLock::new(UsageTracker::new())),
            retry,
            timeout_ms,
            max_tokens: 1024,
        }
    }

    /// Aggregate token/cost accounting for every non-cached call so far.
    pub async fn usage(&self) -> UsageTracker {
        self.usage.read().await.clone()
    }

    /// Run one evaluation. Total: always returns a record.
    pub async fn evaluate(&self, job: EvaluationJob<'_>) -> EvaluationRecord {
        let rendered = render(
            job.template,
            job.context,
            &RenderOptions {
                round: job.round,
                peer_context: job.peer_context,
                empty_chair: job.empty_chair,
                target_layer: job.layer,
            },
        );
        let key = cache_key(job.model, job.template.id(), &rendered);

        self.cache
            .get_or_build(&key, || self.call_model(&job, rendered.clone()))
            .await
    }

    async fn call_model(&self, job: &EvaluationJob<'_>, rendered: String) -> EvaluationRecord {
        // Bounded concurrency across all evaluators sharing this limiter.
        // The semaphore is never closed, so acquisition cannot fail.
        let _permit = self.limiter.acquire().await.ok();

        let request = ModelRequest::new(job.model, rendered)
            .with_temperature(job.template.temperature())
            .with_max_tokens(self.max_tokens)
            .with_timeout_ms(self.timeout_ms);

        let started = Instant::now();
        let result = with_retries(&self.retry, || self.client.complete(&request)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let reply = match result {
            Ok(reply) => reply,
            Err(error) => {
                let kind = ErrorKind::from_error(&error);
                debug!(model = job.model, template = %job.template, %kind, "evaluator call failed");
                return EvaluationRecord::failure(
                    job.template,
                    job.model,
                    job.layer,
                    job.round,
                    kind,
                    error.to_string(),
                    elapsed_ms,
                );
            }
        };

        {
            let mut usage = self.usage.write().await;
            usage.record(job.model, &reply.usage, reply.cost);
        }

        let parsed = match parse_evaluation(&reply.raw_text) {
            Ok(parsed) => parsed,
            Err(error) => {
                let kind = ErrorKind::from_error(&error);
                debug!(model = job.model, template = %job.template, %kind, "evaluator reply unparseable");
                return EvaluationRecord::failure(
                    job.template,
                    job.model,
                    job.layer,
                    job.round,
                    kind,
                    error.to_string(),
                    elapsed_ms,
                );
            }
        };

        // The parser clamps coordinates into range, so construction succeeds
        // for any parse it accepted.
        match NeutrosophicValue::new(parsed.truth, parsed.indeterminacy, parsed.falsehood) {
            Ok(value) => EvaluationRecord::success(
                job.template,
                job.model,
                job.layer,
                job.round,
                value,
                parsed,
                reply.usage,
                elapsed_ms,
            ),
            Err(error) => EvaluationRecord::failure(
                job.template,
                job.model,
                job.layer,
                job.round,
                ErrorKind::Parse,
                error.to_string(),
                elapsed_ms,
            ),
        }
    }
}
