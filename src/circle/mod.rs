//! Fire circle: multi-round multi-model dialogue evaluation.
//!
//! Round 1 takes an independent baseline from every model with a simple,
//! unloaded prompt. Rounds 2 and later switch to the pattern-seeking
//! relational prompt with peer context injected, one model per round holding
//! the empty chair. Rounds are separated by strict barriers: a round starts
//! only after every call of the previous round has returned.

pub mod events;
pub mod state;

pub use events::{CircleEvent, CircleEventType};
pub use state::{FireCircleState, RoundRecord, MIN_VIABLE_CIRCLE};

use futures::future::join_all;
use tracing::{info, instrument, warn};

use crate::config::PromptGuardConfig;
use crate::context::PromptContext;
use crate::error::{Error, Result};
use crate::evaluation::evaluator::{EvaluationJob, LayerEvaluator};
use crate::evaluation::prompts::TemplateId;
use crate::evaluation::types::EvaluationRecord;
use crate::neutrosophic::NeutrosophicValue;

/// Outcome of a completed fire circle evaluation.
#[derive(Debug, Clone)]
pub struct FireCircleReport {
    /// Element-wise max over every record of every model that ended active
    pub consensus: NeutrosophicValue,
    /// Patterns named by enough active models to count as agreement
    pub agreed_patterns: Vec<String>,
    /// Share of distinct patterns first mentioned from the empty chair
    pub empty_chair_influence: f64,
    pub state: FireCircleState,
    pub events: Vec<CircleEvent>,
    /// Labels of evaluators that failed at any point
    pub warnings: Vec<String>,
}

/// Run a fire circle over the prompt context.
///
/// Returns `CircleDegraded` (with all completed records attached) the moment
/// fewer than two models remain active, regardless of failure mode.
#[instrument(skip_all, fields(models = config.models.len(), rounds = config.max_rounds))]
pub async fn run_fire_circle(
    evaluator: &LayerEvaluator,
    config: &PromptGuardConfig,
    context: &PromptContext,
) -> Result<FireCircleReport> {
    let mut state = FireCircleState::new(config.models.clone());
    let mut circle_events = Vec::new();
    let mut warnings = Vec::new();

    // Round 1: independent baseline, no peer context, no empty chair.
    circle_events.push(
        CircleEvent::new(
            CircleEventType::RoundStart,
            1,
            format!("baseline round with {} models", state.active_models.len()),
        ),
    );

    let round1_jobs: Vec<_> = state
        .active_models
        .iter()
        .map(|model| {
            EvaluationJob::new(TemplateId::BaselineRound1, model, context).with_round(1)
        })
        .collect();
    let round1_records: Vec<EvaluationRecord> =
        join_all(round1_jobs.into_iter().map(|job| evaluator.evaluate(job))).await;

    for record in &round1_records {
        if record.success {
            note_mentions(&mut state, record, &mut circle_events);
        } else {
            // Failed round 1: the model never joined the circle.
            warn!(model = %record.model, "model failed baseline round, excluded");
            warnings.push(record.evaluator_label());
            state.exclude(&record.model);
            circle_events.push(
                CircleEvent::new(CircleEventType::ModelExcluded, 1, "failed baseline round")
                    .with_model(&record.model),
            );
        }
    }
    state.rounds.push(RoundRecord {
        round: 1,
        empty_chair: None,
        records: round1_records,
    });
    circle_events.push(CircleEvent::new(CircleEventType::RoundComplete, 1, "baseline complete"));

    check_viability(&state, 1, &mut circle_events)?;

    // Rounds 2..=max_rounds: pattern discussion and consensus refinement.
    for round in 2..=config.max_rounds {
        let chair = state.empty_chair_for_round(round).map(str::to_string);
        if let Some(chair) = &chair {
            state.empty_chairs.insert(round, chair.clone());
            circle_events.push(
                CircleEvent::new(CircleEventType::EmptyChairAssigned, round, "rotating chair")
                    .with_model(chair),
            );
        }
        circle_events.push(CircleEvent::new(
            CircleEventType::RoundStart,
            round,
            format!("{} active models", state.active_models.len()),
        ));

        let peers = format_peer_context(&state);
        let jobs: Vec<_> = state
            .active_models
            .iter()
            .map(|model| {
                let mut job = EvaluationJob::new(TemplateId::AyniRelational, model, context)
                    .with_round(round)
                    .with_peer_context(&peers);
                if chair.as_deref() == Some(model.as_str()) {
                    job = job.as_empty_chair();
                }
                job
            })
            .collect();

        // Barrier: every call of this round returns before the next starts.
        let records: Vec<EvaluationRecord> =
            join_all(jobs.into_iter().map(|job| evaluator.evaluate(job))).await;

        for record in &records {
            if record.success {
                note_mentions(&mut state, record, &mut circle_events);
            } else {
                warn!(model = %record.model, round, "model failed mid-circle, zombied");
                warnings.push(record.evaluator_label());
                state.mark_zombie(&record.model);
                circle_events.push(
                    CircleEvent::new(CircleEventType::ModelZombied, round, "failed mid-circle")
                        .with_model(&record.model),
                );
            }
        }
        state.rounds.push(RoundRecord {
            round,
            empty_chair: chair,
            records,
        });
        circle_events.push(CircleEvent::new(
            CircleEventType::RoundComplete,
            round,
            "round complete",
        ));

        check_viability(&state, round, &mut circle_events)?;
    }

    let consensus = state
        .consensus()
        .ok_or_else(|| Error::EvaluationFailed("fire circle produced no surviving records".into()))?;
    let agreed_patterns = state.agreed_patterns(config.pattern_threshold);
    let empty_chair_influence = state.empty_chair_influence();

    info!(
        consensus = %consensus,
        agreed = agreed_patterns.len(),
        "fire circle consensus reached"
    );
    circle_events.push(CircleEvent::new(
        CircleEventType::ConsensusReached,
        config.max_rounds,
        format!("{consensus}; {} agreed patterns", agreed_patterns.len()),
    ));

    Ok(FireCircleReport {
        consensus,
        agreed_patterns,
        empty_chair_influence,
        state,
        events: circle_events,
        warnings,
    })
}

fn note_mentions(
    state: &mut FireCircleState,
    record: &EvaluationRecord,
    events: &mut Vec<CircleEvent>,
) {
    for pattern in state.note_patterns(record) {
        events.push(
            CircleEvent::new(CircleEventType::PatternFirstMention, record.round, pattern)
                .with_model(&record.model),
        );
    }
}

fn check_viability(
    state: &FireCircleState,
    round: u32,
    events: &mut Vec<CircleEvent>,
) -> Result<()> {
    if state.is_viable() {
        return Ok(());
    }
    events.push(CircleEvent::new(
        CircleEventType::CircleDegraded,
        round,
        format!("{} active models, need {MIN_VIABLE_CIRCLE}", state.active_models.len()),
    ));
    Err(Error::CircleDegraded {
        active: state.active_models.len(),
        records: state.all_records(),
    })
}

/// Peer context for the next round: every successful record of every model
/// still active, in round then configured-model order. Zombie records never
/// appear here; a model that stopped deliberating stops being heard.
fn format_peer_context(state: &FireCircleState) -> String {
    let mut lines = Vec::new();
    for round in &state.rounds {
        for record in &round.records {
            if !record.success || !state.active_models.iter().any(|m| *m == record.model) {
                continue;
            }
            let Some(value) = record.value else { continue };
            let mut line = format!("MODEL {} (round {}): {}", record.model, record.round, value);
            if !record.reasoning.is_empty() {
                line.push_str(&format!("\n  reasoning: {}", record.reasoning));
            }
            if !record.patterns_observed.is_empty() {
                line.push_str(&format!(
                    "\n  patterns: {}",
                    record.patterns_observed.join(", ")
                ));
            }
            lines.push(line);
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvaluationMode;
    use crate::evaluation::cache::EvaluationCache;
    use crate::evaluation::evaluator::test_support::{ScriptedClient, ScriptedReply};
    use crate::retry::RetryConfig;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn circle_config(models: &[&str]) -> PromptGuardConfig {
        PromptGuardConfig::new(EvaluationMode::FireCircle)
            .with_models(models.iter().copied())
            .with_templates([TemplateId::AyniRelational])
    }

    fn evaluator_for(client: ScriptedClient) -> LayerEvaluator {
        LayerEvaluator::new(
            Arc::new(client),
            Arc::new(EvaluationCache::in_memory(3600)),
            Arc::new(Semaphore::new(8)),
            RetryConfig::none(),
            5_000,
        )
    }

    fn ctx() -> PromptContext {
        PromptContext::new().with_user("Turn 1 - Me: hello. Turn 4 - Me: as we agreed, continue.")
    }

    #[tokio::test]
    async fn test_three_round_consensus_is_max_over_all_rounds() {
        // Vigilant model peaks at F=0.9 in round 2, then walks back to 0.4.
        // Conformist stays flat. Consensus must preserve the peak.
        let client = ScriptedClient::new()
            .script(
                "vigilant",
                vec![
                    ScriptedReply::scores(0.7, 0.2, 0.2, "baseline: fine"),
                    ScriptedReply::scores(0.3, 0.2, 0.9, "round 2: fabricated history"),
                    ScriptedReply::scores(0.5, 0.2, 0.4, "round 3: maybe overcautious"),
                ],
            )
            .script(
                "conformist",
                vec![
                    ScriptedReply::scores(0.6, 0.2, 0.3, "baseline"),
                    ScriptedReply::scores(0.6, 0.2, 0.3, "still fine"),
                    ScriptedReply::scores(0.6, 0.2, 0.3, "still fine"),
                ],
            );
        let evaluator = evaluator_for(client);
        let config = circle_config(&["vigilant", "conformist"]);

        let report = run_fire_circle(&evaluator, &config, &ctx()).await.unwrap();

        assert_eq!(report.consensus.falsehood(), 0.9);
        assert_eq!(report.consensus.truth(), 0.7);
        assert!(report.warnings.is_empty());
        assert_eq!(report.state.rounds.len(), 3);
    }

    #[tokio::test]
    async fn test_round1_prompts_are_pure_baseline() {
        let client = ScriptedClient::uniform(ScriptedReply::scores(0.5, 0.3, 0.3, "ok"));
        let evaluator = evaluator_for(client);
        let config = circle_config(&["model_a", "model_b"]);

        let report = run_fire_circle(&evaluator, &config, &ctx()).await.unwrap();
        // Reach into the scripted client through the report's rounds instead:
        // round 1 used the baseline template, later rounds the relational one.
        for record in &report.state.rounds[0].records {
            assert_eq!(record.template, TemplateId::BaselineRound1);
        }
        for round in &report.state.rounds[1..] {
            for record in &round.records {
                assert_eq!(record.template, TemplateId::AyniRelational);
            }
        }
    }

    #[tokio::test]
    async fn test_round1_prompt_text_purity() {
        let client = Arc::new(ScriptedClient::uniform(ScriptedReply::scores(
            0.5, 0.3, 0.3, "ok",
        )));
        let evaluator = LayerEvaluator::new(
            client.clone(),
            Arc::new(EvaluationCache::in_memory(3600)),
            Arc::new(Semaphore::new(8)),
            RetryConfig::none(),
            5_000,
        );
        let config = circle_config(&["model_a", "model_b"]);

        run_fire_circle(&evaluator, &config, &ctx()).await.unwrap();

        let calls = client.observed_calls();
        // Two models, three rounds, full barrier between rounds: the first
        // two calls are round 1.
        assert_eq!(calls.len(), 6);
        for call in &calls[..2] {
            assert!(call.prompt.contains("reciprocity violation"));
            assert!(!call.prompt.contains("TEMPORAL CONSISTENCY"));
            assert!(!call.prompt.contains("CROSS-LAYER COORDINATION"));
            assert!(!call.prompt.contains("pattern recognition"));
        }
        for call in &calls[2..] {
            assert!(call.prompt.contains("TEMPORAL CONSISTENCY"));
            assert!(call.prompt.contains("CROSS-LAYER COORDINATION"));
            assert!(call.prompt.contains("PEER EVALUATIONS"));
        }
    }

    #[tokio::test]
    async fn test_round1_failure_excludes_model_entirely() {
        let client = Arc::new(
            ScriptedClient::new()
                .script("flaky", vec![ScriptedReply::Fail("connection reset".into())])
                .script(
                    "model_b",
                    vec![ScriptedReply::scores(0.6, 0.2, 0.3, "fine"); 3],
                )
                .script(
                    "model_c",
                    vec![ScriptedReply::scores(0.5, 0.3, 0.4, "hmm"); 3],
                ),
        );
        let evaluator = LayerEvaluator::new(
            client.clone(),
            Arc::new(EvaluationCache::in_memory(3600)),
            Arc::new(Semaphore::new(8)),
            RetryConfig::none(),
            5_000,
        );
        let config = circle_config(&["flaky", "model_b", "model_c"]);

        let report = run_fire_circle(&evaluator, &config, &ctx()).await.unwrap();

        // Excluded, not zombied: it never joined.
        assert!(!report.state.zombie_models.contains(&"flaky".to_string()));
        assert!(!report.state.active_models.contains(&"flaky".to_string()));
        // Exactly one call to the flaky model (round 1), none afterwards.
        assert_eq!(client.prompts_for("flaky").len(), 1);
        assert!(report.warnings.iter().any(|w| w.starts_with("flaky/")));
    }

    #[tokio::test]
    async fn test_zombie_excluded_from_round3_peers_and_consensus() {
        let client = Arc::new(
            ScriptedClient::new()
                .script(
                    "zombie_model",
                    vec![
                        // Highest F of the whole circle in round 1
                        ScriptedReply::scores(0.1, 0.1, 0.95, "alarm"),
                        ScriptedReply::TimeoutFail,
                    ],
                )
                .script(
                    "model_b",
                    vec![ScriptedReply::scores(0.6, 0.2, 0.3, "fine"); 3],
                )
                .script(
                    "model_c",
                    vec![ScriptedReply::scores(0.5, 0.2, 0.4, "hmm"); 3],
                ),
        );
        let evaluator = LayerEvaluator::new(
            client.clone(),
            Arc::new(EvaluationCache::in_memory(3600)),
            Arc::new(Semaphore::new(8)),
            RetryConfig::none(),
            5_000,
        );
        let config = circle_config(&["zombie_model", "model_b", "model_c"]);

        let report = run_fire_circle(&evaluator, &config, &ctx()).await.unwrap();

        assert!(report.state.zombie_models.contains(&"zombie_model".to_string()));
        // Round 1 + round 2, never round 3.
        assert_eq!(client.prompts_for("zombie_model").len(), 2);
        // The zombie's F=0.95 round-1 record does not vote.
        assert_eq!(report.consensus.falsehood(), 0.4);
        // Round 3 peer context carries no trace of the zombie.
        let round3_prompts = client.observed_calls();
        let round3 = &round3_prompts[round3_prompts.len() - 2..];
        for call in round3 {
            assert!(!call.prompt.contains("zombie_model"));
        }
    }

    #[tokio::test]
    async fn test_min_circle_degraded_with_partial_records() {
        let client = ScriptedClient::new()
            .script("a", vec![ScriptedReply::Fail("down".into())])
            .script("b", vec![ScriptedReply::Fail("down".into())])
            .script("c", vec![ScriptedReply::scores(0.6, 0.2, 0.3, "lonely"); 3]);
        let evaluator = evaluator_for(client);
        let config = circle_config(&["a", "b", "c"]);

        let result = run_fire_circle(&evaluator, &config, &ctx()).await;
        match result {
            Err(Error::CircleDegraded { active, records }) => {
                assert_eq!(active, 1);
                // All three round-1 records are attached as partial output.
                assert_eq!(records.len(), 3);
            }
            other => panic!("expected CircleDegraded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_chair_rotates_across_rounds() {
        let client = ScriptedClient::uniform(ScriptedReply::scores(0.5, 0.3, 0.3, "ok"));
        let evaluator = evaluator_for(client);
        let config = circle_config(&["m0", "m1", "m2"]);

        let report = run_fire_circle(&evaluator, &config, &ctx()).await.unwrap();

        assert_eq!(report.state.empty_chairs.get(&2).map(String::as_str), Some("m1"));
        assert_eq!(report.state.empty_chairs.get(&3).map(String::as_str), Some("m2"));
    }

    #[tokio::test]
    async fn test_pattern_agreement_and_chair_influence() {
        let client = ScriptedClient::new()
            .script(
                "m0",
                vec![
                    ScriptedReply::scores(0.6, 0.2, 0.3, "baseline"),
                    ScriptedReply::scores_with_patterns(0.3, 0.2, 0.7, &["temporal_inconsistency"]),
                    ScriptedReply::scores_with_patterns(0.3, 0.2, 0.7, &["temporal_inconsistency"]),
                ],
            )
            .script(
                "m1",
                vec![
                    ScriptedReply::scores(0.6, 0.2, 0.3, "baseline"),
                    // m1 is the round 2 empty chair; it surfaces a new pattern
                    ScriptedReply::scores_with_patterns(
                        0.3,
                        0.2,
                        0.6,
                        &["temporal_inconsistency", "context_saturation"],
                    ),
                    ScriptedReply::scores_with_patterns(0.3, 0.2, 0.6, &["temporal_inconsistency"]),
                ],
            )
            .script(
                "m2",
                vec![
                    ScriptedReply::scores(0.6, 0.2, 0.3, "baseline"),
                    ScriptedReply::scores_with_patterns(0.3, 0.2, 0.6, &["temporal_inconsistency"]),
                    ScriptedReply::scores_with_patterns(0.3, 0.2, 0.6, &["temporal_inconsistency"]),
                ],
            );
        let evaluator = evaluator_for(client);
        let config = circle_config(&["m0", "m1", "m2"]);

        let report = run_fire_circle(&evaluator, &config, &ctx()).await.unwrap();

        // All three active models named it: 3/3 >= 0.5
        assert!(report
            .agreed_patterns
            .contains(&"temporal_inconsistency".to_string()));
        // context_saturation named by one of three models: 1 < 0.5 * 3
        assert!(!report.agreed_patterns.contains(&"context_saturation".to_string()));
        // One of two distinct patterns was first mentioned from the chair
        assert_eq!(report.empty_chair_influence, 0.5);
    }

    #[tokio::test]
    async fn test_peer_context_grows_across_rounds() {
        let client = Arc::new(ScriptedClient::uniform(ScriptedReply::scores(
            0.5, 0.3, 0.3, "steady",
        )));
        let evaluator = LayerEvaluator::new(
            client.clone(),
            Arc::new(EvaluationCache::in_memory(3600)),
            Arc::new(Semaphore::new(8)),
            RetryConfig::none(),
            5_000,
        );
        let config = circle_config(&["m0", "m1"]);

        run_fire_circle(&evaluator, &config, &ctx()).await.unwrap();

        let calls = client.observed_calls();
        // Round 2 prompts mention round 1 peers; round 3 prompts mention both.
        let round2 = &calls[2].prompt;
        let round3 = &calls[4].prompt;
        assert!(round2.contains("(round 1)"));
        assert!(!round2.contains("(round 2)"));
        assert!(round3.contains("(round 1)"));
        assert!(round3.contains("(round 2)"));
    }
}
