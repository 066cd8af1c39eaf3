//! Per-evaluation fire circle state.
//!
//! Owned exclusively by one evaluation and dropped at its end. Tracks the
//! starting, active, and zombie model sets, the per-round records, the
//! empty-chair schedule, and first mentions of every observed pattern.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::evaluation::types::EvaluationRecord;
use crate::neutrosophic::NeutrosophicValue;

/// Minimum number of active models for the circle to keep deliberating.
pub const MIN_VIABLE_CIRCLE: usize = 2;

/// Records for one completed round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    pub empty_chair: Option<String>,
    pub records: Vec<EvaluationRecord>,
}

/// Mutable state for one fire circle evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireCircleState {
    pub starting_models: Vec<String>,
    /// Models still deliberating, in configured order
    pub active_models: Vec<String>,
    /// Models that failed mid-circle; history kept, no voting rights
    pub zombie_models: Vec<String>,
    pub rounds: Vec<RoundRecord>,
    /// pattern -> (model, round) of first mention
    pub first_mentions: HashMap<String, (String, u32)>,
    /// round -> empty chair model
    pub empty_chairs: HashMap<u32, String>,
}

impl FireCircleState {
    pub fn new(models: Vec<String>) -> Self {
        Self {
            starting_models: models.clone(),
            active_models: models,
            zombie_models: Vec::new(),
            rounds: Vec::new(),
            first_mentions: HashMap::new(),
            empty_chairs: HashMap::new(),
        }
    }

    /// Empty chair for a round, computed against the currently active list
    /// so a zombie never blocks rotation. No chair in round 1.
    pub fn empty_chair_for_round(&self, round: u32) -> Option<&str> {
        if round < 2 || self.active_models.is_empty() {
            return None;
        }
        let index = (round as usize - 1) % self.active_models.len();
        Some(self.active_models[index].as_str())
    }

    /// Drop a model that failed round 1: it never joined the circle.
    pub fn exclude(&mut self, model: &str) {
        self.active_models.retain(|m| m != model);
    }

    /// Demote a model that failed mid-circle. Earlier records persist.
    pub fn mark_zombie(&mut self, model: &str) {
        if self.active_models.iter().any(|m| m == model) {
            self.active_models.retain(|m| m != model);
            self.zombie_models.push(model.to_string());
        }
    }

    pub fn is_viable(&self) -> bool {
        self.active_models.len() >= MIN_VIABLE_CIRCLE
    }

    /// Record first mentions from a successful evaluation record.
    /// Returns the patterns this record mentioned for the first time.
    pub fn note_patterns(&mut self, record: &EvaluationRecord) -> Vec<String> {
        let mut fresh = Vec::new();
        for pattern in &record.patterns_observed {
            if !self.first_mentions.contains_key(pattern) {
                self.first_mentions
                    .insert(pattern.clone(), (record.model.clone(), record.round));
                fresh.push(pattern.clone());
            }
        }
        fresh
    }

    /// All records from every completed round.
    pub fn all_records(&self) -> Vec<EvaluationRecord> {
        self.rounds
            .iter()
            .flat_map(|r| r.records.iter().cloned())
            .collect()
    }

    /// Records belonging to models that are still active, across all rounds.
    /// This is the consensus voting set: zombies keep history, not votes.
    pub fn surviving_records(&self) -> Vec<&EvaluationRecord> {
        self.rounds
            .iter()
            .flat_map(|r| r.records.iter())
            .filter(|record| {
                record.success && self.active_models.iter().any(|m| *m == record.model)
            })
            .collect()
    }

    /// Consensus value: element-wise max of every surviving record.
    /// Max preserves peak vigilance against groupthink; the circle is a
    /// detector, not a vote.
    pub fn consensus(&self) -> Option<NeutrosophicValue> {
        let values: Vec<NeutrosophicValue> = self
            .surviving_records()
            .iter()
            .filter_map(|r| r.value)
            .collect();
        if values.is_empty() {
            return None;
        }
        let t = values.iter().map(|v| v.truth()).fold(0.0f64, f64::max);
        let i = values.iter().map(|v| v.indeterminacy()).fold(0.0f64, f64::max);
        let f = values.iter().map(|v| v.falsehood()).fold(0.0f64, f64::max);
        NeutrosophicValue::new(t, i, f).ok()
    }

    /// Patterns named by at least `threshold * |active_models|` distinct
    /// active models. The denominator is the ACTIVE count: against the
    /// starting count the threshold becomes unachievable under failures.
    pub fn agreed_patterns(&self, threshold: f64) -> Vec<String> {
        let active = self.active_models.len();
        if active == 0 {
            return Vec::new();
        }
        let required = threshold * active as f64;

        let mut naming: HashMap<&str, Vec<&str>> = HashMap::new();
        for record in self.surviving_records() {
            for pattern in &record.patterns_observed {
                let models = naming.entry(pattern.as_str()).or_default();
                if !models.contains(&record.model.as_str()) {
                    models.push(record.model.as_str());
                }
            }
        }

        let mut agreed: Vec<String> = naming
            .into_iter()
            .filter(|(_, models)| models.len() as f64 >= required)
            .map(|(pattern, _)| pattern.to_string())
            .collect();
        agreed.sort_unstable();
        agreed
    }

    /// Fraction of distinct patterns first mentioned by a model while it
    /// held the empty chair. Below 0.10 the chair is performative; at or
    /// above 0.50 it is structural. Deliberately not an F-distance metric:
    /// F-distance would be circular.
    pub fn empty_chair_influence(&self) -> f64 {
        if self.first_mentions.is_empty() {
            return 0.0;
        }
        let chaired = self
            .first_mentions
            .values()
            .filter(|(model, round)| {
                self.empty_chairs
                    .get(round)
                    .is_some_and(|chair| chair == model)
            })
            .count();
        chaired as f64 / self.first_mentions.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LayerRole;
    use crate::evaluation::prompts::TemplateId;
    use crate::evaluation::types::{ErrorKind, ParsedEvaluation, TokenUsage};
    use pretty_assertions::assert_eq;

    fn record(model: &str, round: u32, t: f64, i: f64, f: f64, patterns: &[&str]) -> EvaluationRecord {
        let parsed = ParsedEvaluation {
            truth: t,
            indeterminacy: i,
            falsehood: f,
            reasoning: "test".to_string(),
            patterns_observed: patterns.iter().map(|p| p.to_string()).collect(),
            consensus_patterns: Vec::new(),
            exchange_type: None,
            trust_established: None,
            trust_claimed: None,
            trust_gap: None,
            coerced: false,
        };
        EvaluationRecord::success(
            TemplateId::AyniRelational,
            model,
            Some(LayerRole::User),
            round,
            NeutrosophicValue::new(t, i, f).unwrap(),
            parsed,
            TokenUsage::default(),
            1,
        )
    }

    fn state_with_models(models: &[&str]) -> FireCircleState {
        FireCircleState::new(models.iter().map(|m| m.to_string()).collect())
    }

    #[test]
    fn test_empty_chair_rotation_formula() {
        let state = state_with_models(&["model_a", "model_b", "model_c"]);

        assert_eq!(state.empty_chair_for_round(1), None);
        assert_eq!(state.empty_chair_for_round(2), Some("model_b")); // (2-1) % 3 = 1
        assert_eq!(state.empty_chair_for_round(3), Some("model_c")); // (3-1) % 3 = 2
        assert_eq!(state.empty_chair_for_round(4), Some("model_a")); // (4-1) % 3 = 0

        // Over rounds 2..=n+1, every model serves exactly once
        let chairs: Vec<&str> = (2..=4).filter_map(|r| state.empty_chair_for_round(r)).collect();
        let mut sorted = chairs.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 3);
    }

    #[test]
    fn test_rotation_skips_zombies() {
        let mut state = state_with_models(&["model_a", "model_b", "model_c"]);
        state.mark_zombie("model_b");

        // Rotation recomputes against the active list
        assert_eq!(state.empty_chair_for_round(2), Some("model_c")); // (2-1) % 2 = 1
        assert_eq!(state.empty_chair_for_round(3), Some("model_a")); // (3-1) % 2 = 0
    }

    #[test]
    fn test_max_consensus_across_all_rounds() {
        let mut state = state_with_models(&["vigilant", "conformist"]);
        state.rounds.push(RoundRecord {
            round: 1,
            empty_chair: None,
            records: vec![
                record("vigilant", 1, 0.7, 0.2, 0.2, &[]),
                record("conformist", 1, 0.6, 0.2, 0.3, &[]),
            ],
        });
        state.rounds.push(RoundRecord {
            round: 2,
            empty_chair: None,
            records: vec![
                record("vigilant", 2, 0.3, 0.2, 0.9, &[]),
                record("conformist", 2, 0.6, 0.2, 0.3, &[]),
            ],
        });
        state.rounds.push(RoundRecord {
            round: 3,
            empty_chair: None,
            records: vec![
                record("vigilant", 3, 0.5, 0.2, 0.4, &[]),
                record("conformist", 3, 0.6, 0.2, 0.3, &[]),
            ],
        });

        // Peak vigilance in round 2 survives the round 3 walk-back
        let consensus = state.consensus().unwrap();
        assert_eq!(consensus.falsehood(), 0.9);
        assert_eq!(consensus.truth(), 0.7);
    }

    #[test]
    fn test_zombie_records_excluded_from_consensus() {
        let mut state = state_with_models(&["model_a", "model_b", "model_c"]);
        state.rounds.push(RoundRecord {
            round: 1,
            empty_chair: None,
            records: vec![
                record("model_a", 1, 0.9, 0.1, 0.95, &[]), // highest F, will zombie
                record("model_b", 1, 0.5, 0.2, 0.3, &[]),
                record("model_c", 1, 0.5, 0.2, 0.4, &[]),
            ],
        });
        state.mark_zombie("model_a");

        let consensus = state.consensus().unwrap();
        assert_eq!(consensus.falsehood(), 0.4);
        assert!(state.zombie_models.contains(&"model_a".to_string()));
    }

    #[test]
    fn test_pattern_threshold_uses_active_count() {
        // 10 models started, 5 failed: the denominator must be 5
        let mut state = state_with_models(&[
            "m0", "m1", "m2", "m3", "m4", "m5", "m6", "m7", "m8", "m9",
        ]);
        for m in ["m5", "m6", "m7", "m8", "m9"] {
            state.mark_zombie(m);
        }

        state.rounds.push(RoundRecord {
            round: 2,
            empty_chair: None,
            records: vec![
                record("m0", 2, 0.3, 0.2, 0.7, &["temporal_inconsistency"]),
                record("m1", 2, 0.3, 0.2, 0.7, &["temporal_inconsistency"]),
                record("m2", 2, 0.3, 0.2, 0.7, &["temporal_inconsistency"]),
                record("m3", 2, 0.4, 0.2, 0.5, &[]),
                record("m4", 2, 0.4, 0.2, 0.5, &[]),
            ],
        });

        // 3 of 5 active = 0.6 >= 0.5, qualifies (3 of 10 would not)
        let agreed = state.agreed_patterns(0.5);
        assert_eq!(agreed, vec!["temporal_inconsistency".to_string()]);
    }

    #[test]
    fn test_pattern_counted_once_per_model() {
        let mut state = state_with_models(&["m0", "m1", "m2", "m3"]);
        state.rounds.push(RoundRecord {
            round: 2,
            empty_chair: None,
            records: vec![record("m0", 2, 0.3, 0.2, 0.7, &["polite_extraction"])],
        });
        state.rounds.push(RoundRecord {
            round: 3,
            empty_chair: None,
            records: vec![record("m0", 3, 0.3, 0.2, 0.7, &["polite_extraction"])],
        });

        // One model naming it twice is still 1/4 < 0.5
        assert!(state.agreed_patterns(0.5).is_empty());
    }

    #[test]
    fn test_first_mentions_and_empty_chair_influence() {
        let mut state = state_with_models(&["model_a", "model_b"]);
        state.empty_chairs.insert(2, "model_b".to_string());

        state.note_patterns(&record("model_a", 2, 0.3, 0.2, 0.7, &[
            "temporal_inconsistency",
            "polite_extraction",
        ]));
        state.note_patterns(&record("model_b", 2, 0.3, 0.2, 0.7, &[
            "context_saturation",
            "role_confusion",
            // Already mentioned by model_a; first mention is not overwritten
            "temporal_inconsistency",
        ]));

        assert_eq!(
            state.first_mentions.get("temporal_inconsistency").unwrap().0,
            "model_a"
        );
        // 2 of 4 distinct patterns first mentioned from the chair
        assert_eq!(state.empty_chair_influence(), 0.5);
    }

    #[test]
    fn test_influence_zero_without_patterns() {
        let state = state_with_models(&["model_a", "model_b"]);
        assert_eq!(state.empty_chair_influence(), 0.0);
    }

    #[test]
    fn test_viability() {
        let mut state = state_with_models(&["model_a", "model_b"]);
        assert!(state.is_viable());
        state.mark_zombie("model_b");
        assert!(!state.is_viable());
    }

    #[test]
    fn test_failed_records_never_vote() {
        let mut state = state_with_models(&["model_a", "model_b"]);
        let failed = EvaluationRecord::failure(
            TemplateId::AyniRelational,
            "model_a",
            Some(LayerRole::User),
            2,
            ErrorKind::Timeout,
            "deadline",
            1,
        );
        state.rounds.push(RoundRecord {
            round: 2,
            empty_chair: None,
            records: vec![failed, record("model_b", 2, 0.5, 0.2, 0.3, &[])],
        });

        assert_eq!(state.surviving_records().len(), 1);
        assert_eq!(state.consensus().unwrap().falsehood(), 0.3);
    }
}
