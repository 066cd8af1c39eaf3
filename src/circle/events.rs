//! Observable events emitted during a fire circle evaluation.
//!
//! The event stream makes the round structure auditable after the fact:
//! which models joined, who held the empty chair, who went zombie, and
//! where consensus landed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Types of events emitted across fire circle rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircleEventType {
    /// A round began with the listed active models
    RoundStart,
    /// A round completed; barrier crossed
    RoundComplete,
    /// Model failed round 1 and never joined the circle
    ModelExcluded,
    /// Model failed mid-circle; history kept, no further participation
    ModelZombied,
    /// Empty chair assignment for a round
    EmptyChairAssigned,
    /// A pattern was mentioned for the first time
    PatternFirstMention,
    /// Consensus computed from all surviving records
    ConsensusReached,
    /// Active models dropped below the minimum viable circle
    CircleDegraded,
}

impl std::fmt::Display for CircleEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RoundStart => "ROUND_START",
            Self::RoundComplete => "ROUND_COMPLETE",
            Self::ModelExcluded => "MODEL_EXCLUDED",
            Self::ModelZombied => "MODEL_ZOMBIED",
            Self::EmptyChairAssigned => "EMPTY_CHAIR_ASSIGNED",
            Self::PatternFirstMention => "PATTERN_FIRST_MENTION",
            Self::ConsensusReached => "CONSENSUS_REACHED",
            Self::CircleDegraded => "CIRCLE_DEGRADED",
        };
        write!(f, "{s}")
    }
}

/// One observable event in a fire circle evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircleEvent {
    pub event_type: CircleEventType,
    /// Round the event belongs to (0 for circle-level events)
    pub round: u32,
    /// Model involved, when the event concerns one
    pub model: Option<String>,
    /// Human-readable description
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl CircleEvent {
    pub fn new(event_type: CircleEventType, round: u32, detail: impl Into<String>) -> Self {
        Self {
            event_type,
            round,
            model: None,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}
