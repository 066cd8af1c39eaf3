//! Session memory: turn-by-turn balances, trust EMA, and trajectory.
//!
//! A session makes attacks visible across a conversation: a single turn can
//! look reciprocal while the balance trend and trust EMA say otherwise. The
//! engine owns one session per conversation id; turns are strictly
//! sequential within a conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::sync::Mutex;

use crate::ayni::{ReciprocityMetrics, TrustViolationKind};

/// Qualitative classification of a session's recent dynamics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trajectory {
    Building,
    Stable,
    Degrading,
    Recovered,
    Collapsed,
}

/// Number of recent turns the trajectory classifier examines.
const TRAJECTORY_LOOKBACK: usize = 5;

/// Classify the trajectory from the previous label, the recent balance
/// deltas, and the current trust EMA. Pure and deterministic.
///
/// COLLAPSED is absorbing. RECOVERED requires a DEGRADING history followed
/// by two consecutive positive deltas.
pub fn classify_trajectory(previous: Trajectory, deltas: &[f64], trust_ema: f64) -> Trajectory {
    if previous == Trajectory::Collapsed || trust_ema < 0.3 {
        return Trajectory::Collapsed;
    }

    if previous == Trajectory::Degrading
        && deltas.len() >= 2
        && deltas[deltas.len() - 2] > 0.0
        && deltas[deltas.len() - 1] > 0.0
    {
        return Trajectory::Recovered;
    }

    if !deltas.is_empty() && deltas.iter().all(|d| *d >= 0.0) && trust_ema >= 0.8 {
        return Trajectory::Building;
    }

    if !deltas.is_empty() {
        let mean = deltas.iter().sum::<f64>() / deltas.len() as f64;
        if mean < -0.2 || deltas.iter().any(|d| *d < -0.7) {
            return Trajectory::Degrading;
        }
    }

    if deltas.iter().all(|d| d.abs() < 0.2) && trust_ema >= 0.6 {
        return Trajectory::Stable;
    }

    Trajectory::Stable
}

/// One evaluated turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_number: u32,
    pub pre: ReciprocityMetrics,
    pub post: Option<ReciprocityMetrics>,
    /// post.ayni_balance − pre.ayni_balance, when a response was evaluated
    pub divergence: Option<f64>,
    pub trust_ema_before: f64,
    pub trust_ema_after: f64,
    pub trajectory: Trajectory,
    /// Violations that triggered on this turn (pre and post combined)
    pub violations: BTreeSet<TrustViolationKind>,
    pub timestamp: DateTime<Utc>,
}

impl TurnRecord {
    /// The balance this turn settles at: the response evaluation when there
    /// is one, the request evaluation otherwise.
    pub fn effective_balance(&self) -> f64 {
        self.post
            .as_ref()
            .map(|m| m.ayni_balance)
            .unwrap_or(self.pre.ayni_balance)
    }
}

/// Serialized view of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub conversation_id: String,
    pub turns: Vec<TurnRecord>,
    pub trust_ema: f64,
    pub trajectory: Trajectory,
}

/// Per-conversation state: bounded turn window, trust EMA, trajectory.
#[derive(Debug, Clone)]
pub struct Session {
    conversation_id: String,
    turns: VecDeque<TurnRecord>,
    window: usize,
    alpha: f64,
    trust_ema: f64,
    trajectory: Trajectory,
    turn_counter: u32,
}

impl Session {
    pub fn new(conversation_id: impl Into<String>, window: usize, alpha: f64) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            turns: VecDeque::new(),
            window: window.max(1),
            alpha,
            // Trust starts whole and is spent, not earned from zero
            trust_ema: 1.0,
            trajectory: Trajectory::Stable,
            turn_counter: 0,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn has_prior_turns(&self) -> bool {
        !self.turns.is_empty()
    }

    /// Number of the most recently recorded turn (0 before the first).
    pub fn turn_number(&self) -> u32 {
        self.turn_counter
    }

    pub fn trust_ema(&self) -> f64 {
        self.trust_ema
    }

    pub fn trajectory(&self) -> Trajectory {
        self.trajectory
    }

    pub fn turns(&self) -> impl Iterator<Item = &TurnRecord> {
        self.turns.iter()
    }

    /// Balance the conversation last settled at.
    pub fn last_balance(&self) -> Option<f64> {
        self.turns.back().map(TurnRecord::effective_balance)
    }

    /// Effective-balance delta of the most recent turn.
    pub fn last_delta(&self) -> Option<f64> {
        let n = self.turns.len();
        if n < 2 {
            return None;
        }
        Some(self.turns[n - 1].effective_balance() - self.turns[n - 2].effective_balance())
    }

    /// Consecutive effective-balance deltas over the last `lookback` turns.
    fn recent_deltas(&self, lookback: usize) -> Vec<f64> {
        let balances: Vec<f64> = self
            .turns
            .iter()
            .rev()
            .take(lookback)
            .map(TurnRecord::effective_balance)
            .collect();
        balances
            .windows(2)
            // Reversed iteration: balances[i] is newer than balances[i + 1]
            .map(|pair| pair[0] - pair[1])
            .rev()
            .collect()
    }

    /// Record an evaluated turn and update the EMA and trajectory.
    pub fn record_turn(
        &mut self,
        pre: ReciprocityMetrics,
        post: Option<ReciprocityMetrics>,
        divergence: Option<f64>,
    ) -> &TurnRecord {
        self.turn_counter += 1;
        let trust_ema_before = self.trust_ema;

        let settled = post.as_ref().unwrap_or(&pre);
        let strength = settled.trust_field.strength;
        self.trust_ema =
            (self.alpha * strength + (1.0 - self.alpha) * self.trust_ema).clamp(0.0, 1.0);

        let mut violations: BTreeSet<TrustViolationKind> =
            pre.trust_field.violations.iter().copied().collect();
        if let Some(post) = &post {
            violations.extend(post.trust_field.violations.iter().copied());
        }

        let record = TurnRecord {
            turn_number: self.turn_counter,
            pre,
            post,
            divergence,
            trust_ema_before,
            trust_ema_after: self.trust_ema,
            // Placeholder until deltas include this turn
            trajectory: self.trajectory,
            violations,
            timestamp: Utc::now(),
        };
        self.turns.push_back(record);
        while self.turns.len() > self.window {
            self.turns.pop_front();
        }

        let deltas = self.recent_deltas(TRAJECTORY_LOOKBACK.min(self.window));
        self.trajectory = classify_trajectory(self.trajectory, &deltas, self.trust_ema);
        let last = self.turns.back_mut().expect("turn just pushed");
        last.trajectory = self.trajectory;
        &*last
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            conversation_id: self.conversation_id.clone(),
            turns: self.turns.iter().cloned().collect(),
            trust_ema: self.trust_ema,
            trajectory: self.trajectory,
        }
    }
}

/// Engine-owned map of sessions, exclusive per conversation id.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    window: usize,
    alpha: f64,
}

impl SessionStore {
    pub fn new(window: usize, alpha: f64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            window,
            alpha,
        }
    }

    /// Run `f` with exclusive access to the conversation's session,
    /// creating it on first use.
    pub async fn with_session<R>(
        &self,
        conversation_id: &str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> R {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| Session::new(conversation_id, self.window, self.alpha));
        f(session)
    }

    pub async fn snapshot(&self, conversation_id: &str) -> Option<SessionSnapshot> {
        let sessions = self.sessions.lock().await;
        sessions.get(conversation_id).map(Session::snapshot)
    }
}
