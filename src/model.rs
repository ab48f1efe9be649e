//! Shared data model entities (spec.md §3).
//!
//! These are plain, serializable structs: public fields, no hidden
//! invariants enforced through getters, `Serialize`/`Deserialize` derived
//! rather than hand-written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Generate an opaque, time-ordered-enough unique id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// One of the five collaboration patterns an `Orchestration` can run under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    Parallel,
    Consensus,
    Debate,
    Review,
    Ensemble,
}

impl Pattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pattern::Parallel => "parallel",
            Pattern::Consensus => "consensus",
            Pattern::Debate => "debate",
            Pattern::Review => "review",
            Pattern::Ensemble => "ensemble",
        }
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Token counters tracked per orchestration and per usage record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct TokenCounters {
    pub input: u64,
    pub output: u64,
    pub cache_create: u64,
    pub cache_read: u64,
}

impl TokenCounters {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_create + self.cache_read
    }

    pub fn add(&mut self, other: &TokenCounters) {
        self.input += other.input;
        self.output += other.output;
        self.cache_create += other.cache_create;
        self.cache_read += other.cache_read;
    }
}

/// One execution of a pattern (spec.md §3 "Orchestration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orchestration {
    pub id: String,
    pub pattern: Pattern,
    /// Ordered, duplicates-allowed sequence of participating agent ids.
    pub agent_ids: Vec<String>,
    pub task_text: String,
    pub result_summary: String,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub tokens: TokenCounters,
    pub model: String,
}

impl Orchestration {
    /// True once the orchestration row may be written: non-empty agent list,
    /// immutable id already assigned. Invariant (b) from spec.md §3.
    pub fn is_well_formed(&self) -> bool {
        !self.agent_ids.is_empty() && !self.id.is_empty()
    }
}

/// Closed set of observation kinds (spec.md §3 / §4.6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ObservationType {
    Decision,
    Bugfix,
    Feature,
    PatternUsage,
    Discovery,
    Refactor,
}

impl ObservationType {
    /// Parse a free-text type name, defaulting to `PatternUsage` for anything
    /// unrecognised (spec.md §3 invariant (b), §4.6 validation rule).
    pub fn parse_or_default(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "decision" => ObservationType::Decision,
            "bugfix" => ObservationType::Bugfix,
            "feature" => ObservationType::Feature,
            "discovery" => ObservationType::Discovery,
            "refactor" => ObservationType::Refactor,
            _ => ObservationType::PatternUsage,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationType::Decision => "decision",
            ObservationType::Bugfix => "bugfix",
            ObservationType::Feature => "feature",
            ObservationType::PatternUsage => "pattern-usage",
            ObservationType::Discovery => "discovery",
            ObservationType::Refactor => "refactor",
        }
    }
}

/// Where an `Observation` came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ObservationSource {
    Ai,
    Rule,
}

/// A learning extracted from a completed `Orchestration` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    pub orchestration_id: String,
    pub observation_type: ObservationType,
    pub text: String,
    /// Closed at 5 entries (spec.md §4.6 "caps at 5 concepts").
    pub concepts: Vec<String>,
    /// Clamped to `[1, 10]`.
    pub importance: u8,
    pub per_agent_insights: HashMap<String, String>,
    pub source: ObservationSource,
}

impl Observation {
    pub fn clamp_importance(mut self) -> Self {
        self.importance = self.importance.clamp(1, 10);
        self
    }

    pub fn cap_concepts(mut self) -> Self {
        self.concepts.truncate(5);
        self
    }
}

/// Denormalised rolling counters for a single pattern (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PatternStat {
    pub pattern: String,
    pub total: u64,
    pub successes: u64,
    pub avg_duration_ms: f64,
}

/// Denormalised rolling counters for a single agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentStat {
    pub agent_id: String,
    pub total: u64,
    pub successes: u64,
    pub avg_duration_ms: f64,
}

/// Denormalised rolling counters for a distinct set of co-participating agents.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Collaboration {
    pub agent_ids: Vec<String>,
    pub total: u64,
    pub successes: u64,
}

/// Shared success-rate math for the three stat kinds above (undefined when
/// `total == 0`, per spec.md §3).
pub trait SuccessRate {
    fn totals(&self) -> (u64, u64);
    fn success_rate(&self) -> Option<f64> {
        let (total, successes) = self.totals();
        if total == 0 {
            None
        } else {
            Some(successes as f64 / total as f64)
        }
    }
}

impl SuccessRate for PatternStat {
    fn totals(&self) -> (u64, u64) {
        (self.total, self.successes)
    }
}
impl SuccessRate for AgentStat {
    fn totals(&self) -> (u64, u64) {
        (self.total, self.successes)
    }
}
impl SuccessRate for Collaboration {
    fn totals(&self) -> (u64, u64) {
        (self.total, self.successes)
    }
}

impl Collaboration {
    /// Row key: the sorted, deduplicated tuple of participating agent ids.
    pub fn key_for(agent_ids: &[String]) -> String {
        let mut ids: Vec<&str> = agent_ids.iter().map(String::as_str).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.join(",")
    }
}

/// One row per orchestration for cost accounting (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub orchestration_id: String,
    pub model: String,
    pub tokens: TokenCounters,
    pub cost_usd: f64,
    pub cache_savings_usd: f64,
    pub unknown_model: bool,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_type_falls_back_to_pattern_usage() {
        assert_eq!(
            ObservationType::parse_or_default("not-a-real-type"),
            ObservationType::PatternUsage
        );
        assert_eq!(
            ObservationType::parse_or_default("Bugfix"),
            ObservationType::Bugfix
        );
    }

    #[test]
    fn collaboration_key_is_order_independent() {
        let a = Collaboration::key_for(&["b".into(), "a".into()]);
        let b = Collaboration::key_for(&["a".into(), "b".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn success_rate_undefined_when_total_zero() {
        let stat = PatternStat::default();
        assert_eq!(stat.success_rate(), None);
    }
}
