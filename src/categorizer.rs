//! Extracts typed [`Observation`]s from a completed orchestration (C6, spec.md §4.6).
//!
//! A structured prompt/parse/validate turn against an external completion
//! driver, with a guaranteed non-AI fallback path so the caller always has
//! somewhere to land when the structured reply doesn't parse.

use crate::driver::AgentOutcome;
use crate::model::{new_id, Observation, ObservationSource, ObservationType, Orchestration};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Consumed contract per spec.md §6: `complete(systemPrompt, userPrompt, options) → text`.
#[async_trait]
pub trait AICategorizationDriver: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str, timeout: Duration) -> Result<String, String>;
}

#[derive(Debug, Deserialize)]
struct RawCategorization {
    #[serde(rename = "type")]
    observation_type: Option<String>,
    observation: Option<String>,
    #[serde(default)]
    concepts: serde_json::Value,
    importance: Option<i64>,
    #[serde(default)]
    #[serde(rename = "agentId")]
    agent_insights: Option<HashMap<String, String>>,
    recommendations: Option<String>,
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.strip_suffix("```").unwrap_or(rest).trim()
    } else {
        trimmed
    }
}

fn parse_ai_reply(orchestration_id: &str, reply: &str) -> Option<Observation> {
    let body = strip_code_fence(reply);
    let raw: RawCategorization = serde_json::from_str(body).ok()?;

    let text = raw.observation?;
    if text.trim().is_empty() {
        return None;
    }

    let observation_type = raw
        .observation_type
        .map(|t| ObservationType::parse_or_default(&t))
        .unwrap_or(ObservationType::PatternUsage);

    let concepts: Vec<String> = match raw.concepts {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };

    let importance = raw.importance.unwrap_or(5).clamp(1, 10) as u8;

    let mut text = text;
    if let Some(recommendations) = raw.recommendations {
        if !recommendations.trim().is_empty() {
            text = format!("{} Recommendations: {}", text, recommendations.trim());
        }
    }

    Some(
        Observation {
            id: new_id(),
            orchestration_id: orchestration_id.to_string(),
            observation_type,
            text,
            concepts,
            importance,
            per_agent_insights: raw.agent_insights.unwrap_or_default(),
            source: ObservationSource::Ai,
        }
        .clamp_importance()
        .cap_concepts(),
    )
}

struct KeywordRule {
    observation_type: ObservationType,
    keywords: &'static [&'static str],
    base_importance: u8,
}

const RULES: &[KeywordRule] = &[
    KeywordRule { observation_type: ObservationType::Decision, keywords: &["decided", "decision", "chose", "opted", "selected"], base_importance: 6 },
    KeywordRule { observation_type: ObservationType::Discovery, keywords: &["found", "discovered", "identified", "uncovered", "observed"], base_importance: 7 },
    KeywordRule { observation_type: ObservationType::Refactor, keywords: &["refactor", "restructure", "simplify", "reorganiz", "cleanup"], base_importance: 5 },
    KeywordRule { observation_type: ObservationType::Feature, keywords: &["implement", "added", "introduce", "new feature"], base_importance: 6 },
    KeywordRule { observation_type: ObservationType::Bugfix, keywords: &["fix", "bug", "crash", "error", "patch"], base_importance: 7 },
];

/// Keyword-driven fallback — always available, never blocks (spec.md §4.6).
fn rule_based_fallback(orchestration: &Orchestration) -> Observation {
    let haystack = format!("{} {}", orchestration.task_text, orchestration.result_summary).to_lowercase();

    let matched = RULES.iter().find(|rule| rule.keywords.iter().any(|k| haystack.contains(k)));

    let (observation_type, mut importance) = match matched {
        Some(rule) => (rule.observation_type, rule.base_importance),
        None => (ObservationType::PatternUsage, 3),
    };

    if !orchestration.success {
        importance = importance.saturating_sub(2).max(1);
    }

    let mut concepts = vec![orchestration.pattern.as_str().to_string()];
    if !orchestration.success {
        concepts.push("failure-analysis".to_string());
    }

    let text = if orchestration.success {
        format!("{} pattern run completed: {}", orchestration.pattern, snippet(&orchestration.result_summary))
    } else {
        format!("{} pattern run failed: {}", orchestration.pattern, snippet(&orchestration.result_summary))
    };

    Observation {
        id: new_id(),
        orchestration_id: orchestration.id.clone(),
        observation_type,
        text,
        concepts,
        importance,
        per_agent_insights: HashMap::new(),
        source: ObservationSource::Rule,
    }
    .clamp_importance()
    .cap_concepts()
}

fn snippet(text: &str) -> String {
    if text.chars().count() <= 120 {
        text.to_string()
    } else {
        text.chars().take(120).collect::<String>() + "\u{2026}"
    }
}

fn structured_prompt(orchestration: &Orchestration, outcomes: &[AgentOutcome]) -> (String, String) {
    let system = "Extract one structured observation from a completed multi-agent orchestration. \
        Respond with JSON only: {type, observation, concepts, importance, agentId, recommendations}.".to_string();
    let agents_text = outcomes
        .iter()
        .enumerate()
        .map(|(i, o)| format!("agent[{}] output: {}", i, snippet(&o.output)))
        .collect::<Vec<_>>()
        .join("\n");
    let user = format!(
        "pattern: {}\ntask: {}\nsuccess: {}\nresult: {}\n{}",
        orchestration.pattern, orchestration.task_text, orchestration.success, orchestration.result_summary, agents_text
    );
    (system, user)
}

/// Extracts typed observations from completed orchestrations. Never blocks
/// the Orchestrator — only invoked from the `afterExecution` EventBus
/// fan-out, per spec.md §4.6.
pub struct Categorizer<D: AICategorizationDriver> {
    driver: Option<D>,
    timeout: Duration,
}

impl<D: AICategorizationDriver> Categorizer<D> {
    pub fn new(driver: Option<D>, timeout: Duration) -> Self {
        Self { driver, timeout }
    }

    /// Extract one observation for `orchestration`, preferring the AI path
    /// and falling back to keyword rules on any structural failure.
    pub async fn extract(&self, orchestration: &Orchestration, outcomes: &[AgentOutcome]) -> Observation {
        if let Some(driver) = &self.driver {
            let (system, user) = structured_prompt(orchestration, outcomes);
            match driver.complete(&system, &user, self.timeout).await {
                Ok(reply) => {
                    if let Some(observation) = parse_ai_reply(&orchestration.id, &reply) {
                        return observation;
                    }
                    log::warn!("categorizer: AI reply failed to parse/validate; using rule fallback");
                }
                Err(e) => log::warn!("categorizer: AI completion failed ({}); using rule fallback", e),
            }
        }
        rule_based_fallback(orchestration)
    }

    /// Batch-categorize with a concurrency limit; per-item failures never
    /// abort the batch (each item always resolves via the rule fallback).
    pub async fn extract_batch(
        &self,
        items: &[(Orchestration, Vec<AgentOutcome>)],
        concurrency: usize,
    ) -> Vec<Observation> {
        use futures_util::stream::{self, StreamExt};

        stream::iter(items)
            .map(|(orchestration, outcomes)| self.extract(orchestration, outcomes))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Pattern, TokenCounters};

    struct NoDriver;
    #[async_trait]
    impl AICategorizationDriver for NoDriver {
        async fn complete(&self, _s: &str, _u: &str, _t: Duration) -> Result<String, String> {
            Err("no driver configured".into())
        }
    }

    fn sample_orchestration(success: bool, text: &str) -> Orchestration {
        Orchestration {
            id: new_id(),
            pattern: Pattern::Review,
            agent_ids: vec!["a1".into()],
            task_text: text.into(),
            result_summary: text.into(),
            success,
            started_at: chrono::Utc::now(),
            duration_ms: 5,
            tokens: TokenCounters::default(),
            model: "m".into(),
        }
    }

    #[tokio::test]
    async fn falls_back_to_keyword_rule_without_a_driver() {
        let categorizer = Categorizer::new(None::<NoDriver>, Duration::from_secs(5));
        let orchestration = sample_orchestration(true, "we fixed the login bug after a long chase");
        let obs = categorizer.extract(&orchestration, &[]).await;
        assert_eq!(obs.observation_type, ObservationType::Bugfix);
        assert_eq!(obs.source, ObservationSource::Rule);
    }

    #[tokio::test]
    async fn failure_reduces_importance_and_tags_failure_analysis() {
        let categorizer = Categorizer::new(None::<NoDriver>, Duration::from_secs(5));
        let orchestration = sample_orchestration(false, "we fixed the login bug after a long chase");
        let obs = categorizer.extract(&orchestration, &[]).await;
        assert!(obs.concepts.contains(&"failure-analysis".to_string()));
        assert!(obs.importance < 7);
    }

    #[tokio::test]
    async fn ai_reply_with_code_fence_parses_cleanly() {
        let reply = "```json\n{\"type\":\"decision\",\"observation\":\"chose postgres over sqlite\",\"concepts\":[\"storage\"],\"importance\":8}\n```";
        let obs = parse_ai_reply("orch-1", reply).unwrap();
        assert_eq!(obs.observation_type, ObservationType::Decision);
        assert_eq!(obs.importance, 8);
    }

    #[test]
    fn malformed_ai_reply_returns_none() {
        assert!(parse_ai_reply("orch-1", "not json at all").is_none());
    }
}
