//! Consensus pattern (spec.md §4.9.2): every agent independently picks an
//! option (its `output`) and reports a confidence in `[0,1]` (its
//! `quality`, reused here as the confidence score); votes are tallied as
//! `weight(agent) · confidence(agent, option)` and the winner must clear
//! `threshold` relative to total weight.
//!
//! Uses the same fan-out shape as [`super::parallel`], plus a
//! normalized-text vote tally with deterministic lexicographic tie-break.

use super::{invoke_with_retry, sum_tokens, AgentHandle, ExecutionOutcome, Failure, PerAgentResult, RetryPolicy};
use crate::cancel::CancellationToken;
use crate::driver::{AgentDriver, AgentTask};
use crate::model::Pattern;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Voting strategy (spec.md §4.9.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Every agent weighted equally regardless of caller-supplied weights.
    Majority,
    /// Caller-supplied per-agent weights override the uniform default.
    Weighted,
    /// Consensus requires every successful voter to have picked the same
    /// option, in addition to clearing `threshold`.
    Unanimous,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Majority
    }
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `success` reflects agent-dispatch success (spec.md §7: the top-level
/// field is independent of whether consensus was actually reached); the
/// `consensus`/`winner`/`votes` data lives in `data`.
pub async fn execute(
    driver: Arc<dyn AgentDriver>,
    agents: &[AgentHandle],
    task: &AgentTask,
    context: &str,
    cancel: &CancellationToken,
    policy: RetryPolicy,
    threshold: f64,
    strategy: Strategy,
    weights: &HashMap<String, f64>,
) -> ExecutionOutcome {
    let started = Instant::now();
    let futures = agents.iter().map(|agent| {
        let driver = Arc::clone(&driver);
        let agent = agent.clone();
        let task = task.clone();
        let context = context.to_string();
        let cancel = cancel.clone();
        async move {
            let call_started = Instant::now();
            let result = invoke_with_retry(driver.as_ref(), &agent, &task, &context, &cancel, policy).await;
            let elapsed = call_started.elapsed().as_millis() as u64;
            match result {
                Ok(outcome) => PerAgentResult {
                    agent_id: agent.id.clone(),
                    output: Some(outcome.output),
                    tokens: outcome.tokens,
                    model: Some(outcome.model),
                    quality: outcome.quality,
                    duration_ms: elapsed,
                    error: None,
                },
                Err(e) => PerAgentResult {
                    agent_id: agent.id.clone(),
                    output: None,
                    tokens: Default::default(),
                    model: None,
                    quality: None,
                    duration_ms: elapsed,
                    error: Some(e.to_string()),
                },
            }
        }
    });

    let per_agent: Vec<PerAgentResult> = futures_util::future::join_all(futures).await;

    let failures: Vec<Failure> = per_agent
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| Failure {
            agent_id: r.agent_id.clone(),
            reason: r.error.clone().unwrap_or_default(),
        })
        .collect();

    let success = per_agent.iter().any(|r| r.is_success());

    let weight_of = |agent_id: &str| -> f64 {
        match strategy {
            Strategy::Weighted => weights.get(agent_id).copied().unwrap_or(1.0),
            Strategy::Majority | Strategy::Unanimous => 1.0,
        }
    };

    // Tally by normalized text, keeping the first verbatim output seen for
    // each bucket so the reported `winner` text is agent-authored, not a
    // synthetic normalization. Each vote contributes `weight · confidence`
    // (confidence defaults to 1.0 when the agent reported none).
    let mut tallies: HashMap<String, (f64, String)> = HashMap::new();
    let mut total_weight = 0.0;
    let mut distinct_options = std::collections::HashSet::new();
    for r in per_agent.iter().filter(|r| r.is_success()) {
        let output = r.output.clone().unwrap_or_default();
        let key = normalize(&output);
        let weight = weight_of(&r.agent_id);
        let confidence = r.quality.map(|q| q as f64).unwrap_or(1.0);
        let entry = tallies.entry(key.clone()).or_insert((0.0, output));
        entry.0 += weight * confidence;
        total_weight += weight;
        distinct_options.insert(key);
    }

    let voters = per_agent.iter().filter(|r| r.is_success()).count();

    // Deterministic tie-break: highest vote mass, then lexicographically
    // smallest normalized key (spec.md P9).
    let winner = tallies
        .iter()
        .max_by(|(ka, (va, _)), (kb, (vb, _))| va.partial_cmp(vb).unwrap_or(std::cmp::Ordering::Equal).then_with(|| kb.cmp(ka)))
        .map(|(_, (vote, text))| (*vote, text.clone()));

    let data = match winner {
        Some((vote, text)) if voters > 0 && total_weight > 0.0 => {
            let share = vote / total_weight;
            let unanimous_ok = strategy != Strategy::Unanimous || distinct_options.len() <= 1;
            let consensus = share >= threshold && unanimous_ok;
            serde_json::json!({
                "consensus": consensus,
                "winner": if consensus { serde_json::Value::String(text.clone()) } else { serde_json::Value::Null },
                "votes": tallies.values().map(|(v, t)| serde_json::json!({ "output": t, "vote": v })).collect::<Vec<_>>(),
                "voteShare": share,
                "threshold": threshold,
            })
        }
        _ => serde_json::json!({
            "consensus": false,
            "winner": serde_json::Value::Null,
            "votes": serde_json::Value::Array(vec![]),
            "voteShare": 0.0,
            "threshold": threshold,
        }),
    };

    ExecutionOutcome {
        success,
        pattern: Pattern::Consensus,
        data,
        tokens: sum_tokens(&per_agent),
        errors: failures.iter().map(|f| f.reason.clone()).collect(),
        duration_ms: started.elapsed().as_millis() as u64,
        per_agent,
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::test_support::{agent, ScriptedDriver};

    #[tokio::test]
    async fn majority_reaches_consensus() {
        let driver: Arc<dyn AgentDriver> = Arc::new(
            ScriptedDriver::new()
                .with_outcome("a", "Yes, do it.", None)
                .with_outcome("b", "yes, do it", None)
                .with_outcome("c", "no", None),
        );
        let agents = vec![agent("a"), agent("b"), agent("c")];
        let task = AgentTask::new("should we?");
        let cancel = CancellationToken::new();
        let outcome = execute(driver, &agents, &task, "", &cancel, RetryPolicy::default(), 0.6, Strategy::Majority, &HashMap::new()).await;
        assert!(outcome.success);
        assert_eq!(outcome.data["consensus"], serde_json::json!(true));
        assert_eq!(outcome.data["winner"], serde_json::json!("Yes, do it."));
    }

    #[tokio::test]
    async fn split_vote_below_threshold_reports_no_consensus() {
        let driver: Arc<dyn AgentDriver> = Arc::new(
            ScriptedDriver::new()
                .with_outcome("a", "yes", None)
                .with_outcome("b", "no", None),
        );
        let agents = vec![agent("a"), agent("b")];
        let task = AgentTask::new("should we?");
        let cancel = CancellationToken::new();
        let outcome = execute(driver, &agents, &task, "", &cancel, RetryPolicy::default(), 0.6, Strategy::Majority, &HashMap::new()).await;
        assert!(outcome.success);
        assert_eq!(outcome.data["consensus"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn dispatch_success_independent_of_consensus_reached() {
        let driver: Arc<dyn AgentDriver> = Arc::new(ScriptedDriver::new().with_failure("a", "boom").with_outcome("b", "ok", None));
        let agents = vec![agent("a"), agent("b")];
        let task = AgentTask::new("t");
        let cancel = CancellationToken::new();
        let outcome = execute(
            driver,
            &agents,
            &task,
            "",
            &cancel,
            RetryPolicy { retries: 0, ..RetryPolicy::default() },
            0.9,
            Strategy::Majority,
            &HashMap::new(),
        )
        .await;
        assert!(outcome.success);
        assert_eq!(outcome.failures.len(), 1);
    }

    /// spec.md B2: a single agent reaches consensus iff its own confidence
    /// clears `threshold` — share = weight·confidence / total_weight =
    /// confidence when there is exactly one unit-weight voter.
    #[tokio::test]
    async fn single_agent_consensus_depends_on_its_confidence() {
        let driver: Arc<dyn AgentDriver> = Arc::new(ScriptedDriver::new().with_outcome("a", "A", Some(0.9)));
        let agents = vec![agent("a")];
        let task = AgentTask::new("t");
        let cancel = CancellationToken::new();
        let outcome = execute(driver, &agents, &task, "", &cancel, RetryPolicy::default(), 0.6, Strategy::Majority, &HashMap::new()).await;
        assert_eq!(outcome.data["consensus"], serde_json::json!(true));

        let driver: Arc<dyn AgentDriver> = Arc::new(ScriptedDriver::new().with_outcome("a", "A", Some(0.3)));
        let outcome = execute(driver, &agents, &task, "", &cancel, RetryPolicy::default(), 0.6, Strategy::Majority, &HashMap::new()).await;
        assert_eq!(outcome.data["consensus"], serde_json::json!(false));
    }

    /// spec.md S2: four agents split A,A,B,B with uniform weight/confidence
    /// 1. At threshold 0.6 neither option clears 50%: no consensus. At
    /// threshold 0.5 the tie is broken lexicographically in favor of "a".
    #[tokio::test]
    async fn four_way_tie_resolves_by_threshold_and_lexicographic_tiebreak() {
        let driver: Arc<dyn AgentDriver> = Arc::new(
            ScriptedDriver::new()
                .with_outcome("a1", "a", Some(1.0))
                .with_outcome("a2", "a", Some(1.0))
                .with_outcome("b1", "b", Some(1.0))
                .with_outcome("b2", "b", Some(1.0)),
        );
        let agents = vec![agent("a1"), agent("a2"), agent("b1"), agent("b2")];
        let task = AgentTask::new("t");
        let cancel = CancellationToken::new();

        let outcome = execute(driver, &agents, &task, "", &cancel, RetryPolicy::default(), 0.6, Strategy::Majority, &HashMap::new()).await;
        assert_eq!(outcome.data["consensus"], serde_json::json!(false));
        assert_eq!(outcome.data["winner"], serde_json::Value::Null);

        let driver: Arc<dyn AgentDriver> = Arc::new(
            ScriptedDriver::new()
                .with_outcome("a1", "a", Some(1.0))
                .with_outcome("a2", "a", Some(1.0))
                .with_outcome("b1", "b", Some(1.0))
                .with_outcome("b2", "b", Some(1.0)),
        );
        let outcome = execute(driver, &agents, &task, "", &cancel, RetryPolicy::default(), 0.5, Strategy::Majority, &HashMap::new()).await;
        assert_eq!(outcome.data["consensus"], serde_json::json!(true));
        assert_eq!(outcome.data["winner"], serde_json::json!("a"));
    }

    #[tokio::test]
    async fn unanimous_strategy_rejects_any_dissent() {
        let driver: Arc<dyn AgentDriver> = Arc::new(
            ScriptedDriver::new()
                .with_outcome("a", "a", Some(1.0))
                .with_outcome("b", "a", Some(1.0))
                .with_outcome("c", "b", Some(1.0)),
        );
        let agents = vec![agent("a"), agent("b"), agent("c")];
        let task = AgentTask::new("t");
        let cancel = CancellationToken::new();
        let outcome = execute(driver, &agents, &task, "", &cancel, RetryPolicy::default(), 0.5, Strategy::Unanimous, &HashMap::new()).await;
        assert_eq!(outcome.data["consensus"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn weighted_strategy_honours_caller_supplied_weights() {
        let driver: Arc<dyn AgentDriver> = Arc::new(
            ScriptedDriver::new()
                .with_outcome("a", "a", Some(1.0))
                .with_outcome("b", "b", Some(1.0)),
        );
        let agents = vec![agent("a"), agent("b")];
        let task = AgentTask::new("t");
        let cancel = CancellationToken::new();
        let mut weights = HashMap::new();
        weights.insert("a".to_string(), 3.0);
        weights.insert("b".to_string(), 1.0);
        let outcome = execute(driver, &agents, &task, "", &cancel, RetryPolicy::default(), 0.6, Strategy::Weighted, &weights).await;
        assert_eq!(outcome.data["consensus"], serde_json::json!(true));
        assert_eq!(outcome.data["winner"], serde_json::json!("a"));
    }
}
