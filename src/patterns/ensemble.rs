//! Ensemble pattern (spec.md §4.9.5): every agent runs independently, then
//! results are combined by one of three strategies — `best-of`, `merge`,
//! `vote`.
//!
//! Uses the same parallel fan-out as [`super::parallel`]; the three
//! combination strategies implement spec.md's deterministic tie-break
//! rules.

use super::{invoke_with_retry, sum_tokens, AgentHandle, ExecutionOutcome, Failure, PerAgentResult, RetryPolicy};
use crate::cancel::CancellationToken;
use crate::driver::{AgentDriver, AgentTask};
use crate::model::Pattern;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    BestOf,
    Merge,
    Vote,
}

async fn dispatch(
    driver: Arc<dyn AgentDriver>,
    agents: &[AgentHandle],
    task: &AgentTask,
    context: &str,
    cancel: &CancellationToken,
    policy: RetryPolicy,
) -> Vec<PerAgentResult> {
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
    futures_util::future::join_all(futures).await
}

fn output_hash(output: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(output.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `best-of`: highest self-reported quality wins; ties broken by lowest
/// latency (spec.md §4.9.5). Agents with no quality score sort last.
fn best_of(successes: &[&PerAgentResult]) -> Option<&PerAgentResult> {
    successes.iter().copied().max_by(|a, b| {
        let qa = a.quality.unwrap_or(f32::MIN);
        let qb = b.quality.unwrap_or(f32::MIN);
        qa.partial_cmp(&qb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.duration_ms.cmp(&a.duration_ms))
    })
}

/// `merge`: deterministic concatenation in input agent order, deduplicated
/// by output hash.
fn merge(agents: &[AgentHandle], successes: &[&PerAgentResult]) -> Vec<String> {
    let by_id: HashMap<&str, &PerAgentResult> = successes.iter().map(|r| (r.agent_id.as_str(), *r)).collect();
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for agent in agents {
        if let Some(result) = by_id.get(agent.id.as_str()) {
            if let Some(output) = &result.output {
                let hash = output_hash(output);
                if seen.insert(hash) {
                    merged.push(output.clone());
                }
            }
        }
    }
    merged
}

/// `vote`: classification-style; plurality wins with lexicographic
/// tie-break over the label text.
fn vote(successes: &[&PerAgentResult]) -> Option<(String, u32)> {
    let mut tallies: HashMap<String, u32> = HashMap::new();
    for r in successes {
        if let Some(label) = &r.output {
            *tallies.entry(label.trim().to_string()).or_insert(0) += 1;
        }
    }
    tallies
        .into_iter()
        .max_by(|(la, ca), (lb, cb)| ca.cmp(cb).then_with(|| lb.cmp(la)))
}

pub async fn execute(
    driver: Arc<dyn AgentDriver>,
    agents: &[AgentHandle],
    task: &AgentTask,
    context: &str,
    cancel: &CancellationToken,
    policy: RetryPolicy,
    strategy: Strategy,
) -> ExecutionOutcome {
    let started = Instant::now();
    let per_agent = dispatch(driver, agents, task, context, cancel, policy).await;

    let failures: Vec<Failure> = per_agent
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| Failure { agent_id: r.agent_id.clone(), reason: r.error.clone().unwrap_or_default() })
        .collect();

    let successes: Vec<&PerAgentResult> = per_agent.iter().filter(|r| r.is_success()).collect();
    let success = !successes.is_empty();

    let data = if !success {
        serde_json::json!({})
    } else {
        match strategy {
            Strategy::BestOf => match best_of(&successes) {
                Some(winner) => serde_json::json!({
                    "strategy": "best-of",
                    "winnerAgentId": winner.agent_id,
                    "output": winner.output,
                }),
                None => serde_json::json!({}),
            },
            Strategy::Merge => {
                let merged = merge(agents, &successes);
                serde_json::json!({ "strategy": "merge", "outputs": merged })
            }
            Strategy::Vote => match vote(&successes) {
                Some((label, count)) => serde_json::json!({
                    "strategy": "vote",
                    "winner": label,
                    "votes": count,
                    "totalVoters": successes.len(),
                }),
                None => serde_json::json!({}),
            },
        }
    };

    ExecutionOutcome {
        success,
        pattern: Pattern::Ensemble,
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
    async fn best_of_picks_highest_quality() {
        let driver: Arc<dyn AgentDriver> = Arc::new(
            ScriptedDriver::new()
                .with_outcome("a", "a-output", Some(0.5))
                .with_outcome("b", "b-output", Some(0.9)),
        );
        let agents = vec![agent("a"), agent("b")];
        let task = AgentTask::new("t");
        let cancel = CancellationToken::new();
        let outcome = execute(driver, &agents, &task, "", &cancel, RetryPolicy::default(), Strategy::BestOf).await;
        assert_eq!(outcome.data["winnerAgentId"], serde_json::json!("b"));
    }

    #[tokio::test]
    async fn merge_dedupes_identical_outputs_preserving_order() {
        let driver: Arc<dyn AgentDriver> = Arc::new(
            ScriptedDriver::new()
                .with_outcome("a", "same", None)
                .with_outcome("b", "same", None)
                .with_outcome("c", "different", None),
        );
        let agents = vec![agent("a"), agent("b"), agent("c")];
        let task = AgentTask::new("t");
        let cancel = CancellationToken::new();
        let outcome = execute(driver, &agents, &task, "", &cancel, RetryPolicy::default(), Strategy::Merge).await;
        assert_eq!(outcome.data["outputs"], serde_json::json!(["same", "different"]));
    }

    #[tokio::test]
    async fn vote_breaks_ties_lexicographically() {
        let driver: Arc<dyn AgentDriver> = Arc::new(
            ScriptedDriver::new()
                .with_outcome("a", "zebra", None)
                .with_outcome("b", "apple", None),
        );
        let agents = vec![agent("a"), agent("b")];
        let task = AgentTask::new("t");
        let cancel = CancellationToken::new();
        let outcome = execute(driver, &agents, &task, "", &cancel, RetryPolicy::default(), Strategy::Vote).await;
        assert_eq!(outcome.data["winner"], serde_json::json!("apple"));
    }

    #[tokio::test]
    async fn zero_successes_yields_failure() {
        let driver: Arc<dyn AgentDriver> = Arc::new(ScriptedDriver::new().with_failure("a", "boom"));
        let agents = vec![agent("a")];
        let task = AgentTask::new("t");
        let cancel = CancellationToken::new();
        let outcome = execute(driver, &agents, &task, "", &cancel, RetryPolicy { retries: 0, ..RetryPolicy::default() }, Strategy::Vote).await;
        assert!(!outcome.success);
    }
}
