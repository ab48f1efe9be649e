//! Parallel pattern (spec.md §4.9.1): dispatch every agent concurrently
//! against the same task, no cross-agent coordination.
//!
//! Grounded on `orchestration.rs::execute_parallel`: one spawned task per
//! agent, `futures_util::future::join_all` to await the set without
//! cancelling the others on a single failure.

use super::{invoke_with_retry, sum_tokens, AgentHandle, ExecutionOutcome, Failure, PerAgentResult, RetryPolicy};
use crate::cancel::CancellationToken;
use crate::driver::{AgentDriver, AgentTask};
use crate::model::Pattern;
use std::sync::Arc;
use std::time::Instant;

/// Run every agent in `agents` concurrently. `success` is true when at
/// least one agent produced output (spec.md §8 B3: zero successes yields
/// `success=false` and empty `data`).
pub async fn execute(
    driver: Arc<dyn AgentDriver>,
    agents: &[AgentHandle],
    task: &AgentTask,
    context: &str,
    cancel: &CancellationToken,
    policy: RetryPolicy,
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

    let successes: Vec<&PerAgentResult> = per_agent.iter().filter(|r| r.is_success()).collect();
    let success = !successes.is_empty();

    let data = if success {
        serde_json::json!({
            "outputs": successes.iter().map(|r| serde_json::json!({
                "agentId": r.agent_id,
                "output": r.output,
            })).collect::<Vec<_>>(),
        })
    } else {
        serde_json::json!({})
    };

    ExecutionOutcome {
        success,
        pattern: Pattern::Parallel,
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
    async fn all_successes_aggregate_outputs() {
        let driver: Arc<dyn AgentDriver> = Arc::new(
            ScriptedDriver::new()
                .with_outcome("a", "alpha says hi", Some(0.9))
                .with_outcome("b", "beta says hi", Some(0.8)),
        );
        let agents = vec![agent("a"), agent("b")];
        let task = AgentTask::new("greet");
        let cancel = CancellationToken::new();
        let outcome = execute(driver, &agents, &task, "", &cancel, RetryPolicy::default()).await;
        assert!(outcome.success);
        assert_eq!(outcome.per_agent.len(), 2);
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn zero_successes_yields_failure_and_empty_data() {
        let driver: Arc<dyn AgentDriver> = Arc::new(
            ScriptedDriver::new()
                .with_failure("a", "boom")
                .with_failure("b", "boom"),
        );
        let agents = vec![agent("a"), agent("b")];
        let task = AgentTask::new("greet");
        let cancel = CancellationToken::new();
        let outcome = execute(driver, &agents, &task, "", &cancel, RetryPolicy { retries: 0, ..RetryPolicy::default() }).await;
        assert!(!outcome.success);
        assert_eq!(outcome.data, serde_json::json!({}));
        assert_eq!(outcome.failures.len(), 2);
    }

    #[tokio::test]
    async fn partial_failure_still_succeeds() {
        let driver: Arc<dyn AgentDriver> = Arc::new(
            ScriptedDriver::new()
                .with_outcome("a", "alpha says hi", Some(0.9))
                .with_failure("b", "boom"),
        );
        let agents = vec![agent("a"), agent("b")];
        let task = AgentTask::new("greet");
        let cancel = CancellationToken::new();
        let outcome = execute(driver, &agents, &task, "", &cancel, RetryPolicy { retries: 0, ..RetryPolicy::default() }).await;
        assert!(outcome.success);
        assert_eq!(outcome.failures.len(), 1);
    }
}
