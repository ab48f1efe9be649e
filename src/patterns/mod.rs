//! Shared types and retry/backoff plumbing for the five pattern executors
//! (C9, spec.md §4.9).
//!
//! Grounded on `orchestration.rs`'s `execute_parallel`/`execute_debate`
//! dispatch shape: one `tokio::spawn`ed task per agent, `join_all` to await
//! the set, `OrchestrationError`'s manual error style now generalised behind
//! [`crate::error::CoreError`].

pub mod consensus;
pub mod debate;
pub mod ensemble;
pub mod parallel;
pub mod review;

use crate::cancel::CancellationToken;
use crate::driver::{AgentDriver, AgentOutcome, AgentTask, TokenUsage};
use crate::error::CoreError;
use crate::model::{Pattern, TokenCounters};
use rand::Rng;
use std::time::Duration;

/// One participating agent: its opaque id plus declarative instructions text.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub id: String,
    pub instructions: String,
}

/// One agent's contribution to a pattern's result.
#[derive(Debug, Clone)]
pub struct PerAgentResult {
    pub agent_id: String,
    pub output: Option<String>,
    pub tokens: TokenUsage,
    pub model: Option<String>,
    pub quality: Option<f32>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl PerAgentResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// An agent invocation that did not contribute to the result — either an
/// optional participant dropped from aggregation, or (when it is the
/// indispensable synthesiser/creator) the reason the whole pattern failed.
#[derive(Debug, Clone)]
pub struct Failure {
    pub agent_id: String,
    pub reason: String,
}

/// Shape every pattern executor returns (spec.md §4.9 / §7: "always
/// contains `{success, pattern, agentIds, durationMs, tokens, errors[]}`").
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub pattern: Pattern,
    pub data: serde_json::Value,
    pub per_agent: Vec<PerAgentResult>,
    pub duration_ms: u64,
    pub tokens: TokenCounters,
    pub failures: Vec<Failure>,
    pub errors: Vec<String>,
}

pub(crate) fn sum_tokens(per_agent: &[PerAgentResult]) -> TokenCounters {
    let mut total = TokenCounters::default();
    for p in per_agent {
        total.input += p.tokens.input_tokens;
        total.output += p.tokens.output_tokens;
        total.cache_create += p.tokens.cache_create_tokens;
        total.cache_read += p.tokens.cache_read_tokens;
    }
    total
}

/// Retry/backoff/timeout policy shared by every per-agent invocation
/// (spec.md §4.9: "configurable timeout ... up to R retries with
/// exponential backoff (base 1s, jitter ±20%)").
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base: Duration::from_millis(1_000),
            timeout: Duration::from_millis(60_000),
        }
    }
}

fn backoff_duration(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_millis() as f64 * 2f64.powi(attempt as i32 - 1);
    let jitter_fraction = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered = (exp * (1.0 + jitter_fraction)).max(0.0);
    Duration::from_millis(jittered as u64)
}

/// Invoke one agent with retries, jittered exponential backoff, and a
/// per-call timeout; honours `cancel` at every suspension point (spec.md
/// §5). Returns the last error once retries are exhausted.
pub(crate) async fn invoke_with_retry(
    driver: &dyn AgentDriver,
    agent: &AgentHandle,
    task: &AgentTask,
    context: &str,
    cancel: &CancellationToken,
    policy: RetryPolicy,
) -> Result<AgentOutcome, CoreError> {
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled(agent.id.clone()));
        }

        let call = driver.invoke(&agent.instructions, task, context, cancel);
        let attempted = tokio::select! {
            res = tokio::time::timeout(policy.timeout, call) => match res {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(CoreError::Timeout(agent.id.clone())),
            },
            _ = cancel.cancelled() => Err(CoreError::Cancelled(agent.id.clone())),
        };

        match attempted {
            Ok(outcome) => return Ok(outcome),
            Err(CoreError::Cancelled(id)) => return Err(CoreError::Cancelled(id)),
            Err(err) => {
                if attempt >= policy.retries {
                    return Err(err);
                }
                attempt += 1;
                let backoff = backoff_duration(policy.base, attempt);
                log::warn!(
                    "agent '{}' invocation failed (attempt {}/{}): {}; retrying in {:?}",
                    agent.id,
                    attempt,
                    policy.retries,
                    err,
                    backoff
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(CoreError::Cancelled(agent.id.clone())),
                }
            }
        }
    }
}
