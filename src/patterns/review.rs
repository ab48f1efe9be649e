//! Review pattern (spec.md §4.9.4): one creator produces an artefact,
//! one-to-many reviewers critique it in parallel, the creator revises.
//! Stops once the creator marks its revision accepted, or `rounds` is
//! reached.
//!
//! A privileged participant (the creator) whose output gates continuation,
//! same moderated-turn shape as [`super::debate`]'s synthesiser.

use super::{sum_tokens, AgentHandle, ExecutionOutcome, Failure, PerAgentResult, RetryPolicy};
use crate::cancel::CancellationToken;
use crate::driver::{AgentDriver, AgentTask};
use crate::model::Pattern;
use std::sync::Arc;
use std::time::Instant;

/// Sentinel the creator includes in its output to signal the artefact is
/// ready. Checked case-insensitively as a whole-word match so ordinary
/// prose mentioning "accepted" doesn't false-positive.
const ACCEPTED_MARKER: &str = "ACCEPTED";

fn is_accepted(output: &str) -> bool {
    output
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| word.eq_ignore_ascii_case(ACCEPTED_MARKER))
}

fn critique_task(original: &AgentTask, artefact: &str) -> AgentTask {
    let mut task = original.clone();
    task.text = format!("Task: {}\n\nArtefact to review:\n{}", original.text, artefact);
    task
}

fn revise_task(original: &AgentTask, artefact: &str, critiques: &[(String, String)]) -> AgentTask {
    let mut task = original.clone();
    let critique_block = critiques
        .iter()
        .map(|(id, text)| format!("- [{}]: {}", id, text))
        .collect::<Vec<_>>()
        .join("\n");
    task.text = format!(
        "Task: {}\n\nYour current artefact:\n{}\n\nReviewer feedback:\n{}\n\nRevise the artefact. Include the word {} if it is ready to ship as-is.",
        original.text, artefact, critique_block, ACCEPTED_MARKER
    );
    task
}

/// `creator` is indispensable (spec.md §4.9.5): its failure fails the whole
/// pattern. Reviewer failures are captured in `failures[]` and dropped from
/// that round's feedback.
pub async fn execute(
    driver: Arc<dyn AgentDriver>,
    creator: &AgentHandle,
    reviewers: &[AgentHandle],
    task: &AgentTask,
    context: &str,
    cancel: &CancellationToken,
    policy: RetryPolicy,
    rounds: u32,
) -> ExecutionOutcome {
    let started = Instant::now();
    let mut per_agent: Vec<PerAgentResult> = Vec::new();
    let mut failures: Vec<Failure> = Vec::new();
    let mut history: Vec<serde_json::Value> = Vec::new();

    let call_started = Instant::now();
    let initial = super::invoke_with_retry(driver.as_ref(), creator, task, context, cancel, policy).await;
    let elapsed = call_started.elapsed().as_millis() as u64;

    let mut artefact = match initial {
        Ok(outcome) => {
            per_agent.push(PerAgentResult {
                agent_id: creator.id.clone(),
                output: Some(outcome.output.clone()),
                tokens: outcome.tokens,
                model: Some(outcome.model.clone()),
                quality: outcome.quality,
                duration_ms: elapsed,
                error: None,
            });
            history.push(serde_json::json!({ "round": 0, "artefact": outcome.output }));
            outcome.output
        }
        Err(e) => {
            return ExecutionOutcome {
                success: false,
                pattern: Pattern::Review,
                data: serde_json::json!({ "history": history }),
                tokens: sum_tokens(&per_agent),
                errors: vec![e.to_string()],
                duration_ms: started.elapsed().as_millis() as u64,
                per_agent,
                failures: vec![Failure { agent_id: creator.id.clone(), reason: e.to_string() }],
            };
        }
    };

    let mut accepted = is_accepted(&artefact);

    for round in 1..=rounds.max(1) {
        if accepted || reviewers.is_empty() {
            break;
        }

        let review_futures = reviewers.iter().map(|reviewer| {
            let driver = Arc::clone(&driver);
            let reviewer = reviewer.clone();
            let review_task = critique_task(task, &artefact);
            let context = context.to_string();
            let cancel = cancel.clone();
            async move {
                let call_started = Instant::now();
                let result = super::invoke_with_retry(driver.as_ref(), &reviewer, &review_task, &context, &cancel, policy).await;
                (reviewer, result, call_started.elapsed().as_millis() as u64)
            }
        });

        let review_results = futures_util::future::join_all(review_futures).await;

        let mut critiques: Vec<(String, String)> = Vec::new();
        for (reviewer, result, elapsed) in review_results {
            match result {
                Ok(outcome) => {
                    per_agent.push(PerAgentResult {
                        agent_id: reviewer.id.clone(),
                        output: Some(outcome.output.clone()),
                        tokens: outcome.tokens,
                        model: Some(outcome.model.clone()),
                        quality: outcome.quality,
                        duration_ms: elapsed,
                        error: None,
                    });
                    critiques.push((reviewer.id.clone(), outcome.output));
                }
                Err(e) => {
                    failures.push(Failure { agent_id: reviewer.id.clone(), reason: e.to_string() });
                    per_agent.push(PerAgentResult {
                        agent_id: reviewer.id.clone(),
                        output: None,
                        tokens: Default::default(),
                        model: None,
                        quality: None,
                        duration_ms: elapsed,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if critiques.is_empty() {
            history.push(serde_json::json!({ "round": round, "critiques": [], "artefact": artefact }));
            break;
        }

        let revise = revise_task(task, &artefact, &critiques);
        let call_started = Instant::now();
        let revision_result = super::invoke_with_retry(driver.as_ref(), creator, &revise, context, cancel, policy).await;
        let elapsed = call_started.elapsed().as_millis() as u64;

        match revision_result {
            Ok(outcome) => {
                per_agent.push(PerAgentResult {
                    agent_id: creator.id.clone(),
                    output: Some(outcome.output.clone()),
                    tokens: outcome.tokens,
                    model: Some(outcome.model.clone()),
                    quality: outcome.quality,
                    duration_ms: elapsed,
                    error: None,
                });
                artefact = outcome.output;
                accepted = is_accepted(&artefact);
                history.push(serde_json::json!({
                    "round": round,
                    "critiques": critiques.iter().map(|(id, t)| serde_json::json!({ "agentId": id, "text": t })).collect::<Vec<_>>(),
                    "artefact": artefact,
                    "accepted": accepted,
                }));
            }
            Err(e) => {
                return ExecutionOutcome {
                    success: false,
                    pattern: Pattern::Review,
                    data: serde_json::json!({ "history": history }),
                    tokens: sum_tokens(&per_agent),
                    errors: vec![e.to_string()],
                    duration_ms: started.elapsed().as_millis() as u64,
                    per_agent,
                    failures: {
                        failures.push(Failure { agent_id: creator.id.clone(), reason: e.to_string() });
                        failures
                    },
                };
            }
        }
    }

    ExecutionOutcome {
        success: true,
        pattern: Pattern::Review,
        data: serde_json::json!({
            "artefact": artefact,
            "accepted": accepted,
            "history": history,
        }),
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
    async fn creator_failure_fails_whole_pattern() {
        let driver: Arc<dyn AgentDriver> = Arc::new(ScriptedDriver::new().with_failure("creator", "down"));
        let creator = agent("creator");
        let reviewers = vec![agent("reviewer")];
        let task = AgentTask::new("write a doc");
        let cancel = CancellationToken::new();
        let outcome = execute(driver, &creator, &reviewers, &task, "", &cancel, RetryPolicy { retries: 0, ..RetryPolicy::default() }, 1).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn accepted_marker_stops_early() {
        let driver: Arc<dyn AgentDriver> = Arc::new(ScriptedDriver::new().with_outcome("creator", "a fine draft", None));
        let creator = agent("creator");
        let reviewers: Vec<AgentHandle> = vec![];
        let task = AgentTask::new("write a doc");
        let cancel = CancellationToken::new();
        // No reviewers at all: loop breaks immediately, artefact as produced.
        let outcome = execute(driver, &creator, &reviewers, &task, "", &cancel, RetryPolicy::default(), 3).await;
        assert!(outcome.success);
        assert_eq!(outcome.data["artefact"], serde_json::json!("a fine draft"));
    }

    #[test]
    fn accepted_detects_whole_word_only() {
        assert!(is_accepted("Looks good. ACCEPTED."));
        assert!(is_accepted("accepted"));
        assert!(!is_accepted("unacceptedly bad"));
    }
}
