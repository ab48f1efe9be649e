//! The opaque boundary against external LLM/API transports (spec.md §1, §6).
//!
//! Rather than a provider-specific chat-completion surface, the core only
//! needs one sealed-shape `invoke` call per agent turn. Concrete transports
//! (OpenAI, Claude, Grok, ...) are deliberately out of scope — callers
//! supply their own `AgentDriver` impl.

use crate::cancel::CancellationToken;
use crate::error::CoreError;
use async_trait::async_trait;
use std::collections::HashMap;

/// Token accounting for one `AgentDriver::invoke` call (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_create_tokens: u64,
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_create_tokens + self.cache_read_tokens
    }
}

/// The task payload handed to an agent: free text plus opaque metadata.
#[derive(Debug, Clone, Default)]
pub struct AgentTask {
    pub text: String,
    pub metadata: HashMap<String, String>,
}

impl AgentTask {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: HashMap::new(),
        }
    }
}

/// The result of one agent turn.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub output: String,
    pub tokens: TokenUsage,
    pub model: String,
    /// Self-reported quality score in `[0.0, 1.0]`, used by `Ensemble::best-of`.
    pub quality: Option<f32>,
}

/// Consumed contract per spec.md §6: `invoke(agent, task, context, cancelToken)`.
///
/// Implementations must be `Send + Sync` so a single driver can be shared
/// across concurrently dispatched agents within a pattern.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    /// Run one agent turn. `instructions` is the agent's declarative
    /// instructions text (`registry::AgentRecord::instructions`); `context`
    /// is the memory context assembled by `ContextRetriever`, already
    /// rendered to a string.
    async fn invoke(
        &self,
        instructions: &str,
        task: &AgentTask,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome, CoreError>;
}

/// Consumed contract per spec.md §6: a pure, deterministic token counter.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str, model: Option<&str>) -> usize;
}

/// A `TokenCounter` approximating one token per four characters, kept here
/// only as a reasonable default for callers that don't wire a real
/// tokenizer.
pub struct ApproximateTokenCounter;

impl TokenCounter for ApproximateTokenCounter {
    fn count(&self, text: &str, _model: Option<&str>) -> usize {
        (text.len() / 4).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_totals() {
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            cache_create_tokens: 1,
            cache_read_tokens: 2,
        };
        assert_eq!(usage.total(), 33);
    }

    #[test]
    fn approximate_counter_is_at_least_one() {
        let counter = ApproximateTokenCounter;
        assert_eq!(counter.count("", None), 1);
        assert_eq!(counter.count("abcd", None), 1);
        assert_eq!(counter.count(&"a".repeat(100), None), 25);
    }
}
