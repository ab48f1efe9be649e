//! Two-layer, token-budgeted context assembly with an LRU cache (C5, spec.md §4.5).
//!
//! Assembles a fixed two-layer context object within a token budget. The
//! LRU cache uses the `lru` crate rather than a hand-rolled structure.

use crate::driver::TokenCounter;
use crate::model::{Observation, Orchestration, Pattern};
use crate::store::{PersistentStore, SearchFilters};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One Layer-1 (index) hit.
#[derive(Debug, Clone)]
pub struct Layer1Hit {
    pub id: String,
    pub pattern: Pattern,
    pub task_snippet: String,
    pub result_summary: String,
    pub relevance: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub success: bool,
    pub token_count: usize,
}

/// One Layer-2 (detail) item — a full orchestration plus its observations.
#[derive(Debug, Clone)]
pub struct Layer2Detail {
    pub orchestration: Orchestration,
    pub observations: Vec<Observation>,
    pub token_count: usize,
}

/// The assembled context handed to a pattern executor.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub loaded: bool,
    pub token_count: usize,
    pub progressive: bool,
    pub layer1: Vec<Layer1Hit>,
    pub layer2: Vec<Layer2Detail>,
    pub truncated: bool,
    pub error: Option<String>,
}

impl AssembledContext {
    fn empty(loaded: bool) -> Self {
        Self {
            loaded,
            ..Default::default()
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            loaded: false,
            token_count: 0,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

fn cache_key(task_text: &str, agent_ids: &[String], pattern: Pattern) -> String {
    let normalized_task = task_text.trim().to_lowercase();
    let mut ids: Vec<&str> = agent_ids.iter().map(String::as_str).collect();
    ids.sort_unstable();
    let canonical = format!("{}|{}|{}", normalized_task, ids.join(","), pattern.as_str());
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

struct CacheEntry {
    context: AssembledContext,
    created_at: Instant,
}

/// Assembles prior-execution context within a token budget, caching by a
/// stable hash of (task text, agent id set, pattern).
pub struct ContextRetriever {
    cache: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
    layer1_limit: usize,
    layer2_limit: usize,
    safety_buffer: f64,
}

impl ContextRetriever {
    pub fn new(capacity: usize, ttl: Duration, safety_buffer: f64) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            ttl,
            layer1_limit: 10,
            layer2_limit: 5,
            safety_buffer,
        }
    }

    /// Assemble context for `task_text`/`agent_ids`/`pattern` within
    /// `max_tokens`, consulting the cache first.
    pub fn retrieve(
        &self,
        task_text: &str,
        agent_ids: &[String],
        pattern: Pattern,
        max_tokens: usize,
        store: &PersistentStore,
        counter: &dyn TokenCounter,
    ) -> AssembledContext {
        let key = cache_key(task_text, agent_ids, pattern);

        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&key) {
                if entry.created_at.elapsed() < self.ttl {
                    return entry.context.clone();
                }
                cache.pop(&key);
            }
        }

        let assembled = self.assemble(task_text, max_tokens, store, counter);

        let mut cache = self.cache.lock().unwrap();
        cache.put(
            key,
            CacheEntry {
                context: assembled.clone(),
                created_at: Instant::now(),
            },
        );
        assembled
    }

    fn assemble(
        &self,
        task_text: &str,
        max_tokens: usize,
        store: &PersistentStore,
        counter: &dyn TokenCounter,
    ) -> AssembledContext {
        if max_tokens == 0 {
            return AssembledContext::empty(true);
        }
        let effective_budget = (max_tokens as f64 * (1.0 - self.safety_buffer)).floor() as usize;

        let summaries = store.search(Some(task_text), &SearchFilters::default(), self.layer1_limit);
        if summaries.is_empty() && store.is_degraded() {
            return AssembledContext::failed("store unavailable");
        }

        let mut layer1 = Vec::new();
        let mut layer1_tokens = 0usize;
        for summary in &summaries {
            let hit = Layer1Hit {
                id: summary.id.clone(),
                pattern: summary.pattern,
                task_snippet: summary.task_snippet.clone(),
                result_summary: summary.result_summary.clone(),
                relevance: summary.score,
                timestamp: summary.timestamp,
                success: summary.success,
                token_count: counter.count(&format!("{} {}", summary.task_snippet, summary.result_summary), None),
            };
            layer1_tokens += hit.token_count;
            layer1.push(hit);
        }

        if layer1_tokens >= effective_budget {
            let token_count = layer1_tokens.min(effective_budget);
            return AssembledContext {
                loaded: true,
                token_count,
                progressive: true,
                layer1,
                layer2: Vec::new(),
                truncated: false,
                error: None,
            };
        }

        let mut remaining = effective_budget - layer1_tokens;
        let mut layer2 = Vec::new();
        let mut truncated = false;

        let mut ranked = summaries;
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        for summary in ranked.into_iter().take(self.layer2_limit) {
            let Some(orchestration) = store.get_by_id(&summary.id) else {
                continue;
            };
            let observations = store.observations_for(&summary.id);
            let (detail, fit) = smart_truncate(orchestration, observations, remaining, counter);
            match detail {
                Some(detail) => {
                    remaining = remaining.saturating_sub(detail.token_count);
                    layer2.push(detail);
                    if !fit {
                        truncated = true;
                    }
                }
                None => {
                    truncated = true;
                }
            }
        }

        let token_count = effective_budget - remaining;
        AssembledContext {
            loaded: true,
            token_count,
            progressive: true,
            layer1,
            layer2,
            truncated,
            error: None,
        }
    }
}

/// Preserve (core fields → observations → result summary → metadata) until
/// cost fits the remaining budget, else skip the item entirely. Returns the
/// possibly-truncated detail and whether truncation was needed.
fn smart_truncate(
    orchestration: Orchestration,
    mut observations: Vec<Observation>,
    budget: usize,
    counter: &dyn TokenCounter,
) -> (Option<Layer2Detail>, bool) {
    let core_text = format!("{} {} {}", orchestration.id, orchestration.pattern, orchestration.task_text);
    let core_tokens = counter.count(&core_text, Some(&orchestration.model));
    if core_tokens > budget {
        return (None, true);
    }

    let mut truncated = false;
    let mut used = core_tokens;

    observations.retain(|o| {
        let cost = counter.count(&o.text, None);
        if used + cost <= budget {
            used += cost;
            true
        } else {
            truncated = true;
            false
        }
    });

    let mut result_summary = orchestration.result_summary.clone();
    let summary_tokens = counter.count(&result_summary, None);
    if used + summary_tokens > budget {
        truncated = true;
        result_summary.clear();
    } else {
        used += summary_tokens;
    }

    let mut orchestration = orchestration;
    orchestration.result_summary = result_summary;

    (
        Some(Layer2Detail {
            orchestration,
            observations,
            token_count: used,
        }),
        !truncated,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ApproximateTokenCounter;
    use crate::model::{new_id, ObservationSource, ObservationType, TokenCounters};

    fn seeded_store() -> (tempfile::TempDir, PersistentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path().join("orch.db")).unwrap();
        let o = Orchestration {
            id: new_id(),
            pattern: Pattern::Parallel,
            agent_ids: vec!["a1".into()],
            task_text: "investigate flaky integration test".into(),
            result_summary: "retried with backoff and it passed".into(),
            success: true,
            started_at: chrono::Utc::now(),
            duration_ms: 10,
            tokens: TokenCounters::default(),
            model: "m".into(),
        };
        let id = store.record_orchestration(o).unwrap();
        store
            .add_observations(
                &id,
                vec![Observation {
                    id: new_id(),
                    orchestration_id: id,
                    observation_type: ObservationType::Bugfix,
                    text: "flaky test root-caused to network latency".into(),
                    concepts: vec!["flaky".into()],
                    importance: 6,
                    per_agent_insights: Default::default(),
                    source: ObservationSource::Rule,
                }],
            )
            .unwrap();
        (dir, store)
    }

    #[test]
    fn zero_max_tokens_returns_empty_loaded_context() {
        let (_dir, store) = seeded_store();
        let retriever = ContextRetriever::new(100, Duration::from_secs(300), 0.2);
        let counter = ApproximateTokenCounter;
        let ctx = retriever.retrieve("flaky test", &["a1".into()], Pattern::Parallel, 0, &store, &counter);
        assert!(ctx.loaded);
        assert_eq!(ctx.token_count, 0);
    }

    #[test]
    fn token_count_never_exceeds_effective_budget() {
        let (_dir, store) = seeded_store();
        let retriever = ContextRetriever::new(100, Duration::from_secs(300), 0.2);
        let counter = ApproximateTokenCounter;
        let max_tokens = 50;
        let ctx = retriever.retrieve("flaky test", &["a1".into()], Pattern::Parallel, max_tokens, &store, &counter);
        let effective = (max_tokens as f64 * 0.8).floor() as usize;
        assert!(ctx.token_count <= effective);
    }

    #[test]
    fn cache_hit_returns_same_orchestration_ids() {
        let (_dir, store) = seeded_store();
        let retriever = ContextRetriever::new(100, Duration::from_secs(300), 0.2);
        let counter = ApproximateTokenCounter;
        let agent_ids = vec!["a1".to_string()];
        let first = retriever.retrieve("flaky test", &agent_ids, Pattern::Parallel, 500, &store, &counter);
        let second = retriever.retrieve("flaky test", &agent_ids, Pattern::Parallel, 500, &store, &counter);
        let first_ids: Vec<&str> = first.layer1.iter().map(|h| h.id.as_str()).collect();
        let second_ids: Vec<&str> = second.layer1.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(first_ids, second_ids);
    }
}
