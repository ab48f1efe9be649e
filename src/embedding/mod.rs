//! Semantic similarity store fronted by a circuit breaker (C4, spec.md §4.4).
//!
//! Hand-rolled atomic breaker state, matching the "atomic counter +
//! last-failure timestamp, single-writer" resource policy from spec.md §5.
//! The embed/query/upsert surface is one `async_trait` boundary against an
//! external collaborator, narrowed to what the core actually calls.

use crate::error::{CoreError, CoreResult};
use crate::store::{PersistentStore, SearchFilters};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Opaque metadata carried alongside an embedded item.
pub type Metadata = HashMap<String, String>;

/// A vector-similarity hit.
#[derive(Debug, Clone)]
pub struct SimilarityHit {
    pub id: String,
    pub similarity: f64,
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

/// One item in an `addBatch` call.
pub struct EmbeddingItem {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

/// Outcome of `addBatch` (spec.md §4.4).
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Consumed contract per spec.md §6: the external vector database.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>>;
    async fn upsert(&self, id: &str, vector: Vec<f32>, metadata: Metadata) -> CoreResult<()>;
    async fn query(&self, vector: &[f32], limit: usize) -> CoreResult<Vec<SimilarityHit>>;
    async fn delete(&self, ids: &[String]) -> CoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    threshold: u32,
    cooldown: Duration,
    opened_at: Mutex<Option<std::time::Instant>>,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            threshold,
            cooldown,
            opened_at: Mutex::new(None),
        }
    }

    /// Whether a call is currently allowed (and flips `open` → `half-open`
    /// once the cooldown has elapsed).
    fn allow(&self) -> bool {
        match CircuitState::from(self.state.load(Ordering::SeqCst)) {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .lock()
                    .unwrap()
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(false);
                if elapsed {
                    self.state.store(CircuitState::HalfOpen as u8, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.state.store(CircuitState::Closed as u8, Ordering::SeqCst);
        *self.opened_at.lock().unwrap() = None;
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let was_half_open = CircuitState::from(self.state.load(Ordering::SeqCst)) == CircuitState::HalfOpen;
        if was_half_open || failures >= self.threshold {
            self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
            *self.opened_at.lock().unwrap() = Some(std::time::Instant::now());
        }
    }

    fn is_open(&self) -> bool {
        CircuitState::from(self.state.load(Ordering::SeqCst)) == CircuitState::Open
    }
}

/// Search mode for [`EmbeddingIndex::search_similar`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Vector,
    Keyword,
    Hybrid,
}

/// Vector-similarity store with circuit-breaker-guarded backend access and
/// keyword fallback through the shared [`PersistentStore`].
pub struct EmbeddingIndex<B: EmbeddingBackend> {
    backend: B,
    breaker: CircuitBreaker,
    added: AtomicU64,
}

impl<B: EmbeddingBackend> EmbeddingIndex<B> {
    pub fn new(backend: B, threshold: u32, cooldown: Duration) -> Self {
        Self {
            backend,
            breaker: CircuitBreaker::new(threshold, cooldown),
            added: AtomicU64::new(0),
        }
    }

    pub fn is_open(&self) -> bool {
        self.breaker.is_open()
    }

    /// `add(orchestrationId, text, metadata)` — skipped silently when open.
    pub async fn add(&self, id: &str, text: &str, metadata: Metadata) {
        if !self.breaker.allow() {
            log::debug!("embedding circuit open; skipping add for '{}'", id);
            return;
        }
        match self.backend.embed(&[text.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => {
                let vector = vectors.remove(0);
                match self.backend.upsert(id, vector, metadata).await {
                    Ok(()) => {
                        self.breaker.record_success();
                        self.added.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        log::warn!("embedding upsert failed for '{}': {}", id, e);
                        self.breaker.record_failure();
                    }
                }
            }
            Ok(_) => log::warn!("embedding backend returned no vectors for '{}'", id),
            Err(e) => {
                log::warn!("embedding failed for '{}': {}", id, e);
                self.breaker.record_failure();
            }
        }
    }

    /// `addBatch(items)` — processes in chunks; a chunk failure does not
    /// abort remaining chunks.
    pub async fn add_batch(&self, items: Vec<EmbeddingItem>, chunk_size: usize) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for chunk in items.chunks(chunk_size.max(1)) {
            for item in chunk {
                if !self.breaker.allow() {
                    outcome.failed += 1;
                    outcome.errors.push(format!("{}: circuit open", item.id));
                    continue;
                }
                match self.backend.embed(&[item.text.clone()]).await {
                    Ok(mut vectors) if !vectors.is_empty() => {
                        let vector = vectors.remove(0);
                        match self.backend.upsert(&item.id, vector, item.metadata.clone()).await {
                            Ok(()) => {
                                self.breaker.record_success();
                                outcome.successful += 1;
                            }
                            Err(e) => {
                                self.breaker.record_failure();
                                outcome.failed += 1;
                                outcome.errors.push(format!("{}: {}", item.id, e));
                            }
                        }
                    }
                    _ => {
                        self.breaker.record_failure();
                        outcome.failed += 1;
                        outcome.errors.push(format!("{}: embed failed", item.id));
                    }
                }
            }
        }
        outcome
    }

    /// `searchSimilar(query, {limit, minSimilarity, mode})`. Never fails to
    /// the caller — on total failure returns an empty sequence.
    pub async fn search_similar(
        &self,
        query_text: &str,
        store: &PersistentStore,
        limit: usize,
        min_similarity: f64,
        mode: SearchMode,
    ) -> Vec<SimilarityHit> {
        let keyword_hits = || -> Vec<SimilarityHit> {
            store
                .search(Some(query_text), &SearchFilters::default(), limit)
                .into_iter()
                .map(|s| SimilarityHit {
                    id: s.id,
                    similarity: s.score,
                    metadata: Metadata::new(),
                    timestamp: s.timestamp,
                })
                .collect()
        };

        match mode {
            SearchMode::Keyword => keyword_hits(),
            SearchMode::Vector => self.vector_hits(query_text, limit).await.unwrap_or_default(),
            SearchMode::Hybrid => {
                let vector = self.vector_hits(query_text, limit).await;
                let keyword = keyword_hits();
                match vector {
                    Some(vector_hits) if !vector_hits.is_empty() => {
                        merge_hybrid(vector_hits, keyword, min_similarity)
                    }
                    _ => keyword,
                }
            }
        }
        .into_iter()
        .filter(|h| h.similarity >= min_similarity)
        .take(limit)
        .collect()
    }

    async fn vector_hits(&self, query_text: &str, limit: usize) -> Option<Vec<SimilarityHit>> {
        if !self.breaker.allow() {
            return None;
        }
        let vector = match self.backend.embed(&[query_text.to_string()]).await {
            Ok(mut v) if !v.is_empty() => v.remove(0),
            _ => {
                self.breaker.record_failure();
                return None;
            }
        };
        match self.backend.query(&vector, limit).await {
            Ok(hits) => {
                self.breaker.record_success();
                Some(hits)
            }
            Err(e) => {
                log::warn!("embedding query failed: {}", e);
                self.breaker.record_failure();
                None
            }
        }
    }

    /// Cosine similarity between the embeddings of `a` and `b`, respecting
    /// the circuit breaker. `None` when the circuit is open or the backend
    /// fails — callers (e.g. `patterns::debate`'s convergence check) should
    /// fall back to a text-only similarity measure in that case.
    pub async fn similarity(&self, a: &str, b: &str) -> Option<f32> {
        if !self.breaker.allow() {
            return None;
        }
        match self.backend.embed(&[a.to_string(), b.to_string()]).await {
            Ok(vectors) if vectors.len() == 2 => {
                self.breaker.record_success();
                Some(cosine(&vectors[0], &vectors[1]))
            }
            Ok(_) => {
                self.breaker.record_failure();
                None
            }
            Err(e) => {
                log::warn!("embedding similarity failed: {}", e);
                self.breaker.record_failure();
                None
            }
        }
    }

    pub async fn delete(&self, ids: &[String]) -> CoreResult<()> {
        if !self.breaker.allow() {
            return Err(CoreError::EmbeddingUnavailable("circuit open".into()));
        }
        match self.backend.delete(ids).await {
            Ok(()) => {
                self.breaker.record_success();
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// score = 0.7·vectorSim + 0.3·keywordScore; merge by id, prefer higher
/// score; deterministic tie-break: higher similarity wins, ties broken by
/// more recent timestamp, then lexicographic id.
fn merge_hybrid(vector_hits: Vec<SimilarityHit>, keyword_hits: Vec<SimilarityHit>, _min_similarity: f64) -> Vec<SimilarityHit> {
    let mut by_id: HashMap<String, SimilarityHit> = HashMap::new();
    let max_keyword_score = keyword_hits.iter().map(|h| h.similarity).fold(0.0_f64, f64::max).max(1.0);

    for hit in vector_hits {
        by_id.insert(hit.id.clone(), SimilarityHit { similarity: hit.similarity * 0.7, ..hit });
    }
    for hit in keyword_hits {
        let normalized = hit.similarity / max_keyword_score * 0.3;
        by_id
            .entry(hit.id.clone())
            .and_modify(|existing| existing.similarity += normalized)
            .or_insert(SimilarityHit { similarity: normalized, ..hit });
    }

    let mut merged: Vec<SimilarityHit> = by_id.into_values().collect();
    merged.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.timestamp.cmp(&a.timestamp))
            .then_with(|| a.id.cmp(&b.id))
    });
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;
    use std::sync::Arc;

    struct FlakyBackend {
        fail_calls: Arc<Counter>,
    }

    #[async_trait]
    impl EmbeddingBackend for FlakyBackend {
        async fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            self.fail_calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::EmbeddingUnavailable("always fails".into()))
        }

        async fn upsert(&self, _id: &str, _vector: Vec<f32>, _metadata: Metadata) -> CoreResult<()> {
            Ok(())
        }

        async fn query(&self, _vector: &[f32], _limit: usize) -> CoreResult<Vec<SimilarityHit>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _ids: &[String]) -> CoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_consecutive_failures() {
        let index = EmbeddingIndex::new(
            FlakyBackend { fail_calls: Arc::new(Counter::new(0)) },
            3,
            Duration::from_secs(60),
        );
        for _ in 0..3 {
            index.add("id", "text", Metadata::new()).await;
        }
        assert!(index.is_open());
    }

    struct NullBackend;
    #[async_trait]
    impl EmbeddingBackend for NullBackend {
        async fn embed(&self, _texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            Ok(vec![vec![0.0]])
        }
        async fn upsert(&self, _id: &str, _vector: Vec<f32>, _metadata: Metadata) -> CoreResult<()> {
            Ok(())
        }
        async fn query(&self, _vector: &[f32], _limit: usize) -> CoreResult<Vec<SimilarityHit>> {
            Ok(Vec::new())
        }
        async fn delete(&self, _ids: &[String]) -> CoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn search_similar_falls_back_to_keyword_when_circuit_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path().join("orch.db")).unwrap();
        let o = crate::model::Orchestration {
            id: crate::model::new_id(),
            pattern: crate::model::Pattern::Parallel,
            agent_ids: vec!["a1".into()],
            task_text: "investigate memory leak".into(),
            result_summary: "done".into(),
            success: true,
            started_at: Utc::now(),
            duration_ms: 1,
            tokens: Default::default(),
            model: "m".into(),
        };
        let id = store.record_orchestration(o).unwrap();
        store
            .add_observations(
                &id,
                vec![crate::model::Observation {
                    id: crate::model::new_id(),
                    orchestration_id: id.clone(),
                    observation_type: crate::model::ObservationType::Bugfix,
                    text: "memory leak fixed via pooling".into(),
                    concepts: vec![],
                    importance: 5,
                    per_agent_insights: Default::default(),
                    source: crate::model::ObservationSource::Rule,
                }],
            )
            .unwrap();

        let index = EmbeddingIndex::new(NullBackend, 1, Duration::from_secs(60));
        index.breaker.state.store(CircuitState::Open as u8, Ordering::SeqCst);
        *index.breaker.opened_at.lock().unwrap() = Some(std::time::Instant::now());

        let hits = index
            .search_similar("memory leak", &store, 5, 0.0, SearchMode::Hybrid)
            .await;
        assert!(!hits.is_empty());
    }
}
