//! The coordination core's single entry point (C10, spec.md §4.10).
//!
//! Wires every other component into one pipeline: `beforeExecution` hook
//! (memory load, budget check, `orchestration:starting`) → pattern dispatch
//! (C9) → `afterExecution` hook (store write, cost write) → a non-awaited
//! `orchestrator:execution:complete` fan-out that feeds the embedding index
//! and categorizer. One façade type holds every collaborator, generic over
//! the external transport traits (`AgentDriver`, `EmbeddingBackend`,
//! `AICategorizationDriver`) rather than any concrete transport.

use crate::cancel::CancellationToken;
use crate::categorizer::{AICategorizationDriver, Categorizer};
use crate::config::{OrchestrionConfig, SearchMode as ConfigSearchMode};
use crate::context::{AssembledContext, ContextRetriever};
use crate::cost_ledger::{BudgetStatus, CostLedger, ModelPrice};
use crate::driver::{AgentDriver, AgentOutcome, AgentTask, TokenCounter};
use crate::embedding::{EmbeddingBackend, EmbeddingIndex, Metadata, SearchMode};
use crate::error::{CoreError, CoreResult};
use crate::event_bus::EventBus;
use crate::hooks::LifecycleHooks;
use crate::model::{new_id, Observation, Orchestration, Pattern, TokenCounters};
use crate::patterns::{self, consensus, debate, ensemble, AgentHandle, ExecutionOutcome};
use crate::registry::{AgentRecord, AgentRegistry, MatchQuery};
use crate::store::PersistentStore;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn convert_search_mode(mode: ConfigSearchMode) -> SearchMode {
    match mode {
        ConfigSearchMode::Vector => SearchMode::Vector,
        ConfigSearchMode::Keyword => SearchMode::Keyword,
        ConfigSearchMode::Hybrid => SearchMode::Hybrid,
    }
}

/// Per-pattern parameters not captured by the agent list or task text.
#[derive(Debug, Clone)]
pub struct PatternOptions {
    pub consensus_threshold: f64,
    pub consensus_strategy: consensus::Strategy,
    pub consensus_weights: HashMap<String, f64>,
    pub debate_rounds: u32,
    pub review_rounds: u32,
    pub ensemble_strategy: ensemble::Strategy,
}

impl Default for PatternOptions {
    fn default() -> Self {
        Self {
            consensus_threshold: 0.6,
            consensus_strategy: consensus::Strategy::Majority,
            consensus_weights: HashMap::new(),
            debate_rounds: 3,
            review_rounds: 2,
            ensemble_strategy: ensemble::Strategy::Vote,
        }
    }
}

/// Aggregate `{started, completed, failed, cancelled}` counters per pattern
/// (spec.md §4.10 "per-pattern execution metrics").
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternMetrics {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// What `Orchestrator::execute` hands back to the caller. Always populated —
/// even a rejected-before-dispatch run (invalid agents, budget exceeded)
/// returns one of these rather than a bare error, per spec.md §7's
/// "always contains `{success, pattern, durationMs, tokens, errors[]}`".
#[derive(Debug, Clone)]
pub struct OrchestratorResult {
    pub orchestration_id: Option<String>,
    pub success: bool,
    pub pattern: Pattern,
    pub data: Value,
    pub duration_ms: u64,
    pub tokens: TokenCounters,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl OrchestratorResult {
    fn rejected(pattern: Pattern, reason: String) -> Self {
        Self {
            orchestration_id: None,
            success: false,
            pattern,
            data: serde_json::json!({}),
            duration_ms: 0,
            tokens: TokenCounters::default(),
            errors: vec![reason],
            warnings: Vec::new(),
        }
    }

    fn from_outcome(outcome: ExecutionOutcome, orchestration_id: Option<String>, warnings: Vec<String>) -> Self {
        Self {
            orchestration_id,
            success: outcome.success,
            pattern: outcome.pattern,
            data: outcome.data,
            duration_ms: outcome.duration_ms,
            tokens: outcome.tokens,
            errors: outcome.errors,
            warnings,
        }
    }
}

fn empty_outcome(pattern: Pattern, reason: &str) -> ExecutionOutcome {
    ExecutionOutcome {
        success: false,
        pattern,
        data: serde_json::json!({}),
        per_agent: Vec::new(),
        duration_ms: 0,
        tokens: TokenCounters::default(),
        failures: Vec::new(),
        errors: vec![reason.to_string()],
    }
}

fn pattern_timeout(pattern: Pattern, options: &PatternOptions, base: Duration) -> Duration {
    match pattern {
        Pattern::Debate => base * options.debate_rounds.max(1),
        Pattern::Review => base * options.review_rounds.max(1),
        _ => base,
    }
}

fn render_context(ctx: &AssembledContext) -> String {
    if !ctx.loaded || (ctx.layer1.is_empty() && ctx.layer2.is_empty()) {
        return String::new();
    }
    let mut out = String::new();
    if !ctx.layer1.is_empty() {
        out.push_str("Related prior runs:\n");
        for hit in &ctx.layer1 {
            out.push_str(&format!("- [{}] {} -> {}\n", hit.pattern.as_str(), hit.task_snippet, hit.result_summary));
        }
    }
    for detail in &ctx.layer2 {
        out.push_str(&format!("\n### {}\n{}\n", detail.orchestration.task_text, detail.orchestration.result_summary));
        for obs in &detail.observations {
            out.push_str(&format!("- {}\n", obs.text));
        }
    }
    out
}

fn summarize(outcome: &ExecutionOutcome) -> String {
    let text = serde_json::to_string(&outcome.data).unwrap_or_default();
    if text.chars().count() <= 300 {
        text
    } else {
        text.chars().take(300).collect::<String>() + "\u{2026}"
    }
}

/// Picks the model to attribute cost/history to when a pattern ran several
/// agents that may each report a different one — the first successful
/// agent's reported model, since that is the one whose output the caller
/// sees first in `data`. Falls back to a placeholder when every agent failed.
fn dominant_model(per_agent: &[patterns::PerAgentResult]) -> String {
    per_agent
        .iter()
        .filter(|r| r.is_success())
        .find_map(|r| r.model.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

/// The coordination core's façade (spec.md §4.10).
///
/// Generic over the three external transport traits left to callers
/// (`Dr`: agent invocation, `Em`: vector backend, `Ai`:
/// categorization completion) rather than trait objects — the already-built
/// `EmbeddingIndex<B>`/`Categorizer<D>` are themselves generic, and threading
/// a concrete type through keeps their circuit-breaker/retry state monomorphic
/// instead of behind a second layer of dynamic dispatch.
pub struct Orchestrator<Dr, Em, Ai>
where
    Dr: AgentDriver + 'static,
    Em: EmbeddingBackend + 'static,
    Ai: AICategorizationDriver + 'static,
{
    registry: Mutex<AgentRegistry>,
    driver: Arc<Dr>,
    store: Arc<PersistentStore>,
    embedding: Option<Arc<EmbeddingIndex<Em>>>,
    categorizer: Arc<Categorizer<Ai>>,
    context: ContextRetriever,
    hooks: LifecycleHooks,
    bus: EventBus,
    cost_ledger: Arc<CostLedger>,
    token_counter: Arc<dyn TokenCounter>,
    retry_policy: patterns::RetryPolicy,
    memory_enabled: bool,
    context_token_budget: usize,
    cost_enforce: bool,
    embedding_search_mode: SearchMode,
    metrics: Mutex<HashMap<Pattern, PatternMetrics>>,
}

impl<Dr, Em, Ai> Orchestrator<Dr, Em, Ai>
where
    Dr: AgentDriver + 'static,
    Em: EmbeddingBackend + 'static,
    Ai: AICategorizationDriver + 'static,
{
    pub fn new(
        config: OrchestrionConfig,
        driver: Dr,
        embedding_backend: Option<Em>,
        categorization_driver: Option<Ai>,
        token_counter: Arc<dyn TokenCounter>,
        prices: HashMap<String, ModelPrice>,
    ) -> CoreResult<Self> {
        let store = PersistentStore::open(&config.memory.db_path)?;
        let embedding = if config.embedding.enabled {
            embedding_backend.map(|backend| {
                Arc::new(EmbeddingIndex::new(backend, config.embedding.circuit_threshold, config.embedding.circuit_cooldown))
            })
        } else {
            None
        };
        let categorizer = Arc::new(Categorizer::new(categorization_driver, config.orchestrator.timeout));
        let context = ContextRetriever::new(config.memory.cache_size, config.memory.cache_ttl, config.memory.safety_buffer);
        let cost_ledger = Arc::new(CostLedger::new(
            prices,
            config.cost.daily_budget_usd,
            config.cost.monthly_budget_usd,
            config.cost.warn_threshold,
            config.cost.critical_threshold,
        ));

        Ok(Self {
            registry: Mutex::new(AgentRegistry::new()),
            driver: Arc::new(driver),
            store: Arc::new(store),
            embedding,
            categorizer,
            context,
            hooks: LifecycleHooks::new(),
            bus: EventBus::new(config.bus),
            cost_ledger,
            token_counter,
            retry_policy: patterns::RetryPolicy {
                retries: config.orchestrator.retries,
                base: config.orchestrator.retry_base,
                timeout: config.orchestrator.timeout,
            },
            memory_enabled: config.memory.enable_memory,
            context_token_budget: config.memory.context_token_budget,
            cost_enforce: config.cost.enforce,
            embedding_search_mode: convert_search_mode(config.embedding.search_mode),
            metrics: Mutex::new(HashMap::new()),
        })
    }

    /// Register one agent record directly (spec.md §4.10 `register(agent)`).
    pub fn register(&self, agent: AgentRecord) {
        self.registry.lock().unwrap().register(agent);
    }

    /// Discover and load agent definition files under `root`, replacing the
    /// current registry contents. Returns one `(path, reason)` per rejected file.
    pub fn discover(&self, root: impl AsRef<Path>) -> Vec<(PathBuf, String)> {
        let (registry, errors) = AgentRegistry::discover(root);
        *self.registry.lock().unwrap() = registry;
        errors
    }

    pub fn best_match(&self, query: &MatchQuery) -> Option<AgentRecord> {
        self.registry.lock().unwrap().best_match(query).cloned()
    }

    /// Register a custom lifecycle hook handler (spec.md §4.2). Exposed so
    /// callers can extend `beforeExecution`/`afterExecution`/`onError`
    /// beyond the built-in memory/store/cost wiring.
    pub fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn metrics(&self, pattern: Pattern) -> PatternMetrics {
        self.metrics.lock().unwrap().get(&pattern).copied().unwrap_or_default()
    }

    fn bump_metric(&self, pattern: Pattern, f: impl FnOnce(&mut PatternMetrics)) {
        let mut metrics = self.metrics.lock().unwrap();
        f(metrics.entry(pattern).or_default());
    }

    fn resolve_agents(&self, agent_ids: &[String]) -> CoreResult<Vec<AgentHandle>> {
        if agent_ids.is_empty() {
            return Err(CoreError::InvalidInput("no agent ids supplied".to_string()));
        }
        let registry = self.registry.lock().unwrap();
        agent_ids
            .iter()
            .map(|id| {
                registry
                    .get_by_name(id)
                    .map(|record| AgentHandle { id: record.name.clone(), instructions: record.instructions.clone() })
                    .ok_or_else(|| CoreError::InvalidInput(format!("unknown agent id '{}'", id)))
            })
            .collect()
    }

    /// Build the debate convergence callback from the configured embedding
    /// index, when one is wired. `None` when no backend is configured — the
    /// debate executor then falls back to token-Jaccard similarity.
    fn debate_similarity(&self) -> Option<debate::SimilarityFn> {
        let index = self.embedding.clone()?;
        Some(Arc::new(move |a: String, b: String| {
            let index = Arc::clone(&index);
            Box::pin(async move { index.similarity(&a, &b).await }) as Pin<Box<dyn Future<Output = Option<f32>> + Send>>
        }))
    }

    async fn dispatch(
        &self,
        pattern: Pattern,
        agents: &[AgentHandle],
        task: &AgentTask,
        context: &str,
        cancel: &CancellationToken,
        options: &PatternOptions,
    ) -> ExecutionOutcome {
        let driver: Arc<dyn AgentDriver> = self.driver.clone();
        match pattern {
            Pattern::Parallel => patterns::parallel::execute(driver, agents, task, context, cancel, self.retry_policy).await,
            Pattern::Consensus => {
                patterns::consensus::execute(
                    driver,
                    agents,
                    task,
                    context,
                    cancel,
                    self.retry_policy,
                    options.consensus_threshold,
                    options.consensus_strategy,
                    &options.consensus_weights,
                )
                .await
            }
            Pattern::Debate => {
                let similarity = self.debate_similarity();
                patterns::debate::execute(driver, agents, task, context, cancel, self.retry_policy, options.debate_rounds, similarity).await
            }
            Pattern::Review => match agents.split_first() {
                Some((creator, reviewers)) => {
                    patterns::review::execute(driver, creator, reviewers, task, context, cancel, self.retry_policy, options.review_rounds).await
                }
                None => empty_outcome(pattern, "review requires at least one agent"),
            },
            Pattern::Ensemble => {
                patterns::ensemble::execute(driver, agents, task, context, cancel, self.retry_policy, options.ensemble_strategy).await
            }
        }
    }

    /// Run `pattern` over `agent_ids` against `task` (spec.md §4.10). Always
    /// resolves to an [`OrchestratorResult`]; failures short of a bug are
    /// reported through it rather than as an `Err`.
    pub async fn execute(
        &self,
        pattern: Pattern,
        agent_ids: &[String],
        task: AgentTask,
        options: PatternOptions,
        cancel: CancellationToken,
    ) -> OrchestratorResult {
        self.bump_metric(pattern, |m| m.started += 1);

        let agents = match self.resolve_agents(agent_ids) {
            Ok(agents) => agents,
            Err(e) => {
                self.bump_metric(pattern, |m| m.failed += 1);
                return OrchestratorResult::rejected(pattern, e.to_string());
            }
        };

        if self.cost_enforce {
            let (daily, monthly) = self.cost_ledger.budget_status();
            if daily.status == BudgetStatus::Exceeded || monthly.status == BudgetStatus::Exceeded {
                self.bump_metric(pattern, |m| m.failed += 1);
                return OrchestratorResult::rejected(
                    pattern,
                    CoreError::BudgetExceeded("cumulative spend already at or beyond the configured limit".to_string()).to_string(),
                );
            }
        }

        let before_payload = serde_json::json!({
            "pattern": pattern.as_str(),
            "agentIds": agent_ids,
            "task": task.text,
        });
        if let Err(e) = self.hooks.execute("beforeExecution", before_payload).await {
            self.bump_metric(pattern, |m| m.failed += 1);
            return OrchestratorResult::rejected(pattern, e.to_string());
        }

        self.bus
            .publish("orchestration:starting", serde_json::json!({ "pattern": pattern.as_str(), "agentIds": agent_ids }))
            .await;

        let mut warnings = Vec::new();
        let context_text = if self.memory_enabled {
            let assembled = self.context.retrieve(
                &task.text,
                agent_ids,
                pattern,
                self.context_token_budget,
                &self.store,
                self.token_counter.as_ref(),
            );
            if let Some(err) = &assembled.error {
                warnings.push(format!("persistence unavailable: {}", err));
            }
            render_context(&assembled)
        } else {
            String::new()
        };

        let started = Instant::now();
        let timeout = pattern_timeout(pattern, &options, self.retry_policy.timeout);
        let outcome = match tokio::time::timeout(timeout, self.dispatch(pattern, &agents, &task, &context_text, &cancel, &options)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                cancel.cancel();
                ExecutionOutcome {
                    success: false,
                    pattern,
                    data: serde_json::json!({}),
                    per_agent: Vec::new(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    tokens: TokenCounters::default(),
                    failures: Vec::new(),
                    errors: vec!["orchestration timed out".to_string()],
                }
            }
        };

        let model = dominant_model(&outcome.per_agent);

        let orchestration = Orchestration {
            id: new_id(),
            pattern,
            agent_ids: agent_ids.to_vec(),
            task_text: task.text.clone(),
            result_summary: summarize(&outcome),
            success: outcome.success,
            started_at: Utc::now() - chrono::Duration::milliseconds(outcome.duration_ms as i64),
            duration_ms: outcome.duration_ms,
            tokens: outcome.tokens,
            model,
        };

        let orchestration_id = match self.store.record_orchestration(orchestration.clone()) {
            Ok(id) => Some(id),
            Err(CoreError::StoreUnavailable(reason)) => {
                warnings.push("persistence unavailable".to_string());
                self.bus
                    .publish("store:warning", serde_json::json!({ "reason": reason }))
                    .await;
                None
            }
            Err(e) => {
                self.bump_metric(pattern, |m| m.failed += 1);
                return OrchestratorResult::rejected(pattern, e.to_string());
            }
        };

        let after_payload = serde_json::json!({
            "pattern": pattern.as_str(),
            "success": outcome.success,
            "orchestrationId": orchestration_id,
        });
        if let Err(e) = self.hooks.execute("afterExecution", after_payload).await {
            self.bump_metric(pattern, |m| m.failed += 1);
            return OrchestratorResult::rejected(pattern, e.to_string());
        }

        if let Some(id) = &orchestration_id {
            self.cost_ledger.record_usage(id, &orchestration.model, outcome.tokens, &self.bus).await;
        }

        self.bump_metric(pattern, |m| {
            if cancel.is_cancelled() {
                m.cancelled += 1;
            } else if outcome.success {
                m.completed += 1;
            } else {
                m.failed += 1;
            }
        });

        if let Some(id) = orchestration_id.clone() {
            let agent_outcomes: Vec<AgentOutcome> = outcome
                .per_agent
                .iter()
                .filter(|r| r.is_success())
                .map(|r| AgentOutcome {
                    output: r.output.clone().unwrap_or_default(),
                    tokens: r.tokens.clone(),
                    model: r.model.clone().unwrap_or_else(|| orchestration.model.clone()),
                    quality: r.quality,
                })
                .collect();
            self.spawn_fanout(id.clone(), orchestration.clone(), agent_outcomes);
            self.bus
                .publish(
                    "orchestrator:execution:complete",
                    serde_json::json!({ "orchestrationId": id, "pattern": pattern.as_str(), "success": outcome.success }),
                )
                .await;
        }

        OrchestratorResult::from_outcome(outcome, orchestration_id, warnings)
    }

    /// Fire the non-blocking memory fan-out: embed the orchestration summary
    /// and extract an observation, both off the critical path (spec.md §4.10:
    /// "the caller's `execute()` call returns once `afterExecution` resolves
    /// — the embedding/categorization fan-out happens asynchronously").
    fn spawn_fanout(&self, orchestration_id: String, orchestration: Orchestration, agent_outcomes: Vec<AgentOutcome>) {
        let embedding = self.embedding.clone();
        let categorizer = Arc::clone(&self.categorizer);
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            if let Some(embedding) = &embedding {
                let text = format!("{} {}", orchestration.task_text, orchestration.result_summary);
                embedding.add(&orchestration_id, &text, Metadata::new()).await;
            }

            let observation: Observation = categorizer.extract(&orchestration, &agent_outcomes).await;
            if let Err(e) = store.add_observations(&orchestration_id, vec![observation]) {
                log::warn!("post-execution fan-out: failed to persist observation for '{}': {}", orchestration_id, e);
            }
        });
    }

    /// Semantic recall over prior orchestrations (spec.md §4.4
    /// `searchSimilar`), using the configured default search mode.
    pub async fn search_similar(&self, query_text: &str, limit: usize, min_similarity: f64) -> Vec<crate::embedding::SimilarityHit> {
        match &self.embedding {
            Some(embedding) => {
                embedding
                    .search_similar(query_text, &self.store, limit, min_similarity, self.embedding_search_mode)
                    .await
            }
            None => Vec::new(),
        }
    }

    pub fn budget_status(&self) -> (crate::cost_ledger::BudgetSnapshot, crate::cost_ledger::BudgetSnapshot) {
        self.cost_ledger.budget_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestrionConfig;
    use crate::driver::ApproximateTokenCounter;
    use crate::embedding::{EmbeddingBackend, SimilarityHit};
    use crate::patterns::test_support::ScriptedDriver;
    use crate::registry::{AgentRecord, Priority};

    struct NullEmbeddingBackend;
    #[async_trait::async_trait]
    impl EmbeddingBackend for NullEmbeddingBackend {
        async fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0]).collect())
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

    struct NoCategorizationDriver;
    #[async_trait::async_trait]
    impl AICategorizationDriver for NoCategorizationDriver {
        async fn complete(&self, _s: &str, _u: &str, _t: Duration) -> Result<String, String> {
            Err("not configured".to_string())
        }
    }

    fn test_agent(name: &str) -> AgentRecord {
        AgentRecord {
            name: name.to_string(),
            display_name: name.to_string(),
            model: "test-model".to_string(),
            temperature: None,
            max_tokens: None,
            capabilities: Vec::new(),
            category: "test".to_string(),
            phase: None,
            priority: Priority::Medium,
            tools: Vec::new(),
            tags: Vec::new(),
            instructions: name.to_string(),
        }
    }

    fn test_orchestrator(
        driver: ScriptedDriver,
        db_path: PathBuf,
        cost_enforce: bool,
        daily_budget: Option<f64>,
        prices: HashMap<String, ModelPrice>,
    ) -> Orchestrator<ScriptedDriver, NullEmbeddingBackend, NoCategorizationDriver> {
        let mut config = OrchestrionConfig::default();
        config.memory.db_path = db_path;
        config.cost.enforce = cost_enforce;
        config.cost.daily_budget_usd = daily_budget;
        let orchestrator = Orchestrator::new(
            config,
            driver,
            None::<NullEmbeddingBackend>,
            None::<NoCategorizationDriver>,
            Arc::new(ApproximateTokenCounter),
            prices,
        )
        .unwrap();
        orchestrator.register(test_agent("a"));
        orchestrator.register(test_agent("b"));
        orchestrator
    }

    #[tokio::test]
    async fn parallel_happy_path_records_orchestration_and_totals_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ScriptedDriver::new().with_outcome("a", "alpha output", None).with_outcome("b", "beta output", None);
        let orchestrator = test_orchestrator(driver, dir.path().join("orch.db"), false, None);

        let result = orchestrator
            .execute(
                Pattern::Parallel,
                &["a".to_string(), "b".to_string()],
                AgentTask::new("summarise the incident"),
                PatternOptions::default(),
                CancellationToken::new(),
            )
            .await;

        assert!(result.success);
        assert!(result.orchestration_id.is_some());
        assert_eq!(result.tokens.input, 20);
        assert_eq!(result.tokens.output, 40);
        assert_eq!(orchestrator.metrics(Pattern::Parallel).completed, 1);
    }

    #[tokio::test]
    async fn unknown_agent_id_rejected_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ScriptedDriver::new();
        let orchestrator = test_orchestrator(driver, dir.path().join("orch.db"), false, None, HashMap::new());

        let result = orchestrator
            .execute(
                Pattern::Parallel,
                &["nonexistent".to_string()],
                AgentTask::new("t"),
                PatternOptions::default(),
                CancellationToken::new(),
            )
            .await;

        assert!(!result.success);
        assert!(result.orchestration_id.is_none());
        assert_eq!(orchestrator.metrics(Pattern::Parallel).failed, 1);
    }

    #[tokio::test]
    async fn exceeded_budget_rejects_before_any_agent_is_invoked() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ScriptedDriver::new().with_outcome("a", "alpha output", None);
        let mut prices = HashMap::new();
        prices.insert("test-model".to_string(), ModelPrice { input_per_million: 1_000_000.0, ..Default::default() });
        let orchestrator = test_orchestrator(driver, dir.path().join("orch.db"), true, Some(0.000001), prices);

        // Push the daily ledger over budget with a prior recorded usage
        // against a priced model before the orchestration under test runs.
        orchestrator.cost_ledger.record_usage("seed", "test-model", TokenCounters { input: 1, ..Default::default() }, &orchestrator.bus).await;

        let result = orchestrator
            .execute(Pattern::Parallel, &["a".to_string()], AgentTask::new("t"), PatternOptions::default(), CancellationToken::new())
            .await;

        assert!(!result.success);
        assert!(result.orchestration_id.is_none());
    }

    #[tokio::test]
    async fn cancellation_before_dispatch_surfaces_as_failure_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ScriptedDriver::new().with_outcome("a", "alpha output", None);
        let orchestrator = test_orchestrator(driver, dir.path().join("orch.db"), false, None, HashMap::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orchestrator
            .execute(Pattern::Parallel, &["a".to_string()], AgentTask::new("t"), PatternOptions::default(), cancel)
            .await;

        assert!(!result.success);
    }
}
