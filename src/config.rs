//! Configuration for the orchestration core.
//!
//! A plain struct constructed however the caller likes, with a `Default`
//! impl — no TOML, YAML, or env-parsing dependency. One nested struct per
//! recognised configuration group from spec.md §6.

/// Memory (persistence + context retrieval) options.
pub struct MemoryConfig {
    /// Persistence file location (spec.md §6 `memory.dbPath`).
    pub db_path: std::path::PathBuf,
    /// Gate for context loading/saving. Memory defaults on; set `false` to opt out.
    pub enable_memory: bool,
    /// Layer-1 + layer-2 maximum token budget handed to `ContextRetriever`.
    pub context_token_budget: usize,
    /// Fraction of `context_token_budget` held back as a safety margin.
    pub safety_buffer: f64,
    /// `ContextRetriever` LRU capacity.
    pub cache_size: usize,
    /// `ContextRetriever` LRU entry TTL.
    pub cache_ttl: std::time::Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: std::path::PathBuf::from(".memory/orchestrations.db"),
            enable_memory: true,
            context_token_budget: 2000,
            safety_buffer: 0.2,
            cache_size: 100,
            cache_ttl: std::time::Duration::from_millis(300_000),
        }
    }
}

/// Search mode for `EmbeddingIndex::search_similar`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Vector,
    Keyword,
    Hybrid,
}

/// Embedding / semantic recall options.
pub struct EmbeddingConfig {
    /// Gate; true by default whenever a backend is supplied.
    pub enabled: bool,
    /// Consecutive backend failures before the circuit opens.
    pub circuit_threshold: u32,
    /// How long the circuit stays open before allowing a half-open probe.
    pub circuit_cooldown: std::time::Duration,
    /// Default search mode for `searchSimilar`.
    pub search_mode: SearchMode,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            circuit_threshold: 3,
            circuit_cooldown: std::time::Duration::from_millis(60_000),
            search_mode: SearchMode::Hybrid,
        }
    }
}

/// Orchestrator retry/timeout options.
pub struct OrchestratorConfig {
    pub retries: u32,
    pub retry_base: std::time::Duration,
    pub timeout: std::time::Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_base: std::time::Duration::from_millis(1_000),
            timeout: std::time::Duration::from_millis(60_000),
        }
    }
}

/// Cost ledger budget options.
pub struct CostConfig {
    pub daily_budget_usd: Option<f64>,
    pub monthly_budget_usd: Option<f64>,
    pub warn_threshold: f64,
    pub critical_threshold: f64,
    /// When true, `Orchestrator::execute` fails fast at `beforeExecution`
    /// instead of merely publishing a budget event.
    pub enforce: bool,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            daily_budget_usd: None,
            monthly_budget_usd: None,
            warn_threshold: 0.8,
            critical_threshold: 0.95,
            enforce: false,
        }
    }
}

/// EventBus tuning options.
pub struct BusConfig {
    pub history_size: usize,
    pub handler_budget: std::time::Duration,
    pub max_queue: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_size: 1000,
            handler_budget: std::time::Duration::from_secs(5),
            max_queue: 10_000,
        }
    }
}

/// Top-level configuration for an [`crate::orchestrator::Orchestrator`].
///
/// Intentionally minimal — callers build this by hand; no config-file
/// parsing dependency is introduced.
///
/// # Example
///
/// ```rust
/// use orchestrion::config::OrchestrionConfig;
///
/// let config = OrchestrionConfig::default();
/// assert!(config.memory.enable_memory);
/// assert_eq!(config.cost.warn_threshold, 0.8);
/// ```
#[derive(Default)]
pub struct OrchestrionConfig {
    pub memory: MemoryConfig,
    pub embedding: EmbeddingConfig,
    pub orchestrator: OrchestratorConfig,
    pub cost: CostConfig,
    pub bus: BusConfig,
}
