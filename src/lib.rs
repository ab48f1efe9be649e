//! `orchestrion` — coordination core for multi-agent orchestration.
//!
//! Pattern executors, the lifecycle/event plane, durable hash-chained
//! memory, semantic recall, cost accounting, and a declarative agent
//! registry (spec.md §2). LLM transports, vector-database backends, CLI
//! surfaces, and the rest of the host application are consumed through the
//! narrow traits in [`driver`] and [`embedding`] rather than implemented
//! here.

pub mod cancel;
pub mod categorizer;
pub mod config;
pub mod context;
pub mod cost_ledger;
pub mod driver;
pub mod embedding;
pub mod error;
pub mod event_bus;
pub mod hooks;
pub mod model;
pub mod orchestrator;
pub mod patterns;
pub mod registry;
pub mod store;

pub use cancel::CancellationToken;
pub use config::OrchestrionConfig;
pub use driver::{AgentDriver, AgentOutcome, AgentTask, TokenCounter, TokenUsage};
pub use error::{CoreError, CoreResult};
pub use model::{Observation, ObservationType, Orchestration, Pattern};
pub use orchestrator::Orchestrator;
