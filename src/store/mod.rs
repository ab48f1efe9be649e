//! Durable record of orchestrations, observations, and derived stats (C3).

pub mod engine;
pub mod index;

pub use engine::{OrchestrationSummary, PersistentStore, SearchFilters};
