//! Named, ordered hook pipelines (spec.md §4.2).
//!
//! Grounded on `examples/SecBear-neuron/neuron-hooks`'s `HookRegistry`: an
//! ordered `Vec` of handlers dispatched in sequence, errors logged and
//! swallowed rather than propagated by default. Generalised from neuron's
//! fixed `HookAction` outcome (`Continue`/`Halt`/`SkipTool`/...) to a plain
//! pipeline transform — each stage handler receives the previous handler's
//! output and returns the value forwarded to the next one — and from a
//! single always-continue policy to a per-handler `isolated` flag (spec.md
//! §4.2: `isolated = true` swallows the error and forwards the previous
//! value; `isolated = false` surfaces the error and halts the stage).

use crate::error::CoreError;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A stage handler: transforms the pipeline value, or fails.
pub type HookHandler = std::sync::Arc<
    dyn Fn(Value) -> BoxFuture<'static, Result<Value, CoreError>> + Send + Sync,
>;

struct Registration {
    id: String,
    priority: i32,
    insertion_seq: u64,
    isolated: bool,
    handler: HookHandler,
}

/// Aggregate counters for one stage (spec.md §4.2 "per-stage metrics").
#[derive(Debug, Clone, Copy, Default)]
pub struct StageMetrics {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration: Duration,
}

struct Stage {
    registrations: Vec<Registration>,
    metrics: StageMetrics,
}

impl Default for Stage {
    fn default() -> Self {
        Self {
            registrations: Vec::new(),
            metrics: StageMetrics::default(),
        }
    }
}

/// Ordered, named hook pipelines keyed by stage name (e.g.
/// `"before-execution"`, `"after-execution"`).
pub struct LifecycleHooks {
    stages: Mutex<HashMap<String, Stage>>,
    next_seq: AtomicU64,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self {
            stages: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Register `handler` under `stage`. Handlers run in ascending
    /// `priority` order, ties broken by registration order (spec.md §4.2).
    pub fn register<F, Fut>(
        &self,
        stage: impl Into<String>,
        id: impl Into<String>,
        priority: i32,
        isolated: bool,
        handler: F,
    ) where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CoreError>> + Send + 'static,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            id: id.into(),
            priority,
            insertion_seq: seq,
            isolated,
            handler: std::sync::Arc::new(move |value| Box::pin(handler(value))),
        };
        let mut stages = self.stages.lock().unwrap();
        let entry = stages.entry(stage.into()).or_default();
        entry.registrations.push(registration);
        entry
            .registrations
            .sort_by(|a, b| a.priority.cmp(&b.priority).then(a.insertion_seq.cmp(&b.insertion_seq)));
    }

    /// Remove a previously registered handler by stage + id.
    pub fn unregister(&self, stage: &str, id: &str) {
        if let Some(entry) = self.stages.lock().unwrap().get_mut(stage) {
            entry.registrations.retain(|r| r.id != id);
        }
    }

    /// Run `stage`'s pipeline over `input`, returning the final transformed
    /// value. A non-isolated handler's error halts the pipeline and is
    /// returned to the caller; an isolated handler's error is logged and the
    /// previous value carries forward to the next handler.
    pub async fn execute(&self, stage: &str, input: Value) -> Result<Value, CoreError> {
        let handlers: Vec<(String, bool, HookHandler)> = {
            let stages = self.stages.lock().unwrap();
            match stages.get(stage) {
                Some(s) => s
                    .registrations
                    .iter()
                    .map(|r| (r.id.clone(), r.isolated, r.handler.clone()))
                    .collect(),
                None => return Ok(input),
            }
        };

        let mut value = input;
        for (id, isolated, handler) in handlers {
            let started = Instant::now();
            let result = handler(value.clone()).await;
            let elapsed = started.elapsed();
            self.record(stage, &result, elapsed);
            match result {
                Ok(next) => value = next,
                Err(err) if isolated => {
                    log::warn!("lifecycle hook '{}' on stage '{}' failed (isolated): {}", id, stage, err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(value)
    }

    fn record(&self, stage: &str, result: &Result<Value, CoreError>, elapsed: Duration) {
        let mut stages = self.stages.lock().unwrap();
        let entry = stages.entry(stage.to_string()).or_default();
        entry.metrics.executions += 1;
        entry.metrics.total_duration += elapsed;
        match result {
            Ok(_) => entry.metrics.successes += 1,
            Err(_) => entry.metrics.failures += 1,
        }
    }

    /// Snapshot the metrics accumulated for `stage`, if it has ever run.
    pub fn metrics(&self, stage: &str) -> Option<StageMetrics> {
        self.stages.lock().unwrap().get(stage).map(|s| s.metrics)
    }
}

impl Default for LifecycleHooks {
    fn default() -> Self {
        Self::new()
    }
}
