//! Token→price accounting, budget thresholds, and session stats (C7, spec.md §4.7).
//!
//! A per-model price table, per-orchestration usage recording, and a
//! daily/monthly budget-threshold state machine.

use crate::event_bus::EventBus;
use crate::model::{new_id, TokenCounters, UsageRecord};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Per-million-token USD prices for one model.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_create_per_million: f64,
    pub cache_read_per_million: f64,
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

impl ModelPrice {
    fn cost(&self, tokens: &TokenCounters) -> f64 {
        let cost = tokens.input as f64 * self.input_per_million / 1_000_000.0
            + tokens.output as f64 * self.output_per_million / 1_000_000.0
            + tokens.cache_create as f64 * self.cache_create_per_million / 1_000_000.0
            + tokens.cache_read as f64 * self.cache_read_per_million / 1_000_000.0;
        round6(cost)
    }

    fn cache_savings(&self, tokens: &TokenCounters) -> f64 {
        let full_price_for_cached = tokens.cache_read as f64 * self.input_per_million / 1_000_000.0;
        let actual_cached_price = tokens.cache_read as f64 * self.cache_read_per_million / 1_000_000.0;
        round6((full_price_for_cached - actual_cached_price).max(0.0))
    }
}

/// Discrete budget status (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    Ok,
    Warning,
    Critical,
    Exceeded,
}

/// A snapshot of one budget dimension (daily or monthly).
#[derive(Debug, Clone)]
pub struct BudgetSnapshot {
    pub limit: Option<f64>,
    pub spent: f64,
    pub remaining: Option<f64>,
    pub percent: Option<f64>,
    pub status: BudgetStatus,
    /// Projected spend for the period. The ledger has no calendar-period
    /// clock of its own (no day/month boundary reset — see DESIGN.md), so
    /// this is reported as current cumulative spend rather than a
    /// time-extrapolated figure.
    pub projected: f64,
}

fn status_for(percent: f64, warn_threshold: f64, critical_threshold: f64) -> BudgetStatus {
    if percent >= 1.0 {
        BudgetStatus::Exceeded
    } else if percent >= critical_threshold {
        BudgetStatus::Critical
    } else if percent >= warn_threshold {
        BudgetStatus::Warning
    } else {
        BudgetStatus::Ok
    }
}

fn snapshot(limit: Option<f64>, spent: f64, warn_threshold: f64, critical_threshold: f64) -> BudgetSnapshot {
    match limit {
        Some(limit) if limit > 0.0 => {
            let percent = spent / limit;
            BudgetSnapshot {
                limit: Some(limit),
                spent,
                remaining: Some((limit - spent).max(0.0)),
                percent: Some(percent),
                status: status_for(percent, warn_threshold, critical_threshold),
                projected: spent,
            }
        }
        _ => BudgetSnapshot {
            limit,
            spent,
            remaining: None,
            percent: None,
            status: BudgetStatus::Ok,
            projected: spent,
        },
    }
}

struct Ledger {
    records: Vec<UsageRecord>,
    daily_spent: f64,
    monthly_spent: f64,
    daily_status: BudgetStatus,
    monthly_status: BudgetStatus,
}

impl Ledger {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            daily_spent: 0.0,
            monthly_spent: 0.0,
            daily_status: BudgetStatus::Ok,
            monthly_status: BudgetStatus::Ok,
        }
    }
}

/// Model-aware cost accounting and budget thresholds (spec.md §4.7).
pub struct CostLedger {
    prices: HashMap<String, ModelPrice>,
    daily_budget_usd: Option<f64>,
    monthly_budget_usd: Option<f64>,
    warn_threshold: f64,
    critical_threshold: f64,
    ledger: Mutex<Ledger>,
}

impl CostLedger {
    pub fn new(
        prices: HashMap<String, ModelPrice>,
        daily_budget_usd: Option<f64>,
        monthly_budget_usd: Option<f64>,
        warn_threshold: f64,
        critical_threshold: f64,
    ) -> Self {
        Self {
            prices,
            daily_budget_usd,
            monthly_budget_usd,
            warn_threshold,
            critical_threshold,
            ledger: Mutex::new(Ledger::new()),
        }
    }

    /// `recordUsage(orchestrationId, model, tokens)` — computes cost, writes
    /// a `UsageRecord`, updates session counters, and fires budget-threshold
    /// events on the bus (fire-and-forget).
    pub async fn record_usage(&self, orchestration_id: &str, model: &str, tokens: TokenCounters, bus: &EventBus) -> UsageRecord {
        let price = self.prices.get(model).copied();
        let unknown_model = price.is_none();
        let cost_usd = price.map(|p| p.cost(&tokens)).unwrap_or(0.0);
        let cache_savings_usd = price.map(|p| p.cache_savings(&tokens)).unwrap_or(0.0);

        if unknown_model {
            log::warn!("cost ledger: unknown model '{}'; recording cost=0", model);
        }

        let record = UsageRecord {
            orchestration_id: orchestration_id.to_string(),
            model: model.to_string(),
            tokens,
            cost_usd,
            cache_savings_usd,
            unknown_model,
            timestamp: Utc::now(),
        };

        let mut crossings = Vec::new();
        {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.daily_spent += cost_usd;
            ledger.monthly_spent += cost_usd;
            ledger.records.push(record.clone());

            let daily = snapshot(self.daily_budget_usd, ledger.daily_spent, self.warn_threshold, self.critical_threshold);
            let monthly = snapshot(self.monthly_budget_usd, ledger.monthly_spent, self.warn_threshold, self.critical_threshold);

            if daily.status != ledger.daily_status {
                crossings.push(daily.status);
                ledger.daily_status = daily.status;
            }
            if monthly.status != ledger.monthly_status {
                crossings.push(monthly.status);
                ledger.monthly_status = monthly.status;
            }
        };

        // Publishes immediately when a threshold is first crossed (spec.md §5),
        // exactly once per crossing (spec.md §8 B4) — repeat calls at the same
        // status do not republish.
        for status in crossings {
            if let Some(topic) = status_topic(status) {
                bus.publish(topic, serde_json::json!({ "orchestration_id": orchestration_id, "model": model })).await;
            }
        }

        record
    }

    pub fn budget_status(&self) -> (BudgetSnapshot, BudgetSnapshot) {
        let ledger = self.ledger.lock().unwrap();
        (
            snapshot(self.daily_budget_usd, ledger.daily_spent, self.warn_threshold, self.critical_threshold),
            snapshot(self.monthly_budget_usd, ledger.monthly_spent, self.warn_threshold, self.critical_threshold),
        )
    }

    pub fn agent_costs(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
        self.ledger
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .map(|r| r.cost_usd)
            .sum()
    }

    pub fn pattern_costs(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> HashMap<String, f64> {
        let ledger = self.ledger.lock().unwrap();
        let mut totals: HashMap<String, f64> = HashMap::new();
        for record in ledger.records.iter().filter(|r| r.timestamp >= from && r.timestamp <= to) {
            *totals.entry(record.model.clone()).or_insert(0.0) += record.cost_usd;
        }
        totals
    }

    /// `cleanup({olderThanDays})` — deletes expired `UsageRecord`s.
    pub fn cleanup(&self, older_than_days: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(older_than_days);
        let mut ledger = self.ledger.lock().unwrap();
        let before = ledger.records.len();
        ledger.records.retain(|r| r.timestamp >= cutoff);
        before - ledger.records.len()
    }

    pub fn record_id() -> String {
        new_id()
    }
}

fn status_topic(status: BudgetStatus) -> Option<&'static str> {
    match status {
        BudgetStatus::Warning => Some("usage:budget:warning"),
        BudgetStatus::Critical => Some("usage:budget:critical"),
        BudgetStatus::Exceeded => Some("usage:budget:exceeded"),
        BudgetStatus::Ok => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;

    fn prices() -> HashMap<String, ModelPrice> {
        let mut p = HashMap::new();
        p.insert(
            "gpt-test".to_string(),
            ModelPrice {
                input_per_million: 3.0,
                output_per_million: 15.0,
                cache_create_per_million: 3.75,
                cache_read_per_million: 0.3,
            },
        );
        p
    }

    #[tokio::test]
    async fn unknown_model_costs_zero_but_flags_record() {
        let ledger = CostLedger::new(prices(), None, None, 0.8, 0.95);
        let bus = EventBus::new(BusConfig::default());
        let record = ledger.record_usage("o1", "unknown-model", TokenCounters { input: 100, output: 100, ..Default::default() }, &bus).await;
        assert_eq!(record.cost_usd, 0.0);
        assert!(record.unknown_model);
    }

    #[tokio::test]
    async fn recorded_cost_matches_price_table_within_rounding() {
        let ledger = CostLedger::new(prices(), None, None, 0.8, 0.95);
        let bus = EventBus::new(BusConfig::default());
        let tokens = TokenCounters { input: 1_000_000, output: 1_000_000, cache_create: 0, cache_read: 0 };
        let record = ledger.record_usage("o1", "gpt-test", tokens, &bus).await;
        assert_eq!(record.cost_usd, 18.0);
    }

    #[tokio::test]
    async fn budget_status_crosses_warning_at_eighty_percent() {
        let ledger = CostLedger::new(prices(), Some(10.0), None, 0.8, 0.95);
        let bus = EventBus::new(BusConfig::default());
        // 8.0 / 10.0 = 80% exactly -> warning
        let tokens = TokenCounters { input: (8.0 / 3.0 * 1_000_000.0) as u64, output: 0, cache_create: 0, cache_read: 0 };
        ledger.record_usage("o1", "gpt-test", tokens, &bus).await;
        let (daily, _) = ledger.budget_status();
        assert_eq!(daily.status, BudgetStatus::Warning);
    }
}
