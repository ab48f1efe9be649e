//! Durable, hash-chained transaction log backing `PersistentStore` (C3).
//!
//! Generalised from `thought_chain.rs`'s `ThoughtChain`: append-only
//! newline-delimited JSON, each entry SHA-256 hash-chained to the one
//! before it so tampering with an earlier line is detectable. Where
//! `ThoughtChain` appends a single `Thought` variant, this engine appends a
//! [`WalEntry`] that can carry a whole `Orchestration` row or a batch of
//! `Observation`s — one WAL line per call keeps `recordOrchestration` and
//! `addObservations` each atomic (spec.md §4.3 P1): in-memory state is only
//! mutated after the WAL append for that call has succeeded, so a failed
//! append never leaves a partial update visible, and a successful one makes
//! the orchestration row and its stat deltas visible together.

use crate::error::{CoreError, CoreResult};
use crate::model::{
    new_id, AgentStat, Collaboration, Observation, Orchestration, Pattern, PatternStat,
    SuccessRate,
};
use crate::store::index::KeywordIndex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum WalEntry {
    RecordOrchestration(Orchestration),
    AddObservations {
        orchestration_id: String,
        observations: Vec<Observation>,
    },
    Cleanup { deleted_ids: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalLine {
    index: u64,
    timestamp: DateTime<Utc>,
    entry: WalEntry,
    prev_hash: String,
    hash: String,
}

fn compute_hash(index: u64, timestamp: &DateTime<Utc>, entry: &WalEntry, prev_hash: &str) -> String {
    let entry_json = serde_json::to_string(entry).unwrap_or_default();
    let canonical = format!("{}|{}|{}|{}", index, timestamp.to_rfc3339(), entry_json, prev_hash);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Summary row returned by [`PersistentStore::search`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationSummary {
    pub id: String,
    pub pattern: Pattern,
    pub task_snippet: String,
    pub result_summary: String,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

/// Filters accepted by [`PersistentStore::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub pattern: Option<Pattern>,
    pub agent_id: Option<String>,
    pub success: Option<bool>,
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

fn snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut s: String = text.chars().take(max_chars).collect();
        s.push('\u{2026}');
        s
    }
}

struct State {
    orchestrations: HashMap<String, Orchestration>,
    observations: HashMap<String, Vec<Observation>>,
    observation_hashes: HashMap<String, HashSet<String>>,
    pattern_stats: HashMap<String, PatternStat>,
    agent_stats: HashMap<String, AgentStat>,
    collaborations: HashMap<String, Collaboration>,
    index: KeywordIndex,
    wal_index: u64,
    prev_hash: String,
}

impl State {
    fn new() -> Self {
        Self {
            orchestrations: HashMap::new(),
            observations: HashMap::new(),
            observation_hashes: HashMap::new(),
            pattern_stats: HashMap::new(),
            agent_stats: HashMap::new(),
            collaborations: HashMap::new(),
            index: KeywordIndex::new(),
            wal_index: 0,
            prev_hash: String::new(),
        }
    }

    fn apply(&mut self, entry: &WalEntry) {
        match entry {
            WalEntry::RecordOrchestration(o) => self.apply_orchestration(o.clone()),
            WalEntry::AddObservations {
                orchestration_id,
                observations,
            } => self.apply_observations(orchestration_id, observations.clone()),
            WalEntry::Cleanup { deleted_ids } => {
                for id in deleted_ids {
                    self.orchestrations.remove(id);
                    if let Some(obs) = self.observations.remove(id) {
                        for o in obs {
                            self.index.remove(&o.id);
                        }
                    }
                    self.observation_hashes.remove(id);
                }
            }
        }
    }

    fn apply_orchestration(&mut self, o: Orchestration) {
        let pattern_key = o.pattern.as_str().to_string();
        let pattern_entry = self.pattern_stats.entry(pattern_key.clone()).or_insert_with(|| PatternStat {
            pattern: pattern_key.clone(),
            ..Default::default()
        });
        update_rolling(&mut pattern_entry.total, &mut pattern_entry.successes, &mut pattern_entry.avg_duration_ms, o.success, o.duration_ms);

        for agent_id in &o.agent_ids {
            let entry = self.agent_stats.entry(agent_id.clone()).or_insert_with(|| AgentStat {
                agent_id: agent_id.clone(),
                ..Default::default()
            });
            update_rolling(&mut entry.total, &mut entry.successes, &mut entry.avg_duration_ms, o.success, o.duration_ms);
        }

        let collab_key = Collaboration::key_for(&o.agent_ids);
        let collab = self.collaborations.entry(collab_key).or_insert_with(|| Collaboration {
            agent_ids: {
                let mut ids = o.agent_ids.clone();
                ids.sort();
                ids.dedup();
                ids
            },
            ..Default::default()
        });
        collab.total += 1;
        if o.success {
            collab.successes += 1;
        }

        self.orchestrations.insert(o.id.clone(), o);
    }

    fn apply_observations(&mut self, orchestration_id: &str, observations: Vec<Observation>) {
        let hashes = self
            .observation_hashes
            .entry(orchestration_id.to_string())
            .or_default();
        let bucket = self.observations.entry(orchestration_id.to_string()).or_default();
        for obs in observations {
            let content_hash = text_hash(&obs.text);
            if !hashes.insert(content_hash) {
                continue;
            }
            self.index.upsert(&obs.id, &obs.text, &obs.concepts);
            bucket.push(obs);
        }
    }
}

fn update_rolling(total: &mut u64, successes: &mut u64, avg_duration_ms: &mut f64, success: bool, duration_ms: u64) {
    let prev_total = *total;
    *avg_duration_ms = (*avg_duration_ms * prev_total as f64 + duration_ms as f64) / (prev_total + 1) as f64;
    *total += 1;
    if success {
        *successes += 1;
    }
}

fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Durable store for orchestrations, observations, and derived stats
/// (spec.md §4.3). A single-writer, lock-light engine: readers only ever
/// touch the `Mutex`-guarded in-memory state, which is authoritative — the
/// WAL file exists purely for crash recovery.
pub struct PersistentStore {
    wal_path: PathBuf,
    state: Mutex<State>,
    degraded: AtomicBool,
}

impl PersistentStore {
    /// Open (or create) the store at `path`. Replays the WAL to rebuild the
    /// in-memory state and keyword index.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let wal_path = path.as_ref().to_path_buf();
        if let Some(parent) = wal_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut state = State::new();
        if wal_path.exists() {
            let file = fs::File::open(&wal_path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: WalLine = serde_json::from_str(&line).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("corrupt WAL line: {}", e))
                })?;
                state.apply(&parsed.entry);
                state.wal_index = parsed.index + 1;
                state.prev_hash = parsed.hash;
            }
        }

        Ok(Self {
            wal_path,
            state: Mutex::new(state),
            degraded: AtomicBool::new(false),
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn append(&self, state: &mut State, entry: WalEntry) -> CoreResult<()> {
        let timestamp = Utc::now();
        let hash = compute_hash(state.wal_index, &timestamp, &entry, &state.prev_hash);
        let line = WalLine {
            index: state.wal_index,
            timestamp,
            entry,
            prev_hash: state.prev_hash.clone(),
            hash: hash.clone(),
        };
        let result = (|| -> io::Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(&self.wal_path)?;
            let json = serde_json::to_string(&line)?;
            writeln!(file, "{}", json)?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                state.apply(&line.entry);
                state.wal_index += 1;
                state.prev_hash = hash;
                Ok(())
            }
            Err(e) => {
                self.degraded.store(true, Ordering::SeqCst);
                Err(CoreError::StoreUnavailable(e.to_string()))
            }
        }
    }

    /// `recordOrchestration(o) → id` (spec.md §4.3), atomic with pattern,
    /// agent, and collaboration stat updates.
    pub fn record_orchestration(&self, mut o: Orchestration) -> CoreResult<String> {
        if self.is_degraded() {
            return Err(CoreError::StoreUnavailable(self.wal_path.display().to_string()));
        }
        if o.id.is_empty() {
            o.id = new_id();
        }
        if !o.is_well_formed() {
            return Err(CoreError::InvalidInput("orchestration missing agent ids".into()));
        }
        let id = o.id.clone();
        let mut state = self.state.lock().unwrap();
        self.append(&mut state, WalEntry::RecordOrchestration(o))?;
        Ok(id)
    }

    /// `addObservations(orchestrationId, obs[])`, idempotent per
    /// (orchestrationId, hash(text)).
    pub fn add_observations(&self, orchestration_id: &str, observations: Vec<Observation>) -> CoreResult<()> {
        if self.is_degraded() {
            return Err(CoreError::StoreUnavailable(self.wal_path.display().to_string()));
        }
        let observations: Vec<Observation> = observations
            .into_iter()
            .map(|o| o.clamp_importance().cap_concepts())
            .collect();
        let mut state = self.state.lock().unwrap();
        self.append(
            &mut state,
            WalEntry::AddObservations {
                orchestration_id: orchestration_id.to_string(),
                observations,
            },
        )
    }

    /// `getById(id, {includeObservations}) → Orchestration | null`.
    pub fn get_by_id(&self, id: &str) -> Option<Orchestration> {
        if self.is_degraded() {
            return None;
        }
        self.state.lock().unwrap().orchestrations.get(id).cloned()
    }

    pub fn observations_for(&self, id: &str) -> Vec<Observation> {
        if self.is_degraded() {
            return Vec::new();
        }
        self.state
            .lock()
            .unwrap()
            .observations
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// `search({query?, filters, limit}) → OrchestrationSummary[]`.
    pub fn search(&self, query: Option<&str>, filters: &SearchFilters, limit: usize) -> Vec<OrchestrationSummary> {
        if self.is_degraded() {
            return Vec::new();
        }
        let state = self.state.lock().unwrap();

        let ranked: Vec<(String, f64)> = match query {
            Some(q) if !q.trim().is_empty() => {
                let hits = state.index.search(q);
                let mut by_orch: HashMap<String, f64> = HashMap::new();
                for (obs_id, score) in hits {
                    for (orch_id, obs_list) in state.observations.iter() {
                        if obs_list.iter().any(|o| o.id == obs_id) {
                            let entry = by_orch.entry(orch_id.clone()).or_insert(0.0);
                            if score > *entry {
                                *entry = score;
                            }
                        }
                    }
                }
                let mut ranked: Vec<(String, f64)> = by_orch.into_iter().collect();
                ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                ranked
            }
            _ => {
                let mut all: Vec<(String, f64)> = state
                    .orchestrations
                    .values()
                    .map(|o| (o.id.clone(), 0.0))
                    .collect();
                all.sort_by(|a, b| {
                    let oa = &state.orchestrations[&a.0];
                    let ob = &state.orchestrations[&b.0];
                    ob.started_at.cmp(&oa.started_at)
                });
                all
            }
        };

        ranked
            .into_iter()
            .filter_map(|(id, score)| state.orchestrations.get(&id).map(|o| (o, score)))
            .filter(|(o, _)| filters.pattern.map(|p| p == o.pattern).unwrap_or(true))
            .filter(|(o, _)| {
                filters
                    .agent_id
                    .as_ref()
                    .map(|aid| o.agent_ids.iter().any(|a| a == aid))
                    .unwrap_or(true)
            })
            .filter(|(o, _)| filters.success.map(|s| s == o.success).unwrap_or(true))
            .filter(|(o, _)| {
                filters
                    .time_range
                    .map(|(from, to)| o.started_at >= from && o.started_at <= to)
                    .unwrap_or(true)
            })
            .take(limit)
            .map(|(o, score)| OrchestrationSummary {
                id: o.id.clone(),
                pattern: o.pattern,
                task_snippet: snippet(&o.task_text, 100),
                result_summary: snippet(&o.result_summary, 150),
                score,
                timestamp: o.started_at,
                success: o.success,
            })
            .collect()
    }

    pub fn agent_stats(&self, id: Option<&str>) -> Vec<AgentStat> {
        if self.is_degraded() {
            return Vec::new();
        }
        let state = self.state.lock().unwrap();
        match id {
            Some(id) => state.agent_stats.get(id).cloned().into_iter().collect(),
            None => state.agent_stats.values().cloned().collect(),
        }
    }

    pub fn pattern_stats(&self, pattern: Option<&str>) -> Vec<PatternStat> {
        if self.is_degraded() {
            return Vec::new();
        }
        let state = self.state.lock().unwrap();
        match pattern {
            Some(p) => state.pattern_stats.get(p).cloned().into_iter().collect(),
            None => state.pattern_stats.values().cloned().collect(),
        }
    }

    pub fn collaborations(&self, min_rate: f64, min_count: u64) -> Vec<Collaboration> {
        if self.is_degraded() {
            return Vec::new();
        }
        self.state
            .lock()
            .unwrap()
            .collaborations
            .values()
            .filter(|c| c.total >= min_count)
            .filter(|c| c.success_rate().map(|r| r >= min_rate).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// `cleanup({olderThan, keepMinimum})` — deletes orchestrations strictly
    /// older than `older_than` while retaining at least `keep_minimum`
    /// most-recent rows.
    pub fn cleanup(&self, older_than: DateTime<Utc>, keep_minimum: usize) -> CoreResult<usize> {
        if self.is_degraded() {
            return Err(CoreError::StoreUnavailable(self.wal_path.display().to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let mut ids: Vec<String> = state.orchestrations.keys().cloned().collect();
        ids.sort_by(|a, b| {
            state.orchestrations[b].started_at.cmp(&state.orchestrations[a].started_at)
        });
        let deletable: Vec<String> = ids
            .into_iter()
            .skip(keep_minimum)
            .filter(|id| state.orchestrations[id].started_at < older_than)
            .collect();
        if deletable.is_empty() {
            return Ok(0);
        }
        let count = deletable.len();
        self.append(&mut state, WalEntry::Cleanup { deleted_ids: deletable })?;
        Ok(count)
    }
}
