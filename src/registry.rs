//! Declarative agent definition file parsing and lookup (C8, spec.md §4.8).
//!
//! Grounded two ways: the "no parsing dependency, construct it yourself"
//! posture follows `config.rs`'s plain-struct-plus-`Default` convention; the
//! collision-resistant, deterministic keying of loaded entities follows
//! `thought_chain.rs`'s `chain_filename` fingerprinting — here applied to
//! building a stable multi-index over parsed agent records rather than a
//! filename.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Declarative agent record parsed from a `---`-delimited definition file
/// (spec.md §6 "Agent definition files").
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub name: String,
    pub display_name: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub capabilities: Vec<String>,
    pub category: String,
    pub phase: Option<String>,
    pub priority: Priority,
    pub tools: Vec<String>,
    pub tags: Vec<String>,
    pub instructions: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    fn parse(raw: &str) -> Priority {
        match raw.trim().to_lowercase().as_str() {
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse one agent definition file's contents. Required fields are `name`
/// and `model`; a missing one rejects the file (spec.md §4.8).
///
/// Unparseable `temperature`/`max_tokens` values fall back to `None` rather
/// than rejecting the whole file — numeric typos in optional tuning knobs
/// shouldn't cost an otherwise well-formed agent its registration.
pub fn parse_agent_file(path: &Path, contents: &str, root: &Path) -> Result<AgentRecord, String> {
    let mut lines = contents.lines();
    let first = lines.next().unwrap_or("").trim();
    if first != "---" {
        return Err("missing opening '---' preamble sentinel".to_string());
    }

    let mut fields: HashMap<String, String> = HashMap::new();
    let mut instructions_lines: Vec<&str> = Vec::new();
    let mut in_preamble = true;

    for line in lines {
        if in_preamble {
            if line.trim() == "---" {
                in_preamble = false;
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                fields.insert(key.trim().to_string(), value.trim().to_string());
            }
        } else {
            instructions_lines.push(line);
        }
    }
    if in_preamble {
        return Err("missing closing '---' preamble sentinel".to_string());
    }

    let name = fields.get("name").cloned().ok_or("missing required field 'name'")?;
    let model = fields.get("model").cloned().ok_or("missing required field 'model'")?;
    if name.is_empty() || model.is_empty() {
        return Err("'name' and 'model' must be non-empty".to_string());
    }

    let category = fields.get("category").cloned().unwrap_or_else(|| infer_category(path, root));

    Ok(AgentRecord {
        display_name: fields.get("display_name").cloned().unwrap_or_else(|| name.clone()),
        name,
        model,
        temperature: fields.get("temperature").and_then(|v| v.parse().ok()),
        max_tokens: fields.get("max_tokens").and_then(|v| v.parse().ok()),
        capabilities: fields.get("capabilities").map(|v| split_list(v)).unwrap_or_default(),
        category,
        phase: fields.get("phase").cloned(),
        priority: fields.get("priority").map(|v| Priority::parse(v)).unwrap_or_default(),
        tools: fields.get("tools").map(|v| split_list(v)).unwrap_or_default(),
        tags: fields.get("tags").map(|v| split_list(v)).unwrap_or_default(),
        instructions: instructions_lines.join("\n").trim().to_string(),
    })
}

/// Infer `category` from the first path segment below `root` when the
/// preamble omits it (spec.md §3 invariant (b)).
fn infer_category(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .ok()
        .and_then(|rel| rel.components().next())
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .unwrap_or_else(|| "uncategorized".to_string())
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Scoring + input for [`AgentRegistry::best_match`] (spec.md §4.8).
#[derive(Debug, Clone, Default)]
pub struct MatchQuery {
    pub phase: Option<String>,
    pub capabilities: Vec<String>,
    pub model: Option<String>,
}

/// Declarative agent registry: discovers agent files, indexes them, and
/// answers capability/phase/tag/model lookups.
#[derive(Default)]
pub struct AgentRegistry {
    by_name: HashMap<String, AgentRecord>,
    by_category: HashMap<String, Vec<String>>,
    by_phase: HashMap<String, Vec<String>>,
    by_capability: HashMap<String, Vec<String>>,
    by_tag: HashMap<String, Vec<String>>,
    by_model: HashMap<String, Vec<String>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recursively enumerate `root`; parse each file, indexing the ones that
    /// validate and collecting a diagnostic for each one that doesn't
    /// (rejected files never abort the walk).
    pub fn discover(root: impl AsRef<Path>) -> (Self, Vec<(PathBuf, String)>) {
        let root = root.as_ref();
        let mut registry = Self::new();
        let mut errors = Vec::new();

        let mut files = Vec::new();
        if walk(root, &mut files).is_err() {
            return (registry, errors);
        }

        for path in files {
            let contents = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    errors.push((path, e.to_string()));
                    continue;
                }
            };
            match parse_agent_file(&path, &contents, root) {
                Ok(record) => registry.register(record),
                Err(reason) => {
                    log::warn!("agent registry: rejecting '{}': {}", path.display(), reason);
                    errors.push((path, reason));
                }
            }
        }
        (registry, errors)
    }

    /// `register(agent)` (spec.md §4.10) — add one record directly, bypassing
    /// file discovery. Used by callers that construct agents programmatically.
    pub fn register(&mut self, record: AgentRecord) {
        let name = record.name.clone();
        self.by_category.entry(record.category.clone()).or_default().push(name.clone());
        if let Some(phase) = &record.phase {
            self.by_phase.entry(phase.clone()).or_default().push(name.clone());
        }
        for capability in &record.capabilities {
            self.by_capability.entry(capability.clone()).or_default().push(name.clone());
        }
        for tag in &record.tags {
            self.by_tag.entry(tag.clone()).or_default().push(name.clone());
        }
        self.by_model.entry(record.model.clone()).or_default().push(name.clone());
        self.by_name.insert(name, record);
    }

    pub fn get_by_name(&self, name: &str) -> Option<&AgentRecord> {
        self.by_name.get(name)
    }

    pub fn get_by_category(&self, category: &str) -> Vec<&AgentRecord> {
        self.lookup(&self.by_category, category)
    }

    pub fn get_by_phase(&self, phase: &str) -> Vec<&AgentRecord> {
        self.lookup(&self.by_phase, phase)
    }

    pub fn get_by_capability(&self, capability: &str) -> Vec<&AgentRecord> {
        self.lookup(&self.by_capability, capability)
    }

    pub fn get_by_tag(&self, tag: &str) -> Vec<&AgentRecord> {
        self.lookup(&self.by_tag, tag)
    }

    pub fn get_by_model(&self, model: &str) -> Vec<&AgentRecord> {
        self.lookup(&self.by_model, model)
    }

    fn lookup(&self, index: &HashMap<String, Vec<String>>, key: &str) -> Vec<&AgentRecord> {
        index
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|name| self.by_name.get(name))
            .collect()
    }

    /// `bestMatch({phase, capabilities[], model?})` — scores every agent
    /// and returns the winner, or `None` if no capability matched at all
    /// (spec.md §4.8).
    pub fn best_match(&self, query: &MatchQuery) -> Option<&AgentRecord> {
        let mut scored: Vec<(i32, &AgentRecord)> = self
            .by_name
            .values()
            .filter_map(|agent| {
                let mut score = 0;
                let mut matched_capability = false;
                for cap in &query.capabilities {
                    if agent.capabilities.iter().any(|c| c == cap) {
                        score += 3;
                        matched_capability = true;
                    }
                }
                if query.capabilities.is_empty() {
                    matched_capability = true;
                }
                if !matched_capability {
                    return None;
                }
                if let Some(phase) = &query.phase {
                    if agent.phase.as_deref() == Some(phase.as_str()) {
                        score += 2;
                    }
                }
                if let Some(model) = &query.model {
                    if &agent.model == model {
                        score += 1;
                    }
                }
                Some((score, agent))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.priority.cmp(&a.1.priority))
                .then_with(|| a.1.name.cmp(&b.1.name))
        });
        scored.into_iter().next().map(|(_, agent)| agent)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_agent(dir: &Path, relative: &str, body: &str) -> PathBuf {
        let path = dir.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn rejects_file_missing_required_fields() {
        let dir = tempfile::tempdir().unwrap();
        let body = "---\ndisplay_name: No Name\n---\ninstructions here";
        let path = write_agent(dir.path(), "broken.agent", body);
        let err = parse_agent_file(&path, body, dir.path()).unwrap_err();
        assert!(err.contains("name"));
    }

    #[test]
    fn category_inferred_from_directory_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let body = "---\nname: reviewer\nmodel: gpt-test\n---\nReview the diff carefully.";
        write_agent(dir.path(), "quality/reviewer.agent", body);
        let (registry, errors) = AgentRegistry::discover(dir.path());
        assert!(errors.is_empty());
        let agent = registry.get_by_name("reviewer").unwrap();
        assert_eq!(agent.category, "quality");
    }

    #[test]
    fn best_match_requires_at_least_one_capability_match() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(
            dir.path(),
            "a.agent",
            "---\nname: a\nmodel: m\ncapabilities: search, write\nphase: plan\npriority: high\n---\ninstr",
        );
        write_agent(
            dir.path(),
            "b.agent",
            "---\nname: b\nmodel: m\ncapabilities: write\nphase: plan\npriority: medium\n---\ninstr",
        );
        let (registry, _) = AgentRegistry::discover(dir.path());

        let best = registry
            .best_match(&MatchQuery {
                phase: Some("plan".into()),
                capabilities: vec!["search".into()],
                model: Some("m".into()),
            })
            .unwrap();
        assert_eq!(best.name, "a");

        let none = registry.best_match(&MatchQuery {
            phase: None,
            capabilities: vec!["nonexistent".into()],
            model: None,
        });
        assert!(none.is_none());
    }

    #[test]
    fn invalid_numeric_fields_fall_back_to_defaults_not_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let body = "---\nname: a\nmodel: m\ntemperature: not-a-number\n---\ninstr";
        let path = write_agent(dir.path(), "a.agent", body);
        let record = parse_agent_file(&path, body, dir.path()).unwrap();
        assert_eq!(record.temperature, None);
    }
}
