//! BM25 keyword ranking over observation text + concepts.
//!
//! Plain structs, no external search-engine dependency — matches the rest
//! of the store's preference for hand-rolled utilities over a new crate.

use std::collections::HashMap;

const K1: f64 = 1.2;
const B: f64 = 0.75;

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

struct Document {
    term_counts: HashMap<String, u32>,
    length: usize,
}

/// An in-memory BM25 index over a document set keyed by an opaque id
/// (here, an `Observation` id; callers map back to orchestration ids).
#[derive(Default)]
pub struct KeywordIndex {
    docs: HashMap<String, Document>,
    doc_freq: HashMap<String, u32>,
    total_length: usize,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index (or re-index) the text body for `id`. Concepts are indexed
    /// alongside free text per spec.md §4.3 "keyword index over observation
    /// text+concepts".
    pub fn upsert(&mut self, id: &str, text: &str, concepts: &[String]) {
        self.remove(id);
        let mut combined = tokenize(text);
        combined.extend(concepts.iter().flat_map(|c| tokenize(c)));

        let mut term_counts = HashMap::new();
        for term in &combined {
            *term_counts.entry(term.clone()).or_insert(0) += 1;
        }
        for term in term_counts.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }
        self.total_length += combined.len();
        self.docs.insert(
            id.to_string(),
            Document {
                term_counts,
                length: combined.len(),
            },
        );
    }

    pub fn remove(&mut self, id: &str) {
        if let Some(doc) = self.docs.remove(id) {
            self.total_length -= doc.length;
            for term in doc.term_counts.keys() {
                if let Some(df) = self.doc_freq.get_mut(term) {
                    *df = df.saturating_sub(1);
                    if *df == 0 {
                        self.doc_freq.remove(term);
                    }
                }
            }
        }
    }

    fn avg_doc_length(&self) -> f64 {
        if self.docs.is_empty() {
            0.0
        } else {
            self.total_length as f64 / self.docs.len() as f64
        }
    }

    /// Score every indexed document against `query`, returning `(id, score)`
    /// pairs sorted by descending score. Documents scoring zero are omitted.
    pub fn search(&self, query: &str) -> Vec<(String, f64)> {
        let terms = tokenize(query);
        if terms.is_empty() || self.docs.is_empty() {
            return Vec::new();
        }
        let n = self.docs.len() as f64;
        let avg_len = self.avg_doc_length();

        let mut scores: Vec<(String, f64)> = self
            .docs
            .iter()
            .filter_map(|(id, doc)| {
                let mut score = 0.0;
                for term in &terms {
                    let Some(&tf) = doc.term_counts.get(term) else {
                        continue;
                    };
                    let df = *self.doc_freq.get(term).unwrap_or(&0) as f64;
                    let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let tf = tf as f64;
                    let denom = tf + K1 * (1.0 - B + B * doc.length as f64 / avg_len.max(1.0));
                    score += idf * (tf * (K1 + 1.0)) / denom;
                }
                if score > 0.0 {
                    Some((id.clone(), score))
                } else {
                    None
                }
            })
            .collect();
        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_term_match_scores_above_unrelated_doc() {
        let mut index = KeywordIndex::new();
        index.upsert("a", "database connection pool exhausted", &[]);
        index.upsert("b", "unrelated refactor of the css layout", &[]);
        let hits = index.search("connection pool");
        assert_eq!(hits[0].0, "a");
    }

    #[test]
    fn removed_document_no_longer_matches() {
        let mut index = KeywordIndex::new();
        index.upsert("a", "memory leak in worker", &[]);
        index.remove("a");
        assert!(index.search("memory leak").is_empty());
    }

    #[test]
    fn concepts_contribute_to_the_match() {
        let mut index = KeywordIndex::new();
        index.upsert("a", "short note", &["concurrency".to_string()]);
        let hits = index.search("concurrency");
        assert_eq!(hits.len(), 1);
    }
}
