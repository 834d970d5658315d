//! BM25 keyword index.
//!
//! Okapi BM25 over an in-memory inverted index. Tokenization: lowercase,
//! split on non-alphanumeric, drop tokens shorter than two characters,
//! drop stopwords.
//!
//! `IDF(t) = ln((N - n + 0.5)/(n + 0.5) + 1)`
//! `score(D,Q) = Σ_t IDF(t) · f(t,D)·(k1+1) / (f(t,D) + k1·(1 - b + b·|D|/avgdl))`
//!
//! Re-adding an id removes the old posting set first, so the index always
//! reflects exactly the latest text. Terms whose document frequency drops
//! to zero are deleted outright.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

// ============================================================================
// TOKENIZATION
// ============================================================================

/// Fixed stopword list applied by the tokenizer
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

/// Lowercase, split on non-alphanumeric, drop short tokens and stopwords
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .filter(|t| !STOPWORDS.contains(t))
        .map(String::from)
        .collect()
}

// ============================================================================
// PARAMETERS
// ============================================================================

/// BM25 tuning parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bm25Params {
    /// Term-frequency saturation
    pub k1: f32,
    /// Length normalization strength
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

// ============================================================================
// INDEX
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocEntry {
    /// Term frequencies for this document
    term_freqs: HashMap<String, u32>,
    /// Token count after filtering
    len: usize,
}

/// In-memory BM25 inverted index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordIndex {
    params: Bm25Params,
    docs: HashMap<String, DocEntry>,
    /// term → posting set of doc ids
    postings: HashMap<String, HashSet<String>>,
    total_len: usize,
}

impl KeywordIndex {
    /// New empty index with default parameters
    pub fn new() -> Self {
        Self::with_params(Bm25Params::default())
    }

    /// New empty index with explicit parameters
    pub fn with_params(params: Bm25Params) -> Self {
        Self {
            params,
            docs: HashMap::new(),
            postings: HashMap::new(),
            total_len: 0,
        }
    }

    /// Indexed document count
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// True when no documents are indexed
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Whether a document id is indexed
    pub fn contains(&self, id: &str) -> bool {
        self.docs.contains_key(id)
    }

    /// Document frequency of a term
    pub fn doc_freq(&self, term: &str) -> usize {
        self.postings.get(term).map(HashSet::len).unwrap_or(0)
    }

    /// Index a document; an existing id is replaced entirely
    pub fn add(&mut self, id: &str, text: &str) {
        if self.contains(id) {
            self.remove(id);
        }
        let tokens = tokenize(text);
        let len = tokens.len();
        let mut term_freqs: HashMap<String, u32> = HashMap::new();
        for token in tokens {
            *term_freqs.entry(token).or_default() += 1;
        }
        for term in term_freqs.keys() {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id.to_string());
        }
        self.total_len += len;
        self.docs.insert(id.to_string(), DocEntry { term_freqs, len });
    }

    /// Drop a document; returns whether it was present. Empty posting sets
    /// are deleted with it.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(entry) = self.docs.remove(id) else {
            return false;
        };
        self.total_len -= entry.len;
        for term in entry.term_freqs.keys() {
            if let Some(posting) = self.postings.get_mut(term) {
                posting.remove(id);
                if posting.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        true
    }

    /// BM25 search; only documents containing at least one query term are
    /// returned, sorted by descending score
    pub fn search(&self, query: &str, limit: usize) -> Vec<(String, f32)> {
        let terms = tokenize(query);
        if terms.is_empty() || self.docs.is_empty() || limit == 0 {
            return Vec::new();
        }

        let n = self.docs.len() as f32;
        let avgdl = (self.total_len as f32 / n).max(1.0);

        let mut scores: HashMap<&str, f32> = HashMap::new();
        for term in &terms {
            let Some(posting) = self.postings.get(term) else {
                continue;
            };
            let df = posting.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for id in posting {
                let doc = &self.docs[id];
                let tf = doc.term_freqs[term] as f32;
                let norm = self.params.k1
                    * (1.0 - self.params.b + self.params.b * doc.len as f32 / avgdl);
                let contribution = idf * tf * (self.params.k1 + 1.0) / (tf + norm);
                *scores.entry(id.as_str()).or_default() += contribution;
            }
        }

        let mut results: Vec<(String, f32)> = scores
            .into_iter()
            .map(|(id, s)| (id.to_string(), s))
            .collect();
        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(limit);
        results
    }
}

impl Default for KeywordIndex {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
