//! Title similarity used by the fuzzy phase.

use std::collections::HashSet;
use strsim::normalized_levenshtein;

use crate::normalize;

/// Precomputed title forms for one document
#[derive(Debug, Clone)]
pub struct TitleProfile {
    pub clean: String,
    pub tokens: HashSet<String>,
}

impl TitleProfile {
    pub fn new(title: &str) -> Self {
        let clean = normalize::clean_title(title);
        let tokens = clean.split_whitespace().map(str::to_string).collect();
        Self { clean, tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Shared words over the size of the smaller word set.
pub fn token_overlap(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    let shared = if a.len() <= b.len() {
        a.iter().filter(|t| b.contains(*t)).count()
    } else {
        b.iter().filter(|t| a.contains(*t)).count()
    };
    shared as f64 / smaller as f64
}

/// Edit-distance similarity of cleaned titles, 0 to 100.
pub fn title_score(a: &str, b: &str) -> f64 {
    normalized_levenshtein(a, b) * 100.0
}
