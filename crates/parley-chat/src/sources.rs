//! Grounding source deduplication

use parley_ai::GroundingSource;
use std::collections::HashSet;

/// Keep the first occurrence of each uri, preserving arrival order.
pub fn dedup_sources(sources: &[GroundingSource]) -> Vec<GroundingSource> {
    let mut seen = HashSet::new();
    sources
        .iter()
        .filter(|s| seen.insert(s.uri.as_str()))
        .cloned()
        .collect()
}

/// Sources accumulated across a streamed reply.
///
/// First-seen order is stable no matter how many increments arrive.
#[derive(Debug, Clone, Default)]
pub struct SourceSet {
    seen: HashSet<String>,
    ordered: Vec<GroundingSource>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add newly arrived sources; repeats of a known uri are ignored
    pub fn extend(&mut self, sources: impl IntoIterator<Item = GroundingSource>) {
        for source in sources {
            if self.seen.insert(source.uri.clone()) {
                self.ordered.push(source);
            }
        }
    }

    pub fn as_slice(&self) -> &[GroundingSource] {
        &self.ordered
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn into_vec(self) -> Vec<GroundingSource> {
        self.ordered
    }
}
