//! Fixed-k similarity retrieval over the knowledge index.

use std::sync::Arc;

use crate::error::{KbError, Result};
use crate::index::KnowledgeIndex;
use crate::models::ScoredChunk;

/// Default number of chunks returned per question.
pub const DEFAULT_TOP_K: usize = 4;

/// Stateless wrapper binding an index to a fixed `k`.
#[derive(Clone)]
pub struct Retriever {
    index: Arc<KnowledgeIndex>,
    k: usize,
}

impl Retriever {
    pub fn new(index: Arc<KnowledgeIndex>, k: usize) -> Self {
        Self { index, k }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Up to `k` chunks most similar to `question`, best first.
    ///
    /// Any embedding or search failure is reported as [`KbError::Retrieval`];
    /// no partial results are returned.
    pub async fn retrieve(&self, question: &str) -> Result<Vec<ScoredChunk>> {
        self.index
            .search(question, self.k)
            .await
            .map_err(|e| match e {
                KbError::Retrieval(_) => e,
                other => KbError::Retrieval(other.to_string()),
            })
    }
}
