//! Core data models used throughout the knowledge base.
//!
//! These types represent the extracted documents, chunks, retrieval hits,
//! conversation messages, and streaming events that flow through the
//! ingestion and answer pipelines.

use serde::{Deserialize, Serialize};

/// One unit of extracted text (a whole file, a PDF page, a CSV row, a sheet).
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub text: String,
    /// Base name of the source file, e.g. `notes.txt`.
    pub source_file: String,
    /// Path of the source file relative to the watched directory.
    pub file_path: String,
    /// Page / row / sheet locator, when the format has one.
    pub page: Option<u32>,
}

/// A bounded slice of extracted text: the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    pub id: String,
    pub text: String,
    pub source_file: String,
    pub file_path: String,
    pub page: Option<u32>,
    /// Position of the chunk within its source unit.
    pub chunk_index: i64,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// A chunk returned from similarity search together with its score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
}

/// Citation attached to an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

impl From<&DocumentChunk> for SourceRef {
    fn from(chunk: &DocumentChunk) -> Self {
        SourceRef {
            file: chunk.source_file.clone(),
            page: chunk.page,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceRef>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            sources: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>, sources: Vec<SourceRef>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            sources,
        }
    }
}

/// Complete answer from the buffered pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<SourceRef>,
}

/// Event emitted by the streaming pipeline.
///
/// Serialized as `{"type": "sources", "sources": [...]}`,
/// `{"type": "token", "token": "..."}` and `{"type": "end"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Sources { sources: Vec<SourceRef> },
    Token { token: String },
    End,
}

/// Entry of the knowledge directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size_kb: f64,
    #[serde(rename = "type")]
    pub file_type: String,
}

/// Render sources as numbered citation lines: `[1] notes.txt (page 3)`.
pub fn format_sources(sources: &[SourceRef]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, s)| match s.page {
            Some(page) => format!("[{}] {} (page {})", i + 1, s.file, page),
            None => format!("[{}] {}", i + 1, s.file),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
