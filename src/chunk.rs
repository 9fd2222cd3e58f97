//! Recursive, overlapping text chunker.
//!
//! Splits extracted text into [`DocumentChunk`]s of at most `chunk_size`
//! characters. Splitting prefers paragraph boundaries (`\n\n`), then lines,
//! then words, and only falls back to cutting between characters when a
//! single word is longer than the budget. Consecutive chunks of the same
//! source unit share up to `chunk_overlap` characters of boundary text.
//!
//! Each chunk receives a random UUID plus a SHA-256 hash of its text.

use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::error::{KbError, Result};
use crate::models::{DocumentChunk, ExtractedDocument};

/// Separators tried in order; `""` splits between characters.
const SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

/// Chunk every document independently, so overlap never crosses sources.
pub fn chunk_documents(
    documents: &[ExtractedDocument],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Result<Vec<DocumentChunk>> {
    validate(chunk_size, chunk_overlap)?;

    let mut chunks = Vec::new();
    for doc in documents {
        for (index, text) in split_text(&doc.text, chunk_size, chunk_overlap)
            .into_iter()
            .enumerate()
        {
            chunks.push(make_chunk(doc, index as i64, text));
        }
    }
    Ok(chunks)
}

fn validate(chunk_size: usize, chunk_overlap: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(KbError::InvalidInput("chunk size must be > 0".to_string()));
    }
    if chunk_overlap >= chunk_size {
        return Err(KbError::InvalidInput(format!(
            "chunk overlap ({}) must be smaller than chunk size ({})",
            chunk_overlap, chunk_size
        )));
    }
    Ok(())
}

/// Split text into pieces of at most `chunk_size` characters.
///
/// Whitespace-only input yields no pieces.
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    split_recursive(text, SEPARATORS, chunk_size, chunk_overlap)
}

fn split_recursive(
    text: &str,
    separators: &[&str],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<String> {
    // First separator present in the text; "" always matches.
    let idx = separators
        .iter()
        .position(|s| s.is_empty() || text.contains(s))
        .unwrap_or(separators.len().saturating_sub(1));
    let separator = separators.get(idx).copied().unwrap_or("");
    let finer = separators.get(idx + 1..).unwrap_or(&[]);

    let splits: Vec<&str> = if separator.is_empty() {
        text.char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect()
    } else {
        text.split(separator).filter(|s| !s.is_empty()).collect()
    };

    let mut out = Vec::new();
    let mut fitting: Vec<&str> = Vec::new();
    for piece in splits {
        if char_len(piece) <= chunk_size {
            fitting.push(piece);
            continue;
        }
        if !fitting.is_empty() {
            out.extend(merge_splits(&fitting, separator, chunk_size, chunk_overlap));
            fitting.clear();
        }
        if finer.is_empty() {
            out.push(piece.to_string());
        } else {
            out.extend(split_recursive(piece, finer, chunk_size, chunk_overlap));
        }
    }
    if !fitting.is_empty() {
        out.extend(merge_splits(&fitting, separator, chunk_size, chunk_overlap));
    }
    out
}

/// Greedily pack pieces into chunks, carrying the trailing pieces (up to
/// `chunk_overlap` characters) into the next chunk.
fn merge_splits(
    splits: &[&str],
    separator: &str,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<String> {
    let sep_len = char_len(separator);
    let mut chunks = Vec::new();
    let mut current: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for &piece in splits {
        let len = char_len(piece);
        let joiner = |current: &VecDeque<&str>| if current.is_empty() { 0 } else { sep_len };

        if total + len + joiner(&current) > chunk_size && !current.is_empty() {
            push_joined(&mut chunks, &current, separator);
            while total > chunk_overlap
                || (total > 0 && total + len + joiner(&current) > chunk_size)
            {
                let Some(first) = current.pop_front() else {
                    break;
                };
                total -= char_len(first) + joiner(&current);
            }
        }

        total += len + joiner(&current);
        current.push_back(piece);
    }
    push_joined(&mut chunks, &current, separator);
    chunks
}

fn push_joined(chunks: &mut Vec<String>, pieces: &VecDeque<&str>, separator: &str) {
    let joined = pieces.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn make_chunk(doc: &ExtractedDocument, index: i64, text: String) -> DocumentChunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    DocumentChunk {
        id: Uuid::new_v4().to_string(),
        text,
        source_file: doc.source_file.clone(),
        file_path: doc.file_path.clone(),
        page: doc.page,
        chunk_index: index,
        hash,
    }
}
