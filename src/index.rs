//! Persistent vector index over document chunks.
//!
//! The index lives in a directory holding a single SQLite database (WAL
//! mode). Every row pairs a chunk's payload with its embedding, tagged with
//! the relative path of the file it came from so that a changed or deleted
//! file can be purged before re-ingestion.
//!
//! All rows written for one file are committed in one transaction, so a
//! concurrent search never observes a vector without its payload or half of a
//! file's replacement.
//!
//! Search is brute-force cosine similarity over every stored vector. Ties are
//! broken by insertion order.

use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::db;
use crate::embedding::{self, blob_to_vec, cosine_similarity, vec_to_blob, Embedder};
use crate::error::{KbError, Result};
use crate::migrate;
use crate::models::{DocumentChunk, ScoredChunk};

const DIMS_KEY: &str = "dims";

pub struct KnowledgeIndex {
    dir: PathBuf,
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl KnowledgeIndex {
    /// An index exists when its directory exists and is non-empty.
    pub fn exists(dir: &Path) -> bool {
        std::fs::read_dir(dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    /// Load the index at `dir`, creating it if needed, and upsert `chunks`.
    ///
    /// Previously stored vectors are kept.
    ///
    /// # Errors
    ///
    /// [`KbError::EmptyIndex`] when no index exists and `chunks` is empty.
    pub async fn open(
        dir: &Path,
        chunks: &[DocumentChunk],
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
    ) -> Result<Self> {
        let existed = Self::exists(dir);
        if !existed && chunks.is_empty() {
            return Err(KbError::EmptyIndex(format!(
                "no index at {} and no documents to create one from",
                dir.display()
            )));
        }

        let pool = db::connect(dir).await?;
        migrate::run_migrations(&pool).await?;

        let index = Self {
            dir: dir.to_path_buf(),
            pool,
            embedder,
            batch_size,
        };

        if existed {
            info!(dir = %dir.display(), "loaded existing index");
        } else {
            info!(dir = %dir.display(), "created new index");
        }

        if !chunks.is_empty() {
            index.upsert(chunks).await?;
        }
        Ok(index)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Embed and store `chunks`, one transaction per source file.
    ///
    /// Chunks whose id is already stored are overwritten in place.
    pub async fn upsert(&self, chunks: &[DocumentChunk]) -> Result<usize> {
        let mut written = 0;
        for (file_path, group) in group_by_file(chunks) {
            written += self.write_file(&file_path, &group, false).await?;
        }
        Ok(written)
    }

    /// Purge every vector of `file_path` and store `chunks` in its place.
    ///
    /// An empty `chunks` leaves the file with no vectors.
    pub async fn replace_file(&self, file_path: &str, chunks: &[DocumentChunk]) -> Result<usize> {
        let owned: Vec<&DocumentChunk> = chunks.iter().collect();
        self.write_file(file_path, &owned, true).await
    }

    /// Purge every vector belonging to the given relative paths.
    pub async fn remove_files(&self, file_paths: &[String]) -> Result<u64> {
        if file_paths.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for path in file_paths {
            removed += sqlx::query("DELETE FROM indexed_vectors WHERE file_path = ?")
                .bind(path)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        debug!(files = file_paths.len(), removed, "purged vectors");
        Ok(removed)
    }

    async fn write_file(
        &self,
        file_path: &str,
        chunks: &[&DocumentChunk],
        purge: bool,
    ) -> Result<usize> {
        // Embed outside the transaction; the service may be slow.
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            embedding::embed_batched(self.embedder.as_ref(), &texts, self.batch_size)
                .await
                .map_err(|e| KbError::ingestion(file_path, e))?
        };

        let mut tx = self.pool.begin().await?;

        let mut dims: Option<usize> =
            sqlx::query_scalar::<_, String>("SELECT value FROM index_meta WHERE key = ?")
                .bind(DIMS_KEY)
                .fetch_optional(&mut *tx)
                .await?
                .and_then(|v| v.parse().ok());

        for vector in &vectors {
            match dims {
                Some(expected) if expected != vector.len() => {
                    return Err(KbError::DimensionMismatch {
                        expected,
                        actual: vector.len(),
                    });
                }
                Some(_) => {}
                None => {
                    sqlx::query("INSERT INTO index_meta (key, value) VALUES (?, ?)")
                        .bind(DIMS_KEY)
                        .bind(vector.len().to_string())
                        .execute(&mut *tx)
                        .await?;
                    dims = Some(vector.len());
                }
            }
        }

        if purge {
            sqlx::query("DELETE FROM indexed_vectors WHERE file_path = ?")
                .bind(file_path)
                .execute(&mut *tx)
                .await?;
        }

        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            sqlx::query(
                r#"
                INSERT INTO indexed_vectors
                    (chunk_id, file_path, source_file, page, chunk_index, text, hash, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    file_path = excluded.file_path,
                    source_file = excluded.source_file,
                    page = excluded.page,
                    chunk_index = excluded.chunk_index,
                    text = excluded.text,
                    hash = excluded.hash,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.file_path)
            .bind(&chunk.source_file)
            .bind(chunk.page.map(i64::from))
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(file = file_path, chunks = chunks.len(), purge, "stored vectors");
        Ok(chunks.len())
    }

    /// Return the `min(k, count)` chunks most similar to `query`.
    ///
    /// Results are ordered by non-increasing score; equal scores keep
    /// insertion order.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_vec = embedding::embed_query(self.embedder.as_ref(), query)
            .await
            .map_err(|e| KbError::Retrieval(format!("failed to embed query: {}", e)))?;

        if let Some(expected) = self.dims().await? {
            if expected != query_vec.len() {
                return Err(KbError::DimensionMismatch {
                    expected,
                    actual: query_vec.len(),
                });
            }
        }

        let rows = sqlx::query(
            r#"
            SELECT chunk_id, file_path, source_file, page, chunk_index, text, hash, embedding
            FROM indexed_vectors
            ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let page: Option<i64> = row.get("page");
                ScoredChunk {
                    score: cosine_similarity(&query_vec, &blob_to_vec(&blob)),
                    chunk: DocumentChunk {
                        id: row.get("chunk_id"),
                        text: row.get("text"),
                        source_file: row.get("source_file"),
                        file_path: row.get("file_path"),
                        page: page.and_then(|p| u32::try_from(p).ok()),
                        chunk_index: row.get("chunk_index"),
                        hash: row.get("hash"),
                    },
                }
            })
            .collect();

        // sort_by is stable, so ties stay in insertion order
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM indexed_vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Vector dimensionality, fixed by the first stored vector.
    pub async fn dims(&self) -> Result<Option<usize>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = ?")
                .bind(DIMS_KEY)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Group chunks by owning file, keeping first-seen file order.
fn group_by_file(chunks: &[DocumentChunk]) -> Vec<(String, Vec<&DocumentChunk>)> {
    let mut groups: Vec<(String, Vec<&DocumentChunk>)> = Vec::new();
    for chunk in chunks {
        match groups.iter_mut().find(|(path, _)| *path == chunk.file_path) {
            Some((_, group)) => group.push(chunk),
            None => groups.push((chunk.file_path.clone(), vec![chunk])),
        }
    }
    groups
}
