//! Knowledge base orchestration.
//!
//! [`KnowledgeBase`] owns every long-lived piece of state: the fingerprint
//! tracker, the extractor registry, the index handle, the session store and
//! the external service clients. The HTTP server and the CLI are thin layers
//! over its methods.
//!
//! # Ingestion flow
//!
//! ```text
//! scan ──► changed paths ──► extract ──► chunk ──► index.replace_file (per file)
//!      └─► removed paths ─────────────────────────► index.remove_files
//! ```
//!
//! A file that fails extraction or embedding is dropped from the manifest so
//! the next scan retries it. When a run aborts part way, every changed file
//! that was not written is dropped as well. Scans and ingestion runs are
//! serialized together and run their disk work on the blocking pool; queries
//! proceed concurrently against the current index handle.

use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::answer::{AnswerPipeline, EventStream};
use crate::chunk::chunk_documents;
use crate::config::Config;
use crate::embedding::{self, Embedder};
use crate::error::{KbError, Result};
use crate::extract::ExtractorSet;
use crate::generation::{self, Generator};
use crate::index::KnowledgeIndex;
use crate::models::{Answer, DocumentChunk, FileEntry, Message};
use crate::retriever::Retriever;
use crate::session::SessionStore;
use crate::tracker::{self, ScanOutcome, Tracker};

/// Summary of one ingestion run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Files reported new or changed by the scan.
    pub changed: usize,
    /// Tracked files that disappeared from disk.
    pub removed: usize,
    /// Files whose vectors were (re)written.
    pub ingested: usize,
    /// Chunks stored across all ingested files.
    pub chunks: usize,
    /// Files that could not be ingested and will be retried.
    pub failed: Vec<String>,
}

pub struct KnowledgeBase {
    config: Config,
    tracker: Arc<Tracker>,
    extractors: ExtractorSet,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    sessions: Arc<SessionStore>,
    index: RwLock<Option<Arc<KnowledgeIndex>>>,
    ingest_lock: Mutex<()>,
}

impl KnowledgeBase {
    /// Build a knowledge base using the providers named in `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let embedder = embedding::create_provider(&config.embedding)?;
        let generator = generation::create_generator(&config.generation)?;
        Ok(Self::new(config, embedder, generator)?)
    }

    pub fn new(
        config: Config,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.paths.knowledge_dir)?;
        let tracker = Arc::new(Tracker::new(
            config.paths.knowledge_dir.clone(),
            config.paths.manifest_path.clone(),
        ));
        let sessions = Arc::new(SessionStore::new(config.session.history_limit));

        Ok(Self {
            config,
            tracker,
            extractors: ExtractorSet::with_builtins(),
            embedder,
            generator,
            sessions,
            index: RwLock::new(None),
            ingest_lock: Mutex::new(()),
        })
    }

    /// Replace the extractor registry (e.g. to add a custom format).
    pub fn with_extractors(mut self, extractors: ExtractorSet) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Startup sequence: ingest whatever changed since the last run.
    ///
    /// When nothing changed but no index exists (e.g. it was deleted), every
    /// supported file is ingested again.
    pub async fn initialize(&self) -> Result<SyncReport> {
        let report = {
            let _guard = self.ingest_lock.lock().await;
            let outcome = self.scan().await?;
            if outcome.is_empty() && !KnowledgeIndex::exists(&self.config.paths.index_dir) {
                let root = self.tracker.root().to_path_buf();
                let all: Vec<String> = blocking(move || tracker::list_supported_files(&root))
                    .await?
                    .into_iter()
                    .map(|(_, rel)| rel)
                    .collect();
                info!(files = all.len(), "no index found, ingesting all files");
                self.ingest_locked(&ScanOutcome {
                    changed: all,
                    removed: Vec::new(),
                })
                .await?
            } else {
                self.ingest_locked(&outcome).await?
            }
        };

        if self.index.read().await.is_none() {
            self.reload().await?;
        }
        Ok(report)
    }

    /// Scan the watched directory and ingest the difference.
    ///
    /// Concurrent calls queue behind each other, so every change is seen by
    /// exactly one of them.
    pub async fn sync(&self) -> Result<SyncReport> {
        let _guard = self.ingest_lock.lock().await;
        let outcome = self.scan().await?;
        self.ingest_locked(&outcome).await
    }

    /// Re-embed `outcome.changed` and purge `outcome.removed`.
    pub async fn ingest(&self, outcome: &ScanOutcome) -> Result<SyncReport> {
        let _guard = self.ingest_lock.lock().await;
        self.ingest_locked(outcome).await
    }

    async fn scan(&self) -> Result<ScanOutcome> {
        let tracker = Arc::clone(&self.tracker);
        blocking(move || tracker.scan()).await
    }

    async fn forget(&self, paths: Vec<String>) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let tracker = Arc::clone(&self.tracker);
        blocking(move || tracker.forget(&paths)).await
    }

    /// Caller holds `ingest_lock`.
    async fn ingest_locked(&self, outcome: &ScanOutcome) -> Result<SyncReport> {
        let mut report = SyncReport {
            changed: outcome.changed.len(),
            removed: outcome.removed.len(),
            ..SyncReport::default()
        };
        if outcome.is_empty() {
            return Ok(report);
        }

        let mut written = HashSet::new();
        if let Err(e) = self.write_changes(outcome, &mut report, &mut written).await {
            let pending: Vec<String> = outcome
                .changed
                .iter()
                .filter(|p| !written.contains(*p))
                .cloned()
                .collect();
            warn!(error = %e, pending = pending.len(), "ingestion aborted");
            if let Err(forget_err) = self.forget(pending).await {
                warn!(error = %forget_err, "failed to reset manifest after aborted ingestion");
            }
            return Err(e);
        }

        self.forget(report.failed.clone()).await?;

        info!(
            changed = report.changed,
            removed = report.removed,
            ingested = report.ingested,
            chunks = report.chunks,
            failed = report.failed.len(),
            "ingestion complete"
        );
        Ok(report)
    }

    async fn write_changes(
        &self,
        outcome: &ScanOutcome,
        report: &mut SyncReport,
        written: &mut HashSet<String>,
    ) -> Result<()> {
        let extractors = self.extractors.clone();
        let root = self.tracker.root().to_path_buf();
        let changed = outcome.changed.clone();
        let (docs, extract_failures) =
            match tokio::task::spawn_blocking(move || extractors.extract(&root, &changed)).await {
                Ok(extracted) => extracted,
                Err(e) => {
                    warn!(error = %e, "extraction task failed");
                    report.failed.extend(outcome.changed.iter().cloned());
                    (Vec::new(), Vec::new())
                }
            };
        report
            .failed
            .extend(extract_failures.into_iter().map(|(path, _)| path));

        let chunks = chunk_documents(
            &docs,
            self.config.chunking.chunk_size,
            self.config.chunking.chunk_overlap,
        )?;

        let mut index = self.current_index().await?;

        for path in &outcome.changed {
            if report.failed.contains(path) {
                continue;
            }
            let file_chunks: Vec<DocumentChunk> = chunks
                .iter()
                .filter(|c| &c.file_path == path)
                .cloned()
                .collect();

            let result = match index.clone() {
                Some(idx) => idx.replace_file(path, &file_chunks).await,
                None if file_chunks.is_empty() => Ok(0),
                None => match self.open_index(&file_chunks).await {
                    Ok(idx) => {
                        *self.index.write().await = Some(Arc::clone(&idx));
                        index = Some(idx);
                        Ok(file_chunks.len())
                    }
                    Err(e) => Err(e),
                },
            };

            match result {
                Ok(n) => {
                    written.insert(path.clone());
                    report.ingested += 1;
                    report.chunks += n;
                }
                Err(e @ (KbError::Ingestion { .. } | KbError::DimensionMismatch { .. })) => {
                    warn!(path = %path, error = %e, "failed to index file");
                    report.failed.push(path.clone());
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(idx) = &index {
            idx.remove_files(&outcome.removed).await?;
        }
        Ok(())
    }

    async fn open_index(&self, chunks: &[DocumentChunk]) -> Result<Arc<KnowledgeIndex>> {
        let index = KnowledgeIndex::open(
            &self.config.paths.index_dir,
            chunks,
            Arc::clone(&self.embedder),
            self.config.embedding.batch_size,
        )
        .await?;
        Ok(Arc::new(index))
    }

    /// The in-memory handle, or the on-disk index if one exists.
    async fn current_index(&self) -> Result<Option<Arc<KnowledgeIndex>>> {
        if let Some(index) = self.index.read().await.as_ref() {
            return Ok(Some(Arc::clone(index)));
        }
        let mut slot = self.index.write().await;
        if slot.is_none() && KnowledgeIndex::exists(&self.config.paths.index_dir) {
            *slot = Some(self.open_index(&[]).await?);
        }
        Ok(slot.clone())
    }

    /// Reopen the index from disk. Returns whether an index is loaded.
    pub async fn reload(&self) -> Result<bool> {
        let index = if KnowledgeIndex::exists(&self.config.paths.index_dir) {
            Some(self.open_index(&[]).await?)
        } else {
            None
        };
        let loaded = index.is_some();
        *self.index.write().await = index;
        Ok(loaded)
    }

    /// Number of stored vectors, zero when no index exists.
    pub async fn indexed_chunks(&self) -> Result<i64> {
        match self.current_index().await? {
            Some(index) => index.count().await,
            None => Ok(0),
        }
    }

    async fn pipeline(&self) -> Result<AnswerPipeline> {
        let index = self.current_index().await?.ok_or_else(|| {
            KbError::EmptyIndex("no documents have been ingested yet".to_string())
        })?;
        Ok(AnswerPipeline::new(
            Retriever::new(index, self.config.retrieval.top_k),
            Arc::clone(&self.generator),
            Arc::clone(&self.sessions),
        ))
    }

    pub async fn query(&self, question: &str, session_id: &str) -> Result<Answer> {
        self.pipeline().await?.answer(question, session_id).await
    }

    pub async fn stream_query(&self, question: &str, session_id: &str) -> Result<EventStream> {
        self.pipeline().await?.stream(question, session_id).await
    }

    pub async fn history(&self, session_id: &str) -> Vec<Message> {
        self.sessions.get(session_id).await
    }

    pub async fn clear_history(&self, session_id: &str) {
        self.sessions.clear(session_id).await
    }

    /// Supported files in the watched directory with size and type.
    pub fn list_files(&self) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        for (path, rel) in tracker::list_supported_files(self.tracker.root())? {
            let size = std::fs::metadata(&path)?.len();
            let file_type = path
                .extension()
                .map(|e| e.to_string_lossy().to_uppercase())
                .unwrap_or_default();
            entries.push(FileEntry {
                name: rel,
                size_kb: (size as f64 / 1024.0 * 100.0).round() / 100.0,
                file_type,
            });
        }
        Ok(entries)
    }

    /// Store an uploaded file in the watched directory and ingest it.
    ///
    /// Returns the stored name and the ingestion report.
    pub async fn upload_file(&self, name: &str, bytes: &[u8]) -> Result<(String, SyncReport)> {
        let name = sanitize_filename(name)?;
        let path = self.tracker.root().join(&name);
        tokio::fs::write(&path, bytes).await?;
        info!(file = %name, bytes = bytes.len(), "stored uploaded file");
        let report = self.sync().await?;
        Ok((name, report))
    }

    /// Resolve a listed file name to its path for download.
    pub fn resolve_file(&self, name: &str) -> Result<PathBuf> {
        let path = resolve_within(self.tracker.root(), name)?;
        if !path.is_file() || !tracker::is_supported(&path) {
            return Err(KbError::InvalidInput(format!("no such file: {}", name)));
        }
        Ok(path)
    }
}

/// Run synchronous disk work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KbError::Io(std::io::Error::other(e)))?
}

/// Reduce an uploaded name to a safe, supported base name.
pub fn sanitize_filename(name: &str) -> Result<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();

    if cleaned.is_empty() {
        return Err(KbError::InvalidInput(format!("invalid file name: {:?}", name)));
    }
    if !tracker::is_supported(Path::new(&cleaned)) {
        return Err(KbError::InvalidInput(format!(
            "unsupported file type: {} (supported: {})",
            cleaned,
            tracker::SUPPORTED_EXTENSIONS.join(", ")
        )));
    }
    Ok(cleaned)
}

/// Join a `/`-separated relative name onto `root`, refusing any component
/// that could escape it or name a hidden entry.
fn resolve_within(root: &Path, name: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for part in name.split('/') {
        if part.is_empty() || part.starts_with('.') || part.contains('\\') {
            return Err(KbError::InvalidInput(format!("invalid file name: {:?}", name)));
        }
        path.push(part);
    }
    Ok(path)
}
