//! Content fingerprint tracking for the watched knowledge directory.
//!
//! A [`TrackingManifest`] persisted as JSON records, for every supported file,
//! its size, modification time, and SHA-256 content hash. [`scan`] walks the
//! directory, diffs it against the manifest, and rewrites the manifest
//! wholesale. Change detection is by content hash only, so touching a file
//! without changing its bytes does not trigger re-ingestion.
//!
//! Scans of one directory must not interleave their manifest writes;
//! [`Tracker`] serializes them behind a lock.

use chrono::Utc;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{KbError, Result};

/// File extensions picked up from the watched directory.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "txt", "csv", "xlsx", "xls", "md", "markdown"];

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Manifest entry for one ingested file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackedFile {
    #[serde(default)]
    pub size: u64,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub modified_time: f64,
    /// Hex SHA-256 of the full file content.
    #[serde(default)]
    pub hash: String,
    /// RFC 3339 timestamp of the scan that recorded this entry.
    #[serde(default)]
    pub last_processed: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingManifest {
    #[serde(default)]
    pub files: BTreeMap<String, TrackedFile>,
    #[serde(default)]
    pub last_update: String,
}

/// Result of one scan. Paths are relative to the watched directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanOutcome {
    /// New or content-changed files.
    pub changed: Vec<String>,
    /// Previously tracked files no longer on disk.
    pub removed: Vec<String>,
}

impl ScanOutcome {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Serialized access to one watched directory and its manifest.
pub struct Tracker {
    root: PathBuf,
    manifest_path: PathBuf,
    lock: Mutex<()>,
}

impl Tracker {
    pub fn new(root: impl Into<PathBuf>, manifest_path: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            manifest_path: manifest_path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn scan(&self) -> Result<ScanOutcome> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        scan(&self.root, &self.manifest_path)
    }

    /// Drop manifest entries so the next scan reports these paths as new.
    ///
    /// Used when a file was detected as changed but could not be ingested.
    pub fn forget(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut manifest = load_manifest(&self.manifest_path);
        for p in paths {
            manifest.files.remove(p);
        }
        save_manifest(&mut manifest, &self.manifest_path)
    }

    pub fn manifest(&self) -> TrackingManifest {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        load_manifest(&self.manifest_path)
    }
}

/// Diff `watched_dir` against the manifest at `manifest_path` and persist the
/// updated manifest.
///
/// Files that cannot be read are logged and skipped: a new unreadable file
/// stays untracked and an already tracked one keeps its previous entry.
pub fn scan(watched_dir: &Path, manifest_path: &Path) -> Result<ScanOutcome> {
    if !watched_dir.is_dir() {
        return Err(KbError::InvalidInput(format!(
            "watched directory does not exist: {}",
            watched_dir.display()
        )));
    }

    let mut manifest = load_manifest(manifest_path);
    let mut outcome = ScanOutcome::default();
    let mut present = BTreeSet::new();

    for (path, rel) in list_supported_files(watched_dir)? {
        present.insert(rel.clone());

        let hash = match hash_file(&path) {
            Ok(h) => h,
            Err(e) => {
                warn!(path = %rel, error = %e, "skipping unreadable file");
                continue;
            }
        };

        let status = match manifest.files.get(&rel) {
            None => "new",
            Some(entry) if entry.hash != hash => "changed",
            Some(_) => continue,
        };

        match file_metadata(&path, hash) {
            Ok(entry) => {
                info!(path = %rel, status, "detected file change");
                manifest.files.insert(rel.clone(), entry);
                outcome.changed.push(rel);
            }
            Err(e) => warn!(path = %rel, error = %e, "skipping file with unreadable metadata"),
        }
    }

    let gone: Vec<String> = manifest
        .files
        .keys()
        .filter(|k| !present.contains(*k))
        .cloned()
        .collect();
    for rel in gone {
        info!(path = %rel, "tracked file deleted");
        manifest.files.remove(&rel);
        outcome.removed.push(rel);
    }

    save_manifest(&mut manifest, manifest_path)?;
    debug!(
        changed = outcome.changed.len(),
        removed = outcome.removed.len(),
        tracked = manifest.files.len(),
        "scan complete"
    );
    Ok(outcome)
}

/// All supported, non-hidden files below `root` as `(absolute, relative)`
/// pairs, in file-name order. Relative paths always use `/`.
pub fn list_supported_files(root: &Path) -> Result<Vec<(PathBuf, String)>> {
    let include = supported_globset()?;
    let mut out = Vec::new();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = relative_key(root, entry.path());
        if include.is_match(&rel) {
            out.push((entry.path().to_path_buf(), rel));
        }
    }
    Ok(out)
}

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .is_some_and(|e| SUPPORTED_EXTENSIONS.contains(&e.as_str()))
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn supported_globset() -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for ext in SUPPORTED_EXTENSIONS {
        let glob = GlobBuilder::new(&format!("**/*.{}", ext))
            .case_insensitive(true)
            .build()
            .map_err(|e| KbError::Config(e.to_string()))?;
        builder.add(glob);
    }
    builder.build().map_err(|e| KbError::Config(e.to_string()))
}

/// Hex SHA-256 of the file's full content.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn file_metadata(path: &Path, hash: String) -> std::io::Result<TrackedFile> {
    let metadata = std::fs::metadata(path)?;
    let modified_time = metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();

    Ok(TrackedFile {
        size: metadata.len(),
        modified_time,
        hash,
        last_processed: Utc::now().to_rfc3339(),
    })
}

/// Load the manifest, falling back to an empty one when it is missing or
/// unreadable.
pub fn load_manifest(path: &Path) -> TrackingManifest {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return TrackingManifest::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read manifest, starting fresh");
            return TrackingManifest::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse manifest, starting fresh");
            TrackingManifest::default()
        }
    }
}

/// Write the manifest atomically (temp file + rename), stamping `last_update`.
pub fn save_manifest(manifest: &mut TrackingManifest, path: &Path) -> Result<()> {
    manifest.last_update = Utc::now().to_rfc3339();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(manifest)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
