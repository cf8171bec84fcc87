//! Content-addressed build cache.
//!
//! Maps a deterministic [`CacheKey`] to what a previous build produced for
//! it: the resulting snapshot of a step, or an artifact file (packed
//! squashfs, bootloader images).
//!
//! ```text
//! <root>/index/steps/<key>.json           step key -> snapshot id
//! <root>/index/artifacts/<kind>/<key>.json artifact key -> blob
//! <root>/blobs/sha256/<xx>/<sha>          artifact bytes
//! <root>/tmp/                             staging for atomic renames
//! ```
//!
//! Every write lands in `tmp/` first and is renamed into place, so readers
//! never see a partial entry and concurrent writers of the same key are
//! idempotent (content is deterministic; last rename wins). Entries that fail
//! to parse or whose blob no longer matches its hash are reported as
//! [`BuildError::Cache`] in the log and treated as misses.

use crate::error::BuildError;
use crate::fsutil::{atomic_rename, is_hex_64, now_unix, sha256_file, sharded_blob_path, tmp_name};
use crate::snapshot::SnapshotId;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Fixed-width (sha256, hex) cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Finish a hasher into a key.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Hash a domain tag plus length-prefixed parts.
    ///
    /// Length prefixes keep `["ab", "c"]` and `["a", "bc"]` apart.
    pub fn derive(domain: &str, parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain.as_bytes());
        hasher.update([0u8]);
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self::from_hasher(hasher)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cached result of one pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEntry {
    pub key: CacheKey,
    pub parent: SnapshotId,
    pub snapshot: SnapshotId,
    pub step_kind: String,
    pub stored_at_unix: u64,
}

/// Index entry mapping an artifact key to a content-addressed blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub kind: String,
    pub key: CacheKey,
    pub blob_sha256: String,
    pub size_bytes: u64,
    pub stored_at_unix: u64,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
}

/// A stored artifact resolved from the index.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub entry: ArtifactEntry,
    pub blob_path: PathBuf,
}

/// Basic cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStatus {
    pub root: PathBuf,
    pub step_entries: u64,
    pub artifact_entries: u64,
    pub referenced_blobs: u64,
    pub referenced_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ContentCache {
    root: PathBuf,
}

impl ContentCache {
    /// Open (and create if needed) the cache at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let cache = Self {
            root: root.to_path_buf(),
        };
        for dir in [
            cache.steps_dir(),
            cache.artifacts_dir(),
            cache.blobs_dir().join("sha256"),
            cache.tmp_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating cache dir '{}'", dir.display()))?;
        }
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn steps_dir(&self) -> PathBuf {
        self.root.join("index").join("steps")
    }

    fn artifacts_dir(&self) -> PathBuf {
        self.root.join("index").join("artifacts")
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn step_path(&self, key: &CacheKey) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.steps_dir().join(format!("{}.json", key)))
    }

    fn artifact_path(&self, kind: &str, key: &CacheKey) -> Result<PathBuf> {
        validate_kind(kind)?;
        validate_key(key)?;
        Ok(self.artifacts_dir().join(kind).join(format!("{}.json", key)))
    }

    /// Look up a step result. Unreadable entries are misses.
    pub fn lookup_step(&self, key: &CacheKey) -> Option<StepEntry> {
        let path = self.step_path(key).ok()?;
        let entry: StepEntry = self.read_entry(&path)?;
        if entry.key != *key {
            self.report_corrupt(&path, "entry key does not match its file name");
            return None;
        }
        Some(entry)
    }

    /// Record a step result.
    pub fn record_step(&self, entry: &StepEntry) -> Result<()> {
        let path = self.step_path(&entry.key)?;
        self.write_json(&path, entry)
    }

    /// Build a step entry stamped with the current time.
    pub fn step_entry(
        key: CacheKey,
        parent: SnapshotId,
        snapshot: SnapshotId,
        step_kind: &str,
    ) -> StepEntry {
        StepEntry {
            key,
            parent,
            snapshot,
            step_kind: step_kind.to_string(),
            stored_at_unix: now_unix(),
        }
    }

    /// Get an artifact if present and intact.
    pub fn get_artifact(&self, kind: &str, key: &CacheKey) -> Option<StoredArtifact> {
        let path = self.artifact_path(kind, key).ok()?;
        let entry: ArtifactEntry = self.read_entry(&path)?;
        if !is_hex_64(&entry.blob_sha256) {
            self.report_corrupt(&path, "invalid blob hash");
            return None;
        }
        let blob_path = sharded_blob_path(&self.blobs_dir(), &entry.blob_sha256);
        match sha256_file(&blob_path) {
            Ok((actual, _)) if actual == entry.blob_sha256 => {}
            Ok((actual, _)) => {
                self.report_corrupt(
                    &blob_path,
                    &format!("blob hash mismatch (expected {}, actual {})", entry.blob_sha256, actual),
                );
                return None;
            }
            Err(e) => {
                self.report_corrupt(&blob_path, &format!("blob unreadable: {e}"));
                return None;
            }
        }
        Some(StoredArtifact { entry, blob_path })
    }

    /// Store a file artifact as a blob and index it under (kind, key).
    pub fn put_artifact_file(
        &self,
        kind: &str,
        key: &CacheKey,
        src_file: &Path,
        mut meta: BTreeMap<String, serde_json::Value>,
    ) -> Result<String> {
        if !src_file.is_file() {
            bail!("Source file not found: {}", src_file.display());
        }
        let index_path = self.artifact_path(kind, key)?;

        let (sha256, size_bytes) = sha256_file(src_file)?;
        let blob_path = sharded_blob_path(&self.blobs_dir(), &sha256);
        if !blob_path.exists() {
            let tmp = self
                .tmp_dir()
                .join(tmp_name(&format!("blob-{}", &sha256[..16])));
            fs::copy(src_file, &tmp).with_context(|| {
                format!("Failed to copy {} to {}", src_file.display(), tmp.display())
            })?;
            atomic_rename(&tmp, &blob_path)?;
        }

        meta.insert(
            "source_path".to_string(),
            serde_json::Value::String(src_file.display().to_string()),
        );

        let entry = ArtifactEntry {
            kind: kind.to_string(),
            key: key.clone(),
            blob_sha256: sha256.clone(),
            size_bytes,
            stored_at_unix: now_unix(),
            meta,
        };
        self.write_json(&index_path, &entry)?;
        debug!(kind, key = %key.short(), size_bytes, "stored artifact");
        Ok(sha256)
    }

    /// Copy a cached artifact to `dest`. Returns `false` on a miss.
    pub fn restore_artifact(&self, kind: &str, key: &CacheKey, dest: &Path) -> Result<bool> {
        let Some(stored) = self.get_artifact(kind, key) else {
            return Ok(false);
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = dest.with_extension(tmp_name("restore"));
        fs::copy(&stored.blob_path, &tmp).with_context(|| {
            format!(
                "Failed to copy blob {} to {}",
                stored.blob_path.display(),
                tmp.display()
            )
        })?;
        atomic_rename(&tmp, dest)?;
        Ok(true)
    }

    /// Remove blobs not referenced by any artifact entry.
    pub fn gc(&self) -> Result<usize> {
        let referenced = self.collect_referenced_blobs();
        let blobs_root = self.blobs_dir().join("sha256");

        let mut removed = 0usize;
        for ent in WalkDir::new(&blobs_root).into_iter().filter_map(Result::ok) {
            if !ent.file_type().is_file() {
                continue;
            }
            let name = ent.file_name().to_string_lossy().to_string();
            if !is_hex_64(&name) || referenced.contains(&name) {
                continue;
            }
            fs::remove_file(ent.path()).with_context(|| {
                format!("Failed to remove unreferenced blob {}", ent.path().display())
            })?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn status(&self) -> Result<CacheStatus> {
        let referenced = self.collect_referenced_blobs();
        let mut referenced_bytes = 0u64;
        let mut referenced_blobs = 0u64;
        for sha in &referenced {
            if let Ok(md) = fs::metadata(sharded_blob_path(&self.blobs_dir(), sha)) {
                referenced_blobs += 1;
                referenced_bytes += md.len();
            }
        }

        Ok(CacheStatus {
            root: self.root.clone(),
            step_entries: count_json(&self.steps_dir()),
            artifact_entries: count_json(&self.artifacts_dir()),
            referenced_blobs,
            referenced_bytes,
        })
    }

    fn collect_referenced_blobs(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for ent in WalkDir::new(self.artifacts_dir())
            .into_iter()
            .filter_map(Result::ok)
        {
            if !is_json_file(&ent) {
                continue;
            }
            let Ok(bytes) = fs::read(ent.path()) else {
                continue;
            };
            let Ok(entry) = serde_json::from_slice::<ArtifactEntry>(&bytes) else {
                continue;
            };
            if is_hex_64(&entry.blob_sha256) {
                out.insert(entry.blob_sha256);
            }
        }
        out
    }

    fn read_entry<T: for<'de> Deserialize<'de>>(&self, path: &Path) -> Option<T> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                self.report_corrupt(path, &format!("unreadable: {e}"));
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                self.report_corrupt(path, &format!("unparsable: {e}"));
                None
            }
        }
    }

    fn report_corrupt(&self, path: &Path, detail: &str) {
        let err = BuildError::Cache(format!("{}: {}", path.display(), detail));
        warn!(code = err.code(), error = %err, "ignoring cache entry, treating as miss");
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = self.tmp_dir().join(tmp_name("index.json"));
        fs::write(&tmp, bytes)?;
        atomic_rename(&tmp, path)
    }
}

fn is_json_file(ent: &walkdir::DirEntry) -> bool {
    ent.file_type().is_file() && ent.path().extension().and_then(|s| s.to_str()) == Some("json")
}

fn count_json(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(is_json_file)
        .count() as u64
}

fn validate_kind(kind: &str) -> Result<()> {
    if kind.is_empty() {
        bail!("artifact kind must not be empty");
    }
    if kind.contains('/') || kind.contains('\\') || kind.contains("..") {
        bail!("artifact kind must be a safe filename segment: {kind}");
    }
    Ok(())
}

fn validate_key(key: &CacheKey) -> Result<()> {
    if !is_hex_64(key.as_str()) {
        bail!("invalid cache key: {key}");
    }
    Ok(())
}
