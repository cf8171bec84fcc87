//! Directory-backed snapshot store.
//!
//! Layout under the store root:
//!
//! ```text
//! blobs/sha256/<xx>/<sha>   snapshot content as deterministic tar.zst
//! work/<handle>/            working copies (checkouts)
//! tmp/                      staging for atomic renames
//! ```
//!
//! A snapshot's id is the sha256 of its archive. Because the archive
//! normalises timestamps and ownership, committing the same tree twice gives
//! the same id, and concurrent commits of the same content race harmlessly.

use super::{Checkout, SnapshotId, SnapshotStore};
use crate::error::BuildError;
use crate::fsutil::{
    atomic_rename, create_tar_zst, is_hex_64, sha256_file, sharded_blob_path, tmp_name,
    unpack_tar, unpack_tar_zst,
};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Reference resolving to the empty tree.
pub const SCRATCH: &str = "scratch";

#[derive(Debug, Clone)]
pub struct DirSnapshotStore {
    root: PathBuf,
}

impl DirSnapshotStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
        };
        for dir in [store.blobs_dir().join("sha256"), store.work_dir(), store.tmp_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating snapshot store dir '{}'", dir.display()))?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn work_dir(&self) -> PathBuf {
        self.root.join("work")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn blob_path(&self, id: &SnapshotId) -> Result<PathBuf> {
        if !is_hex_64(id.as_str()) {
            bail!("invalid snapshot id: {}", id);
        }
        Ok(sharded_blob_path(&self.blobs_dir(), id.as_str()))
    }

    /// Snapshot the content of a host directory.
    pub fn import_dir(&self, dir: &Path) -> Result<SnapshotId> {
        if !dir.is_dir() {
            bail!("Source directory not found: {}", dir.display());
        }
        let tmp_tar = self.tmp_dir().join(tmp_name("snapshot.tar.zst"));
        create_tar_zst(dir, &tmp_tar)?;
        self.adopt_archive(&tmp_tar)
    }

    /// Move a freshly written archive into the blob store under its hash.
    fn adopt_archive(&self, tmp_tar: &Path) -> Result<SnapshotId> {
        let (sha256, size) = sha256_file(tmp_tar)?;
        let id = SnapshotId::new(sha256);
        let blob_path = self.blob_path(&id)?;
        if blob_path.exists() {
            let _ = fs::remove_file(tmp_tar);
        } else {
            atomic_rename(tmp_tar, &blob_path)?;
        }
        debug!(snapshot = %id.short(), size_bytes = size, "stored snapshot");
        Ok(id)
    }

    fn import_archive(&self, archive: &Path) -> Result<SnapshotId> {
        let staging = self.tmp_dir().join(tmp_name("import"));
        let name = archive.to_string_lossy();
        let unpacked = if name.ends_with(".tar.zst") {
            unpack_tar_zst(archive, &staging)
        } else {
            unpack_tar(archive, &staging)
        };
        let result = unpacked.and_then(|()| self.import_dir(&staging));
        let _ = fs::remove_dir_all(&staging);
        result
    }
}

impl SnapshotStore for DirSnapshotStore {
    fn resolve_base(&self, reference: &str) -> Result<SnapshotId> {
        if reference == SCRATCH {
            let empty = self.tmp_dir().join(tmp_name("scratch"));
            fs::create_dir_all(&empty)?;
            let result = self.import_dir(&empty);
            let _ = fs::remove_dir_all(&empty);
            return result;
        }

        let candidate = SnapshotId::new(reference);
        if is_hex_64(candidate.as_str()) && self.contains(&candidate)? {
            return Ok(candidate);
        }

        let path = Path::new(reference);
        let id = if path.is_dir() {
            self.import_dir(path)?
        } else if path.is_file() {
            self.import_archive(path)?
        } else {
            return Err(BuildError::Configuration(format!(
                "base '{}' is neither a stored snapshot, a directory nor a tar archive",
                reference
            ))
            .into());
        };
        info!(base = reference, snapshot = %id.short(), "imported base snapshot");
        Ok(id)
    }

    fn contains(&self, id: &SnapshotId) -> Result<bool> {
        if !is_hex_64(id.as_str()) {
            return Ok(false);
        }
        Ok(self.blob_path(id)?.is_file())
    }

    fn checkout(&self, id: &SnapshotId) -> Result<Checkout> {
        let blob = self.blob_path(id)?;
        if !blob.is_file() {
            bail!("snapshot {} not found in {}", id, self.root.display());
        }
        let handle = tmp_name(&format!("work-{}", id.short()));
        let root = self.work_dir().join(&handle);
        unpack_tar_zst(&blob, &root).with_context(|| format!("checking out snapshot {}", id))?;
        Ok(Checkout {
            handle,
            root,
            parent: id.clone(),
        })
    }

    fn commit(&self, checkout: &Checkout) -> Result<SnapshotId> {
        self.import_dir(&checkout.root)
            .with_context(|| format!("committing working copy {}", checkout.handle))
    }

    fn release(&self, checkout: &Checkout) -> Result<()> {
        if checkout.root.exists() {
            make_writable(&checkout.root);
            fs::remove_dir_all(&checkout.root).with_context(|| {
                format!("removing working copy '{}'", checkout.root.display())
            })?;
        }
        Ok(())
    }
}

/// Read-only directories inside a checkout would block removal.
#[cfg(unix)]
fn make_writable(root: &Path) {
    use std::os::unix::fs::PermissionsExt;
    for entry in walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        if entry.file_type().is_dir() {
            if let Ok(md) = entry.metadata() {
                let mode = md.permissions().mode();
                if mode & 0o700 != 0o700 {
                    let _ = fs::set_permissions(
                        entry.path(),
                        fs::Permissions::from_mode(mode | 0o700),
                    );
                }
            }
        }
    }
}

#[cfg(not(unix))]
fn make_writable(_root: &Path) {}
