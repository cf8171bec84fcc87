//! Content-identified filesystem snapshots.
//!
//! A snapshot is an immutable filesystem tree named by a content hash. Steps
//! never modify a snapshot in place: they check out a working copy, change
//! it, and commit a new snapshot.
//!
//! Two backends implement [`SnapshotStore`]:
//! - [`dir::DirSnapshotStore`] keeps snapshots as deterministic `tar.zst`
//!   blobs under a local directory (rootless, used by tests too)
//! - [`buildah::BuildahStore`] drives `buildah` containers and images

pub mod buildah;
pub mod dir;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Content hash identifying a snapshot ("image id").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let id = id.strip_prefix("sha256:").map(str::to_string).unwrap_or(id);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log output.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A writable working copy of a snapshot.
#[derive(Debug, Clone)]
pub struct Checkout {
    /// Backend handle (container name, work directory name).
    pub handle: String,
    /// Host path of the working copy's root directory.
    pub root: PathBuf,
    /// Snapshot the working copy was created from.
    pub parent: SnapshotId,
}

/// Storage backend for snapshots.
///
/// Implementations must make `commit` deterministic: identical tree content
/// yields an identical id (timestamps and ownership normalised).
pub trait SnapshotStore: Send + Sync {
    /// Resolve a base reference (image name, directory, archive or existing
    /// id) to a snapshot id, importing it if needed.
    fn resolve_base(&self, reference: &str) -> Result<SnapshotId>;

    /// Whether the snapshot is present in the store.
    fn contains(&self, id: &SnapshotId) -> Result<bool>;

    /// Materialize a writable working copy of `id`.
    fn checkout(&self, id: &SnapshotId) -> Result<Checkout>;

    /// Commit the working copy's current content as a new snapshot.
    fn commit(&self, checkout: &Checkout) -> Result<SnapshotId>;

    /// Release a working copy (unmount, delete working container/directory).
    fn release(&self, checkout: &Checkout) -> Result<()>;

    /// Whether working copies keep in-image file ownership. When they do
    /// not (a rootless store owns every file itself), packing maps all files
    /// to root.
    fn preserves_ownership(&self) -> bool {
        false
    }
}

/// Scoped working mount of a snapshot.
///
/// The working copy is released when the guard is dropped, on every exit
/// path including step failure. Use [`Mount::release`] to observe release
/// errors on the success path.
pub struct Mount<'a> {
    store: &'a dyn SnapshotStore,
    checkout: Checkout,
    released: bool,
}

impl<'a> Mount<'a> {
    pub fn open(store: &'a dyn SnapshotStore, id: &SnapshotId) -> Result<Self> {
        let checkout = store.checkout(id)?;
        debug!(snapshot = %id.short(), handle = %checkout.handle, "mounted snapshot");
        Ok(Self {
            store,
            checkout,
            released: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.checkout.root
    }

    pub fn checkout(&self) -> &Checkout {
        &self.checkout
    }

    pub fn commit(&self) -> Result<SnapshotId> {
        self.store.commit(&self.checkout)
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.store.release(&self.checkout)
    }
}

impl Drop for Mount<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.store.release(&self.checkout) {
            warn!(
                handle = %self.checkout.handle,
                error = %e,
                "failed to release snapshot mount"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        released: Mutex<Vec<String>>,
    }

    impl SnapshotStore for RecordingStore {
        fn resolve_base(&self, reference: &str) -> Result<SnapshotId> {
            Ok(SnapshotId::new(reference))
        }

        fn contains(&self, _id: &SnapshotId) -> Result<bool> {
            Ok(true)
        }

        fn checkout(&self, id: &SnapshotId) -> Result<Checkout> {
            Ok(Checkout {
                handle: format!("work-{}", id),
                root: PathBuf::from("/nonexistent"),
                parent: id.clone(),
            })
        }

        fn commit(&self, _checkout: &Checkout) -> Result<SnapshotId> {
            Ok(SnapshotId::new("committed"))
        }

        fn release(&self, checkout: &Checkout) -> Result<()> {
            self.released.lock().unwrap().push(checkout.handle.clone());
            Ok(())
        }
    }

    #[test]
    fn snapshot_id_strips_digest_prefix() {
        let id = SnapshotId::new("sha256:abcdef0123456789");
        assert_eq!(id.as_str(), "abcdef0123456789");
        assert_eq!(id.short(), "abcdef012345");
    }

    #[test]
    fn mount_released_on_drop() {
        let store = RecordingStore::default();
        {
            let _mount = Mount::open(&store, &SnapshotId::new("base")).unwrap();
        }
        assert_eq!(*store.released.lock().unwrap(), vec!["work-base"]);
    }

    #[test]
    fn mount_released_once_when_explicit() {
        let store = RecordingStore::default();
        let mount = Mount::open(&store, &SnapshotId::new("base")).unwrap();
        mount.release().unwrap();
        assert_eq!(store.released.lock().unwrap().len(), 1);
    }

    #[test]
    fn mount_released_on_error_path() {
        fn failing_step(store: &dyn SnapshotStore) -> Result<()> {
            let _mount = Mount::open(store, &SnapshotId::new("base"))?;
            anyhow::bail!("step failed")
        }

        let store = RecordingStore::default();
        assert!(failing_step(&store).is_err());
        assert_eq!(store.released.lock().unwrap().len(), 1);
    }
}
