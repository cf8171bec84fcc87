//! Snapshot store backed by buildah images.
//!
//! Snapshots are buildah images; a checkout is a working container mounted
//! on the host. Commits pass `--timestamp 0` so image ids depend on content
//! only. Mounting requires root or running under `buildah unshare`.

use super::{Checkout, SnapshotId, SnapshotStore};
use crate::process::Cmd;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct BuildahStore {
    program: String,
}

impl Default for BuildahStore {
    fn default() -> Self {
        Self::new("buildah")
    }
}

impl BuildahStore {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn cmd(&self) -> Cmd {
        Cmd::new(&self.program)
    }

    /// Content id of a local image, or `None` if it is not present.
    fn image_id(&self, reference: &str) -> Result<Option<SnapshotId>> {
        let result = self
            .cmd()
            .args(["inspect", "--type", "image", "--format", "{{.FromImageID}}"])
            .arg(reference)
            .allow_fail()
            .run()?;
        if !result.success() {
            return Ok(None);
        }
        Self::single_line(&result.stdout, "image id").map(|id| Some(SnapshotId::new(id)))
    }

    fn single_line(output: &str, what: &str) -> Result<String> {
        let line = output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .with_context(|| format!("buildah printed no {}", what))?;
        Ok(line.to_string())
    }
}

impl SnapshotStore for BuildahStore {
    fn resolve_base(&self, reference: &str) -> Result<SnapshotId> {
        // Tags move; cache keys must follow the content id behind them.
        if let Some(id) = self.image_id(reference)? {
            debug!(base = reference, snapshot = %id.short(), "base image present");
            return Ok(id);
        }
        self.cmd()
            .args(["pull", "--quiet", reference])
            .error_msg(format!("buildah pull {} failed", reference))
            .run()?;
        let id = self
            .image_id(reference)?
            .with_context(|| format!("pulled '{}' but buildah cannot inspect it", reference))?;
        info!(base = reference, snapshot = %id.short(), "pulled base image");
        Ok(id)
    }

    fn contains(&self, id: &SnapshotId) -> Result<bool> {
        Ok(self.image_id(id.as_str())?.is_some())
    }

    fn checkout(&self, id: &SnapshotId) -> Result<Checkout> {
        let created = self
            .cmd()
            .args(["from", "--quiet", "--pull=never"])
            .arg(id.as_str())
            .error_msg(format!("buildah from {} failed", id.short()))
            .run()?;
        let container = Self::single_line(&created.stdout, "container name")?;

        let mounted = self
            .cmd()
            .args(["mount", &container])
            .error_msg(format!("buildah mount {} failed", container))
            .run();
        let mounted = match mounted {
            Ok(m) => m,
            Err(e) => {
                let _ = self.cmd().args(["rm", &container]).allow_fail().run();
                return Err(e);
            }
        };
        let root = PathBuf::from(Self::single_line(&mounted.stdout, "mount path")?);
        debug!(container = %container, root = %root.display(), "mounted working container");

        Ok(Checkout {
            handle: container,
            root,
            parent: id.clone(),
        })
    }

    fn commit(&self, checkout: &Checkout) -> Result<SnapshotId> {
        let result = self
            .cmd()
            .args(["commit", "--quiet", "--timestamp", "0", &checkout.handle])
            .error_msg(format!("buildah commit {} failed", checkout.handle))
            .run()?;
        let id = Self::single_line(&result.stdout, "image id")?;
        if id.is_empty() {
            bail!("buildah commit returned an empty image id");
        }
        Ok(SnapshotId::new(id))
    }

    fn release(&self, checkout: &Checkout) -> Result<()> {
        self.cmd()
            .args(["umount", &checkout.handle])
            .allow_fail()
            .run()?;
        self.cmd()
            .args(["rm", &checkout.handle])
            .error_msg(format!("buildah rm {} failed", checkout.handle))
            .run()?;
        Ok(())
    }

    fn preserves_ownership(&self) -> bool {
        true
    }
}
