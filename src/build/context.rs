//! Collaborators shared by every build.

use crate::cache::ContentCache;
use crate::engine::StepEngine;
use crate::snapshot::SnapshotStore;
use crate::step::command::CommandRunner;
use crate::step::packages::PackageManager;
use std::path::{Path, PathBuf};

/// Everything a build needs besides the recipe itself.
pub struct BuildContext<'a> {
    pub store: &'a dyn SnapshotStore,
    pub cache: &'a ContentCache,
    pub packages: &'a dyn PackageManager,
    pub runner: &'a dyn CommandRunner,
    /// Parent of the per-image output directories.
    pub output: PathBuf,
}

impl<'a> BuildContext<'a> {
    pub fn new(
        store: &'a dyn SnapshotStore,
        cache: &'a ContentCache,
        packages: &'a dyn PackageManager,
        runner: &'a dyn CommandRunner,
        output: &Path,
    ) -> Self {
        Self {
            store,
            cache,
            packages,
            runner,
            output: output.to_path_buf(),
        }
    }

    pub fn engine(&self) -> StepEngine<'a> {
        StepEngine::new(self.store, self.cache, self.packages, self.runner)
    }

    /// `<output>/<name>`
    pub fn output_dir(&self, name: &str) -> PathBuf {
        self.output.join(name)
    }
}
