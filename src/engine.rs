//! Ordered, cached step execution.
//!
//! For every step the engine derives a cache key from the current snapshot
//! and the step's parameters. A hit adopts the cached snapshot without
//! touching the store; a miss checks out a working copy, applies the step,
//! commits a new snapshot and records it. Intermediate snapshots committed
//! before a failure stay in the cache, so the next run resumes from there.

use crate::cache::{CacheKey, ContentCache};
use crate::error::BuildError;
use crate::snapshot::{Mount, SnapshotId, SnapshotStore};
use crate::step::command::CommandRunner;
use crate::step::packages::PackageManager;
use crate::step::{files, Step};
use anyhow::{Context, Result};
use std::time::Instant;
use tracing::{debug, info};

/// What happened to one step.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub index: usize,
    pub kind: &'static str,
    pub key: CacheKey,
    pub snapshot: SnapshotId,
    pub cached: bool,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub snapshot: SnapshotId,
    pub records: Vec<StepRecord>,
}

impl BuildOutcome {
    pub fn executed(&self) -> usize {
        self.records.iter().filter(|r| !r.cached).count()
    }

    pub fn reused(&self) -> usize {
        self.records.iter().filter(|r| r.cached).count()
    }
}

pub struct StepEngine<'a> {
    store: &'a dyn SnapshotStore,
    cache: &'a ContentCache,
    packages: &'a dyn PackageManager,
    runner: &'a dyn CommandRunner,
}

impl<'a> StepEngine<'a> {
    pub fn new(
        store: &'a dyn SnapshotStore,
        cache: &'a ContentCache,
        packages: &'a dyn PackageManager,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        Self {
            store,
            cache,
            packages,
            runner,
        }
    }

    /// Apply `steps` in order on top of `base`.
    pub fn execute(&self, base: &SnapshotId, steps: &[Step]) -> Result<BuildOutcome> {
        validate_order(steps)?;

        let total = steps.len();
        let mut current = base.clone();
        let mut records = Vec::with_capacity(total);

        for (index, step) in steps.iter().enumerate() {
            let key = step
                .cache_key(&current)
                .with_context(|| format!("computing cache key for step {}", index + 1))?;

            let (snapshot, cached) = match self.cached_snapshot(&key)? {
                Some(snapshot) => {
                    info!(
                        step = index + 1,
                        total,
                        kind = step.kind(),
                        snapshot = %snapshot.short(),
                        "cached: {}",
                        step.describe()
                    );
                    (snapshot, true)
                }
                None => {
                    let started = Instant::now();
                    info!(step = index + 1, total, kind = step.kind(), "{}", step.describe());
                    let snapshot = self
                        .run_step(&current, step)
                        .with_context(|| format!("step {} ({}) failed", index + 1, step.kind()))?;
                    self.cache.record_step(&ContentCache::step_entry(
                        key.clone(),
                        current.clone(),
                        snapshot.clone(),
                        step.kind(),
                    ))?;
                    debug!(
                        step = index + 1,
                        snapshot = %snapshot.short(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "committed"
                    );
                    (snapshot, false)
                }
            };

            records.push(StepRecord {
                index,
                kind: step.kind(),
                key,
                snapshot: snapshot.clone(),
                cached,
            });
            current = snapshot;
        }

        Ok(BuildOutcome {
            snapshot: current,
            records,
        })
    }

    /// A cache hit only counts if the store still holds the snapshot.
    fn cached_snapshot(&self, key: &CacheKey) -> Result<Option<SnapshotId>> {
        let Some(entry) = self.cache.lookup_step(key) else {
            return Ok(None);
        };
        if self.store.contains(&entry.snapshot)? {
            Ok(Some(entry.snapshot))
        } else {
            debug!(
                key = %key.short(),
                snapshot = %entry.snapshot.short(),
                "cached snapshot no longer in store"
            );
            Ok(None)
        }
    }

    fn run_step(&self, parent: &SnapshotId, step: &Step) -> Result<SnapshotId> {
        let mount = Mount::open(self.store, parent)?;
        let root = mount.root();

        match step {
            Step::InstallPackages { packages, options } => {
                self.packages.install(root, packages, options)?
            }
            Step::RemovePackages { packages } => self.packages.remove(root, packages)?,
            Step::AddFiles(entries) => files::add_files(root, entries)?,
            Step::RemoveFiles(paths) => files::remove_files(root, paths)?,
            Step::RunCommand(cmd) => {
                let argv = cmd.resolve_argv(root)?;
                self.runner.run(mount.checkout(), &argv)?;
            }
            Step::RemovePackageManager { also_remove } => {
                self.packages.remove_self(root, also_remove)?
            }
        }

        let snapshot = mount.commit()?;
        mount.release()?;
        Ok(snapshot)
    }
}

/// Reject pipelines where anything follows package manager removal.
pub fn validate_order(steps: &[Step]) -> Result<()> {
    let last = steps.len().saturating_sub(1);
    for (index, step) in steps.iter().enumerate() {
        if matches!(step, Step::RemovePackageManager { .. }) && index != last {
            return Err(BuildError::Configuration(format!(
                "step {} removes the package manager but {} more step(s) follow; it must be last",
                index + 1,
                last - index
            ))
            .into());
        }
    }
    Ok(())
}
