//! Pipeline steps.
//!
//! A [`Step`] is one transformation of a snapshot. Steps are plain data: the
//! engine dispatches on the variant and hands the work to a collaborator
//! ([`packages::PackageManager`], [`files`], [`command::CommandRunner`]).
//!
//! Each step contributes a stable fingerprint to its cache key. Host files
//! are fingerprinted by content, so moving a file on the host does not
//! invalidate the cache, and editing it does.

pub mod command;
pub mod files;
pub mod packages;

use crate::cache::CacheKey;
use crate::snapshot::SnapshotId;
use anyhow::Result;
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub use command::{BeforeRun, RunCommand};
pub use files::FileEntry;
pub use packages::PackageOptions;

/// Bumped whenever the meaning of a fingerprint changes.
const STEP_KEY_DOMAIN: &str = "image-builder/step/v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    InstallPackages {
        packages: Vec<String>,
        options: PackageOptions,
    },
    RemovePackages {
        packages: Vec<String>,
    },
    /// Keyed by in-snapshot path. Ordered, so parents come before children.
    AddFiles(BTreeMap<String, FileEntry>),
    RemoveFiles(Vec<String>),
    RunCommand(RunCommand),
    /// Remove the package manager itself (plus `also_remove`). Must be last.
    RemovePackageManager {
        also_remove: Vec<String>,
    },
}

impl Step {
    /// Stable kind tag, used in cache keys and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Step::InstallPackages { .. } => "install-packages",
            Step::RemovePackages { .. } => "remove-packages",
            Step::AddFiles(_) => "add-files",
            Step::RemoveFiles(_) => "remove-files",
            Step::RunCommand(_) => "run-command",
            Step::RemovePackageManager { .. } => "remove-package-manager",
        }
    }

    /// One-line human description.
    pub fn describe(&self) -> String {
        match self {
            Step::InstallPackages { packages, .. } => format!("install {}", packages.join(" ")),
            Step::RemovePackages { packages } => format!("remove {}", packages.join(" ")),
            Step::AddFiles(files) => {
                let names: Vec<&str> = files.keys().map(String::as_str).collect();
                format!("add {}", names.join(" "))
            }
            Step::RemoveFiles(paths) => format!("delete {}", paths.join(" ")),
            Step::RunCommand(cmd) => format!("run {}", cmd.argv.join(" ")),
            Step::RemovePackageManager { also_remove } if also_remove.is_empty() => {
                "remove package manager".to_string()
            }
            Step::RemovePackageManager { also_remove } => {
                format!("remove package manager and {}", also_remove.join(" "))
            }
        }
    }

    /// Parameters that determine the step's output.
    ///
    /// The package cache directory is absent: it changes how
    /// fast packages arrive, not which packages end up installed.
    pub fn fingerprint(&self) -> Result<Value> {
        Ok(match self {
            Step::InstallPackages { packages, .. } => json!({ "packages": packages }),
            Step::RemovePackages { packages } => json!({ "packages": packages }),
            Step::AddFiles(files) => {
                let mut entries = serde_json::Map::new();
                for (path, entry) in files {
                    entries.insert(path.clone(), entry.fingerprint()?);
                }
                Value::Object(entries)
            }
            Step::RemoveFiles(paths) => json!({ "paths": paths }),
            Step::RunCommand(cmd) => json!({
                "argv": cmd.argv,
                "extra_hash_data": cmd.extra_hash_data,
                "before_run": cmd.before_run.map(|b| b.name()),
            }),
            Step::RemovePackageManager { also_remove } => json!({ "also_remove": also_remove }),
        })
    }

    /// Cache key of this step applied on top of `parent`.
    pub fn cache_key(&self, parent: &SnapshotId) -> Result<CacheKey> {
        // serde_json maps are BTreeMaps, so the encoding is canonical.
        let params = serde_json::to_vec(&self.fingerprint()?)?;
        Ok(CacheKey::derive(
            STEP_KEY_DOMAIN,
            &[parent.as_str().as_bytes(), self.kind().as_bytes(), &params],
        ))
    }
}

pub fn add_files<I, P>(entries: I) -> Step
where
    I: IntoIterator<Item = (P, FileEntry)>,
    P: Into<String>,
{
    Step::AddFiles(entries.into_iter().map(|(p, e)| (p.into(), e)).collect())
}

pub fn install_packages<I, S>(packages: I, options: PackageOptions) -> Step
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Step::InstallPackages {
        packages: packages.into_iter().map(Into::into).collect(),
        options,
    }
}

pub fn run<I, S>(argv: I) -> Step
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Step::RunCommand(RunCommand::new(argv))
}
