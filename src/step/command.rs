//! Commands executed inside a working copy, and their pre-run hooks.

use crate::error::BuildError;
use crate::process::Cmd;
use crate::snapshot::Checkout;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// PATH used inside the image, which may lack a sane default.
const IMAGE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommand {
    pub argv: Vec<String>,
    /// Inputs the command depends on that are not visible in `argv`.
    pub extra_hash_data: Vec<String>,
    pub before_run: Option<BeforeRun>,
}

impl RunCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            extra_hash_data: Vec::new(),
            before_run: None,
        }
    }

    pub fn extra_hash_data<I, S>(mut self, data: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_hash_data = data.into_iter().map(Into::into).collect();
        self
    }

    pub fn before_run(mut self, hook: BeforeRun) -> Self {
        self.before_run = Some(hook);
        self
    }

    /// Final argv after the pre-run hook has inspected the working copy.
    pub fn resolve_argv(&self, root: &Path) -> Result<Vec<String>> {
        let mut argv = self.argv.clone();
        if let Some(hook) = self.before_run {
            hook.apply(root, &mut argv)?;
        }
        if argv.is_empty() {
            return Err(BuildError::Configuration("run-command step has an empty argv".into()).into());
        }
        Ok(argv)
    }
}

/// Hooks that inspect the mounted working copy and rewrite the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BeforeRun {
    /// Append the single kernel version found under `lib/modules`.
    AppendKernelVersion,
}

impl BeforeRun {
    pub fn name(&self) -> &'static str {
        match self {
            BeforeRun::AppendKernelVersion => "append-kernel-version",
        }
    }

    pub fn apply(&self, root: &Path, argv: &mut Vec<String>) -> Result<()> {
        match self {
            BeforeRun::AppendKernelVersion => {
                let version = discover_kernel_version(root)?;
                info!(kernel = %version, "discovered kernel version");
                argv.push(version);
            }
        }
        Ok(())
    }
}

/// The kernel version installed in `root`.
///
/// Exactly one entry under `lib/modules` is required; zero or several make
/// the choice ambiguous and fail with a configuration error. Stray files
/// count too, so a half-removed kernel is reported rather than skipped.
pub fn discover_kernel_version(root: &Path) -> Result<String> {
    let modules = root.join("lib/modules");
    let mut versions = Vec::new();
    if let Ok(entries) = fs::read_dir(&modules) {
        for entry in entries {
            versions.push(entry?.file_name().to_string_lossy().into_owned());
        }
    }
    versions.sort();

    match versions.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(BuildError::Configuration(
            "expected exactly one kernel version in /lib/modules, found none".to_string(),
        )
        .into()),
        many => Err(BuildError::Configuration(format!(
            "expected exactly one kernel version in /lib/modules, found: {}",
            many.join(", ")
        ))
        .into()),
    }
}

/// Executes a command inside a working copy.
pub trait CommandRunner: Send + Sync {
    fn run(&self, checkout: &Checkout, argv: &[String]) -> Result<()>;
}

/// Runs commands with `chroot` into the working copy's root. Needs root.
#[derive(Debug, Clone)]
pub struct ChrootRunner {
    program: String,
}

impl Default for ChrootRunner {
    fn default() -> Self {
        Self {
            program: "chroot".to_string(),
        }
    }
}

impl CommandRunner for ChrootRunner {
    fn run(&self, checkout: &Checkout, argv: &[String]) -> Result<()> {
        Cmd::new(&self.program)
            .arg_path(&checkout.root)
            .args(argv)
            .env("PATH", IMAGE_PATH)
            .error_msg(format!("'{}' failed inside the image", argv.join(" ")))
            .run()?;
        Ok(())
    }
}

/// Runs commands in a buildah working container.
#[derive(Debug, Clone)]
pub struct BuildahRunner {
    program: String,
}

impl Default for BuildahRunner {
    fn default() -> Self {
        Self {
            program: "buildah".to_string(),
        }
    }
}

impl CommandRunner for BuildahRunner {
    fn run(&self, checkout: &Checkout, argv: &[String]) -> Result<()> {
        Cmd::new(&self.program)
            .args(["run", "--env", &format!("PATH={IMAGE_PATH}"), &checkout.handle, "--"])
            .args(argv)
            .error_msg(format!("'{}' failed inside the image", argv.join(" ")))
            .run()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn single_kernel_version_is_appended() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("lib/modules/6.6.31-0-lts")).unwrap();

        let cmd = RunCommand::new(["mkinitfs"]).before_run(BeforeRun::AppendKernelVersion);
        assert_eq!(
            cmd.resolve_argv(root.path()).unwrap(),
            vec!["mkinitfs", "6.6.31-0-lts"]
        );
    }

    #[test]
    fn several_kernel_versions_are_ambiguous() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("lib/modules/6.6.31-0-lts")).unwrap();
        fs::create_dir_all(root.path().join("lib/modules/6.6.32-0-lts")).unwrap();

        let err = discover_kernel_version(root.path()).unwrap_err();
        match crate::error::classify(&err) {
            Some(BuildError::Configuration(msg)) => {
                assert!(msg.contains("6.6.31-0-lts, 6.6.32-0-lts"), "{msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn stray_file_in_modules_dir_is_counted() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("lib/modules/6.6.31-0-lts")).unwrap();
        fs::write(root.path().join("lib/modules/modules.order"), "").unwrap();

        let err = discover_kernel_version(root.path()).unwrap_err();
        match crate::error::classify(&err) {
            Some(BuildError::Configuration(msg)) => {
                assert!(msg.contains("6.6.31-0-lts, modules.order"), "{msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_modules_dir_is_configuration_error() {
        let root = TempDir::new().unwrap();
        let err = discover_kernel_version(root.path()).unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(BuildError::Configuration(_))
        ));
    }

    #[test]
    fn argv_without_hook_is_unchanged() {
        let root = TempDir::new().unwrap();
        let cmd = RunCommand::new(["rc-update", "add", "ifstate"]);
        assert_eq!(
            cmd.resolve_argv(root.path()).unwrap(),
            vec!["rc-update", "add", "ifstate"]
        );
    }
}
