//! Package manager collaborator.
//!
//! The engine only needs three operations: install, remove, and removing
//! the package manager itself from the finished image. Dependency
//! resolution is entirely the package manager's business.

use crate::process::Cmd;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageOptions {
    /// Host directory holding downloaded packages, shared across builds.
    pub cache_dir: Option<PathBuf>,
}

pub trait PackageManager: Send + Sync {
    fn install(&self, root: &Path, names: &[String], options: &PackageOptions) -> Result<()>;

    fn remove(&self, root: &Path, names: &[String]) -> Result<()>;

    /// Remove the package manager and its database, plus `extra` packages.
    fn remove_self(&self, root: &Path, extra: &[String]) -> Result<()>;
}

/// Alpine's `apk`, run from the host against the working copy with `--root`.
#[derive(Debug, Clone)]
pub struct Apk {
    program: String,
}

impl Default for Apk {
    fn default() -> Self {
        Self::new("apk")
    }
}

/// Paths apk leaves behind once its own package is gone.
const APK_STATE_PATHS: &[&str] = &["etc/apk", "lib/apk", "var/cache/apk", "usr/share/apk"];

impl Apk {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn cmd(&self, root: &Path) -> Cmd {
        Cmd::new(&self.program)
            .arg("--root")
            .arg_path(root)
            .arg("--no-progress")
    }
}

impl PackageManager for Apk {
    fn install(&self, root: &Path, names: &[String], options: &PackageOptions) -> Result<()> {
        if names.is_empty() {
            bail!("install-packages step lists no packages");
        }
        let mut cmd = self.cmd(root).arg("--update-cache");
        if let Some(dir) = &options.cache_dir {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating package cache '{}'", dir.display()))?;
            cmd = cmd.arg("--cache-dir").arg_path(dir);
        }
        cmd.arg("add")
            .args(names)
            .error_msg(format!("apk add {} failed", names.join(" ")))
            .run()?;
        Ok(())
    }

    fn remove(&self, root: &Path, names: &[String]) -> Result<()> {
        if names.is_empty() {
            bail!("remove-packages step lists no packages");
        }
        self.cmd(root)
            .arg("del")
            .args(names)
            .error_msg(format!("apk del {} failed", names.join(" ")))
            .run()?;
        Ok(())
    }

    fn remove_self(&self, root: &Path, extra: &[String]) -> Result<()> {
        self.cmd(root)
            .args(["del", "apk-tools"])
            .args(extra)
            .error_msg("apk del apk-tools failed")
            .run()?;
        for rel in APK_STATE_PATHS {
            let path = root.join(rel);
            if path.exists() {
                fs::remove_dir_all(&path)
                    .with_context(|| format!("removing '{}'", path.display()))?;
                debug!(path = rel, "removed package manager state");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Fake apk that appends its arguments (minus --root <dir>) to a log.
    fn fake_apk(dir: &Path) -> String {
        let script = dir.join("apk");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\nshift 2\necho \"$@\" >> {}\n",
                dir.join("calls.log").display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script.to_string_lossy().into_owned()
    }

    fn calls(dir: &Path) -> Vec<String> {
        fs::read_to_string(dir.join("calls.log"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn install_uses_shared_cache_dir() {
        let tmp = TempDir::new().unwrap();
        let apk = Apk::new(fake_apk(tmp.path()));
        let cache = tmp.path().join("apk-cache");
        let options = PackageOptions {
            cache_dir: Some(cache.clone()),
        };

        apk.install(tmp.path(), &["grub".into(), "openrc".into()], &options)
            .unwrap();

        assert!(cache.is_dir());
        assert_eq!(
            calls(tmp.path()),
            vec![format!(
                "--no-progress --update-cache --cache-dir {} add grub openrc",
                cache.display()
            )]
        );
    }

    #[test]
    fn remove_self_deletes_apk_state() {
        let tmp = TempDir::new().unwrap();
        let apk = Apk::new(fake_apk(tmp.path()));
        let root = tmp.path().join("root");
        fs::create_dir_all(root.join("etc/apk/keys")).unwrap();
        fs::create_dir_all(root.join("lib/apk/db")).unwrap();
        fs::create_dir_all(root.join("etc/ssh")).unwrap();

        apk.remove_self(&root, &["mkinitfs".into()]).unwrap();

        assert!(!root.join("etc/apk").exists());
        assert!(!root.join("lib/apk").exists());
        assert!(root.join("etc/ssh").exists());
        assert_eq!(
            calls(tmp.path()),
            vec!["--no-progress del apk-tools mkinitfs".to_string()]
        );
    }

    #[test]
    fn empty_package_list_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let apk = Apk::new(fake_apk(tmp.path()));
        assert!(apk
            .install(tmp.path(), &[], &PackageOptions::default())
            .is_err());
        assert!(apk.remove(tmp.path(), &[]).is_err());
    }
}
