//! File staging inside a working copy: inline content, host files, empty
//! directories and symlinks, plus removal.
//!
//! Paths are relative to the snapshot root. A leading `/` is accepted and
//! stripped and `..` components are rejected. Symlinks already in the tree
//! are resolved relative to the working copy, so a step can never write
//! outside it.

use crate::error::BuildError;
use crate::fsutil::sha256_file;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Content of one entry of an add-files step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEntry {
    Inline { content: Vec<u8>, mode: u32 },
    /// Copied from the host. `None` keeps the host file's permission bits.
    Host { source: PathBuf, mode: Option<u32> },
    Directory { mode: u32 },
    Symlink { target: String },
}

impl FileEntry {
    pub fn text(content: impl Into<String>) -> Self {
        FileEntry::Inline {
            content: content.into().into_bytes(),
            mode: DEFAULT_FILE_MODE,
        }
    }

    pub fn host(source: impl Into<PathBuf>) -> Self {
        FileEntry::Host {
            source: source.into(),
            mode: None,
        }
    }

    pub fn dir() -> Self {
        FileEntry::Directory {
            mode: DEFAULT_DIR_MODE,
        }
    }

    pub fn symlink(target: impl Into<String>) -> Self {
        FileEntry::Symlink {
            target: target.into(),
        }
    }

    /// Override the permission bits. Has no effect on symlinks.
    pub fn with_mode(self, new_mode: u32) -> Self {
        match self {
            FileEntry::Inline { content, .. } => FileEntry::Inline {
                content,
                mode: new_mode,
            },
            FileEntry::Host { source, .. } => FileEntry::Host {
                source,
                mode: Some(new_mode),
            },
            FileEntry::Directory { .. } => FileEntry::Directory { mode: new_mode },
            link @ FileEntry::Symlink { .. } => link,
        }
    }

    /// Cache-key contribution. Host files are hashed by content.
    pub(crate) fn fingerprint(&self) -> Result<Value> {
        Ok(match self {
            FileEntry::Inline { content, mode } => {
                let (sha, _) = sha256_bytes(content);
                json!({ "type": "inline", "sha256": sha, "mode": mode })
            }
            FileEntry::Host { source, mode } => {
                let (sha, size) = sha256_file(source)
                    .with_context(|| format!("hashing host file '{}'", source.display()))?;
                let mode = match mode {
                    Some(m) => *m,
                    None => host_mode(source)?,
                };
                json!({ "type": "file", "sha256": sha, "size": size, "mode": mode })
            }
            FileEntry::Directory { mode } => json!({ "type": "dir", "mode": mode }),
            FileEntry::Symlink { target } => json!({ "type": "symlink", "target": target }),
        })
    }
}

fn sha256_bytes(bytes: &[u8]) -> (String, u64) {
    use sha2::{Digest, Sha256};
    (format!("{:x}", Sha256::digest(bytes)), bytes.len() as u64)
}

fn host_mode(source: &Path) -> Result<u32> {
    let md = fs::metadata(source)
        .with_context(|| format!("reading host file '{}'", source.display()))?;
    Ok(md.permissions().mode() & 0o7777)
}

/// Symlinks followed while resolving one path, as in Linux's `MAXSYMLINKS`.
const MAX_LINK_HOPS: usize = 40;

fn lexical_parts(path: &str) -> Result<Vec<OsString>> {
    let mut parts = Vec::new();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_os_string()),
            Component::CurDir => {}
            _ => {
                return Err(BuildError::Configuration(format!(
                    "file path '{}' must stay inside the image",
                    path
                ))
                .into())
            }
        }
    }
    Ok(parts)
}

fn under(root: &Path, parts: &[OsString]) -> PathBuf {
    parts.iter().fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// Map an in-snapshot path to a host path under `root`.
///
/// Symlinks in parent directories are resolved the way they would be inside
/// the image: absolute targets restart at `root` and `..` stops at `root`.
/// The last component is never followed. With `create`, missing parent
/// directories are made along the way.
pub fn resolve(root: &Path, path: &str, create: bool) -> Result<PathBuf> {
    let mut pending: VecDeque<OsString> = lexical_parts(path)?.into();
    let Some(name) = pending.pop_back() else {
        return Err(BuildError::Configuration(format!(
            "file path '{}' does not name anything inside the image",
            path
        ))
        .into());
    };

    let mut resolved: Vec<OsString> = Vec::new();
    let mut hops = 0usize;
    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }
        let here = under(root, &resolved).join(&part);
        match fs::symlink_metadata(&here) {
            Ok(md) if md.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_LINK_HOPS {
                    return Err(BuildError::Configuration(format!(
                        "too many levels of symlinks in '{}'",
                        path
                    ))
                    .into());
                }
                let target = fs::read_link(&here)
                    .with_context(|| format!("reading link '{}'", here.display()))?;
                if target.is_absolute() {
                    resolved.clear();
                }
                for component in target.components().rev() {
                    match component {
                        Component::Normal(p) => pending.push_front(p.to_os_string()),
                        Component::ParentDir => pending.push_front(OsString::from("..")),
                        _ => {}
                    }
                }
            }
            Ok(md) if md.is_dir() => resolved.push(part),
            Ok(_) => {
                return Err(BuildError::Configuration(format!(
                    "file path '{}' runs through '{}', which is not a directory",
                    path,
                    here.display()
                ))
                .into())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if create {
                    fs::create_dir(&here)
                        .with_context(|| format!("creating '{}'", here.display()))?;
                }
                resolved.push(part);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("inspecting '{}'", here.display()))
            }
        }
    }
    Ok(under(root, &resolved).join(name))
}

/// Apply an add-files step. Existing entries at the same path are replaced.
pub fn add_files(root: &Path, files: &BTreeMap<String, FileEntry>) -> Result<()> {
    for (path, entry) in files {
        let dst = resolve(root, path, true)?;
        write_entry(&dst, entry).with_context(|| format!("adding '{}'", path))?;
        debug!(path = %path, "staged file");
    }
    Ok(())
}

fn write_entry(dst: &Path, entry: &FileEntry) -> Result<()> {
    // Never follow a symlink already present at the destination.
    let existing = fs::symlink_metadata(dst).ok();
    let is_dir = existing.as_ref().is_some_and(|md| md.is_dir());
    let replace = match entry {
        FileEntry::Directory { .. } => existing.is_some() && !is_dir,
        _ => existing.is_some(),
    };
    if replace {
        if is_dir {
            fs::remove_dir_all(dst)?;
        } else {
            fs::remove_file(dst)?;
        }
    }

    match entry {
        FileEntry::Inline { content, mode } => {
            fs::write(dst, content)?;
            fs::set_permissions(dst, fs::Permissions::from_mode(*mode))?;
        }
        FileEntry::Host { source, mode } => {
            fs::copy(source, dst)
                .with_context(|| format!("copying host file '{}'", source.display()))?;
            let mode = match mode {
                Some(m) => *m,
                None => host_mode(source)?,
            };
            fs::set_permissions(dst, fs::Permissions::from_mode(mode))?;
        }
        FileEntry::Directory { mode } => {
            if !is_dir {
                fs::create_dir(dst)?;
            }
            fs::set_permissions(dst, fs::Permissions::from_mode(*mode))?;
        }
        FileEntry::Symlink { target } => {
            std::os::unix::fs::symlink(target, dst)?;
        }
    }
    Ok(())
}

/// Apply a remove-files step. Missing paths are not an error.
pub fn remove_files(root: &Path, paths: &[String]) -> Result<()> {
    for path in paths {
        let target = resolve(root, path, false)?;
        match fs::symlink_metadata(&target) {
            Ok(md) if md.is_dir() => fs::remove_dir_all(&target)
                .with_context(|| format!("removing directory '{}'", path))?,
            Ok(_) => {
                fs::remove_file(&target).with_context(|| format!("removing '{}'", path))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path, "nothing to remove");
            }
            Err(e) => return Err(e).with_context(|| format!("inspecting '{}'", path)),
        }
    }
    Ok(())
}
