//! Squashfs image builder.
//!
//! Wraps `mksquashfs` with flags that make the output a pure function of the
//! input tree: fixed compression and block size, root ownership, zero
//! timestamps and `-reproducible` ordering. Packed images are cached as
//! artifacts keyed by snapshot id and options.

use crate::cache::{CacheKey, ContentCache};
use crate::process::Cmd;
use crate::snapshot::{Mount, SnapshotId, SnapshotStore};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const ARTIFACT_KIND: &str = "squashfs";

/// Options for building a squashfs image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SquashfsOptions {
    /// Compression algorithm (gzip, zstd, xz, lzo, lz4).
    ///
    /// Default: "gzip" (every kernel with squashfs support can read it)
    pub compression: String,

    /// Block size (e.g., "128K", "256K", "1M").
    pub block_size: String,
}

impl Default for SquashfsOptions {
    fn default() -> Self {
        Self {
            compression: "gzip".to_string(),
            block_size: "128K".to_string(),
        }
    }
}

/// A packed image on disk.
#[derive(Debug, Clone)]
pub struct PackedImage {
    pub path: PathBuf,
    pub size: u64,
    pub cached: bool,
}

/// `mksquashfs` invocation for `source_dir` -> `output`.
///
/// `keep_owners` keeps the uid/gid found in `source_dir`; otherwise every
/// file is owned by root.
pub fn mksquashfs_command(
    source_dir: &Path,
    output: &Path,
    options: &SquashfsOptions,
    keep_owners: bool,
) -> Cmd {
    let cmd = Cmd::new("mksquashfs")
        .arg_path(source_dir)
        .arg_path(output)
        .args(["-comp", &options.compression])
        .args(["-b", &options.block_size])
        .arg("-noappend")
        .arg("-no-xattrs");
    let cmd = if keep_owners { cmd } else { cmd.arg("-all-root") };
    cmd.args(["-mkfs-time", "0"])
        .args(["-all-time", "0"])
        .arg("-reproducible")
        .arg("-no-progress")
        .error_msg("mksquashfs failed. Install squashfs-tools")
}

/// Build a squashfs image from a directory.
pub fn build_squashfs(
    source_dir: &Path,
    output: &Path,
    options: &SquashfsOptions,
    keep_owners: bool,
) -> Result<u64> {
    if output.exists() {
        fs::remove_file(output)?;
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    mksquashfs_command(source_dir, output, options, keep_owners).run()?;
    let size = fs::metadata(output)
        .with_context(|| format!("mksquashfs produced no output at {}", output.display()))?
        .len();
    Ok(size)
}

fn artifact_key(
    snapshot: &SnapshotId,
    options: &SquashfsOptions,
    keep_owners: bool,
) -> Result<CacheKey> {
    let owners: &[u8] = if keep_owners { b"owners" } else { b"all-root" };
    Ok(CacheKey::derive(
        "image-builder/squashfs/v2",
        &[snapshot.as_str().as_bytes(), &serde_json::to_vec(options)?, owners],
    ))
}

/// Pack `snapshot` into `output`, reusing a cached image when possible.
pub fn pack(
    store: &dyn SnapshotStore,
    cache: &ContentCache,
    snapshot: &SnapshotId,
    output: &Path,
    options: &SquashfsOptions,
) -> Result<PackedImage> {
    let keep_owners = store.preserves_ownership();
    let key = artifact_key(snapshot, options, keep_owners)?;

    if cache.restore_artifact(ARTIFACT_KIND, &key, output)? {
        let size = fs::metadata(output)?.len();
        info!(snapshot = %snapshot.short(), size_bytes = size, "squashfs restored from cache");
        return Ok(PackedImage {
            path: output.to_path_buf(),
            size,
            cached: true,
        });
    }

    let mount = Mount::open(store, snapshot)?;
    let size = build_squashfs(mount.root(), output, options, keep_owners)
        .with_context(|| format!("packing snapshot {}", snapshot.short()))?;
    mount.release()?;

    let mut meta = BTreeMap::new();
    meta.insert(
        "snapshot".to_string(),
        serde_json::Value::String(snapshot.to_string()),
    );
    cache.put_artifact_file(ARTIFACT_KIND, &key, output, meta)?;
    info!(
        snapshot = %snapshot.short(),
        size_mb = size / 1024 / 1024,
        compression = %options.compression,
        "squashfs created"
    );

    Ok(PackedImage {
        path: output.to_path_buf(),
        size,
        cached: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::sha256_file;
    use crate::snapshot::dir::{DirSnapshotStore, SCRATCH};
    use tempfile::TempDir;

    #[test]
    fn command_pins_reproducibility_flags() {
        let cmd = mksquashfs_command(
            Path::new("/src"),
            Path::new("/out.img"),
            &SquashfsOptions::default(),
            false,
        );
        let args = cmd.arguments().join(" ");
        assert_eq!(cmd.program(), "mksquashfs");
        assert!(args.starts_with("/src /out.img -comp gzip -b 128K"));
        for flag in [
            "-noappend",
            "-no-xattrs",
            "-all-root",
            "-mkfs-time 0",
            "-all-time 0",
            "-reproducible",
        ] {
            assert!(args.contains(flag), "missing {flag}");
        }
    }

    #[test]
    fn ownership_is_kept_when_the_store_preserves_it() {
        let keep = mksquashfs_command(
            Path::new("/src"),
            Path::new("/out.img"),
            &SquashfsOptions::default(),
            true,
        );
        assert!(!keep.arguments().iter().any(|a| a == "-all-root"));

        let tmp = TempDir::new().unwrap();
        let dir = DirSnapshotStore::open(&tmp.path().join("snapshots")).unwrap();
        assert!(!dir.preserves_ownership());
        assert!(crate::snapshot::buildah::BuildahStore::default().preserves_ownership());

        let snapshot = SnapshotId::new("abc");
        let options = SquashfsOptions::default();
        assert_ne!(
            artifact_key(&snapshot, &options, true).unwrap(),
            artifact_key(&snapshot, &options, false).unwrap()
        );
    }

    #[test]
    fn cached_image_is_restored_without_packing() {
        let tmp = TempDir::new().unwrap();
        let store = DirSnapshotStore::open(&tmp.path().join("snapshots")).unwrap();
        let cache = ContentCache::open(&tmp.path().join("cache")).unwrap();
        let snapshot = store.resolve_base(SCRATCH).unwrap();
        let options = SquashfsOptions::default();

        let prebuilt = tmp.path().join("prebuilt.img");
        fs::write(&prebuilt, b"hsqs").unwrap();
        cache
            .put_artifact_file(
                ARTIFACT_KIND,
                &artifact_key(&snapshot, &options, store.preserves_ownership()).unwrap(),
                &prebuilt,
                BTreeMap::new(),
            )
            .unwrap();

        let output = tmp.path().join("out/squashfs.img");
        let packed = pack(&store, &cache, &snapshot, &output, &options).unwrap();
        assert!(packed.cached);
        assert_eq!(packed.size, 4);
        assert_eq!(fs::read(&output).unwrap(), b"hsqs");
    }

    #[test]
    fn packing_same_content_twice_is_byte_identical() {
        if !crate::process::exists("mksquashfs") {
            eprintln!("skipping: mksquashfs not installed");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("rootfs");
        fs::create_dir_all(src.join("etc/init.d")).unwrap();
        fs::write(src.join("etc/hostname"), "alpine\n").unwrap();
        fs::write(src.join("etc/init.d/ifstate"), "#!/sbin/openrc-run\n").unwrap();

        let options = SquashfsOptions::default();
        let a = tmp.path().join("a.img");
        let b = tmp.path().join("b.img");
        build_squashfs(&src, &a, &options, false).unwrap();
        // New mtimes, same content.
        fs::write(src.join("etc/hostname"), "alpine\n").unwrap();
        build_squashfs(&src, &b, &options, false).unwrap();

        assert_eq!(sha256_file(&a).unwrap(), sha256_file(&b).unwrap());
    }
}
