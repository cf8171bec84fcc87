//! Filesystem helpers shared by the content cache and the snapshot store.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

/// zstd level used for snapshot and artifact archives. Fixed so that
/// identical trees compress to identical bytes.
const ZSTD_LEVEL: i32 = 3;

pub(crate) fn now_unix() -> u64 {
    time::OffsetDateTime::now_utc().unix_timestamp().max(0) as u64
}

/// Unique-enough temporary file name inside a store-owned tmp directory.
pub(crate) fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{}-{n}", std::process::id())
}

/// Rename `src` over `dst`. Within one store this is the same filesystem,
/// so readers observe either the old or the new file, never a partial one.
///
/// Only a cross-device rename falls back to copying; any other failure is
/// returned as is.
pub(crate) fn atomic_rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            // Copy next to the destination, then rename.
            let staged = dst.with_extension(tmp_name("xdev"));
            fs::copy(src, &staged).with_context(|| {
                format!("Failed to copy {} to {}", src.display(), staged.display())
            })?;
            fs::rename(&staged, dst)
                .with_context(|| format!("Failed to move {} into place", staged.display()))?;
            fs::remove_file(src)
                .with_context(|| format!("Failed to remove tmp {}", src.display()))?;
            Ok(())
        }
        Err(e) => Err(e).with_context(|| {
            format!("Failed to rename {} to {}", src.display(), dst.display())
        }),
    }
}

pub(crate) fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

pub(crate) fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// `<root>/sha256/<2-char prefix>/<sha>`
pub(crate) fn sharded_blob_path(root: &Path, sha256: &str) -> PathBuf {
    let prefix = &sha256[0..2.min(sha256.len())];
    root.join("sha256").join(prefix).join(sha256)
}

/// Write `src_dir` as a `tar.zst` archive with normalised metadata.
///
/// Entries are sorted by path, mtime/uid/gid are zero, and only the
/// permission bits of the source are kept. Identical trees therefore produce
/// identical archives.
pub(crate) fn create_tar_zst(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, ZSTD_LEVEL)?;
    let mut builder = TarBuilder::new(encoder);
    builder.follow_symlinks(false);

    let mut entries: Vec<PathBuf> = vec![];
    for ent in WalkDir::new(src_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        let p = ent.path();
        if p == src_dir {
            continue;
        }
        entries.push(p.to_path_buf());
    }

    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy();
        ra.cmp(&rb)
    });

    for p in entries {
        let rel = p
            .strip_prefix(src_dir)
            .unwrap_or(&p)
            .to_string_lossy()
            .replace('\\', "/");

        let md = fs::symlink_metadata(&p)?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(permission_bits(&md));

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&p)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, rel, target)?;
        } else if md.is_file() {
            let mut f = File::open(&p)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder.append_data(&mut header, rel, &mut f)?;
        }
        // Sockets, fifos and device nodes cannot be created rootless; skipped.
    }

    let encoder = builder
        .into_inner()
        .with_context(|| "Failed to finalize tar builder")?;
    encoder.finish()?;
    Ok(())
}

/// Unpack a `tar.zst` archive into `dest_dir` (created if missing).
pub(crate) fn unpack_tar_zst(archive: &Path, dest_dir: &Path) -> Result<()> {
    fs::create_dir_all(dest_dir)?;
    let f = File::open(archive)?;
    let decoder = zstd::stream::Decoder::new(f)?;
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.set_preserve_mtime(true);
    tar.unpack(dest_dir)
        .with_context(|| format!("Failed to unpack {}", archive.display()))?;
    Ok(())
}

/// Unpack a plain (uncompressed) tar archive into `dest_dir`.
pub(crate) fn unpack_tar(archive: &Path, dest_dir: &Path) -> Result<()> {
    fs::create_dir_all(dest_dir)?;
    let f = File::open(archive)?;
    let mut tar = tar::Archive::new(BufReader::new(f));
    tar.set_preserve_permissions(true);
    tar.unpack(dest_dir)
        .with_context(|| format!("Failed to unpack {}", archive.display()))?;
    Ok(())
}

#[cfg(unix)]
fn permission_bits(md: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(md: &fs::Metadata) -> u32 {
    if md.is_dir() {
        0o755
    } else {
        0o644
    }
}
