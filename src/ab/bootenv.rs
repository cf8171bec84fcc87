//! GRUB environment block naming the slot to boot.
//!
//! The block uses the 1 KiB `grub-editenv` format: a signature line, then
//! `key=value` lines, padded with `#`. It lives raw in a small partition of
//! its own, which the embedded boot script reads with
//! `load_env -f (hd0,N)+2`, so no filesystem is involved.

use super::Slot;
use crate::error::BuildError;
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// GPT name of the partition holding the block.
pub const ENV_PARTITION: &str = "abenv";
pub const ENV_BLOCK_SIZE: usize = 1024;
pub const ACTIVE_VAR: &str = "active";
const SIGNATURE: &str = "# GRUB Environment Block\n";

/// Serialise `vars` into a padded environment block.
pub fn encode(vars: &BTreeMap<String, String>) -> Result<Vec<u8>> {
    let mut text = String::from(SIGNATURE);
    for (key, value) in vars {
        if key.is_empty() || key.contains(['=', '\n', '#']) || value.contains('\n') {
            bail!("cannot store {:?}={:?} in a GRUB environment block", key, value);
        }
        let _ = writeln!(text, "{}={}", key, value);
    }
    if text.len() > ENV_BLOCK_SIZE {
        bail!(
            "environment needs {} bytes, the block holds {}",
            text.len(),
            ENV_BLOCK_SIZE
        );
    }
    let mut block = text.into_bytes();
    block.resize(ENV_BLOCK_SIZE, b'#');
    Ok(block)
}

pub fn decode(block: &[u8]) -> Result<BTreeMap<String, String>> {
    let text = std::str::from_utf8(block)
        .map_err(|_| BuildError::DeviceState("boot environment is not text".into()))?;
    let body = text.strip_prefix(SIGNATURE).ok_or_else(|| {
        BuildError::DeviceState("boot environment has no GRUB signature".into())
    })?;
    Ok(body
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect())
}

/// Block selecting `slot`, as written into a fresh image.
pub fn initial_block(slot: Slot) -> Result<Vec<u8>> {
    encode(&BTreeMap::from([(
        ACTIVE_VAR.to_string(),
        slot.env_value().to_string(),
    )]))
}

/// The environment block on a device (or inside a disk image at `offset`).
#[derive(Debug, Clone)]
pub struct BootEnv {
    path: PathBuf,
    offset: u64,
}

impl BootEnv {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::at(path, 0)
    }

    pub fn at(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn vars(&self) -> Result<BTreeMap<String, String>> {
        let mut dev = File::open(&self.path).map_err(|e| {
            BuildError::DeviceState(format!("cannot open {}: {}", self.path.display(), e))
        })?;
        let mut block = vec![0u8; ENV_BLOCK_SIZE];
        dev.seek(SeekFrom::Start(self.offset))?;
        dev.read_exact(&mut block)
            .with_context(|| format!("reading boot environment from {}", self.path.display()))?;
        decode(&block)
    }

    /// Slot the bootloader will pick next.
    pub fn active(&self) -> Result<Slot> {
        let vars = self.vars()?;
        let value = vars.get(ACTIVE_VAR).ok_or_else(|| {
            BuildError::DeviceState(format!("{} has no '{}' entry", self.path.display(), ACTIVE_VAR))
        })?;
        value.parse()
    }

    /// Point the bootloader at `slot`. Other variables are kept; a corrupt
    /// block is replaced.
    pub fn set_active(&self, slot: Slot) -> Result<()> {
        let mut vars = match self.vars() {
            Ok(vars) => vars,
            Err(e) => {
                warn!(error = %e, "rewriting unusable boot environment");
                BTreeMap::new()
            }
        };
        vars.insert(ACTIVE_VAR.to_string(), slot.env_value().to_string());
        let block = encode(&vars)?;

        let mut dev = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        dev.seek(SeekFrom::Start(self.offset))?;
        dev.write_all(&block)?;
        dev.sync_all()
            .with_context(|| format!("syncing {}", self.path.display()))?;
        info!(slot = %slot, env = %self.path.display(), "bootloader points at slot");
        Ok(())
    }
}
