//! A/B root slot state machine (device side).
//!
//! Two root partitions hold interchangeable images. A small JSON state file
//! records which slot is active, how many times it has been booted without
//! being confirmed, and whether it has been confirmed stable:
//!
//! ```text
//! Booting(slot) -> Verifying(slot) -> Stable(slot)
//!                                  \-> RollingBack(slot -> other)
//! ```
//!
//! The bootloader does not read this file. It reads the active slot from a
//! GRUB environment block in its own partition ([`bootenv`]), which the
//! controller rewrites whenever the active slot changes.
//!
//! Every write goes to a temporary file that is fsynced and renamed over the
//! state file, so after a power cut the file holds either the old or the new
//! state. Writers in different processes (`ab boot` and `ab mark-stable`)
//! serialise through an exclusive lock on a sibling lock file.

pub mod bootenv;
pub mod watchdog;

use crate::error::BuildError;
use bootenv::BootEnv;
use crate::fsutil::tmp_name;
use crate::process::Cmd;
use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

pub const STATE_FILE: &str = "ab-state.json";
const LAST_GOOD_FILE: &str = "ab-state.last-good.json";
const LOCK_FILE: &str = "ab-state.lock";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(&self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    /// GPT partition name holding this slot's root filesystem.
    pub fn partition_name(&self) -> &'static str {
        match self {
            Slot::A => "root_a",
            Slot::B => "root_b",
        }
    }

    /// Value of the boot environment's `active` variable.
    pub fn env_value(&self) -> &'static str {
        match self {
            Slot::A => "a",
            Slot::B => "b",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Slot::A => "A",
            Slot::B => "B",
        })
    }
}

impl FromStr for Slot {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "a" | "A" => Ok(Slot::A),
            "b" | "B" => Ok(Slot::B),
            _ => bail!("invalid slot '{}', expected A or B", s),
        }
    }
}

/// Persisted boot state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbState {
    pub active: Slot,
    /// Boots of `active` since it was activated, while unconfirmed.
    pub attempts: u32,
    pub stable: bool,
    /// Set when the watchdog flipped slots; cleared on the next boot.
    #[serde(default)]
    pub rollback_pending: bool,
}

impl AbState {
    /// State written at image build time.
    pub fn initial() -> Self {
        Self {
            active: Slot::A,
            attempts: 0,
            stable: false,
            rollback_pending: false,
        }
    }

    fn activated(slot: Slot) -> Self {
        Self {
            active: slot,
            ..Self::initial()
        }
    }
}

/// Where a boot cycle stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    Booting(Slot),
    Verifying(Slot),
    Stable(Slot),
    RollingBack { from: Slot, to: Slot },
}

#[derive(Debug, Clone)]
pub struct AbConfig {
    pub state_dir: PathBuf,
    pub timeout: Duration,
    pub max_attempts: u32,
    /// How often the watchdog re-reads the persisted stable flag, so a
    /// confirmation from another process is noticed.
    pub poll_interval: Duration,
}

impl AbConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            timeout: DEFAULT_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Held while reading-modifying-writing the state.
pub struct StateLock {
    _file: File,
}

/// Durable storage for [`AbState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn last_good_path(&self) -> PathBuf {
        self.dir.join(LAST_GOOD_FILE)
    }

    /// Write the initial state (slot A, unconfirmed) into `dir`.
    pub fn provision(dir: &Path) -> Result<AbState> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating state directory {}", dir.display()))?;
        let store = Self::new(dir);
        let state = AbState::initial();
        store.save(&state)?;
        Ok(state)
    }

    pub fn lock(&self) -> Result<StateLock> {
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening lock file {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("locking {}", path.display()))?;
        Ok(StateLock { _file: file })
    }

    fn read(path: &Path) -> Result<AbState> {
        let bytes = fs::read(path).map_err(|e| {
            BuildError::DeviceState(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            BuildError::DeviceState(format!("corrupt state in {}: {}", path.display(), e)).into()
        })
    }

    pub fn load_strict(&self) -> Result<AbState> {
        Self::read(&self.state_path())
    }

    /// Load the state, never failing.
    ///
    /// Unreadable state falls back to the last slot confirmed stable, then
    /// to slot A, so the device always has something to boot.
    pub fn load(&self) -> AbState {
        let err = match self.load_strict() {
            Ok(state) => return state,
            Err(e) => e,
        };
        warn!(error = %err, "A/B state unusable, falling back");

        match Self::read(&self.last_good_path()) {
            Ok(last_good) => {
                info!(slot = %last_good.active, "using last known good slot");
                last_good
            }
            Err(e) => {
                warn!(error = %e, "no last known good slot, using slot A");
                AbState::initial()
            }
        }
    }

    pub fn save(&self, state: &AbState) -> Result<()> {
        write_durable(&self.state_path(), state)
    }

    fn save_last_good(&self, state: &AbState) -> Result<()> {
        write_durable(&self.last_good_path(), state)
    }
}

/// tmp file, fsync, rename, fsync directory.
fn write_durable(path: &Path, state: &AbState) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let tmp = dir.join(format!(".{}", tmp_name("ab-state")));
    let bytes = serde_json::to_vec_pretty(state)?;

    let mut file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("replacing {}", path.display()));
    }
    File::open(dir)
        .and_then(|d| d.sync_all())
        .with_context(|| format!("syncing {}", dir.display()))?;
    Ok(())
}

/// Triggers the reboot at the end of a rollback.
pub trait Rebooter: Send + Sync {
    fn reboot(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemReboot;

impl Rebooter for SystemReboot {
    fn reboot(&self) -> Result<()> {
        Cmd::new("reboot").error_msg("reboot failed").run()?;
        Ok(())
    }
}

pub struct AbController {
    store: StateStore,
    config: AbConfig,
    boot_env: Option<BootEnv>,
}

impl AbController {
    pub fn new(config: AbConfig) -> Self {
        Self {
            store: StateStore::new(&config.state_dir),
            config,
            boot_env: None,
        }
    }

    /// Keep the bootloader's environment block in step with the active slot.
    pub fn with_boot_env(mut self, env: BootEnv) -> Self {
        self.boot_env = Some(env);
        self
    }

    pub fn boot_env(&self) -> Option<&BootEnv> {
        self.boot_env.as_ref()
    }

    fn point_bootloader_at(&self, slot: Slot) -> Result<()> {
        match &self.boot_env {
            Some(env) => env.set_active(slot),
            None => Ok(()),
        }
    }

    pub fn config(&self) -> &AbConfig {
        &self.config
    }

    pub fn status(&self) -> AbState {
        self.store.load()
    }

    pub fn is_stable(&self) -> bool {
        self.store.load().stable
    }

    /// Start a boot cycle for the active slot.
    ///
    /// A slot booted more than `max_attempts` times without confirmation is
    /// abandoned right away; the caller must reboot.
    pub fn boot(&self) -> Result<BootPhase> {
        let _lock = self.store.lock()?;
        let mut state = self.store.load();
        state.rollback_pending = false;

        if state.stable {
            self.store.save(&state)?;
            info!(slot = %state.active, "slot is stable");
            return Ok(BootPhase::Stable(state.active));
        }

        state.attempts += 1;
        if state.attempts > self.config.max_attempts {
            let from = state.active;
            let to = from.other();
            warn!(
                slot = %from,
                attempts = state.attempts - 1,
                max_attempts = self.config.max_attempts,
                "slot never confirmed, rolling back"
            );
            self.store.save(&AbState {
                rollback_pending: true,
                ..AbState::activated(to)
            })?;
            self.point_bootloader_at(to)?;
            return Ok(BootPhase::RollingBack { from, to });
        }

        self.store.save(&state)?;
        info!(slot = %state.active, attempt = state.attempts, "verifying slot");
        Ok(BootPhase::Verifying(state.active))
    }

    /// Confirm the active slot. Refused once a rollback has flipped slots.
    pub fn mark_stable(&self) -> Result<AbState> {
        let _lock = self.store.lock()?;
        let mut state = self.store.load();
        if state.rollback_pending {
            bail!(
                "rollback to slot {} already in progress; refusing to mark it stable",
                state.active
            );
        }
        state.stable = true;
        state.attempts = 0;
        self.store.save(&state)?;
        self.store.save_last_good(&state)?;
        info!(slot = %state.active, "slot marked stable");
        Ok(state)
    }

    /// Point the next boot at `slot`, typically after writing an update into
    /// it. The slot starts unconfirmed.
    pub fn activate(&self, slot: Slot) -> Result<AbState> {
        let _lock = self.store.lock()?;
        let state = AbState::activated(slot);
        self.store.save(&state)?;
        self.point_bootloader_at(slot)?;
        info!(slot = %slot, "slot activated");
        Ok(state)
    }

    /// Flip to the other slot unless the persisted state is stable.
    ///
    /// Returns the new state, or `None` when another process confirmed the
    /// slot first.
    pub fn roll_back(&self) -> Result<Option<AbState>> {
        let _lock = self.store.lock()?;
        let state = self.store.load();
        if state.stable {
            return Ok(None);
        }
        let flipped = AbState {
            rollback_pending: true,
            ..AbState::activated(state.active.other())
        };
        self.store.save(&flipped)?;
        self.point_bootloader_at(flipped.active)?;
        warn!(from = %state.active, to = %flipped.active, "rolled back");
        Ok(Some(flipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn controller(dir: &Path) -> AbController {
        StateStore::provision(dir).unwrap();
        AbController::new(AbConfig::new(dir))
    }

    #[test]
    fn provision_writes_initial_state() {
        let tmp = TempDir::new().unwrap();
        let state = StateStore::provision(tmp.path()).unwrap();
        assert_eq!(state, AbState::initial());
        assert_eq!(
            StateStore::new(tmp.path()).load_strict().unwrap(),
            AbState::initial()
        );
    }

    #[test]
    fn corrupt_state_falls_back_to_slot_a() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        fs::write(store.state_path(), "{\"active\": \"B\", \"attem").unwrap();

        let err = store.load_strict().unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(BuildError::DeviceState(_))
        ));
        assert_eq!(store.load().active, Slot::A);
    }

    #[test]
    fn corrupt_state_falls_back_to_last_good() {
        let tmp = TempDir::new().unwrap();
        let ab = controller(tmp.path());
        ab.activate(Slot::B).unwrap();
        ab.mark_stable().unwrap();

        fs::write(tmp.path().join(STATE_FILE), "garbage").unwrap();
        let state = ab.status();
        assert_eq!(state.active, Slot::B);
        assert!(state.stable);
    }

    #[test]
    fn missing_state_falls_back_to_slot_a() {
        let tmp = TempDir::new().unwrap();
        let ab = AbController::new(AbConfig::new(tmp.path()));
        assert_eq!(ab.status(), AbState::initial());
    }

    #[test]
    fn boot_counts_attempts_until_stable() {
        let tmp = TempDir::new().unwrap();
        let ab = controller(tmp.path());

        assert_eq!(ab.boot().unwrap(), BootPhase::Verifying(Slot::A));
        assert_eq!(ab.status().attempts, 1);
        assert_eq!(ab.boot().unwrap(), BootPhase::Verifying(Slot::A));
        assert_eq!(ab.status().attempts, 2);

        ab.mark_stable().unwrap();
        assert!(ab.is_stable());
        assert_eq!(ab.boot().unwrap(), BootPhase::Stable(Slot::A));
        assert_eq!(ab.status().attempts, 0);
    }

    #[test]
    fn too_many_attempts_roll_back() {
        let tmp = TempDir::new().unwrap();
        let ab = controller(tmp.path());
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            assert_eq!(ab.boot().unwrap(), BootPhase::Verifying(Slot::A));
        }
        assert_eq!(
            ab.boot().unwrap(),
            BootPhase::RollingBack {
                from: Slot::A,
                to: Slot::B
            }
        );
        let state = ab.status();
        assert_eq!(state.active, Slot::B);
        assert_eq!(state.attempts, 0);
        assert!(state.rollback_pending);

        // The next boot starts verifying B and clears the flag.
        assert_eq!(ab.boot().unwrap(), BootPhase::Verifying(Slot::B));
        assert!(!ab.status().rollback_pending);
    }

    #[test]
    fn mark_stable_refused_after_rollback() {
        let tmp = TempDir::new().unwrap();
        let ab = controller(tmp.path());
        ab.boot().unwrap();
        assert!(ab.roll_back().unwrap().is_some());
        assert!(ab.mark_stable().is_err());
        assert!(!ab.is_stable());
    }

    #[test]
    fn roll_back_yields_to_persisted_stability() {
        let tmp = TempDir::new().unwrap();
        let ab = controller(tmp.path());
        ab.boot().unwrap();
        ab.mark_stable().unwrap();
        assert!(ab.roll_back().unwrap().is_none());
        assert_eq!(ab.status().active, Slot::A);
    }

    #[test]
    fn writes_leave_no_temporary_files() {
        let tmp = TempDir::new().unwrap();
        let ab = controller(tmp.path());
        ab.boot().unwrap();
        ab.mark_stable().unwrap();
        ab.activate(Slot::B).unwrap();

        let mut names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![STATE_FILE, LAST_GOOD_FILE, LOCK_FILE]);
    }

    fn env_file(dir: &Path) -> BootEnv {
        let path = dir.join("abenv.img");
        fs::write(&path, bootenv::initial_block(Slot::A).unwrap()).unwrap();
        BootEnv::new(path)
    }

    #[test]
    fn slot_changes_reach_the_boot_environment() {
        let tmp = TempDir::new().unwrap();
        let state = tmp.path().join("state");
        let env = env_file(tmp.path());
        StateStore::provision(&state).unwrap();
        let ab = AbController::new(AbConfig::new(&state)).with_boot_env(env.clone());

        ab.boot().unwrap();
        assert_eq!(env.active().unwrap(), Slot::A);
        ab.roll_back().unwrap();
        assert_eq!(env.active().unwrap(), Slot::B);

        ab.activate(Slot::A).unwrap();
        assert_eq!(env.active().unwrap(), Slot::A);
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            ab.boot().unwrap();
        }
        assert!(matches!(ab.boot().unwrap(), BootPhase::RollingBack { .. }));
        assert_eq!(env.active().unwrap(), Slot::B);
    }

    #[test]
    fn slot_parsing() {
        assert_eq!("b".parse::<Slot>().unwrap(), Slot::B);
        assert_eq!(Slot::A.other(), Slot::B);
        assert_eq!(Slot::B.partition_name(), "root_b");
        assert_eq!(Slot::B.env_value().parse::<Slot>().unwrap(), Slot::B);
        assert!("c".parse::<Slot>().is_err());
    }
}
