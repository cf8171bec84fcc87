//! TOML image recipes.
//!
//! A recipe names a base, the steps applied to it, and how the result is
//! packed into a disk image:
//!
//! ```toml
//! name = "minimal"
//! base = "rootfs.tar"
//! ab = true
//!
//! [[steps]]
//! kind = "install-packages"
//! packages = ["linux-lts", "grub-bios"]
//! cache_dir = "apk-cache"
//!
//! [[steps]]
//! kind = "add-files"
//! files."/etc/hostname" = { content = "box\n" }
//!
//! [[steps]]
//! kind = "run-command"
//! argv = ["mkinitfs"]
//! before_run = "append-kernel-version"
//!
//! [[steps]]
//! kind = "remove-package-manager"
//! ```
//!
//! Relative host paths (base, host files, package cache) are resolved
//! against the directory containing the recipe.

use crate::ab::bootenv::{ENV_BLOCK_SIZE, ENV_PARTITION};
use crate::ab::Slot;
use crate::artifact::bootloader::{BootConfig, InstallStrategy, SlotPartitions};
use crate::artifact::disk::partitions::{ByteSize, PartitionType};
use crate::artifact::squashfs::SquashfsOptions;
use crate::engine::validate_order;
use crate::error::BuildError;
use crate::step::{BeforeRun, FileEntry, PackageOptions, RunCommand, Step};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

const RECIPE_EXTENSION: &str = "toml";

fn config_error(msg: String) -> anyhow::Error {
    BuildError::Configuration(msg).into()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Rootless, content-addressed directory store.
    #[default]
    Dir,
    Buildah,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageConfig {
    pub name: String,
    /// Base reference handed to the snapshot store.
    pub base: String,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub squashfs: SquashfsOptions,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub boot: BootConfig,
    pub install: Option<InstallConfig>,
    /// Mirror the root filesystem into two slots and boot whichever one the
    /// A/B environment block names.
    #[serde(default)]
    pub ab: bool,
    #[serde(skip)]
    pub recipe_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum StepConfig {
    InstallPackages {
        packages: Vec<String>,
        cache_dir: Option<PathBuf>,
    },
    RemovePackages {
        packages: Vec<String>,
    },
    AddFiles {
        files: BTreeMap<String, FileConfig>,
    },
    RemoveFiles {
        paths: Vec<String>,
    },
    RunCommand {
        argv: Vec<String>,
        #[serde(default)]
        extra_hash_data: Vec<String>,
        before_run: Option<BeforeRun>,
    },
    RemovePackageManager {
        #[serde(default)]
        also_remove: Vec<String>,
    },
}

/// One add-files entry: exactly one of `content`, `source`, `dir`, `symlink`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub content: Option<String>,
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub dir: bool,
    pub symlink: Option<String>,
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskConfig {
    /// Total disk size. Without it the disk is as small as the layout allows.
    pub size: Option<SizeConfig>,
    /// Defaults to a BIOS boot partition plus one root partition per slot.
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionConfig {
    pub name: String,
    #[serde(default)]
    pub size: SizeConfig,
    #[serde(rename = "type")]
    pub kind: PartitionType,
}

/// `"auto"` sizes a partition to its payload: core.img for bios-boot, the
/// squashfs for linux-data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawSize")]
pub enum SizeConfig {
    #[default]
    Auto,
    Remaining,
    Bytes(u64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSize {
    Bytes(u64),
    Text(String),
}

impl TryFrom<RawSize> for SizeConfig {
    type Error = String;

    fn try_from(raw: RawSize) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawSize::Bytes(n) => Ok(SizeConfig::Bytes(n)),
            RawSize::Text(s) => match s.trim() {
                "auto" => Ok(SizeConfig::Auto),
                "remaining" => Ok(SizeConfig::Remaining),
                other => other
                    .parse::<ByteSize>()
                    .map(|b| SizeConfig::Bytes(b.0))
                    .map_err(|e| e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case", deny_unknown_fields)]
pub enum InstallConfig {
    BiosBootPartition { partition: u32 },
    FixedSectors { start_lba: u64, max_sectors: u64 },
}

impl From<InstallConfig> for InstallStrategy {
    fn from(config: InstallConfig) -> Self {
        match config {
            InstallConfig::BiosBootPartition { partition } => {
                InstallStrategy::BiosBootPartition(partition)
            }
            InstallConfig::FixedSectors {
                start_lba,
                max_sectors,
            } => InstallStrategy::FixedSectors {
                start_lba,
                max_sectors,
            },
        }
    }
}

impl ImageConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading image config '{}'", path.display()))?;
        let recipe_dir = path.parent().unwrap_or(Path::new("."));
        Self::parse(&text, recipe_dir)
            .with_context(|| format!("invalid image config '{}'", path.display()))
    }

    pub fn parse(text: &str, recipe_dir: &Path) -> Result<Self> {
        let mut config: ImageConfig =
            toml::from_str(text).map_err(|e| config_error(e.to_string()))?;
        config.recipe_dir = recipe_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_order(&self.steps()?)?;

        if let Some(size) = self.disk.size {
            if !matches!(size, SizeConfig::Bytes(_)) {
                return Err(config_error(
                    "disk.size must be a byte size, not auto or remaining".into(),
                ));
            }
        }

        let layout = self.partition_layout();
        let mut names = BTreeSet::new();
        for p in &layout {
            if !names.insert(p.name.as_str()) {
                return Err(config_error(format!("duplicate partition name '{}'", p.name)));
            }
            if p.size == SizeConfig::Auto && p.kind == PartitionType::EfiSystem {
                return Err(config_error(format!(
                    "partition '{}': efi-system partitions need an explicit size",
                    p.name
                )));
            }
        }
        for root in self.root_partitions() {
            match layout.iter().find(|p| p.name == root) {
                Some(p) if p.kind == PartitionType::LinuxData => {}
                Some(p) => {
                    return Err(config_error(format!(
                        "root partition '{}' must be linux-data, not {}",
                        root, p.kind
                    )))
                }
                None => {
                    return Err(config_error(format!(
                        "layout has no '{}' partition for the root filesystem",
                        root
                    )))
                }
            }
        }
        if self.ab {
            match layout.iter().find(|p| p.name == ENV_PARTITION) {
                Some(p) if p.kind == PartitionType::LinuxData => {}
                Some(p) => {
                    return Err(config_error(format!(
                        "boot environment partition '{}' must be linux-data, not {}",
                        p.name, p.kind
                    )))
                }
                None => {
                    return Err(config_error(format!(
                        "A/B layout has no '{}' partition for the boot environment",
                        ENV_PARTITION
                    )))
                }
            }
        }
        if self.install.is_none() && !layout.iter().any(|p| p.kind == PartitionType::BiosBoot) {
            return Err(config_error(
                "no bios-boot partition and no [install] strategy for the boot code".into(),
            ));
        }
        Ok(())
    }

    /// Resolve a recipe-relative host path.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.recipe_dir.join(path)
        }
    }

    /// Base reference, resolved against the recipe directory when it names
    /// a file or directory there.
    pub fn base_reference(&self) -> String {
        let local = self.resolve_path(Path::new(&self.base));
        if local.exists() {
            local.to_string_lossy().into_owned()
        } else {
            self.base.clone()
        }
    }

    pub fn steps(&self) -> Result<Vec<Step>> {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                self.step(step)
                    .with_context(|| format!("step {} ({})", i + 1, step.kind()))
            })
            .collect()
    }

    fn step(&self, step: &StepConfig) -> Result<Step> {
        Ok(match step {
            StepConfig::InstallPackages {
                packages,
                cache_dir,
            } => Step::InstallPackages {
                packages: packages.clone(),
                options: PackageOptions {
                    cache_dir: cache_dir.as_deref().map(|d| self.resolve_path(d)),
                },
            },
            StepConfig::RemovePackages { packages } => Step::RemovePackages {
                packages: packages.clone(),
            },
            StepConfig::AddFiles { files } => {
                let mut entries = BTreeMap::new();
                for (path, file) in files {
                    let entry = self
                        .file_entry(file)
                        .map_err(|msg| config_error(format!("file '{}': {}", path, msg)))?;
                    entries.insert(path.clone(), entry);
                }
                Step::AddFiles(entries)
            }
            StepConfig::RemoveFiles { paths } => Step::RemoveFiles(paths.clone()),
            StepConfig::RunCommand {
                argv,
                extra_hash_data,
                before_run,
            } => {
                if argv.is_empty() {
                    return Err(config_error("run-command needs a non-empty argv".into()));
                }
                let mut cmd = RunCommand::new(argv.iter().cloned())
                    .extra_hash_data(extra_hash_data.iter().cloned());
                if let Some(hook) = before_run {
                    cmd = cmd.before_run(*hook);
                }
                Step::RunCommand(cmd)
            }
            StepConfig::RemovePackageManager { also_remove } => Step::RemovePackageManager {
                also_remove: also_remove.clone(),
            },
        })
    }

    fn file_entry(&self, file: &FileConfig) -> std::result::Result<FileEntry, String> {
        let entry = match (&file.content, &file.source, file.dir, &file.symlink) {
            (Some(content), None, false, None) => FileEntry::text(content.clone()),
            (None, Some(source), false, None) => FileEntry::host(self.resolve_path(source)),
            (None, None, true, None) => FileEntry::dir(),
            (None, None, false, Some(target)) => {
                if file.mode.is_some() {
                    return Err("symlinks have no mode".into());
                }
                FileEntry::symlink(target.clone())
            }
            _ => return Err("exactly one of content, source, dir or symlink is required".into()),
        };
        Ok(match file.mode {
            Some(mode) => entry.with_mode(mode),
            None => entry,
        })
    }

    pub fn disk_budget(&self) -> Option<u64> {
        match self.disk.size {
            Some(SizeConfig::Bytes(n)) => Some(n),
            _ => None,
        }
    }

    pub fn disk_label(&self) -> &str {
        self.disk.label.as_deref().unwrap_or(&self.name)
    }

    /// Partition layout: explicit, or the default for this recipe.
    pub fn partition_layout(&self) -> Vec<PartitionConfig> {
        if !self.disk.partitions.is_empty() {
            return self.disk.partitions.clone();
        }
        let mut layout = vec![PartitionConfig {
            name: "grub".to_string(),
            size: SizeConfig::Auto,
            kind: PartitionType::BiosBoot,
        }];
        for root in self.root_partitions() {
            layout.push(PartitionConfig {
                name: root,
                size: SizeConfig::Auto,
                kind: PartitionType::LinuxData,
            });
        }
        if self.ab {
            layout.push(PartitionConfig {
                name: ENV_PARTITION.to_string(),
                size: SizeConfig::Bytes(ENV_BLOCK_SIZE as u64),
                kind: PartitionType::LinuxData,
            });
        }
        layout
    }

    /// Partition numbers the A/B boot script switches between, or `None`
    /// for a single-root image.
    pub fn slot_partitions(&self) -> Result<Option<SlotPartitions>> {
        if !self.ab {
            return Ok(None);
        }
        let layout = self.partition_layout();
        let number = |name: &str| -> Result<u32> {
            layout
                .iter()
                .position(|p| p.name == name)
                .map(|i| i as u32 + 1)
                .ok_or_else(|| config_error(format!("layout has no '{}' partition", name)))
        };
        Ok(Some(SlotPartitions {
            a: number(Slot::A.partition_name())?,
            b: number(Slot::B.partition_name())?,
            env: number(ENV_PARTITION)?,
        }))
    }

    /// Partitions receiving the root filesystem.
    pub fn root_partitions(&self) -> Vec<String> {
        if self.ab {
            vec![
                Slot::A.partition_name().to_string(),
                Slot::B.partition_name().to_string(),
            ]
        } else {
            vec!["root".to_string()]
        }
    }
}

impl StepConfig {
    fn kind(&self) -> &'static str {
        match self {
            StepConfig::InstallPackages { .. } => "install-packages",
            StepConfig::RemovePackages { .. } => "remove-packages",
            StepConfig::AddFiles { .. } => "add-files",
            StepConfig::RemoveFiles { .. } => "remove-files",
            StepConfig::RunCommand { .. } => "run-command",
            StepConfig::RemovePackageManager { .. } => "remove-package-manager",
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(config_error(format!(
            "invalid image name '{}': use letters, digits, '-', '_' and '.'",
            name
        )));
    }
    Ok(())
}

/// Image names available in a recipe directory.
pub fn available(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("reading recipe directory '{}'", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some(RECIPE_EXTENSION) {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Path of the recipe called `name` in `dir`.
pub fn locate(dir: &Path, name: &str) -> Result<PathBuf> {
    validate_name(name)?;
    let path = dir.join(format!("{}.{}", name, RECIPE_EXTENSION));
    if path.is_file() {
        return Ok(path);
    }
    let known = available(dir)?;
    Err(config_error(format!(
        "unknown image '{}' in {} (available: {})",
        name,
        dir.display(),
        if known.is_empty() {
            "none".to_string()
        } else {
            known.join(", ")
        }
    )))
}
