//! Whole-image builds: steps, squashfs, GRUB, GPT disk, A/B boot environment.
//!
//! ```text
//! base ──steps──> snapshot ──mksquashfs──> rootfs.squashfs ─┐
//!                     └──grub-mkimage──> core.img, boot.img ├─> disk.img
//!                                               layout plan ┘
//! ```
//!
//! Everything a build produces lands in `<output>/<name>/`.

pub mod context;

pub use context::BuildContext;

use crate::ab::bootenv::{self, ENV_BLOCK_SIZE, ENV_PARTITION};
use crate::ab::Slot;
use crate::artifact::bootloader::{self, InstallStrategy};
use crate::artifact::disk::{plan, DiskImage, DiskPlan, PartitionSpec, PartitionType, PartitionWrite, SizeHint};
use crate::artifact::squashfs;
use crate::config::{ImageConfig, SizeConfig};
use crate::error::BuildError;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

pub const DISK_IMAGE: &str = "disk.img";
pub const SQUASHFS_IMAGE: &str = "rootfs.squashfs";
pub const BOOT_ENV_IMAGE: &str = "abenv.img";
const REPORT_FILE: &str = "build.json";

/// Summary of a finished build, also written to `build.json`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub name: String,
    pub snapshot: String,
    pub steps_executed: usize,
    pub steps_reused: usize,
    pub squashfs: PathBuf,
    pub squashfs_bytes: u64,
    pub disk: PathBuf,
    pub disk_bytes: u64,
    pub partitions: Vec<PartitionReport>,
    /// Initial A/B environment block, also written into its partition.
    pub boot_env: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionReport {
    pub number: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: u64,
    pub size: u64,
}

/// Resolve the recipe's partition layout against actual payload sizes.
pub fn layout(config: &ImageConfig, core_bytes: u64, root_bytes: u64) -> Result<DiskPlan> {
    let mut specs = Vec::new();
    for p in config.partition_layout() {
        let size = match p.size {
            SizeConfig::Bytes(n) => SizeHint::Bytes(n),
            SizeConfig::Remaining => SizeHint::Remaining,
            SizeConfig::Auto if p.name == ENV_PARTITION => SizeHint::Bytes(ENV_BLOCK_SIZE as u64),
            SizeConfig::Auto => match p.kind {
                PartitionType::BiosBoot => SizeHint::Bytes(core_bytes),
                PartitionType::LinuxData => SizeHint::Bytes(root_bytes),
                PartitionType::EfiSystem => {
                    return Err(BuildError::Configuration(format!(
                        "partition '{}' has no payload to size it by",
                        p.name
                    ))
                    .into())
                }
            },
        };
        specs.push(PartitionSpec::new(p.name, size, p.kind));
    }
    plan(config.disk_budget(), &specs)
}

/// Where the boot code goes: the recipe's choice, else the first BIOS boot
/// partition.
pub fn install_strategy(config: &ImageConfig, plan: &DiskPlan) -> Result<InstallStrategy> {
    if let Some(install) = config.install {
        return Ok(install.into());
    }
    plan.partitions
        .iter()
        .find(|p| p.kind == PartitionType::BiosBoot)
        .map(|p| InstallStrategy::BiosBootPartition(p.number))
        .ok_or_else(|| {
            BuildError::Configuration("layout has no bios-boot partition for the boot code".into())
                .into()
        })
}

/// Build the image described by `config`.
pub fn build_image(ctx: &BuildContext<'_>, config: &ImageConfig) -> Result<BuildReport> {
    let started = Instant::now();
    let out_dir = ctx.output_dir(&config.name);
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating output directory {}", out_dir.display()))?;
    info!(image = %config.name, output = %out_dir.display(), "building image");

    let steps = config.steps()?;
    let base = ctx.store.resolve_base(&config.base_reference())?;
    let outcome = ctx.engine().execute(&base, &steps)?;

    let packed = squashfs::pack(
        ctx.store,
        ctx.cache,
        &outcome.snapshot,
        &out_dir.join(SQUASHFS_IMAGE),
        &config.squashfs,
    )?;
    let slots = config.slot_partitions()?;
    let images = bootloader::build(
        ctx.store,
        ctx.cache,
        &outcome.snapshot,
        &config.boot,
        slots.as_ref(),
        &out_dir,
    )?;
    let core_bytes = fs::metadata(&images.core)?.len();

    let plan = layout(config, core_bytes, packed.size)?;
    bootloader::validate_layout(&config.boot, slots.as_ref(), &plan)?;
    let strategy = install_strategy(config, &plan)?;
    // Fail before creating the disk if the boot code has nowhere to go.
    strategy.region(&plan)?;

    let boot_env = if config.ab {
        let path = out_dir.join(BOOT_ENV_IMAGE);
        fs::write(&path, bootenv::initial_block(Slot::A)?)?;
        Some(path)
    } else {
        None
    };

    let disk = DiskImage::create(&out_dir.join(DISK_IMAGE), plan, config.disk_label())?;
    let mut writes = Vec::new();
    for root in config.root_partitions() {
        let partition = disk.plan().by_name(&root).ok_or_else(|| {
            BuildError::Configuration(format!("layout has no '{}' partition", root))
        })?;
        writes.push(PartitionWrite::new(&packed.path, partition));
    }
    if let Some(path) = &boot_env {
        let partition = disk.plan().by_name(ENV_PARTITION).ok_or_else(|| {
            BuildError::Configuration(format!("layout has no '{}' partition", ENV_PARTITION))
        })?;
        writes.push(PartitionWrite::new(path, partition));
    }
    disk.write(&writes)?;
    bootloader::install(&disk, strategy, &images)?;

    let report = BuildReport {
        name: config.name.clone(),
        snapshot: outcome.snapshot.to_string(),
        steps_executed: outcome.executed(),
        steps_reused: outcome.reused(),
        squashfs: packed.path.clone(),
        squashfs_bytes: packed.size,
        disk: disk.path().to_path_buf(),
        disk_bytes: disk.plan().disk_size,
        partitions: disk
            .plan()
            .partitions
            .iter()
            .map(|p| PartitionReport {
                number: p.number,
                name: p.name.clone(),
                kind: p.kind.to_string(),
                offset: p.offset,
                size: p.size,
            })
            .collect(),
        boot_env,
    };
    fs::write(out_dir.join(REPORT_FILE), serde_json::to_vec_pretty(&report)?)?;

    info!(
        image = %config.name,
        snapshot = %outcome.snapshot.short(),
        executed = report.steps_executed,
        reused = report.steps_reused,
        disk_mb = report.disk_bytes / 1024 / 1024,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "image built"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const MIB: u64 = 1024 * 1024;

    fn config(text: &str) -> ImageConfig {
        ImageConfig::parse(text, Path::new(".")).unwrap()
    }

    #[test]
    fn auto_sizes_follow_payloads() {
        let cfg = config("name = \"x\"\nbase = \"scratch\"\nab = true\n");
        let plan = layout(&cfg, 30_000, 40 * MIB).unwrap();

        let names: Vec<&str> = plan.partitions.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["grub", "root_a", "root_b", "abenv"]);
        assert_eq!(plan.by_name("abenv").unwrap().size, ENV_BLOCK_SIZE as u64);
        assert_eq!(plan.by_name("grub").unwrap().size, 30_208);
        assert_eq!(plan.by_name("root_a").unwrap().size, 40 * MIB);
        assert_eq!(plan.by_name("root_b").unwrap().size, 40 * MIB);
        assert_eq!(
            install_strategy(&cfg, &plan).unwrap(),
            InstallStrategy::BiosBootPartition(1)
        );
    }

    #[test]
    fn budget_overflow_is_reported_for_disk() {
        let cfg = config("name = \"x\"\nbase = \"scratch\"\n[disk]\nsize = \"32M\"\n");
        let err = layout(&cfg, 30_000, 40 * MIB).unwrap_err();
        match crate::error::classify(&err) {
            Some(BuildError::Overflow { target, .. }) => assert_eq!(target, "disk"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn default_boot_config_matches_default_layout() {
        let cfg = config("name = \"x\"\nbase = \"scratch\"\n");
        let plan = layout(&cfg, 30_000, 8 * MIB).unwrap();
        bootloader::validate_layout(&cfg.boot, None, &plan).unwrap();
    }

    #[test]
    fn default_boot_config_boots_either_slot_of_ab_layout() {
        let cfg = config("name = \"x\"\nbase = \"scratch\"\nab = true\n");
        let plan = layout(&cfg, 30_000, 8 * MIB).unwrap();
        let slots = cfg.slot_partitions().unwrap();
        bootloader::validate_layout(&cfg.boot, slots.as_ref(), &plan).unwrap();

        let script = cfg.boot.script_text(slots.as_ref());
        assert!(script.contains("root=/dev/sda2"));
        assert!(script.contains("root=/dev/sda3"));
        assert!(script.contains("load_env -f (hd0,4)+2 active"));
    }
}
