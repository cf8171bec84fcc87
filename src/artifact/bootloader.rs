//! GRUB (i386-pc) core/boot image build and embedding.
//!
//! `core.img` is built by `grub-mkimage` from the module directory of the
//! finished image, with the boot script embedded. It is then written either
//! into a BIOS boot partition or into a fixed sector range (boards whose
//! firmware loads from a known LBA), and `boot.img` goes into the MBR with
//! the usual patches: kernel sector, drive check, and the existing disk
//! signature and partition table preserved.
//!
//! Images with two root slots get a script that reads the active slot from
//! the A/B environment block and boots that slot's kernel and root.

use super::disk::partitions::{
    DiskPlan, Partition, PartitionType, GPT_RESERVED_SECTORS, SECTOR_SIZE,
};
use super::disk::DiskImage;
use crate::ab::Slot;
use crate::cache::{CacheKey, ContentCache};
use crate::error::BuildError;
use crate::process::Cmd;
use crate::snapshot::{Mount, SnapshotId, SnapshotStore};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::info;

pub const CORE_ARTIFACT: &str = "grub-core";
pub const BOOT_ARTIFACT: &str = "grub-boot";

/// boot.img: LBA of the first core.img sector.
const BOOT_KERNEL_SECTOR: usize = 0x5C;
/// boot.img: `jmp` over the boot drive check, NOPed like grub-bios-setup does.
const BOOT_DRIVE_CHECK: usize = 0x66;
/// MBR disk signature through the end of the partition table.
const MBR_PRESERVE: std::ops::Range<usize> = 0x1B8..0x1FE;

/// core.img: first blocklist entry, at the end of the diskboot sector.
const BLOCKLIST_START: usize = 0x200 - 12;
/// core.img: the following (terminating) blocklist entry.
const BLOCKLIST_TERMINATOR: std::ops::Range<usize> = 0x1E8..0x1F4;
const CORE_LOAD_SEGMENT: u16 = 0x820;

/// Script embedded into core.img.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootScript {
    /// Kernel path in GRUB notation, e.g. `(hd0,2)/boot/vmlinuz-lts`.
    pub kernel: String,
    pub initramfs: String,
    /// `root=` argument for the kernel.
    pub root_device: String,
    #[serde(default)]
    pub cmdline: Vec<String>,
}

impl BootScript {
    fn linux_line(&self) -> String {
        let mut linux = format!("linux {} root={}", self.kernel, self.root_device);
        for arg in &self.cmdline {
            linux.push(' ');
            linux.push_str(arg);
        }
        linux
    }

    pub fn render(&self) -> String {
        format!(
            "insmod linux\n{}\ninitrd {}\nboot\n",
            self.linux_line(),
            self.initramfs
        )
    }

    /// The same script with partition `from` replaced by `to` in every
    /// drive reference and in `root=`.
    pub fn retarget(&self, from: &SlotTarget, to: &SlotTarget) -> BootScript {
        BootScript {
            kernel: retarget_drive(&self.kernel, from.number, to.number),
            initramfs: retarget_drive(&self.initramfs, from.number, to.number),
            root_device: retarget_root(&self.root_device, from, to),
            cmdline: self.cmdline.clone(),
        }
    }
}

/// A root slot's partition, as known before the disk is laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTarget {
    pub number: u32,
    pub name: String,
}

impl SlotTarget {
    pub fn new(slot: Slot, number: u32) -> Self {
        Self {
            number,
            name: slot.partition_name().to_string(),
        }
    }
}

/// Partitions an A/B boot script chooses between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotPartitions {
    pub a: u32,
    pub b: u32,
    /// Partition holding the GRUB environment block.
    pub env: u32,
}

impl SlotPartitions {
    fn number(&self, slot: Slot) -> u32 {
        match slot {
            Slot::A => self.a,
            Slot::B => self.b,
        }
    }
}

/// Modules the A/B script needs on top of the recipe's.
const SLOT_MODULES: [&str; 2] = ["loadenv", "test"];

fn retarget_drive(text: &str, from: u32, to: u32) -> String {
    text.replace(&format!("(hd0,{from})"), &format!("(hd0,{to})"))
        .replace(&format!("(hd0,gpt{from})"), &format!("(hd0,gpt{to})"))
}

fn retarget_root(root: &str, from: &SlotTarget, to: &SlotTarget) -> String {
    if let Some(label) = root.strip_prefix("PARTLABEL=") {
        if label == from.name {
            return format!("PARTLABEL={}", to.name);
        }
        return root.to_string();
    }
    let device = root.trim_end_matches(|c: char| c.is_ascii_digit());
    if root[device.len()..] == from.number.to_string() {
        format!("{}{}", device, to.number)
    } else {
        root.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootConfig {
    /// GRUB platform, e.g. `i386-pc`.
    pub target: String,
    pub modules: Vec<String>,
    /// Where GRUB looks for modules and its config at runtime.
    pub prefix: String,
    pub script: BootScript,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            target: "i386-pc".to_string(),
            modules: ["biosdisk", "part_gpt", "squash4"]
                .map(String::from)
                .to_vec(),
            prefix: "(hd0,2)/usr/lib/grub".to_string(),
            script: BootScript {
                kernel: "(hd0,2)/boot/vmlinuz-lts".to_string(),
                initramfs: "(hd0,2)/boot/initramfs-lts".to_string(),
                root_device: "/dev/sda2".to_string(),
                cmdline: Vec::new(),
            },
        }
    }
}

impl BootConfig {
    /// Per-slot scripts: slot A is the configured script, slot B the same
    /// script moved to slot B's partition.
    fn slot_scripts(&self, slots: &SlotPartitions) -> [(Slot, BootScript); 2] {
        let a = SlotTarget::new(Slot::A, slots.a);
        let b = SlotTarget::new(Slot::B, slots.b);
        [
            (Slot::A, self.script.clone()),
            (Slot::B, self.script.retarget(&a, &b)),
        ]
    }

    /// Script embedded into core.img.
    pub fn script_text(&self, slots: Option<&SlotPartitions>) -> String {
        let Some(slots) = slots else {
            return self.script.render();
        };
        let [(_, a), (_, b)] = self.slot_scripts(slots);
        let prefix_b = retarget_drive(&self.prefix, slots.a, slots.b);
        format!(
            "insmod linux\n\
             set {var}={a_value}\n\
             load_env -f (hd0,{env})+2 {var}\n\
             if [ \"${var}\" = {b_value} ]; then\n\
             \x20 set prefix={prefix_b}\n\
             \x20 {linux_b}\n\
             \x20 initrd {initrd_b}\n\
             else\n\
             \x20 set prefix={prefix_a}\n\
             \x20 {linux_a}\n\
             \x20 initrd {initrd_a}\n\
             fi\n\
             boot\n",
            var = crate::ab::bootenv::ACTIVE_VAR,
            a_value = Slot::A.env_value(),
            b_value = Slot::B.env_value(),
            env = slots.env,
            prefix_a = self.prefix,
            linux_a = a.linux_line(),
            initrd_a = a.initramfs,
            linux_b = b.linux_line(),
            initrd_b = b.initramfs,
        )
    }

    /// Modules built into core.img.
    pub fn modules_for(&self, slots: Option<&SlotPartitions>) -> Vec<String> {
        let mut modules = self.modules.clone();
        if slots.is_some() {
            for m in SLOT_MODULES {
                if !modules.iter().any(|have| have == m) {
                    modules.push(m.to_string());
                }
            }
        }
        modules
    }
}

/// Built core and boot images.
#[derive(Debug, Clone)]
pub struct BootImages {
    pub core: PathBuf,
    pub boot: PathBuf,
    pub cached: bool,
}

/// Where core.img goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStrategy {
    /// Into the BIOS boot partition with this (1-based) number.
    BiosBootPartition(u32),
    /// Into a fixed, unpartitioned sector range.
    FixedSectors { start_lba: u64, max_sectors: u64 },
}

fn layout_error(msg: String) -> anyhow::Error {
    BuildError::Layout(msg).into()
}

/// `(hdD,N)` and `(hdD,gptN)` references in `text`.
fn drive_refs(text: &str) -> Vec<(String, Option<(u32, u32)>)> {
    let mut refs = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("(hd") {
        let after = &rest[start + 1..];
        let Some(end) = after.find(')') else {
            refs.push((after.to_string(), None));
            break;
        };
        let inner = &after[..end];
        let parsed = inner.strip_prefix("hd").and_then(|s| {
            let (disk, part) = s.split_once(',')?;
            let part = part.strip_prefix("gpt").unwrap_or(part);
            Some((disk.parse().ok()?, part.parse().ok()?))
        });
        refs.push((format!("({inner})"), parsed));
        rest = &after[end + 1..];
    }
    refs
}

/// Partition named by a kernel `root=` value, if it can be determined.
fn root_partition<'a>(root: &str, plan: &'a DiskPlan) -> std::result::Result<&'a Partition, String> {
    if let Some(label) = root.strip_prefix("PARTLABEL=") {
        return plan
            .by_name(label)
            .ok_or_else(|| format!("root={root} names no partition"));
    }

    let dev = root
        .strip_prefix("/dev/")
        .ok_or_else(|| format!("cannot check root={root} against the partition layout"))?;
    let number = if let Some(rest) = dev
        .strip_prefix("nvme0n1p")
        .or_else(|| dev.strip_prefix("mmcblk0p"))
    {
        rest
    } else if let Some(rest) = ["sda", "vda", "hda", "xvda"]
        .iter()
        .find_map(|d| dev.strip_prefix(d))
    {
        rest
    } else {
        return Err(format!(
            "root={root} is not on the first disk or is not a recognised device"
        ));
    };
    let number: u32 = number
        .parse()
        .map_err(|_| format!("root={root} has no partition number"))?;
    plan.partition(number)
        .ok_or_else(|| format!("root={root} refers to partition {number}, which does not exist"))
}

/// Check that the boot configuration agrees with the partition layout.
///
/// With slots, both branches of the script are checked and each slot's
/// `root=` must name that slot's partition.
pub fn validate_layout(
    config: &BootConfig,
    slots: Option<&SlotPartitions>,
    plan: &DiskPlan,
) -> Result<()> {
    if !config.modules.iter().any(|m| m == "part_gpt") {
        return Err(layout_error(
            "boot modules must include part_gpt to read a GPT disk".into(),
        ));
    }

    let script = config.script_text(slots);
    for (source, text) in [("prefix", config.prefix.as_str()), ("script", script.as_str())] {
        for (raw, parsed) in drive_refs(text) {
            let Some((disk, number)) = parsed else {
                return Err(layout_error(format!("unparsable device {raw} in boot {source}")));
            };
            if disk != 0 {
                return Err(layout_error(format!(
                    "boot {source} references {raw}, but the image is a single disk (hd0)"
                )));
            }
            match plan.partition(number) {
                Some(p) if p.kind == PartitionType::LinuxData => {}
                Some(p) => {
                    return Err(layout_error(format!(
                        "boot {source} references {raw}, which is partition '{}' of type {}",
                        p.name, p.kind
                    )))
                }
                None => {
                    return Err(layout_error(format!(
                        "boot {source} references {raw}, but the disk has {} partition(s)",
                        plan.partitions.len()
                    )))
                }
            }
        }
    }

    let Some(slots) = slots else {
        return check_root(&config.script.root_device, plan).map(|_| ());
    };
    for (slot, script) in config.slot_scripts(slots) {
        let root = &script.root_device;
        let p = check_root(root, plan)?;
        if p.number != slots.number(slot) {
            return Err(layout_error(format!(
                "slot {slot} boots root={root}, which is partition '{}' instead of {}",
                p.name,
                slot.partition_name()
            )));
        }
    }
    Ok(())
}

fn check_root<'a>(root: &str, plan: &'a DiskPlan) -> Result<&'a Partition> {
    match root_partition(root, plan) {
        Ok(p) if p.kind == PartitionType::LinuxData => Ok(p),
        Ok(p) => Err(layout_error(format!(
            "root={root} is partition '{}' of type {}",
            p.name, p.kind
        ))),
        Err(msg) => Err(layout_error(msg)),
    }
}

/// `grub-mkimage` invocation.
pub fn mkimage_command(
    config: &BootConfig,
    slots: Option<&SlotPartitions>,
    module_dir: &Path,
    script: &Path,
    core: &Path,
) -> Cmd {
    Cmd::new("grub-mkimage")
        .args(["-O", &config.target])
        .arg("-d")
        .arg_path(module_dir)
        .args(["-p", &config.prefix])
        .arg("-c")
        .arg_path(script)
        .arg("-o")
        .arg_path(core)
        .args(config.modules_for(slots))
        .error_msg("grub-mkimage failed")
}

fn artifact_key(
    snapshot: &SnapshotId,
    config: &BootConfig,
    slots: Option<&SlotPartitions>,
) -> Result<CacheKey> {
    Ok(CacheKey::derive(
        "image-builder/grub/v2",
        &[
            snapshot.as_str().as_bytes(),
            &serde_json::to_vec(config)?,
            &serde_json::to_vec(&slots)?,
        ],
    ))
}

/// Build core.img and boot.img from the GRUB modules inside `snapshot`.
pub fn build(
    store: &dyn SnapshotStore,
    cache: &ContentCache,
    snapshot: &SnapshotId,
    config: &BootConfig,
    slots: Option<&SlotPartitions>,
    out_dir: &Path,
) -> Result<BootImages> {
    let core = out_dir.join("grub-core.img");
    let boot = out_dir.join("grub-boot.img");
    fs::create_dir_all(out_dir)?;

    let key = artifact_key(snapshot, config, slots)?;
    if cache.restore_artifact(CORE_ARTIFACT, &key, &core)?
        && cache.restore_artifact(BOOT_ARTIFACT, &key, &boot)?
    {
        info!(snapshot = %snapshot.short(), "grub images restored from cache");
        return Ok(BootImages {
            core,
            boot,
            cached: true,
        });
    }

    let script = out_dir.join("grub-embedded.cfg");
    fs::write(&script, config.script_text(slots))?;

    let mount = Mount::open(store, snapshot)?;
    let module_dir = mount.root().join("usr/lib/grub").join(&config.target);
    if !module_dir.is_dir() {
        return Err(BuildError::Configuration(format!(
            "image has no GRUB modules for {} (missing /usr/lib/grub/{})",
            config.target, config.target
        ))
        .into());
    }
    mkimage_command(config, slots, &module_dir, &script, &core).run()?;
    fs::copy(module_dir.join("boot.img"), &boot)
        .with_context(|| format!("copying boot.img from {}", module_dir.display()))?;
    mount.release()?;

    let boot_len = fs::metadata(&boot)?.len();
    if boot_len != SECTOR_SIZE {
        bail!("boot.img is {} bytes, expected {}", boot_len, SECTOR_SIZE);
    }

    cache.put_artifact_file(CORE_ARTIFACT, &key, &core, BTreeMap::new())?;
    cache.put_artifact_file(BOOT_ARTIFACT, &key, &boot, BTreeMap::new())?;
    info!(
        snapshot = %snapshot.short(),
        core_bytes = fs::metadata(&core)?.len(),
        "built grub images"
    );

    Ok(BootImages {
        core,
        boot,
        cached: false,
    })
}

impl InstallStrategy {
    /// Sector range (first LBA, sector count) available to core.img.
    pub fn region(&self, plan: &DiskPlan) -> Result<(u64, u64)> {
        match *self {
            InstallStrategy::BiosBootPartition(number) => {
                let p = plan.partition(number).ok_or_else(|| {
                    layout_error(format!("no partition {number} to hold the boot code"))
                })?;
                if p.kind != PartitionType::BiosBoot {
                    return Err(layout_error(format!(
                        "partition {} ('{}') is {}, not bios-boot",
                        number, p.name, p.kind
                    )));
                }
                Ok((p.first_lba(), p.sectors()))
            }
            InstallStrategy::FixedSectors {
                start_lba,
                max_sectors,
            } => {
                let primary_end = 1 + GPT_RESERVED_SECTORS;
                let backup_start = plan.total_sectors() - GPT_RESERVED_SECTORS;
                let end = start_lba
                    .checked_add(max_sectors)
                    .ok_or_else(|| layout_error("fixed boot sector range overflows".into()))?;
                if max_sectors == 0 {
                    return Err(layout_error("fixed boot sector range is empty".into()));
                }
                if start_lba < primary_end || end > backup_start {
                    return Err(layout_error(format!(
                        "boot sectors {}..{} overlap the GPT (usable {}..{})",
                        start_lba, end, primary_end, backup_start
                    )));
                }
                if let Some(p) = plan
                    .partitions
                    .iter()
                    .find(|p| start_lba <= p.last_lba() && p.first_lba() < end)
                {
                    return Err(layout_error(format!(
                        "boot sectors {}..{} overlap partition '{}'",
                        start_lba, end, p.name
                    )));
                }
                Ok((start_lba, max_sectors))
            }
        }
    }
}

/// Write core.img at `first_lba` and the patched boot.img at LBA 0.
///
/// `capacity_sectors` bounds core.img; the device's current MBR disk
/// signature and partition table are kept.
pub fn embed<D: Read + Write + Seek>(
    dev: &mut D,
    first_lba: u64,
    capacity_sectors: u64,
    core: &[u8],
    boot: &[u8],
) -> Result<()> {
    if boot.len() != SECTOR_SIZE as usize {
        bail!("boot.img is {} bytes, expected {}", boot.len(), SECTOR_SIZE);
    }
    if core.len() < 2 * SECTOR_SIZE as usize {
        bail!("core.img is only {} bytes", core.len());
    }

    let mut core = core.to_vec();
    let padded = (core.len() as u64).div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
    core.resize(padded as usize, 0);
    let sectors = padded / SECTOR_SIZE;
    if sectors > capacity_sectors {
        return Err(BuildError::overflow(
            "core.img",
            padded,
            capacity_sectors * SECTOR_SIZE,
        )
        .into());
    }
    let rest = u16::try_from(sectors - 1)
        .map_err(|_| anyhow::anyhow!("core.img of {} sectors exceeds the blocklist", sectors))?;

    core[BLOCKLIST_TERMINATOR].fill(0);
    core[BLOCKLIST_START..BLOCKLIST_START + 8].copy_from_slice(&(first_lba + 1).to_le_bytes());
    core[BLOCKLIST_START + 8..BLOCKLIST_START + 10].copy_from_slice(&rest.to_le_bytes());
    core[BLOCKLIST_START + 10..BLOCKLIST_START + 12]
        .copy_from_slice(&CORE_LOAD_SEGMENT.to_le_bytes());

    let mut mbr = [0u8; SECTOR_SIZE as usize];
    dev.seek(SeekFrom::Start(0))?;
    dev.read_exact(&mut mbr)?;

    let mut boot = boot.to_vec();
    boot[BOOT_KERNEL_SECTOR..BOOT_KERNEL_SECTOR + 8].copy_from_slice(&first_lba.to_le_bytes());
    boot[BOOT_DRIVE_CHECK] = 0x90;
    boot[BOOT_DRIVE_CHECK + 1] = 0x90;
    boot[MBR_PRESERVE].copy_from_slice(&mbr[MBR_PRESERVE]);

    dev.seek(SeekFrom::Start(first_lba * SECTOR_SIZE))?;
    dev.write_all(&core)?;
    dev.seek(SeekFrom::Start(0))?;
    dev.write_all(&boot)?;
    dev.flush()?;
    Ok(())
}

/// Install built images into `disk` using `strategy`.
pub fn install(disk: &DiskImage, strategy: InstallStrategy, images: &BootImages) -> Result<()> {
    let (first_lba, capacity) = strategy.region(disk.plan())?;
    let core = fs::read(&images.core)
        .with_context(|| format!("reading {}", images.core.display()))?;
    let boot = fs::read(&images.boot)
        .with_context(|| format!("reading {}", images.boot.display()))?;

    let mut dev = OpenOptions::new()
        .read(true)
        .write(true)
        .open(disk.path())
        .with_context(|| format!("opening {}", disk.path().display()))?;
    embed(&mut dev, first_lba, capacity, &core, &boot)?;
    dev.sync_all()?;

    info!(
        strategy = ?strategy,
        first_lba,
        core_bytes = core.len(),
        "installed grub"
    );
    Ok(())
}
