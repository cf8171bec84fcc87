//! End-to-end: recipe -> cached steps -> disk layout -> payload writes.
//!
//! Package installation and in-image commands are faked, so these tests need
//! neither root nor apk.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use image_builder::ab::bootenv::{self, BootEnv, ENV_PARTITION};
use image_builder::ab::{AbConfig, AbController, BootPhase, Slot, StateStore};
use image_builder::artifact::disk::gpt::read_partition_table;
use image_builder::artifact::disk::{DiskImage, PartitionType, PartitionWrite};
use image_builder::build::layout;
use image_builder::cache::ContentCache;
use image_builder::error::{classify, BuildError};
use image_builder::snapshot::dir::DirSnapshotStore;
use image_builder::snapshot::{Checkout, Mount, SnapshotStore};
use image_builder::step::command::CommandRunner;
use image_builder::step::packages::PackageManager;
use image_builder::step::PackageOptions;
use image_builder::{ImageConfig, StepEngine};
use tempfile::TempDir;

const MIB: u64 = 1024 * 1024;

const RECIPE: &str = r#"
name = "e2e"
base = "scratch"

[[steps]]
kind = "install-packages"
packages = ["a", "b"]

[[steps]]
kind = "add-files"
files."/etc/x" = { content = "v1" }

[[steps]]
kind = "run-command"
argv = ["setup", "--quick"]
"#;

#[derive(Default)]
struct RecordingPackages {
    installs: Mutex<Vec<Vec<String>>>,
}

impl PackageManager for RecordingPackages {
    fn install(&self, root: &Path, names: &[String], _: &PackageOptions) -> Result<()> {
        self.installs.lock().unwrap().push(names.to_vec());
        let world = root.join("etc/apk/world");
        fs::create_dir_all(world.parent().unwrap())?;
        fs::write(world, names.join("\n"))?;
        Ok(())
    }

    fn remove(&self, _: &Path, _: &[String]) -> Result<()> {
        Ok(())
    }

    fn remove_self(&self, root: &Path, _: &[String]) -> Result<()> {
        let _ = fs::remove_dir_all(root.join("etc/apk"));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingRunner {
    runs: Mutex<Vec<String>>,
}

impl CommandRunner for RecordingRunner {
    fn run(&self, checkout: &Checkout, argv: &[String]) -> Result<()> {
        self.runs.lock().unwrap().push(argv.join(" "));
        fs::write(checkout.root.join("ran"), argv.join(" "))?;
        Ok(())
    }
}

struct Env {
    tmp: TempDir,
    store: DirSnapshotStore,
    cache: ContentCache,
    packages: RecordingPackages,
    runner: RecordingRunner,
}

fn env() -> Env {
    let tmp = TempDir::new().unwrap();
    Env {
        store: DirSnapshotStore::open(&tmp.path().join("snapshots")).unwrap(),
        cache: ContentCache::open(&tmp.path().join("cache")).unwrap(),
        packages: RecordingPackages::default(),
        runner: RecordingRunner::default(),
        tmp,
    }
}

impl Env {
    fn engine(&self) -> StepEngine<'_> {
        StepEngine::new(&self.store, &self.cache, &self.packages, &self.runner)
    }
}

/// Sparse file with a marker at both ends.
fn payload(path: &Path, size: u64) {
    let mut f = File::create(path).unwrap();
    f.set_len(size).unwrap();
    f.write_all(b"hsqs").unwrap();
    f.seek(SeekFrom::Start(size - 3)).unwrap();
    f.write_all(b"end").unwrap();
}

fn read_at(path: &Path, offset: u64, len: usize) -> Vec<u8> {
    let mut f = File::open(path).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    let mut buf = vec![0u8; len];
    f.read_exact(&mut buf).unwrap();
    buf
}

#[test]
fn rebuild_reuses_every_step_and_snapshot() {
    let env = env();
    let config = ImageConfig::parse(RECIPE, env.tmp.path()).unwrap();
    let steps = config.steps().unwrap();
    let base = env.store.resolve_base(&config.base_reference()).unwrap();

    let first = env.engine().execute(&base, &steps).unwrap();
    assert_eq!(first.executed(), 3);
    assert_eq!(first.reused(), 0);

    let second = env.engine().execute(&base, &steps).unwrap();
    assert_eq!(second.executed(), 0);
    assert_eq!(second.reused(), 3);
    assert_eq!(second.snapshot, first.snapshot);

    let keys: Vec<_> = first.records.iter().map(|r| r.key.clone()).collect();
    let again: Vec<_> = second.records.iter().map(|r| r.key.clone()).collect();
    assert_eq!(keys, again);

    assert_eq!(
        *env.packages.installs.lock().unwrap(),
        vec![vec!["a".to_string(), "b".to_string()]]
    );
    assert_eq!(*env.runner.runs.lock().unwrap(), vec!["setup --quick"]);

    let mount = Mount::open(&env.store, &second.snapshot).unwrap();
    assert_eq!(fs::read_to_string(mount.root().join("etc/x")).unwrap(), "v1");
    assert_eq!(fs::read_to_string(mount.root().join("etc/apk/world")).unwrap(), "a\nb");
    assert_eq!(fs::read_to_string(mount.root().join("ran")).unwrap(), "setup --quick");
    mount.release().unwrap();
}

#[test]
fn fresh_cache_reproduces_the_same_snapshot() {
    let one = env();
    let two = env();
    let config = ImageConfig::parse(RECIPE, one.tmp.path()).unwrap();
    let steps = config.steps().unwrap();

    let a = one
        .engine()
        .execute(&one.store.resolve_base("scratch").unwrap(), &steps)
        .unwrap();
    let b = two
        .engine()
        .execute(&two.store.resolve_base("scratch").unwrap(), &steps)
        .unwrap();
    assert_eq!(a.snapshot, b.snapshot);
}

fn sized_recipe(linux: &str) -> String {
    format!(
        r#"
name = "sized"
base = "scratch"

[disk]
partitions = [
  {{ name = "grub", size = "1M", type = "bios-boot" }},
  {{ name = "root", size = "{linux}", type = "linux-data" }},
]
"#
    )
}

#[test]
fn payload_fits_partition_of_equal_size() {
    let tmp = TempDir::new().unwrap();
    let config = ImageConfig::parse(&sized_recipe("50M"), tmp.path()).unwrap();
    let plan = layout(&config, 0, 0).unwrap();
    let disk = DiskImage::create(&tmp.path().join("disk.img"), plan, config.disk_label()).unwrap();

    let squashfs = tmp.path().join("rootfs.squashfs");
    payload(&squashfs, 50 * MIB);
    let root = disk.plan().by_name("root").unwrap();
    disk.write(&[PartitionWrite::new(&squashfs, root)]).unwrap();

    assert_eq!(read_at(disk.path(), root.offset, 4), b"hsqs");
    assert_eq!(read_at(disk.path(), root.end() - 3, 3), b"end");
    let table = read_partition_table(disk.path()).unwrap();
    assert_eq!(table.entries[1].name, "root");
    assert_eq!(table.entries[1].first_lba, root.first_lba());
}

#[test]
fn payload_larger_than_partition_is_overflow() {
    let tmp = TempDir::new().unwrap();
    let config = ImageConfig::parse(&sized_recipe("49M"), tmp.path()).unwrap();
    let plan = layout(&config, 0, 0).unwrap();
    let disk = DiskImage::create(&tmp.path().join("disk.img"), plan, config.disk_label()).unwrap();
    let before = fs::read(disk.path()).unwrap();

    let squashfs = tmp.path().join("rootfs.squashfs");
    payload(&squashfs, 50 * MIB);
    let root = disk.plan().by_name("root").unwrap();
    let err = disk.write(&[PartitionWrite::new(&squashfs, root)]).unwrap_err();

    match classify(&err) {
        Some(BuildError::Overflow {
            target,
            needed,
            capacity,
        }) => {
            assert_eq!(target, "root");
            assert_eq!(*needed, 50 * MIB);
            assert_eq!(*capacity, 49 * MIB);
        }
        other => panic!("expected overflow, got {other:?}: {err:#}"),
    }
    assert!(fs::read(disk.path()).unwrap() == before, "disk changed");
}

#[test]
fn ab_image_mirrors_root_and_boots_the_slot_its_environment_names() {
    let tmp = TempDir::new().unwrap();
    let config = ImageConfig::parse("name = \"ab\"\nbase = \"scratch\"\nab = true\n", tmp.path()).unwrap();

    let squashfs = tmp.path().join("rootfs.squashfs");
    payload(&squashfs, 3 * MIB + 512);
    let env_block = tmp.path().join("abenv.img");
    fs::write(&env_block, bootenv::initial_block(Slot::A).unwrap()).unwrap();
    let plan = layout(&config, 24 * 1024, 3 * MIB + 512).unwrap();
    let disk = DiskImage::create(&tmp.path().join("disk.img"), plan, config.disk_label()).unwrap();

    let mut writes: Vec<PartitionWrite<'_>> = config
        .root_partitions()
        .iter()
        .map(|name| PartitionWrite::new(&squashfs, disk.plan().by_name(name).unwrap()))
        .collect();
    let env_partition = disk.plan().by_name(ENV_PARTITION).unwrap();
    writes.push(PartitionWrite::new(&env_block, env_partition));
    disk.write(&writes).unwrap();

    let table = read_partition_table(disk.path()).unwrap();
    let kinds: Vec<_> = table.entries.iter().map(|e| e.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            Some(PartitionType::BiosBoot),
            Some(PartitionType::LinuxData),
            Some(PartitionType::LinuxData),
            Some(PartitionType::LinuxData)
        ]
    );
    let a = disk.plan().by_name("root_a").unwrap();
    let b = disk.plan().by_name("root_b").unwrap();
    let len = (3 * MIB + 512) as usize;
    assert_eq!(read_at(disk.path(), a.offset, len), read_at(disk.path(), b.offset, len));

    // The script GRUB embeds picks the slot from this partition.
    let slots = config.slot_partitions().unwrap().unwrap();
    assert_eq!(slots.env, env_partition.number);
    let script = config.boot.script_text(Some(&slots));
    assert!(script.contains(&format!("load_env -f (hd0,{})+2", env_partition.number)));

    let env = BootEnv::at(disk.path(), env_partition.offset);
    assert_eq!(env.active().unwrap(), Slot::A);

    let state_dir = tmp.path().join("ab-state");
    StateStore::provision(&state_dir).unwrap();
    let controller = AbController::new(AbConfig::new(&state_dir)).with_boot_env(env.clone());
    assert_eq!(controller.boot().unwrap(), BootPhase::Verifying(Slot::A));
    assert_eq!(Slot::A.partition_name(), a.name);

    controller.roll_back().unwrap();
    assert_eq!(env.active().unwrap(), Slot::B);
    assert_eq!(read_at(disk.path(), a.offset, 4), b"hsqs");
}
