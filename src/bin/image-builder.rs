use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use image_builder::ab::bootenv::{BootEnv, ENV_PARTITION};
use image_builder::ab::watchdog::Watchdog;
use image_builder::ab::{AbConfig, AbController, BootPhase, Rebooter, Slot, StateStore, SystemReboot};
use image_builder::cache::ContentCache;
use image_builder::config::{self, Backend, ImageConfig};
use image_builder::snapshot::buildah::BuildahStore;
use image_builder::snapshot::dir::DirSnapshotStore;
use image_builder::snapshot::SnapshotStore;
use image_builder::step::command::{BuildahRunner, ChrootRunner, CommandRunner};
use image_builder::step::packages::Apk;
use image_builder::{build_image, logging, preflight, BuildContext};

#[derive(Parser)]
#[command(name = "image-builder")]
#[command(about = "Cached builds of bootable Linux disk images, plus on-device A/B boot control")]
#[command(
    after_help = "QUICK START:\n  image-builder preflight minimal   Check host tools for images/minimal.toml\n  image-builder build minimal       Build output/minimal/disk.img\n  image-builder cache status        Show cache usage"
)]
struct Cli {
    /// Cache root (step index, artifacts, snapshots)
    #[arg(long, global = true, env = "IMAGE_BUILDER_CACHE")]
    cache_dir: Option<PathBuf>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a recipe
    Build {
        #[command(flatten)]
        recipe: RecipeArgs,

        /// Parent directory of per-image outputs
        #[arg(long, default_value = "output")]
        output: PathBuf,

        /// Skip the host tool check
        #[arg(long)]
        skip_preflight: bool,
    },

    /// Check that the host has every tool a recipe needs
    Preflight {
        #[command(flatten)]
        recipe: RecipeArgs,
    },

    /// Inspect or clean the content cache
    Cache {
        #[command(subcommand)]
        what: CacheCommand,
    },

    /// A/B slot control, run on the device
    Ab {
        /// Directory holding the persisted boot state
        #[arg(long, default_value = "/var/lib/image-builder")]
        state_dir: PathBuf,

        /// Device holding the bootloader's slot selection
        #[arg(long, default_value_t = default_boot_env())]
        boot_env: String,

        #[command(subcommand)]
        what: AbCommand,
    },
}

#[derive(clap::Args)]
struct RecipeArgs {
    /// Image name in the recipe directory, or a path to a .toml recipe
    image: String,

    /// Directory of <name>.toml recipes
    #[arg(long, default_value = "images")]
    recipes: PathBuf,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Show index entries and referenced blob usage
    Status,
    /// Delete blobs no index entry references
    Gc,
}

#[derive(Subcommand)]
enum AbCommand {
    /// Print the persisted state
    Status,
    /// Exit 0 if the active slot is confirmed, 1 otherwise
    IsStable,
    /// Confirm the active slot
    MarkStable,
    /// Start a boot cycle and watch it until confirmed or rolled back
    Boot {
        /// Seconds to wait for confirmation
        #[arg(long, default_value = "120")]
        timeout: u64,
        /// Unconfirmed boots tolerated before giving up on a slot
        #[arg(long, default_value = "3")]
        max_attempts: u32,
    },
    /// Write the initial state (slot A, unconfirmed)
    Provision,
    /// Boot into a slot next, e.g. after writing an update to it
    Activate {
        #[arg(value_enum)]
        slot: SlotArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SlotArg {
    A,
    B,
}

impl From<SlotArg> for Slot {
    fn from(arg: SlotArg) -> Self {
        match arg {
            SlotArg::A => Slot::A,
            SlotArg::B => Slot::B,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Build {
            recipe,
            output,
            skip_preflight,
        } => {
            let config = load_recipe(&recipe)?;
            if skip_preflight {
                warn!("skipping host tool check");
            } else {
                preflight::check_host_tools(&config)?;
            }
            build(&cache_root(cli.cache_dir)?, &config, &output)
        }
        Commands::Preflight { recipe } => {
            let config = load_recipe(&recipe)?;
            preflight::check_host_tools(&config)?;
            println!("All host tools for '{}' are present", config.name);
            Ok(())
        }
        Commands::Cache { what } => cache(&cache_root(cli.cache_dir)?, what),
        Commands::Ab {
            state_dir,
            boot_env,
            what,
        } => ab(&state_dir, BootEnv::new(boot_env), what),
    }
}

fn cache_root(flag: Option<PathBuf>) -> Result<PathBuf> {
    match flag {
        Some(dir) => Ok(dir),
        None => dirs::cache_dir()
            .map(|d| d.join("image-builder"))
            .context("no cache directory for this user; pass --cache-dir"),
    }
}

fn load_recipe(args: &RecipeArgs) -> Result<ImageConfig> {
    let as_path = Path::new(&args.image);
    let path = if as_path.extension().is_some_and(|e| e == "toml") {
        as_path.to_path_buf()
    } else {
        config::locate(&args.recipes, &args.image)?
    };
    ImageConfig::load(&path)
}

fn build(cache_root: &Path, config: &ImageConfig, output: &Path) -> Result<()> {
    let cache = ContentCache::open(cache_root)?;
    let packages = Apk::default();

    let (store, runner): (Box<dyn SnapshotStore>, Box<dyn CommandRunner>) = match config.backend {
        Backend::Dir => (
            Box::new(DirSnapshotStore::open(&cache_root.join("snapshots"))?),
            Box::new(ChrootRunner::default()),
        ),
        Backend::Buildah => (
            Box::new(BuildahStore::default()),
            Box::new(BuildahRunner::default()),
        ),
    };

    let ctx = BuildContext::new(store.as_ref(), &cache, &packages, runner.as_ref(), output);
    let report = build_image(&ctx, config)
        .with_context(|| format!("building image '{}'", config.name))?;

    println!("Built {} ({})", report.name, report.snapshot);
    println!(
        "  steps: {} executed, {} reused",
        report.steps_executed, report.steps_reused
    );
    println!("  disk:  {}", report.disk.display());
    for p in &report.partitions {
        println!(
            "    {} {:<8} {:<10} {:>6} MiB",
            p.number,
            p.name,
            p.kind,
            p.size.div_ceil(1024 * 1024)
        );
    }
    if let Some(env) = &report.boot_env {
        println!("  A/B boot environment: {} (slot A)", env.display());
    }
    Ok(())
}

fn cache(root: &Path, what: CacheCommand) -> Result<()> {
    let cache = ContentCache::open(root)?;
    match what {
        CacheCommand::Status => {
            let status = cache.status()?;
            println!("Cache: {}", status.root.display());
            println!("  step entries:     {}", status.step_entries);
            println!("  artifact entries: {}", status.artifact_entries);
            println!(
                "  blobs:            {} ({} MiB)",
                status.referenced_blobs,
                status.referenced_bytes / 1024 / 1024
            );
        }
        CacheCommand::Gc => {
            let removed = cache.gc()?;
            println!("Removed {} unreferenced blob(s)", removed);
        }
    }
    Ok(())
}

fn default_boot_env() -> String {
    format!("/dev/disk/by-partlabel/{}", ENV_PARTITION)
}

fn ab(state_dir: &Path, boot_env: BootEnv, what: AbCommand) -> Result<()> {
    let controller = |config: AbConfig| AbController::new(config).with_boot_env(boot_env.clone());
    match what {
        AbCommand::Status => {
            let controller = controller(AbConfig::new(state_dir));
            println!("{}", serde_json::to_string_pretty(&controller.status())?);
            match boot_env.active() {
                Ok(slot) => println!("bootloader: slot {}", slot),
                Err(e) => warn!(error = %e, "cannot read boot environment"),
            }
        }
        AbCommand::IsStable => {
            if !controller(AbConfig::new(state_dir)).is_stable() {
                std::process::exit(1);
            }
        }
        AbCommand::MarkStable => {
            let state = controller(AbConfig::new(state_dir)).mark_stable()?;
            println!("Slot {} marked stable", state.active);
        }
        AbCommand::Provision => {
            let state = StateStore::provision(state_dir)?;
            boot_env.set_active(state.active)?;
            println!("Provisioned {}", state_dir.display());
        }
        AbCommand::Activate { slot } => {
            let state = controller(AbConfig::new(state_dir)).activate(slot.into())?;
            println!("Slot {} active from next boot", state.active);
        }
        AbCommand::Boot {
            timeout,
            max_attempts,
        } => {
            let mut config = AbConfig::new(state_dir);
            config.timeout = Duration::from_secs(timeout);
            config.max_attempts = max_attempts;
            boot(Arc::new(controller(config)))?;
        }
    }
    Ok(())
}

fn boot(controller: Arc<AbController>) -> Result<()> {
    let rebooter: Arc<dyn Rebooter> = Arc::new(SystemReboot);
    let slot = match controller.boot()? {
        BootPhase::Stable(slot) => {
            info!(slot = %slot, "nothing to verify");
            return Ok(());
        }
        BootPhase::RollingBack { .. } => return rebooter.reboot(),
        BootPhase::Booting(slot) | BootPhase::Verifying(slot) => slot,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting watchdog runtime")?;
    let outcome = runtime.block_on(async move {
        Watchdog::spawn(slot, controller, rebooter).wait().await
    })?;
    info!(outcome = ?outcome, "boot cycle finished");
    Ok(())
}
