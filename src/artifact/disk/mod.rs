//! Raw GPT disk images, built without root privileges or external tools.
//!
//! - [`partitions`] plans the layout
//! - [`gpt`] writes (and reads back) the partition table
//! - [`assembly`] splices payload files into partitions

pub mod assembly;
pub mod gpt;
pub mod partitions;

pub use assembly::{write_partitions, PartitionWrite};
pub use partitions::{plan, DiskPlan, Partition, PartitionSpec, PartitionType, SizeHint};

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::info;

/// A freshly created disk image and the plan it was created from.
#[derive(Debug, Clone)]
pub struct DiskImage {
    path: PathBuf,
    plan: DiskPlan,
}

impl DiskImage {
    /// Create the backing file and write the partition table.
    pub fn create(path: &Path, plan: DiskPlan, label: &str) -> Result<Self> {
        gpt::create_disk(path, &plan, label)?;
        info!(
            path = %path.display(),
            size_mb = plan.disk_size / 1024 / 1024,
            partitions = plan.partitions.len(),
            "created disk image"
        );
        Ok(Self {
            path: path.to_path_buf(),
            plan,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn plan(&self) -> &DiskPlan {
        &self.plan
    }

    pub fn write(&self, writes: &[PartitionWrite<'_>]) -> Result<()> {
        write_partitions(&self.path, writes)
    }
}
