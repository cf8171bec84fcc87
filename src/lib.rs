//! Cached, reproducible builds of minimal Linux disk images.
//!
//! An image is described by a TOML recipe: a base snapshot and an ordered
//! list of steps (install packages, add files, run commands, ...). Every
//! step is cached by a key derived from its parent snapshot and its
//! parameters, so a rebuild only re-runs what changed. The final snapshot
//! is packed into a squashfs, laid out on a GPT disk and made bootable with
//! GRUB.
//!
//! # Architecture
//!
//! ```text
//! config ──> engine ──steps──> snapshot store (dir | buildah)
//!              │                       │
//!              └── cache ◄─────────────┤
//!                                      ▼
//!                   artifact::squashfs, artifact::bootloader
//!                                      │
//!                                      ▼
//!                        artifact::disk (GPT, payloads)
//! ```
//!
//! Images built with two root slots are governed on the device by [`ab`],
//! which confirms a boot or rolls back to the other slot.

pub mod ab;
pub mod artifact;
pub mod build;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fsutil;
pub mod logging;
pub mod preflight;
pub mod process;
pub mod snapshot;
pub mod step;

pub use build::{build_image, BuildContext, BuildReport};
pub use config::ImageConfig;
pub use engine::{BuildOutcome, StepEngine};
pub use error::BuildError;
pub use snapshot::{SnapshotId, SnapshotStore};
pub use step::Step;
