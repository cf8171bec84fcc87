//! Artifact builders for the finished image.
//!
//! - [`squashfs`] - Compressed root filesystem (mksquashfs)
//! - [`disk`] - GPT disk layout, creation and payload writes
//! - [`bootloader`] - GRUB core/boot images and their installation
//!
//! Built artifacts are cached in the [`ContentCache`](crate::cache::ContentCache)
//! keyed by the snapshot they were built from.

pub mod bootloader;
pub mod disk;
pub mod squashfs;
