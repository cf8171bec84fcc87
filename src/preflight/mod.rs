//! Preflight checks for build validation.
//!
//! Validates that the host system has the tools a build will call before
//! the first step runs, instead of failing halfway through a pipeline.

use crate::config::{Backend, ImageConfig};
use crate::error::BuildError;
use crate::process;
use anyhow::Result;

/// (command, package providing it)
pub type Tool = (&'static str, &'static str);

/// Needed by every image build.
pub const IMAGE_TOOLS: &[Tool] = &[
    ("mksquashfs", "squashfs-tools"),
    ("grub-mkimage", "grub"),
    ("apk", "apk-tools-static"),
];

const DIR_BACKEND_TOOLS: &[Tool] = &[("chroot", "coreutils")];
const BUILDAH_BACKEND_TOOLS: &[Tool] = &[("buildah", "buildah")];

/// Tools the build of `config` will invoke.
pub fn tools_for(config: &ImageConfig) -> Vec<Tool> {
    let mut tools = IMAGE_TOOLS.to_vec();
    tools.extend_from_slice(match config.backend {
        Backend::Dir => DIR_BACKEND_TOOLS,
        Backend::Buildah => BUILDAH_BACKEND_TOOLS,
    });
    tools
}

/// Check that specific tools are available.
///
/// Fails with a configuration error listing every missing tool and the
/// package to install for it.
pub fn check_required_tools(tools: &[Tool]) -> Result<()> {
    let missing: Vec<&Tool> = tools
        .iter()
        .filter(|(tool, _)| !process::exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(BuildError::Configuration(format!("missing required host tools:\n{}", msg)).into());
    }

    Ok(())
}

pub fn check_host_tools(config: &ImageConfig) -> Result<()> {
    check_required_tools(&tools_for(config))
}
