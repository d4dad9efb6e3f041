//! Disk image provisioning
//!
//! Order of a build: validate the configuration and size the layout (no side
//! effects), sweep orphaned loop devices, probe privileged utilities, then
//! run the pipeline and tear down.

pub mod pipeline;
pub mod summary;
pub mod tracker;

use crate::cleanup::orphans::scan_orphans;
use crate::config::{DiskConfig, RawConfig};
use crate::disk::layouts::compute_layout;
use crate::utils::command::Executor;
use crate::utils::deps::{required_capabilities, verify_capabilities};
use crate::utils::error::Result;
use pipeline::{build_image, BuildTarget};
use summary::BuildSummary;

/// Everything a build needs besides the disk configuration
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub size_mb: u64,
    pub extra_mb: u64,
    pub target: BuildTarget,
    /// Run the orphan scan and capability probe first
    pub preflight: bool,
}

/// Orphan scan followed by the capability probe
pub fn preflight(cmd: &dyn Executor, populate: bool) -> Result<()> {
    scan_orphans(cmd);
    verify_capabilities(cmd, &required_capabilities(populate))
}

pub fn provision(cmd: &dyn Executor, raw: &RawConfig, request: &BuildRequest) -> Result<BuildSummary> {
    let config = DiskConfig::from_raw(raw)?;
    let layout = compute_layout(request.size_mb, request.extra_mb, &config)?;

    if request.preflight {
        preflight(cmd, request.target.rootfs_dir.is_some())?;
    }

    build_image(cmd, &config, &layout, &request.target)
}
