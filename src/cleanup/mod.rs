//! Teardown of everything a build acquired, plus manual recovery
//!
//! Teardown is best-effort: each step is attempted even when an earlier one
//! failed, and nothing here ever returns an error.

pub mod orphans;

use crate::disk::{encryption, loopdev, lvm};
use crate::provision::tracker::{Resource, ResourceTracker};
use crate::resources;
use crate::utils::command::{run_best_effort, Executor, Invocation};
use std::path::Path;
use tracing::{info, warn};

pub fn umount_invocation(target: &str) -> Invocation {
    Invocation::new("umount").arg(target)
}

/// Remove the (now empty) mount tree
pub fn rmdir_invocation(base: &str) -> Invocation {
    Invocation::new("rmdir").args([resources::system_dir(base), base.to_string()])
}

/// The release command for a resource, if it needs one
pub fn release_invocation(resource: &Resource) -> Option<Invocation> {
    let inv = match resource {
        Resource::Mount(target) => Some(umount_invocation(target)),
        Resource::VolumeGroup(vg) => Some(lvm::deactivate_invocation(vg)),
        Resource::CryptMapping { name, .. } => Some(encryption::close_invocation(name)),
        Resource::LoopDevice(dev) => Some(loopdev::release_invocation(dev)),
        Resource::MountBase(base) => Some(rmdir_invocation(base)),
        // The image is the artifact; partitions go away with the loop device
        Resource::ImageFile(_) | Resource::Partitions(_) => None,
    };
    inv.map(Invocation::best_effort)
}

/// What teardown did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub released: Vec<String>,
    pub failed: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Release every held resource in reverse acquisition order.
pub fn teardown(cmd: &dyn Executor, tracker: &mut ResourceTracker) -> TeardownReport {
    let mut report = TeardownReport::default();
    let held: Vec<Resource> = tracker.held().rev().cloned().collect();
    if held.is_empty() {
        return report;
    }

    info!("Releasing {} resource(s)", held.len());
    for resource in held {
        let Some(inv) = release_invocation(&resource) else {
            tracker.mark_released(&resource);
            continue;
        };
        if run_best_effort(cmd, &inv).is_some() {
            info!("  ✓ Released {}", resource);
            report.released.push(resource.to_string());
        } else {
            report.failed.push(resource.to_string());
        }
        tracker.mark_released(&resource);
        cmd.released(&resource);
    }

    if report.is_clean() {
        info!("Cleanup complete (all resources released)");
    } else {
        warn!(
            "Cleanup finished with {} failure(s); run `lvmrootfs cleanup` to retry",
            report.failed.len()
        );
    }
    report
}

/// Names of leftovers to release by hand
#[derive(Debug, Default, Clone)]
pub struct CleanupTargets {
    pub vg_name: Option<String>,
    pub luks_name: Option<String>,
    pub loop_device: Option<String>,
}

/// Manual recovery after an interrupted or killed build
pub struct Cleaner<'a> {
    cmd: &'a dyn Executor,
}

impl<'a> Cleaner<'a> {
    pub fn new(cmd: &'a dyn Executor) -> Self {
        Self { cmd }
    }

    /// Unmount stale build mounts, release the named resources, then sweep
    /// orphaned loop devices.
    pub fn cleanup(&self, targets: &CleanupTargets) -> TeardownReport {
        info!("Starting cleanup of leftover build resources");

        let mounts = std::fs::read_to_string("/proc/mounts").unwrap_or_default();
        let mut tracker = ResourceTracker::new();
        if let Some(dev) = &targets.loop_device {
            tracker.push(Resource::LoopDevice(dev.clone()));
        }
        if let Some(name) = &targets.luks_name {
            tracker.push(Resource::CryptMapping {
                name: name.clone(),
                device: String::new(),
            });
        }
        if let Some(vg) = &targets.vg_name {
            tracker.push(Resource::VolumeGroup(vg.clone()));
        }
        // Pushed shallowest first so they are released deepest first
        for target in stale_mounts(&mounts, &std::env::temp_dir()).into_iter().rev() {
            tracker.push(Resource::Mount(target));
        }

        let report = teardown(self.cmd, &mut tracker);
        orphans::scan_orphans(self.cmd);
        report
    }
}

/// Build mounts listed in `/proc/mounts` content, deepest first.
pub fn stale_mounts(proc_mounts: &str, tmp: &Path) -> Vec<String> {
    let mut mount_points: Vec<String> = proc_mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter(|mp| resources::is_build_mount(tmp, mp))
        .map(str::to_string)
        .collect();

    mount_points.sort_by_key(|mp| std::cmp::Reverse(mp.matches('/').count()));
    mount_points
}
