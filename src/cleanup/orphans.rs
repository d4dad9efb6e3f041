//! Detach loop devices whose backing image no longer exists
//!
//! An interrupted build, a crash, or deleting an image without detaching it
//! leaves the loop device attached. These are swept before every build.

use crate::disk::loopdev::{list_invocation, parse_listing, release_invocation};
use crate::utils::command::{run_best_effort, Executor};
use std::path::Path;
use tracing::{debug, info, warn};

/// Returns how many loop devices were detached. Never fails the build.
pub fn scan_orphans(cmd: &dyn Executor) -> usize {
    let Some(output) = run_best_effort(cmd, &list_invocation()) else {
        warn!("Could not list loop devices, skipping orphan scan");
        return 0;
    };

    let entries = parse_listing(&output.stdout);
    if entries.is_empty() {
        debug!("No loop devices currently attached");
        return 0;
    }

    info!("Checking {} loop device(s) for deleted backing files", entries.len());
    let mut detached = 0;
    for entry in entries {
        if !entry.deleted {
            match cmd.file_exists(Path::new(&entry.backing_file)) {
                Ok(true) => {
                    debug!("{} -> {} (exists, keeping)", entry.device, entry.backing_file);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "Cannot check {} for {} ({}), leaving it attached",
                        entry.backing_file, entry.device, e
                    );
                    continue;
                }
            }
        }

        info!("Orphaned loop device: {} -> {} (deleted)", entry.device, entry.backing_file);
        if run_best_effort(cmd, &release_invocation(&entry.device)).is_some() {
            info!("  ✓ Detached {}", entry.device);
            detached += 1;
        }
    }

    if detached > 0 {
        info!("Removed {} orphaned loop device(s)", detached);
    }
    detached
}
