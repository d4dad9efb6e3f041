//! Host capability probing
//!
//! Before anything is created, every privileged utility the build needs is
//! invoked once with a harmless version or help query under the same
//! elevation the build will use. All failures are collected and reported
//! together.

use crate::utils::command::{Executor, Invocation, ProbeOutcome};
use crate::utils::error::{CapabilityFailure, LvmRootfsError, Result};
use std::time::Duration;
use tracing::{debug, error, info};

/// Deadline for each probe. A probe that runs longer is most likely
/// waiting on a password prompt.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A utility and the non-mutating query used to reach it
#[derive(Debug, Clone, Copy)]
pub struct Capability {
    pub utility: &'static str,
    pub query: &'static [&'static str],
    /// Package providing it on common distributions
    pub package: &'static str,
}

impl Capability {
    pub fn invocation(&self) -> Invocation {
        Invocation::new(self.utility).args(self.query.iter().copied())
    }
}

const CATALOG: [Capability; 8] = [
    Capability { utility: "lvm", query: &["version"], package: "lvm2" },
    Capability { utility: "cryptsetup", query: &["--version"], package: "cryptsetup" },
    Capability { utility: "losetup", query: &["--version"], package: "util-linux" },
    Capability { utility: "sgdisk", query: &["--version"], package: "gptfdisk" },
    // mkfs.vfat has no --version on some systems
    Capability { utility: "mkfs.vfat", query: &["--help"], package: "dosfstools" },
    Capability { utility: "mkfs.ext4", query: &["-V"], package: "e2fsprogs" },
    Capability { utility: "mount", query: &["--version"], package: "util-linux" },
    Capability { utility: "umount", query: &["--version"], package: "util-linux" },
];

const RSYNC: Capability = Capability {
    utility: "rsync",
    query: &["--version"],
    package: "rsync",
};

/// Utilities required for a build; rsync only when a payload is copied.
pub fn required_capabilities(populate: bool) -> Vec<Capability> {
    let mut caps = CATALOG.to_vec();
    if populate {
        caps.push(RSYNC);
    }
    caps
}

fn failure_for(cap: &Capability, outcome: &ProbeOutcome) -> Option<CapabilityFailure> {
    let (reason, detail) = match outcome {
        o if o.is_reachable() => return None,
        ProbeOutcome::Exited { code, first_line } => (format!("exit code {}", code), first_line.clone()),
        ProbeOutcome::TimedOut => (
            "timeout".to_string(),
            "possibly waiting for a password".to_string(),
        ),
        ProbeOutcome::NotFound => (
            "not found".to_string(),
            format!("install package '{}'", cap.package),
        ),
        ProbeOutcome::Failed(e) => ("error".to_string(), e.clone()),
    };
    Some(CapabilityFailure {
        utility: cap.utility.to_string(),
        reason,
        detail,
    })
}

/// Probe every capability, then fail once with all failures listed.
pub fn verify_capabilities(cmd: &dyn Executor, caps: &[Capability]) -> Result<()> {
    info!("Verifying privileged access to {} utilities", caps.len());

    let mut failures = Vec::new();
    for cap in caps {
        let outcome = cmd.probe(&cap.invocation(), PROBE_TIMEOUT);
        match failure_for(cap, &outcome) {
            None => {
                if let ProbeOutcome::Exited { first_line, .. } = &outcome {
                    debug!("  ✓ {}: {}", cap.utility, first_line);
                }
            }
            Some(failure) => {
                error!("  ✗ {}", failure);
                failures.push(failure);
            }
        }
    }

    if failures.is_empty() {
        info!("All required utilities are reachable");
        Ok(())
    } else {
        Err(LvmRootfsError::CapabilityCheckFailed(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::FakeExecutor;

    #[test]
    fn all_reachable_passes() {
        let cmd = FakeExecutor::new().failing_with("sgdisk --version", 1);
        assert!(verify_capabilities(&cmd, &required_capabilities(false)).is_ok());
        assert_eq!(cmd.calls().len(), 8);
    }

    #[test]
    fn every_failure_is_reported() {
        let cmd = FakeExecutor::new()
            .timing_out("lvm version")
            .not_found("sgdisk")
            .failing_with("mkfs.ext4 -V", 126);
        let err = verify_capabilities(&cmd, &required_capabilities(false)).unwrap_err();
        match err {
            LvmRootfsError::CapabilityCheckFailed(failures) => {
                let names: Vec<_> = failures.iter().map(|f| f.utility.as_str()).collect();
                assert_eq!(names, ["lvm", "sgdisk", "mkfs.ext4"]);
                assert_eq!(failures[0].reason, "timeout");
                assert_eq!(failures[1].reason, "not found");
                assert_eq!(failures[2].reason, "exit code 126");
            }
            other => panic!("unexpected error: {other}"),
        }
        // Probing continues past the first failure
        assert_eq!(cmd.calls().len(), 8);
    }

    #[test]
    fn rsync_only_when_populating() {
        assert!(!required_capabilities(false).iter().any(|c| c.utility == "rsync"));
        assert!(required_capabilities(true).iter().any(|c| c.utility == "rsync"));
    }

    #[test]
    fn probes_are_elevated_queries() {
        let inv = CATALOG[0].invocation();
        assert_eq!(inv.to_string(), "lvm version");
        assert!(inv.elevate);
    }
}
