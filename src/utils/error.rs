//! Error types for lvmrootfs

use std::fmt;
use thiserror::Error;

/// A privileged utility that did not answer the capability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityFailure {
    /// Catalog name of the utility (e.g. "cryptsetup")
    pub utility: String,
    /// Short reason: exit code, "timeout", "not found", ...
    pub reason: String,
    /// Diagnostic output, if any
    pub detail: String,
}

impl fmt::Display for CapabilityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}: {}", self.utility, self.reason)
        } else {
            write!(f, "{}: {} ({})", self.utility, self.reason, self.detail)
        }
    }
}

fn format_capability_failures(failures: &[CapabilityFailure]) -> String {
    let mut msg = String::from("Privileged access verification failed for:\n");
    for failure in failures {
        msg.push_str(&format!("  - {}\n", failure));
    }
    msg.push_str("\nEnsure sudoers grants NOPASSWD for the storage commands:\n");
    msg.push_str("  sudo visudo -f /etc/sudoers.d/storage\n");
    msg.push_str("  # USERNAME ALL=(root) NOPASSWD: /usr/sbin/lvm, /usr/sbin/cryptsetup, ...\n");
    msg.push_str("  # Defaults env_keep += \"LVM_SUPPRESS_FD_WARNINGS\"");
    msg
}

#[derive(Error, Debug)]
pub enum LvmRootfsError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Insufficient space: {available_mb}MB available, {requested_mb}MB requested")]
    InsufficientSpace { available_mb: u64, requested_mb: u64 },

    #[error("Invalid size expression '{value}': {reason}")]
    InvalidSize { value: String, reason: String },

    #[error("Invalid UUID for {field}: '{value}'")]
    InvalidUuid { field: String, value: String },

    #[error("{}", format_capability_failures(.0))]
    CapabilityCheckFailed(Vec<CapabilityFailure>),

    #[error("Command failed with code {}: {command}\nstderr: {stderr}", .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Partition device {0} not created after partition scan")]
    PartitionNodesMissing(String),

    #[error("Interrupted by signal")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl LvmRootfsError {
    /// Raised before any resource is acquired.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ConfigError(_)
                | Self::InsufficientSpace { .. }
                | Self::InvalidSize { .. }
                | Self::InvalidUuid { .. }
        )
    }

    pub fn is_capability(&self) -> bool {
        matches!(self, Self::CapabilityCheckFailed(_))
    }

    /// A phase command failed; teardown follows, nothing is retried.
    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            Self::CommandFailed { .. } | Self::CommandNotFound(_) | Self::PartitionNodesMissing(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LvmRootfsError>;
