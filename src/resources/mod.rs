//! Scratch locations used during a build
//!
//! Both are keyed by process id so concurrent builds on one host never
//! share a mount tree or script directory.

use std::path::{Path, PathBuf};

/// Prefix of per-build mount trees under the temp directory
pub const MOUNT_BASE_PREFIX: &str = "lvmrootfs-mnt-";

/// Prefix of per-build script directories under the temp directory
pub const SCRIPT_DIR_PREFIX: &str = "lvmrootfs-";

/// Root LV mount point inside the mount base
pub const SYSTEM_DIR: &str = "system";

/// Mount base for the current process
pub fn mount_base() -> PathBuf {
    mount_base_in(&std::env::temp_dir(), std::process::id())
}

pub fn mount_base_in(tmp: &Path, pid: u32) -> PathBuf {
    tmp.join(format!("{}{}", MOUNT_BASE_PREFIX, pid))
}

/// Default directory for emitted scripts
pub fn script_dir() -> PathBuf {
    std::env::temp_dir().join(format!("{}{}", SCRIPT_DIR_PREFIX, std::process::id()))
}

/// `<base>/system`
pub fn system_dir(base: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), SYSTEM_DIR)
}

/// Mount point of `target` (an absolute path inside the image) below `base`
pub fn target_under(base: &str, target: &str) -> String {
    let system = system_dir(base);
    match target.trim_start_matches('/') {
        "" => system,
        rest => format!("{}/{}", system, rest),
    }
}

/// Whether `path` lies in a mount tree left behind by some build
pub fn is_build_mount(tmp: &Path, path: &str) -> bool {
    let prefix = tmp.join(MOUNT_BASE_PREFIX);
    path.starts_with(prefix.to_string_lossy().as_ref())
}
