//! Loop device attach, detach and enumeration

use crate::utils::command::{Executor, Invocation};
use crate::utils::error::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

/// Script variable the attached device is bound to
pub const LOOP_DEVICE_VAR: &str = "LOOP_DEVICE";

const DELETED_SUFFIX: &str = " (deleted)";

// /dev/loop0: [0805]:1234 (/path/to/file)
static LISTING_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^:\s]+):[^(]*\((.+)\)\s*$").expect("static regex"));

pub fn attach_invocation(image: &str) -> Invocation {
    Invocation::new("losetup")
        .args(["--find", "--show", image])
        .binds(LOOP_DEVICE_VAR)
}

pub fn attach_partscan_invocation(image: &str) -> Invocation {
    Invocation::new("losetup")
        .args(["--find", "--show", "--partscan", image])
        .binds(LOOP_DEVICE_VAR)
}

/// Detach between partitioning and the partition rescan
pub fn detach_invocation(device: &str) -> Invocation {
    Invocation::new("losetup").args(["--detach", device])
}

/// Detach during teardown and orphan cleanup
pub fn release_invocation(device: &str) -> Invocation {
    Invocation::new("losetup").args(["-d", device]).best_effort()
}

pub fn list_invocation() -> Invocation {
    Invocation::new("losetup").arg("-a").best_effort()
}

/// Attach an image file without scanning partitions. Returns the device path.
pub fn attach(cmd: &dyn Executor, image: &str) -> Result<String> {
    let output = cmd.execute(&attach_invocation(image))?;
    let device = output.stdout_trimmed().to_string();
    info!("Attached {} to {}", image, device);
    Ok(device)
}

/// Attach an image file and have the kernel publish its partitions.
pub fn attach_with_partscan(cmd: &dyn Executor, image: &str) -> Result<String> {
    let output = cmd.execute(&attach_partscan_invocation(image))?;
    let device = output.stdout_trimmed().to_string();
    info!("Attached {} to {} with partition scan", image, device);
    Ok(device)
}

pub fn detach(cmd: &dyn Executor, device: &str) -> Result<()> {
    cmd.execute(&detach_invocation(device))?;
    info!("Detached {}", device);
    Ok(())
}

/// Partition node for a loop device (`/dev/loop0` + 3 -> `/dev/loop0p3`)
pub fn partition_node(device: &str, number: u32) -> String {
    format!("{}p{}", device, number)
}

/// One attached loop device as listed by `losetup -a`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopEntry {
    pub device: String,
    pub backing_file: String,
    /// The kernel already knows the backing file is gone
    pub deleted: bool,
}

/// Parse `losetup -a` output, skipping lines without a backing file.
pub fn parse_listing(text: &str) -> Vec<LoopEntry> {
    text.lines()
        .filter_map(|line| LISTING_LINE.captures(line.trim()))
        .map(|caps| {
            let raw = caps[2].trim();
            let (backing_file, deleted) = match raw.strip_suffix(DELETED_SUFFIX) {
                Some(path) => (path.trim().to_string(), true),
                None => (raw.to_string(), false),
            };
            LoopEntry {
                device: caps[1].to_string(),
                backing_file,
                deleted,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listing_lines() {
        let text = "/dev/loop0: [0805]:1234 (/tmp/build/a.img)\n\
                    /dev/loop1: [0805]:99 (/tmp/gone.img (deleted))\n\
                    \n\
                    garbage line\n";
        let entries = parse_listing(text);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].device, "/dev/loop0");
        assert_eq!(entries[0].backing_file, "/tmp/build/a.img");
        assert!(!entries[0].deleted);
        assert_eq!(entries[1].device, "/dev/loop1");
        assert_eq!(entries[1].backing_file, "/tmp/gone.img");
        assert!(entries[1].deleted);
    }

    #[test]
    fn empty_listing() {
        assert!(parse_listing("").is_empty());
    }

    #[test]
    fn partition_nodes_are_suffixed() {
        assert_eq!(partition_node("/dev/loop7", 3), "/dev/loop7p3");
        assert_eq!(partition_node("${LOOP_DEVICE}", 1), "${LOOP_DEVICE}p1");
    }

    #[test]
    fn attach_binds_loop_device() {
        let inv = attach_partscan_invocation("/tmp/a.img");
        assert_eq!(inv.to_string(), "losetup --find --show --partscan /tmp/a.img");
        assert_eq!(inv.bind, Some(LOOP_DEVICE_VAR));
        assert!(inv.elevate);
    }
}
