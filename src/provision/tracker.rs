//! Record of every resource a provisioning run has acquired.
//!
//! The tracker is append-only: releasing a resource during the pipeline
//! (the loop detach before the partition rescan) flags the entry instead of
//! removing it. Teardown walks the unreleased entries in reverse.

use std::fmt;

/// Something that must be given back to the kernel or filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Sparse backing file; kept as the build artifact
    ImageFile(String),
    /// Attached loop device (e.g. `/dev/loop0`)
    LoopDevice(String),
    /// Partition device nodes published by a partition scan
    Partitions(Vec<String>),
    /// Opened LUKS container
    CryptMapping { name: String, device: String },
    /// Activated volume group
    VolumeGroup(String),
    /// Scratch directory holding the mount tree
    MountBase(String),
    /// Mounted filesystem target
    Mount(String),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImageFile(p) => write!(f, "image {}", p),
            Self::LoopDevice(d) => write!(f, "loop device {}", d),
            Self::Partitions(parts) => write!(f, "partitions {}", parts.join(", ")),
            Self::CryptMapping { name, .. } => write!(f, "LUKS mapping /dev/mapper/{}", name),
            Self::VolumeGroup(vg) => write!(f, "volume group {}", vg),
            Self::MountBase(p) => write!(f, "mount base {}", p),
            Self::Mount(p) => write!(f, "mount {}", p),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    pub resource: Resource,
    pub released: bool,
}

#[derive(Debug, Default)]
pub struct ResourceTracker {
    entries: Vec<Acquisition>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: Resource) {
        self.entries.push(Acquisition {
            resource,
            released: false,
        });
    }

    /// Flag the most recent unreleased matching entry. Returns false when
    /// nothing matched.
    pub fn mark_released(&mut self, resource: &Resource) -> bool {
        match self
            .entries
            .iter_mut()
            .rev()
            .find(|a| !a.released && a.resource == *resource)
        {
            Some(entry) => {
                entry.released = true;
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> &[Acquisition] {
        &self.entries
    }

    /// Unreleased resources in acquisition order.
    pub fn held(&self) -> impl DoubleEndedIterator<Item = &Resource> {
        self.entries
            .iter()
            .filter(|a| !a.released)
            .map(|a| &a.resource)
    }

    /// Currently attached loop device, if any.
    pub fn loop_device(&self) -> Option<&str> {
        self.held().rev().find_map(|r| match r {
            Resource::LoopDevice(d) => Some(d.as_str()),
            _ => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_entries_stay_recorded() {
        let mut tracker = ResourceTracker::new();
        let first = Resource::LoopDevice("/dev/loop0".to_string());
        tracker.push(first.clone());
        assert!(tracker.mark_released(&first));
        tracker.push(Resource::LoopDevice("/dev/loop1".to_string()));

        assert_eq!(tracker.entries().len(), 2);
        assert_eq!(tracker.held().count(), 1);
        assert_eq!(tracker.loop_device(), Some("/dev/loop1"));
    }

    #[test]
    fn mark_released_targets_latest_match() {
        let mut tracker = ResourceTracker::new();
        let dev = Resource::LoopDevice("/dev/loop0".to_string());
        tracker.push(dev.clone());
        tracker.push(Resource::ImageFile("/tmp/a.img".to_string()));
        tracker.push(dev.clone());

        assert!(tracker.mark_released(&dev));
        assert!(!tracker.entries()[0].released);
        assert!(tracker.entries()[2].released);
        assert!(tracker.mark_released(&dev));
        assert!(!tracker.mark_released(&dev));
    }

    #[test]
    fn empty_tracker_holds_nothing() {
        let tracker = ResourceTracker::new();
        assert!(tracker.is_empty());
        assert!(tracker.loop_device().is_none());
    }
}
