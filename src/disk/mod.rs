//! Disk image building blocks

pub mod encryption;
pub mod formatting;
pub mod layouts;
pub mod loopdev;
pub mod lvm;
pub mod partitioning;
