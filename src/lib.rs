//! lvmrootfs library - encrypted LVM root disk image builder

pub mod cleanup;
pub mod config;
pub mod disk;
pub mod provision;
pub mod resources;
pub mod script;
pub mod utils;

pub use config::{DiskConfig, RawConfig};
pub use utils::error::LvmRootfsError;
