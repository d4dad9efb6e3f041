//! Image partition layout and sizing calculations

use crate::config::{DiskConfig, SizeExpr};
use crate::utils::error::{LvmRootfsError, Result};
use tracing::{debug, warn};

/// GPT partition type GUIDs
pub mod partition_types {
    pub const EFI: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
    pub const XBOOTLDR: &str = "BC13C2FF-59E6-4262-A352-B275FD6F7172";
    pub const LINUX_ROOT_X86_64: &str = "4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709";
}

/// EFI System Partition size
pub const EFI_MIB: u64 = 512;
/// XBOOTLDR partition size
pub const BOOT_MIB: u64 = 1024;
/// Reserved for GPT headers and partition alignment
pub const ALIGNMENT_MARGIN_MIB: u64 = 10;
/// Reserved for PV/VG metadata inside the LUKS container
pub const LVM_METADATA_MIB: u64 = 4;

/// A single partition definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDef {
    /// Partition number (1-based)
    pub number: u32,
    /// GPT partition name
    pub name: &'static str,
    /// Size in MiB (0 = remainder of image)
    pub size_mib: u64,
    /// sgdisk short type code
    pub type_code: &'static str,
    /// GPT type GUID
    pub type_guid: &'static str,
    /// Where it lands in the populated tree
    pub mount_point: Option<&'static str>,
}

/// The fixed three-partition table every image gets
pub fn partition_table() -> Vec<PartitionDef> {
    vec![
        PartitionDef {
            number: 1,
            name: "efi",
            size_mib: EFI_MIB,
            type_code: "EF00",
            type_guid: partition_types::EFI,
            mount_point: Some("/boot/efi"),
        },
        PartitionDef {
            number: 2,
            name: "xbootldr",
            size_mib: BOOT_MIB,
            type_code: "EA00",
            type_guid: partition_types::XBOOTLDR,
            mount_point: Some("/boot"),
        },
        PartitionDef {
            number: 3,
            name: "crypt_lvm",
            size_mib: 0,
            type_code: "8304",
            type_guid: partition_types::LINUX_ROOT_X86_64,
            mount_point: None,
        },
    ]
}

/// Computed sizes for one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    pub total_mib: u64,
    /// Size of the LUKS partition
    pub crypt_mib: u64,
    /// Sum of fixed-size additional volumes
    pub fixed_lvs_mib: u64,
    /// Absolute root volume size; `None` when the root fills the VG
    pub root_mib: Option<u64>,
    pub partitions: Vec<PartitionDef>,
}

/// Size the image from the requested rootfs size plus headroom.
pub fn compute_layout(size_mb: u64, extra_mb: u64, config: &DiskConfig) -> Result<ImageLayout> {
    let total_mib = size_mb.checked_add(extra_mb).ok_or_else(|| {
        LvmRootfsError::ConfigError(format!(
            "image size overflows: {} + {} MiB",
            size_mb, extra_mb
        ))
    })?;

    let crypt_mib = total_mib.saturating_sub(EFI_MIB + BOOT_MIB + ALIGNMENT_MARGIN_MIB);
    let requested = config
        .fixed_volumes_mb()
        .and_then(|fixed| fixed.checked_add(LVM_METADATA_MIB).map(|req| (fixed, req)));
    let Some((fixed_lvs_mib, requested_mib)) = requested else {
        return Err(LvmRootfsError::InsufficientSpace {
            available_mb: crypt_mib,
            requested_mb: u64::MAX,
        });
    };

    if requested_mib >= crypt_mib {
        return Err(LvmRootfsError::InsufficientSpace {
            available_mb: crypt_mib,
            requested_mb: requested_mib,
        });
    }

    let root_mib = match config.rootfs_lv.size {
        SizeExpr::Remainder => Some(crypt_mib - requested_mib),
        _ => None,
    };

    if root_mib.is_some() {
        if let Some(lv) = config.additional_lvs.iter().find(|lv| lv.size.is_percent()) {
            warn!(
                "Volume {} ({}) is created after the root volume and only gets what is left; \
                 LUKS header overhead may leave it nothing",
                lv.name, lv.size
            );
        }
    }

    debug!(
        "Layout: total={} MiB, crypt={} MiB, fixed LVs={} MiB, root={:?}",
        total_mib, crypt_mib, fixed_lvs_mib, root_mib
    );

    Ok(ImageLayout {
        total_mib,
        crypt_mib,
        fixed_lvs_mib,
        root_mib,
        partitions: partition_table(),
    })
}

/// Print layout summary
pub fn print_layout_summary(layout: &ImageLayout, config: &DiskConfig) {
    println!("\nPartition layout (total: {} MiB):", layout.total_mib);
    println!("{:<6} {:<10} {:>10} {:<20}", "NUM", "NAME", "SIZE", "MOUNT");
    println!("{}", "-".repeat(50));

    for part in &layout.partitions {
        let size_str = if part.size_mib == 0 {
            format!("{} MiB", layout.crypt_mib)
        } else {
            format!("{} MiB", part.size_mib)
        };

        println!(
            "{:<6} {:<10} {:>10} {:<20}",
            part.number,
            part.name,
            size_str,
            part.mount_point.unwrap_or("-")
        );
    }

    println!(
        "\nLogical volumes (VG {} in /dev/mapper/{}):",
        config.vg_name, config.luks_name
    );
    println!("{:<16} {:>12} {:<20}", "NAME", "SIZE", "MOUNT");
    println!("{}", "-".repeat(50));

    let root_size = match layout.root_mib {
        Some(mib) => format!("{} MiB", mib),
        None => config.rootfs_lv.size.to_string(),
    };
    println!("{:<16} {:>12} {:<20}", config.rootfs_lv.name, root_size, "/");

    for lv in &config.additional_lvs {
        let mount = config
            .mount_points
            .iter()
            .find(|m| m.volume == lv.name)
            .map(|m| m.target.as_str())
            .unwrap_or("-");
        let size = match lv.size_mb {
            Some(mib) => format!("{} MiB", mib),
            None => lv.size.to_string(),
        };
        println!("{:<16} {:>12} {:<20}", lv.name, size, mount);
    }
    println!();
}
