//! Filesystem formatting

use crate::utils::command::{Executor, Invocation};
use crate::utils::error::Result;
use tracing::info;

pub fn vfat_invocation(partition: &str, label: &str) -> Invocation {
    Invocation::new("mkfs.vfat").args(["-F", "32", "-n", label, partition])
}

pub fn ext4_invocation(device: &str, uuid: &str, label: &str) -> Invocation {
    Invocation::new("mkfs.ext4").args(["-F", "-U", uuid, "-L", label, device])
}

/// Format the EFI partition as FAT32
pub fn format_efi(cmd: &dyn Executor, partition: &str) -> Result<()> {
    info!("Formatting {} as FAT32 (EFI)", partition);
    cmd.execute(&vfat_invocation(partition, "efi"))?;
    Ok(())
}

/// Format a device as ext4 with a fixed UUID and label
pub fn format_ext4(cmd: &dyn Executor, device: &str, uuid: &str, label: &str) -> Result<()> {
    info!("Formatting {} as ext4 (label {}, UUID {})", device, label, uuid);
    cmd.execute(&ext4_invocation(device, uuid, label))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ext4_sets_uuid_and_label() {
        let inv = ext4_invocation("/dev/vg0/rootlv", "11111111-2222-4333-8444-555555555555", "rootlv");
        assert_eq!(
            inv.to_string(),
            "mkfs.ext4 -F -U 11111111-2222-4333-8444-555555555555 -L rootlv /dev/vg0/rootlv"
        );
    }

    #[test]
    fn vfat_is_fat32() {
        assert_eq!(
            vfat_invocation("/dev/loop0p1", "efi").to_string(),
            "mkfs.vfat -F 32 -n efi /dev/loop0p1"
        );
    }
}
