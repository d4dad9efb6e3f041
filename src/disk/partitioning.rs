//! GPT partition table creation

use crate::disk::layouts::PartitionDef;
use crate::utils::command::{run_best_effort, Executor, Invocation};
use crate::utils::error::Result;
use tracing::info;

pub fn zap_invocation(device: &str) -> Invocation {
    Invocation::new("sgdisk").args(["--zap-all", device]).best_effort()
}

/// One sgdisk call creating every partition in `table`.
///
/// The first partition starts at 1 MiB; later ones start at the next free
/// sector. A zero size means the rest of the device.
pub fn create_invocation(device: &str, table: &[PartitionDef]) -> Invocation {
    let mut inv = Invocation::new("sgdisk");
    for (i, part) in table.iter().enumerate() {
        let start = if i == 0 { "1MiB" } else { "0" };
        let end = if part.size_mib == 0 {
            "0".to_string()
        } else {
            format!("+{}MiB", part.size_mib)
        };
        inv = inv
            .arg(format!("--new={}:{}:{}", part.number, start, end))
            .arg(format!("--typecode={}:{}", part.number, part.type_code))
            .arg(format!("--change-name={}:{}", part.number, part.name));
    }
    inv.arg(device)
}

/// Wipe any existing partition table signatures. Failure is not fatal on
/// a freshly created image.
pub fn zap(cmd: &dyn Executor, device: &str) {
    info!("Clearing partition table on {}", device);
    run_best_effort(cmd, &zap_invocation(device));
}

/// Write the GPT partition table
pub fn create_partitions(cmd: &dyn Executor, device: &str, table: &[PartitionDef]) -> Result<()> {
    info!("Creating {} GPT partitions on {}", table.len(), device);
    cmd.execute(&create_invocation(device, table))?;
    info!("Partition table written to {}", device);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::layouts::partition_table;

    #[test]
    fn create_arguments_match_fixed_layout() {
        let inv = create_invocation("/dev/loop0", &partition_table());
        assert_eq!(
            inv.args,
            vec![
                "--new=1:1MiB:+512MiB",
                "--typecode=1:EF00",
                "--change-name=1:efi",
                "--new=2:0:+1024MiB",
                "--typecode=2:EA00",
                "--change-name=2:xbootldr",
                "--new=3:0:0",
                "--typecode=3:8304",
                "--change-name=3:crypt_lvm",
                "/dev/loop0",
            ]
        );
    }

    #[test]
    fn zap_targets_whole_device() {
        let inv = zap_invocation("/dev/loop0");
        assert_eq!(inv.to_string(), "sgdisk --zap-all /dev/loop0");
        assert!(inv.best_effort);
    }
}
