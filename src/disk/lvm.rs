//! LVM operations
//!
//! Every call goes through the single `lvm` multiplexer with `--nolocking`,
//! since the build host may have no lock daemon and the VG is private to
//! this image.

use crate::config::{LogicalVolumeSpec, SizeExpr};
use crate::utils::command::{Executor, Invocation};
use crate::utils::error::Result;
use tracing::info;

fn lvm(subcommand: &str) -> Invocation {
    Invocation::new("lvm").args([subcommand, "--nolocking"])
}

pub fn pvcreate_invocation(device: &str) -> Invocation {
    lvm("pvcreate").args(["-ff", "-y", device])
}

pub fn vgcreate_invocation(vg_name: &str, pv_device: &str) -> Invocation {
    lvm("vgcreate").args([vg_name, pv_device])
}

/// `-L <n>M` for absolute sizes, `-l <pct>%<base>` for percentages
pub fn lvcreate_invocation(vg_name: &str, lv_name: &str, size: &SizeExpr) -> Invocation {
    let size_args = match size {
        SizeExpr::Megabytes(mb) => ["-L".to_string(), format!("{}M", mb)],
        other => ["-l".to_string(), other.to_string()],
    };
    lvm("lvcreate").args(size_args).args(["-n", lv_name, vg_name])
}

pub fn deactivate_invocation(vg_name: &str) -> Invocation {
    lvm("vgchange").args(["-an", vg_name])
}

/// Create a physical volume on a device
pub fn create_pv(cmd: &dyn Executor, device: &str) -> Result<()> {
    info!("Creating LVM physical volume on {}", device);
    cmd.execute(&pvcreate_invocation(device))?;
    Ok(())
}

/// Create a volume group
pub fn create_vg(cmd: &dyn Executor, vg_name: &str, pv_device: &str) -> Result<()> {
    info!("Creating volume group '{}' on {}", vg_name, pv_device);
    cmd.execute(&vgcreate_invocation(vg_name, pv_device))?;
    info!("Volume group '{}' created", vg_name);
    Ok(())
}

/// Create a logical volume. `size` overrides the volume's own expression
/// (the root volume's remainder is resolved by the layout).
pub fn create_lv(
    cmd: &dyn Executor,
    vg_name: &str,
    lv: &LogicalVolumeSpec,
    size: &SizeExpr,
) -> Result<String> {
    info!("Creating logical volume {}/{} ({})", vg_name, lv.name, size);
    cmd.execute(&lvcreate_invocation(vg_name, &lv.name, size))?;
    Ok(lv_path(vg_name, &lv.name))
}

/// Get the device path for a logical volume
pub fn lv_path(vg_name: &str, lv_name: &str) -> String {
    format!("/dev/{}/{}", vg_name, lv_name)
}
