//! The twelve-phase provisioning state machine
//!
//! Each [`Stage`] carries only what it needs and hands the next stage its
//! inputs. Every resource is recorded in the tracker the moment it exists,
//! so a failure at any point leaves an exact list for teardown.

use crate::cleanup::{teardown, TeardownReport};
use crate::config::{DiskConfig, LogicalVolumeSpec, SizeExpr};
use crate::disk::layouts::ImageLayout;
use crate::disk::{encryption, formatting, loopdev, lvm, partitioning};
use crate::provision::summary::BuildSummary;
use crate::provision::tracker::{Resource, ResourceTracker};
use crate::resources;
use crate::utils::command::{Executor, Invocation};
use crate::utils::error::Result;
use crate::utils::signal;
use std::time::Duration;
use tracing::info;

pub const PHASE_COUNT: u8 = 12;

/// Time the kernel gets to publish partition nodes after a partition scan
pub const PARTSCAN_SETTLE: Duration = Duration::from_secs(1);

/// Where a build writes and what it copies in.
///
/// Values are used verbatim as command arguments, so the script emitter
/// can pass shell variable references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTarget {
    pub image_path: String,
    /// Source tree copied into the root volume, if any
    pub rootfs_dir: Option<String>,
    /// Scratch directory for the mount tree
    pub mount_base: String,
}

/// Device nodes published for the three partitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNodes {
    pub efi: String,
    pub boot: String,
    pub crypt: String,
}

impl PartitionNodes {
    pub fn for_device(loop_device: &str) -> Self {
        Self {
            efi: loopdev::partition_node(loop_device, 1),
            boot: loopdev::partition_node(loop_device, 2),
            crypt: loopdev::partition_node(loop_device, 3),
        }
    }

    pub fn all(&self) -> Vec<String> {
        vec![self.efi.clone(), self.boot.clone(), self.crypt.clone()]
    }
}

pub fn sparse_image_invocation(image: &str, total_mib: u64) -> Invocation {
    Invocation::new("dd")
        .args([
            "if=/dev/zero".to_string(),
            format!("of={}", image),
            "bs=1M".to_string(),
            "count=0".to_string(),
            format!("seek={}", total_mib),
        ])
        .unprivileged()
}

pub fn mkdir_invocation(path: &str) -> Invocation {
    Invocation::new("mkdir").args(["-p", path])
}

pub fn mount_invocation(device: &str, target: &str) -> Invocation {
    Invocation::new("mount").args([device, target])
}

/// Where the FAT32 ESP is mounted inside the tree
pub const ESP_TARGET: &str = "/boot/efi";

/// Copy the payload preserving hard links, ACLs, xattrs and numeric ids.
/// The ESP subtree is left to [`rsync_esp_invocation`].
pub fn rsync_invocation(source: &str, dest: &str) -> Invocation {
    Invocation::new("rsync").args([
        "-aHAX".to_string(),
        "--numeric-ids".to_string(),
        format!("--exclude={}", ESP_TARGET),
        format!("{}/", source.trim_end_matches('/')),
        format!("{}/", dest.trim_end_matches('/')),
    ])
}

/// Copy only the ESP subtree, without owners, modes, ACLs or xattrs, which
/// vfat refuses. Symlinks and special files are skipped. A source without
/// the subtree copies nothing.
pub fn rsync_esp_invocation(source: &str, dest: &str) -> Invocation {
    Invocation::new("rsync").args([
        "-rt".to_string(),
        "--modify-window=1".to_string(),
        "--include=/boot/".to_string(),
        format!("--include={}/***", ESP_TARGET),
        "--exclude=*".to_string(),
        format!("{}/", source.trim_end_matches('/')),
        format!("{}/", dest.trim_end_matches('/')),
    ])
}

#[derive(Debug)]
enum Stage {
    CreateImage,
    AttachLoop,
    CreateGpt { loop_device: String },
    DetachLoop { loop_device: String },
    Reattach,
    FormatEfi { nodes: PartitionNodes },
    FormatBoot { nodes: PartitionNodes },
    OpenCrypt { nodes: PartitionNodes },
    CreateVolumeGroup { nodes: PartitionNodes, pv_device: String },
    CreateVolumes { nodes: PartitionNodes },
    Populate { nodes: PartitionNodes, root_device: String },
}

enum Transition {
    Next(Stage),
    Finished(String),
}

impl Stage {
    fn describe(&self) -> (u8, &'static str) {
        match self {
            Self::CreateImage => (1, "Creating sparse disk image"),
            Self::AttachLoop => (2, "Attaching loop device"),
            Self::CreateGpt { .. } => (3, "Creating GPT partitions"),
            Self::DetachLoop { .. } => (4, "Detaching loop device"),
            Self::Reattach => (5, "Re-attaching with partition scan"),
            Self::FormatEfi { .. } => (6, "Formatting EFI partition"),
            Self::FormatBoot { .. } => (7, "Formatting XBOOTLDR partition"),
            Self::OpenCrypt { .. } => (8, "Setting up LUKS encryption"),
            Self::CreateVolumeGroup { .. } => (9, "Creating LVM volume group"),
            Self::CreateVolumes { .. } => (10, "Creating logical volumes"),
            Self::Populate { .. } => (11, "Populating root filesystem"),
        }
    }

    fn execute(self, p: &mut Pipeline<'_>) -> Result<Transition> {
        let (cmd, config, layout, target) = (p.cmd, p.config, p.layout, p.target);

        let next = match self {
            Self::CreateImage => {
                let image = &target.image_path;
                cmd.execute(&sparse_image_invocation(image, layout.total_mib))?;
                p.acquire(Resource::ImageFile(image.clone()));
                Self::AttachLoop
            }
            Self::AttachLoop => {
                let loop_device = loopdev::attach(cmd, &target.image_path)?;
                p.acquire(Resource::LoopDevice(loop_device.clone()));
                Self::CreateGpt { loop_device }
            }
            Self::CreateGpt { loop_device } => {
                partitioning::zap(cmd, &loop_device);
                partitioning::create_partitions(cmd, &loop_device, &layout.partitions)?;
                Self::DetachLoop { loop_device }
            }
            Self::DetachLoop { loop_device } => {
                loopdev::detach(cmd, &loop_device)?;
                p.release(&Resource::LoopDevice(loop_device));
                Self::Reattach
            }
            Self::Reattach => {
                let loop_device = loopdev::attach_with_partscan(cmd, &target.image_path)?;
                p.acquire(Resource::LoopDevice(loop_device.clone()));
                let nodes = PartitionNodes::for_device(&loop_device);
                cmd.wait_for_nodes(&nodes.all(), PARTSCAN_SETTLE)?;
                p.acquire(Resource::Partitions(nodes.all()));
                Self::FormatEfi { nodes }
            }
            Self::FormatEfi { nodes } => {
                formatting::format_efi(cmd, &nodes.efi)?;
                Self::FormatBoot { nodes }
            }
            Self::FormatBoot { nodes } => {
                formatting::format_ext4(cmd, &nodes.boot, &config.boot_uuid, "xbootldr")?;
                Self::OpenCrypt { nodes }
            }
            Self::OpenCrypt { nodes } => {
                let passphrase = config.luks_passphrase.as_deref();
                encryption::luks_format(cmd, &nodes.crypt, passphrase)?;
                let pv_device =
                    encryption::luks_open(cmd, &nodes.crypt, &config.luks_name, passphrase)?;
                p.acquire(Resource::CryptMapping {
                    name: config.luks_name.clone(),
                    device: nodes.crypt.clone(),
                });
                Self::CreateVolumeGroup { nodes, pv_device }
            }
            Self::CreateVolumeGroup { nodes, pv_device } => {
                lvm::create_pv(cmd, &pv_device)?;
                lvm::create_vg(cmd, &config.vg_name, &pv_device)?;
                p.acquire(Resource::VolumeGroup(config.vg_name.clone()));
                Self::CreateVolumes { nodes }
            }
            Self::CreateVolumes { nodes } => {
                let (percent, fixed): (Vec<_>, Vec<_>) = config
                    .additional_lvs
                    .iter()
                    .partition(|lv| lv.size.is_percent());

                for lv in fixed {
                    create_and_format(cmd, config, lv, &lv.size)?;
                }

                let root = &config.rootfs_lv;
                let root_size = match layout.root_mib {
                    Some(mib) => SizeExpr::Megabytes(mib),
                    None => root.size,
                };
                let root_device = create_and_format(cmd, config, root, &root_size)?;

                // Consumes whatever the others left
                for lv in percent {
                    create_and_format(cmd, config, lv, &lv.size)?;
                }
                Self::Populate { nodes, root_device }
            }
            Self::Populate { nodes, root_device } => {
                p.populate(&nodes, &root_device)?;
                return Ok(Transition::Finished(root_device));
            }
        };
        Ok(Transition::Next(next))
    }
}

fn create_and_format(
    cmd: &dyn Executor,
    config: &DiskConfig,
    lv: &LogicalVolumeSpec,
    size: &SizeExpr,
) -> Result<String> {
    let device = lvm::create_lv(cmd, &config.vg_name, lv, size)?;
    formatting::format_ext4(cmd, &device, &lv.uuid, &lv.name)?;
    Ok(device)
}

/// Drives the stages over one executor and owns the resource record.
pub struct Pipeline<'a> {
    cmd: &'a dyn Executor,
    config: &'a DiskConfig,
    layout: &'a ImageLayout,
    target: &'a BuildTarget,
    tracker: ResourceTracker,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        cmd: &'a dyn Executor,
        config: &'a DiskConfig,
        layout: &'a ImageLayout,
        target: &'a BuildTarget,
    ) -> Self {
        Self {
            cmd,
            config,
            layout,
            target,
            tracker: ResourceTracker::new(),
        }
    }

    /// Phases 1 to 11. Returns the root volume device path. Teardown is the
    /// caller's job, whatever the outcome.
    pub fn run(&mut self) -> Result<String> {
        let mut stage = Stage::CreateImage;
        loop {
            signal::check_interrupted()?;
            let (number, title) = stage.describe();
            announce(self.cmd, number, title);
            match stage.execute(self)? {
                Transition::Next(next) => stage = next,
                Transition::Finished(root_device) => return Ok(root_device),
            }
        }
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ResourceTracker {
        &mut self.tracker
    }

    fn acquire(&mut self, resource: Resource) {
        self.cmd.acquired(&resource);
        self.tracker.push(resource);
    }

    fn release(&mut self, resource: &Resource) {
        self.tracker.mark_released(resource);
        self.cmd.released(resource);
    }

    /// Mount the volume tree under the mount base and copy the payload in.
    /// Without a source tree the root volume is only reported.
    fn populate(&mut self, nodes: &PartitionNodes, root_device: &str) -> Result<()> {
        let Some(source) = self.target.rootfs_dir.clone() else {
            info!("Root volume formatted and ready for population: {}", root_device);
            return Ok(());
        };
        let cmd = self.cmd;
        let base = self.target.mount_base.clone();
        let system = resources::system_dir(&base);

        cmd.execute(&mkdir_invocation(&system))?;
        self.acquire(Resource::MountBase(base.clone()));

        cmd.execute(&mount_invocation(root_device, &system))?;
        self.acquire(Resource::Mount(system.clone()));

        let mut mounts: Vec<(String, String)> = vec![
            (nodes.boot.clone(), "/boot".to_string()),
            (nodes.efi.clone(), ESP_TARGET.to_string()),
        ];
        mounts.extend(self.config.mount_points.iter().map(|m| {
            (lvm::lv_path(&self.config.vg_name, &m.volume), m.target.clone())
        }));
        // Parents before children; teardown then unmounts deepest first
        mounts.sort_by_key(|(_, target)| target.matches('/').count());

        for (device, target) in mounts {
            let path = resources::target_under(&base, &target);
            cmd.execute(&mkdir_invocation(&path))?;
            cmd.execute(&mount_invocation(&device, &path))?;
            info!("Mounted {} at {}", device, target);
            self.acquire(Resource::Mount(path));
        }

        info!("Copying {} into {}", source, root_device);
        cmd.execute(&rsync_invocation(&source, &system))?;
        cmd.execute(&rsync_esp_invocation(&source, &system))?;
        Ok(())
    }
}

fn announce(cmd: &dyn Executor, number: u8, title: &str) {
    info!("[Phase {}/{}] {}", number, PHASE_COUNT, title);
    cmd.note(&format!("Phase {}/{}: {}", number, PHASE_COUNT, title));
}

/// Run every phase, then always tear down. A phase error is returned after
/// teardown has released what was acquired.
pub fn build_image(
    cmd: &dyn Executor,
    config: &DiskConfig,
    layout: &ImageLayout,
    target: &BuildTarget,
) -> Result<BuildSummary> {
    let mut pipeline = Pipeline::new(cmd, config, layout, target);
    let outcome = pipeline.run();

    announce(cmd, PHASE_COUNT, "Teardown");
    let report: TeardownReport = teardown(cmd, pipeline.tracker_mut());

    let root_device = outcome?;
    Ok(BuildSummary::new(
        config,
        layout,
        &target.image_path,
        root_device,
        target.rootfs_dir.is_some(),
        &report,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;
    use crate::disk::layouts::compute_layout;
    use crate::utils::error::LvmRootfsError;
    use crate::utils::testing::FakeExecutor;

    const ROOT_UUID: &str = "11111111-2222-4333-8444-555555555555";
    const BOOT_UUID: &str = "66666666-7777-4888-9999-aaaaaaaaaaaa";
    const VAR_UUID: &str = "0b7d2a4e-8c51-4f3e-9a7d-1c2b3d4e5f60";

    fn setup(size_mb: u64, extra: &[(&str, &str)]) -> (DiskConfig, ImageLayout) {
        let mut params = vec![("lvm-rootfs-uuid", ROOT_UUID), ("boot-uuid", BOOT_UUID)];
        params.extend_from_slice(extra);
        let raw = RawConfig::from_params(params).unwrap();
        let config = DiskConfig::from_raw(&raw).unwrap();
        let layout = compute_layout(size_mb, 0, &config).unwrap();
        (config, layout)
    }

    fn target(rootfs: Option<&str>) -> BuildTarget {
        BuildTarget {
            image_path: "/out/disk.img".to_string(),
            rootfs_dir: rootfs.map(str::to_string),
            mount_base: "/tmp/m".to_string(),
        }
    }

    #[test]
    fn default_image_command_sequence() {
        let (config, layout) = setup(4096, &[]);
        let cmd = FakeExecutor::with_loop_devices();
        let summary = build_image(&cmd, &config, &layout, &target(None)).unwrap();

        let root_fmt = format!("mkfs.ext4 -F -U {} -L rootlv /dev/vg0/rootlv", ROOT_UUID);
        let boot_fmt = format!("mkfs.ext4 -F -U {} -L xbootldr /dev/loop1p2", BOOT_UUID);
        assert_eq!(
            cmd.command_lines(),
            vec![
                "dd if=/dev/zero of=/out/disk.img bs=1M count=0 seek=4096",
                "losetup --find --show /out/disk.img",
                "sgdisk --zap-all /dev/loop0",
                "sgdisk --new=1:1MiB:+512MiB --typecode=1:EF00 --change-name=1:efi \
                 --new=2:0:+1024MiB --typecode=2:EA00 --change-name=2:xbootldr \
                 --new=3:0:0 --typecode=3:8304 --change-name=3:crypt_lvm /dev/loop0",
                "losetup --detach /dev/loop0",
                "losetup --find --show --partscan /out/disk.img",
                "mkfs.vfat -F 32 -n efi /dev/loop1p1",
                boot_fmt.as_str(),
                "cryptsetup -q luksFormat --type luks2 /dev/loop1p3",
                "cryptsetup open /dev/loop1p3 cryptroot",
                "lvm pvcreate --nolocking -ff -y /dev/mapper/cryptroot",
                "lvm vgcreate --nolocking vg0 /dev/mapper/cryptroot",
                "lvm lvcreate --nolocking -L 2546M -n rootlv vg0",
                root_fmt.as_str(),
                "lvm vgchange --nolocking -an vg0",
                "cryptsetup close cryptroot",
                "losetup -d /dev/loop1",
            ]
        );
        assert_eq!(summary.root_device, "/dev/vg0/rootlv");
        assert!(!summary.populated);
        assert!(summary.teardown_failures.is_empty());
    }

    #[test]
    fn absent_passphrase_still_encrypts_with_empty_credential() {
        let (config, layout) = setup(4096, &[]);
        let cmd = FakeExecutor::with_loop_devices();
        build_image(&cmd, &config, &layout, &target(None)).unwrap();

        let calls = cmd.calls();
        let format = calls.iter().find(|c| c.args.contains(&"luksFormat".to_string())).unwrap();
        assert_eq!(format.stdin.as_deref(), Some("\n\n"));
        let open = calls.iter().find(|c| c.args.first().map(String::as_str) == Some("open")).unwrap();
        assert_eq!(open.stdin.as_deref(), Some("\n"));
    }

    #[test]
    fn fixed_volume_created_before_root() {
        let (config, layout) = setup(
            8192,
            &[("lvm-volumes", "varfs:512"), ("lvm-volumes-uuids", "varfs:0b7d2a4e-8c51-4f3e-9a7d-1c2b3d4e5f60")],
        );
        let cmd = FakeExecutor::with_loop_devices();
        build_image(&cmd, &config, &layout, &target(None)).unwrap();

        let var = cmd.position("lvm lvcreate --nolocking -L 512M -n varfs vg0").unwrap();
        let root = cmd.position("lvm lvcreate --nolocking -L 6130M -n rootlv vg0").unwrap();
        assert!(var < root);
        assert!(cmd
            .position(&format!("mkfs.ext4 -F -U {} -L varfs /dev/vg0/varfs", VAR_UUID))
            .is_some());
        assert!(cmd.position("dd if=/dev/zero of=/out/disk.img bs=1M count=0 seek=8192").is_some());
    }

    #[test]
    fn percentage_volume_created_last() {
        let (config, layout) = setup(8192, &[("lvm-volumes", "homefs:100%FREE,varfs:512")]);
        let cmd = FakeExecutor::with_loop_devices();
        build_image(&cmd, &config, &layout, &target(None)).unwrap();

        let var = cmd.position("lvm lvcreate --nolocking -L 512M -n varfs").unwrap();
        let root = cmd.position("lvm lvcreate --nolocking -L 6130M -n rootlv").unwrap();
        let home = cmd.position("lvm lvcreate --nolocking -l 100%FREE -n homefs").unwrap();
        assert!(var < root && root < home);
    }

    #[test]
    fn fill_root_uses_free_space() {
        let (config, layout) = setup(4096, &[("lvm-rootfs-size", "fill")]);
        let cmd = FakeExecutor::with_loop_devices();
        build_image(&cmd, &config, &layout, &target(None)).unwrap();
        assert!(cmd.position("lvm lvcreate --nolocking -l 100%FREE -n rootlv vg0").is_some());
    }

    /// Commands issued after the failing one, in order
    fn teardown_after(cmd: &FakeExecutor, failing: &str) -> Vec<String> {
        let lines = cmd.command_lines();
        let at = lines.iter().position(|l| l.starts_with(failing)).unwrap();
        lines[at + 1..].to_vec()
    }

    #[test]
    fn failure_at_image_creation_tears_down_nothing() {
        let (config, layout) = setup(4096, &[]);
        let cmd = FakeExecutor::with_loop_devices().failing("dd ");
        let err = build_image(&cmd, &config, &layout, &target(None)).unwrap_err();
        assert!(err.is_execution());
        assert_eq!(cmd.calls().len(), 1);
    }

    #[test]
    fn failure_at_detach_only_detaches_loop() {
        let (config, layout) = setup(4096, &[]);
        let cmd = FakeExecutor::with_loop_devices().failing("losetup --detach");
        assert!(build_image(&cmd, &config, &layout, &target(None)).is_err());
        assert_eq!(teardown_after(&cmd, "losetup --detach"), vec!["losetup -d /dev/loop0"]);
    }

    #[test]
    fn failure_at_partitioning_detaches_first_loop() {
        let (config, layout) = setup(4096, &[]);
        let cmd = FakeExecutor::with_loop_devices().failing("sgdisk --new");
        assert!(build_image(&cmd, &config, &layout, &target(None)).is_err());
        assert_eq!(teardown_after(&cmd, "sgdisk --new"), vec!["losetup -d /dev/loop0"]);
    }

    #[test]
    fn zap_failure_is_not_fatal() {
        let (config, layout) = setup(4096, &[]);
        let cmd = FakeExecutor::with_loop_devices().failing("sgdisk --zap-all");
        assert!(build_image(&cmd, &config, &layout, &target(None)).is_ok());
    }

    #[test]
    fn missing_partition_nodes_abort() {
        let (config, layout) = setup(4096, &[]);
        let cmd = FakeExecutor::with_loop_devices().missing("/dev/loop1p3");
        let err = build_image(&cmd, &config, &layout, &target(None)).unwrap_err();
        assert!(matches!(err, LvmRootfsError::PartitionNodesMissing(ref n) if n == "/dev/loop1p3"));
        assert_eq!(
            teardown_after(&cmd, "losetup --find --show --partscan"),
            vec!["losetup -d /dev/loop1"]
        );
    }

    #[test]
    fn failure_at_open_skips_container_close() {
        let (config, layout) = setup(4096, &[]);
        let cmd = FakeExecutor::with_loop_devices().failing("cryptsetup open");
        assert!(build_image(&cmd, &config, &layout, &target(None)).is_err());
        assert_eq!(teardown_after(&cmd, "cryptsetup open"), vec!["losetup -d /dev/loop1"]);
    }

    #[test]
    fn failure_at_vgcreate_closes_container() {
        let (config, layout) = setup(4096, &[]);
        let cmd = FakeExecutor::with_loop_devices().failing("lvm vgcreate");
        assert!(build_image(&cmd, &config, &layout, &target(None)).is_err());
        assert_eq!(
            teardown_after(&cmd, "lvm vgcreate"),
            vec!["cryptsetup close cryptroot", "losetup -d /dev/loop1"]
        );
    }

    #[test]
    fn failure_at_lvcreate_releases_everything() {
        let (config, layout) = setup(4096, &[]);
        let cmd = FakeExecutor::with_loop_devices().failing("lvm lvcreate");
        let err = build_image(&cmd, &config, &layout, &target(None)).unwrap_err();
        assert!(err.to_string().contains("lvm lvcreate"));
        assert_eq!(
            teardown_after(&cmd, "lvm lvcreate"),
            vec![
                "lvm vgchange --nolocking -an vg0",
                "cryptsetup close cryptroot",
                "losetup -d /dev/loop1",
            ]
        );
    }

    #[test]
    fn population_mounts_parents_first_and_unmounts_deepest_first() {
        let (config, layout) = setup(
            8192,
            &[("lvm-volumes", "varfs:512"), ("lvm-mounts", "varfs:/var")],
        );
        let cmd = FakeExecutor::with_loop_devices();
        let summary = build_image(&cmd, &config, &layout, &target(Some("/src/rootfs"))).unwrap();
        assert!(summary.populated);

        let mounts: Vec<String> = cmd
            .command_lines()
            .into_iter()
            .filter(|l| l.starts_with("mount ") || l.starts_with("umount ") || l.starts_with("rsync "))
            .collect();
        assert_eq!(
            mounts,
            vec![
                "mount /dev/vg0/rootlv /tmp/m/system",
                "mount /dev/loop1p2 /tmp/m/system/boot",
                "mount /dev/vg0/varfs /tmp/m/system/var",
                "mount /dev/loop1p1 /tmp/m/system/boot/efi",
                "rsync -aHAX --numeric-ids --exclude=/boot/efi /src/rootfs/ /tmp/m/system/",
                "rsync -rt --modify-window=1 --include=/boot/ --include=/boot/efi/*** \
                 --exclude=* /src/rootfs/ /tmp/m/system/",
                "umount /tmp/m/system/boot/efi",
                "umount /tmp/m/system/var",
                "umount /tmp/m/system/boot",
                "umount /tmp/m/system",
            ]
        );
        let rmdir = cmd.position("rmdir /tmp/m/system /tmp/m").unwrap();
        let vgchange = cmd.position("lvm vgchange").unwrap();
        assert!(rmdir < vgchange);
    }

    #[test]
    fn esp_is_copied_in_a_separate_fat_safe_pass() {
        let main = rsync_invocation("/src/rootfs", "/tmp/m/system");
        assert!(main.args.contains(&"--exclude=/boot/efi".to_string()));

        let esp = rsync_esp_invocation("/src/rootfs", "/tmp/m/system");
        assert_eq!(esp.args[0], "-rt");
        for flag in ["-a", "-p", "-o", "-g", "-A", "-X", "-aHAX"] {
            assert!(!esp.args.iter().any(|a| a == flag), "{} on vfat", flag);
        }
        assert_eq!(esp.args.last().map(String::as_str), Some("/tmp/m/system/"));
    }

    #[test]
    fn failed_esp_copy_still_unmounts() {
        let (config, layout) = setup(4096, &[]);
        let cmd = FakeExecutor::with_loop_devices().failing("rsync -rt");
        assert!(build_image(&cmd, &config, &layout, &target(Some("/src"))).is_err());
        assert_eq!(cmd.count("rsync "), 2);
        assert_eq!(
            teardown_after(&cmd, "rsync -rt")[..3],
            [
                "umount /tmp/m/system/boot/efi",
                "umount /tmp/m/system/boot",
                "umount /tmp/m/system",
            ]
        );
    }

    #[test]
    fn failed_copy_still_unmounts() {
        let (config, layout) = setup(4096, &[]);
        let cmd = FakeExecutor::with_loop_devices().failing("rsync");
        assert!(build_image(&cmd, &config, &layout, &target(Some("/src"))).is_err());
        assert_eq!(
            teardown_after(&cmd, "rsync"),
            vec![
                "umount /tmp/m/system/boot/efi",
                "umount /tmp/m/system/boot",
                "umount /tmp/m/system",
                "rmdir /tmp/m/system /tmp/m",
                "lvm vgchange --nolocking -an vg0",
                "cryptsetup close cryptroot",
                "losetup -d /dev/loop1",
            ]
        );
    }

    #[test]
    fn tracker_records_release_of_first_loop() {
        let (config, layout) = setup(4096, &[]);
        let cmd = FakeExecutor::with_loop_devices();
        let target = target(None);
        let mut pipeline = Pipeline::new(&cmd, &config, &layout, &target);
        pipeline.run().unwrap();

        let entries = pipeline.tracker().entries();
        assert_eq!(entries[1].resource, Resource::LoopDevice("/dev/loop0".to_string()));
        assert!(entries[1].released);
        assert_eq!(pipeline.tracker().loop_device(), Some("/dev/loop1"));
        assert!(cmd.events().contains(&"released loop device /dev/loop0".to_string()));
    }
}
