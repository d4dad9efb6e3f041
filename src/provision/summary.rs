//! Build summary, printed after a successful run

use crate::cleanup::TeardownReport;
use crate::config::DiskConfig;
use crate::disk::layouts::ImageLayout;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PartitionSummary {
    pub number: u32,
    pub name: String,
    pub size_mib: u64,
    pub type_guid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_uuid: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeSummary {
    pub name: String,
    /// Absolute size, or the percentage expression it was created with
    pub size: String,
    pub uuid: String,
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub image: String,
    pub total_mib: u64,
    pub partitions: Vec<PartitionSummary>,
    pub luks_name: String,
    pub encryption_enabled: bool,
    pub vg_name: String,
    pub volumes: Vec<VolumeSummary>,
    pub root_device: String,
    pub populated: bool,
    /// Resources teardown could not release
    pub teardown_failures: Vec<String>,
}

impl BuildSummary {
    pub fn new(
        config: &DiskConfig,
        layout: &ImageLayout,
        image: &str,
        root_device: String,
        populated: bool,
        teardown: &TeardownReport,
    ) -> Self {
        let partitions = layout
            .partitions
            .iter()
            .map(|p| PartitionSummary {
                number: p.number,
                name: p.name.to_string(),
                size_mib: if p.size_mib == 0 { layout.crypt_mib } else { p.size_mib },
                type_guid: p.type_guid.to_string(),
                fs_uuid: (p.number == 2).then(|| config.boot_uuid.clone()),
            })
            .collect();

        let root = &config.rootfs_lv;
        let mut volumes = vec![VolumeSummary {
            name: root.name.clone(),
            size: match layout.root_mib {
                Some(mib) => format!("{} MiB", mib),
                None => root.size.to_string(),
            },
            uuid: root.uuid.clone(),
            device: root.device_path(&config.vg_name),
            mount_point: Some("/".to_string()),
        }];
        volumes.extend(config.additional_lvs.iter().map(|lv| VolumeSummary {
            name: lv.name.clone(),
            size: match lv.size_mb {
                Some(mib) => format!("{} MiB", mib),
                None => lv.size.to_string(),
            },
            uuid: lv.uuid.clone(),
            device: lv.device_path(&config.vg_name),
            mount_point: config
                .mount_points
                .iter()
                .find(|m| m.volume == lv.name)
                .map(|m| m.target.clone()),
        }));

        Self {
            image: image.to_string(),
            total_mib: layout.total_mib,
            partitions,
            luks_name: config.luks_name.clone(),
            encryption_enabled: config.luks_enabled,
            vg_name: config.vg_name.clone(),
            volumes,
            root_device,
            populated,
            teardown_failures: teardown.failed.clone(),
        }
    }

    /// Human-readable summary on stdout
    pub fn print(&self) {
        println!("\n=== Disk Image Creation Summary ===");
        println!("Image:           {} ({} MiB)", self.image, self.total_mib);
        println!(
            "LUKS encryption: {} (/dev/mapper/{})",
            if self.encryption_enabled { "enabled" } else { "empty credential" },
            self.luks_name
        );
        println!("Volume group:    {}", self.vg_name);

        println!("\nPartitions:");
        for p in &self.partitions {
            println!("  {}. {:<10} {:>8} MiB", p.number, p.name, p.size_mib);
        }

        println!("\nLogical volumes:");
        for v in &self.volumes {
            println!(
                "  - {:<12} {:>12}  {}  {}",
                v.name,
                v.size,
                v.uuid,
                v.mount_point.as_deref().unwrap_or("-")
            );
        }

        if !self.populated {
            println!("\nRoot volume left empty for population: {}", self.root_device);
        }
        if !self.teardown_failures.is_empty() {
            println!("\n⚠ Not released: {}", self.teardown_failures.join(", "));
            println!("  Run: lvmrootfs cleanup");
        }
        println!();
    }
}
