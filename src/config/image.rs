//! Disk image configuration
//!
//! Parameters arrive either as flat `key=value` pairs (the build-system
//! convention) or as a TOML file. Both land in a [`RawConfig`], which is
//! validated once into an immutable [`DiskConfig`].

use crate::utils::error::{LvmRootfsError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

/// XBOOTLDR filesystem UUID used by earlier image builds
pub const LEGACY_BOOT_UUID: &str = "5d7e1b2c-3f4a-4c8d-9e22-1a6b7c8d9e33";

/// Largest accepted absolute size (1 EiB)
pub const MAX_SIZE_MB: u64 = 1 << 40;

/// Passphrase values that select an empty credential
const PASSPHRASE_SENTINELS: [&str; 2] = ["NULL", "NONE"];

/// Mount targets owned by the fixed partitions
const RESERVED_TARGETS: [&str; 3] = ["/", "/boot", "/boot/efi"];

static ABSOLUTE_SIZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)(\d+)\s*(?:([kmgt])(?:i?b)?)?$").expect("static regex")
});

static PERCENT_SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)(\d{1,3})%(free|vg|pvs)$").expect("static regex"));

static LVM_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9+_.][A-Za-z0-9+_.-]{0,126}$").expect("static regex"));

/// What a percentage size is relative to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PercentBase {
    Free,
    Vg,
    Pvs,
}

impl fmt::Display for PercentBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "FREE"),
            Self::Vg => write!(f, "VG"),
            Self::Pvs => write!(f, "PVS"),
        }
    }
}

/// Logical volume size expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeExpr {
    /// Absolute size in MiB
    Megabytes(u64),
    /// Percentage of free space, VG size or PV size
    Percent { percent: u8, base: PercentBase },
    /// Whatever is left once fixed siblings are subtracted (root volume only)
    Remainder,
}

impl SizeExpr {
    /// Parse `512`, `512M`, `2GiB`, `100%FREE`, ...
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        let invalid = |reason: &str| LvmRootfsError::InvalidSize {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        if let Some(caps) = PERCENT_SIZE.captures(trimmed) {
            let percent: u8 = caps[1].parse().map_err(|_| invalid("percentage out of range"))?;
            if percent == 0 || percent > 100 {
                return Err(invalid("percentage must be between 1 and 100"));
            }
            let base = match caps[2].to_ascii_uppercase().as_str() {
                "FREE" => PercentBase::Free,
                "VG" => PercentBase::Vg,
                _ => PercentBase::Pvs,
            };
            return Ok(Self::Percent { percent, base });
        }

        let caps = ABSOLUTE_SIZE
            .captures(trimmed)
            .ok_or_else(|| invalid("expected <number>[K|M|G|T] or <percent>%FREE"))?;
        let number: u64 = caps[1].parse().map_err(|_| invalid("number too large"))?;
        let unit = caps
            .get(2)
            .map(|m| m.as_str().to_ascii_uppercase())
            .unwrap_or_else(|| "M".to_string());
        let mb = match unit.as_str() {
            "K" => number.div_ceil(1024),
            "M" => number,
            "G" => number.checked_mul(1024).ok_or_else(|| invalid("number too large"))?,
            _ => number
                .checked_mul(1024 * 1024)
                .ok_or_else(|| invalid("number too large"))?,
        };
        if mb == 0 {
            return Err(invalid("size must be positive"));
        }
        if mb > MAX_SIZE_MB {
            return Err(invalid("size exceeds 1 EiB"));
        }
        Ok(Self::Megabytes(mb))
    }

    pub fn fixed_mb(&self) -> Option<u64> {
        match self {
            Self::Megabytes(mb) => Some(*mb),
            _ => None,
        }
    }

    pub fn is_percent(&self) -> bool {
        matches!(self, Self::Percent { .. })
    }
}

impl fmt::Display for SizeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Megabytes(mb) => write!(f, "{}M", mb),
            Self::Percent { percent, base } => write!(f, "{}%{}", percent, base),
            Self::Remainder => write!(f, "remainder"),
        }
    }
}

/// Specification for a logical volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolumeSpec {
    pub name: String,
    pub size: SizeExpr,
    /// Resolved absolute size; `None` for percentage volumes
    pub size_mb: Option<u64>,
    /// ext4 filesystem UUID
    pub uuid: String,
}

impl LogicalVolumeSpec {
    pub fn new(name: &str, size: SizeExpr, uuid: Option<&str>) -> Result<Self> {
        let uuid = match uuid {
            Some(u) => parse_uuid(&format!("volume {}", name), u)?,
            None => Uuid::new_v4().to_string(),
        };
        Ok(Self {
            name: name.to_string(),
            size,
            size_mb: size.fixed_mb(),
            uuid,
        })
    }

    /// `/dev/<vg>/<lv>`
    pub fn device_path(&self, vg_name: &str) -> String {
        crate::disk::lvm::lv_path(vg_name, &self.name)
    }
}

/// Mount a volume at a path inside the root filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPointSpec {
    pub volume: String,
    pub target: String,
}

/// Validated configuration for one image build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskConfig {
    pub vg_name: String,
    pub luks_name: String,
    /// `None` means an empty credential, not "no encryption"
    pub luks_passphrase: Option<String>,
    pub luks_enabled: bool,
    pub rootfs_lv: LogicalVolumeSpec,
    pub additional_lvs: Vec<LogicalVolumeSpec>,
    pub mount_points: Vec<MountPointSpec>,
    /// XBOOTLDR filesystem UUID
    pub boot_uuid: String,
}

impl DiskConfig {
    pub fn from_raw(raw: &RawConfig) -> Result<Self> {
        validate_lvm_name("volume group", &raw.vg_name)?;
        validate_mapper_name(&raw.luks_name)?;
        validate_lvm_name("root volume", &raw.rootfs.name)?;

        let (luks_passphrase, luks_enabled) = match raw.luks_passphrase.as_deref() {
            Some(p) if PASSPHRASE_SENTINELS.contains(&p) => (None, false),
            Some("") | None => (None, true),
            Some(p) => (Some(p.to_string()), true),
        };

        let root_size = match raw.rootfs.size.as_deref().map(str::trim) {
            None | Some("") | Some("auto") => SizeExpr::Remainder,
            Some("fill") => SizeExpr::Percent {
                percent: 100,
                base: PercentBase::Free,
            },
            Some(other) => {
                return Err(LvmRootfsError::ConfigError(format!(
                    "root volume size must be 'auto' or 'fill', got '{}'",
                    other
                )))
            }
        };
        let rootfs_lv = LogicalVolumeSpec::new(&raw.rootfs.name, root_size, raw.rootfs.uuid.as_deref())?;

        let mut seen = HashSet::new();
        seen.insert(rootfs_lv.name.clone());
        let mut additional_lvs = Vec::with_capacity(raw.volumes.len());
        for vol in &raw.volumes {
            validate_lvm_name("volume", &vol.name)?;
            if !seen.insert(vol.name.clone()) {
                return Err(LvmRootfsError::ConfigError(format!(
                    "duplicate logical volume name '{}'",
                    vol.name
                )));
            }
            let size = SizeExpr::parse(&vol.size)?;
            additional_lvs.push(LogicalVolumeSpec::new(&vol.name, size, vol.uuid.as_deref())?);
        }

        let percent_count = additional_lvs.iter().filter(|lv| lv.size.is_percent()).count()
            + usize::from(rootfs_lv.size.is_percent());
        if percent_count > 1 {
            return Err(LvmRootfsError::ConfigError(
                "only one logical volume may use a percentage size; it is created last".to_string(),
            ));
        }

        let mut targets = HashSet::new();
        let mut mount_points = Vec::with_capacity(raw.mounts.len());
        for mount in &raw.mounts {
            let target = normalize_target(&mount.target)?;
            if !additional_lvs.iter().any(|lv| lv.name == mount.volume) {
                return Err(LvmRootfsError::ConfigError(format!(
                    "mount point {} refers to unknown volume '{}'",
                    target, mount.volume
                )));
            }
            if !targets.insert(target.clone()) {
                return Err(LvmRootfsError::ConfigError(format!(
                    "mount point {} listed twice",
                    target
                )));
            }
            mount_points.push(MountPointSpec {
                volume: mount.volume.clone(),
                target,
            });
        }

        let boot_uuid = match raw.boot_uuid.as_deref() {
            None => Uuid::new_v4().to_string(),
            Some("fixed") => LEGACY_BOOT_UUID.to_string(),
            Some(u) => parse_uuid("boot partition", u)?,
        };

        let config = DiskConfig {
            vg_name: raw.vg_name.clone(),
            luks_name: raw.luks_name.clone(),
            luks_passphrase,
            luks_enabled,
            rootfs_lv,
            additional_lvs,
            mount_points,
            boot_uuid,
        };
        debug!(
            "Configuration validated: VG={}, LVs={}",
            config.vg_name,
            1 + config.additional_lvs.len()
        );
        Ok(config)
    }

    /// Sum of all fixed-size additional volumes in MiB, `None` on overflow
    pub fn fixed_volumes_mb(&self) -> Option<u64> {
        self.additional_lvs
            .iter()
            .filter_map(|lv| lv.size_mb)
            .try_fold(0u64, u64::checked_add)
    }
}

fn parse_uuid(field: &str, value: &str) -> Result<String> {
    Uuid::parse_str(value.trim())
        .map(|u| u.hyphenated().to_string())
        .map_err(|_| LvmRootfsError::InvalidUuid {
            field: field.to_string(),
            value: value.to_string(),
        })
}

fn validate_lvm_name(what: &str, name: &str) -> Result<()> {
    if name == "." || name == ".." || !LVM_NAME.is_match(name) {
        return Err(LvmRootfsError::ConfigError(format!(
            "invalid {} name '{}'",
            what, name
        )));
    }
    Ok(())
}

fn validate_mapper_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.chars().any(char::is_whitespace) {
        return Err(LvmRootfsError::ConfigError(format!(
            "invalid LUKS mapper name '{}'",
            name
        )));
    }
    Ok(())
}

fn normalize_target(target: &str) -> Result<String> {
    let trimmed = target.trim();
    if !trimmed.starts_with('/') || trimmed.split('/').any(|c| c == "..") {
        return Err(LvmRootfsError::ConfigError(format!(
            "mount point '{}' must be an absolute path",
            target
        )));
    }
    let normalized = format!(
        "/{}",
        trimmed
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .collect::<Vec<_>>()
            .join("/")
    );
    if RESERVED_TARGETS.contains(&normalized.as_str()) {
        return Err(LvmRootfsError::ConfigError(format!(
            "mount point {} is reserved",
            normalized
        )));
    }
    Ok(normalized)
}

// Raw, unvalidated form

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRootfs {
    #[serde(default = "default_rootfs_name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// "auto" (absolute remainder) or "fill" (100%FREE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

impl Default for RawRootfs {
    fn default() -> Self {
        Self {
            name: default_rootfs_name(),
            uuid: None,
            size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawVolume {
    pub name: String,
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// Configuration as supplied, before validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(default = "default_vg_name")]
    pub vg_name: String,
    #[serde(default = "default_luks_name")]
    pub luks_name: String,
    /// Literal passphrase, or NULL/NONE for an empty credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub luks_passphrase: Option<String>,
    /// XBOOTLDR UUID, or "fixed" for the legacy constant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_uuid: Option<String>,
    #[serde(default)]
    pub rootfs: RawRootfs,
    #[serde(default)]
    pub volumes: Vec<RawVolume>,
    #[serde(default)]
    pub mounts: Vec<MountPointSpec>,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            vg_name: default_vg_name(),
            luks_name: default_luks_name(),
            luks_passphrase: None,
            boot_uuid: None,
            rootfs: RawRootfs::default(),
            volumes: Vec::new(),
            mounts: Vec::new(),
        }
    }
}

fn default_vg_name() -> String {
    "vg0".to_string()
}

fn default_luks_name() -> String {
    "cryptroot".to_string()
}

fn default_rootfs_name() -> String {
    "rootlv".to_string()
}

/// Split `key=value` on the first '='.
pub fn parse_param(param: &str) -> Result<(String, String)> {
    let (key, value) = param.split_once('=').ok_or_else(|| {
        LvmRootfsError::ConfigError(format!("parameter '{}' is not key=value", param))
    })?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

/// Split a `name:value,name:value` list.
fn parse_pairs(key: &str, value: &str) -> Result<Vec<(String, String)>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.split_once(':')
                .map(|(a, b)| (a.trim().to_string(), b.trim().to_string()))
                .ok_or_else(|| {
                    LvmRootfsError::ConfigError(format!(
                        "{}: entry '{}' is not name:value",
                        key, item
                    ))
                })
        })
        .collect()
}

impl RawConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RawConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Build from flat build-system parameters.
    pub fn from_params<I, K, V>(params: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut raw = RawConfig::default();
        raw.apply_params(params)?;
        Ok(raw)
    }

    /// Override fields from flat build-system parameters.
    pub fn apply_params<I, K, V>(&mut self, params: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let raw = self;
        let mut volume_uuids: BTreeMap<String, String> = BTreeMap::new();

        for (key, value) in params {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "lvm-vg-name" => raw.vg_name = value.to_string(),
                "lvm-rootfs-name" => raw.rootfs.name = value.to_string(),
                "lvm-rootfs-uuid" if !value.is_empty() => raw.rootfs.uuid = Some(value.to_string()),
                "lvm-rootfs-uuid" => {}
                "lvm-rootfs-size" => raw.rootfs.size = Some(value.to_string()),
                "luks-name" => raw.luks_name = value.to_string(),
                "luks-passphrase" => raw.luks_passphrase = Some(value.to_string()),
                "boot-uuid" => raw.boot_uuid = Some(value.to_string()),
                "lvm-volumes" => {
                    raw.volumes = parse_pairs(key, value)?
                        .into_iter()
                        .map(|(name, size)| RawVolume {
                            name,
                            size,
                            uuid: None,
                        })
                        .collect();
                }
                "lvm-volumes-uuids" => volume_uuids.extend(parse_pairs(key, value)?),
                "lvm-mounts" => {
                    raw.mounts = parse_pairs(key, value)?
                        .into_iter()
                        .map(|(volume, target)| MountPointSpec { volume, target })
                        .collect();
                }
                other => warn!("Ignoring unknown parameter '{}'", other),
            }
        }

        for (name, uuid) in volume_uuids {
            match raw.volumes.iter_mut().find(|v| v.name == name) {
                Some(vol) => vol.uuid = Some(uuid),
                None => {
                    return Err(LvmRootfsError::ConfigError(format!(
                        "lvm-volumes-uuids names unknown volume '{}'",
                        name
                    )))
                }
            }
        }

        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> Self {
        RawConfig {
            vg_name: default_vg_name(),
            luks_name: default_luks_name(),
            luks_passphrase: Some("NULL".to_string()),
            boot_uuid: None,
            rootfs: RawRootfs::default(),
            volumes: vec![RawVolume {
                name: "varfs".to_string(),
                size: "2048M".to_string(),
                uuid: None,
            }],
            mounts: vec![MountPointSpec {
                volume: "varfs".to_string(),
                target: "/var".to_string(),
            }],
        }
    }
}
