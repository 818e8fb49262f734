//! Domain Ports - Collaborator traits for the LVM plugin
//!
//! These traits define the boundaries between the lifecycle/publish/mount
//! logic and the systems it drives: the LVM volume group, the remote
//! transport broker, and the node's kernel (mounts, devices, permissions).
//! Adapters implement these traits to provide concrete functionality.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Volume Layout
// =============================================================================

/// RAID level of a logical volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    #[default]
    Linear,
    Raid1,
    Raid5,
    Raid6,
    Raid10,
}

/// Largest stripe or mirror count a layout may request
pub const MAX_LAYOUT_COUNT: u64 = 64;

impl VolumeType {
    /// Minimum number of physical volumes the layout needs
    pub fn min_devices(&self, layout: &VolumeLayout) -> Result<u64> {
        let devices = match self {
            VolumeType::Linear => Some(layout.stripes.unwrap_or(1)),
            VolumeType::Raid1 => layout.mirrors.unwrap_or(1).checked_add(1),
            VolumeType::Raid5 => layout.stripes.unwrap_or(2).checked_add(1),
            VolumeType::Raid6 => layout.stripes.unwrap_or(3).checked_add(2),
            VolumeType::Raid10 => layout.stripes.unwrap_or(2).checked_mul(2),
        };
        devices.ok_or_else(|| layout_overflow(layout))
    }
}

fn layout_overflow(layout: &VolumeLayout) -> Error {
    Error::InvalidLayout(format!(
        "{} layout counts out of range (stripes {:?}, mirrors {:?})",
        layout.volume_type, layout.stripes, layout.mirrors
    ))
}

impl std::fmt::Display for VolumeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeType::Linear => write!(f, "linear"),
            VolumeType::Raid1 => write!(f, "raid1"),
            VolumeType::Raid5 => write!(f, "raid5"),
            VolumeType::Raid6 => write!(f, "raid6"),
            VolumeType::Raid10 => write!(f, "raid10"),
        }
    }
}

impl std::str::FromStr for VolumeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(VolumeType::Linear),
            "raid1" => Ok(VolumeType::Raid1),
            "raid5" => Ok(VolumeType::Raid5),
            "raid6" => Ok(VolumeType::Raid6),
            "raid10" => Ok(VolumeType::Raid10),
            other => Err(Error::InvalidLayout(format!(
                "type must be one of linear, raid1, raid5, raid6 or raid10, got {:?}",
                other
            ))),
        }
    }
}

/// Layout descriptor passed to the volume group on create
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeLayout {
    pub volume_type: VolumeType,
    /// Stripe count, 1..=MAX_LAYOUT_COUNT when present
    pub stripes: Option<u64>,
    /// Mirror count, 1..=MAX_LAYOUT_COUNT when present
    pub mirrors: Option<u64>,
    /// Skip the initial RAID synchronisation
    pub nosync: bool,
}

impl VolumeLayout {
    pub fn linear() -> Self {
        Self::default()
    }

    /// Number of copies of each extent the layout stores
    pub fn data_copies(&self) -> Result<u64> {
        match self.volume_type {
            VolumeType::Linear | VolumeType::Raid5 | VolumeType::Raid6 => Ok(1),
            VolumeType::Raid1 => self
                .mirrors
                .unwrap_or(1)
                .checked_add(1)
                .ok_or_else(|| layout_overflow(self)),
            VolumeType::Raid10 => Ok(2),
        }
    }

    /// Data stripes and the parity stripes added to them, for parity layouts
    fn parity_stripes(&self) -> Result<Option<(u64, u64)>> {
        let (stripes, parity) = match self.volume_type {
            VolumeType::Raid5 => (self.stripes.unwrap_or(2), 1),
            VolumeType::Raid6 => (self.stripes.unwrap_or(3), 2),
            _ => return Ok(None),
        };
        let total = stripes
            .checked_add(parity)
            .filter(|_| stripes > 0)
            .ok_or_else(|| layout_overflow(self))?;
        Ok(Some((stripes, total)))
    }

    /// Bytes a volume of this layout can use out of `raw` free bytes,
    /// floored to whole extents
    pub fn usable_bytes(&self, raw: u64, extent_size: u64, pv_count: u64) -> Result<u64> {
        if self.volume_type.min_devices(self)? > pv_count {
            return Err(Error::TooFewDisks);
        }
        let usable = match self.parity_stripes()? {
            Some((stripes, total)) => (raw / total)
                .checked_mul(stripes)
                .ok_or_else(|| layout_overflow(self))?,
            None => raw / self.data_copies()?,
        };
        if extent_size == 0 {
            return Ok(usable);
        }
        Ok(usable / extent_size * extent_size)
    }

    /// Raw bytes consumed by a volume of `size` bytes including redundancy
    pub fn raw_bytes(&self, size: u64) -> Result<u64> {
        let raw = match self.parity_stripes()? {
            Some((stripes, total)) => (size / stripes).checked_mul(total),
            None => size.checked_mul(self.data_copies()?),
        };
        raw.ok_or_else(|| layout_overflow(self))
    }
}

// =============================================================================
// Logical Volumes
// =============================================================================

/// A logical volume as reported by the volume group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolume {
    /// Volume name, also the plugin's volume id
    pub name: String,
    /// Durable identifier assigned by LVM
    pub uuid: String,
    pub size_bytes: u64,
    pub tags: Vec<String>,
    /// Device path, e.g. `/dev/<vg>/<name>`
    pub path: String,
}

impl LogicalVolume {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// First tag starting with the given prefix, prefix stripped
    pub fn tag_value(&self, prefix: &str) -> Option<&str> {
        self.tags.iter().find_map(|t| t.strip_prefix(prefix))
    }
}

/// Parameters for creating a logical volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVolume {
    pub name: String,
    pub size_bytes: u64,
    pub layout: VolumeLayout,
    pub tags: Vec<String>,
}

// =============================================================================
// Volume Group Port
// =============================================================================

/// Port for the LVM volume group the plugin carves volumes from
#[async_trait]
pub trait VolumeGroup: Send + Sync {
    /// Volume group name
    fn name(&self) -> &str;

    /// Check that the volume group exists and is readable
    async fn exists(&self) -> Result<bool>;

    /// Allocation granularity in bytes
    async fn extent_size(&self) -> Result<u64>;

    /// Free bytes usable by a volume with the given layout
    async fn bytes_free(&self, layout: &VolumeLayout) -> Result<u64>;

    /// Look up a volume by name
    async fn lookup(&self, name: &str) -> Result<Option<LogicalVolume>>;

    /// Find the first volume carrying the given tag
    async fn find_by_tag(&self, tag: &str) -> Result<Option<LogicalVolume>>;

    /// List all volume names
    async fn list_names(&self) -> Result<Vec<String>>;

    /// Create a volume
    async fn create(&self, volume: NewVolume) -> Result<LogicalVolume>;

    /// Remove a volume
    async fn remove(&self, name: &str) -> Result<()>;

    /// Activate a volume so its device node exists
    async fn activate(&self, name: &str) -> Result<()>;

    /// Deactivate a volume
    async fn deactivate(&self, name: &str) -> Result<()>;

    async fn add_tag(&self, name: &str, tag: &str) -> Result<()>;

    async fn del_tag(&self, name: &str, tag: &str) -> Result<()>;

    /// Activate every volume of the group, used after pooled target logins
    async fn activate_group(&self) -> Result<()>;
}

// =============================================================================
// Transport Types
// =============================================================================

/// iSCSI connection parameters for one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiTarget {
    pub iqn: String,
    #[serde(default)]
    pub lun: u32,
    /// `host:port` of the target portal
    pub portal: String,
}

impl IscsiTarget {
    /// Encode as a target list entry, `iqn#lun#portal`
    pub fn to_list_entry(&self) -> String {
        format!("{}#{}#{}", self.iqn, self.lun, self.portal)
    }

    /// Parse a target list entry, `iqn#lun#portal` or `iqn#portal`
    pub fn parse_list_entry(entry: &str) -> Result<Self> {
        let chunks: Vec<&str> = entry.trim().split('#').collect();
        match chunks.as_slice() {
            [iqn, lun, portal] => {
                let lun = lun.parse().map_err(|_| {
                    Error::InvalidArgument(format!("unreadable lun in target entry {:?}", entry))
                })?;
                Ok(Self {
                    iqn: iqn.to_string(),
                    lun,
                    portal: portal.to_string(),
                })
            }
            [iqn, portal] => Ok(Self {
                iqn: iqn.to_string(),
                lun: 0,
                portal: portal.to_string(),
            }),
            _ => Err(Error::InvalidArgument(format!(
                "malformed target entry {:?}",
                entry
            ))),
        }
    }

    /// Encode a target list, comma separated
    pub fn join_list(targets: &[IscsiTarget]) -> String {
        targets
            .iter()
            .map(IscsiTarget::to_list_entry)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse a comma separated target list, skipping empty entries
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        list.split(',')
            .filter(|e| !e.trim().is_empty())
            .map(Self::parse_list_entry)
            .collect()
    }
}

/// Per-GiB quality-of-service hints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosHints {
    pub iops_per_gb: Option<u64>,
    pub mbps_per_gb: Option<u64>,
}

impl QosHints {
    /// Hints that clear any limit previously applied
    pub fn cleared() -> Self {
        Self {
            iops_per_gb: Some(0),
            mbps_per_gb: Some(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.iops_per_gb.is_none() && self.mbps_per_gb.is_none()
    }

    /// Volume tag recording the hints, present only when both are set
    pub fn tag(&self) -> Option<String> {
        match (self.iops_per_gb, self.mbps_per_gb) {
            (Some(iops), Some(mbps)) => Some(format!("qos-{}-{}", iops, mbps)),
            _ => None,
        }
    }
}

/// A mount performed on the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    pub source: String,
    pub target: String,
    /// Filesystem type, `block` for a raw device bind mount
    pub fs_type: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub readonly: bool,
}

impl MountRequest {
    pub const BLOCK: &'static str = "block";

    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fs_type: Self::BLOCK.to_string(),
            options: Vec::new(),
            readonly: false,
        }
    }

    pub fn is_bind(&self) -> bool {
        self.fs_type == Self::BLOCK
    }
}

// =============================================================================
// Transport Broker Port
// =============================================================================

/// Port for the remote transport-staging control plane
#[async_trait]
pub trait TransportBroker: Send + Sync {
    /// Allocate an iSCSI target exporting a volume to a node
    async fn stage_iscsi_target(&self, volume_uuid: &str, node_id: &str) -> Result<IscsiTarget>;

    /// Tear down the target exporting a volume to a node
    async fn unstage_iscsi_target(&self, volume_uuid: &str, node_id: &str) -> Result<()>;

    /// Export every drive of a pooled group to a node through the given endpoints
    async fn stage_pooled_targets(
        &self,
        group: &str,
        endpoints: &[String],
        node_id: &str,
    ) -> Result<Vec<IscsiTarget>>;

    /// Log the local initiator into a target, returning the block device path
    async fn login(&self, iqn: &str, portal: &str) -> Result<String>;

    /// Log the local initiator out of a target
    async fn logout(&self, iqn: &str, portal: &str) -> Result<()>;

    /// Apply quality-of-service limits to a volume
    async fn set_qos(&self, group: &str, volume: &str, qos: &QosHints) -> Result<()>;

    /// Perform a mount on the node's behalf
    async fn mount(&self, request: &MountRequest) -> Result<()>;

    /// Unmount a target path on the node's behalf
    async fn unmount(&self, target: &str) -> Result<()>;

    /// Raw mount-table snapshot as seen by the broker
    async fn mount_table(&self) -> Result<String>;

    /// Filesystem type on a device, `None` when unformatted
    async fn filesystem_type(&self, device: &str) -> Result<Option<String>>;

    /// Format a device
    async fn format(&self, device: &str, fs_type: &str) -> Result<()>;

    /// Change group ownership and/or open a target to all users
    async fn set_permissions(&self, target: &str, group: Option<u32>, all_users: bool)
        -> Result<()>;
}

// =============================================================================
// Host System Port
// =============================================================================

/// Where mount and device operations are executed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostMode {
    /// Direct system calls on the local kernel
    #[default]
    Local,
    /// Delegated to the transport broker
    Brokered,
}

impl std::fmt::Display for HostMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostMode::Local => write!(f, "local"),
            HostMode::Brokered => write!(f, "brokered"),
        }
    }
}

impl std::str::FromStr for HostMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(HostMode::Local),
            "brokered" | "proxy" => Ok(HostMode::Brokered),
            other => Err(Error::Configuration(format!("unknown host mode {:?}", other))),
        }
    }
}

/// One entry of the stable by-path device directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByPathLink {
    /// Link name, e.g. `ip-10.0.0.5:3260-iscsi-iqn...-lun-0`
    pub name: String,
    /// Link target as stored, e.g. `../../sdb`
    pub target: String,
}

/// Port for node-local kernel and filesystem operations
#[async_trait]
pub trait HostSystem: Send + Sync {
    fn mode(&self) -> HostMode;

    /// Raw mount-table snapshot
    async fn read_mount_table(&self) -> Result<String>;

    /// Current by-path directory entries
    async fn by_path_links(&self) -> Result<Vec<ByPathLink>>;

    /// Follow symlinks to the real path
    async fn resolve_symlink(&self, path: &str) -> Result<String>;

    /// Create an empty file, used as a block bind-mount target
    async fn create_file(&self, path: &str) -> Result<()>;

    /// Create a directory if it does not exist yet
    async fn ensure_dir(&self, path: &str) -> Result<()>;

    async fn mount(&self, request: &MountRequest) -> Result<()>;

    async fn unmount(&self, target: &str) -> Result<()>;

    /// Filesystem type on a device, `None` when unformatted
    async fn probe_filesystem(&self, device: &str) -> Result<Option<String>>;

    async fn format(&self, device: &str, fs_type: &str) -> Result<()>;

    /// Hand a mounted target to a group with group rwx
    async fn set_group(&self, path: &str, gid: u32) -> Result<()>;

    /// Grant rwx on a mounted target to every user
    async fn open_to_all_users(&self, path: &str) -> Result<()>;

    /// Remove a path and everything below it
    async fn remove_path(&self, path: &str) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type VolumeGroupRef = Arc<dyn VolumeGroup>;
pub type TransportBrokerRef = Arc<dyn TransportBroker>;
pub type HostSystemRef = Arc<dyn HostSystem>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_volume_type_parse() {
        assert_eq!("raid10".parse::<VolumeType>().unwrap(), VolumeType::Raid10);
        assert_eq!(format!("{}", VolumeType::Raid5), "raid5");
        assert_matches!("raid0".parse::<VolumeType>(), Err(Error::InvalidLayout(_)));
    }

    fn layout(volume_type: VolumeType, stripes: Option<u64>, mirrors: Option<u64>) -> VolumeLayout {
        VolumeLayout {
            volume_type,
            stripes,
            mirrors,
            nosync: false,
        }
    }

    #[test]
    fn test_layout_capacity_math() {
        const GIB: u64 = 1 << 30;
        let extent = 4 << 20;

        let raid5 = layout(VolumeType::Raid5, Some(2), None);
        assert_eq!(raid5.usable_bytes(30 * GIB, extent, 3).unwrap(), 20 * GIB);
        assert_matches!(raid5.usable_bytes(30 * GIB, extent, 2), Err(Error::TooFewDisks));

        let raid1 = layout(VolumeType::Raid1, None, None);
        assert_eq!(raid1.usable_bytes(10 * GIB, extent, 2).unwrap(), 5 * GIB);
        assert_eq!(raid1.raw_bytes(GIB).unwrap(), 2 * GIB);

        let raid6 = layout(VolumeType::Raid6, Some(3), None);
        assert_eq!(raid6.raw_bytes(3 * GIB).unwrap(), 5 * GIB);
    }

    #[test]
    fn test_layout_counts_overflow() {
        let cases = [
            layout(VolumeType::Raid1, None, Some(u64::MAX)),
            layout(VolumeType::Raid5, Some(u64::MAX), None),
            layout(VolumeType::Raid6, Some(u64::MAX - 1), None),
            layout(VolumeType::Raid10, Some(1 << 63), None),
        ];
        for case in cases {
            assert_matches!(
                case.usable_bytes(1 << 30, 4 << 20, 4),
                Err(Error::InvalidLayout(_)),
                "{:?}",
                case
            );
        }

        assert_matches!(
            layout(VolumeType::Raid1, None, Some(u64::MAX)).raw_bytes(1 << 30),
            Err(Error::InvalidLayout(_))
        );
        assert_matches!(
            layout(VolumeType::Raid5, Some(0), None).raw_bytes(1 << 30),
            Err(Error::InvalidLayout(_))
        );
        assert_matches!(
            layout(VolumeType::Raid1, None, Some(1)).raw_bytes(u64::MAX),
            Err(Error::InvalidLayout(_))
        );
    }

    #[test]
    fn test_target_list_entries() {
        let targets = IscsiTarget::parse_list(
            "iqn.2003-01.org.a:d1#0#10.0.0.1:3260,iqn.2003-01.org.a:d2#10.0.0.2:3260",
        )
        .unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].lun, 0);
        assert_eq!(targets[1].portal, "10.0.0.2:3260");
        assert_eq!(
            IscsiTarget::join_list(&targets),
            "iqn.2003-01.org.a:d1#0#10.0.0.1:3260,iqn.2003-01.org.a:d2#0#10.0.0.2:3260"
        );

        assert_matches!(
            IscsiTarget::parse_list_entry("only-an-iqn"),
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            IscsiTarget::parse_list_entry("iqn#x#portal"),
            Err(Error::InvalidArgument(_))
        );
    }

    #[test]
    fn test_qos_tag() {
        let qos = QosHints {
            iops_per_gb: Some(50),
            mbps_per_gb: Some(2),
        };
        assert_eq!(qos.tag().as_deref(), Some("qos-50-2"));

        let partial = QosHints {
            iops_per_gb: Some(50),
            mbps_per_gb: None,
        };
        assert_eq!(partial.tag(), None);
        assert!(QosHints::default().is_empty());
    }

    #[test]
    fn test_host_mode_parse() {
        assert_eq!("Brokered".parse::<HostMode>().unwrap(), HostMode::Brokered);
        assert_eq!("local".parse::<HostMode>().unwrap(), HostMode::Local);
        assert_matches!("remote".parse::<HostMode>(), Err(Error::Configuration(_)));
    }
}
