//! Datapath kinds and the controller-to-node publish context
//!
//! The orchestrator threads a flat string map from ControllerPublish to
//! NodePublish. Inside the plugin that map is handled as [`PublishContext`],
//! a structured value whose staging payload is specific to the datapath;
//! translation to and from the flat map happens only at the protocol edge.

use crate::domain::ports::{IscsiTarget, QosHints};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Context Keys
// =============================================================================

pub const KEY_DATAPATH: &str = "datapath";
pub const KEY_BLOCK_ID: &str = "blockid";
pub const KEY_LUN: &str = "lun";
pub const KEY_PORTAL: &str = "portal";
pub const KEY_TARGET_LIST: &str = "targetlist";
pub const KEY_BROKER_ENDPOINTS: &str = "brokerendpoints";
pub const KEY_ALL_USERS: &str = "allusers";
pub const KEY_IOPS_PER_GB: &str = "iopspergb";
pub const KEY_MBPS_PER_GB: &str = "mbpspergb";
pub const KEY_TAGS: &str = "tags";

/// `blockid` value of a direct-attached volume
pub const BLOCK_ID_NOT_NEEDED: &str = "notneeded";

// =============================================================================
// Datapath Kind
// =============================================================================

/// Transport by which a published volume reaches the consuming node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatapathKind {
    #[default]
    Direct,
    Iscsi,
    /// Pooled iSCSI targets exported by JBOF endpoints
    Jbofis,
    Nvme,
    Qemu,
}

impl DatapathKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatapathKind::Direct => "direct",
            DatapathKind::Iscsi => "iscsi",
            DatapathKind::Jbofis => "jbofis",
            DatapathKind::Nvme => "nvme",
            DatapathKind::Qemu => "qemu",
        }
    }

    /// Check whether ControllerPublish can stage this kind
    pub fn is_supported(&self) -> bool {
        !matches!(self, DatapathKind::Nvme | DatapathKind::Qemu)
    }

    /// Volume tag recording the datapath, e.g. `DP.iscsi`
    pub fn tag(&self) -> String {
        format!("{}{}", Self::TAG_PREFIX, self.as_str())
    }

    pub const TAG_PREFIX: &'static str = "DP.";
}

impl std::fmt::Display for DatapathKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DatapathKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(DatapathKind::Direct),
            "iscsi" => Ok(DatapathKind::Iscsi),
            "jbofis" => Ok(DatapathKind::Jbofis),
            "nvme" => Ok(DatapathKind::Nvme),
            "qemu" => Ok(DatapathKind::Qemu),
            other => Err(Error::UnsupportedDatapath(other.to_string())),
        }
    }
}

// =============================================================================
// Volume Attributes
// =============================================================================

/// Volume context returned by CreateVolume and fed back into ControllerPublish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeAttributes {
    pub datapath: DatapathKind,
    pub broker_endpoints: Vec<String>,
    pub qos: QosHints,
    pub all_users: bool,
    /// Keys passed through untouched, e.g. `tags`
    pub extra: BTreeMap<String, String>,
}

impl VolumeAttributes {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.extra.clone();
        map.insert(KEY_DATAPATH.to_string(), self.datapath.to_string());
        if !self.broker_endpoints.is_empty() {
            map.insert(
                KEY_BROKER_ENDPOINTS.to_string(),
                self.broker_endpoints.join(","),
            );
        }
        insert_qos(&mut map, &self.qos);
        if self.all_users {
            map.insert(KEY_ALL_USERS.to_string(), "true".to_string());
        }
        map
    }

    /// Parse a volume context; a missing datapath means direct
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let mut rest = map.clone();
        let datapath = match rest.remove(KEY_DATAPATH) {
            Some(value) => value.parse()?,
            None => DatapathKind::Direct,
        };
        let broker_endpoints = rest
            .remove(KEY_BROKER_ENDPOINTS)
            .map(|v| split_list(&v))
            .unwrap_or_default();
        let qos = take_qos(&mut rest)?;
        let all_users = take_all_users(&mut rest);
        Ok(Self {
            datapath,
            broker_endpoints,
            qos,
            all_users,
            extra: rest,
        })
    }
}

// =============================================================================
// Publish Context
// =============================================================================

/// Transport staging results, one case per stageable datapath
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staging {
    /// Local device, no transport setup
    Direct,
    /// Single iSCSI target exporting the volume
    Iscsi(IscsiTarget),
    /// Every pooled target the node must log into
    Pooled(Vec<IscsiTarget>),
}

impl Staging {
    pub fn kind(&self) -> DatapathKind {
        match self {
            Staging::Direct => DatapathKind::Direct,
            Staging::Iscsi(_) => DatapathKind::Iscsi,
            Staging::Pooled(_) => DatapathKind::Jbofis,
        }
    }
}

/// Structured publish context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishContext {
    pub staging: Staging,
    pub qos: QosHints,
    pub all_users: bool,
    /// Keys passed through untouched
    pub extra: BTreeMap<String, String>,
}

impl PublishContext {
    /// Combine a volume's attributes with the staging result
    pub fn from_attributes(attributes: VolumeAttributes, staging: Staging) -> Self {
        let mut extra = attributes.extra;
        if !attributes.broker_endpoints.is_empty() {
            extra.insert(
                KEY_BROKER_ENDPOINTS.to_string(),
                attributes.broker_endpoints.join(","),
            );
        }
        Self {
            staging,
            qos: attributes.qos,
            all_users: attributes.all_users,
            extra,
        }
    }

    pub fn datapath(&self) -> DatapathKind {
        self.staging.kind()
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.extra.clone();
        map.insert(KEY_DATAPATH.to_string(), self.datapath().to_string());
        match &self.staging {
            Staging::Direct => {
                map.insert(KEY_BLOCK_ID.to_string(), BLOCK_ID_NOT_NEEDED.to_string());
            }
            Staging::Iscsi(target) => {
                map.insert(KEY_BLOCK_ID.to_string(), target.iqn.clone());
                map.insert(KEY_LUN.to_string(), target.lun.to_string());
                map.insert(KEY_PORTAL.to_string(), target.portal.clone());
            }
            Staging::Pooled(targets) => {
                map.insert(KEY_TARGET_LIST.to_string(), IscsiTarget::join_list(targets));
            }
        }
        insert_qos(&mut map, &self.qos);
        if self.all_users {
            map.insert(KEY_ALL_USERS.to_string(), "true".to_string());
        }
        map
    }

    /// Parse the flat map received by NodePublish
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let mut rest = map.clone();
        let datapath: DatapathKind = rest
            .remove(KEY_DATAPATH)
            .ok_or_else(|| {
                Error::InvalidArgument("publish context has no datapath".to_string())
            })?
            .parse()?;

        let staging = match datapath {
            DatapathKind::Direct => {
                rest.remove(KEY_BLOCK_ID);
                Staging::Direct
            }
            DatapathKind::Iscsi => {
                let iqn = take_required(&mut rest, KEY_BLOCK_ID)?;
                let portal = take_required(&mut rest, KEY_PORTAL)?;
                let lun = match rest.remove(KEY_LUN) {
                    Some(lun) => lun.parse().map_err(|_| {
                        Error::InvalidArgument(format!("unreadable lun {:?}", lun))
                    })?,
                    None => 0,
                };
                Staging::Iscsi(IscsiTarget { iqn, lun, portal })
            }
            DatapathKind::Jbofis => {
                rest.remove(KEY_BLOCK_ID);
                let list = take_required(&mut rest, KEY_TARGET_LIST)?;
                Staging::Pooled(IscsiTarget::parse_list(&list)?)
            }
            DatapathKind::Nvme | DatapathKind::Qemu => {
                return Err(Error::UnsupportedDatapath(datapath.to_string()));
            }
        };

        let qos = take_qos(&mut rest)?;
        let all_users = take_all_users(&mut rest);
        Ok(Self {
            staging,
            qos,
            all_users,
            extra: rest,
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn take_required(map: &mut BTreeMap<String, String>, key: &str) -> Result<String> {
    map.remove(key)
        .ok_or_else(|| Error::InvalidArgument(format!("publish context has no {}", key)))
}

fn take_qos(map: &mut BTreeMap<String, String>) -> Result<QosHints> {
    Ok(QosHints {
        iops_per_gb: take_u64(map, KEY_IOPS_PER_GB)?,
        mbps_per_gb: take_u64(map, KEY_MBPS_PER_GB)?,
    })
}

pub(crate) fn take_u64(map: &mut BTreeMap<String, String>, key: &str) -> Result<Option<u64>> {
    match map.remove(key) {
        Some(value) => value.trim().parse().map(Some).map_err(|_| {
            Error::InvalidArgument(format!("{} must be a non-negative integer, got {:?}", key, value))
        }),
        None => Ok(None),
    }
}

fn take_all_users(map: &mut BTreeMap<String, String>) -> bool {
    map.remove(KEY_ALL_USERS)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn insert_qos(map: &mut BTreeMap<String, String>, qos: &QosHints) {
    if let Some(iops) = qos.iops_per_gb {
        map.insert(KEY_IOPS_PER_GB.to_string(), iops.to_string());
    }
    if let Some(mbps) = qos.mbps_per_gb {
        map.insert(KEY_MBPS_PER_GB.to_string(), mbps.to_string());
    }
}
