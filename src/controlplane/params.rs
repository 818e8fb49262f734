//! CreateVolume parameter parsing
//!
//! Storage class parameters arrive as a free-form string map. Every key the
//! plugin understands is consumed here; anything left over is rejected.

use crate::domain::context::{
    take_u64, DatapathKind, VolumeAttributes, KEY_ALL_USERS, KEY_BROKER_ENDPOINTS, KEY_DATAPATH,
    KEY_IOPS_PER_GB, KEY_MBPS_PER_GB,
};
use crate::domain::ports::{QosHints, VolumeLayout, VolumeType, MAX_LAYOUT_COUNT};
use crate::error::{Error, Result};
use std::collections::BTreeMap;

pub const KEY_TYPE: &str = "type";
pub const KEY_STRIPES: &str = "stripes";
pub const KEY_MIRRORS: &str = "mirrors";
pub const KEY_NOSYNC: &str = "nosync";

/// Parsed CreateVolume parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateParameters {
    pub layout: VolumeLayout,
    pub datapath: DatapathKind,
    pub broker_endpoints: Vec<String>,
    pub qos: QosHints,
    pub all_users: bool,
}

impl CreateParameters {
    /// Parse every recognised key, failing on leftovers
    pub fn parse(params: &BTreeMap<String, String>) -> Result<Self> {
        let mut rest = params.clone();
        let layout = take_layout(&mut rest)?;

        let datapath = match rest.remove(KEY_DATAPATH) {
            Some(value) => value.parse()?,
            None => DatapathKind::Direct,
        };
        let broker_endpoints: Vec<String> = rest
            .remove(KEY_BROKER_ENDPOINTS)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let qos = QosHints {
            iops_per_gb: take_u64(&mut rest, KEY_IOPS_PER_GB)?,
            mbps_per_gb: take_u64(&mut rest, KEY_MBPS_PER_GB)?,
        };
        let all_users = match rest.remove(KEY_ALL_USERS) {
            Some(v) => parse_bool(KEY_ALL_USERS, &v)?,
            None => false,
        };

        if !rest.is_empty() {
            return Err(Error::UnexpectedParameters(rest.into_keys().collect()));
        }

        Ok(Self {
            layout,
            datapath,
            broker_endpoints,
            qos,
            all_users,
        })
    }

    /// Parse only the layout keys, ignoring everything else
    pub fn parse_layout(params: &BTreeMap<String, String>) -> Result<VolumeLayout> {
        take_layout(&mut params.clone())
    }

    /// Volume context derived from these parameters
    pub fn attributes(&self) -> VolumeAttributes {
        VolumeAttributes {
            datapath: self.datapath,
            broker_endpoints: self.broker_endpoints.clone(),
            qos: self.qos,
            all_users: self.all_users,
            extra: BTreeMap::new(),
        }
    }
}

/// Consume `type` and the keys that apply to it
fn take_layout(params: &mut BTreeMap<String, String>) -> Result<VolumeLayout> {
    let Some(volume_type) = params.remove(KEY_TYPE) else {
        return Ok(VolumeLayout::linear());
    };
    let volume_type: VolumeType = volume_type.parse()?;

    let mut layout = VolumeLayout {
        volume_type,
        ..VolumeLayout::default()
    };
    match volume_type {
        VolumeType::Linear | VolumeType::Raid5 | VolumeType::Raid6 => {
            layout.stripes = take_positive(params, KEY_STRIPES)?;
        }
        VolumeType::Raid1 => {
            layout.mirrors = take_positive(params, KEY_MIRRORS)?;
            layout.nosync = take_nosync(params);
        }
        VolumeType::Raid10 => {
            layout.stripes = take_positive(params, KEY_STRIPES)?;
            layout.nosync = take_nosync(params);
        }
    }
    Ok(layout)
}

fn take_positive(params: &mut BTreeMap<String, String>, key: &str) -> Result<Option<u64>> {
    let Some(value) = params.remove(key) else {
        return Ok(None);
    };
    match value.trim().parse::<u64>() {
        Ok(n) if (1..=MAX_LAYOUT_COUNT).contains(&n) => Ok(Some(n)),
        _ => Err(Error::InvalidLayout(format!(
            "{} must be an integer between 1 and {}, got {:?}",
            key, MAX_LAYOUT_COUNT, value
        ))),
    }
}

fn take_nosync(params: &mut BTreeMap<String, String>) -> bool {
    params
        .remove(KEY_NOSYNC)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "yes" | "y"))
        .unwrap_or(false)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" => Ok(true),
        "false" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidArgument(format!(
            "{} must be a boolean, got {:?}",
            key, value
        ))),
    }
}
