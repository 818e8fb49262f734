//! Protocol data model
//!
//! Request and response shapes of the Identity, Controller and Node service
//! groups. These are the structured forms of the orchestrator protocol
//! messages; the REST layer (de)serializes them as JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Capacity and Capabilities
// =============================================================================

/// Requested capacity bounds; zero means "not set"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRange {
    #[serde(default)]
    pub required_bytes: u64,
    #[serde(default)]
    pub limit_bytes: u64,
}

impl CapacityRange {
    pub fn new(required_bytes: u64, limit_bytes: u64) -> Self {
        Self {
            required_bytes,
            limit_bytes,
        }
    }

    /// Check that a size lies within the requested bounds
    pub fn admits(&self, size: u64) -> bool {
        if self.required_bytes != 0 && size < self.required_bytes {
            return false;
        }
        if self.limit_bytes != 0 && size > self.limit_bytes {
            return false;
        }
        true
    }
}

/// How the volume is consumed on the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AccessType {
    /// Raw block device bind-mounted onto a file
    Block,
    /// Filesystem mounted onto a directory
    Mount {
        #[serde(default)]
        fs_type: String,
        #[serde(default)]
        mount_flags: Vec<String>,
        #[serde(default)]
        volume_mount_group: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

impl AccessMode {
    /// Volumes are node-local; only single-node modes are supported
    pub fn is_single_node(&self) -> bool {
        matches!(
            self,
            AccessMode::SingleNodeWriter
                | AccessMode::SingleNodeReaderOnly
                | AccessMode::SingleNodeSingleWriter
                | AccessMode::SingleNodeMultiWriter
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCapability {
    pub access_type: AccessType,
    pub access_mode: AccessMode,
}

impl VolumeCapability {
    pub fn block(access_mode: AccessMode) -> Self {
        Self {
            access_type: AccessType::Block,
            access_mode,
        }
    }

    pub fn mount(fs_type: impl Into<String>, access_mode: AccessMode) -> Self {
        Self {
            access_type: AccessType::Mount {
                fs_type: fs_type.into(),
                mount_flags: Vec::new(),
                volume_mount_group: None,
            },
            access_mode,
        }
    }

    /// Requested filesystem type, empty for block access
    pub fn fs_type(&self) -> &str {
        match &self.access_type {
            AccessType::Block => "",
            AccessType::Mount { fs_type, .. } => fs_type,
        }
    }
}

// =============================================================================
// Volumes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub volume_id: String,
    pub capacity_bytes: u64,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
}

// =============================================================================
// Controller Requests
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesRequest {
    #[serde(default)]
    pub max_entries: u32,
    #[serde(default)]
    pub starting_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesResponse {
    pub entries: Vec<Volume>,
    #[serde(default)]
    pub next_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetCapacityRequest {
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerPublishRequest {
    pub volume_id: String,
    pub node_id: String,
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerUnpublishRequest {
    pub volume_id: String,
    #[serde(default)]
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateCapabilitiesRequest {
    pub volume_id: String,
    pub volume_capabilities: Vec<VolumeCapability>,
}

/// Confirmed capabilities, empty when the request was not fully supported
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateCapabilitiesResponse {
    pub confirmed: Vec<VolumeCapability>,
    #[serde(default)]
    pub message: String,
}

// =============================================================================
// Node Requests
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishRequest {
    pub volume_id: String,
    pub target_path: String,
    pub volume_capability: VolumeCapability,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub publish_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUnpublishRequest {
    pub volume_id: String,
    pub target_path: String,
}

// =============================================================================
// Identity
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub vendor_version: String,
    #[serde(default)]
    pub manifest: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginCapability {
    ControllerService,
    VolumeAccessibilityConstraints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ListVolumes,
    GetCapacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCapability {
    VolumeMountGroup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    /// Topology segments the node can reach
    pub accessible_topology: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_range_admits() {
        let range = CapacityRange::new(10, 20);
        assert!(range.admits(10));
        assert!(range.admits(20));
        assert!(!range.admits(9));
        assert!(!range.admits(21));

        assert!(CapacityRange::default().admits(u64::MAX));
    }

    #[test]
    fn test_capability_json_shape() {
        let cap: VolumeCapability = serde_json::from_str(
            r#"{"access_type":{"kind":"mount","fs_type":"xfs"},"access_mode":"single_node_writer"}"#,
        )
        .unwrap();
        assert_eq!(cap.fs_type(), "xfs");
        assert!(cap.access_mode.is_single_node());

        let block: VolumeCapability = serde_json::from_str(
            r#"{"access_type":{"kind":"block"},"access_mode":"multi_node_multi_writer"}"#,
        )
        .unwrap();
        assert_eq!(block.access_type, AccessType::Block);
        assert!(!block.access_mode.is_single_node());
    }
}
