//! Volume Lifecycle
//!
//! Create, delete, list and capacity accounting against the volume group.
//! Creation is idempotent by requested name: the name is recorded as a tag
//! and a repeated request returns the volume already carrying it.

use super::params::CreateParameters;
use super::tag;
use crate::domain::context::{DatapathKind, VolumeAttributes, KEY_TAGS};
use crate::domain::ports::{HostSystemRef, LogicalVolume, NewVolume, VolumeGroupRef, VolumeLayout};
use crate::domain::types::{
    AccessType, CapacityRange, CreateVolumeRequest, GetCapacityRequest, ListVolumesRequest,
    ListVolumesResponse, ValidateCapabilitiesRequest, ValidateCapabilitiesResponse, Volume,
    VolumeCapability,
};
use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeSet;
use tracing::{debug, info};

const ID_SUFFIX_LEN: usize = 12;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for volume lifecycle operations
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Size used when the request gives no minimum
    pub default_volume_size: u64,
    /// Filesystem types volumes may be formatted with
    pub supported_filesystems: BTreeSet<String>,
    /// Tags attached to every created volume
    pub group_tags: Vec<String>,
    /// Prefix of generated volume ids
    pub id_prefix: String,
    /// Attempts at generating a non-colliding id
    pub id_attempts: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_volume_size: 10 << 30,
            supported_filesystems: ["xfs", "ext4"].iter().map(|s| s.to_string()).collect(),
            group_tags: Vec::new(),
            id_prefix: "lv".to_string(),
            id_attempts: 10,
        }
    }
}

impl LifecycleConfig {
    /// Reject group tags LVM would refuse
    pub fn validate(&self) -> Result<()> {
        for t in &self.group_tags {
            if t.is_empty() || !t.chars().all(tag::is_tag_safe) {
                return Err(Error::Configuration(format!("invalid volume group tag {:?}", t)));
            }
        }
        if self.id_attempts == 0 {
            return Err(Error::Configuration("id_attempts must be positive".to_string()));
        }
        Ok(())
    }

    /// Empty means "use the default filesystem"
    pub fn supports_filesystem(&self, fs_type: &str) -> bool {
        fs_type.is_empty() || self.supported_filesystems.contains(fs_type)
    }
}

// =============================================================================
// Volume Lifecycle
// =============================================================================

pub struct VolumeLifecycle {
    config: LifecycleConfig,
    group: VolumeGroupRef,
    host: HostSystemRef,
}

impl VolumeLifecycle {
    pub fn new(config: LifecycleConfig, group: VolumeGroupRef, host: HostSystemRef) -> Self {
        Self {
            config,
            group,
            host,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Create a volume, or return the one already created under this name
    pub async fn create(&self, request: &CreateVolumeRequest) -> Result<Volume> {
        if request.name.is_empty() {
            return Err(Error::InvalidArgument("volume name is required".to_string()));
        }
        self.validate_capabilities(&request.volume_capabilities)?;
        let range = request.capacity_range.unwrap_or_default();
        if range.limit_bytes != 0 && range.limit_bytes < range.required_bytes {
            return Err(Error::InvalidArgument(format!(
                "limit_bytes {} is below required_bytes {}",
                range.limit_bytes, range.required_bytes
            )));
        }
        let params = CreateParameters::parse(&request.parameters)?;

        let name_tag = tag::encode(&request.name);
        debug!("Looking for volume {:?} tagged {}", request.name, name_tag);
        if let Some(existing) = self.group.find_by_tag(&name_tag).await? {
            if !range.admits(existing.size_bytes) {
                info!(
                    "Existing volume {} ({} bytes) does not satisfy {:?}",
                    existing.name, existing.size_bytes, range
                );
                return Err(Error::VolumeAlreadyExists {
                    name: request.name.clone(),
                });
            }
            info!("Volume {:?} already exists as {}", request.name, existing.name);
            return Ok(to_volume(&existing, params.attributes()));
        }

        let size = self.resolve_size(&range, &params.layout).await?;
        let volume_id = self.allocate_id().await?;

        let mut tags = self.config.group_tags.clone();
        tags.push(name_tag);
        tags.push(params.datapath.tag());

        info!(
            volume_id = %volume_id,
            size_bytes = size,
            layout = %params.layout.volume_type,
            datapath = %params.datapath,
            "Creating volume for {:?}", request.name
        );
        let created = self
            .group
            .create(NewVolume {
                name: volume_id,
                size_bytes: size,
                layout: params.layout,
                tags,
            })
            .await?;

        Ok(to_volume(&created, params.attributes()))
    }

    /// Resolve the extent-aligned size satisfying a capacity range
    pub async fn resolve_size(&self, range: &CapacityRange, layout: &VolumeLayout) -> Result<u64> {
        let extent_size = self.group.extent_size().await?;
        if extent_size == 0 {
            return Err(Error::VolumeGroup("volume group reports a zero extent size".to_string()));
        }

        let minimum = match (range.required_bytes, range.limit_bytes) {
            (0, 0) => self.config.default_volume_size,
            (0, limit) => self.config.default_volume_size.min(limit),
            (required, _) => required,
        };
        let size = round_up(minimum, extent_size)?;
        if size != minimum {
            debug!(
                "Rounded size up from {}MiB to {}MiB (extent {}MiB)",
                minimum >> 20,
                size >> 20,
                extent_size >> 20
            );
        }

        if range.limit_bytes != 0 && size > range.limit_bytes {
            return Err(Error::ExtentSizeMismatch { extent_size });
        }

        let available = self.group.bytes_free(layout).await?;
        if size > available {
            return Err(Error::InsufficientCapacity {
                requested: size,
                available,
            });
        }
        Ok(size)
    }

    async fn allocate_id(&self) -> Result<String> {
        for _ in 0..self.config.id_attempts {
            let candidate = format!("{}{}", self.config.id_prefix, random_suffix());
            if self.group.lookup(&candidate).await?.is_none() {
                return Ok(candidate);
            }
            debug!("Volume id {} already taken, retrying", candidate);
        }
        Err(Error::Internal(format!(
            "failed to allocate a volume id after {} attempts",
            self.config.id_attempts
        )))
    }

    /// Delete a volume; a missing volume is already deleted
    pub async fn delete(&self, volume_id: &str) -> Result<()> {
        if volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id is required".to_string()));
        }
        if self.group.lookup(volume_id).await?.is_none() {
            debug!("Volume {} not found, nothing to delete", volume_id);
            return Ok(());
        }
        info!("Removing volume {}", volume_id);
        self.group.remove(volume_id).await
    }

    pub async fn list(&self, request: &ListVolumesRequest) -> Result<ListVolumesResponse> {
        if !request.starting_token.is_empty() {
            return Err(Error::PaginationUnsupported(request.starting_token.clone()));
        }
        let mut entries = Vec::new();
        for name in self.group.list_names().await? {
            match self.group.lookup(&name).await? {
                Some(lv) => entries.push(to_volume(&lv, attributes_from_tags(&lv))),
                None => debug!("Volume {} disappeared while listing", name),
            }
        }
        Ok(ListVolumesResponse {
            entries,
            next_token: String::new(),
        })
    }

    /// Free bytes for the requested layout, zero for unsupported filesystems
    pub async fn capacity(&self, request: &GetCapacityRequest) -> Result<u64> {
        for capability in &request.volume_capabilities {
            if let AccessType::Mount { fs_type, .. } = &capability.access_type {
                if !self.config.supports_filesystem(fs_type) {
                    debug!("Reporting zero capacity for unsupported filesystem {}", fs_type);
                    return Ok(0);
                }
            }
        }
        let layout = CreateParameters::parse_layout(&request.parameters)?;
        self.group.bytes_free(&layout).await
    }

    /// Check that a volume can be consumed with the given capabilities
    pub async fn validate(
        &self,
        request: &ValidateCapabilitiesRequest,
    ) -> Result<ValidateCapabilitiesResponse> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id is required".to_string()));
        }
        if request.volume_capabilities.is_empty() {
            return Err(Error::InvalidArgument(
                "volume capabilities are required".to_string(),
            ));
        }
        let lv = self
            .group
            .lookup(&request.volume_id)
            .await?
            .ok_or_else(|| Error::VolumeNotFound(request.volume_id.clone()))?;

        let existing = self.host.probe_filesystem(&lv.path).await?;
        debug!("Volume {} carries filesystem {:?}", lv.name, existing);
        if let Some(existing) = existing {
            for capability in &request.volume_capabilities {
                let requested = capability.fs_type();
                if matches!(capability.access_type, AccessType::Mount { .. })
                    && !requested.is_empty()
                    && requested != existing
                {
                    return Err(Error::MismatchedFilesystem {
                        requested: requested.to_string(),
                        existing,
                    });
                }
            }
        }

        if let Err(e) = self.validate_capabilities(&request.volume_capabilities) {
            return Ok(ValidateCapabilitiesResponse {
                confirmed: Vec::new(),
                message: e.to_string(),
            });
        }
        Ok(ValidateCapabilitiesResponse {
            confirmed: request.volume_capabilities.clone(),
            message: String::new(),
        })
    }

    fn validate_capabilities(&self, capabilities: &[VolumeCapability]) -> Result<()> {
        for capability in capabilities {
            if !capability.access_mode.is_single_node() {
                return Err(Error::InvalidArgument(format!(
                    "unsupported access mode {:?}",
                    capability.access_mode
                )));
            }
            if let AccessType::Mount { fs_type, .. } = &capability.access_type {
                if !self.config.supports_filesystem(fs_type) {
                    return Err(Error::InvalidArgument(format!(
                        "unsupported filesystem type {:?}",
                        fs_type
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of volumes in the group
    pub async fn volume_count(&self) -> Result<usize> {
        Ok(self.group.list_names().await?.len())
    }

    /// Free bytes for a linear volume
    pub async fn bytes_free(&self) -> Result<u64> {
        self.group.bytes_free(&VolumeLayout::linear()).await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn round_up(size: u64, extent_size: u64) -> Result<u64> {
    size.div_ceil(extent_size)
        .checked_mul(extent_size)
        .ok_or_else(|| Error::InvalidArgument(format!("requested size {} is too large", size)))
}

/// Lowercase alphanumeric volume id suffix
fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Attributes recoverable from a volume's own tags
fn attributes_from_tags(lv: &LogicalVolume) -> VolumeAttributes {
    let datapath = lv
        .tag_value(DatapathKind::TAG_PREFIX)
        .and_then(|kind| kind.parse().ok())
        .unwrap_or_default();
    VolumeAttributes {
        datapath,
        ..VolumeAttributes::default()
    }
}

fn to_volume(lv: &LogicalVolume, mut attributes: VolumeAttributes) -> Volume {
    if !lv.tags.is_empty() {
        if let Ok(json) = serde_json::to_vec(&lv.tags) {
            attributes
                .extra
                .insert(KEY_TAGS.to_string(), URL_SAFE_NO_PAD.encode(json));
        }
    }
    Volume {
        volume_id: lv.name.clone(),
        capacity_bytes: lv.size_bytes,
        volume_context: attributes.to_map(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::memory::{InMemoryConfig, InMemoryVolumeGroup};
    use crate::domain::ports::VolumeGroup;
    use crate::domain::types::AccessMode;
    use crate::testing::FakeHost;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;

    fn setup(total: u64) -> (VolumeLifecycle, Arc<InMemoryVolumeGroup>, Arc<FakeHost>) {
        let group = Arc::new(InMemoryVolumeGroup::new(InMemoryConfig {
            total_bytes: total,
            ..InMemoryConfig::default()
        }));
        let host = Arc::new(FakeHost::new());
        let lifecycle = VolumeLifecycle::new(LifecycleConfig::default(), group.clone(), host.clone());
        (lifecycle, group, host)
    }

    fn create_request(name: &str, required: u64, limit: u64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.to_string(),
            capacity_range: Some(CapacityRange::new(required, limit)),
            volume_capabilities: vec![VolumeCapability::mount("xfs", AccessMode::SingleNodeWriter)],
            parameters: BTreeMap::new(),
        }
    }

    #[test]
    fn test_round_up() {
        let extent = 4 * MIB;
        assert_eq!(round_up(1, extent).unwrap(), extent);
        assert_eq!(round_up(extent, extent).unwrap(), extent);
        assert_eq!(round_up(extent + 1, extent).unwrap(), 2 * extent);
        assert_matches!(round_up(u64::MAX, extent), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_random_suffix() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), ID_SUFFIX_LEN);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[tokio::test]
    async fn test_resolve_size_rounds_to_extent() {
        let (lifecycle, _, _) = setup(100 * GIB);
        let layout = VolumeLayout::linear();

        let size = lifecycle
            .resolve_size(&CapacityRange::new(10 * MIB + 1, 0), &layout)
            .await
            .unwrap();
        assert_eq!(size, 12 * MIB);

        let default = lifecycle
            .resolve_size(&CapacityRange::default(), &layout)
            .await
            .unwrap();
        assert_eq!(default, 10 * GIB);

        let capped = lifecycle
            .resolve_size(&CapacityRange::new(0, 2 * GIB), &layout)
            .await
            .unwrap();
        assert_eq!(capped, 2 * GIB);
    }

    #[tokio::test]
    async fn test_resolve_size_errors() {
        let (lifecycle, _, _) = setup(64 * MIB);
        let layout = VolumeLayout::linear();

        let err = lifecycle
            .resolve_size(&CapacityRange::new(MIB, 3 * MIB), &layout)
            .await
            .unwrap_err();
        assert_matches!(err, Error::ExtentSizeMismatch { extent_size } if extent_size == 4 * MIB);

        let err = lifecycle
            .resolve_size(&CapacityRange::new(128 * MIB, 0), &layout)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::InsufficientCapacity { requested, available }
                if requested == 128 * MIB && available == 64 * MIB
        );
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (lifecycle, group, _) = setup(100 * GIB);
        let request = create_request("pvc-1", GIB, 0);

        let first = lifecycle.create(&request).await.unwrap();
        let second = lifecycle.create(&request).await.unwrap();

        assert_eq!(first.volume_id, second.volume_id);
        assert_eq!(first.capacity_bytes, GIB);
        assert_eq!(group.created_count(), 1);
        assert_eq!(first.volume_context["datapath"], "direct");
        assert!(first.volume_context.contains_key("tags"));
    }

    #[tokio::test]
    async fn test_create_tags_volume() {
        let (lifecycle, group, _) = setup(100 * GIB);
        let mut request = create_request("ns/pvc 2", GIB, 0);
        request
            .parameters
            .insert("datapath".to_string(), "iscsi".to_string());

        let volume = lifecycle.create(&request).await.unwrap();
        let lv = group.lookup(&volume.volume_id).await.unwrap().unwrap();
        assert!(volume.volume_id.starts_with("lv"));
        assert!(lv.has_tag(&tag::encode("ns/pvc 2")));
        assert!(lv.has_tag("DP.iscsi"));
    }

    #[tokio::test]
    async fn test_create_existing_too_small() {
        let (lifecycle, _, _) = setup(100 * GIB);
        lifecycle.create(&create_request("pvc-1", GIB, 0)).await.unwrap();

        let err = lifecycle
            .create(&create_request("pvc-1", 2 * GIB, 0))
            .await
            .unwrap_err();
        assert_matches!(err, Error::VolumeAlreadyExists { .. });

        let err = lifecycle
            .create(&create_request("pvc-1", 0, 512 * MIB))
            .await
            .unwrap_err();
        assert_matches!(err, Error::VolumeAlreadyExists { .. });
    }

    #[tokio::test]
    async fn test_create_rejects_leftover_parameters() {
        let (lifecycle, group, _) = setup(100 * GIB);
        let mut request = create_request("pvc-1", GIB, 0);
        request
            .parameters
            .insert("replicas".to_string(), "3".to_string());

        let err = lifecycle.create(&request).await.unwrap_err();
        assert_matches!(err, Error::UnexpectedParameters(_));
        assert_eq!(group.created_count(), 0);
    }

    #[tokio::test]
    async fn test_create_raid_needs_devices() {
        let (lifecycle, _, _) = setup(100 * GIB);
        let mut request = create_request("pvc-raid", GIB, 0);
        request
            .parameters
            .insert("type".to_string(), "raid1".to_string());

        let err = lifecycle.create(&request).await.unwrap_err();
        assert_matches!(err, Error::TooFewDisks);
    }

    fn oversized_layouts() -> Vec<BTreeMap<String, String>> {
        let max = u64::MAX.to_string();
        let max_minus_one = (u64::MAX - 1).to_string();
        let half = (1u64 << 63).to_string();
        [
            ("raid1", "mirrors", max.as_str()),
            ("raid5", "stripes", max.as_str()),
            ("raid6", "stripes", max_minus_one.as_str()),
            ("raid10", "stripes", half.as_str()),
        ]
        .into_iter()
        .map(|(kind, key, value)| {
            BTreeMap::from([
                ("type".to_string(), kind.to_string()),
                (key.to_string(), value.to_string()),
            ])
        })
        .collect()
    }

    #[tokio::test]
    async fn test_create_rejects_oversized_layout_counts() {
        let (lifecycle, group, _) = setup(100 * GIB);
        for parameters in oversized_layouts() {
            let mut request = create_request("pvc-huge", GIB, 0);
            request.parameters = parameters.clone();
            let err = lifecycle.create(&request).await.unwrap_err();
            assert_matches!(err, Error::InvalidLayout(_), "{:?}", parameters);
        }
        assert_eq!(group.created_count(), 0);
    }

    #[tokio::test]
    async fn test_capacity_rejects_oversized_layout_counts() {
        let (lifecycle, _, _) = setup(100 * GIB);
        for parameters in oversized_layouts() {
            let err = lifecycle
                .capacity(&GetCapacityRequest {
                    volume_capabilities: Vec::new(),
                    parameters: parameters.clone(),
                })
                .await
                .unwrap_err();
            assert_matches!(err, Error::InvalidLayout(_), "{:?}", parameters);
        }
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let (lifecycle, _, _) = setup(100 * GIB);
        lifecycle.delete("lvdoesnotexist").await.unwrap();
        assert_matches!(lifecycle.delete("").await, Err(Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_volume() {
        let (lifecycle, group, _) = setup(100 * GIB);
        let volume = lifecycle.create(&create_request("pvc-1", GIB, 0)).await.unwrap();

        lifecycle.delete(&volume.volume_id).await.unwrap();
        assert!(group.lookup(&volume.volume_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_volumes() {
        let (lifecycle, _, _) = setup(100 * GIB);
        lifecycle.create(&create_request("a", GIB, 0)).await.unwrap();
        lifecycle.create(&create_request("b", GIB, 0)).await.unwrap();

        let listed = lifecycle.list(&ListVolumesRequest::default()).await.unwrap();
        assert_eq!(listed.entries.len(), 2);

        let err = lifecycle
            .list(&ListVolumesRequest {
                max_entries: 0,
                starting_token: "page-2".to_string(),
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::PaginationUnsupported(_));
    }

    #[tokio::test]
    async fn test_capacity() {
        let (lifecycle, _, _) = setup(100 * GIB);

        let free = lifecycle
            .capacity(&GetCapacityRequest::default())
            .await
            .unwrap();
        assert_eq!(free, 100 * GIB);

        let zero = lifecycle
            .capacity(&GetCapacityRequest {
                volume_capabilities: vec![VolumeCapability::mount(
                    "zfs",
                    AccessMode::SingleNodeWriter,
                )],
                parameters: BTreeMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(zero, 0);
    }

    #[tokio::test]
    async fn test_validate_detects_mismatched_filesystem() {
        let (lifecycle, group, host) = setup(100 * GIB);
        let volume = lifecycle.create(&create_request("pvc-1", GIB, 0)).await.unwrap();
        let lv = group.lookup(&volume.volume_id).await.unwrap().unwrap();
        host.set_filesystem(&lv.path, "ext4");

        let err = lifecycle
            .validate(&ValidateCapabilitiesRequest {
                volume_id: volume.volume_id.clone(),
                volume_capabilities: vec![VolumeCapability::mount(
                    "xfs",
                    AccessMode::SingleNodeWriter,
                )],
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::MismatchedFilesystem { .. });

        let ok = lifecycle
            .validate(&ValidateCapabilitiesRequest {
                volume_id: volume.volume_id,
                volume_capabilities: vec![
                    VolumeCapability::mount("ext4", AccessMode::SingleNodeWriter),
                    VolumeCapability::block(AccessMode::SingleNodeWriter),
                ],
            })
            .await
            .unwrap();
        assert_eq!(ok.confirmed.len(), 2);
    }

    #[tokio::test]
    async fn test_validate_missing_volume() {
        let (lifecycle, _, _) = setup(100 * GIB);
        let err = lifecycle
            .validate(&ValidateCapabilitiesRequest {
                volume_id: "lvnope".to_string(),
                volume_capabilities: vec![VolumeCapability::block(AccessMode::SingleNodeWriter)],
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::VolumeNotFound(_));
    }

    #[test]
    fn test_config_validate() {
        let mut config = LifecycleConfig::default();
        config.group_tags = vec!["tenant.a".to_string()];
        assert!(config.validate().is_ok());
        config.group_tags.push("bad tag".to_string());
        assert_matches!(config.validate(), Err(Error::Configuration(_)));
    }
}
