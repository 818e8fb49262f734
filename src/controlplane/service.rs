//! Plugin Service - the RPC surface
//!
//! Identity, Controller and Node operations in one place. Every call is
//! admitted through [`RequestAdmission`], so at most one operation mutates
//! the volume group or the node's mounts at a time, and every call is
//! counted in [`PluginMetrics`].

use crate::admission::{RequestAdmission, RequestContext};
use crate::controlplane::datapath::DatapathPublisher;
use crate::controlplane::lifecycle::VolumeLifecycle;
use crate::controlplane::metrics::PluginMetrics;
use crate::domain::ports::{VolumeGroupRef, VolumeLayout};
use crate::domain::types::*;
use crate::error::{Diagnostics, Error, Result};
use crate::node::initiator::{resolve_node_id, DEFAULT_INITIATOR_FILE};
use crate::node::MountReconciler;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// RPCs the plugin answers with `Unimplemented`
pub const UNIMPLEMENTED_RPCS: &[&str] = &[
    "CreateSnapshot",
    "DeleteSnapshot",
    "ListSnapshots",
    "ControllerExpandVolume",
    "ControllerGetVolume",
    "NodeStageVolume",
    "NodeUnstageVolume",
    "NodeExpandVolume",
    "NodeGetVolumeStats",
];

// =============================================================================
// Configuration
// =============================================================================

/// Identity and node settings of the plugin
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Name reported by GetPluginInfo
    pub plugin_name: String,
    /// Version reported by GetPluginInfo
    pub vendor_version: String,
    /// Extra build information reported by GetPluginInfo
    pub manifest: BTreeMap<String, String>,
    /// Serve the controller service
    pub controller_mode: bool,
    /// Node id used when the initiator file names none
    pub node_id: String,
    /// Topology segment key reported by NodeGetInfo
    pub topology_key: String,
    /// iSCSI initiator identity file
    pub initiator_file: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            plugin_name: crate::NAME.to_string(),
            vendor_version: crate::VERSION.to_string(),
            manifest: BTreeMap::new(),
            controller_mode: false,
            node_id: String::new(),
            topology_key: "topology.lvm-csi/node".to_string(),
            initiator_file: PathBuf::from(DEFAULT_INITIATOR_FILE),
        }
    }
}

// =============================================================================
// Plugin Service
// =============================================================================

pub struct PluginService {
    config: ServiceConfig,
    group: VolumeGroupRef,
    admission: RequestAdmission,
    lifecycle: VolumeLifecycle,
    publisher: DatapathPublisher,
    reconciler: MountReconciler,
    metrics: Arc<PluginMetrics>,
}

impl PluginService {
    pub fn new(
        config: ServiceConfig,
        group: VolumeGroupRef,
        admission: RequestAdmission,
        lifecycle: VolumeLifecycle,
        publisher: DatapathPublisher,
        reconciler: MountReconciler,
        metrics: Arc<PluginMetrics>,
    ) -> Self {
        Self {
            config,
            group,
            admission,
            lifecycle,
            publisher,
            reconciler,
            metrics,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PluginMetrics> {
        &self.metrics
    }

    pub fn admission(&self) -> &RequestAdmission {
        &self.admission
    }

    /// Admit, run and account for one RPC
    async fn call<T, F, Fut>(&self, rpc: &'static str, ctx: &RequestContext, handler: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = self.admission.run(ctx, handler).await;
        self.metrics
            .observe(rpc, started.elapsed(), result.as_ref().err().map(Error::code));
        match &result {
            Ok(_) => debug!(rpc, "RPC completed"),
            Err(e) => warn!(rpc, code = %e.code(), "RPC failed: {}", e),
        }
        result
    }

    async fn refresh_storage_metrics(&self) {
        match self.group.bytes_free(&VolumeLayout::linear()).await {
            Ok(free) => self.metrics.set_bytes_free(free),
            Err(e) => debug!("Could not refresh free-space gauge: {}", e),
        }
        match self.lifecycle.volume_count().await {
            Ok(count) => self.metrics.set_volume_count(count),
            Err(e) => debug!("Could not refresh volume gauge: {}", e),
        }
    }

    // =========================================================================
    // Identity
    // =========================================================================

    pub async fn get_plugin_info(&self, ctx: &RequestContext) -> Result<PluginInfo> {
        self.call("GetPluginInfo", ctx, || async {
            Ok(PluginInfo {
                name: self.config.plugin_name.clone(),
                vendor_version: self.config.vendor_version.clone(),
                manifest: self.config.manifest.clone(),
            })
        })
        .await
    }

    pub async fn get_plugin_capabilities(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<PluginCapability>> {
        self.call("GetPluginCapabilities", ctx, || async {
            Ok(vec![if self.config.controller_mode {
                PluginCapability::ControllerService
            } else {
                PluginCapability::VolumeAccessibilityConstraints
            }])
        })
        .await
    }

    /// Healthy while the volume group can be found
    pub async fn probe(&self, ctx: &RequestContext) -> Result<()> {
        self.call("Probe", ctx, || async {
            debug!("Looking up volume group {}", self.group.name());
            if !self.group.exists().await? {
                return Err(Error::FailedPrecondition(format!(
                    "cannot find volume group {}",
                    self.group.name()
                )));
            }
            Ok(())
        })
        .await
    }

    // =========================================================================
    // Controller
    // =========================================================================

    pub async fn create_volume(
        &self,
        ctx: &RequestContext,
        request: &CreateVolumeRequest,
    ) -> Result<Volume> {
        self.call("CreateVolume", ctx, || async {
            let volume = self.lifecycle.create(request).await?;
            self.refresh_storage_metrics().await;
            Ok(volume)
        })
        .await
    }

    pub async fn delete_volume(&self, ctx: &RequestContext, volume_id: &str) -> Result<()> {
        self.call("DeleteVolume", ctx, || async {
            self.lifecycle.delete(volume_id).await?;
            self.refresh_storage_metrics().await;
            Ok(())
        })
        .await
    }

    pub async fn list_volumes(
        &self,
        ctx: &RequestContext,
        request: &ListVolumesRequest,
    ) -> Result<ListVolumesResponse> {
        self.call("ListVolumes", ctx, || async {
            let response = self.lifecycle.list(request).await?;
            self.refresh_storage_metrics().await;
            Ok(response)
        })
        .await
    }

    pub async fn get_capacity(
        &self,
        ctx: &RequestContext,
        request: &GetCapacityRequest,
    ) -> Result<u64> {
        self.call("GetCapacity", ctx, || async {
            let available = self.lifecycle.capacity(request).await?;
            self.refresh_storage_metrics().await;
            Ok(available)
        })
        .await
    }

    pub async fn validate_volume_capabilities(
        &self,
        ctx: &RequestContext,
        request: &ValidateCapabilitiesRequest,
    ) -> Result<ValidateCapabilitiesResponse> {
        self.call("ValidateVolumeCapabilities", ctx, || {
            self.lifecycle.validate(request)
        })
        .await
    }

    /// Publish context for the node, as the flat string map
    pub async fn controller_publish_volume(
        &self,
        ctx: &RequestContext,
        request: &ControllerPublishRequest,
    ) -> Result<BTreeMap<String, String>> {
        self.call("ControllerPublishVolume", ctx, || async {
            let context = self.publisher.publish(request).await?;
            info!(
                volume_id = %request.volume_id,
                node_id = %request.node_id,
                datapath = %context.datapath(),
                "Volume published to node"
            );
            Ok(context.to_map())
        })
        .await
    }

    pub async fn controller_unpublish_volume(
        &self,
        ctx: &RequestContext,
        request: &ControllerUnpublishRequest,
    ) -> Result<Diagnostics> {
        self.call("ControllerUnpublishVolume", ctx, || {
            self.publisher.unpublish(request)
        })
        .await
    }

    pub async fn controller_get_capabilities(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<ControllerCapability>> {
        self.call("ControllerGetCapabilities", ctx, || async {
            Ok(vec![
                ControllerCapability::CreateDeleteVolume,
                ControllerCapability::PublishUnpublishVolume,
                ControllerCapability::ListVolumes,
                ControllerCapability::GetCapacity,
            ])
        })
        .await
    }

    // =========================================================================
    // Node
    // =========================================================================

    pub async fn node_publish_volume(
        &self,
        ctx: &RequestContext,
        request: &NodePublishRequest,
    ) -> Result<Diagnostics> {
        self.call("NodePublishVolume", ctx, || {
            self.reconciler.publish(request)
        })
        .await
    }

    pub async fn node_unpublish_volume(
        &self,
        ctx: &RequestContext,
        request: &NodeUnpublishRequest,
    ) -> Result<Diagnostics> {
        self.call("NodeUnpublishVolume", ctx, || {
            self.reconciler.unpublish(request)
        })
        .await
    }

    pub async fn node_get_capabilities(&self, ctx: &RequestContext) -> Result<Vec<NodeCapability>> {
        self.call("NodeGetCapabilities", ctx, || async {
            Ok(vec![NodeCapability::VolumeMountGroup])
        })
        .await
    }

    /// The initiator name overrides the configured node id
    pub async fn node_get_info(&self, ctx: &RequestContext) -> Result<NodeInfo> {
        self.call("NodeGetInfo", ctx, || async {
            let node_id =
                resolve_node_id(&self.config.initiator_file, &self.config.node_id).await?;
            let mut accessible_topology = BTreeMap::new();
            accessible_topology.insert(self.config.topology_key.clone(), self.config.node_id.clone());
            Ok(NodeInfo {
                node_id,
                accessible_topology,
            })
        })
        .await
    }

    // =========================================================================
    // Unsupported
    // =========================================================================

    pub async fn unimplemented(&self, ctx: &RequestContext, rpc: &'static str) -> Result<()> {
        self.call(rpc, ctx, || async {
            debug!("{} not supported", rpc);
            Err(Error::Unimplemented(rpc.to_string()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionConfig;
    use crate::controlplane::backends::{InMemoryConfig, InMemoryVolumeGroup};
    use crate::controlplane::datapath::PublisherConfig;
    use crate::controlplane::lifecycle::LifecycleConfig;
    use crate::domain::ports::{TransportBrokerRef, VolumeGroup};
    use crate::error::Code;
    use crate::node::ReconcilerConfig;
    use crate::testing::{FakeBroker, FakeHost};
    use assert_matches::assert_matches;
    use prometheus::Registry;

    struct Fixture {
        service: PluginService,
        group: Arc<InMemoryVolumeGroup>,
        host: Arc<FakeHost>,
    }

    fn setup(config: ServiceConfig) -> Fixture {
        let group = Arc::new(InMemoryVolumeGroup::new(InMemoryConfig::default()));
        let host = Arc::new(FakeHost::new());
        let broker: TransportBrokerRef = Arc::new(FakeBroker::new());
        let service = PluginService::new(
            config,
            group.clone(),
            RequestAdmission::new(AdmissionConfig::default()),
            VolumeLifecycle::new(LifecycleConfig::default(), group.clone(), host.clone()),
            DatapathPublisher::new(PublisherConfig::default(), group.clone(), Some(broker.clone())),
            MountReconciler::new(
                ReconcilerConfig::default(),
                group.clone(),
                host.clone(),
                Some(broker),
            ),
            Arc::new(PluginMetrics::new(Registry::new()).unwrap()),
        );
        Fixture {
            service,
            group,
            host,
        }
    }

    fn create_request(name: &str) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.to_string(),
            capacity_range: Some(CapacityRange::new(1 << 30, 0)),
            volume_capabilities: vec![VolumeCapability::mount("xfs", AccessMode::SingleNodeWriter)],
            parameters: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_identity() {
        let fixture = setup(ServiceConfig {
            controller_mode: true,
            ..ServiceConfig::default()
        });
        let ctx = RequestContext::new();

        let info = fixture.service.get_plugin_info(&ctx).await.unwrap();
        assert_eq!(info.name, crate::NAME);
        assert_eq!(info.vendor_version, crate::VERSION);
        assert_eq!(
            fixture.service.get_plugin_capabilities(&ctx).await.unwrap(),
            vec![PluginCapability::ControllerService]
        );
        fixture.service.probe(&ctx).await.unwrap();

        let node = setup(ServiceConfig::default());
        assert_eq!(
            node.service.get_plugin_capabilities(&ctx).await.unwrap(),
            vec![PluginCapability::VolumeAccessibilityConstraints]
        );
    }

    #[tokio::test]
    async fn test_controller_and_node_round() {
        let fixture = setup(ServiceConfig::default());
        let service = &fixture.service;
        let ctx = RequestContext::new();

        let volume = service.create_volume(&ctx, &create_request("data")).await.unwrap();
        assert_eq!(volume.capacity_bytes, 1 << 30);
        assert_eq!(service.metrics().requests("CreateVolume"), 1);

        let context = service
            .controller_publish_volume(
                &ctx,
                &ControllerPublishRequest {
                    volume_id: volume.volume_id.clone(),
                    node_id: "node1".to_string(),
                    volume_capability: Some(VolumeCapability::mount(
                        "xfs",
                        AccessMode::SingleNodeWriter,
                    )),
                    readonly: false,
                    volume_context: volume.volume_context.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(context.get("datapath").map(String::as_str), Some("direct"));

        let diagnostics = service
            .node_publish_volume(
                &ctx,
                &NodePublishRequest {
                    volume_id: volume.volume_id.clone(),
                    target_path: "/pods/a/volume".to_string(),
                    volume_capability: VolumeCapability::mount("xfs", AccessMode::SingleNodeWriter),
                    readonly: false,
                    publish_context: context,
                },
            )
            .await
            .unwrap();
        assert!(diagnostics.is_empty());
        assert!(fixture.host.is_mounted("/pods/a/volume"));

        service
            .node_unpublish_volume(
                &ctx,
                &NodeUnpublishRequest {
                    volume_id: volume.volume_id.clone(),
                    target_path: "/pods/a/volume".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(!fixture.host.is_mounted("/pods/a/volume"));

        service.delete_volume(&ctx, &volume.volume_id).await.unwrap();
        assert!(fixture.group.lookup(&volume.volume_id).await.unwrap().is_none());

        let text = service.metrics().encode().unwrap();
        assert!(text.contains("lvm_csi_volumes 0"));
    }

    #[tokio::test]
    async fn test_failures_are_counted_by_code() {
        let fixture = setup(ServiceConfig::default());
        let ctx = RequestContext::new();

        let err = fixture
            .service
            .delete_volume(&ctx, "")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(
            fixture.service.metrics().failures("DeleteVolume", Code::InvalidArgument),
            1
        );
    }

    #[tokio::test]
    async fn test_capabilities() {
        let fixture = setup(ServiceConfig::default());
        let ctx = RequestContext::new();
        assert_eq!(
            fixture.service.controller_get_capabilities(&ctx).await.unwrap().len(),
            4
        );
        assert_eq!(
            fixture.service.node_get_capabilities(&ctx).await.unwrap(),
            vec![NodeCapability::VolumeMountGroup]
        );
    }

    #[tokio::test]
    async fn test_node_info_prefers_initiator_name() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("initiatorname.iscsi");

        let fixture = setup(ServiceConfig {
            node_id: "node1".to_string(),
            topology_key: "topology.test/node".to_string(),
            initiator_file: file.clone(),
            ..ServiceConfig::default()
        });
        let ctx = RequestContext::new();

        let info = fixture.service.node_get_info(&ctx).await.unwrap();
        assert_eq!(info.node_id, "node1");
        assert_eq!(
            info.accessible_topology.get("topology.test/node").map(String::as_str),
            Some("node1")
        );

        std::fs::write(&file, "InitiatorName=iqn.1994-05.com.redhat:abc\n").unwrap();
        let info = fixture.service.node_get_info(&ctx).await.unwrap();
        assert_eq!(info.node_id, "iqn.1994-05.com.redhat:abc");
        assert_eq!(
            info.accessible_topology.get("topology.test/node").map(String::as_str),
            Some("node1")
        );
    }

    #[tokio::test]
    async fn test_unimplemented_rpcs() {
        let fixture = setup(ServiceConfig::default());
        let ctx = RequestContext::new();
        for rpc in UNIMPLEMENTED_RPCS {
            let err = fixture.service.unimplemented(&ctx, *rpc).await.unwrap_err();
            assert_matches!(err, Error::Unimplemented(name) if name == *rpc);
        }
    }

    #[tokio::test]
    async fn test_cancelled_request_never_runs() {
        let fixture = setup(ServiceConfig::default());
        let ctx = RequestContext::new();
        ctx.cancel();

        let err = fixture
            .service
            .create_volume(&ctx, &create_request("data"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Cancelled);
        assert_eq!(fixture.group.created_count(), 0);
    }
}
