//! Datapath Publisher
//!
//! Controller-side staging of a volume's transport. ControllerPublish
//! selects the datapath recorded in the volume context, drives the
//! transport broker where the datapath needs one, and returns the publish
//! context the node side consumes. ControllerUnpublish undoes the staging
//! on a best-effort basis.

use crate::domain::context::{DatapathKind, PublishContext, Staging, VolumeAttributes};
use crate::domain::ports::{IscsiTarget, TransportBrokerRef, VolumeGroupRef};
use crate::domain::types::{ControllerPublishRequest, ControllerUnpublishRequest};
use crate::error::{Diagnostics, Error, Result};
use tracing::{debug, info, warn};

/// Host part of a portal the broker reports when it listens everywhere
const WILDCARD_HOST: &str = "0.0.0.0";

/// Configuration for the datapath publisher
#[derive(Debug, Clone, Default)]
pub struct PublisherConfig {
    /// Address substituted for a wildcard portal host
    pub node_ip: Option<String>,
}

pub struct DatapathPublisher {
    config: PublisherConfig,
    group: VolumeGroupRef,
    broker: Option<TransportBrokerRef>,
}

impl DatapathPublisher {
    pub fn new(
        config: PublisherConfig,
        group: VolumeGroupRef,
        broker: Option<TransportBrokerRef>,
    ) -> Self {
        Self {
            config,
            group,
            broker,
        }
    }

    fn broker(&self) -> Result<&TransportBrokerRef> {
        self.broker.as_ref().ok_or_else(|| {
            Error::FailedPrecondition("no transport broker is configured".to_string())
        })
    }

    /// Stage the volume's transport for a node
    pub async fn publish(&self, request: &ControllerPublishRequest) -> Result<PublishContext> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id is required".to_string()));
        }
        if request.node_id.is_empty() {
            return Err(Error::InvalidArgument("node id is required".to_string()));
        }
        if request.volume_capability.is_none() {
            return Err(Error::InvalidArgument(
                "volume capability is required".to_string(),
            ));
        }

        let attributes = VolumeAttributes::from_map(&request.volume_context)?;
        if !attributes.datapath.is_supported() {
            return Err(Error::UnsupportedDatapath(attributes.datapath.to_string()));
        }

        let lv = self
            .group
            .lookup(&request.volume_id)
            .await?
            .ok_or_else(|| Error::VolumeNotFound(request.volume_id.clone()))?;

        let staging = match attributes.datapath {
            DatapathKind::Direct => Staging::Direct,
            DatapathKind::Iscsi => {
                let broker = self.broker()?;
                self.group.activate(&lv.name).await?;
                info!(
                    volume_id = %lv.name,
                    uuid = %lv.uuid,
                    node_id = %request.node_id,
                    "Staging iSCSI target"
                );
                let mut target = broker
                    .stage_iscsi_target(&lv.uuid, &request.node_id)
                    .await?;
                target.portal = self.substitute_portal(&target.portal);
                Staging::Iscsi(target)
            }
            DatapathKind::Jbofis => {
                if attributes.broker_endpoints.is_empty() {
                    return Err(Error::InvalidArgument(
                        "the jbofis datapath requires broker endpoints".to_string(),
                    ));
                }
                let broker = self.broker()?;
                info!(
                    group = %self.group.name(),
                    endpoints = ?attributes.broker_endpoints,
                    node_id = %request.node_id,
                    "Staging pooled iSCSI targets"
                );
                let targets = broker
                    .stage_pooled_targets(
                        self.group.name(),
                        &attributes.broker_endpoints,
                        &request.node_id,
                    )
                    .await?;
                Staging::Pooled(
                    targets
                        .into_iter()
                        .map(|t| IscsiTarget {
                            portal: self.substitute_portal(&t.portal),
                            ..t
                        })
                        .collect(),
                )
            }
            DatapathKind::Nvme | DatapathKind::Qemu => {
                return Err(Error::UnsupportedDatapath(attributes.datapath.to_string()));
            }
        };

        Ok(PublishContext::from_attributes(attributes, staging))
    }

    /// Tear down the volume's transport; never fails on teardown errors
    pub async fn unpublish(&self, request: &ControllerUnpublishRequest) -> Result<Diagnostics> {
        let mut diagnostics = Diagnostics::new();
        if request.volume_id.is_empty() || request.node_id.is_empty() {
            debug!("Unpublish without volume or node id, nothing staged");
            return Ok(diagnostics);
        }
        let Some(lv) = self.group.lookup(&request.volume_id).await? else {
            debug!("Volume {} not found, treating as unpublished", request.volume_id);
            return Ok(diagnostics);
        };

        let datapath = lv
            .tag_value(DatapathKind::TAG_PREFIX)
            .and_then(|kind| kind.parse::<DatapathKind>().ok())
            .unwrap_or(DatapathKind::Iscsi);

        match datapath {
            DatapathKind::Iscsi => {
                info!(
                    volume_id = %lv.name,
                    node_id = %request.node_id,
                    "Unstaging iSCSI target"
                );
                match self.broker() {
                    Ok(broker) => {
                        if let Err(e) = broker.unstage_iscsi_target(&lv.uuid, &request.node_id).await {
                            diagnostics.record("unstage-target", e);
                        }
                    }
                    Err(e) => diagnostics.record("unstage-target", e),
                }
                if let Err(e) = self.group.deactivate(&lv.name).await {
                    diagnostics.record("deactivate", e);
                }
            }
            DatapathKind::Direct | DatapathKind::Jbofis => {
                debug!("Volume {} uses {}, nothing to unstage", lv.name, datapath);
            }
            DatapathKind::Nvme | DatapathKind::Qemu => {
                debug!("Volume {} uses unstaged datapath {}", lv.name, datapath);
            }
        }
        Ok(diagnostics)
    }

    fn substitute_portal(&self, portal: &str) -> String {
        let Some(rest) = portal.strip_prefix(WILDCARD_HOST) else {
            return portal.to_string();
        };
        match &self.config.node_ip {
            Some(ip) => format!("{}{}", ip, rest),
            None => {
                warn!("Broker returned wildcard portal {} and no node IP is configured", portal);
                portal.to_string()
            }
        }
    }
}
