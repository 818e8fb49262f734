//! Mount Reconciler
//!
//! Node-side publish and unpublish. Every decision starts from a fresh read
//! of the mount table so repeated calls from the orchestrator converge on
//! the same state instead of stacking mounts.
//!
//! Publish resolves the local device for the volume's datapath (initiator
//! login for iSCSI, pooled logins plus group activation for JBOF, plain
//! activation for direct volumes) and then either bind-mounts the raw device
//! onto a file or mounts a filesystem onto a directory, formatting it on
//! first use. Unpublish dispatches on the transport classified from the
//! mounted device.

use super::mount_table::{MountRecord, MountTableConfig, MountTableReader, TransportKind};
use crate::domain::context::{PublishContext, Staging};
use crate::domain::ports::{
    HostSystemRef, MountRequest, QosHints, TransportBrokerRef, VolumeGroupRef,
};
use crate::domain::types::{AccessMode, AccessType, NodePublishRequest, NodeUnpublishRequest};
use crate::error::{Diagnostics, Error, Result};
use tracing::{debug, info};

/// Tag prefix of recorded QoS hints
const QOS_TAG_PREFIX: &str = "qos-";

/// Configuration for the mount reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Filesystem used when a mount capability names none
    pub default_filesystem: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            default_filesystem: "xfs".to_string(),
        }
    }
}

/// Portal and IQN of the session behind an iSCSI by-path name
///
/// `ip-10.0.0.5:3260-iscsi-iqn.2003-01.org.example:vol1-lun-0` yields
/// `("10.0.0.5:3260", "iqn.2003-01.org.example:vol1")`.
pub fn iscsi_session(block_path: &str) -> Option<(String, String)> {
    let chunks: Vec<&str> = block_path.splitn(4, '-').collect();
    if chunks.len() < 4 || chunks[2] != "iscsi" {
        return None;
    }
    let target = chunks[3];
    let iqn = match target.rfind("-lun-") {
        Some(pos) if target[pos + 5..].chars().all(|c| c.is_ascii_digit()) => &target[..pos],
        _ => target,
    };
    if iqn.is_empty() {
        return None;
    }
    Some((chunks[1].to_string(), iqn.to_string()))
}

pub struct MountReconciler {
    config: ReconcilerConfig,
    group: VolumeGroupRef,
    host: HostSystemRef,
    broker: Option<TransportBrokerRef>,
    mounts: MountTableReader,
}

impl MountReconciler {
    pub fn new(
        config: ReconcilerConfig,
        group: VolumeGroupRef,
        host: HostSystemRef,
        broker: Option<TransportBrokerRef>,
    ) -> Self {
        let mounts = MountTableReader::new(
            MountTableConfig::for_volume_group(group.name()),
            host.clone(),
        );
        Self {
            config,
            group,
            host,
            broker,
            mounts,
        }
    }

    fn broker(&self) -> Result<&TransportBrokerRef> {
        self.broker.as_ref().ok_or_else(|| {
            Error::FailedPrecondition("no transport broker is configured".to_string())
        })
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Make the volume available at the target path
    pub async fn publish(&self, request: &NodePublishRequest) -> Result<Diagnostics> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id is required".to_string()));
        }
        if request.target_path.is_empty() {
            return Err(Error::InvalidArgument("target path is required".to_string()));
        }
        let context = PublishContext::from_map(&request.publish_context)?;
        let source = self.local_device(&request.volume_id, &context).await?;
        let readonly = request.readonly
            || request.volume_capability.access_mode == AccessMode::SingleNodeReaderOnly;

        let mut diagnostics = Diagnostics::new();
        match &request.volume_capability.access_type {
            AccessType::Block => {
                self.publish_block(&source, &request.target_path).await?;
            }
            AccessType::Mount {
                fs_type,
                mount_flags,
                volume_mount_group,
            } => {
                let gid = volume_mount_group
                    .as_deref()
                    .filter(|g| !g.is_empty())
                    .map(|g| {
                        g.parse::<u32>().map_err(|_| {
                            Error::InvalidArgument(format!("volume mount group {:?} is not a gid", g))
                        })
                    })
                    .transpose()?;
                let fs_type = if fs_type.is_empty() {
                    self.config.default_filesystem.as_str()
                } else {
                    fs_type.as_str()
                };
                let mounted = self
                    .publish_filesystem(
                        &source,
                        &request.target_path,
                        fs_type,
                        mount_flags,
                        readonly,
                    )
                    .await?;
                if mounted {
                    self.widen_permissions(&request.target_path, gid, context.all_users, &mut diagnostics)
                        .await;
                }
                self.record_qos(&request.volume_id, &context.qos, &mut diagnostics)
                    .await;
            }
        }
        Ok(diagnostics)
    }

    /// Device path of the volume on this node
    async fn local_device(&self, volume_id: &str, context: &PublishContext) -> Result<String> {
        match &context.staging {
            Staging::Iscsi(target) => {
                info!(
                    volume_id = %volume_id,
                    iqn = %target.iqn,
                    portal = %target.portal,
                    "Logging in to iSCSI target"
                );
                self.broker()?.login(&target.iqn, &target.portal).await
            }
            Staging::Pooled(targets) => {
                let broker = self.broker()?;
                for target in targets {
                    debug!("Logging in to pooled target {} at {}", target.iqn, target.portal);
                    broker.login(&target.iqn, &target.portal).await?;
                }
                self.group.activate_group().await?;
                self.activated_path(volume_id).await
            }
            Staging::Direct => self.activated_path(volume_id).await,
        }
    }

    async fn activated_path(&self, volume_id: &str) -> Result<String> {
        let lv = self
            .group
            .lookup(volume_id)
            .await?
            .ok_or_else(|| Error::VolumeNotFound(volume_id.to_string()))?;
        self.group.activate(&lv.name).await?;
        Ok(lv.path)
    }

    async fn publish_block(&self, source: &str, target: &str) -> Result<()> {
        if let Some(mount) = self.mounts.mount_at(target).await? {
            let device = self.host.resolve_symlink(source).await?;
            if mount.device != device {
                return Err(Error::TargetOccupied(target.to_string()));
            }
            debug!(source = %source, target_path = %target, "Block device already bind-mounted");
            return Ok(());
        }
        self.host.create_file(target).await?;
        self.host.mount(&MountRequest::bind(source, target)).await?;
        info!(source = %source, target_path = %target, "Bind-mounted block device");
        Ok(())
    }

    /// Returns false when the target was already mounted as requested
    async fn publish_filesystem(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
        readonly: bool,
    ) -> Result<bool> {
        if let Some(mount) = self.mounts.mount_at(target).await? {
            check_existing(&mount, source, target, fs_type, readonly)?;
            debug!(source = %source, target_path = %target, "Filesystem already mounted");
            return Ok(false);
        }

        self.host.ensure_dir(target).await?;
        match self.host.probe_filesystem(source).await? {
            None => {
                info!(device = %source, fs_type = %fs_type, "Formatting unformatted volume");
                self.host.format(source, fs_type).await?;
            }
            Some(existing) if existing != fs_type => {
                return Err(Error::MismatchedFilesystem {
                    requested: fs_type.to_string(),
                    existing,
                });
            }
            Some(_) => {}
        }

        self.host
            .mount(&MountRequest {
                source: source.to_string(),
                target: target.to_string(),
                fs_type: fs_type.to_string(),
                options: options.to_vec(),
                readonly,
            })
            .await?;
        info!(
            source = %source,
            target_path = %target,
            fs_type = %fs_type,
            readonly,
            "Mounted filesystem"
        );
        Ok(true)
    }

    async fn widen_permissions(
        &self,
        target: &str,
        gid: Option<u32>,
        all_users: bool,
        diagnostics: &mut Diagnostics,
    ) {
        if let Some(gid) = gid {
            if let Err(e) = self.host.set_group(target, gid).await {
                diagnostics.record("set-group", e);
            }
        }
        if all_users {
            if let Err(e) = self.host.open_to_all_users(target).await {
                diagnostics.record("open-permissions", e);
            }
        }
    }

    async fn record_qos(&self, volume_id: &str, qos: &QosHints, diagnostics: &mut Diagnostics) {
        let Some(tag) = qos.tag() else {
            return;
        };
        if let Err(e) = self.group.add_tag(volume_id, &tag).await {
            diagnostics.record("qos-tag", e);
        }
    }

    // =========================================================================
    // Unpublish
    // =========================================================================

    /// Remove the volume from the target path
    pub async fn unpublish(&self, request: &NodeUnpublishRequest) -> Result<Diagnostics> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id is required".to_string()));
        }
        if request.target_path.is_empty() {
            return Err(Error::InvalidArgument("target path is required".to_string()));
        }
        let mut diagnostics = Diagnostics::new();
        let target = request.target_path.as_str();
        let Some(mount) = self.mounts.mount_at(target).await? else {
            debug!(target_path = %target, "Nothing mounted, treating as unpublished");
            return Ok(diagnostics);
        };

        info!(
            volume_id = %request.volume_id,
            target_path = %target,
            transport = %mount.transport,
            "Unpublishing volume"
        );
        match &mount.transport {
            TransportKind::Iscsi => {
                self.host.unmount(target).await?;
                self.logout(&mount, &mut diagnostics).await;
            }
            TransportKind::Nvme | TransportKind::Qemu => {
                self.broker()?.unmount(target).await?;
            }
            TransportKind::Sas | TransportKind::Direct => {
                self.clear_qos(&request.volume_id, &mut diagnostics).await;
                self.host.unmount(target).await?;
                if let Err(e) = self.group.deactivate(&request.volume_id).await {
                    diagnostics.record("deactivate", e);
                }
                if mount.transport == TransportKind::Direct {
                    self.host.remove_path(target).await?;
                }
            }
            TransportKind::Other(kind) => {
                debug!("Unmounting {} device at {}", kind, target);
                self.host.unmount(target).await?;
                self.host.remove_path(target).await?;
            }
        }
        Ok(diagnostics)
    }

    async fn logout(&self, mount: &MountRecord, diagnostics: &mut Diagnostics) {
        let Some((portal, iqn)) = iscsi_session(&mount.block_path) else {
            diagnostics.record(
                "logout",
                format!("cannot derive iSCSI session from {}", mount.block_path),
            );
            return;
        };
        let result = match self.broker() {
            Ok(broker) => broker.logout(&iqn, &portal).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            diagnostics.record("logout", e);
        }
    }

    async fn clear_qos(&self, volume_id: &str, diagnostics: &mut Diagnostics) {
        if let Some(broker) = &self.broker {
            if let Err(e) = broker
                .set_qos(self.group.name(), volume_id, &QosHints::cleared())
                .await
            {
                diagnostics.record("clear-qos", e);
            }
        }
        let tags = match self.group.lookup(volume_id).await {
            Ok(Some(lv)) => lv.tags,
            Ok(None) => return,
            Err(e) => {
                diagnostics.record("clear-qos", e);
                return;
            }
        };
        for tag in tags.iter().filter(|t| t.starts_with(QOS_TAG_PREFIX)) {
            if let Err(e) = self.group.del_tag(volume_id, tag).await {
                diagnostics.record("clear-qos", e);
            }
        }
    }
}

/// Compare an existing filesystem mount against the request
fn check_existing(
    mount: &MountRecord,
    source: &str,
    target: &str,
    fs_type: &str,
    readonly: bool,
) -> Result<()> {
    if mount.mount_source != source {
        return Err(Error::TargetOccupied(target.to_string()));
    }
    if mount.fstype != fs_type {
        return Err(Error::MismatchedFilesystem {
            requested: fs_type.to_string(),
            existing: mount.fstype.clone(),
        });
    }
    match (readonly, mount.is_readonly()) {
        (true, false) => Err(Error::TargetReadWrite(target.to_string())),
        (false, true) => Err(Error::TargetReadOnly(target.to_string())),
        _ => Ok(()),
    }
}
