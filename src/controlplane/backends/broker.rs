//! HTTP Transport Broker
//!
//! Client for the transport-staging control plane. The broker allocates
//! iSCSI targets, logs the node's initiator in and out, applies QoS limits
//! and, in brokered host mode, performs mounts and device probes on the
//! node's behalf. Every call is a JSON request with a bounded timeout.

use crate::domain::ports::{IscsiTarget, MountRequest, QosHints, TransportBroker};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the HTTP transport broker client
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Base URL, e.g. `http://10.0.0.2:3141`
    pub url: String,
    /// Per-call timeout
    pub timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3141".to_string(),
            timeout: Duration::from_secs(6),
        }
    }
}

impl BrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
struct StageRequest<'a> {
    volume_uuid: &'a str,
    node_id: &'a str,
}

#[derive(Debug, Serialize)]
struct PooledStageRequest<'a> {
    endpoints: &'a [String],
    node_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct TargetList {
    targets: Vec<IscsiTarget>,
}

#[derive(Debug, Serialize)]
struct SessionRequest<'a> {
    iqn: &'a str,
    portal: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    device: String,
}

#[derive(Debug, Serialize)]
struct QosRequest<'a> {
    group: &'a str,
    volume: &'a str,
    #[serde(flatten)]
    qos: &'a QosHints,
}

#[derive(Debug, Serialize)]
struct UnmountRequest<'a> {
    target: &'a str,
}

#[derive(Debug, Deserialize)]
struct FilesystemResponse {
    #[serde(default)]
    fs_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct FormatRequest<'a> {
    device: &'a str,
    fs_type: &'a str,
}

#[derive(Debug, Serialize)]
struct PermissionsRequest<'a> {
    target: &'a str,
    group: Option<u32>,
    all_users: bool,
}

#[derive(Debug, Deserialize)]
struct Empty {}

// =============================================================================
// Client
// =============================================================================

/// Transport broker reached over HTTP
pub struct HttpTransportBroker {
    config: BrokerConfig,
    http_client: reqwest::Client,
}

impl HttpTransportBroker {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("broker client: {}", e)))?;
        Ok(Self {
            config,
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Broker(format!("status {}: {}", status, body.trim())));
        }
        Ok(response)
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.url(path);
        debug!("POST {}", url);
        let response = self.http_client.post(&url).json(body).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        let url = self.url(path);
        debug!("GET {}", url);
        let response = self.http_client.get(&url).send().await?;
        Ok(Self::check(response).await?.text().await?)
    }
}

#[async_trait]
impl TransportBroker for HttpTransportBroker {
    async fn stage_iscsi_target(&self, volume_uuid: &str, node_id: &str) -> Result<IscsiTarget> {
        self.post(
            "/v1/iscsi/stage",
            &StageRequest {
                volume_uuid,
                node_id,
            },
        )
        .await
    }

    async fn unstage_iscsi_target(&self, volume_uuid: &str, node_id: &str) -> Result<()> {
        let _: Empty = self
            .post(
                "/v1/iscsi/unstage",
                &StageRequest {
                    volume_uuid,
                    node_id,
                },
            )
            .await?;
        Ok(())
    }

    async fn stage_pooled_targets(
        &self,
        group: &str,
        endpoints: &[String],
        node_id: &str,
    ) -> Result<Vec<IscsiTarget>> {
        let path = format!("/v1/pools/{}/stage", urlencoding::encode(group));
        let list: TargetList = self
            .post(&path, &PooledStageRequest { endpoints, node_id })
            .await?;
        Ok(list.targets)
    }

    async fn login(&self, iqn: &str, portal: &str) -> Result<String> {
        let response: LoginResponse = self
            .post("/v1/initiator/login", &SessionRequest { iqn, portal })
            .await?;
        Ok(response.device)
    }

    async fn logout(&self, iqn: &str, portal: &str) -> Result<()> {
        let _: Empty = self
            .post("/v1/initiator/logout", &SessionRequest { iqn, portal })
            .await?;
        Ok(())
    }

    async fn set_qos(&self, group: &str, volume: &str, qos: &QosHints) -> Result<()> {
        let _: Empty = self
            .post("/v1/qos", &QosRequest { group, volume, qos })
            .await?;
        Ok(())
    }

    async fn mount(&self, request: &MountRequest) -> Result<()> {
        let _: Empty = self.post("/v1/mounts", request).await?;
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<()> {
        let _: Empty = self
            .post("/v1/mounts/unmount", &UnmountRequest { target })
            .await?;
        Ok(())
    }

    async fn mount_table(&self) -> Result<String> {
        self.get_text("/v1/mounts").await
    }

    async fn filesystem_type(&self, device: &str) -> Result<Option<String>> {
        let body = self
            .get_text(&format!(
                "/v1/devices/filesystem?device={}",
                urlencoding::encode(device)
            ))
            .await?;
        let response: FilesystemResponse = serde_json::from_str(&body)?;
        Ok(response.fs_type.filter(|fs| !fs.is_empty()))
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        let _: Empty = self
            .post("/v1/devices/format", &FormatRequest { device, fs_type })
            .await?;
        Ok(())
    }

    async fn set_permissions(
        &self,
        target: &str,
        group: Option<u32>,
        all_users: bool,
    ) -> Result<()> {
        let _: Empty = self
            .post(
                "/v1/permissions",
                &PermissionsRequest {
                    target,
                    group,
                    all_users,
                },
            )
            .await?;
        Ok(())
    }
}
