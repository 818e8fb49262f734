//! LVM Volume Plugin
//!
//! Serves the Identity, Controller and Node services for one LVM volume
//! group over a REST API.

use clap::Parser;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lvm_csi_plugin::node::bypath::DEFAULT_BY_PATH_DIR;
use lvm_csi_plugin::node::initiator::DEFAULT_INITIATOR_FILE;
use lvm_csi_plugin::{
    AdmissionConfig, ApiServer, ApiServerConfig, BackendConfig, BackendFactory, BrokerConfig,
    BrokeredHost, DatapathPublisher, Error, HostMode, HostSystemRef, LifecycleConfig, LocalHost,
    LocalHostConfig, MountReconciler, PluginMetrics, PluginService, PublisherConfig,
    ReconcilerConfig, RequestAdmission, Result, ServiceConfig, VolumeGroup, VolumeLifecycle,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// LVM Volume Plugin - logical volumes for container workloads
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Volume group to provision from
    #[arg(long, env = "VOLUME_GROUP", default_value = "vg0")]
    volume_group: String,

    /// Node id reported when no initiator name is configured
    #[arg(long, env = "NODE_ID", default_value = "")]
    node_id: String,

    /// Serve the controller service
    #[arg(long, env = "CONTROLLER_MODE")]
    controller: bool,

    /// Filesystem used when a mount capability names none
    #[arg(long, env = "DEFAULT_FS", default_value = "xfs")]
    default_fs: String,

    /// Additional filesystems volumes may be formatted with
    #[arg(long, env = "SUPPORTED_FILESYSTEMS", value_delimiter = ',', default_value = "ext4")]
    filesystems: Vec<String>,

    /// Size of volumes created without a required capacity
    #[arg(long, env = "DEFAULT_VOLUME_SIZE", default_value_t = 10 << 30)]
    default_volume_size: u64,

    /// Tags attached to every created volume
    #[arg(long, env = "VOLUME_GROUP_TAGS", value_delimiter = ',')]
    tags: Vec<String>,

    /// Transport broker base URL
    #[arg(long, env = "BROKER_URL")]
    broker_url: Option<String>,

    /// Transport broker call timeout in seconds
    #[arg(long, env = "BROKER_TIMEOUT", default_value = "6")]
    broker_timeout_secs: u64,

    /// Where mounts run: local or brokered
    #[arg(long, env = "HOST_MODE", default_value = "local")]
    host_mode: HostMode,

    /// Address substituted into wildcard target portals
    #[arg(long, env = "CSI_NODE_IP")]
    node_ip: Option<String>,

    /// Requests admitted at once, 0 for no limit
    #[arg(long, env = "REQUEST_LIMIT", default_value = "10")]
    request_limit: usize,

    /// iSCSI initiator identity file
    #[arg(long, env = "INITIATOR_FILE", default_value = DEFAULT_INITIATOR_FILE)]
    initiator_file: PathBuf,

    /// Stable by-path device directory
    #[arg(long, env = "BY_PATH_DIR", default_value = DEFAULT_BY_PATH_DIR)]
    by_path_dir: PathBuf,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Per-request deadline in seconds, 0 for none
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "120")]
    request_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Serve from an in-memory volume group instead of LVM
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting LVM volume plugin");
    info!("  Version: {}", lvm_csi_plugin::VERSION);
    info!("  Volume group: {}", args.volume_group);
    info!("  REST API: {}", args.api_addr);
    info!("  Controller mode: {}", args.controller);
    info!("  Host mode: {}", args.host_mode);
    info!("  Standalone mode: {}", args.standalone);

    // Backends
    let backends = BackendConfig {
        volume_group: args.volume_group.clone(),
        standalone: args.standalone,
        broker: args.broker_url.as_ref().map(|url| {
            BrokerConfig::new(url.clone())
                .with_timeout(Duration::from_secs(args.broker_timeout_secs))
        }),
        ..Default::default()
    };
    let group = BackendFactory::volume_group(&backends);
    let broker = BackendFactory::broker(&backends)?;
    if !group.exists().await? {
        warn!("Volume group {} not found, probes will fail", group.name());
    }

    let local = LocalHost::new(LocalHostConfig {
        by_path_dir: args.by_path_dir.clone(),
        ..Default::default()
    });
    let host: HostSystemRef = match args.host_mode {
        HostMode::Local => Arc::new(local),
        HostMode::Brokered => {
            let broker = broker.clone().ok_or_else(|| {
                Error::Configuration("brokered host mode requires --broker-url".to_string())
            })?;
            Arc::new(BrokeredHost::new(broker, local))
        }
    };

    // Components
    let mut supported_filesystems: BTreeSet<String> = args.filesystems.iter().cloned().collect();
    supported_filesystems.insert(args.default_fs.clone());
    let lifecycle_config = LifecycleConfig {
        default_volume_size: args.default_volume_size,
        supported_filesystems,
        group_tags: args.tags.clone(),
        ..Default::default()
    };
    lifecycle_config.validate()?;

    let lifecycle = VolumeLifecycle::new(lifecycle_config, group.clone(), host.clone());
    let publisher = DatapathPublisher::new(
        PublisherConfig {
            node_ip: args.node_ip.clone(),
        },
        group.clone(),
        broker.clone(),
    );
    let reconciler = MountReconciler::new(
        ReconcilerConfig {
            default_filesystem: args.default_fs.clone(),
        },
        group.clone(),
        host,
        broker,
    );
    let admission = RequestAdmission::new(AdmissionConfig {
        max_in_flight: args.request_limit,
    });
    let metrics = Arc::new(PluginMetrics::new(prometheus::Registry::new())?);

    let service = Arc::new(PluginService::new(
        ServiceConfig {
            controller_mode: args.controller,
            node_id: args.node_id.clone(),
            initiator_file: args.initiator_file.clone(),
            ..Default::default()
        },
        group,
        admission,
        lifecycle,
        publisher,
        reconciler,
        metrics,
    ));

    // API server
    let api_config = ApiServerConfig {
        rest_addr: args.api_addr.parse().map_err(|e| {
            Error::Configuration(format!("Invalid REST API address: {}", e))
        })?,
        request_timeout: (args.request_timeout_secs > 0)
            .then(|| Duration::from_secs(args.request_timeout_secs)),
    };
    let api_server = Arc::new(ApiServer::new(api_config, service));

    {
        let api_server = api_server.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received");
                api_server.shutdown();
            }
        });
    }

    api_server.run().await?;

    info!("Plugin shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info", "tower_http=info", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
