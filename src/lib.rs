//! LVM Volume Plugin - Container Storage Plugin for LVM Volume Groups
//!
//! Provisions logical volumes out of one LVM volume group and publishes them
//! to container workloads over a direct, iSCSI or pooled-iSCSI datapath.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                  REST API (Identity / Controller / Node)                     │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                 Plugin Service  ──  Request Admission                        │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │     Volume      │  │    Datapath     │  │      Mount Reconciler       │  │
//! │  │    Lifecycle    │  │    Publisher    │  │   (Mount Table Reader)      │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! ├───────────┴────────────────────┴─────────────────────────┴──────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Volume Group   │  │   Transport     │  │        Host System          │  │
//! │  │ (LVM / memory)  │  │  Broker (HTTP)  │  │     (local / brokered)      │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`admission`]: Serialization and in-flight limiting of requests
//! - [`controlplane`]: Lifecycle, publishing, RPC service and REST API
//! - [`node`]: Node-side mount handling
//! - [`domain`]: Protocol types and collaborator traits
//! - [`error`]: Error types and handling

pub mod admission;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod node;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use admission::{AdmissionConfig, RequestAdmission, RequestContext};

pub use controlplane::{
    ApiServer, ApiServerConfig, BackendConfig, BackendFactory, BrokerConfig, DatapathPublisher,
    HttpTransportBroker, InMemoryConfig, InMemoryVolumeGroup, LifecycleConfig, LvmConfig,
    LvmVolumeGroup, PluginMetrics, PluginService, PublisherConfig, ServiceConfig,
    VolumeLifecycle,
};

pub use domain::context::{DatapathKind, PublishContext};
pub use domain::ports::{
    HostMode, HostSystem, HostSystemRef, TransportBroker, TransportBrokerRef, VolumeGroup,
    VolumeGroupRef, VolumeLayout,
};

pub use error::{Code, Diagnostics, Error, Result};

pub use node::{
    BrokeredHost, LocalHost, LocalHostConfig, MountReconciler, MountTableReader,
    ReconcilerConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
