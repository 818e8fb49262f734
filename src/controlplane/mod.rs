//! Control Plane Module
//!
//! Volume lifecycle, datapath publishing and the RPC surface that fronts
//! them, plus the backend adapters they run against.

pub mod api;
pub mod backends;
pub mod datapath;
pub mod lifecycle;
pub mod metrics;
pub mod params;
pub mod service;
pub mod tag;

pub use api::*;
pub use backends::*;
pub use datapath::{DatapathPublisher, PublisherConfig};
pub use lifecycle::{LifecycleConfig, VolumeLifecycle};
pub use metrics::PluginMetrics;
pub use service::{PluginService, ServiceConfig, UNIMPLEMENTED_RPCS};
