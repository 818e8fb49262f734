//! Backend Adapters
//!
//! Concrete collaborators behind the domain ports:
//! - LVM: the production volume group, driven through the LVM2 tools
//! - In-memory: a volume group for standalone runs and tests
//! - HTTP broker: the transport-staging control plane

pub mod broker;
pub mod lvm;
pub mod memory;

pub use broker::{BrokerConfig, HttpTransportBroker};
pub use lvm::{LvmConfig, LvmVolumeGroup};
pub use memory::{InMemoryConfig, InMemoryVolumeGroup};

use crate::domain::ports::{TransportBrokerRef, VolumeGroupRef};
use crate::error::Result;
use std::sync::Arc;

/// Combined backend configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Volume group name
    pub volume_group: String,
    /// Serve from an in-memory volume group instead of LVM
    pub standalone: bool,
    /// Sizing of the in-memory volume group
    pub memory: InMemoryConfig,
    /// Transport broker, if one is deployed
    pub broker: Option<BrokerConfig>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            volume_group: "vg0".to_string(),
            standalone: false,
            memory: InMemoryConfig::default(),
            broker: None,
        }
    }
}

/// Factory for backend adapters
pub struct BackendFactory;

impl BackendFactory {
    pub fn volume_group(config: &BackendConfig) -> VolumeGroupRef {
        if config.standalone {
            Arc::new(InMemoryVolumeGroup::new(InMemoryConfig {
                name: config.volume_group.clone(),
                ..config.memory.clone()
            }))
        } else {
            Arc::new(LvmVolumeGroup::new(LvmConfig::new(&config.volume_group)))
        }
    }

    pub fn broker(config: &BackendConfig) -> Result<Option<TransportBrokerRef>> {
        match &config.broker {
            Some(broker) => {
                let broker: TransportBrokerRef = Arc::new(HttpTransportBroker::new(broker.clone())?);
                Ok(Some(broker))
            }
            None => Ok(None),
        }
    }
}
