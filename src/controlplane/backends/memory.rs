//! In-Memory Volume Group
//!
//! A volume group kept entirely in process memory. Used for standalone
//! runs without LVM and as the volume group in tests.

use crate::domain::ports::{LogicalVolume, NewVolume, VolumeGroup, VolumeLayout};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the in-memory volume group
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Volume group name
    pub name: String,
    /// Extent size in bytes
    pub extent_size: u64,
    /// Total capacity in bytes
    pub total_bytes: u64,
    /// Number of simulated physical volumes
    pub pv_count: u64,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            name: "vg0".to_string(),
            extent_size: 4 << 20,
            total_bytes: 100 << 30,
            pv_count: 1,
        }
    }
}

#[derive(Debug, Clone)]
struct VolumeState {
    volume: LogicalVolume,
    /// Raw bytes consumed including redundancy
    allocated: u64,
    active: bool,
}

// =============================================================================
// In-Memory Volume Group
// =============================================================================

pub struct InMemoryVolumeGroup {
    config: InMemoryConfig,
    volumes: RwLock<BTreeMap<String, VolumeState>>,
    created: AtomicUsize,
}

impl InMemoryVolumeGroup {
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            config,
            volumes: RwLock::new(BTreeMap::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Number of volumes created since construction
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.volumes
            .read()
            .get(name)
            .map(|v| v.active)
            .unwrap_or(false)
    }

    fn raw_free(&self, volumes: &BTreeMap<String, VolumeState>) -> u64 {
        let used: u64 = volumes.values().map(|v| v.allocated).sum();
        self.config.total_bytes.saturating_sub(used)
    }

    fn with_volume<T>(&self, name: &str, f: impl FnOnce(&mut VolumeState) -> T) -> Result<T> {
        let mut volumes = self.volumes.write();
        let state = volumes
            .get_mut(name)
            .ok_or_else(|| Error::VolumeNotFound(name.to_string()))?;
        Ok(f(state))
    }
}

#[async_trait]
impl VolumeGroup for InMemoryVolumeGroup {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn exists(&self) -> Result<bool> {
        Ok(true)
    }

    async fn extent_size(&self) -> Result<u64> {
        Ok(self.config.extent_size)
    }

    async fn bytes_free(&self, layout: &VolumeLayout) -> Result<u64> {
        let volumes = self.volumes.read();
        layout.usable_bytes(
            self.raw_free(&volumes),
            self.config.extent_size,
            self.config.pv_count,
        )
    }

    async fn lookup(&self, name: &str) -> Result<Option<LogicalVolume>> {
        Ok(self.volumes.read().get(name).map(|v| v.volume.clone()))
    }

    async fn find_by_tag(&self, tag: &str) -> Result<Option<LogicalVolume>> {
        Ok(self
            .volumes
            .read()
            .values()
            .find(|v| v.volume.has_tag(tag))
            .map(|v| v.volume.clone()))
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        Ok(self.volumes.read().keys().cloned().collect())
    }

    async fn create(&self, new: NewVolume) -> Result<LogicalVolume> {
        let mut volumes = self.volumes.write();
        if volumes.contains_key(&new.name) {
            return Err(Error::VolumeGroup(format!(
                "logical volume {} already exists",
                new.name
            )));
        }
        let raw = self.raw_free(&volumes);
        let available = new
            .layout
            .usable_bytes(raw, self.config.extent_size, self.config.pv_count)?;
        if new.size_bytes > available {
            return Err(Error::InsufficientCapacity {
                requested: new.size_bytes,
                available,
            });
        }
        let allocated = new.layout.raw_bytes(new.size_bytes)?;

        let serial = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        let volume = LogicalVolume {
            name: new.name.clone(),
            uuid: format!("mem-{:08x}-{}", serial, new.name),
            size_bytes: new.size_bytes,
            tags: new.tags,
            path: format!("/dev/{}/{}", self.config.name, new.name),
        };
        debug!("Created in-memory volume {} ({} bytes)", volume.name, volume.size_bytes);
        volumes.insert(
            new.name,
            VolumeState {
                volume: volume.clone(),
                allocated,
                active: true,
            },
        );
        Ok(volume)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.volumes
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::VolumeNotFound(name.to_string()))
    }

    async fn activate(&self, name: &str) -> Result<()> {
        self.with_volume(name, |v| v.active = true)
    }

    async fn deactivate(&self, name: &str) -> Result<()> {
        self.with_volume(name, |v| v.active = false)
    }

    async fn add_tag(&self, name: &str, tag: &str) -> Result<()> {
        self.with_volume(name, |v| {
            if !v.volume.has_tag(tag) {
                v.volume.tags.push(tag.to_string());
            }
        })
    }

    async fn del_tag(&self, name: &str, tag: &str) -> Result<()> {
        self.with_volume(name, |v| v.volume.tags.retain(|t| t != tag))
    }

    async fn activate_group(&self) -> Result<()> {
        for state in self.volumes.write().values_mut() {
            state.active = true;
        }
        Ok(())
    }
}
