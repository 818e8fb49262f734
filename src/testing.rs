//! Test doubles for the host system and transport broker ports

use crate::domain::ports::{
    ByPathLink, HostMode, HostSystem, IscsiTarget, MountRequest, QosHints, TransportBroker,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

// =============================================================================
// Fake Host
// =============================================================================

#[derive(Default)]
struct HostState {
    mount_lines: Vec<String>,
    next_mount_id: u32,
    links: Vec<ByPathLink>,
    symlinks: HashMap<String, String>,
    filesystems: HashMap<String, String>,
    fail_mounts: bool,
    fail_permissions: bool,
    calls: Vec<String>,
    files: BTreeSet<String>,
    dirs: BTreeSet<String>,
    groups: Vec<(String, u32)>,
    opened: Vec<String>,
    removed: Vec<String>,
}

/// In-memory kernel: mounts are rendered as mountinfo lines
#[derive(Default)]
pub struct FakeHost {
    mode: HostMode,
    state: Mutex<HostState>,
}

fn mount_path(line: &str) -> Option<&str> {
    line.split_whitespace().nth(4)
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn brokered() -> Self {
        Self {
            mode: HostMode::Brokered,
            ..Self::default()
        }
    }

    /// Replace the mount table with raw mountinfo text
    pub fn set_mount_table(&self, text: &str) {
        self.state.lock().mount_lines = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(String::from)
            .collect();
    }

    pub fn add_link(&self, name: &str, target: &str) {
        self.state.lock().links.push(ByPathLink {
            name: name.to_string(),
            target: target.to_string(),
        });
    }

    pub fn add_symlink(&self, path: &str, resolved: &str) {
        self.state
            .lock()
            .symlinks
            .insert(path.to_string(), resolved.to_string());
    }

    pub fn set_filesystem(&self, device: &str, fs_type: &str) {
        self.state
            .lock()
            .filesystems
            .insert(device.to_string(), fs_type.to_string());
    }

    pub fn filesystem(&self, device: &str) -> Option<String> {
        self.state.lock().filesystems.get(device).cloned()
    }

    pub fn fail_mounts(&self, fail: bool) {
        self.state.lock().fail_mounts = fail;
    }

    pub fn fail_permissions(&self, fail: bool) {
        self.state.lock().fail_permissions = fail;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn is_mounted(&self, path: &str) -> bool {
        self.state
            .lock()
            .mount_lines
            .iter()
            .any(|l| mount_path(l) == Some(path))
    }

    pub fn files(&self) -> BTreeSet<String> {
        self.state.lock().files.clone()
    }

    pub fn dirs(&self) -> BTreeSet<String> {
        self.state.lock().dirs.clone()
    }

    pub fn groups(&self) -> Vec<(String, u32)> {
        self.state.lock().groups.clone()
    }

    pub fn opened(&self) -> Vec<String> {
        self.state.lock().opened.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().removed.clone()
    }

    fn resolve(state: &HostState, path: &str) -> String {
        state
            .symlinks
            .get(path)
            .cloned()
            .unwrap_or_else(|| path.to_string())
    }
}

#[async_trait]
impl HostSystem for FakeHost {
    fn mode(&self) -> HostMode {
        self.mode
    }

    async fn read_mount_table(&self) -> Result<String> {
        let state = self.state.lock();
        Ok(state
            .mount_lines
            .iter()
            .map(|l| format!("{}\n", l))
            .collect())
    }

    async fn by_path_links(&self) -> Result<Vec<ByPathLink>> {
        Ok(self.state.lock().links.clone())
    }

    async fn resolve_symlink(&self, path: &str) -> Result<String> {
        Ok(Self::resolve(&self.state.lock(), path))
    }

    async fn create_file(&self, path: &str) -> Result<()> {
        self.state.lock().files.insert(path.to_string());
        Ok(())
    }

    async fn ensure_dir(&self, path: &str) -> Result<()> {
        self.state.lock().dirs.insert(path.to_string());
        Ok(())
    }

    async fn mount(&self, request: &MountRequest) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!(
            "mount {} {} {}",
            request.source, request.target, request.fs_type
        ));
        if state.fail_mounts {
            return Err(Error::MountFailed {
                path: request.target.clone(),
                reason: "EPERM: Operation not permitted".to_string(),
            });
        }
        state.next_mount_id += 1;
        let id = 100 + state.next_mount_id;
        let line = if request.is_bind() {
            let resolved = Self::resolve(&state, &request.source);
            let root = resolved.strip_prefix("/dev").unwrap_or(&resolved).to_string();
            format!(
                "{} 25 0:6 {} {} rw,nosuid - devtmpfs udev rw,size=4096k",
                id, root, request.target
            )
        } else {
            let mut options = vec![if request.readonly { "ro" } else { "rw" }.to_string()];
            options.extend(request.options.iter().cloned());
            format!(
                "{} 25 253:3 / {} {} - {} {} rw",
                id,
                request.target,
                options.join(","),
                request.fs_type,
                request.source
            )
        };
        state.mount_lines.push(line);
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("unmount {}", target));
        let before = state.mount_lines.len();
        state.mount_lines.retain(|l| mount_path(l) != Some(target));
        if state.mount_lines.len() == before {
            return Err(Error::UnmountFailed {
                path: target.to_string(),
                reason: "EINVAL: Invalid argument".to_string(),
            });
        }
        Ok(())
    }

    async fn probe_filesystem(&self, device: &str) -> Result<Option<String>> {
        Ok(self.state.lock().filesystems.get(device).cloned())
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("format {} {}", device, fs_type));
        state
            .filesystems
            .insert(device.to_string(), fs_type.to_string());
        Ok(())
    }

    async fn set_group(&self, path: &str, gid: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_permissions {
            return Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        state.groups.push((path.to_string(), gid));
        Ok(())
    }

    async fn open_to_all_users(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_permissions {
            return Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        state.opened.push(path.to_string());
        Ok(())
    }

    async fn remove_path(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.files.remove(path);
        state.dirs.remove(path);
        state.removed.push(path.to_string());
        Ok(())
    }
}

// =============================================================================
// Fake Broker
// =============================================================================

struct BrokerState {
    calls: Vec<String>,
    iscsi_target: Option<IscsiTarget>,
    pooled: Vec<IscsiTarget>,
    devices: HashMap<String, String>,
    fail_unstage: bool,
    fail_logout: bool,
    fail_qos: bool,
    mount_table: String,
    filesystems: HashMap<String, String>,
}

/// Transport broker that records every call
pub struct FakeBroker {
    state: Mutex<BrokerState>,
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBroker {
    pub fn new() -> Self {
        let pooled = (1..=2)
            .map(|i| IscsiTarget {
                iqn: format!("iqn.2003-01.org.jbof:drive{}", i),
                lun: 0,
                portal: format!("10.0.1.{}:3260", i),
            })
            .collect();
        Self {
            state: Mutex::new(BrokerState {
                calls: Vec::new(),
                iscsi_target: None,
                pooled,
                devices: HashMap::new(),
                fail_unstage: false,
                fail_logout: false,
                fail_qos: false,
                mount_table: String::new(),
                filesystems: HashMap::new(),
            }),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn set_iscsi_target(&self, target: IscsiTarget) {
        self.state.lock().iscsi_target = Some(target);
    }

    pub fn set_pooled_targets(&self, targets: Vec<IscsiTarget>) {
        self.state.lock().pooled = targets;
    }

    /// Device returned by a login to `iqn`
    pub fn set_device(&self, iqn: &str, device: &str) {
        self.state
            .lock()
            .devices
            .insert(iqn.to_string(), device.to_string());
    }

    pub fn fail_unstage(&self, fail: bool) {
        self.state.lock().fail_unstage = fail;
    }

    pub fn fail_logout(&self, fail: bool) {
        self.state.lock().fail_logout = fail;
    }

    pub fn fail_qos(&self, fail: bool) {
        self.state.lock().fail_qos = fail;
    }

    pub fn set_mount_table(&self, text: &str) {
        self.state.lock().mount_table = text.to_string();
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl TransportBroker for FakeBroker {
    async fn stage_iscsi_target(&self, volume_uuid: &str, node_id: &str) -> Result<IscsiTarget> {
        self.record(format!("stage {} {}", volume_uuid, node_id));
        let target = self.state.lock().iscsi_target.clone();
        Ok(target.unwrap_or_else(|| IscsiTarget {
            iqn: format!("iqn.2003-01.org.broker:{}", volume_uuid),
            lun: 0,
            portal: "10.0.0.1:3260".to_string(),
        }))
    }

    async fn unstage_iscsi_target(&self, volume_uuid: &str, node_id: &str) -> Result<()> {
        self.record(format!("unstage {} {}", volume_uuid, node_id));
        if self.state.lock().fail_unstage {
            return Err(Error::Broker("target busy".to_string()));
        }
        Ok(())
    }

    async fn stage_pooled_targets(
        &self,
        group: &str,
        endpoints: &[String],
        node_id: &str,
    ) -> Result<Vec<IscsiTarget>> {
        self.record(format!(
            "stage-pooled {} {} {}",
            group,
            endpoints.join(","),
            node_id
        ));
        Ok(self.state.lock().pooled.clone())
    }

    async fn login(&self, iqn: &str, portal: &str) -> Result<String> {
        self.record(format!("login {} {}", iqn, portal));
        let device = self.state.lock().devices.get(iqn).cloned();
        Ok(device.unwrap_or_else(|| "/dev/sdx".to_string()))
    }

    async fn logout(&self, iqn: &str, portal: &str) -> Result<()> {
        self.record(format!("logout {} {}", iqn, portal));
        if self.state.lock().fail_logout {
            return Err(Error::Broker("session not found".to_string()));
        }
        Ok(())
    }

    async fn set_qos(&self, group: &str, volume: &str, qos: &QosHints) -> Result<()> {
        self.record(format!(
            "set-qos {} {} {:?} {:?}",
            group, volume, qos.iops_per_gb, qos.mbps_per_gb
        ));
        if self.state.lock().fail_qos {
            return Err(Error::Broker("qos controller unavailable".to_string()));
        }
        Ok(())
    }

    async fn mount(&self, request: &MountRequest) -> Result<()> {
        self.record(format!(
            "mount {} {} {}",
            request.source, request.target, request.fs_type
        ));
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<()> {
        self.record(format!("unmount {}", target));
        Ok(())
    }

    async fn mount_table(&self) -> Result<String> {
        Ok(self.state.lock().mount_table.clone())
    }

    async fn filesystem_type(&self, device: &str) -> Result<Option<String>> {
        Ok(self.state.lock().filesystems.get(device).cloned())
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        self.record(format!("format {} {}", device, fs_type));
        self.state
            .lock()
            .filesystems
            .insert(device.to_string(), fs_type.to_string());
        Ok(())
    }

    async fn set_permissions(
        &self,
        target: &str,
        group: Option<u32>,
        all_users: bool,
    ) -> Result<()> {
        self.record(format!(
            "set-permissions {} {:?} {}",
            target, group, all_users
        ));
        Ok(())
    }
}
