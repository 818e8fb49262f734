//! Host System Adapters
//!
//! [`LocalHost`] performs mount, format and permission operations with
//! direct system calls and the usual block-device tools. [`BrokeredHost`]
//! forwards everything that touches the node's mount namespace to the
//! transport broker, keeping local only the device-directory lookups and
//! target-path housekeeping.

use super::bypath;
use crate::domain::ports::{
    ByPathLink, HostMode, HostSystem, MountRequest, TransportBrokerRef,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use nix::mount::{MntFlags, MsFlags};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for local host operations
#[derive(Debug, Clone)]
pub struct LocalHostConfig {
    /// Mount table of the plugin's own mount namespace
    pub mountinfo_path: PathBuf,
    /// Stable by-path device directory
    pub by_path_dir: PathBuf,
    /// Bytes zeroed at the start of a device before formatting
    pub scrub_bytes: u64,
}

impl Default for LocalHostConfig {
    fn default() -> Self {
        Self {
            mountinfo_path: PathBuf::from("/proc/self/mountinfo"),
            by_path_dir: PathBuf::from(bypath::DEFAULT_BY_PATH_DIR),
            scrub_bytes: 512 * 512,
        }
    }
}

// =============================================================================
// Command Helpers
// =============================================================================

/// Run a command, returning stdout on success
async fn run(program: &str, args: &[&str]) -> Result<String> {
    debug!("Running {} {:?}", program, args);
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Command {
            command: program.to_string(),
            reason: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(Error::Command {
            command: format!("{} {}", program, args.join(" ")),
            reason: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Extract `TYPE` from `blkid -o export` output
pub fn parse_blkid_export(output: &str) -> Result<Option<String>> {
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (key, value) = line.split_once('=').ok_or_else(|| Error::Command {
            command: "blkid".to_string(),
            reason: format!("unparseable line {:?}", line),
        })?;
        if key == "TYPE" {
            return Ok(Some(value.to_string()));
        }
    }
    Err(Error::Command {
        command: "blkid".to_string(),
        reason: "no TYPE in output".to_string(),
    })
}

/// Run a blocking system call off the async runtime
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(Error::internal)?
}

fn add_mode(path: &str, bits: u32) -> Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | bits);
    std::fs::set_permissions(path, permissions)?;
    Ok(())
}

// =============================================================================
// Local Host
// =============================================================================

/// Host operations through local system calls
pub struct LocalHost {
    config: LocalHostConfig,
}

impl LocalHost {
    pub fn new(config: LocalHostConfig) -> Self {
        Self { config }
    }
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new(LocalHostConfig::default())
    }
}

#[async_trait]
impl HostSystem for LocalHost {
    fn mode(&self) -> HostMode {
        HostMode::Local
    }

    async fn read_mount_table(&self) -> Result<String> {
        Ok(tokio::fs::read_to_string(&self.config.mountinfo_path).await?)
    }

    async fn by_path_links(&self) -> Result<Vec<ByPathLink>> {
        let dir = self.config.by_path_dir.clone();
        blocking(move || bypath::read_dir(&dir)).await
    }

    async fn resolve_symlink(&self, path: &str) -> Result<String> {
        let resolved = tokio::fs::canonicalize(path).await?;
        Ok(resolved.to_string_lossy().into_owned())
    }

    async fn create_file(&self, path: &str) -> Result<()> {
        tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .await?;
        Ok(())
    }

    async fn ensure_dir(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        blocking(move || {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o770)
                .create(&path)?;
            Ok(())
        })
        .await
    }

    async fn mount(&self, request: &MountRequest) -> Result<()> {
        let request = request.clone();
        blocking(move || {
            let result = if request.is_bind() {
                nix::mount::mount(
                    Some(request.source.as_str()),
                    request.target.as_str(),
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
            } else {
                let mut flags = MsFlags::empty();
                if request.readonly {
                    flags |= MsFlags::MS_RDONLY;
                }
                let data = request.options.join(",");
                nix::mount::mount(
                    Some(request.source.as_str()),
                    request.target.as_str(),
                    Some(request.fs_type.as_str()),
                    flags,
                    Some(data.as_str()),
                )
            };
            result.map_err(|e| Error::MountFailed {
                path: request.target.clone(),
                reason: e.to_string(),
            })?;
            info!(
                source = %request.source,
                target = %request.target,
                fs_type = %request.fs_type,
                readonly = request.readonly,
                "Mounted"
            );
            Ok(())
        })
        .await
    }

    async fn unmount(&self, target: &str) -> Result<()> {
        let target = target.to_string();
        blocking(move || {
            nix::mount::umount2(target.as_str(), MntFlags::empty()).map_err(|e| {
                Error::UnmountFailed {
                    path: target.clone(),
                    reason: e.to_string(),
                }
            })?;
            info!(target = %target, "Unmounted");
            Ok(())
        })
        .await
    }

    async fn probe_filesystem(&self, device: &str) -> Result<Option<String>> {
        // `file` tells "no filesystem" apart reliably; blkid names the type.
        let kind = run("file", &["-bsL", device]).await?;
        if kind.trim() == "data" {
            return Ok(None);
        }
        let export = run("blkid", &["-c", "/dev/null", "-o", "export", device]).await?;
        parse_blkid_export(&export)
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        let count = format!("count={}", self.config.scrub_bytes / 512);
        let of = format!("of={}", device);
        run(
            "dd",
            &["if=/dev/zero", &of, "bs=512", &count, "conv=notrunc"],
        )
        .await?;
        run("mkfs", &["-t", fs_type, device]).await?;
        info!(device = %device, fs_type = %fs_type, "Formatted device");
        Ok(())
    }

    async fn set_group(&self, path: &str, gid: u32) -> Result<()> {
        let path = path.to_string();
        blocking(move || {
            nix::unistd::chown(path.as_str(), None, Some(nix::unistd::Gid::from_raw(gid)))?;
            add_mode(&path, 0o070)
        })
        .await
    }

    async fn open_to_all_users(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        blocking(move || add_mode(&path, 0o777)).await
    }

    async fn remove_path(&self, path: &str) -> Result<()> {
        let result = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
            Ok(_) => tokio::fs::remove_file(path).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Brokered Host
// =============================================================================

/// Host operations delegated to the transport broker
pub struct BrokeredHost {
    broker: TransportBrokerRef,
    local: LocalHost,
}

impl BrokeredHost {
    pub fn new(broker: TransportBrokerRef, local: LocalHost) -> Self {
        Self { broker, local }
    }
}

#[async_trait]
impl HostSystem for BrokeredHost {
    fn mode(&self) -> HostMode {
        HostMode::Brokered
    }

    async fn read_mount_table(&self) -> Result<String> {
        self.broker.mount_table().await
    }

    async fn by_path_links(&self) -> Result<Vec<ByPathLink>> {
        self.local.by_path_links().await
    }

    async fn resolve_symlink(&self, path: &str) -> Result<String> {
        self.local.resolve_symlink(path).await
    }

    async fn create_file(&self, path: &str) -> Result<()> {
        self.local.create_file(path).await
    }

    async fn ensure_dir(&self, path: &str) -> Result<()> {
        self.local.ensure_dir(path).await
    }

    async fn mount(&self, request: &MountRequest) -> Result<()> {
        self.broker.mount(request).await
    }

    async fn unmount(&self, target: &str) -> Result<()> {
        self.broker.unmount(target).await
    }

    async fn probe_filesystem(&self, device: &str) -> Result<Option<String>> {
        self.broker.filesystem_type(device).await
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        self.broker.format(device, fs_type).await
    }

    async fn set_group(&self, path: &str, gid: u32) -> Result<()> {
        self.broker.set_permissions(path, Some(gid), false).await
    }

    async fn open_to_all_users(&self, path: &str) -> Result<()> {
        self.broker.set_permissions(path, None, true).await
    }

    async fn remove_path(&self, path: &str) -> Result<()> {
        self.local.remove_path(path).await
    }
}
