//! Mount Table Reader
//!
//! Parses the kernel's per-process mount table (`/proc/self/mountinfo`)
//! into [`MountRecord`]s and classifies the transport behind each mounted
//! device. The table is read fresh on every query.
//!
//! Line layout:
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
//! (1)(2)(3)   (4)   (5)      (6)      (7)   (8) (9)   (10)         (11)
//! ```
//!
//! Fields (7) are optional and repeatable; the literal `-` (8) ends them.

use super::bypath::ByPathIndex;
use crate::domain::ports::HostSystemRef;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use tracing::debug;

/// Index of the first optional field
const OPTIONAL_FIELDS_START: usize = 6;

// =============================================================================
// Records
// =============================================================================

/// Transport carrying a mounted device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// A logical volume of the plugin's own volume group
    Direct,
    Iscsi,
    Sas,
    Nvme,
    Qemu,
    /// Any other by-path transport segment
    Other(String),
}

impl TransportKind {
    /// Classify from the third dash-separated segment of a by-path name
    pub fn from_by_path(name: &str) -> Option<Self> {
        let chunks: Vec<&str> = name.split('-').collect();
        if chunks.len() < 4 {
            return None;
        }
        let kind = match chunks[2].to_ascii_lowercase().as_str() {
            "iscsi" => TransportKind::Iscsi,
            "sas" => TransportKind::Sas,
            "nvme" => TransportKind::Nvme,
            "qemu" | "virtio" => TransportKind::Qemu,
            other => TransportKind::Other(other.to_string()),
        };
        Some(kind)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Direct => write!(f, "direct"),
            TransportKind::Iscsi => write!(f, "iscsi"),
            TransportKind::Sas => write!(f, "sas"),
            TransportKind::Nvme => write!(f, "nvme"),
            TransportKind::Qemu => write!(f, "qemu"),
            TransportKind::Other(kind) => write!(f, "{}", kind),
        }
    }
}

/// One active mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    /// Root of the mount within its filesystem
    pub root: String,
    /// Mount point
    pub path: String,
    pub fstype: String,
    /// Per-mount options
    pub options: BTreeSet<String>,
    /// Mount source as reported by the kernel
    pub mount_source: String,
    /// Block device behind the mount
    pub device: String,
    /// By-path name of the device, or the device itself for direct volumes
    pub block_path: String,
    pub transport: TransportKind,
}

impl MountRecord {
    pub fn is_readonly(&self) -> bool {
        self.options.contains("ro")
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Undo the octal escapes the kernel applies to paths (`\040` for space)
fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Device behind a mount, if it is backed by one
fn candidate_device(fstype: &str, source: &str, root: &str) -> Option<String> {
    if source.starts_with("/dev/") {
        return Some(source.to_string());
    }
    // Block bind mounts show the devtmpfs node as their root.
    if fstype == "devtmpfs" && root.len() > 1 {
        return Some(format!("/dev{}", root));
    }
    None
}

/// Parse a mount-table snapshot
///
/// A line without the `-` separator fails the whole parse. Mounts whose
/// device cannot be resolved or classified are skipped.
pub fn parse_mountinfo(
    text: &str,
    index: &ByPathIndex,
    direct_prefixes: &[String],
) -> Result<Vec<MountRecord>> {
    let mut records = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let sep = fields
            .iter()
            .skip(OPTIONAL_FIELDS_START)
            .position(|f| *f == "-")
            .map(|p| p + OPTIONAL_FIELDS_START)
            .ok_or_else(|| Error::MountTableParse(format!("no separator in {:?}", line)))?;
        if fields.len() < sep + 3 {
            return Err(Error::MountTableParse(format!(
                "missing fields after separator in {:?}",
                line
            )));
        }

        let root = unescape(fields[3]);
        let path = unescape(fields[4]);
        let fstype = fields[sep + 1].to_string();
        let mount_source = unescape(fields[sep + 2]);

        let Some(device) = candidate_device(&fstype, &mount_source, &root) else {
            continue;
        };

        let (block_path, transport) = if direct_prefixes.iter().any(|p| device.starts_with(p.as_str())) {
            (device.clone(), TransportKind::Direct)
        } else {
            let Some(name) = index.resolve(&device) else {
                debug!(device = %device, path = %path, "No by-path entry for mounted device");
                continue;
            };
            let Some(kind) = TransportKind::from_by_path(name) else {
                debug!(by_path = %name, path = %path, "Unclassifiable by-path entry");
                continue;
            };
            (name.to_string(), kind)
        };

        records.push(MountRecord {
            root,
            path,
            fstype,
            options: fields[5].split(',').map(String::from).collect(),
            mount_source,
            device,
            block_path,
            transport,
        });
    }
    Ok(records)
}

// =============================================================================
// Reader
// =============================================================================

/// Configuration for the mount table reader
#[derive(Debug, Clone, Default)]
pub struct MountTableConfig {
    /// Device path prefixes classified as direct logical volumes
    pub direct_prefixes: Vec<String>,
}

impl MountTableConfig {
    /// Direct prefixes for the logical volumes of one volume group
    pub fn for_volume_group(group: &str) -> Self {
        Self {
            direct_prefixes: vec![
                format!("/dev/{}/", group),
                format!("/dev/mapper/{}-", group.replace('-', "--")),
                "/dev/dm-".to_string(),
            ],
        }
    }
}

pub struct MountTableReader {
    config: MountTableConfig,
    host: HostSystemRef,
}

impl MountTableReader {
    pub fn new(config: MountTableConfig, host: HostSystemRef) -> Self {
        Self { config, host }
    }

    /// All classified mounts
    pub async fn list(&self) -> Result<Vec<MountRecord>> {
        let text = self.host.read_mount_table().await?;
        let index = ByPathIndex::from_links(self.host.by_path_links().await?);
        parse_mountinfo(&text, &index, &self.config.direct_prefixes)
    }

    /// Every mount at a path
    pub async fn mounts_at(&self, path: &str) -> Result<Vec<MountRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|m| m.path == path)
            .collect())
    }

    /// First mount at a path
    pub async fn mount_at(&self, path: &str) -> Result<Option<MountRecord>> {
        Ok(self.mounts_at(path).await?.into_iter().next())
    }
}
