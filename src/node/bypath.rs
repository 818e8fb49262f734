//! By-path device index
//!
//! `/dev/disk/by-path` holds one stable, topology-derived symlink per block
//! device (`ip-10.0.0.5:3260-iscsi-iqn...-lun-0 -> ../../sdb`). The index
//! maps a device back to its by-path name so the transport carrying it can
//! be classified.

use crate::domain::ports::ByPathLink;
use crate::error::Result;
use std::collections::BTreeMap;
use std::path::Path;

/// Default location of the by-path directory
pub const DEFAULT_BY_PATH_DIR: &str = "/dev/disk/by-path";

/// Reverse index from device basename to by-path link name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByPathIndex {
    by_device: BTreeMap<String, String>,
}

impl ByPathIndex {
    pub fn from_links(links: impl IntoIterator<Item = ByPathLink>) -> Self {
        let mut by_device = BTreeMap::new();
        for link in links {
            if let Some(device) = basename(&link.target) {
                // first link wins
                by_device.entry(device.to_string()).or_insert(link.name);
            }
        }
        Self { by_device }
    }

    /// Resolve a device path to its by-path link name
    pub fn resolve(&self, device: &str) -> Option<&str> {
        let device = basename(device)?;
        self.by_device.get(device).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_device.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_device.is_empty()
    }
}

fn basename(path: &str) -> Option<&str> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
}

/// Parse an `ls -l` style listing of the by-path directory
pub fn parse_listing(listing: &str) -> Vec<ByPathLink> {
    listing
        .lines()
        .filter_map(|line| {
            let (left, target) = line.split_once("->")?;
            let name = left.split_whitespace().last()?;
            let target = target.trim();
            if target.is_empty() {
                return None;
            }
            Some(ByPathLink {
                name: name.to_string(),
                target: target.to_string(),
            })
        })
        .collect()
}

/// Read the links of a by-path directory; a missing directory is empty
pub fn read_dir(dir: &Path) -> Result<Vec<ByPathLink>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut links = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Ok(target) = std::fs::read_link(&path) else {
            continue;
        };
        links.push(ByPathLink {
            name: entry.file_name().to_string_lossy().into_owned(),
            target: target.to_string_lossy().into_owned(),
        });
    }
    links.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(links)
}
