//! LVM Volume Group Adapter
//!
//! Drives an LVM2 volume group through its command-line tools. Reports are
//! requested as JSON (`--reportformat json`) in plain bytes so sizes parse
//! without unit handling.

use crate::domain::ports::{LogicalVolume, NewVolume, VolumeGroup, VolumeLayout, VolumeType};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

const REPORT_ARGS: [&str; 5] = ["--reportformat", "json", "--units", "b", "--nosuffix"];

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the LVM adapter
#[derive(Debug, Clone)]
pub struct LvmConfig {
    /// Volume group to carve volumes from
    pub volume_group: String,
}

impl LvmConfig {
    pub fn new(volume_group: impl Into<String>) -> Self {
        Self {
            volume_group: volume_group.into(),
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Deserialize)]
struct Report<T> {
    report: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct VgSection {
    #[serde(default)]
    vg: Vec<VgRow>,
}

#[derive(Debug, Deserialize)]
struct VgRow {
    vg_extent_size: String,
    vg_free: String,
    pv_count: String,
}

#[derive(Debug, Deserialize)]
struct LvSection {
    #[serde(default)]
    lv: Vec<LvRow>,
}

#[derive(Debug, Deserialize)]
struct LvRow {
    lv_name: String,
    lv_uuid: String,
    lv_size: String,
    #[serde(default)]
    lv_tags: String,
    #[serde(default)]
    lv_path: String,
}

/// Volume group figures from a `vgs` report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStats {
    pub extent_size: u64,
    pub free_bytes: u64,
    pub pv_count: u64,
}

fn parse_number(field: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::VolumeGroup(format!("unreadable {} {:?}", field, value)))
}

/// Parse a `vgs` JSON report of a single group
pub fn parse_vgs_report(json: &[u8]) -> Result<GroupStats> {
    let report: Report<VgSection> = serde_json::from_slice(json)?;
    let row = report
        .report
        .into_iter()
        .flat_map(|s| s.vg)
        .next()
        .ok_or_else(|| Error::VolumeGroup("empty vgs report".to_string()))?;
    Ok(GroupStats {
        extent_size: parse_number("vg_extent_size", &row.vg_extent_size)?,
        free_bytes: parse_number("vg_free", &row.vg_free)?,
        pv_count: parse_number("pv_count", &row.pv_count)?,
    })
}

/// Parse an `lvs` JSON report
pub fn parse_lvs_report(json: &[u8], group: &str) -> Result<Vec<LogicalVolume>> {
    let report: Report<LvSection> = serde_json::from_slice(json)?;
    report
        .report
        .into_iter()
        .flat_map(|s| s.lv)
        .map(|row| {
            let path = if row.lv_path.is_empty() {
                format!("/dev/{}/{}", group, row.lv_name)
            } else {
                row.lv_path
            };
            Ok(LogicalVolume {
                size_bytes: parse_number("lv_size", &row.lv_size)?,
                tags: row
                    .lv_tags
                    .split(',')
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect(),
                name: row.lv_name,
                uuid: row.lv_uuid,
                path,
            })
        })
        .collect()
}

/// `lvcreate` arguments for a new volume
pub fn create_args(group: &str, volume: &NewVolume) -> Vec<String> {
    let mut args = vec![
        "--name".to_string(),
        volume.name.clone(),
        "--size".to_string(),
        format!("{}b", volume.size_bytes),
    ];
    let layout = &volume.layout;
    match layout.volume_type {
        VolumeType::Linear => {
            if let Some(stripes) = layout.stripes.filter(|s| *s > 1) {
                args.extend(["--type".to_string(), "striped".to_string()]);
                args.extend(["--stripes".to_string(), stripes.to_string()]);
            }
        }
        kind => {
            args.extend(["--type".to_string(), kind.to_string()]);
            if let Some(stripes) = layout.stripes {
                args.extend(["--stripes".to_string(), stripes.to_string()]);
            }
            if let Some(mirrors) = layout.mirrors {
                args.extend(["--mirrors".to_string(), mirrors.to_string()]);
            }
            if layout.nosync {
                args.push("--nosync".to_string());
            }
        }
    }
    for tag in &volume.tags {
        args.extend(["--addtag".to_string(), tag.clone()]);
    }
    args.push("--yes".to_string());
    args.push(group.to_string());
    args
}

/// Recognized LVM failures
fn classify_stderr(stderr: &str) -> Option<Error> {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("physical volumes") && (lower.contains("insufficient") || lower.contains("exceed")) {
        return Some(Error::TooFewDisks);
    }
    if lower.contains("insufficient free space") || lower.contains("insufficient suitable allocatable extents") {
        return Some(Error::InsufficientCapacity {
            requested: 0,
            available: 0,
        });
    }
    None
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("not found") || lower.contains("failed to find")
}

// =============================================================================
// LVM Volume Group
// =============================================================================

pub struct LvmVolumeGroup {
    config: LvmConfig,
}

impl LvmVolumeGroup {
    pub fn new(config: LvmConfig) -> Self {
        Self { config }
    }

    fn qualified(&self, name: &str) -> String {
        format!("{}/{}", self.config.volume_group, name)
    }

    /// Run an LVM command; on failure returns the stderr text
    async fn run(&self, program: &str, args: &[String]) -> Result<std::result::Result<Vec<u8>, String>> {
        debug!("Running {} {:?}", program, args);
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Command {
                command: program.to_string(),
                reason: e.to_string(),
            })?;
        if output.status.success() {
            Ok(Ok(output.stdout))
        } else {
            Ok(Err(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }

    /// Run an LVM command that must succeed
    async fn run_checked(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        self.run(program, args).await?.map_err(|stderr| {
            classify_stderr(&stderr).unwrap_or_else(|| Error::Command {
                command: format!("{} {}", program, args.join(" ")),
                reason: stderr,
            })
        })
    }

    async fn stats(&self) -> Result<GroupStats> {
        let mut args: Vec<String> = REPORT_ARGS.iter().map(|a| a.to_string()).collect();
        args.extend([
            "-o".to_string(),
            "vg_extent_size,vg_free,pv_count".to_string(),
            self.config.volume_group.clone(),
        ]);
        parse_vgs_report(&self.run_checked("vgs", &args).await?)
    }

    async fn volumes(&self) -> Result<Vec<LogicalVolume>> {
        let mut args: Vec<String> = REPORT_ARGS.iter().map(|a| a.to_string()).collect();
        args.extend([
            "-o".to_string(),
            "lv_name,lv_uuid,lv_size,lv_tags,lv_path".to_string(),
            self.config.volume_group.clone(),
        ]);
        parse_lvs_report(
            &self.run_checked("lvs", &args).await?,
            &self.config.volume_group,
        )
    }

    async fn lvchange(&self, name: &str, flag: &str, value: Option<&str>) -> Result<()> {
        let mut args = vec![flag.to_string()];
        args.extend(value.map(String::from));
        args.push(self.qualified(name));
        match self.run("lvchange", &args).await? {
            Ok(_) => Ok(()),
            Err(stderr) if is_not_found(&stderr) => Err(Error::VolumeNotFound(name.to_string())),
            Err(stderr) => Err(Error::Command {
                command: format!("lvchange {}", args.join(" ")),
                reason: stderr,
            }),
        }
    }
}

#[async_trait]
impl VolumeGroup for LvmVolumeGroup {
    fn name(&self) -> &str {
        &self.config.volume_group
    }

    async fn exists(&self) -> Result<bool> {
        let args = vec!["--noheadings".to_string(), self.config.volume_group.clone()];
        match self.run("vgs", &args).await? {
            Ok(_) => Ok(true),
            Err(stderr) if is_not_found(&stderr) => Ok(false),
            Err(stderr) => Err(Error::Command {
                command: "vgs".to_string(),
                reason: stderr,
            }),
        }
    }

    async fn extent_size(&self) -> Result<u64> {
        Ok(self.stats().await?.extent_size)
    }

    async fn bytes_free(&self, layout: &VolumeLayout) -> Result<u64> {
        let stats = self.stats().await?;
        layout.usable_bytes(stats.free_bytes, stats.extent_size, stats.pv_count)
    }

    async fn lookup(&self, name: &str) -> Result<Option<LogicalVolume>> {
        Ok(self.volumes().await?.into_iter().find(|lv| lv.name == name))
    }

    async fn find_by_tag(&self, tag: &str) -> Result<Option<LogicalVolume>> {
        Ok(self.volumes().await?.into_iter().find(|lv| lv.has_tag(tag)))
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        Ok(self.volumes().await?.into_iter().map(|lv| lv.name).collect())
    }

    async fn create(&self, volume: NewVolume) -> Result<LogicalVolume> {
        let args = create_args(&self.config.volume_group, &volume);
        info!(
            volume_id = %volume.name,
            size_bytes = volume.size_bytes,
            layout = %volume.layout.volume_type,
            "Creating logical volume"
        );
        if let Err(e) = self.run_checked("lvcreate", &args).await {
            return Err(match e {
                Error::InsufficientCapacity { .. } => Error::InsufficientCapacity {
                    requested: volume.size_bytes,
                    available: self.bytes_free(&volume.layout).await.unwrap_or(0),
                },
                other => other,
            });
        }
        self.lookup(&volume.name).await?.ok_or_else(|| {
            Error::VolumeGroup(format!("logical volume {} missing after create", volume.name))
        })
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let args = vec!["-f".to_string(), self.qualified(name)];
        match self.run("lvremove", &args).await? {
            Ok(_) => {
                info!(volume_id = %name, "Removed logical volume");
                Ok(())
            }
            Err(stderr) if is_not_found(&stderr) => Err(Error::VolumeNotFound(name.to_string())),
            Err(stderr) => Err(Error::Command {
                command: "lvremove".to_string(),
                reason: stderr,
            }),
        }
    }

    async fn activate(&self, name: &str) -> Result<()> {
        self.lvchange(name, "-ay", None).await
    }

    async fn deactivate(&self, name: &str) -> Result<()> {
        self.lvchange(name, "-an", None).await
    }

    async fn add_tag(&self, name: &str, tag: &str) -> Result<()> {
        self.lvchange(name, "--addtag", Some(tag)).await
    }

    async fn del_tag(&self, name: &str, tag: &str) -> Result<()> {
        self.lvchange(name, "--deltag", Some(tag)).await
    }

    async fn activate_group(&self) -> Result<()> {
        let args = vec!["-ay".to_string(), self.config.volume_group.clone()];
        self.run_checked("vgchange", &args).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_vgs_report() {
        let json = br#"{
            "report": [
                {"vg": [{"vg_extent_size": "4194304", "vg_free": "107369988096", "pv_count": "2"}]}
            ]
        }"#;
        assert_eq!(
            parse_vgs_report(json).unwrap(),
            GroupStats {
                extent_size: 4 << 20,
                free_bytes: 107_369_988_096,
                pv_count: 2,
            }
        );
        assert_matches!(
            parse_vgs_report(br#"{"report": [{"vg": []}]}"#),
            Err(Error::VolumeGroup(_))
        );
    }

    #[test]
    fn test_parse_lvs_report() {
        let json = br#"{
            "report": [
                {"lv": [
                    {"lv_name": "lv1", "lv_uuid": "Yx3c-aa", "lv_size": "1073741824",
                     "lv_tags": "VN.pvc-1,DP.iscsi", "lv_path": "/dev/vg0/lv1"},
                    {"lv_name": "lv2", "lv_uuid": "Yx3c-bb", "lv_size": "4194304", "lv_tags": ""}
                ]}
            ]
        }"#;
        let volumes = parse_lvs_report(json, "vg0").unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].tags, vec!["VN.pvc-1", "DP.iscsi"]);
        assert_eq!(volumes[0].size_bytes, 1 << 30);
        assert!(volumes[1].tags.is_empty());
        assert_eq!(volumes[1].path, "/dev/vg0/lv2");
    }

    #[test]
    fn test_create_args() {
        let volume = NewVolume {
            name: "lv1".to_string(),
            size_bytes: 8 << 20,
            layout: VolumeLayout {
                volume_type: VolumeType::Raid1,
                mirrors: Some(2),
                nosync: true,
                ..VolumeLayout::default()
            },
            tags: vec!["VN.a".to_string()],
        };
        assert_eq!(
            create_args("vg0", &volume).join(" "),
            "--name lv1 --size 8388608b --type raid1 --mirrors 2 --nosync --addtag VN.a --yes vg0"
        );

        let striped = NewVolume {
            layout: VolumeLayout {
                stripes: Some(2),
                ..VolumeLayout::linear()
            },
            tags: Vec::new(),
            ..volume
        };
        assert_eq!(
            create_args("vg0", &striped).join(" "),
            "--name lv1 --size 8388608b --type striped --stripes 2 --yes vg0"
        );
    }

    #[test]
    fn test_classify_stderr() {
        assert_matches!(
            classify_stderr("  Volume group \"vg0\" has insufficient free space (10 extents): 256 required."),
            Some(Error::InsufficientCapacity { .. })
        );
        assert_matches!(
            classify_stderr("  Insufficient suitable allocatable extents for logical volume lv1"),
            Some(Error::InsufficientCapacity { .. })
        );
        assert_matches!(
            classify_stderr("  Number of stripes (3) must not exceed the number of physical volumes (2)"),
            Some(Error::TooFewDisks)
        );
        assert!(classify_stderr("  Device busy").is_none());
        assert!(is_not_found("  Failed to find logical volume \"vg0/lv9\""));
    }
}
