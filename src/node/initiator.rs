//! Initiator identity
//!
//! The iSCSI initiator name on a node doubles as its node id so the
//! transport broker can export targets straight to it.

use crate::error::Result;
use std::path::Path;
use tracing::{debug, info};

/// Default location of the initiator identity file
pub const DEFAULT_INITIATOR_FILE: &str = "/etc/iscsi/initiatorname.iscsi";

const INITIATOR_KEY: &str = "InitiatorName";

/// Initiator name from `key=value` file content
pub fn parse_initiator_name(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .find(|(key, _)| key.trim() == INITIATOR_KEY)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Node id: the initiator name when the file provides one, else `fallback`
pub async fn resolve_node_id(file: &Path, fallback: &str) -> Result<String> {
    let content = match tokio::fs::read_to_string(file).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No initiator file at {}, using node id {}", file.display(), fallback);
            return Ok(fallback.to_string());
        }
        Err(e) => return Err(e.into()),
    };
    match parse_initiator_name(&content) {
        Some(name) => {
            info!(initiator = %name, "Using initiator name as node id");
            Ok(name)
        }
        None => Ok(fallback.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_initiator_name() {
        let content = "## DO NOT EDIT\n#InitiatorName=iqn.commented\nInitiatorName=iqn.1994-05.com.redhat:abc123\n";
        assert_eq!(
            parse_initiator_name(content).as_deref(),
            Some("iqn.1994-05.com.redhat:abc123")
        );
        assert_eq!(parse_initiator_name("InitiatorAlias=node1\n"), None);
        assert_eq!(parse_initiator_name("InitiatorName=\n"), None);
    }

    #[tokio::test]
    async fn test_resolve_node_id() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("initiatorname.iscsi");

        assert_eq!(resolve_node_id(&file, "node-1").await.unwrap(), "node-1");

        std::fs::write(&file, "InitiatorName=iqn.2020-01.io.example:node-1\n").unwrap();
        assert_eq!(
            resolve_node_id(&file, "node-1").await.unwrap(),
            "iqn.2020-01.io.example:node-1"
        );

        std::fs::write(&file, "\n").unwrap();
        assert_eq!(resolve_node_id(&file, "node-1").await.unwrap(), "node-1");
    }
}
