//! Node records and node list housekeeping.

pub mod session;
pub mod types;

pub use session::{TestSession, TestStage};
pub use types::{GeoIpInfo, LinkType, NodeRecord, NodeResults, SampleBuffer, TestOutcome};

use crate::utils::error::{Result, SpeedtestError};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Load a parsed node list (JSON array of node objects).
pub async fn load_node_list<P: AsRef<Path>>(path: P) -> Result<Vec<NodeRecord>> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        SpeedtestError::Config(format!("Failed to read node list {}: {}", path.display(), e))
    })?;
    let nodes: Vec<NodeRecord> = serde_json::from_str(&content)?;
    info!(count = nodes.len(), path = %path.display(), "Loaded node list");
    Ok(nodes)
}

/// Drop nodes sharing protocol, host (trimmed, case-insensitive) and port.
/// The first occurrence wins and order is preserved.
pub fn dedup_by_endpoint(nodes: Vec<NodeRecord>) -> Vec<NodeRecord> {
    let before = nodes.len();
    let mut seen = HashSet::with_capacity(before);
    let kept: Vec<NodeRecord> = nodes
        .into_iter()
        .filter(|node| {
            seen.insert((
                node.link_type,
                node.server.trim().to_ascii_lowercase(),
                node.port,
            ))
        })
        .collect();
    if kept.len() != before {
        info!(
            removed = before - kept.len(),
            remaining = kept.len(),
            "Removed duplicate nodes"
        );
    }
    kept
}

/// Assign ids 0..n in list order.
pub fn renumber(nodes: &mut [NodeRecord]) {
    for (index, node) in nodes.iter_mut().enumerate() {
        node.id = index as u32;
    }
    debug!(count = nodes.len(), "Renumbered nodes");
}

pub fn apply_custom_group(nodes: &mut [NodeRecord], group: &str) {
    for node in nodes.iter_mut() {
        node.group = group.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(link_type: LinkType, server: &str, port: u16) -> NodeRecord {
        NodeRecord::new(0, link_type, server, port, "{}")
    }

    #[test]
    fn test_dedup_keeps_first_and_order() {
        let mut first = node(LinkType::Vmess, "a.example", 443);
        first.remarks = "first".to_string();
        let nodes = vec![
            first,
            node(LinkType::Trojan, "b.example", 443),
            node(LinkType::Vmess, " A.Example ", 443),
            node(LinkType::Vless, "a.example", 443),
        ];

        let kept = dedup_by_endpoint(nodes);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].remarks, "first");
        assert_eq!(kept[1].link_type, LinkType::Trojan);
        assert_eq!(kept[2].link_type, LinkType::Vless);
    }

    #[test]
    fn test_renumber_is_unique() {
        let mut nodes = vec![
            node(LinkType::Vmess, "a", 1),
            node(LinkType::Vmess, "b", 2),
            node(LinkType::Vmess, "c", 3),
        ];
        renumber(&mut nodes);
        let ids: Vec<u32> = nodes.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_load_node_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        let json = r#"[
            {"link_type": "vless", "server": "v.example", "port": 443,
             "rendered_config": "{\"outbounds\":[{\"protocol\":\"vless\"}]}",
             "remarks": "tokyo", "group": "sub1"},
            {"link_type": "ss", "server": "s.example", "port": 8388,
             "rendered_config": "{}", "original_share_link": "ss://abc"}
        ]"#;
        tokio::fs::write(&path, json).await.unwrap();

        let nodes = load_node_list(&path).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].remarks, "tokyo");
        assert_eq!(nodes[1].link_type, LinkType::Shadowsocks);
        assert_eq!(nodes[1].original_share_link.as_deref(), Some("ss://abc"));
        assert_eq!(nodes[1].results.nat_type, "Unknown");
    }
}
