use crate::node::{NodeRecord, TestOutcome};
use crate::utils::format::{format_percent, format_speed};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Push channel fired once for every finished node, online or not.
#[async_trait]
pub trait NodeNotifier: Send + Sync {
    async fn notify_node_tested(&self, node: &NodeRecord);
}

/// Reports finished nodes on the log.
pub struct LogNotifier;

#[async_trait]
impl NodeNotifier for LogNotifier {
    async fn notify_node_tested(&self, node: &NodeRecord) {
        let results = &node.results;
        info!(
            node_id = node.id,
            group = %node.group,
            remarks = %node.remarks,
            online = results.online,
            outcome = %results.outcome.map(|o| o.as_str()).unwrap_or("unknown"),
            ping_ms = results.avg_ping_ms,
            loss = %format_percent(results.packet_loss),
            avg_speed = %format_speed(results.avg_speed),
            max_speed = %format_speed(results.max_speed),
            nat = %results.nat_type,
            "Node tested"
        );
    }
}

/// One finished node, as kept in the event history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    pub timestamp: DateTime<Utc>,
    pub node_id: u32,
    pub section: String,
    pub remarks: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TestOutcome>,
    pub avg_ping_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_speed: Option<f64>,
    pub completed_seq: u64,
}

impl NodeEvent {
    pub fn from_node(node: &NodeRecord) -> Self {
        Self {
            timestamp: Utc::now(),
            node_id: node.id,
            section: node.section_key(),
            remarks: node.remarks.clone(),
            online: node.results.online,
            outcome: node.results.outcome,
            avg_ping_ms: node.results.avg_ping_ms,
            avg_speed: node.results.avg_speed,
            completed_seq: node.results.completed_seq,
        }
    }
}

/// In-memory history of finished nodes that a front end can poll.
#[derive(Debug, Clone)]
pub struct NodeEventHistory {
    events: Arc<RwLock<VecDeque<NodeEvent>>>,
    max_events: usize,
}

impl NodeEventHistory {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(VecDeque::with_capacity(max_events.max(1)))),
            max_events: max_events.max(1),
        }
    }

    /// Append an event, dropping the oldest ones past capacity.
    pub async fn add_event(&self, event: NodeEvent) {
        let mut events = self.events.write().await;
        events.push_back(event);
        while events.len() > self.max_events {
            events.pop_front();
        }
    }

    pub async fn get_events(&self) -> Vec<NodeEvent> {
        let events = self.events.read().await;
        events.iter().cloned().collect()
    }

    /// Events recorded within the last `minutes`.
    pub async fn get_events_since(&self, minutes: i64) -> Vec<NodeEvent> {
        let events = self.events.read().await;
        let cutoff = Utc::now() - ChronoDuration::minutes(minutes);

        events
            .iter()
            .filter(|event| event.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Number of recorded nodes that did not come online.
    pub async fn failed_count(&self) -> usize {
        self.events.read().await.iter().filter(|e| !e.online).count()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl NodeNotifier for NodeEventHistory {
    async fn notify_node_tested(&self, node: &NodeRecord) {
        self.add_event(NodeEvent::from_node(node)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LinkType;

    #[tokio::test]
    async fn test_history_is_bounded() {
        let history = NodeEventHistory::new(2);
        for id in 0..3 {
            let node = NodeRecord::new(id, LinkType::Trojan, "t.example", 443, "{}");
            history.notify_node_tested(&node).await;
        }

        let events = history.get_events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].node_id, 1);
        assert_eq!(events[1].node_id, 2);
        assert_eq!(events[1].section, "trojan|t.example|443");
        assert_eq!(history.get_events_since(5).await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_count() {
        let history = NodeEventHistory::new(8);
        let mut online = NodeRecord::new(0, LinkType::Trojan, "t.example", 443, "{}");
        online.results.online = true;
        online.results.outcome = Some(TestOutcome::Success);
        history.notify_node_tested(&online).await;

        for id in 1..3 {
            let mut node = NodeRecord::new(id, LinkType::Vmess, "v.example", 443, "{}");
            node.fail(TestOutcome::NoSpeed);
            history.notify_node_tested(&node).await;
        }

        assert_eq!(history.len().await, 3);
        assert_eq!(history.failed_count().await, 2);
    }

    #[test]
    fn test_event_serialization() {
        let mut node = NodeRecord::new(4, LinkType::Vless, "v.example", 8443, "{}");
        node.fail(TestOutcome::NotReady);
        let json = serde_json::to_value(NodeEvent::from_node(&node)).unwrap();
        assert_eq!(json["outcome"], "not_ready");
        assert_eq!(json["online"], false);
        assert!(json.get("avg_speed").is_none());
    }
}
