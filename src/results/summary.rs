use crate::node::{NodeRecord, TestOutcome};
use crate::utils::format::format_bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

/// Totals reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub online: usize,
    pub traffic_bytes: u64,
    /// Failed nodes per outcome code.
    pub failures: BTreeMap<String, usize>,
}

impl RunSummary {
    pub fn from_nodes(nodes: &[NodeRecord]) -> Self {
        let mut summary = Self {
            total: nodes.len(),
            ..Self::default()
        };
        for node in nodes {
            summary.traffic_bytes += node.results.total_recv_bytes;
            if node.results.online {
                summary.online += 1;
            } else {
                let outcome = node.results.outcome.unwrap_or(TestOutcome::Internal);
                *summary.failures.entry(outcome.to_string()).or_default() += 1;
            }
        }
        summary
    }

    pub fn log(&self) {
        info!(
            total = self.total,
            online = self.online,
            traffic = %format_bytes(self.traffic_bytes as f64),
            failures = ?self.failures,
            "All nodes tested"
        );
    }
}
