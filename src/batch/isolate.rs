use super::shard::ShardRuntime;
use crate::node::{NodeRecord, TestOutcome};
use crate::utils::error::{Result, SpeedtestError};
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, error, info, warn};

/// Result of bisecting a shard that failed to start.
#[derive(Debug, Default)]
pub struct Isolation {
    /// Members that started together, in their original order.
    pub valid: Vec<NodeRecord>,
    /// Isolated bad nodes and members lost to port exhaustion, already
    /// marked failed.
    pub failed: Vec<NodeRecord>,
}

impl Isolation {
    fn merge(mut self, other: Isolation) -> Self {
        self.valid.extend(other.valid);
        self.failed.extend(other.failed);
        self
    }

    fn failed(mut nodes: Vec<NodeRecord>, outcome: TestOutcome) -> Self {
        for node in &mut nodes {
            node.fail(outcome);
        }
        Self {
            valid: Vec::new(),
            failed: nodes,
        }
    }
}

/// Finds the members that keep an aggregated client from starting.
pub struct FaultIsolator<'a> {
    runtime: &'a ShardRuntime,
}

impl<'a> FaultIsolator<'a> {
    pub fn new(runtime: &'a ShardRuntime) -> Self {
        Self { runtime }
    }

    /// Bisect `nodes` until every failing half is a single node. Each
    /// attempt gets fresh ports and a config for just that subset, and the
    /// client is torn down again whatever the outcome.
    pub fn isolate(&self, nodes: Vec<NodeRecord>) -> BoxFuture<'_, Isolation> {
        async move {
            if nodes.is_empty() {
                return Isolation::default();
            }

            match self.try_start(&nodes).await {
                Ok(true) => {
                    debug!(count = nodes.len(), "Subset starts cleanly");
                    return Isolation {
                        valid: nodes,
                        failed: Vec::new(),
                    };
                }
                Ok(false) => {}
                Err(e @ SpeedtestError::PortsExhausted { .. }) => {
                    error!(count = nodes.len(), error = %e, "No ports for subset, marking it failed");
                    return Isolation::failed(nodes, TestOutcome::PortsExhausted);
                }
                Err(e) => {
                    error!(count = nodes.len(), error = %e, "Subset attempt failed, marking it failed");
                    return Isolation::failed(nodes, TestOutcome::Internal);
                }
            }

            if nodes.len() == 1 {
                let bad = &nodes[0];
                error!(node_id = bad.id, remarks = %bad.remarks, server = %bad.server, "Located invalid node");
                return Isolation::failed(nodes, TestOutcome::InvalidConfig);
            }

            let mut left = nodes;
            let right = left.split_off(left.len() / 2);
            let left = self.isolate(left).await;
            let right = self.isolate(right).await;
            left.merge(right)
        }
        .boxed()
    }

    /// Launch the subset, wait for every inbound, then tear down.
    async fn try_start(&self, nodes: &[NodeRecord]) -> Result<bool> {
        let runtime = self.runtime;
        let (ports, config) = runtime.allocate(nodes)?;
        let handle = match runtime.start(&config).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!(count = nodes.len(), error = %e, "Subset rejected");
                return Ok(false);
            }
        };
        let ready = runtime
            .all_ready(&ports, runtime.timings.isolation_ready)
            .await;
        runtime.stop(handle).await;
        Ok(ready)
    }
}

/// Run isolation over a shard and log what was removed.
pub async fn isolate_shard(runtime: &ShardRuntime, shard: Vec<NodeRecord>) -> Isolation {
    let total = shard.len();
    warn!(count = total, "Client startup failed, locating invalid nodes");
    let isolation = FaultIsolator::new(runtime).isolate(shard).await;
    info!(
        removed = isolation.failed.len(),
        remaining = isolation.valid.len(),
        total,
        "Invalid nodes removed from shard"
    );
    isolation
}
