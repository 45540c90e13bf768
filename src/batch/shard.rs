use super::aggregate::AggregatedConfig;
use super::ports::PortAllocator;
use crate::client::{ClientHandle, ClientKind, ClientLauncher};
use crate::config::{BatchConfig, ProbeConfig};
use crate::node::NodeRecord;
use crate::probe::ReadinessCheck;
use crate::protocol::ProxyEndpoint;
use crate::utils::error::{Result, SpeedtestError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const FALLBACK_THRESHOLD: usize = 512;
const FALLBACK_WORKERS: usize = 8;

/// Shard size and per-shard concurrency for one protocol group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPlan {
    pub shard_size: usize,
    pub concurrency: usize,
}

impl ShardPlan {
    /// Non-positive settings inherit from `parallel_threshold` and
    /// `worker_count` (or twice the CPU count). Shard size never exceeds the
    /// group, concurrency never exceeds the shard.
    pub fn resolve(batch: &BatchConfig, group_len: usize, cpus: usize) -> Self {
        let threshold = if batch.parallel_threshold > 0 {
            batch.parallel_threshold
        } else {
            FALLBACK_THRESHOLD
        };
        let workers = if batch.worker_count > 0 {
            batch.worker_count
        } else if cpus > 0 {
            cpus * 2
        } else {
            FALLBACK_WORKERS
        };

        let mut shard_size = if batch.shard_size <= 0 {
            threshold
        } else {
            batch.shard_size as usize
        };
        let mut concurrency = if batch.concurrency <= 0 {
            workers
        } else {
            batch.concurrency as usize
        };

        shard_size = shard_size.max(1);
        concurrency = concurrency.max(1);
        if group_len > 0 && shard_size >= group_len {
            shard_size = group_len;
        }
        concurrency = concurrency.min(shard_size);

        Self {
            shard_size,
            concurrency,
        }
    }

    /// Consecutive shards of at most `shard_size` nodes, order preserved.
    pub fn split(&self, nodes: Vec<NodeRecord>) -> Vec<Vec<NodeRecord>> {
        let mut shards = Vec::with_capacity(nodes.len().div_ceil(self.shard_size));
        let mut current = Vec::with_capacity(self.shard_size);
        for node in nodes {
            current.push(node);
            if current.len() == self.shard_size {
                shards.push(std::mem::replace(
                    &mut current,
                    Vec::with_capacity(self.shard_size),
                ));
            }
        }
        if !current.is_empty() {
            shards.push(current);
        }
        shards
    }
}

/// Shard members with their ports and the config fronting them.
#[derive(Debug)]
pub struct PreparedShard {
    pub members: Vec<NodeRecord>,
    pub ports: Vec<u16>,
    pub config: AggregatedConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct ShardTimings {
    pub shard_ready: Duration,
    pub isolation_ready: Duration,
    /// Pause between launch and the first readiness probe.
    pub settle: Duration,
    /// Pause after a kill before the ports are reused.
    pub teardown: Duration,
}

impl ShardTimings {
    pub fn from_config(probe: &ProbeConfig) -> Self {
        Self {
            shard_ready: Duration::from_millis(probe.shard_ready_timeout_ms),
            isolation_ready: Duration::from_millis(probe.isolation_ready_timeout_ms),
            settle: Duration::from_millis(probe.shard_settle_ms),
            teardown: Duration::from_millis(probe.teardown_settle_ms),
        }
    }
}

/// What a shard needs from the outside world: a client launcher, a
/// readiness check and a port source.
pub struct ShardRuntime {
    pub launcher: Arc<dyn ClientLauncher>,
    pub readiness: Arc<dyn ReadinessCheck>,
    pub allocator: PortAllocator,
    pub timings: ShardTimings,
}

impl ShardRuntime {
    /// Allocate one port per member and build their aggregated config.
    pub fn allocate(&self, members: &[NodeRecord]) -> Result<(Vec<u16>, AggregatedConfig)> {
        let ports = self.allocator.allocate(members.len())?;
        let config = AggregatedConfig::build(members, &ports)?;
        Ok((ports, config))
    }

    /// Like `allocate`, but hands the members back on failure.
    pub fn prepare(
        &self,
        members: Vec<NodeRecord>,
    ) -> std::result::Result<PreparedShard, (Vec<NodeRecord>, SpeedtestError)> {
        match self.allocate(&members) {
            Ok((ports, config)) => Ok(PreparedShard {
                members,
                ports,
                config,
            }),
            Err(e) => Err((members, e)),
        }
    }

    /// Validate then launch the aggregating client.
    pub async fn start(&self, config: &AggregatedConfig) -> Result<ClientHandle> {
        let kind = ClientKind::V2ray;
        let json = config.to_json();
        if !self.launcher.validate(kind, &json).await {
            return Err(SpeedtestError::ClientValidation(kind.to_string()));
        }
        self.launcher.launch(kind, &json).await
    }

    pub async fn stop(&self, handle: ClientHandle) {
        self.launcher.terminate(handle).await;
        if !self.timings.teardown.is_zero() {
            tokio::time::sleep(self.timings.teardown).await;
        }
    }

    /// True when every port answers a handshake within `limit`. Stops at the
    /// first port that does not.
    pub async fn all_ready(&self, ports: &[u16], limit: Duration) -> bool {
        for &port in ports {
            if !self
                .readiness
                .wait_ready(&ProxyEndpoint::local_socks(port), limit)
                .await
            {
                warn!(port, "Inbound not ready");
                return false;
            }
        }
        debug!(count = ports.len(), "All inbounds ready");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LinkType;

    fn batch(shard_size: i64, concurrency: i64) -> BatchConfig {
        BatchConfig {
            shard_size,
            concurrency,
            parallel_threshold: 0,
            worker_count: 0,
            ..BatchConfig::default()
        }
    }

    #[test]
    fn test_split_sizes() {
        let nodes: Vec<NodeRecord> = (1..=10)
            .map(|id| NodeRecord::new(id, LinkType::Vless, "v", 443, "{}"))
            .collect();
        let plan = ShardPlan::resolve(&batch(4, 2), nodes.len(), 4);
        let shards = plan.split(nodes);

        let sizes: Vec<usize> = shards.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(shards[1][0].id, 5);
        assert!(plan.split(Vec::new()).is_empty());
    }

    #[test]
    fn test_resolve_inherits_and_clamps() {
        let plan = ShardPlan::resolve(&batch(0, 0), 2000, 4);
        assert_eq!(plan.shard_size, 512);
        assert_eq!(plan.concurrency, 8);

        let mut cfg = batch(-1, -1);
        cfg.parallel_threshold = 64;
        cfg.worker_count = 100;
        let plan = ShardPlan::resolve(&cfg, 2000, 4);
        assert_eq!(plan.shard_size, 64);
        assert_eq!(plan.concurrency, 64);

        let plan = ShardPlan::resolve(&batch(1024, 256), 10, 4);
        assert_eq!(plan.shard_size, 10);
        assert_eq!(plan.concurrency, 10);

        let plan = ShardPlan::resolve(&batch(0, 0), 100, 0);
        assert_eq!(plan.concurrency, FALLBACK_WORKERS);
    }
}
