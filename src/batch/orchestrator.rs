use super::aggregate::partition_extractable;
use super::governor::{test_and_complete, Governor};
use super::isolate::isolate_shard;
use super::shard::{PreparedShard, ShardPlan, ShardRuntime};
use crate::client::{ClientHandle, ClientKind, ClientLauncher};
use crate::config::BatchConfig;
use crate::node::{NodeRecord, TestOutcome};
use crate::protocol::ProxyEndpoint;
use crate::results::{Completion, RunSummary};
use crate::tester::NodeTest;
use crate::utils::error::SpeedtestError;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};

/// Every node of a run, in id order, plus the totals.
#[derive(Debug)]
pub struct BatchReport {
    pub nodes: Vec<NodeRecord>,
    pub summary: RunSummary,
}

/// Kills every client the launcher started when dropped.
struct ClientTeardown(Arc<dyn ClientLauncher>);

impl Drop for ClientTeardown {
    fn drop(&mut self) {
        self.0.terminate_all();
    }
}

/// Drives a whole run: aggregatable nodes through shards, everything else
/// one at a time.
pub struct BatchRunner {
    runtime: ShardRuntime,
    governor: Governor,
    tester: Arc<dyn NodeTest>,
    completion: Arc<Completion>,
    batch: BatchConfig,
    legacy_ready: Duration,
}

impl BatchRunner {
    pub fn new(
        runtime: ShardRuntime,
        tester: Arc<dyn NodeTest>,
        completion: Arc<Completion>,
        batch: BatchConfig,
        legacy_ready: Duration,
    ) -> Self {
        let governor = Governor::new(
            Arc::clone(&tester),
            Arc::clone(&runtime.readiness),
            Arc::clone(&completion),
            runtime.timings.shard_ready,
            runtime.timings.settle,
        );
        Self {
            runtime,
            governor,
            tester,
            completion,
            batch,
            legacy_ready,
        }
    }

    pub async fn batch_test(&self, nodes: Vec<NodeRecord>) -> BatchReport {
        let _teardown = ClientTeardown(Arc::clone(&self.runtime.launcher));

        if nodes.is_empty() {
            warn!("No nodes to test");
        } else {
            info!(total = nodes.len(), "Speedtest will now begin");
        }

        let (aggregatable, others): (Vec<_>, Vec<_>) = nodes
            .into_iter()
            .partition(|node| node.link_type.is_aggregatable());

        if !aggregatable.is_empty() {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(0);
            let plan = ShardPlan::resolve(&self.batch, aggregatable.len(), cpus);
            info!(
                nodes = aggregatable.len(),
                shard_size = plan.shard_size,
                concurrency = plan.concurrency,
                "Testing aggregatable nodes in shards"
            );
            self.test_shards(aggregatable, plan).await;
        }

        for node in others {
            self.test_guarded(node).await;
        }

        let nodes = self.completion.take_finished().await;
        let summary = RunSummary::from_nodes(&nodes);
        summary.log();
        BatchReport { nodes, summary }
    }

    async fn test_shards(&self, nodes: Vec<NodeRecord>, plan: ShardPlan) {
        for (index, shard) in plan.split(nodes).into_iter().enumerate() {
            let fallback = shard.clone();
            let span = info_span!("shard", shard = index, size = shard.len());
            let run = AssertUnwindSafe(self.test_shard(shard, plan.concurrency))
                .catch_unwind()
                .instrument(span)
                .await;

            if run.is_err() {
                error!(shard = index, "Shard iteration panicked, failing unfinished nodes");
                self.runtime.launcher.terminate_all();
                for mut node in fallback {
                    if !self.completion.is_completed(node.id).await {
                        node.fail(TestOutcome::Internal);
                        self.completion.complete(node).await;
                    }
                }
            }
        }
    }

    async fn test_guarded(&self, node: NodeRecord) {
        let fallback = node.clone();
        let span = info_span!("node", node_id = node.id);
        let run = AssertUnwindSafe(self.test_single(node))
            .catch_unwind()
            .instrument(span)
            .await;

        if run.is_err() {
            error!(node_id = fallback.id, "Node test panicked, failing node");
            self.runtime.launcher.terminate_all();
            if !self.completion.is_completed(fallback.id).await {
                let mut node = fallback;
                node.fail(TestOutcome::Internal);
                self.completion.complete(node).await;
            }
        }
    }

    async fn fail_all(&self, nodes: Vec<NodeRecord>, outcome: TestOutcome) {
        for mut node in nodes {
            node.fail(outcome);
            self.completion.complete(node).await;
        }
    }

    fn prepare_failure_outcome(error: &SpeedtestError) -> TestOutcome {
        match error {
            SpeedtestError::PortsExhausted { .. } => TestOutcome::PortsExhausted,
            SpeedtestError::MissingOutbound(_) => TestOutcome::InvalidConfig,
            _ => TestOutcome::Internal,
        }
    }

    async fn prepare(&self, members: Vec<NodeRecord>) -> Option<PreparedShard> {
        match self.runtime.prepare(members) {
            Ok(prepared) => Some(prepared),
            Err((members, e)) => {
                error!(count = members.len(), error = %e, "Cannot prepare shard, marking nodes failed");
                self.fail_all(members, Self::prepare_failure_outcome(&e))
                    .await;
                None
            }
        }
    }

    async fn test_shard(&self, shard: Vec<NodeRecord>, concurrency: usize) {
        let (members, broken) = partition_extractable(shard);
        self.fail_all(broken, TestOutcome::InvalidConfig).await;
        if members.is_empty() {
            return;
        }

        let Some(prepared) = self.prepare(members).await else {
            return;
        };
        let prepared = match self.runtime.start(&prepared.config).await {
            Ok(handle) => {
                self.run_live(prepared, handle, concurrency).await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "Shard client failed to start");
                prepared
            }
        };

        let isolation = isolate_shard(&self.runtime, prepared.members).await;
        self.completion.complete_all(isolation.failed).await;
        if isolation.valid.is_empty() {
            error!("Shard has no valid nodes after removal");
            return;
        }

        let Some(prepared) = self.prepare(isolation.valid).await else {
            return;
        };
        match self.runtime.start(&prepared.config).await {
            Ok(handle) => self.run_live(prepared, handle, concurrency).await,
            Err(e) => {
                error!(
                    count = prepared.members.len(),
                    error = %e,
                    "Client startup still failed after removing invalid nodes"
                );
                self.fail_all(prepared.members, TestOutcome::ClientStartup)
                    .await;
            }
        }
    }

    async fn run_live(&self, prepared: PreparedShard, handle: ClientHandle, concurrency: usize) {
        self.governor.run(prepared, concurrency).await;
        self.runtime.stop(handle).await;
    }

    /// Legacy protocols get their own client on the base port; SOCKS and
    /// HTTP nodes are tested directly.
    async fn test_single(&self, mut node: NodeRecord) {
        if let Some(endpoint) = node.direct_endpoint() {
            test_and_complete(self.tester.as_ref(), &self.completion, node, endpoint).await;
            return;
        }

        let Some(kind) = ClientKind::for_link(node.link_type) else {
            warn!(link_type = %node.link_type, "No client for protocol");
            node.fail(TestOutcome::InvalidConfig);
            self.completion.complete(node).await;
            return;
        };

        let launcher = &self.runtime.launcher;
        if !launcher.validate(kind, &node.rendered_config).await {
            warn!(client = %kind, "Client rejected node config");
            node.fail(TestOutcome::InvalidConfig);
            self.completion.complete(node).await;
            return;
        }
        let handle = match launcher.launch(kind, &node.rendered_config).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(client = %kind, error = %e, "Client failed to start");
                node.fail(TestOutcome::ClientStartup);
                self.completion.complete(node).await;
                return;
            }
        };

        let endpoint = ProxyEndpoint::local_socks(self.batch.base_port);
        if self
            .runtime
            .readiness
            .wait_ready(&endpoint, self.legacy_ready)
            .await
        {
            test_and_complete(self.tester.as_ref(), &self.completion, node, endpoint).await;
        } else {
            warn!(port = endpoint.port, "Client inbound never became ready");
            node.fail(TestOutcome::NotReady);
            self.completion.complete(node).await;
        }
        self.runtime.stop(handle).await;
    }
}
