use super::shard::PreparedShard;
use crate::node::{NodeRecord, TestOutcome};
use crate::probe::ReadinessCheck;
use crate::protocol::ProxyEndpoint;
use crate::results::Completion;
use crate::tester::{NodeTest, TestReport};
use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Admission control for the node tests of one live shard.
pub struct Governor {
    tester: Arc<dyn NodeTest>,
    readiness: Arc<dyn ReadinessCheck>,
    completion: Arc<Completion>,
    ready_timeout: Duration,
    settle: Duration,
}

impl Governor {
    pub fn new(
        tester: Arc<dyn NodeTest>,
        readiness: Arc<dyn ReadinessCheck>,
        completion: Arc<Completion>,
        ready_timeout: Duration,
        settle: Duration,
    ) -> Self {
        Self {
            tester,
            readiness,
            completion,
            ready_timeout,
            settle,
        }
    }

    /// Test every member of `shard` with at most `concurrency` tests in
    /// flight. Every member is completed exactly once, and nothing spawned
    /// here outlives the call.
    pub async fn run(&self, shard: PreparedShard, concurrency: usize) {
        let PreparedShard { members, ports, .. } = shard;

        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        let checks = ports.iter().map(|&port| {
            let readiness = Arc::clone(&self.readiness);
            let limit = self.ready_timeout;
            async move {
                readiness
                    .wait_ready(&ProxyEndpoint::local_socks(port), limit)
                    .await
            }
        });
        let readiness = join_all(checks).await;

        let mut ready = Vec::with_capacity(members.len());
        for ((mut node, port), is_ready) in members.into_iter().zip(ports).zip(readiness) {
            if is_ready {
                ready.push((node, port));
            } else {
                warn!(node_id = node.id, port, "Inbound not ready, marking node failed");
                node.fail(TestOutcome::NotReady);
                self.completion.complete(node).await;
            }
        }
        if ready.is_empty() {
            warn!("No ready inbound ports in this shard");
            return;
        }

        info!(ready = ready.len(), concurrency, "Testing shard");
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (node, port) in ready {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let tester = Arc::clone(&self.tester);
            let completion = Arc::clone(&self.completion);

            tasks.spawn(async move {
                let endpoint = ProxyEndpoint::local_socks(port);
                let caught = run_caught(tester.as_ref(), node, endpoint).await;
                drop(permit);
                let node = match caught {
                    Ok(report) => report.into_resolved().await,
                    Err(failed) => failed,
                };
                completion.complete(node).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Node test task aborted");
            }
        }
        debug!("Shard tests joined");
    }
}

/// Run one node test, turning a panic into an `Internal` failure.
async fn run_caught(
    tester: &dyn NodeTest,
    node: NodeRecord,
    endpoint: ProxyEndpoint,
) -> std::result::Result<TestReport, NodeRecord> {
    let mut fallback = node.clone();
    match AssertUnwindSafe(tester.test_node(node, endpoint))
        .catch_unwind()
        .await
    {
        Ok(report) => Ok(report),
        Err(_) => {
            error!(node_id = fallback.id, "Node test panicked");
            fallback.fail(TestOutcome::Internal);
            Err(fallback)
        }
    }
}

/// Test a single node against an already-live endpoint and complete it.
pub async fn test_and_complete(
    tester: &dyn NodeTest,
    completion: &Completion,
    node: NodeRecord,
    endpoint: ProxyEndpoint,
) {
    let node = match run_caught(tester, node, endpoint).await {
        Ok(report) => report.into_resolved().await,
        Err(failed) => failed,
    };
    completion.complete(node).await;
}
