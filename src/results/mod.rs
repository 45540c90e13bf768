//! Result sink, push notifications and the completion pipeline every
//! finished node passes through.

pub mod notify;
pub mod sink;
pub mod summary;

pub use notify::{LogNotifier, NodeEvent, NodeEventHistory, NodeNotifier};
pub use sink::{FileResultSink, PersistPolicy, ResultSink};
pub use summary::RunSummary;

use crate::node::NodeRecord;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::warn;

/// Stamps, notifies and records finished nodes, then keeps them for the
/// run summary. Each node must be completed exactly once.
pub struct Completion {
    notifiers: Vec<Arc<dyn NodeNotifier>>,
    sink: Arc<dyn ResultSink>,
    seq: AtomicU64,
    started: Instant,
    finished: Mutex<Vec<NodeRecord>>,
}

impl Completion {
    pub fn new(notifiers: Vec<Arc<dyn NodeNotifier>>, sink: Arc<dyn ResultSink>) -> Arc<Self> {
        Arc::new(Self {
            notifiers,
            sink,
            seq: AtomicU64::new(0),
            started: Instant::now(),
            finished: Mutex::new(Vec::new()),
        })
    }

    pub async fn complete(&self, mut node: NodeRecord) {
        node.results.completed_seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        node.results.completed_ms = self.started.elapsed().as_millis() as u64;

        for notifier in &self.notifiers {
            notifier.notify_node_tested(&node).await;
        }
        if let Err(e) = self.sink.record_result(&node).await {
            warn!(node_id = node.id, error = %e, "Failed to record result");
        }

        self.finished.lock().await.push(node);
    }

    pub async fn complete_all(&self, nodes: Vec<NodeRecord>) {
        for node in nodes {
            self.complete(node).await;
        }
    }

    pub async fn is_completed(&self, node_id: u32) -> bool {
        self.finished.lock().await.iter().any(|n| n.id == node_id)
    }

    pub fn completed(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Take every finished node, ordered by id.
    pub async fn take_finished(&self) -> Vec<NodeRecord> {
        let mut nodes = std::mem::take(&mut *self.finished.lock().await);
        nodes.sort_by_key(|n| n.id);
        nodes
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::utils::error::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Counts notifications and records per node id.
    #[derive(Default)]
    pub struct CountingSink {
        pub notified: StdMutex<HashMap<u32, usize>>,
        pub recorded: StdMutex<HashMap<u32, usize>>,
    }

    impl CountingSink {
        pub fn notified_once(&self, ids: impl IntoIterator<Item = u32>) -> bool {
            let notified = self.notified.lock().unwrap();
            let recorded = self.recorded.lock().unwrap();
            ids.into_iter()
                .all(|id| notified.get(&id) == Some(&1) && recorded.get(&id) == Some(&1))
        }

        pub fn total(&self) -> usize {
            self.notified.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl NodeNotifier for CountingSink {
        async fn notify_node_tested(&self, node: &NodeRecord) {
            *self.notified.lock().unwrap().entry(node.id).or_default() += 1;
        }
    }

    #[async_trait]
    impl ResultSink for CountingSink {
        async fn record_result(&self, node: &NodeRecord) -> Result<bool> {
            *self.recorded.lock().unwrap().entry(node.id).or_default() += 1;
            Ok(node.results.online)
        }
    }

    pub fn counting_completion() -> (Arc<Completion>, Arc<CountingSink>) {
        let counter = Arc::new(CountingSink::default());
        let completion = Completion::new(vec![counter.clone()], counter.clone());
        (completion, counter)
    }
}
