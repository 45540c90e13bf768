use super::types::TestOutcome;
use std::fmt;
use std::time::Instant;
use tracing::{debug, warn};

/// Stage of a single node test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStage {
    Pending,
    PingingTcp,
    PingingSite,
    Downloading,
    Retrying,
    Uploading,
    AwaitingAsync,
    Completed,
    Failed(TestOutcome),
}

impl TestStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TestStage::Completed | TestStage::Failed(_))
    }
}

impl fmt::Display for TestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStage::Pending => f.write_str("pending"),
            TestStage::PingingTcp => f.write_str("pinging_tcp"),
            TestStage::PingingSite => f.write_str("pinging_site"),
            TestStage::Downloading => f.write_str("downloading"),
            TestStage::Retrying => f.write_str("retrying"),
            TestStage::Uploading => f.write_str("uploading"),
            TestStage::AwaitingAsync => f.write_str("awaiting_async"),
            TestStage::Completed => f.write_str("completed"),
            TestStage::Failed(outcome) => write!(f, "failed({})", outcome),
        }
    }
}

/// Tracks the stage of one node test and logs every transition, so a crash
/// report shows exactly where the node was.
#[derive(Debug)]
pub struct TestSession {
    node_id: u32,
    stage: TestStage,
    started: Instant,
}

impl TestSession {
    pub fn new(node_id: u32) -> Self {
        Self {
            node_id,
            stage: TestStage::Pending,
            started: Instant::now(),
        }
    }

    pub fn stage(&self) -> TestStage {
        self.stage
    }

    pub fn advance(&mut self, next: TestStage) {
        if self.stage.is_terminal() {
            warn!(
                node_id = self.node_id,
                from = %self.stage,
                to = %next,
                "Ignoring transition out of terminal stage"
            );
            return;
        }
        debug!(
            node_id = self.node_id,
            from = %self.stage,
            stage = %next,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Test stage transition"
        );
        self.stage = next;
    }

    pub fn fail(&mut self, outcome: TestOutcome) {
        self.advance(TestStage::Failed(outcome));
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_stage_is_sticky() {
        let mut session = TestSession::new(3);
        session.advance(TestStage::PingingTcp);
        session.fail(TestOutcome::NoConnection);
        session.advance(TestStage::Downloading);
        assert_eq!(
            session.stage(),
            TestStage::Failed(TestOutcome::NoConnection)
        );
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(TestStage::PingingSite.to_string(), "pinging_site");
        assert_eq!(
            TestStage::Failed(TestOutcome::NoSpeed).to_string(),
            "failed(no_speed)"
        );
    }
}
