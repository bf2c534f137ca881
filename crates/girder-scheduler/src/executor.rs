//! Executor port and cooperative cancellation.

use async_trait::async_trait;
use girder_core::Result;
use girder_core::dispatch::DispatchRecord;
use girder_core::ids::BuildTypeId;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

/// Cancellation signal handed to an executor with each dispatch.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Never resolves if the
    /// scheduler drops the run without cancelling it.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Scheduler side of a [`CancelSignal`].
#[derive(Debug)]
pub(crate) struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub(crate) fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelSignal { rx })
    }

    pub(crate) fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    /// A build step failed.
    Failed,
    /// The executor stopped after a cancel signal.
    Cancelled,
    /// The executor itself broke down.
    Errored,
}

/// What an executor reports when a run ends.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    /// Directory holding the run's output files.
    pub workspace: PathBuf,
    /// Output files relative to `workspace`.
    pub files: Vec<String>,
    pub message: Option<String>,
}

impl ExecutionReport {
    pub fn succeeded(workspace: impl Into<PathBuf>, files: Vec<String>) -> Self {
        Self {
            outcome: ExecutionOutcome::Succeeded,
            workspace: workspace.into(),
            files,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::ended(ExecutionOutcome::Failed, Some(message.into()))
    }

    pub fn cancelled() -> Self {
        Self::ended(ExecutionOutcome::Cancelled, None)
    }

    pub fn errored(message: impl Into<String>) -> Self {
        Self::ended(ExecutionOutcome::Errored, Some(message.into()))
    }

    fn ended(outcome: ExecutionOutcome, message: Option<String>) -> Self {
        Self {
            outcome,
            workspace: PathBuf::new(),
            files: Vec::new(),
            message,
        }
    }
}

/// Runs dispatched builds. Implemented outside the core.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        dispatch: DispatchRecord,
        cancel: CancelSignal,
    ) -> Result<ExecutionReport>;
}

/// Executor that runs nothing and reports scripted results.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    outputs: HashMap<BuildTypeId, Vec<String>>,
    failing: HashSet<BuildTypeId>,
    delay: Duration,
    executed: Mutex<Vec<DispatchRecord>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files a build type reports as output.
    pub fn with_output(mut self, build_type: impl Into<BuildTypeId>, files: Vec<String>) -> Self {
        self.outputs.insert(build_type.into(), files);
        self
    }

    /// Make every run of a build type fail.
    pub fn failing(mut self, build_type: impl Into<BuildTypeId>) -> Self {
        self.failing.insert(build_type.into());
        self
    }

    /// Pretend each run takes this long.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Dispatch records received so far, in order.
    pub async fn executed(&self) -> Vec<DispatchRecord> {
        self.executed.lock().await.clone()
    }
}

#[async_trait]
impl Executor for DryRunExecutor {
    async fn execute(
        &self,
        dispatch: DispatchRecord,
        mut cancel: CancelSignal,
    ) -> Result<ExecutionReport> {
        info!(
            run_id = %dispatch.run_id,
            build_type = %dispatch.build_type,
            agent = %dispatch.agent,
            steps = dispatch.steps.len(),
            "Dry run"
        );
        let build_type = dispatch.build_type.clone();
        self.executed.lock().await.push(dispatch);

        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => {
                    debug!(build_type = %build_type, "Dry run cancelled");
                    return Ok(ExecutionReport::cancelled());
                }
            }
        }
        if cancel.is_cancelled() {
            return Ok(ExecutionReport::cancelled());
        }
        if self.failing.contains(&build_type) {
            return Ok(ExecutionReport::failed("scripted failure"));
        }

        let files = self.outputs.get(&build_type).cloned().unwrap_or_default();
        Ok(ExecutionReport::succeeded(PathBuf::new(), files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_signal_resolves_after_cancel() {
        let (handle, mut signal) = CancelHandle::new();
        assert!(!signal.is_cancelled());
        handle.cancel();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiting_executor() {
        let (handle, mut signal) = CancelHandle::new();
        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
            true
        });
        tokio::task::yield_now().await;
        handle.cancel();
        assert!(waiter.await.unwrap());
    }
}
