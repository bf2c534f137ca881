//! Run requests, runs and their state machine.

use crate::ids::{BuildTypeId, RunId, VcsRootId};
use crate::params::Parameters;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority class. Runs are FIFO within a class.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }

    /// Allowed moves. Terminal states have none.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Queued, RunState::Running)
                | (RunState::Queued, RunState::Failed)
                | (RunState::Queued, RunState::Cancelled)
                | (RunState::Running, RunState::Succeeded)
                | (RunState::Running, RunState::Failed)
                | (RunState::Running, RunState::Cancelled)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Why a run was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCause {
    Vcs {
        vcs_root: VcsRootId,
        revisions: Vec<String>,
        committers: Vec<String>,
    },
    FinishBuild {
        upstream: BuildTypeId,
        upstream_run: RunId,
    },
    Scheduled {
        cron: String,
    },
    /// Queued as part of a downstream run's snapshot chain.
    SnapshotChain {
        downstream: BuildTypeId,
    },
    Manual {
        user: Option<String>,
    },
}

impl fmt::Display for TriggerCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerCause::Vcs { vcs_root, revisions, .. } => {
                write!(f, "vcs change in {} ({} commits)", vcs_root, revisions.len())
            }
            TriggerCause::FinishBuild { upstream, .. } => {
                write!(f, "finished build of {}", upstream)
            }
            TriggerCause::Scheduled { cron } => write!(f, "schedule {}", cron),
            TriggerCause::SnapshotChain { downstream } => {
                write!(f, "snapshot chain of {}", downstream)
            }
            TriggerCause::Manual { user: Some(user) } => write!(f, "manual by {}", user),
            TriggerCause::Manual { user: None } => f.write_str("manual"),
        }
    }
}

/// Request to run a build type on a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunRequest {
    pub build_type: BuildTypeId,
    pub branch: String,
    pub cause: TriggerCause,
    /// Custom parameters layered over the effective configuration.
    #[serde(default)]
    pub params: Parameters,
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl RunRequest {
    pub fn new(
        build_type: impl Into<BuildTypeId>,
        branch: impl Into<String>,
        cause: TriggerCause,
    ) -> Self {
        Self {
            build_type: build_type.into(),
            branch: branch.into(),
            cause,
            params: Parameters::new(),
            priority: None,
        }
    }

    pub fn manual(build_type: impl Into<BuildTypeId>, branch: impl Into<String>) -> Self {
        Self::new(build_type, branch, TriggerCause::Manual { user: None })
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Snapshot-chain binding from a run to one upstream run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UpstreamLink {
    pub build_type: BuildTypeId,
    pub run_id: RunId,
    pub on_failure: crate::definition::FailurePolicy,
}

/// Diagnostic attached to a terminal run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    /// Cascade from a failed snapshot upstream.
    UpstreamFailure {
        upstream: BuildTypeId,
        upstream_run: RunId,
    },
    NoMatchingRun {
        upstream: BuildTypeId,
        rule: String,
    },
    UnsatisfiableRequirement {
        requirements: Vec<String>,
        waited_secs: i64,
    },
    Cancelled {
        by: Option<String>,
    },
    StepFailed {
        message: String,
    },
    ArtifactPublishFailed {
        message: String,
    },
    ExecutorError {
        message: String,
    },
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::UpstreamFailure { upstream, upstream_run } => {
                write!(f, "upstream {} ({}) did not succeed", upstream, upstream_run)
            }
            TerminationReason::NoMatchingRun { upstream, rule } => {
                write!(f, "no run of {} matches {}", upstream, rule)
            }
            TerminationReason::UnsatisfiableRequirement { requirements, waited_secs } => write!(
                f,
                "no agent satisfied [{}] within {}s",
                requirements.join(", "),
                waited_secs
            ),
            TerminationReason::Cancelled { by: Some(by) } => write!(f, "cancelled by {}", by),
            TerminationReason::Cancelled { by: None } => f.write_str("cancelled"),
            TerminationReason::StepFailed { message } => write!(f, "step failed: {}", message),
            TerminationReason::ArtifactPublishFailed { message } => {
                write!(f, "artifact publishing failed: {}", message)
            }
            TerminationReason::ExecutorError { message } => {
                write!(f, "executor error: {}", message)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Run {
    pub id: RunId,
    pub build_type: BuildTypeId,
    pub branch: String,
    pub counter: u64,
    pub build_number: String,
    pub state: RunState,
    pub cause: TriggerCause,
    /// Parameter snapshot taken at enqueue time.
    pub params: Parameters,
    pub priority: Priority,
    #[serde(default)]
    pub snapshot_upstream: Vec<UpstreamLink>,
    pub agent: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub reason: Option<TerminationReason>,
}

impl Run {
    /// Move to `next`, rejecting non-monotonic transitions.
    pub fn transition(&mut self, next: RunState, at: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                run_id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        match next {
            RunState::Running => self.started_at = Some(at),
            _ if next.is_terminal() => self.finished_at = Some(at),
            _ => {}
        }
        Ok(())
    }

    /// Time between start and finish. None for runs that never started.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        u64::try_from((finished - started).num_milliseconds()).ok()
    }
}
