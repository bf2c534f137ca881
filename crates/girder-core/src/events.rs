//! Inbound notifications and outbound status events.

use crate::ids::{BuildTypeId, BundleId, RunId, VcsRootId};
use crate::run::{RunState, TerminationReason, TriggerCause};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// === Inbound ===

/// A commit reported by the VCS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Commit {
    pub revision: String,
    pub committer: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Commit set pushed to one branch of a VCS root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VcsChangeEvent {
    pub vcs_root: VcsRootId,
    pub branch: String,
    pub commits: Vec<Commit>,
}

/// A run reached a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BuildFinishedEvent {
    pub build_type: BuildTypeId,
    pub run_id: RunId,
    pub branch: String,
    pub state: RunState,
}

// === Outbound ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TriggerFired(TriggerFiredPayload),
    RunQueued(RunQueuedPayload),
    RunStarted(RunStartedPayload),
    RunFinished(RunFinishedPayload),
    RunCancelled(RunCancelledPayload),
    ArtifactsPublished(ArtifactsPublishedPayload),
}

impl Event {
    /// Subject the event is published under.
    pub fn subject(&self) -> String {
        match self {
            Event::TriggerFired(p) => format!("trigger.fired.{}", p.build_type),
            Event::RunQueued(p) => format!("run.queued.{}", p.build_type),
            Event::RunStarted(p) => format!("run.started.{}.{}", p.build_type, p.run_id),
            Event::RunFinished(p) => format!("run.finished.{}.{}", p.build_type, p.run_id),
            Event::RunCancelled(p) => format!("run.cancelled.{}.{}", p.build_type, p.run_id),
            Event::ArtifactsPublished(p) => format!("artifacts.published.{}", p.build_type),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerFiredPayload {
    pub build_type: BuildTypeId,
    pub trigger_index: usize,
    pub branch: String,
    pub cause: TriggerCause,
    pub fired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunQueuedPayload {
    pub run_id: RunId,
    pub build_type: BuildTypeId,
    pub branch: String,
    pub build_number: String,
    pub cause: TriggerCause,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub build_type: BuildTypeId,
    pub agent: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunFinishedPayload {
    pub run_id: RunId,
    pub build_type: BuildTypeId,
    pub branch: String,
    pub state: RunState,
    pub reason: Option<TerminationReason>,
    pub duration_ms: Option<u64>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCancelledPayload {
    pub run_id: RunId,
    pub build_type: BuildTypeId,
    pub reason: TerminationReason,
    /// Whether the executor was signalled.
    pub was_running: bool,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactsPublishedPayload {
    pub run_id: RunId,
    pub build_type: BuildTypeId,
    pub bundle_id: BundleId,
    pub file_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects() {
        let run_id = RunId::new();
        let event = Event::RunStarted(RunStartedPayload {
            run_id,
            build_type: "Lib".into(),
            agent: "win-01".to_string(),
            started_at: Utc::now(),
        });
        assert_eq!(event.subject(), format!("run.started.Lib.{}", run_id));
    }

    #[test]
    fn test_event_is_tagged() {
        let event = Event::ArtifactsPublished(ArtifactsPublishedPayload {
            run_id: RunId::new(),
            build_type: "Lib".into(),
            bundle_id: BundleId::new(),
            file_count: 3,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "artifacts_published");
        assert_eq!(json["file_count"], 3);
    }
}
