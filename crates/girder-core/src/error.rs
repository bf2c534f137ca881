//! Error types for Girder.

use crate::ids::{BuildTypeId, ProjectId, RunId, TemplateId, VcsRootId};
use crate::run::RunState;
use std::fmt;
use thiserror::Error;

/// Kind of entity registered in the definition namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Project,
    VcsRoot,
    Template,
    BuildType,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Project => "project",
            EntityKind::VcsRoot => "VCS root",
            EntityKind::Template => "template",
            EntityKind::BuildType => "build type",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("Build type {build_type} references missing template {template}")]
    MissingTemplate {
        build_type: BuildTypeId,
        template: TemplateId,
    },

    #[error("Duplicate id {id}: {kind} collides with an existing {existing}")]
    DuplicateId {
        id: String,
        kind: EntityKind,
        existing: EntityKind,
    },

    #[error("Dependency cycle: {}", join_ids(.0))]
    Cycle(Vec<BuildTypeId>),

    #[error("Build type {build_type} depends on unknown build type {upstream}")]
    UnknownDependency {
        build_type: BuildTypeId,
        upstream: BuildTypeId,
    },

    #[error("{owner} references unknown VCS root {vcs_root}")]
    UnknownVcsRoot { owner: String, vcs_root: VcsRootId },

    #[error("{owner} belongs to unknown project {project}")]
    UnknownProject { owner: String, project: ProjectId },

    #[error("Invalid dependency in {build_type}: {reason}")]
    InvalidDependency {
        build_type: BuildTypeId,
        reason: String,
    },

    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid requirement {0:?}")]
    InvalidRequirement(String),

    #[error("Invalid schedule {expression:?} in {build_type}: {reason}")]
    InvalidSchedule {
        build_type: BuildTypeId,
        expression: String,
        reason: String,
    },

    #[error("Build type not found: {0}")]
    BuildTypeNotFound(BuildTypeId),

    #[error("Build type is paused: {0}")]
    BuildTypePaused(BuildTypeId),

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunState,
        to: RunState,
    },

    #[error("No run of {upstream} matches {rule} for {build_type}")]
    NoMatchingRun {
        build_type: BuildTypeId,
        upstream: BuildTypeId,
        rule: String,
    },

    #[error("No agent satisfies requirements of run {run_id}: {requirements}")]
    UnsatisfiableRequirement { run_id: RunId, requirements: String },

    // Infrastructure errors
    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors raised while loading definitions. These never reach run time.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::MissingTemplate { .. }
                | Error::DuplicateId { .. }
                | Error::Cycle(_)
                | Error::UnknownDependency { .. }
                | Error::UnknownVcsRoot { .. }
                | Error::UnknownProject { .. }
                | Error::InvalidDependency { .. }
                | Error::InvalidPattern { .. }
                | Error::InvalidRequirement(_)
                | Error::InvalidSchedule { .. }
        )
    }
}

fn join_ids(ids: &[BuildTypeId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_ids_in_order() {
        let err = Error::Cycle(vec!["A".into(), "B".into(), "A".into()]);
        assert_eq!(err.to_string(), "Dependency cycle: A -> B -> A");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_runtime_errors_are_not_configuration() {
        let err = Error::RunNotFound(RunId::new());
        assert!(!err.is_configuration());
    }
}
