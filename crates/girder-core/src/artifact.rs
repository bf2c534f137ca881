//! Artifact bundle types.

use crate::filters::PathRules;
use crate::ids::{BuildTypeId, BundleId, RunId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One file in a bundle or in a resolved artifact input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactEntry {
    /// Path relative to the producing workspace (or the bundle root).
    pub source: String,
    /// Path relative to the bundle root (or the consuming workspace).
    pub destination: String,
}

/// Reference to a published bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BundleRef {
    pub id: BundleId,
    pub build_type: BuildTypeId,
    pub run_id: RunId,
    pub run_counter: u64,
    pub build_number: String,
    pub branch: String,
    #[serde(default)]
    pub pinned: bool,
    pub entries: Vec<ArtifactEntry>,
    pub published_at: DateTime<Utc>,
}

impl BundleRef {
    /// Paths inside the bundle.
    pub fn paths(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.destination.clone()).collect()
    }
}

/// Request to publish a finished run's output.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub run_id: RunId,
    pub build_type: BuildTypeId,
    pub branch: String,
    pub run_counter: u64,
    pub build_number: String,
    /// Root of the run's output workspace.
    pub workspace: PathBuf,
    /// Files produced by the run, relative to `workspace`.
    pub files: Vec<String>,
    pub rules: PathRules,
}
