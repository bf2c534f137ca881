//! Dispatch records handed to an external executor.

use crate::artifact::{ArtifactEntry, BundleRef};
use crate::definition::Step;
use crate::ids::{BuildTypeId, RunId};
use crate::params::Parameters;
use crate::requirement::Requirement;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Everything an executor needs to run one build.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DispatchRecord {
    pub run_id: RunId,
    pub build_type: BuildTypeId,
    pub build_number: String,
    pub branch: String,
    pub params: Parameters,
    /// Steps in execution order with parameter references expanded.
    pub steps: Vec<Step>,
    pub artifact_inputs: Vec<ArtifactInput>,
    #[schemars(with = "Vec<String>")]
    pub requirements: Vec<Requirement>,
    pub agent: String,
}

/// Upstream bundle files to copy into the workspace before the first step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactInput {
    pub upstream: BuildTypeId,
    pub bundle: BundleRef,
    /// `source` is a bundle path, `destination` a workspace path.
    pub entries: Vec<ArtifactEntry>,
}
