//! Build definition types.
//!
//! These types are the declarative configuration boundary: a
//! [`DefinitionSet`] is produced by an authoring tool and loaded into a
//! [`crate::registry::Registry`] once per configuration reload.

use crate::filters::{BranchFilter, PathRules};
use crate::ids::{BuildTypeId, ProjectId, RunId, TemplateId, VcsRootId};
use crate::params::Parameters;
use crate::requirement::Requirement;
use crate::run::Priority;
use crate::{Error, Result};
use cron::Schedule;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Build number pattern used when neither build type nor template sets one.
pub const DEFAULT_BUILD_NUMBER_PATTERN: &str = "%build.counter%";

/// Everything loaded in one configuration reload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DefinitionSet {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub vcs_roots: Vec<VcsRoot>,
    #[serde(default)]
    pub templates: Vec<BuildTemplate>,
    #[serde(default)]
    pub build_types: Vec<BuildType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub parent: Option<ProjectId>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub params: Parameters,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VcsRoot {
    pub id: VcsRootId,
    pub project: ProjectId,
    pub name: String,
    pub url: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default)]
    #[schemars(with = "String")]
    pub branch_spec: BranchFilter,
    #[serde(default)]
    pub auth: Option<AuthReference>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl VcsRoot {
    /// Whether the root follows `branch`. The default branch is always
    /// followed; an empty branch specification follows nothing else.
    pub fn tracks(&self, branch: &str) -> bool {
        branch == self.default_branch
            || (!self.branch_spec.is_empty()
                && self
                    .branch_spec
                    .matches_with_default(branch, Some(&self.default_branch)))
    }
}

/// Reference to a credential held by an external secret store.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuthReference {
    pub kind: AuthKind,
    #[serde(default)]
    pub username: Option<String>,
    /// Name of the credential in the external store.
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Anonymous,
    Password,
    Token,
    SshKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    pub name: String,
    #[serde(default = "default_runner")]
    pub runner: String,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub params: Parameters,
    #[serde(default)]
    pub working_directory: Option<String>,
}

fn default_runner() -> String {
    "script".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct BuildTemplate {
    pub id: TemplateId,
    pub project: ProjectId,
    pub name: String,
    #[serde(default)]
    pub params: Parameters,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    #[schemars(with = "Vec<String>")]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    #[schemars(with = "String")]
    pub artifact_rules: PathRules,
    #[serde(default)]
    pub build_number_pattern: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct BuildType {
    pub id: BuildTypeId,
    pub project: ProjectId,
    pub name: String,
    #[serde(default)]
    pub template: Option<TemplateId>,
    /// Own parameters, overriding template and project values.
    #[serde(default)]
    pub params: Parameters,
    #[serde(default)]
    pub vcs_roots: Vec<VcsRootId>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    #[schemars(with = "Vec<String>")]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    #[schemars(with = "String")]
    pub artifact_rules: PathRules,
    #[serde(default)]
    pub build_number_pattern: Option<String>,
    /// Priority class for runs of this build type; requests may override.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Paused build types accept no trigger or manual requests.
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dependency {
    Snapshot(SnapshotDependency),
    Artifact(ArtifactDependency),
}

impl Dependency {
    pub fn upstream(&self) -> &BuildTypeId {
        match self {
            Dependency::Snapshot(d) => &d.upstream,
            Dependency::Artifact(d) => &d.upstream,
        }
    }

    pub fn kind(&self) -> DependencyKind {
        match self {
            Dependency::Snapshot(_) => DependencyKind::Snapshot,
            Dependency::Artifact(_) => DependencyKind::Artifact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    Snapshot,
    Artifact,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKind::Snapshot => f.write_str("snapshot"),
            DependencyKind::Artifact => f.write_str("artifact"),
        }
    }
}

/// Ordering constraint: the upstream must succeed first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SnapshotDependency {
    pub upstream: BuildTypeId,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Bind to the last successful upstream run instead of queueing a new one.
    #[serde(default)]
    pub reuse_builds: bool,
}

/// What a downstream run does when its snapshot upstream fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Cancel the downstream run, transitively.
    #[default]
    Cancel,
    /// Fail the downstream run without starting it.
    FailToStart,
    /// Run regardless.
    Ignore,
}

/// Data constraint: upstream output is copied into the workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactDependency {
    pub upstream: BuildTypeId,
    #[serde(default)]
    pub selection: SelectionRule,
    #[serde(default)]
    #[schemars(with = "String")]
    pub branch_filter: BranchFilter,
    #[serde(default)]
    #[schemars(with = "String")]
    pub rules: PathRules,
    #[serde(default = "default_true")]
    pub mandatory: bool,
}

fn default_true() -> bool {
    true
}

/// Which upstream run an artifact dependency takes its bundle from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum SelectionRule {
    #[default]
    LastSuccessful,
    LastPinned,
    /// The upstream run bound through the snapshot chain.
    SameChain,
    BuildNumber {
        number: String,
    },
    Run {
        run_id: RunId,
    },
}

impl fmt::Display for SelectionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionRule::LastSuccessful => f.write_str("last successful"),
            SelectionRule::LastPinned => f.write_str("last pinned"),
            SelectionRule::SameChain => f.write_str("same chain"),
            SelectionRule::BuildNumber { number } => write!(f, "build number {}", number),
            SelectionRule::Run { run_id } => write!(f, "run {}", run_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Vcs(VcsTrigger),
    FinishBuild(FinishBuildTrigger),
    Scheduled(ScheduledTrigger),
}

impl Trigger {
    pub fn branch_filter(&self) -> &BranchFilter {
        match self {
            Trigger::Vcs(t) => &t.branch_filter,
            Trigger::FinishBuild(t) => &t.branch_filter,
            Trigger::Scheduled(t) => &t.branch_filter,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VcsTrigger {
    #[serde(default)]
    #[schemars(with = "String")]
    pub branch_filter: BranchFilter,
    /// Path rules a change must touch to qualify.
    #[serde(default)]
    #[schemars(with = "String")]
    pub rules: PathRules,
    /// Wait this long without new commits before firing.
    #[serde(default)]
    pub quiet_period_secs: u64,
    #[serde(default)]
    pub group_by_committer: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FinishBuildTrigger {
    pub upstream: BuildTypeId,
    #[serde(default)]
    #[schemars(with = "String")]
    pub branch_filter: BranchFilter,
    #[serde(default = "default_true")]
    pub successful_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScheduledTrigger {
    /// Cron expression with a seconds field, e.g. `0 0 2 * * *`.
    pub cron: String,
    #[serde(default)]
    #[schemars(with = "String")]
    pub branch_filter: BranchFilter,
    #[serde(default)]
    pub only_if_changes: bool,
}

impl ScheduledTrigger {
    /// Parse the cron expression. Seconds come first.
    pub fn schedule(&self, build_type: &BuildTypeId) -> Result<Schedule> {
        Schedule::from_str(&self.cron).map_err(|e| Error::InvalidSchedule {
            build_type: build_type.clone(),
            expression: self.cron.clone(),
            reason: e.to_string(),
        })
    }
}

/// Resolved view of a build type: template and overrides merged on read.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub build_type: BuildTypeId,
    pub name: String,
    pub project: ProjectId,
    pub template: Option<TemplateId>,
    pub params: Parameters,
    pub vcs_roots: Vec<VcsRootId>,
    pub steps: Vec<Step>,
    pub triggers: Vec<Trigger>,
    pub dependencies: Vec<Dependency>,
    pub requirements: Vec<Requirement>,
    pub artifact_rules: PathRules,
    pub build_number_pattern: String,
    pub priority: Option<Priority>,
    pub paused: bool,
}

impl EffectiveConfig {
    pub fn snapshot_dependencies(&self) -> impl Iterator<Item = &SnapshotDependency> {
        self.dependencies.iter().filter_map(|d| match d {
            Dependency::Snapshot(s) => Some(s),
            Dependency::Artifact(_) => None,
        })
    }

    pub fn artifact_dependencies(&self) -> impl Iterator<Item = &ArtifactDependency> {
        self.dependencies.iter().filter_map(|d| match d {
            Dependency::Artifact(a) => Some(a),
            Dependency::Snapshot(_) => None,
        })
    }
}
