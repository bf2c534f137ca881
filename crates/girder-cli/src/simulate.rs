//! Scripted simulation against a dry-run executor.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use girder_artifacts::MemoryArtifactStore;
use girder_core::agent::AgentInfo;
use girder_core::events::{BuildFinishedEvent, Event, VcsChangeEvent};
use girder_core::ids::BuildTypeId;
use girder_core::params::Parameters;
use girder_core::registry::Registry;
use girder_core::run::{Priority, Run, RunRequest, TriggerCause};
use girder_scheduler::bus::BroadcastEventBus;
use girder_scheduler::clock::ManualClock;
use girder_scheduler::{Dispatcher, DispatcherConfig, DryRunExecutor, Scheduler, SchedulerConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// A simulation script.
#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    /// Agents offered for dispatch.
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentInfo>,
    /// Files each build type reports as output.
    #[serde(default)]
    pub outputs: BTreeMap<BuildTypeId, Vec<String>>,
    /// Build types whose runs fail.
    #[serde(default)]
    pub failing: Vec<BuildTypeId>,
    /// Simulated start time. Defaults to now.
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    pub steps: Vec<ScriptStep>,
}

fn default_agents() -> Vec<AgentInfo> {
    vec![AgentInfo::new("agent-1")]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScriptStep {
    VcsChange(VcsChangeEvent),
    BuildFinished(BuildFinishedEvent),
    Request {
        build_type: BuildTypeId,
        branch: String,
        #[serde(default)]
        priority: Option<Priority>,
        #[serde(default)]
        params: Parameters,
    },
    /// Move the clock forward and tick the scheduler.
    Advance { secs: i64 },
}

/// What a simulation produced.
#[derive(Debug)]
pub struct Outcome {
    pub runs: Vec<Run>,
    pub events: Vec<Event>,
}

/// Run every step, letting the dispatcher drain the queue after each one.
pub async fn simulate(
    registry: Registry,
    script: Script,
    config: SchedulerConfig,
) -> Result<Outcome> {
    let clock = Arc::new(ManualClock::new(script.start.unwrap_or_else(Utc::now)));
    let bus = BroadcastEventBus::new();
    let scheduler = Arc::new(Scheduler::with_clock(
        Arc::new(registry),
        Arc::new(MemoryArtifactStore::new()),
        Arc::new(bus.clone()),
        config,
        clock.clone(),
    )?);

    let mut executor = DryRunExecutor::new();
    for (build_type, files) in script.outputs {
        executor = executor.with_output(build_type, files);
    }
    for build_type in script.failing {
        executor = executor.failing(build_type);
    }
    for agent in &script.agents {
        scheduler.register_agent(agent.clone()).await;
    }
    let dispatcher = Dispatcher::new(
        scheduler.clone(),
        Arc::new(executor),
        script.agents,
        DispatcherConfig::default(),
    );

    for (index, step) in script.steps.into_iter().enumerate() {
        info!(step = index, "Simulation step");
        match step {
            ScriptStep::VcsChange(event) => {
                scheduler.on_vcs_change(event).await?;
            }
            ScriptStep::BuildFinished(event) => {
                scheduler.on_build_finished(event).await?;
            }
            ScriptStep::Request {
                build_type,
                branch,
                priority,
                params,
            } => {
                let request = RunRequest {
                    build_type,
                    branch,
                    cause: TriggerCause::Manual {
                        user: Some("simulation".to_string()),
                    },
                    params,
                    priority,
                };
                scheduler.enqueue(request).await?;
            }
            ScriptStep::Advance { secs } => {
                clock.advance(Duration::seconds(secs));
            }
        }
        dispatcher.run_until_idle().await?;
    }

    Ok(Outcome {
        runs: scheduler.runs().await,
        events: bus.published().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_core::definition::DefinitionSet;
    use girder_core::run::RunState;
    use pretty_assertions::assert_eq;

    const DEFINITIONS: &str = r#"
projects:
  - id: Root
    name: Root
vcs_roots:
  - id: Repo
    project: Root
    name: repo
    url: https://git.example.com/repo.git
    branch_spec: "+:feature/*"
build_types:
  - id: Deps
    project: Root
    name: Deps
    vcs_roots: [Repo]
    artifact_rules: "+:out/*.dll"
    triggers:
      - type: vcs
        quiet_period_secs: 120
  - id: App
    project: Root
    name: App
    vcs_roots: [Repo]
    triggers:
      - type: finish_build
        upstream: Deps
        branch_filter: "+:%teamcity.build.branch%"
    dependencies:
      - kind: artifact
        upstream: Deps
"#;

    const SCRIPT: &str = r#"
start: 2026-01-05T10:00:00Z
outputs:
  Deps: [out/core.dll]
steps:
  - step: vcs_change
    vcs_root: Repo
    branch: feature/x
    commits:
      - revision: a1
        committer: alice
  - step: advance
    secs: 60
  - step: advance
    secs: 61
"#;

    #[tokio::test]
    async fn test_quiet_period_then_finish_build_chain() {
        let set: DefinitionSet = serde_yaml::from_str(DEFINITIONS).unwrap();
        let registry = Registry::load(set).unwrap();
        let script: Script = serde_yaml::from_str(SCRIPT).unwrap();

        let outcome = simulate(registry, script, SchedulerConfig::default())
            .await
            .unwrap();

        let runs: Vec<(&str, &str, RunState)> = outcome
            .runs
            .iter()
            .map(|r| (r.build_type.as_str(), r.branch.as_str(), r.state))
            .collect();
        assert_eq!(
            runs,
            vec![
                ("Deps", "feature/x", RunState::Succeeded),
                ("App", "feature/x", RunState::Succeeded),
            ]
        );
        assert!(
            outcome
                .events
                .iter()
                .any(|e| matches!(e, Event::ArtifactsPublished(_)))
        );
    }
}
