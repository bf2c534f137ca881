//! End-to-end scheduling tests: triggers, snapshot chains, artifacts and
//! failure cascades through the dispatcher.

use chrono::{Duration, Utc};
use girder_artifacts::MemoryArtifactStore;
use girder_core::agent::AgentInfo;
use girder_core::definition::DefinitionSet;
use girder_core::events::{Commit, Event, VcsChangeEvent};
use girder_core::registry::Registry;
use girder_core::run::{Priority, Run, RunRequest, RunState, TerminationReason};
use girder_scheduler::bus::BroadcastEventBus;
use girder_scheduler::clock::ManualClock;
use girder_scheduler::{
    Dispatcher, DispatcherConfig, DryRunExecutor, Executor, Scheduler, SchedulerConfig,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

const PIPELINE: &str = r#"
projects:
  - id: Root
    name: Root
vcs_roots:
  - id: Repo
    project: Root
    name: repo
    url: https://git.example.com/repo.git
    default_branch: main
    branch_spec: "+:*"
build_types:
  - id: Deps
    project: Root
    name: Native dependencies
    vcs_roots: [Repo]
    artifact_rules: "+:out/** => deps"
  - id: App
    project: Root
    name: Application
    vcs_roots: [Repo]
    requirements: ["equals(os, Windows10)"]
    triggers:
      - type: vcs
    dependencies:
      - kind: snapshot
        upstream: Deps
      - kind: artifact
        upstream: Deps
        selection:
          rule: same_chain
        rules: "+:deps/** => third_party"
  - id: Notify
    project: Root
    name: Notify
    vcs_roots: [Repo]
    triggers:
      - type: finish_build
        upstream: App
        branch_filter: "+:%teamcity.build.branch%"
"#;

const POLICIES: &str = r#"
projects:
  - id: Root
    name: Root
vcs_roots:
  - id: Repo
    project: Root
    name: repo
    url: https://git.example.com/repo.git
    default_branch: main
build_types:
  - id: Lib
    project: Root
    name: Lib
    vcs_roots: [Repo]
    artifact_rules: "+:*.zip"
  - id: Tests
    project: Root
    name: Tests
    dependencies:
      - kind: snapshot
        upstream: Lib
        on_failure: ignore
  - id: Pack
    project: Root
    name: Pack
    dependencies:
      - kind: snapshot
        upstream: Lib
        on_failure: fail_to_start
  - id: Report
    project: Root
    name: Report
    dependencies:
      - kind: artifact
        upstream: Lib
        branch_filter: "+:<default>"
  - id: Docs
    project: Root
    name: Docs
    vcs_roots: [Repo]
    triggers:
      - type: vcs
        quiet_period_secs: 60
    dependencies:
      - kind: artifact
        upstream: Lib
        mandatory: false
"#;

const FINISH_CHAIN: &str = r#"
projects:
  - id: Root
    name: Root
vcs_roots:
  - id: Repo
    project: Root
    name: repo
    url: https://git.example.com/repo.git
    default_branch: main
    branch_spec: "+:feature/*"
build_types:
  - id: Deps
    project: Root
    name: Native dependencies
    vcs_roots: [Repo]
    artifact_rules: "+:out/** => deps"
    triggers:
      - type: vcs
  - id: App
    project: Root
    name: Application
    vcs_roots: [Repo]
    triggers:
      - type: finish_build
        upstream: Deps
        branch_filter: "+:%teamcity.build.branch%"
    dependencies:
      - kind: snapshot
        upstream: Deps
      - kind: artifact
        upstream: Deps
        selection:
          rule: same_chain
        rules: "+:deps/** => lib"
"#;

struct Harness {
    scheduler: Arc<Scheduler>,
    bus: BroadcastEventBus,
    clock: Arc<ManualClock>,
}

fn harness(definitions: &str) -> Harness {
    let set: DefinitionSet = serde_yaml::from_str(definitions).unwrap();
    let registry = Arc::new(Registry::load(set).unwrap());
    let bus = BroadcastEventBus::new();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let scheduler = Scheduler::with_clock(
        registry,
        Arc::new(MemoryArtifactStore::new()),
        Arc::new(bus.clone()),
        SchedulerConfig::default(),
        clock.clone(),
    )
    .unwrap();
    Harness {
        scheduler: Arc::new(scheduler),
        bus,
        clock,
    }
}

fn windows_agent() -> AgentInfo {
    AgentInfo::new("win-01").with_capability("os", "Windows10")
}

async fn run_all(h: &Harness, executor: Arc<dyn Executor>) -> usize {
    Dispatcher::new(
        h.scheduler.clone(),
        executor,
        vec![windows_agent()],
        DispatcherConfig::default(),
    )
    .run_until_idle()
    .await
    .unwrap()
}

async fn runs_of(h: &Harness, build_type: &str) -> Vec<Run> {
    h.scheduler
        .runs()
        .await
        .into_iter()
        .filter(|run| run.build_type.as_str() == build_type)
        .collect()
}

fn commit(revision: &str) -> Commit {
    Commit {
        revision: revision.to_string(),
        committer: "alice".to_string(),
        files: vec!["src/main.cpp".to_string()],
        timestamp: None,
    }
}

#[tokio::test]
async fn test_feature_branch_flows_through_chain() {
    let h = harness(PIPELINE);
    let executor = Arc::new(
        DryRunExecutor::new().with_output("Deps", vec!["out/lib/core.dll".to_string()]),
    );

    let queued = h
        .scheduler
        .on_vcs_change(VcsChangeEvent {
            vcs_root: "Repo".into(),
            branch: "feature/x".to_string(),
            commits: vec![commit("abc123")],
        })
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);

    assert_eq!(run_all(&h, executor.clone()).await, 3);

    let executed = executor.executed().await;
    let order: Vec<(&str, &str)> = executed
        .iter()
        .map(|r| (r.build_type.as_str(), r.branch.as_str()))
        .collect();
    assert_eq!(
        order,
        vec![("Deps", "feature/x"), ("App", "feature/x"), ("Notify", "feature/x")]
    );

    let app = &executed[1];
    assert_eq!(app.artifact_inputs.len(), 1);
    assert_eq!(app.artifact_inputs[0].entries[0].source, "deps/lib/core.dll");
    assert_eq!(
        app.artifact_inputs[0].entries[0].destination,
        "third_party/lib/core.dll"
    );

    let published = h.bus.published().await;
    assert!(published.iter().any(|e| match e {
        Event::ArtifactsPublished(p) => p.build_type.as_str() == "Deps",
        _ => false,
    }));
    assert!(published.iter().any(|e| match e {
        Event::TriggerFired(p) => p.build_type.as_str() == "Notify",
        _ => false,
    }));
}

#[tokio::test]
async fn test_upstream_failure_cancels_downstream_without_running() {
    let h = harness(PIPELINE);
    let executor = Arc::new(DryRunExecutor::new().failing("Deps"));
    let app = h
        .scheduler
        .enqueue(RunRequest::manual("App", "main"))
        .await
        .unwrap();

    assert_eq!(run_all(&h, executor.clone()).await, 1);

    let app_run = h.scheduler.run(app).await.unwrap();
    assert_eq!(app_run.state, RunState::Cancelled);
    assert!(app_run.started_at.is_none());
    assert!(matches!(
        app_run.reason,
        Some(TerminationReason::UpstreamFailure { ref upstream, .. }) if upstream.as_str() == "Deps"
    ));

    let started_app = h.bus.published().await.into_iter().any(|e| {
        matches!(e, Event::RunStarted(p) if p.build_type.as_str() == "App")
    });
    assert!(!started_app);
    // Notify only follows successful App runs.
    assert!(runs_of(&h, "Notify").await.is_empty());
}

#[tokio::test]
async fn test_failure_policies() {
    let h = harness(POLICIES);
    let executor = Arc::new(DryRunExecutor::new().failing("Lib"));
    let tests = h.scheduler.enqueue(RunRequest::manual("Tests", "main")).await.unwrap();
    let pack = h.scheduler.enqueue(RunRequest::manual("Pack", "main")).await.unwrap();

    run_all(&h, executor).await;

    assert_eq!(runs_of(&h, "Lib").await.len(), 1);
    assert_eq!(h.scheduler.run(tests).await.unwrap().state, RunState::Succeeded);
    let pack_run = h.scheduler.run(pack).await.unwrap();
    assert_eq!(pack_run.state, RunState::Failed);
    assert!(pack_run.started_at.is_none());
}

#[tokio::test]
async fn test_missing_mandatory_artifacts_fail_only_that_run() {
    let h = harness(POLICIES);
    let executor = Arc::new(DryRunExecutor::new());
    let report = h.scheduler.enqueue(RunRequest::manual("Report", "main")).await.unwrap();
    let docs = h.scheduler.enqueue(RunRequest::manual("Docs", "main")).await.unwrap();

    run_all(&h, executor.clone()).await;

    let report_run = h.scheduler.run(report).await.unwrap();
    assert_eq!(report_run.state, RunState::Failed);
    assert!(matches!(
        report_run.reason,
        Some(TerminationReason::NoMatchingRun { .. })
    ));
    let docs_run = h.scheduler.run(docs).await.unwrap();
    assert_eq!(docs_run.state, RunState::Succeeded);
    assert!(executor.executed().await[0].artifact_inputs.is_empty());
}

#[tokio::test]
async fn test_default_branch_artifacts_ignore_feature_runs() {
    let h = harness(POLICIES);
    let executor = Arc::new(DryRunExecutor::new().with_output("Lib", vec!["lib.zip".to_string()]));
    h.scheduler.enqueue(RunRequest::manual("Lib", "feature/y")).await.unwrap();
    run_all(&h, executor.clone()).await;

    let report = h.scheduler.enqueue(RunRequest::manual("Report", "main")).await.unwrap();
    run_all(&h, executor.clone()).await;
    assert_eq!(h.scheduler.run(report).await.unwrap().state, RunState::Failed);

    h.scheduler.enqueue(RunRequest::manual("Lib", "main")).await.unwrap();
    run_all(&h, executor.clone()).await;
    let report = h.scheduler.enqueue(RunRequest::manual("Report", "main")).await.unwrap();
    run_all(&h, executor.clone()).await;

    assert_eq!(h.scheduler.run(report).await.unwrap().state, RunState::Succeeded);
    let record = executor.executed().await.pop().unwrap();
    assert_eq!(record.artifact_inputs[0].bundle.branch, "main");
}

#[tokio::test]
async fn test_quiet_period_fires_on_tick() {
    let h = harness(POLICIES);
    let event = VcsChangeEvent {
        vcs_root: "Repo".into(),
        branch: "main".to_string(),
        commits: vec![commit("r1")],
    };
    assert!(h.scheduler.on_vcs_change(event.clone()).await.unwrap().is_empty());

    h.clock.advance(Duration::seconds(30));
    assert!(h.scheduler.tick().await.unwrap().is_empty());

    h.clock.advance(Duration::seconds(31));
    let queued = h.scheduler.tick().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(runs_of(&h, "Docs").await.len(), 1);
}

#[tokio::test]
async fn test_priority_classes_are_fifo() {
    let h = harness(POLICIES);
    let requests = [
        ("main", Priority::Low),
        ("feature/a", Priority::Normal),
        ("feature/b", Priority::High),
        ("feature/c", Priority::High),
    ];
    for (branch, priority) in requests {
        h.scheduler
            .enqueue(RunRequest::manual("Lib", branch).with_priority(priority))
            .await
            .unwrap();
    }

    let mut order = Vec::new();
    while let Some(dispatch) = h.scheduler.dequeue_next(&[windows_agent()]).await.unwrap() {
        order.push(dispatch.record.branch.clone());
    }
    assert_eq!(order, vec!["feature/b", "feature/c", "feature/a", "main"]);
}

#[tokio::test]
async fn test_finish_build_trigger_follows_upstream_branch() {
    let h = harness(FINISH_CHAIN);
    let executor = Arc::new(
        DryRunExecutor::new().with_output("Deps", vec!["out/core.dll".to_string()]),
    );

    h.scheduler
        .on_vcs_change(VcsChangeEvent {
            vcs_root: "Repo".into(),
            branch: "feature/x".to_string(),
            commits: vec![commit("abc123")],
        })
        .await
        .unwrap();
    assert_eq!(run_all(&h, executor.clone()).await, 2);

    let deps = runs_of(&h, "Deps").await;
    let app = runs_of(&h, "App").await;
    assert_eq!(deps.len(), 1);
    assert_eq!(app.len(), 1);
    assert!(h.scheduler.runs().await.iter().all(|run| run.branch == "feature/x"));

    // The triggered run reuses the upstream run that fired it.
    assert_eq!(app[0].state, RunState::Succeeded);
    assert_eq!(app[0].snapshot_upstream[0].run_id, deps[0].id);
    let inputs = &executor.executed().await[1].artifact_inputs;
    assert_eq!(inputs[0].bundle.run_id, deps[0].id);
    assert_eq!(inputs[0].entries[0].destination, "lib/core.dll");
}
