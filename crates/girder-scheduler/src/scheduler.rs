//! Run scheduler.
//!
//! Owns the run queue and run history. Requests become runs here, snapshot
//! chains are expanded here, and runs leave the queue only when every
//! snapshot upstream has succeeded and an agent satisfies their
//! requirements.

use crate::agents::AgentMatcher;
use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::dag::DependencyGraph;
use crate::executor::{CancelHandle, CancelSignal, ExecutionOutcome, ExecutionReport};
use crate::history::RunHistory;
use crate::queue::RunQueue;
use crate::triggers::{Firing, TriggerEvaluator};
use chrono::{DateTime, Duration, Utc};
use girder_core::agent::AgentInfo;
use girder_core::artifact::PublishRequest;
use girder_core::definition::{FailurePolicy, SelectionRule, Step};
use girder_core::dispatch::{ArtifactInput, DispatchRecord};
use girder_core::events::{
    ArtifactsPublishedPayload, BuildFinishedEvent, Event, RunCancelledPayload, RunFinishedPayload,
    RunQueuedPayload, RunStartedPayload, TriggerFiredPayload, VcsChangeEvent,
};
use girder_core::filters::BranchFilter;
use girder_core::ids::RunId;
use girder_core::params::{self, Parameters};
use girder_core::ports::{ArtifactStore, EventBus};
use girder_core::registry::Registry;
use girder_core::requirement::Requirement;
use girder_core::run::{Run, RunRequest, RunState, TerminationReason, TriggerCause, UpstreamLink};
use girder_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A run handed out for execution.
#[derive(Debug)]
pub struct Dispatch {
    pub record: DispatchRecord,
    pub cancel: CancelSignal,
}

/// Side effects collected under the state lock and applied after it is
/// released.
#[derive(Default)]
struct Effects {
    events: Vec<Event>,
    finished: Vec<BuildFinishedEvent>,
    discard: Vec<RunId>,
}

#[derive(Default)]
struct SchedulerState {
    queue: RunQueue,
    history: RunHistory,
    agents: AgentMatcher,
    cancels: HashMap<RunId, CancelHandle>,
    /// Running runs with a pending cancel request, and who asked.
    cancelled_by: HashMap<RunId, Option<String>>,
    /// Queued runs no known agent can take, and since when.
    unsatisfied_since: HashMap<RunId, DateTime<Utc>>,
}

enum Readiness {
    Ready,
    Waiting,
    UpstreamFailed(UpstreamLink),
}

pub struct Scheduler {
    registry: Arc<Registry>,
    graph: DependencyGraph,
    store: Arc<dyn ArtifactStore>,
    event_bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    triggers: Mutex<TriggerEvaluator>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn ArtifactStore>,
        event_bus: Arc<dyn EventBus>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        Self::with_clock(registry, store, event_bus, config, Arc::new(SystemClock))
    }

    /// Build a scheduler reading time from `clock`.
    ///
    /// Fails if the dependency graph has a cycle or a trigger cannot be
    /// parsed.
    pub fn with_clock(
        registry: Arc<Registry>,
        store: Arc<dyn ArtifactStore>,
        event_bus: Arc<dyn EventBus>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let graph = DependencyGraph::resolve(&registry)?;
        let triggers = TriggerEvaluator::new(registry.clone(), clock.now())?;
        let state = SchedulerState {
            history: RunHistory::with_retention(config.retained_runs),
            ..SchedulerState::default()
        };
        info!(
            build_types = graph.topological_order().len(),
            "Scheduler initialized"
        );
        Ok(Self {
            registry,
            graph,
            store,
            event_bus,
            clock,
            config,
            triggers: Mutex::new(triggers),
            state: Mutex::new(state),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Queue a run and, through its snapshot dependencies, the chain of
    /// upstream runs it needs.
    pub async fn enqueue(&self, request: RunRequest) -> Result<RunId> {
        let config = self.registry.resolve_effective_config(&request.build_type)?;
        if config.paused {
            return Err(Error::BuildTypePaused(request.build_type));
        }

        let mut effects = Effects::default();
        let run_id = {
            let mut state = self.state.lock().await;
            let run_id = self.enqueue_locked(&mut state, request, &mut effects)?;
            state.history.prune();
            run_id
        };
        self.publish_effects(effects).await;
        Ok(run_id)
    }

    fn enqueue_locked(
        &self,
        state: &mut SchedulerState,
        request: RunRequest,
        effects: &mut Effects,
    ) -> Result<RunId> {
        let config = self.registry.resolve_effective_config(&request.build_type)?;
        let now = self.clock.now();
        let priority = request
            .priority
            .or(config.priority)
            .unwrap_or(self.config.default_priority);

        if self.config.optimize_queue
            && let Some(existing) = state
                .queue
                .find(&config.build_type, &request.branch, &request.params)
                .map(|entry| entry.run_id)
        {
            if state.queue.raise(existing, priority)
                && let Some(run) = state.history.get_mut(existing)
            {
                run.priority = priority;
            }
            debug!(
                run_id = %existing,
                build_type = %config.build_type,
                branch = %request.branch,
                cause = %request.cause,
                "Request merged into queued run"
            );
            return Ok(existing);
        }

        let mut links = Vec::new();
        for dep in config.snapshot_dependencies() {
            let branch = self.registry.branch_for(&dep.upstream, &request.branch);
            // A finish-build firing binds to the run that fired it.
            let triggering = match &request.cause {
                TriggerCause::FinishBuild {
                    upstream,
                    upstream_run,
                } if upstream == &dep.upstream => {
                    state.history.get(*upstream_run).map(|run| run.id)
                }
                _ => None,
            };
            let active = state
                .history
                .active_run(&dep.upstream, &branch)
                .map(|run| run.id);
            let reusable = state
                .history
                .last_successful(&dep.upstream, &branch)
                .filter(|_| dep.reuse_builds)
                .map(|run| run.id);

            let upstream_run = match triggering.or(active).or(reusable) {
                Some(id) => id,
                None => {
                    let chain = RunRequest {
                        build_type: dep.upstream.clone(),
                        branch,
                        cause: TriggerCause::SnapshotChain {
                            downstream: config.build_type.clone(),
                        },
                        params: Parameters::new(),
                        priority: Some(priority),
                    };
                    self.enqueue_locked(state, chain, effects)?
                }
            };
            links.push(UpstreamLink {
                build_type: dep.upstream.clone(),
                run_id: upstream_run,
                on_failure: dep.on_failure,
            });
        }

        let counter = state.history.next_counter(&config.build_type);
        let mut run_params = config.params.clone();
        run_params.extend(request.params.clone());
        run_params.extend(params::builtins(
            config.build_type.as_str(),
            &request.branch,
            counter,
            "",
        ));
        let build_number = params::interpolate(
            &config.build_number_pattern,
            &params::resolve_all(&run_params),
        );
        run_params.insert(params::BUILD_NUMBER.to_string(), build_number.clone());

        let run = Run {
            id: RunId::new(),
            build_type: config.build_type.clone(),
            branch: request.branch.clone(),
            counter,
            build_number,
            state: RunState::Queued,
            cause: request.cause,
            params: params::resolve_all(&run_params),
            priority,
            snapshot_upstream: links,
            agent: None,
            queued_at: now,
            started_at: None,
            finished_at: None,
            reason: None,
        };
        let run_id = run.id;

        state.queue.push(
            run_id,
            run.build_type.clone(),
            run.branch.clone(),
            request.params,
            priority,
            now,
        );
        info!(
            run_id = %run_id,
            build_type = %run.build_type,
            branch = %run.branch,
            build_number = %run.build_number,
            cause = %run.cause,
            "Run queued"
        );
        effects.events.push(Event::RunQueued(RunQueuedPayload {
            run_id,
            build_type: run.build_type.clone(),
            branch: run.branch.clone(),
            build_number: run.build_number.clone(),
            cause: run.cause.clone(),
            queued_at: now,
        }));
        state.history.insert(run);
        Ok(run_id)
    }

    /// Hand out the highest priority run that can start on one of the
    /// `available` agents.
    pub async fn dequeue_next(&self, available: &[AgentInfo]) -> Result<Option<Dispatch>> {
        let mut effects = Effects::default();
        let dispatch = {
            let mut state = self.state.lock().await;
            state.agents.observe(available);
            self.select_next(&mut state, available, &mut effects).await
        };
        // Runs finished before an error still publish and cascade.
        self.flush(effects).await;
        dispatch
    }

    async fn select_next(
        &self,
        state: &mut SchedulerState,
        available: &[AgentInfo],
        effects: &mut Effects,
    ) -> Result<Option<Dispatch>> {
        let now = self.clock.now();
        let candidates: Vec<RunId> = state.queue.iter().map(|entry| entry.run_id).collect();

        'candidates: for run_id in candidates {
            // An earlier candidate may have cascaded into this one.
            if !state.queue.contains(run_id) {
                continue;
            }
            let run = state.history.require(run_id)?.clone();

            match readiness(&state.history, &run) {
                Readiness::Ready => {}
                Readiness::Waiting => continue,
                Readiness::UpstreamFailed(link) => {
                    let next = match link.on_failure {
                        FailurePolicy::FailToStart => RunState::Failed,
                        _ => RunState::Cancelled,
                    };
                    let reason = TerminationReason::UpstreamFailure {
                        upstream: link.build_type,
                        upstream_run: link.run_id,
                    };
                    self.finish(state, run_id, next, reason, now, effects)?;
                    continue;
                }
            }

            let config = self.registry.resolve_effective_config(&run.build_type)?;
            let requirements = expand_requirements(&config.requirements, &run.params);
            let Some(agent) = state
                .agents
                .find_available(available, &requirements)
                .cloned()
            else {
                if state.agents.can_satisfy(&requirements) {
                    state.unsatisfied_since.remove(&run_id);
                } else {
                    state.unsatisfied_since.entry(run_id).or_insert(now);
                }
                continue;
            };
            state.unsatisfied_since.remove(&run_id);

            let mut inputs = Vec::new();
            for dep in config.artifact_dependencies() {
                let (selection, filter) = match &dep.selection {
                    SelectionRule::SameChain => {
                        let Some(link) = run
                            .snapshot_upstream
                            .iter()
                            .find(|link| link.build_type == dep.upstream)
                        else {
                            return Err(Error::InvalidDependency {
                                build_type: run.build_type.clone(),
                                reason: format!(
                                    "same chain artifacts from {} without a snapshot dependency",
                                    dep.upstream
                                ),
                            });
                        };
                        (SelectionRule::Run { run_id: link.run_id }, BranchFilter::any())
                    }
                    selection => {
                        let filter = match dep.branch_filter.resolve(&run.params) {
                            Ok(filter) => filter,
                            Err(e) => {
                                warn!(
                                    run_id = %run_id,
                                    error = %e,
                                    "Branch filter did not resolve; using it verbatim"
                                );
                                dep.branch_filter.clone()
                            }
                        };
                        let filter = match self.registry.default_branch(&dep.upstream) {
                            Some(default_branch) => filter.bind_default(default_branch),
                            None => filter,
                        };
                        (selection.clone(), filter)
                    }
                };

                match self.store.fetch(&dep.upstream, &selection, &filter).await {
                    Ok(Some(bundle)) => {
                        let entries = dep.rules.select_or_all(&bundle.paths());
                        inputs.push(ArtifactInput {
                            upstream: dep.upstream.clone(),
                            bundle,
                            entries,
                        });
                    }
                    Ok(None) if dep.mandatory => {
                        warn!(
                            run_id = %run_id,
                            upstream = %dep.upstream,
                            selection = %dep.selection,
                            "No upstream run matches artifact dependency"
                        );
                        let reason = TerminationReason::NoMatchingRun {
                            upstream: dep.upstream.clone(),
                            rule: dep.selection.to_string(),
                        };
                        self.finish(state, run_id, RunState::Failed, reason, now, effects)?;
                        continue 'candidates;
                    }
                    Ok(None) => {
                        debug!(
                            run_id = %run_id,
                            upstream = %dep.upstream,
                            "Optional artifact dependency has no match"
                        );
                    }
                    Err(e) => {
                        warn!(
                            run_id = %run_id,
                            upstream = %dep.upstream,
                            error = %e,
                            "Artifact lookup failed; run stays queued"
                        );
                        continue 'candidates;
                    }
                }
            }

            state.queue.remove(run_id);
            let (handle, signal) = CancelHandle::new();
            state.cancels.insert(run_id, handle);
            let started = state.history.require_mut(run_id)?;
            started.transition(RunState::Running, now)?;
            started.agent = Some(agent.name.clone());

            info!(
                run_id = %run_id,
                build_type = %run.build_type,
                branch = %run.branch,
                agent = %agent.name,
                "Run started"
            );
            effects.events.push(Event::RunStarted(RunStartedPayload {
                run_id,
                build_type: run.build_type.clone(),
                agent: agent.name.clone(),
                started_at: now,
            }));

            let record = DispatchRecord {
                run_id,
                build_type: run.build_type,
                build_number: run.build_number,
                branch: run.branch,
                steps: expand_steps(&config.steps, &run.params),
                params: run.params,
                artifact_inputs: inputs,
                requirements,
                agent: agent.name,
            };
            return Ok(Some(Dispatch {
                record,
                cancel: signal,
            }));
        }
        Ok(None)
    }

    /// Record the end of a running run.
    pub async fn complete(&self, run_id: RunId, report: ExecutionReport) -> Result<()> {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.lock().await;
            self.complete_locked(&mut state, run_id, report, &mut effects).await
        };
        self.flush(effects).await;
        result
    }

    async fn complete_locked(
        &self,
        state: &mut SchedulerState,
        run_id: RunId,
        report: ExecutionReport,
        effects: &mut Effects,
    ) -> Result<()> {
        let now = self.clock.now();
        let run = state.history.require(run_id)?.clone();
        if run.state != RunState::Running {
            return Err(Error::InvalidTransition {
                run_id,
                from: run.state,
                to: terminal_state(report.outcome),
            });
        }

        state.cancels.remove(&run_id);
        let outcome = match state.cancelled_by.get(&run_id) {
            Some(_) => ExecutionOutcome::Cancelled,
            None => report.outcome,
        };

        match outcome {
            ExecutionOutcome::Succeeded => {
                self.succeed(state, &run, report, now, effects).await?;
            }
            ExecutionOutcome::Failed => {
                let reason = TerminationReason::StepFailed {
                    message: report
                        .message
                        .unwrap_or_else(|| "build step failed".to_string()),
                };
                self.finish(state, run_id, RunState::Failed, reason, now, effects)?;
            }
            ExecutionOutcome::Errored => {
                let reason = TerminationReason::ExecutorError {
                    message: report
                        .message
                        .unwrap_or_else(|| "executor failed".to_string()),
                };
                self.finish(state, run_id, RunState::Failed, reason, now, effects)?;
            }
            ExecutionOutcome::Cancelled => {
                let by = state.cancelled_by.remove(&run_id).flatten();
                let reason = TerminationReason::Cancelled { by };
                self.finish(state, run_id, RunState::Cancelled, reason, now, effects)?;
            }
        }
        Ok(())
    }

    async fn succeed(
        &self,
        state: &mut SchedulerState,
        run: &Run,
        report: ExecutionReport,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> Result<()> {
        let config = self.registry.resolve_effective_config(&run.build_type)?;
        let published = if config.artifact_rules.is_empty() {
            Ok(None)
        } else {
            self.store
                .publish(PublishRequest {
                    run_id: run.id,
                    build_type: run.build_type.clone(),
                    branch: run.branch.clone(),
                    run_counter: run.counter,
                    build_number: run.build_number.clone(),
                    workspace: report.workspace,
                    files: report.files,
                    rules: config.artifact_rules.clone(),
                })
                .await
                .map(Some)
        };

        let bundle = match published {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(
                    run_id = %run.id,
                    build_type = %run.build_type,
                    error = %e,
                    "Artifact publishing failed"
                );
                let reason = TerminationReason::ArtifactPublishFailed {
                    message: e.to_string(),
                };
                return self.finish(state, run.id, RunState::Failed, reason, now, effects);
            }
        };

        let finished = state.history.require_mut(run.id)?;
        finished.transition(RunState::Succeeded, now)?;
        let finished = finished.clone();
        state.history.record_success(run.id);

        info!(
            run_id = %run.id,
            build_type = %run.build_type,
            branch = %run.branch,
            build_number = %run.build_number,
            "Run succeeded"
        );
        if let Some(bundle) = bundle {
            effects
                .events
                .push(Event::ArtifactsPublished(ArtifactsPublishedPayload {
                    run_id: run.id,
                    build_type: run.build_type.clone(),
                    bundle_id: bundle.id,
                    file_count: bundle.entries.len(),
                }));
        }
        record_finished(&finished, effects);
        Ok(())
    }

    /// Cancel a queued or running run. Finished runs are left alone.
    pub async fn cancel(&self, run_id: RunId, by: Option<String>) -> Result<()> {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.lock().await;
            self.cancel_locked(&mut state, run_id, by, &mut effects)
        };
        self.flush(effects).await;
        result
    }

    fn cancel_locked(
        &self,
        state: &mut SchedulerState,
        run_id: RunId,
        by: Option<String>,
        effects: &mut Effects,
    ) -> Result<()> {
        let now = self.clock.now();
        let (current, build_type) = {
            let run = state.history.require(run_id)?;
            (run.state, run.build_type.clone())
        };

        match current {
            RunState::Queued => {
                let reason = TerminationReason::Cancelled { by };
                self.finish(state, run_id, RunState::Cancelled, reason, now, effects)?;
            }
            RunState::Running => {
                if let Some(handle) = state.cancels.get(&run_id) {
                    handle.cancel();
                }
                state.cancelled_by.insert(run_id, by.clone());
                info!(
                    run_id = %run_id,
                    build_type = %build_type,
                    "Cancellation signalled to running run"
                );
                effects.events.push(Event::RunCancelled(RunCancelledPayload {
                    run_id,
                    build_type,
                    reason: TerminationReason::Cancelled { by },
                    was_running: true,
                    cancelled_at: now,
                }));
            }
            finished => {
                debug!(run_id = %run_id, state = %finished, "Cancel ignored for finished run");
            }
        }
        Ok(())
    }

    /// Move a run to a terminal state other than success, then cascade to
    /// queued runs bound to it.
    fn finish(
        &self,
        state: &mut SchedulerState,
        run_id: RunId,
        next: RunState,
        reason: TerminationReason,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> Result<()> {
        self.terminate(state, run_id, next, reason, now, effects)?;

        let mut failed = vec![run_id];
        while let Some(upstream_run) = failed.pop() {
            let Some(upstream) = state
                .history
                .get(upstream_run)
                .map(|r| r.build_type.clone())
            else {
                continue;
            };
            for dependent in state.history.queued_dependents(upstream_run) {
                let policy = state.history.get(dependent).and_then(|run| {
                    run.snapshot_upstream
                        .iter()
                        .find(|link| link.run_id == upstream_run)
                        .map(|link| link.on_failure)
                });
                let next = match policy {
                    Some(FailurePolicy::Cancel) => RunState::Cancelled,
                    Some(FailurePolicy::FailToStart) => RunState::Failed,
                    Some(FailurePolicy::Ignore) | None => continue,
                };
                warn!(
                    run_id = %dependent,
                    upstream = %upstream,
                    upstream_run = %upstream_run,
                    state = %next,
                    "Upstream did not succeed"
                );
                let reason = TerminationReason::UpstreamFailure {
                    upstream: upstream.clone(),
                    upstream_run,
                };
                self.terminate(state, dependent, next, reason, now, effects)?;
                failed.push(dependent);
            }
        }
        Ok(())
    }

    fn terminate(
        &self,
        state: &mut SchedulerState,
        run_id: RunId,
        next: RunState,
        reason: TerminationReason,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> Result<()> {
        state.queue.remove(run_id);
        state.unsatisfied_since.remove(&run_id);
        state.cancels.remove(&run_id);
        state.cancelled_by.remove(&run_id);

        let run = state.history.require_mut(run_id)?;
        let was_running = run.state == RunState::Running;
        run.transition(next, now)?;
        run.reason = Some(reason.clone());
        let run = run.clone();

        info!(
            run_id = %run_id,
            build_type = %run.build_type,
            state = %next,
            reason = %reason,
            "Run finished"
        );
        if next == RunState::Cancelled && !was_running {
            effects.events.push(Event::RunCancelled(RunCancelledPayload {
                run_id,
                build_type: run.build_type.clone(),
                reason,
                was_running,
                cancelled_at: now,
            }));
        }
        if was_running {
            effects.discard.push(run_id);
        }
        record_finished(&run, effects);
        Ok(())
    }

    /// Advance quiet periods and cron schedules, then fail queued runs no
    /// agent has been able to take for too long.
    pub async fn tick(&self) -> Result<Vec<RunId>> {
        let now = self.clock.now();
        let firings = {
            let mut triggers = self.triggers.lock().await;
            let mut firings = triggers.poll(now);
            firings.extend(triggers.scheduled(now));
            firings
        };
        let queued = self.fire(firings).await;
        self.expire_unsatisfiable().await?;
        Ok(queued)
    }

    async fn expire_unsatisfiable(&self) -> Result<()> {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.lock().await;
            self.expire_locked(&mut state, &mut effects)
        };
        self.flush(effects).await;
        result
    }

    fn expire_locked(&self, state: &mut SchedulerState, effects: &mut Effects) -> Result<()> {
        let now = self.clock.now();
        let timeout = Duration::seconds(self.config.agent_wait_timeout_secs as i64);
        let queued: Vec<RunId> = state.queue.iter().map(|entry| entry.run_id).collect();

        for run_id in queued {
            if !state.queue.contains(run_id) {
                continue;
            }
            let run = state.history.require(run_id)?;
            let config = self.registry.resolve_effective_config(&run.build_type)?;
            let requirements = expand_requirements(&config.requirements, &run.params);
            if state.agents.can_satisfy(&requirements) {
                state.unsatisfied_since.remove(&run_id);
                continue;
            }

            let since = *state.unsatisfied_since.entry(run_id).or_insert(now);
            let waited = now - since;
            if waited < timeout {
                continue;
            }
            warn!(
                run_id = %run_id,
                build_type = %config.build_type,
                waited_secs = waited.num_seconds(),
                "No agent satisfies run requirements"
            );
            let reason = TerminationReason::UnsatisfiableRequirement {
                requirements: requirements.iter().map(|r| r.to_string()).collect(),
                waited_secs: waited.num_seconds(),
            };
            self.finish(state, run_id, RunState::Failed, reason, now, effects)?;
        }
        Ok(())
    }

    /// Feed a VCS change to the triggers and queue what fires.
    pub async fn on_vcs_change(&self, event: VcsChangeEvent) -> Result<Vec<RunId>> {
        let now = self.clock.now();
        let firings = self.triggers.lock().await.on_vcs_change(&event, now);
        Ok(self.fire(firings).await)
    }

    /// Feed a finished build to finish-build triggers and queue what fires.
    pub async fn on_build_finished(&self, event: BuildFinishedEvent) -> Result<Vec<RunId>> {
        let firings = self.triggers.lock().await.on_build_finished(&event);
        Ok(self.fire(firings).await)
    }

    /// Queue what the triggers fired. A firing that cannot be queued is
    /// logged and skipped.
    async fn fire(&self, firings: Vec<Firing>) -> Vec<RunId> {
        let mut queued = Vec::with_capacity(firings.len());
        for firing in firings {
            self.publish(Event::TriggerFired(TriggerFiredPayload {
                build_type: firing.build_type.clone(),
                trigger_index: firing.trigger_index,
                branch: firing.request.branch.clone(),
                cause: firing.request.cause.clone(),
                fired_at: self.clock.now(),
            }))
            .await;

            let build_type = firing.build_type;
            let mut effects = Effects::default();
            let result = {
                let mut state = self.state.lock().await;
                let result = self.enqueue_locked(&mut state, firing.request, &mut effects);
                state.history.prune();
                result
            };
            self.publish_effects(effects).await;
            match result {
                Ok(run_id) => queued.push(run_id),
                Err(e) => warn!(
                    build_type = %build_type,
                    error = %e,
                    "Fired trigger could not queue a run"
                ),
            }
        }
        queued
    }

    /// Publish events and feed finished runs back to the triggers.
    async fn flush(&self, effects: Effects) -> Vec<RunId> {
        let finished = effects.finished.clone();
        self.publish_effects(effects).await;

        let firings = {
            let triggers = self.triggers.lock().await;
            finished
                .iter()
                .flat_map(|event| triggers.on_build_finished(event))
                .collect::<Vec<_>>()
        };
        self.fire(firings).await
    }

    async fn publish_effects(&self, effects: Effects) {
        for event in effects.events {
            self.publish(event).await;
        }
        for run_id in effects.discard {
            if let Err(e) = self.store.discard(run_id).await {
                warn!(run_id = %run_id, error = %e, "Failed to discard run output");
            }
        }
    }

    async fn publish(&self, event: Event) {
        let subject = event.subject();
        if let Err(e) = self.event_bus.publish(event).await {
            warn!(subject = %subject, error = %e, "Failed to publish event");
        }
    }

    pub async fn register_agent(&self, agent: AgentInfo) {
        info!(agent = %agent.name, "Agent registered");
        self.state.lock().await.agents.register(agent);
    }

    pub async fn deregister_agent(&self, name: &str) -> Option<AgentInfo> {
        info!(agent = %name, "Agent deregistered");
        self.state.lock().await.agents.deregister(name)
    }

    /// Pin or unpin a succeeded run's artifacts.
    pub async fn pin(&self, run_id: RunId, pinned: bool) -> Result<()> {
        let state = {
            let state = self.state.lock().await;
            state.history.require(run_id)?.state
        };
        if state != RunState::Succeeded {
            return Err(Error::InvalidTransition {
                run_id,
                from: state,
                to: RunState::Succeeded,
            });
        }
        self.store.pin(run_id, pinned).await
    }

    pub async fn run(&self, run_id: RunId) -> Option<Run> {
        self.state.lock().await.history.get(run_id).cloned()
    }

    /// Every run, ordered by queue time.
    pub async fn runs(&self) -> Vec<Run> {
        let state = self.state.lock().await;
        state.history.all().into_iter().cloned().collect()
    }

    /// Queued run ids in dispatch order.
    pub async fn queued(&self) -> Vec<RunId> {
        let state = self.state.lock().await;
        state.queue.iter().map(|entry| entry.run_id).collect()
    }

    pub async fn queue_length(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Number of runs currently executing.
    pub async fn running(&self) -> usize {
        self.state.lock().await.cancels.len()
    }
}

fn readiness(history: &RunHistory, run: &Run) -> Readiness {
    for link in &run.snapshot_upstream {
        match history.get(link.run_id).map(|upstream| upstream.state) {
            Some(RunState::Succeeded) => {}
            Some(RunState::Queued | RunState::Running) => return Readiness::Waiting,
            _ if link.on_failure == FailurePolicy::Ignore => {}
            _ => return Readiness::UpstreamFailed(link.clone()),
        }
    }
    Readiness::Ready
}

fn record_finished(run: &Run, effects: &mut Effects) {
    let finished_at = run.finished_at.unwrap_or(run.queued_at);
    let duration_ms = run.duration_ms();
    effects.events.push(Event::RunFinished(RunFinishedPayload {
        run_id: run.id,
        build_type: run.build_type.clone(),
        branch: run.branch.clone(),
        state: run.state,
        reason: run.reason.clone(),
        duration_ms,
        finished_at,
    }));
    effects.finished.push(BuildFinishedEvent {
        build_type: run.build_type.clone(),
        run_id: run.id,
        branch: run.branch.clone(),
        state: run.state,
    });
}

fn terminal_state(outcome: ExecutionOutcome) -> RunState {
    match outcome {
        ExecutionOutcome::Succeeded => RunState::Succeeded,
        ExecutionOutcome::Cancelled => RunState::Cancelled,
        ExecutionOutcome::Failed | ExecutionOutcome::Errored => RunState::Failed,
    }
}

fn expand_requirements(requirements: &[Requirement], params: &Parameters) -> Vec<Requirement> {
    requirements
        .iter()
        .map(|req| {
            req.expand(params).unwrap_or_else(|e| {
                warn!(
                    requirement = %req,
                    error = %e,
                    "Requirement did not expand; using it verbatim"
                );
                req.clone()
            })
        })
        .collect()
}

fn expand_steps(steps: &[Step], params: &Parameters) -> Vec<Step> {
    steps
        .iter()
        .map(|step| {
            let mut scoped = params.clone();
            scoped.extend(step.params.clone());
            let scoped = params::resolve_all(&scoped);
            Step {
                name: step.name.clone(),
                runner: step.runner.clone(),
                script: step.script.as_deref().map(|s| params::interpolate(s, &scoped)),
                params: step
                    .params
                    .keys()
                    .map(|key| (key.clone(), scoped[key].clone()))
                    .collect(),
                working_directory: step
                    .working_directory
                    .as_deref()
                    .map(|dir| params::interpolate(dir, &scoped)),
            }
        })
        .collect()
}
