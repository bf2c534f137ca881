//! Dispatch loop: hands queued runs to an executor, one run per agent.

use crate::config::DispatcherConfig;
use crate::executor::{ExecutionReport, Executor};
use crate::scheduler::Scheduler;
use girder_core::Result;
use girder_core::agent::AgentInfo;
use girder_core::ids::RunId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, error, info};

/// Runs handed to the executor and not yet reported back.
#[derive(Default)]
struct InFlight {
    tasks: JoinSet<ExecutionReport>,
    runs: HashMap<Id, (RunId, String)>,
    busy: HashSet<String>,
}

impl InFlight {
    fn release(&mut self, id: Id) -> Option<RunId> {
        let (run_id, agent) = self.runs.remove(&id)?;
        self.busy.remove(&agent);
        Some(run_id)
    }
}

pub struct Dispatcher {
    scheduler: Arc<Scheduler>,
    executor: Arc<dyn Executor>,
    agents: Vec<AgentInfo>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        scheduler: Arc<Scheduler>,
        executor: Arc<dyn Executor>,
        agents: Vec<AgentInfo>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            scheduler,
            executor,
            agents,
            config,
        }
    }

    /// Tick and dispatch until shutdown, then cancel and drain what is
    /// still running.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inflight = InFlight::default();

        for agent in &self.agents {
            self.scheduler.register_agent(agent.clone()).await;
        }
        info!(
            agents = self.agents.len(),
            poll_interval_ms = self.config.poll_interval_ms,
            "Starting dispatcher"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scheduler.tick().await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                    if let Err(e) = self.dispatch_ready(&mut inflight).await {
                        error!(error = %e, "Dispatch failed");
                    }
                }
                Some(joined) = inflight.tasks.join_next_with_id() => {
                    if let Err(e) = self.settle(&mut inflight, joined).await {
                        error!(error = %e, "Failed to record run result");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Dispatcher shutting down");
                        break;
                    }
                }
            }
        }

        let running: Vec<RunId> = inflight.runs.values().map(|(run_id, _)| *run_id).collect();
        for run_id in running {
            self.scheduler
                .cancel(run_id, Some("dispatcher shutdown".to_string()))
                .await?;
        }
        while let Some(joined) = inflight.tasks.join_next_with_id().await {
            self.settle(&mut inflight, joined).await?;
        }
        Ok(())
    }

    /// Dispatch and complete runs until nothing is running and nothing can
    /// start. Returns the number of runs that finished.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut inflight = InFlight::default();
        let mut finished = 0;
        loop {
            self.scheduler.tick().await?;
            self.dispatch_ready(&mut inflight).await?;
            match inflight.tasks.join_next_with_id().await {
                Some(joined) => {
                    self.settle(&mut inflight, joined).await?;
                    finished += 1;
                }
                None => break,
            }
        }
        debug!(finished, "Dispatcher idle");
        Ok(finished)
    }

    async fn dispatch_ready(&self, inflight: &mut InFlight) -> Result<usize> {
        let mut started = 0;
        loop {
            let idle: Vec<AgentInfo> = self
                .agents
                .iter()
                .filter(|agent| !inflight.busy.contains(&agent.name))
                .cloned()
                .collect();
            if idle.is_empty() {
                break;
            }
            let Some(dispatch) = self.scheduler.dequeue_next(&idle).await? else {
                break;
            };

            let run_id = dispatch.record.run_id;
            let agent = dispatch.record.agent.clone();
            let executor = self.executor.clone();
            let handle = inflight.tasks.spawn(async move {
                match executor.execute(dispatch.record, dispatch.cancel).await {
                    Ok(report) => report,
                    Err(e) => {
                        error!(run_id = %run_id, error = %e, "Executor error");
                        ExecutionReport::errored(e.to_string())
                    }
                }
            });
            inflight.busy.insert(agent.clone());
            inflight.runs.insert(handle.id(), (run_id, agent));
            started += 1;
        }
        Ok(started)
    }

    async fn settle(
        &self,
        inflight: &mut InFlight,
        joined: std::result::Result<(Id, ExecutionReport), JoinError>,
    ) -> Result<()> {
        let (run_id, report) = match joined {
            Ok((id, report)) => match inflight.release(id) {
                Some(run_id) => (run_id, report),
                None => return Ok(()),
            },
            Err(e) => {
                let Some(run_id) = inflight.release(e.id()) else {
                    return Ok(());
                };
                error!(run_id = %run_id, error = %e, "Executor task aborted");
                (run_id, ExecutionReport::errored(format!("executor task aborted: {e}")))
            }
        };
        self.scheduler.complete(run_id, report).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastEventBus;
    use crate::config::SchedulerConfig;
    use crate::executor::DryRunExecutor;
    use girder_artifacts::MemoryArtifactStore;
    use girder_core::definition::DefinitionSet;
    use girder_core::registry::Registry;
    use girder_core::run::{RunRequest, RunState};

    const DEFINITIONS: &str = r#"
projects:
  - id: Root
    name: Root
build_types:
  - id: Lib
    project: Root
    name: Lib
  - id: App
    project: Root
    name: App
    dependencies:
      - kind: snapshot
        upstream: Lib
"#;

    fn scheduler() -> Arc<Scheduler> {
        let set: DefinitionSet = serde_yaml::from_str(DEFINITIONS).unwrap();
        Arc::new(
            Scheduler::new(
                Arc::new(Registry::load(set).unwrap()),
                Arc::new(MemoryArtifactStore::new()),
                Arc::new(BroadcastEventBus::new()),
                SchedulerConfig::default(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_run_until_idle_runs_chain_in_order() {
        let scheduler = scheduler();
        let app = scheduler.enqueue(RunRequest::manual("App", "main")).await.unwrap();
        let executor = Arc::new(DryRunExecutor::new());
        let dispatcher = Dispatcher::new(
            scheduler.clone(),
            executor.clone(),
            vec![AgentInfo::new("a"), AgentInfo::new("b")],
            DispatcherConfig::default(),
        );

        assert_eq!(dispatcher.run_until_idle().await.unwrap(), 2);
        let order: Vec<String> = executor
            .executed()
            .await
            .iter()
            .map(|record| record.build_type.to_string())
            .collect();
        assert_eq!(order, vec!["Lib", "App"]);
        assert_eq!(scheduler.run(app).await.unwrap().state, RunState::Succeeded);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_runs() {
        let scheduler = scheduler();
        let lib = scheduler.enqueue(RunRequest::manual("Lib", "main")).await.unwrap();
        let executor =
            Arc::new(DryRunExecutor::new().with_delay(std::time::Duration::from_secs(3600)));
        let dispatcher = Dispatcher::new(
            scheduler.clone(),
            executor,
            vec![AgentInfo::new("a")],
            DispatcherConfig { poll_interval_ms: 10 },
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { dispatcher.run(rx).await });
        while scheduler.run(lib).await.unwrap().state != RunState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(scheduler.run(lib).await.unwrap().state, RunState::Cancelled);
    }
}
