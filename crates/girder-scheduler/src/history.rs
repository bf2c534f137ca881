//! Run records, per build type counters and the last-successful index.
//!
//! With a retention limit the history drops its oldest finished runs once
//! it grows past the limit. The last success of each branch and any run an
//! unfinished run still depends on are never dropped.

use girder_core::ids::{BuildTypeId, RunId};
use girder_core::run::{Run, RunState};
use girder_core::{Error, Result};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct RunHistory {
    runs: HashMap<RunId, Run>,
    /// Run ids in insertion order.
    order: Vec<RunId>,
    /// Run ids per build type in creation order.
    by_build_type: HashMap<BuildTypeId, Vec<RunId>>,
    counters: HashMap<BuildTypeId, u64>,
    last_successful: HashMap<(BuildTypeId, String), RunId>,
    /// Snapshot dependents per upstream run.
    dependents: HashMap<RunId, Vec<RunId>>,
    retained_runs: Option<usize>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// History that keeps at most `retained_runs` runs beyond those it
    /// must keep.
    pub fn with_retention(retained_runs: usize) -> Self {
        Self {
            retained_runs: Some(retained_runs),
            ..Self::default()
        }
    }

    /// Next run counter for a build type, starting at 1.
    pub fn next_counter(&mut self, build_type: &BuildTypeId) -> u64 {
        let counter = self.counters.entry(build_type.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn insert(&mut self, run: Run) {
        for link in &run.snapshot_upstream {
            self.dependents.entry(link.run_id).or_default().push(run.id);
        }
        self.by_build_type
            .entry(run.build_type.clone())
            .or_default()
            .push(run.id);
        self.order.push(run.id);
        self.runs.insert(run.id, run);
    }

    pub fn get(&self, run_id: RunId) -> Option<&Run> {
        self.runs.get(&run_id)
    }

    pub fn get_mut(&mut self, run_id: RunId) -> Option<&mut Run> {
        self.runs.get_mut(&run_id)
    }

    pub fn require(&self, run_id: RunId) -> Result<&Run> {
        self.runs.get(&run_id).ok_or(Error::RunNotFound(run_id))
    }

    pub fn require_mut(&mut self, run_id: RunId) -> Result<&mut Run> {
        self.runs.get_mut(&run_id).ok_or(Error::RunNotFound(run_id))
    }

    /// Index a succeeded run. Call in the same critical section as the
    /// transition.
    pub fn record_success(&mut self, run_id: RunId) {
        if let Some(run) = self.runs.get(&run_id)
            && run.state == RunState::Succeeded
        {
            self.last_successful
                .insert((run.build_type.clone(), run.branch.clone()), run_id);
        }
    }

    /// Last succeeded run of a build type on a branch.
    pub fn last_successful(&self, build_type: &BuildTypeId, branch: &str) -> Option<&Run> {
        self.last_successful
            .get(&(build_type.clone(), branch.to_string()))
            .and_then(|id| self.runs.get(id))
    }

    /// Latest queued or running run of a build type on a branch.
    pub fn active_run(&self, build_type: &BuildTypeId, branch: &str) -> Option<&Run> {
        self.runs_of(build_type)
            .rev()
            .find(|run| !run.state.is_terminal() && run.branch == branch)
    }

    /// Runs of a build type in creation order.
    pub fn runs_of<'a>(
        &'a self,
        build_type: &BuildTypeId,
    ) -> impl DoubleEndedIterator<Item = &'a Run> {
        self.by_build_type
            .get(build_type)
            .map(|ids| ids.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.runs.get(id))
    }

    /// Queued runs bound to `upstream` through the snapshot chain.
    pub fn queued_dependents(&self, upstream: RunId) -> Vec<RunId> {
        self.dependents
            .get(&upstream)
            .into_iter()
            .flatten()
            .filter(|id| {
                self.runs
                    .get(id)
                    .is_some_and(|run| run.state == RunState::Queued)
            })
            .copied()
            .collect()
    }

    /// Drop the oldest finished runs until the history is back within its
    /// retention limit. Returns the dropped run ids.
    pub fn prune(&mut self) -> Vec<RunId> {
        let Some(limit) = self.retained_runs else {
            return Vec::new();
        };
        let excess = self.runs.len().saturating_sub(limit);
        if excess == 0 {
            return Vec::new();
        }

        let pinned: HashSet<RunId> = self.last_successful.values().copied().collect();
        let evicted: Vec<RunId> = self
            .order
            .iter()
            .copied()
            .filter(|id| !pinned.contains(id) && self.is_evictable(*id))
            .take(excess)
            .collect();
        if evicted.is_empty() {
            return evicted;
        }

        let gone: HashSet<RunId> = evicted.iter().copied().collect();
        for run_id in &evicted {
            self.dependents.remove(run_id);
            let Some(run) = self.runs.remove(run_id) else {
                continue;
            };
            if let Some(ids) = self.by_build_type.get_mut(&run.build_type) {
                ids.retain(|id| id != run_id);
            }
            for link in &run.snapshot_upstream {
                if let Some(ids) = self.dependents.get_mut(&link.run_id) {
                    ids.retain(|id| id != run_id);
                    if ids.is_empty() {
                        self.dependents.remove(&link.run_id);
                    }
                }
            }
        }
        self.order.retain(|id| !gone.contains(id));
        evicted
    }

    fn is_evictable(&self, run_id: RunId) -> bool {
        let finished = self
            .runs
            .get(&run_id)
            .is_some_and(|run| run.state.is_terminal());
        let needed = self.dependents.get(&run_id).is_some_and(|ids| {
            ids.iter()
                .filter_map(|id| self.runs.get(id))
                .any(|run| !run.state.is_terminal())
        });
        finished && !needed
    }

    /// All runs in the order they were queued. Chain upstreams come
    /// before the run that queued them.
    pub fn all(&self) -> Vec<&Run> {
        self.order.iter().filter_map(|id| self.runs.get(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
