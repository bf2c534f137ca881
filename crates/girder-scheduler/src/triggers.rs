//! Trigger evaluation.
//!
//! Each trigger instance moves Idle → Pending → Fired → Idle. VCS triggers
//! with a quiet period sit in Pending while commits keep arriving; all other
//! triggers fire straight away.

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use girder_core::definition::{EffectiveConfig, FinishBuildTrigger, Trigger};
use girder_core::events::{BuildFinishedEvent, Commit, VcsChangeEvent};
use girder_core::filters::PathRules;
use girder_core::ids::{BuildTypeId, VcsRootId};
use girder_core::params::{self, Parameters};
use girder_core::registry::Registry;
use girder_core::run::{RunRequest, RunState, TriggerCause};
use girder_core::Result;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Branch used by scheduled triggers of build types without a VCS root.
const FALLBACK_BRANCH: &str = "main";

/// A trigger decided to request a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Firing {
    pub build_type: BuildTypeId,
    pub trigger_index: usize,
    pub request: RunRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Idle,
    /// Commits are buffered, waiting for the quiet period to pass.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct BatchKey {
    build_type: BuildTypeId,
    trigger_index: usize,
    vcs_root: VcsRootId,
    branch: String,
    committer: Option<String>,
}

#[derive(Debug)]
struct Batch {
    commits: Vec<Commit>,
    last_commit_at: DateTime<Utc>,
    quiet_period: Duration,
}

pub struct TriggerEvaluator {
    registry: Arc<Registry>,
    configs: Vec<EffectiveConfig>,
    schedules: HashMap<(BuildTypeId, usize), Schedule>,
    last_scheduled: HashMap<(BuildTypeId, usize), DateTime<Utc>>,
    pending: BTreeMap<BatchKey, Batch>,
    /// Build types and branches with changes since their last scheduled run.
    changed: HashSet<(BuildTypeId, String)>,
    started_at: DateTime<Utc>,
}

impl TriggerEvaluator {
    /// Resolve every build type's triggers and parse cron expressions.
    /// Scheduled triggers count their first tick from `now`.
    pub fn new(registry: Arc<Registry>, now: DateTime<Utc>) -> Result<Self> {
        let configs = registry
            .build_type_ids()
            .map(|id| registry.resolve_effective_config(id))
            .collect::<Result<Vec<_>>>()?;

        let mut schedules = HashMap::new();
        for config in &configs {
            for (idx, trigger) in config.triggers.iter().enumerate() {
                if let Trigger::Scheduled(t) = trigger {
                    let schedule = t.schedule(&config.build_type)?;
                    schedules.insert((config.build_type.clone(), idx), schedule);
                }
            }
        }

        Ok(Self {
            registry,
            configs,
            schedules,
            last_scheduled: HashMap::new(),
            pending: BTreeMap::new(),
            changed: HashSet::new(),
            started_at: now,
        })
    }

    /// Evaluate a commit set against every VCS trigger bound to its root.
    pub fn on_vcs_change(&mut self, event: &VcsChangeEvent, now: DateTime<Utc>) -> Vec<Firing> {
        let Some(root) = self.registry.vcs_root(&event.vcs_root) else {
            warn!(vcs_root = %event.vcs_root, "Change for unknown VCS root");
            return Vec::new();
        };
        if !root.tracks(&event.branch) {
            debug!(
                vcs_root = %event.vcs_root,
                branch = %event.branch,
                "Branch not tracked by VCS root"
            );
            return Vec::new();
        }

        let mut firings = Vec::new();
        for config in &self.configs {
            if !config.vcs_roots.contains(&event.vcs_root) {
                continue;
            }
            if watches_changes(config)
                && self
                    .registry
                    .default_branch(&config.build_type)
                    .unwrap_or(FALLBACK_BRANCH)
                    == event.branch
            {
                self.changed
                    .insert((config.build_type.clone(), event.branch.clone()));
            }
            if config.paused {
                continue;
            }

            for (idx, trigger) in config.triggers.iter().enumerate() {
                let Trigger::Vcs(t) = trigger else {
                    continue;
                };
                let filter = match t.branch_filter.resolve(&config.params) {
                    Ok(filter) => filter,
                    Err(e) => {
                        warn!(
                            build_type = %config.build_type,
                            error = %e,
                            "Unusable branch filter"
                        );
                        continue;
                    }
                };
                if !filter.matches_with_default(&event.branch, Some(&root.default_branch)) {
                    debug!(
                        build_type = %config.build_type,
                        branch = %event.branch,
                        "Branch filter rejected change"
                    );
                    continue;
                }

                let commits: Vec<&Commit> = event
                    .commits
                    .iter()
                    .filter(|c| commit_qualifies(&t.rules, c))
                    .collect();
                if commits.is_empty() {
                    debug!(build_type = %config.build_type, "No commit matched trigger rules");
                    continue;
                }

                for (committer, group) in group_commits(commits, t.group_by_committer) {
                    if t.quiet_period_secs == 0 {
                        firings.push(vcs_firing(
                            &config.build_type,
                            idx,
                            &event.vcs_root,
                            &event.branch,
                            &group,
                        ));
                        continue;
                    }

                    let key = BatchKey {
                        build_type: config.build_type.clone(),
                        trigger_index: idx,
                        vcs_root: event.vcs_root.clone(),
                        branch: event.branch.clone(),
                        committer,
                    };
                    let quiet_period = Duration::seconds(t.quiet_period_secs as i64);
                    let batch = self.pending.entry(key).or_insert_with(|| Batch {
                        commits: Vec::new(),
                        last_commit_at: now,
                        quiet_period,
                    });
                    batch.commits.extend(group);
                    batch.last_commit_at = now;
                    debug!(
                        build_type = %config.build_type,
                        branch = %event.branch,
                        buffered = batch.commits.len(),
                        "Commits buffered for quiet period"
                    );
                }
            }
        }

        for firing in &firings {
            info!(
                build_type = %firing.build_type,
                branch = %firing.request.branch,
                "VCS trigger fired"
            );
        }
        firings
    }

    /// Fire batches whose quiet period has passed without new commits.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<Firing> {
        let due: Vec<BatchKey> = self
            .pending
            .iter()
            .filter(|(_, batch)| now - batch.last_commit_at >= batch.quiet_period)
            .map(|(key, _)| key.clone())
            .collect();

        let mut firings = Vec::new();
        for key in due {
            if let Some(batch) = self.pending.remove(&key) {
                info!(
                    build_type = %key.build_type,
                    branch = %key.branch,
                    commits = batch.commits.len(),
                    "Quiet period elapsed, VCS trigger fired"
                );
                firings.push(vcs_firing(
                    &key.build_type,
                    key.trigger_index,
                    &key.vcs_root,
                    &key.branch,
                    &batch.commits,
                ));
            }
        }
        firings
    }

    /// Evaluate finish-build triggers for a run that reached a terminal state.
    pub fn on_build_finished(&self, event: &BuildFinishedEvent) -> Vec<Firing> {
        if !event.state.is_terminal() {
            return Vec::new();
        }

        let mut firings = Vec::new();
        for config in &self.configs {
            if config.paused {
                continue;
            }
            for (idx, trigger) in config.triggers.iter().enumerate() {
                let Trigger::FinishBuild(t) = trigger else {
                    continue;
                };
                if t.upstream != event.build_type {
                    continue;
                }
                if t.successful_only && event.state != RunState::Succeeded {
                    debug!(
                        build_type = %config.build_type,
                        state = %event.state,
                        "Upstream did not succeed"
                    );
                    continue;
                }

                let branch = self.registry.branch_for(&config.build_type, &event.branch);
                let default_branch = self.registry.default_branch(&event.build_type);
                match finish_build_matches(t, event, &branch, &config.params, default_branch) {
                    Ok(true) => {
                        info!(
                            build_type = %config.build_type,
                            upstream = %event.build_type,
                            branch = %branch,
                            "Finish-build trigger fired"
                        );
                        let cause = TriggerCause::FinishBuild {
                            upstream: event.build_type.clone(),
                            upstream_run: event.run_id,
                        };
                        firings.push(Firing {
                            build_type: config.build_type.clone(),
                            trigger_index: idx,
                            request: RunRequest::new(config.build_type.clone(), branch, cause),
                        });
                    }
                    Ok(false) => debug!(
                        build_type = %config.build_type,
                        upstream_branch = %event.branch,
                        "Finish-build branch filter rejected upstream branch"
                    ),
                    Err(e) => warn!(
                        build_type = %config.build_type,
                        error = %e,
                        "Unusable branch filter"
                    ),
                }
            }
        }
        firings
    }

    /// Fire scheduled triggers whose next cron tick is due.
    pub fn scheduled(&mut self, now: DateTime<Utc>) -> Vec<Firing> {
        let mut firings = Vec::new();
        for config in &self.configs {
            for (idx, trigger) in config.triggers.iter().enumerate() {
                let Trigger::Scheduled(t) = trigger else {
                    continue;
                };
                let key = (config.build_type.clone(), idx);
                let Some(schedule) = self.schedules.get(&key) else {
                    continue;
                };
                let last = self
                    .last_scheduled
                    .get(&key)
                    .copied()
                    .unwrap_or(self.started_at);
                match schedule.after(&last).next() {
                    Some(next) if next <= now => {}
                    _ => continue,
                }
                self.last_scheduled.insert(key, now);
                if config.paused {
                    continue;
                }

                let branch = self
                    .registry
                    .default_branch(&config.build_type)
                    .unwrap_or(FALLBACK_BRANCH)
                    .to_string();
                let accepted = t
                    .branch_filter
                    .resolve(&config.params)
                    .map(|f| f.matches_with_default(&branch, Some(&branch)))
                    .unwrap_or(false);
                let had_changes = self
                    .changed
                    .remove(&(config.build_type.clone(), branch.clone()));
                if !accepted {
                    debug!(
                        build_type = %config.build_type,
                        branch = %branch,
                        "Schedule branch filter rejected default branch"
                    );
                    continue;
                }
                if t.only_if_changes && !had_changes {
                    debug!(build_type = %config.build_type, "No changes since last scheduled run");
                    continue;
                }

                info!(build_type = %config.build_type, cron = %t.cron, "Scheduled trigger fired");
                let cause = TriggerCause::Scheduled { cron: t.cron.clone() };
                firings.push(Firing {
                    build_type: config.build_type.clone(),
                    trigger_index: idx,
                    request: RunRequest::new(config.build_type.clone(), branch, cause),
                });
            }
        }
        firings
    }

    /// State of a trigger instance.
    pub fn state(&self, build_type: &BuildTypeId, trigger_index: usize) -> TriggerState {
        let pending = self
            .pending
            .keys()
            .any(|k| &k.build_type == build_type && k.trigger_index == trigger_index);
        if pending {
            TriggerState::Pending
        } else {
            TriggerState::Idle
        }
    }
}

/// Whether a finished upstream run satisfies a finish-build trigger's branch
/// filter.
///
/// `%build.branch%` and `%teamcity.build.branch%` in the filter resolve to
/// `triggering_branch`, the branch the downstream would build.
pub fn finish_build_matches(
    trigger: &FinishBuildTrigger,
    event: &BuildFinishedEvent,
    triggering_branch: &str,
    build_params: &Parameters,
    default_branch: Option<&str>,
) -> Result<bool> {
    let mut context = build_params.clone();
    context.extend(params::branch_context(triggering_branch));
    let filter = trigger.branch_filter.resolve(&context)?;
    Ok(filter.matches_with_default(&event.branch, default_branch))
}

/// A commit qualifies when any of its files passes the trigger rules.
/// Commits without file lists only qualify when there are no rules.
fn commit_qualifies(rules: &PathRules, commit: &Commit) -> bool {
    if rules.is_empty() {
        return true;
    }
    commit.files.iter().any(|file| rules.accepts(file))
}

/// Whether a build type has a scheduled trigger that skips ticks without
/// changes.
fn watches_changes(config: &EffectiveConfig) -> bool {
    config
        .triggers
        .iter()
        .any(|t| matches!(t, Trigger::Scheduled(s) if s.only_if_changes))
}

fn group_commits(commits: Vec<&Commit>, by_committer: bool) -> Vec<(Option<String>, Vec<Commit>)> {
    if !by_committer {
        return vec![(None, commits.into_iter().cloned().collect())];
    }
    let mut groups: BTreeMap<String, Vec<Commit>> = BTreeMap::new();
    for commit in commits {
        groups
            .entry(commit.committer.clone())
            .or_default()
            .push(commit.clone());
    }
    groups
        .into_iter()
        .map(|(committer, commits)| (Some(committer), commits))
        .collect()
}

fn vcs_firing(
    build_type: &BuildTypeId,
    trigger_index: usize,
    vcs_root: &VcsRootId,
    branch: &str,
    commits: &[Commit],
) -> Firing {
    let mut committers: Vec<String> = commits.iter().map(|c| c.committer.clone()).collect();
    committers.sort();
    committers.dedup();
    let cause = TriggerCause::Vcs {
        vcs_root: vcs_root.clone(),
        revisions: commits.iter().map(|c| c.revision.clone()).collect(),
        committers,
    };
    Firing {
        build_type: build_type.clone(),
        trigger_index,
        request: RunRequest::new(build_type.clone(), branch, cause),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_core::definition::{BuildType, Project, ScheduledTrigger, VcsRoot, VcsTrigger};
    use girder_core::filters::BranchFilter;
    use girder_core::ids::RunId;
    use pretty_assertions::assert_eq;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn root(branch_spec: &str) -> VcsRoot {
        VcsRoot {
            id: "Repo".into(),
            project: "Root".into(),
            name: "repo".to_string(),
            url: "https://git.example.com/repo.git".to_string(),
            default_branch: "main".to_string(),
            branch_spec: BranchFilter::parse(branch_spec).unwrap(),
            auth: None,
        }
    }

    fn build_type(id: &str, triggers: Vec<Trigger>) -> BuildType {
        BuildType {
            id: id.into(),
            project: "Root".into(),
            name: id.to_string(),
            vcs_roots: vec!["Repo".into()],
            triggers,
            ..Default::default()
        }
    }

    fn evaluator(branch_spec: &str, build_types: Vec<BuildType>) -> TriggerEvaluator {
        let mut registry = Registry::new();
        registry
            .register_project(Project {
                id: "Root".into(),
                name: "Root".to_string(),
                parent: None,
                description: None,
                params: Parameters::new(),
            })
            .unwrap();
        registry.register_vcs_root(root(branch_spec)).unwrap();
        for bt in build_types {
            registry.register_build_type(bt).unwrap();
        }
        registry.validate().unwrap();
        TriggerEvaluator::new(Arc::new(registry), start()).unwrap()
    }

    fn commit(revision: &str, committer: &str, files: &[&str]) -> Commit {
        Commit {
            revision: revision.to_string(),
            committer: committer.to_string(),
            files: files.iter().map(|f| f.to_string()).collect(),
            timestamp: None,
        }
    }

    fn change(branch: &str, commits: Vec<Commit>) -> VcsChangeEvent {
        VcsChangeEvent {
            vcs_root: "Repo".into(),
            branch: branch.to_string(),
            commits,
        }
    }

    fn vcs(trigger: VcsTrigger) -> Trigger {
        Trigger::Vcs(trigger)
    }

    #[test]
    fn test_empty_filter_fires_on_feature_branch() {
        let lib = build_type("Lib", vec![vcs(VcsTrigger::default())]);
        let mut triggers = evaluator("+:*", vec![lib]);
        let push = change("feature/x", vec![commit("a1", "ann", &[])]);
        let firings = triggers.on_vcs_change(&push, start());

        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0].request.branch, "feature/x");
        match &firings[0].request.cause {
            TriggerCause::Vcs { revisions, .. } => assert_eq!(revisions, &vec!["a1".to_string()]),
            other => panic!("unexpected cause: {other:?}"),
        }
    }

    #[test]
    fn test_untracked_branch_is_ignored() {
        let lib = build_type("Lib", vec![vcs(VcsTrigger::default())]);
        let mut triggers = evaluator("+:release/*", vec![lib]);
        let feature = change("feature/x", vec![commit("a1", "ann", &[])]);
        assert!(triggers.on_vcs_change(&feature, start()).is_empty());
        // The default branch is always tracked.
        let main = change("main", vec![commit("a2", "ann", &[])]);
        assert_eq!(triggers.on_vcs_change(&main, start()).len(), 1);
    }

    #[test]
    fn test_quiet_period_batches_commits() {
        let trigger = VcsTrigger {
            quiet_period_secs: 60,
            ..Default::default()
        };
        let mut triggers = evaluator("+:*", vec![build_type("Lib", vec![vcs(trigger)])]);
        let t0 = start();

        let first = change("main", vec![commit("a1", "ann", &[])]);
        assert!(triggers.on_vcs_change(&first, t0).is_empty());
        assert_eq!(triggers.state(&"Lib".into(), 0), TriggerState::Pending);

        let t1 = t0 + Duration::seconds(30);
        let second = change("main", vec![commit("a2", "bob", &[])]);
        assert!(triggers.on_vcs_change(&second, t1).is_empty());
        assert!(triggers.poll(t0 + Duration::seconds(70)).is_empty());

        let firings = triggers.poll(t1 + Duration::seconds(60));
        assert_eq!(firings.len(), 1);
        match &firings[0].request.cause {
            TriggerCause::Vcs { revisions, committers, .. } => {
                assert_eq!(revisions.len(), 2);
                assert_eq!(committers, &vec!["ann".to_string(), "bob".to_string()]);
            }
            other => panic!("unexpected cause: {other:?}"),
        }
        assert_eq!(triggers.state(&"Lib".into(), 0), TriggerState::Idle);
    }

    #[test]
    fn test_group_by_committer_splits_requests() {
        let trigger = VcsTrigger {
            group_by_committer: true,
            ..Default::default()
        };
        let mut triggers = evaluator("+:*", vec![build_type("Lib", vec![vcs(trigger)])]);
        let commits = vec![
            commit("a1", "ann", &[]),
            commit("b1", "bob", &[]),
            commit("a2", "ann", &[]),
        ];

        let firings = triggers.on_vcs_change(&change("main", commits), start());
        assert_eq!(firings.len(), 2);
    }

    #[test]
    fn test_path_rules_filter_commits() {
        let trigger = VcsTrigger {
            rules: PathRules::parse("+:src/**\n-:src/docs/**").unwrap(),
            ..Default::default()
        };
        let mut triggers = evaluator("+:*", vec![build_type("Lib", vec![vcs(trigger)])]);

        let docs = change("main", vec![commit("d1", "ann", &["src/docs/readme.md", "README.md"])]);
        assert!(triggers.on_vcs_change(&docs, start()).is_empty());

        let code = change("main", vec![commit("c1", "ann", &["src/lib.cpp"])]);
        assert_eq!(triggers.on_vcs_change(&code, start()).len(), 1);
    }

    #[test]
    fn test_finish_build_branch_reference() {
        let trigger = FinishBuildTrigger {
            upstream: "Lib".into(),
            branch_filter: BranchFilter::parse("+:%teamcity.build.branch%").unwrap(),
            successful_only: true,
        };
        let finished = |branch: &str| BuildFinishedEvent {
            build_type: "Lib".into(),
            run_id: RunId::new(),
            branch: branch.to_string(),
            state: RunState::Succeeded,
        };
        let params = Parameters::new();

        let matches = |upstream_branch: &str| {
            finish_build_matches(&trigger, &finished(upstream_branch), "feature/x", &params, None)
                .unwrap()
        };
        assert!(matches("feature/x"));
        assert!(!matches("main"));
    }

    #[test]
    fn test_finish_build_trigger_requires_success() {
        let trigger = Trigger::FinishBuild(FinishBuildTrigger {
            upstream: "Lib".into(),
            branch_filter: BranchFilter::any(),
            successful_only: true,
        });
        let triggers = evaluator(
            "+:*",
            vec![build_type("Lib", vec![]), build_type("App", vec![trigger])],
        );
        let mut event = BuildFinishedEvent {
            build_type: "Lib".into(),
            run_id: RunId::new(),
            branch: "feature/x".to_string(),
            state: RunState::Failed,
        };
        assert!(triggers.on_build_finished(&event).is_empty());

        event.state = RunState::Succeeded;
        let firings = triggers.on_build_finished(&event);
        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0].build_type.as_str(), "App");
        assert_eq!(firings[0].request.branch, "feature/x");
    }

    #[test]
    fn test_finish_build_falls_back_to_default_branch() {
        let trigger = Trigger::FinishBuild(FinishBuildTrigger {
            upstream: "Lib".into(),
            branch_filter: BranchFilter::parse("+:%teamcity.build.branch%").unwrap(),
            successful_only: true,
        });
        // Root tracks only the default branch, so App builds main for any upstream branch.
        let triggers = evaluator(
            "",
            vec![build_type("Lib", vec![]), build_type("App", vec![trigger])],
        );
        let event = |branch: &str| BuildFinishedEvent {
            build_type: "Lib".into(),
            run_id: RunId::new(),
            branch: branch.to_string(),
            state: RunState::Succeeded,
        };
        assert!(triggers.on_build_finished(&event("feature/x")).is_empty());
        assert_eq!(triggers.on_build_finished(&event("main")).len(), 1);
    }

    #[test]
    fn test_scheduled_trigger_only_if_changes() {
        let trigger = Trigger::Scheduled(ScheduledTrigger {
            cron: "0 0 * * * *".to_string(),
            branch_filter: BranchFilter::any(),
            only_if_changes: true,
        });
        let mut triggers = evaluator("+:*", vec![build_type("Nightly", vec![trigger])]);

        let first_tick = start() + Duration::hours(1);
        assert!(triggers.scheduled(first_tick).is_empty());

        triggers.on_vcs_change(&change("main", vec![commit("a1", "ann", &[])]), first_tick);
        let firings = triggers.scheduled(first_tick + Duration::hours(1));
        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0].request.branch, "main");

        assert!(triggers.scheduled(first_tick + Duration::hours(2)).is_empty());
    }

    #[test]
    fn test_changes_are_only_tracked_for_scheduled_default_branch() {
        let nightly = Trigger::Scheduled(ScheduledTrigger {
            cron: "0 0 * * * *".to_string(),
            branch_filter: BranchFilter::any(),
            only_if_changes: true,
        });
        let mut triggers = evaluator(
            "+:*",
            vec![
                build_type("Lib", vec![vcs(VcsTrigger::default())]),
                build_type("Nightly", vec![nightly]),
            ],
        );

        for branch in ["main", "feature/x", "feature/y"] {
            triggers.on_vcs_change(&change(branch, vec![commit("a1", "ann", &[])]), start());
        }

        let changed: Vec<_> = triggers.changed.iter().cloned().collect();
        assert_eq!(changed, vec![(BuildTypeId::from("Nightly"), "main".to_string())]);
    }
}
