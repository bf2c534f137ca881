//! Build queue ordered by priority class, FIFO within a class.

use chrono::{DateTime, Utc};
use girder_core::ids::{BuildTypeId, RunId};
use girder_core::params::Parameters;
use girder_core::run::Priority;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// A run waiting in the queue.
#[derive(Debug, Clone)]
pub struct QueuedRun {
    pub run_id: RunId,
    pub build_type: BuildTypeId,
    pub branch: String,
    /// Parameters the request set on top of the build type's own.
    pub params: Parameters,
    pub priority: Priority,
    /// Insertion sequence number; breaks ties within a priority class.
    pub seq: u64,
    pub queued_at: DateTime<Utc>,
}

impl PartialEq for QueuedRun {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedRun {}

impl PartialOrd for QueuedRun {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRun {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier sequence number
        match other.priority.cmp(&self.priority) {
            Ordering::Equal => self.seq.cmp(&other.seq),
            other => other,
        }
    }
}

#[derive(Debug, Default)]
pub struct RunQueue {
    entries: BTreeSet<QueuedRun>,
    by_run: HashMap<RunId, QueuedRun>,
    next_seq: u64,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a run to the back of its priority class.
    pub fn push(
        &mut self,
        run_id: RunId,
        build_type: BuildTypeId,
        branch: String,
        params: Parameters,
        priority: Priority,
        queued_at: DateTime<Utc>,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = QueuedRun {
            run_id,
            build_type,
            branch,
            params,
            priority,
            seq,
            queued_at,
        };
        self.by_run.insert(run_id, entry.clone());
        self.entries.insert(entry);
        seq
    }

    pub fn remove(&mut self, run_id: RunId) -> Option<QueuedRun> {
        let entry = self.by_run.remove(&run_id)?;
        self.entries.remove(&entry);
        Some(entry)
    }

    /// Move a run to a higher priority class, keeping its sequence number.
    /// Returns false when the run already has that priority or higher.
    pub fn raise(&mut self, run_id: RunId, priority: Priority) -> bool {
        let Some(entry) = self.by_run.get_mut(&run_id) else {
            return false;
        };
        if entry.priority >= priority {
            return false;
        }
        self.entries.remove(&*entry);
        entry.priority = priority;
        self.entries.insert(entry.clone());
        true
    }

    /// Queued runs in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedRun> {
        self.entries.iter()
    }

    /// First queued run of a build type on a branch requested with the
    /// same parameters.
    pub fn find(
        &self,
        build_type: &BuildTypeId,
        branch: &str,
        params: &Parameters,
    ) -> Option<&QueuedRun> {
        self.entries
            .iter()
            .find(|e| &e.build_type == build_type && e.branch == branch && &e.params == params)
    }

    pub fn contains(&self, run_id: RunId) -> bool {
        self.by_run.contains_key(&run_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(queue: &mut RunQueue, name: &str, priority: Priority) -> RunId {
        let run_id = RunId::new();
        queue.push(
            run_id,
            name.into(),
            "main".to_string(),
            Parameters::new(),
            priority,
            Utc::now(),
        );
        run_id
    }

    fn order(queue: &RunQueue) -> Vec<String> {
        queue.iter().map(|e| e.build_type.to_string()).collect()
    }

    #[test]
    fn test_priority_ordering() {
        let mut queue = RunQueue::new();
        push(&mut queue, "low", Priority::Low);
        push(&mut queue, "normal", Priority::Normal);
        push(&mut queue, "high", Priority::High);

        assert_eq!(order(&queue), vec!["high", "normal", "low"]);
    }

    #[test]
    fn test_fifo_within_class() {
        let mut queue = RunQueue::new();
        push(&mut queue, "a", Priority::Normal);
        push(&mut queue, "b", Priority::Normal);
        push(&mut queue, "c", Priority::Normal);

        assert_eq!(order(&queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_raise_keeps_sequence() {
        let mut queue = RunQueue::new();
        push(&mut queue, "h1", Priority::High);
        let late = push(&mut queue, "n", Priority::Normal);
        push(&mut queue, "h2", Priority::High);

        assert!(queue.raise(late, Priority::High));
        assert!(!queue.raise(late, Priority::Low));
        assert_eq!(order(&queue), vec!["h1", "n", "h2"]);
    }

    #[test]
    fn test_remove_and_find() {
        let mut queue = RunQueue::new();
        let a = push(&mut queue, "a", Priority::Normal);
        push(&mut queue, "b", Priority::Normal);

        let none = Parameters::new();
        assert_eq!(queue.find(&"b".into(), "main", &none).map(|e| e.seq), Some(1));
        assert!(queue.find(&"b".into(), "dev", &none).is_none());
        assert!(queue.remove(a).is_some());
        assert!(queue.remove(a).is_none());
        assert_eq!(queue.len(), 1);
        assert!(!queue.contains(a));
    }

    #[test]
    fn test_find_requires_same_params() {
        let mut queue = RunQueue::new();
        let custom = Parameters::from([("flavor".to_string(), "debug".to_string())]);
        let run_id = RunId::new();
        queue.push(
            run_id,
            "Deps".into(),
            "main".to_string(),
            custom.clone(),
            Priority::Normal,
            Utc::now(),
        );

        assert!(queue.find(&"Deps".into(), "main", &Parameters::new()).is_none());
        assert_eq!(
            queue.find(&"Deps".into(), "main", &custom).map(|e| e.run_id),
            Some(run_id)
        );
    }
}
