//! Scheduler and dispatcher configuration.

use girder_core::run::Priority;
use serde::{Deserialize, Serialize};

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long a run may wait when no known agent can satisfy its
    /// requirements before it fails.
    #[serde(default = "default_agent_wait_timeout")]
    pub agent_wait_timeout_secs: u64,
    /// Priority for requests whose build type sets none.
    #[serde(default)]
    pub default_priority: Priority,
    /// Merge a request into an already queued run of the same build type
    /// and branch.
    #[serde(default = "default_optimize_queue")]
    pub optimize_queue: bool,
    /// Finished runs kept in history. The last success of each branch and
    /// runs a queued run depends on are kept on top of this.
    #[serde(default = "default_retained_runs")]
    pub retained_runs: usize,
}

fn default_agent_wait_timeout() -> u64 {
    600
}

fn default_optimize_queue() -> bool {
    true
}

fn default_retained_runs() -> usize {
    1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            agent_wait_timeout_secs: default_agent_wait_timeout(),
            default_priority: Priority::default(),
            optimize_queue: default_optimize_queue(),
            retained_runs: default_retained_runs(),
        }
    }
}

/// Dispatcher loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Interval between scheduler ticks and dispatch passes.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval() -> u64 {
    250
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
        }
    }
}
