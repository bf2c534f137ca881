//! Dependency graph resolution, trigger evaluation and run scheduling for
//! Girder.

pub mod agents;
pub mod bus;
pub mod clock;
pub mod config;
pub mod dag;
pub mod dispatcher;
pub mod executor;
pub mod history;
pub mod queue;
pub mod scheduler;
pub mod triggers;

pub use config::{DispatcherConfig, SchedulerConfig};
pub use dag::DependencyGraph;
pub use dispatcher::Dispatcher;
pub use executor::{CancelSignal, DryRunExecutor, ExecutionOutcome, ExecutionReport, Executor};
pub use scheduler::{Dispatch, Scheduler};
pub use triggers::TriggerEvaluator;
