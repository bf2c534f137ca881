//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and its
//! external collaborators.

use crate::artifact::{BundleRef, PublishRequest};
use crate::definition::SelectionRule;
use crate::events::Event;
use crate::filters::BranchFilter;
use crate::ids::{BuildTypeId, RunId};
use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to status events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `run.*.Lib`, `run.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Storage for artifact bundles keyed by (build type, run, branch).
///
/// Durability is the implementation's concern.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Apply the request's rules to the run's workspace and record a bundle.
    async fn publish(&self, request: PublishRequest) -> Result<BundleRef>;

    /// Find the bundle selected by `selection` among runs whose branch
    /// passes `branches`. `SelectionRule::SameChain` must be resolved to a
    /// concrete run by the caller.
    async fn fetch(
        &self,
        build_type: &BuildTypeId,
        selection: &SelectionRule,
        branches: &BranchFilter,
    ) -> Result<Option<BundleRef>>;

    /// Mark a run's bundle as pinned (or unpinned).
    async fn pin(&self, run_id: RunId, pinned: bool) -> Result<()>;

    /// Drop anything recorded for a run that did not succeed.
    async fn discard(&self, run_id: RunId) -> Result<()>;
}
