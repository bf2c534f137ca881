//! Artifact store that records bundles without touching the filesystem.

use crate::index::BundleIndex;
use async_trait::async_trait;
use chrono::Utc;
use girder_core::Result;
use girder_core::artifact::{BundleRef, PublishRequest};
use girder_core::definition::SelectionRule;
use girder_core::filters::BranchFilter;
use girder_core::ids::{BuildTypeId, BundleId, RunId};
use girder_core::ports::ArtifactStore;
use tokio::sync::RwLock;
use tracing::debug;

/// Keeps bundle metadata only. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    index: RwLock<BundleIndex>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every bundle currently recorded.
    pub async fn bundles(&self) -> Vec<BundleRef> {
        self.index.read().await.iter().cloned().collect()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn publish(&self, request: PublishRequest) -> Result<BundleRef> {
        let bundle = BundleRef {
            id: BundleId::new(),
            build_type: request.build_type,
            run_id: request.run_id,
            run_counter: request.run_counter,
            build_number: request.build_number,
            branch: request.branch,
            pinned: false,
            entries: request.rules.select(&request.files),
            published_at: Utc::now(),
        };
        debug!(
            run_id = %bundle.run_id,
            build_type = %bundle.build_type,
            files = bundle.entries.len(),
            "Bundle recorded"
        );
        self.index.write().await.insert(bundle.clone());
        Ok(bundle)
    }

    async fn fetch(
        &self,
        build_type: &BuildTypeId,
        selection: &SelectionRule,
        branches: &BranchFilter,
    ) -> Result<Option<BundleRef>> {
        self.index.read().await.select(build_type, selection, branches)
    }

    async fn pin(&self, run_id: RunId, pinned: bool) -> Result<()> {
        self.index.write().await.set_pinned(run_id, pinned);
        Ok(())
    }

    async fn discard(&self, run_id: RunId) -> Result<()> {
        self.index.write().await.remove(run_id);
        Ok(())
    }
}
