//! Artifact store keeping bundle files on local disk.
//!
//! Layout: `<root>/<build type>/<run id>/` holds the bundle files at their
//! bundle paths plus a `bundle.json` manifest. The index is rebuilt from
//! the manifests on open.

use crate::index::BundleIndex;
use async_trait::async_trait;
use chrono::Utc;
use girder_core::artifact::{ArtifactEntry, BundleRef, PublishRequest};
use girder_core::definition::SelectionRule;
use girder_core::filters::BranchFilter;
use girder_core::ids::{BuildTypeId, BundleId, RunId};
use girder_core::ports::ArtifactStore;
use girder_core::{Error, Result};
use std::path::{Component, Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const MANIFEST: &str = "bundle.json";

pub struct FilesystemArtifactStore {
    root: PathBuf,
    index: RwLock<BundleIndex>,
}

impl FilesystemArtifactStore {
    /// Open (or create) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let index = load_index(&root).await?;
        info!(root = %root.display(), bundles = index.len(), "Artifact store opened");
        Ok(Self {
            root,
            index: RwLock::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a bundle's files.
    pub fn bundle_dir(&self, bundle: &BundleRef) -> PathBuf {
        self.run_dir(&bundle.build_type, bundle.run_id)
    }

    fn run_dir(&self, build_type: &BuildTypeId, run_id: RunId) -> PathBuf {
        self.root.join(build_type.as_str()).join(run_id.to_string())
    }

    /// Copy the selected files into `dir` and write the manifest.
    async fn write_bundle(&self, dir: &Path, request: PublishRequest) -> Result<BundleRef> {
        tokio::fs::create_dir_all(dir).await?;

        let mut entries = Vec::new();
        for entry in request.rules.select(&request.files) {
            let (Some(source), Some(target)) = (
                contained_join(&request.workspace, &entry.source),
                contained_join(dir, &entry.destination),
            ) else {
                warn!(
                    source = %entry.source,
                    destination = %entry.destination,
                    "Skipping artifact outside its root"
                );
                continue;
            };
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&source, &target).await.map_err(|e| {
                Error::Internal(format!("Failed to copy {}: {}", source.display(), e))
            })?;
            entries.push(ArtifactEntry {
                source: entry.source,
                destination: entry.destination,
            });
        }

        let bundle = BundleRef {
            id: BundleId::new(),
            build_type: request.build_type,
            run_id: request.run_id,
            run_counter: request.run_counter,
            build_number: request.build_number,
            branch: request.branch,
            pinned: false,
            entries,
            published_at: Utc::now(),
        };
        self.write_manifest(&bundle).await?;
        Ok(bundle)
    }

    async fn remove_partial(&self, dir: &Path) {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                dir = %dir.display(),
                error = %e,
                "Failed to remove partially published bundle"
            ),
        }
    }

    async fn write_manifest(&self, bundle: &BundleRef) -> Result<()> {
        let path = self.bundle_dir(bundle).join(MANIFEST);
        let json = serde_json::to_vec_pretty(bundle)?;
        tokio::fs::write(&path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn publish(&self, request: PublishRequest) -> Result<BundleRef> {
        let dir = self.run_dir(&request.build_type, request.run_id);
        let bundle = match self.write_bundle(&dir, request).await {
            Ok(bundle) => bundle,
            Err(e) => {
                // Leave nothing half-published behind.
                self.remove_partial(&dir).await;
                return Err(e);
            }
        };
        info!(
            run_id = %bundle.run_id,
            build_type = %bundle.build_type,
            files = bundle.entries.len(),
            "Bundle published"
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
        let bundle = {
            let mut index = self.index.write().await;
            index.set_pinned(run_id, pinned).cloned()
        };
        match bundle {
            Some(bundle) => self.write_manifest(&bundle).await,
            None => {
                debug!(run_id = %run_id, "Pin ignored for run without bundle");
                Ok(())
            }
        }
    }

    async fn discard(&self, run_id: RunId) -> Result<()> {
        let Some(bundle) = self.index.write().await.remove(run_id) else {
            return Ok(());
        };
        let dir = self.bundle_dir(&bundle);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        debug!(run_id = %run_id, "Bundle discarded");
        Ok(())
    }
}

/// Join a relative path under `root`, refusing anything that escapes it.
fn contained_join(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        .then(|| root.join(relative))
}

async fn load_index(root: &Path) -> Result<BundleIndex> {
    let mut index = BundleIndex::new();
    let mut build_types = tokio::fs::read_dir(root).await?;
    while let Some(build_type) = build_types.next_entry().await? {
        if !build_type.file_type().await?.is_dir() {
            continue;
        }
        let mut runs = tokio::fs::read_dir(build_type.path()).await?;
        while let Some(run) = runs.next_entry().await? {
            let manifest = run.path().join(MANIFEST);
            if !tokio::fs::try_exists(&manifest).await? {
                continue;
            }
            let bytes = tokio::fs::read(&manifest).await?;
            match serde_json::from_slice::<BundleRef>(&bytes) {
                Ok(bundle) => index.insert(bundle),
                Err(e) => {
                    warn!(
                        manifest = %manifest.display(),
                        error = %e,
                        "Ignoring unreadable bundle manifest"
                    );
                }
            }
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contained_join_rejects_escapes() {
        let root = Path::new("/store");
        assert_eq!(
            contained_join(root, "bin/a.dll"),
            Some(PathBuf::from("/store/bin/a.dll"))
        );
        assert!(contained_join(root, "../etc/passwd").is_none());
        assert!(contained_join(root, "/etc/passwd").is_none());
    }
}
