//! Artifact bundle stores for Girder.
//!
//! Bundles are keyed by build type, run and branch. Both stores share the
//! same selection logic; they differ only in where the files live.

pub mod filesystem;
pub mod index;
pub mod memory;

pub use filesystem::FilesystemArtifactStore;
pub use index::BundleIndex;
pub use memory::MemoryArtifactStore;
