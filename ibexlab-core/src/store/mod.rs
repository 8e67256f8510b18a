//! Immutable artifact storage: atomic commits, checksummed meta sidecars,
//! Parquet raw snapshots, and single-writer key locks.

pub mod artifact;
pub mod lock;
pub mod parquet;

pub use artifact::{ArtifactKey, ArtifactKind, ArtifactMeta, ArtifactStore, StoreError, WriteOutcome};
pub use lock::KeyLock;
