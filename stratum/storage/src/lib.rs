pub mod error;
pub mod version_store;

pub use error::{ConflictReason, StorageError, StorageResult};
pub use version_store::{PruneStats, VersionIdx, VersionRef, VersionStore, WriteCheck};
