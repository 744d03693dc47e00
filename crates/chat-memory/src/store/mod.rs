//! Durable snapshot storage, one snapshot per user.

mod file;

pub use file::FileSnapshotStore;

use std::time::SystemTime;

use crate::error::StoreError;
use crate::types::{Snapshot, SnapshotMeta, UserId};

/// Lazily streamed snapshot listing.
pub type SnapshotIter = Box<dyn Iterator<Item = SnapshotMeta> + Send>;

/// Blocking key-value storage from user id to [`Snapshot`].
///
/// The manager runs these calls on the blocking thread pool and never while
/// holding the cache lock.
pub trait SnapshotStore: Send + Sync {
    /// Overwrite the user's snapshot; a crash never leaves a half-written file
    /// readable as valid.
    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// `Ok(None)` for a missing or corrupt snapshot.
    fn load(&self, user_id: UserId) -> Result<Option<Snapshot>, StoreError>;

    /// Deleting a missing snapshot is not an error.
    fn delete(&self, user_id: UserId) -> Result<(), StoreError>;

    /// Delete the snapshot only if it was last written before `cutoff`.
    /// Returns whether a file was removed.
    fn delete_if_older(&self, user_id: UserId, cutoff: SystemTime) -> Result<bool, StoreError>;

    fn list(&self) -> Result<SnapshotIter, StoreError>;
}
