use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{SnapshotIter, SnapshotStore};
use crate::error::StoreError;
use crate::types::{Snapshot, SnapshotMeta, UserId};

const FILE_PREFIX: &str = "user_";
const FILE_SUFFIX: &str = ".json";

/// JSON snapshots under a directory, `user_<id>.json` each.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    /// Open the store, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!("Snapshot store ready at {}", root.display());
        Ok(Self { root })
    }

    pub fn path_for(&self, user_id: UserId) -> PathBuf {
        self.root.join(format!("{FILE_PREFIX}{user_id}{FILE_SUFFIX}"))
    }

    fn parse_file_name(name: &str) -> Option<UserId> {
        name.strip_prefix(FILE_PREFIX)?
            .strip_suffix(FILE_SUFFIX)?
            .parse()
            .ok()
    }

    fn write_atomic(tmp: &Path, target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let mut file = File::create(tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(tmp, target)?;
        Ok(())
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let target = self.path_for(snapshot.user_id);
        // unique per write so concurrent writers never share a temp file
        let tmp = self.root.join(format!(
            ".{FILE_PREFIX}{}.{}.tmp",
            snapshot.user_id,
            Uuid::new_v4().simple()
        ));

        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let result = Self::write_atomic(&tmp, &target, &bytes);
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        } else {
            debug!("[SAVE] User {} -> {}", snapshot.user_id, target.display());
        }
        result
    }

    fn load(&self, user_id: UserId) -> Result<Option<Snapshot>, StoreError> {
        let path = self.path_for(user_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<Snapshot>(&bytes) {
            Ok(snapshot) if snapshot.user_id == user_id => {
                debug!("[LOAD] User {} <- {}", user_id, path.display());
                Ok(Some(snapshot))
            }
            Ok(snapshot) => {
                warn!(
                    "[LOAD] {} belongs to user {}, ignoring it",
                    path.display(),
                    snapshot.user_id
                );
                Ok(None)
            }
            Err(e) => {
                warn!("[LOAD] Corrupt snapshot {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    fn delete(&self, user_id: UserId) -> Result<(), StoreError> {
        let path = self.path_for(user_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("[DELETE] Removed {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_if_older(&self, user_id: UserId, cutoff: SystemTime) -> Result<bool, StoreError> {
        let path = self.path_for(user_id);
        let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if modified >= cutoff {
            return Ok(false);
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("[DELETE] Removed stale {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<SnapshotIter, StoreError> {
        let entries = fs::read_dir(&self.root)?;
        let iter = entries.filter_map(|entry| {
            let entry = entry.ok()?;
            let user_id = Self::parse_file_name(entry.file_name().to_str()?)?;
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            Some(SnapshotMeta {
                user_id,
                modified: metadata.modified().ok()?,
                size_bytes: metadata.len(),
            })
        });
        Ok(Box::new(iter))
    }
}
