//! Directory of file checkpoints, one `<id>.json` per checkpoint identity.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chaincommit_core::{CheckpointStore, GatewayError, SharedCheckpointer};

use crate::file::FileCheckpointer;

const EXTENSION: &str = "json";

/// [`CheckpointStore`] keeping each checkpoint as a JSON file in one directory.
///
/// Opening an id that is already open returns the same shared checkpointer,
/// so concurrent sessions on one identity serialize through one lock.
pub struct DirectoryCheckpointStore {
    dir: PathBuf,
    open: Mutex<HashMap<String, SharedCheckpointer>>,
}

impl DirectoryCheckpointStore {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| GatewayError::CheckpointIo(format!("{}: {e}", dir.display())))?;
        Ok(Self {
            dir,
            open: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ids of every checkpoint stored in the directory, sorted.
    pub fn list(&self) -> Result<Vec<String>, GatewayError> {
        let entries =
            fs::read_dir(&self.dir).map_err(|e| GatewayError::CheckpointIo(format!("{}: {e}", self.dir.display())))?;
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, GatewayError> {
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(GatewayError::Other(format!("invalid checkpoint id '{id}'")));
        }
        Ok(self.dir.join(format!("{id}.{EXTENSION}")))
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, SharedCheckpointer>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CheckpointStore for DirectoryCheckpointStore {
    fn open(&self, id: &str) -> Result<SharedCheckpointer, GatewayError> {
        let path = self.path_for(id)?;
        let mut cache = self.cache();
        if let Some(existing) = cache.get(id) {
            return Ok(existing.clone());
        }
        let checkpointer = SharedCheckpointer::new(FileCheckpointer::open(path)?);
        cache.insert(id.to_string(), checkpointer.clone());
        Ok(checkpointer)
    }

    fn delete(&self, id: &str) -> Result<(), GatewayError> {
        let path = self.path_for(id)?;
        self.cache().remove(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(id, path = %path.display(), "Deleted checkpoint");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GatewayError::CheckpointIo(format!("{}: {e}", path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_shared_per_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryCheckpointStore::new(dir.path()).unwrap();
        let a = store.open("orders").unwrap();
        let b = store.open("orders").unwrap();
        let c = store.open("payments").unwrap();
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
    }

    #[test]
    fn list_reports_written_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryCheckpointStore::new(dir.path().join("checkpoints")).unwrap();
        store.open("b").unwrap().lock().set_block_number(1).unwrap();
        store.open("a").unwrap().lock().set_block_number(1).unwrap();
        // opened but never written
        store.open("c").unwrap();
        fs::write(store.dir().join("notes.txt"), b"ignored").unwrap();

        assert_eq!(store.list().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn delete_removes_file_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryCheckpointStore::new(dir.path()).unwrap();
        store.open("orders").unwrap().lock().set_block_number(9).unwrap();

        store.delete("orders").unwrap();
        store.delete("orders").unwrap();
        assert!(store.list().unwrap().is_empty());
        assert_eq!(store.open("orders").unwrap().block_number().unwrap(), None);
    }

    #[test]
    fn path_like_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryCheckpointStore::new(dir.path()).unwrap();
        assert!(store.open("../escape").is_err());
        assert!(store.open("").is_err());
    }
}
