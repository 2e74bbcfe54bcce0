use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::CoreErr;
use crate::error::Result;

/// Byte-blob persistence keyed by slash-separated path. All operations are
/// synchronous; callers must serialize concurrent writes to the same path.
pub trait FileStore: Send + Sync {
    fn write(&self, path: &str, contents: &[u8]) -> Result<()>;

    /// Fails with [`CoreErr::NotFound`] when the path has never been written.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// All stored paths under `prefix`, in unspecified order.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn delete(&self, path: &str) -> Result<()>;
}

/// Backing store for tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemoryFileStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        // every operation leaves the map consistent, so a poisoned lock is
        // still safe to reuse
        match self.files.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl FileStore for InMemoryFileStore {
    fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.files().insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.files()
            .get(path)
            .cloned()
            .ok_or_else(|| CoreErr::NotFound(path.to_string()))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .files()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.files().remove(path);
        Ok(())
    }
}

/// Store rooted at a directory on the local filesystem. Paths are interpreted
/// relative to the root; parent directories are created on write.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn collect(&self, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.collect(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

impl FileStore for LocalFileStore {
    fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, contents)?;
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        match fs::read(self.full_path(path)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(CoreErr::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.full_path(prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        self.collect(&dir, &mut out)?;
        Ok(out)
    }

    fn delete(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.full_path(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn exercise(store: &dyn FileStore) {
        store.write("sessions/s1/events/0.json", b"{}").unwrap();
        store.write("sessions/s1/events/1.json", b"{}").unwrap();
        store.write("sessions/s2/events/0.json", b"{}").unwrap();

        assert_eq!(store.read("sessions/s1/events/0.json").unwrap(), b"{}");

        let mut listed = store.list("sessions/s1/").unwrap();
        listed.sort();
        assert_eq!(
            listed,
            vec![
                "sessions/s1/events/0.json".to_string(),
                "sessions/s1/events/1.json".to_string(),
            ]
        );

        store.delete("sessions/s1/events/0.json").unwrap();
        assert!(matches!(
            store.read("sessions/s1/events/0.json"),
            Err(CoreErr::NotFound(_))
        ));
        // deleting again is fine
        store.delete("sessions/s1/events/0.json").unwrap();
    }

    #[test]
    fn in_memory_store() {
        exercise(&InMemoryFileStore::new());
    }

    #[test]
    fn local_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&LocalFileStore::new(dir.path()));
    }

    #[test]
    fn read_of_missing_path_is_not_found() {
        let store = InMemoryFileStore::new();
        assert!(matches!(store.read("nope"), Err(CoreErr::NotFound(_))));
    }
}
