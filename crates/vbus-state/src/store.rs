use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::StoreError;

/// One persisted value. Byte arrays are kept as hex text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    Int(i32),
    Long(i64),
    Text(String),
}

impl StoredValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            StoredValue::Int(_) => "int",
            StoredValue::Long(_) => "long",
            StoredValue::Text(_) => "text",
        }
    }
}

pub type Flags = BTreeMap<u32, StoredValue>;

/// Durable backing for persisted flags. `commit` must not return until the full
/// flag set is durable.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<Flags, StoreError>;

    fn commit(&self, flags: &Flags) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    flags: Flags,
}

const STATE_FILE_VERSION: u32 = 1;

/// Distinguishes temp files of concurrent commits within one process.
static COMMIT_SEQ: AtomicU64 = AtomicU64::new(0);

/// JSON file replaced atomically on every commit (temp file, fsync, rename).
///
/// Each commit writes the full flag set, so keep one `PersistedState` per path:
/// a second instance would overwrite the first one's keys from its own cache.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<Flags, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Flags::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        let file: StateFile = serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        Ok(file.flags)
    }

    fn commit(&self, flags: &Flags) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(&StateFile {
            version: STATE_FILE_VERSION,
            flags: flags.clone(),
        })
        .map_err(StoreError::Encode)?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        if let Some(dir) = &parent {
            fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;
        }

        let seq = COMMIT_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self
            .path
            .with_extension(format!("tmp.{}.{seq}", std::process::id()));
        let mut file = File::create(&tmp_path).map_err(|e| self.io_err(e))?;
        file.write_all(&body).map_err(|e| self.io_err(e))?;
        file.sync_all().map_err(|e| self.io_err(e))?;
        drop(file);
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            self.io_err(e)
        })?;

        // Persist the rename itself; directories cannot be opened on every platform
        if let Some(dir) = parent {
            if let Ok(d) = File::open(dir) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryInner {
    flags: Flags,
    fail_commits: bool,
    commits: usize,
}

/// Process-local store. Clones share contents, so a second `PersistedState` built
/// on a clone sees what the first committed, like a process restart would.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every following commit fail until switched back.
    pub fn set_fail_commits(&self, fail: bool) {
        self.lock().fail_commits = fail;
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn snapshot(&self) -> Flags {
        self.lock().flags.clone()
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<Flags, StoreError> {
        Ok(self.lock().flags.clone())
    }

    fn commit(&self, flags: &Flags) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_commits {
            return Err(StoreError::Unavailable("commit refused".into()));
        }
        inner.flags = flags.clone();
        inner.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("state.json"));
        assert!(store.load().unwrap().is_empty());

        let mut flags = Flags::new();
        flags.insert(203, StoredValue::Int(250));
        flags.insert(300, StoredValue::Long(-1));
        flags.insert(204, StoredValue::Text("00FF".into()));
        store.commit(&flags).unwrap();

        assert_eq!(store.load().unwrap(), flags);
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn concurrent_commits_to_one_path_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let writers: Vec<_> = (0..4i32)
            .map(|t| {
                let store = JsonFileStore::new(&path);
                std::thread::spawn(move || {
                    let mut flags = Flags::new();
                    for i in 0..25 {
                        flags.insert(203, StoredValue::Int(t * 100 + i));
                        store.commit(&flags).map_err(|e| e.to_string())?;
                    }
                    Ok::<_, String>(())
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap().unwrap();
        }

        let flags = JsonFileStore::new(&path).load().unwrap();
        assert!(matches!(flags.get(&203), Some(StoredValue::Int(_))));
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{ not json").unwrap();
        let err = JsonFileStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn memory_store_refuses_commits_on_demand() {
        let store = MemoryStore::new();
        let mut flags = Flags::new();
        flags.insert(1, StoredValue::Int(1));
        store.set_fail_commits(true);
        assert!(store.commit(&flags).is_err());
        assert!(store.snapshot().is_empty());
        store.set_fail_commits(false);
        store.commit(&flags).unwrap();
        assert_eq!(store.commits(), 1);
    }
}
