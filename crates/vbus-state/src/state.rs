//! Typed flags that must survive reboots, e.g. a bitrate confirmed on a previous
//! boot. Every write is committed to the backing store before it returns, and a
//! failed commit leaves the in-memory view unchanged.
//!
//! Reads never fail: an absent flag, a flag of another type or undecodable hex
//! yields the zero value (`0`, `""`, `false`, `None`).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::store::{Flags, JsonFileStore, MemoryStore, StateStore, StoredValue};
use crate::{Result, StateError, StateKey};

/// Cached view of one store. Open a single instance per state file.
pub struct PersistedState {
    store: Box<dyn StateStore>,
    flags: Mutex<Flags>,
}

impl PersistedState {
    /// Load every flag from `store`.
    pub fn new(store: impl StateStore + 'static) -> Result<Self> {
        let flags = store.load().map_err(StateError::StorageLoad)?;
        debug!("loaded {} persisted flags", flags.len());
        Ok(Self {
            store: Box::new(store),
            flags: Mutex::new(flags),
        })
    }

    /// Open (or start) the JSON state file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(JsonFileStore::new(path.as_ref()))
    }

    pub fn in_memory() -> Self {
        Self {
            store: Box::new(MemoryStore::new()),
            flags: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn commit_with(&self, key: Option<StateKey>, edit: impl FnOnce(&mut Flags)) -> Result<()> {
        let mut flags = self.lock();
        let mut next = flags.clone();
        edit(&mut next);
        if let Err(source) = self.store.commit(&next) {
            return Err(match key {
                Some(key) => {
                    error!("Unable to persist flag {key}: {source}");
                    StateError::StorageWriteFailed { key, source }
                }
                None => {
                    error!("Unable to clear persisted state: {source}");
                    StateError::ClearFailed(source)
                }
            });
        }
        *flags = next;
        Ok(())
    }

    fn put(&self, key: StateKey, value: StoredValue) -> Result<()> {
        self.commit_with(Some(key), |flags| {
            flags.insert(key.0, value);
        })
    }

    pub fn write_int(&self, key: StateKey, value: i32) -> Result<()> {
        self.put(key, StoredValue::Int(value))
    }

    pub fn write_long(&self, key: StateKey, value: i64) -> Result<()> {
        self.put(key, StoredValue::Long(value))
    }

    pub fn write_string(&self, key: StateKey, value: &str) -> Result<()> {
        self.put(key, StoredValue::Text(value.to_string()))
    }

    /// Stored as an int flag (1/0), readable with [`PersistedState::read_bool`].
    pub fn write_bool(&self, key: StateKey, value: bool) -> Result<()> {
        self.write_int(key, i32::from(value))
    }

    /// Stored as upper-case hex text. An empty array reads back as `None`.
    pub fn write_bytes(&self, key: StateKey, value: &[u8]) -> Result<()> {
        self.put(key, StoredValue::Text(hex::encode_upper(value)))
    }

    pub fn remove(&self, key: StateKey) -> Result<()> {
        self.commit_with(Some(key), |flags| {
            flags.remove(&key.0);
        })
    }

    /// Erase every flag, restoring factory defaults.
    pub fn clear_all(&self) -> Result<()> {
        self.commit_with(None, Flags::clear)
    }

    pub fn get(&self, key: StateKey) -> Option<StoredValue> {
        self.lock().get(&key.0).cloned()
    }

    pub fn contains(&self, key: StateKey) -> bool {
        self.lock().contains_key(&key.0)
    }

    pub fn keys(&self) -> Vec<StateKey> {
        self.lock().keys().copied().map(StateKey).collect()
    }

    fn typed<T>(
        &self,
        key: StateKey,
        expected: &'static str,
        pick: impl FnOnce(&StoredValue) -> Option<T>,
    ) -> Result<Option<T>> {
        let flags = self.lock();
        let Some(value) = flags.get(&key.0) else {
            return Ok(None);
        };
        pick(value).map(Some).ok_or(StateError::TypeMismatch {
            key,
            expected,
            found: value.type_name(),
        })
    }

    fn or_default<T: Default>(key: StateKey, got: Result<Option<T>>) -> T {
        match got {
            Ok(v) => v.unwrap_or_default(),
            Err(e) => {
                warn!("read of flag {key} defaulted: {e}");
                T::default()
            }
        }
    }

    pub fn read_int(&self, key: StateKey) -> i32 {
        let got = self.typed(key, "int", |v| match v {
            StoredValue::Int(i) => Some(*i),
            _ => None,
        });
        Self::or_default(key, got)
    }

    pub fn read_long(&self, key: StateKey) -> i64 {
        let got = self.typed(key, "long", |v| match v {
            StoredValue::Long(l) => Some(*l),
            _ => None,
        });
        Self::or_default(key, got)
    }

    pub fn read_string(&self, key: StateKey) -> String {
        let got = self.typed(key, "text", |v| match v {
            StoredValue::Text(s) => Some(s.clone()),
            _ => None,
        });
        Self::or_default(key, got)
    }

    /// Non-zero int flags are true.
    pub fn read_bool(&self, key: StateKey) -> bool {
        self.read_int(key) != 0
    }

    pub fn read_bytes(&self, key: StateKey) -> Option<Vec<u8>> {
        let text = self.read_string(key);
        if text.is_empty() {
            return None;
        }
        match hex::decode(&text) {
            Ok(bytes) => Some(bytes),
            Err(source) => {
                warn!(
                    "read of flag {key} defaulted: {}",
                    StateError::InvalidHex { key, source }
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_keys_read_as_zero_values() {
        let state = PersistedState::in_memory();
        let key = StateKey(4242);
        assert_eq!(state.read_int(key), 0);
        assert_eq!(state.read_long(key), 0);
        assert_eq!(state.read_string(key), "");
        assert!(!state.read_bool(key));
        assert_eq!(state.read_bytes(key), None);
        assert!(!state.contains(key));
    }

    #[test]
    fn each_kind_reads_back_exactly() {
        let state = PersistedState::in_memory();
        state.write_int(StateKey::CAN_BITRATE, 250).unwrap();
        state.write_long(StateKey(300), i64::MIN).unwrap();
        state.write_string(StateKey(301), "ids=100,200").unwrap();
        state
            .write_bytes(StateKey::CAN_FILTER_IDS, &[0x00, 0xFF, 0x7F, 0x00])
            .unwrap();

        assert_eq!(state.read_int(StateKey::CAN_BITRATE), 250);
        assert_eq!(state.read_long(StateKey(300)), i64::MIN);
        assert_eq!(state.read_string(StateKey(301)), "ids=100,200");
        assert_eq!(
            state.read_bytes(StateKey::CAN_FILTER_IDS),
            Some(vec![0x00, 0xFF, 0x7F, 0x00])
        );
        assert_eq!(
            state.get(StateKey::CAN_FILTER_IDS),
            Some(StoredValue::Text("00FF7F00".into()))
        );
    }

    #[test]
    fn bool_flags_follow_int_value() {
        let state = PersistedState::in_memory();
        state.write_bool(StateKey::FLAG_CAN_ON, true).unwrap();
        assert!(state.read_bool(StateKey::FLAG_CAN_ON));
        assert_eq!(state.read_int(StateKey::FLAG_CAN_ON), 1);
        state.write_int(StateKey::FLAG_CAN_ON, -7).unwrap();
        assert!(state.read_bool(StateKey::FLAG_CAN_ON));
        state.write_bool(StateKey::FLAG_CAN_ON, false).unwrap();
        assert!(!state.read_bool(StateKey::FLAG_CAN_ON));
    }

    #[test]
    fn empty_byte_array_reads_as_none() {
        let state = PersistedState::in_memory();
        state.write_bytes(StateKey(5), &[]).unwrap();
        assert!(state.contains(StateKey(5)));
        assert_eq!(state.read_bytes(StateKey(5)), None);
    }

    #[test]
    fn mismatched_or_bad_values_default() {
        let state = PersistedState::in_memory();
        state.write_string(StateKey(7), "not hex!").unwrap();
        assert_eq!(state.read_int(StateKey(7)), 0);
        assert_eq!(state.read_bytes(StateKey(7)), None);
        state.write_int(StateKey(8), 3).unwrap();
        assert_eq!(state.read_long(StateKey(8)), 0);
        assert_eq!(state.read_string(StateKey(8)), "");
    }

    #[test]
    fn failed_commit_is_surfaced_and_not_applied() {
        let store = MemoryStore::new();
        let state = PersistedState::new(store.clone()).unwrap();
        state.write_int(StateKey::CAN_CONFIRMED_BITRATE, 250).unwrap();

        store.set_fail_commits(true);
        let err = state
            .write_int(StateKey::CAN_CONFIRMED_BITRATE, 500)
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::StorageWriteFailed {
                key: StateKey::CAN_CONFIRMED_BITRATE,
                ..
            }
        ));
        assert_eq!(state.read_int(StateKey::CAN_CONFIRMED_BITRATE), 250);
        assert!(matches!(state.clear_all(), Err(StateError::ClearFailed(_))));
        assert!(state.contains(StateKey::CAN_CONFIRMED_BITRATE));
    }

    #[test]
    fn clear_and_remove() {
        let state = PersistedState::in_memory();
        state.write_int(StateKey::CAN_BITRATE, 500).unwrap();
        state.write_bool(StateKey::FLAG_J1708_ON, true).unwrap();
        state.remove(StateKey::CAN_BITRATE).unwrap();
        assert_eq!(state.keys(), vec![StateKey::FLAG_J1708_ON]);
        state.clear_all().unwrap();
        assert!(state.keys().is_empty());
        assert!(!state.read_bool(StateKey::FLAG_J1708_ON));
    }
}
