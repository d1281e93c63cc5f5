//! A persistable key-value store with prefix-segregated table namespaces,
//! used to cache derived values between analysis sessions.
//!
//! The store is an explicit handle threaded through the API rather than
//! process-wide state; every table carries its own namespace prefix so
//! collisions between tables are impossible by construction.

use crate::utils;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    marker::PhantomData,
    path::Path,
    sync::Mutex,
};

/// Bumped whenever the on-disk layout changes; a mismatch on load yields
/// [`UnusedReason::Stale`].
const STORE_FORMAT_VERSION: &str = "sourcedb-store-1";

const FORMAT_KEY: &str = "$format";

/// The backing storage shared by all tables.
///
/// Interior mutability lets the single writer add entries through a shared
/// handle while readers consult the same handle between updates.
#[derive(Debug, Default)]
pub struct SharedStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every entry in every table. Test support.
    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Persists the store to the given path.
    ///
    /// Save failures are logged and swallowed: a missing saved state only
    /// costs the next session a recomputation.
    pub fn save(&self, path: &Path) {
        let mut entries = self.lock().clone();
        entries.insert(FORMAT_KEY.to_string(), Value::String(STORE_FORMAT_VERSION.to_string()));
        if let Err(error) = utils::write_json_file(&entries, path) {
            warn!(path = %path.display(), %error, "failed to save shared store");
        }
    }

    /// Loads a previously saved store.
    ///
    /// Returns [`LoadOutcome::Unused`] when the file cannot be read or was
    /// written by an incompatible version; callers recover by recomputing.
    pub fn load(path: &Path) -> LoadOutcome {
        let mut entries: BTreeMap<String, Value> = match utils::read_json_file(path) {
            Ok(entries) => entries,
            Err(error) => return LoadOutcome::Unused(UnusedReason::LoadError(error.to_string())),
        };
        match entries.remove(FORMAT_KEY) {
            Some(Value::String(version)) if version == STORE_FORMAT_VERSION => {}
            _ => return LoadOutcome::Unused(UnusedReason::Stale),
        }
        LoadOutcome::Loaded(Self { entries: Mutex::new(entries) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Result of attempting to re-attach to a saved store.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(SharedStore),
    Unused(UnusedReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnusedReason {
    /// The saved state could not be read or parsed.
    LoadError(String),
    /// The saved state was written by an incompatible version.
    Stale,
}

/// A typed key-value namespace inside a [`SharedStore`].
///
/// Tables are cheap descriptors: the data lives in the store handle passed
/// to every operation. Two tables with different prefixes never observe
/// each other's entries.
#[derive(Debug)]
pub struct Table<K, V> {
    prefix: &'static str,
    _marker: PhantomData<fn(K) -> V>,
}

impl<K, V> Table<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    pub const fn new(prefix: &'static str) -> Self {
        Self { prefix, _marker: PhantomData }
    }

    fn storage_key(&self, key: &K) -> String {
        // serde_json keys are deterministic for a given value
        let serialized = serde_json::to_string(key).unwrap_or_else(|_| String::from("null"));
        format!("{}\u{1}{}", self.prefix, serialized)
    }

    fn is_own_key<'a>(&self, storage_key: &'a str) -> Option<&'a str> {
        let rest = storage_key.strip_prefix(self.prefix)?;
        rest.strip_prefix('\u{1}')
    }

    pub fn add(&self, store: &SharedStore, key: &K, value: &V) {
        if let Ok(value) = serde_json::to_value(value) {
            store.lock().insert(self.storage_key(key), value);
        }
    }

    pub fn get(&self, store: &SharedStore, key: &K) -> Option<V> {
        let value = store.lock().get(&self.storage_key(key))?.clone();
        serde_json::from_value(value).ok()
    }

    pub fn mem(&self, store: &SharedStore, key: &K) -> bool {
        store.lock().contains_key(&self.storage_key(key))
    }

    pub fn get_batch(&self, store: &SharedStore, keys: &[K]) -> Vec<Option<V>> {
        let entries = store.lock();
        keys.iter()
            .map(|key| {
                entries
                    .get(&self.storage_key(key))
                    .cloned()
                    .and_then(|value| serde_json::from_value(value).ok())
            })
            .collect()
    }

    pub fn remove_batch(&self, store: &SharedStore, keys: &[K]) {
        let mut entries = store.lock();
        for key in keys {
            entries.remove(&self.storage_key(key));
        }
    }

    /// Bulk-inserts an association list.
    pub fn of_alist(&self, store: &SharedStore, pairs: &[(K, V)]) {
        let mut entries = store.lock();
        for (key, value) in pairs {
            if let Ok(value) = serde_json::to_value(value) {
                entries.insert(self.storage_key(key), value);
            }
        }
    }

    /// Dumps the table as an association list, sorted by storage key.
    pub fn to_alist(&self, store: &SharedStore) -> Vec<(K, V)> {
        let entries = store.lock();
        entries
            .iter()
            .filter_map(|(storage_key, value)| {
                let raw_key = self.is_own_key(storage_key)?;
                let key = serde_json::from_str(raw_key).ok()?;
                let value = serde_json::from_value(value.clone()).ok()?;
                Some((key, value))
            })
            .collect()
    }

    /// Records the table's current key set in the companion single-value
    /// table, so a later session can re-attach to the same entries.
    pub fn write_handle(&self, store: &SharedStore) {
        let keys: Vec<String> = {
            let entries = store.lock();
            entries
                .keys()
                .filter_map(|storage_key| self.is_own_key(storage_key))
                .map(str::to_string)
                .collect()
        };
        self.handle_table().set(store, &keys);
    }

    /// The key set recorded by [`Self::write_handle`], if any.
    pub fn read_handle(&self, store: &SharedStore) -> Option<Vec<K>> {
        let keys = self.handle_table().get(store)?;
        keys.iter().map(|raw| serde_json::from_str(raw).ok()).collect()
    }

    fn handle_table(&self) -> SingleValueTable<Vec<String>> {
        SingleValueTable { prefix: self.prefix, _marker: PhantomData }
    }
}

/// A namespace holding at most one value, e.g. a table handle.
#[derive(Debug)]
pub struct SingleValueTable<V> {
    prefix: &'static str,
    _marker: PhantomData<fn() -> V>,
}

impl<V> SingleValueTable<V>
where
    V: Serialize + DeserializeOwned,
{
    pub const fn new(prefix: &'static str) -> Self {
        Self { prefix, _marker: PhantomData }
    }

    fn storage_key(&self) -> String {
        format!("{}\u{2}", self.prefix)
    }

    pub fn set(&self, store: &SharedStore, value: &V) {
        if let Ok(value) = serde_json::to_value(value) {
            store.lock().insert(self.storage_key(), value);
        }
    }

    pub fn get(&self, store: &SharedStore) -> Option<V> {
        let value = store.lock().get(&self.storage_key())?.clone();
        serde_json::from_value(value).ok()
    }

    pub fn remove(&self, store: &SharedStore) {
        store.lock().remove(&self.storage_key());
    }
}
