//! Layered key/value configuration.
//!
//! A [`ScopedConfig`] holds base entries and per-pool overrides for one
//! scope. Reading a pool resolves each key to the pool's entry when it has a
//! non-nil value, else to the base entry. Keys compare case-insensitively.
//! Changes stay in memory until [`ScopedConfig::save_envs`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use tsuru_types::{Entry, PoolEntry, ScopedConfigDocument};

use crate::error::{Result, TsuruError};
use crate::storage::ScopedConfigStorage;

/// Entries keyed by lower-cased name.
pub type EntryMap = BTreeMap<String, Entry>;

const INHERITED_SUFFIX: &str = "inherited";

/// Null, `""`, `0`, `false` and empty collections.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
    }
}

/// Strings render bare, nil renders empty, anything else as JSON.
pub fn render_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn is_inherited_key(name: &str) -> bool {
    name.to_lowercase().ends_with(INHERITED_SUFFIX)
}

#[derive(Default)]
struct ScopedState {
    envs: EntryMap,
    pools: BTreeMap<String, EntryMap>,
}

pub struct ScopedConfig {
    scope: String,
    storage: Arc<dyn ScopedConfigStorage>,
    write_empty: bool,
    state: Mutex<ScopedState>,
}

impl ScopedConfig {
    /// Loads `scope`; a missing document starts empty.
    pub async fn load(scope: &str, storage: Arc<dyn ScopedConfigStorage>) -> Result<Self> {
        let mut state = ScopedState::default();
        if let Some(doc) = storage.find_scoped_config(scope).await? {
            for entry in doc.envs {
                state.envs.insert(entry.name.to_lowercase(), entry);
            }
            for pool in doc.pools {
                let map = state.pools.entry(pool.name).or_default();
                for entry in pool.envs {
                    map.insert(entry.name.to_lowercase(), entry);
                }
            }
        }
        Ok(Self {
            scope: scope.to_string(),
            storage,
            write_empty: false,
            state: Mutex::new(state),
        })
    }

    /// Keep entries with empty values instead of deleting them.
    pub fn with_write_empty(mut self, write_empty: bool) -> Self {
        self.write_empty = write_empty;
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn lock(&self) -> MutexGuard<'_, ScopedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn put(write_empty: bool, map: &mut EntryMap, entry: Entry) {
        let key = entry.name.to_lowercase();
        let empty = entry.value.as_ref().map_or(true, is_empty_value);
        if empty && !write_empty {
            map.remove(&key);
        } else {
            map.insert(key, entry);
        }
    }

    // ── Writes ──

    pub fn add(&self, name: &str, value: impl Into<Value>) {
        self.add_entry(Entry {
            name: name.to_string(),
            value: Some(value.into()),
            ..Default::default()
        });
    }

    pub fn add_entry(&self, entry: Entry) {
        let mut state = self.lock();
        Self::put(self.write_empty, &mut state.envs, entry);
    }

    pub fn add_pool(&self, pool: &str, name: &str, value: impl Into<Value>) {
        self.add_pool_entry(
            pool,
            Entry {
                name: name.to_string(),
                value: Some(value.into()),
                ..Default::default()
            },
        );
    }

    pub fn add_pool_entry(&self, pool: &str, entry: Entry) {
        let mut state = self.lock();
        let map = state.pools.entry(pool.to_string()).or_default();
        Self::put(self.write_empty, map, entry);
    }

    pub fn remove(&self, name: &str) {
        self.lock().envs.remove(&name.to_lowercase());
    }

    pub fn remove_pool(&self, pool: &str, name: &str) {
        let mut state = self.lock();
        if let Some(map) = state.pools.get_mut(pool) {
            map.remove(&name.to_lowercase());
        }
    }

    // ── Reads ──

    pub fn entries(&self) -> Vec<Entry> {
        self.lock().envs.values().cloned().collect()
    }

    pub fn pools(&self) -> Vec<String> {
        self.lock().pools.keys().cloned().collect()
    }

    /// Base entries marked inherited, overridden by the pool's non-nil
    /// entries. The empty pool name returns the base entries.
    pub fn pool_entries(&self, pool: &str) -> EntryMap {
        let state = self.lock();
        let mut merged: EntryMap = state
            .envs
            .iter()
            .map(|(key, entry)| {
                let mut entry = entry.clone();
                entry.inherited = !pool.is_empty();
                (key.clone(), entry)
            })
            .collect();
        if pool.is_empty() {
            return merged;
        }
        if let Some(overrides) = state.pools.get(pool) {
            for (key, entry) in overrides {
                if entry.value.as_ref().map_or(false, |v| !v.is_null()) {
                    let mut entry = entry.clone();
                    entry.inherited = false;
                    merged.insert(key.clone(), entry);
                }
            }
        }
        merged
    }

    /// Resolved value of `name` in `pool`, rendered as a string.
    pub fn pool_entry(&self, pool: &str, name: &str) -> String {
        let key = name.to_lowercase();
        let state = self.lock();
        if !pool.is_empty() {
            if let Some(value) = state
                .pools
                .get(pool)
                .and_then(|m| m.get(&key))
                .and_then(|e| e.value.as_ref())
                .filter(|v| !v.is_null())
            {
                return render_value(Some(value));
            }
        }
        render_value(state.envs.get(&key).and_then(|e| e.value.as_ref()))
    }

    // ── Structs ──

    /// Stores every field of `value` as a base entry, zero values included,
    /// so the struct can be read back. Fields whose name ends with
    /// `inherited` are skipped.
    pub fn marshal<T: Serialize>(&self, value: &T) -> Result<()> {
        self.marshal_into(None, value)
    }

    pub fn marshal_pool<T: Serialize>(&self, pool: &str, value: &T) -> Result<()> {
        self.marshal_into(Some(pool), value)
    }

    fn marshal_into<T: Serialize>(&self, pool: Option<&str>, value: &T) -> Result<()> {
        let Value::Object(fields) = serde_json::to_value(value)? else {
            return Err(TsuruError::InvalidInput(
                "scoped config values must serialize to an object".to_string(),
            ));
        };
        let mut state = self.lock();
        for (name, field) in fields {
            if is_inherited_key(&name) {
                continue;
            }
            let entry = Entry {
                name,
                value: Some(field),
                ..Default::default()
            };
            let map = match pool {
                None => &mut state.envs,
                Some(pool) => state.pools.entry(pool.to_string()).or_default(),
            };
            Self::put(true, map, entry);
        }
        Ok(())
    }

    /// Builds `T` from the entries resolved for `pool`. For each entry a
    /// `<name>Inherited` flag is offered too; structs without it ignore it.
    pub fn unmarshal<T: DeserializeOwned>(&self, pool: &str) -> Result<T> {
        let mut object = Map::new();
        for entry in self.pool_entries(pool).into_values() {
            object.insert(
                format!("{}Inherited", entry.name),
                Value::Bool(entry.inherited),
            );
            object.insert(entry.name, entry.value.unwrap_or(Value::Null));
        }
        Ok(serde_json::from_value(Value::Object(object))?)
    }

    // ── Persistence ──

    /// Sets `extra[name]` unless another writer already set it. `Ok(false)`
    /// when someone else won.
    pub async fn set_extra_atomic(&self, name: &str, value: impl Into<Value>) -> Result<bool> {
        self.storage
            .set_scoped_extra_if_empty(&self.scope, name, &value.into())
            .await
    }

    pub async fn set_extra(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.storage
            .set_scoped_extra(&self.scope, name, &value.into())
            .await
    }

    pub async fn extra(&self, name: &str) -> Result<Option<Value>> {
        Ok(self
            .storage
            .find_scoped_config(&self.scope)
            .await?
            .and_then(|mut doc| doc.extra.remove(name)))
    }

    /// Writes `envs` and `pools`; `extra` is left untouched.
    pub async fn save_envs(&self) -> Result<()> {
        let document = {
            let state = self.lock();
            ScopedConfigDocument {
                scope: self.scope.clone(),
                envs: state.envs.values().cloned().collect(),
                pools: state
                    .pools
                    .iter()
                    .filter(|(_, envs)| !envs.is_empty())
                    .map(|(name, envs)| PoolEntry {
                        name: name.clone(),
                        envs: envs.values().cloned().collect(),
                    })
                    .collect(),
                extra: BTreeMap::new(),
            }
        };
        self.storage.save_scoped_envs(&document).await?;
        tracing::debug!(scope = %self.scope, "scoped config saved");
        Ok(())
    }
}
