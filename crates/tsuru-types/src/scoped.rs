//! Persisted shape of a scoped config document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    /// `None` is a stored nil, distinct from an absent entry.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub inherited: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub name: String,
    #[serde(default)]
    pub envs: Vec<Entry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopedConfigDocument {
    pub scope: String,
    #[serde(default)]
    pub envs: Vec<Entry>,
    #[serde(default)]
    pub pools: Vec<PoolEntry>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}
