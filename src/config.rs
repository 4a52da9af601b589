//! Configuration.
//!
//! The daemon reads one YAML document; keys are addressed with colon paths
//! (`service:sync:interval`). [`CoreSettings`] resolves every key the core
//! consumes, applying defaults for the ones that are absent.

use std::path::Path;
use std::time::Duration;

use serde_yaml::Value;
use sha2::{Digest, Sha256};

use crate::error::{Result, TsuruError};
use crate::event::DEFAULT_EVENT_RETENTION;

/// Parsed YAML configuration with colon-path lookup.
#[derive(Debug, Clone, Default)]
pub struct Config {
    root: Value,
}

impl Config {
    pub fn empty() -> Self {
        Self {
            root: Value::Mapping(Default::default()),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(yaml)
            .map_err(|e| TsuruError::Config(format!("parse error: {e}")))?;
        let root = match root {
            Value::Null => Value::Mapping(Default::default()),
            Value::Mapping(_) => root,
            _ => {
                return Err(TsuruError::Config(
                    "top level of the configuration must be a mapping".into(),
                ))
            }
        };
        Ok(Self { root })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| TsuruError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(&content)
    }

    /// Sets `key` to `value`, creating intermediate mappings.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let mut node = &mut self.root;
        for segment in key.split(':') {
            if !node.is_mapping() {
                *node = Value::Mapping(Default::default());
            }
            let Some(map) = node.as_mapping_mut() else {
                return;
            };
            node = map
                .entry(Value::String(segment.to_string()))
                .or_insert(Value::Null);
        }
        *node = value.into();
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut node = &self.root;
        for segment in key.split(':') {
            node = node.as_mapping()?.get(segment)?;
        }
        if node.is_null() {
            None
        } else {
            Some(node)
        }
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => s
                .parse()
                .map(Some)
                .map_err(|_| invalid(key, "a boolean")),
            Some(_) => Err(invalid(key, "a boolean")),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| invalid(key, "an integer")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| invalid(key, "an integer")),
            Some(_) => Err(invalid(key, "an integer")),
        }
    }

    pub fn get_float(&self, key: &str) -> Result<Option<f64>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| invalid(key, "a number")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| invalid(key, "a number")),
            Some(_) => Err(invalid(key, "a number")),
        }
    }

    /// Bare numbers are seconds; strings accept `ms`, `s`, `m` and `h` suffixes.
    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => {
                let secs = n.as_f64().ok_or_else(|| invalid(key, "a duration"))?;
                if secs < 0.0 {
                    return Err(invalid(key, "a non-negative duration"));
                }
                Ok(Some(Duration::from_secs_f64(secs)))
            }
            Some(Value::String(s)) => parse_duration(s)
                .map(Some)
                .ok_or_else(|| invalid(key, "a duration")),
            Some(_) => Err(invalid(key, "a duration")),
        }
    }

    pub fn get_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Sequence(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    Value::Bool(b) => Ok(b.to_string()),
                    _ => Err(invalid(key, "a list of scalars")),
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(Value::String(s)) => Ok(Some(vec![s.clone()])),
            Some(_) => Err(invalid(key, "a list")),
        }
    }
}

fn invalid(key: &str, expected: &str) -> TsuruError {
    TsuruError::Config(format!("value for {key:?} must be {expected}"))
}

fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (number, factor_ms) = if let Some(n) = raw.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = raw.strip_suffix('s') {
        (n, 1_000.0)
    } else if let Some(n) = raw.strip_suffix('m') {
        (n, 60_000.0)
    } else if let Some(n) = raw.strip_suffix('h') {
        (n, 3_600_000.0)
    } else {
        (raw, 1_000.0)
    };
    let value: f64 = number.trim().parse().ok()?;
    if value < 0.0 || !value.is_finite() {
        return None;
    }
    Some(Duration::from_secs_f64(value * factor_ms / 1_000.0))
}

// ============================================================================
// CORE SETTINGS
// ============================================================================

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_WEBHOOK_BUFFER_SIZE: usize = 1000;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOG_LEVEL: &str = "tsuru_core=info";

/// Queue connection settings. The queue itself lives outside the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub mongo_url: String,
    pub mongo_database: String,
    pub polling_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            mongo_url: "127.0.0.1:27017".to_string(),
            mongo_database: "queuedb".to_string(),
            polling_interval: Duration::from_secs(1),
        }
    }
}

/// Every setting the core reads, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreSettings {
    pub sync_interval: Duration,
    pub peer_token: String,
    pub queue: QueueSettings,
    pub webhook_buffer_size: usize,
    /// Header used to forward the caller's request id to service endpoints.
    pub request_id_header: Option<String>,
    /// Per-service limit on concurrent unit binds; 0 disables the limit.
    pub bind_unit_max_concurrency: usize,
    pub shutdown_timeout: Duration,
    pub log_level: String,
    /// Finished events the in-memory journal keeps.
    pub event_retention: usize,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            peer_token: default_peer_token(),
            queue: QueueSettings::default(),
            webhook_buffer_size: DEFAULT_WEBHOOK_BUFFER_SIZE,
            request_id_header: None,
            bind_unit_max_concurrency: 0,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            event_retention: DEFAULT_EVENT_RETENTION,
        }
    }
}

impl CoreSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let defaults = Self::default();
        let queue = QueueSettings {
            mongo_url: config
                .get_string("queue:mongo-url")
                .unwrap_or(defaults.queue.mongo_url),
            mongo_database: config
                .get_string("queue:mongo-database")
                .unwrap_or(defaults.queue.mongo_database),
            polling_interval: config
                .get_duration("queue:mongo-polling-interval")?
                .unwrap_or(defaults.queue.polling_interval),
        };
        let webhook_buffer_size = match config.get_int("events:webhooks:buffer-size")? {
            Some(n) if n > 0 => n as usize,
            Some(_) => return Err(invalid("events:webhooks:buffer-size", "positive")),
            None => defaults.webhook_buffer_size,
        };
        let bind_unit_max_concurrency = match config.get_int("service:bind-unit:max-concurrency")? {
            Some(n) if n >= 0 => n as usize,
            Some(_) => {
                return Err(invalid(
                    "service:bind-unit:max-concurrency",
                    "zero or positive",
                ))
            }
            None => 0,
        };
        let event_retention = match config.get_int("events:journal:retention")? {
            Some(n) if n > 0 => n as usize,
            Some(_) => return Err(invalid("events:journal:retention", "positive")),
            None => defaults.event_retention,
        };
        Ok(Self {
            sync_interval: config
                .get_duration("service:sync:interval")?
                .unwrap_or(defaults.sync_interval),
            peer_token: config
                .get_string("auth:peer:token")
                .filter(|t| !t.is_empty())
                .unwrap_or(defaults.peer_token),
            queue,
            webhook_buffer_size,
            request_id_header: config
                .get_string("request-id-header")
                .filter(|h| !h.is_empty()),
            bind_unit_max_concurrency,
            shutdown_timeout: config
                .get_duration("shutdown:timeout")?
                .unwrap_or(defaults.shutdown_timeout),
            log_level: config
                .get_string("log:level")
                .unwrap_or(defaults.log_level),
            event_retention,
        })
    }
}

/// Hex SHA-256 of `tsuru`.
pub fn default_peer_token() -> String {
    hex::encode(Sha256::digest(b"tsuru"))
}
