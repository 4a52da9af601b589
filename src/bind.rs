//! The application capability consumed by the bind pipelines.
//!
//! Only the operations the pipelines actually call are part of [`App`]:
//! naming, unit listing, and injecting or removing a service instance's
//! env vars. Provisioning and routing live elsewhere.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use tsuru_types::{EnvVar, ServiceEnvVar, ServiceInstanceEnvs, Unit};

use crate::error::Result;

/// Env var holding the JSON envelope of every bound instance.
pub const TSURU_SERVICES_ENV: &str = "TSURU_SERVICES";

/// Progress lines produced while binding, forwarded to the caller.
pub trait OutputWriter: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Discards everything.
pub struct NullWriter;

impl OutputWriter for NullWriter {
    fn write_line(&self, _line: &str) {}
}

/// Collects lines in memory.
#[derive(Default)]
pub struct BufferWriter {
    lines: Mutex<Vec<String>>,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl OutputWriter for BufferWriter {
    fn write_line(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

#[derive(Clone)]
pub struct AddInstanceArgs {
    pub envs: Vec<ServiceEnvVar>,
    pub should_restart: bool,
    pub writer: Arc<dyn OutputWriter>,
}

#[derive(Clone)]
pub struct RemoveInstanceArgs {
    pub service_name: String,
    pub instance_name: String,
    pub should_restart: bool,
    pub writer: Arc<dyn OutputWriter>,
}

#[async_trait]
pub trait App: Send + Sync {
    fn name(&self) -> &str;
    fn ip(&self) -> &str;
    async fn units(&self) -> Result<Vec<Unit>>;
    async fn add_instance(&self, args: AddInstanceArgs) -> Result<()>;
    async fn remove_instance(&self, args: RemoveInstanceArgs) -> Result<()>;
    /// Env vars injected by `instance_name`, keyed by var name.
    async fn instance_env(&self, instance_name: &str) -> Result<BTreeMap<String, EnvVar>>;
}

/// Builds the `TSURU_SERVICES` value: `{service: [{instance_name, envs}]}`,
/// instances in first-seen order.
pub fn services_envelope(envs: &[ServiceEnvVar]) -> Value {
    let mut by_service: BTreeMap<&str, Vec<ServiceInstanceEnvs>> = BTreeMap::new();
    for env in envs {
        let instances = by_service.entry(env.service_name.as_str()).or_default();
        let pos = match instances
            .iter()
            .position(|i| i.instance_name == env.instance_name)
        {
            Some(pos) => pos,
            None => {
                instances.push(ServiceInstanceEnvs {
                    instance_name: env.instance_name.clone(),
                    envs: BTreeMap::new(),
                });
                instances.len() - 1
            }
        };
        instances[pos]
            .envs
            .insert(env.env.name.clone(), env.env.value.clone());
    }
    serde_json::to_value(by_service).unwrap_or(Value::Null)
}

// ============================================================================
// IN-MEMORY APP
// ============================================================================

/// App whose state lives in process memory.
pub struct InMemoryApp {
    name: String,
    ip: String,
    units: Mutex<Vec<Unit>>,
    service_envs: Mutex<Vec<ServiceEnvVar>>,
    restarts: Mutex<usize>,
}

impl InMemoryApp {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, units: Vec<Unit>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            units: Mutex::new(units),
            service_envs: Mutex::new(Vec::new()),
            restarts: Mutex::new(0),
        }
    }

    pub fn set_units(&self, units: Vec<Unit>) {
        *self.units.lock().unwrap_or_else(|e| e.into_inner()) = units;
    }

    pub fn service_envs(&self) -> Vec<ServiceEnvVar> {
        self.service_envs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn restarts(&self) -> usize {
        *self.restarts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Effective environment: every service var plus `TSURU_SERVICES`.
    pub fn env(&self) -> BTreeMap<String, EnvVar> {
        let envs = self.service_envs();
        let mut out: BTreeMap<String, EnvVar> = envs
            .iter()
            .map(|e| (e.env.name.clone(), e.env.clone()))
            .collect();
        out.insert(
            TSURU_SERVICES_ENV.to_string(),
            EnvVar {
                name: TSURU_SERVICES_ENV.to_string(),
                value: services_envelope(&envs).to_string(),
                public: false,
            },
        );
        out
    }

    fn restart(&self, writer: &dyn OutputWriter) {
        *self.restarts.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        writer.write_line(&format!("---- Restarting the app {:?} ----", self.name));
    }
}

#[async_trait]
impl App for InMemoryApp {
    fn name(&self) -> &str {
        &self.name
    }

    fn ip(&self) -> &str {
        &self.ip
    }

    async fn units(&self) -> Result<Vec<Unit>> {
        Ok(self.units.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn add_instance(&self, args: AddInstanceArgs) -> Result<()> {
        {
            let mut current = self.service_envs.lock().unwrap_or_else(|e| e.into_inner());
            for env in args.envs {
                current.retain(|e| {
                    !(e.service_name == env.service_name
                        && e.instance_name == env.instance_name
                        && e.env.name == env.env.name)
                });
                current.push(env);
            }
        }
        if args.should_restart {
            self.restart(args.writer.as_ref());
        }
        Ok(())
    }

    async fn remove_instance(&self, args: RemoveInstanceArgs) -> Result<()> {
        self.service_envs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|e| {
                !(e.service_name == args.service_name && e.instance_name == args.instance_name)
            });
        if args.should_restart {
            self.restart(args.writer.as_ref());
        }
        Ok(())
    }

    async fn instance_env(&self, instance_name: &str) -> Result<BTreeMap<String, EnvVar>> {
        Ok(self
            .service_envs()
            .into_iter()
            .filter(|e| e.instance_name == instance_name)
            .map(|e| (e.env.name.clone(), e.env))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(service: &str, instance: &str, name: &str, value: &str) -> ServiceEnvVar {
        ServiceEnvVar {
            env: EnvVar {
                name: name.into(),
                value: value.into(),
                public: false,
            },
            service_name: service.into(),
            instance_name: instance.into(),
        }
    }

    #[test]
    fn envelope_groups_by_service_and_instance() {
        let envelope = services_envelope(&[
            var("mysql", "db1", "USER", "root"),
            var("mysql", "db1", "PASS", "x"),
            var("mysql", "db2", "USER", "admin"),
            var("redis", "cache", "HOST", "10.0.0.1"),
        ]);
        assert_eq!(
            envelope,
            serde_json::json!({
                "mysql": [
                    {"instance_name": "db1", "envs": {"USER": "root", "PASS": "x"}},
                    {"instance_name": "db2", "envs": {"USER": "admin"}}
                ],
                "redis": [{"instance_name": "cache", "envs": {"HOST": "10.0.0.1"}}]
            })
        );
    }

    #[tokio::test]
    async fn add_and_remove_instance() {
        let app = InMemoryApp::new("myapp", "myapp.example.com", vec![]);
        let writer: Arc<dyn OutputWriter> = Arc::new(BufferWriter::new());
        app.add_instance(AddInstanceArgs {
            envs: vec![var("mysql", "db1", "USER", "root")],
            should_restart: true,
            writer: writer.clone(),
        })
        .await
        .unwrap();
        assert_eq!(app.restarts(), 1);
        assert_eq!(app.instance_env("db1").await.unwrap()["USER"].value, "root");
        assert!(app.env().contains_key(TSURU_SERVICES_ENV));

        app.remove_instance(RemoveInstanceArgs {
            service_name: "mysql".into(),
            instance_name: "db1".into(),
            should_restart: false,
            writer,
        })
        .await
        .unwrap();
        assert!(app.instance_env("db1").await.unwrap().is_empty());
        assert_eq!(app.restarts(), 1);
    }

    #[tokio::test]
    async fn re_adding_a_var_replaces_it() {
        let app = InMemoryApp::new("myapp", "", vec![]);
        for value in ["a", "b"] {
            app.add_instance(AddInstanceArgs {
                envs: vec![var("mysql", "db1", "USER", value)],
                should_restart: false,
                writer: Arc::new(NullWriter),
            })
            .await
            .unwrap();
        }
        assert_eq!(app.service_envs().len(), 1);
        assert_eq!(app.env()["USER"].value, "b");
    }
}
