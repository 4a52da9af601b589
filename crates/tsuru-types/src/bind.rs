//! Bind records: live units, bound units and env-vars injected into apps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A running unit of an app, as reported by the provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    pub ip: String,
}

impl Unit {
    pub fn new(id: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
        }
    }
}

/// A unit recorded as bound on a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundUnit {
    pub app_name: String,
    pub id: String,
    pub ip: String,
}

impl BoundUnit {
    pub fn new(app_name: impl Into<String>, unit: &Unit) -> Self {
        Self {
            app_name: app_name.into(),
            id: unit.id.clone(),
            ip: unit.ip.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub public: bool,
}

/// Env-var contributed by a bound service instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEnvVar {
    #[serde(flatten)]
    pub env: EnvVar,
    pub service_name: String,
    pub instance_name: String,
}

/// One element of a `TSURU_SERVICES` list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstanceEnvs {
    pub instance_name: String,
    pub envs: BTreeMap<String, String>,
}
