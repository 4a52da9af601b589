//! Service broker registrations and catalog records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::service::Plan;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BearerConfig {
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub basic: Option<BasicAuthConfig>,
    #[serde(default)]
    pub bearer: Option<BearerConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub insecure: bool,
    /// Sent as the OSB `context` object on provision and update.
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub auth_config: Option<AuthConfig>,
    /// Catalog cache TTL override, in seconds.
    #[serde(default)]
    pub cache_expiration_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Broker {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub config: BrokerConfig,
}

// ============================================================================
// CATALOG
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerPlan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<serde_json::Value>,
}

impl From<&BrokerPlan> for Plan {
    fn from(p: &BrokerPlan) -> Self {
        Plan {
            name: p.name.clone(),
            description: p.description.clone(),
            schemas: p.schemas.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerService {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub plans: Vec<BrokerPlan>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerCatalog {
    #[serde(default)]
    pub services: Vec<BrokerService>,
}

impl BrokerCatalog {
    pub fn service(&self, name: &str) -> Option<&BrokerService> {
        self.services.iter().find(|s| s.name == name)
    }
}
