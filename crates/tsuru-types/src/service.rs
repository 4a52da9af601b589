//! Documents of the `services` and `service_instances` collections.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bind::BoundUnit;

/// Free-form parameters sent with create and bind-app requests.
pub type BindAppParameters = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Endpoint URL per environment (`production` is the default one).
    #[serde(default)]
    pub endpoint: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_teams: Vec<String>,
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub doc: String,
    #[serde(default)]
    pub is_restricted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub service_name: String,
    #[serde(default)]
    pub plan_name: String,
    pub team_owner: String,
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub apps: Vec<String>,
    #[serde(default)]
    pub bound_units: Vec<BoundUnit>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_data: Option<BrokerInstanceData>,
}

impl ServiceInstance {
    pub fn units_for_app<'a>(&'a self, app_name: &'a str) -> impl Iterator<Item = &'a BoundUnit> {
        self.bound_units
            .iter()
            .filter(move |u| u.app_name == app_name)
    }
}

/// Bookkeeping kept for instances provisioned through a broker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerInstanceData {
    pub uuid: String,
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub space_id: String,
    #[serde(default)]
    pub last_operation_key: String,
    #[serde(default)]
    pub binds: BTreeMap<String, BrokerInstanceBind>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerInstanceBind {
    pub uuid: String,
    #[serde(default)]
    pub operation_key: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<serde_json::Value>,
}
