//! Webhook definitions as stored in the `webhooks` collection.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which events a webhook fires for. Empty lists match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEventFilter {
    #[serde(default)]
    pub target_types: Vec<String>,
    #[serde(default)]
    pub target_values: Vec<String>,
    #[serde(default)]
    pub kind_types: Vec<String>,
    #[serde(default)]
    pub kind_names: Vec<String>,
    #[serde(default)]
    pub error_only: bool,
    #[serde(default)]
    pub success_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub team_owner: String,
    #[serde(default)]
    pub event_filter: WebhookEventFilter,
    pub url: String,
    #[serde(default)]
    pub proxy_url: String,
    /// Empty means `POST`.
    #[serde(default)]
    pub method: String,
    /// Template rendered against the event; empty sends the event as JSON.
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub insecure: bool,
}
