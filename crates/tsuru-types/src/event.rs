//! Event journal records.
//!
//! Field names serialize in PascalCase because the event document is also the
//! default webhook body and webhook templates address it as `{{.Kind.Name}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of a journal entry.
pub type EventId = Uuid;

// ============================================================================
// TARGETS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetType {
    Global,
    App,
    Node,
    Container,
    Pool,
    Service,
    ServiceInstance,
    Team,
    User,
    Iaas,
    Role,
    Platform,
    Plan,
    NodeContainer,
    InstallHost,
    EventBlock,
    Cluster,
    Volume,
    Webhook,
    Router,
    Job,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Global => "global",
            TargetType::App => "app",
            TargetType::Node => "node",
            TargetType::Container => "container",
            TargetType::Pool => "pool",
            TargetType::Service => "service",
            TargetType::ServiceInstance => "service-instance",
            TargetType::Team => "team",
            TargetType::User => "user",
            TargetType::Iaas => "iaas",
            TargetType::Role => "role",
            TargetType::Platform => "platform",
            TargetType::Plan => "plan",
            TargetType::NodeContainer => "node-container",
            TargetType::InstallHost => "install-host",
            TargetType::EventBlock => "event-block",
            TargetType::Cluster => "cluster",
            TargetType::Volume => "volume",
            TargetType::Webhook => "webhook",
            TargetType::Router => "router",
            TargetType::Job => "job",
        }
    }
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Target {
    #[serde(rename = "Type")]
    pub target_type: TargetType,
    pub value: String,
}

impl Target {
    pub fn new(target_type: TargetType, value: impl Into<String>) -> Self {
        Self {
            target_type,
            value: value.into(),
        }
    }
}

/// Secondary target of an event. `lock` makes the journal refuse other
/// running events on the same target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtraTarget {
    pub target: Target,
    pub lock: bool,
}

// ============================================================================
// KIND AND OWNER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindType {
    Permission,
    Internal,
}

impl KindType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KindType::Permission => "permission",
            KindType::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Kind {
    #[serde(rename = "Type")]
    pub kind_type: KindType,
    pub name: String,
}

impl Kind {
    pub fn internal(name: impl Into<String>) -> Self {
        Self {
            kind_type: KindType::Internal,
            name: name.into(),
        }
    }

    pub fn permission(name: impl Into<String>) -> Self {
        Self {
            kind_type: KindType::Permission,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    User,
    App,
    Internal,
    Team,
    Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Owner {
    #[serde(rename = "Type")]
    pub owner_type: OwnerType,
    pub name: String,
}

impl Owner {
    pub fn internal() -> Self {
        Self {
            owner_type: OwnerType::Internal,
            name: String::new(),
        }
    }
}

// ============================================================================
// EVENT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    #[serde(rename = "UniqueID")]
    pub unique_id: EventId,
    pub target: Target,
    #[serde(default)]
    pub extra_targets: Vec<ExtraTarget>,
    pub kind: Kind,
    pub owner: Owner,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: String,
    pub running: bool,
    #[serde(default)]
    pub cancelable: bool,
    #[serde(default)]
    pub start_custom_data: serde_json::Value,
    #[serde(default)]
    pub end_custom_data: serde_json::Value,
    #[serde(default)]
    pub other_custom_data: serde_json::Value,
}

impl Event {
    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}
