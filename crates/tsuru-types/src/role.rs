//! Role documents of the `roles` collection.

use serde::{Deserialize, Serialize};

use crate::permission::ContextType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub context_type: ContextType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scheme_names: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

/// Event that assigns a role automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoleEvent {
    UserCreate,
    TeamCreate,
}

impl RoleEvent {
    pub const ALL: [RoleEvent; 2] = [RoleEvent::UserCreate, RoleEvent::TeamCreate];

    pub fn name(&self) -> &'static str {
        match self {
            RoleEvent::UserCreate => "user-create",
            RoleEvent::TeamCreate => "team-create",
        }
    }

    /// Context type a role must have to be attached to this event.
    pub fn context(&self) -> ContextType {
        match self {
            RoleEvent::UserCreate => ContextType::Global,
            RoleEvent::TeamCreate => ContextType::Team,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            RoleEvent::UserCreate => "role added to user when user is created",
            RoleEvent::TeamCreate => "role added to user when a new team is created",
        }
    }

    pub fn from_name(name: &str) -> Option<RoleEvent> {
        RoleEvent::ALL.iter().copied().find(|e| e.name() == name)
    }
}
