//! Permission context vocabulary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// CONTEXT TYPES
// ============================================================================

/// Scope in which a permission is held.
///
/// Closed set; the string form equals the serialized tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextType {
    Global,
    App,
    Team,
    Pool,
    Iaas,
    Service,
    ServiceInstance,
    User,
    Volume,
    Router,
}

impl ContextType {
    /// Every context type, in declaration order.
    pub const ALL: [ContextType; 10] = [
        ContextType::Global,
        ContextType::App,
        ContextType::Team,
        ContextType::Pool,
        ContextType::Iaas,
        ContextType::Service,
        ContextType::ServiceInstance,
        ContextType::User,
        ContextType::Volume,
        ContextType::Router,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Global => "global",
            ContextType::App => "app",
            ContextType::Team => "team",
            ContextType::Pool => "pool",
            ContextType::Iaas => "iaas",
            ContextType::Service => "service",
            ContextType::ServiceInstance => "service-instance",
            ContextType::User => "user",
            ContextType::Volume => "volume",
            ContextType::Router => "router",
        }
    }
}

impl std::fmt::Display for ContextType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a [`ContextType`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid context type {0:?}")]
pub struct ParseContextTypeError(pub String);

impl std::str::FromStr for ContextType {
    type Err = ParseContextTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContextType::ALL
            .iter()
            .copied()
            .find(|ctx| ctx.as_str() == s)
            .ok_or_else(|| ParseContextTypeError(s.to_string()))
    }
}

// ============================================================================
// PERMISSION CONTEXT
// ============================================================================

/// A `(ContextType, value)` pair. `value` is empty for [`ContextType::Global`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionContext {
    #[serde(rename = "ctxtype")]
    pub ctx_type: ContextType,
    pub value: String,
}

impl PermissionContext {
    pub fn new(ctx_type: ContextType, value: impl Into<String>) -> Self {
        let value = if ctx_type == ContextType::Global {
            String::new()
        } else {
            value.into()
        };
        Self { ctx_type, value }
    }

    pub fn global() -> Self {
        Self {
            ctx_type: ContextType::Global,
            value: String::new(),
        }
    }
}

impl std::fmt::Display for PermissionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}", self.ctx_type)
        } else {
            write!(f, "{} {}", self.ctx_type, self.value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_type_round_trips_through_str() {
        for ctx in ContextType::ALL {
            let parsed: ContextType = ctx.as_str().parse().unwrap();
            assert_eq!(parsed, ctx);
        }
        assert!("galaxy".parse::<ContextType>().is_err());
    }

    #[test]
    fn context_type_serializes_as_tag() {
        let json = serde_json::to_string(&ContextType::ServiceInstance).unwrap();
        assert_eq!(json, "\"service-instance\"");
    }

    #[test]
    fn global_context_drops_value() {
        let ctx = PermissionContext::new(ContextType::Global, "ignored");
        assert_eq!(ctx.value, "");
        assert_eq!(ctx, PermissionContext::global());
    }
}
