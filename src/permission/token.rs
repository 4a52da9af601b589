use tsuru_types::PermissionContext;

use super::scheme::SchemeId;

/// A scheme held in a context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Permission {
    pub scheme: SchemeId,
    pub context: PermissionContext,
}

impl Permission {
    pub fn new(scheme: SchemeId, context: PermissionContext) -> Self {
        Self { scheme, context }
    }
}

/// Anything that carries resolved permissions: user sessions, team tokens,
/// app tokens. Authentication itself lives outside the core.
pub trait Token: Send + Sync {
    fn user_name(&self) -> &str;
    fn permissions(&self) -> Vec<Permission>;
}

#[derive(Debug, Clone, Default)]
pub struct SimpleToken {
    user: String,
    permissions: Vec<Permission>,
}

impl SimpleToken {
    pub fn new(user: impl Into<String>, permissions: Vec<Permission>) -> Self {
        Self {
            user: user.into(),
            permissions,
        }
    }

    pub fn push(&mut self, permission: Permission) {
        self.permissions.push(permission);
    }
}

impl Token for SimpleToken {
    fn user_name(&self) -> &str {
        &self.user
    }

    fn permissions(&self) -> Vec<Permission> {
        self.permissions.clone()
    }
}
