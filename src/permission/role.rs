//! Named bundles of permission schemes bound to a context type.

use std::sync::Arc;

use tsuru_types::{ContextType, PermissionContext, Role, RoleEvent};

use super::registry::PermissionRegistry;
use super::token::Permission;
use crate::error::{Result, TsuruError};
use crate::storage::{RoleAssignments, RoleStorage};

pub struct RoleStore {
    registry: Arc<PermissionRegistry>,
    storage: Arc<dyn RoleStorage>,
    assignments: Arc<dyn RoleAssignments>,
}

impl RoleStore {
    pub fn new(
        registry: Arc<PermissionRegistry>,
        storage: Arc<dyn RoleStorage>,
        assignments: Arc<dyn RoleAssignments>,
    ) -> Self {
        Self {
            registry,
            storage,
            assignments,
        }
    }

    pub fn registry(&self) -> &PermissionRegistry {
        &self.registry
    }

    // ── Lifecycle ──

    pub async fn create(&self, name: &str, context: &str, description: &str) -> Result<Role> {
        let context_type: ContextType = context
            .parse()
            .map_err(|e: tsuru_types::ParseContextTypeError| TsuruError::InvalidInput(e.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(TsuruError::InvalidRoleName);
        }
        let role = Role {
            name: name.to_string(),
            context_type,
            description: description.to_string(),
            scheme_names: Vec::new(),
            events: Vec::new(),
        };
        self.storage.insert_role(&role).await?;
        tracing::info!(role = %role.name, context = %context_type, "role created");
        Ok(role)
    }

    pub async fn find(&self, name: &str) -> Result<Role> {
        let mut role = self.storage.find_role(name).await?;
        self.filter_valid_schemes(&mut role);
        Ok(role)
    }

    pub async fn list(&self) -> Result<Vec<Role>> {
        let mut roles = self.storage.list_roles().await?;
        for role in &mut roles {
            self.filter_valid_schemes(role);
        }
        Ok(roles)
    }

    pub async fn list_with_events(&self) -> Result<Vec<Role>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| !r.events.is_empty())
            .collect())
    }

    pub async fn list_for_event(&self, event: RoleEvent) -> Result<Vec<Role>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.events.iter().any(|e| e == event.name()))
            .collect())
    }

    /// Roles of context `ctx` plus roles holding any scheme that allows `ctx`.
    pub async fn list_with_permission_with_context(&self, ctx: ContextType) -> Result<Vec<Role>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|role| {
                role.context_type == ctx
                    || role.scheme_names.iter().any(|name| {
                        self.registry
                            .get_or_root(name)
                            .map(|s| s.allows(ctx))
                            .unwrap_or(false)
                    })
            })
            .collect())
    }

    /// Changes description and context type.
    pub async fn update(&self, role: &Role) -> Result<()> {
        self.storage.update_role(role).await
    }

    pub async fn destroy(&self, name: &str) -> Result<()> {
        let users = self.assignments.count_users_with_role(name).await?;
        if users > 0 {
            return Err(TsuruError::RemoveRoleWithUsers(users));
        }
        self.storage.delete_role(name).await?;
        tracing::info!(role = %name, "role removed");
        Ok(())
    }

    // ── Permissions ──

    pub async fn add_permissions(&self, name: &str, permissions: &[&str]) -> Result<Role> {
        let role = self.storage.find_role(name).await?;
        for permission in permissions {
            if permission.is_empty() {
                return Err(TsuruError::InvalidInput(
                    "permission name must not be empty".into(),
                ));
            }
            let scheme = self
                .registry
                .get_or_root(permission)
                .map_err(|_| TsuruError::PermissionNotFound)?;
            if !scheme.allows(role.context_type) {
                tracing::debug!(
                    role = %role.name,
                    permission = %permission,
                    context = %role.context_type,
                    "permission not allowed in role context"
                );
                return Err(TsuruError::PermissionNotAllowed);
            }
        }
        let names: Vec<String> = permissions.iter().map(|p| p.to_string()).collect();
        self.storage.add_role_schemes(name, &names).await?;
        self.find(name).await
    }

    pub async fn remove_permissions(&self, name: &str, permissions: &[&str]) -> Result<Role> {
        let names: Vec<String> = permissions.iter().map(|p| p.to_string()).collect();
        self.storage.remove_role_schemes(name, &names).await?;
        self.find(name).await
    }

    /// Resolved permissions of `role` in the context value `value`.
    pub fn permissions_for(&self, role: &Role, value: &str) -> Vec<Permission> {
        let mut names = role.scheme_names.clone();
        names.sort();
        names
            .iter()
            .filter_map(|name| self.registry.get_or_root(name).ok())
            .map(|scheme| {
                Permission::new(scheme.id(), PermissionContext::new(role.context_type, value))
            })
            .collect()
    }

    // ── Events ──

    pub async fn add_event(&self, name: &str, event_name: &str) -> Result<Role> {
        let event = RoleEvent::from_name(event_name).ok_or(TsuruError::RoleEventNotFound)?;
        let role = self.storage.find_role(name).await?;
        if role.context_type != event.context() {
            return Err(TsuruError::RoleEventWrongContext(format!(
                "wrong context type for role event, expected \"{}\" role has \"{}\"",
                event.context(),
                role.context_type
            )));
        }
        self.storage.add_role_event(name, event.name()).await?;
        self.find(name).await
    }

    pub async fn remove_event(&self, name: &str, event_name: &str) -> Result<Role> {
        self.storage.remove_role_event(name, event_name).await?;
        self.find(name).await
    }

    /// Sorts scheme names and drops the ones the registry no longer knows.
    fn filter_valid_schemes(&self, role: &mut Role) {
        role.scheme_names.sort();
        role.scheme_names
            .retain(|name| self.registry.get_or_root(name).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::permitems::standard_registry;
    use crate::storage::MemoryStore;

    fn store() -> (RoleStore, Arc<MemoryStore>) {
        let mem = Arc::new(MemoryStore::new());
        let roles = RoleStore::new(
            Arc::new(standard_registry().unwrap()),
            mem.clone(),
            mem.clone(),
        );
        (roles, mem)
    }

    #[tokio::test]
    async fn create_validates_name_and_context() {
        let (roles, _) = store();
        assert!(matches!(
            roles.create("  ", "app", "").await,
            Err(TsuruError::InvalidRoleName)
        ));
        assert!(matches!(
            roles.create("r", "galaxy", "").await,
            Err(TsuruError::InvalidInput(_))
        ));
        let role = roles.create(" deployer ", "app", "deploys").await.unwrap();
        assert_eq!(role.name, "deployer");
        assert!(matches!(
            roles.create("deployer", "team", "").await,
            Err(TsuruError::RoleAlreadyExists)
        ));
    }

    #[tokio::test]
    async fn add_permissions_checks_context() {
        let (roles, _) = store();
        roles.create("app-role", "app", "").await.unwrap();
        let role = roles
            .add_permissions("app-role", &["app.deploy", "app.update.env.set"])
            .await
            .unwrap();
        assert_eq!(role.scheme_names, vec!["app.deploy", "app.update.env.set"]);

        assert!(matches!(
            roles.add_permissions("app-role", &["team.create"]).await,
            Err(TsuruError::PermissionNotAllowed)
        ));
        assert!(matches!(
            roles.add_permissions("app-role", &["app.nope"]).await,
            Err(TsuruError::PermissionNotFound)
        ));
        assert!(matches!(
            roles.add_permissions("app-role", &[""]).await,
            Err(TsuruError::InvalidInput(_))
        ));
        assert!(matches!(
            roles.add_permissions("app-role", &["*"]).await,
            Err(TsuruError::PermissionNotAllowed)
        ));

        roles.create("admin", "global", "").await.unwrap();
        let admin = roles.add_permissions("admin", &["*"]).await.unwrap();
        assert_eq!(admin.scheme_names, vec!["*"]);
    }

    #[tokio::test]
    async fn permissions_for_resolves_context_value() {
        let (roles, _) = store();
        roles.create("r", "app", "").await.unwrap();
        let role = roles.add_permissions("r", &["app.deploy"]).await.unwrap();
        let perms = roles.permissions_for(&role, "myapp");
        assert_eq!(perms.len(), 1);
        assert_eq!(
            perms[0].context,
            PermissionContext::new(ContextType::App, "myapp")
        );
        assert_eq!(
            roles.registry().scheme(perms[0].scheme).unwrap().full_name(),
            "app.deploy"
        );
    }

    #[tokio::test]
    async fn invalid_scheme_names_are_filtered() {
        let (roles, mem) = store();
        roles.create("r", "app", "").await.unwrap();
        mem.add_role_schemes("r", &["app.removed-long-ago".into(), "app.deploy".into()])
            .await
            .unwrap();
        let role = roles.find("r").await.unwrap();
        assert_eq!(role.scheme_names, vec!["app.deploy"]);
    }

    #[tokio::test]
    async fn events_require_matching_context() {
        let (roles, _) = store();
        roles.create("team-role", "team", "").await.unwrap();
        let err = roles.add_event("team-role", "user-create").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "wrong context type for role event, expected \"global\" role has \"team\""
        );
        assert!(matches!(
            roles.add_event("team-role", "bogus").await,
            Err(TsuruError::RoleEventNotFound)
        ));
        let role = roles.add_event("team-role", "team-create").await.unwrap();
        assert_eq!(role.events, vec!["team-create"]);
        assert_eq!(roles.list_with_events().await.unwrap().len(), 1);
        assert_eq!(
            roles
                .list_for_event(RoleEvent::TeamCreate)
                .await
                .unwrap()
                .len(),
            1
        );
        let role = roles.remove_event("team-role", "team-create").await.unwrap();
        assert!(role.events.is_empty());
    }

    #[tokio::test]
    async fn destroy_refuses_assigned_roles() {
        let (roles, mem) = store();
        roles.create("r", "app", "").await.unwrap();
        mem.set_role_users("r", 2).unwrap();
        assert!(matches!(
            roles.destroy("r").await,
            Err(TsuruError::RemoveRoleWithUsers(2))
        ));
        mem.set_role_users("r", 0).unwrap();
        roles.destroy("r").await.unwrap();
        assert!(matches!(roles.find("r").await, Err(TsuruError::RoleNotFound)));
    }

    #[tokio::test]
    async fn list_with_permission_with_context() {
        let (roles, _) = store();
        roles.create("team-role", "team", "").await.unwrap();
        roles.create("app-role", "app", "").await.unwrap();
        roles.add_permissions("app-role", &["app.deploy"]).await.unwrap();
        roles.create("pool-role", "pool", "").await.unwrap();
        roles.add_permissions("pool-role", &["pool.read"]).await.unwrap();

        let mut names: Vec<String> = roles
            .list_with_permission_with_context(ContextType::Team)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["app-role", "team-role"]);
    }
}
