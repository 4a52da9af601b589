//! Document store contract.
//!
//! One trait per collection. Mutations that other components race on are
//! expressed as conditional updates returning whether a document changed, the
//! in-process equivalent of `$addToSet`/`$pull` guarded by a filter.

use async_trait::async_trait;

use tsuru_types::{
    BoundUnit, Broker, BrokerInstanceData, Role, ScopedConfigDocument, Service, ServiceInstance,
    Webhook,
};

use crate::error::Result;

#[async_trait]
pub trait ServiceStorage: Send + Sync {
    /// Fails with `ServiceAlreadyExists` on a duplicate name.
    async fn insert_service(&self, service: &Service) -> Result<()>;
    async fn find_service(&self, name: &str) -> Result<Service>;
    async fn update_service(&self, service: &Service) -> Result<()>;
    async fn delete_service(&self, name: &str) -> Result<()>;
    async fn list_services(&self) -> Result<Vec<Service>>;
    /// `false` when the team already had access.
    async fn add_service_team(&self, name: &str, team: &str) -> Result<bool>;
    /// `false` when the team had no access.
    async fn remove_service_team(&self, name: &str, team: &str) -> Result<bool>;
}

#[async_trait]
pub trait InstanceStorage: Send + Sync {
    // ── Documents ──

    /// Fails with `InstanceNameAlreadyExists` when `(service_name, name)` is taken.
    async fn insert_instance(&self, instance: &ServiceInstance) -> Result<()>;
    async fn find_instance(&self, service: &str, name: &str) -> Result<ServiceInstance>;
    async fn list_instances_by_service(&self, service: &str) -> Result<Vec<ServiceInstance>>;
    async fn list_instances_by_app(&self, app: &str) -> Result<Vec<ServiceInstance>>;
    /// Removes the instance only while no app is bound to it; fails with
    /// `ServiceInstanceBound` otherwise.
    async fn delete_instance_if_unbound(&self, service: &str, name: &str) -> Result<()>;
    /// Replaces description, plan, tags, team owner and parameters. `teams`
    /// is only changed through the set updates below.
    async fn update_instance(&self, instance: &ServiceInstance) -> Result<()>;
    async fn set_broker_data(
        &self,
        service: &str,
        name: &str,
        data: Option<BrokerInstanceData>,
    ) -> Result<()>;

    // ── Conditional set updates ──

    /// Adds `app` unless present. `false` when nothing changed.
    async fn add_app(&self, service: &str, name: &str, app: &str) -> Result<bool>;
    /// Removes `app` if present. `false` when nothing changed.
    async fn remove_app(&self, service: &str, name: &str, app: &str) -> Result<bool>;
    /// Adds the unit unless a unit with the same id is bound.
    async fn add_unit(&self, service: &str, name: &str, unit: &BoundUnit) -> Result<bool>;
    /// Removes the unit with `unit_id` if bound.
    async fn remove_unit(&self, service: &str, name: &str, unit_id: &str) -> Result<bool>;
    async fn add_team(&self, service: &str, name: &str, team: &str) -> Result<bool>;
    async fn remove_team(&self, service: &str, name: &str, team: &str) -> Result<bool>;
    /// Renames `old` to `new` as owner and in `teams` on every instance.
    /// Returns how many instances changed.
    async fn rename_team(&self, old: &str, new: &str) -> Result<usize>;
}

#[async_trait]
pub trait RoleStorage: Send + Sync {
    /// Fails with `RoleAlreadyExists` on a duplicate name.
    async fn insert_role(&self, role: &Role) -> Result<()>;
    async fn find_role(&self, name: &str) -> Result<Role>;
    async fn list_roles(&self) -> Result<Vec<Role>>;
    async fn update_role(&self, role: &Role) -> Result<()>;
    async fn delete_role(&self, name: &str) -> Result<()>;
    async fn add_role_schemes(&self, name: &str, schemes: &[String]) -> Result<()>;
    async fn remove_role_schemes(&self, name: &str, schemes: &[String]) -> Result<()>;
    async fn add_role_event(&self, name: &str, event: &str) -> Result<()>;
    async fn remove_role_event(&self, name: &str, event: &str) -> Result<()>;
}

/// The user to role mapping, owned by the authentication subsystem.
#[async_trait]
pub trait RoleAssignments: Send + Sync {
    async fn count_users_with_role(&self, role: &str) -> Result<usize>;
}

#[async_trait]
pub trait WebhookStorage: Send + Sync {
    /// Fails with `WebhookAlreadyExists` on a duplicate name.
    async fn insert_webhook(&self, webhook: &Webhook) -> Result<()>;
    async fn find_webhook(&self, name: &str) -> Result<Webhook>;
    async fn update_webhook(&self, webhook: &Webhook) -> Result<()>;
    async fn delete_webhook(&self, name: &str) -> Result<()>;
    /// Webhooks owned by any of `teams`; `None` lists everything.
    async fn list_webhooks(&self, teams: Option<&[String]>) -> Result<Vec<Webhook>>;
}

#[async_trait]
pub trait ScopedConfigStorage: Send + Sync {
    async fn find_scoped_config(&self, scope: &str) -> Result<Option<ScopedConfigDocument>>;
    /// Replaces `envs` and `pools`, keeping `extra`.
    async fn save_scoped_envs(&self, document: &ScopedConfigDocument) -> Result<()>;
    /// Sets `extra[field]` only when it is absent or empty.
    async fn set_scoped_extra_if_empty(
        &self,
        scope: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<bool>;
    /// Sets `extra[field]` unconditionally.
    async fn set_scoped_extra(
        &self,
        scope: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<()>;
}

#[async_trait]
pub trait BrokerStorage: Send + Sync {
    async fn insert_broker(&self, broker: &Broker) -> Result<()>;
    async fn find_broker(&self, name: &str) -> Result<Broker>;
    async fn list_brokers(&self) -> Result<Vec<Broker>>;
    async fn delete_broker(&self, name: &str) -> Result<()>;
}
