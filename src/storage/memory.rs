//! In-memory document store for tests and single-process deployments.
//!
//! Every collection sits behind its own `RwLock`; conditional updates check
//! and mutate under one write guard, so they are atomic the same way a
//! filtered `$addToSet`/`$pull` is in a document database.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use tsuru_types::{
    BoundUnit, Broker, BrokerInstanceData, Role, ScopedConfigDocument, Service, ServiceInstance,
    Webhook,
};

use super::traits::{
    BrokerStorage, InstanceStorage, RoleAssignments, RoleStorage, ScopedConfigStorage,
    ServiceStorage, WebhookStorage,
};
use crate::error::{Result, TsuruError};
use crate::scopedconfig::is_empty_value;

type InstanceKey = (String, String);

#[derive(Default)]
pub struct MemoryStore {
    services: RwLock<BTreeMap<String, Service>>,
    instances: RwLock<BTreeMap<InstanceKey, ServiceInstance>>,
    roles: RwLock<BTreeMap<String, Role>>,
    role_users: RwLock<HashMap<String, usize>>,
    webhooks: RwLock<BTreeMap<String, Webhook>>,
    scoped: RwLock<BTreeMap<String, ScopedConfigDocument>>,
    brokers: RwLock<BTreeMap<String, Broker>>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|e| TsuruError::Storage(format!("lock: {e}")))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|e| TsuruError::Storage(format!("lock: {e}")))
}

fn key(service: &str, name: &str) -> InstanceKey {
    (service.to_string(), name.to_string())
}

fn add_to_set(set: &mut Vec<String>, value: &str) -> bool {
    if set.iter().any(|v| v == value) {
        return false;
    }
    set.push(value.to_string());
    true
}

fn pull(set: &mut Vec<String>, value: &str) -> bool {
    let before = set.len();
    set.retain(|v| v != value);
    set.len() != before
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `count` users holding `role`; stands in for the auth subsystem.
    pub fn set_role_users(&self, role: &str, count: usize) -> Result<()> {
        write(&self.role_users)?.insert(role.to_string(), count);
        Ok(())
    }

    fn with_instance<T>(
        &self,
        service: &str,
        name: &str,
        f: impl FnOnce(&mut ServiceInstance) -> T,
    ) -> Result<T> {
        let mut instances = write(&self.instances)?;
        let instance = instances
            .get_mut(&key(service, name))
            .ok_or(TsuruError::ServiceInstanceNotFound)?;
        Ok(f(instance))
    }

    fn with_role<T>(&self, name: &str, f: impl FnOnce(&mut Role) -> T) -> Result<T> {
        let mut roles = write(&self.roles)?;
        let role = roles.get_mut(name).ok_or(TsuruError::RoleNotFound)?;
        Ok(f(role))
    }
}

// ── Services ──

#[async_trait]
impl ServiceStorage for MemoryStore {
    async fn insert_service(&self, service: &Service) -> Result<()> {
        let mut services = write(&self.services)?;
        if services.contains_key(&service.name) {
            return Err(TsuruError::ServiceAlreadyExists);
        }
        services.insert(service.name.clone(), service.clone());
        Ok(())
    }

    async fn find_service(&self, name: &str) -> Result<Service> {
        read(&self.services)?
            .get(name)
            .cloned()
            .ok_or(TsuruError::ServiceNotFound)
    }

    async fn update_service(&self, service: &Service) -> Result<()> {
        let mut services = write(&self.services)?;
        let slot = services
            .get_mut(&service.name)
            .ok_or(TsuruError::ServiceNotFound)?;
        *slot = service.clone();
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        write(&self.services)?
            .remove(name)
            .map(|_| ())
            .ok_or(TsuruError::ServiceNotFound)
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        Ok(read(&self.services)?.values().cloned().collect())
    }

    async fn add_service_team(&self, name: &str, team: &str) -> Result<bool> {
        let mut services = write(&self.services)?;
        let service = services.get_mut(name).ok_or(TsuruError::ServiceNotFound)?;
        Ok(add_to_set(&mut service.teams, team))
    }

    async fn remove_service_team(&self, name: &str, team: &str) -> Result<bool> {
        let mut services = write(&self.services)?;
        let service = services.get_mut(name).ok_or(TsuruError::ServiceNotFound)?;
        Ok(pull(&mut service.teams, team))
    }
}

// ── Service instances ──

#[async_trait]
impl InstanceStorage for MemoryStore {
    async fn insert_instance(&self, instance: &ServiceInstance) -> Result<()> {
        let mut instances = write(&self.instances)?;
        let k = key(&instance.service_name, &instance.name);
        if instances.contains_key(&k) {
            return Err(TsuruError::InstanceNameAlreadyExists(instance.name.clone()));
        }
        instances.insert(k, instance.clone());
        Ok(())
    }

    async fn find_instance(&self, service: &str, name: &str) -> Result<ServiceInstance> {
        read(&self.instances)?
            .get(&key(service, name))
            .cloned()
            .ok_or(TsuruError::ServiceInstanceNotFound)
    }

    async fn list_instances_by_service(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        Ok(read(&self.instances)?
            .values()
            .filter(|si| si.service_name == service)
            .cloned()
            .collect())
    }

    async fn list_instances_by_app(&self, app: &str) -> Result<Vec<ServiceInstance>> {
        Ok(read(&self.instances)?
            .values()
            .filter(|si| si.apps.iter().any(|a| a == app))
            .cloned()
            .collect())
    }

    async fn delete_instance_if_unbound(&self, service: &str, name: &str) -> Result<()> {
        let mut instances = write(&self.instances)?;
        let k = key(service, name);
        match instances.get(&k) {
            None => return Err(TsuruError::ServiceInstanceNotFound),
            Some(si) if !si.apps.is_empty() => return Err(TsuruError::ServiceInstanceBound),
            Some(_) => {}
        }
        instances.remove(&k);
        Ok(())
    }

    async fn update_instance(&self, instance: &ServiceInstance) -> Result<()> {
        self.with_instance(&instance.service_name, &instance.name, |si| {
            si.description = instance.description.clone();
            si.plan_name = instance.plan_name.clone();
            si.tags = instance.tags.clone();
            si.team_owner = instance.team_owner.clone();
            si.parameters = instance.parameters.clone();
        })
    }

    async fn set_broker_data(
        &self,
        service: &str,
        name: &str,
        data: Option<BrokerInstanceData>,
    ) -> Result<()> {
        self.with_instance(service, name, |si| si.broker_data = data)
    }

    async fn add_app(&self, service: &str, name: &str, app: &str) -> Result<bool> {
        self.with_instance(service, name, |si| add_to_set(&mut si.apps, app))
    }

    async fn remove_app(&self, service: &str, name: &str, app: &str) -> Result<bool> {
        self.with_instance(service, name, |si| pull(&mut si.apps, app))
    }

    async fn add_unit(&self, service: &str, name: &str, unit: &BoundUnit) -> Result<bool> {
        self.with_instance(service, name, |si| {
            if si.bound_units.iter().any(|u| u.id == unit.id) {
                return false;
            }
            si.bound_units.push(unit.clone());
            true
        })
    }

    async fn remove_unit(&self, service: &str, name: &str, unit_id: &str) -> Result<bool> {
        self.with_instance(service, name, |si| {
            let before = si.bound_units.len();
            si.bound_units.retain(|u| u.id != unit_id);
            si.bound_units.len() != before
        })
    }

    async fn add_team(&self, service: &str, name: &str, team: &str) -> Result<bool> {
        self.with_instance(service, name, |si| add_to_set(&mut si.teams, team))
    }

    async fn remove_team(&self, service: &str, name: &str, team: &str) -> Result<bool> {
        self.with_instance(service, name, |si| pull(&mut si.teams, team))
    }

    async fn rename_team(&self, old: &str, new: &str) -> Result<usize> {
        if old == new {
            return Ok(0);
        }
        let mut changed = 0;
        for si in write(&self.instances)?.values_mut() {
            let mut touched = false;
            if si.team_owner == old {
                si.team_owner = new.to_string();
                touched = true;
            }
            if pull(&mut si.teams, old) {
                add_to_set(&mut si.teams, new);
                touched = true;
            }
            if touched {
                changed += 1;
            }
        }
        Ok(changed)
    }
}

// ── Roles ──

#[async_trait]
impl RoleStorage for MemoryStore {
    async fn insert_role(&self, role: &Role) -> Result<()> {
        let mut roles = write(&self.roles)?;
        if roles.contains_key(&role.name) {
            return Err(TsuruError::RoleAlreadyExists);
        }
        roles.insert(role.name.clone(), role.clone());
        Ok(())
    }

    async fn find_role(&self, name: &str) -> Result<Role> {
        read(&self.roles)?
            .get(name)
            .cloned()
            .ok_or(TsuruError::RoleNotFound)
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        Ok(read(&self.roles)?.values().cloned().collect())
    }

    async fn update_role(&self, role: &Role) -> Result<()> {
        self.with_role(&role.name, |r| {
            r.context_type = role.context_type;
            r.description = role.description.clone();
        })
    }

    async fn delete_role(&self, name: &str) -> Result<()> {
        write(&self.roles)?
            .remove(name)
            .map(|_| ())
            .ok_or(TsuruError::RoleNotFound)
    }

    async fn add_role_schemes(&self, name: &str, schemes: &[String]) -> Result<()> {
        self.with_role(name, |r| {
            for scheme in schemes {
                add_to_set(&mut r.scheme_names, scheme);
            }
        })
    }

    async fn remove_role_schemes(&self, name: &str, schemes: &[String]) -> Result<()> {
        self.with_role(name, |r| r.scheme_names.retain(|s| !schemes.contains(s)))
    }

    async fn add_role_event(&self, name: &str, event: &str) -> Result<()> {
        self.with_role(name, |r| {
            add_to_set(&mut r.events, event);
        })
    }

    async fn remove_role_event(&self, name: &str, event: &str) -> Result<()> {
        self.with_role(name, |r| {
            pull(&mut r.events, event);
        })
    }
}

#[async_trait]
impl RoleAssignments for MemoryStore {
    async fn count_users_with_role(&self, role: &str) -> Result<usize> {
        Ok(read(&self.role_users)?.get(role).copied().unwrap_or(0))
    }
}

// ── Webhooks ──

#[async_trait]
impl WebhookStorage for MemoryStore {
    async fn insert_webhook(&self, webhook: &Webhook) -> Result<()> {
        let mut webhooks = write(&self.webhooks)?;
        if webhooks.contains_key(&webhook.name) {
            return Err(TsuruError::WebhookAlreadyExists);
        }
        webhooks.insert(webhook.name.clone(), webhook.clone());
        Ok(())
    }

    async fn find_webhook(&self, name: &str) -> Result<Webhook> {
        read(&self.webhooks)?
            .get(name)
            .cloned()
            .ok_or(TsuruError::WebhookNotFound)
    }

    async fn update_webhook(&self, webhook: &Webhook) -> Result<()> {
        let mut webhooks = write(&self.webhooks)?;
        let slot = webhooks
            .get_mut(&webhook.name)
            .ok_or(TsuruError::WebhookNotFound)?;
        *slot = webhook.clone();
        Ok(())
    }

    async fn delete_webhook(&self, name: &str) -> Result<()> {
        write(&self.webhooks)?
            .remove(name)
            .map(|_| ())
            .ok_or(TsuruError::WebhookNotFound)
    }

    async fn list_webhooks(&self, teams: Option<&[String]>) -> Result<Vec<Webhook>> {
        Ok(read(&self.webhooks)?
            .values()
            .filter(|w| teams.map_or(true, |teams| teams.contains(&w.team_owner)))
            .cloned()
            .collect())
    }
}

// ── Scoped configs ──

#[async_trait]
impl ScopedConfigStorage for MemoryStore {
    async fn find_scoped_config(&self, scope: &str) -> Result<Option<ScopedConfigDocument>> {
        Ok(read(&self.scoped)?.get(scope).cloned())
    }

    async fn save_scoped_envs(&self, document: &ScopedConfigDocument) -> Result<()> {
        let mut scoped = write(&self.scoped)?;
        let entry = scoped
            .entry(document.scope.clone())
            .or_insert_with(|| ScopedConfigDocument {
                scope: document.scope.clone(),
                ..Default::default()
            });
        entry.envs = document.envs.clone();
        entry.pools = document.pools.clone();
        Ok(())
    }

    async fn set_scoped_extra_if_empty(
        &self,
        scope: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<bool> {
        let mut scoped = write(&self.scoped)?;
        let entry = scoped
            .entry(scope.to_string())
            .or_insert_with(|| ScopedConfigDocument {
                scope: scope.to_string(),
                ..Default::default()
            });
        if entry.extra.get(field).map_or(false, |v| !is_empty_value(v)) {
            return Ok(false);
        }
        entry.extra.insert(field.to_string(), value.clone());
        Ok(true)
    }

    async fn set_scoped_extra(
        &self,
        scope: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let mut scoped = write(&self.scoped)?;
        scoped
            .entry(scope.to_string())
            .or_insert_with(|| ScopedConfigDocument {
                scope: scope.to_string(),
                ..Default::default()
            })
            .extra
            .insert(field.to_string(), value.clone());
        Ok(())
    }
}

// ── Brokers ──

#[async_trait]
impl BrokerStorage for MemoryStore {
    async fn insert_broker(&self, broker: &Broker) -> Result<()> {
        let mut brokers = write(&self.brokers)?;
        if brokers.contains_key(&broker.name) {
            return Err(TsuruError::InvalidInput(format!(
                "broker {:?} already exists",
                broker.name
            )));
        }
        brokers.insert(broker.name.clone(), broker.clone());
        Ok(())
    }

    async fn find_broker(&self, name: &str) -> Result<Broker> {
        read(&self.brokers)?
            .get(name)
            .cloned()
            .ok_or_else(|| TsuruError::BrokerNotFound(name.to_string()))
    }

    async fn list_brokers(&self) -> Result<Vec<Broker>> {
        Ok(read(&self.brokers)?.values().cloned().collect())
    }

    async fn delete_broker(&self, name: &str) -> Result<()> {
        write(&self.brokers)?
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| TsuruError::BrokerNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tsuru_types::Unit;

    fn instance(name: &str) -> ServiceInstance {
        ServiceInstance {
            name: name.into(),
            service_name: "mysql".into(),
            team_owner: "team".into(),
            teams: vec!["team".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn instance_key_is_unique_per_service() {
        let store = MemoryStore::new();
        store.insert_instance(&instance("db")).await.unwrap();
        assert!(matches!(
            store.insert_instance(&instance("db")).await,
            Err(TsuruError::InstanceNameAlreadyExists(_))
        ));
        let mut other = instance("db");
        other.service_name = "redis".into();
        store.insert_instance(&other).await.unwrap();
    }

    #[tokio::test]
    async fn update_instance_keeps_concurrent_team_grants() {
        let store = MemoryStore::new();
        store.insert_instance(&instance("db")).await.unwrap();
        let mut stale = store.find_instance("mysql", "db").await.unwrap();
        assert!(store.add_team("mysql", "db", "ops").await.unwrap());

        stale.description = "primary".into();
        store.update_instance(&stale).await.unwrap();
        let current = store.find_instance("mysql", "db").await.unwrap();
        assert_eq!(current.description, "primary");
        assert_eq!(current.teams, vec!["team", "ops"]);
    }

    #[tokio::test]
    async fn bound_instances_are_not_deleted() {
        let store = MemoryStore::new();
        store.insert_instance(&instance("db")).await.unwrap();
        store.add_app("mysql", "db", "myapp").await.unwrap();
        assert!(matches!(
            store.delete_instance_if_unbound("mysql", "db").await,
            Err(TsuruError::ServiceInstanceBound)
        ));
        assert!(store.find_instance("mysql", "db").await.is_ok());

        store.remove_app("mysql", "db", "myapp").await.unwrap();
        store.delete_instance_if_unbound("mysql", "db").await.unwrap();
        assert!(matches!(
            store.delete_instance_if_unbound("mysql", "db").await,
            Err(TsuruError::ServiceInstanceNotFound)
        ));
    }

    #[tokio::test]
    async fn rename_team_updates_owner_and_teams() {
        let store = MemoryStore::new();
        store.insert_instance(&instance("db")).await.unwrap();
        let mut shared = instance("cache");
        shared.team_owner = "other".into();
        shared.teams = vec!["other".into(), "team".into(), "renamed".into()];
        store.insert_instance(&shared).await.unwrap();
        let mut untouched = instance("queue");
        untouched.team_owner = "other".into();
        untouched.teams = vec!["other".into()];
        store.insert_instance(&untouched).await.unwrap();

        assert_eq!(store.rename_team("team", "renamed").await.unwrap(), 2);

        let db = store.find_instance("mysql", "db").await.unwrap();
        assert_eq!(db.team_owner, "renamed");
        assert_eq!(db.teams, vec!["renamed"]);
        let cache = store.find_instance("mysql", "cache").await.unwrap();
        assert_eq!(cache.team_owner, "other");
        assert_eq!(cache.teams, vec!["other", "renamed"]);
        let queue = store.find_instance("mysql", "queue").await.unwrap();
        assert_eq!(queue.teams, vec!["other"]);
        assert_eq!(store.rename_team("team", "team").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn app_set_updates_are_conditional() {
        let store = MemoryStore::new();
        store.insert_instance(&instance("db")).await.unwrap();
        assert!(store.add_app("mysql", "db", "myapp").await.unwrap());
        assert!(!store.add_app("mysql", "db", "myapp").await.unwrap());
        assert_eq!(
            store.list_instances_by_app("myapp").await.unwrap().len(),
            1
        );
        assert!(store.remove_app("mysql", "db", "myapp").await.unwrap());
        assert!(!store.remove_app("mysql", "db", "myapp").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_add_unit_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        store.insert_instance(&instance("db")).await.unwrap();
        let unit = BoundUnit::new("myapp", &Unit::new("u1", "10.0.0.1"));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let unit = unit.clone();
            handles.push(tokio::spawn(async move {
                store.add_unit("mysql", "db", &unit).await.unwrap()
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        let si = store.find_instance("mysql", "db").await.unwrap();
        assert_eq!(si.bound_units, vec![unit]);
    }

    #[tokio::test]
    async fn scoped_extra_only_set_when_empty() {
        let store = MemoryStore::new();
        let v = serde_json::json!("first");
        assert!(store.set_scoped_extra_if_empty("s", "lock", &v).await.unwrap());
        assert!(!store
            .set_scoped_extra_if_empty("s", "lock", &serde_json::json!("second"))
            .await
            .unwrap());
        store
            .set_scoped_extra("s", "lock", &serde_json::json!(""))
            .await
            .unwrap();
        assert!(store
            .set_scoped_extra_if_empty("s", "lock", &serde_json::json!("third"))
            .await
            .unwrap());
        let doc = store.find_scoped_config("s").await.unwrap().unwrap();
        assert_eq!(doc.extra["lock"], "third");
    }

    #[tokio::test]
    async fn webhooks_filter_by_team() {
        let store = MemoryStore::new();
        for (name, team) in [("a", "t1"), ("b", "t2"), ("c", "t1")] {
            store
                .insert_webhook(&Webhook {
                    name: name.into(),
                    team_owner: team.into(),
                    url: "http://x".into(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let t1 = store
            .list_webhooks(Some(&["t1".to_string()]))
            .await
            .unwrap();
        assert_eq!(
            t1.iter().map(|w| w.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
        assert_eq!(store.list_webhooks(None).await.unwrap().len(), 3);
    }
}
