//! Service registry: endpoint-backed services and their team access.

use std::sync::{Arc, OnceLock};

use regex::Regex;

use tsuru_types::Service;

use super::client::DEFAULT_ENDPOINT_ENV;
use crate::error::{Result, TsuruError};
use crate::storage::{InstanceStorage, ServiceStorage};

fn service_name_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9-]{0,62}$").ok())
        .as_ref()
}

fn invalid(message: &str) -> TsuruError {
    TsuruError::InvalidInput(message.to_string())
}

pub struct ServiceStore {
    services: Arc<dyn ServiceStorage>,
    instances: Arc<dyn InstanceStorage>,
}

impl ServiceStore {
    pub fn new(services: Arc<dyn ServiceStorage>, instances: Arc<dyn InstanceStorage>) -> Self {
        Self {
            services,
            instances,
        }
    }

    fn validate(service: &Service) -> Result<()> {
        if !service_name_regex().is_some_and(|re| re.is_match(&service.name)) {
            return Err(invalid(
                "invalid service name, should have at most 63 characters, containing only lower case letters, numbers or dashes, starting with a letter",
            ));
        }
        match service.endpoint.get(DEFAULT_ENDPOINT_ENV) {
            None => return Err(invalid("service production endpoint is required")),
            Some(url) => {
                url::Url::parse(url).map_err(|_| invalid("service production endpoint is not a valid url"))?;
            }
        }
        if service.password.is_empty() {
            return Err(invalid("service password is required"));
        }
        if service.owner_teams.is_empty() {
            return Err(invalid("at least one service team owner must be specified"));
        }
        Ok(())
    }

    pub async fn create(&self, mut service: Service) -> Result<Service> {
        Self::validate(&service)?;
        if service.username.is_empty() {
            service.username = service.name.clone();
        }
        self.services.insert_service(&service).await?;
        tracing::info!(service = %service.name, "service created");
        Ok(service)
    }

    pub async fn get(&self, name: &str) -> Result<Service> {
        self.services.find_service(name).await
    }

    pub async fn list(&self) -> Result<Vec<Service>> {
        let mut services = self.services.list_services().await?;
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    /// Replaces the stored document. The name cannot change.
    pub async fn update(&self, service: Service) -> Result<Service> {
        Self::validate(&service)?;
        self.services.find_service(&service.name).await?;
        self.services.update_service(&service).await?;
        Ok(service)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.services.find_service(name).await?;
        if !self.instances.list_instances_by_service(name).await?.is_empty() {
            return Err(TsuruError::ServiceHasInstances);
        }
        self.services.delete_service(name).await?;
        tracing::info!(service = %name, "service removed");
        Ok(())
    }

    // ── Team access ──

    pub async fn grant(&self, name: &str, team: &str) -> Result<()> {
        if !self.services.add_service_team(name, team).await? {
            tracing::debug!(service = %name, team = %team, "team already had access");
        }
        Ok(())
    }

    pub async fn revoke(&self, name: &str, team: &str) -> Result<()> {
        if !self.services.remove_service_team(name, team).await? {
            tracing::debug!(service = %name, team = %team, "team had no access");
        }
        Ok(())
    }
}
