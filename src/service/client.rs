//! The contract shared by legacy endpoints and OSB brokers, and the factory
//! that picks one for a service name.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Response;

use tsuru_types::{BindAppParameters, Event, EventId, Plan, ServiceInstance, Unit};

use super::broker::BrokerClient;
use super::catalog::CatalogCache;
use super::endpoint::EndpointClient;
use crate::bind::App;
use crate::error::{Result, TsuruError};
use crate::storage::{BrokerStorage, InstanceStorage, ServiceStorage};

/// Separates broker name and catalog service name: `broker::service`.
pub const BROKER_SEPARATOR: &str = "::";

/// Endpoint env used when none is requested.
pub const DEFAULT_ENDPOINT_ENV: &str = "production";

pub fn is_brokered(service_name: &str) -> bool {
    service_name.contains(BROKER_SEPARATOR)
}

/// Splits `broker::service`. `None` for endpoint-backed names.
pub fn split_brokered(service_name: &str) -> Option<(&str, &str)> {
    service_name.split_once(BROKER_SEPARATOR)
}

/// Who asked for a call, and under which event and request id.
#[derive(Debug, Clone, Default)]
pub struct CallMeta {
    pub user: String,
    pub event_id: Option<EventId>,
    pub request_id: Option<String>,
}

impl CallMeta {
    pub fn from_event(event: &Event) -> Self {
        Self {
            user: event.owner.name.clone(),
            event_id: Some(event.unique_id),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Event id in the compact hex form sent to service APIs.
    pub fn event_hex(&self) -> String {
        self.event_id
            .map(|id| id.simple().to_string())
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait ServiceClient: Send + Sync {
    // ── Instance lifecycle ──

    /// May fill in client-owned fields (broker data) before the instance is
    /// persisted.
    async fn create(&self, instance: &mut ServiceInstance, meta: &CallMeta) -> Result<()>;
    async fn update(&self, instance: &mut ServiceInstance, meta: &CallMeta) -> Result<()>;
    async fn destroy(&self, instance: &ServiceInstance, meta: &CallMeta) -> Result<()>;

    // ── Binding ──

    /// Returns the env vars to inject into the app.
    async fn bind_app(
        &self,
        instance: &ServiceInstance,
        app: &dyn App,
        params: &BindAppParameters,
        meta: &CallMeta,
    ) -> Result<BTreeMap<String, String>>;
    async fn bind_unit(&self, instance: &ServiceInstance, app: &dyn App, unit: &Unit)
        -> Result<()>;
    async fn unbind_app(
        &self,
        instance: &ServiceInstance,
        app: &dyn App,
        meta: &CallMeta,
    ) -> Result<()>;
    async fn unbind_unit(
        &self,
        instance: &ServiceInstance,
        app: &dyn App,
        unit: &Unit,
    ) -> Result<()>;

    // ── Queries ──

    async fn status(&self, instance: &ServiceInstance, meta: &CallMeta) -> Result<String>;
    /// `[{label, value}]` rows.
    async fn info(
        &self,
        instance: &ServiceInstance,
        meta: &CallMeta,
    ) -> Result<Vec<BTreeMap<String, String>>>;
    async fn plans(&self, meta: &CallMeta) -> Result<Vec<Plan>>;

    /// Forwards `request` to `path` on the service API.
    async fn proxy(&self, path: &str, meta: &CallMeta, request: Request) -> Result<Response>;
}

/// Resolves the client responsible for a service.
pub struct ClientFactory {
    services: Arc<dyn ServiceStorage>,
    brokers: Arc<dyn BrokerStorage>,
    instances: Arc<dyn InstanceStorage>,
    catalog: Arc<CatalogCache>,
    request_id_header: Option<String>,
}

impl ClientFactory {
    pub fn new(
        services: Arc<dyn ServiceStorage>,
        brokers: Arc<dyn BrokerStorage>,
        instances: Arc<dyn InstanceStorage>,
        catalog: Arc<CatalogCache>,
        request_id_header: Option<String>,
    ) -> Self {
        Self {
            services,
            brokers,
            instances,
            catalog,
            request_id_header,
        }
    }

    pub fn catalog(&self) -> &Arc<CatalogCache> {
        &self.catalog
    }

    pub async fn client_for(&self, service_name: &str) -> Result<Arc<dyn ServiceClient>> {
        if let Some((broker_name, service)) = split_brokered(service_name) {
            let broker = self
                .brokers
                .find_broker(broker_name)
                .await
                .map_err(|_| TsuruError::BrokerNotFound(broker_name.to_string()))?;
            let client = BrokerClient::new(
                broker,
                service,
                self.catalog.clone(),
                self.instances.clone(),
            )?;
            return Ok(Arc::new(client));
        }
        let service = self.services.find_service(service_name).await?;
        let endpoint = service
            .endpoint
            .get(DEFAULT_ENDPOINT_ENV)
            .ok_or_else(|| {
                TsuruError::InvalidInput(format!(
                    "unknown endpoint {DEFAULT_ENDPOINT_ENV:?} for service {service_name:?}"
                ))
            })?;
        let client = EndpointClient::new(
            &service.name,
            endpoint,
            &service.username,
            &service.password,
            self.request_id_header.clone(),
        )?;
        Ok(Arc::new(client))
    }
}
