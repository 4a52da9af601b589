//! Open Service Broker v2 client.
//!
//! [`OsbClient`] speaks the wire protocol. [`BrokerClient`] adapts it to
//! [`ServiceClient`] for services named `broker::service`, keeping the
//! broker-side ids of each instance in its `broker_data`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Response;
use base64::Engine;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use tsuru_types::{
    BindAppParameters, Broker, BrokerCatalog, BrokerInstanceBind, BrokerInstanceData,
    BrokerPlan, BrokerService, Plan, ServiceInstance, Unit,
};

use super::catalog::CatalogCache;
use super::client::{CallMeta, ServiceClient};
use crate::bind::App;
use crate::error::{Result, TsuruError};
use crate::storage::InstanceStorage;

pub const BROKER_API_VERSION: &str = "2.14";
const ORIGINATING_PLATFORM: &str = "tsuru";
const ASYNC_BINDING_NOT_ALLOWED: &str = "AsyncBindingOperationsNotAllowed";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionRequest {
    #[serde(skip)]
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    pub context: Map<String, Value>,
    #[serde(skip)]
    pub accepts_incomplete: bool,
    #[serde(skip)]
    pub originating_identity: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviousValues {
    pub plan_id: String,
    pub service_id: String,
    pub organization_id: String,
    pub space_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateInstanceRequest {
    #[serde(skip)]
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    pub context: Map<String, Value>,
    pub previous_values: PreviousValues,
    #[serde(skip)]
    pub accepts_incomplete: bool,
    #[serde(skip)]
    pub originating_identity: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub accepts_incomplete: bool,
    pub originating_identity: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BindResource {
    pub app_guid: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BindRequest {
    #[serde(skip)]
    pub instance_id: String,
    #[serde(skip)]
    pub binding_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub app_guid: String,
    pub bind_resource: BindResource,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    pub context: Map<String, Value>,
    #[serde(skip)]
    pub accepts_incomplete: bool,
    #[serde(skip)]
    pub originating_identity: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct UnbindRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub accepts_incomplete: bool,
    pub originating_identity: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct LastOperationRequest {
    pub instance_id: String,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation: Option<String>,
    pub originating_identity: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct BindingLastOperationRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationResponse {
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub dashboard_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LastOperationResponse {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BindResponse {
    #[serde(default)]
    pub credentials: Map<String, Value>,
    #[serde(default)]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetBindingResponse {
    #[serde(default)]
    pub credentials: Map<String, Value>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    services: Vec<BrokerService>,
}

#[derive(Debug, Default, Deserialize)]
struct BrokerErrorBody {
    #[serde(default)]
    error: String,
}

// ============================================================================
// OSB CLIENT
// ============================================================================

pub struct OsbClient {
    base: String,
    broker: Broker,
    http: Client,
}

impl OsbClient {
    pub fn new(broker: &Broker) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(broker.config.insecure)
            .build()?;
        Ok(Self {
            base: broker.url.trim_end_matches('/').to_string(),
            broker: broker.clone(),
            http,
        })
    }

    fn request(&self, method: Method, path: &str, identity: Option<&Value>) -> RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{}", self.base, path))
            .header("X-Broker-API-Version", BROKER_API_VERSION)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(auth) = &self.broker.config.auth_config {
            if let Some(basic) = &auth.basic {
                req = req.basic_auth(&basic.username, Some(&basic.password));
            } else if let Some(bearer) = &auth.bearer {
                req = req.bearer_auth(&bearer.token);
            }
        }
        if let Some(identity) = identity {
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(identity.to_string());
            req = req.header(
                "X-Broker-API-Originating-Identity",
                format!("{ORIGINATING_PLATFORM} {encoded}"),
            );
        }
        req
    }

    /// Sends and decodes. `gone_ok` treats 410 as an empty success.
    async fn send<T: DeserializeOwned + Default>(
        &self,
        req: RequestBuilder,
        path: &str,
        gone_ok: bool,
    ) -> Result<T> {
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        if gone_ok && status == 410 {
            return Ok(T::default());
        }
        let body = resp.bytes().await?;
        if !(200..300).contains(&status) {
            return Err(TsuruError::UnexpectedStatus {
                url: path.to_string(),
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        Ok(serde_json::from_slice(&body)?)
    }

    fn incomplete_query(accepts_incomplete: bool) -> Vec<(&'static str, String)> {
        if accepts_incomplete {
            vec![("accepts_incomplete", "true".to_string())]
        } else {
            Vec::new()
        }
    }

    pub async fn get_catalog(&self) -> Result<BrokerCatalog> {
        let path = "/v2/catalog";
        let resp: CatalogResponse = self
            .send(self.request(Method::GET, path, None), path, false)
            .await?;
        Ok(BrokerCatalog {
            services: resp.services,
        })
    }

    pub async fn provision_instance(&self, req: &ProvisionRequest) -> Result<OperationResponse> {
        let path = format!("/v2/service_instances/{}", req.instance_id);
        let builder = self
            .request(Method::PUT, &path, req.originating_identity.as_ref())
            .query(&Self::incomplete_query(req.accepts_incomplete))
            .json(req);
        self.send(builder, &path, false).await
    }

    pub async fn update_instance(&self, req: &UpdateInstanceRequest) -> Result<OperationResponse> {
        let path = format!("/v2/service_instances/{}", req.instance_id);
        let builder = self
            .request(Method::PATCH, &path, req.originating_identity.as_ref())
            .query(&Self::incomplete_query(req.accepts_incomplete))
            .json(req);
        self.send(builder, &path, false).await
    }

    pub async fn deprovision_instance(
        &self,
        req: &DeprovisionRequest,
    ) -> Result<OperationResponse> {
        let path = format!("/v2/service_instances/{}", req.instance_id);
        let mut query = Self::incomplete_query(req.accepts_incomplete);
        query.push(("service_id", req.service_id.clone()));
        query.push(("plan_id", req.plan_id.clone()));
        let builder = self
            .request(Method::DELETE, &path, req.originating_identity.as_ref())
            .query(&query);
        self.send(builder, &path, true).await
    }

    pub async fn poll_last_operation(
        &self,
        req: &LastOperationRequest,
    ) -> Result<LastOperationResponse> {
        let path = format!("/v2/service_instances/{}/last_operation", req.instance_id);
        let mut query = Vec::new();
        if let Some(v) = &req.service_id {
            query.push(("service_id", v.clone()));
        }
        if let Some(v) = &req.plan_id {
            query.push(("plan_id", v.clone()));
        }
        if let Some(v) = req.operation.as_ref().filter(|v| !v.is_empty()) {
            query.push(("operation", v.clone()));
        }
        let builder = self
            .request(Method::GET, &path, req.originating_identity.as_ref())
            .query(&query);
        self.send(builder, &path, false).await
    }

    pub async fn bind(&self, req: &BindRequest) -> Result<BindResponse> {
        let path = format!(
            "/v2/service_instances/{}/service_bindings/{}",
            req.instance_id, req.binding_id
        );
        let builder = self
            .request(Method::PUT, &path, req.originating_identity.as_ref())
            .query(&Self::incomplete_query(req.accepts_incomplete))
            .json(req);
        self.send(builder, &path, false).await
    }

    pub async fn unbind(&self, req: &UnbindRequest) -> Result<OperationResponse> {
        let path = format!(
            "/v2/service_instances/{}/service_bindings/{}",
            req.instance_id, req.binding_id
        );
        let mut query = Self::incomplete_query(req.accepts_incomplete);
        query.push(("service_id", req.service_id.clone()));
        query.push(("plan_id", req.plan_id.clone()));
        let builder = self
            .request(Method::DELETE, &path, req.originating_identity.as_ref())
            .query(&query);
        self.send(builder, &path, true).await
    }

    pub async fn get_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<GetBindingResponse> {
        let path = format!("/v2/service_instances/{instance_id}/service_bindings/{binding_id}");
        self.send(self.request(Method::GET, &path, None), &path, false)
            .await
    }

    pub async fn poll_binding_last_operation(
        &self,
        req: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse> {
        let path = format!(
            "/v2/service_instances/{}/service_bindings/{}/last_operation",
            req.instance_id, req.binding_id
        );
        let mut query = Vec::new();
        if let Some(v) = &req.service_id {
            query.push(("service_id", v.clone()));
        }
        if let Some(v) = &req.plan_id {
            query.push(("plan_id", v.clone()));
        }
        if let Some(v) = req.operation.as_ref().filter(|v| !v.is_empty()) {
            query.push(("operation", v.clone()));
        }
        let builder = self.request(Method::GET, &path, None).query(&query);
        self.send(builder, &path, false).await
    }
}

/// The broker refused an asynchronous bind or unbind.
pub fn is_async_binding_not_allowed(err: &TsuruError) -> bool {
    match err {
        TsuruError::UnexpectedStatus { status: 422, body, .. } => {
            serde_json::from_str::<BrokerErrorBody>(body)
                .map(|b| b.error == ASYNC_BINDING_NOT_ALLOWED)
                .unwrap_or(false)
        }
        _ => false,
    }
}

/// String and integer credentials become env vars; anything else is dropped.
pub fn credentials_to_envs(credentials: &Map<String, Value>) -> BTreeMap<String, String> {
    credentials
        .iter()
        .filter_map(|(k, v)| match v {
            Value::String(s) => Some((k.clone(), s.clone())),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some((k.clone(), n.to_string())),
            _ => None,
        })
        .collect()
}

// ============================================================================
// SERVICE CLIENT ADAPTER
// ============================================================================

pub struct BrokerClient {
    broker: Broker,
    service: String,
    osb: OsbClient,
    catalog: Arc<CatalogCache>,
    instances: Arc<dyn InstanceStorage>,
}

impl BrokerClient {
    pub fn new(
        broker: Broker,
        service: &str,
        catalog: Arc<CatalogCache>,
        instances: Arc<dyn InstanceStorage>,
    ) -> Result<Self> {
        let osb = OsbClient::new(&broker)?;
        Ok(Self {
            broker,
            service: service.to_string(),
            osb,
            catalog,
            instances,
        })
    }

    pub fn osb(&self) -> &OsbClient {
        &self.osb
    }

    /// Cached catalog, fetched from the broker on a miss.
    pub async fn catalog(&self) -> Result<BrokerCatalog> {
        if let Some(catalog) = self.catalog.load(&self.broker.name)? {
            return Ok(catalog);
        }
        let catalog = self.osb.get_catalog().await?;
        let ttl = self
            .broker
            .config
            .cache_expiration_seconds
            .map(Duration::from_secs);
        if let Err(e) = self.catalog.save(&self.broker.name, catalog.clone(), ttl) {
            tracing::error!(broker = %self.broker.name, error = %e, "error caching catalog");
        }
        Ok(catalog)
    }

    async fn catalog_service(&self) -> Result<BrokerService> {
        self.catalog()
            .await?
            .service(&self.service)
            .cloned()
            .ok_or(TsuruError::ServiceNotFound)
    }

    fn plan<'a>(service: &'a BrokerService, name: &str) -> Result<&'a BrokerPlan> {
        service
            .plans
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| TsuruError::InvalidInput(format!("invalid plan: {name}")))
    }

    fn context(&self, meta: &CallMeta) -> Map<String, Value> {
        let mut ctx = Map::new();
        ctx.insert(
            "request_id".into(),
            Value::String(meta.request_id.clone().unwrap_or_default()),
        );
        ctx.insert("event_id".into(), Value::String(meta.event_hex()));
        for (k, v) in &self.broker.config.context {
            ctx.insert(k.clone(), v.clone());
        }
        ctx
    }

    fn identity(meta: &CallMeta) -> Option<Value> {
        Some(serde_json::json!({ "user": meta.user }))
    }

    fn broker_data(instance: &ServiceInstance) -> Result<&BrokerInstanceData> {
        instance
            .broker_data
            .as_ref()
            .ok_or_else(|| TsuruError::InvalidInput("Invalid broker data".into()))
    }

    async fn persist(&self, instance: &ServiceInstance, data: BrokerInstanceData) -> Result<()> {
        self.instances
            .set_broker_data(&instance.service_name, &instance.name, Some(data))
            .await
    }
}

#[async_trait]
impl ServiceClient for BrokerClient {
    async fn create(&self, instance: &mut ServiceInstance, meta: &CallMeta) -> Result<()> {
        let service = self.catalog_service().await?;
        let plan = Self::plan(&service, &instance.plan_name)?;
        let org = Uuid::new_v4().to_string();
        let mut data = BrokerInstanceData {
            uuid: Uuid::new_v4().to_string(),
            service_id: service.id.clone(),
            plan_id: plan.id.clone(),
            org_id: org.clone(),
            space_id: org,
            ..Default::default()
        };
        let mut context = self.context(meta);
        context.insert("organization_guid".into(), Value::String(data.org_id.clone()));
        context.insert("space_guid".into(), Value::String(data.space_id.clone()));
        let req = ProvisionRequest {
            instance_id: data.uuid.clone(),
            service_id: data.service_id.clone(),
            plan_id: data.plan_id.clone(),
            organization_guid: data.org_id.clone(),
            space_guid: data.space_id.clone(),
            parameters: instance.parameters.clone(),
            context,
            accepts_incomplete: true,
            originating_identity: Self::identity(meta),
        };
        let resp = self.osb.provision_instance(&req).await?;
        if let Some(op) = resp.operation {
            data.last_operation_key = op;
        }
        instance.broker_data = Some(data);
        Ok(())
    }

    async fn update(&self, instance: &mut ServiceInstance, meta: &CallMeta) -> Result<()> {
        let mut data = Self::broker_data(instance)?.clone();
        let service = self.catalog_service().await?;
        let plan = Self::plan(&service, &instance.plan_name)?;
        let req = UpdateInstanceRequest {
            instance_id: data.uuid.clone(),
            service_id: service.id.clone(),
            plan_id: plan.id.clone(),
            parameters: instance.parameters.clone(),
            context: self.context(meta),
            previous_values: PreviousValues {
                plan_id: data.plan_id.clone(),
                service_id: data.service_id.clone(),
                organization_id: data.org_id.clone(),
                space_id: data.space_id.clone(),
            },
            accepts_incomplete: true,
            originating_identity: Self::identity(meta),
        };
        data.plan_id = plan.id.clone();
        data.service_id = service.id.clone();
        let resp = self.osb.update_instance(&req).await?;
        if let Some(op) = resp.operation {
            data.last_operation_key = op;
        }
        instance.broker_data = Some(data.clone());
        self.persist(instance, data).await
    }

    async fn destroy(&self, instance: &ServiceInstance, meta: &CallMeta) -> Result<()> {
        let Some(data) = instance.broker_data.clone() else {
            return Ok(());
        };
        let req = DeprovisionRequest {
            instance_id: data.uuid.clone(),
            service_id: data.service_id.clone(),
            plan_id: data.plan_id.clone(),
            accepts_incomplete: true,
            originating_identity: Self::identity(meta),
        };
        let resp = self.osb.deprovision_instance(&req).await?;
        if let Some(op) = resp.operation {
            let mut data = data;
            data.last_operation_key = op;
            self.persist(instance, data).await?;
        }
        Ok(())
    }

    async fn bind_app(
        &self,
        instance: &ServiceInstance,
        app: &dyn App,
        params: &BindAppParameters,
        meta: &CallMeta,
    ) -> Result<BTreeMap<String, String>> {
        let mut data = Self::broker_data(instance)?.clone();
        let mut bind = BrokerInstanceBind {
            uuid: Uuid::new_v4().to_string(),
            operation_key: String::new(),
            parameters: params.clone(),
        };
        let mut req = BindRequest {
            instance_id: data.uuid.clone(),
            binding_id: bind.uuid.clone(),
            service_id: data.service_id.clone(),
            plan_id: data.plan_id.clone(),
            app_guid: app.name().to_string(),
            bind_resource: BindResource {
                app_guid: app.name().to_string(),
            },
            parameters: params.clone(),
            context: self.context(meta),
            accepts_incomplete: true,
            originating_identity: Self::identity(meta),
        };
        let first = self.osb.bind(&req).await;
        let resp = match first {
            Err(e) if is_async_binding_not_allowed(&e) => {
                tracing::debug!(broker = %self.broker.name, "async bind refused, retrying synchronously");
                req.accepts_incomplete = false;
                self.osb.bind(&req).await?
            }
            other => other?,
        };
        if let Some(op) = resp.operation {
            bind.operation_key = op.clone();
            data.last_operation_key = op;
        }
        let envs = credentials_to_envs(&resp.credentials);
        data.binds.insert(app.name().to_string(), bind);
        self.persist(instance, data).await?;
        Ok(envs)
    }

    async fn bind_unit(&self, _: &ServiceInstance, _: &dyn App, _: &Unit) -> Result<()> {
        Ok(())
    }

    async fn unbind_app(
        &self,
        instance: &ServiceInstance,
        app: &dyn App,
        meta: &CallMeta,
    ) -> Result<()> {
        let mut data = Self::broker_data(instance)?.clone();
        let mut req = UnbindRequest {
            instance_id: data.uuid.clone(),
            binding_id: data
                .binds
                .get(app.name())
                .map(|b| b.uuid.clone())
                .unwrap_or_default(),
            service_id: data.service_id.clone(),
            plan_id: data.plan_id.clone(),
            accepts_incomplete: true,
            originating_identity: Self::identity(meta),
        };
        let first = self.osb.unbind(&req).await;
        let resp = match first {
            Err(e) if is_async_binding_not_allowed(&e) => {
                req.accepts_incomplete = false;
                self.osb.unbind(&req).await?
            }
            other => other?,
        };
        data.binds.remove(app.name());
        if let Some(op) = resp.operation {
            data.last_operation_key = op;
        }
        self.persist(instance, data).await
    }

    async fn unbind_unit(&self, _: &ServiceInstance, _: &dyn App, _: &Unit) -> Result<()> {
        Ok(())
    }

    async fn status(&self, instance: &ServiceInstance, _meta: &CallMeta) -> Result<String> {
        let data = Self::broker_data(instance)?;
        let op = self
            .osb
            .poll_last_operation(&LastOperationRequest {
                instance_id: data.uuid.clone(),
                service_id: Some(data.service_id.clone()),
                plan_id: Some(data.plan_id.clone()),
                operation: Some(data.last_operation_key.clone()),
                originating_identity: Some(serde_json::json!({ "team": instance.team_owner })),
            })
            .await?;
        Ok(match op.description {
            Some(desc) => format!("{} - {}", op.state, desc),
            None => op.state,
        })
    }

    async fn info(
        &self,
        instance: &ServiceInstance,
        _meta: &CallMeta,
    ) -> Result<Vec<BTreeMap<String, String>>> {
        Ok(instance
            .parameters
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                BTreeMap::from([("label".to_string(), k.clone()), ("value".to_string(), value)])
            })
            .collect())
    }

    async fn plans(&self, _meta: &CallMeta) -> Result<Vec<Plan>> {
        let service = self.catalog_service().await?;
        Ok(service.plans.iter().map(Plan::from).collect())
    }

    async fn proxy(&self, _path: &str, _meta: &CallMeta, _request: Request) -> Result<Response> {
        Err(TsuruError::InvalidInput(
            "service proxy is not available for broker services".into(),
        ))
    }
}
