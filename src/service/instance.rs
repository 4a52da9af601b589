//! Service instance lifecycle.
//!
//! [`InstanceService`] owns every mutation of a service instance: creation
//! through a create-then-insert pipeline, app and unit binding, team access,
//! updates, destruction and the request proxy to the service API.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Response;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use tsuru_types::{BindAppParameters, Plan, ServiceInstance, Unit};

use super::actions::{self, BindPipelineArgs};
use super::client::{CallMeta, ClientFactory, ServiceClient};
use super::proxy;
use crate::action::{Action, BwContext, FwContext, Pipeline};
use crate::bind::{App, NullWriter, OutputWriter};
use crate::error::{Result, TsuruError};
use crate::limiter::ActionLimiter;
use crate::storage::InstanceStorage;

fn name_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{1,62}$").ok())
        .as_ref()
}

pub fn validate_name(name: &str) -> Result<()> {
    if name_regex().is_some_and(|re| re.is_match(name)) {
        Ok(())
    } else {
        Err(TsuruError::InvalidInstanceName)
    }
}

/// Trims tags and drops blanks and duplicates, keeping first-seen order.
pub fn process_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

/// Options shared by `bind_app` and `unbind_app`.
#[derive(Clone)]
pub struct BindOpts {
    pub params: BindAppParameters,
    pub should_restart: bool,
    /// Unbind only: ignore errors from the service API.
    pub force_remove: bool,
    pub writer: Arc<dyn OutputWriter>,
    pub meta: CallMeta,
}

impl Default for BindOpts {
    fn default() -> Self {
        Self {
            params: BindAppParameters::new(),
            should_restart: true,
            force_remove: false,
            writer: Arc::new(NullWriter),
            meta: CallMeta::default(),
        }
    }
}

/// Mutable fields accepted by `update`. `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct InstanceUpdate {
    pub description: Option<String>,
    pub plan_name: Option<String>,
    pub team_owner: Option<String>,
    pub tags: Option<Vec<String>>,
    pub parameters: Option<BTreeMap<String, serde_json::Value>>,
}

pub struct InstanceService {
    storage: Arc<dyn InstanceStorage>,
    clients: Arc<ClientFactory>,
    limiter: Arc<ActionLimiter>,
}

impl InstanceService {
    pub fn new(
        storage: Arc<dyn InstanceStorage>,
        clients: Arc<ClientFactory>,
        limiter: Arc<ActionLimiter>,
    ) -> Self {
        Self {
            storage,
            clients,
            limiter,
        }
    }

    pub fn storage(&self) -> &Arc<dyn InstanceStorage> {
        &self.storage
    }

    // ── Lookup ──

    pub async fn get(&self, service: &str, name: &str) -> Result<ServiceInstance> {
        self.storage.find_instance(service, name).await
    }

    pub async fn list_by_service(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        self.storage.list_instances_by_service(service).await
    }

    pub async fn list_by_app(&self, app: &str) -> Result<Vec<ServiceInstance>> {
        self.storage.list_instances_by_app(app).await
    }

    // ── Lifecycle ──

    /// Provisions the instance on the service, then stores it. A failed
    /// insert destroys the remote resource again.
    pub async fn create(
        &self,
        mut instance: ServiceInstance,
        meta: &CallMeta,
    ) -> Result<ServiceInstance> {
        validate_name(&instance.name)?;
        match self
            .storage
            .find_instance(&instance.service_name, &instance.name)
            .await
        {
            Ok(_) => return Err(TsuruError::InstanceNameAlreadyExists(instance.name)),
            Err(TsuruError::ServiceInstanceNotFound) => {}
            Err(e) => return Err(e),
        }
        if instance.team_owner.trim().is_empty() {
            return Err(TsuruError::TeamMandatory);
        }
        instance.teams = vec![instance.team_owner.clone()];
        instance.apps.clear();
        instance.bound_units.clear();
        instance.tags = process_tags(&instance.tags);

        let client = self.clients.client_for(&instance.service_name).await?;
        let args = CreateArgs {
            instance,
            client,
            storage: self.storage.clone(),
            meta: meta.clone(),
        };
        let pipeline: Pipeline<CreateArgs, ServiceInstance> =
            Pipeline::new(vec![Arc::new(CreateAtService), Arc::new(InsertInstance)]);
        let created = pipeline
            .execute(&CancellationToken::new(), std::slice::from_ref(&args))
            .await?;
        tracing::info!(
            service = %created.service_name,
            instance = %created.name,
            team = %created.team_owner,
            "service instance created"
        );
        Ok(created)
    }

    pub async fn update(
        &self,
        service: &str,
        name: &str,
        changes: InstanceUpdate,
        meta: &CallMeta,
    ) -> Result<ServiceInstance> {
        let mut instance = self.storage.find_instance(service, name).await?;
        let mut new_owner = None;
        if let Some(owner) = changes.team_owner {
            let owner = owner.trim();
            if owner.is_empty() {
                return Err(TsuruError::TeamMandatory);
            }
            instance.team_owner = owner.to_string();
            new_owner = Some(owner.to_string());
        }
        if let Some(description) = changes.description {
            instance.description = description;
        }
        if let Some(plan) = changes.plan_name {
            instance.plan_name = plan;
        }
        if let Some(tags) = changes.tags {
            instance.tags = process_tags(&tags);
        }
        if let Some(parameters) = changes.parameters {
            instance.parameters = parameters;
        }
        let client = self.clients.client_for(service).await?;
        client.update(&mut instance, meta).await?;
        self.storage.update_instance(&instance).await?;
        if let Some(owner) = new_owner {
            self.storage.add_team(service, name, &owner).await?;
        }
        self.storage.find_instance(service, name).await
    }

    /// Refuses while apps are bound, checked again when the document is
    /// removed. With `force_remove`, a service API failure is reported to
    /// `writer` and the document is removed anyway.
    pub async fn destroy(
        &self,
        service: &str,
        name: &str,
        force_remove: bool,
        writer: &dyn OutputWriter,
        meta: &CallMeta,
    ) -> Result<()> {
        let instance = self.storage.find_instance(service, name).await?;
        if !instance.apps.is_empty() {
            return Err(TsuruError::ServiceInstanceBound);
        }
        let client = self.clients.client_for(service).await?;
        if let Err(e) = client.destroy(&instance, meta).await {
            if !force_remove {
                return Err(e);
            }
            tracing::warn!(
                service = %service,
                instance = %name,
                error = %e,
                "ignoring destroy error due to force removal"
            );
            writer.write_line(&format!(
                "could not delete the instance on the service api: {e}. ignoring this error due to force removal..."
            ));
        }
        self.storage.delete_instance_if_unbound(service, name).await?;
        tracing::info!(service = %service, instance = %name, "service instance removed");
        Ok(())
    }

    // ── Team access ──

    pub async fn grant(&self, service: &str, name: &str, team: &str) -> Result<()> {
        self.storage.add_team(service, name, team).await?;
        Ok(())
    }

    pub async fn revoke(&self, service: &str, name: &str, team: &str) -> Result<()> {
        let instance = self.storage.find_instance(service, name).await?;
        if instance.team_owner == team {
            return Err(TsuruError::RevokeInstanceTeamOwnerAccess);
        }
        self.storage.remove_team(service, name, team).await?;
        Ok(())
    }

    /// Moves every instance owned by or shared with `old` over to `new`.
    pub async fn rename_team(&self, old: &str, new: &str) -> Result<usize> {
        if new.trim().is_empty() {
            return Err(TsuruError::TeamMandatory);
        }
        let changed = self.storage.rename_team(old, new).await?;
        tracing::info!(old = %old, new = %new, instances = changed, "instance team renamed");
        Ok(changed)
    }

    // ── Binding ──

    pub async fn bind_app(
        &self,
        service: &str,
        name: &str,
        app: Arc<dyn App>,
        opts: BindOpts,
    ) -> Result<()> {
        let args = self.pipeline_args(service, name, app, opts).await?;
        actions::bind_app_pipeline()
            .execute(&CancellationToken::new(), std::slice::from_ref(&args))
            .await?;
        tracing::info!(
            service = %service,
            instance = %name,
            app = %args.app.name(),
            "app bound"
        );
        Ok(())
    }

    pub async fn unbind_app(
        &self,
        service: &str,
        name: &str,
        app: Arc<dyn App>,
        opts: BindOpts,
    ) -> Result<()> {
        let args = self.pipeline_args(service, name, app, opts).await?;
        if !args.instance.apps.iter().any(|a| a == args.app.name()) {
            return Err(TsuruError::AppNotBound);
        }
        actions::unbind_app_pipeline()
            .execute(&CancellationToken::new(), std::slice::from_ref(&args))
            .await?;
        tracing::info!(
            service = %service,
            instance = %name,
            app = %args.app.name(),
            "app unbound"
        );
        Ok(())
    }

    pub async fn bind_unit(
        &self,
        service: &str,
        name: &str,
        app: &dyn App,
        unit: &Unit,
    ) -> Result<()> {
        let instance = self.storage.find_instance(service, name).await?;
        let client = self.clients.client_for(service).await?;
        let _slot = self.limiter.guard(&actions::limiter_key(&instance)).await;
        actions::bind_unit(
            self.storage.as_ref(),
            client.as_ref(),
            &instance,
            app,
            unit,
        )
        .await
    }

    pub async fn unbind_unit(
        &self,
        service: &str,
        name: &str,
        app: &dyn App,
        unit: &Unit,
    ) -> Result<()> {
        let instance = self.storage.find_instance(service, name).await?;
        let client = self.clients.client_for(service).await?;
        let _slot = self.limiter.guard(&actions::limiter_key(&instance)).await;
        actions::unbind_unit(
            self.storage.as_ref(),
            client.as_ref(),
            &instance,
            app,
            unit,
        )
        .await
    }

    async fn pipeline_args(
        &self,
        service: &str,
        name: &str,
        app: Arc<dyn App>,
        opts: BindOpts,
    ) -> Result<BindPipelineArgs> {
        let instance = self.storage.find_instance(service, name).await?;
        let client = self.clients.client_for(service).await?;
        Ok(BindPipelineArgs {
            instance,
            app,
            client,
            storage: self.storage.clone(),
            limiter: self.limiter.clone(),
            params: opts.params,
            meta: opts.meta,
            should_restart: opts.should_restart,
            force_remove: opts.force_remove,
            writer: opts.writer,
        })
    }

    // ── Queries ──

    pub async fn status(&self, service: &str, name: &str, meta: &CallMeta) -> Result<String> {
        let instance = self.storage.find_instance(service, name).await?;
        let client = self.clients.client_for(service).await?;
        client.status(&instance, meta).await
    }

    /// Flattens the service's `[{label, value}]` rows into one map.
    pub async fn info(
        &self,
        service: &str,
        name: &str,
        meta: &CallMeta,
    ) -> Result<BTreeMap<String, String>> {
        let instance = self.storage.find_instance(service, name).await?;
        let client = self.clients.client_for(service).await?;
        let rows = client.info(&instance, meta).await?;
        Ok(rows
            .into_iter()
            .filter_map(|mut row| {
                let label = row.remove("label")?;
                Some((label, row.remove("value").unwrap_or_default()))
            })
            .collect())
    }

    pub async fn plans(&self, service: &str, meta: &CallMeta) -> Result<Vec<Plan>> {
        self.clients.client_for(service).await?.plans(meta).await
    }

    // ── Proxy ──

    pub async fn proxy(
        &self,
        service: &str,
        name: &str,
        path: &str,
        meta: &CallMeta,
        request: Request,
    ) -> Result<Response> {
        let instance = self.storage.find_instance(service, name).await?;
        let target = proxy::instance_target(&instance.name, request.method(), path)?;
        let client = self.clients.client_for(service).await?;
        tracing::debug!(service = %service, instance = %name, path = %target, "proxying request");
        client.proxy(&target, meta, request).await
    }
}

// ============================================================================
// CREATE PIPELINE
// ============================================================================

struct CreateArgs {
    instance: ServiceInstance,
    client: Arc<dyn ServiceClient>,
    storage: Arc<dyn InstanceStorage>,
    meta: CallMeta,
}

struct CreateAtService;

#[async_trait]
impl Action<CreateArgs, ServiceInstance> for CreateAtService {
    fn name(&self) -> &str {
        "create-service-instance"
    }

    fn min_params(&self) -> usize {
        1
    }

    async fn forward(&self, ctx: FwContext<'_, CreateArgs, ServiceInstance>) -> Result<ServiceInstance> {
        let args = ctx.params.first().ok_or(TsuruError::PipelineFewParameters)?;
        let mut instance = args.instance.clone();
        args.client.create(&mut instance, &args.meta).await?;
        Ok(instance)
    }

    async fn backward(&self, ctx: BwContext<'_, CreateArgs, ServiceInstance>) -> Result<()> {
        let args = ctx.params.first().ok_or(TsuruError::PipelineFewParameters)?;
        args.client.destroy(ctx.fw_result, &args.meta).await
    }
}

struct InsertInstance;

#[async_trait]
impl Action<CreateArgs, ServiceInstance> for InsertInstance {
    fn name(&self) -> &str {
        "insert-service-instance"
    }

    fn min_params(&self) -> usize {
        1
    }

    async fn forward(&self, ctx: FwContext<'_, CreateArgs, ServiceInstance>) -> Result<ServiceInstance> {
        let args = ctx.params.first().ok_or(TsuruError::PipelineFewParameters)?;
        let instance = ctx.previous.cloned().unwrap_or_else(|| args.instance.clone());
        args.storage.insert_instance(&instance).await?;
        Ok(instance)
    }
}
