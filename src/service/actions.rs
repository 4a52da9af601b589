//! Bind and unbind pipelines.
//!
//! `bind_app`: db -> endpoint -> envs -> units.
//! `unbind_app`: units -> db -> endpoint -> envs.
//! Every step undoes itself when a later step fails.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use tsuru_types::{BindAppParameters, BoundUnit, EnvVar, ServiceEnvVar, ServiceInstance, Unit};

use super::client::{CallMeta, ServiceClient};
use crate::action::{Action, BwContext, FwContext, Pipeline};
use crate::bind::{AddInstanceArgs, App, OutputWriter, RemoveInstanceArgs};
use crate::error::{Result, TsuruError};
use crate::limiter::ActionLimiter;
use crate::storage::InstanceStorage;

pub struct BindPipelineArgs {
    pub instance: ServiceInstance,
    pub app: Arc<dyn App>,
    pub client: Arc<dyn ServiceClient>,
    pub storage: Arc<dyn InstanceStorage>,
    pub limiter: Arc<ActionLimiter>,
    pub params: BindAppParameters,
    pub meta: CallMeta,
    pub should_restart: bool,
    pub force_remove: bool,
    pub writer: Arc<dyn OutputWriter>,
}

impl BindPipelineArgs {
    fn limiter_key(&self) -> String {
        limiter_key(&self.instance)
    }
}

/// Limiter key shared by every unit call against one instance.
pub fn limiter_key(instance: &ServiceInstance) -> String {
    format!("{}/{}", instance.service_name, instance.name)
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Done,
    Envs(BTreeMap<String, String>),
    Units(Vec<Unit>),
}

type Fw<'a> = FwContext<'a, BindPipelineArgs, StepResult>;
type Bw<'a> = BwContext<'a, BindPipelineArgs, StepResult>;

fn args<'a>(params: &'a [BindPipelineArgs]) -> Result<&'a BindPipelineArgs> {
    params.first().ok_or(TsuruError::PipelineFewParameters)
}

// ============================================================================
// UNIT PRIMITIVES
// ============================================================================

/// Records the unit, then calls the service. A failed call pulls the unit
/// back out and returns the service error.
pub async fn bind_unit(
    storage: &dyn InstanceStorage,
    client: &dyn ServiceClient,
    instance: &ServiceInstance,
    app: &dyn App,
    unit: &Unit,
) -> Result<()> {
    let bound = BoundUnit::new(app.name(), unit);
    if !storage
        .add_unit(&instance.service_name, &instance.name, &bound)
        .await?
    {
        return Err(TsuruError::UnitAlreadyBound);
    }
    if let Err(err) = client.bind_unit(instance, app, unit).await {
        if let Err(undo) = storage
            .remove_unit(&instance.service_name, &instance.name, &unit.id)
            .await
        {
            tracing::error!(
                instance = %instance.name,
                unit = %unit.id,
                error = %undo,
                "failed to pull unit after bind error"
            );
        }
        return Err(err);
    }
    Ok(())
}

/// Mirror of [`bind_unit`]: pull, call, re-add on failure.
pub async fn unbind_unit(
    storage: &dyn InstanceStorage,
    client: &dyn ServiceClient,
    instance: &ServiceInstance,
    app: &dyn App,
    unit: &Unit,
) -> Result<()> {
    if !storage
        .remove_unit(&instance.service_name, &instance.name, &unit.id)
        .await?
    {
        return Err(TsuruError::UnitNotBound);
    }
    if let Err(err) = client.unbind_unit(instance, app, unit).await {
        let bound = BoundUnit::new(app.name(), unit);
        if let Err(undo) = storage
            .add_unit(&instance.service_name, &instance.name, &bound)
            .await
        {
            tracing::error!(
                instance = %instance.name,
                unit = %unit.id,
                error = %undo,
                "failed to restore unit after unbind error"
            );
        }
        return Err(err);
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum UnitOp {
    Bind,
    Unbind,
}

enum UnitOutcome {
    Done(Unit),
    Skipped,
    Failed(TsuruError),
}

/// Runs `op` for every unit concurrently. Once one call fails, units that
/// have not started yet are skipped. Returns the units that succeeded and
/// the first error observed.
async fn fan_out(
    args: &BindPipelineArgs,
    units: Vec<Unit>,
    op: UnitOp,
    cancel: &CancellationToken,
) -> (Vec<Unit>, Option<TsuruError>) {
    let stop = cancel.child_token();
    let key = args.limiter_key();
    let mut tasks = JoinSet::new();
    for unit in units {
        let instance = args.instance.clone();
        let app = args.app.clone();
        let client = args.client.clone();
        let storage = args.storage.clone();
        let limiter = args.limiter.clone();
        let stop = stop.clone();
        let key = key.clone();
        tasks.spawn(async move {
            let _slot = tokio::select! {
                _ = stop.cancelled() => return UnitOutcome::Skipped,
                slot = limiter.guard(&key) => slot,
            };
            if stop.is_cancelled() {
                return UnitOutcome::Skipped;
            }
            let result = match op {
                UnitOp::Bind => {
                    bind_unit(storage.as_ref(), client.as_ref(), &instance, app.as_ref(), &unit)
                        .await
                }
                UnitOp::Unbind => {
                    unbind_unit(storage.as_ref(), client.as_ref(), &instance, app.as_ref(), &unit)
                        .await
                }
            };
            match result {
                Ok(()) => UnitOutcome::Done(unit),
                // Someone else already reached the desired state.
                Err(TsuruError::UnitAlreadyBound) if op == UnitOp::Bind => UnitOutcome::Skipped,
                Err(TsuruError::UnitNotBound) if op == UnitOp::Unbind => UnitOutcome::Skipped,
                Err(e) => UnitOutcome::Failed(e),
            }
        });
    }

    let mut done = Vec::new();
    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(UnitOutcome::Done(unit)) => done.push(unit),
            Ok(UnitOutcome::Skipped) => {}
            Ok(UnitOutcome::Failed(e)) => {
                stop.cancel();
                first_err.get_or_insert(e);
            }
            Err(join_err) => {
                stop.cancel();
                first_err.get_or_insert(TsuruError::Internal(anyhow::anyhow!(
                    "unit task failed: {join_err}"
                )));
            }
        }
    }
    (done, first_err)
}

/// Best-effort reversal of a fan-out; failures are logged.
async fn undo_units(args: &BindPipelineArgs, units: Vec<Unit>, op: UnitOp) {
    if units.is_empty() {
        return;
    }
    let (_, err) = fan_out(args, units, op, &CancellationToken::new()).await;
    if let Some(e) = err {
        tracing::error!(
            instance = %args.instance.name,
            app = %args.app.name(),
            error = %e,
            "failed to roll back unit binds"
        );
    }
}

// ============================================================================
// BIND APP
// ============================================================================

pub struct BindAppDb;

#[async_trait]
impl Action<BindPipelineArgs, StepResult> for BindAppDb {
    fn name(&self) -> &str {
        "bind-app-db"
    }

    fn min_params(&self) -> usize {
        1
    }

    async fn forward(&self, ctx: Fw<'_>) -> Result<StepResult> {
        let a = args(ctx.params)?;
        let added = a
            .storage
            .add_app(&a.instance.service_name, &a.instance.name, a.app.name())
            .await?;
        if !added {
            return Err(TsuruError::AppAlreadyBound);
        }
        Ok(StepResult::Done)
    }

    async fn backward(&self, ctx: Bw<'_>) -> Result<()> {
        let a = args(ctx.params)?;
        a.storage
            .remove_app(&a.instance.service_name, &a.instance.name, a.app.name())
            .await?;
        Ok(())
    }
}

pub struct BindAppEndpoint;

#[async_trait]
impl Action<BindPipelineArgs, StepResult> for BindAppEndpoint {
    fn name(&self) -> &str {
        "bind-app-endpoint"
    }

    fn min_params(&self) -> usize {
        1
    }

    async fn forward(&self, ctx: Fw<'_>) -> Result<StepResult> {
        let a = args(ctx.params)?;
        let envs = a
            .client
            .bind_app(&a.instance, a.app.as_ref(), &a.params, &a.meta)
            .await?;
        Ok(StepResult::Envs(envs))
    }

    async fn backward(&self, ctx: Bw<'_>) -> Result<()> {
        let a = args(ctx.params)?;
        a.client
            .unbind_app(&a.instance, a.app.as_ref(), &a.meta)
            .await
    }
}

pub struct SetBoundEnvs;

impl SetBoundEnvs {
    fn service_envs(instance: &ServiceInstance, envs: &BTreeMap<String, String>) -> Vec<ServiceEnvVar> {
        envs.iter()
            .map(|(name, value)| ServiceEnvVar {
                env: EnvVar {
                    name: name.clone(),
                    value: value.clone(),
                    public: false,
                },
                service_name: instance.service_name.clone(),
                instance_name: instance.name.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl Action<BindPipelineArgs, StepResult> for SetBoundEnvs {
    fn name(&self) -> &str {
        "set-bound-envs"
    }

    fn min_params(&self) -> usize {
        1
    }

    async fn forward(&self, ctx: Fw<'_>) -> Result<StepResult> {
        let a = args(ctx.params)?;
        let envs = match ctx.previous {
            Some(StepResult::Envs(envs)) => envs.clone(),
            _ => BTreeMap::new(),
        };
        a.app
            .add_instance(AddInstanceArgs {
                envs: Self::service_envs(&a.instance, &envs),
                should_restart: a.should_restart,
                writer: a.writer.clone(),
            })
            .await?;
        Ok(StepResult::Envs(envs))
    }

    async fn backward(&self, ctx: Bw<'_>) -> Result<()> {
        let a = args(ctx.params)?;
        a.app
            .remove_instance(RemoveInstanceArgs {
                service_name: a.instance.service_name.clone(),
                instance_name: a.instance.name.clone(),
                should_restart: a.should_restart,
                writer: a.writer.clone(),
            })
            .await
    }
}

pub struct BindUnits;

#[async_trait]
impl Action<BindPipelineArgs, StepResult> for BindUnits {
    fn name(&self) -> &str {
        "bind-units"
    }

    fn min_params(&self) -> usize {
        1
    }

    async fn forward(&self, ctx: Fw<'_>) -> Result<StepResult> {
        let a = args(ctx.params)?;
        let units = a.app.units().await?;
        let (done, err) = fan_out(a, units, UnitOp::Bind, ctx.cancel).await;
        if let Some(err) = err {
            undo_units(a, done, UnitOp::Unbind).await;
            return Err(err);
        }
        Ok(StepResult::Units(done))
    }

    async fn backward(&self, ctx: Bw<'_>) -> Result<()> {
        let a = args(ctx.params)?;
        if let StepResult::Units(units) = ctx.fw_result {
            undo_units(a, units.clone(), UnitOp::Unbind).await;
        }
        Ok(())
    }
}

// ============================================================================
// UNBIND APP
// ============================================================================

pub struct UnbindUnits;

#[async_trait]
impl Action<BindPipelineArgs, StepResult> for UnbindUnits {
    fn name(&self) -> &str {
        "unbind-units"
    }

    fn min_params(&self) -> usize {
        1
    }

    async fn forward(&self, ctx: Fw<'_>) -> Result<StepResult> {
        let a = args(ctx.params)?;
        let current = a
            .storage
            .find_instance(&a.instance.service_name, &a.instance.name)
            .await?;
        let units: Vec<Unit> = current
            .units_for_app(a.app.name())
            .map(|b| Unit::new(b.id.clone(), b.ip.clone()))
            .collect();
        let (done, err) = fan_out(a, units, UnitOp::Unbind, ctx.cancel).await;
        if let Some(err) = err {
            undo_units(a, done, UnitOp::Bind).await;
            return Err(err);
        }
        Ok(StepResult::Units(done))
    }

    async fn backward(&self, ctx: Bw<'_>) -> Result<()> {
        let a = args(ctx.params)?;
        if let StepResult::Units(units) = ctx.fw_result {
            undo_units(a, units.clone(), UnitOp::Bind).await;
        }
        Ok(())
    }
}

pub struct UnbindAppDb;

#[async_trait]
impl Action<BindPipelineArgs, StepResult> for UnbindAppDb {
    fn name(&self) -> &str {
        "unbind-app-db"
    }

    fn min_params(&self) -> usize {
        1
    }

    async fn forward(&self, ctx: Fw<'_>) -> Result<StepResult> {
        let a = args(ctx.params)?;
        let removed = a
            .storage
            .remove_app(&a.instance.service_name, &a.instance.name, a.app.name())
            .await?;
        if !removed {
            return Err(TsuruError::AppNotBound);
        }
        Ok(StepResult::Done)
    }

    async fn backward(&self, ctx: Bw<'_>) -> Result<()> {
        let a = args(ctx.params)?;
        a.storage
            .add_app(&a.instance.service_name, &a.instance.name, a.app.name())
            .await?;
        Ok(())
    }
}

pub struct UnbindAppEndpoint;

#[async_trait]
impl Action<BindPipelineArgs, StepResult> for UnbindAppEndpoint {
    fn name(&self) -> &str {
        "unbind-app-endpoint"
    }

    fn min_params(&self) -> usize {
        1
    }

    async fn forward(&self, ctx: Fw<'_>) -> Result<StepResult> {
        let a = args(ctx.params)?;
        match a
            .client
            .unbind_app(&a.instance, a.app.as_ref(), &a.meta)
            .await
        {
            Ok(()) => Ok(StepResult::Done),
            Err(e) if a.force_remove => {
                tracing::warn!(
                    instance = %a.instance.name,
                    app = %a.app.name(),
                    error = %e,
                    "ignoring unbind error due to force removal"
                );
                a.writer.write_line(&format!(
                    "could not unbind the app on the service api: {e}. ignoring this error due to force removal..."
                ));
                Ok(StepResult::Done)
            }
            Err(e) => Err(e),
        }
    }

    async fn backward(&self, ctx: Bw<'_>) -> Result<()> {
        let a = args(ctx.params)?;
        a.client
            .bind_app(&a.instance, a.app.as_ref(), &a.params, &a.meta)
            .await?;
        Ok(())
    }
}

pub struct RemoveBoundEnvs;

#[async_trait]
impl Action<BindPipelineArgs, StepResult> for RemoveBoundEnvs {
    fn name(&self) -> &str {
        "remove-bound-envs"
    }

    fn min_params(&self) -> usize {
        1
    }

    async fn forward(&self, ctx: Fw<'_>) -> Result<StepResult> {
        let a = args(ctx.params)?;
        a.app
            .remove_instance(RemoveInstanceArgs {
                service_name: a.instance.service_name.clone(),
                instance_name: a.instance.name.clone(),
                should_restart: a.should_restart,
                writer: a.writer.clone(),
            })
            .await?;
        Ok(StepResult::Done)
    }
}

pub fn bind_app_pipeline() -> Pipeline<BindPipelineArgs, StepResult> {
    Pipeline::new(vec![
        Arc::new(BindAppDb),
        Arc::new(BindAppEndpoint),
        Arc::new(SetBoundEnvs),
        Arc::new(BindUnits),
    ])
}

pub fn unbind_app_pipeline() -> Pipeline<BindPipelineArgs, StepResult> {
    Pipeline::new(vec![
        Arc::new(UnbindUnits),
        Arc::new(UnbindAppDb),
        Arc::new(UnbindAppEndpoint),
        Arc::new(RemoveBoundEnvs),
    ])
}
