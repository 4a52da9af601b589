//! Periodic reconciliation of bound units.
//!
//! Every tick the [`BindSyncer`] walks the apps returned by its
//! [`AppLister`], and for each service instance bound to an app binds the
//! units the instance does not know about and unbinds the ones that no longer
//! run. Each app is handled under an internal `bindsyncer` event so that two
//! syncers (or a concurrent deploy) never reconcile the same app at once.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tsuru_types::{Kind, Owner, Target, TargetType, Unit};

use super::instance::InstanceService;
use crate::bind::App;
use crate::error::{MultiError, Result, TsuruError};
use crate::event::{EventJournal, NewEventOpts};
use crate::shutdown::Shutdownable;

pub const SYNC_EVENT_KIND: &str = "bindsyncer";

/// Delay before the first pass after `start`.
const FIRST_TICK: Duration = Duration::from_millis(100);

#[async_trait]
pub trait AppLister: Send + Sync {
    async fn list_apps(&self) -> Result<Vec<Arc<dyn App>>>;
}

/// Lister over a fixed set of apps.
pub struct StaticAppLister {
    apps: Vec<Arc<dyn App>>,
}

impl StaticAppLister {
    pub fn new(apps: Vec<Arc<dyn App>>) -> Self {
        Self { apps }
    }
}

#[async_trait]
impl AppLister for StaticAppLister {
    async fn list_apps(&self) -> Result<Vec<Arc<dyn App>>> {
        Ok(self.apps.clone())
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub ticks: u64,
    pub binds: u64,
    pub unbinds: u64,
    pub bind_errors: u64,
    pub unbind_errors: u64,
    pub last_tick: Duration,
}

#[derive(Default)]
struct SyncCounters {
    ticks: AtomicU64,
    binds: AtomicU64,
    unbinds: AtomicU64,
    bind_errors: AtomicU64,
    unbind_errors: AtomicU64,
    last_tick_micros: AtomicU64,
}

/// What one app's reconciliation did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AppSync {
    pub binds: BTreeMap<String, Vec<String>>,
    pub unbinds: BTreeMap<String, Vec<String>>,
}

impl AppSync {
    fn is_empty(&self) -> bool {
        self.binds.is_empty() && self.unbinds.is_empty()
    }
}

pub struct BindSyncer {
    interval: Duration,
    instances: Arc<InstanceService>,
    journal: Arc<dyn EventJournal>,
    lister: Arc<dyn AppLister>,
    counters: SyncCounters,
    stop: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BindSyncer {
    pub fn new(
        interval: Duration,
        instances: Arc<InstanceService>,
        journal: Arc<dyn EventJournal>,
        lister: Arc<dyn AppLister>,
    ) -> Self {
        Self {
            interval,
            instances,
            journal,
            lister,
            counters: SyncCounters::default(),
            stop: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> SyncStats {
        let c = &self.counters;
        SyncStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            binds: c.binds.load(Ordering::Relaxed),
            unbinds: c.unbinds.load(Ordering::Relaxed),
            bind_errors: c.bind_errors.load(Ordering::Relaxed),
            unbind_errors: c.unbind_errors.load(Ordering::Relaxed),
            last_tick: Duration::from_micros(c.last_tick_micros.load(Ordering::Relaxed)),
        }
    }

    /// Spawns the loop. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }
        let syncer = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { syncer.run().await }));
        tracing::info!(interval = ?self.interval, "[bind-syncer] started");
    }

    async fn run(&self) {
        let mut wait = FIRST_TICK;
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            wait = self.interval;
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "[bind-syncer] error listing apps");
            }
        }
        tracing::info!("[bind-syncer] stopped");
    }

    /// One pass over every app. Stops between apps once shutdown started.
    pub async fn tick(&self) -> Result<()> {
        let started = Instant::now();
        let apps = self.lister.list_apps().await?;
        for app in apps {
            if self.stop.is_cancelled() {
                break;
            }
            if let Err(e) = self.sync_app(app.as_ref()).await {
                tracing::error!(app = %app.name(), error = %e, "[bind-syncer] error syncing app");
            }
        }
        let c = &self.counters;
        c.ticks.fetch_add(1, Ordering::Relaxed);
        c.last_tick_micros
            .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Reconciles one app under its `bindsyncer` event. A locked app is
    /// skipped and reported as `Ok(None)`.
    pub async fn sync_app(&self, app: &dyn App) -> Result<Option<AppSync>> {
        let opts = NewEventOpts::new(
            Target::new(TargetType::App, app.name()),
            Kind::internal(SYNC_EVENT_KIND),
            Owner::internal(),
        );
        let event = match self.journal.new_event(opts).await {
            Ok(event) => event,
            Err(TsuruError::EventLocked(holder)) => {
                tracing::debug!(app = %app.name(), %holder, "[bind-syncer] app locked, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut errors = MultiError::new();
        let outcome = self.reconcile(app, &mut errors).await;
        if outcome.is_empty() && errors.is_empty() {
            self.journal.abort(event.unique_id).await?;
            return Ok(Some(outcome));
        }
        if !outcome.is_empty() {
            tracing::info!(
                app = %app.name(),
                binds = ?outcome.binds,
                unbinds = ?outcome.unbinds,
                "[bind-syncer] units reconciled"
            );
        }
        let error = (!errors.is_empty()).then(|| errors.to_string());
        self.journal
            .done(
                event.unique_id,
                error,
                json!({ "binds": outcome.binds, "unbinds": outcome.unbinds }),
            )
            .await?;
        Ok(Some(outcome))
    }

    async fn reconcile(&self, app: &dyn App, errors: &mut MultiError) -> AppSync {
        let mut outcome = AppSync::default();
        let units = match app.units().await {
            Ok(units) => units,
            Err(e) => {
                errors.push(e);
                return outcome;
            }
        };
        let instances = match self.instances.list_by_app(app.name()).await {
            Ok(instances) => instances,
            Err(e) => {
                errors.push(e);
                return outcome;
            }
        };
        let live: HashSet<&str> = units.iter().map(|u| u.id.as_str()).collect();

        for instance in instances {
            let bound: HashSet<&str> = instance
                .units_for_app(app.name())
                .map(|b| b.id.as_str())
                .collect();

            for unit in units.iter().filter(|u| !bound.contains(u.id.as_str())) {
                match self
                    .instances
                    .bind_unit(&instance.service_name, &instance.name, app, unit)
                    .await
                {
                    Err(TsuruError::UnitAlreadyBound) => {}
                    Ok(()) => {
                        self.counters.binds.fetch_add(1, Ordering::Relaxed);
                        outcome
                            .binds
                            .entry(instance.name.clone())
                            .or_default()
                            .push(unit.id.clone());
                    }
                    Err(e) => {
                        self.counters.bind_errors.fetch_add(1, Ordering::Relaxed);
                        errors.push(TsuruError::Internal(anyhow::anyhow!(
                            "unable to bind unit {:?} to {}/{}: {e}",
                            unit.id,
                            instance.service_name,
                            instance.name
                        )));
                    }
                }
            }

            let stale: Vec<Unit> = instance
                .units_for_app(app.name())
                .filter(|b| !live.contains(b.id.as_str()))
                .map(|b| Unit::new(b.id.clone(), b.ip.clone()))
                .collect();
            for unit in &stale {
                match self
                    .instances
                    .unbind_unit(&instance.service_name, &instance.name, app, unit)
                    .await
                {
                    Err(TsuruError::UnitNotBound) => {}
                    Ok(()) => {
                        self.counters.unbinds.fetch_add(1, Ordering::Relaxed);
                        outcome
                            .unbinds
                            .entry(instance.name.clone())
                            .or_default()
                            .push(unit.id.clone());
                    }
                    Err(e) => {
                        self.counters.unbind_errors.fetch_add(1, Ordering::Relaxed);
                        errors.push(TsuruError::Internal(anyhow::anyhow!(
                            "unable to unbind unit {:?} from {}/{}: {e}",
                            unit.id,
                            instance.service_name,
                            instance.name
                        )));
                    }
                }
            }
        }
        outcome
    }
}

#[async_trait]
impl Shutdownable for BindSyncer {
    fn name(&self) -> String {
        "bind-syncer".to_string()
    }

    async fn shutdown(&self, deadline: Instant) -> Result<()> {
        self.stop.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };
        match tokio::time::timeout_at(deadline, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join)) => Err(TsuruError::Internal(anyhow::anyhow!(
                "bind syncer task failed: {join}"
            ))),
            Err(_) => Err(TsuruError::ShutdownTimeout(self.name())),
        }
    }
}
