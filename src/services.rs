//! Explicit construction of every core component.
//!
//! Nothing in the crate is a process-wide singleton. The daemon builds one
//! [`Services`] at startup and hands out clones of the `Arc`s; tests build
//! their own against a fresh [`MemoryStore`].

use std::sync::Arc;

use crate::config::CoreSettings;
use crate::error::Result;
use crate::event::{EventJournal, MemoryJournal};
use crate::limiter::ActionLimiter;
use crate::permission::{standard_registry, PermissionRegistry, RoleStore};
use crate::service::{
    AppLister, BindSyncer, CatalogCache, ClientFactory, InstanceService, ServiceStore,
};
use crate::shutdown::ShutdownRegistry;
use crate::storage::MemoryStore;
use crate::webhook::{WebhookDispatcher, WebhookService};

pub struct Services {
    pub settings: CoreSettings,
    pub store: Arc<MemoryStore>,
    pub journal: Arc<MemoryJournal>,
    pub permissions: Arc<PermissionRegistry>,
    pub roles: Arc<RoleStore>,
    pub limiter: Arc<ActionLimiter>,
    pub clients: Arc<ClientFactory>,
    pub service_store: Arc<ServiceStore>,
    pub instances: Arc<InstanceService>,
    pub webhooks: Arc<WebhookService>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub shutdown: Arc<ShutdownRegistry>,
}

impl Services {
    /// Builds every component over an in-memory store. The journal notifies
    /// the webhook dispatcher; nothing is started yet.
    pub fn in_memory(settings: CoreSettings) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let journal = Arc::new(MemoryJournal::with_retention(settings.event_retention));
        let permissions = Arc::new(standard_registry()?);
        let roles = Arc::new(RoleStore::new(
            permissions.clone(),
            store.clone(),
            store.clone(),
        ));
        let limiter = Arc::new(ActionLimiter::new(settings.bind_unit_max_concurrency));
        let clients = Arc::new(ClientFactory::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(CatalogCache::default()),
            settings.request_id_header.clone(),
        ));
        let service_store = Arc::new(ServiceStore::new(store.clone(), store.clone()));
        let instances = Arc::new(InstanceService::new(
            store.clone(),
            clients.clone(),
            limiter.clone(),
        ));
        let webhooks = Arc::new(WebhookService::new(store.clone()));
        let dispatcher = Arc::new(WebhookDispatcher::new(
            store.clone(),
            journal.clone(),
            settings.webhook_buffer_size,
        )?);
        journal.set_notifier(dispatcher.notifier());

        Ok(Self {
            settings,
            store,
            journal,
            permissions,
            roles,
            limiter,
            clients,
            service_store,
            instances,
            webhooks,
            dispatcher,
            shutdown: Arc::new(ShutdownRegistry::new()),
        })
    }

    pub fn journal(&self) -> Arc<dyn EventJournal> {
        self.journal.clone()
    }

    pub fn bind_syncer(&self, lister: Arc<dyn AppLister>) -> Arc<BindSyncer> {
        Arc::new(BindSyncer::new(
            self.settings.sync_interval,
            self.instances.clone(),
            self.journal(),
            lister,
        ))
    }

    /// Starts the dispatcher and a bind syncer over `lister`, registering
    /// both for shutdown. Must be called inside a tokio runtime.
    pub fn start(&self, lister: Arc<dyn AppLister>) -> Result<Arc<BindSyncer>> {
        self.dispatcher.start();
        self.shutdown.register(self.dispatcher.clone())?;
        let syncer = self.bind_syncer(lister);
        syncer.start();
        self.shutdown.register(syncer.clone())?;
        tracing::info!(
            sync_interval = ?self.settings.sync_interval,
            webhook_buffer = self.settings.webhook_buffer_size,
            "core services started"
        );
        Ok(syncer)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown
            .shutdown_all(self.settings.shutdown_timeout)
            .await
    }
}
