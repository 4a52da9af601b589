//! Event to webhook fan-out.
//!
//! Finished events reach the dispatcher through [`WebhookNotifier::notify`],
//! which never blocks: when the queue is full, or the dispatcher is shutting
//! down, the id is dropped and counted. A single task drains the queue, loads
//! each event, selects the webhooks whose filter matches and calls them one
//! after the other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tsuru_types::{Event, EventId, Webhook, WebhookEventFilter};

use super::template::BodyRenderer;
use crate::error::{Result, TsuruError};
use crate::event::{EventJournal, EventNotifier};
use crate::shutdown::Shutdownable;
use crate::storage::WebhookStorage;

pub const DEFAULT_USER_AGENT: &str = "tsuru-webhook-client/1.0";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Whether `filter` selects `event`. Extra targets widen the target lists.
pub fn filter_matches(filter: &WebhookEventFilter, event: &Event) -> bool {
    fn any_of(wanted: &[String], have: &[&str]) -> bool {
        wanted.is_empty() || wanted.iter().any(|w| have.contains(&w.as_str()))
    }

    let mut types = vec![event.target.target_type.as_str()];
    let mut values = vec![event.target.value.as_str()];
    for extra in &event.extra_targets {
        types.push(extra.target.target_type.as_str());
        values.push(extra.target.value.as_str());
    }
    if filter.error_only && event.is_success() {
        return false;
    }
    if filter.success_only && !event.is_success() {
        return false;
    }
    any_of(&filter.target_types, &types)
        && any_of(&filter.target_values, &values)
        && any_of(&filter.kind_types, &[event.kind.kind_type.as_str()])
        && any_of(&filter.kind_names, &[event.kind.name.as_str()])
}

fn http_client(insecure: bool, proxy: Option<&str>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .pool_max_idle_per_host(0)
        .danger_accept_invalid_certs(insecure);
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    Ok(builder.build()?)
}

// ============================================================================
// COUNTERS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub queued: u64,
    pub dropped: u64,
    pub calls: u64,
    pub failed_calls: u64,
    /// Events waiting in the queue right now.
    pub queue_len: usize,
    pub last_latency: Duration,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    dropped: AtomicU64,
    calls: AtomicU64,
    failed_calls: AtomicU64,
    last_latency_micros: AtomicU64,
}

// ============================================================================
// NOTIFIER
// ============================================================================

/// Sending half handed to the event journal.
#[derive(Clone)]
pub struct WebhookNotifier {
    sender: mpsc::Sender<EventId>,
    quit: CancellationToken,
    counters: Arc<Counters>,
}

impl EventNotifier for WebhookNotifier {
    fn notify(&self, id: EventId) {
        if self.quit.is_cancelled() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.sender.try_send(id) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event = %id, "[webhooks] queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

pub struct WebhookDispatcher {
    storage: Arc<dyn WebhookStorage>,
    journal: Arc<dyn EventJournal>,
    notifier: WebhookNotifier,
    receiver: Mutex<Option<mpsc::Receiver<EventId>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    renderer: BodyRenderer,
    client: reqwest::Client,
    insecure_client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(
        storage: Arc<dyn WebhookStorage>,
        journal: Arc<dyn EventJournal>,
        buffer_size: usize,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        Ok(Self {
            storage,
            journal,
            notifier: WebhookNotifier {
                sender,
                quit: CancellationToken::new(),
                counters: Arc::new(Counters::default()),
            },
            receiver: Mutex::new(Some(receiver)),
            handle: Mutex::new(None),
            renderer: BodyRenderer::new(),
            client: http_client(false, None)?,
            insecure_client: http_client(true, None)?,
        })
    }

    pub fn notifier(&self) -> Arc<dyn EventNotifier> {
        Arc::new(self.notifier.clone())
    }

    pub fn stats(&self) -> DispatcherStats {
        let c = &self.notifier.counters;
        let sender = &self.notifier.sender;
        DispatcherStats {
            queued: c.queued.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            calls: c.calls.load(Ordering::Relaxed),
            failed_calls: c.failed_calls.load(Ordering::Relaxed),
            queue_len: sender.max_capacity() - sender.capacity(),
            last_latency: Duration::from_micros(c.last_latency_micros.load(Ordering::Relaxed)),
        }
    }

    /// Spawns the delivery loop. Only the first call has an effect.
    pub fn start(self: &Arc<Self>) {
        let Some(receiver) = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };
        let dispatcher = Arc::clone(self);
        let handle = tokio::spawn(async move { dispatcher.run(receiver).await });
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        tracing::info!("[webhooks] dispatcher started");
    }

    async fn run(&self, mut receiver: mpsc::Receiver<EventId>) {
        let quit = self.notifier.quit.clone();
        loop {
            tokio::select! {
                biased;
                _ = quit.cancelled() => break,
                next = receiver.recv() => {
                    let Some(id) = next else { break };
                    if let Err(e) = self.handle_event(id).await {
                        tracing::error!(event = %id, error = %e, "[webhooks] error handling webhooks for event");
                    }
                }
            }
        }
        tracing::info!("[webhooks] dispatcher stopped");
    }

    /// Calls every webhook matching the event. Per-hook failures are logged.
    pub async fn handle_event(&self, id: EventId) -> Result<()> {
        let event = self.journal.get_by_id(id).await?;
        let hooks = self.storage.list_webhooks(None).await?;
        for hook in hooks
            .iter()
            .filter(|h| filter_matches(&h.event_filter, &event))
        {
            if let Err(e) = self.call_hook(hook, &event).await {
                tracing::error!(
                    webhook = %hook.name,
                    event = %id,
                    error = %e,
                    "[webhooks] error calling webhook"
                );
            }
        }
        Ok(())
    }

    async fn call_hook(&self, hook: &Webhook, event: &Event) -> Result<()> {
        let counters = &self.notifier.counters;
        counters.calls.fetch_add(1, Ordering::Relaxed);
        let result = self.send_hook(hook, event).await;
        if result.is_err() {
            counters.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn send_hook(&self, hook: &Webhook, event: &Event) -> Result<()> {
        let method = if hook.method.is_empty() {
            Method::POST
        } else {
            Method::from_bytes(hook.method.to_uppercase().as_bytes())
                .map_err(|e| TsuruError::InvalidWebhook(format!("invalid method: {e}")))?
        };

        let mut headers = HeaderMap::new();
        for (name, values) in &hook.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.append(name.clone(), value);
                }
            }
        }

        let payload = serde_json::to_value(event)?;
        let body = if !hook.body.is_empty() {
            Some(self.renderer.render_or_literal(&hook.name, &hook.body, &payload))
        } else if [Method::POST, Method::PUT, Method::PATCH].contains(&method) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Some(serde_json::to_string(&payload)?)
        } else {
            None
        };
        if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        }

        let proxied;
        let client = if !hook.proxy_url.is_empty() {
            proxied = http_client(hook.insecure, Some(&hook.proxy_url))?;
            &proxied
        } else if hook.insecure {
            &self.insecure_client
        } else {
            &self.client
        };

        let mut request = client.request(method, &hook.url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }
        let started = Instant::now();
        let response = request.send().await;
        self.notifier
            .counters
            .last_latency_micros
            .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        let response = response?;
        let status = response.status().as_u16();
        if !(200..400).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(TsuruError::HookStatus { status, body });
        }
        tracing::debug!(webhook = %hook.name, status, "[webhooks] hook called");
        Ok(())
    }
}

#[async_trait]
impl Shutdownable for WebhookDispatcher {
    fn name(&self) -> String {
        "webhook-dispatcher".to_string()
    }

    async fn shutdown(&self, deadline: Instant) -> Result<()> {
        self.notifier.quit.cancel();
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
                "webhook dispatcher task failed: {join}"
            ))),
            Err(_) => Err(TsuruError::ShutdownTimeout(self.name())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MemoryJournal;
    use crate::storage::MemoryStore;
    use tsuru_types::{ExtraTarget, Kind, Owner, Target, TargetType};

    fn event(target: Target, kind: Kind, error: &str) -> Event {
        Event {
            unique_id: uuid::Uuid::new_v4(),
            target,
            extra_targets: vec![],
            kind,
            owner: Owner::internal(),
            start_time: chrono::Utc::now(),
            end_time: None,
            error: error.to_string(),
            running: false,
            cancelable: false,
            start_custom_data: serde_json::Value::Null,
            end_custom_data: serde_json::Value::Null,
            other_custom_data: serde_json::Value::Null,
        }
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn filters() -> Vec<WebhookEventFilter> {
        let f = |tt: &[&str], tv: &[&str], kt: &[&str], kn: &[&str], err: bool, ok: bool| {
            WebhookEventFilter {
                target_types: strings(tt),
                target_values: strings(tv),
                kind_types: strings(kt),
                kind_names: strings(kn),
                error_only: err,
                success_only: ok,
            }
        };
        vec![
            f(&["app"], &["myapp"], &[], &[], false, false),
            f(&[], &[], &[], &[], true, false),
            f(&[], &[], &[], &[], false, true),
            f(&["app"], &["myapp"], &[], &[], true, false),
            f(&["app"], &["myapp", "otherapp"], &[], &[], false, false),
            f(&[], &[], &["permission"], &["app.deploy", "app.update"], false, false),
            f(&["node"], &[], &[], &["node.create", "healer"], false, false),
            f(&["app"], &["myapp"], &["permission"], &["app.deploy", "app.update"], true, false),
            f(&["app"], &["otherapp"], &[], &[], false, false),
            f(&[], &[], &["permission"], &["app.update"], false, false),
            WebhookEventFilter::default(),
        ]
    }

    fn matching(evt: &Event) -> Vec<usize> {
        filters()
            .iter()
            .enumerate()
            .filter(|(_, f)| filter_matches(f, evt))
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn filters_select_events() {
        let deploy = Kind::permission("app.deploy");
        let failed = event(Target::new(TargetType::App, "myapp"), deploy.clone(), "boom");
        assert_eq!(matching(&failed), vec![0, 1, 3, 4, 5, 7, 10]);

        let ok = event(Target::new(TargetType::App, "myapp"), deploy.clone(), "");
        assert_eq!(matching(&ok), vec![0, 2, 4, 5, 10]);

        let other = event(Target::new(TargetType::App, "otherapp"), deploy, "");
        assert_eq!(matching(&other), vec![2, 4, 5, 8, 10]);
    }

    #[test]
    fn extra_targets_widen_matching() {
        let mut evt = event(
            Target::new(TargetType::Pool, "pool1"),
            Kind::internal("healer"),
            "",
        );
        assert_eq!(matching(&evt), vec![2, 10]);
        evt.extra_targets.push(ExtraTarget {
            target: Target::new(TargetType::App, "myapp"),
            lock: false,
        });
        assert_eq!(matching(&evt), vec![0, 2, 4, 10]);
    }

    #[tokio::test]
    async fn notify_drops_when_full_or_stopped() {
        let dispatcher = WebhookDispatcher::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryJournal::new()),
            1,
        )
        .unwrap();
        let notifier = dispatcher.notifier();
        notifier.notify(uuid::Uuid::new_v4());
        notifier.notify(uuid::Uuid::new_v4());
        let stats = dispatcher.stats();
        assert_eq!((stats.queued, stats.dropped, stats.queue_len), (1, 1, 1));

        dispatcher
            .shutdown(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        notifier.notify(uuid::Uuid::new_v4());
        assert_eq!(dispatcher.stats().dropped, 2);
    }
}
