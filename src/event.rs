//! Append-only event journal with target locking.
//!
//! The journal itself belongs to the outer platform; the core depends on the
//! [`EventJournal`] contract only. [`MemoryJournal`] backs tests and the
//! daemon.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use tsuru_types::{Event, EventId, ExtraTarget, Kind, Owner, Target};

use crate::error::{Result, TsuruError};

/// Receives the id of every finished event.
pub trait EventNotifier: Send + Sync {
    fn notify(&self, id: EventId);
}

#[derive(Debug, Clone)]
pub struct NewEventOpts {
    pub target: Target,
    pub extra_targets: Vec<ExtraTarget>,
    pub kind: Kind,
    pub owner: Owner,
    pub cancelable: bool,
    pub start_custom_data: Value,
}

impl NewEventOpts {
    pub fn new(target: Target, kind: Kind, owner: Owner) -> Self {
        Self {
            target,
            extra_targets: Vec::new(),
            kind,
            owner,
            cancelable: false,
            start_custom_data: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub target: Option<Target>,
    pub kind_name: Option<String>,
    pub running: Option<bool>,
    /// 0 means unlimited.
    pub limit: usize,
}

impl EventFilter {
    fn matches(&self, evt: &Event) -> bool {
        self.target.as_ref().map_or(true, |t| &evt.target == t)
            && self.kind_name.as_ref().map_or(true, |k| &evt.kind.name == k)
            && self.running.map_or(true, |r| evt.running == r)
    }
}

#[async_trait]
pub trait EventJournal: Send + Sync {
    /// Fails with `EventLocked` while a running event holds the target or one
    /// of the locked extra targets.
    async fn new_event(&self, opts: NewEventOpts) -> Result<Event>;
    /// Marks the event finished and notifies listeners.
    async fn done(&self, id: EventId, error: Option<String>, end_custom_data: Value) -> Result<()>;
    /// Drops the event as if it never happened.
    async fn abort(&self, id: EventId) -> Result<()>;
    async fn get_by_id(&self, id: EventId) -> Result<Event>;
    /// Newest first.
    async fn list(&self, filter: &EventFilter) -> Result<Vec<Event>>;
}

/// Finished events kept by [`MemoryJournal::new`].
pub const DEFAULT_EVENT_RETENTION: usize = 10_000;

pub struct MemoryJournal {
    events: RwLock<Vec<Event>>,
    notifier: RwLock<Option<Arc<dyn EventNotifier>>>,
    retention: usize,
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_EVENT_RETENTION)
    }

    /// Keeps at most `retention` finished events, evicting the oldest.
    /// Running events are never evicted. At least one finished event is
    /// kept so listeners can still load the one just notified.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            notifier: RwLock::new(None),
            retention: retention.max(1),
        }
    }

    fn prune(events: &mut Vec<Event>, retention: usize) {
        let finished = events.iter().filter(|e| !e.running).count();
        let mut excess = finished.saturating_sub(retention);
        if excess == 0 {
            return;
        }
        events.retain(|e| {
            if excess > 0 && !e.running {
                excess -= 1;
                return false;
            }
            true
        });
    }

    pub fn set_notifier(&self, notifier: Arc<dyn EventNotifier>) {
        let mut slot = self.notifier.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(notifier);
    }

    /// Inserts a fully formed record. Used to seed events in tests.
    pub fn insert(&self, event: Event) {
        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        events.push(event);
        Self::prune(&mut events, self.retention);
    }

    fn locked_targets(opts: &NewEventOpts) -> Vec<&Target> {
        std::iter::once(&opts.target)
            .chain(opts.extra_targets.iter().filter(|t| t.lock).map(|t| &t.target))
            .collect()
    }
}

#[async_trait]
impl EventJournal for MemoryJournal {
    async fn new_event(&self, opts: NewEventOpts) -> Result<Event> {
        let mut events = self
            .events
            .write()
            .map_err(|e| TsuruError::Storage(format!("lock: {e}")))?;
        let wanted = Self::locked_targets(&opts);
        if let Some(holder) = events.iter().find(|evt| {
            evt.running
                && std::iter::once(&evt.target)
                    .chain(evt.extra_targets.iter().filter(|t| t.lock).map(|t| &t.target))
                    .any(|held| wanted.contains(&held))
        }) {
            return Err(TsuruError::EventLocked(format!(
                "{}({}) running {:?} since {}",
                holder.target.target_type,
                holder.target.value,
                holder.kind.name,
                holder.start_time.to_rfc3339()
            )));
        }
        let event = Event {
            unique_id: Uuid::new_v4(),
            target: opts.target,
            extra_targets: opts.extra_targets,
            kind: opts.kind,
            owner: opts.owner,
            start_time: Utc::now(),
            end_time: None,
            error: String::new(),
            running: true,
            cancelable: opts.cancelable,
            start_custom_data: opts.start_custom_data,
            end_custom_data: Value::Null,
            other_custom_data: Value::Null,
        };
        events.push(event.clone());
        Ok(event)
    }

    async fn done(&self, id: EventId, error: Option<String>, end_custom_data: Value) -> Result<()> {
        {
            let mut events = self
                .events
                .write()
                .map_err(|e| TsuruError::Storage(format!("lock: {e}")))?;
            let evt = events
                .iter_mut()
                .find(|e| e.unique_id == id)
                .ok_or(TsuruError::EventNotFound)?;
            evt.running = false;
            evt.end_time = Some(Utc::now());
            evt.error = error.unwrap_or_default();
            evt.end_custom_data = end_custom_data;
            Self::prune(&mut events, self.retention);
        }
        let notifier = self
            .notifier
            .read()
            .map_err(|e| TsuruError::Storage(format!("lock: {e}")))?
            .clone();
        if let Some(notifier) = notifier {
            notifier.notify(id);
        }
        Ok(())
    }

    async fn abort(&self, id: EventId) -> Result<()> {
        let mut events = self
            .events
            .write()
            .map_err(|e| TsuruError::Storage(format!("lock: {e}")))?;
        let before = events.len();
        events.retain(|e| e.unique_id != id);
        if events.len() == before {
            return Err(TsuruError::EventNotFound);
        }
        Ok(())
    }

    async fn get_by_id(&self, id: EventId) -> Result<Event> {
        self.events
            .read()
            .map_err(|e| TsuruError::Storage(format!("lock: {e}")))?
            .iter()
            .find(|e| e.unique_id == id)
            .cloned()
            .ok_or(TsuruError::EventNotFound)
    }

    async fn list(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let events = self
            .events
            .read()
            .map_err(|e| TsuruError::Storage(format!("lock: {e}")))?;
        let matching = events.iter().rev().filter(|e| filter.matches(e)).cloned();
        Ok(if filter.limit > 0 {
            matching.take(filter.limit).collect()
        } else {
            matching.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tsuru_types::TargetType;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<EventId>>);

    impl EventNotifier for Recorder {
        fn notify(&self, id: EventId) {
            self.0.lock().unwrap().push(id);
        }
    }

    fn opts(app: &str) -> NewEventOpts {
        NewEventOpts::new(
            Target::new(TargetType::App, app),
            Kind::internal("bindsyncer"),
            Owner::internal(),
        )
    }

    #[tokio::test]
    async fn running_event_locks_target() {
        let journal = MemoryJournal::new();
        let evt = journal.new_event(opts("myapp")).await.unwrap();
        assert!(matches!(
            journal.new_event(opts("myapp")).await,
            Err(TsuruError::EventLocked(_))
        ));
        journal.new_event(opts("other")).await.unwrap();

        journal.done(evt.unique_id, None, Value::Null).await.unwrap();
        journal.new_event(opts("myapp")).await.unwrap();
    }

    #[tokio::test]
    async fn locked_extra_target_conflicts() {
        let journal = MemoryJournal::new();
        let mut first = opts("a");
        first.extra_targets.push(ExtraTarget {
            target: Target::new(TargetType::App, "b"),
            lock: true,
        });
        journal.new_event(first).await.unwrap();
        assert!(matches!(
            journal.new_event(opts("b")).await,
            Err(TsuruError::EventLocked(_))
        ));
    }

    #[tokio::test]
    async fn done_records_outcome_and_notifies() {
        let journal = MemoryJournal::new();
        let recorder = Arc::new(Recorder::default());
        journal.set_notifier(recorder.clone());

        let evt = journal.new_event(opts("myapp")).await.unwrap();
        journal
            .done(
                evt.unique_id,
                Some("boom".into()),
                serde_json::json!({"binds": {}}),
            )
            .await
            .unwrap();

        let stored = journal.get_by_id(evt.unique_id).await.unwrap();
        assert!(!stored.running);
        assert_eq!(stored.error, "boom");
        assert!(stored.end_time.is_some());
        assert_eq!(*recorder.0.lock().unwrap(), vec![evt.unique_id]);
    }

    #[tokio::test]
    async fn abort_removes_event() {
        let journal = MemoryJournal::new();
        let evt = journal.new_event(opts("myapp")).await.unwrap();
        journal.abort(evt.unique_id).await.unwrap();
        assert!(matches!(
            journal.get_by_id(evt.unique_id).await,
            Err(TsuruError::EventNotFound)
        ));
        assert!(journal.list(&EventFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finished_events_past_retention_are_evicted() {
        let journal = MemoryJournal::with_retention(2);
        let running = journal.new_event(opts("busy")).await.unwrap();
        let mut finished = Vec::new();
        for app in ["a", "b", "c"] {
            let evt = journal.new_event(opts(app)).await.unwrap();
            journal.done(evt.unique_id, None, Value::Null).await.unwrap();
            finished.push(evt.unique_id);
        }

        let kept: Vec<_> = journal
            .list(&EventFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.unique_id)
            .collect();
        assert_eq!(kept, vec![finished[2], finished[1], running.unique_id]);
        assert!(matches!(
            journal.get_by_id(finished[0]).await,
            Err(TsuruError::EventNotFound)
        ));
        assert!(matches!(
            journal.new_event(opts("busy")).await,
            Err(TsuruError::EventLocked(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_newest_first() {
        let journal = MemoryJournal::new();
        let a = journal.new_event(opts("a")).await.unwrap();
        let b = journal.new_event(opts("b")).await.unwrap();
        journal.done(a.unique_id, None, Value::Null).await.unwrap();

        let all = journal.list(&EventFilter::default()).await.unwrap();
        assert_eq!(all[0].unique_id, b.unique_id);

        let running = journal
            .list(&EventFilter {
                running: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].target.value, "b");
    }
}
