//! Outgoing webhooks for finished events.

pub mod dispatcher;
pub mod service;
pub mod template;

pub use dispatcher::{filter_matches, DispatcherStats, WebhookDispatcher, WebhookNotifier};
pub use service::WebhookService;
