//! tsuru-core - PaaS control-plane core
//!
//! Binds applications to external service instances, keeps bindings in sync
//! with running units, fans finished events out to webhooks, and answers
//! permission questions against the scheme tree.
//!
//! ## Components
//! - [`service`]: endpoint and broker clients, instance lifecycle, bind
//!   pipelines and the [`service::BindSyncer`]
//! - [`webhook`]: webhook CRUD and the [`webhook::WebhookDispatcher`]
//! - [`permission`]: scheme registry and role store
//! - [`scopedconfig`]: base and per-pool configuration entries
//! - [`services`]: wiring of all of the above

// Core error handling
pub mod error;

// Ambient
pub mod config;
pub mod logging;
pub mod shutdown;

// Building blocks
pub mod action;
pub mod bind;
pub mod event;
pub mod limiter;
pub mod storage;

// Components
pub mod permission;
pub mod scopedconfig;
pub mod service;
pub mod webhook;

pub mod services;

pub use error::{Result, TsuruError};
pub use services::Services;
