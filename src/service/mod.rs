//! Services, their instances and the clients that reach them.
//!
//! Endpoint-backed services speak the legacy `/resources` protocol through
//! [`endpoint::EndpointClient`]; `broker::service` names go through an Open
//! Service Broker via [`broker::BrokerClient`]. [`client::ClientFactory`]
//! picks one per service name.

pub mod actions;
pub mod broker;
pub mod catalog;
pub mod client;
pub mod endpoint;
pub mod instance;
pub mod proxy;
pub mod store;
pub mod sync;

pub use catalog::CatalogCache;
pub use client::{CallMeta, ClientFactory, ServiceClient};
pub use instance::{validate_name, BindOpts, InstanceService, InstanceUpdate};
pub use store::ServiceStore;
pub use sync::{AppLister, BindSyncer, StaticAppLister, SyncStats};
