//! tsuru-types - Level 1 Foundation Types
//!
//! Plain records shared by every module of `tsuru-core`: the permission
//! context vocabulary, event journal records, webhook definitions, bind
//! records and the persisted documents for services, instances, roles and
//! scoped configs.
//!
//! ## Architecture Level: LEVEL 1 (Foundation)
//!
//! Nothing in this crate performs I/O or owns a lock. Types serialize with
//! the field names used by the persisted collections (`services`,
//! `service_instances`, `roles`, `webhooks`, `scoped_configs`, `events`).
//!
//! ## Critical Rules
//!
//! 1. **NO BUSINESS LOGIC** - constructors, accessors and parsing only
//! 2. **NO WORKSPACE DEPENDENCIES**
//! 3. **SERIALIZABLE** - every record round-trips through serde
//! 4. **THREAD SAFE** - every type is `Send + Sync`

pub mod bind;
pub mod broker;
pub mod event;
pub mod permission;
pub mod role;
pub mod scoped;
pub mod service;
pub mod webhook;

pub use bind::{BoundUnit, EnvVar, ServiceEnvVar, ServiceInstanceEnvs, Unit};
pub use broker::{
    AuthConfig, BasicAuthConfig, BearerConfig, Broker, BrokerCatalog, BrokerConfig, BrokerPlan,
    BrokerService,
};
pub use event::{Event, EventId, ExtraTarget, Kind, KindType, Owner, OwnerType, Target, TargetType};
pub use permission::{ContextType, ParseContextTypeError, PermissionContext};
pub use role::{Role, RoleEvent};
pub use scoped::{Entry, PoolEntry, ScopedConfigDocument};
pub use service::{
    BindAppParameters, BrokerInstanceBind, BrokerInstanceData, Plan, Service, ServiceInstance,
};
pub use webhook::{Webhook, WebhookEventFilter};
