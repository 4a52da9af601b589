//! Persisted collections: `services`, `service_instances`, `roles`,
//! `webhooks`, `scoped_configs` and brokers.

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::{
    BrokerStorage, InstanceStorage, RoleAssignments, RoleStorage, ScopedConfigStorage,
    ServiceStorage, WebhookStorage,
};
