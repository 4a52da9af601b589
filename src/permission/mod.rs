//! Hierarchical permissions and roles.

pub mod permitems;
pub mod registry;
pub mod role;
pub mod scheme;
pub mod token;

pub use permitems::standard_registry;
pub use registry::PermissionRegistry;
pub use role::RoleStore;
pub use scheme::{identifier_for, PermissionScheme, SchemeId, ROOT};
pub use token::{Permission, SimpleToken, Token};
