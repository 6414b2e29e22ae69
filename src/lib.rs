pub mod algorithms;
#[cfg(feature = "api")]
pub mod api;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod invariants;
pub mod memory;
pub mod models;
pub mod operations;
pub mod store;

pub mod prelude {
    pub use crate::algorithms::{SubtreeNode, SubtreeWalk, build_subtree};
    #[cfg(feature = "api")]
    pub use crate::api::{AppError, HasRoleService};
    pub use crate::config::{RoleTreeConfig, RootPolicy};
    #[cfg(feature = "sqlx")]
    pub use crate::config::DatabaseConfig;
    #[cfg(feature = "sqlx")]
    pub use crate::db::{PgRoleStore, create_role_tables};
    pub use crate::error::{ErrorKind, LibError, Result};
    pub use crate::invariants::role_invariant_violations;
    pub use crate::memory::MemoryRoleStore;
    pub use crate::models::{
        CreateRolePayload, ListRolesQuery, Paged, RemovedRole, Role, RoleId,
        RoleInvariantViolation, RoleTree, UpdateRolePayload,
    };
    pub use crate::operations::{RoleOperation, RoleOperationResult, RoleService};
    pub use crate::store::{RoleStore, RoleStoreTx};
}
