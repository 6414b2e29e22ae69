use std::future::Future;

use crate::error::Result;
use crate::models::{NewRole, Role, RoleChanges, RoleId};

/// A durable table of roles keyed by [`RoleId`].
///
/// Every read and write goes through a [`RoleStoreTx`]. Checks and the write
/// they guard share one transaction, so a concurrent writer cannot slip a
/// conflicting change between them.
pub trait RoleStore: Send + Sync {
    type Tx: RoleStoreTx;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;
}

/// One unit of work against a [`RoleStore`].
///
/// Dropping a transaction without calling [`RoleStoreTx::commit`] discards
/// every write made through it.
pub trait RoleStoreTx: Send + Sized {
    fn get(&mut self, id: RoleId) -> impl Future<Output = Result<Option<Role>>> + Send;

    fn get_by_name(&mut self, name: &str) -> impl Future<Output = Result<Option<Role>>> + Send;

    /// Direct children of `parent_id`; `None` lists the roots.
    fn list_children(
        &mut self,
        parent_id: Option<RoleId>,
    ) -> impl Future<Output = Result<Vec<Role>>> + Send;

    fn count(&mut self) -> impl Future<Output = Result<u64>> + Send;

    /// Roles ordered by name.
    fn list_page(
        &mut self,
        offset: u64,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Role>>> + Send;

    fn list_all(&mut self) -> impl Future<Output = Result<Vec<Role>>> + Send;

    fn insert(&mut self, role: NewRole) -> impl Future<Output = Result<Role>> + Send;

    /// Fails with `RoleNotFound` when `id` is missing.
    fn update_partial(
        &mut self,
        id: RoleId,
        changes: RoleChanges,
    ) -> impl Future<Output = Result<Role>> + Send;

    /// Points every child of `old_parent_id` at `new_parent_id` and returns
    /// how many rows moved.
    fn reparent_all(
        &mut self,
        old_parent_id: RoleId,
        new_parent_id: Option<RoleId>,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Fails with `RoleNotFound` when `id` is missing.
    fn delete(&mut self, id: RoleId) -> impl Future<Output = Result<()>> + Send;

    fn commit(self) -> impl Future<Output = Result<()>> + Send;
}
