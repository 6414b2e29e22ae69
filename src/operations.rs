use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::algorithms;
use crate::config::RoleTreeConfig;
use crate::error::{ErrorKind, LibError, Result};
use crate::invariants::{self, RootChange};
use crate::models::{
    CreateRolePayload, ListRolesQuery, NewRole, Paged, RemovedRole, Role, RoleChanges, RoleId,
    RoleInvariantViolation, RoleTree, UpdateRolePayload,
};
use crate::store::{RoleStore, RoleStoreTx};

/// Serializable request for one role operation, for callers that route
/// requests by name rather than by method.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum RoleOperation {
    Create {
        payload: CreateRolePayload,
    },
    Get {
        role_id: RoleId,
    },
    List {
        #[serde(default)]
        query: ListRolesQuery,
    },
    ReadSubtree {
        role_id: RoleId,
    },
    ListChildren {
        role_id: RoleId,
    },
    Update {
        role_id: RoleId,
        payload: UpdateRolePayload,
    },
    Remove {
        role_id: RoleId,
    },
    Audit,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RoleOperationResult {
    Role {
        role: Role,
    },
    RolesPage {
        page: u32,
        limit: u32,
        items: Vec<Role>,
    },
    Children {
        items: Vec<Role>,
    },
    Tree {
        tree: RoleTree,
    },
    Removed {
        removed: RemovedRole,
    },
    Audit {
        violations: Vec<RoleInvariantViolation>,
    },
}

/// Create, update and remove roles without ever breaking the hierarchy.
///
/// Each call runs its checks and its writes in one store transaction and is
/// bounded by [`RoleTreeConfig::store_timeout`]. A failed check leaves the
/// store untouched.
pub struct RoleService<S> {
    store: Arc<S>,
    config: RoleTreeConfig,
}

impl<S> Clone for RoleService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl<S: RoleStore> RoleService<S> {
    pub fn new(store: S, config: RoleTreeConfig) -> Self {
        Self {
            store: Arc::new(store),
            config,
        }
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &RoleTreeConfig {
        &self.config
    }

    pub async fn execute(&self, operation: RoleOperation) -> Result<RoleOperationResult> {
        match operation {
            RoleOperation::Create { payload } => {
                let role = self.create(payload).await?;
                Ok(RoleOperationResult::Role { role })
            }
            RoleOperation::Get { role_id } => {
                let role = self.get(role_id).await?;
                Ok(RoleOperationResult::Role { role })
            }
            RoleOperation::List { query } => {
                let page = self.list_roles(query).await?;
                Ok(RoleOperationResult::RolesPage {
                    page: page.page,
                    limit: page.limit,
                    items: page.items,
                })
            }
            RoleOperation::ReadSubtree { role_id } => {
                let tree = self.read_subtree(role_id).await?;
                Ok(RoleOperationResult::Tree { tree })
            }
            RoleOperation::ListChildren { role_id } => {
                let items = self.list_children(role_id).await?;
                Ok(RoleOperationResult::Children { items })
            }
            RoleOperation::Update { role_id, payload } => {
                let role = self.update(role_id, payload).await?;
                Ok(RoleOperationResult::Role { role })
            }
            RoleOperation::Remove { role_id } => {
                let removed = self.remove(role_id).await?;
                Ok(RoleOperationResult::Removed { removed })
            }
            RoleOperation::Audit => {
                let violations = self.audit().await?;
                Ok(RoleOperationResult::Audit { violations })
            }
        }
    }

    pub async fn create(&self, payload: CreateRolePayload) -> Result<Role> {
        let new_role = payload.normalize()?;
        let role = self
            .bounded(self.create_in_tx(new_role))
            .await
            .inspect_err(log_rejection("create"))?;

        tracing::info!(role_id = %role.id, name = %role.name, parent_id = ?role.parent_id, "role created");
        Ok(role)
    }

    pub async fn get(&self, id: RoleId) -> Result<Role> {
        self.bounded(self.get_in_tx(id)).await
    }

    pub async fn list_roles(&self, query: ListRolesQuery) -> Result<Paged<Role>> {
        let (page, limit) = query.pagination();
        let items = self.bounded(self.page_in_tx(query.offset(), limit)).await?;
        Ok(Paged { page, limit, items })
    }

    pub async fn read_subtree(&self, id: RoleId) -> Result<RoleTree> {
        self.bounded(self.subtree_in_tx(id)).await
    }

    pub async fn list_children(&self, id: RoleId) -> Result<Vec<Role>> {
        self.bounded(self.children_in_tx(id)).await
    }

    pub async fn update(&self, id: RoleId, payload: UpdateRolePayload) -> Result<Role> {
        let changes = payload.normalize()?;
        let role = self
            .bounded(self.update_in_tx(id, changes))
            .await
            .inspect_err(log_rejection("update"))?;

        tracing::info!(role_id = %role.id, name = %role.name, parent_id = ?role.parent_id, "role updated");
        Ok(role)
    }

    /// Deletes a role and splices its children up to the role's former
    /// parent, or makes them roots if the role was a root.
    pub async fn remove(&self, id: RoleId) -> Result<RemovedRole> {
        let removed = self
            .bounded(self.remove_in_tx(id))
            .await
            .inspect_err(log_rejection("remove"))?;

        tracing::info!(
            role_id = %removed.role.id,
            new_parent_id = ?removed.role.parent_id,
            reattached = removed.reattached,
            "role removed"
        );
        Ok(removed)
    }

    /// Scans the whole table for integrity violations. An empty result means
    /// every invariant holds.
    pub async fn audit(&self) -> Result<Vec<RoleInvariantViolation>> {
        let violations = self.bounded(self.audit_in_tx()).await?;
        if !violations.is_empty() {
            tracing::warn!(count = violations.len(), "role hierarchy audit found violations");
        }
        Ok(violations)
    }

    async fn create_in_tx(&self, new_role: NewRole) -> Result<Role> {
        let mut tx = self.store.begin().await?;
        invariants::check_parent_exists(&mut tx, new_role.parent_id).await?;
        invariants::check_name_unique(&mut tx, &new_role.name, None).await?;
        invariants::check_root_policy(
            &mut tx,
            self.config.root_policy,
            RootChange::Create {
                parent_id: new_role.parent_id,
            },
        )
        .await?;
        let role = tx.insert(new_role).await?;
        tx.commit().await?;
        Ok(role)
    }

    async fn get_in_tx(&self, id: RoleId) -> Result<Role> {
        let mut tx = self.store.begin().await?;
        load_role(&mut tx, id).await
    }

    async fn page_in_tx(&self, offset: u64, limit: u32) -> Result<Vec<Role>> {
        let mut tx = self.store.begin().await?;
        tx.list_page(offset, limit).await
    }

    async fn subtree_in_tx(&self, id: RoleId) -> Result<RoleTree> {
        let mut tx = self.store.begin().await?;
        algorithms::build_subtree(&mut tx, id).await
    }

    async fn children_in_tx(&self, id: RoleId) -> Result<Vec<Role>> {
        let mut tx = self.store.begin().await?;
        algorithms::list_children(&mut tx, id).await
    }

    async fn update_in_tx(&self, id: RoleId, changes: RoleChanges) -> Result<Role> {
        let mut tx = self.store.begin().await?;
        let current = load_role(&mut tx, id).await?;
        if changes.is_empty() {
            return Ok(current);
        }

        if let Some(parent_id) = changes.parent_id {
            if parent_id.is_some() {
                invariants::check_no_self_reference(id, parent_id)?;
                invariants::check_parent_exists(&mut tx, parent_id).await?;
                invariants::check_acyclic(&mut tx, id, parent_id).await?;
            }
            invariants::check_root_policy(
                &mut tx,
                self.config.root_policy,
                RootChange::Reparent {
                    role: id,
                    was_root: current.is_root(),
                    parent_id,
                },
            )
            .await?;
        }
        if let Some(name) = &changes.name {
            invariants::check_name_unique(&mut tx, name, Some(id)).await?;
        }

        let role = tx.update_partial(id, changes).await?;
        tx.commit().await?;
        Ok(role)
    }

    async fn remove_in_tx(&self, id: RoleId) -> Result<RemovedRole> {
        let mut tx = self.store.begin().await?;
        let role = load_role(&mut tx, id).await?;
        invariants::check_root_policy(
            &mut tx,
            self.config.root_policy,
            RootChange::Remove {
                role: id,
                was_root: role.is_root(),
            },
        )
        .await?;

        let reattached = tx.reparent_all(id, role.parent_id).await?;
        tx.delete(id).await?;
        tx.commit().await?;
        Ok(RemovedRole { role, reattached })
    }

    async fn audit_in_tx(&self) -> Result<Vec<RoleInvariantViolation>> {
        let mut tx = self.store.begin().await?;
        let roles = tx.list_all().await?;
        Ok(invariants::role_invariant_violations(&roles))
    }

    async fn bounded<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.store_timeout, work)
            .await
            .map_err(LibError::timed_out)?
    }
}

async fn load_role<T: RoleStoreTx>(tx: &mut T, id: RoleId) -> Result<Role> {
    tx.get(id)
        .await?
        .ok_or_else(|| LibError::role_not_found("Role not found", anyhow!("role {} not found", id)))
}

fn log_rejection(operation: &'static str) -> impl Fn(&LibError) {
    move |err| match err.kind {
        ErrorKind::StoreUnavailable | ErrorKind::Database => {
            tracing::error!(operation, code = err.code, error = %err.source, "role store failure");
        }
        _ => {
            tracing::debug!(operation, code = err.code, error = %err.source, "role mutation rejected");
        }
    }
}
