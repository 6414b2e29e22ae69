use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{LibError, Result};
use crate::models::{NewRole, Role, RoleChanges, RoleId};
use crate::store::{RoleStore, RoleStoreTx};

type RoleTable = BTreeMap<RoleId, Role>;

/// In-process [`RoleStore`].
///
/// A transaction holds the table lock for its whole lifetime and writes to a
/// private copy, so transactions are serialized and an uncommitted one leaves
/// no trace. The table enforces the same constraints as the Postgres schema:
/// unique names, existing parents and no self parents.
#[derive(Debug, Clone, Default)]
pub struct MemoryRoleStore {
    roles: Arc<Mutex<RoleTable>>,
}

impl MemoryRoleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the table with raw rows, skipping every constraint. Used to
    /// reproduce stores that were corrupted outside this crate.
    pub fn from_rows(rows: impl IntoIterator<Item = Role>) -> Self {
        let roles = rows.into_iter().map(|role| (role.id, role)).collect();
        Self {
            roles: Arc::new(Mutex::new(roles)),
        }
    }

    pub async fn len(&self) -> usize {
        self.roles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.roles.lock().await.is_empty()
    }
}

impl RoleStore for MemoryRoleStore {
    type Tx = MemoryRoleTx;

    async fn begin(&self) -> Result<MemoryRoleTx> {
        let guard = Arc::clone(&self.roles).lock_owned().await;
        let working = guard.clone();
        Ok(MemoryRoleTx { guard, working })
    }
}

pub struct MemoryRoleTx {
    guard: OwnedMutexGuard<RoleTable>,
    working: RoleTable,
}

impl MemoryRoleTx {
    fn ensure_name_free(&self, name: &str, excluding: Option<RoleId>) -> Result<()> {
        let taken = self
            .working
            .values()
            .any(|role| role.name == name && Some(role.id) != excluding);
        if taken {
            return Err(LibError::duplicate_name(
                "A role with this name already exists",
                anyhow!("unique constraint on name violated by '{}'", name),
            ));
        }
        Ok(())
    }

    fn ensure_parent_row(&self, parent_id: Option<RoleId>) -> Result<()> {
        match parent_id {
            Some(parent_id) if !self.working.contains_key(&parent_id) => {
                Err(LibError::parent_not_found(
                    "Parent role not found",
                    anyhow!("foreign key on parent_id violated by {}", parent_id),
                ))
            }
            _ => Ok(()),
        }
    }
}

fn sorted_by_name(mut roles: Vec<Role>) -> Vec<Role> {
    roles.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    roles
}

impl RoleStoreTx for MemoryRoleTx {
    async fn get(&mut self, id: RoleId) -> Result<Option<Role>> {
        Ok(self.working.get(&id).cloned())
    }

    async fn get_by_name(&mut self, name: &str) -> Result<Option<Role>> {
        Ok(self.working.values().find(|role| role.name == name).cloned())
    }

    async fn list_children(&mut self, parent_id: Option<RoleId>) -> Result<Vec<Role>> {
        let children = self
            .working
            .values()
            .filter(|role| role.parent_id == parent_id)
            .cloned()
            .collect();
        Ok(sorted_by_name(children))
    }

    async fn count(&mut self) -> Result<u64> {
        Ok(self.working.len() as u64)
    }

    async fn list_page(&mut self, offset: u64, limit: u32) -> Result<Vec<Role>> {
        let all = sorted_by_name(self.working.values().cloned().collect());
        Ok(all
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit as usize)
            .collect())
    }

    async fn list_all(&mut self) -> Result<Vec<Role>> {
        Ok(sorted_by_name(self.working.values().cloned().collect()))
    }

    async fn insert(&mut self, role: NewRole) -> Result<Role> {
        self.ensure_name_free(&role.name, None)?;
        self.ensure_parent_row(role.parent_id)?;

        let now = Utc::now().naive_utc();
        let role = Role {
            id: RoleId::new_v4(),
            name: role.name,
            description: role.description,
            parent_id: role.parent_id,
            created_at: now,
            updated_at: now,
        };
        self.working.insert(role.id, role.clone());
        Ok(role)
    }

    async fn update_partial(&mut self, id: RoleId, changes: RoleChanges) -> Result<Role> {
        if !self.working.contains_key(&id) {
            return Err(LibError::role_not_found(
                "Role not found",
                anyhow!("role {} not found for update", id),
            ));
        }
        if let Some(name) = &changes.name {
            self.ensure_name_free(name, Some(id))?;
        }
        if let Some(parent_id) = changes.parent_id {
            if parent_id == Some(id) {
                return Err(LibError::self_reference(
                    "A role cannot be its own parent",
                    anyhow!("check constraint on parent_id violated by {}", id),
                ));
            }
            self.ensure_parent_row(parent_id)?;
        }

        let role = self
            .working
            .get_mut(&id)
            .ok_or_else(|| LibError::role_not_found("Role not found", anyhow!("role {}", id)))?;
        if let Some(name) = changes.name {
            role.name = name;
        }
        if let Some(description) = changes.description {
            role.description = description;
        }
        if let Some(parent_id) = changes.parent_id {
            role.parent_id = parent_id;
        }
        role.updated_at = Utc::now().naive_utc();
        Ok(role.clone())
    }

    async fn reparent_all(
        &mut self,
        old_parent_id: RoleId,
        new_parent_id: Option<RoleId>,
    ) -> Result<u64> {
        self.ensure_parent_row(new_parent_id)?;
        let now = Utc::now().naive_utc();
        let mut moved = 0u64;
        for role in self.working.values_mut() {
            if role.parent_id == Some(old_parent_id) {
                role.parent_id = new_parent_id;
                role.updated_at = now;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn delete(&mut self, id: RoleId) -> Result<()> {
        if self.working.values().any(|role| role.parent_id == Some(id)) {
            return Err(LibError::database(
                "Role still has children",
                anyhow!("foreign key on parent_id still references {}", id),
            ));
        }
        match self.working.remove(&id) {
            Some(_) => Ok(()),
            None => Err(LibError::role_not_found(
                "Role not found",
                anyhow!("role {} not found for delete", id),
            )),
        }
    }

    async fn commit(mut self) -> Result<()> {
        *self.guard = std::mem::take(&mut self.working);
        Ok(())
    }
}
