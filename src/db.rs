use std::sync::Arc;

use anyhow::anyhow;
use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{ErrorKind, LibError, Result};
use crate::models::{NewRole, Role, RoleChanges, RoleId};
use crate::store::{RoleStore, RoleStoreTx};

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_role_tables(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[derive(Debug, Clone, FromRow)]
struct RoleRow {
    id: Uuid,
    name: String,
    description: String,
    parent_id: Option<Uuid>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

impl From<RoleRow> for Role {
    fn from(value: RoleRow) -> Self {
        Self {
            id: RoleId(value.id),
            name: value.name,
            description: value.description,
            parent_id: value.parent_id.map(RoleId),
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

/// Maps driver failures onto the error kinds callers act on. Constraint
/// violations keep their integrity meaning; serialization conflicts and
/// connection trouble are transient.
pub(crate) fn classify_sqlx_error(public: &'static str, err: sqlx::Error) -> LibError {
    let code = err
        .as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned());
    let constraint = err
        .as_database_error()
        .and_then(|db| db.constraint())
        .map(str::to_owned);
    let transient = matches!(
        err,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
    );

    match code.as_deref() {
        Some("23505") => {
            LibError::duplicate_name("A role with this name already exists", anyhow!(err))
        }
        Some("23503") => LibError::parent_not_found("Parent role not found", anyhow!(err)),
        Some("23514") if constraint.as_deref() == Some("roles_no_self_parent") => {
            LibError::self_reference("A role cannot be its own parent", anyhow!(err))
        }
        Some("23514") => LibError::invalid("Role name is required", anyhow!(err)),
        Some("40001") | Some("40P01") => LibError::unavailable(
            "Concurrent update conflict, retry the request",
            anyhow!(err),
        ),
        None if transient => LibError::unavailable("Role store is unavailable", anyhow!(err)),
        _ => LibError::database(public, anyhow!(err)),
    }
}

fn db_err(public: &'static str) -> impl Fn(sqlx::Error) -> LibError {
    move |err| classify_sqlx_error(public, err)
}

// `IS NOT DISTINCT FROM` cannot use `roles_parent_id_idx`.
fn children_query(parent_id: Option<RoleId>) -> &'static str {
    match parent_id {
        Some(_) => {
            r#"
            SELECT id, name, description, parent_id, created_at, updated_at
            FROM role_tree.roles
            WHERE parent_id = $1
            ORDER BY name ASC, id ASC
            "#
        }
        None => {
            r#"
            SELECT id, name, description, parent_id, created_at, updated_at
            FROM role_tree.roles
            WHERE parent_id IS NULL
            ORDER BY name ASC, id ASC
            "#
        }
    }
}

// On delete, a foreign key failure means the row is still referenced.
fn delete_err(err: sqlx::Error) -> LibError {
    let err = classify_sqlx_error("Failed to delete role", err);
    match err.kind {
        ErrorKind::ParentNotFound => LibError::database("Role still has children", err.source),
        _ => err,
    }
}

/// [`RoleStore`] backed by the `role_tree.roles` table.
///
/// Every transaction runs at `SERIALIZABLE`, so two writers that both pass
/// their checks cannot both commit a conflicting change; the loser gets a
/// retryable `StoreUnavailable`.
#[derive(Debug, Clone)]
pub struct PgRoleStore {
    pool: Arc<PgPool>,
}

impl PgRoleStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(db_err("Failed to connect to role store"))?;
        Ok(Self::new(Arc::new(pool)))
    }

    pub fn pool(&self) -> Arc<PgPool> {
        Arc::clone(&self.pool)
    }
}

impl RoleStore for PgRoleStore {
    type Tx = PgRoleTx;

    async fn begin(&self) -> Result<PgRoleTx> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("Failed to start transaction"))?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to set transaction isolation"))?;

        Ok(PgRoleTx { tx })
    }
}

pub struct PgRoleTx {
    tx: Transaction<'static, Postgres>,
}

impl RoleStoreTx for PgRoleTx {
    async fn get(&mut self, id: RoleId) -> Result<Option<Role>> {
        let row = sqlx::query_as::<_, RoleRow>(
            r#"
            SELECT id, name, description, parent_id, created_at, updated_at
            FROM role_tree.roles
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("Failed to query role"))?;

        Ok(row.map(Role::from))
    }

    async fn get_by_name(&mut self, name: &str) -> Result<Option<Role>> {
        let row = sqlx::query_as::<_, RoleRow>(
            r#"
            SELECT id, name, description, parent_id, created_at, updated_at
            FROM role_tree.roles
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("Failed to query role by name"))?;

        Ok(row.map(Role::from))
    }

    async fn list_children(&mut self, parent_id: Option<RoleId>) -> Result<Vec<Role>> {
        let query = sqlx::query_as::<_, RoleRow>(children_query(parent_id));
        let query = match parent_id {
            Some(parent_id) => query.bind(parent_id.0),
            None => query,
        };
        let rows = query
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_err("Failed to query child roles"))?;

        Ok(rows.into_iter().map(Role::from).collect())
    }

    async fn count(&mut self) -> Result<u64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)::bigint
            FROM role_tree.roles
            "#,
        )
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("Failed to count roles"))?;

        Ok(u64::try_from(count.0).unwrap_or_default())
    }

    async fn list_page(&mut self, offset: u64, limit: u32) -> Result<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>(
            r#"
            SELECT id, name, description, parent_id, created_at, updated_at
            FROM role_tree.roles
            ORDER BY name ASC, id ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::from(limit))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err("Failed to list roles"))?;

        Ok(rows.into_iter().map(Role::from).collect())
    }

    async fn list_all(&mut self) -> Result<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>(
            r#"
            SELECT id, name, description, parent_id, created_at, updated_at
            FROM role_tree.roles
            ORDER BY name ASC, id ASC
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err("Failed to list roles"))?;

        Ok(rows.into_iter().map(Role::from).collect())
    }

    async fn insert(&mut self, role: NewRole) -> Result<Role> {
        let row = sqlx::query_as::<_, RoleRow>(
            r#"
            INSERT INTO role_tree.roles (id, name, description, parent_id)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, description, parent_id, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.parent_id.map(|id| id.0))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("Failed to create role"))?;

        Ok(row.into())
    }

    async fn update_partial(&mut self, id: RoleId, changes: RoleChanges) -> Result<Role> {
        let row = sqlx::query_as::<_, RoleRow>(
            r#"
            UPDATE role_tree.roles
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                parent_id = CASE WHEN $4 THEN $5 ELSE parent_id END,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $1
            RETURNING id, name, description, parent_id, created_at, updated_at
            "#,
        )
        .bind(id.0)
        .bind(changes.name)
        .bind(changes.description)
        .bind(changes.parent_id.is_some())
        .bind(changes.parent_id.flatten().map(|id| id.0))
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("Failed to update role"))?;

        row.map(Role::from).ok_or_else(|| {
            LibError::role_not_found("Role not found", anyhow!("role {} not found for update", id))
        })
    }

    async fn reparent_all(
        &mut self,
        old_parent_id: RoleId,
        new_parent_id: Option<RoleId>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE role_tree.roles
            SET parent_id = $2,
                updated_at = CURRENT_TIMESTAMP
            WHERE parent_id = $1
            "#,
        )
        .bind(old_parent_id.0)
        .bind(new_parent_id.map(|id| id.0))
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("Failed to reattach child roles"))?;

        Ok(result.rows_affected())
    }

    async fn delete(&mut self, id: RoleId) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM role_tree.roles
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .execute(&mut *self.tx)
        .await
        .map_err(delete_err)?;

        if result.rows_affected() == 0 {
            return Err(LibError::role_not_found(
                "Role not found",
                anyhow!("role {} not found for delete", id),
            ));
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(db_err("Failed to commit transaction"))
    }
}
