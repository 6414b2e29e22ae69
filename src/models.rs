use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{LibError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub Uuid);

impl RoleId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RoleId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

impl From<Uuid> for RoleId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub description: String,
    pub parent_id: Option<RoleId>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Role {
    pub const fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A validated role ready to be inserted. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRole {
    pub name: String,
    pub description: String,
    pub parent_id: Option<RoleId>,
}

/// Field delta for a partial update. `parent_id: Some(None)` detaches the
/// role into a root; `None` leaves the parent untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub parent_id: Option<Option<RoleId>>,
}

impl RoleChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.parent_id.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRolePayload {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent_id: Option<RoleId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRolePayload {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub parent_id: Option<Option<RoleId>>,
}

// Distinguishes an explicit `null` from a missing field.
fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl CreateRolePayload {
    pub fn normalize(self) -> Result<NewRole> {
        Ok(NewRole {
            name: normalize_name(self.name)?,
            description: self.description.unwrap_or_default(),
            parent_id: self.parent_id,
        })
    }
}

impl UpdateRolePayload {
    pub fn normalize(self) -> Result<RoleChanges> {
        let name = self.name.map(normalize_name).transpose()?;
        Ok(RoleChanges {
            name,
            description: self.description,
            parent_id: self.parent_id,
        })
    }
}

fn normalize_name(name: String) -> Result<String> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(LibError::invalid(
            "Role name is required",
            anyhow!("empty role name"),
        ));
    }
    Ok(name)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRolesQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl ListRolesQuery {
    pub fn pagination(&self) -> (u32, u32) {
        let page = self.page.unwrap_or(1).max(1);
        let limit = self.limit.unwrap_or(25).clamp(1, 200);
        (page, limit)
    }

    pub fn offset(&self) -> u64 {
        let (page, limit) = self.pagination();
        u64::from(page - 1) * u64::from(limit)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Paged<T> {
    pub page: u32,
    pub limit: u32,
    pub items: Vec<T>,
}

/// Nested view of a subtree: each role name maps to the view of its children.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RoleTree(pub BTreeMap<String, RoleTree>);

impl RoleTree {
    pub fn get(&self, name: &str) -> Option<&RoleTree> {
        self.0.get(name)
    }

    pub fn is_leaf(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedRole {
    pub role: Role,
    pub reattached: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoleInvariantViolation {
    UnknownParent {
        role_id: RoleId,
        missing_parent_id: RoleId,
    },
    SelfParent {
        role_id: RoleId,
    },
    DuplicateName {
        name: String,
        role_ids: Vec<RoleId>,
    },
    CycleDetected {
        role_ids: Vec<RoleId>,
    },
    EmptyName {
        role_id: RoleId,
    },
}

impl RoleInvariantViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            RoleInvariantViolation::UnknownParent { .. } => "role_unknown_parent",
            RoleInvariantViolation::SelfParent { .. } => "role_self_parent",
            RoleInvariantViolation::DuplicateName { .. } => "role_duplicate_name",
            RoleInvariantViolation::CycleDetected { .. } => "role_cycle",
            RoleInvariantViolation::EmptyName { .. } => "role_empty_name",
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            RoleInvariantViolation::UnknownParent { .. } => {
                "Role references a parent that does not exist"
            }
            RoleInvariantViolation::SelfParent { .. } => "Role is its own parent",
            RoleInvariantViolation::DuplicateName { .. } => "Role names must be unique",
            RoleInvariantViolation::CycleDetected { .. } => "Role hierarchy contains a cycle",
            RoleInvariantViolation::EmptyName { .. } => "Role name is empty",
        }
    }
}
