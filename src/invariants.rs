use std::collections::{HashMap, HashSet};

use anyhow::anyhow;

use crate::config::RootPolicy;
use crate::error::{LibError, Result};
use crate::models::{Role, RoleId, RoleInvariantViolation};
use crate::store::RoleStoreTx;

pub async fn check_parent_exists<T: RoleStoreTx>(
    tx: &mut T,
    parent_id: Option<RoleId>,
) -> Result<()> {
    let Some(parent_id) = parent_id else {
        return Ok(());
    };
    if tx.get(parent_id).await?.is_none() {
        return Err(LibError::parent_not_found(
            "Parent role not found",
            anyhow!("parent role {} does not exist", parent_id),
        ));
    }
    Ok(())
}

pub async fn check_name_unique<T: RoleStoreTx>(
    tx: &mut T,
    name: &str,
    excluding: Option<RoleId>,
) -> Result<()> {
    match tx.get_by_name(name).await? {
        Some(existing) if Some(existing.id) != excluding => Err(LibError::duplicate_name(
            "A role with this name already exists",
            anyhow!("role name '{}' is taken by {}", name, existing.id),
        )),
        _ => Ok(()),
    }
}

pub fn check_no_self_reference(id: RoleId, parent_id: Option<RoleId>) -> Result<()> {
    if parent_id == Some(id) {
        return Err(LibError::self_reference(
            "A role cannot be its own parent",
            anyhow!("role {} was given itself as parent", id),
        ));
    }
    Ok(())
}

/// Walks the ancestor chain of `proposed_parent_id` and fails if `id` is on
/// it. The walk stops after as many hops as there are roles, which only
/// happens when the stored chain already loops.
pub async fn check_acyclic<T: RoleStoreTx>(
    tx: &mut T,
    id: RoleId,
    proposed_parent_id: Option<RoleId>,
) -> Result<()> {
    let max_hops = tx.count().await?;
    let mut hops = 0u64;
    let mut current = proposed_parent_id;

    while let Some(ancestor_id) = current {
        if ancestor_id == id {
            return Err(LibError::cycle_detected(
                "A role cannot be moved under one of its descendants",
                anyhow!(
                    "role {} is an ancestor of proposed parent {:?}",
                    id,
                    proposed_parent_id
                ),
            ));
        }
        if hops > max_hops {
            tracing::warn!(role_id = %id, hops, "ancestor chain exceeds role count");
            return Err(LibError::cycle_detected(
                "Role hierarchy contains a cycle",
                anyhow!(
                    "ancestor chain from {:?} exceeded {} hops",
                    proposed_parent_id,
                    max_hops
                ),
            ));
        }
        current = tx.get(ancestor_id).await?.and_then(|role| role.parent_id);
        hops += 1;
    }

    Ok(())
}

/// Proposed write that may change how many roots the forest has.
#[derive(Debug, Clone, Copy)]
pub enum RootChange {
    Create {
        parent_id: Option<RoleId>,
    },
    Reparent {
        role: RoleId,
        was_root: bool,
        parent_id: Option<RoleId>,
    },
    Remove {
        role: RoleId,
        was_root: bool,
    },
}

pub async fn check_root_policy<T: RoleStoreTx>(
    tx: &mut T,
    policy: RootPolicy,
    change: RootChange,
) -> Result<()> {
    if policy == RootPolicy::Forest {
        return Ok(());
    }

    match change {
        RootChange::Create { parent_id: None } => {
            if !tx.list_children(None).await?.is_empty() {
                return Err(LibError::root_policy(
                    "Only one root role is allowed",
                    anyhow!("creating a second root under single-root policy"),
                ));
            }
        }
        RootChange::Reparent {
            role,
            was_root: false,
            parent_id: None,
        } => {
            return Err(LibError::root_policy(
                "Only one root role is allowed",
                anyhow!("detaching {} would create a second root", role),
            ));
        }
        RootChange::Remove {
            role,
            was_root: true,
        } => {
            let children = tx.list_children(Some(role)).await?;
            if children.len() > 1 {
                return Err(LibError::root_policy(
                    "Removing the root would leave several root roles",
                    anyhow!(
                        "root {} has {} children under single-root policy",
                        role,
                        children.len()
                    ),
                ));
            }
        }
        _ => {}
    }

    Ok(())
}

/// Reports every integrity violation in a full snapshot of the table.
pub fn role_invariant_violations(roles: &[Role]) -> Vec<RoleInvariantViolation> {
    let parents: HashMap<RoleId, Option<RoleId>> =
        roles.iter().map(|role| (role.id, role.parent_id)).collect();
    let mut violations = Vec::new();

    let mut by_name: HashMap<&str, Vec<RoleId>> = HashMap::with_capacity(roles.len());
    for role in roles {
        if role.name.trim().is_empty() {
            violations.push(RoleInvariantViolation::EmptyName { role_id: role.id });
        }
        by_name.entry(role.name.as_str()).or_default().push(role.id);

        match role.parent_id {
            Some(parent_id) if parent_id == role.id => {
                violations.push(RoleInvariantViolation::SelfParent { role_id: role.id });
            }
            Some(parent_id) if !parents.contains_key(&parent_id) => {
                violations.push(RoleInvariantViolation::UnknownParent {
                    role_id: role.id,
                    missing_parent_id: parent_id,
                });
            }
            _ => {}
        }
    }

    let mut duplicates = by_name
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .collect::<Vec<_>>();
    duplicates.sort_by(|a, b| a.0.cmp(b.0));
    for (name, mut role_ids) in duplicates {
        role_ids.sort();
        violations.push(RoleInvariantViolation::DuplicateName {
            name: name.to_string(),
            role_ids,
        });
    }

    for role_ids in parent_cycles(roles, &parents) {
        violations.push(RoleInvariantViolation::CycleDetected { role_ids });
    }

    violations
}

// Each role has at most one parent, so following parent links from any start
// either reaches a root, a dangling id, or a loop. Colour roles as settled
// once their chain is known to end, so every role is walked once.
fn parent_cycles(roles: &[Role], parents: &HashMap<RoleId, Option<RoleId>>) -> Vec<Vec<RoleId>> {
    let mut settled: HashSet<RoleId> = HashSet::with_capacity(roles.len());
    let mut cycles = Vec::new();

    for role in roles {
        if settled.contains(&role.id) {
            continue;
        }

        let mut path: Vec<RoleId> = Vec::new();
        let mut on_path: HashMap<RoleId, usize> = HashMap::new();
        let mut current = Some(role.id);

        while let Some(id) = current {
            if settled.contains(&id) {
                break;
            }
            if let Some(&start) = on_path.get(&id) {
                let mut cycle = path[start..].to_vec();
                cycle.sort();
                // Self parents are reported on their own.
                if cycle.len() > 1 {
                    cycles.push(cycle);
                }
                break;
            }
            on_path.insert(id, path.len());
            path.push(id);
            current = parents.get(&id).copied().flatten();
        }

        settled.extend(path);
    }

    cycles
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::MemoryRoleStore;
    use crate::models::NewRole;
    use crate::store::RoleStore;

    fn row(id: RoleId, name: &str, parent_id: Option<RoleId>) -> Role {
        let now = Utc::now().naive_utc();
        Role {
            id,
            name: name.to_string(),
            description: String::new(),
            parent_id,
            created_at: now,
            updated_at: now,
        }
    }

    async fn insert(
        tx: &mut crate::memory::MemoryRoleTx,
        name: &str,
        parent_id: Option<RoleId>,
    ) -> Role {
        tx.insert(NewRole {
            name: name.to_string(),
            description: String::new(),
            parent_id,
        })
        .await
        .expect("insert should succeed")
    }

    #[tokio::test]
    async fn parent_must_exist() {
        let store = MemoryRoleStore::new();
        let mut tx = store.begin().await.expect("begin");
        let exec = insert(&mut tx, "Exec", None).await;

        check_parent_exists(&mut tx, None).await.expect("root ok");
        check_parent_exists(&mut tx, Some(exec.id))
            .await
            .expect("existing parent ok");
        let err = check_parent_exists(&mut tx, Some(RoleId::new_v4()))
            .await
            .expect_err("missing parent should fail");
        assert_eq!(err.kind, ErrorKind::ParentNotFound);
    }

    #[tokio::test]
    async fn name_uniqueness_ignores_the_role_itself() {
        let store = MemoryRoleStore::new();
        let mut tx = store.begin().await.expect("begin");
        let exec = insert(&mut tx, "Exec", None).await;

        check_name_unique(&mut tx, "Exec", Some(exec.id))
            .await
            .expect("renaming to own name is fine");
        let err = check_name_unique(&mut tx, "Exec", None)
            .await
            .expect_err("taken name should fail");
        assert_eq!(err.kind, ErrorKind::DuplicateName);
    }

    #[test]
    fn self_reference_is_rejected() {
        let id = RoleId::new_v4();
        let err = check_no_self_reference(id, Some(id)).expect_err("self parent should fail");
        assert_eq!(err.kind, ErrorKind::SelfReference);
        check_no_self_reference(id, None).expect("root is fine");
    }

    #[tokio::test]
    async fn acyclic_check_rejects_descendants_at_any_depth() {
        let store = MemoryRoleStore::new();
        let mut tx = store.begin().await.expect("begin");
        let a = insert(&mut tx, "A", None).await;
        let b = insert(&mut tx, "B", Some(a.id)).await;
        let c = insert(&mut tx, "C", Some(b.id)).await;
        let d = insert(&mut tx, "D", Some(c.id)).await;
        let other = insert(&mut tx, "Other", None).await;

        let err = check_acyclic(&mut tx, a.id, Some(d.id))
            .await
            .expect_err("grandchild parent should fail");
        assert_eq!(err.kind, ErrorKind::CycleDetected);
        check_acyclic(&mut tx, b.id, Some(other.id))
            .await
            .expect("unrelated parent is fine");
        check_acyclic(&mut tx, d.id, Some(a.id))
            .await
            .expect("moving up is fine");
    }

    #[tokio::test]
    async fn acyclic_check_terminates_on_corrupted_chain() {
        let x = RoleId::new_v4();
        let y = RoleId::new_v4();
        let target = RoleId::new_v4();
        let store = MemoryRoleStore::from_rows([
            row(x, "X", Some(y)),
            row(y, "Y", Some(x)),
            row(target, "T", None),
        ]);
        let mut tx = store.begin().await.expect("begin");

        let err = check_acyclic(&mut tx, target, Some(x))
            .await
            .expect_err("looping chain should fail");
        assert_eq!(err.kind, ErrorKind::CycleDetected);
    }

    #[tokio::test]
    async fn single_root_policy_refuses_second_root() {
        let store = MemoryRoleStore::new();
        let mut tx = store.begin().await.expect("begin");
        check_root_policy(
            &mut tx,
            RootPolicy::Single,
            RootChange::Create { parent_id: None },
        )
        .await
        .expect("first root is fine");
        let root = insert(&mut tx, "Root", None).await;
        let child = insert(&mut tx, "Child", Some(root.id)).await;

        let err = check_root_policy(
            &mut tx,
            RootPolicy::Single,
            RootChange::Create { parent_id: None },
        )
        .await
        .expect_err("second root should fail");
        assert_eq!(err.kind, ErrorKind::RootPolicy);

        let err = check_root_policy(
            &mut tx,
            RootPolicy::Single,
            RootChange::Reparent {
                role: child.id,
                was_root: false,
                parent_id: None,
            },
        )
        .await
        .expect_err("detaching should fail");
        assert_eq!(err.kind, ErrorKind::RootPolicy);

        check_root_policy(
            &mut tx,
            RootPolicy::Forest,
            RootChange::Create { parent_id: None },
        )
        .await
        .expect("forest allows many roots");
    }

    #[tokio::test]
    async fn single_root_policy_allows_removing_root_with_one_child() {
        let store = MemoryRoleStore::new();
        let mut tx = store.begin().await.expect("begin");
        let root = insert(&mut tx, "Root", None).await;
        insert(&mut tx, "Only", Some(root.id)).await;

        let change = RootChange::Remove {
            role: root.id,
            was_root: true,
        };
        check_root_policy(&mut tx, RootPolicy::Single, change)
            .await
            .expect("one child takes over as root");

        insert(&mut tx, "Second", Some(root.id)).await;
        let err = check_root_policy(&mut tx, RootPolicy::Single, change)
            .await
            .expect_err("two children would become roots");
        assert_eq!(err.kind, ErrorKind::RootPolicy);
    }

    #[test]
    fn audit_accepts_valid_forest() {
        let a = RoleId::new_v4();
        let b = RoleId::new_v4();
        let c = RoleId::new_v4();
        let violations = role_invariant_violations(&[
            row(a, "A", None),
            row(b, "B", Some(a)),
            row(c, "C", None),
        ]);
        assert!(violations.is_empty());
    }

    #[test]
    fn audit_reports_cycles_self_parents_and_unknown_parents() {
        let a = RoleId::new_v4();
        let b = RoleId::new_v4();
        let c = RoleId::new_v4();
        let d = RoleId::new_v4();
        let tail = RoleId::new_v4();
        let missing = RoleId::new_v4();
        let violations = role_invariant_violations(&[
            row(a, "A", Some(b)),
            row(b, "B", Some(a)),
            row(tail, "Tail", Some(a)),
            row(c, "C", Some(c)),
            row(d, "D", Some(missing)),
        ]);

        let mut expected_cycle = vec![a, b];
        expected_cycle.sort();
        assert!(violations.contains(&RoleInvariantViolation::CycleDetected {
            role_ids: expected_cycle
        }));
        assert!(violations.contains(&RoleInvariantViolation::SelfParent { role_id: c }));
        assert!(violations.contains(&RoleInvariantViolation::UnknownParent {
            role_id: d,
            missing_parent_id: missing
        }));
        assert_eq!(
            violations
                .iter()
                .filter(|v| matches!(v, RoleInvariantViolation::CycleDetected { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn audit_reports_duplicate_names() {
        let a = RoleId::new_v4();
        let b = RoleId::new_v4();
        let violations = role_invariant_violations(&[row(a, "Ops", None), row(b, "Ops", None)]);
        assert!(matches!(
            &violations[0],
            RoleInvariantViolation::DuplicateName { name, role_ids }
                if name == "Ops" && role_ids.len() == 2
        ));
        assert_eq!(violations[0].error_code(), "role_duplicate_name");
    }
}
