//! Subtree materialization.
//!
//! Traversal is driven by an explicit stack so deep hierarchies never grow
//! the call stack, and so a loop in the stored parent links is reported as
//! `CycleDetected` instead of spinning forever.

use std::collections::{BTreeMap, HashSet};

use anyhow::anyhow;

use crate::error::{LibError, Result};
use crate::models::{Role, RoleId, RoleTree};
use crate::store::RoleStoreTx;

#[derive(Debug, Clone)]
pub struct SubtreeNode {
    pub role: Role,
    /// Distance from the walk's root, which has depth 0.
    pub depth: usize,
}

/// Single-use preorder walk over the subtree below a role.
///
/// Children are fetched only when their parent is yielded. Siblings are
/// visited in name order.
pub struct SubtreeWalk<'t, T> {
    tx: &'t mut T,
    pending: Vec<(Role, usize)>,
    path: Vec<RoleId>,
    visited: HashSet<RoleId>,
    max_nodes: u64,
}

impl<'t, T: RoleStoreTx> SubtreeWalk<'t, T> {
    pub async fn start(tx: &'t mut T, root_id: RoleId) -> Result<Self> {
        let root = tx.get(root_id).await?.ok_or_else(|| {
            LibError::role_not_found("Role not found", anyhow!("role {} not found", root_id))
        })?;
        let max_nodes = tx.count().await?;
        Ok(Self {
            tx,
            pending: vec![(root, 0)],
            path: Vec::new(),
            visited: HashSet::new(),
            max_nodes,
        })
    }

    pub async fn next(&mut self) -> Result<Option<SubtreeNode>> {
        let Some((role, depth)) = self.pending.pop() else {
            return Ok(None);
        };

        self.path.truncate(depth);
        // Every ancestor on `path` is already in `visited`.
        if !self.visited.insert(role.id) {
            return Err(self.cycle_error(role.id));
        }
        if self.visited.len() as u64 > self.max_nodes {
            return Err(self.cycle_error(role.id));
        }
        self.path.push(role.id);

        let children = self.tx.list_children(Some(role.id)).await?;
        self.pending
            .extend(children.into_iter().rev().map(|child| (child, depth + 1)));

        Ok(Some(SubtreeNode { role, depth }))
    }

    fn cycle_error(&self, role_id: RoleId) -> LibError {
        tracing::warn!(
            role_id = %role_id,
            path_len = self.path.len(),
            "role reached twice while materializing subtree"
        );
        LibError::cycle_detected(
            "Role hierarchy contains a cycle",
            anyhow!("role {} reappeared below {:?}", role_id, self.path),
        )
    }
}

/// Builds `{root: {child: {grandchild: {}}}}` for the subtree at `root_id`.
pub async fn build_subtree<T: RoleStoreTx>(tx: &mut T, root_id: RoleId) -> Result<RoleTree> {
    let mut walk = SubtreeWalk::start(tx, root_id).await?;

    // Arena in preorder: every parent sits at a lower index than its children.
    let mut names: Vec<String> = Vec::new();
    let mut parents: Vec<Option<usize>> = Vec::new();
    let mut ancestors: Vec<usize> = Vec::new();

    while let Some(node) = walk.next().await? {
        ancestors.truncate(node.depth);
        let index = names.len();
        names.push(node.role.name);
        parents.push(ancestors.last().copied());
        ancestors.push(index);
    }

    let mut trees: Vec<BTreeMap<String, RoleTree>> = vec![BTreeMap::new(); names.len()];
    for index in (1..names.len()).rev() {
        let subtree = RoleTree(std::mem::take(&mut trees[index]));
        if let Some(parent) = parents[index] {
            trees[parent].insert(std::mem::take(&mut names[index]), subtree);
        }
    }

    let mut root = BTreeMap::new();
    if let (Some(name), Some(children)) = (names.into_iter().next(), trees.into_iter().next()) {
        root.insert(name, RoleTree(children));
    }
    Ok(RoleTree(root))
}

pub async fn list_children<T: RoleStoreTx>(tx: &mut T, id: RoleId) -> Result<Vec<Role>> {
    if tx.get(id).await?.is_none() {
        return Err(LibError::role_not_found(
            "Role not found",
            anyhow!("role {} not found", id),
        ));
    }
    tx.list_children(Some(id)).await
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::{MemoryRoleStore, MemoryRoleTx};
    use crate::models::NewRole;
    use crate::store::RoleStore;

    async fn insert(tx: &mut MemoryRoleTx, name: &str, parent_id: Option<RoleId>) -> Role {
        tx.insert(NewRole {
            name: name.to_string(),
            description: String::new(),
            parent_id,
        })
        .await
        .expect("insert should succeed")
    }

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

    #[tokio::test]
    async fn builds_nested_tree() {
        let store = MemoryRoleStore::new();
        let mut tx = store.begin().await.expect("begin");
        let root = insert(&mut tx, "root", None).await;
        let c1 = insert(&mut tx, "C1", Some(root.id)).await;
        insert(&mut tx, "C2", Some(root.id)).await;
        insert(&mut tx, "G1", Some(c1.id)).await;
        insert(&mut tx, "elsewhere", None).await;

        let tree = build_subtree(&mut tx, root.id).await.expect("tree");
        assert_eq!(
            serde_json::to_value(&tree).expect("serialize"),
            json!({"root": {"C1": {"G1": {}}, "C2": {}}})
        );

        let leaf = build_subtree(&mut tx, c1.id).await.expect("tree");
        assert_eq!(
            serde_json::to_value(&leaf).expect("serialize"),
            json!({"C1": {"G1": {}}})
        );
    }

    #[tokio::test]
    async fn walk_yields_preorder_with_depths() {
        let store = MemoryRoleStore::new();
        let mut tx = store.begin().await.expect("begin");
        let root = insert(&mut tx, "root", None).await;
        let a = insert(&mut tx, "a", Some(root.id)).await;
        insert(&mut tx, "b", Some(root.id)).await;
        insert(&mut tx, "a1", Some(a.id)).await;

        let mut walk = SubtreeWalk::start(&mut tx, root.id).await.expect("start");
        let mut seen = Vec::new();
        while let Some(node) = walk.next().await.expect("step") {
            seen.push((node.role.name, node.depth));
        }
        assert_eq!(
            seen,
            vec![
                ("root".to_string(), 0),
                ("a".to_string(), 1),
                ("a1".to_string(), 2),
                ("b".to_string(), 1),
            ]
        );
        assert!(walk.next().await.expect("exhausted").is_none());
    }

    #[tokio::test]
    async fn deep_chain_does_not_recurse() {
        let store = MemoryRoleStore::new();
        let mut tx = store.begin().await.expect("begin");
        let root = insert(&mut tx, "n0", None).await;
        let mut parent = root.id;
        for depth in 1..1_000 {
            parent = insert(&mut tx, &format!("n{}", depth), Some(parent)).await.id;
        }

        let tree = build_subtree(&mut tx, root.id).await.expect("tree");
        let mut node = &tree;
        let mut depth = 0;
        while let Some((_, child)) = node.0.iter().next() {
            node = child;
            depth += 1;
        }
        assert_eq!(depth, 1_000);
    }

    #[tokio::test]
    async fn stored_cycle_is_reported() {
        let top = RoleId::new_v4();
        let a = RoleId::new_v4();
        let b = RoleId::new_v4();
        // `top` has a parent inside the loop it heads, so walking from it
        // comes back around.
        let store = MemoryRoleStore::from_rows([
            row(top, "top", Some(b)),
            row(a, "a", Some(top)),
            row(b, "b", Some(a)),
        ]);
        let mut tx = store.begin().await.expect("begin");

        let err = build_subtree(&mut tx, top)
            .await
            .expect_err("cycle should fail");
        assert_eq!(err.kind, ErrorKind::CycleDetected);
    }

    #[tokio::test]
    async fn self_parented_row_is_reported() {
        let looped = RoleId::new_v4();
        let store = MemoryRoleStore::from_rows([row(looped, "looped", Some(looped))]);
        let mut tx = store.begin().await.expect("begin");

        let mut walk = SubtreeWalk::start(&mut tx, looped).await.expect("start");
        let first = walk.next().await.expect("root").expect("root node");
        assert_eq!(first.role.id, looped);
        let err = walk.next().await.expect_err("loop should fail");
        assert_eq!(err.kind, ErrorKind::CycleDetected);
    }

    #[tokio::test]
    async fn missing_root_is_not_found() {
        let store = MemoryRoleStore::new();
        let mut tx = store.begin().await.expect("begin");
        let err = build_subtree(&mut tx, RoleId::new_v4())
            .await
            .expect_err("missing role should fail");
        assert_eq!(err.kind, ErrorKind::RoleNotFound);

        let err = list_children(&mut tx, RoleId::new_v4())
            .await
            .expect_err("missing role should fail");
        assert_eq!(err.kind, ErrorKind::RoleNotFound);
    }
}
