use std::hint::black_box;

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tokio::runtime::Runtime;
use uuid::Uuid;

use role_tree::algorithms::build_subtree;
use role_tree::invariants::{check_acyclic, role_invariant_violations};
use role_tree::memory::MemoryRoleStore;
use role_tree::models::{Role, RoleId};
use role_tree::store::RoleStore;

fn lcg_next(state: &mut u64) -> u64 {
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
    *state
}

fn role(idx: usize, parent_id: Option<RoleId>) -> Role {
    let now = Utc::now().naive_utc();
    Role {
        id: RoleId(Uuid::from_u128((idx as u128) + 1)),
        name: format!("role-{idx}"),
        description: String::new(),
        parent_id,
        created_at: now,
        updated_at: now,
    }
}

/// Every role after the first hangs under a random earlier role, so the
/// result is a single valid tree rooted at index 0.
fn synthetic_tree(role_count: usize) -> Vec<Role> {
    let mut state = 0x1234_5678_9abc_def0u64;
    let mut roles: Vec<Role> = Vec::with_capacity(role_count);
    for idx in 0..role_count {
        let parent_id = if idx == 0 {
            None
        } else {
            Some(roles[(lcg_next(&mut state) as usize) % idx].id)
        };
        roles.push(role(idx, parent_id));
    }
    roles
}

fn synthetic_chain(role_count: usize) -> Vec<Role> {
    let mut roles: Vec<Role> = Vec::with_capacity(role_count);
    for idx in 0..role_count {
        let parent_id = roles.last().map(|parent| parent.id);
        roles.push(role(idx, parent_id));
    }
    roles
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("bench runtime")
}

fn bench_acyclic_checks(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("acyclic_checks");
    for roles in [1_000usize, 5_000usize] {
        let rows = synthetic_tree(roles);
        let ids = rows.iter().map(|role| role.id).collect::<Vec<_>>();
        let store = MemoryRoleStore::from_rows(rows);
        let mut tx = rt.block_on(store.begin()).expect("begin");

        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("reparent_check", format!("{roles}r")), |b| {
            let mut seed = 42u64;
            b.iter(|| {
                let id = ids[(lcg_next(&mut seed) as usize) % ids.len()];
                let parent = ids[(lcg_next(&mut seed) as usize) % ids.len()];
                black_box(rt.block_on(check_acyclic(&mut tx, id, Some(parent))).is_ok());
            });
        });
    }
    group.finish();
}

fn bench_materialize(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("materialize");
    for (label, rows) in [
        ("tree_1000r", synthetic_tree(1_000)),
        ("chain_1000r", synthetic_chain(1_000)),
    ] {
        let root = rows[0].id;
        let store = MemoryRoleStore::from_rows(rows);
        let mut tx = rt.block_on(store.begin()).expect("begin");

        group.bench_function(BenchmarkId::new("build_subtree", label), |b| {
            b.iter(|| black_box(rt.block_on(build_subtree(&mut tx, root)).expect("tree")));
        });
    }
    group.finish();
}

fn bench_audit(c: &mut Criterion) {
    let mut group = c.benchmark_group("audit");
    for roles in [1_000usize, 10_000usize] {
        let rows = synthetic_tree(roles);
        group.throughput(Throughput::Elements(roles as u64));
        group.bench_with_input(
            BenchmarkId::new("role_invariant_violations", format!("{roles}r")),
            &rows,
            |b, rows| b.iter(|| black_box(role_invariant_violations(rows))),
        );
    }
    group.finish();
}

criterion_group!(tree_checks, bench_acyclic_checks, bench_materialize, bench_audit);
criterion_main!(tree_checks);
