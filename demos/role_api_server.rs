use std::env;
use std::net::SocketAddr;

use anyhow::Context;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use role_tree::api::HasRoleService;
use role_tree::config::{DatabaseConfig, RoleTreeConfig};
use role_tree::db::{PgRoleStore, create_role_tables};
use role_tree::operations::RoleService;

#[derive(Clone)]
struct ExampleApp {
    roles: RoleService<PgRoleStore>,
}

impl HasRoleService for ExampleApp {
    type Store = PgRoleStore;

    fn roles(&self) -> RoleService<PgRoleStore> {
        self.roles.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let database = DatabaseConfig::from_env()?;
    let config = RoleTreeConfig::from_env()?;
    let bind = env::var("ROLE_TREE_BIND").unwrap_or_else(|_| "127.0.0.1:4020".to_string());
    let bind_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid ROLE_TREE_BIND '{}'", bind))?;

    let store = PgRoleStore::connect(&database)
        .await
        .map_err(|err| err.source)
        .context("failed to connect to postgres")?;
    create_role_tables(&store.pool())
        .await
        .context("failed to run role migrations")?;

    tracing::info!(
        root_policy = config.root_policy.as_str(),
        store_timeout = ?config.store_timeout,
        "role tree configured"
    );
    let app_state = ExampleApp {
        roles: RoleService::new(store, config),
    };

    let api_v1 = Router::new()
        .route("/healthz", get(health_handler))
        .merge(role_tree::api::routes::<ExampleApp>());

    let app = Router::new().nest("/api/v1", api_v1).with_state(app_state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", bind_addr))?;

    tracing::info!("role_tree example server listening on http://{}", bind_addr);
    tracing::info!("api base path: /api/v1");

    axum::serve(listener, app)
        .await
        .context("example server failed")
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true
    }))
}
