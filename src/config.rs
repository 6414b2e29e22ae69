use std::env;
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether the hierarchy may hold several independent trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RootPolicy {
    #[default]
    Forest,
    /// At most one role may have no parent.
    Single,
}

impl RootPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            RootPolicy::Forest => "forest",
            RootPolicy::Single => "single",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "forest" => Some(RootPolicy::Forest),
            "single" => Some(RootPolicy::Single),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoleTreeConfig {
    /// Upper bound on a single service call, including every store round trip.
    pub store_timeout: Duration,
    pub root_policy: RootPolicy,
}

impl Default for RoleTreeConfig {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            root_policy: RootPolicy::Forest,
        }
    }
}

impl RoleTreeConfig {
    pub fn with_root_policy(mut self, root_policy: RootPolicy) -> Self {
        self.root_policy = root_policy;
        self
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = env_value("ROLE_TREE_STORE_TIMEOUT_MS") {
            let millis: u64 = raw
                .parse()
                .with_context(|| format!("invalid ROLE_TREE_STORE_TIMEOUT_MS '{}'", raw))?;
            config.store_timeout = Duration::from_millis(millis);
        }
        if let Some(raw) = env_value("ROLE_TREE_ROOT_POLICY") {
            config.root_policy = RootPolicy::parse(&raw)
                .ok_or_else(|| anyhow!("invalid ROLE_TREE_ROOT_POLICY '{}'", raw))?;
        }
        Ok(config)
    }
}

#[cfg(feature = "sqlx")]
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[cfg(feature = "sqlx")]
impl DatabaseConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let url = env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let max_connections = match env_value("ROLE_TREE_DB_MAX_CONNECTIONS") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid ROLE_TREE_DB_MAX_CONNECTIONS '{}'", raw))?,
            None => 5,
        };
        Ok(Self {
            url,
            max_connections,
            acquire_timeout: DEFAULT_STORE_TIMEOUT,
        })
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
