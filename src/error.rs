use anyhow::anyhow;

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RoleNotFound,
    ParentNotFound,
    DuplicateName,
    SelfReference,
    CycleDetected,
    InvalidInput,
    RootPolicy,
    /// Transient infrastructure failure; the only kind worth retrying.
    StoreUnavailable,
    Database,
}

#[derive(Debug)]
pub struct LibError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub source: anyhow::Error,
}

impl LibError {
    pub fn role_not_found(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::RoleNotFound,
            code: "role_not_found",
            public,
            source,
        }
    }

    pub fn parent_not_found(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::ParentNotFound,
            code: "parent_not_found",
            public,
            source,
        }
    }

    pub fn duplicate_name(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::DuplicateName,
            code: "duplicate_name",
            public,
            source,
        }
    }

    pub fn self_reference(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::SelfReference,
            code: "self_reference",
            public,
            source,
        }
    }

    pub fn cycle_detected(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::CycleDetected,
            code: "cycle_detected",
            public,
            source,
        }
    }

    pub fn invalid(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "invalid_input",
            public,
            source,
        }
    }

    pub fn root_policy(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::RootPolicy,
            code: "root_policy_violation",
            public,
            source,
        }
    }

    pub fn unavailable(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::StoreUnavailable,
            code: "store_unavailable",
            public,
            source,
        }
    }

    pub fn database(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Database,
            code: "database_error",
            public,
            source,
        }
    }

    pub fn timed_out(elapsed: tokio::time::error::Elapsed) -> Self {
        Self::unavailable("Role store did not respond in time", anyhow!(elapsed))
    }

    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::StoreUnavailable)
    }
}

impl std::fmt::Display for LibError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.public)
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for LibError {
    fn from(value: sqlx::Error) -> Self {
        crate::db::classify_sqlx_error("Database request failed", value)
    }
}
