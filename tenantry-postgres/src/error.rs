//! Error types for PostgreSQL operations.

use tenantry_core::{ErrorCode, TenancyError};
use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors raised by the driver before they are mapped to [`TenancyError`].
#[derive(Error, Debug)]
pub enum PgError {
    /// Connection pool error.
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Pool construction error.
    #[error("pool build error: {0}")]
    Build(#[from] deadpool_postgres::BuildError),

    /// PostgreSQL error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl PgError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Pool(_)) || matches!(self, Self::Postgres(e) if e.is_closed())
    }

    /// SQLSTATE reported by the server, if any.
    pub fn sql_state(&self) -> Option<&SqlState> {
        match self {
            Self::Postgres(e) => e.code(),
            _ => None,
        }
    }
}

impl From<PgError> for TenancyError {
    fn from(err: PgError) -> Self {
        match err {
            PgError::Pool(e) => TenancyError::connection(e.to_string()).with_source(e),
            PgError::Build(e) => TenancyError::config(format!("failed to create pool: {}", e)),
            PgError::Config(msg) => TenancyError::config(msg),
            PgError::Postgres(e) => {
                let message = e
                    .as_db_error()
                    .map(|db| db.message().to_string())
                    .unwrap_or_else(|| e.to_string());
                let constraint = e
                    .as_db_error()
                    .and_then(|db| db.constraint())
                    .map(str::to_string);
                let code = match e.code() {
                    Some(state) if *state == SqlState::UNDEFINED_TABLE => {
                        ErrorCode::UndefinedRelation
                    }
                    Some(state) if *state == SqlState::UNIQUE_VIOLATION => {
                        ErrorCode::UniqueViolation
                    }
                    _ if e.is_closed() => ErrorCode::ConnectionFailed,
                    _ => ErrorCode::Database,
                };
                let err = TenancyError::new(code, message);
                match constraint {
                    Some(constraint) => err.with_constraint(constraint).with_source(e),
                    None => err.with_source(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_maps_to_configuration() {
        let err: TenancyError = PgError::config("missing host").into();
        assert_eq!(err.code, ErrorCode::InvalidConfiguration);
        assert!(err.message.contains("missing host"));
        assert!(!PgError::config("x").is_connection_error());
        assert!(PgError::config("x").sql_state().is_none());
    }
}
