//! # tenantry-core
//!
//! Schema-per-tenant routing for PostgreSQL.
//!
//! Every tenant gets its own PostgreSQL schema holding a copy of every
//! tenant table; shared tables live once in the public schema. This crate
//! provides:
//! - A registry of tenant schemas that clones a template schema on create
//! - A session handle that points a connection's `search_path` at one schema
//! - A statement classifier and a fan-out engine that replays unqualified
//!   tenant DDL in the template and every tenant schema
//! - The request selection rules (path, query parameter, header, implicit)
//! - An in-memory backend implementing all of the above for tests
//!
//! ## Identifiers
//!
//! ```rust
//! use tenantry_core::{SchemaName, SchemaRef, TEMPLATE_SCHEMA};
//!
//! assert!(SchemaName::parse("acme_2").is_ok());
//! assert!(SchemaName::parse("2acme").unwrap_err().is_validation());
//! assert!(SchemaName::parse(TEMPLATE_SCHEMA).is_err());
//! assert!(SchemaRef::parse(TEMPLATE_SCHEMA).unwrap().is_template());
//! ```
//!
//! ## Classification
//!
//! ```rust
//! use tenantry_core::classify::{ObjectName, StatementShape, parse_statement};
//!
//! assert_eq!(
//!     parse_statement("ALTER TABLE widgets ADD COLUMN colour text"),
//!     StatementShape::Table(ObjectName::bare("widgets")),
//! );
//! assert_eq!(
//!     parse_statement("CREATE INDEX w_name ON acme.widgets (name)"),
//!     StatementShape::Table(ObjectName::qualified("acme", "widgets")),
//! );
//! assert_eq!(parse_statement("CREATE FUNCTION f() RETURNS int"), StatementShape::Unrouted);
//! ```
//!
//! ## Registry and Sessions
//!
//! ```rust
//! use tenantry_core::prelude::*;
//! use tenantry_core::MemoryDatabase;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> TenancyResult<()> {
//! let db = MemoryDatabase::new();
//! let config = TenancyConfig::default();
//! let registry = SchemaRegistry::new(db.clone());
//! registry.create(NewSchema::new("acme").display_name("Acme Inc")).await?;
//!
//! let mut session = SchemaSession::new(db.acquire().await?, &config);
//! session.activate("acme").await?;
//! assert_eq!(session.current().tenant().unwrap(), "acme");
//! session.deactivate().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! ```rust
//! use tenantry_core::{ErrorCode, TenancyError};
//!
//! let err = TenancyError::template_activation();
//! assert_eq!(err.code, ErrorCode::TemplateActivation);
//! assert_eq!(err.http_status(), 403);
//! ```

pub mod classify;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod events;
pub mod fanout;
pub mod identifier;
pub mod logging;
pub mod memory;
pub mod registry;
pub mod schema;
pub mod selection;
pub mod tables;

pub use classify::{StatementTarget, classify, split_statements};
pub use config::{DatabaseConfig, SelectionConfig, TenancyConfig};
pub use connection::{Catalog, ConnectionSource, SchemaConnection, SearchPath, quote_ident};
pub use context::{ActiveSchema, SchemaSession};
pub use error::{ErrorCode, ErrorContext, TenancyError, TenancyResult};
pub use events::{NoEvents, SchemaEvents};
pub use fanout::{MigrationExecutor, Routing, SchemaEditor, ScriptReport};
pub use identifier::{MAX_SCHEMA_NAME_LEN, SchemaName, SchemaRef, TEMPLATE_SCHEMA};
pub use memory::{MemoryConnection, MemoryDatabase};
pub use registry::{SchemaRegistry, SchemaStore};
pub use schema::{NewSchema, Schema, UserId};
pub use selection::{
    MemorySession, Principal, RequestInfo, SchemaSelector, SelectionOutcome, SessionStore, User,
    activate_for_request, require_selection,
};
pub use tables::{Entity, EntityKey, Record, TableRegistry, TableScope};

// Re-export logging utilities
pub use logging::{
    get_log_format, get_log_level, init as init_logging, init_debug, init_with_level,
    is_debug_enabled,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::TenancyConfig;
    pub use crate::connection::{ConnectionSource, SchemaConnection};
    pub use crate::context::{ActiveSchema, SchemaSession};
    pub use crate::error::{TenancyError, TenancyResult};
    pub use crate::fanout::{MigrationExecutor, SchemaEditor};
    pub use crate::identifier::{SchemaName, SchemaRef};
    pub use crate::registry::{SchemaRegistry, SchemaStore};
    pub use crate::schema::{NewSchema, Schema};
    pub use crate::selection::{Principal, SchemaSelector, SessionStore};
    pub use crate::tables::{Entity, Record, TableRegistry, TableScope};
}
