//! # Tenantry
//!
//! Schema-per-tenant multi-tenancy for PostgreSQL.
//!
//! Every tenant owns a PostgreSQL schema cloned from a template. Requests
//! select a tenant, connections point their `search_path` at it, and
//! migrations fan out to the template and every tenant.
//!
//! Tenantry provides:
//! - A registry of tenant schemas with creation by cloning
//! - Request schema selection with per-user authorization
//! - A migration editor that routes each statement to shared or tenant tables
//! - A PostgreSQL driver and an Axum layer, behind features
//!
//! ## Quick Start
//!
//! ```rust
//! use tenantry::prelude::*;
//! use tenantry::MemoryDatabase;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> TenancyResult<()> {
//!     let db = MemoryDatabase::new();
//!     let registry = SchemaRegistry::new(db.clone());
//!     let tables = TableRegistry::new().shared("users")?;
//!
//!     let mut session = SchemaSession::new(db.acquire().await?, &TenancyConfig::default());
//!     let mut editor = SchemaEditor::new(&mut session, &registry, &tables);
//!     editor.execute("CREATE TABLE orders (id int)").await?;
//!
//!     registry.create(NewSchema::new("acme")).await?;
//!     assert!(db.table("acme", "orders").is_some());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use tenantry_core::*;

/// PostgreSQL driver.
#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres {
    pub use tenantry_postgres::*;
}

/// Axum integration.
#[cfg(feature = "axum")]
#[cfg_attr(docsrs, doc(cfg(feature = "axum")))]
pub mod axum {
    pub use tenantry_axum::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use tenantry_core::prelude::*;

    #[cfg(feature = "axum")]
    pub use tenantry_axum::{SchemaLayer, TenancyRejection, TenantSession};
    #[cfg(feature = "postgres")]
    pub use tenantry_postgres::{PgPool, PgSchemaStore};
}
