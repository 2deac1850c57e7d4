//! Driver seam.
//!
//! The routing engine talks to the database only through these traits. The
//! PostgreSQL driver and the in-memory backend both implement them.

use async_trait::async_trait;

use crate::error::TenancyResult;
use crate::identifier::SchemaRef;

/// A `search_path` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath {
    schemas: Vec<String>,
}

impl SearchPath {
    /// `"<schema>", <public>`: the schema first, shared tables visible behind it.
    pub fn for_schema(schema: &SchemaRef, public: &str) -> Self {
        Self {
            schemas: vec![schema.as_str().to_string(), public.to_string()],
        }
    }

    /// Only the public schema: no tenant selected.
    pub fn public_only(public: &str) -> Self {
        Self {
            schemas: vec![public.to_string()],
        }
    }

    /// Schemas in lookup order.
    pub fn schemas(&self) -> &[String] {
        &self.schemas
    }

    /// The `SET search_path` directive for this path.
    ///
    /// ```rust
    /// use tenantry_core::{SchemaRef, SearchPath};
    ///
    /// let path = SearchPath::for_schema(&SchemaRef::parse("acme").unwrap(), "public");
    /// assert_eq!(path.to_sql(), r#"SET search_path TO "acme", "public""#);
    /// ```
    pub fn to_sql(&self) -> String {
        let schemas: Vec<String> = self.schemas.iter().map(|s| quote_ident(s)).collect();
        format!("SET search_path TO {}", schemas.join(", "))
    }
}

/// Quote an identifier for PostgreSQL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Read-only catalog lookups used by statement classification.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Name of the table owning `index`, searching `schemas` in order.
    async fn index_owner(&self, index: &str, schemas: &[&str]) -> TenancyResult<Option<String>>;
}

/// A single database connection whose search path can be changed.
///
/// Search path changes are connection-scoped, so one connection must never be
/// shared between concurrently running requests.
#[async_trait]
pub trait SchemaConnection: Catalog {
    /// Execute one or more statements without parameters.
    async fn batch_execute(&self, sql: &str) -> TenancyResult<()>;

    /// Point unqualified names at the given path.
    async fn set_search_path(&self, path: &SearchPath) -> TenancyResult<()> {
        self.batch_execute(&path.to_sql()).await
    }

    /// Open a transaction.
    async fn begin(&self) -> TenancyResult<()> {
        self.batch_execute("BEGIN").await
    }

    /// Commit the open transaction.
    async fn commit(&self) -> TenancyResult<()> {
        self.batch_execute("COMMIT").await
    }

    /// Roll back the open transaction.
    async fn rollback(&self) -> TenancyResult<()> {
        self.batch_execute("ROLLBACK").await
    }
}

/// Hands out connections, typically from a pool.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// Connection type.
    type Connection: SchemaConnection + 'static;

    /// Acquire a connection.
    async fn acquire(&self) -> TenancyResult<Self::Connection>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::TEMPLATE_SCHEMA;

    #[test]
    fn test_search_path_sql() {
        assert_eq!(
            SearchPath::for_schema(&SchemaRef::Template, "public").to_sql(),
            format!("SET search_path TO \"{}\", \"public\"", TEMPLATE_SCHEMA)
        );
        assert_eq!(
            SearchPath::public_only("shared").to_sql(),
            "SET search_path TO \"shared\""
        );
    }

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
    }
}
