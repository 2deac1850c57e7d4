//! PostgreSQL connection wrapper.

use async_trait::async_trait;
use deadpool_postgres::Object;
use tenantry_core::{Catalog, SchemaConnection, TenancyResult};
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;
use tracing::debug;

use crate::error::PgError;

const INDEX_OWNER_SQL: &str =
    "SELECT tablename::text FROM pg_catalog.pg_indexes WHERE schemaname = $1 AND indexname = $2";

/// A pooled connection. Dropping it returns it to the pool, where the
/// recycle step resets its search path.
pub struct PgConnection {
    client: Object,
}

impl PgConnection {
    pub(crate) fn new(client: Object) -> Self {
        Self { client }
    }

    /// The underlying pooled client.
    pub fn client(&self) -> &Object {
        &self.client
    }

    /// Mutable access, for opening client-side transactions.
    pub fn client_mut(&mut self) -> &mut Object {
        &mut self.client
    }

    /// Execute a query and return all rows.
    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> TenancyResult<Vec<Row>> {
        debug!(sql = %sql, "Executing query");
        let rows = self.client.query(sql, params).await.map_err(PgError::from)?;
        Ok(rows)
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> TenancyResult<u64> {
        debug!(sql = %sql, "Executing statement");
        let count = self.client.execute(sql, params).await.map_err(PgError::from)?;
        Ok(count)
    }
}

#[async_trait]
impl Catalog for PgConnection {
    async fn index_owner(&self, index: &str, schemas: &[&str]) -> TenancyResult<Option<String>> {
        for schema in schemas {
            let row = self
                .client
                .query_opt(INDEX_OWNER_SQL, &[schema, &index])
                .await
                .map_err(PgError::from)?;
            if let Some(row) = row {
                return Ok(Some(row.get(0)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl SchemaConnection for PgConnection {
    async fn batch_execute(&self, sql: &str) -> TenancyResult<()> {
        debug!(sql = %sql, "Executing batch");
        self.client.batch_execute(sql).await.map_err(PgError::from)?;
        Ok(())
    }
}
