//! Registry storage in the public schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tenantry_core::{
    Schema, SchemaName, SchemaRef, SchemaStore, TenancyResult, UserId, quote_ident,
    tables::{SCHEMA_TABLE, SCHEMA_USERS_TABLE},
};
use tokio_postgres::Row;
use tracing::debug;

use crate::error::PgError;
use crate::pool::PgPool;

/// [`SchemaStore`] over the registry tables created by
/// [`bootstrap`](crate::bootstrap::bootstrap).
///
/// Creation and deletion run in one transaction each, so the registry row and
/// the physical schema appear and disappear together.
#[derive(Clone)]
pub struct PgSchemaStore {
    pool: PgPool,
    schema_table: String,
    users_table: String,
    clone_function: String,
}

impl PgSchemaStore {
    /// Create a store using the pool's public schema.
    pub fn new(pool: PgPool) -> Self {
        let public = quote_ident(&pool.tenancy().public_schema);
        Self {
            schema_table: format!("{}.{}", public, quote_ident(SCHEMA_TABLE)),
            users_table: format!("{}.{}", public, quote_ident(SCHEMA_USERS_TABLE)),
            clone_function: format!("{}.clone_schema", public),
            pool,
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn select_sql(&self, filter: &str) -> String {
        format!(
            "SELECT s.name::text, s.display_name::text, s.is_active, s.created_at, \
             ARRAY(SELECT u.user_id FROM {users} u \
                   WHERE u.schema_name = s.name ORDER BY u.user_id) \
             FROM {schemas} s {filter} ORDER BY s.created_at, s.name",
            users = self.users_table,
            schemas = self.schema_table,
            filter = filter,
        )
    }

    async fn fetch(
        &self,
        filter: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> TenancyResult<Vec<Schema>> {
        let conn = self.pool.get().await?;
        let rows = conn.query(&self.select_sql(filter), params).await?;
        rows.iter().map(schema_from_row).collect()
    }
}

fn schema_from_row(row: &Row) -> TenancyResult<Schema> {
    let name: String = row.get(0);
    let display_name: String = row.get(1);
    let is_active: bool = row.get(2);
    let created_at: DateTime<Utc> = row.get(3);
    let users: Vec<UserId> = row.get(4);
    Ok(Schema::restore(
        SchemaName::parse(name)?,
        display_name,
        is_active,
        users,
        created_at,
    ))
}

#[async_trait]
impl SchemaStore for PgSchemaStore {
    async fn create(&self, schema: &Schema, source: &SchemaRef) -> TenancyResult<()> {
        let mut conn = self.pool.get().await?;
        let tx = conn.client_mut().transaction().await.map_err(PgError::from)?;

        tx.execute(
            &format!(
                "INSERT INTO {} (name, display_name, is_active, created_at) \
                 VALUES ($1, $2, $3, $4)",
                self.schema_table
            ),
            &[
                &schema.name.as_str(),
                &schema.display_name,
                &schema.is_active,
                &schema.created_at,
            ],
        )
        .await
        .map_err(PgError::from)?;

        let insert_user = format!(
            "INSERT INTO {} (schema_name, user_id) VALUES ($1, $2)",
            self.users_table
        );
        for user in &schema.users {
            tx.execute(&insert_user, &[&schema.name.as_str(), user])
                .await
                .map_err(PgError::from)?;
        }

        debug!(source = %source, target = %schema.name, "Cloning schema");
        tx.execute(
            &format!("SELECT {}($1, $2)", self.clone_function),
            &[&source.as_str(), &schema.name.as_str()],
        )
        .await
        .map_err(PgError::from)?;

        tx.commit().await.map_err(PgError::from)?;
        Ok(())
    }

    async fn update(&self, schema: &Schema) -> TenancyResult<()> {
        let mut conn = self.pool.get().await?;
        let tx = conn.client_mut().transaction().await.map_err(PgError::from)?;

        tx.execute(
            &format!(
                "UPDATE {} SET display_name = $2, is_active = $3 WHERE name = $1",
                self.schema_table
            ),
            &[&schema.name.as_str(), &schema.display_name, &schema.is_active],
        )
        .await
        .map_err(PgError::from)?;

        let users: Vec<UserId> = schema.users.iter().copied().collect();
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE schema_name = $1 AND NOT (user_id = ANY($2))",
                self.users_table
            ),
            &[&schema.name.as_str(), &users],
        )
        .await
        .map_err(PgError::from)?;
        tx.execute(
            &format!(
                "INSERT INTO {} (schema_name, user_id) SELECT $1, unnest($2::bigint[]) \
                 ON CONFLICT DO NOTHING",
                self.users_table
            ),
            &[&schema.name.as_str(), &users],
        )
        .await
        .map_err(PgError::from)?;

        tx.commit().await.map_err(PgError::from)?;
        Ok(())
    }

    async fn delete(&self, name: &SchemaName) -> TenancyResult<()> {
        let mut conn = self.pool.get().await?;
        let tx = conn.client_mut().transaction().await.map_err(PgError::from)?;

        tx.execute(
            &format!("DELETE FROM {} WHERE name = $1", self.schema_table),
            &[&name.as_str()],
        )
        .await
        .map_err(PgError::from)?;
        tx.batch_execute(&format!("DROP SCHEMA {} CASCADE", quote_ident(name.as_str())))
            .await
            .map_err(PgError::from)?;

        tx.commit().await.map_err(PgError::from)?;
        Ok(())
    }

    async fn get(&self, name: &str) -> TenancyResult<Option<Schema>> {
        Ok(self.fetch("WHERE s.name = $1", &[&name]).await?.into_iter().next())
    }

    async fn find_by_display_name(&self, display_name: &str) -> TenancyResult<Option<Schema>> {
        Ok(self
            .fetch("WHERE s.display_name = $1", &[&display_name])
            .await?
            .into_iter()
            .next())
    }

    async fn list(&self) -> TenancyResult<Vec<Schema>> {
        self.fetch("", &[]).await
    }

    async fn list_for_user(&self, user: UserId) -> TenancyResult<Vec<Schema>> {
        let filter = format!(
            "WHERE EXISTS (SELECT 1 FROM {} m WHERE m.schema_name = s.name AND m.user_id = $1)",
            self.users_table
        );
        self.fetch(&filter, &[&user]).await
    }

    async fn schema_exists(&self, name: &str) -> TenancyResult<bool> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT 1 FROM information_schema.schemata WHERE schema_name = $1",
                &[&name],
            )
            .await?;
        Ok(!rows.is_empty())
    }
}
