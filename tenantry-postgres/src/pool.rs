//! Connection pool for PostgreSQL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tenantry_core::{ConnectionSource, SchemaSession, SearchPath, TenancyConfig, TenancyResult};
use tokio_postgres::NoTls;
use tracing::{debug, info};

use crate::config::PgConfig;
use crate::connection::PgConnection;
use crate::error::{PgError, PgResult};

/// A connection pool whose connections never carry a tenant search path
/// back into the pool.
#[derive(Clone)]
pub struct PgPool {
    inner: Pool,
    config: Arc<PgConfig>,
    tenancy: Arc<TenancyConfig>,
}

impl PgPool {
    /// Create a pool with default sizing.
    pub fn new(config: PgConfig, tenancy: TenancyConfig) -> PgResult<Self> {
        let pool_config = PoolConfig {
            max_connections: tenancy.database.max_connections,
            ..PoolConfig::default()
        };
        Self::with_pool_config(config, tenancy, pool_config)
    }

    /// Create a pool with custom sizing.
    pub fn with_pool_config(
        config: PgConfig,
        tenancy: TenancyConfig,
        pool_config: PoolConfig,
    ) -> PgResult<Self> {
        let reset = SearchPath::public_only(&tenancy.public_schema).to_sql();
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Custom(reset),
        };
        let mgr = Manager::from_config(config.to_pg_config(), NoTls, mgr_config);

        let pool = Pool::builder(mgr)
            .max_size(pool_config.max_connections)
            .wait_timeout(pool_config.connection_timeout)
            .create_timeout(pool_config.connection_timeout)
            .recycle_timeout(pool_config.recycle_timeout)
            .runtime(Runtime::Tokio1)
            .build()?;

        info!(
            host = %config.host,
            port = %config.port,
            database = %config.database,
            max_connections = %pool_config.max_connections,
            "PostgreSQL connection pool created"
        );

        Ok(Self {
            inner: pool,
            config: Arc::new(config),
            tenancy: Arc::new(tenancy),
        })
    }

    /// Create a pool from the `[database]` section of a tenancy configuration.
    pub fn from_tenancy(tenancy: TenancyConfig) -> PgResult<Self> {
        let config = PgConfig::from_tenancy(&tenancy)?;
        Self::new(config, tenancy)
    }

    /// Get a connection from the pool.
    pub async fn get(&self) -> PgResult<PgConnection> {
        debug!("Acquiring connection from pool");
        let client = self.inner.get().await?;
        Ok(PgConnection::new(client))
    }

    /// Get a connection wrapped in a session with nothing active.
    pub async fn session(&self) -> TenancyResult<SchemaSession<PgConnection>> {
        Ok(SchemaSession::new(self.acquire().await?, &self.tenancy))
    }

    /// Get the current pool status.
    pub fn status(&self) -> PoolStatus {
        let status = self.inner.status();
        PoolStatus {
            available: status.available as usize,
            size: status.size as usize,
            max_size: status.max_size as usize,
            waiting: status.waiting as usize,
        }
    }

    /// Connection settings.
    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    /// Tenancy settings the pool was built with.
    pub fn tenancy(&self) -> &TenancyConfig {
        &self.tenancy
    }

    /// Check if a connection can be obtained and answers a query.
    pub async fn is_healthy(&self) -> bool {
        match self.inner.get().await {
            Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
            Err(_) => false,
        }
    }

    /// Close the pool and all connections.
    pub fn close(&self) {
        self.inner.close();
        info!("PostgreSQL connection pool closed");
    }

    /// Create a builder for configuring the pool.
    pub fn builder() -> PgPoolBuilder {
        PgPoolBuilder::new()
    }
}

#[async_trait]
impl ConnectionSource for PgPool {
    type Connection = PgConnection;

    async fn acquire(&self) -> TenancyResult<PgConnection> {
        Ok(self.get().await?)
    }
}

/// Pool status information.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    /// Number of available (idle) connections.
    pub available: usize,
    /// Current total size of the pool.
    pub size: usize,
    /// Maximum size of the pool.
    pub max_size: usize,
    /// Number of tasks waiting for a connection.
    pub waiting: usize,
}

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_connections: usize,
    /// Maximum time to wait for or create a connection.
    pub connection_timeout: Option<Duration>,
    /// Maximum time the search path reset may take on recycle.
    pub recycle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connection_timeout: Some(Duration::from_secs(30)),
            recycle_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Builder for creating a connection pool.
#[derive(Debug, Default)]
pub struct PgPoolBuilder {
    config: Option<PgConfig>,
    url: Option<String>,
    tenancy: TenancyConfig,
    pool_config: PoolConfig,
}

impl PgPoolBuilder {
    /// Create a new pool builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the connection configuration.
    pub fn config(mut self, config: PgConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the tenancy configuration.
    pub fn tenancy(mut self, tenancy: TenancyConfig) -> Self {
        self.tenancy = tenancy;
        self
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, n: usize) -> Self {
        self.pool_config.max_connections = n;
        self
    }

    /// Set the connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.connection_timeout = Some(timeout);
        self
    }

    /// Set the recycle timeout.
    pub fn recycle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.recycle_timeout = Some(timeout);
        self
    }

    /// Build the connection pool. Connections are opened lazily.
    pub fn build(self) -> PgResult<PgPool> {
        let config = match (self.config, self.url, &self.tenancy.database.url) {
            (Some(config), _, _) => config,
            (None, Some(url), _) => PgConfig::from_url(url)?,
            (None, None, Some(url)) => PgConfig::from_url(url.clone())?,
            (None, None, None) => {
                return Err(PgError::config("no database URL or config provided"));
            }
        };
        PgPool::with_pool_config(config, self.tenancy, self.pool_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.recycle_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_builder_requires_url() {
        assert!(matches!(PgPool::builder().build(), Err(PgError::Config(_))));
    }

    #[tokio::test]
    async fn test_builder_is_lazy() {
        let pool = PgPool::builder()
            .url("postgres://localhost:1/never")
            .max_connections(3)
            .build()
            .unwrap();
        let status = pool.status();
        assert_eq!(status.max_size, 3);
        assert_eq!(status.size, 0);
        assert_eq!(pool.tenancy().public_schema, "public");
    }
}
