//! Active schema context.
//!
//! A [`SchemaSession`] owns one connection and remembers which schema its
//! search path points at. There is no ambient state: callers hold the session
//! and pass it to whatever needs to run queries.
//!
//! ```text
//!            activate(name)               activate(other)
//!   None ─────────────────────▶ Tenant ─────────────────────▶ Tenant
//!    ▲                            │
//!    └──────── deactivate() ──────┘
//! ```
//!
//! The template is reachable only from the fan-out engine, never through
//! [`SchemaSession::activate`].

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::TenancyConfig;
use crate::connection::{SchemaConnection, SearchPath};
use crate::error::{TenancyError, TenancyResult};
use crate::events::{NoEvents, SchemaEvents};
use crate::identifier::{SchemaName, SchemaRef};
use crate::registry::{SchemaRegistry, SchemaStore};
use crate::schema::Schema;

/// What a connection's search path currently points at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ActiveSchema {
    /// Only the public schema is visible.
    #[default]
    None,
    /// The template, during fan-out.
    Template,
    /// A tenant schema.
    Tenant(SchemaName),
}

impl ActiveSchema {
    /// The tenant identifier, if a tenant is active.
    pub fn tenant(&self) -> Option<&SchemaName> {
        match self {
            Self::Tenant(name) => Some(name),
            _ => None,
        }
    }

    /// Check if nothing is active.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// The active schema as a search path target.
    pub fn as_schema_ref(&self) -> Option<SchemaRef> {
        match self {
            Self::None => None,
            Self::Template => Some(SchemaRef::Template),
            Self::Tenant(name) => Some(SchemaRef::Tenant(name.clone())),
        }
    }
}

impl From<SchemaRef> for ActiveSchema {
    fn from(schema: SchemaRef) -> Self {
        match schema {
            SchemaRef::Template => Self::Template,
            SchemaRef::Tenant(name) => Self::Tenant(name),
        }
    }
}

impl From<Option<SchemaRef>> for ActiveSchema {
    fn from(schema: Option<SchemaRef>) -> Self {
        schema.map(Self::from).unwrap_or_default()
    }
}

impl fmt::Display for ActiveSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("<none>"),
            Self::Template => f.write_str(crate::identifier::TEMPLATE_SCHEMA),
            Self::Tenant(name) => f.write_str(name.as_str()),
        }
    }
}

/// A connection together with its active schema.
pub struct SchemaSession<C> {
    conn: C,
    active: ActiveSchema,
    public_schema: String,
    events: Arc<dyn SchemaEvents>,
    log_changes: bool,
}

impl<C: SchemaConnection> SchemaSession<C> {
    /// Wrap a connection. Its search path is assumed to be reset.
    pub fn new(conn: C, config: &TenancyConfig) -> Self {
        Self {
            conn,
            active: ActiveSchema::None,
            public_schema: config.public_schema.clone(),
            events: Arc::new(NoEvents),
            log_changes: config.log_schema_changes,
        }
    }

    /// Notify the given hooks on every search path change.
    pub fn with_events(mut self, events: Arc<dyn SchemaEvents>) -> Self {
        self.events = events;
        self
    }

    /// Point the connection at a tenant schema.
    ///
    /// The template is refused. Existence is not checked here; selection
    /// already authorized the name against the registry.
    pub async fn activate(&mut self, name: &str) -> TenancyResult<()> {
        match SchemaRef::parse(name)? {
            SchemaRef::Template => Err(TenancyError::template_activation()),
            SchemaRef::Tenant(name) => self.switch(ActiveSchema::Tenant(name)).await,
        }
    }

    /// Point the connection at a loaded schema.
    pub async fn activate_schema(&mut self, schema: &Schema) -> TenancyResult<()> {
        self.switch(ActiveSchema::Tenant(schema.name.clone())).await
    }

    /// Reset the search path to the public schema.
    ///
    /// Always issues the reset, so calling it on an inactive session is safe.
    pub async fn deactivate(&mut self) -> TenancyResult<()> {
        self.switch(ActiveSchema::None).await
    }

    /// The active schema.
    pub fn current(&self) -> &ActiveSchema {
        &self.active
    }

    /// The active tenant resolved against the registry.
    pub async fn current_schema<S: SchemaStore>(
        &self,
        registry: &SchemaRegistry<S>,
    ) -> TenancyResult<Option<Schema>> {
        match self.active.tenant() {
            Some(name) => registry.find(name.as_str()).await,
            None => Ok(None),
        }
    }

    /// The wrapped connection.
    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Name of the shared schema.
    pub fn public_schema(&self) -> &str {
        &self.public_schema
    }

    /// Reset the search path and hand the connection back.
    pub async fn release(mut self) -> TenancyResult<C> {
        self.deactivate().await?;
        Ok(self.conn)
    }

    pub(crate) async fn switch(&mut self, target: ActiveSchema) -> TenancyResult<()> {
        let path = match target.as_schema_ref() {
            Some(schema) => SearchPath::for_schema(&schema, &self.public_schema),
            None => SearchPath::public_only(&self.public_schema),
        };
        self.conn
            .set_search_path(&path)
            .await
            .map_err(|e| e.with_operation("setting search_path"))?;

        if self.log_changes {
            info!(from = %self.active, to = %target, "Active schema changed");
        } else {
            debug!(from = %self.active, to = %target, "Active schema changed");
        }
        self.active = target;
        self.events.schema_activated(&self.active).await;
        Ok(())
    }
}

impl<C> fmt::Debug for SchemaSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaSession")
            .field("active", &self.active)
            .field("public_schema", &self.public_schema)
            .finish_non_exhaustive()
    }
}
