//! Lifecycle hooks.

use async_trait::async_trait;

use crate::context::ActiveSchema;
use crate::error::TenancyResult;
use crate::identifier::SchemaName;
use crate::schema::Schema;
use crate::selection::Principal;

/// Receives schema lifecycle notifications.
///
/// All methods default to no-ops.
#[async_trait]
pub trait SchemaEvents: Send + Sync {
    /// A schema was cloned and registered.
    async fn schema_created(&self, _schema: &Schema) {}

    /// A schema was dropped and unregistered.
    async fn schema_deleted(&self, _name: &SchemaName) {}

    /// A connection's search path changed, including resets.
    async fn schema_activated(&self, _active: &ActiveSchema) {}

    /// A principal is about to store a selection. `None` means deselect.
    ///
    /// Returning an error vetoes the change; the error reaches the client.
    async fn session_changing(
        &self,
        _principal: &Principal,
        _schema: Option<&Schema>,
    ) -> TenancyResult<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvents;

impl SchemaEvents for NoEvents {}
