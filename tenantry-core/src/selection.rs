//! Request schema selection.
//!
//! Decides, once per request, which schema the caller wants and whether they
//! may have it. Requests ask in one of three ways, checked in this order:
//!
//! 1. a path `/__change_schema__/<identifier>/`, answered directly;
//! 2. a query parameter `__schema=<identifier>`, answered on GET with a
//!    redirect to the same URL without the parameter;
//! 3. a header `X-Change-Schema: <identifier>`.
//!
//! With none of these and no stored selection, a user authorized for exactly
//! one selectable schema gets it implicitly. An empty identifier deselects.
//!
//! The chosen identifier lives in a [`SessionStore`]; at the start of each
//! request [`activate_for_request`] points the connection at it.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::SelectionConfig;
use crate::connection::SchemaConnection;
use crate::context::SchemaSession;
use crate::error::{TenancyError, TenancyResult};
use crate::identifier::{SchemaName, TEMPLATE_SCHEMA};
use crate::registry::{SchemaRegistry, SchemaStore};
use crate::schema::{Schema, UserId};

/// An authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct User {
    /// User reference.
    pub id: UserId,
    /// Privileged users may select any schema, active or not.
    pub is_privileged: bool,
}

/// Who is making a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Principal {
    /// Not authenticated.
    #[default]
    Anonymous,
    /// Authenticated.
    User(User),
}

impl Principal {
    /// An unprivileged user.
    pub fn user(id: UserId) -> Self {
        Self::User(User {
            id,
            is_privileged: false,
        })
    }

    /// A privileged user.
    pub fn privileged(id: UserId) -> Self {
        Self::User(User {
            id,
            is_privileged: true,
        })
    }

    /// The user reference, if authenticated.
    pub fn id(&self) -> Option<UserId> {
        match self {
            Self::Anonymous => None,
            Self::User(user) => Some(user.id),
        }
    }

    /// Check if the principal is privileged.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::User(user) if user.is_privileged)
    }
}

/// Session storage holding the selected identifier between requests.
pub trait SessionStore: Send + Sync {
    /// The stored identifier.
    fn selected_schema(&self) -> Option<String>;

    /// Store an identifier.
    fn select_schema(&self, name: &SchemaName);

    /// Forget the stored identifier.
    fn clear_schema(&self);
}

impl<T: SessionStore + ?Sized> SessionStore for Arc<T> {
    fn selected_schema(&self) -> Option<String> {
        (**self).selected_schema()
    }

    fn select_schema(&self, name: &SchemaName) {
        (**self).select_schema(name)
    }

    fn clear_schema(&self) {
        (**self).clear_schema()
    }
}

/// In-process session slot. Clones share the slot.
#[derive(Debug, Clone, Default)]
pub struct MemorySession {
    slot: Arc<Mutex<Option<String>>>,
}

impl MemorySession {
    /// An empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// A session with a stored identifier, which is not validated.
    pub fn with_selection(name: impl Into<String>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(name.into()))),
        }
    }
}

impl SessionStore for MemorySession {
    fn selected_schema(&self) -> Option<String> {
        self.slot.lock().clone()
    }

    fn select_schema(&self, name: &SchemaName) {
        *self.slot.lock() = Some(name.to_string());
    }

    fn clear_schema(&self) {
        *self.slot.lock() = None;
    }
}

/// An explicit request to change the selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRequest {
    /// From the change path.
    Path(String),
    /// From the query string.
    Query(String),
    /// From the header.
    Header(String),
}

impl ChangeRequest {
    /// Requested identifier; empty means deselect.
    pub fn identifier(&self) -> &str {
        match self {
            Self::Path(id) | Self::Query(id) | Self::Header(id) => id,
        }
    }
}

/// Find the highest priority change request.
pub fn find_change_request(
    config: &SelectionConfig,
    path: &str,
    query: Option<&str>,
    header: Option<&str>,
) -> Option<ChangeRequest> {
    // The identifier is the first segment after the prefix.
    let from_path = path
        .strip_prefix(config.change_path_prefix.as_str())
        .and_then(|rest| rest.split('/').next());
    if let Some(id) = from_path {
        return Some(ChangeRequest::Path(id.to_string()));
    }

    let from_query = query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(key, _)| *key == config.query_param)
            .map(|(_, value)| value.into_owned())
    });
    if let Some(id) = from_query {
        return Some(ChangeRequest::Query(id));
    }

    header.map(|id| ChangeRequest::Header(id.trim().to_string()))
}

/// Remove a parameter from a query string, keeping the others in order.
///
/// ```rust
/// use tenantry_core::selection::strip_query_param;
///
/// assert_eq!(strip_query_param("/items", Some("__schema=a&page=2"), "__schema"), "/items?page=2");
/// assert_eq!(strip_query_param("/items", Some("__schema=a"), "__schema"), "/items");
/// ```
pub fn strip_query_param(path: &str, query: Option<&str>, param: &str) -> String {
    let Some(query) = query else {
        return path.to_string();
    };
    let mut kept = url::form_urlencoded::Serializer::new(String::new());
    let mut any = false;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key != param {
            kept.append_pair(&key, &value);
            any = true;
        }
    }
    if any {
        format!("{}?{}", path, kept.finish())
    } else {
        path.to_string()
    }
}

/// The parts of a request selection looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    /// Check if the method is GET.
    pub is_get: bool,
    /// Request path.
    pub path: &'a str,
    /// Raw query string.
    pub query: Option<&'a str>,
    /// Value of the change header.
    pub header: Option<&'a str>,
}

/// What the request pipeline should do after selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    /// Answer the change path directly. `None` means deselected.
    Respond(Option<SchemaName>),
    /// Redirect a GET to this location.
    Redirect(String),
    /// Run the handler.
    Continue,
}

/// Applies the selection rules against the registry.
pub struct SchemaSelector<S> {
    registry: Arc<SchemaRegistry<S>>,
    config: SelectionConfig,
}

impl<S> Clone for SchemaSelector<S> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: SchemaStore> SchemaSelector<S> {
    /// Create a selector.
    pub fn new(registry: Arc<SchemaRegistry<S>>, config: SelectionConfig) -> Self {
        Self { registry, config }
    }

    /// Selection settings.
    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// The registry.
    pub fn registry(&self) -> &Arc<SchemaRegistry<S>> {
        &self.registry
    }

    /// Resolve and store the request's selection.
    ///
    /// Errors are selection failures to be answered with 403.
    pub async fn select(
        &self,
        request: &RequestInfo<'_>,
        principal: &Principal,
        store: &dyn SessionStore,
    ) -> TenancyResult<SelectionOutcome> {
        let change =
            find_change_request(&self.config, request.path, request.query, request.header);

        match change {
            Some(ChangeRequest::Path(id)) => {
                let selected = self.change_schema(principal, &id, store).await?;
                Ok(SelectionOutcome::Respond(selected))
            }
            Some(ChangeRequest::Query(id)) => {
                self.change_schema(principal, &id, store).await?;
                if request.is_get {
                    Ok(SelectionOutcome::Redirect(strip_query_param(
                        request.path,
                        request.query,
                        &self.config.query_param,
                    )))
                } else {
                    Ok(SelectionOutcome::Continue)
                }
            }
            Some(ChangeRequest::Header(id)) => {
                self.change_schema(principal, &id, store).await?;
                Ok(SelectionOutcome::Continue)
            }
            None => {
                if store.selected_schema().is_none() {
                    self.select_implicit(principal, store).await?;
                }
                Ok(SelectionOutcome::Continue)
            }
        }
    }

    /// Authorize and store an explicit selection.
    ///
    /// An empty identifier deselects. Refusing the template or an anonymous
    /// principal also clears the stored selection; other refusals keep it.
    pub async fn change_schema(
        &self,
        principal: &Principal,
        identifier: &str,
        store: &dyn SessionStore,
    ) -> TenancyResult<Option<SchemaName>> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            self.registry.events().session_changing(principal, None).await?;
            store.clear_schema();
            debug!("Schema deselected");
            return Ok(None);
        }

        let Principal::User(user) = principal else {
            store.clear_schema();
            return Err(TenancyError::forbidden(identifier)
                .with_help("Anonymous requests cannot select a schema"));
        };

        if identifier == TEMPLATE_SCHEMA {
            store.clear_schema();
            return Err(TenancyError::template_activation());
        }

        let schema = self
            .registry
            .find(identifier)
            .await?
            .ok_or_else(|| TenancyError::not_found(identifier))?;

        if !user.is_privileged && !schema.admits(user.id) {
            return Err(TenancyError::forbidden(identifier));
        }

        self.store_selection(principal, &schema, store).await?;
        Ok(Some(schema.name))
    }

    /// Select the principal's only selectable schema, if there is exactly one.
    pub async fn select_implicit(
        &self,
        principal: &Principal,
        store: &dyn SessionStore,
    ) -> TenancyResult<Option<SchemaName>> {
        let Principal::User(user) = principal else {
            return Ok(None);
        };

        let mut candidates: Vec<Schema> = self
            .registry
            .schemata_for(user.id)
            .await?
            .into_iter()
            .filter(|schema| schema.is_active || user.is_privileged)
            .collect();
        if candidates.len() != 1 {
            return Ok(None);
        }
        let Some(schema) = candidates.pop() else {
            return Ok(None);
        };

        self.store_selection(principal, &schema, store).await?;
        Ok(Some(schema.name))
    }

    async fn store_selection(
        &self,
        principal: &Principal,
        schema: &Schema,
        store: &dyn SessionStore,
    ) -> TenancyResult<()> {
        self.registry
            .events()
            .session_changing(principal, Some(schema))
            .await?;
        store.select_schema(&schema.name);
        debug!(schema = %schema.name, user = ?principal.id(), "Schema selected");
        Ok(())
    }
}

/// Point the session at the stored selection, or at nothing.
///
/// A stored template or malformed identifier is cleared from the store so the
/// next request does not fail the same way.
pub async fn activate_for_request<C: SchemaConnection>(
    store: &dyn SessionStore,
    session: &mut SchemaSession<C>,
) -> TenancyResult<()> {
    session.deactivate().await?;
    let Some(selected) = store.selected_schema() else {
        return Ok(());
    };
    match session.activate(&selected).await {
        Err(e) if e.is_template_activation() || e.is_validation() => {
            store.clear_schema();
            Err(e)
        }
        result => result,
    }
}

/// Turn a missing relation into "selection required" when nothing is selected.
///
/// Every other error passes through unchanged.
pub fn require_selection(err: TenancyError, store: &dyn SessionStore) -> TenancyError {
    if err.is_undefined_relation() && store.selected_schema().is_none() {
        TenancyError::selection_required().with_source(err)
    } else {
        err
    }
}
