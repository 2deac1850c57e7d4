//! Axum integration for tenantry.
//!
//! [`SchemaLayer`] runs the schema selection protocol on every request, then
//! hands the handler a connection whose search path points at the selected
//! schema.
//!
//! # Request flow
//!
//! 1. The [`Principal`] and the [`SessionStore`] are read from the request
//!    extensions. An authentication layer in front of this one is expected to
//!    put them there; a missing principal is anonymous and a missing store is
//!    replaced by one that lives for the request only.
//! 2. A change request (change path, query parameter or header) is
//!    authorized and stored. Refusals are answered with `403`. The change
//!    path is answered directly and a GET carrying the query parameter is
//!    redirected without it.
//! 3. A connection is acquired and pointed at the stored selection.
//! 4. The handler runs. A [`TenancyRejection`] for a missing relation while
//!    nothing is selected becomes the configured "selection required"
//!    status (`449` by default).
//! 5. The search path is reset before the connection is released.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use axum::{Router, routing::get};
//! use tenantry_axum::{SchemaLayer, TenancyRejection, TenantSession};
//! use tenantry_postgres::{PgConnection, PgPool, PgSchemaStore};
//!
//! async fn orders(session: TenantSession<PgConnection>) -> Result<String, TenancyRejection> {
//!     let session = session.lock().await;
//!     let rows = session.connection().query("SELECT id FROM orders", &[]).await?;
//!     Ok(rows.len().to_string())
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPool::from_tenancy(tenantry_core::TenancyConfig::from_file("tenancy.toml")?)?;
//!     let store = PgSchemaStore::new(pool.clone());
//!     let registry = Arc::new(tenantry_core::SchemaRegistry::new(store));
//!     let tenancy = pool.tenancy().clone();
//!
//!     let app = Router::new()
//!         .route("/orders", get(orders))
//!         .layer(SchemaLayer::new(pool, registry, tenancy));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::{FromRequestParts, Request},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use http::{Method, StatusCode, header, request::Parts};
use tenantry_core::{
    ErrorCode, MemorySession, RequestInfo, SchemaEvents, SelectionConfig, SelectionOutcome,
    activate_for_request, require_selection,
};
use tokio::sync::{Mutex, MutexGuard};
use tower::{Layer, Service};
use tracing::{debug, warn};

pub use tenantry_core::prelude::*;

/// A [`TenancyError`] returned from a handler.
///
/// Answers with [`TenancyError::http_status`]. [`SchemaLayer`] inspects these
/// responses to turn a missing relation into "selection required".
#[derive(Debug)]
pub struct TenancyRejection(pub TenancyError);

impl From<TenancyError> for TenancyRejection {
    fn from(err: TenancyError) -> Self {
        Self(err)
    }
}

/// Marker left on rejection responses.
#[derive(Debug, Clone)]
struct Rejected {
    code: ErrorCode,
    message: String,
}

impl IntoResponse for TenancyRejection {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, self.0.to_string()).into_response();
        response.extensions_mut().insert(Rejected {
            code: self.0.code,
            message: self.0.message,
        });
        response
    }
}

/// The request's connection, pointed at the selected schema.
///
/// Extract it in handlers behind [`SchemaLayer`]. The layer resets the
/// search path once the handler returns.
pub struct TenantSession<C>(Arc<Mutex<SchemaSession<C>>>);

impl<C> Clone for TenantSession<C> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<C> TenantSession<C> {
    fn new(session: SchemaSession<C>) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }

    /// Lock the session for use.
    pub async fn lock(&self) -> MutexGuard<'_, SchemaSession<C>> {
        self.0.lock().await
    }
}

impl<C, St> FromRequestParts<St> for TenantSession<C>
where
    C: Send + 'static,
    St: Send + Sync,
{
    type Rejection = TenancyRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Self>().cloned().ok_or_else(|| {
            TenancyRejection(
                TenancyError::internal("no tenant session on this request")
                    .with_help("Add SchemaLayer to the router"),
            )
        })
    }
}

/// The identifier stored in the request's session, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selected(pub Option<SchemaName>);

impl<St> FromRequestParts<St> for Selected
where
    St: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
        let selected = parts
            .extensions
            .get::<Arc<dyn SessionStore>>()
            .and_then(|store| store.selected_schema())
            .and_then(|name| SchemaName::parse(name).ok());
        Ok(Self(selected))
    }
}

struct Shared<P, S> {
    source: P,
    selector: SchemaSelector<S>,
    tenancy: TenancyConfig,
    events: Arc<dyn SchemaEvents>,
}

/// Tower layer applying schema selection and activation.
pub struct SchemaLayer<P, S> {
    shared: Arc<Shared<P, S>>,
}

impl<P, S> Clone for SchemaLayer<P, S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<P, S> SchemaLayer<P, S>
where
    P: ConnectionSource,
    S: SchemaStore,
{
    /// Create a layer. Selection settings come from `tenancy.selection`;
    /// sessions notify the registry's hooks.
    pub fn new(source: P, registry: Arc<SchemaRegistry<S>>, tenancy: TenancyConfig) -> Self {
        let events = registry.events().clone();
        let selector = SchemaSelector::new(registry, tenancy.selection.clone());
        debug!(header = %tenancy.selection.header, "SchemaLayer created");
        Self {
            shared: Arc::new(Shared {
                source,
                selector,
                tenancy,
                events,
            }),
        }
    }

    /// Selection settings.
    pub fn selection(&self) -> &SelectionConfig {
        self.shared.selector.config()
    }
}

impl<Inner, P, S> Layer<Inner> for SchemaLayer<P, S> {
    type Service = SchemaMiddleware<Inner, P, S>;

    fn layer(&self, inner: Inner) -> Self::Service {
        SchemaMiddleware {
            inner,
            shared: self.shared.clone(),
        }
    }
}

/// Tower service created by [`SchemaLayer`].
pub struct SchemaMiddleware<Inner, P, S> {
    inner: Inner,
    shared: Arc<Shared<P, S>>,
}

impl<Inner: Clone, P, S> Clone for SchemaMiddleware<Inner, P, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<Inner, P, S> Service<Request> for SchemaMiddleware<Inner, P, S>
where
    Inner: Service<Request, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    P: ConnectionSource + 'static,
    S: SchemaStore + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = BoxFuture<'static, Result<Response, Inner::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        // The clone may not be ready; keep the one that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let shared = self.shared.clone();

        Box::pin(async move {
            let principal = request
                .extensions()
                .get::<Principal>()
                .copied()
                .unwrap_or_default();
            let store = request
                .extensions()
                .get::<Arc<dyn SessionStore>>()
                .cloned()
                .unwrap_or_else(ephemeral_session);

            let path = request.uri().path().to_string();
            let query = request.uri().query().map(str::to_string);
            let change_header = request
                .headers()
                .get(shared.selector.config().header.as_str())
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let info = RequestInfo {
                is_get: request.method() == Method::GET,
                path: &path,
                query: query.as_deref(),
                header: change_header.as_deref(),
            };

            match shared.selector.select(&info, &principal, &*store).await {
                Ok(SelectionOutcome::Continue) => {}
                Ok(SelectionOutcome::Respond(selected)) => return Ok(changed(selected)),
                Ok(SelectionOutcome::Redirect(location)) => return Ok(redirect(&location)),
                Err(e) => return Ok(refused(e)),
            }

            let conn = match shared.source.acquire().await {
                Ok(conn) => conn,
                Err(e) => return Ok(TenancyRejection(e).into_response()),
            };
            let mut session =
                SchemaSession::new(conn, &shared.tenancy).with_events(shared.events.clone());
            if let Err(e) = activate_for_request(&*store, &mut session).await {
                return Ok(refused(e));
            }

            let tenant = TenantSession::new(session);
            request.extensions_mut().insert(tenant.clone());
            request.extensions_mut().insert(store.clone());

            let response = inner.call(request).await?;

            let rejected = response.extensions().get::<Rejected>().cloned();
            let response = match rejected {
                Some(rejected) => {
                    let err = require_selection(
                        TenancyError::new(rejected.code, rejected.message),
                        &*store,
                    );
                    if err.code == ErrorCode::SelectionRequired {
                        selection_required(shared.selector.config(), err)
                    } else {
                        response
                    }
                }
                None => response,
            };

            if let Err(e) = tenant.lock().await.deactivate().await {
                warn!(error = %e, "Failed to reset search_path after request");
            }
            Ok(response)
        })
    }
}

fn ephemeral_session() -> Arc<dyn SessionStore> {
    Arc::new(MemorySession::new())
}

fn changed(selected: Option<SchemaName>) -> Response {
    let body = selected.map(SchemaName::into_inner).unwrap_or_default();
    (StatusCode::OK, body).into_response()
}

fn redirect(location: &str) -> Response {
    match Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .body(Body::empty())
    {
        Ok(response) => response,
        Err(e) => TenancyRejection(TenancyError::internal(e.to_string())).into_response(),
    }
}

fn refused(err: TenancyError) -> Response {
    if err.is_forbidden() || err.is_validation() {
        debug!(error = %err, "Schema selection refused");
        (StatusCode::FORBIDDEN, err.to_string()).into_response()
    } else {
        TenancyRejection(err).into_response()
    }
}

fn selection_required(config: &SelectionConfig, err: TenancyError) -> Response {
    let status = StatusCode::from_u16(config.selection_required_status)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.to_string()).into_response()
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use super::{SchemaLayer, SchemaMiddleware, Selected, TenancyRejection, TenantSession};
    pub use tenantry_core::prelude::*;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Extension, Router, routing::get};
    use pretty_assertions::assert_eq;
    use tenantry_core::{MemoryConnection, MemoryDatabase, NewSchema, TEMPLATE_SCHEMA};
    use tower::{ServiceBuilder, ServiceExt};

    async fn orders(session: TenantSession<MemoryConnection>) -> Result<String, TenancyRejection> {
        let session = session.lock().await;
        Ok(session.connection().rows("orders")?.len().to_string())
    }

    async fn selected(Selected(name): Selected) -> String {
        name.map(SchemaName::into_inner).unwrap_or_default()
    }

    struct Fixture {
        db: MemoryDatabase,
        registry: Arc<SchemaRegistry<MemoryDatabase>>,
    }

    async fn fixture() -> Fixture {
        let db = MemoryDatabase::new();
        db.execute_in(TEMPLATE_SCHEMA, "CREATE TABLE orders (id int)")
            .unwrap();
        let registry = Arc::new(SchemaRegistry::new(db.clone()));
        registry.create(NewSchema::new("a").user(1)).await.unwrap();
        registry.create(NewSchema::new("b").user(1)).await.unwrap();
        registry.create(NewSchema::new("c").user(2)).await.unwrap();
        db.execute_in("a", "INSERT INTO orders VALUES (1)").unwrap();
        Fixture { db, registry }
    }

    async fn send(
        fixture: &Fixture,
        principal: Principal,
        store: &Arc<MemorySession>,
        request: Request,
    ) -> Response {
        let router = Router::new()
            .route("/orders", get(orders))
            .route("/selected", get(selected));
        let store: Arc<dyn SessionStore> = store.clone();
        let service = ServiceBuilder::new()
            .layer(Extension(principal))
            .layer(Extension(store))
            .layer(SchemaLayer::new(
                fixture.db.clone(),
                fixture.registry.clone(),
                TenancyConfig::default(),
            ))
            .service(router);
        service.oneshot(request).await.unwrap()
    }

    async fn body(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get_request(uri: &str) -> Request {
        http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn with_header(uri: &str, schema: &str) -> Request {
        http::Request::builder()
            .uri(uri)
            .header("X-Change-Schema", schema)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_header_selects_member_schema() {
        let fixture = fixture().await;
        let store = Arc::new(MemorySession::new());

        let response =
            send(&fixture, Principal::user(1), &store, with_header("/orders", "a")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "1");
        assert_eq!(store.selected_schema().as_deref(), Some("a"));

        let response =
            send(&fixture, Principal::user(1), &store, with_header("/orders", "b")).await;
        assert_eq!(body(response).await, "0");
    }

    #[tokio::test]
    async fn test_header_refuses_non_member() {
        let fixture = fixture().await;
        let store = Arc::new(MemorySession::with_selection("a"));

        let response =
            send(&fixture, Principal::user(1), &store, with_header("/orders", "c")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(store.selected_schema().as_deref(), Some("a"));

        let response =
            send(&fixture, Principal::user(1), &store, with_header("/orders", "nope")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_template_and_anonymous_clear_selection() {
        let fixture = fixture().await;

        let store = Arc::new(MemorySession::with_selection("a"));
        let response = send(
            &fixture,
            Principal::user(1),
            &store,
            with_header("/orders", TEMPLATE_SCHEMA),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(store.selected_schema(), None);

        let store = Arc::new(MemorySession::with_selection("a"));
        let response =
            send(&fixture, Principal::Anonymous, &store, with_header("/orders", "a")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(store.selected_schema(), None);
    }

    #[tokio::test]
    async fn test_missing_selection_maps_to_449() {
        let fixture = fixture().await;
        let store = Arc::new(MemorySession::new());

        let response = send(&fixture, Principal::user(1), &store, get_request("/orders")).await;
        assert_eq!(response.status().as_u16(), 449);
        assert_eq!(store.selected_schema(), None);
    }

    #[tokio::test]
    async fn test_single_membership_selects_implicitly() {
        let fixture = fixture().await;
        let store = Arc::new(MemorySession::new());

        let response = send(&fixture, Principal::user(2), &store, get_request("/orders")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "0");
        assert_eq!(store.selected_schema().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_change_path_answers_directly() {
        let fixture = fixture().await;
        let store = Arc::new(MemorySession::new());

        let response = send(
            &fixture,
            Principal::user(1),
            &store,
            get_request("/__change_schema__/b/"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "b");

        let response = send(&fixture, Principal::user(1), &store, get_request("/selected")).await;
        assert_eq!(body(response).await, "b");

        let response = send(
            &fixture,
            Principal::user(1),
            &store,
            get_request("/__change_schema__//"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "");
        assert_eq!(store.selected_schema(), None);
    }

    #[tokio::test]
    async fn test_query_parameter_redirects_get() {
        let fixture = fixture().await;
        let store = Arc::new(MemorySession::new());

        let response = send(
            &fixture,
            Principal::user(1),
            &store,
            get_request("/orders?__schema=a&page=2"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/orders?page=2"
        );
        assert_eq!(store.selected_schema().as_deref(), Some("a"));

        let request = http::Request::builder()
            .method(Method::POST)
            .uri("/selected?__schema=b")
            .body(Body::empty())
            .unwrap();
        let response = send(&fixture, Principal::user(1), &store, request).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(store.selected_schema().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_search_path_reset_after_request() {
        let fixture = fixture().await;
        let store = Arc::new(MemorySession::with_selection("a"));

        send(&fixture, Principal::user(1), &store, get_request("/orders")).await;
        let statements = fixture.db.statements();
        let last = statements.last().unwrap();
        assert_eq!(last.sql, r#"SET search_path TO "public""#);
    }

    #[tokio::test]
    async fn test_extractor_without_layer() {
        let app = Router::new().route("/orders", get(orders));
        let response = app.oneshot(get_request("/orders")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
