//! HTTP surface for service requests.
//!
//! Routes:
//! - `GET  /service-requests`
//! - `POST /service-requests`
//! - `GET  /service-requests/{id}/comments`
//! - `GET  /events` (server-sent updates for the caller's tenant)
//! - `GET  /health`

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, FromRequestParts, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, request::Parts},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use futures::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use ulid::Ulid;

use crate::auth::TenantContext;
use crate::model::{Comment, ServiceRequest};
use crate::notify::NotifyHub;
use crate::orchestrator::{FieldError, Orchestrator, RequestError, Served, ValidationError};
use crate::store::StoreKind;

/// Set to `fallback` on responses served by the degraded store.
pub const STORE_HEADER: &str = "x-bookline-store";

/// Shared state for axum request handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub tenant_context: Arc<dyn TenantContext>,
    /// Source of `/events`; the orchestrator publishes into it.
    pub hub: Arc<NotifyHub>,
    /// Key rate limits on `x-forwarded-for` instead of the peer address.
    /// Only safe behind a proxy that overwrites the header.
    pub trust_forwarded: bool,
}

impl AppState {
    /// Wires a fresh hub in as the orchestrator's broadcaster.
    pub fn new(
        orchestrator: Orchestrator,
        tenant_context: Arc<dyn TenantContext>,
        trust_forwarded: bool,
    ) -> Self {
        let hub = Arc::new(NotifyHub::new());
        Self {
            orchestrator: Arc::new(orchestrator.with_broadcaster(hub.clone())),
            tenant_context,
            hub,
            trust_forwarded,
        }
    }
}

/// Address a request is rate limited under: the peer IP, or the first
/// `x-forwarded-for` hop when the deployment trusts its proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddr(pub String);

fn first_forwarded_hop(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl FromRequestParts<AppState> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if state.trust_forwarded
            && let Some(addr) = first_forwarded_hop(&parts.headers)
        {
            return Ok(ClientAddr(addr.to_string()));
        }
        if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(ClientAddr(peer.ip().to_string()));
        }
        Ok(ClientAddr("unknown".into()))
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting_booking_id: Option<Ulid>,
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let mut body = ErrorResponse {
            error: self.to_string(),
            code: self.code(),
            fields: Vec::new(),
            reason: None,
            conflicting_booking_id: None,
        };
        match self {
            RequestError::Validation(e) => body.fields = e.errors,
            RequestError::Conflict {
                reason,
                conflicting_booking_id,
            } => {
                body.reason = Some(reason);
                body.conflicting_booking_id = Some(conflicting_booking_id);
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

/// Response body for GET /service-requests.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub items: Vec<ServiceRequest>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
    pub total_pages: usize,
}

/// Response body for GET /health.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub primary_store: &'static str,
}

fn served<T: Serialize>(status: StatusCode, served: Served<T>) -> Response {
    let mut response = (status, Json(served.value)).into_response();
    if served.store == StoreKind::Fallback {
        response
            .headers_mut()
            .insert(STORE_HEADER, HeaderValue::from_static(StoreKind::Fallback.label()));
    }
    response
}

/// GET /service-requests
pub async fn list_requests(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, RequestError> {
    let ctx = state.tenant_context.resolve(&headers);
    let page = state.orchestrator.list(ctx.as_ref(), &params).await?;
    let total_pages = page.value.total_pages();
    let Served { value, store } = page;
    let body = ListResponse {
        items: value.items,
        total: value.total,
        page: value.page,
        limit: value.limit,
        total_pages,
    };
    Ok(served(StatusCode::OK, Served { value: body, store }))
}

/// POST /service-requests
///
/// The body is read raw so malformed JSON is reported like any other
/// validation failure.
pub async fn create_request(
    State(state): State<AppState>,
    ClientAddr(addr): ClientAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RequestError> {
    let ctx = state.tenant_context.resolve(&headers);
    let created = state.orchestrator.create(ctx.as_ref(), &addr, &body).await?;
    Ok(served(StatusCode::CREATED, created))
}

/// GET /service-requests/{id}/comments
pub async fn list_comments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, RequestError> {
    let id = Ulid::from_string(&id)
        .map_err(|_| RequestError::Validation(ValidationError::single("id", "must be a ULID")))?;
    let ctx = state.tenant_context.resolve(&headers);
    let comments: Served<Vec<Comment>> = state.orchestrator.comments(ctx.as_ref(), id).await?;
    Ok(served(StatusCode::OK, comments))
}

/// GET /events
///
/// Streams the caller's tenant updates. A subscriber that falls behind skips
/// the updates it missed.
pub async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, RequestError> {
    let ctx = state.tenant_context.resolve(&headers);
    let ctx = state.orchestrator.authorize_read(ctx.as_ref())?;
    let tenant = ctx.tenant_id.clone();
    let rx = state.hub.subscribe(&tenant);
    tracing::debug!(tenant = %tenant, "event subscriber attached");

    let stream = stream::unfold(rx, move |mut rx| {
        let tenant = tenant.clone();
        async move {
            loop {
                match rx.recv().await {
                    Ok(update) => match Event::default().event(update.name()).json_data(&update) {
                        Ok(event) => return Some((Ok(event), rx)),
                        Err(e) => tracing::warn!(tenant = %tenant, error = %e, "update not encodable"),
                    },
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(tenant = %tenant, missed, "event subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let primary_store = if state.orchestrator.primary_available() {
        "available"
    } else {
        "unavailable"
    };
    Json(HealthResponse {
        status: "ok",
        primary_store,
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/service-requests", get(list_requests).post(create_request))
        .route("/service-requests/{id}/comments", get(list_comments))
        .route("/events", get(events))
        .route("/health", get(health))
        .with_state(state)
}
