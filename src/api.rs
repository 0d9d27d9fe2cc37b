use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi as UtoipaOpenApi;
use uuid::Uuid;

use crate::errors::{ErrorBody, GatewayError, GatewayResult};
use crate::gateway::{self, GatewayState};
use crate::models::{
    ConnectResponse, ConnectionSummary, HealthResponse, LoginRequest, LoginResponse, Protocol,
    RefreshResponse, SpiceRendering, StatsResponse, VmConnectionCount, VmInfo, VmType,
};
use crate::session::Session;
use crate::token::Grant;

#[derive(Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// Peer address when the server was started with connect-info, `None`
/// otherwise (router-level tests drive the service without it).
struct ClientAddr(Option<SocketAddr>);

impl<S> FromRequestParts<S> for ClientAddr
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientAddr(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

#[derive(UtoipaOpenApi)]
#[openapi(
    paths(health, login, logout, refresh, list_vms, connect_vnc, connect_spice, stats),
    components(schemas(
        LoginRequest,
        LoginResponse,
        RefreshResponse,
        VmInfo,
        VmType,
        Protocol,
        SpiceRendering,
        ConnectResponse,
        StatsResponse,
        VmConnectionCount,
        ConnectionSummary,
        HealthResponse,
        ErrorBody
    )),
    tags((name = "gateway", description = "Console gateway REST surface"))
)]
pub struct ApiDoc;

pub fn build_router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE, AUTHORIZATION])
        .allow_origin(axum::http::HeaderValue::from_static("*"));

    Router::new()
        .route("/health", get(health))
        .route("/openapi.json", get(openapi))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/refresh", post(refresh))
        .route("/api/vms", get(list_vms))
        .route("/api/vnc/connect/{id}", post(connect_vnc))
        .route("/api/spice/connect/{id}", post(connect_spice))
        .route("/api/stats", get(stats))
        .route("/vnc/{id}", get(vnc_ws))
        .route("/spice/{id}", get(spice_ws))
        .fallback(fallback)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Gateway is alive", body = HealthResponse))
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn require_bearer(headers: &HeaderMap) -> GatewayResult<String> {
    bearer_from_headers(headers).ok_or(GatewayError::MissingToken)
}

/// Resolve the Authorization header to a live session. Display bearers are
/// not valid on the management surface.
fn require_session(state: &GatewayState, headers: &HeaderMap) -> GatewayResult<Arc<Session>> {
    let bearer = require_bearer(headers)?;
    match state.tokens.verify(&bearer)? {
        Grant::UserSession { session_id, .. } => state
            .sessions
            .get(&session_id)
            .ok_or(GatewayError::SessionExpired),
        Grant::Display { .. } => Err(GatewayError::Forbidden),
    }
}

#[utoipa::path(
    post,
    path = "/api/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated", body = LoginResponse),
        (status = 401, description = "Rejected by the management service", body = ErrorBody)
    )
)]
async fn login(
    State(state): State<GatewayState>,
    Json(request): Json<LoginRequest>,
) -> GatewayResult<Json<LoginResponse>> {
    let data = state.api.login(&request.username, &request.password).await?;
    let session_id = Uuid::new_v4().to_string();
    state.sessions.put(Session::new(
        session_id.clone(),
        request.username.clone(),
        data.token,
        data.vms.clone(),
    ));
    let token = state.tokens.issue_user(
        &session_id,
        &request.username,
        state.config.user_token_ttl,
    )?;
    tracing::info!(user = %request.username, vms = data.vms.len(), "login succeeded");
    Ok(Json(LoginResponse {
        token,
        vms: data.vms,
    }))
}

#[utoipa::path(
    post,
    path = "/api/logout",
    responses(
        (status = 204, description = "Session destroyed"),
        (status = 401, description = "Missing or invalid bearer", body = ErrorBody)
    )
)]
async fn logout(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> GatewayResult<StatusCode> {
    let bearer = require_bearer(&headers)?;
    match state.tokens.verify(&bearer)? {
        Grant::UserSession { session_id, .. } => {
            state.sessions.remove(&session_id);
            Ok(StatusCode::NO_CONTENT)
        }
        Grant::Display { .. } => Err(GatewayError::Forbidden),
    }
}

#[utoipa::path(
    post,
    path = "/api/refresh",
    responses(
        (status = 200, description = "New bearer for the same login state", body = RefreshResponse),
        (status = 401, description = "Session gone; log in again", body = ErrorBody)
    )
)]
async fn refresh(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> GatewayResult<Json<RefreshResponse>> {
    let bearer = require_bearer(&headers)?;
    let (session_id, user_id) = match state.tokens.verify(&bearer)? {
        Grant::UserSession {
            session_id,
            user_id,
        } => (session_id, user_id),
        Grant::Display { .. } => return Err(GatewayError::Forbidden),
    };
    let new_id = Uuid::new_v4().to_string();
    let session = state
        .sessions
        .replace(&session_id, &new_id)
        .await
        .ok_or(GatewayError::SessionExpired)?;
    let token = state
        .tokens
        .issue_user(&new_id, &user_id, state.config.user_token_ttl)?;
    Ok(Json(RefreshResponse {
        token,
        vms: session.vms.clone(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/vms",
    responses(
        (status = 200, description = "VM inventory of the session", body = [VmInfo]),
        (status = 401, description = "Missing or invalid bearer", body = ErrorBody)
    )
)]
async fn list_vms(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> GatewayResult<Json<Vec<VmInfo>>> {
    let session = require_session(&state, &headers)?;
    Ok(Json(session.vms.clone()))
}

async fn connect_info(
    state: &GatewayState,
    headers: &HeaderMap,
    vm_id: &str,
    protocol: Protocol,
    rendering: SpiceRendering,
) -> GatewayResult<Json<ConnectResponse>> {
    let bearer = require_bearer(headers)?;
    let grant = state.tokens.verify(&bearer)?;
    let target = state
        .resolver
        .resolve(&grant, vm_id, protocol, &rendering)
        .await?;
    let upstream_token = match &grant {
        Grant::UserSession { session_id, .. } => state
            .sessions
            .get(session_id)
            .ok_or(GatewayError::SessionExpired)?
            .upstream_token
            .clone(),
        Grant::Display { upstream_token, .. } => upstream_token.clone(),
    };
    let token = state
        .tokens
        .issue_display(vm_id, &upstream_token, state.config.display_token_ttl)?;
    Ok(Json(ConnectResponse {
        host: target.host,
        port: target.port,
        password: target.password,
        token,
        ws_path: format!("/{}/{}", protocol.as_str(), vm_id),
    }))
}

#[utoipa::path(
    post,
    path = "/api/vnc/connect/{id}",
    params(("id" = String, Path, description = "VM identifier")),
    responses(
        (status = 200, description = "VNC connection parameters", body = ConnectResponse),
        (status = 401, description = "Missing or invalid bearer", body = ErrorBody),
        (status = 502, description = "Management service failure", body = ErrorBody)
    )
)]
async fn connect_vnc(
    State(state): State<GatewayState>,
    Path(vm_id): Path<String>,
    headers: HeaderMap,
) -> GatewayResult<Json<ConnectResponse>> {
    connect_info(
        &state,
        &headers,
        &vm_id,
        Protocol::Vnc,
        SpiceRendering::default(),
    )
    .await
}

#[utoipa::path(
    post,
    path = "/api/spice/connect/{id}",
    params(("id" = String, Path, description = "VM identifier")),
    request_body(content = SpiceRendering, description = "Optional rendering preferences"),
    responses(
        (status = 200, description = "SPICE connection parameters", body = ConnectResponse),
        (status = 401, description = "Missing or invalid bearer", body = ErrorBody),
        (status = 502, description = "Management service failure", body = ErrorBody)
    )
)]
async fn connect_spice(
    State(state): State<GatewayState>,
    Path(vm_id): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> GatewayResult<Json<ConnectResponse>> {
    // Rendering preferences are optional; an absent or unparseable body just
    // means defaults.
    let rendering = if body.is_empty() {
        SpiceRendering::default()
    } else {
        serde_json::from_slice(&body).unwrap_or_default()
    };
    connect_info(&state, &headers, &vm_id, Protocol::Spice, rendering).await
}

#[utoipa::path(
    get,
    path = "/api/stats",
    responses((status = 200, description = "Active connection statistics", body = StatsResponse))
)]
async fn stats(State(state): State<GatewayState>) -> Json<StatsResponse> {
    Json(state.registry.snapshot())
}

/// Pick the subprotocol to accept: `binary` when offered (what noVNC sends),
/// otherwise the first one the client proposed.
fn negotiate_subprotocol(ws: WebSocketUpgrade, headers: &HeaderMap) -> WebSocketUpgrade {
    let offered = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let mut names = offered
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty());
    let choice = if offered
        .split(',')
        .map(str::trim)
        .any(|name| name.eq_ignore_ascii_case("binary"))
    {
        Some("binary".to_string())
    } else {
        names.next().map(str::to_string)
    };
    match choice {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    }
}

async fn proxy_upgrade(
    state: GatewayState,
    vm_id: String,
    protocol: Protocol,
    params: WsParams,
    headers: HeaderMap,
    client: Option<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let bearer = params.token.or_else(|| bearer_from_headers(&headers));
    let ws = negotiate_subprotocol(ws, &headers);
    ws.on_upgrade(move |socket| {
        gateway::handle_connection(state, socket, protocol, vm_id, bearer, client)
    })
}

async fn vnc_ws(
    State(state): State<GatewayState>,
    Path(vm_id): Path<String>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ClientAddr(client): ClientAddr,
    ws: WebSocketUpgrade,
) -> Response {
    proxy_upgrade(state, vm_id, Protocol::Vnc, params, headers, client, ws).await
}

async fn spice_ws(
    State(state): State<GatewayState>,
    Path(vm_id): Path<String>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ClientAddr(client): ClientAddr,
    ws: WebSocketUpgrade,
) -> Response {
    proxy_upgrade(state, vm_id, Protocol::Spice, params, headers, client, ws).await
}

/// Upgrade requests outside the two proxy routes complete the handshake and
/// are then closed with 1002 so SDKs see a deterministic code instead of an
/// HTTP error they cannot observe. Plain requests get a 404.
async fn fallback(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    uri: Uri,
) -> Response {
    let path = uri.path().to_string();
    match ws {
        Ok(ws) => ws.on_upgrade(move |mut socket| async move {
            gateway::refuse(&mut socket, &GatewayError::InvalidPath(path)).await;
        }),
        Err(_) => GatewayError::InvalidPath(path).into_response(),
    }
}
