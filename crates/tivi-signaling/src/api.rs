use axum::{
    extract::{ConnectInfo, Path, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER},
        HeaderMap, HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use std::{net::SocketAddr, sync::Arc};
use tivi_proto::api::{
    ApiError, AuthResponse, CredentialsRequest, DeviceEnrollRequest, DeviceEnrollResponse, HealthResponse,
    IceServersResponse,
};
use tivi_proto::validation::{validate_credentials, validate_device_name};
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::{
    accounts::{AccountError, AccountStore, MemoryAccountStore},
    auth::{extract_bearer_token, AuthError, CredentialVerifier, IssueError, JwtAuthority, Principal},
    config::ServerConfig,
    coordinator::Coordinator,
    metrics::SignalingMetrics,
    rate_limit::{RateClass, RateLimited, RateLimiter},
};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub authority: Arc<JwtAuthority>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub accounts: Arc<dyn AccountStore>,
    pub rate_limiter: RateLimiter,
    pub metrics: Arc<SignalingMetrics>,
    pub config: Arc<ServerConfig>,
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    /// Wire up in-memory state for one server instance.
    pub fn new(config: ServerConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let metrics = Arc::new(SignalingMetrics::new()?);
        let authority = Arc::new(JwtAuthority::new(config.jwt_secret.as_bytes(), config.token_ttl()));
        let rate_limiter = RateLimiter::new(config.rate_limit.clone());
        rate_limiter.apply_lists(&config.allowlist, &config.blocklist);

        Ok(Self {
            coordinator: Arc::new(Coordinator::new(Arc::clone(&metrics))),
            verifier: authority.clone(),
            authority,
            accounts: Arc::new(MemoryAccountStore::new()),
            rate_limiter,
            metrics,
            config: Arc::new(config),
            shutdown,
        })
    }
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origin);
    Router::new()
        .route("/api/auth/register", post(register_user))
        .route("/api/auth/login", post(login))
        .route("/api/devices/register", post(enroll_device))
        .route("/api/devices/list/:user_id", get(list_devices))
        .route("/api/ice-servers", get(get_ice_servers))
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .route("/ws", get(crate::ws::ws_handler))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
}

fn cors_layer(origin: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);
    if origin == "*" {
        return cors.allow_origin(Any);
    }
    match HeaderValue::from_str(origin) {
        Ok(origin) => cors.allow_origin(origin),
        Err(_) => cors,
    }
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ApiError::new(message))).into_response()
}

pub(crate) fn rate_limited(state: &AppState, addr: SocketAddr, limited: RateLimited) -> Response {
    state.metrics.rate_limit_hits.inc();
    warn!(ip = %addr.ip(), retry_after = limited.retry_after_secs, "rate limit exceeded");
    let mut response = error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(limited.retry_after_secs));
    response
}

/// Any verification failure collapses to one 401; the reason is only logged.
pub(crate) fn unauthorized(state: &AppState, reason: AuthError) -> Response {
    state.metrics.auth_failures.inc();
    warn!(reason = %reason, "rejected credentials");
    error_response(StatusCode::UNAUTHORIZED, AuthError::REJECTION)
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Principal, Response> {
    let token = extract_bearer_token(headers.get(AUTHORIZATION)).unwrap_or_default();
    state.verifier.verify(token).map_err(|e| unauthorized(state, e))
}

fn internal_error(context: &str, err: impl std::fmt::Display) -> Response {
    error!("{}: {}", context, err);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
}

fn issued_auth(state: &AppState, user_id: &str, email: &str) -> Result<AuthResponse, IssueError> {
    let issued = state.authority.issue(user_id, None, Some(email))?;
    Ok(AuthResponse {
        token: issued.token,
        user_id: user_id.to_string(),
        expires_at: issued.expires_at,
    })
}

// POST /api/auth/register
pub async fn register_user(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<CredentialsRequest>,
) -> Response {
    if let Err(limited) = state.rate_limiter.check(addr.ip(), RateClass::Credentials).await {
        return rate_limited(&state, addr, limited);
    }

    if let Err(e) = validate_credentials(&req) {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    let account = match state.accounts.create_user(&req.email, &req.password).await {
        Ok(account) => account,
        Err(AccountError::AlreadyExists) => {
            return error_response(StatusCode::BAD_REQUEST, "User already exists");
        }
        Err(e) => return internal_error("account creation failed", e),
    };

    info!(user = %account.id, "user registered");
    match issued_auth(&state, &account.id, &account.email) {
        Ok(body) => (StatusCode::CREATED, Json(body)).into_response(),
        Err(e) => internal_error("token issue failed", e),
    }
}

// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<CredentialsRequest>,
) -> Response {
    if let Err(limited) = state.rate_limiter.check(addr.ip(), RateClass::Credentials).await {
        return rate_limited(&state, addr, limited);
    }

    let account = match state.accounts.authenticate(&req.email, &req.password).await {
        Ok(account) => account,
        Err(AccountError::InvalidCredentials) => {
            state.metrics.auth_failures.inc();
            return error_response(StatusCode::UNAUTHORIZED, "Invalid credentials");
        }
        Err(e) => return internal_error("login failed", e),
    };

    match issued_auth(&state, &account.id, &account.email) {
        Ok(body) => Json(body).into_response(),
        Err(e) => internal_error("token issue failed", e),
    }
}

// POST /api/devices/register
pub async fn enroll_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DeviceEnrollRequest>,
) -> Response {
    let principal = match authenticate(&state, &headers) {
        Ok(p) => p,
        Err(response) => return response,
    };
    if principal.is_device() {
        return error_response(StatusCode::FORBIDDEN, "device tokens cannot enroll devices");
    }

    if let Err(e) = validate_device_name(&req.name) {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    let record = match state
        .accounts
        .enroll_device(&principal.user_id, &req.name, req.mac_address.as_deref())
        .await
    {
        Ok(record) => record,
        Err(AccountError::UnknownUser(_)) => {
            return error_response(StatusCode::NOT_FOUND, "User not found");
        }
        Err(e) => return internal_error("device enrollment failed", e),
    };

    let issued = match state
        .authority
        .issue(&principal.user_id, Some(&record.id), principal.email.as_deref())
    {
        Ok(issued) => issued,
        Err(e) => return internal_error("token issue failed", e),
    };

    info!(user = %principal.user_id, device = %record.id, "device enrolled");
    (
        StatusCode::CREATED,
        Json(DeviceEnrollResponse {
            token: issued.token,
            device_id: record.id,
            expires_at: issued.expires_at,
        }),
    )
        .into_response()
}

// GET /api/devices/list/:user_id
pub async fn list_devices(State(state): State<AppState>, Path(user_id): Path<String>, headers: HeaderMap) -> Response {
    let principal = match authenticate(&state, &headers) {
        Ok(p) => p,
        Err(response) => return response,
    };
    if principal.user_id != user_id {
        return error_response(StatusCode::FORBIDDEN, "Unauthorized");
    }

    match state.accounts.list_devices(&user_id).await {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => internal_error("device listing failed", e),
    }
}

// GET /api/ice-servers
pub async fn get_ice_servers(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    Json(IceServersResponse {
        ice_servers: state.config.ice_servers(),
    })
    .into_response()
}

// GET /health
pub async fn get_health() -> Response {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
    .into_response()
}

// GET /metrics
pub async fn get_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.export_prometheus() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => internal_error("metrics export failed", e),
    }
}
