//! HTTP surface over the sync engine.
//!
//! Handlers verify the caller, apply the rate limit, then run the engine on
//! the blocking pool. Record-level failures come back in the record result;
//! infrastructure failures become a generic 503.

use crate::coordinator::{RecordResult, SyncEngine};
use crate::diagnostics;
use crate::entities::{EntityKind, PolicyKind};
use crate::error::{SyncError, SyncResult};
use crate::identity::{IdentityError, IdentityVerifier, RequestIdentity};
use crate::rate_limit::{self, Decision, RateLimiter};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, MatchedPath, Path, Query, Request, State};
use axum::http::header::{CONTENT_ENCODING, RETRY_AFTER};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info_span, warn};

/// Upper bound for a request body, before and after decompression.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    engine: Arc<SyncEngine>,
    identity: Arc<dyn IdentityVerifier>,
    limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        engine: Arc<SyncEngine>,
        identity: Arc<dyn IdentityVerifier>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            engine,
            identity,
            limiter,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sync/verify", post(verify))
        .route("/api/sync/policies", put(set_policy).delete(clear_policy))
        .route("/api/sync/diagnostics/counts", get(entity_counts))
        .route("/api/sync/:kind", post(sync_one))
        .route("/api/sync/:kind/batch", post(sync_batch))
        .route("/api/sync/:kind/:global_id", delete(soft_delete))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http().make_span_with(|req: &Request| {
            // Route template only; raw paths carry unvalidated client input.
            let route = req
                .extensions()
                .get::<MatchedPath>()
                .map(MatchedPath::as_str)
                .unwrap_or("unmatched");
            info_span!("http", method = %req.method(), route)
        }))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ApiError {
    Unauthorized(IdentityError),
    RateLimited { retry_after: Duration },
    UnknownKind,
    InvalidRequest(&'static str),
    UnsupportedEncoding,
    PayloadTooLarge,
    Sync(SyncError),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::UnknownKind => ApiError::UnknownKind,
            other => ApiError::Sync(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized(err) => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthorized", "message": err.to_string() })),
            )
                .into_response(),
            Self::RateLimited { retry_after } => {
                let secs = retry_after.as_secs().max(1);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(RETRY_AFTER, secs.to_string())],
                    Json(json!({ "error": "rate_limited", "retry_after": secs })),
                )
                    .into_response()
            }
            Self::UnknownKind => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "unknown_kind" })),
            )
                .into_response(),
            Self::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid_request", "message": message })),
            )
                .into_response(),
            Self::UnsupportedEncoding => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                Json(json!({ "error": "unsupported_encoding" })),
            )
                .into_response(),
            Self::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "error": "payload_too_large" })),
            )
                .into_response(),
            Self::Sync(err) => {
                let status = match &err {
                    SyncError::Validation(_) => StatusCode::BAD_REQUEST,
                    SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
                    SyncError::UnknownKind => StatusCode::NOT_FOUND,
                    SyncError::Store(detail) => {
                        error!("Sync request failed: {detail}");
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    _ => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (
                    status,
                    Json(json!({ "error": err.code(), "message": err.client_message() })),
                )
                    .into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Request plumbing
// ---------------------------------------------------------------------------

fn admit(state: &AppState, headers: &HeaderMap) -> Result<RequestIdentity, ApiError> {
    let identity = state.identity.verify(headers).map_err(|err| {
        warn!("Rejected sync request: {err}");
        ApiError::Unauthorized(err)
    })?;
    match state.limiter.check(&rate_limit::key_for(&identity)) {
        Decision::Allowed => Ok(identity),
        Decision::Limited { retry_after } => Err(ApiError::RateLimited { retry_after }),
    }
}

fn parse_kind(raw: &str) -> Result<EntityKind, ApiError> {
    EntityKind::parse(raw).ok_or(ApiError::UnknownKind)
}

/// Undo `Content-Encoding: zstd`, bounded by [`MAX_BODY_BYTES`].
fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<Bytes, ApiError> {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .map(|v| v.to_str().map(str::trim))
        .transpose()
        .map_err(|_| ApiError::UnsupportedEncoding)?;

    match encoding {
        None | Some("") | Some("identity") => Ok(body),
        Some(enc) if enc.eq_ignore_ascii_case("zstd") => {
            let decoder = zstd::stream::read::Decoder::new(&body[..])
                .map_err(|_| ApiError::InvalidRequest("invalid zstd body"))?;
            let mut out = Vec::new();
            decoder
                .take(MAX_BODY_BYTES as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|_| ApiError::InvalidRequest("invalid zstd body"))?;
            if out.len() > MAX_BODY_BYTES {
                return Err(ApiError::PayloadTooLarge);
            }
            Ok(Bytes::from(out))
        }
        Some(_) => Err(ApiError::UnsupportedEncoding),
    }
}

fn json_body<T: serde::de::DeserializeOwned>(
    headers: &HeaderMap,
    body: Bytes,
    shape: &'static str,
) -> Result<T, ApiError> {
    let raw = decode_body(headers, body)?;
    serde_json::from_slice(&raw).map_err(|_| ApiError::InvalidRequest(shape))
}

/// Run store work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> SyncResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(join) => {
            error!("Sync worker task failed: {join}");
            Err(ApiError::Sync(SyncError::Store("worker task failed".into())))
        }
    }
}

fn record_response(result: RecordResult) -> Response {
    let status = match result.code {
        None => StatusCode::OK,
        Some("validation") => StatusCode::BAD_REQUEST,
        Some("not_found") => StatusCode::NOT_FOUND,
        Some(_) => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (status, Json(result)).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(diagnostics::about_info())
}

async fn sync_one(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let identity = admit(&state, &headers)?;
    let kind = parse_kind(&kind)?;
    let payload: Value = json_body(&headers, body, "body must be a JSON object")?;
    if !payload.is_object() {
        return Err(ApiError::InvalidRequest("body must be a JSON object"));
    }
    let engine = Arc::clone(&state.engine);
    let result = blocking(move || engine.sync_one(&identity, kind, &payload)).await?;
    Ok(record_response(result))
}

#[derive(Debug, Deserialize)]
struct BatchBody {
    records: Vec<Value>,
}

async fn sync_batch(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let identity = admit(&state, &headers)?;
    let kind = parse_kind(&kind)?;
    let batch: BatchBody = json_body(&headers, body, "body must be {\"records\": [...]}")?;
    let engine = Arc::clone(&state.engine);
    let report = blocking(move || engine.sync_batch(&identity, kind, &batch.records)).await?;
    Ok(Json(report).into_response())
}

async fn soft_delete(
    State(state): State<AppState>,
    Path((kind, global_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = admit(&state, &headers)?;
    let kind = parse_kind(&kind)?;
    let engine = Arc::clone(&state.engine);
    let result = blocking(move || engine.soft_delete(&identity, kind, &global_id)).await?;
    Ok(record_response(result))
}

#[derive(Debug, Deserialize)]
struct VerifyBody {
    #[serde(default, alias = "branchId")]
    branch_id: Option<i64>,
    entities: Map<String, Value>,
}

async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let identity = admit(&state, &headers)?;
    let request: VerifyBody = json_body(&headers, body, "body must be {\"entities\": {...}}")?;
    let engine = Arc::clone(&state.engine);
    let report =
        blocking(move || engine.verify(&identity, request.branch_id, &request.entities)).await?;
    Ok(Json(json!({ "entities": report })).into_response())
}

#[derive(Debug, Deserialize)]
struct CountsQuery {
    branch_id: Option<i64>,
}

async fn entity_counts(
    State(state): State<AppState>,
    Query(query): Query<CountsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = admit(&state, &headers)?;
    let engine = Arc::clone(&state.engine);
    let counts = blocking(move || engine.entity_counts(&identity, query.branch_id)).await?;
    Ok(Json(json!({ "counts": counts })).into_response())
}

#[derive(Debug, Deserialize)]
struct PolicyBody {
    kind: String,
    field: String,
    policy: String,
}

async fn set_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let identity = admit(&state, &headers)?;
    let request: PolicyBody =
        json_body(&headers, body, "body must be {\"kind\", \"field\", \"policy\"}")?;
    let kind = parse_kind(&request.kind)?;
    let policy = PolicyKind::parse(&request.policy)
        .ok_or(ApiError::InvalidRequest("policy must be fatal, detach or fallback"))?;
    let engine = Arc::clone(&state.engine);
    let field = request.field;
    let stored = field.clone();
    blocking(move || engine.set_reference_policy(&identity, kind, &field, policy)).await?;
    Ok(Json(json!({ "kind": kind, "field": stored, "policy": policy.as_str() })).into_response())
}

#[derive(Debug, Deserialize)]
struct PolicyTarget {
    kind: String,
    field: String,
}

async fn clear_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let identity = admit(&state, &headers)?;
    let request: PolicyTarget = json_body(&headers, body, "body must be {\"kind\", \"field\"}")?;
    let kind = parse_kind(&request.kind)?;
    let engine = Arc::clone(&state.engine);
    let field = request.field;
    let cleared = blocking({
        let field = field.clone();
        move || engine.clear_reference_policy(&identity, kind, &field)
    })
    .await?;
    Ok(Json(json!({ "kind": kind, "field": field, "cleared": cleared })).into_response())
}
