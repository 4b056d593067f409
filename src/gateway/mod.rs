//! Axum HTTP surface.
//!
//! Request/response endpoints for signaling, frame privacy screening,
//! spatial analysis, the snapshot gallery, and health, plus the
//! per-session WebSocket signal channel. Bodies are JSON; errors are
//! structured `{kind, message, retry_after_ms?}` and never leak
//! internals. tower-http supplies CORS, body limits, timeouts, and
//! request tracing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::{internal_from, ErrorKind, GatewayError};
use crate::gallery::{GalleryStore, NewSnapshot, SnapshotMetadata, Visibility};
use crate::session::{SessionControl, SessionManager};
use crate::shield::{PrivacyShield, PrivacyVerdict};
use crate::signal::{parse_signal_message, SignalMessage};
use crate::spatial::{normalize_click, SurfaceAnalyzer};
use crate::telemetry::Metrics;

/// Maximum request body: base64 images are bulky.
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;
/// HTTP handler budget.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Sliding window used by the per-source rate limiter.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;
/// Signaling negotiation budget.
const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(15);
/// Idempotency window for `/process-frame`.
const FRAME_CACHE_TTL: Duration = Duration::from_secs(300);
/// Default and maximum gallery page sizes.
const GALLERY_DEFAULT_LIMIT: usize = 20;
const GALLERY_MAX_LIMIT: usize = 100;

// ── Rate limiter ───────────────────────────────────────────────────

/// How often the rate limiter sweeps stale source entries.
const RATE_LIMITER_SWEEP: Duration = Duration::from_secs(300);

/// Sliding-window rate limiter keyed by source address.
pub struct SlidingWindowRateLimiter {
    limit_per_window: u32,
    window: Duration,
    requests: Mutex<(HashMap<String, Vec<Instant>>, Instant)>,
}

impl SlidingWindowRateLimiter {
    pub fn new(limit_per_window: u32, window: Duration) -> Self {
        Self {
            limit_per_window,
            window,
            requests: Mutex::new((HashMap::new(), Instant::now())),
        }
    }

    /// `Ok(())` to admit; `Err(retry_after_ms)` to reject.
    pub fn check(&self, key: &str) -> Result<(), u64> {
        if self.limit_per_window == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut guard = self.requests.lock();
        let (requests, last_sweep) = &mut *guard;

        if now.duration_since(*last_sweep) >= RATE_LIMITER_SWEEP {
            let window = self.window;
            requests.retain(|_, stamps| {
                stamps.retain(|t| now.duration_since(*t) < window);
                !stamps.is_empty()
            });
            *last_sweep = now;
        }

        let stamps = requests.entry(key.to_owned()).or_default();
        stamps.retain(|t| now.duration_since(*t) < self.window);

        if stamps.len() >= self.limit_per_window as usize {
            let oldest = stamps.iter().min().copied().unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(oldest))
                .as_millis() as u64;
            return Err(retry_after.max(1));
        }
        stamps.push(now);
        Ok(())
    }
}

// ── Frame idempotency cache ────────────────────────────────────────

/// Caches `/process-frame` responses by frame id for the sliding
/// idempotency window: the same frame id returns the same bytes.
pub struct FrameCache {
    entries: Mutex<HashMap<String, (Instant, ProcessFrameResponse)>>,
    ttl: Duration,
}

impl FrameCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, frame_id: &str) -> Option<ProcessFrameResponse> {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries
            .get(frame_id)
            .filter(|(at, _)| now.duration_since(*at) < self.ttl)
            .map(|(_, response)| response.clone())
    }

    pub fn put(&self, frame_id: String, response: ProcessFrameResponse) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, (at, _)| now.duration_since(*at) < self.ttl);
        entries.insert(frame_id, (now, response));
    }
}

/// Source key for rate limiting: proxy headers first, socket second.
pub fn client_key(headers: &HeaderMap, addr: Option<SocketAddr>) -> String {
    for name in ["x-forwarded-for", "x-real-ip"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_owned();
            }
        }
    }
    addr.map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".into())
}

// ── Shared state ───────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub shield: Arc<PrivacyShield>,
    pub analyzer: Arc<dyn SurfaceAnalyzer>,
    pub gallery: Arc<GalleryStore>,
    pub sessions: Arc<SessionManager>,
    pub rate_limiter: Arc<SlidingWindowRateLimiter>,
    pub frame_cache: Arc<FrameCache>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        config: Config,
        shield: Arc<PrivacyShield>,
        analyzer: Arc<dyn SurfaceAnalyzer>,
        gallery: Arc<GalleryStore>,
        sessions: Arc<SessionManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let rate_limiter = Arc::new(SlidingWindowRateLimiter::new(
            config.rate_limit_rpm,
            Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
        ));
        Self {
            config: Arc::new(config),
            shield,
            analyzer,
            gallery,
            sessions,
            rate_limiter,
            frame_cache: Arc::new(FrameCache::new(FRAME_CACHE_TTL)),
            metrics,
        }
    }
}

/// Build the router with all endpoints and layers.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    let mut app = Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/webrtc", post(handle_webrtc_offer))
        .route("/ws", get(handle_signal_ws))
        .route("/process-frame", post(handle_process_frame))
        .route("/spatial", post(handle_spatial))
        .route("/snapshot", post(handle_snapshot))
        .route("/gallery", get(handle_gallery_list))
        .route("/gallery/{id}", get(handle_gallery_get))
        .route("/gallery/{id}/view", post(handle_gallery_view))
        .route("/gallery/{id}/like", post(handle_gallery_like))
        .route("/sessions/{id}/interrupt", post(handle_interrupt))
        .route("/blobs/{*key}", get(handle_blob_download))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if let Some(cors) = cors {
        app = app.layer(cors);
    }
    app
}

fn cors_layer(config: &Config) -> Option<CorsLayer> {
    if config.cors_allowed_origins.is_empty() {
        // No configured origins: cross-origin calls stay disallowed.
        return None;
    }
    let layer = if config.cors_allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = config
            .cors_allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };
    Some(layer)
}

/// Serve the gateway until the listener fails.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let addr = state.config.bind_addr;
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gateway listening");
    println!("atelier-live gateway on http://{addr}");
    println!("  POST /webrtc         — SDP offer/answer");
    println!("  WS   /ws?session=    — trickled ICE candidates");
    println!("  POST /process-frame  — privacy shield");
    println!("  POST /spatial        — surface analysis");
    println!("  POST /snapshot       — save to gallery");
    println!("  GET  /gallery        — public gallery");
    println!("  GET  /health         — liveness");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// ── Root & health ──────────────────────────────────────────────────

async fn handle_root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "atelier-live",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "real-time multimodal gateway",
    }))
}

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let started = Instant::now();
    let sessions = state.sessions.session_count();
    let metrics = state.metrics.snapshot();
    let response_time_ms = started.elapsed().as_secs_f64() * 1000.0;
    Json(serde_json::json!({
        "status": "healthy",
        "response_time_ms": response_time_ms,
        "sessions": sessions,
        "metrics": metrics,
    }))
}

// ── Signaling ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OfferBody {
    sdp: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct AnswerBody {
    sdp: String,
    #[serde(rename = "type")]
    kind: &'static str,
    session_id: String,
}

async fn handle_webrtc_offer(
    State(state): State<AppState>,
    Json(body): Json<OfferBody>,
) -> Response {
    if body.kind != "offer" || body.sdp.trim().is_empty() {
        return GatewayError::bad_request("expected {sdp, type: \"offer\"}").into_response();
    }

    let created = match tokio::time::timeout(NEGOTIATE_TIMEOUT, state.sessions.create(body.sdp))
        .await
    {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("negotiation timed out");
            return GatewayError::timeout("negotiation timed out").into_response();
        }
    };

    match created {
        Ok((session_id, sdp)) => Json(AnswerBody {
            sdp,
            kind: "answer",
            session_id,
        })
        .into_response(),
        Err(e) => {
            // Malformed SDP is the client's fault; anything else is a
            // transient allocation failure and reported busy.
            let msg = e.to_string();
            if msg.contains("parse offer sdp") {
                GatewayError::bad_request("malformed sdp").into_response()
            } else {
                tracing::error!(error = %e, "session allocation failed");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(GatewayError::new(ErrorKind::Internal, "busy, retry shortly")),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    session: String,
}

async fn handle_signal_ws(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.sessions.exists(&query.session) {
        return GatewayError::session_not_found(&query.session).into_response();
    }
    let sessions = Arc::clone(&state.sessions);
    let candidate_rx = sessions.take_candidate_rx(&query.session);
    ws.on_upgrade(move |socket| run_signal_socket(socket, sessions, query.session, candidate_rx))
}

/// Pump the signal channel: server candidates out, client candidates
/// in, applied in arrival order. Ends with the session.
async fn run_signal_socket(
    socket: WebSocket,
    sessions: Arc<SessionManager>,
    session_id: String,
    candidate_rx: Option<mpsc::UnboundedReceiver<String>>,
) {
    let (mut sender, mut receiver) = socket.split();

    // A second signal socket gets no server->client stream; keep a
    // stand-in channel open so the select below stays uniform.
    let (_standin_tx, standin_rx) = mpsc::unbounded_channel();
    let mut candidate_rx = candidate_rx.unwrap_or(standin_rx);

    loop {
        tokio::select! {
            outbound = candidate_rx.recv() => {
                match outbound {
                    Some(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    // Candidate source dropped: the session is gone.
                    None => break,
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let Some(SignalMessage::Candidate { candidate }) =
                            parse_signal_message(&text)
                        else {
                            continue;
                        };
                        if let Err(e) = sessions
                            .apply_candidate(&session_id, candidate.into())
                            .await
                        {
                            tracing::warn!(
                                session_id = %session_id,
                                error = %e,
                                "candidate rejected"
                            );
                            if !sessions.exists(&session_id) {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(session_id = %session_id, error = %e, "signal socket error");
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!(session_id = %session_id, "signal channel closed");
}

async fn handle_interrupt(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    state
        .sessions
        .control(&id, SessionControl::Interrupt)
        .await
        .map_err(|_| GatewayError::session_not_found(&id))?;
    Ok(Json(serde_json::json!({ "interrupted": true })))
}

// ── Privacy shield ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ProcessFrameBody {
    image_data: String,
    frame_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    timestamp: f64,
}

/// Response for `/process-frame`. Cached verbatim for idempotency.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessFrameResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_image: Option<String>,
    pub blur_applied: bool,
    pub face_count: usize,
    pub verdict: String,
}

async fn handle_process_frame(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ProcessFrameBody>,
) -> Result<Json<ProcessFrameResponse>, GatewayError> {
    enforce_rate_limit(&state, &headers, addr)?;

    if body.frame_id.is_empty() {
        return Err(GatewayError::bad_request("missing frame_id"));
    }
    if let Some(cached) = state.frame_cache.get(&body.frame_id) {
        return Ok(Json(cached));
    }

    let jpeg = decode_image_b64(&body.image_data)?;
    let verdict = state.shield.screen(&jpeg).await;

    let response = match verdict {
        PrivacyVerdict::Safe => ProcessFrameResponse {
            processed_image: None,
            blur_applied: false,
            face_count: 0,
            verdict: "safe".into(),
        },
        PrivacyVerdict::Blurred {
            processed,
            face_count,
        } => {
            Metrics::incr(&state.metrics.frames_blurred);
            ProcessFrameResponse {
                processed_image: Some(
                    base64::engine::general_purpose::STANDARD.encode(&processed),
                ),
                blur_applied: true,
                face_count,
                verdict: "blurred".into(),
            }
        }
        PrivacyVerdict::Blocked { face_count, .. } => {
            Metrics::incr(&state.metrics.frames_blocked);
            // A block is a normal result, not an error.
            ProcessFrameResponse {
                processed_image: None,
                blur_applied: false,
                face_count,
                verdict: "blocked".into(),
            }
        }
    };

    state.frame_cache.put(body.frame_id, response.clone());
    Ok(Json(response))
}

// ── Spatial analysis ───────────────────────────────────────────────

fn default_frame_width() -> f64 {
    1280.0
}
fn default_frame_height() -> f64 {
    720.0
}

#[derive(Debug, Deserialize)]
struct SpatialBody {
    image: String,
    #[serde(default)]
    x: Option<f64>,
    #[serde(default)]
    y: Option<f64>,
    #[serde(default = "default_frame_width")]
    width: f64,
    #[serde(default = "default_frame_height")]
    height: f64,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    /// Live session to notify (suspends audio while analyzing).
    #[serde(default)]
    session_id: Option<String>,
}

async fn handle_spatial(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<SpatialBody>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    enforce_rate_limit(&state, &headers, addr)?;

    let b64 = strip_data_url(&body.image).to_string();
    if b64.is_empty() {
        return Err(GatewayError::bad_request("missing image data"));
    }
    // Validate early so the analyzer never sees garbage.
    base64::engine::general_purpose::STANDARD
        .decode(&b64)
        .map_err(|_| GatewayError::bad_request("image is not valid base64"))?;

    if let Some(session_id) = &body.session_id {
        let _ = state
            .sessions
            .control(session_id, SessionControl::SpatialQuery)
            .await;
    }

    match body.kind.as_deref().unwrap_or("identify_surface") {
        "identify_surface" => {
            let (Some(x), Some(y)) = (body.x, body.y) else {
                return Err(GatewayError::bad_request("coordinates (x, y) are required"));
            };
            let (norm_x, norm_y) = normalize_click(x, y, body.width, body.height);
            let report = state
                .analyzer
                .identify_surface(&b64, norm_x, norm_y)
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "surface analysis failed");
                    GatewayError::analysis_failed("surface analysis failed")
                })?;
            serde_json::to_value(report)
                .map(Json)
                .map_err(|e| internal_from(&anyhow::anyhow!(e)))
        }
        "analyze_room" => {
            let value = state.analyzer.analyze_room(&b64).await.map_err(|e| {
                tracing::warn!(error = %e, "room analysis failed");
                GatewayError::analysis_failed("room analysis failed")
            })?;
            Ok(Json(value))
        }
        other => Err(GatewayError::bad_request(format!(
            "invalid analysis type: {other}"
        ))),
    }
}

// ── Gallery ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SnapshotBody {
    before_image: String,
    after_image: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_owner")]
    owner: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    is_public: bool,
    #[serde(default)]
    metadata: Option<SnapshotMetadata>,
}

fn default_owner() -> String {
    "anonymous".into()
}

async fn handle_snapshot(
    State(state): State<AppState>,
    Json(body): Json<SnapshotBody>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let before = decode_image_b64(&body.before_image)?;
    let after = decode_image_b64(&body.after_image)?;

    // The captured photo goes through the shield; generated imagery
    // has no people to protect.
    let verdict = state.shield.screen(&before).await;
    let (before, face_count) = match verdict {
        PrivacyVerdict::Safe => (before, 0),
        PrivacyVerdict::Blurred {
            processed,
            face_count,
        } => (processed, face_count),
        PrivacyVerdict::Blocked { face_count, .. } => {
            return Err(GatewayError::privacy_block(format!(
                "too many people detected ({face_count}); snapshot blocked"
            )));
        }
    };

    let mut metadata = body.metadata.unwrap_or_default();
    metadata.face_count = face_count;

    let record = state
        .gallery
        .save(NewSnapshot {
            owner: body.owner,
            title: body.title,
            description: body.description,
            before_jpeg: before,
            after_jpeg: after,
            metadata,
            tags: body.tags,
            visibility: if body.is_public {
                Visibility::Public
            } else {
                Visibility::Private
            },
        })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "snapshot save failed");
            GatewayError::storage_failed("snapshot could not be saved")
        })?;

    Ok(Json(serde_json::json!({ "id": record.id })))
}

#[derive(Debug, Deserialize)]
struct GalleryQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn handle_gallery_list(
    State(state): State<AppState>,
    Query(query): Query<GalleryQuery>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let limit = query.limit.unwrap_or(GALLERY_DEFAULT_LIMIT);
    if limit == 0 || limit > GALLERY_MAX_LIMIT {
        return Err(GatewayError::bad_request(format!(
            "limit must be between 1 and {GALLERY_MAX_LIMIT}"
        )));
    }
    let items = state
        .gallery
        .list_public(limit)
        .await
        .map_err(|e| internal_from(&e))?;
    Ok(Json(serde_json::json!({ "items": items })))
}

async fn handle_gallery_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let item = state
        .gallery
        .get(&id)
        .await
        .map_err(|e| internal_from(&e))?
        .ok_or_else(|| GatewayError::new(ErrorKind::SessionNotFound, "snapshot not found"))?;
    serde_json::to_value(item)
        .map(Json)
        .map_err(|e| internal_from(&anyhow::anyhow!(e)))
}

async fn handle_gallery_view(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let views = state
        .gallery
        .increment_views(&id)
        .await
        .map_err(|_| GatewayError::new(ErrorKind::SessionNotFound, "snapshot not found"))?;
    Ok(Json(serde_json::json!({ "views": views })))
}

async fn handle_gallery_like(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let likes = state
        .gallery
        .toggle_like(&id)
        .await
        .map_err(|_| GatewayError::new(ErrorKind::SessionNotFound, "snapshot not found"))?;
    Ok(Json(serde_json::json!({ "likes": likes })))
}

#[derive(Debug, Deserialize)]
struct BlobQuery {
    exp: i64,
    sig: String,
}

async fn handle_blob_download(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<BlobQuery>,
) -> Response {
    if !state.gallery.signer().verify(&key, query.exp, &query.sig) {
        return GatewayError::new(ErrorKind::Unauthorized, "download link invalid or expired")
            .into_response();
    }
    match state.gallery.blob(&key).await {
        Ok(Some(bytes)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/jpeg")],
            bytes,
        )
            .into_response(),
        Ok(None) => {
            GatewayError::new(ErrorKind::SessionNotFound, "blob not found").into_response()
        }
        Err(e) => internal_from(&e).into_response(),
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn enforce_rate_limit(
    state: &AppState,
    headers: &HeaderMap,
    addr: SocketAddr,
) -> Result<(), GatewayError> {
    let key = client_key(headers, Some(addr));
    state.rate_limiter.check(&key).map_err(|retry_after_ms| {
        Metrics::incr(&state.metrics.rate_limited);
        GatewayError::rate_limited(retry_after_ms)
    })
}

/// Strip a `data:*;base64,` prefix if present.
pub fn strip_data_url(input: &str) -> &str {
    match input.split_once(',') {
        Some((head, tail)) if head.starts_with("data:") => tail,
        _ => input,
    }
}

/// Decode a (possibly data-URL-wrapped) base64 image payload.
pub fn decode_image_b64(input: &str) -> Result<Bytes, GatewayError> {
    let b64 = strip_data_url(input);
    if b64.is_empty() {
        return Err(GatewayError::bad_request("missing image data"));
    }
    base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map(Bytes::from)
        .map_err(|_| GatewayError::bad_request("image is not valid base64"))
}
