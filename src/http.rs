//! HTTP surface for a `ringd` node (§6).
//!
//! Three families of route live here:
//!
//! - `/store/:key` — the external client-facing coordinator path (GET,
//!   PUT, DELETE), quorum-aware and causality-tracked.
//! - `/_localstore/:key`, `/_metadata`, `/_handoff` — internal routes one
//!   peer calls on another; [`crate::network::RemoteStorage`] is the
//!   client side of these.
//! - `/admin/claim`, `/admin/balance` — the operator-triggered claim and
//!   rebalance endpoints.
//!
//! All bodies are JSON; this implementation uses plain JSON rather than
//! the distilled spec's bz2-framed binary (`DESIGN.md` records why).
use crate::cluster::Engine;
use crate::error::RingError;
use crate::types::{self, CLIENT_ID_HEADER, CONTEXT_HEADER};
use crate::vector_clock::{Stamped, Value, VectorClock};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::sync::Arc;

/// Build the full router for a node: external, internal, and admin
/// routes all share the same [`Engine`] state.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/store/:key", get(get_store).put(put_store).delete(delete_store))
        .route(
            "/_localstore/:key",
            get(get_localstore).put(put_localstore).delete(delete_localstore),
        )
        .route("/_metadata", get(get_metadata).put(put_metadata))
        .route("/_handoff", put(put_handoff))
        .route("/admin/claim", get(get_claim).put(put_claim))
        .route("/admin/balance", put(put_balance))
        .with_state(engine)
}

/// Bind `router(engine)` to `addr` and serve until the process is
/// signalled to stop. Uses `ConnectInfo<SocketAddr>` so `/store/*`
/// handlers can fall back to the peer's socket address as a client id
/// when `X-VinzClortho-ClientId` is absent (§6).
pub async fn serve(engine: Arc<Engine>, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(engine).into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "ringd listening");
    axum::serve(listener, app).await
}

fn status_for(error: &RingError) -> StatusCode {
    match error {
        RingError::NotFound(_) => StatusCode::NOT_FOUND,
        RingError::QuorumUnmet { .. } => StatusCode::NOT_FOUND,
        RingError::InvalidContext(_) => StatusCode::BAD_REQUEST,
        RingError::OperatorError(_) => StatusCode::BAD_REQUEST,
        RingError::UnknownNode(_) => StatusCode::NOT_FOUND,
        RingError::Transport { .. } => StatusCode::BAD_GATEWAY,
        RingError::Serialization(_) => StatusCode::BAD_REQUEST,
        RingError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for RingError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        (status, self.to_string()).into_response()
    }
}

fn client_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn decode_context_header(headers: &HeaderMap) -> Result<Option<VectorClock>, RingError> {
    match headers.get(CONTEXT_HEADER) {
        None => Ok(None),
        Some(value) => {
            let text = value
                .to_str()
                .map_err(|e| RingError::InvalidContext(e.to_string()))?;
            types::decode_context(text).map(Some)
        }
    }
}

fn context_header(clock: &VectorClock) -> Result<HeaderValue, RingError> {
    let encoded = types::encode_context(clock)?;
    HeaderValue::from_str(&encoded).map_err(|e| RingError::Server(e.to_string()))
}

// ---------------------------------------------------------------------
// /store/:key — external coordinator path
// ---------------------------------------------------------------------

/// A sibling-list response body for a 300 (Multiple Choices) GET.
#[derive(Debug, Serialize)]
struct Siblings {
    siblings: Vec<JsonValue>,
}

async fn get_store(
    State(engine): State<Arc<Engine>>,
    Path(key): Path<String>,
) -> Result<Response, RingError> {
    let (clock, value) = engine.get(key.as_bytes()).await?;
    let header = context_header(&clock)?;
    let mut response = match value {
        Value::Present(v) => (StatusCode::OK, Json(v)).into_response(),
        Value::Siblings(vs) => (StatusCode::MULTIPLE_CHOICES, Json(Siblings { siblings: vs })).into_response(),
        // Coordinator::get never resolves a pure tombstone into a success
        // (§4.5); a GET that only ever sees tombstones fails quorum instead.
        Value::Tombstone => return Err(RingError::NotFound(key)),
    };
    response.headers_mut().insert(CONTEXT_HEADER, header);
    Ok(response)
}

async fn put_store(
    State(engine): State<Arc<Engine>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(body): Json<JsonValue>,
) -> Result<Response, RingError> {
    let client = client_id(&headers, connect_info.map(|c| c.0));
    let context = decode_context_header(&headers)?;
    let clock = engine
        .put(key.as_bytes(), &client, context, Value::Present(body))
        .await?;
    let header = context_header(&clock)?;
    let mut response = StatusCode::OK.into_response();
    response.headers_mut().insert(CONTEXT_HEADER, header);
    Ok(response)
}

async fn delete_store(
    State(engine): State<Arc<Engine>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, RingError> {
    let client = client_id(&headers, connect_info.map(|c| c.0));
    let context = decode_context_header(&headers)?;
    let clock = engine.delete(key.as_bytes(), &client, context).await?;
    let header = context_header(&clock)?;
    let mut response = StatusCode::OK.into_response();
    response.headers_mut().insert(CONTEXT_HEADER, header);
    Ok(response)
}

// ---------------------------------------------------------------------
// /_localstore/:key — internal replica path, raw stored blob
// ---------------------------------------------------------------------

async fn get_localstore(
    State(engine): State<Arc<Engine>>,
    Path(key): Path<String>,
) -> Result<Json<Stamped>, RingError> {
    let shard = engine.local_shard_for(key.as_bytes()).await;
    shard.get_stamped(key.as_bytes()).await.map(Json)
}

async fn put_localstore(
    State(engine): State<Arc<Engine>>,
    Path(key): Path<String>,
    Json(stamped): Json<Stamped>,
) -> Result<StatusCode, RingError> {
    let shard = engine.local_shard_for(key.as_bytes()).await;
    shard.put_stamped(key.as_bytes(), &stamped).await?;
    Ok(StatusCode::OK)
}

async fn delete_localstore(
    State(engine): State<Arc<Engine>>,
    Path(key): Path<String>,
) -> Result<StatusCode, RingError> {
    let shard = engine.local_shard_for(key.as_bytes()).await;
    shard.delete(key.as_bytes()).await?;
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------
// /_metadata — gossip exchange
// ---------------------------------------------------------------------

async fn get_metadata(State(engine): State<Arc<Engine>>) -> Json<crate::types::Metadata> {
    Json(engine.metadata_snapshot().await)
}

async fn put_metadata(
    State(engine): State<Arc<Engine>>,
    Json(received): Json<crate::types::Metadata>,
) -> StatusCode {
    engine.receive_metadata(received).await;
    StatusCode::OK
}

// ---------------------------------------------------------------------
// /_handoff — receive a chunk of (key, blob) pairs
// ---------------------------------------------------------------------

async fn put_handoff(
    State(engine): State<Arc<Engine>>,
    Json(chunk): Json<crate::network::HandoffChunk>,
) -> Result<StatusCode, RingError> {
    engine.receive_handoff(chunk.partition, chunk.entries).await?;
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------
// /admin/claim, /admin/balance — operator endpoints
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ClaimResponse {
    claim: usize,
}

async fn get_claim(State(engine): State<Arc<Engine>>) -> Json<ClaimResponse> {
    Json(ClaimResponse {
        claim: engine.claim_count().await,
    })
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    wanted: usize,
    #[serde(default)]
    force: bool,
}

async fn put_claim(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<ClaimRequest>,
) -> Json<ClaimResponse> {
    engine.set_claim(request.wanted, request.force).await;
    Json(ClaimResponse {
        claim: engine.claim_count().await,
    })
}

async fn put_balance(State(engine): State<Arc<Engine>>) -> StatusCode {
    engine.balance().await;
    StatusCode::OK
}
