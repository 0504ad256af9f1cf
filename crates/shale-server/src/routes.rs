//! Routing and request handlers.
//!
//! The storage backends and the codec are synchronous, so the streaming
//! endpoints bridge the async HTTP bodies onto blocking worker threads:
//! a push feeds the request body through the idle-timeout reader into
//! the backend's unpacker, and a pull runs the backend's packer against
//! one half of an in-memory duplex whose other half streams out as the
//! response body. Either side failing collapses the pipeline; the idle
//! watchdog bounds how long a vanished peer can hold a transfer open.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{StreamExt, TryStreamExt};
use shale_auth::{AuthError, Authenticator};
use shale_core::Timeframe;
use shale_store::{ShardStore, StoreError};
use shale_tags::TagPair;
use tokio_util::io::{ReaderStream, StreamReader, SyncIoBridge};
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::{issue_token, Claims, LoginRequest, LoginResponse};
use crate::error::ApiError;
use crate::stream::{IdleTimeoutReader, IdleTimeoutWriter};

/// Idle window after which a stalled transfer is torn down.
pub const TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const SHARD_CONTENT_TYPE: &str = "GravwellShard";
const DUPLEX_BUFFER: usize = 64 * 1024;

/// Shared server state.
pub struct AppState {
    pub store: Arc<dyn ShardStore>,
    pub auth: Arc<dyn Authenticator>,
    /// HMAC secret for bearer tokens; set once at construction.
    pub hmac_secret: [u8; 16],
    pub idle_timeout: Duration,
}

impl AppState {
    pub fn new(store: Arc<dyn ShardStore>, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            store,
            auth,
            hmac_secret: rand::random(),
            idle_timeout: TRANSFER_IDLE_TIMEOUT,
        }
    }

    /// Override the idle window; the tests shrink it.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

/// Build the full API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/test", get(liveness))
        .route("/api/testauth", get(auth_probe))
        .route("/api/login", post(login))
        .route("/api/shard/{cid}", get(list_indexers))
        .route("/api/shard/{cid}/{indexer}", get(list_wells))
        .route(
            "/api/shard/{cid}/{indexer}/{well}",
            get(well_timeframe).post(shards_in_timeframe),
        )
        .route(
            "/api/shard/{cid}/{indexer}/{well}/{shard}",
            post(push_shard).get(pull_shard),
        )
        .route(
            "/api/tags/{cid}/{indexer}",
            get(get_tags).post(sync_tags),
        )
        .with_state(state)
}

/// Liveness probe; succeeds unconditionally and touches nothing.
async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Authentication probe.
async fn auth_probe(_claims: Claims) -> StatusCode {
    StatusCode::OK
}

/// Exchange credentials for a bearer token. The body may be
/// form-urlencoded or JSON, both carrying `User` and `Pass`.
async fn login(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    #[derive(serde::Deserialize)]
    struct FormProbe {
        #[serde(rename = "User")]
        user: Option<String>,
        #[serde(rename = "Pass")]
        pass: Option<String>,
    }

    let creds = match serde_urlencoded::from_bytes::<FormProbe>(&body) {
        Ok(FormProbe {
            user: Some(user),
            pass: Some(pass),
        }) => Some((user, pass)),
        _ => serde_json::from_slice::<LoginRequest>(&body)
            .ok()
            .map(|l| (l.user, l.pass)),
    };
    let Some((user, pass)) = creds else {
        info!("login request with no usable credentials");
        return login_failure(StatusCode::UNPROCESSABLE_ENTITY);
    };

    match state.auth.authenticate(&user, &pass) {
        Ok(cid) => match issue_token(&state.hmac_secret, cid) {
            Ok(jwt) => {
                info!(cid, "login successful");
                Json(LoginResponse {
                    login_status: true,
                    reason: String::new(),
                    jwt,
                })
                .into_response()
            }
            Err(e) => e.into_response(),
        },
        Err(AuthError::Locked) => login_failure(StatusCode::LOCKED),
        Err(e) => {
            info!(error = %e, "login rejected");
            login_failure(StatusCode::UNPROCESSABLE_ENTITY)
        }
    }
}

fn login_failure(status: StatusCode) -> Response {
    let reason = if status == StatusCode::LOCKED {
        "account is locked"
    } else {
        "invalid username or password"
    };
    (
        status,
        Json(LoginResponse {
            login_status: false,
            reason: reason.to_string(),
            jwt: String::new(),
        }),
    )
        .into_response()
}

/// Reject requests whose path customer differs from the token customer
/// before anything touches storage.
fn require_customer(claims: &Claims, cid: u64) -> Result<(), ApiError> {
    if claims.customer_number != cid {
        return Err(ApiError::CustomerMismatch);
    }
    Ok(())
}

fn require_nonempty(value: &str, what: &str) -> Result<(), ApiError> {
    if value.is_empty() {
        return Err(ApiError::Validation(format!("empty {what}")));
    }
    Ok(())
}

/// Run a storage operation on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(ApiError::Internal(format!("storage worker failed: {e}"))),
    }
}

async fn list_indexers(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(cid): Path<u64>,
) -> Result<Json<Vec<String>>, ApiError> {
    require_customer(&claims, cid)?;
    let store = state.store.clone();
    Ok(Json(blocking(move || store.list_indexers(cid)).await?))
}

async fn list_wells(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path((cid, indexer)): Path<(u64, Uuid)>,
) -> Result<Json<Vec<String>>, ApiError> {
    require_customer(&claims, cid)?;
    let store = state.store.clone();
    Ok(Json(
        blocking(move || store.list_indexer_wells(cid, indexer)).await?,
    ))
}

async fn well_timeframe(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path((cid, indexer, well)): Path<(u64, Uuid, String)>,
) -> Result<Json<Timeframe>, ApiError> {
    require_customer(&claims, cid)?;
    require_nonempty(&well, "well name")?;
    let store = state.store.clone();
    Ok(Json(
        blocking(move || store.well_timeframe(cid, indexer, &well)).await?,
    ))
}

async fn shards_in_timeframe(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path((cid, indexer, well)): Path<(u64, Uuid, String)>,
    Json(tf): Json<Timeframe>,
) -> Result<Json<Vec<String>>, ApiError> {
    require_customer(&claims, cid)?;
    require_nonempty(&well, "well name")?;
    if tf.end < tf.start {
        return Err(ApiError::Validation(format!(
            "invalid start time {} after end time {}",
            tf.start, tf.end
        )));
    }
    if tf.start.timestamp() == 0 || tf.end.timestamp() == 0 {
        return Err(ApiError::Validation(
            "start/end times must not be zero".to_string(),
        ));
    }
    let store = state.store.clone();
    Ok(Json(
        blocking(move || store.shards_in_timeframe(cid, indexer, &well, &tf)).await?,
    ))
}

async fn get_tags(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path((cid, indexer)): Path<(u64, Uuid)>,
) -> Result<Json<Vec<TagPair>>, ApiError> {
    require_customer(&claims, cid)?;
    let store = state.store.clone();
    Ok(Json(blocking(move || store.get_tags(cid, indexer)).await?))
}

async fn sync_tags(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path((cid, indexer)): Path<(u64, Uuid)>,
    Json(pairs): Json<Vec<TagPair>>,
) -> Result<Json<Vec<TagPair>>, ApiError> {
    require_customer(&claims, cid)?;
    let store = state.store.clone();
    Ok(Json(
        blocking(move || store.sync_tags(cid, indexer, &pairs)).await?,
    ))
}

/// Upload one shard: request body -> idle-timed reader -> blocking
/// unpack into the backend.
async fn push_shard(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path((cid, indexer, well, shard)): Path<(u64, Uuid, String, String)>,
    body: Body,
) -> Result<StatusCode, ApiError> {
    require_customer(&claims, cid)?;
    require_nonempty(&well, "well name")?;
    require_nonempty(&shard, "shard id")?;
    info!(cid, %indexer, well, shard, "shard push");

    let stream = body.into_data_stream().map_err(io::Error::other);
    let reader = IdleTimeoutReader::new(StreamReader::new(stream), state.idle_timeout);
    let mut bridge = SyncIoBridge::new(Box::pin(reader));

    let store = state.store.clone();
    let result = tokio::task::spawn_blocking(move || {
        store.unpack_shard(cid, indexer, &well, &shard, &mut bridge)
    })
    .await;
    match result {
        Ok(Ok(())) => Ok(StatusCode::OK),
        Ok(Err(e)) => {
            error!(cid, %indexer, error = %e, "failed to unpack shard");
            Err(e.into())
        }
        Err(e) => Err(ApiError::Internal(format!("unpack worker failed: {e}"))),
    }
}

/// Download one shard: blocking pack into one half of a duplex, the
/// other half streamed out as the response body. The first chunk is
/// awaited before committing the status so immediate failures still
/// surface as errors.
async fn pull_shard(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path((cid, indexer, well, shard)): Path<(u64, Uuid, String, String)>,
) -> Result<Response, ApiError> {
    require_customer(&claims, cid)?;
    require_nonempty(&well, "well name")?;
    require_nonempty(&shard, "shard id")?;
    info!(cid, %indexer, well, shard, "shard pull");

    let (write_half, read_half) = tokio::io::duplex(DUPLEX_BUFFER);
    let writer = IdleTimeoutWriter::new(write_half, state.idle_timeout);
    let mut bridge = SyncIoBridge::new(Box::pin(writer));

    let store = state.store.clone();
    let task = tokio::task::spawn_blocking(move || {
        let result = store.pack_shard(cid, indexer, &well, &shard, &mut bridge);
        let _ = bridge.shutdown();
        result
    });

    let mut stream = ReaderStream::new(read_half);
    match stream.next().await {
        Some(Ok(first)) => {
            // stream is live: commit the response and let the packer run
            tokio::spawn(async move {
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(cid, %indexer, error = %e, "failed to pack shard"),
                    Err(e) => error!(error = %e, "pack worker failed"),
                }
            });
            let body = Body::from_stream(
                futures_util::stream::iter([Ok::<_, io::Error>(first)]).chain(stream),
            );
            Response::builder()
                .header(header::CONTENT_TYPE, SHARD_CONTENT_TYPE)
                .body(body)
                .map_err(|e| ApiError::Internal(e.to_string()))
        }
        Some(Err(e)) => {
            let _ = task.await;
            Err(ApiError::Internal(e.to_string()))
        }
        None => match task.await {
            // nothing was written; report the packer's verdict
            Ok(Ok(())) => Ok(StatusCode::OK.into_response()),
            Ok(Err(e)) => {
                error!(cid, %indexer, error = %e, "failed to pack shard");
                Err(e.into())
            }
            Err(e) => Err(ApiError::Internal(format!("pack worker failed: {e}"))),
        },
    }
}
