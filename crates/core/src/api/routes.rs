use crate::AppState;
use crate::identity::RequestContext;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Extension, Path as AxumPath, Query};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use key_dispenser_redeem::{DELIVERY_PREFIX, RedeemError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tracing::{debug, error, info};

pub const ACCESS_KEY_HEADER: &str = "x-access-key";
const NO_STORE: &str = "no-store";

#[derive(Debug, Default, Deserialize)]
pub struct EntryParams {
    pub account: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeliveryParams {
    pub t: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeliveryResponse {
    pub key: String,
    pub consume_url: String,
    pub expires_in_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConsumeRequest {
    pub nonce: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PayloadParams {
    pub key: Option<String>,
    pub account: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub available_keys: usize,
    pub live_tokens: usize,
    pub issued_keys: usize,
}

/// Issue a key and redirect to its one-time delivery link.
pub async fn request_key(
    Extension(state): Extension<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<EntryParams>,
) -> Result<Response, RedeemError> {
    let identity = state.identity.identify(&RequestContext {
        headers: &headers,
        peer: Some(peer),
        account: params.account.as_deref(),
    });

    let grant = state.broker.request_access(identity.as_deref()).await?;
    debug!(slug = %grant.slug, "Redirecting to delivery link");

    Ok((
        StatusCode::FOUND,
        [
            (header::LOCATION, grant.delivery_path()),
            (header::CACHE_CONTROL, NO_STORE.to_string()),
        ],
    )
        .into_response())
}

/// Show the key behind a delivery link, once.
pub async fn deliver_key(
    Extension(state): Extension<AppState>,
    AxumPath(slug): AxumPath<String>,
    Query(params): Query<DeliveryParams>,
) -> Result<Response, RedeemError> {
    let nonce = params
        .t
        .filter(|nonce| !nonce.is_empty())
        .ok_or_else(|| RedeemError::malformed("missing link token"))?;

    let delivery = state.broker.resolve(&slug, &nonce)?;
    info!(%slug, "Delivered key");

    let body = DeliveryResponse {
        key: delivery.credential,
        consume_url: format!("{DELIVERY_PREFIX}/{slug}/consume"),
        expires_in_secs: delivery.expires_in.as_secs(),
    };
    Ok(([(header::CACHE_CONTROL, NO_STORE)], Json(body)).into_response())
}

/// Client confirmation that the key was taken. An expired link reads as gone.
pub async fn consume_key(
    Extension(state): Extension<AppState>,
    AxumPath(slug): AxumPath<String>,
    request: Result<Json<ConsumeRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, RedeemError> {
    let Json(request) = request.map_err(|rejection| RedeemError::malformed(rejection.body_text()))?;

    state
        .broker
        .confirm(&slug, &request.nonce)
        .map_err(|error| match error {
            RedeemError::Expired => RedeemError::AlreadyConsumed,
            other => other,
        })?;

    Ok(Json(json!({ "ok": true })))
}

/// Serve the protected payload to holders of a live key.
pub async fn serve_payload(
    Extension(state): Extension<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<PayloadParams>,
) -> Result<Response, RedeemError> {
    let credential = params.key.or_else(|| {
        headers
            .get(ACCESS_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });
    let identity = state.identity.identify(&RequestContext {
        headers: &headers,
        peer: Some(peer),
        account: params.account.as_deref(),
    });

    state
        .gate
        .authorize(credential.as_deref(), identity.as_deref())
        .await?;

    match tokio::fs::read_to_string(state.payload_file()).await {
        Ok(payload) => Ok((
            [
                (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                (header::CACHE_CONTROL, NO_STORE),
            ],
            payload,
        )
            .into_response()),
        Err(error) => {
            if error.kind() == ErrorKind::NotFound {
                error!(file = %state.payload_file().display(), "Payload file is missing");
            } else {
                error!(?error, "Failed to read payload file");
            }
            Ok(err_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Payload unavailable",
            ))
        }
    }
}

pub async fn stats(Extension(state): Extension<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        available_keys: state.broker.pool().size().await,
        live_tokens: state.broker.store().len(),
        issued_keys: state.broker.ledger().issued_count().await,
    })
}

pub async fn not_found() -> Response {
    err_response(StatusCode::NOT_FOUND, "Not Found")
}

pub(crate) fn err_response(status: StatusCode, message: &str) -> Response {
    let body = json!({
        "error": message,
        "status": status.as_u16(),
    });

    (status, Json(body)).into_response()
}
