// SOD Server - HTTP ingest/predict API
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! HTTP API: `/collect`, `/predict`, `/health`.
//!
//! The two POST endpoints share an envelope: JSON content type, a 64 MiB
//! body cap, and offset-aware decode errors. `/collect` acknowledges
//! immediately and ingests in the background; `/predict` runs its
//! (bounded) batch concurrently under the request timeout and answers
//! with per-point verdicts.

use crate::config::SvcMode;
use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sod::Point;
use sod_engine::error::EngineError;
use sod_engine::metric::Metric;
use sod_engine::Dispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Maximum accepted request body.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub collect_timeout: Duration,
    pub predict_timeout: Duration,
    pub predict_max_items: usize,
}

/// Build the API router for the given service mode. `/collect` only
/// exists in collect mode; scrape mode pulls its own input.
pub fn router(state: AppState, mode: SvcMode) -> Router {
    let mut router = Router::new()
        .route("/predict", any(predict))
        .route("/health", get(health));
    if mode == SvcMode::Collect {
        router = router.route("/collect", any(collect));
    }
    router.with_state(state)
}

/// Ingest envelope shared by `/collect` and `/predict`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestRequest {
    pub entity: String,
    pub data: Vec<IngestItem>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestItem {
    pub vector: Vec<f64>,
    #[serde(default)]
    pub extra: serde_json::Value,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct PredictResponse {
    entity: String,
    data: Vec<PredictItem>,
}

#[derive(Debug, Serialize)]
struct PredictItem {
    outlier: bool,
    vector: Vec<f64>,
    extra: serde_json::Value,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
}

async fn health() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}

async fn collect(State(state): State<AppState>, request: Request) -> Response {
    let bytes = match envelope(request).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };
    let req: IngestRequest = match decode(&bytes) {
        Ok(req) => req,
        Err(response) => return response,
    };

    let dispatcher = Arc::clone(&state.dispatcher);
    let timeout = state.collect_timeout;
    // Acknowledge now; ordering and ingestion happen off the request path.
    tokio::spawn(async move {
        let entity = req.entity;
        let mut items = req.data;
        items.sort_by_key(|item| item.created_at);
        let metrics: Vec<Metric> = items
            .into_iter()
            .map(|item| Metric::new(entity.clone(), item.vector, item.created_at, item.extra))
            .collect();
        match tokio::time::timeout(timeout, dispatcher.collect(metrics)).await {
            Ok(Ok(())) => debug!(entity = %entity, "collected batch"),
            Ok(Err(e)) => error!(entity = %entity, error = %e, "collect failed"),
            Err(_) => error!(entity = %entity, "collect timed out"),
        }
    });

    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}

async fn predict(State(state): State<AppState>, request: Request) -> Response {
    let bytes = match envelope(request).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };
    let req: IngestRequest = match decode(&bytes) {
        Ok(req) => req,
        Err(response) => return response,
    };

    if req.data.len() > state.predict_max_items {
        return error_json(
            StatusCode::BAD_REQUEST,
            format!(
                "data items is too large, max allowed len is {}",
                state.predict_max_items
            ),
        );
    }

    match tokio::time::timeout(
        state.predict_timeout,
        run_predictions(Arc::clone(&state.dispatcher), req),
    )
    .await
    {
        Ok(Ok(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(Err(e)) => error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("predict processing error, {e}"),
        ),
        Err(_) => error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            "predict processing error, request timed out",
        ),
    }
}

/// Score every item concurrently, answering in submission order.
async fn run_predictions(
    dispatcher: Arc<Dispatcher>,
    req: IngestRequest,
) -> Result<PredictResponse, EngineError> {
    let mut slots: Vec<Option<PredictItem>> = Vec::new();
    slots.resize_with(req.data.len(), || None);

    let mut set = JoinSet::new();
    for (idx, item) in req.data.into_iter().enumerate() {
        let dispatcher = Arc::clone(&dispatcher);
        let entity = req.entity.clone();
        set.spawn_blocking(move || {
            let point = Point::from(item.vector.as_slice());
            dispatcher
                .predict(&entity, &point)
                .map(|conclusion| (idx, item, conclusion))
        });
    }

    while let Some(joined) = set.join_next().await {
        let (idx, item, conclusion) = joined.map_err(|e| EngineError::Task(e.to_string()))??;
        slots[idx] = Some(PredictItem {
            outlier: conclusion.outlier,
            vector: item.vector,
            extra: item.extra,
            created_at: item.created_at,
        });
    }

    Ok(PredictResponse {
        entity: req.entity,
        data: slots.into_iter().flatten().collect(),
    })
}

fn error_json(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": msg.into()}))).into_response()
}

/// Method, content-type and body-size checks shared by both endpoints.
async fn envelope(request: Request) -> Result<Vec<u8>, Response> {
    if request.method() != Method::POST {
        return Err(error_json(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("method {} is not allowed", request.method()),
        ));
    }

    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value.starts_with("application/json"));
    if !is_json {
        return Err(error_json(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "content-type is not application/json",
        ));
    }

    match to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => Ok(bytes.to_vec()),
        Err(e) => {
            if is_length_limit(&e) {
                Err(error_json(StatusCode::PAYLOAD_TOO_LARGE, "body too large"))
            } else {
                Err(error_json(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to read body: {e}"),
                ))
            }
        }
    }
}

fn is_length_limit(err: &axum::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if inner.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        source = inner.source();
    }
    false
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, Response> {
    if bytes.is_empty() {
        return Err(error_json(StatusCode::BAD_REQUEST, "body must not be empty"));
    }
    serde_json::from_slice(bytes).map_err(decode_error)
}

/// Map a JSON decode failure to the user-facing message shape.
fn decode_error(err: serde_json::Error) -> Response {
    use serde_json::error::Category;
    match err.classify() {
        Category::Syntax => error_json(
            StatusCode::BAD_REQUEST,
            format!("malformed json at position {}:{}", err.line(), err.column()),
        ),
        Category::Eof => error_json(StatusCode::BAD_REQUEST, "malformed json"),
        Category::Data => {
            let msg = err.to_string();
            if msg.starts_with("unknown field") {
                let field = msg.split('`').nth(1).unwrap_or("?");
                error_json(
                    StatusCode::BAD_REQUEST,
                    format!("unknown field `{field}`"),
                )
            } else {
                error_json(
                    StatusCode::BAD_REQUEST,
                    format!(
                        "invalid value at position {}:{}",
                        err.line(),
                        err.column()
                    ),
                )
            }
        }
        Category::Io => error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to decode json",
        ),
    }
}
