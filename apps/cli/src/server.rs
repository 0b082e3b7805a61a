//! HTTP surface. Every endpoint reports acceptance only; outcomes are read
//! from the record store.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use enricher_core::{BatchDispatcher, LocalQueue, Published, TaskQueue};
use enricher_shared::{EnricherError, EnrichmentRequest};
use enricher_storage::Storage;

/// Sources per trigger when the body names no limit.
const DEFAULT_BATCH_LIMIT: usize = 1000;

type Reply = (StatusCode, Json<Value>);

#[derive(Clone)]
pub(crate) struct AppState {
    pub storage: Arc<Storage>,
    pub queue: Arc<LocalQueue>,
    pub dispatcher: Arc<BatchDispatcher>,
    pub max_outstanding: usize,
}

#[derive(Debug, Default, Deserialize)]
struct BatchTrigger {
    industry: Option<String>,
    limit: Option<usize>,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks/enqueue", post(enqueue))
        .route("/batch/trigger", post(trigger_batch))
        .route("/stats", get(stats))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn enqueue(
    State(state): State<AppState>,
    payload: Result<Json<EnrichmentRequest>, JsonRejection>,
) -> Reply {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return error_reply(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    if let Err(e) = request.validate() {
        return error_reply(StatusCode::BAD_REQUEST, e.to_string());
    }

    match state.queue.publish(&request).await {
        Ok(published) => {
            info!(entity_id = %request.entity_id, ?published, "entity enqueued");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "accepted",
                    "entity_id": request.entity_id,
                    "duplicate": published == Published::Duplicate,
                })),
            )
        }
        Err(e) => unavailable(e),
    }
}

async fn trigger_batch(
    State(state): State<AppState>,
    body: Bytes,
) -> Reply {
    let trigger = match parse_trigger(&body) {
        Ok(trigger) => trigger,
        Err(e) => return error_reply(StatusCode::BAD_REQUEST, format!("invalid trigger body: {e}")),
    };
    let limit = trigger.limit.unwrap_or(DEFAULT_BATCH_LIMIT);

    if state.queue.is_closed() {
        return error_reply(StatusCode::SERVICE_UNAVAILABLE, "queue is closed".into());
    }
    let sources = match state
        .storage
        .pending_sources(trigger.industry.as_deref(), limit)
        .await
    {
        Ok(sources) => sources,
        Err(e) => return unavailable(e),
    };

    let queued = sources.len();
    let dispatcher = state.dispatcher.clone();
    let max_outstanding = state.max_outstanding;
    tokio::spawn(async move {
        if let Err(e) = dispatcher.dispatch(sources, max_outstanding).await {
            error!(error = %e, "background dispatch failed");
        }
    });

    info!(industry = ?trigger.industry, limit, queued, "batch dispatch accepted");
    (
        StatusCode::OK,
        Json(json!({
            "status": "accepted",
            "industry": trigger.industry,
            "limit": limit,
            "queued": queued,
        })),
    )
}

/// An empty body means "all industries, default limit"; anything else must parse.
fn parse_trigger(body: &[u8]) -> serde_json::Result<BatchTrigger> {
    if body.trim_ascii().is_empty() {
        return Ok(BatchTrigger::default());
    }
    serde_json::from_slice(body)
}

async fn stats(State(state): State<AppState>) -> Reply {
    let counts = match state.storage.count_by_status().await {
        Ok(counts) => counts,
        Err(e) => return unavailable(e),
    };
    let total: u64 = counts.values().sum();
    let by_status: BTreeMap<&str, u64> = counts
        .into_iter()
        .map(|(status, count)| (status.as_str(), count))
        .collect();
    (
        StatusCode::OK,
        Json(json!({
            "by_status": by_status,
            "total": total,
            "outstanding": state.queue.outstanding(),
        })),
    )
}

fn unavailable(e: EnricherError) -> Reply {
    warn!(error = %e, "collaborator unavailable");
    error_reply(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
}

fn error_reply(status: StatusCode, reason: String) -> Reply {
    (status, Json(json!({ "status": "error", "reason": reason })))
}
