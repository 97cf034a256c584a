//! `GET /metrics`
//!
//! Counters are pushed as activities flow; the delivery backlog is a
//! point-in-time reading, so it is sampled from the store on every scrape.

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::error::AppError;
use crate::metrics::{DELIVERY_QUEUE_DEPTH, REGISTRY};

async fn scrape(State(state): State<AppState>) -> Result<Response, AppError> {
    let depth = state.store.count_pending_deliveries().await?;
    DELIVERY_QUEUE_DEPTH.set(depth);

    let encoder = TextEncoder::new();
    let body = encoder
        .encode_to_string(&REGISTRY.gather())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("encoding metrics: {e}")))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        body,
    )
        .into_response())
}

pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(scrape))
}
