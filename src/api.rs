use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::adapter::{ChainAdapter, ChainClient};
use crate::config::Config;
use crate::metrics;
use crate::models::{ChainKey, Deposit, Network};
use crate::storage::Storage;

#[derive(Clone)]
pub struct AppState<S> {
    pub config: Arc<Config>,
    pub storage: S,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

fn err(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

#[derive(Deserialize)]
pub struct HealthQuery {
    pub network: Option<String>,
}

/// Read-only connection check: `{blockNumber, network}` straight off the
/// node. Never mutates state.
#[derive(Serialize)]
pub struct HealthResponse {
    #[serde(rename = "blockNumber")]
    pub block_number: u64,
    pub network: Network,
}

async fn health_handler<S: Storage>(
    State(state): State<AppState<S>>,
    Path(chain): Path<String>,
    Query(query): Query<HealthQuery>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<ErrorBody>)> {
    let Some(chain) = ChainKey::parse(&chain) else {
        return Err(err(StatusCode::BAD_REQUEST, format!("unknown chain {chain:?}")));
    };
    let network = match query.network.as_deref() {
        None => Network::Mainnet,
        Some(raw) => Network::parse(raw)
            .ok_or_else(|| err(StatusCode::BAD_REQUEST, format!("unknown network {raw:?}")))?,
    };

    let client = ChainClient::connect(chain, network, &state.config)
        .await
        .map_err(|e| err(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    let block_number = client
        .tip_height()
        .await
        .map_err(|e| err(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    Ok(Json(HealthResponse {
        block_number,
        network,
    }))
}

async fn deposits_handler<S: Storage>(
    State(state): State<AppState<S>>,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<Deposit>>, (StatusCode, Json<ErrorBody>)> {
    let deposits = state
        .storage
        .find_user_deposits(user_id)
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))?;
    Ok(Json(deposits))
}

async fn metrics_handler() -> String {
    metrics::render()
}

pub fn build_router<S: Storage>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health/:chain", axum::routing::get(health_handler::<S>))
        .route(
            "/deposits/:user_id",
            axum::routing::get(deposits_handler::<S>),
        )
        .route("/metrics", axum::routing::get(metrics_handler))
        .layer(RequestBodyLimitLayer::new(1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
