//! REST API endpoints.
//!
//! HTTP surface alongside the WebSocket gateway:
//! - `GET /api/health` - liveness plus oracle credential status
//! - `GET /api/test` - end-to-end pricing oracle connectivity check
//! - `GET /api/mandi-prices` - live prices for every staple product
//! - `GET /api/products/{category}` - priced catalog for one category
//! - `POST /api/transform-message` - one-shot message transform
//! - `GET /api/languages` - supported working languages

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use mandi_common::{Language, ProductCategory, Role};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::gateway::SharedCoreServices;
use crate::oracle::{KeyRing, OracleError};

/// Default market location for price lookups.
const DEFAULT_LOCATION: &str = "Chennai";

/// API error response.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("bad_request", message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new("upstream_error", message)
    }
}

fn oracle_error_response(e: OracleError) -> (StatusCode, Json<ApiError>) {
    error!(error = %e, "Oracle call failed");
    let status = match e {
        OracleError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(ApiError::upstream(e.to_string())))
}

/// Shared state for API handlers.
pub struct ApiState {
    pub services: SharedCoreServices,
    pub oracle_keys: Arc<KeyRing>,
}

#[derive(Debug, Deserialize)]
struct LocationQuery {
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PricesQuery {
    location: Option<String>,
    /// Restrict the response to one product.
    product: Option<String>,
}

/// Health check: process liveness and credential ring status.
async fn health_check(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.services.store.len(),
        "oracle_keys": state.oracle_keys.len(),
        "oracle_key_index": state.oracle_keys.current_index(),
    }))
}

/// Connectivity check against the pricing oracle.
async fn oracle_test(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let quote = state
        .services
        .pricing
        .market_price("Tomato", DEFAULT_LOCATION)
        .await
        .map_err(oracle_error_response)?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "sample_product": "Tomato",
        "price": quote.price,
        "trend": quote.trend,
    })))
}

/// Live prices for every staple product (both categories), or a single
/// product when `?product=` is given.
async fn mandi_prices(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<PricesQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let location = query.location.unwrap_or_else(|| DEFAULT_LOCATION.to_string());

    if let Some(product) = query.product {
        let quote = state
            .services
            .pricing
            .market_price(&product, &location)
            .await
            .map_err(oracle_error_response)?;
        return Ok(Json(serde_json::json!({
            "location": location,
            "product": product,
            "price": quote.price,
            "trend": quote.trend,
        })));
    }

    let mut products = Vec::new();
    for category in [ProductCategory::Vegetables, ProductCategory::Fruits] {
        let priced = state
            .services
            .pricing
            .price_catalog(category, &location)
            .await
            .map_err(oracle_error_response)?;
        products.extend(priced);
    }
    info!(location = %location, count = products.len(), "Mandi prices served");
    Ok(Json(serde_json::json!({ "location": location, "products": products })))
}

/// Priced catalog for one category.
async fn products_by_category(
    State(state): State<Arc<ApiState>>,
    Path(category): Path<String>,
    Query(query): Query<LocationQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let category = ProductCategory::parse(&category).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(ApiError::bad_request(format!(
                "unknown category: {category}"
            ))),
        )
    })?;
    let location = query.location.unwrap_or_else(|| DEFAULT_LOCATION.to_string());
    let products = state
        .services
        .pricing
        .price_catalog(category, &location)
        .await
        .map_err(oracle_error_response)?;

    Ok(Json(serde_json::json!({
        "category": category,
        "location": location,
        "products": products,
    })))
}

#[derive(Debug, Deserialize)]
struct TransformRequest {
    text: String,
    sender: Role,
    source: Language,
    target: Language,
}

/// One-shot message transform outside a session.
async fn transform_message(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<TransformRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    if req.text.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::bad_request("text must not be empty")),
        ));
    }
    let message = state
        .services
        .relay
        .relay(&req.text, req.sender, req.source, req.target)
        .await;

    Ok(Json(serde_json::json!({
        "original": message.original,
        "transformed": message.rendered,
        "sentiment": message.sentiment,
    })))
}

/// Supported working languages.
async fn languages() -> impl IntoResponse {
    let list: Vec<_> = Language::all()
        .iter()
        .map(|l| {
            serde_json::json!({
                "code": l.code(),
                "name": l.name(),
                "native_name": l.native_name(),
            })
        })
        .collect();
    Json(serde_json::json!({ "languages": list }))
}

/// Configuration for the REST API server.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port to listen on.
    pub port: u16,
    /// Enable CORS for frontend development.
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            port: 3002,
            enable_cors: true,
        }
    }
}

/// Create the API router with all endpoints.
pub fn create_api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/test", get(oracle_test))
        .route("/api/mandi-prices", get(mandi_prices))
        .route("/api/products/{category}", get(products_by_category))
        .route("/api/transform-message", post(transform_message))
        .route("/api/languages", get(languages))
        .with_state(state)
}

/// Run the API server. Blocks until the listener fails.
pub async fn run_api_server(config: ApiServerConfig, state: Arc<ApiState>) -> anyhow::Result<()> {
    let app = create_api_router(state);

    let app = if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app.layer(cors)
    } else {
        app
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(port = config.port, "REST API server started");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Spawn the API server as a background task.
pub fn spawn_api_server(
    config: ApiServerConfig,
    state: Arc<ApiState>,
) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_api_server(config, state).await })
}
