use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Error;
use crate::images::S3ImageStore;
use crate::models::{ProductImage, ProductInfo, RegisterRequest};
use crate::registration::RegistrationService;
use crate::vectorizer::GrpcVectorizer;

pub type Registration = RegistrationService<S3ImageStore, GrpcVectorizer>;

#[derive(Clone)]
pub struct AppState {
    pub registration: Arc<Registration>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct RegisterProductRequest {
    pub name: String,
    pub category: String,
    pub price: i64,
    pub images: Vec<ImagePayload>,
}

#[derive(Debug, Deserialize)]
pub struct ImagePayload {
    pub filename: String,
    pub mime: String,
    // base64-encoded image bytes
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterProductResponse {
    pub event_id: Uuid,
    pub product_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ProductsQuery {
    // comma-separated product ids
    pub ids: String,
}

#[derive(Debug, Serialize)]
pub struct ProductsResponse {
    pub products: Vec<ProductInfo>,
    pub not_found: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/products", post(register_product).get(get_products))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub fn register_product(
    State(state): State<AppState>,
    Json(request): Json<RegisterProductRequest>,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<Json<RegisterProductResponse>, (StatusCode, Json<ErrorResponse>)>> + Send>,
> {
    Box::pin(register_product_inner(state, request))
}

async fn register_product_inner(
    state: AppState,
    request: RegisterProductRequest,
) -> Result<Json<RegisterProductResponse>, (StatusCode, Json<ErrorResponse>)> {
    let mut images = Vec::with_capacity(request.images.len());
    for image in request.images {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&image.data)
            .map_err(|err| {
                bad_request(format!("invalid encoding for image '{}': {err}", image.filename))
            })?;
        images.push(ProductImage {
            size: bytes.len() as i64,
            bytes,
            mime: image.mime,
            filename: image.filename,
        });
    }

    let req = RegisterRequest {
        name: request.name,
        category_name: request.category,
        price: request.price,
        images,
    };

    // request work stops when the process begins shutting down
    let cancel = state.shutdown.child_token();
    match state.registration.register(&cancel, req).await {
        Ok(event) => Ok(Json(RegisterProductResponse {
            event_id: event.event_id,
            product_id: event.product_id,
        })),
        Err(err) => {
            tracing::error!("product registration failed: {err}");
            Err(error_response(err))
        }
    }
}

pub fn get_products(
    State(state): State<AppState>,
    Query(query): Query<ProductsQuery>,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<Json<ProductsResponse>, (StatusCode, Json<ErrorResponse>)>> + Send>,
> {
    Box::pin(get_products_inner(state, query))
}

async fn get_products_inner(
    state: AppState,
    query: ProductsQuery,
) -> Result<Json<ProductsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let ids = query
        .ids
        .split(',')
        .filter(|part| !part.is_empty())
        .map(|part| part.trim().parse::<i64>())
        .collect::<Result<Vec<i64>, _>>()
        .map_err(|err| bad_request(format!("invalid product id: {err}")))?;

    match state.registration.get_products_info(&ids).await {
        Ok((products, not_found)) => Ok(Json(ProductsResponse {
            products,
            not_found,
        })),
        Err(err) => {
            tracing::error!("product lookup failed: {err}");
            Err(error_response(err))
        }
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}

fn bad_request(message: String) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: message }))
}

fn error_response(err: Error) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse { error: err.to_string() }))
}
