use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use shared::*;
use std::sync::Arc;

use crate::coordinator::RentalCoordinator;
use crate::store::RentalStore;

pub const PRINCIPAL_HEADER: &str = "x-principal-id";

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RentalCoordinator>,
    pub store: Arc<dyn RentalStore>,
    pub identity: Arc<dyn IdentityProvider>,
}

/// Resolves the authenticated caller. Verification happens upstream; the
/// rental core only ever receives the resulting id.
pub trait IdentityProvider: Send + Sync {
    fn principal(&self, headers: &HeaderMap) -> Option<UserId>;
}

/// Trusts the principal id forwarded by an authenticating gateway.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedHeaderIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal(pub UserId);

#[derive(Debug, Deserialize)]
pub struct RentRequest {
    pub item_id: ItemId,
}

#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IdentityProvider for TrustedHeaderIdentity {
    fn principal(&self, headers: &HeaderMap) -> Option<UserId> {
        headers
            .get(PRINCIPAL_HEADER)?
            .to_str()
            .ok()?
            .trim()
            .parse::<UserId>()
            .ok()
            .filter(|id| *id > 0)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        state
            .identity
            .principal(&parts.headers)
            .map(Principal)
            .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "Unauthorized"))
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/items", get(list_items).post(create_item))
        .route("/items/:id", get(get_item))
        .route("/rentals", get(list_rentals).post(rent))
        .route("/rentals/:id/return", post(return_item))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn status_of(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

pub async fn rent(
    State(state): State<AppState>,
    Principal(user_id): Principal,
    Json(request): Json<RentRequest>,
) -> Result<(StatusCode, Json<DataResponse<RentalWithItem>>), ApiError> {
    let outcome = state.coordinator.rent(user_id, request.item_id).await;
    let status = status_of(outcome.status_code());
    let message = outcome.message();

    match outcome {
        RentOutcome::Created(rental) => Ok((status, Json(DataResponse { data: rental }))),
        RentOutcome::ItemNotFound | RentOutcome::OutOfStock | RentOutcome::Internal => {
            Err(error_response(status, message))
        }
    }
}

pub async fn return_item(
    State(state): State<AppState>,
    Principal(user_id): Principal,
    Path(rental_id): Path<RentalId>,
) -> Result<Json<DataResponse<RentalWithItem>>, ApiError> {
    let outcome = state.coordinator.return_item(user_id, rental_id).await;
    let status = status_of(outcome.status_code());
    let message = outcome.message();

    match outcome {
        ReturnOutcome::Returned(rental) => Ok(Json(DataResponse { data: rental })),
        ReturnOutcome::RentalNotFound
        | ReturnOutcome::Forbidden
        | ReturnOutcome::AlreadyReturned
        | ReturnOutcome::ItemMissing
        | ReturnOutcome::Internal => Err(error_response(status, message)),
    }
}

pub async fn list_rentals(
    State(state): State<AppState>,
    Principal(user_id): Principal,
    Query(page): Query<PageRequest>,
) -> Result<Json<Page<RentalWithItem>>, ApiError> {
    match state.coordinator.list_rentals(user_id, page).await {
        Ok(rentals) => Ok(Json(rentals)),
        Err(e) => {
            tracing::error!("Failed to list rentals for user {}: {}", user_id, e);
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list rentals"))
        }
    }
}

pub async fn list_items(
    State(state): State<AppState>,
    _principal: Principal,
    Query(page): Query<PageRequest>,
) -> Result<Json<Page<Item>>, ApiError> {
    match state.store.list_items(page).await {
        Ok(items) => Ok(Json(items)),
        Err(e) => {
            tracing::error!("Failed to list items: {}", e);
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list items"))
        }
    }
}

pub async fn get_item(
    State(state): State<AppState>,
    _principal: Principal,
    Path(item_id): Path<ItemId>,
) -> Result<Json<DataResponse<Item>>, ApiError> {
    match state.store.find_item(item_id).await {
        Ok(Some(item)) => Ok(Json(DataResponse { data: item })),
        Ok(None) => Err(error_response(StatusCode::NOT_FOUND, "Item not found")),
        Err(e) => {
            tracing::error!("Failed to load item {}: {}", item_id, e);
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load item"))
        }
    }
}

pub async fn create_item(
    State(state): State<AppState>,
    _principal: Principal,
    Json(request): Json<NewItem>,
) -> Result<(StatusCode, Json<DataResponse<Item>>), ApiError> {
    if let Err(message) = request.validate() {
        return Err(error_response(StatusCode::UNPROCESSABLE_ENTITY, message));
    }

    match state.store.create_item(request).await {
        Ok(item) => {
            tracing::info!("Created item {} with stock {}", item.id, item.stock);
            Ok((StatusCode::CREATED, Json(DataResponse { data: item })))
        }
        Err(e) => {
            tracing::error!("Failed to create item: {}", e);
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create item"))
        }
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}
