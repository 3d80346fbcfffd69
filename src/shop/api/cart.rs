use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
};
use serde::Deserialize;

use super::{ApiError, SharedState};
use crate::shop::auth::AuthUser;

#[derive(Deserialize)]
pub struct AddItemRequest {
    pub product_id: i64,
    #[serde(default = "one")]
    pub quantity: i64,
}

fn one() -> i64 {
    1
}

#[derive(Deserialize)]
pub struct SetQuantityRequest {
    pub quantity: i64,
}

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/cart", get(get_cart).delete(clear_cart))
        .route("/api/cart/items", post(add_item))
        .route(
            "/api/cart/items/{product_id}",
            patch(set_quantity).delete(remove_item),
        )
}

async fn get_cart(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state.db.call(move |db| db.get_cart(user.id)).await?;
    Ok(Json(cart))
}

async fn add_item(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(req): Json<AddItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .db
        .call(move |db| db.add_to_cart(user.id, req.product_id, req.quantity))
        .await?;
    Ok(Json(cart))
}

async fn set_quantity(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(product_id): Path<i64>,
    Json(req): Json<SetQuantityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .db
        .call(move |db| db.set_cart_quantity(user.id, product_id, req.quantity))
        .await?;
    Ok(Json(cart))
}

async fn remove_item(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(product_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .db
        .call(move |db| db.remove_from_cart(user.id, product_id))
        .await?;
    Ok(Json(cart))
}

async fn clear_cart(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    state.db.call(move |db| db.clear_cart(user.id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
