use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;

use super::{ApiError, PageQuery, SharedState};
use crate::errors::ShopError;
use crate::shop::auth::{AuthUser, REF_COOKIE, cookie_value};
use crate::shop::models::{CheckoutInput, OrderFilter, OrderTransition, Permission};
use crate::shop::ws::{WsMessage, broadcast_message};
use apothecary_common::{OrderStatus, PaymentStatus};

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: OrderStatus,
}

#[derive(Deserialize)]
pub struct PaymentRequest {
    pub status: PaymentStatus,
}

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/orders", get(list_my_orders).post(checkout))
        .route("/api/orders/{id}", get(get_my_order))
        .route("/api/orders/{id}/cancel", post(cancel_my_order))
        .route("/api/admin/orders", get(admin_list_orders))
        .route("/api/admin/orders/{id}", get(admin_get_order))
        .route("/api/admin/orders/{id}/status", patch(update_status))
        .route("/api/admin/orders/{id}/payment", patch(update_payment))
}

fn notify_transition(state: &SharedState, transition: &OrderTransition) {
    broadcast_message(
        &state.ws_tx,
        &WsMessage::OrderStatusChanged {
            order_id: transition.order.id,
            order_code: transition.order.order_code.clone(),
            from: transition.from,
            to: transition.order.status,
        },
    );
}

// ── Customer ──────────────────────────────────────────────────────────

async fn checkout(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    jar: CookieJar,
    Json(input): Json<CheckoutInput>,
) -> Result<impl IntoResponse, ApiError> {
    let ref_code = cookie_value(&jar, REF_COOKIE);
    let detail = state
        .db
        .call(move |db| db.checkout(user.id, input, ref_code.as_deref()))
        .await?;

    tracing::info!(
        order_id = detail.order.id,
        code = %detail.order.order_code,
        total = detail.order.total,
        "Order placed"
    );
    broadcast_message(
        &state.ws_tx,
        &WsMessage::OrderCreated {
            order: detail.order.clone(),
        },
    );
    if let Some(commission) = &detail.commission {
        broadcast_message(
            &state.ws_tx,
            &WsMessage::CommissionCreated {
                commission: commission.clone(),
            },
        );
    }
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn list_my_orders(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Query(page): Query<PageQuery>,
    Query(mut filter): Query<OrderFilter>,
) -> Result<impl IntoResponse, ApiError> {
    filter.user_id = Some(user.id);
    let pagination = page.pagination();
    let orders = state
        .db
        .call(move |db| db.list_orders(&filter, pagination))
        .await?;
    Ok(Json(orders))
}

async fn get_my_order(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    match state.db.call(move |db| db.get_order_detail(id)).await? {
        Some(detail) if detail.order.user_id == user.id => Ok(Json(detail)),
        _ => Err(ShopError::not_found("Order", id).into()),
    }
}

async fn cancel_my_order(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let transition = state
        .db
        .call(move |db| db.cancel_own_order(user.id, id))
        .await?;
    notify_transition(&state, &transition);
    Ok(Json(transition.order))
}

// ── Back-office ───────────────────────────────────────────────────────

async fn admin_list_orders(
    State(state): State<SharedState>,
    user: AuthUser,
    Query(page): Query<PageQuery>,
    Query(filter): Query<OrderFilter>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Orders).await?;
    let pagination = page.pagination();
    let orders = state
        .db
        .call(move |db| db.list_orders(&filter, pagination))
        .await?;
    Ok(Json(orders))
}

async fn admin_get_order(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Orders).await?;
    match state.db.call(move |db| db.get_order_detail(id)).await? {
        Some(detail) => Ok(Json(detail)),
        None => Err(ShopError::not_found("Order", id).into()),
    }
}

async fn update_status(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<StatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Orders).await?;
    let transition = state
        .db
        .call(move |db| db.update_order_status(id, req.status))
        .await?;
    notify_transition(&state, &transition);
    Ok(Json(transition.order))
}

async fn update_payment(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<PaymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Orders).await?;
    let payment = state
        .db
        .call(move |db| db.update_payment_status(id, req.status))
        .await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::PaymentUpdated {
            order_id: id,
            status: payment.status,
        },
    );
    Ok(Json(payment))
}
