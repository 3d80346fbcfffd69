use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, patch},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;

use super::{ApiError, PageQuery, SharedState};
use crate::errors::ShopError;
use crate::shop::auth::{AuthUser, referral_cookie};
use crate::shop::models::{
    AffiliateLink, AffiliateLinkInput, AffiliateSettings, CommissionFilter, Permission, User,
};
use crate::shop::ws::{WsMessage, broadcast_message};
use apothecary_common::CommissionStatus;

#[derive(Deserialize)]
pub struct OwnerQuery {
    pub user_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct StatusQuery {
    pub status: Option<CommissionStatus>,
}

#[derive(Deserialize)]
pub struct PayoutRequest {
    pub user_id: i64,
    #[serde(default)]
    pub note: String,
}

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/r/{code}", get(follow_link))
        .route("/api/affiliate/links", get(list_my_links).post(create_my_link))
        .route(
            "/api/affiliate/links/{id}",
            patch(update_my_link).delete(delete_my_link),
        )
        .route("/api/affiliate/commissions", get(list_my_commissions))
        .route("/api/affiliate/payouts", get(list_my_payouts))
        .route("/api/affiliate/stats", get(my_stats))
        .route(
            "/api/admin/affiliate/settings",
            get(get_settings).put(put_settings),
        )
        .route("/api/admin/affiliate/links", get(admin_list_links))
        .route("/api/admin/affiliate/links/{id}", patch(admin_update_link))
        .route("/api/admin/affiliate/commissions", get(admin_list_commissions))
        .route(
            "/api/admin/affiliate/payouts",
            get(admin_list_payouts).post(create_payout),
        )
}

// ── Click tracking ────────────────────────────────────────────────────

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Count the click, drop the referral cookie, and send the visitor on.
async fn follow_link(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let ip = client_ip(&headers);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let lookup = code.clone();
    let (redirect, cookie_days) = state
        .db
        .call(move |db| {
            let redirect = db.record_click(&lookup, ip.as_deref(), user_agent.as_deref())?;
            Ok((redirect, db.affiliate_settings()?.cookie_days))
        })
        .await?;
    let Some(redirect) = redirect else {
        return Err(ShopError::not_found("Affiliate link", code).into());
    };
    tracing::debug!(link_id = redirect.link_id, location = %redirect.location, "Affiliate click");
    Ok((
        StatusCode::FOUND,
        [(header::LOCATION, redirect.location)],
        CookieJar::new().add(referral_cookie(code, cookie_days)),
    ))
}

// ── Referrer self-service ─────────────────────────────────────────────

/// Load link `id` only if `user` owns it.
async fn owned_link(state: &SharedState, user: &User, id: i64) -> Result<AffiliateLink, ApiError> {
    let owner = user.id;
    match state.db.call(move |db| db.get_affiliate_link(id)).await? {
        Some(link) if link.user_id == owner => Ok(link),
        _ => Err(ShopError::not_found("Affiliate link", id).into()),
    }
}

async fn list_my_links(
    State(state): State<SharedState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    user.require_referrer()?;
    let owner = user.0.id;
    let links = state
        .db
        .call(move |db| db.list_affiliate_links(Some(owner)))
        .await?;
    Ok(Json(links))
}

async fn create_my_link(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(input): Json<AffiliateLinkInput>,
) -> Result<impl IntoResponse, ApiError> {
    user.require_referrer()?;
    let AuthUser(user) = user;
    let may_set_rate = user.role.is_back_office();
    let link = state
        .db
        .call(move |db| db.create_affiliate_link(user.id, input, may_set_rate))
        .await?;
    tracing::info!(link_id = link.id, code = %link.code, "Created affiliate link");
    Ok((StatusCode::CREATED, Json(link)))
}

async fn update_my_link(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(input): Json<AffiliateLinkInput>,
) -> Result<impl IntoResponse, ApiError> {
    user.require_referrer()?;
    owned_link(&state, &user.0, id).await?;
    let may_set_rate = user.0.role.is_back_office();
    let link = state
        .db
        .call(move |db| db.update_affiliate_link(id, input, may_set_rate))
        .await?;
    Ok(Json(link))
}

async fn delete_my_link(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    user.require_referrer()?;
    owned_link(&state, &user.0, id).await?;
    state.db.call(move |db| db.delete_affiliate_link(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_my_commissions(
    State(state): State<SharedState>,
    user: AuthUser,
    Query(page): Query<PageQuery>,
    Query(query): Query<StatusQuery>,
) -> Result<impl IntoResponse, ApiError> {
    user.require_referrer()?;
    let filter = CommissionFilter {
        status: query.status,
        user_id: Some(user.0.id),
    };
    let pagination = page.pagination();
    let commissions = state
        .db
        .call(move |db| db.list_commissions(&filter, pagination))
        .await?;
    Ok(Json(commissions))
}

async fn list_my_payouts(
    State(state): State<SharedState>,
    user: AuthUser,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    user.require_referrer()?;
    let owner = user.0.id;
    let pagination = page.pagination();
    let payouts = state
        .db
        .call(move |db| db.list_payouts(Some(owner), pagination))
        .await?;
    Ok(Json(payouts))
}

async fn my_stats(
    State(state): State<SharedState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    user.require_referrer()?;
    let owner = user.0.id;
    let stats = state.db.call(move |db| db.affiliate_stats(owner)).await?;
    Ok(Json(stats))
}

// ── Back-office ───────────────────────────────────────────────────────

async fn get_settings(
    State(state): State<SharedState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Affiliate).await?;
    let settings = state.db.call(|db| db.affiliate_settings()).await?;
    Ok(Json(settings))
}

async fn put_settings(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(settings): Json<AffiliateSettings>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Affiliate).await?;
    let saved = state
        .db
        .call(move |db| db.update_affiliate_settings(&settings))
        .await?;
    tracing::info!(
        enabled = saved.enabled,
        base_rate_bps = saved.base_rate_bps,
        tiers = saved.tiers.len(),
        "Affiliate settings updated"
    );
    Ok(Json(saved))
}

async fn admin_list_links(
    State(state): State<SharedState>,
    user: AuthUser,
    Query(query): Query<OwnerQuery>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Affiliate).await?;
    let links = state
        .db
        .call(move |db| db.list_affiliate_links(query.user_id))
        .await?;
    Ok(Json(links))
}

async fn admin_update_link(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(input): Json<AffiliateLinkInput>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Affiliate).await?;
    let link = state
        .db
        .call(move |db| db.update_affiliate_link(id, input, true))
        .await?;
    Ok(Json(link))
}

async fn admin_list_commissions(
    State(state): State<SharedState>,
    user: AuthUser,
    Query(page): Query<PageQuery>,
    Query(filter): Query<CommissionFilter>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Affiliate).await?;
    let pagination = page.pagination();
    let commissions = state
        .db
        .call(move |db| db.list_commissions(&filter, pagination))
        .await?;
    Ok(Json(commissions))
}

async fn admin_list_payouts(
    State(state): State<SharedState>,
    user: AuthUser,
    Query(page): Query<PageQuery>,
    Query(query): Query<OwnerQuery>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Affiliate).await?;
    let pagination = page.pagination();
    let payouts = state
        .db
        .call(move |db| db.list_payouts(query.user_id, pagination))
        .await?;
    Ok(Json(payouts))
}

async fn create_payout(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(req): Json<PayoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Affiliate).await?;
    let payout = state
        .db
        .call(move |db| db.create_payout(req.user_id, &req.note))
        .await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::PayoutCreated {
            payout: payout.clone(),
        },
    );
    Ok((StatusCode::CREATED, Json(payout)))
}
