use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use super::{ApiError, SharedState};
use crate::errors::ShopError;
use crate::shop::auth::AuthUser;
use crate::shop::db::{AFFILIATE_KEY, is_reserved_key};
use crate::shop::models::{AffiliateSettings, Permission};

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/settings/homepage", get(homepage))
        .route("/api/admin/settings", get(list_settings))
        .route(
            "/api/admin/settings/{key}",
            get(get_setting).put(put_setting).delete(delete_setting),
        )
}

fn check_key(key: &str) -> Result<(), ApiError> {
    if is_reserved_key(key) {
        return Err(ShopError::Forbidden(format!(
            "Setting '{}' is managed through the user permissions API",
            key
        ))
        .into());
    }
    Ok(())
}

async fn homepage(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let blocks = state.db.call(|db| db.homepage_blocks()).await?;
    Ok(Json(blocks))
}

async fn list_settings(
    State(state): State<SharedState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Settings).await?;
    let settings = state.db.call(|db| db.list_settings()).await?;
    Ok(Json(settings))
}

async fn get_setting(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Settings).await?;
    check_key(&key)?;
    let lookup = key.clone();
    match state.db.call(move |db| db.get_setting(&lookup)).await? {
        Some(setting) => Ok(Json(setting)),
        None => Err(ShopError::not_found("Setting", key).into()),
    }
}

/// Store any JSON value under `key`. The affiliate program entry is
/// validated as [`AffiliateSettings`] first.
async fn put_setting(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(key): Path<String>,
    Json(value): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Settings).await?;
    check_key(&key)?;
    let setting = if key == AFFILIATE_KEY {
        let settings: AffiliateSettings = serde_json::from_value(value).map_err(|e| {
            ShopError::Validation(format!("Invalid affiliate settings: {}", e))
        })?;
        state
            .db
            .call(move |db| {
                db.update_affiliate_settings(&settings)?;
                db.get_setting(AFFILIATE_KEY)
            })
            .await?
    } else {
        let stored_key = key.clone();
        state
            .db
            .call(move |db| db.put_setting(&stored_key, &value).map(Some))
            .await?
    };
    match setting {
        Some(setting) => {
            tracing::info!(key = %setting.key, "Setting updated");
            Ok(Json(setting))
        }
        None => Err(ShopError::not_found("Setting", key).into()),
    }
}

async fn delete_setting(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Settings).await?;
    check_key(&key)?;
    let lookup = key.clone();
    match state.db.call(move |db| db.delete_setting(&lookup)).await? {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ShopError::not_found("Setting", key).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::shop::models::Role;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_homepage_blocks_are_public() {
        let state = test_state();
        let app = app(&state);
        let (_, token) = sign_in(&state, "admin@example.com", Role::Admin);

        let response = app
            .clone()
            .oneshot(request(
                "PUT",
                "/api/admin/settings/hero",
                Some(&token),
                Some(serde_json::json!({"title": "Đông y gia truyền", "image": "/uploads/hero.png"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request("GET", "/api/settings/homepage", None, None))
            .await
            .unwrap();
        let blocks: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(blocks["hero"]["title"], "Đông y gia truyền");
        assert!(blocks.get("about").is_none());
    }

    #[tokio::test]
    async fn test_affiliate_key_is_validated() {
        let state = test_state();
        let app = app(&state);
        let (_, token) = sign_in(&state, "admin@example.com", Role::Admin);

        let response = app
            .clone()
            .oneshot(request(
                "PUT",
                "/api/admin/settings/affiliate",
                Some(&token),
                Some(serde_json::json!({"cookie_days": 0})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(request(
                "PUT",
                "/api/admin/settings/affiliate",
                Some(&token),
                Some(serde_json::json!("not an object")),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_permission_entries_are_reserved() {
        let state = test_state();
        let (staff, _) = sign_in(&state, "staff@example.com", Role::Staff);
        let (_, token) = sign_in(&state, "admin@example.com", Role::Admin);
        let uri = format!("/api/admin/settings/permissions:user:{}", staff.id);
        let response = app(&state)
            .oneshot(request("PUT", &uri, Some(&token), Some(serde_json::json!(["users"]))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_delete_and_missing_setting() {
        let state = test_state();
        let app = app(&state);
        let (_, token) = sign_in(&state, "admin@example.com", Role::Admin);
        app.clone()
            .oneshot(request(
                "PUT",
                "/api/admin/settings/contact",
                Some(&token),
                Some(serde_json::json!({"phone": "1900 1234"})),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(request("DELETE", "/api/admin/settings/contact", Some(&token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(request("GET", "/api/admin/settings/contact", Some(&token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_staff_without_settings_permission_is_forbidden() {
        let state = test_state();
        let (_, token) = sign_in(&state, "staff@example.com", Role::Staff);
        let response = app(&state)
            .oneshot(request("GET", "/api/admin/settings", Some(&token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
