//! HTTP handlers, grouped by feature.
//!
//! Every handler follows the same shape: extract and check the caller,
//! run the database work through `DbHandle::call`, broadcast admin events
//! where relevant, and return JSON. Failures become [`ApiError`], which
//! renders `{"error": "<message>"}` with a matching status code.

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tokio::sync::broadcast;

use super::auth::TokenKeys;
use super::db::DbHandle;
use super::media::MediaStore;
use crate::errors::ShopError;
use apothecary_common::Pagination;

mod admin;
mod affiliate;
mod auth;
mod cart;
mod catalog;
mod orders;
mod posts;
mod settings;
mod uploads;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<String>,
    pub tokens: TokenKeys,
    pub media: Arc<dyn MediaStore>,
    /// Request body cap for upload routes.
    pub max_upload_bytes: usize,
    pub cookie_secure: bool,
}

pub type SharedState = Arc<AppState>;

// ── Query types ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl PageQuery {
    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.page, self.limit)
    }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl ApiError {
    fn from_shop(err: &ShopError) -> Self {
        let message = err.to_string();
        match err {
            ShopError::NotFound { .. } => ApiError::NotFound(message),
            ShopError::Validation(_)
            | ShopError::InvalidTransition { .. }
            | ShopError::InsufficientStock { .. }
            | ShopError::Common(_) => ApiError::BadRequest(message),
            ShopError::Conflict(_) => ApiError::Conflict(message),
            ShopError::Unauthorized | ShopError::InvalidCredentials => {
                ApiError::Unauthorized(message)
            }
            ShopError::Forbidden(_) => ApiError::Forbidden(message),
            ShopError::LockPoisoned => ApiError::Internal(message),
        }
    }
}

impl From<ShopError> for ApiError {
    fn from(err: ShopError) -> Self {
        ApiError::from_shop(&err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<ShopError>() {
            Some(shop) => ApiError::from_shop(shop),
            None => {
                tracing::error!(error = ?err, "Request failed");
                ApiError::Internal("Internal server error".to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .merge(auth::routes())
        .merge(catalog::routes())
        .merge(posts::routes())
        .merge(cart::routes())
        .merge(orders::routes())
        .merge(affiliate::routes())
        .merge(settings::routes())
        .merge(admin::routes())
        .merge(uploads::routes())
}

async fn health_check() -> &'static str {
    "ok"
}

// ── Test support ──────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::shop::db::ShopDb;
    use crate::shop::media::LocalMediaStore;
    use crate::shop::models::{Role, User};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;

    pub fn test_state() -> SharedState {
        let db = ShopDb::new_in_memory().unwrap();
        let (ws_tx, _) = broadcast::channel(16);
        let uploads = std::env::temp_dir().join(format!("apothecary-test-{}", uuid::Uuid::new_v4()));
        Arc::new(AppState {
            db: DbHandle::new(db),
            ws_tx,
            tokens: TokenKeys::new("test-secret", 1),
            media: Arc::new(LocalMediaStore::new(uploads, 1024 * 1024)),
            max_upload_bytes: 1024 * 1024,
            cookie_secure: false,
        })
    }

    pub fn app(state: &SharedState) -> Router {
        api_router().with_state(state.clone())
    }

    /// Create a user directly in the database and return a bearer token.
    pub fn sign_in(state: &SharedState, email: &str, role: Role) -> (User, String) {
        let user = state
            .db
            .lock_sync()
            .unwrap()
            .create_user(email, "unused", "Test User", None, role)
            .unwrap();
        let token = state.tokens.issue(&user).unwrap();
        (user, token)
    }

    pub fn request(
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    pub async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_check() {
        let state = test_state();
        let response = app(&state)
            .oneshot(request("GET", "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_shop_errors_map_to_status_codes() {
        let cases = [
            (ShopError::not_found("Product", 1), StatusCode::NOT_FOUND),
            (ShopError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ShopError::Conflict("x".into()), StatusCode::CONFLICT),
            (ShopError::Unauthorized, StatusCode::UNAUTHORIZED),
            (ShopError::Forbidden("x".into()), StatusCode::FORBIDDEN),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_anyhow_context_keeps_status() {
        let err = anyhow::Error::new(ShopError::Conflict("dup".into())).context("while saving");
        assert_eq!(
            ApiError::from(err).into_response().status(),
            StatusCode::CONFLICT
        );
        let opaque = anyhow::anyhow!("disk on fire");
        assert_eq!(
            ApiError::from(opaque).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
