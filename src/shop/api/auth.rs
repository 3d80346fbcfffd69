use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};

use super::{ApiError, SharedState};
use crate::errors::ShopError;
use crate::shop::auth::{
    AuthUser, clear_session_cookie, hash_password, session_cookie, validate_email,
    validate_password, verify_password,
};
use crate::shop::models::{Permission, Role, User, UserPatch};

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub full_name: String,
    pub phone: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct ProfileRequest {
    pub full_name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub user: User,
    pub token: String,
}

#[derive(Serialize)]
pub struct MeResponse {
    #[serde(flatten)]
    pub user: User,
    pub permissions: Vec<Permission>,
}

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me).patch(update_me))
        .route("/api/auth/password", post(change_password))
}

fn session_response(state: &SharedState, status: StatusCode, user: User) -> Result<Response, ApiError> {
    let token = state.tokens.issue(&user)?;
    let jar = CookieJar::new().add(session_cookie(
        token.clone(),
        state.tokens.ttl_secs(),
        state.cookie_secure,
    ));
    Ok((status, jar, Json(SessionResponse { user, token })).into_response())
}

async fn register(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_email(&req.email)?;
    validate_password(&req.password)?;
    if req.full_name.trim().is_empty() {
        return Err(ShopError::Validation("full_name is required".into()).into());
    }
    let user = state
        .db
        .call(move |db| {
            let hash = hash_password(&req.password)?;
            db.create_user(
                &req.email,
                &hash,
                &req.full_name,
                req.phone.as_deref(),
                Role::Customer,
            )
        })
        .await?;
    tracing::info!(user_id = user.id, "Registered customer");
    session_response(&state, StatusCode::CREATED, user)
}

async fn login(
    State(state): State<SharedState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .db
        .call(move |db| {
            let Some((user, hash)) = db.get_user_credentials(&req.email)? else {
                return Err(ShopError::InvalidCredentials.into());
            };
            if !verify_password(&req.password, &hash) {
                return Err(ShopError::InvalidCredentials.into());
            }
            Ok(user)
        })
        .await?;
    if !user.active {
        return Err(ShopError::Forbidden("Account is disabled".into()).into());
    }
    session_response(&state, StatusCode::OK, user)
}

async fn logout(State(state): State<SharedState>) -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        CookieJar::new().add(clear_session_cookie(state.cookie_secure)),
    )
}

async fn me(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let permissions = match user.role {
        Role::Admin => Permission::ALL.to_vec(),
        Role::Staff => {
            let id = user.id;
            state.db.call(move |db| db.get_permissions(id)).await?
        }
        Role::Collaborator | Role::Customer => Vec::new(),
    };
    Ok(Json(MeResponse { user, permissions }))
}

async fn update_me(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(req): Json<ProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let patch = UserPatch {
        full_name: req.full_name,
        phone: req.phone,
        ..Default::default()
    };
    let updated = state
        .db
        .call(move |db| db.update_user(user.id, &patch))
        .await?;
    Ok(Json(updated))
}

async fn change_password(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_password(&req.new_password)?;
    state
        .db
        .call(move |db| {
            let current = db.get_password_hash(user.id)?;
            if !verify_password(&req.current_password, &current) {
                return Err(ShopError::InvalidCredentials.into());
            }
            db.set_password_hash(user.id, &hash_password(&req.new_password)?)
        })
        .await?;
    tracing::info!(user_id = user.id, "Password changed");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use axum::http::header;
    use tower::ServiceExt;

    fn register_body(email: &str) -> serde_json::Value {
        serde_json::json!({
            "email": email,
            "password": "mat-khau-123",
            "full_name": "Trần Thị B",
        })
    }

    #[tokio::test]
    async fn test_register_sets_cookie_and_returns_customer() {
        let state = test_state();
        let response = app(&state)
            .oneshot(request("POST", "/api/auth/register", None, Some(register_body("B@Example.com"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with("auth_token="));
        assert!(cookie.contains("HttpOnly"));

        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["user"]["email"], "b@example.com");
        assert_eq!(body["user"]["role"], "customer");
        assert!(body["user"].get("password_hash").is_none());
    }

    #[tokio::test]
    async fn test_register_duplicate_email_conflicts() {
        let state = test_state();
        let app = app(&state);
        app.clone()
            .oneshot(request("POST", "/api/auth/register", None, Some(register_body("b@example.com"))))
            .await
            .unwrap();
        let response = app
            .oneshot(request("POST", "/api/auth/register", None, Some(register_body("b@example.com"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_register_rejects_short_password() {
        let state = test_state();
        let mut body = register_body("b@example.com");
        body["password"] = "short".into();
        let response = app(&state)
            .oneshot(request("POST", "/api/auth/register", None, Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_login_then_me_with_cookie() {
        let state = test_state();
        let app = app(&state);
        app.clone()
            .oneshot(request("POST", "/api/auth/register", None, Some(register_body("b@example.com"))))
            .await
            .unwrap();

        let bad = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/auth/login",
                None,
                Some(serde_json::json!({"email": "b@example.com", "password": "nope-nope"})),
            ))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::UNAUTHORIZED);

        let ok = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/auth/login",
                None,
                Some(serde_json::json!({"email": "b@example.com", "password": "mat-khau-123"})),
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let cookie = ok.headers()[header::SET_COOKIE].to_str().unwrap();
        let pair = cookie.split(';').next().unwrap().to_string();

        let me = axum::http::Request::builder()
            .uri("/api/auth/me")
            .header(header::COOKIE, pair)
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(me).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["full_name"], "Trần Thị B");
        assert_eq!(body["permissions"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_logout_expires_session_cookie() {
        let state = test_state();
        let response = app(&state)
            .oneshot(request("POST", "/api/auth/logout", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("auth_token=;"));
        assert!(cookie.contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn test_me_requires_token() {
        let state = test_state();
        let response = app(&state)
            .oneshot(request("GET", "/api/auth/me", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(&state)
            .oneshot(request("GET", "/api/auth/me", Some("garbage"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_disabled_account_is_forbidden() {
        let state = test_state();
        let (user, token) = sign_in(&state, "s@example.com", Role::Staff);
        state
            .db
            .call(move |db| {
                db.update_user(
                    user.id,
                    &UserPatch {
                        active: Some(false),
                        ..Default::default()
                    },
                )
            })
            .await
            .unwrap();
        let response = app(&state)
            .oneshot(request("GET", "/api/auth/me", Some(&token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_me_lists_every_permission() {
        let state = test_state();
        let (_, token) = sign_in(&state, "a@example.com", Role::Admin);
        let response = app(&state)
            .oneshot(request("GET", "/api/auth/me", Some(&token), None))
            .await
            .unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["permissions"].as_array().unwrap().len(), Permission::ALL.len());
    }

    #[tokio::test]
    async fn test_change_password_checks_current() {
        let state = test_state();
        let app = app(&state);
        let response = app
            .clone()
            .oneshot(request("POST", "/api/auth/register", None, Some(register_body("b@example.com"))))
            .await
            .unwrap();
        let session: serde_json::Value = body_json(response.into_body()).await;
        let token = session["token"].as_str().unwrap().to_string();

        let wrong = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/auth/password",
                Some(&token),
                Some(serde_json::json!({"current_password": "bad-guess", "new_password": "moi-moi-123"})),
            ))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let ok = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/auth/password",
                Some(&token),
                Some(serde_json::json!({"current_password": "mat-khau-123", "new_password": "moi-moi-123"})),
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::NO_CONTENT);

        let login = app
            .oneshot(request(
                "POST",
                "/api/auth/login",
                None,
                Some(serde_json::json!({"email": "b@example.com", "password": "moi-moi-123"})),
            ))
            .await
            .unwrap();
        assert_eq!(login.status(), StatusCode::OK);
    }
}
