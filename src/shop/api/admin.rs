use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;

use super::{ApiError, PageQuery, SharedState};
use crate::errors::ShopError;
use crate::shop::auth::AuthUser;
use crate::shop::models::{Permission, Role, User, UserFilter, UserPatch};

#[derive(Deserialize)]
pub struct PermissionsRequest {
    pub permissions: Vec<Permission>,
}

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/admin/dashboard", get(dashboard))
        .route("/api/admin/users", get(list_users))
        .route(
            "/api/admin/users/{id}",
            get(get_user).patch(update_user).delete(delete_user),
        )
        .route(
            "/api/admin/users/{id}/permissions",
            get(get_permissions).put(put_permissions),
        )
}

async fn dashboard(
    State(state): State<SharedState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    user.require_back_office()?;
    let stats = state.db.call(|db| db.dashboard_stats()).await?;
    Ok(Json(stats))
}

async fn list_users(
    State(state): State<SharedState>,
    user: AuthUser,
    Query(page): Query<PageQuery>,
    Query(filter): Query<UserFilter>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Users).await?;
    let pagination = page.pagination();
    let users = state
        .db
        .call(move |db| db.list_users(&filter, pagination))
        .await?;
    Ok(Json(users))
}

async fn get_user(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Users).await?;
    match state.db.call(move |db| db.get_user(id)).await? {
        Some(found) => Ok(Json(found)),
        None => Err(ShopError::not_found("User", id).into()),
    }
}

async fn update_user(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(patch): Json<UserPatch>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Users).await?;
    let AuthUser(actor) = user;
    if actor.id == id && (patch.active == Some(false) || patch.role.is_some_and(|r| r != actor.role)) {
        return Err(ShopError::Validation(
            "You cannot deactivate your own account or change your own role".into(),
        )
        .into());
    }
    // Only admins hand out the admin role.
    if patch.role == Some(Role::Admin) && actor.role != Role::Admin {
        return Err(ShopError::Forbidden("Only admins can grant the admin role".into()).into());
    }
    ensure_may_manage(&state, &actor, id).await?;
    let updated = state.db.call(move |db| db.update_user(id, &patch)).await?;
    tracing::info!(actor = actor.id, user_id = id, role = %updated.role, "User updated");
    Ok(Json(updated))
}

async fn delete_user(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Users).await?;
    if user.0.id == id {
        return Err(ShopError::Validation("You cannot delete your own account".into()).into());
    }
    ensure_may_manage(&state, &user.0, id).await?;
    match state.db.call(move |db| db.delete_user(id)).await? {
        true => {
            tracing::info!(actor = user.0.id, user_id = id, "User deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        false => Err(ShopError::not_found("User", id).into()),
    }
}

/// Admin accounts can only be changed or removed by another admin.
async fn ensure_may_manage(state: &SharedState, actor: &User, target_id: i64) -> Result<(), ApiError> {
    if actor.role == Role::Admin {
        return Ok(());
    }
    let target = state
        .db
        .call(move |db| {
            let user = db
                .get_user(target_id)?
                .ok_or_else(|| ShopError::not_found("User", target_id))?;
            Ok(user)
        })
        .await?;
    if target.role == Role::Admin {
        return Err(ShopError::Forbidden("Only admins can manage admin accounts".into()).into());
    }
    Ok(())
}

async fn get_permissions(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Users).await?;
    let permissions = state
        .db
        .call(move |db| {
            db.get_user(id)?
                .ok_or_else(|| ShopError::not_found("User", id))?;
            db.get_permissions(id)
        })
        .await?;
    Ok(Json(permissions))
}

/// Replace a staff member's permission list. Admin only.
async fn put_permissions(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<PermissionsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if user.0.role != Role::Admin {
        return Err(ShopError::Forbidden("Only admins can change permissions".into()).into());
    }
    let permissions = state
        .db
        .call(move |db| {
            let target = db
                .get_user(id)?
                .ok_or_else(|| ShopError::not_found("User", id))?;
            if target.role != Role::Staff {
                return Err(ShopError::Validation(format!(
                    "Permissions apply to staff accounts; user {} is {}",
                    id, target.role
                ))
                .into());
            }
            db.set_permissions(id, &req.permissions)
        })
        .await?;
    tracing::info!(user_id = id, count = permissions.len(), "Permissions updated");
    Ok(Json(permissions))
}
