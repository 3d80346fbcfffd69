use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch},
};

use super::{ApiError, PageQuery, SharedState};
use crate::errors::ShopError;
use crate::shop::auth::AuthUser;
use crate::shop::models::{Permission, PostCategoryInput, PostFilter, PostInput};

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/post-categories", get(list_post_categories))
        .route("/api/posts", get(list_posts))
        .route("/api/posts/{slug}", get(view_post))
        .route(
            "/api/admin/post-categories",
            get(list_post_categories).post(create_post_category),
        )
        .route(
            "/api/admin/post-categories/{id}",
            patch(update_post_category).delete(delete_post_category),
        )
        .route("/api/admin/posts", get(admin_list_posts).post(create_post))
        .route(
            "/api/admin/posts/{id}",
            get(admin_get_post).patch(update_post).delete(delete_post),
        )
}

async fn list_post_categories(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let categories = state.db.call(|db| db.list_post_categories()).await?;
    Ok(Json(categories))
}

async fn list_posts(
    State(state): State<SharedState>,
    Query(page): Query<PageQuery>,
    Query(mut filter): Query<PostFilter>,
) -> Result<impl IntoResponse, ApiError> {
    filter.include_drafts = false;
    let pagination = page.pagination();
    let posts = state
        .db
        .call(move |db| db.list_posts(&filter, pagination))
        .await?;
    Ok(Json(posts))
}

async fn view_post(
    State(state): State<SharedState>,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = slug.clone();
    match state
        .db
        .call(move |db| db.view_published_post(&lookup))
        .await?
    {
        Some(post) => Ok(Json(post)),
        None => Err(ShopError::not_found("Post", slug).into()),
    }
}

async fn create_post_category(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(input): Json<PostCategoryInput>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Posts).await?;
    let category = state
        .db
        .call(move |db| db.create_post_category(input))
        .await?;
    Ok((StatusCode::CREATED, Json(category)))
}

async fn update_post_category(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(input): Json<PostCategoryInput>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Posts).await?;
    let category = state
        .db
        .call(move |db| db.update_post_category(id, input))
        .await?;
    Ok(Json(category))
}

async fn delete_post_category(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Posts).await?;
    match state.db.call(move |db| db.delete_post_category(id)).await? {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ShopError::not_found("Post category", id).into()),
    }
}

async fn admin_list_posts(
    State(state): State<SharedState>,
    user: AuthUser,
    Query(page): Query<PageQuery>,
    Query(mut filter): Query<PostFilter>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Posts).await?;
    filter.include_drafts = true;
    let pagination = page.pagination();
    let posts = state
        .db
        .call(move |db| db.list_posts(&filter, pagination))
        .await?;
    Ok(Json(posts))
}

async fn admin_get_post(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Posts).await?;
    match state.db.call(move |db| db.get_post(id)).await? {
        Some(post) => Ok(Json(post)),
        None => Err(ShopError::not_found("Post", id).into()),
    }
}

async fn create_post(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(input): Json<PostInput>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Posts).await?;
    let author_id = user.0.id;
    let post = state
        .db
        .call(move |db| db.create_post(author_id, input))
        .await?;
    tracing::info!(post_id = post.id, status = post.status.as_str(), "Created post");
    Ok((StatusCode::CREATED, Json(post)))
}

async fn update_post(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(input): Json<PostInput>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Posts).await?;
    let post = state.db.call(move |db| db.update_post(id, input)).await?;
    Ok(Json(post))
}

async fn delete_post(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Posts).await?;
    match state.db.call(move |db| db.delete_post(id)).await? {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ShopError::not_found("Post", id).into()),
    }
}
