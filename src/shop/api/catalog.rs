use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use super::{ApiError, PageQuery, SharedState};
use crate::errors::ShopError;
use crate::shop::auth::AuthUser;
use crate::shop::models::{CategoryInput, Permission, ProductFilter, ProductInput};

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/categories", get(list_categories))
        .route("/api/categories/{slug}", get(get_category))
        .route("/api/products", get(list_products))
        .route("/api/products/{slug}", get(get_product))
        .route(
            "/api/admin/categories",
            get(list_categories).post(create_category),
        )
        .route(
            "/api/admin/categories/{id}",
            axum::routing::patch(update_category).delete(delete_category),
        )
        .route(
            "/api/admin/products",
            get(admin_list_products).post(create_product),
        )
        .route(
            "/api/admin/products/{id}",
            get(admin_get_product)
                .patch(update_product)
                .delete(delete_product),
        )
}

// ── Storefront ────────────────────────────────────────────────────────

async fn list_categories(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let categories = state.db.call(|db| db.list_categories()).await?;
    Ok(Json(categories))
}

async fn get_category(
    State(state): State<SharedState>,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = slug.clone();
    let category = state
        .db
        .call(move |db| db.get_category_by_slug(&lookup))
        .await?;
    match category {
        Some(category) => Ok(Json(category)),
        None => Err(ShopError::not_found("Category", slug).into()),
    }
}

async fn list_products(
    State(state): State<SharedState>,
    Query(page): Query<PageQuery>,
    Query(mut filter): Query<ProductFilter>,
) -> Result<impl IntoResponse, ApiError> {
    filter.include_drafts = false;
    let pagination = page.pagination();
    let products = state
        .db
        .call(move |db| db.list_products(&filter, pagination))
        .await?;
    Ok(Json(products))
}

async fn get_product(
    State(state): State<SharedState>,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = slug.clone();
    let detail = state
        .db
        .call(move |db| db.get_product_detail(&lookup))
        .await?;
    match detail {
        Some(detail) => Ok(Json(detail)),
        None => Err(ShopError::not_found("Product", slug).into()),
    }
}

// ── Back-office ───────────────────────────────────────────────────────

async fn create_category(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(input): Json<CategoryInput>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Categories).await?;
    let category = state.db.call(move |db| db.create_category(input)).await?;
    Ok((StatusCode::CREATED, Json(category)))
}

async fn update_category(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(input): Json<CategoryInput>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Categories).await?;
    let category = state
        .db
        .call(move |db| db.update_category(id, input))
        .await?;
    Ok(Json(category))
}

async fn delete_category(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Categories).await?;
    match state.db.call(move |db| db.delete_category(id)).await? {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ShopError::not_found("Category", id).into()),
    }
}

async fn admin_list_products(
    State(state): State<SharedState>,
    user: AuthUser,
    Query(page): Query<PageQuery>,
    Query(mut filter): Query<ProductFilter>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Products).await?;
    filter.include_drafts = true;
    let pagination = page.pagination();
    let products = state
        .db
        .call(move |db| db.list_products(&filter, pagination))
        .await?;
    Ok(Json(products))
}

async fn admin_get_product(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Products).await?;
    match state.db.call(move |db| db.get_product(id)).await? {
        Some(product) => Ok(Json(product)),
        None => Err(ShopError::not_found("Product", id).into()),
    }
}

async fn create_product(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(input): Json<ProductInput>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Products).await?;
    let product = state.db.call(move |db| db.create_product(input)).await?;
    tracing::info!(product_id = product.id, slug = %product.slug, "Created product");
    Ok((StatusCode::CREATED, Json(product)))
}

async fn update_product(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(input): Json<ProductInput>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Products).await?;
    let product = state
        .db
        .call(move |db| db.update_product(id, input))
        .await?;
    Ok(Json(product))
}

async fn delete_product(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    user.require(&state, Permission::Products).await?;
    match state.db.call(move |db| db.delete_product(id)).await? {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ShopError::not_found("Product", id).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::shop::models::Role;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_admin_creates_product_and_storefront_lists_it() {
        let state = test_state();
        let app = app(&state);
        let (_, token) = sign_in(&state, "admin@example.com", Role::Admin);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/admin/categories",
                Some(&token),
                Some(serde_json::json!({"name": "Trà thảo mộc"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let category: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(category["slug"], "tra-thao-moc");

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/admin/products",
                Some(&token),
                Some(serde_json::json!({
                    "name": "Trà hoa cúc",
                    "price": 85000,
                    "stock": 20,
                    "category_id": category["id"],
                    "status": "active",
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(request("GET", "/api/products?category=tra-thao-moc&limit=5", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(page["total"], 1);
        assert_eq!(page["limit"], 5);
        assert_eq!(page["items"][0]["name"], "Trà hoa cúc");

        let response = app
            .oneshot(request("GET", "/api/products/tra-hoa-cuc", None, None))
            .await
            .unwrap();
        let detail: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(detail["category"]["name"], "Trà thảo mộc");
        assert_eq!(detail["related"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_draft_product_is_hidden_from_storefront() {
        let state = test_state();
        let app = app(&state);
        let (_, token) = sign_in(&state, "admin@example.com", Role::Admin);
        app.clone()
            .oneshot(request(
                "POST",
                "/api/admin/products",
                Some(&token),
                Some(serde_json::json!({"name": "Bí mật", "price": 1000})),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(request("GET", "/api/products/bi-mat", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request("GET", "/api/admin/products", Some(&token), None))
            .await
            .unwrap();
        let page: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(page["total"], 1);
        assert_eq!(page["items"][0]["status"], "draft");
    }

    #[tokio::test]
    async fn test_staff_needs_products_permission() {
        let state = test_state();
        let app = app(&state);
        let (staff, token) = sign_in(&state, "staff@example.com", Role::Staff);
        let body = serde_json::json!({"name": "Cao", "price": 1000});

        let response = app
            .clone()
            .oneshot(request("POST", "/api/admin/products", Some(&token), Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        state
            .db
            .call(move |db| db.set_permissions(staff.id, &[Permission::Products]))
            .await
            .unwrap();
        let response = app
            .oneshot(request("POST", "/api/admin/products", Some(&token), Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_customer_cannot_reach_back_office() {
        let state = test_state();
        let (_, token) = sign_in(&state, "c@example.com", Role::Customer);
        let response = app(&state)
            .oneshot(request("DELETE", "/api/admin/products/1", Some(&token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_duplicate_slug_conflicts() {
        let state = test_state();
        let app = app(&state);
        let (_, token) = sign_in(&state, "admin@example.com", Role::Admin);
        for expected in [StatusCode::CREATED, StatusCode::CONFLICT] {
            let response = app
                .clone()
                .oneshot(request(
                    "POST",
                    "/api/admin/categories",
                    Some(&token),
                    Some(serde_json::json!({"name": "Cao", "slug": "cao"})),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), expected);
        }
    }

    #[tokio::test]
    async fn test_unknown_category_is_404() {
        let state = test_state();
        let response = app(&state)
            .oneshot(request("GET", "/api/categories/khong-co", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("khong-co"));
    }
}
