use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, State, multipart::Field},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use serde::{Deserialize, Serialize};

use super::{ApiError, SharedState};
use crate::errors::ShopError;
use crate::shop::auth::AuthUser;

#[derive(Serialize)]
pub struct UploadResponse {
    pub url: String,
}

#[derive(Deserialize)]
pub struct DeleteUploadRequest {
    pub url: String,
}

pub(super) fn routes() -> Router<SharedState> {
    // Size is enforced per file while streaming, against `max_upload_bytes`.
    Router::new().route(
        "/api/admin/uploads",
        post(upload)
            .delete(delete_upload)
            .layer(DefaultBodyLimit::disable()),
    )
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::BadRequest(format!("Malformed upload: {}", err))
}

/// Read one field, stopping as soon as it exceeds `limit` bytes.
async fn read_limited(mut field: Field<'_>, limit: usize) -> Result<Vec<u8>, ApiError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        if bytes.len() + chunk.len() > limit {
            return Err(ShopError::Validation(format!("File exceeds the {} byte limit", limit)).into());
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Store the first file field of a multipart body and return its URL.
async fn upload(
    State(state): State<SharedState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    user.require_back_office()?;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = read_limited(field, state.max_upload_bytes).await?;
        let url = state.media.save(&file_name, &bytes).await?;
        return Ok((StatusCode::CREATED, Json(UploadResponse { url })));
    }
    Err(ShopError::Validation("No file in upload".into()).into())
}

async fn delete_upload(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(req): Json<DeleteUploadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    user.require_back_office()?;
    match state.media.delete(&req.url).await? {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ShopError::not_found("Upload", req.url).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::shop::models::Role;
    use axum::body::Body;
    use axum::http::{Request, header};
    use tower::ServiceExt;

    const BOUNDARY: &str = "apothecary-boundary";

    fn multipart_request(token: &str, file_name: &str, content: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri("/api/admin/uploads")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_then_delete() {
        let state = test_state();
        let app = app(&state);
        let (_, token) = sign_in(&state, "staff@example.com", Role::Staff);

        let response = app
            .clone()
            .oneshot(multipart_request(&token, "hero.png", b"\x89PNG\r\n"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: serde_json::Value = body_json(response.into_body()).await;
        let url = body["url"].as_str().unwrap().to_string();
        assert!(url.starts_with("/uploads/") && url.ends_with(".png"));

        let response = app
            .clone()
            .oneshot(request(
                "DELETE",
                "/api/admin/uploads",
                Some(&token),
                Some(serde_json::json!({"url": url})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(request(
                "DELETE",
                "/api/admin/uploads",
                Some(&token),
                Some(serde_json::json!({"url": url})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rejects_script_files() {
        let state = test_state();
        let (_, token) = sign_in(&state, "admin@example.com", Role::Admin);
        let response = app(&state)
            .oneshot(multipart_request(&token, "shell.php", b"<?php ?>"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rejects_oversized_files() {
        let state = test_state();
        let (_, token) = sign_in(&state, "admin@example.com", Role::Admin);
        let big = vec![0u8; state.max_upload_bytes + 1];
        let response = app(&state)
            .oneshot(multipart_request(&token, "big.jpg", &big))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_customers_cannot_upload() {
        let state = test_state();
        let (_, token) = sign_in(&state, "c@example.com", Role::Customer);
        let response = app(&state)
            .oneshot(multipart_request(&token, "a.png", b"x"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
