use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    extract::Request,
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState, SharedState};
use super::auth::TokenKeys;
use super::db::{DbHandle, ShopDb};
use super::embedded::Assets;
use super::media::LocalMediaStore;
use super::ws;
use crate::config::{DEFAULT_JWT_SECRET, ShopConfig};

/// Build the full application router: API, admin feed, uploaded files and
/// the embedded storefront.
pub fn build_router(state: SharedState, uploads_dir: &Path) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .nest_service("/uploads", ServeDir::new(uploads_dir))
        .fallback(static_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve embedded static files or fall back to index.html for client-side routes.
async fn static_handler(req: Request<Body>) -> Response {
    let path = req.uri().path().trim_start_matches('/');

    if !path.is_empty() {
        if let Some(content) = Assets::get(path) {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            return (
                [(header::CONTENT_TYPE, mime.as_ref().to_string())],
                content.data.into_owned(),
            )
                .into_response();
        }
    }

    match Assets::get("index.html") {
        Some(content) => Html(String::from_utf8_lossy(&content.data).into_owned()).into_response(),
        None => (StatusCode::NOT_FOUND, "Storefront bundle not found").into_response(),
    }
}

/// Open the database, wire up state and serve until Ctrl+C or SIGTERM.
pub async fn start_server(config: ShopConfig) -> Result<()> {
    if config.auth.jwt_secret == DEFAULT_JWT_SECRET {
        tracing::warn!("auth.jwt_secret is the built-in default; set APOTHECARY_JWT_SECRET");
    }
    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    std::fs::create_dir_all(&config.uploads.dir).with_context(|| {
        format!(
            "Failed to create uploads directory {}",
            config.uploads.dir.display()
        )
    })?;

    let db = ShopDb::new(&config.database.path).context("Failed to initialize shop database")?;
    let (ws_tx, _rx) = broadcast::channel::<String>(256);
    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        ws_tx,
        tokens: TokenKeys::new(&config.auth.jwt_secret, config.auth.token_ttl_hours),
        media: Arc::new(LocalMediaStore::new(
            config.uploads.dir.clone(),
            config.uploads.max_bytes,
        )),
        max_upload_bytes: config.uploads.max_bytes,
        cookie_secure: config.auth.cookie_secure,
    });

    let mut app = build_router(state, &config.uploads.dir);
    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(
        %local_addr,
        db = %config.database.path.display(),
        dev_mode = config.server.dev_mode,
        "Storefront listening"
    );
    println!("Apothecary running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutting down");
}
