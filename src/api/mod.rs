//! HTTP mapping of the query surface
//!
//! Four routes, query-string encoded inputs, JSON out:
//!
//! - `GET /api/ticks` - bucketed severity counts
//! - `GET /api/entries` - keyset-paginated entries
//! - `GET /api/result` - output of a scheduled task
//! - `GET /api/cancel` - cancel a scheduled task
//!
//! Errors map to HTTP 400 with `{"error": "..."}`; a null result maps to
//! 204 No Content.

pub mod dto;
pub mod error;

pub use error::{ApiError, ApiResult};

use crate::engine::Logbook;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use dto::{EntriesParams, TaskParams, TicksParams};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Builds the API router.
pub fn build_router(log: Arc<Logbook>) -> Router {
    Router::new()
        .route("/api/ticks", get(ticks))
        .route("/api/entries", get(entries))
        .route("/api/result", get(result))
        .route("/api/cancel", get(cancel))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(log)
}

/// Binds `addr` and serves the API until ctrl-c / SIGTERM.
pub async fn serve(log: Arc<Logbook>, addr: &str) -> Result<(), std::io::Error> {
    let router = build_router(log);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(addr, "logbook api listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("logbook api shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn ticks(
    State(log): State<Arc<Logbook>>,
    Query(params): Query<TicksParams>,
) -> ApiResult<Response> {
    let out = log.ticks(&params.into_input())?;
    Ok(Json(out).into_response())
}

async fn entries(
    State(log): State<Arc<Logbook>>,
    Query(params): Query<EntriesParams>,
) -> ApiResult<Response> {
    let out = log.entries(&params.into_input())?;
    Ok(Json(out).into_response())
}

async fn result(
    State(log): State<Arc<Logbook>>,
    Query(params): Query<TaskParams>,
) -> ApiResult<Response> {
    Ok(match log.result(params.id)? {
        Some(out) => Json(out).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn cancel(
    State(log): State<Arc<Logbook>>,
    Query(params): Query<TaskParams>,
) -> ApiResult<Response> {
    log.cancel(params.id)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Config;
    use crate::storage::{QueryStorage, SqliteStorage, SqliteStorageConfig};
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::tempdir;
    use tower::util::ServiceExt;

    async fn test_app() -> (Router, Arc<Logbook>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::new(SqliteStorageConfig::new(dir.path())).unwrap();
        let log = Arc::new(Logbook::new(Config {
            storage: Some(storage as Arc<dyn QueryStorage>),
            ..Default::default()
        }));
        (build_router(Arc::clone(&log)), log, dir)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_entries_returns_json() {
        let (app, log, _dir) = test_app().await;

        log.ingest(chrono::Utc::now(), 0, br#"{"msg":"hello"}"#.to_vec())
            .unwrap();

        let (status, body) = get(app, "/api/entries?dir=before&limit=10").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json.is_object());
    }

    #[tokio::test]
    async fn test_ticks_returns_json() {
        let (app, _log, _dir) = test_app().await;

        let (status, body) = get(app, "/api/ticks?interval=60&limit=10").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json.is_object());
    }

    #[tokio::test]
    async fn test_bad_expression_maps_to_400() {
        let (app, _log, _dir) = test_app().await;

        let (status, body) = get(app, "/api/entries?expr=a:b:c").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].as_str().unwrap().contains("unexpected"));
    }

    #[tokio::test]
    async fn test_unknown_result_is_no_content() {
        let (app, _log, _dir) = test_app().await;

        let (status, _) = get(app, "/api/result?id=12345").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_cancel_is_no_content() {
        let (app, _log, _dir) = test_app().await;

        let (status, _) = get(app, "/api/cancel?id=1").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
