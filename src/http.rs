//! HTTP surface: routing, request logging and error responses.

use std::future::Future;
use std::time::Instant;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;

use crate::app::AppData;
use crate::modules::{health, page, visit};

/// Error wrapper turning any failure inside a handler into a 500 response.
///
/// The body has the format:
/// ```json
/// { "status": "error", "message": "..." }
/// ```
pub struct ApiError(pub anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = format!("{:#}", self.0);
        tracing::error!("request failed: {message}");

        let body = serde_json::json!({
            "status": "error",
            "message": message,
        });

        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(err)
    }
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        "{method} {path} -> {} ({:?})",
        response.status().as_u16(),
        start.elapsed()
    );
    response
}

pub fn router(data: AppData) -> Router {
    Router::new()
        .route("/", get(visit::handle_home))
        .route("/about", get(page::handle_about))
        .route("/healthcheck", get(health::handle_healthcheck))
        .layer(middleware::from_fn(log_request))
        .with_state(data)
}

/// Serve the application on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, data: AppData, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("hit counter listening on http://{addr}");
    }

    axum::serve(listener, router(data))
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("fail to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("fail to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
