use axum::http::StatusCode;

/// Handle GET /healthcheck for the container HEALTHCHECK probe.
///
/// Answers without touching the store or the cache.
pub async fn handle_healthcheck() -> (StatusCode, &'static str) {
    tracing::debug!("health check probed");
    (StatusCode::OK, "OK")
}

#[tokio::test]
async fn test_healthcheck() {
    let (status, body) = handle_healthcheck().await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}
