use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use hit_counter::{
    app::{AppData, RuntimeData},
    cache::MemCache,
    http,
    modules::{cache::HitCounterCache, visit::HitReport},
    sqlite::SqliteStore,
};

struct DownCache;

#[async_trait::async_trait]
impl HitCounterCache for DownCache {
    async fn get_or_init(&self, _key: &str, _default: i64) -> anyhow::Result<i64> {
        anyhow::bail!("cache unreachable")
    }

    async fn increment(&self, _key: &str) -> anyhow::Result<i64> {
        anyhow::bail!("cache unreachable")
    }
}

fn app_data(cache: Arc<dyn HitCounterCache>) -> AppData {
    RuntimeData::builder()
        .store(Arc::new(SqliteStore::in_memory().unwrap()))
        .cache(cache)
        .build()
        .into()
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn get_hits(app: &Router) -> HitReport {
    let (status, body) = get(app, "/").await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn should_count_first_visit_as_one() {
    // given
    let app = http::router(app_data(Arc::new(MemCache::default())));

    // when
    let (status, body) = get(&app, "/").await;

    // then
    assert_eq!(status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, serde_json::json!({"hits": 1, "cache-hits": 1}));
}

#[tokio::test]
async fn should_report_sixth_visit_after_five() {
    // given
    let app = http::router(app_data(Arc::new(MemCache::default())));
    for _ in 0..5 {
        get_hits(&app).await;
    }

    // when
    let report = get_hits(&app).await;

    // then
    assert_eq!(
        report,
        HitReport {
            hits: 6,
            cache_hits: 6
        }
    );
}

#[tokio::test]
async fn should_restart_cache_count_after_eviction() {
    // given
    let cache = MemCache::default();
    let app = http::router(app_data(Arc::new(cache.clone())));
    for _ in 0..3 {
        get_hits(&app).await;
    }
    cache.evict("hits").unwrap();

    // when
    let report = get_hits(&app).await;

    // then
    assert_eq!(report.hits, 4);
    assert_eq!(report.cache_hits, 1);
}

#[tokio::test]
async fn should_serve_static_page_without_counting() {
    // given
    let app = http::router(app_data(Arc::new(MemCache::default())));
    get_hits(&app).await;

    // when
    let (status, body) = get(&app, "/about").await;

    // then
    assert_eq!(status, StatusCode::OK);
    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("<html"));
    assert_eq!(get_hits(&app).await.hits, 2);
}

#[tokio::test]
async fn should_answer_healthcheck() {
    let app = http::router(app_data(Arc::new(MemCache::default())));

    let (status, body) = get(&app, "/healthcheck").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}

#[tokio::test]
async fn should_fail_request_when_cache_is_down() {
    // given
    let app = http::router(app_data(Arc::new(DownCache)));

    // when
    let (status, body) = get(&app, "/").await;

    // then
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "error");
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("cache unreachable"));
}

#[tokio::test]
async fn should_return_not_found_for_unknown_route() {
    let app = http::router(app_data(Arc::new(MemCache::default())));

    let (status, _) = get(&app, "/missing").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_not_lose_cache_hits_under_concurrency() {
    // given
    let app = http::router(app_data(Arc::new(MemCache::default())));

    // when
    let tasks = (0..50)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move { get_hits(&app).await })
        })
        .collect::<Vec<_>>();
    for task in tasks {
        task.await.unwrap();
    }

    // then
    let report = get_hits(&app).await;
    assert_eq!(report.hits, 51);
    assert_eq!(report.cache_hits, 51);
}

#[tokio::test]
async fn should_serve_over_tcp() {
    // given
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(http::serve(
        listener,
        app_data(Arc::new(MemCache::default())),
        async move {
            rx.await.ok();
        },
    ));

    // when
    let first: serde_json::Value = reqwest::get(format!("http://{addr}/"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let second: serde_json::Value = reqwest::get(format!("http://{addr}/"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    // then
    assert_eq!(first, serde_json::json!({"hits": 1, "cache-hits": 1}));
    assert_eq!(second, serde_json::json!({"hits": 2, "cache-hits": 2}));

    tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}
