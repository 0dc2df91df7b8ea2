use anyhow::Context;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app::AppData;
use crate::http::ApiError;

/// Both tallies after a visit has been recorded. This is also the JSON body of `GET /`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitReport {
    /// Latest visit id in the persistent store.
    pub hits: i64,
    /// Counter value in the cache, which resets whenever the cache drops the key.
    #[serde(rename = "cache-hits")]
    pub cache_hits: i64,
}

/// Record one visit: append a row, read back the latest id, then bump the cache counter.
///
/// `hits` is the latest committed id at read time. Under concurrent requests that may be a row
/// another request inserted, which is accepted in exchange for not counting the whole table.
pub async fn record_visit(data: &AppData) -> anyhow::Result<HitReport> {
    let record = data
        .store
        .insert_visit()
        .await
        .with_context(|| "fail to record visit")?;

    let hits = data
        .store
        .latest_id()
        .await
        .with_context(|| "fail to read latest visit id")?
        .ok_or_else(|| anyhow::anyhow!("visit log is empty right after insert"))?;

    // initialize without counting, so the first visit reads 1
    data.cache
        .get_or_init(&data.cache_key, 0)
        .await
        .with_context(|| "fail to initialize cache counter")?;
    let cache_hits = data
        .cache
        .increment(&data.cache_key)
        .await
        .with_context(|| "fail to increment cache counter")?;

    tracing::debug!(
        "visit {} recorded at {}, hits={hits} cache-hits={cache_hits}",
        record.id,
        record.recorded_at
    );

    Ok(HitReport { hits, cache_hits })
}

/// Handle GET /
///
/// Records the visit and returns `{"hits": n, "cache-hits": m}`.
pub async fn handle_home(State(data): State<AppData>) -> Result<Json<HitReport>, ApiError> {
    let report = record_visit(&data).await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::app::RuntimeData;
    use crate::cache::MemCache;
    use crate::modules::{cache::HitCounterCache, store::VisitRecord, store::VisitStore};
    use crate::sqlite::SqliteStore;

    struct BrokenStore;

    #[async_trait::async_trait]
    impl VisitStore for BrokenStore {
        async fn insert_visit(&self) -> anyhow::Result<VisitRecord> {
            anyhow::bail!("database is gone")
        }

        async fn latest_id(&self) -> anyhow::Result<Option<i64>> {
            anyhow::bail!("database is gone")
        }
    }

    #[derive(Default)]
    struct BrokenCache {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl HitCounterCache for BrokenCache {
        async fn get_or_init(&self, _key: &str, _default: i64) -> anyhow::Result<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("connection refused")
        }

        async fn increment(&self, _key: &str) -> anyhow::Result<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("connection refused")
        }
    }

    fn app_data(cache: MemCache) -> (AppData, SqliteStore) {
        let store = SqliteStore::in_memory().unwrap();
        let data = RuntimeData::builder()
            .store(Arc::new(store.clone()))
            .cache(Arc::new(cache))
            .build();
        (data.into(), store)
    }

    #[tokio::test]
    async fn first_visit_reports_one_for_both_counters() {
        let (data, _) = app_data(MemCache::default());

        let report = record_visit(&data).await.unwrap();
        assert_eq!(
            report,
            HitReport {
                hits: 1,
                cache_hits: 1
            }
        );
    }

    #[tokio::test]
    async fn counters_track_visit_count() {
        let (data, _) = app_data(MemCache::default());

        for n in 1..=6 {
            let report = record_visit(&data).await.unwrap();
            assert_eq!(report.hits, n);
            assert_eq!(report.cache_hits, n);
        }
    }

    #[tokio::test]
    async fn evicted_counter_diverges_from_store() {
        let cache = MemCache::default();
        let (data, _) = app_data(cache.clone());

        for _ in 0..4 {
            record_visit(&data).await.unwrap();
        }
        cache.evict("hits").unwrap();

        let report = record_visit(&data).await.unwrap();
        assert_eq!(report.hits, 5);
        assert_eq!(report.cache_hits, 1);
    }

    #[tokio::test]
    async fn custom_cache_key_is_used() {
        let cache = MemCache::default();
        let data: AppData = RuntimeData::builder()
            .store(Arc::new(SqliteStore::in_memory().unwrap()))
            .cache(Arc::new(cache.clone()))
            .cache_key("visits")
            .build()
            .into();

        record_visit(&data).await.unwrap();
        assert_eq!(cache.get_or_init("visits", 0).await.unwrap(), 1);
        assert_eq!(cache.get_or_init("hits", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_failure_skips_cache() {
        let cache = Arc::new(BrokenCache::default());
        let data: AppData = RuntimeData::builder()
            .store(Arc::new(BrokenStore))
            .cache(cache.clone())
            .build()
            .into();

        let err = record_visit(&data).await.unwrap_err();
        assert!(format!("{err:#}").contains("database is gone"));
        assert_eq!(cache.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_answers_with_report() {
        let (data, _) = app_data(MemCache::default());

        let Json(report) = handle_home(State(data.clone())).await.ok().unwrap();
        assert_eq!(report, HitReport { hits: 1, cache_hits: 1 });
        let Json(report) = handle_home(State(data)).await.ok().unwrap();
        assert_eq!(report, HitReport { hits: 2, cache_hits: 2 });
    }

    #[tokio::test]
    async fn cache_failure_fails_the_visit() {
        let store = SqliteStore::in_memory().unwrap();
        let data: AppData = RuntimeData::builder()
            .store(Arc::new(store.clone()))
            .cache(Arc::new(BrokenCache::default()))
            .build()
            .into();

        let err = record_visit(&data).await.unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));
        // the row is already durable, only the response is lost
        assert_eq!(store.latest_id().await.unwrap(), Some(1));
    }
}
