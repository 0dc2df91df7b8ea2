use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use redis::Commands;

use crate::modules::cache::HitCounterCache;

/// Redis backed counter cache sharing a pool of blocking connections.
#[derive(Clone)]
pub struct Cacher {
    pool: r2d2::Pool<redis::Client>,
    ttl: Option<Duration>,
}

impl Cacher {
    /// Connections are established lazily, so an unreachable Redis only fails the requests
    /// that need it.
    pub fn new(client: redis::Client, pool_size: u32, connect_timeout: Duration) -> Self {
        let pool = r2d2::Pool::builder()
            .max_size(pool_size)
            .min_idle(Some(0))
            .connection_timeout(connect_timeout)
            .build_unchecked(client);

        Self { pool, ttl: None }
    }

    /// Expire the counter this long after it is created.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<redis::Client>> {
        self.pool
            .get()
            .with_context(|| "fail to get connection from redis pool")
    }
}

#[async_trait::async_trait]
impl HitCounterCache for Cacher {
    async fn get_or_init(&self, key: &str, default: i64) -> anyhow::Result<i64> {
        let cacher = self.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || -> anyhow::Result<i64> {
            let mut conn = cacher.get_conn()?;

            let mut set = redis::cmd("SET");
            set.arg(&key).arg(default).arg("NX");
            if let Some(ttl) = cacher.ttl {
                set.arg("EX").arg(ttl.as_secs().max(1));
            }
            // nil when the key already exists
            let _: Option<String> = set
                .query(&mut *conn)
                .with_context(|| format!("fail to initialize {key} in redis"))?;

            let value: Option<i64> = conn
                .get(&key)
                .with_context(|| format!("fail to read {key} from redis"))?;
            // evicted between the two calls
            Ok(value.unwrap_or(default))
        })
        .await
        .with_context(|| "redis task panicked")?
    }

    async fn increment(&self, key: &str) -> anyhow::Result<i64> {
        let cacher = self.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || -> anyhow::Result<i64> {
            let mut conn = cacher.get_conn()?;
            Ok(conn
                .incr(&key, 1)
                .with_context(|| format!("fail to increment {key} in redis"))?)
        })
        .await
        .with_context(|| "redis task panicked")?
    }
}

struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process counter cache. Used for tests and single-instance runs where no Redis is around.
#[derive(Clone, Default)]
pub struct MemCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    ttl: Option<Duration>,
}

impl MemCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: Arc::default(),
            ttl,
        }
    }

    /// Drop `key` as if the cache had evicted it. Returns whether the key was present.
    pub fn evict(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.lock()?.remove(key).is_some())
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory cache mutex poisoned"))
    }

    fn live_entry<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        default: i64,
        ttl: Option<Duration>,
    ) -> &'a mut Entry {
        let now = Instant::now();
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }

        entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: default,
            expires_at: ttl.map(|ttl| now + ttl),
        })
    }
}

#[async_trait::async_trait]
impl HitCounterCache for MemCache {
    async fn get_or_init(&self, key: &str, default: i64) -> anyhow::Result<i64> {
        let mut entries = self.lock()?;
        Ok(Self::live_entry(&mut entries, key, default, self.ttl).value)
    }

    async fn increment(&self, key: &str) -> anyhow::Result<i64> {
        let mut entries = self.lock()?;
        let entry = Self::live_entry(&mut entries, key, 0, self.ttl);
        entry.value = match entry.value.checked_add(1) {
            Some(value) => value,
            None => anyhow::bail!("increment of {key} would overflow"),
        };
        Ok(entry.value)
    }
}

#[tokio::test]
async fn test_get_or_init_keeps_existing_value() {
    let cache = MemCache::default();
    assert_eq!(cache.get_or_init("hits", 0).await.unwrap(), 0);
    assert_eq!(cache.increment("hits").await.unwrap(), 1);
    assert_eq!(cache.increment("hits").await.unwrap(), 2);

    // set-if-absent must not touch a live key
    assert_eq!(cache.get_or_init("hits", 0).await.unwrap(), 2);
}

#[tokio::test]
async fn test_evict_restarts_counter() {
    let cache = MemCache::default();
    cache.get_or_init("hits", 0).await.unwrap();
    cache.increment("hits").await.unwrap();

    assert!(cache.evict("hits").unwrap());
    assert!(!cache.evict("hits").unwrap());
    assert_eq!(cache.get_or_init("hits", 0).await.unwrap(), 0);
    assert_eq!(cache.increment("hits").await.unwrap(), 1);
}

#[tokio::test]
async fn test_ttl_expires_counter() {
    let cache = MemCache::new(Some(Duration::from_millis(50)));
    cache.get_or_init("hits", 0).await.unwrap();
    cache.increment("hits").await.unwrap();
    assert_eq!(cache.increment("hits").await.unwrap(), 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cache.get_or_init("hits", 0).await.unwrap(), 0);
}

#[tokio::test]
async fn test_overflow_is_an_error_and_cache_stays_usable() {
    let cache = MemCache::default();
    cache.get_or_init("hits", i64::MAX).await.unwrap();

    assert!(cache.increment("hits").await.is_err());
    assert_eq!(cache.get_or_init("hits", 0).await.unwrap(), i64::MAX);

    cache.evict("hits").unwrap();
    assert_eq!(cache.increment("hits").await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_are_not_lost() {
    let cache = MemCache::default();
    cache.get_or_init("hits", 0).await.unwrap();

    let tasks = (0..200)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.increment("hits").await.unwrap() })
        })
        .collect::<Vec<_>>();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(cache.get_or_init("hits", 0).await.unwrap(), 200);
}

// Needs a running redis server: `REDIS_ADDR=redis://localhost:6379 cargo test -- --ignored`
#[tokio::test]
#[ignore]
async fn test_redis_counter() {
    let addr = std::env::var("REDIS_ADDR").unwrap_or_else(|_| "redis://localhost:6379".into());
    let cacher = Cacher::new(
        redis::Client::open(addr.as_str()).unwrap(),
        2,
        Duration::from_secs(2),
    );
    let key = format!("hit-counter-test-{}", std::process::id());
    let _: () = cacher.get_conn().unwrap().del(&key).unwrap();

    // first visit
    assert_eq!(cacher.get_or_init(&key, 0).await.unwrap(), 0);
    assert_eq!(cacher.increment(&key).await.unwrap(), 1);

    // set-if-absent keeps the live value
    assert_eq!(cacher.increment(&key).await.unwrap(), 2);
    assert_eq!(cacher.get_or_init(&key, 0).await.unwrap(), 2);

    // a dropped key restarts at 1, with or without the init call
    let _: () = cacher.get_conn().unwrap().del(&key).unwrap();
    assert_eq!(cacher.increment(&key).await.unwrap(), 1);
    let _: () = cacher.get_conn().unwrap().del(&key).unwrap();
    assert_eq!(cacher.get_or_init(&key, 0).await.unwrap(), 0);
    assert_eq!(cacher.increment(&key).await.unwrap(), 1);

    let ttl_key = format!("{key}-ttl");
    let expiring = cacher.clone().with_ttl(Some(Duration::from_secs(60)));
    expiring.get_or_init(&ttl_key, 0).await.unwrap();
    let ttl: i64 = cacher.get_conn().unwrap().ttl(&ttl_key).unwrap();
    assert!(ttl > 0 && ttl <= 60);

    let _: () = cacher.get_conn().unwrap().del(vec![key.clone(), ttl_key.clone()]).unwrap();
}
