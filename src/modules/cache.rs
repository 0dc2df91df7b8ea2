/// An async trait that define the behavior of the cache holding the secondary hit counter.
///
/// Values are best effort: a backend may evict or expire a key at any time.
#[async_trait::async_trait]
pub trait HitCounterCache: Send + Sync {
    /// Store `default` under `key` only when the key is absent, then return the current value.
    async fn get_or_init(&self, key: &str, default: i64) -> anyhow::Result<i64>;

    /// Atomically add one to `key` and return the new value. A missing key counts from 0.
    async fn increment(&self, key: &str) -> anyhow::Result<i64>;
}
