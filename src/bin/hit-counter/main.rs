use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use hit_counter::{
    app::{AppData, RuntimeData},
    cache::{Cacher, MemCache},
    config::{CacheBackend, CacheConfig, Config},
    http,
    modules::cache::HitCounterCache,
    sqlite::SqliteStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::load().with_context(|| "fail to load config")?;

    tracing_subscriber::fmt()
        .with_max_level(config.max_log_level()?)
        .init();

    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let app_data = prepare_app_data(&config)?;

    let addr = SocketAddr::new(config.listen_addr, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("fail to bind {addr}"))?;

    http::serve(listener, app_data, http::shutdown_signal()).await
}

fn prepare_cache(config: &CacheConfig) -> anyhow::Result<Arc<dyn HitCounterCache>> {
    match config.backend {
        CacheBackend::Redis => {
            let client = redis::Client::open(config.redis_addr.as_str())
                .with_context(|| format!("invalid redis address {}", config.redis_addr))?;
            tracing::info!("counting cache hits in redis");
            let cacher = Cacher::new(client, config.pool_size, config.connect_timeout())
                .with_ttl(config.ttl());
            Ok(Arc::new(cacher))
        }
        CacheBackend::Memory => {
            tracing::info!("counting cache hits in process memory");
            Ok(Arc::new(MemCache::new(config.ttl())))
        }
    }
}

fn prepare_app_data(config: &Config) -> anyhow::Result<AppData> {
    let store = SqliteStore::open(&config.database.path, config.database.busy_timeout())?;

    let data = RuntimeData::builder()
        .store(Arc::new(store))
        .cache(prepare_cache(&config.cache)?)
        .cache_key(config.cache.key.as_str())
        .build();

    Ok(data.into())
}
