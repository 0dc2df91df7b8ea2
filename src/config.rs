use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use std::{env, fs, path};

use crate::helper;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "listen_addr_default")]
    pub listen_addr: IpAddr,
    #[serde(default = "port_default")]
    pub port: u16,
    #[serde(default = "log_level_default")]
    pub log_level: String,

    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: listen_addr_default(),
            port: port_default(),
            log_level: log_level_default(),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    fn get_config_dir() -> anyhow::Result<path::PathBuf> {
        let config_dir = if let Ok(xdg_path) = env::var("XDG_CONFIG_HOME") {
            path::PathBuf::from(&xdg_path)
        } else {
            let home = env::var("HOME").with_context(|| "neither $XDG_CONFIG_HOME nor $HOME set")?;
            path::Path::new(&home).join(".config")
        };

        Ok(config_dir.join("hit_counter"))
    }

    /// Load the config file, then apply environment overrides.
    ///
    /// `$HIT_COUNTER_CFG_PATH` must point to an existing file. Without it the default location
    /// is tried and built-in defaults are used when nothing is there, including when no config
    /// directory can be located at all.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = if let Ok(cfg_path) = env::var("HIT_COUNTER_CFG_PATH") {
            Self::from_path(cfg_path)?
        } else {
            match Self::get_config_dir() {
                Ok(dir) if dir.join("config.toml").exists() => {
                    Self::from_path(dir.join("config.toml"))?
                }
                Ok(dir) => {
                    tracing::debug!("no config file in {dir:?}, using defaults");
                    Self::default()
                }
                Err(err) => {
                    tracing::debug!("no config directory ({err:#}), using defaults");
                    Self::default()
                }
            }
        };

        config.apply_env()?;
        Ok(config)
    }

    pub fn from_path(file_path: impl AsRef<path::Path>) -> anyhow::Result<Self> {
        let file_path = file_path.as_ref();
        if !file_path.exists() {
            anyhow::bail!("Config file not found in {file_path:?}");
        }
        let content = fs::read_to_string(file_path).with_context(|| "fail to read config file")?;

        toml::from_str(&content).with_context(|| "fail to parse config from toml")
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Some(addr) = helper::parse_from_env::<String>("REDIS_ADDR")? {
            self.cache.redis_addr = addr;
        }
        if let Some(path) = helper::parse_from_env::<String>("DATABASE_PATH")? {
            self.database.path = path;
        }
        if let Some(addr) = helper::parse_from_env::<IpAddr>("LISTEN_ADDR")? {
            self.listen_addr = addr;
        }
        if let Some(port) = helper::parse_from_env::<u16>("PORT")? {
            self.port = port;
        }
        Ok(())
    }

    pub fn max_log_level(&self) -> anyhow::Result<tracing::Level> {
        self.log_level
            .parse()
            .map_err(|_| anyhow::anyhow!("unknown log level {}", self.log_level))
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite file, or `:memory:` for a throwaway database.
    #[serde(default = "database_path_default")]
    pub path: String,
    #[serde(default = "busy_timeout_ms_default")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: database_path_default(),
            busy_timeout_ms: busy_timeout_ms_default(),
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    #[serde(default = "redis_addr_default")]
    pub redis_addr: String,
    #[serde(default = "cache_key_default")]
    pub key: String,
    pub ttl_secs: Option<u64>,
    #[serde(default = "pool_size_default")]
    pub pool_size: u32,
    #[serde(default = "connect_timeout_ms_default")]
    pub connect_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            redis_addr: redis_addr_default(),
            key: cache_key_default(),
            ttl_secs: None,
            pool_size: pool_size_default(),
            connect_timeout_ms: connect_timeout_ms_default(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn listen_addr_default() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn port_default() -> u16 {
    8000
}

fn log_level_default() -> String {
    "INFO".to_string()
}

fn database_path_default() -> String {
    "hits.sqlite3".to_string()
}

fn busy_timeout_ms_default() -> u64 {
    5000
}

fn redis_addr_default() -> String {
    "redis://localhost:6379".to_string()
}

fn cache_key_default() -> String {
    "hits".to_string()
}

fn pool_size_default() -> u32 {
    8
}

fn connect_timeout_ms_default() -> u64 {
    2000
}

#[test]
fn validate_file_correctness() {
    let config = r#"
        listen_addr = "0.0.0.0"
        port = 8080
        log_level = "DEBUG"

        [database]
        path = ":memory:"

        [cache]
        backend = "memory"
        key = "visits"
        ttl_secs = 300
    "#;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, config).unwrap();

    let config = Config::from_path(&path).unwrap();
    assert_eq!(config.listen_addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    assert_eq!(config.port, 8080);
    assert_eq!(config.max_log_level().unwrap(), tracing::Level::DEBUG);
    assert_eq!(config.database.path, ":memory:");
    assert_eq!(config.database.busy_timeout_ms, 5000);
    assert_eq!(config.cache.backend, CacheBackend::Memory);
    assert_eq!(config.cache.key, "visits");
    assert_eq!(config.cache.ttl(), Some(Duration::from_secs(300)));
    assert_eq!(config.cache.redis_addr, "redis://localhost:6379");
}

#[test]
fn empty_file_falls_back_to_defaults() {
    let config: Config = toml::from_str("").unwrap();
    assert_eq!(config.port, 8000);
    assert_eq!(config.listen_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(config.database.path, "hits.sqlite3");
    assert_eq!(config.cache.backend, CacheBackend::Redis);
    assert_eq!(config.cache.key, "hits");
    assert_eq!(config.cache.ttl(), None);
    assert_eq!(config.max_log_level().unwrap(), tracing::Level::INFO);
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::from_path(dir.path().join("nope.toml")).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
}

#[test]
fn unknown_backend_is_rejected() {
    let result: Result<Config, _> = toml::from_str("[cache]\nbackend = \"memcached\"\n");
    assert!(result.is_err());
}

/// Tests below rewrite process-wide variables, so they take turns.
#[cfg(test)]
static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
const LOAD_VARS: [&str; 7] = [
    "HIT_COUNTER_CFG_PATH",
    "XDG_CONFIG_HOME",
    "HOME",
    "REDIS_ADDR",
    "DATABASE_PATH",
    "PORT",
    "LISTEN_ADDR",
];

/// Run `f` with every variable `Config::load` reads cleared, restoring them afterwards.
#[cfg(test)]
fn with_clean_env<T>(f: impl FnOnce() -> T) -> T {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let saved = LOAD_VARS.map(|key| (key, env::var_os(key)));
    for key in LOAD_VARS {
        env::remove_var(key);
    }

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));

    for (key, value) in saved {
        match value {
            Some(value) => env::set_var(key, value),
            None => env::remove_var(key),
        }
    }
    result.unwrap_or_else(|panic| std::panic::resume_unwind(panic))
}

#[test]
fn load_without_home_uses_defaults() {
    let config = with_clean_env(Config::load).unwrap();
    assert_eq!(config.port, 8000);
    assert_eq!(config.database.path, "hits.sqlite3");
    assert_eq!(config.cache.backend, CacheBackend::Redis);
}

#[test]
fn load_with_empty_config_dir_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = with_clean_env(|| {
        env::set_var("XDG_CONFIG_HOME", dir.path());
        Config::load()
    })
    .unwrap();
    assert_eq!(config.port, 8000);
    assert_eq!(config.listen_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
}

#[test]
fn load_reads_default_location_and_env_overrides() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("hit_counter")).unwrap();
    fs::write(
        dir.path().join("hit_counter").join("config.toml"),
        "port = 9000\n[database]\npath = \"file.sqlite3\"\n[cache]\nredis_addr = \"redis://file\"\n",
    )
    .unwrap();

    let from_file = with_clean_env(|| {
        env::set_var("XDG_CONFIG_HOME", dir.path());
        Config::load()
    })
    .unwrap();
    assert_eq!(from_file.port, 9000);
    assert_eq!(from_file.database.path, "file.sqlite3");
    assert_eq!(from_file.cache.redis_addr, "redis://file");

    let overridden = with_clean_env(|| {
        env::set_var("XDG_CONFIG_HOME", dir.path());
        env::set_var("REDIS_ADDR", "redis://cache:6379");
        env::set_var("DATABASE_PATH", ":memory:");
        env::set_var("PORT", "8081");
        env::set_var("LISTEN_ADDR", "0.0.0.0");
        Config::load()
    })
    .unwrap();
    assert_eq!(overridden.port, 8081);
    assert_eq!(overridden.listen_addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    assert_eq!(overridden.database.path, ":memory:");
    assert_eq!(overridden.cache.redis_addr, "redis://cache:6379");
}

#[test]
fn load_rejects_malformed_overrides() {
    let bad_port = with_clean_env(|| {
        env::set_var("PORT", "eighty");
        Config::load()
    });
    assert!(bad_port.unwrap_err().to_string().contains("$PORT"));

    let bad_addr = with_clean_env(|| {
        env::set_var("LISTEN_ADDR", "localhost:80");
        Config::load()
    });
    assert!(bad_addr.unwrap_err().to_string().contains("$LISTEN_ADDR"));
}

#[test]
fn load_rejects_missing_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    let err = with_clean_env(|| {
        env::set_var("HIT_COUNTER_CFG_PATH", &missing);
        Config::load()
    })
    .unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
}
