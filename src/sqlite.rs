use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::modules::store::{VisitRecord, VisitStore};

const IN_MEMORY_PATH: &str = ":memory:";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS visit_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at TEXT NOT NULL
);";

/// SQLite backed visit log.
///
/// A single connection is shared behind a mutex, so writes and reads serialize on it. Every call
/// runs on the blocking thread pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`. `:memory:` gives a private in-memory database.
    pub fn open(path: &str, busy_timeout: Duration) -> anyhow::Result<Self> {
        let conn = if path == IN_MEMORY_PATH {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .with_context(|| format!("fail to open sqlite database at {path}"))?;

        conn.busy_timeout(busy_timeout)
            .with_context(|| "fail to set sqlite busy timeout")?;
        if path != IN_MEMORY_PATH {
            // journal_mode returns the resulting mode as a row
            let _: String = conn
                .query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))
                .with_context(|| "fail to enable WAL journal")?;
        }
        conn.execute_batch(SCHEMA)
            .with_context(|| "fail to create visit_records table")?;

        tracing::info!("visit store opened at {path}");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::open(IN_MEMORY_PATH, Duration::from_secs(5))
    }

    async fn with_conn<T, F>(&self, task: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("sqlite connection mutex poisoned"))?;
            task(&conn)
        })
        .await
        .with_context(|| "sqlite task panicked")?
    }
}

#[async_trait::async_trait]
impl VisitStore for SqliteStore {
    async fn insert_visit(&self) -> anyhow::Result<VisitRecord> {
        self.with_conn(|conn| {
            let recorded_at = Utc::now();
            conn.execute(
                "INSERT INTO visit_records (recorded_at) VALUES (?1)",
                params![recorded_at],
            )
            .with_context(|| "fail to insert visit record")?;

            Ok(VisitRecord {
                id: conn.last_insert_rowid(),
                recorded_at,
            })
        })
        .await
    }

    async fn latest_id(&self) -> anyhow::Result<Option<i64>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id FROM visit_records ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| "fail to query latest visit id")
        })
        .await
    }
}

#[tokio::test]
async fn test_ids_follow_insert_order() {
    let store = SqliteStore::in_memory().unwrap();
    assert_eq!(store.latest_id().await.unwrap(), None);

    let first = store.insert_visit().await.unwrap();
    let second = store.insert_visit().await.unwrap();

    assert_eq!(first.id, 1);
    assert_eq!(second.id, 2);
    assert!(second.recorded_at >= first.recorded_at);
    assert_eq!(store.latest_id().await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_ids_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hits.sqlite3");
    let path = path.to_str().unwrap();

    {
        let store = SqliteStore::open(path, Duration::from_secs(1)).unwrap();
        for _ in 0..3 {
            store.insert_visit().await.unwrap();
        }
    }

    let store = SqliteStore::open(path, Duration::from_secs(1)).unwrap();
    assert_eq!(store.latest_id().await.unwrap(), Some(3));
    assert_eq!(store.insert_visit().await.unwrap().id, 4);
}

#[tokio::test]
async fn test_recorded_at_is_persisted() {
    let store = SqliteStore::in_memory().unwrap();
    let record = store.insert_visit().await.unwrap();

    let stored: chrono::DateTime<Utc> = store
        .with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT recorded_at FROM visit_records WHERE id = ?1",
                params![record.id],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(stored, record.recorded_at);
}
