use chrono::{DateTime, Utc};

/// One durable row per processed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitRecord {
    pub id: i64,
    pub recorded_at: DateTime<Utc>,
}

/// An async trait that define the behavior of the persistent visit log.
///
/// Implementations must hand out strictly increasing ids and never reuse one, so the latest id
/// always equals the number of visits ever recorded.
#[async_trait::async_trait]
pub trait VisitStore: Send + Sync {
    /// Append a new record, returning it with the id the store assigned.
    async fn insert_visit(&self) -> anyhow::Result<VisitRecord>;

    /// The highest id currently committed, or `None` for an empty log.
    async fn latest_id(&self) -> anyhow::Result<Option<i64>>;
}
