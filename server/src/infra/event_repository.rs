//! Gitspace event repository for database operations

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, SqlitePool};

use super::sqlite::parse_timestamp;
use crate::domain::event::{GitspaceEntityType, GitspaceEvent, GitspaceEventType};
use crate::error::{Error, Result};

/// Persistence of gitspace lifecycle events
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitspaceEventStore: Send + Sync {
    async fn create(&self, event: &GitspaceEvent) -> Result<GitspaceEvent>;

    /// Events of one entity, oldest first
    async fn list(&self, query_key: &str, limit: i64) -> Result<Vec<GitspaceEvent>>;
}

/// Database row for gitspace event
#[derive(Debug, FromRow)]
struct GitspaceEventRow {
    id: i64,
    event: String,
    entity_id: i64,
    query_key: String,
    entity_type: String,
    timestamp: i64,
    created_at: String,
}

impl TryFrom<GitspaceEventRow> for GitspaceEvent {
    type Error = Error;

    fn try_from(row: GitspaceEventRow) -> Result<Self> {
        let event = GitspaceEventType::from_str(&row.event)
            .ok_or_else(|| Error::Internal(format!("Invalid event type: {}", row.event)))?;
        let entity_type = GitspaceEntityType::from_str(&row.entity_type)
            .ok_or_else(|| Error::Internal(format!("Invalid entity type: {}", row.entity_type)))?;

        Ok(GitspaceEvent {
            id: row.id,
            event,
            message: event.message().to_string(),
            entity_id: row.entity_id,
            query_key: row.query_key,
            entity_type,
            timestamp: row.timestamp,
            created_at: parse_timestamp("created_at", &row.created_at)?,
        })
    }
}

/// Gitspace event repository
pub struct GitspaceEventRepository {
    pool: SqlitePool,
}

impl GitspaceEventRepository {
    /// Create a new repository with the given pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GitspaceEventStore for GitspaceEventRepository {
    async fn create(&self, event: &GitspaceEvent) -> Result<GitspaceEvent> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO gitspace_events (event, entity_id, query_key, entity_type, timestamp, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.event.as_str())
        .bind(event.entity_id)
        .bind(&event.query_key)
        .bind(event.entity_type.as_str())
        .bind(event.timestamp)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let mut created = event.clone();
        created.id = result.last_insert_rowid();
        created.created_at = now;
        Ok(created)
    }

    async fn list(&self, query_key: &str, limit: i64) -> Result<Vec<GitspaceEvent>> {
        let rows: Vec<GitspaceEventRow> = sqlx::query_as(
            r#"
            SELECT id, event, entity_id, query_key, entity_type, timestamp, created_at
            FROM gitspace_events
            WHERE query_key = ?
            ORDER BY timestamp, id
            LIMIT ?
            "#,
        )
        .bind(query_key)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }
}
