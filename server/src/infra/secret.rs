//! Secret storage for gitspace access keys

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{Error, Result};

/// Resolves secret references to their values
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn put(&self, space_path: &str, identifier: &str, value: &str) -> Result<()>;

    async fn get(&self, identifier: &str) -> Result<String>;
}

/// Secrets kept in the server database
pub struct SqliteSecretStore {
    pool: SqlitePool,
}

impl SqliteSecretStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SecretStore for SqliteSecretStore {
    async fn put(&self, space_path: &str, identifier: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO secrets (identifier, space_path, value, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(identifier) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(identifier)
        .bind(space_path)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, identifier: &str) -> Result<String> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM secrets WHERE identifier = ?")
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(value,)| value)
            .ok_or_else(|| Error::SecretError(format!("secret {} not found", identifier)))
    }
}
