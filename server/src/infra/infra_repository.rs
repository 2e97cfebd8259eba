//! Provisioned infrastructure repository

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, SqlitePool};

use super::sqlite::parse_timestamp;
use crate::domain::infra::{InfraProviderType, InfraStatus, Infrastructure, PortMapping};
use crate::error::{Error, Result};

/// Persistence of provisioned infrastructure, keyed by gitspace instance
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InfraStore: Send + Sync {
    /// Insert or replace the record of an instance
    async fn upsert(&self, infra: &Infrastructure) -> Result<()>;

    async fn find_by_instance(&self, gitspace_instance_identifier: &str) -> Result<Infrastructure>;
}

/// Database row for infrastructure
#[derive(Debug, FromRow)]
struct InfrastructureRow {
    identifier: String,
    space_path: String,
    gitspace_config_identifier: String,
    gitspace_instance_identifier: String,
    provider_type: String,
    provider_resource: String,
    agent_host: String,
    agent_port: i64,
    gitspace_host: String,
    proxy_host: Option<String>,
    port_mappings: String,
    storage_identifier: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<InfrastructureRow> for Infrastructure {
    type Error = Error;

    fn try_from(row: InfrastructureRow) -> Result<Self> {
        let provider_type = match row.provider_type.as_str() {
            "docker" => InfraProviderType::Docker,
            other => return Err(Error::Internal(format!("Invalid provider type: {}", other))),
        };
        let status = InfraStatus::from_str(&row.status)
            .ok_or_else(|| Error::Internal(format!("Invalid infra status: {}", row.status)))?;
        let port_mappings: HashMap<u16, PortMapping> = serde_json::from_str(&row.port_mappings)
            .map_err(|e| Error::Internal(format!("Failed to parse port mappings: {}", e)))?;

        Ok(Infrastructure {
            identifier: row.identifier,
            space_path: row.space_path,
            gitspace_config_identifier: row.gitspace_config_identifier,
            gitspace_instance_identifier: row.gitspace_instance_identifier,
            provider_type,
            provider_resource: row.provider_resource,
            agent_host: row.agent_host,
            agent_port: u16::try_from(row.agent_port).unwrap_or_default(),
            gitspace_host: row.gitspace_host,
            proxy_host: row.proxy_host,
            port_mappings,
            storage_identifier: row.storage_identifier,
            status,
            created_at: parse_timestamp("created_at", &row.created_at)?,
            updated_at: parse_timestamp("updated_at", &row.updated_at)?,
        })
    }
}

/// Infrastructure repository
pub struct InfraRepository {
    pool: SqlitePool,
}

impl InfraRepository {
    /// Create a new repository with the given pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InfraStore for InfraRepository {
    async fn upsert(&self, infra: &Infrastructure) -> Result<()> {
        let port_mappings = serde_json::to_string(&infra.port_mappings)?;

        sqlx::query(
            r#"
            INSERT INTO infrastructures (
                identifier, space_path, gitspace_config_identifier, gitspace_instance_identifier,
                provider_type, provider_resource, agent_host, agent_port, gitspace_host, proxy_host,
                port_mappings, storage_identifier, status, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(identifier) DO UPDATE SET
                agent_host = excluded.agent_host,
                agent_port = excluded.agent_port,
                gitspace_host = excluded.gitspace_host,
                proxy_host = excluded.proxy_host,
                port_mappings = excluded.port_mappings,
                storage_identifier = excluded.storage_identifier,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&infra.identifier)
        .bind(&infra.space_path)
        .bind(&infra.gitspace_config_identifier)
        .bind(&infra.gitspace_instance_identifier)
        .bind(infra.provider_type.as_str())
        .bind(&infra.provider_resource)
        .bind(&infra.agent_host)
        .bind(infra.agent_port as i64)
        .bind(&infra.gitspace_host)
        .bind(&infra.proxy_host)
        .bind(port_mappings)
        .bind(&infra.storage_identifier)
        .bind(infra.status.as_str())
        .bind(infra.created_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_instance(&self, gitspace_instance_identifier: &str) -> Result<Infrastructure> {
        let row: InfrastructureRow = sqlx::query_as(
            r#"
            SELECT identifier, space_path, gitspace_config_identifier, gitspace_instance_identifier,
                   provider_type, provider_resource, agent_host, agent_port, gitspace_host, proxy_host,
                   port_mappings, storage_identifier, status, created_at, updated_at
            FROM infrastructures
            WHERE gitspace_instance_identifier = ?
            "#,
        )
        .bind(gitspace_instance_identifier)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::InfraNotFound(gitspace_instance_identifier.to_string()))?;

        row.try_into()
    }
}
