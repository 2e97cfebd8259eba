//! SQLite database layer for gitspace configs and instances

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};

use crate::domain::gitspace::{
    CodeRepoCredentials, CreateGitspaceParams, GitspaceAccessType, GitspaceConfig,
    GitspaceInstance, GitspaceInstanceState,
};
use crate::domain::ide::IdeType;
use crate::error::{Error, Result};

/// Initialize the database connection pool
pub async fn init_pool(database_url: &str) -> anyhow::Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(path) = database_url.strip_prefix("sqlite:") {
        if let Some(path) = path.split('?').next() {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

pub(crate) fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))
}

pub(crate) fn parse_optional_timestamp(
    field: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_timestamp(field, &v)).transpose()
}

/// In-memory pool with migrations applied, for tests
#[cfg(test)]
pub(crate) async fn create_test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test pool");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Persistence of gitspace configs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitspaceConfigStore: Send + Sync {
    async fn create(&self, params: CreateGitspaceParams) -> Result<GitspaceConfig>;

    async fn find(&self, id: i64) -> Result<GitspaceConfig>;

    /// Find a non-deleted config by identifier
    async fn find_by_identifier(&self, identifier: &str) -> Result<GitspaceConfig>;

    async fn update(&self, config: &GitspaceConfig) -> Result<()>;

    /// Non-deleted configs with their latest instance attached
    async fn list_with_latest_instance(&self) -> Result<Vec<GitspaceConfig>>;

    /// Soft delete
    async fn delete(&self, id: i64) -> Result<()>;
}

/// Persistence of gitspace instances
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitspaceInstanceStore: Send + Sync {
    async fn create(&self, instance: &GitspaceInstance) -> Result<GitspaceInstance>;

    async fn find(&self, id: i64) -> Result<GitspaceInstance>;

    async fn find_by_identifier(&self, identifier: &str) -> Result<GitspaceInstance>;

    async fn find_latest_by_gitspace_config_id(
        &self,
        gitspace_config_id: i64,
    ) -> Result<Option<GitspaceInstance>>;

    /// Persist every mutable field and refresh `updated_at`
    async fn update(&self, instance: &mut GitspaceInstance) -> Result<()>;

    /// Instances that still hold resources
    async fn list_active(&self) -> Result<Vec<GitspaceInstance>>;
}

/// Database row for gitspace config
#[derive(Debug, FromRow)]
struct GitspaceConfigRow {
    id: i64,
    identifier: String,
    name: String,
    space_path: String,
    user_identifier: String,
    code_repo_url: String,
    branch: String,
    devcontainer_path: Option<String>,
    ide: String,
    infra_provider_resource: String,
    ssh_token_identifier: Option<String>,
    code_repo_username: Option<String>,
    code_repo_password: Option<String>,
    is_marked_for_reset: bool,
    is_deleted: bool,
    created_at: String,
    updated_at: String,
}

impl TryFrom<GitspaceConfigRow> for GitspaceConfig {
    type Error = Error;

    fn try_from(row: GitspaceConfigRow) -> Result<Self> {
        let ide = IdeType::from_str(&row.ide)
            .ok_or_else(|| Error::Internal(format!("Invalid IDE type: {}", row.ide)))?;

        let code_repo_credentials = match (row.code_repo_username, row.code_repo_password) {
            (Some(username), Some(password)) => Some(CodeRepoCredentials { username, password }),
            _ => None,
        };

        Ok(GitspaceConfig {
            id: row.id,
            identifier: row.identifier,
            name: row.name,
            space_path: row.space_path,
            user_identifier: row.user_identifier,
            code_repo_url: row.code_repo_url,
            branch: row.branch,
            devcontainer_path: row.devcontainer_path,
            ide,
            infra_provider_resource: row.infra_provider_resource,
            ssh_token_identifier: row.ssh_token_identifier,
            code_repo_credentials,
            is_marked_for_reset: row.is_marked_for_reset,
            is_deleted: row.is_deleted,
            created_at: parse_timestamp("created_at", &row.created_at)?,
            updated_at: parse_timestamp("updated_at", &row.updated_at)?,
            instance: None,
        })
    }
}

const CONFIG_COLUMNS: &str = "id, identifier, name, space_path, user_identifier, code_repo_url, branch, \
     devcontainer_path, ide, infra_provider_resource, ssh_token_identifier, code_repo_username, \
     code_repo_password, is_marked_for_reset, is_deleted, created_at, updated_at";

/// Gitspace config repository for database operations
pub struct GitspaceConfigRepository {
    pool: SqlitePool,
}

impl GitspaceConfigRepository {
    /// Create a new repository with the given pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn latest_instance(&self, config_id: i64) -> Result<Option<GitspaceInstance>> {
        GitspaceInstanceRepository::new(self.pool.clone())
            .find_latest_by_gitspace_config_id(config_id)
            .await
    }
}

#[async_trait]
impl GitspaceConfigStore for GitspaceConfigRepository {
    async fn create(&self, params: CreateGitspaceParams) -> Result<GitspaceConfig> {
        match self.find_by_identifier(&params.identifier).await {
            Ok(_) => return Err(Error::GitspaceAlreadyExists(params.identifier)),
            Err(Error::GitspaceNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let now = Utc::now().to_rfc3339();
        let (username, password) = match &params.code_repo_credentials {
            Some(creds) => (Some(creds.username.clone()), Some(creds.password.clone())),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO gitspace_configs (
                identifier, name, space_path, user_identifier, code_repo_url, branch,
                devcontainer_path, ide, infra_provider_resource, ssh_token_identifier,
                code_repo_username, code_repo_password, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&params.identifier)
        .bind(params.name.as_deref().unwrap_or(&params.identifier))
        .bind(params.space_path.as_deref().unwrap_or("default"))
        .bind(params.user_identifier.as_deref().unwrap_or("default"))
        .bind(&params.code_repo_url)
        .bind(params.branch.as_deref().unwrap_or("main"))
        .bind(&params.devcontainer_path)
        .bind(params.ide.as_str())
        .bind(params.infra_provider_resource.as_deref().unwrap_or("default"))
        .bind(&params.ssh_token_identifier)
        .bind(username)
        .bind(password)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.find(result.last_insert_rowid()).await
    }

    async fn find(&self, id: i64) -> Result<GitspaceConfig> {
        let row: GitspaceConfigRow = sqlx::query_as(&format!(
            "SELECT {} FROM gitspace_configs WHERE id = ?",
            CONFIG_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::GitspaceNotFound(id.to_string()))?;

        row.try_into()
    }

    async fn find_by_identifier(&self, identifier: &str) -> Result<GitspaceConfig> {
        let row: GitspaceConfigRow = sqlx::query_as(&format!(
            "SELECT {} FROM gitspace_configs WHERE identifier = ? AND is_deleted = 0",
            CONFIG_COLUMNS
        ))
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::GitspaceNotFound(identifier.to_string()))?;

        row.try_into()
    }

    async fn update(&self, config: &GitspaceConfig) -> Result<()> {
        let (username, password) = match &config.code_repo_credentials {
            Some(creds) => (Some(creds.username.clone()), Some(creds.password.clone())),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE gitspace_configs
            SET name = ?, branch = ?, devcontainer_path = ?, ide = ?, infra_provider_resource = ?,
                ssh_token_identifier = ?, code_repo_username = ?, code_repo_password = ?,
                is_marked_for_reset = ?, is_deleted = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&config.name)
        .bind(&config.branch)
        .bind(&config.devcontainer_path)
        .bind(config.ide.as_str())
        .bind(&config.infra_provider_resource)
        .bind(&config.ssh_token_identifier)
        .bind(username)
        .bind(password)
        .bind(config.is_marked_for_reset)
        .bind(config.is_deleted)
        .bind(Utc::now().to_rfc3339())
        .bind(config.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::GitspaceNotFound(config.identifier.clone()));
        }

        Ok(())
    }

    async fn list_with_latest_instance(&self) -> Result<Vec<GitspaceConfig>> {
        let rows: Vec<GitspaceConfigRow> = sqlx::query_as(&format!(
            "SELECT {} FROM gitspace_configs WHERE is_deleted = 0 ORDER BY created_at DESC, id DESC",
            CONFIG_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut configs = Vec::with_capacity(rows.len());
        for row in rows {
            let mut config: GitspaceConfig = row.try_into()?;
            config.instance = self.latest_instance(config.id).await?;
            configs.push(config);
        }

        Ok(configs)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE gitspace_configs SET is_deleted = 1, updated_at = ? WHERE id = ? AND is_deleted = 0",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::GitspaceNotFound(id.to_string()));
        }

        Ok(())
    }
}

/// Database row for gitspace instance
#[derive(Debug, FromRow)]
struct GitspaceInstanceRow {
    id: i64,
    gitspace_config_id: i64,
    identifier: String,
    state: String,
    url: Option<String>,
    access_type: String,
    access_key_ref: Option<String>,
    machine_user: Option<String>,
    space_path: String,
    user_identifier: String,
    last_used: Option<String>,
    total_time_used: i64,
    active_time_started: Option<String>,
    active_time_ended: Option<String>,
    last_heartbeat: Option<String>,
    has_git_changes: Option<bool>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<GitspaceInstanceRow> for GitspaceInstance {
    type Error = Error;

    fn try_from(row: GitspaceInstanceRow) -> Result<Self> {
        let state = GitspaceInstanceState::from_str(&row.state)
            .ok_or_else(|| Error::Internal(format!("Invalid instance state: {}", row.state)))?;

        let access_type = GitspaceAccessType::from_str(&row.access_type)
            .ok_or_else(|| Error::Internal(format!("Invalid access type: {}", row.access_type)))?;

        Ok(GitspaceInstance {
            id: row.id,
            gitspace_config_id: row.gitspace_config_id,
            identifier: row.identifier,
            state,
            url: row.url,
            access_type,
            access_key_ref: row.access_key_ref,
            access_key: None,
            machine_user: row.machine_user,
            space_path: row.space_path,
            user_identifier: row.user_identifier,
            last_used: parse_optional_timestamp("last_used", row.last_used)?,
            total_time_used: row.total_time_used,
            active_time_started: parse_optional_timestamp(
                "active_time_started",
                row.active_time_started,
            )?,
            active_time_ended: parse_optional_timestamp("active_time_ended", row.active_time_ended)?,
            last_heartbeat: parse_optional_timestamp("last_heartbeat", row.last_heartbeat)?,
            has_git_changes: row.has_git_changes,
            error_message: row.error_message,
            created_at: parse_timestamp("created_at", &row.created_at)?,
            updated_at: parse_timestamp("updated_at", &row.updated_at)?,
        })
    }
}

const INSTANCE_COLUMNS: &str = "id, gitspace_config_id, identifier, state, url, access_type, \
     access_key_ref, machine_user, space_path, user_identifier, last_used, total_time_used, \
     active_time_started, active_time_ended, last_heartbeat, has_git_changes, error_message, \
     created_at, updated_at";

/// Gitspace instance repository for database operations
pub struct GitspaceInstanceRepository {
    pool: SqlitePool,
}

impl GitspaceInstanceRepository {
    /// Create a new repository with the given pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn rfc3339(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|t| t.to_rfc3339())
}

#[async_trait]
impl GitspaceInstanceStore for GitspaceInstanceRepository {
    async fn create(&self, instance: &GitspaceInstance) -> Result<GitspaceInstance> {
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            INSERT INTO gitspace_instances (
                gitspace_config_id, identifier, state, url, access_type, access_key_ref,
                machine_user, space_path, user_identifier, last_used, total_time_used,
                active_time_started, active_time_ended, last_heartbeat, has_git_changes,
                error_message, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(instance.gitspace_config_id)
        .bind(&instance.identifier)
        .bind(instance.state.as_str())
        .bind(&instance.url)
        .bind(instance.access_type.as_str())
        .bind(&instance.access_key_ref)
        .bind(&instance.machine_user)
        .bind(&instance.space_path)
        .bind(&instance.user_identifier)
        .bind(rfc3339(instance.last_used))
        .bind(instance.total_time_used)
        .bind(rfc3339(instance.active_time_started))
        .bind(rfc3339(instance.active_time_ended))
        .bind(rfc3339(instance.last_heartbeat))
        .bind(instance.has_git_changes)
        .bind(&instance.error_message)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let mut created = self.find(result.last_insert_rowid()).await?;
        created.access_key = instance.access_key.clone();
        Ok(created)
    }

    async fn find(&self, id: i64) -> Result<GitspaceInstance> {
        let row: GitspaceInstanceRow = sqlx::query_as(&format!(
            "SELECT {} FROM gitspace_instances WHERE id = ?",
            INSTANCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;

        row.try_into()
    }

    async fn find_by_identifier(&self, identifier: &str) -> Result<GitspaceInstance> {
        let row: GitspaceInstanceRow = sqlx::query_as(&format!(
            "SELECT {} FROM gitspace_instances WHERE identifier = ?",
            INSTANCE_COLUMNS
        ))
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::InstanceNotFound(identifier.to_string()))?;

        row.try_into()
    }

    async fn find_latest_by_gitspace_config_id(
        &self,
        gitspace_config_id: i64,
    ) -> Result<Option<GitspaceInstance>> {
        let row: Option<GitspaceInstanceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM gitspace_instances WHERE gitspace_config_id = ? ORDER BY id DESC LIMIT 1",
            INSTANCE_COLUMNS
        ))
        .bind(gitspace_config_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(GitspaceInstance::try_from).transpose()
    }

    async fn update(&self, instance: &mut GitspaceInstance) -> Result<()> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE gitspace_instances
            SET state = ?, url = ?, access_type = ?, access_key_ref = ?, machine_user = ?,
                last_used = ?, total_time_used = ?, active_time_started = ?, active_time_ended = ?,
                last_heartbeat = ?, has_git_changes = ?, error_message = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(instance.state.as_str())
        .bind(&instance.url)
        .bind(instance.access_type.as_str())
        .bind(&instance.access_key_ref)
        .bind(&instance.machine_user)
        .bind(rfc3339(instance.last_used))
        .bind(instance.total_time_used)
        .bind(rfc3339(instance.active_time_started))
        .bind(rfc3339(instance.active_time_ended))
        .bind(rfc3339(instance.last_heartbeat))
        .bind(instance.has_git_changes)
        .bind(&instance.error_message)
        .bind(now.to_rfc3339())
        .bind(instance.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::InstanceNotFound(instance.identifier.clone()));
        }

        instance.updated_at = now;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<GitspaceInstance>> {
        let rows: Vec<GitspaceInstanceRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM gitspace_instances
            WHERE state IN ('starting', 'running', 'stopping', 'cleaning')
            ORDER BY id
            "#,
            INSTANCE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(identifier: &str) -> CreateGitspaceParams {
        CreateGitspaceParams {
            identifier: identifier.to_string(),
            name: None,
            space_path: Some("acme".to_string()),
            user_identifier: Some("alice".to_string()),
            code_repo_url: "https://github.com/acme/app.git".to_string(),
            branch: None,
            devcontainer_path: None,
            ide: IdeType::VsCodeWeb,
            infra_provider_resource: None,
            ssh_token_identifier: None,
            code_repo_credentials: Some(CodeRepoCredentials {
                username: "alice".to_string(),
                password: "s3cret".to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn test_create_and_find_config() {
        let pool = create_test_pool().await;
        let repo = GitspaceConfigRepository::new(pool);

        let config = repo.create(params("app")).await.expect("Failed to create config");
        assert_eq!(config.name, "app");
        assert_eq!(config.branch, "main");
        assert_eq!(config.ide, IdeType::VsCodeWeb);
        assert_eq!(
            config.code_repo_credentials.as_ref().map(|c| c.password.as_str()),
            Some("s3cret")
        );

        let fetched = repo.find_by_identifier("app").await.expect("Failed to find config");
        assert_eq!(fetched.id, config.id);

        let duplicate = repo.create(params("app")).await;
        assert!(matches!(duplicate, Err(Error::GitspaceAlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_soft_delete_config() {
        let pool = create_test_pool().await;
        let repo = GitspaceConfigRepository::new(pool);

        let config = repo.create(params("app")).await.expect("Failed to create config");
        repo.delete(config.id).await.expect("Failed to delete config");

        assert!(matches!(
            repo.find_by_identifier("app").await,
            Err(Error::GitspaceNotFound(_))
        ));
        let deleted = repo.find(config.id).await.expect("Row must survive a soft delete");
        assert!(deleted.is_deleted);

        // The identifier can be reused once the old config is deleted
        repo.create(params("app")).await.expect("Failed to recreate config");
    }

    #[tokio::test]
    async fn test_latest_instance_and_update() {
        let pool = create_test_pool().await;
        let configs = GitspaceConfigRepository::new(pool.clone());
        let instances = GitspaceInstanceRepository::new(pool);

        let config = configs.create(params("app")).await.expect("Failed to create config");
        assert!(instances
            .find_latest_by_gitspace_config_id(config.id)
            .await
            .expect("Failed to query")
            .is_none());

        let first = instances
            .create(&GitspaceInstance::new_for(&config))
            .await
            .expect("Failed to create instance");
        let mut second = instances
            .create(&GitspaceInstance::new_for(&config))
            .await
            .expect("Failed to create instance");

        let latest = instances
            .find_latest_by_gitspace_config_id(config.id)
            .await
            .expect("Failed to query")
            .expect("Instance must exist");
        assert_eq!(latest.id, second.id);
        assert_ne!(latest.id, first.id);

        second.state = GitspaceInstanceState::Starting;
        second.has_git_changes = Some(true);
        second.active_time_started = Some(Utc::now());
        instances.update(&mut second).await.expect("Failed to update");

        let fetched = instances
            .find_by_identifier(&second.identifier)
            .await
            .expect("Failed to find instance");
        assert_eq!(fetched.state, GitspaceInstanceState::Starting);
        assert_eq!(fetched.has_git_changes, Some(true));
        assert!(fetched.active_time_started.is_some());

        let active = instances.list_active().await.expect("Failed to list");
        assert_eq!(active.len(), 1);

        let listed = configs
            .list_with_latest_instance()
            .await
            .expect("Failed to list configs");
        assert_eq!(listed.len(), 1);
        assert_eq!(
            listed[0].instance.as_ref().map(|i| i.id),
            Some(second.id)
        );
    }

    #[tokio::test]
    async fn test_update_missing_instance() {
        let pool = create_test_pool().await;
        let configs = GitspaceConfigRepository::new(pool.clone());
        let instances = GitspaceInstanceRepository::new(pool);

        let config = configs.create(params("app")).await.expect("Failed to create config");
        let mut instance = GitspaceInstance::new_for(&config);
        instance.id = 42;
        assert!(matches!(
            instances.update(&mut instance).await,
            Err(Error::InstanceNotFound(_))
        ));
    }
}
