//! Gitspace HTTP handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::domain::event::GitspaceEvent;
use crate::domain::gitspace::{
    CodeRepoCredentials, CreateGitspaceParams, GitspaceActionType, GitspaceConfig,
    GitspaceInstance, GitspaceInstanceState,
};
use crate::domain::ide::IdeType;
use crate::{AppState, Result};

const DEFAULT_EVENT_LIMIT: i64 = 100;

/// Create gitspace request
#[derive(Debug, Deserialize)]
pub struct CreateGitspaceRequest {
    pub identifier: String,
    pub name: Option<String>,
    pub space_path: Option<String>,
    pub user_identifier: Option<String>,
    pub code_repo_url: String,
    pub branch: Option<String>,
    pub devcontainer_path: Option<String>,
    pub ide: IdeType,
    pub infra_provider_resource: Option<String>,
    pub ssh_token_identifier: Option<String>,
    pub code_repo_credentials: Option<CodeRepoCredentials>,
}

/// Action request
#[derive(Debug, Deserialize)]
pub struct GitspaceActionRequest {
    pub action: GitspaceActionType,
}

/// Instance part of a gitspace response
#[derive(Debug, Serialize)]
pub struct InstanceResponse {
    pub identifier: String,
    pub state: String,
    pub url: Option<String>,
    pub access_type: String,
    pub total_time_used: i64,
    pub has_git_changes: Option<bool>,
    pub error_message: Option<String>,
    pub last_used: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Gitspace response
#[derive(Debug, Serialize)]
pub struct GitspaceResponse {
    pub id: i64,
    pub identifier: String,
    pub name: String,
    pub space_path: String,
    pub user_identifier: String,
    pub code_repo_url: String,
    pub branch: String,
    pub devcontainer_path: Option<String>,
    pub ide: String,
    pub infra_provider_resource: String,
    pub is_marked_for_reset: bool,
    /// State of the latest instance, `uninitialized` when there is none
    pub state: String,
    pub instance: Option<InstanceResponse>,
    pub created_at: String,
    pub updated_at: String,
}

/// List gitspaces response
#[derive(Debug, Serialize)]
pub struct ListGitspacesResponse {
    pub gitspaces: Vec<GitspaceResponse>,
    pub total: usize,
}

/// Event response
#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub event: String,
    pub message: String,
    pub entity_id: i64,
    pub timestamp: i64,
    pub created_at: String,
}

/// List events response
#[derive(Debug, Serialize)]
pub struct ListEventsResponse {
    pub events: Vec<EventResponse>,
    pub total: usize,
}

/// Events query parameters
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<i64>,
}

impl From<GitspaceInstance> for InstanceResponse {
    fn from(instance: GitspaceInstance) -> Self {
        Self {
            identifier: instance.identifier,
            state: instance.state.as_str().to_string(),
            url: instance.url,
            access_type: instance.access_type.as_str().to_string(),
            total_time_used: instance.total_time_used,
            has_git_changes: instance.has_git_changes,
            error_message: instance.error_message,
            last_used: instance.last_used.map(|t| t.to_rfc3339()),
            created_at: instance.created_at.to_rfc3339(),
            updated_at: instance.updated_at.to_rfc3339(),
        }
    }
}

impl From<GitspaceConfig> for GitspaceResponse {
    fn from(config: GitspaceConfig) -> Self {
        let state = config
            .instance
            .as_ref()
            .map(|i| i.state)
            .unwrap_or(GitspaceInstanceState::Uninitialized);
        Self {
            id: config.id,
            identifier: config.identifier,
            name: config.name,
            space_path: config.space_path,
            user_identifier: config.user_identifier,
            code_repo_url: config.code_repo_url,
            branch: config.branch,
            devcontainer_path: config.devcontainer_path,
            ide: config.ide.as_str().to_string(),
            infra_provider_resource: config.infra_provider_resource,
            is_marked_for_reset: config.is_marked_for_reset,
            state: state.as_str().to_string(),
            instance: config.instance.map(InstanceResponse::from),
            created_at: config.created_at.to_rfc3339(),
            updated_at: config.updated_at.to_rfc3339(),
        }
    }
}

impl From<GitspaceEvent> for EventResponse {
    fn from(event: GitspaceEvent) -> Self {
        Self {
            event: event.event.as_str().to_string(),
            message: event.message,
            entity_id: event.entity_id,
            timestamp: event.timestamp,
            created_at: event.created_at.to_rfc3339(),
        }
    }
}

/// Create a new gitspace config
pub async fn create_gitspace(
    State(state): State<AppState>,
    Json(req): Json<CreateGitspaceRequest>,
) -> Result<(StatusCode, Json<GitspaceResponse>)> {
    let params = CreateGitspaceParams {
        identifier: req.identifier,
        name: req.name,
        space_path: req.space_path,
        user_identifier: req.user_identifier,
        code_repo_url: req.code_repo_url,
        branch: req.branch,
        devcontainer_path: req.devcontainer_path,
        ide: req.ide,
        infra_provider_resource: req.infra_provider_resource,
        ssh_token_identifier: req.ssh_token_identifier,
        code_repo_credentials: req.code_repo_credentials,
    };

    let config = state.gitspace_service.create(params).await?;
    Ok((StatusCode::CREATED, Json(config.into())))
}

/// List gitspaces with their latest instance
pub async fn list_gitspaces(State(state): State<AppState>) -> Result<Json<ListGitspacesResponse>> {
    let gitspaces: Vec<GitspaceResponse> = state
        .gitspace_service
        .list()
        .await?
        .into_iter()
        .map(GitspaceResponse::from)
        .collect();
    let total = gitspaces.len();

    Ok(Json(ListGitspacesResponse { gitspaces, total }))
}

/// Get a gitspace by identifier
pub async fn get_gitspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<GitspaceResponse>> {
    let config = state.gitspace_service.find(&id).await?;
    Ok(Json(config.into()))
}

/// Start, stop or reset a gitspace; the work continues in the background
pub async fn gitspace_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<GitspaceActionRequest>,
) -> Result<(StatusCode, Json<GitspaceResponse>)> {
    let config = state.gitspace_service.action(&id, req.action).await?;
    Ok((StatusCode::ACCEPTED, Json(config.into())))
}

/// Delete a gitspace
pub async fn delete_gitspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.gitspace_service.delete(&id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Lifecycle events of a gitspace, oldest first
pub async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<ListEventsResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, 1000);
    let events: Vec<EventResponse> = state
        .gitspace_service
        .events(&id, limit)
        .await?
        .into_iter()
        .map(EventResponse::from)
        .collect();
    let total = events.len();

    Ok(Json(ListEventsResponse { events, total }))
}
