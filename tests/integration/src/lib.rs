//! Shared client types for the gitspace server integration tests

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection settings for a running server
pub struct TestConfig {
    pub base_url: String,
    pub client: reqwest::Client,
}

impl TestConfig {
    /// Reads `GITSPACE_TEST_URL`, defaulting to a local server
    pub fn new() -> Self {
        let base_url = std::env::var("GITSPACE_TEST_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:3000".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self { base_url, client }
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier that does not collide between test runs
pub fn unique_identifier(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &suffix[..8])
}

#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct CreateGitspaceRequest {
    pub identifier: String,
    pub code_repo_url: String,
    pub ide: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl CreateGitspaceRequest {
    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            code_repo_url: "https://github.com/microsoft/vscode-remote-try-node.git".to_string(),
            ide: "vs_code_web".to_string(),
            name: None,
            branch: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InstanceResponse {
    pub identifier: String,
    pub state: String,
    pub url: Option<String>,
    pub access_type: String,
    pub total_time_used: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GitspaceResponse {
    pub id: i64,
    pub identifier: String,
    pub name: String,
    pub code_repo_url: String,
    pub branch: String,
    pub ide: String,
    pub state: String,
    pub is_marked_for_reset: bool,
    pub instance: Option<InstanceResponse>,
}

#[derive(Debug, Deserialize)]
pub struct ListGitspacesResponse {
    pub gitspaces: Vec<GitspaceResponse>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct EventResponse {
    pub event: String,
    pub message: String,
    pub entity_id: i64,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListEventsResponse {
    pub events: Vec<EventResponse>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
}

/// Create a gitspace config and return it
pub async fn create_gitspace(config: &TestConfig, identifier: &str) -> GitspaceResponse {
    let response = config
        .client
        .post(config.api_url("/gitspaces"))
        .json(&CreateGitspaceRequest::new(identifier))
        .send()
        .await
        .expect("Failed to create gitspace");
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    response.json().await.expect("Failed to parse gitspace response")
}

/// Best effort removal of a gitspace created by a test
pub async fn cleanup_gitspace(config: &TestConfig, identifier: &str) {
    let _ = config
        .client
        .delete(config.api_url(&format!("/gitspaces/{}", identifier)))
        .send()
        .await;
}
