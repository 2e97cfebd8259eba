//! Integration tests for the Gitspace Server
//!
//! These tests require a running server.
//! Run with: GITSPACE_TEST_URL=http://127.0.0.1:3000 cargo test

use integration_tests::*;
use reqwest::StatusCode;

// ============================================================================
// Health Tests
// ============================================================================

#[tokio::test]
async fn test_health_check() {
    let config = TestConfig::new();

    let response = config
        .client
        .get(config.api_url("/health"))
        .send()
        .await
        .expect("Failed to send health request");

    assert!(
        response.status().is_success(),
        "Health check failed with status: {}",
        response.status()
    );

    let health: HealthResponse = response.json().await.expect("Failed to parse health response");
    assert_eq!(health.status, "ok");
    assert!(!health.version.is_empty());
}

// ============================================================================
// Gitspace Config Tests
// ============================================================================

#[tokio::test]
async fn test_create_gitspace() {
    let config = TestConfig::new();
    let identifier = unique_identifier("create");

    let gitspace = create_gitspace(&config, &identifier).await;

    assert!(gitspace.id > 0);
    assert_eq!(gitspace.identifier, identifier);
    assert_eq!(gitspace.ide, "vs_code_web");
    assert_eq!(gitspace.state, "uninitialized");
    assert!(gitspace.instance.is_none());
    assert!(!gitspace.is_marked_for_reset);

    cleanup_gitspace(&config, &identifier).await;
}

#[tokio::test]
async fn test_create_duplicate_gitspace_conflicts() {
    let config = TestConfig::new();
    let identifier = unique_identifier("dup");
    create_gitspace(&config, &identifier).await;

    let response = config
        .client
        .post(config.api_url("/gitspaces"))
        .json(&CreateGitspaceRequest::new(&identifier))
        .send()
        .await
        .expect("Failed to send create request");

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.code, 2003);

    cleanup_gitspace(&config, &identifier).await;
}

#[tokio::test]
async fn test_create_gitspace_without_repo_url_is_rejected() {
    let config = TestConfig::new();
    let mut request = CreateGitspaceRequest::new(&unique_identifier("norepo"));
    request.code_repo_url = "  ".to_string();

    let response = config
        .client
        .post(config.api_url("/gitspaces"))
        .json(&request)
        .send()
        .await
        .expect("Failed to send create request");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_gitspace() {
    let config = TestConfig::new();
    let identifier = unique_identifier("get");
    let created = create_gitspace(&config, &identifier).await;

    let response = config
        .client
        .get(config.api_url(&format!("/gitspaces/{}", identifier)))
        .send()
        .await
        .expect("Failed to get gitspace");

    assert!(response.status().is_success());
    let gitspace: GitspaceResponse = response.json().await.unwrap();
    assert_eq!(gitspace.id, created.id);
    assert_eq!(gitspace.code_repo_url, created.code_repo_url);

    cleanup_gitspace(&config, &identifier).await;
}

#[tokio::test]
async fn test_get_unknown_gitspace_returns_404() {
    let config = TestConfig::new();

    let response = config
        .client
        .get(config.api_url("/gitspaces/does-not-exist-404"))
        .send()
        .await
        .expect("Failed to send get request");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.code, 2001);
    assert!(!error.message.is_empty());
}

#[tokio::test]
async fn test_list_gitspaces() {
    let config = TestConfig::new();
    let first = unique_identifier("list");
    let second = unique_identifier("list");
    create_gitspace(&config, &first).await;
    create_gitspace(&config, &second).await;

    let response = config
        .client
        .get(config.api_url("/gitspaces"))
        .send()
        .await
        .expect("Failed to list gitspaces");

    assert!(response.status().is_success());
    let list: ListGitspacesResponse = response.json().await.unwrap();
    assert!(list.total >= 2);
    assert_eq!(list.total, list.gitspaces.len());
    assert!(list.gitspaces.iter().any(|g| g.identifier == first));
    assert!(list.gitspaces.iter().any(|g| g.identifier == second));

    cleanup_gitspace(&config, &first).await;
    cleanup_gitspace(&config, &second).await;
}

#[tokio::test]
async fn test_delete_gitspace() {
    let config = TestConfig::new();
    let identifier = unique_identifier("delete");
    create_gitspace(&config, &identifier).await;

    let response = config
        .client
        .delete(config.api_url(&format!("/gitspaces/{}", identifier)))
        .send()
        .await
        .expect("Failed to delete gitspace");
    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);

    let response = config
        .client
        .get(config.api_url(&format!("/gitspaces/{}", identifier)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ============================================================================
// Action Tests
// ============================================================================

#[tokio::test]
async fn test_stop_without_instance_is_rejected() {
    let config = TestConfig::new();
    let identifier = unique_identifier("stop");
    create_gitspace(&config, &identifier).await;

    let response = config
        .client
        .post(config.api_url(&format!("/gitspaces/{}/actions", identifier)))
        .json(&serde_json::json!({ "action": "stop" }))
        .send()
        .await
        .expect("Failed to send stop action");

    // No instance yet
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.code, 2002);

    cleanup_gitspace(&config, &identifier).await;
}

#[tokio::test]
async fn test_unknown_action_is_rejected() {
    let config = TestConfig::new();
    let identifier = unique_identifier("action");
    create_gitspace(&config, &identifier).await;

    let response = config
        .client
        .post(config.api_url(&format!("/gitspaces/{}/actions", identifier)))
        .json(&serde_json::json!({ "action": "explode" }))
        .send()
        .await
        .expect("Failed to send action");

    assert!(response.status().is_client_error());

    cleanup_gitspace(&config, &identifier).await;
}

#[tokio::test]
async fn test_start_action_creates_starting_instance() {
    let config = TestConfig::new();
    let identifier = unique_identifier("start");
    create_gitspace(&config, &identifier).await;

    let response = config
        .client
        .post(config.api_url(&format!("/gitspaces/{}/actions", identifier)))
        .json(&serde_json::json!({ "action": "start" }))
        .send()
        .await
        .expect("Failed to send start action");

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let gitspace: GitspaceResponse = response.json().await.unwrap();
    let instance = gitspace.instance.expect("start must create an instance");
    assert!(instance.identifier.starts_with(&identifier));
    assert_eq!(instance.state, "starting");

    // A second start while busy is refused
    let response = config
        .client
        .post(config.api_url(&format!("/gitspaces/{}/actions", identifier)))
        .json(&serde_json::json!({ "action": "start" }))
        .send()
        .await
        .unwrap();
    assert!(
        response.status() == StatusCode::FORBIDDEN || response.status() == StatusCode::ACCEPTED,
        "unexpected status {}",
        response.status()
    );

    cleanup_gitspace(&config, &identifier).await;
}

// ============================================================================
// Event Tests
// ============================================================================

#[tokio::test]
async fn test_list_events_after_start() {
    let config = TestConfig::new();
    let identifier = unique_identifier("events");
    create_gitspace(&config, &identifier).await;

    config
        .client
        .post(config.api_url(&format!("/gitspaces/{}/actions", identifier)))
        .json(&serde_json::json!({ "action": "start" }))
        .send()
        .await
        .expect("Failed to send start action");

    // Events are persisted asynchronously by the event readers
    let mut events = Vec::new();
    for _ in 0..20 {
        let list: ListEventsResponse = config
            .client
            .get(config.api_url(&format!("/gitspaces/{}/events?limit=50", identifier)))
            .send()
            .await
            .expect("Failed to list events")
            .json()
            .await
            .unwrap();
        if list.total > 0 {
            events = list.events;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }

    assert!(
        events.iter().any(|e| e.event == "gitspace_action_start"),
        "missing start event in {:?}",
        events
    );

    cleanup_gitspace(&config, &identifier).await;
}
