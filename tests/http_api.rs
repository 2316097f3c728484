//! HTTP surface: routing, validation bounds, config mutation, error shapes.

mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::FakeSearcher;
use tower::ServiceExt;

use btca_server::collections::CollectionAssembler;
use btca_server::config::{ConfigFile, ConfigStore};
use btca_server::http::{App, router};
use btca_server::resources::ResourceStore;
use btca_server::search::Searcher;

fn test_app(root: &std::path::Path) -> Router {
    let config = Arc::new(ConfigStore::new(
        root.join("btca.config.jsonc"),
        ConfigFile::default(),
    ));
    let resources = Arc::new(ResourceStore::new(
        root.join("resources"),
        Arc::clone(&config),
    ));
    let collections = CollectionAssembler::new(root.join("collections"), Arc::clone(&resources) as _);
    let searcher: Arc<dyn Searcher> = Arc::new(FakeSearcher);
    router(Arc::new(App {
        config,
        resources,
        collections,
        searcher,
    }))
}

async fn send(router: Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(b) => Body::from(b.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_service_and_version() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = send(test_app(dir.path()), "GET", "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        serde_json::json!({"ok": true, "service": "btca-server", "version": "0.0.1"})
    );
}

#[tokio::test]
async fn config_projection_has_directories_and_count() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = send(test_app(dir.path()), "GET", "/config", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider"], "openrouter");
    assert_eq!(body["resourceCount"], 0);
    assert!(body["resourcesDirectory"].as_str().unwrap().contains("resources"));
    assert!(body["collectionsDirectory"].as_str().unwrap().contains("collections"));
}

#[tokio::test]
async fn resource_lifecycle_add_list_remove() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path());

    let (status, created) = send(
        app.clone(),
        "POST",
        "/config/resources",
        Some(
            r#"{"type":"git","name":"svelte","url":"https://github.com/sveltejs/svelte","branch":"main","searchPath":"documentation"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["type"], "git");
    assert_eq!(created["name"], "svelte");

    let (_, listed) = send(app.clone(), "GET", "/resources", None).await;
    assert_eq!(listed["resources"][0]["name"], "svelte");
    assert_eq!(listed["resources"][0]["searchPath"], "documentation");

    // The backing file is persisted on mutation.
    let saved = std::fs::read_to_string(dir.path().join("btca.config.jsonc")).unwrap();
    assert!(saved.contains("svelte"));

    let (status, removed) = send(
        app.clone(),
        "DELETE",
        "/config/resources",
        Some(r#"{"name":"svelte"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(removed, serde_json::json!({"success": true, "name": "svelte"}));

    let (_, listed) = send(app, "GET", "/resources", None).await;
    assert_eq!(listed["resources"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn duplicate_resource_name_rejects() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path());
    let body = r#"{"type":"git","name":"dup","url":"https://github.com/a/b","branch":"main"}"#;

    let (status, _) = send(app.clone(), "POST", "/config/resources", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, error) = send(app, "POST", "/config/resources", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["tag"], "RequestError");
}

#[tokio::test]
async fn invalid_resource_definition_is_a_request_error() {
    let dir = tempfile::tempdir().unwrap();
    let (status, error) = send(
        test_app(dir.path()),
        "POST",
        "/config/resources",
        Some(r#"{"type":"git","name":"x","url":"http://github.com/a/b","branch":"main"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["tag"], "RequestError");
    assert!(error["error"].as_str().unwrap().contains("https"));
}

#[tokio::test]
async fn unknown_resource_type_rejects() {
    let dir = tempfile::tempdir().unwrap();
    let (status, error) = send(
        test_app(dir.path()),
        "POST",
        "/config/resources",
        Some(r#"{"type":"svn","name":"x","url":"https://github.com/a/b","branch":"main"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["tag"], "RequestError");
}

#[tokio::test]
async fn question_over_limit_is_rejected_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let question = "x".repeat(10_001);
    let body = serde_json::json!({"question": question}).to_string();
    let (status, error) = send(test_app(dir.path()), "POST", "/question", Some(&body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["tag"], "RequestError");
    // No collection directory was created.
    assert!(!dir.path().join("collections").exists());
}

#[tokio::test]
async fn too_many_resources_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let names: Vec<String> = (0..21).map(|i| format!("r{i}")).collect();
    let body = serde_json::json!({"question": "q", "resources": names}).to_string();
    let (status, error) = send(test_app(dir.path()), "POST", "/question", Some(&body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["tag"], "RequestError");
}

#[tokio::test]
async fn question_with_no_configured_resources_is_a_collection_error() {
    let dir = tempfile::tempdir().unwrap();
    let (status, error) = send(
        test_app(dir.path()),
        "POST",
        "/question",
        Some(r#"{"question":"x","resources":[]}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["tag"], "CollectionError");
    assert!(error["hint"].is_string() || error["error"].is_string());
}

#[tokio::test]
async fn malformed_json_is_a_request_error() {
    let dir = tempfile::tempdir().unwrap();
    let (status, error) = send(
        test_app(dir.path()),
        "POST",
        "/question",
        Some("{not json"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["tag"], "RequestError");
}

#[tokio::test]
async fn unknown_body_fields_reject() {
    let dir = tempfile::tempdir().unwrap();
    let (status, error) = send(
        test_app(dir.path()),
        "POST",
        "/question",
        Some(r#"{"question":"x","verbose":true}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["tag"], "RequestError");
}

#[tokio::test]
async fn model_update_validates_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path());

    let (status, error) = send(
        app.clone(),
        "PUT",
        "/config/model",
        Some(r#"{"provider":"openai","model":"bad model name"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["tag"], "RequestError");

    let (status, updated) = send(
        app.clone(),
        "PUT",
        "/config/model",
        Some(r#"{"provider":"openai","model":"gpt-4.1"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["provider"], "openai");
    assert_eq!(updated["model"], "gpt-4.1");

    let saved = std::fs::read_to_string(dir.path().join("btca.config.jsonc")).unwrap();
    assert!(saved.contains("gpt-4.1"));
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let dir = tempfile::tempdir().unwrap();
    let response = test_app(dir.path())
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}
