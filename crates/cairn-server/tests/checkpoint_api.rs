//! Integration tests for the checkpoint HTTP surface.
//!
//! Each test drives the real router against a scratch git repository and a
//! scratch checkpoint index.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use cairn_server::{config::Config, routes, state::AppState};
use git2::{Repository, Signature};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    repo: TempDir,
    _data: TempDir,
}

/// A repository with one commit containing `notes.txt`.
fn init_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path()).unwrap();
    std::fs::write(dir.path().join("notes.txt"), "v0\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("notes.txt")).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("test", "test@example.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
    dir
}

fn create_test_app() -> TestApp {
    let repo = init_repo();
    let data = TempDir::new().unwrap();
    let config = Config {
        port: 0,
        host: "127.0.0.1".to_string(),
        db_path: data.path().join("checkpoints.db"),
        project_dir: Some(repo.path().to_path_buf()),
        restore: Default::default(),
    };
    let state = Arc::new(AppState::new(&config).expect("Failed to create AppState"));
    let router = Router::new()
        .nest("/api", routes::api_router())
        .with_state(state);

    TestApp {
        router,
        repo,
        _data: data,
    }
}

impl TestApp {
    async fn request(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn event(&self, event: &str, node: &str) -> Value {
        let (status, body) = self
            .request(
                "POST",
                "/api/events",
                Some(json!({ "event": event, "session_id": "s1", "node_id": node, "text": format!("turn {node}") })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body
    }

    fn write(&self, content: &str) {
        std::fs::write(self.repo.path().join("notes.txt"), content).unwrap();
    }

    fn read(&self) -> String {
        std::fs::read_to_string(self.repo.path().join("notes.txt")).unwrap()
    }

    /// start -> U1 (edit) -> A1 (edit) -> U2 (no edit) -> A2 (edit)
    async fn run_scenario(&self) {
        self.event("session_start", "start").await;
        self.write("v1\n");
        self.event("user_turn_completed", "U1").await;
        self.write("v2\n");
        self.event("assistant_turn_completed", "A1").await;
        let body = self.event("user_turn_completed", "U2").await;
        assert_eq!(body["outcome"], "unchanged");
        self.write("v3\n");
        let body = self.event("assistant_turn_completed", "A2").await;
        assert_eq!(body["outcome"], "created");
        assert_eq!(body["replaced"]["node_id"], "A1");
    }
}

#[tokio::test]
async fn test_health() {
    let app = create_test_app();
    let (status, body) = app.request("GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_timeline_after_scenario() {
    let app = create_test_app();
    app.run_scenario().await;

    let (status, body) = app.request("GET", "/api/sessions/s1/timeline", None).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["node_id"], "U1");
    assert_eq!(entries[0]["role"], "user");
    assert_eq!(entries[0]["excerpt"], "turn U1");
    assert_eq!(entries[1]["node_id"], "A2");
    assert_eq!(entries[1]["is_current"], true);

    let (_, body) = app
        .request("GET", "/api/sessions/s1/nodes/U2/snapshot", None)
        .await;
    assert_eq!(body["has_snapshot"], false);
    let (_, body) = app
        .request("GET", "/api/sessions/s1/nodes/U1/snapshot", None)
        .await;
    assert_eq!(body["has_snapshot"], true);
}

#[tokio::test]
async fn test_undo_redo_and_position() {
    let app = create_test_app();
    app.run_scenario().await;

    let (status, body) = app.request("POST", "/api/sessions/s1/undo", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "restored");
    assert_eq!(body["entry"]["node_id"], "U1");
    assert_eq!(app.read(), "v1\n");

    let (_, body) = app.request("GET", "/api/sessions/s1/position", None).await;
    assert_eq!(body["node_id"], "U1");

    let (_, body) = app.request("POST", "/api/sessions/s1/undo", None).await;
    assert_eq!(body["outcome"], "nothing_earlier");
    assert_eq!(app.read(), "v1\n");

    let (_, body) = app.request("POST", "/api/sessions/s1/redo", None).await;
    assert_eq!(body["entry"]["node_id"], "A2");
    assert_eq!(app.read(), "v3\n");
}

#[tokio::test]
async fn test_jump_and_fork() {
    let app = create_test_app();
    app.run_scenario().await;

    let (_, body) = app
        .request(
            "POST",
            "/api/sessions/s1/jump",
            Some(json!({ "node_id": "U2", "choice": "files_and_position" })),
        )
        .await;
    assert_eq!(body["outcome"], "no_snapshot");

    let (_, body) = app
        .request(
            "POST",
            "/api/sessions/s1/jump",
            Some(json!({ "node_id": "U1", "choice": "files_only" })),
        )
        .await;
    assert_eq!(body["outcome"], "restored");
    assert_eq!(app.read(), "v1\n");
    let (_, body) = app.request("GET", "/api/sessions/s1/position", None).await;
    assert_eq!(body["node_id"], Value::Null);

    let (status, body) = app
        .request(
            "POST",
            "/api/sessions/s1/fork",
            Some(json!({ "node_id": "U2", "mode": "restore_files_only" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fork_conversation"], false);
    assert_eq!(body["restore"]["source"], "resume_fallback");
    assert_eq!(app.read(), "v0\n");
}

#[tokio::test]
async fn test_clear_session() {
    let app = create_test_app();
    app.run_scenario().await;

    let (status, body) = app
        .request("DELETE", "/api/sessions/s1/checkpoints", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["refs_deleted"], 3);
    assert_eq!(body["entries_removed"], 3);

    let repo = Repository::open(app.repo.path()).unwrap();
    assert_eq!(repo.references_glob("refs/cairn/s1/*").unwrap().count(), 0);

    let (_, body) = app.request("GET", "/api/sessions/s1/timeline", None).await;
    assert!(body["entries"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_input_is_rejected() {
    let app = create_test_app();

    let (status, body) = app.request("GET", "/api/sessions/bad.id/timeline", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["operation"], "timeline");
    assert_eq!(body["unchanged"], true);

    let (status, body) = app
        .request(
            "POST",
            "/api/events",
            Some(json!({ "event": "session_start", "session_id": "../etc", "node_id": "n" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["operation"], "event");
}

#[tokio::test]
async fn test_non_repository_is_unavailable() {
    let app = create_test_app();
    let elsewhere = TempDir::new().unwrap();

    let (status, body) = app
        .request(
            "POST",
            "/api/events",
            Some(json!({
                "event": "session_start",
                "session_id": "s2",
                "node_id": "start",
                "project_dir": elsewhere.path(),
            })),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["operation"], "event");
    assert_eq!(body["unchanged"], true);
}
