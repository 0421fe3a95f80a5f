use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderMap, Method, Request, StatusCode},
};
use dashstate::server::{AppState, build_router};
use dashstate::ServerConfig;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

async fn app(config: ServerConfig) -> Router {
    let state = AppState::open(&config).await.expect("state should open");
    build_router(state)
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<String>,
    headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body)),
        None => builder.body(Body::empty()),
    }
    .expect("request should build");

    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("response expected");
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");

    if body.is_empty() {
        return (status, headers, Value::Null);
    }
    let json = serde_json::from_slice::<Value>(&body).expect("body should be valid JSON");
    (status, headers, json)
}

async fn post_json(app: &Router, uri: &str, payload: Value) -> (StatusCode, Value) {
    let (status, _, body) = send(app, Method::POST, uri, Some(payload.to_string()), &[]).await;
    (status, body)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, _, body) = send(app, Method::GET, uri, None, &[]).await;
    (status, body)
}

async fn backup_names(app: &Router, source: &str) -> Vec<String> {
    let (status, listing) = get_json(app, "/api/state/backups").await;
    assert_eq!(status, StatusCode::OK);
    listing[source]
        .as_array()
        .expect("listing should be an array")
        .iter()
        .map(|entry| entry["name"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_health_is_open() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path())).await;
    let (status, body) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));
}

#[tokio::test]
async fn test_first_small_then_large_write_backs_up_once() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path())).await;

    let (status, body) = get_json(&app, "/api/state").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"version": 1, "data": {}}));

    let (status, body) = post_json(&app, "/api/state", json!({"version": 1, "data": {"a": 1}})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));
    assert!(backup_names(&app, "primary").await.is_empty());

    let (status, _) = post_json(
        &app,
        "/api/state",
        json!({"version": 1, "data": {"a": 1, "b": 2, "c": 3, "d": 4}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let primary = backup_names(&app, "primary").await;
    let secondary = backup_names(&app, "secondary").await;
    assert_eq!(primary.len(), 1);
    assert_eq!(primary, secondary);

    let backup_path = temp.path().join("state_backups").join(&primary[0]);
    let backup: Value = serde_json::from_slice(&std::fs::read(backup_path).unwrap()).unwrap();
    assert_eq!(backup["data"], json!({"a": 1}));

    let (_, body) = get_json(&app, "/api/state").await;
    assert_eq!(body["data"], json!({"a": 1, "b": 2, "c": 3, "d": 4}));
}

#[tokio::test]
async fn test_identical_repost_creates_no_backup() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path())).await;
    let state = json!({"data": {"todoTasks": [1, 2, 3], "quickLinks": []}});

    post_json(&app, "/api/state", state.clone()).await;
    for _ in 0..3 {
        let (status, _) = post_json(&app, "/api/state", state.clone()).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert!(backup_names(&app, "primary").await.is_empty());
}

#[tokio::test]
async fn test_metadata_only_change_creates_no_backup() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path())).await;

    post_json(&app, "/api/state", json!({"data": {"a": 1}})).await;
    post_json(
        &app,
        "/api/state",
        json!({"data": {"a": 1, "appMeta": {"version": "0.2.0", "lastSavedAt": "2024-01-01T00:00:00.000Z"}}}),
    )
    .await;
    assert!(backup_names(&app, "primary").await.is_empty());
}

#[tokio::test]
async fn test_restore_is_reversible() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path())).await;
    let original = json!({"todoTasks": ["x"], "journalEntries": [], "hobbyTracker": {}});
    let replacement = json!({"todoTasks": ["y"]});

    post_json(&app, "/api/state", json!({"data": original})).await;
    post_json(&app, "/api/state", json!({"data": replacement})).await;

    let names = backup_names(&app, "primary").await;
    assert_eq!(names.len(), 1);

    let (status, body) = post_json(
        &app,
        "/api/state/backups/restore",
        json!({"name": names[0], "source": "secondary"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["restored"], names[0].as_str());
    assert_eq!(body["source"], "secondary");

    let (_, state) = get_json(&app, "/api/state").await;
    assert_eq!(state["data"], original);

    // the replaced state was kept as a pre-restore backup
    let after = backup_names(&app, "primary").await;
    assert_eq!(after.len(), 2);
    let pre_restore = after
        .iter()
        .find(|name| name.ends_with("_pre-restore.json"))
        .expect("pre-restore backup should exist");
    let (status, _) = post_json(
        &app,
        "/api/state/backups/restore",
        json!({"name": pre_restore}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, state) = get_json(&app, "/api/state").await;
    assert_eq!(state["data"], replacement);
}

#[tokio::test]
async fn test_retention_keeps_most_recent() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path()).max_backups(3)).await;

    let small = json!({"data": {"a": 1}});
    let large = json!({"data": {"a": 1, "b": 2, "c": 3, "d": 4}});
    for round in 0..6 {
        let payload = if round % 2 == 0 { &small } else { &large };
        post_json(&app, "/api/state", payload.clone()).await;
    }

    // five transitions after the first write, each a great delta
    let primary = backup_names(&app, "primary").await;
    let secondary = backup_names(&app, "secondary").await;
    assert_eq!(primary.len(), 3);
    assert_eq!(primary, secondary);

    let mut sorted = primary.clone();
    sorted.sort();
    sorted.reverse();
    assert_eq!(primary, sorted, "listing should be newest first");
}

#[tokio::test]
async fn test_invalid_backup_names_are_rejected_without_side_effects() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path())).await;
    post_json(&app, "/api/state", json!({"data": {"keep": true}})).await;

    for name in [
        "../server_state.json",
        "server_state.json",
        "state_backups/server_state_20240101_000000.000_000.json",
        "server_state_20240101_000000.000_000.json",
        "",
    ] {
        let (status, body) = post_json(
            &app,
            "/api/state/backups/restore",
            json!({"name": name}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "name {name:?}");
        assert_eq!(body["error"], "invalid_backup");
    }

    let (_, state) = get_json(&app, "/api/state").await;
    assert_eq!(state["data"], json!({"keep": true}));
    assert!(backup_names(&app, "primary").await.is_empty());
}

#[tokio::test]
async fn test_unknown_restore_source_is_rejected() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path())).await;
    let (status, body) = post_json(
        &app,
        "/api/state/backups/restore",
        json!({"name": "server_state_20240101_000000.000_000.json", "source": "tertiary"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_backup_source");
}

#[tokio::test]
async fn test_upload_adds_backup_without_touching_state() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path())).await;
    post_json(&app, "/api/state", json!({"data": {"live": 1}})).await;

    let (status, body) = post_json(
        &app,
        "/api/state/backups/upload",
        json!({"name": "laptop export", "backup": {"version": 1, "data": {"old": true}}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let uploaded = body["uploaded"].as_str().unwrap().to_string();
    assert!(uploaded.ends_with("_laptop_export.json"));
    assert_eq!(backup_names(&app, "secondary").await, vec![uploaded.clone()]);

    let (_, state) = get_json(&app, "/api/state").await;
    assert_eq!(state["data"], json!({"live": 1}));

    let (status, _) = post_json(
        &app,
        "/api/state/backups/restore",
        json!({"name": uploaded}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, state) = get_json(&app, "/api/state").await;
    assert_eq!(state["data"], json!({"old": true}));
}

#[tokio::test]
async fn test_upload_without_backup_object_is_rejected() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path())).await;

    for payload in [json!({"name": "x"}), json!({"backup": [1, 2]}), json!({"backup": "text"})] {
        let (status, body) = post_json(&app, "/api/state/backups/upload", payload).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_backup_payload");
    }
    assert!(backup_names(&app, "primary").await.is_empty());
}

#[tokio::test]
async fn test_upload_with_non_object_data_is_rejected() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path())).await;

    for backup in [json!({"data": 5}), json!({"data": [1, 2]}), json!({"version": 1, "data": null})] {
        let (status, body) = post_json(
            &app,
            "/api/state/backups/upload",
            json!({"name": "bad", "backup": backup}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_backup_payload");
    }
    assert!(backup_names(&app, "primary").await.is_empty());
    assert!(backup_names(&app, "secondary").await.is_empty());
}

#[tokio::test]
async fn test_malformed_state_posts_are_rejected() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path())).await;
    post_json(&app, "/api/state", json!({"data": {"keep": 1}})).await;

    let (status, _, body) = send(
        &app,
        Method::POST,
        "/api/state",
        Some("{not json".to_string()),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_payload");

    let (status, _, body) = send(&app, Method::POST, "/api/state", Some(String::new()), &[]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_payload");

    let (status, body) = post_json(&app, "/api/state", json!([1, 2, 3])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_state");

    let (_, state) = get_json(&app, "/api/state").await;
    assert_eq!(state["data"], json!({"keep": 1}));
}

#[tokio::test]
async fn test_legacy_bare_document_is_accepted() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path())).await;

    let (status, _) = post_json(&app, "/api/state", json!({"todoTasks": [], "ganttZoom": 2})).await;
    assert_eq!(status, StatusCode::OK);

    let (_, state) = get_json(&app, "/api/state").await;
    assert_eq!(state["data"], json!({"todoTasks": [], "ganttZoom": 2}));
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path()).max_body_bytes(256)).await;

    let payload = json!({"data": {"notes": "x".repeat(1024)}});
    let (status, body) = post_json(&app, "/api/state", payload).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"], "payload_too_large");

    let (_, state) = get_json(&app, "/api/state").await;
    assert_eq!(state["data"], json!({}));
}

#[tokio::test]
async fn test_bearer_token_guards_api_routes() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path()).bearer_token("s3cret")).await;

    let (status, body) = get_json(&app, "/api/state").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, _, _) = send(
        &app,
        Method::GET,
        "/api/state",
        None,
        &[("authorization", "Bearer wrong")],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, body) = send(
        &app,
        Method::GET,
        "/api/state",
        None,
        &[("authorization", "Bearer s3cret")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);

    let (status, _) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_cors_preflight_and_plain_options() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path()).bearer_token("s3cret")).await;

    let (status, headers, _) = send(
        &app,
        Method::OPTIONS,
        "/api/state",
        None,
        &[
            ("origin", "http://localhost:3000"),
            ("access-control-request-method", "POST"),
            ("access-control-request-headers", "content-type"),
        ],
    )
    .await;
    assert!(status.is_success());
    assert_eq!(headers["access-control-allow-origin"], "*");

    let (status, _, _) = send(&app, Method::OPTIONS, "/api/state/backups", None, &[]).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, headers, _) = send(
        &app,
        Method::GET,
        "/api/state",
        None,
        &[
            ("origin", "http://localhost:3000"),
            ("authorization", "Bearer s3cret"),
        ],
    )
    .await;
    assert_eq!(headers["access-control-allow-origin"], "*");
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path())).await;
    let (status, body) = get_json(&app, "/api/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_public_dir_is_served_as_fallback() {
    let temp = TempDir::new().unwrap();
    let public = temp.path().join("public");
    std::fs::create_dir_all(&public).unwrap();
    std::fs::write(public.join("version.json"), br#"{"app":"dashboard"}"#).unwrap();

    let app = app(ServerConfig::new(temp.path().join("data")).public_dir(&public)).await;
    let (status, body) = get_json(&app, "/version.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["app"], "dashboard");

    let (status, body) = get_json(&app, "/api/state").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!({}));
}

#[tokio::test]
async fn test_concurrent_posts_all_land() {
    let temp = TempDir::new().unwrap();
    let app = app(ServerConfig::new(temp.path())).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            let mut data = serde_json::Map::new();
            for k in 0..=i {
                data.insert(format!("k{k}"), json!(k));
            }
            post_json(&app, "/api/state", json!({ "data": data })).await.0
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), StatusCode::OK);
    }

    let (_, state) = get_json(&app, "/api/state").await;
    let final_keys = state["data"].as_object().unwrap().len();
    assert!((1..=8).contains(&final_keys));

    // every backup holds a complete document that was canonical at some point
    for name in backup_names(&app, "primary").await {
        let path = temp.path().join("state_backups").join(&name);
        let backup: Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        let keys = backup["data"].as_object().unwrap().len();
        assert!((1..=8).contains(&keys));
    }
}
