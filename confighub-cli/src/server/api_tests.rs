use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use confighub_lib::signature::{canonical_string, sign};
use confighub_lib::{AccessKey, Capability, Permissions};
use serde_json::{json, Value};
use tower::ServiceExt;

use super::build_router;
use super::config::{StorageBackend, WatchConfig};
use super::state::AppState;
use super::store::memory::MemoryStore;
use super::store::ConfigStore;

fn access_key(access_key: &str, project: &str, capabilities: &[Capability]) -> AccessKey {
    AccessKey {
        access_key: access_key.into(),
        secret: format!("{}-secret", access_key),
        name: access_key.into(),
        project: project.into(),
        permissions: Permissions::from_capabilities(capabilities),
        ip_whitelist: vec![],
        expires_at: None,
        active: true,
    }
}

async fn app(allow_unsigned: bool) -> Router {
    app_behind_proxies(allow_unsigned, &[]).await
}

async fn app_behind_proxies(allow_unsigned: bool, trusted_proxies: &[&str]) -> Router {
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
    let mut office = access_key("office", "shop", &[Capability::Read]);
    office.ip_whitelist = vec!["10.0.0.0/8".into()];
    let keys = [
        access_key("reader", "shop", &[Capability::Read]),
        access_key(
            "writer",
            "shop",
            &[
                Capability::Read,
                Capability::Write,
                Capability::Release,
                Capability::Delete,
            ],
        ),
        access_key("admin", "shop", &[Capability::Admin]),
        access_key("outsider", "billing", &[Capability::Read, Capability::Write]),
        office,
    ];
    for key in keys {
        store.put_access_key(key).await.unwrap();
    }
    let watch = WatchConfig {
        default_timeout_secs: 1,
        max_timeout_secs: 2,
        min_timeout_secs: 1,
    };
    build_router(AppState::new(
        store,
        StorageBackend::Memory,
        watch,
        allow_unsigned,
        trusted_proxies.iter().map(|p| p.to_string()).collect(),
    ))
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    respond(app, builder.body(body).unwrap()).await
}

/// Send a bodiless request as if it arrived over a socket from `peer`.
async fn send_from(
    app: &Router,
    peer: &str,
    uri: &str,
    headers: &[(&str, &str)],
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method("GET").uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let mut request = builder.body(Body::empty()).unwrap();
    let peer: SocketAddr = peer.parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    respond(app, request).await
}

async fn respond(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn as_key(
    app: &Router,
    key: &str,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    send(app, method, uri, &[("x-access-key", key)], body).await
}

/// Create `db` in shop/application/prod and return its id.
async fn create_db(app: &Router) -> u64 {
    let (status, body) = as_key(
        app,
        "writer",
        "POST",
        "/api/v1/config",
        Some(json!({
            "name": "db",
            "environment": "prod",
            "file_type": "json",
            "content": r#"{"host":"10.0.0.1","pool":5}"#,
            "message": "initial",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["config"]["version"], 1);
    body["config"]["id"].as_u64().unwrap()
}

#[tokio::test]
async fn read_only_key_cannot_write() {
    let app = app(true).await;
    create_db(&app).await;

    let update = json!({"name": "db", "env": "prod", "content": r#"{"pool":10}"#});
    let (status, body) = as_key(&app, "reader", "PUT", "/api/v1/config", Some(update.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");

    let (status, body) = as_key(&app, "reader", "GET", "/api/v1/config?name=db&env=prod", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);
    assert_eq!(body["namespace"], "application");
    assert_eq!(body["commit_hash"].as_str().unwrap().len(), 16);

    let (status, body) = as_key(&app, "writer", "PUT", "/api/v1/config", Some(update)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 2);
}

#[tokio::test]
async fn missing_or_unknown_keys_are_unauthorized() {
    let app = app(true).await;
    let (status, body) = send(&app, "GET", "/api/v1/config?name=db", &[], None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _) = as_key(&app, "nobody", "GET", "/api/v1/config?name=db", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, "GET", "/health", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app, "GET", "/readyz", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["storage"], "memory");
}

#[tokio::test]
async fn signed_requests_are_verified() {
    let app = app(false).await;
    let uri = "/api/v1/config?name=db&env=prod";

    let (status, _) = as_key(&app, "reader", "GET", uri, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let timestamp = Utc::now().timestamp().to_string();
    let query = vec![
        ("name".to_string(), "db".to_string()),
        ("env".to_string(), "prod".to_string()),
    ];
    let canonical = canonical_string("GET", "/api/v1/config", &query, "reader", &timestamp, "n-1");
    let signature = sign("reader-secret", &canonical).unwrap();
    let headers = [
        ("x-access-key", "reader"),
        ("x-timestamp", timestamp.as_str()),
        ("x-nonce", "n-1"),
        ("x-signature", signature.as_str()),
    ];

    // Authenticated but the document does not exist yet.
    let (status, body) = send(&app, "GET", uri, &headers, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    // Same nonce again is a replay.
    let (status, _) = send(&app, "GET", uri, &headers, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let wrong = [
        ("x-access-key", "reader"),
        ("x-timestamp", timestamp.as_str()),
        ("x-nonce", "n-2"),
        ("x-signature", signature.as_str()),
    ];
    let (status, _) = send(&app, "GET", uri, &wrong, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_rejects_bad_content_and_duplicates() {
    let app = app(true).await;
    create_db(&app).await;

    let duplicate = json!({"name": "db", "environment": "prod", "content": "{}"});
    let (status, body) = as_key(&app, "writer", "POST", "/api/v1/config", Some(duplicate)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    let broken = json!({"name": "cache", "content": "{oops"});
    let (status, body) = as_key(&app, "writer", "POST", "/api/v1/config", Some(broken)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn other_projects_cannot_see_documents() {
    let app = app(true).await;
    let id = create_db(&app).await;

    let (status, _) = as_key(&app, "outsider", "GET", &format!("/api/v1/configs/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = as_key(&app, "outsider", "GET", "/api/v1/config?name=db&env=prod", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = as_key(&app, "reader", "GET", &format!("/api/v1/configs/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["project"], "shop");
}

#[tokio::test]
async fn history_diff_and_rollback() {
    let app = app(true).await;
    let id = create_db(&app).await;
    as_key(
        &app,
        "writer",
        "PUT",
        "/api/v1/config",
        Some(json!({"name": "db", "env": "prod", "content": r#"{"host":"10.0.0.2","pool":5}"#})),
    )
    .await;

    let (status, versions) =
        as_key(&app, "reader", "GET", &format!("/api/v1/configs/{}/versions", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(versions.as_array().unwrap().len(), 2);

    let (status, diff) = as_key(
        &app,
        "reader",
        "GET",
        &format!("/api/v1/configs/{}/diff?from=1&to=2", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(diff["changes"][0]["path"], "host");
    assert_eq!(diff["changes"][0]["type"], "modify");
    assert_eq!(diff["changes"][0]["new_value"], "10.0.0.2");

    let (status, _) = as_key(
        &app,
        "reader",
        "POST",
        &format!("/api/v1/configs/{}/rollback/1", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = as_key(
        &app,
        "writer",
        "POST",
        &format!("/api/v1/configs/{}/rollback/1", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 3);

    let (_, v1) = as_key(&app, "reader", "GET", &format!("/api/v1/configs/{}/versions/1", id), None).await;
    let (_, v3) = as_key(&app, "reader", "GET", &format!("/api/v1/configs/{}/versions/3", id), None).await;
    assert_eq!(v1["content_hash"], v3["content_hash"]);
    assert_eq!(v3["message"], "rollback to version 1");
}

#[tokio::test]
async fn gray_release_lifecycle() {
    let app = app(true).await;
    let id = create_db(&app).await;
    as_key(
        &app,
        "writer",
        "PUT",
        "/api/v1/config",
        Some(json!({"name": "db", "env": "prod", "content": r#"{"pool":50}"#})),
    )
    .await;

    let (status, full) = as_key(
        &app,
        "writer",
        "POST",
        &format!("/api/v1/configs/{}/release", id),
        Some(json!({"version": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(full["status"], "released");

    let gray_body = json!({"version": 2, "rule": {"type": "client_id", "client_ids": ["canary"]}});
    let (status, gray) = as_key(
        &app,
        "writer",
        "POST",
        &format!("/api/v1/configs/{}/gray-release", id),
        Some(gray_body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", gray);
    assert_eq!(gray["status"], "gray");
    let gray_id = gray["id"].as_u64().unwrap();

    let (status, body) = as_key(
        &app,
        "writer",
        "POST",
        &format!("/api/v1/configs/{}/gray-release", id),
        Some(gray_body),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    let canary = [("x-access-key", "reader"), ("x-client-id", "canary")];
    let (_, body) = send(&app, "GET", "/api/v1/config?name=db&env=prod", &canary, None).await;
    assert_eq!(body["version"], 2);
    let (_, body) = as_key(&app, "reader", "GET", "/api/v1/config?name=db&env=prod", None).await;
    assert_eq!(body["version"], 1);

    let (status, _) = as_key(
        &app,
        "reader",
        "POST",
        &format!("/api/v1/releases/{}/promote", gray_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, promoted) = as_key(
        &app,
        "writer",
        "POST",
        &format!("/api/v1/releases/{}/promote", gray_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(promoted["version"], 2);

    let (_, body) = as_key(&app, "reader", "GET", "/api/v1/config?name=db&env=prod", None).await;
    assert_eq!(body["version"], 2);

    let (status, body) = as_key(
        &app,
        "writer",
        "POST",
        &format!("/api/v1/releases/{}/cancel", gray_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_STATE");

    let (_, releases) =
        as_key(&app, "reader", "GET", &format!("/api/v1/configs/{}/releases", id), None).await;
    assert_eq!(releases.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn percentage_ramp_through_api() {
    let app = app(true).await;
    let id = create_db(&app).await;
    let (_, gray) = as_key(
        &app,
        "writer",
        "POST",
        &format!("/api/v1/configs/{}/gray-release", id),
        Some(json!({"rule": {"type": "percentage", "percentage": 10}})),
    )
    .await;
    let gray_id = gray["id"].as_u64().unwrap();

    let (status, body) = as_key(
        &app,
        "writer",
        "PUT",
        &format!("/api/v1/releases/{}/percentage", gray_id),
        Some(json!({"percentage": 40})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["gray_rule"]["percentage"], 40);

    let (status, body) = as_key(
        &app,
        "writer",
        "PUT",
        &format!("/api/v1/releases/{}/percentage", gray_id),
        Some(json!({"percentage": 140})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test(start_paused = true)]
async fn watch_returns_at_once_or_times_out() {
    let app = app(true).await;
    create_db(&app).await;

    let (status, body) = as_key(
        &app,
        "reader",
        "GET",
        "/api/v1/config/watch?name=db&env=prod&version=0",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], true);
    assert_eq!(body["version"], 1);

    let started = tokio::time::Instant::now();
    let (status, _) = as_key(
        &app,
        "reader",
        "GET",
        "/api/v1/config/watch?name=db&env=prod&version=1&timeout=1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
    assert!(started.elapsed() >= std::time::Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn watch_wakes_on_update() {
    let app = app(true).await;
    create_db(&app).await;

    let writer = app.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        as_key(
            &writer,
            "writer",
            "PUT",
            "/api/v1/config",
            Some(json!({"name": "db", "env": "prod", "content": "[]"})),
        )
        .await;
    });

    let (status, body) = as_key(
        &app,
        "reader",
        "GET",
        "/api/v1/config/watch?name=db&env=prod&version=1&timeout=2",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 2);
    assert_eq!(body["content"], "[]");
}

#[tokio::test]
async fn delete_needs_capability() {
    let app = app(true).await;
    let id = create_db(&app).await;
    let uri = format!("/api/v1/configs/{}", id);

    let (status, _) = as_key(&app, "reader", "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = as_key(&app, "writer", "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = as_key(&app, "reader", "GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_registers_keys() {
    let app = app(true).await;
    let new_key = json!({
        "access_key": "deployer",
        "secret": "d-secret",
        "project": "shop",
        "permissions": {"read": true, "release": true},
    });

    let (status, _) = as_key(&app, "writer", "POST", "/api/v1/keys", Some(new_key.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = as_key(&app, "admin", "POST", "/api/v1/keys", Some(new_key)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["access_key"], "deployer");

    let (status, _) = as_key(&app, "deployer", "GET", "/api/v1/config?name=db", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_keys_stay_inside_their_project() {
    let app = app(true).await;
    create_db(&app).await;
    let everything = json!({
        "read": true, "write": true, "delete": true,
        "release": true, "admin": true, "decrypt": true,
    });

    let foreign = json!({
        "access_key": "evil",
        "secret": "x",
        "project": "billing",
        "permissions": everything,
    });
    let (status, body) = as_key(&app, "admin", "POST", "/api/v1/keys", Some(foreign)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");
    let (status, _) = as_key(&app, "evil", "GET", "/api/v1/config?name=db", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Re-registering billing's key under shop would hijack it.
    let takeover = json!({
        "access_key": "outsider",
        "secret": "mine-now",
        "project": "shop",
        "permissions": everything,
    });
    let (status, body) = as_key(&app, "admin", "POST", "/api/v1/keys", Some(takeover)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    let (status, _) = send(
        &app,
        "GET",
        "/api/v1/config?name=db&env=prod",
        &[("x-access-key", "outsider")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn forwarded_for_only_counts_behind_trusted_proxy() {
    let app = app_behind_proxies(true, &["127.0.0.1"]).await;
    let uri = "/api/v1/config?name=db";
    let office = ("x-access-key", "office");
    let spoofed = ("x-forwarded-for", "10.1.1.1");

    let (status, _) = send_from(&app, "203.0.113.9:4000", uri, &[office]).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send_from(&app, "203.0.113.9:4000", uri, &[office, spoofed]).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Allowed through: the document simply does not exist.
    let (status, _) = send_from(&app, "127.0.0.1:4000", uri, &[office, spoofed]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send_from(&app, "10.2.2.2:4000", uri, &[office]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
