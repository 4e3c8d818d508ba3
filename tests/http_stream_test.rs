mod common;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::broadcast;

use flagsync_lib::{
    ConnectionState, FlagRecord, FlagStore, FlagSyncError, PatchDocument, SyncConfig,
};

use common::{configured, eventually, flag};

const SDK_KEY: &str = "sdk-test";
const API_TOKEN: &str = "api-test";

/// A flag service with a push stream, SDK reads and a patch endpoint.
struct FlagServer {
    flags: Mutex<HashMap<String, FlagRecord>>,
    events: broadcast::Sender<(String, String)>,
    shutdown: broadcast::Sender<()>,
    stream_connects: AtomicUsize,
}

impl FlagServer {
    fn publish(&self, event: &str, data: serde_json::Value) {
        let _ = self.events.send((event.to_string(), data.to_string()));
    }
}

fn authorized(headers: &HeaderMap, expected: &str) -> bool {
    headers.get("authorization").and_then(|v| v.to_str().ok()) == Some(expected)
}

async fn handle_stream(State(server): State<Arc<FlagServer>>, headers: HeaderMap) -> Response {
    if !authorized(&headers, SDK_KEY) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    server.stream_connects.fetch_add(1, Ordering::SeqCst);

    let snapshot = serde_json::to_string(&*server.flags.lock().unwrap()).unwrap();
    let mut rx = server.events.subscribe();
    let mut shutdown_rx = server.shutdown.subscribe();

    let stream = async_stream::stream! {
        yield Ok::<Event, Infallible>(Event::default().event("put").data(snapshot));
        loop {
            tokio::select! {
                result = rx.recv() => match result {
                    Ok((name, data)) => yield Ok(Event::default().event(name).data(data)),
                    Err(_) => break,
                },
                _ = shutdown_rx.recv() => break,
            }
        }
    };
    Sse::new(stream).into_response()
}

async fn handle_latest_all(State(server): State<Arc<FlagServer>>, headers: HeaderMap) -> Response {
    if !authorized(&headers, SDK_KEY) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(server.flags.lock().unwrap().clone()).into_response()
}

async fn handle_latest_one(
    State(server): State<Arc<FlagServer>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    if !authorized(&headers, SDK_KEY) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match server.flags.lock().unwrap().get(&key) {
        Some(flag) => Json(flag.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Semantic patches toggle `on` and bump the version. Project `locked` is read-only.
async fn handle_patch(
    State(server): State<Arc<FlagServer>>,
    headers: HeaderMap,
    Path((project, key)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if !authorized(&headers, API_TOKEN) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if project == "locked" {
        return StatusCode::FORBIDDEN.into_response();
    }
    let on = body["instructions"][0]["kind"] == "turnFlagOn";
    let mut flags = server.flags.lock().unwrap();
    match flags.get_mut(&key) {
        Some(flag) => {
            flag.on = on;
            flag.version += 1;
            Json(flag.clone()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn spawn_server(initial: Vec<FlagRecord>) -> (Arc<FlagServer>, String) {
    let server = Arc::new(FlagServer {
        flags: Mutex::new(initial.into_iter().map(|f| (f.key.clone(), f)).collect()),
        events: broadcast::channel(64).0,
        shutdown: broadcast::channel(1).0,
        stream_connects: AtomicUsize::new(0),
    });

    let app = Router::new()
        .route("/flags", get(handle_stream))
        .route("/sdk/latest-flags", get(handle_latest_all))
        .route("/sdk/latest-flags/{key}", get(handle_latest_one))
        .route(
            "/api/v2/flags/{project}/{key}",
            axum::routing::patch(handle_patch),
        )
        .with_state(Arc::clone(&server));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (server, format!("http://{}", addr))
}

fn config_for(url: &str) -> SyncConfig {
    SyncConfig {
        base_uri: url.to_string(),
        stream_uri: url.to_string(),
        ..configured()
    }
}

#[tokio::test]
async fn test_stream_end_to_end() {
    let (server, url) =
        spawn_server(vec![flag("checkout", 1, false), flag("banner", 1, true)]).await;
    let flags = FlagStore::new(config_for(&url));

    flags.start().await.unwrap();
    assert_eq!(flags.connection_state(), ConnectionState::Connected);
    assert_eq!(
        flags.list_flags().await,
        vec!["banner".to_string(), "checkout".to_string()]
    );

    server.publish(
        "patch",
        serde_json::json!({"path": "/checkout", "data": flag("checkout", 2, true)}),
    );
    eventually(|| flags.metrics().stream_events.with_label_values(&["patch"]).get() == 1).await;
    assert!(flags.get_flag("checkout").await.unwrap().on);

    server.publish("delete", serde_json::json!({"path": "/banner", "version": 2}));
    eventually(|| flags.metrics().stream_events.with_label_values(&["delete"]).get() == 1).await;
    assert!(flags.get_flag("banner").await.is_none());

    server
        .flags
        .lock()
        .unwrap()
        .insert("fresh".to_string(), flag("fresh", 1, true));
    server.publish("indirect/patch", serde_json::json!("/fresh"));
    for _ in 0..400 {
        if flags.get_flag("fresh").await.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(flags.get_flag("fresh").await.unwrap().version, 1);

    flags.stop();
    assert_eq!(flags.connection_state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_apply_patch_over_http_is_visible_immediately() {
    let (server, url) = spawn_server(vec![flag("checkout", 4, false)]).await;
    let flags = FlagStore::new(config_for(&url));
    flags.start().await.unwrap();

    let updated = flags
        .apply_patch("default", "checkout", &PatchDocument::toggle("test", true))
        .await
        .unwrap();
    assert_eq!(updated.version, 5);

    let local = flags.get_flag("checkout").await.unwrap();
    assert_eq!(local.version, 5);
    assert!(local.on);
    assert_eq!(flags.metrics().stream_events.with_label_values(&["patch"]).get(), 0);
    assert_eq!(server.stream_connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_patch_errors_keep_status_codes() {
    let (_server, url) = spawn_server(vec![flag("checkout", 1, false)]).await;
    let flags = FlagStore::new(config_for(&url));
    flags.start().await.unwrap();

    let err = flags
        .apply_patch("locked", "checkout", &PatchDocument::toggle("test", true))
        .await
        .unwrap_err();
    assert_eq!(err, FlagSyncError::Permission { status: 403 });

    let err = flags
        .apply_patch("default", "nope", &PatchDocument::toggle("test", true))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), Some(404));

    let mut config = config_for(&url);
    config.api_token = Some("wrong".into());
    flags.reload(config, &["api_token"]).await.unwrap();
    let err = flags
        .apply_patch("default", "checkout", &PatchDocument::toggle("test", true))
        .await
        .unwrap_err();
    assert_eq!(err, FlagSyncError::Auth { status: 401 });
    assert_eq!(flags.get_flag("checkout").await.unwrap().version, 1);
}

#[tokio::test]
async fn test_bad_sdk_key_is_not_retried() {
    let (server, url) = spawn_server(vec![flag("checkout", 1, false)]).await;
    let mut config = config_for(&url);
    config.sdk_key = Some("bad-key".into());
    let flags = FlagStore::new(config);

    assert_eq!(flags.start().await, Err(FlagSyncError::Auth { status: 401 }));
    assert!(!flags.is_initialized());
    eventually(|| flags.connection_state() == ConnectionState::Stopped).await;
    assert_eq!(server.stream_connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_reconnect_resyncs_from_new_snapshot() {
    let (server, url) = spawn_server(vec![flag("a", 1, true)]).await;
    let flags = FlagStore::new(config_for(&url));
    flags.start().await.unwrap();

    {
        let mut current = server.flags.lock().unwrap();
        current.clear();
        current.insert("b".to_string(), flag("b", 1, true));
    }
    server.shutdown.send(()).unwrap();

    eventually(|| server.stream_connects.load(Ordering::SeqCst) == 2).await;
    eventually(|| flags.metrics().stream_events.with_label_values(&["put"]).get() == 2).await;
    assert_eq!(flags.list_flags().await, vec!["b".to_string()]);
    assert!(flags.metrics().stream_reconnects.get() >= 1);
    assert_eq!(flags.connection_state(), ConnectionState::Connected);
}
