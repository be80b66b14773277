use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use beacon_core::ids::{TaskId, UserId};
use beacon_relay::broadcaster::Broadcaster;
use beacon_relay::cache::{self, LatestStateCache};
use beacon_relay::channel::StatusChannel;
use beacon_relay::snapshot::SnapshotBuilder;
use beacon_store::sequences::SequenceRepo;
use beacon_store::tasks::TaskRepo;
use beacon_store::Database;

use crate::ingress;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::Session;

/// Header carrying the caller identity during the connection handshake.
const IDENTITY_HEADER: &str = "x-user-id";

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub cache_ttl: Duration,
    pub cache_purge_interval: Duration,
    pub topic_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9070,
            heartbeat_interval: Duration::from_secs(15),
            cache_ttl: Duration::from_secs(1800),
            cache_purge_interval: Duration::from_secs(60),
            topic_capacity: 64,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub tasks: TaskRepo,
    pub broadcaster: Arc<Broadcaster>,
    pub snapshots: Arc<SnapshotBuilder>,
    pub channel: Arc<StatusChannel>,
    pub cache: Arc<LatestStateCache>,
    pub registry: Arc<SessionRegistry>,
    pub heartbeat_interval: Duration,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/tasks/{task_id}", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/internal/tasks", post(ingress::create_task))
        .route("/internal/tasks/{task_id}/status", post(ingress::update_status))
        .route("/internal/tasks/{task_id}", delete(ingress::delete_task))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, db: Database) -> Result<ServerHandle, std::io::Error> {
    let tasks = TaskRepo::new(db.clone());
    let cache = Arc::new(LatestStateCache::new());
    let channel = Arc::new(StatusChannel::new(config.topic_capacity));
    let broadcaster = Arc::new(Broadcaster::new(
        SequenceRepo::new(db),
        Arc::clone(&cache),
        Arc::clone(&channel),
        config.cache_ttl,
    ));
    let snapshots = Arc::new(SnapshotBuilder::new(Arc::clone(&cache), tasks.clone()));
    let registry = Arc::new(SessionRegistry::new());

    let purge_handle = cache::start_purge_task(Arc::clone(&cache), config.cache_purge_interval);

    let state = AppState {
        tasks,
        broadcaster,
        snapshots,
        channel,
        cache,
        registry: Arc::clone(&registry),
        heartbeat_interval: config.heartbeat_interval,
    };

    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "beacon server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        _server: server_handle,
        _purge: purge_handle,
    })
}

/// Handle returned by `start()` — keeps background tasks alive and exposes
/// the registry for coordinated shutdown.
pub struct ServerHandle {
    pub port: u16,
    pub registry: Arc<SessionRegistry>,
    _server: tokio::task::JoinHandle<()>,
    _purge: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler. A request without the identity header is
/// refused before the upgrade; ownership is checked by the session after.
async fn ws_handler(
    Path(task_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let task_id = TaskId::from_raw(task_id);
    let user_id = headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(UserId::from_raw);

    let Some(user_id) = user_id else {
        tracing::info!(task_id = %task_id, "connection without identity header");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, task_id, user_id))
        .into_response()
}

/// Handle a new WebSocket connection: register a session and run it.
async fn handle_socket(socket: WebSocket, state: AppState, task_id: TaskId, user_id: UserId) {
    let cancel = CancellationToken::new();
    let session = Session::new(task_id.clone(), user_id.clone(), cancel.clone());
    state.registry.register(SessionHandle::new(
        session.id().clone(),
        task_id.clone(),
        user_id,
        cancel,
    ));
    tracing::info!(subscriber_id = %session.id(), task_id = %task_id, "subscriber connected");

    session
        .run(
            socket,
            state.tasks.clone(),
            Arc::clone(&state.snapshots),
            Arc::clone(&state.channel),
            Arc::clone(&state.registry),
            state.heartbeat_interval,
        )
        .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "sessions": state.registry.count(),
        "topics": state.channel.topic_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn start_test_server(config: ServerConfig) -> ServerHandle {
        let db = Database::in_memory().unwrap();
        start(ServerConfig { port: 0, ..config }, db).await.unwrap()
    }

    async fn create_task(port: u16, owner: &str) -> String {
        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/internal/tasks"))
            .json(&json!({"owner_id": owner, "request": {"prompt": "a red fox"}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        body["id"].as_str().unwrap().to_string()
    }

    async fn set_status(port: u16, task_id: &str, status: &str) -> Value {
        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/internal/tasks/{task_id}/status"))
            .json(&json!({"status": status}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }

    async fn connect(port: u16, task_id: &str, user: &str) -> WsClient {
        let mut request = format!("ws://127.0.0.1:{port}/ws/tasks/{task_id}")
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("x-user-id", user.parse().unwrap());
        let (ws, _) = connect_async(request).await.unwrap();
        ws
    }

    async fn next_frame(ws: &mut WsClient) -> Value {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn expect_close(ws: &mut WsClient, code: u16) {
        match ws.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), code),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = start_test_server(ServerConfig::default()).await;
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn ingress_assigns_increasing_sequences() {
        let handle = start_test_server(ServerConfig::default()).await;
        let task_id = create_task(handle.port, "user_w1").await;

        let first = set_status(handle.port, &task_id, "processing").await;
        assert_eq!(first["sequence"], 1);
        assert_eq!(first["terminal"], false);

        let second = set_status(handle.port, &task_id, "completed").await;
        assert_eq!(second["sequence"], 2);
        assert_eq!(second["terminal"], true);
    }

    #[tokio::test]
    async fn status_update_for_unknown_task_is_404() {
        let handle = start_test_server(ServerConfig::default()).await;
        let resp = reqwest::Client::new()
            .post(format!(
                "http://127.0.0.1:{}/internal/tasks/task_missing/status",
                handle.port
            ))
            .json(&json!({"status": "processing"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn subscriber_sees_snapshot_then_updates_then_normal_close() {
        let handle = start_test_server(ServerConfig::default()).await;
        let owner = "user_u1";
        let task_id = create_task(handle.port, owner).await;

        set_status(handle.port, &task_id, "processing").await;

        let mut ws = connect(handle.port, &task_id, owner).await;
        let snapshot = next_frame(&mut ws).await;
        assert_eq!(snapshot["type"], "snapshot");
        assert_eq!(snapshot["sequence"], 1);
        assert_eq!(snapshot["status"], "processing");
        assert_eq!(snapshot["terminal"], false);
        assert_eq!(snapshot["prompt"], "a red fox");

        set_status(handle.port, &task_id, "completed").await;

        let update = next_frame(&mut ws).await;
        assert_eq!(update["type"], "update");
        assert_eq!(update["sequence"], 2);
        assert_eq!(update["status"], "completed");
        assert_eq!(update["terminal"], true);

        expect_close(&mut ws, 1000).await;
    }

    #[tokio::test]
    async fn attach_after_terminal_gets_terminal_snapshot_and_closes() {
        let handle = start_test_server(ServerConfig::default()).await;
        let owner = "user_u1";
        let task_id = create_task(handle.port, owner).await;

        set_status(handle.port, &task_id, "processing").await;
        set_status(handle.port, &task_id, "completed").await;

        let mut ws = connect(handle.port, &task_id, owner).await;
        let snapshot = next_frame(&mut ws).await;
        assert_eq!(snapshot["type"], "snapshot");
        assert_eq!(snapshot["sequence"], 2);
        assert_eq!(snapshot["terminal"], true);

        expect_close(&mut ws, 1000).await;
    }

    #[tokio::test]
    async fn non_owner_is_rejected_before_snapshot() {
        let handle = start_test_server(ServerConfig::default()).await;
        let task_id = create_task(handle.port, "user_u1").await;

        let mut ws = connect(handle.port, &task_id, "user_u2").await;
        expect_close(&mut ws, 4403).await;
    }

    #[tokio::test]
    async fn unknown_task_closes_not_found() {
        let handle = start_test_server(ServerConfig::default()).await;

        let mut ws = connect(handle.port, "task_missing", "user_u1").await;
        expect_close(&mut ws, 4404).await;
    }

    #[tokio::test]
    async fn missing_identity_header_is_refused_before_upgrade() {
        let handle = start_test_server(ServerConfig::default()).await;
        let task_id = create_task(handle.port, "user_u1").await;

        let request = format!("ws://127.0.0.1:{}/ws/tasks/{task_id}", handle.port)
            .into_client_request()
            .unwrap();
        let err = connect_async(request).await.unwrap_err();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(resp) => {
                assert_eq!(resp.status(), 401);
            }
            other => panic!("expected HTTP 401, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn quiet_connection_receives_heartbeats() {
        let config = ServerConfig {
            heartbeat_interval: Duration::from_millis(150),
            ..Default::default()
        };
        let handle = start_test_server(config).await;
        let owner = "user_u1";
        let task_id = create_task(handle.port, owner).await;
        set_status(handle.port, &task_id, "processing").await;

        let mut ws = connect(handle.port, &task_id, owner).await;
        let snapshot = next_frame(&mut ws).await;
        assert_eq!(snapshot["type"], "snapshot");

        let heartbeat = next_frame(&mut ws).await;
        assert_eq!(heartbeat["type"], "heartbeat");
        assert_eq!(heartbeat["task_id"], task_id.as_str());
        assert!(heartbeat.get("sequence").is_none());
        assert!(heartbeat.get("terminal").is_none());
    }

    #[tokio::test]
    async fn deleting_task_closes_its_sessions() {
        let handle = start_test_server(ServerConfig::default()).await;
        let owner = "user_u1";
        let task_id = create_task(handle.port, owner).await;
        set_status(handle.port, &task_id, "processing").await;

        let mut ws = connect(handle.port, &task_id, owner).await;
        let snapshot = next_frame(&mut ws).await;
        assert_eq!(snapshot["type"], "snapshot");

        let resp = reqwest::Client::new()
            .delete(format!(
                "http://127.0.0.1:{}/internal/tasks/{task_id}",
                handle.port
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["closed_sessions"], 1);

        expect_close(&mut ws, 1001).await;
    }

    #[tokio::test]
    async fn two_subscribers_for_one_task_both_receive() {
        let handle = start_test_server(ServerConfig::default()).await;
        let owner = "user_u1";
        let task_id = create_task(handle.port, owner).await;
        set_status(handle.port, &task_id, "processing").await;

        let mut a = connect(handle.port, &task_id, owner).await;
        let mut b = connect(handle.port, &task_id, owner).await;
        assert_eq!(next_frame(&mut a).await["type"], "snapshot");
        assert_eq!(next_frame(&mut b).await["type"], "snapshot");

        set_status(handle.port, &task_id, "completed").await;

        for ws in [&mut a, &mut b] {
            let update = next_frame(ws).await;
            assert_eq!(update["type"], "update");
            assert_eq!(update["sequence"], 2);
            expect_close(ws, 1000).await;
        }
    }

    #[tokio::test]
    async fn client_close_unregisters_session() {
        let handle = start_test_server(ServerConfig::default()).await;
        let owner = "user_u1";
        let task_id = create_task(handle.port, owner).await;
        set_status(handle.port, &task_id, "processing").await;

        let mut ws = connect(handle.port, &task_id, owner).await;
        next_frame(&mut ws).await;

        // Session registered while streaming
        let connected = handle
            .registry
            .list_by_task(&TaskId::from_raw(task_id.clone()));
        assert_eq!(connected.len(), 1);

        ws.close(None).await.unwrap();

        // Registry entry removed once the session unwinds
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if handle.registry.count() == 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "session never unregistered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn build_router_creates_routes() {
        let db = Database::in_memory().unwrap();
        let tasks = TaskRepo::new(db.clone());
        let cache = Arc::new(LatestStateCache::new());
        let channel = Arc::new(StatusChannel::default());
        let state = AppState {
            tasks: tasks.clone(),
            broadcaster: Arc::new(Broadcaster::new(
                SequenceRepo::new(db),
                Arc::clone(&cache),
                Arc::clone(&channel),
                Duration::from_secs(60),
            )),
            snapshots: Arc::new(SnapshotBuilder::new(Arc::clone(&cache), tasks)),
            channel,
            cache,
            registry: Arc::new(SessionRegistry::new()),
            heartbeat_interval: Duration::from_secs(15),
        };

        let _router = build_router(state);
    }
}
