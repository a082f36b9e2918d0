use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use dapp_provider_bridge::{
    engine::DispatchFactory,
    logging,
    port::{FrameKind, WebSurface},
    services::{KeyringFlag, MemoryDappStore, ReadOnlyProvider, StaticChains},
    site::SiteRefs,
    BridgeConfig, BridgeContext, BridgeError, NavigationEvent, SessionService, SurfaceMessage,
    WebviewLifecycle,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
struct AppState {
    config: Arc<BridgeConfig>,
    started_at: Instant,
    context: BridgeContext,
    next_surface_id: Arc<AtomicU64>,
}

/// One websocket client standing in for an embedded browser surface.
struct WsSurface {
    tx: mpsc::UnboundedSender<Message>,
}

impl WebSurface for WsSurface {
    fn inject_javascript(&self, script: String) -> Result<(), BridgeError> {
        let frame = json!({ "type": "inject", "script": script }).to_string();
        self.tx
            .send(Message::Text(frame.into()))
            .map_err(|_| BridgeError::SurfaceGone)
    }
}

/// What the host app reports about its surface.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum HostFrame {
    LoadStart(NavigationEvent),
    Message(SurfaceMessage),
    Unmount,
}

#[derive(Debug, Deserialize)]
struct SurfaceQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() {
    logging::init_logging();

    let config = match BridgeConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(error) => {
            error!("{error}");
            std::process::exit(1);
        }
    };

    if !config.auth_enabled && config.allow_insecure_no_auth {
        warn!("bridge auth is disabled by BRIDGE_ALLOW_INSECURE_NO_AUTH=true (local development only)");
    }
    if config.allow_query_token_auth {
        warn!("query-token auth is enabled (BRIDGE_ALLOW_QUERY_TOKEN_AUTH=true); prefer Authorization headers instead");
    }

    let state = build_state(config.clone());
    spawn_event_log(state.context.sessions.subscribe());
    let app = router(state);

    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!("failed to bind {bind_addr}: {error}");
            std::process::exit(1);
        }
    };

    info!("dapp-provider-bridge listening on {bind_addr}");

    if let Err(error) = axum::serve(listener, app).await {
        error!("server error: {error}");
        std::process::exit(1);
    }
}

fn build_state(config: Arc<BridgeConfig>) -> AppState {
    let dapps = Arc::new(MemoryDappStore::new());
    let keyring = Arc::new(KeyringFlag::new(true));
    let chains = Arc::new(StaticChains::builtin());
    let sessions = Arc::new(SessionService::new(dapps.clone()));
    let provider = ReadOnlyProvider::new(
        config.accounts.clone(),
        config.settings.default_chain.clone(),
        config.auto_connect,
        dapps.clone(),
        chains.clone(),
        sessions.clone(),
    );
    let method_handler = Arc::new(DispatchFactory::new(
        Arc::new(provider),
        dapps.clone(),
        keyring.clone(),
    ));
    sessions.spawn_keyring_forwarder(keyring.as_ref());

    AppState {
        started_at: Instant::now(),
        context: BridgeContext {
            sessions,
            dapps,
            keyring,
            chains,
            method_handler,
            settings: config.settings.clone(),
        },
        next_surface_id: Arc::new(AtomicU64::new(1)),
        config,
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/surface", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

fn spawn_event_log(mut events: broadcast::Receiver<dapp_provider_bridge::SessionEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(
                    target: "bridge::session",
                    event = event.event.as_str(),
                    origin = ?event.origin,
                    delivered = event.delivered,
                    "broadcast"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(target: "bridge::session", skipped, "event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let sessions = &state.context.sessions;
    Json(json!({
        "status": "ok",
        "at": Utc::now().to_rfc3339(),
        "uptimeSec": state.started_at.elapsed().as_secs(),
        "sessions": sessions.session_count(),
        "origins": sessions.origins(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SurfaceQuery>,
) -> Response {
    if !state.config.is_authorized(&headers, query.token.as_deref()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "unauthorized",
                "message": "Missing or invalid bridge token"
            })),
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut socket_tx, mut socket_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let surface_id = state.next_surface_id.fetch_add(1, Ordering::Relaxed);

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if socket_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let surface: Arc<dyn WebSurface> = Arc::new(WsSurface { tx });
    let lifecycle = WebviewLifecycle::new(
        Arc::downgrade(&surface),
        SiteRefs::new(format!("surface-{surface_id}")),
        FrameKind::Top,
        state.context.clone(),
    );
    info!(surface_id, "surface attached");

    while let Some(message) = socket_rx.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<HostFrame>(&text) {
                Ok(HostFrame::LoadStart(navigation)) => {
                    let outcome = lifecycle.on_load_start(navigation);
                    debug!(surface_id, ?outcome, "load start");
                }
                Ok(HostFrame::Message(message)) => {
                    let outcome = lifecycle.on_message(message);
                    debug!(surface_id, ?outcome, "page message");
                }
                Ok(HostFrame::Unmount) => lifecycle.unmount(),
                Err(error) => debug!(surface_id, %error, "ignoring host frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => debug!(surface_id, "binary frames are not supported"),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(error) => {
                warn!(surface_id, %error, "websocket error");
                break;
            }
        }
    }

    lifecycle.unmount();
    drop(surface);
    writer_task.abort();
    info!(surface_id, "surface detached");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dapp_provider_bridge::BridgeSettings;
    use tokio::time::timeout;
    use tokio_tungstenite::{
        connect_async,
        tungstenite::{client::IntoClientRequest, Message as ClientMessage},
    };

    use super::*;

    const ACCOUNT: &str = "0x5853ed4f26a3fcea565b3fbc698bb19cdf6deb85";

    fn test_config() -> Arc<BridgeConfig> {
        Arc::new(BridgeConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            auth_token: Some("secret".to_string()),
            auth_enabled: true,
            allow_insecure_no_auth: false,
            allow_query_token_auth: false,
            auto_connect: true,
            accounts: vec![ACCOUNT.to_string()],
            settings: BridgeSettings {
                initial_chain_delay: Duration::from_secs(3600),
                ..BridgeSettings::default()
            },
        })
    }

    async fn serve(state: AppState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(state)).await;
        });
        format!("ws://{addr}/surface")
    }

    fn injected_payload(frame: &str) -> Option<Value> {
        let frame: Value = serde_json::from_str(frame).ok()?;
        let script = frame["script"].as_str()?;
        let start = script.find("postMessage(")? + "postMessage(".len();
        serde_json::Deserializer::from_str(&script[start..])
            .into_iter::<Value>()
            .next()?
            .ok()
    }

    #[tokio::test]
    async fn rejects_surfaces_without_a_token() {
        let url = serve(build_state(test_config())).await;
        assert!(connect_async(url).await.is_err());
    }

    #[tokio::test]
    async fn websocket_surface_round_trips_a_provider_request() {
        let state = build_state(test_config());
        let url = serve(state.clone()).await;

        let mut request = url.into_client_request().expect("client request");
        request.headers_mut().insert(
            "authorization",
            "Bearer secret".parse().expect("header value"),
        );
        let (mut socket, _) = connect_async(request).await.expect("connect");

        let load = json!({ "type": "loadStart", "url": "https://dapp.example/", "title": "Dapp" });
        socket
            .send(ClientMessage::text(load.to_string()))
            .await
            .expect("send loadStart");

        let page = json!({
            "name": "rabby-provider",
            "data": { "id": 1, "jsonrpc": "2.0", "method": "eth_requestAccounts" },
        });
        let message = json!({ "type": "message", "url": "https://dapp.example/", "data": page.to_string() });
        socket
            .send(ClientMessage::text(message.to_string()))
            .await
            .expect("send message");

        let response = timeout(Duration::from_secs(2), async {
            while let Some(frame) = socket.next().await {
                let frame = frame.expect("websocket frame");
                let Ok(text) = frame.to_text() else {
                    continue;
                };
                if let Some(payload) = injected_payload(text) {
                    if payload["data"]["id"] == 1 {
                        return payload;
                    }
                }
            }
            panic!("socket closed before the response");
        })
        .await
        .expect("response injected");

        assert_eq!(response["name"], "rabby-provider");
        assert_eq!(response["data"]["result"], json!([ACCOUNT]));

        let Json(health) = health_handler(State(state)).await;
        assert_eq!(health["sessions"], 1);
        assert_eq!(health["origins"], json!(["https://dapp.example"]));
    }
}
