//! Mock audio node for integration tests
//!
//! Serves the node WebSocket endpoint and REST API on an ephemeral local
//! port. Tests can inspect every captured REST request, push arbitrary
//! frames down any accepted WebSocket session, and close sessions with a
//! chosen close code.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use tidelink::NodeConfig;

pub const PASSWORD: &str = "youshallnotpass";

/// One request captured by the mock REST API
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub body: Value,
}

enum WsCommand {
    Frame(String),
    Close(u16),
}

/// One WebSocket session accepted by the mock node
pub struct WsSession {
    /// Request headers sent by the client during the upgrade
    pub headers: HashMap<String, String>,
    pub session_id: String,
    command_tx: mpsc::UnboundedSender<WsCommand>,
}

impl WsSession {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Push a raw frame to the client
    pub fn push_frame(&self, frame: Value) {
        let _ = self.command_tx.send(WsCommand::Frame(frame.to_string()));
    }

    /// Push a stats frame with the given player count and system load
    pub fn push_stats(&self, players: u32, system_load: f64) {
        self.push_frame(stats_frame(players, system_load));
    }

    /// Close the session with the given close code
    pub fn close(&self, code: u16) {
        let _ = self.command_tx.send(WsCommand::Close(code));
    }
}

struct MockState {
    session_counter: AtomicU32,
    sessions: Mutex<Vec<Arc<WsSession>>>,
    requests: Mutex<Vec<CapturedRequest>>,
    load_response: Mutex<Value>,
}

/// Mock node instance bound to an ephemeral local port
pub struct MockNode {
    pub addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockNode {
    pub async fn start() -> Self {
        let state = Arc::new(MockState {
            session_counter: AtomicU32::new(0),
            sessions: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            load_response: Mutex::new(json!({ "loadType": "empty", "data": {} })),
        });

        let router = Router::new()
            .route("/v4/websocket", get(ws_handler))
            .fallback(rest_handler)
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock node");
        let addr = listener.local_addr().expect("mock node addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("mock node serve");
        });

        Self { addr, state }
    }

    /// Node configuration pointing at this mock instance
    pub fn config(&self, name: &str) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            secure: false,
            password: PASSWORD.to_string(),
            regions: vec![],
        }
    }

    pub async fn session_count(&self) -> usize {
        self.state.sessions.lock().await.len()
    }

    /// Wait until the client has opened its `n`th session (1-based)
    pub async fn wait_for_session(&self, n: usize, timeout: Duration) -> Arc<WsSession> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let sessions = self.state.sessions.lock().await;
                if sessions.len() >= n {
                    return Arc::clone(&sessions[n - 1]);
                }
            }
            if Instant::now() >= deadline {
                panic!("session {n} was not opened within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn requests(&self) -> Vec<CapturedRequest> {
        self.state.requests.lock().await.clone()
    }

    /// Wait until `count` captured requests match the predicate, returning
    /// the last match
    pub async fn wait_for_requests(
        &self,
        count: usize,
        timeout: Duration,
        predicate: impl Fn(&CapturedRequest) -> bool,
    ) -> CapturedRequest {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let requests = self.state.requests.lock().await;
                let matches: Vec<&CapturedRequest> =
                    requests.iter().filter(|r| predicate(r)).collect();
                if matches.len() >= count {
                    return matches[count - 1].clone();
                }
            }
            if Instant::now() >= deadline {
                panic!(
                    "expected {count} matching requests within {timeout:?}; captured: {:#?}",
                    self.state.requests.lock().await
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait for the first captured request matching the predicate
    pub async fn wait_for_request(
        &self,
        timeout: Duration,
        predicate: impl Fn(&CapturedRequest) -> bool,
    ) -> CapturedRequest {
        self.wait_for_requests(1, timeout, predicate).await
    }

    /// Set the response returned for `/v4/loadtracks` requests
    pub async fn set_load_response(&self, response: Value) {
        *self.state.load_response.lock().await = response;
    }
}

/// Build a stats frame as pushed periodically by real nodes
pub fn stats_frame(players: u32, system_load: f64) -> Value {
    json!({
        "op": "stats",
        "players": players,
        "playingPlayers": players,
        "uptime": 12345,
        "memory": { "free": 1024, "used": 512, "allocated": 2048, "reservable": 4096 },
        "cpu": { "cores": 4, "systemLoad": system_load, "lavalinkLoad": 0.0 },
        "frameStats": { "sent": 6000, "nulled": 0, "deficit": 0 }
    })
}

async fn ws_handler(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let header_map: HashMap<String, String> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_lowercase(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    // A Session-Id header asks to resume that session; otherwise a fresh
    // session id is handed out.
    let counter = state.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let (session_id, resumed) = match header_map.get("session-id") {
        Some(session_id) => (session_id.clone(), true),
        None => (format!("mock-session-{counter}"), false),
    };

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let session = Arc::new(WsSession {
        headers: header_map,
        session_id: session_id.clone(),
        command_tx,
    });

    ws.on_upgrade(move |socket| async move {
        state.sessions.lock().await.push(session);
        run_session(socket, session_id, resumed, command_rx).await;
    })
}

async fn run_session(
    mut socket: WebSocket,
    session_id: String,
    resumed: bool,
    mut command_rx: mpsc::UnboundedReceiver<WsCommand>,
) {
    let ready = json!({ "op": "ready", "resumed": resumed, "sessionId": session_id });
    if socket.send(Message::Text(ready.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(WsCommand::Frame(text)) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                Some(WsCommand::Close(code)) => {
                    let frame = CloseFrame { code, reason: "".into() };
                    let _ = socket.send(Message::Close(Some(frame))).await;
                    return;
                }
                None => return,
            },
            message = socket.recv() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn rest_handler(State(state): State<Arc<MockState>>, request: Request) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or_default().to_string();
    let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };

    state.requests.lock().await.push(CapturedRequest {
        method: method.clone(),
        path: path.clone(),
        query,
        body: body.clone(),
    });

    if path == "/v4/loadtracks" {
        return Json(state.load_response.lock().await.clone()).into_response();
    }
    if path == "/version" {
        return "4.0.0".into_response();
    }
    if method == "DELETE" {
        return StatusCode::NO_CONTENT.into_response();
    }
    // Player and session updates echo the submitted state back.
    Json(body).into_response()
}
