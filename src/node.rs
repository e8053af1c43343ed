//! Node connection lifecycle
//!
//! One `Node` wraps one backend server: it owns the WebSocket connection, the
//! session-resume handshake, the bounded reconnection policy and the latest
//! stats snapshot. Inbound frames are processed in receipt order by a single
//! reader task per connection; player-scoped frames are routed through the
//! pool's player registry.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{NodeConfig, LIBRARY_VERSION};
use crate::error::{Error, Result};
use crate::events::ClientEvent;
use crate::model::{parse_frame, IncomingFrame, NodeStats, ReadyFrame};
use crate::pool::Shared;
use crate::rest::RestClient;

/// Close code used for deliberate shutdowns; anything else schedules a
/// reconnect attempt
pub const CLOSE_NORMAL: u16 = 1000;
const CLOSE_ABNORMAL: u16 = 1006;

/// Connection state. The socket handle itself lives in the reader task, so a
/// socket without a `Connected` state (or the reverse) is unrepresentable
/// here; `session_id` is `None` between the socket opening and the node's
/// ready frame.
#[derive(Debug, Clone)]
pub enum NodeState {
    Disconnected,
    Connecting,
    Connected { session_id: Option<String> },
}

/// A single backend server in the pool
pub struct Node {
    pub name: String,
    /// Voice regions this node is preferred for
    pub regions: Vec<String>,
    /// REST API bound to this node
    pub rest: RestClient,
    config: NodeConfig,
    shared: Arc<Shared>,
    state: RwLock<NodeState>,
    stats: RwLock<Option<NodeStats>>,
    /// Signals the reader task of the current connection to close the socket.
    /// Replaced on every connect; dropping the previous sender closes the
    /// previous socket.
    close_handle: StdMutex<Option<oneshot::Sender<u16>>>,
    /// Bumped on every connect. A reader whose generation is stale belongs to
    /// a superseded connection and must not touch node state on its way out.
    generation: AtomicU64,
    /// At most one reconnect timer may be outstanding at a time
    reconnect_pending: AtomicBool,
    reconnect_attempts: AtomicU32,
    /// Set on explicit removal; suppresses any further reconnects
    removed: AtomicBool,
}

impl Node {
    pub(crate) fn new(config: NodeConfig, shared: Arc<Shared>) -> Result<Arc<Self>> {
        let rest = RestClient::new(&config)?;
        Ok(Arc::new(Self {
            name: config.name.clone(),
            regions: config.regions.clone(),
            rest,
            config,
            shared,
            state: RwLock::new(NodeState::Disconnected),
            stats: RwLock::new(None),
            close_handle: StdMutex::new(None),
            generation: AtomicU64::new(0),
            reconnect_pending: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            removed: AtomicBool::new(false),
        }))
    }

    /// Issue the initial connect attempt without waiting for it to complete;
    /// a failed attempt falls into the regular reconnect policy
    pub(crate) fn start(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = node.connect().await {
                warn!(node = %node.name, error = %e, "initial connect failed");
                node.shared.emit(ClientEvent::NodeError {
                    node: node.name.clone(),
                    message: e.to_string(),
                });
                node.schedule_reconnect();
            }
        });
    }

    /// Open the WebSocket connection to the node.
    ///
    /// Calling this while already connected closes the prior socket first. A
    /// previously learned session id is sent as a resume header.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.shared.user_id.is_empty() {
            return Err(Error::MissingUserId);
        }
        if self.removed.load(Ordering::SeqCst) {
            return Err(Error::UnknownNode(self.name.clone()));
        }

        // Supersede any prior connection. Its reader observes the stale
        // generation in finish_close and shuts down without touching node
        // state or scheduling a reconnect.
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = self.close_handle.lock().unwrap().take() {
            let _ = previous.send(CLOSE_NORMAL);
        }

        *self.state.write().await = NodeState::Connecting;

        let mut request = self.config.socket_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, header_value(&self.config.password)?);
        headers.insert("User-Id", header_value(&self.shared.user_id)?);
        let client_name = format!("{}/{}", self.shared.config.client_name, LIBRARY_VERSION);
        headers.insert("Client-Name", header_value(&client_name)?);
        if let Some(session_id) = self.rest.session_id().await {
            headers.insert("Session-Id", header_value(&session_id)?);
        }

        let socket = match tokio_tungstenite::connect_async(request).await {
            Ok((socket, _response)) => socket,
            Err(e) => {
                *self.state.write().await = NodeState::Disconnected;
                return Err(e.into());
            }
        };

        let (close_tx, close_rx) = oneshot::channel();
        *self.close_handle.lock().unwrap() = Some(close_tx);
        *self.state.write().await = NodeState::Connected { session_id: None };
        self.reconnect_attempts.store(0, Ordering::SeqCst);

        info!(node = %self.name, "node socket open");
        self.shared.emit(ClientEvent::NodeConnect {
            node: self.name.clone(),
        });

        self.spawn_reader(socket, close_rx, generation);
        Ok(())
    }

    /// Deliberately shut the node down: migrate its players to other nodes,
    /// then close the socket with the deliberate-shutdown code. No reconnect
    /// is scheduled afterwards.
    pub async fn disconnect(self: &Arc<Self>) {
        self.removed.store(true, Ordering::SeqCst);
        self.migrate_players().await;

        let handle = self.close_handle.lock().unwrap().take();
        match handle {
            Some(close_tx) => {
                // The reader emits the disconnect notification on its way out.
                let _ = close_tx.send(CLOSE_NORMAL);
            }
            None => {
                *self.state.write().await = NodeState::Disconnected;
                self.shared.emit(ClientEvent::NodeDisconnect {
                    node: self.name.clone(),
                    code: CLOSE_NORMAL,
                });
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.read().await, NodeState::Connected { .. })
    }

    pub async fn state(&self) -> NodeState {
        self.state.read().await.clone()
    }

    pub async fn session_id(&self) -> Option<String> {
        match &*self.state.read().await {
            NodeState::Connected { session_id } => session_id.clone(),
            _ => None,
        }
    }

    /// Latest stats snapshot pushed by the node
    pub async fn stats(&self) -> Option<NodeStats> {
        self.stats.read().await.clone()
    }

    /// Load penalty from the latest stats; 0 until the first stats frame
    pub async fn penalty(&self) -> i64 {
        self.stats.read().await.as_ref().map_or(0, NodeStats::penalty)
    }

    /// Per-core CPU load percentage from the latest stats
    pub async fn normalized_load(&self) -> f64 {
        self.stats
            .read()
            .await
            .as_ref()
            .map_or(0.0, NodeStats::normalized_load)
    }

    /// Schedule exactly one reconnect attempt after the configured delay. A
    /// call while a timer is already pending is a no-op, so there is never
    /// more than one outstanding timer per node.
    pub(crate) fn schedule_reconnect(self: &Arc<Self>) {
        if self.removed.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.shared.config.reconnect_tries {
            self.reconnect_pending.store(false, Ordering::SeqCst);
            let err = Error::ReconnectExhausted(self.name.clone());
            error!(node = %self.name, "{err}");
            self.shared.emit(ClientEvent::NodeError {
                node: self.name.clone(),
                message: err.to_string(),
            });
            return;
        }

        let delay = Duration::from_millis(self.shared.config.reconnect_delay_ms);
        info!(node = %self.name, attempt, ?delay, "scheduling reconnect");
        self.shared.emit(ClientEvent::NodeReconnect {
            node: self.name.clone(),
            attempt,
        });

        let node = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            node.reconnect_pending.store(false, Ordering::SeqCst);
            if node.removed.load(Ordering::SeqCst) || node.is_connected().await {
                return;
            }
            if let Err(e) = node.connect().await {
                warn!(node = %node.name, error = %e, "reconnect attempt failed");
                node.schedule_reconnect();
            }
        });
    }

    fn spawn_reader(
        self: &Arc<Self>,
        socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
        mut close_rx: oneshot::Receiver<u16>,
        generation: u64,
    ) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let (mut ws_tx, mut ws_rx) = socket.split();
            loop {
                tokio::select! {
                    signal = &mut close_rx => {
                        // Explicit shutdown, or our handle was replaced by a
                        // newer connect; both are deliberate closes.
                        let code = signal.unwrap_or(CLOSE_NORMAL);
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: "".into(),
                        };
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                        node.finish_close(generation, code, true).await;
                        return;
                    }
                    message = ws_rx.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = node.handle_frame(&text).await {
                                warn!(node = %node.name, error = %e, "failed to handle frame");
                                node.shared.emit(ClientEvent::NodeError {
                                    node: node.name.clone(),
                                    message: e.to_string(),
                                });
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map_or(CLOSE_ABNORMAL, |f| u16::from(f.code));
                            node.finish_close(generation, code, false).await;
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            // Observational only; the close path drives any
                            // reconnect once the stream actually ends.
                            node.shared.emit(ClientEvent::NodeError {
                                node: node.name.clone(),
                                message: e.to_string(),
                            });
                        }
                        None => {
                            node.finish_close(generation, CLOSE_ABNORMAL, false).await;
                            return;
                        }
                    }
                }
            }
        });
    }

    async fn finish_close(self: &Arc<Self>, generation: u64, code: u16, deliberate: bool) {
        // A newer connect already replaced this connection; its state and
        // events are authoritative, not this reader's.
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(node = %self.name, generation, "superseded reader exiting");
            return;
        }
        *self.state.write().await = NodeState::Disconnected;
        info!(node = %self.name, code, deliberate, "node socket closed");
        self.shared.emit(ClientEvent::NodeDisconnect {
            node: self.name.clone(),
            code,
        });

        if deliberate || code == CLOSE_NORMAL || self.removed.load(Ordering::SeqCst) {
            return;
        }
        // Unexpected closure: keep playback alive elsewhere, then try to get
        // this node back.
        self.migrate_players().await;
        self.schedule_reconnect();
    }

    async fn migrate_players(self: &Arc<Self>) {
        let players = self.shared.players_on(&self.name).await;
        for player in players {
            if let Err(e) = player.auto_move_node().await {
                // auto_move_node destroys the player itself when no healthy
                // node exists; nothing is left dangling here.
                warn!(guild = %player.guild_id, error = %e, "could not migrate player");
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, text: &str) -> Result<()> {
        let Some(frame) = parse_frame(text)? else {
            debug!(node = %self.name, "dropping frame without known op");
            return Ok(());
        };

        match frame {
            IncomingFrame::Ready(ready) => self.handle_ready(ready).await,
            IncomingFrame::Stats(stats) => {
                *self.stats.write().await = Some(stats);
                Ok(())
            }
            IncomingFrame::PlayerUpdate(update) => {
                let player = self.shared.player(&update.guild_id).await;
                match player {
                    Some(player) => player.apply_update(&update.state),
                    // Early frames may arrive before the player exists; that
                    // is expected, not an error.
                    None => debug!(
                        node = %self.name,
                        guild = %update.guild_id,
                        "dropping player update for unknown guild"
                    ),
                }
                Ok(())
            }
            IncomingFrame::Event(event) => {
                let player = self.shared.player(event.guild_id()).await;
                match player {
                    Some(player) => player.handle_event(event).await,
                    None => {
                        debug!(
                            node = %self.name,
                            guild = %event.guild_id(),
                            "dropping event for unknown guild"
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    async fn handle_ready(self: &Arc<Self>, ready: ReadyFrame) -> Result<()> {
        info!(node = %self.name, resumed = ready.resumed, "node ready");
        self.rest.set_session_id(ready.session_id.clone()).await;
        *self.state.write().await = NodeState::Connected {
            session_id: Some(ready.session_id),
        };

        if self.shared.config.resume {
            let timeout = self.shared.config.resume_timeout_secs;
            if let Err(e) = self.rest.update_session(true, timeout).await {
                warn!(node = %self.name, error = %e, "failed to configure session resume");
                self.shared.debug(format!(
                    "node {}: resume configuration failed: {e}",
                    self.name
                ));
            }

            // Pick up any players still attached to this node so the resumed
            // session keeps playing. Players created mid-handshake simply
            // start fresh.
            for player in self.shared.players_on(&self.name).await {
                if let Err(e) = player.restart().await {
                    warn!(guild = %player.guild_id, error = %e, "auto-resume restart failed");
                    self.shared.debug(format!(
                        "guild {}: auto-resume restart failed: {e}",
                        player.guild_id
                    ));
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn force_connected(&self, session_id: &str) {
        self.rest.set_session_id(session_id.to_string()).await;
        *self.state.write().await = NodeState::Connected {
            session_id: Some(session_id.to_string()),
        };
    }

    #[cfg(test)]
    pub(crate) async fn force_stats(&self, stats: NodeStats) {
        *self.stats.write().await = Some(stats);
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| Error::Config(format!("invalid header value: {value}")))
}
