//! Node pool and orchestration
//!
//! The `Client` owns both registries (nodes by name, players by guild) and is
//! the only place that mutates them, which keeps the one-player-per-guild
//! invariant enforceable in one spot. Everything else gets `Arc` handles.
//! Inbound gateway packets from the host application are routed here to the
//! right player; outbound join/leave requests go back through the host's
//! `send` callback.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::config::{ClientConfig, NodeConfig};
use crate::error::{Error, Result};
use crate::events::ClientEvent;
use crate::model::{LoadResult, Track, VoiceServerUpdate, VoiceStateUpdate};
use crate::node::Node;
use crate::player::Player;

/// Callback used to hand voice join/leave packets to the host's gateway
/// connection; this client never opens a gateway connection of its own
pub type GatewaySender = Arc<dyn Fn(Value) + Send + Sync>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Options for creating (or fetching) a guild's player
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub guild_id: String,
    pub voice_channel_id: String,
    pub text_channel_id: Option<String>,
    pub self_deaf: bool,
    pub self_mute: bool,
    /// Preferred voice region; falls back to global least-used selection
    /// when no connected node covers it
    pub region: Option<String>,
}

impl ConnectionOptions {
    pub fn new(guild_id: impl Into<String>, voice_channel_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            voice_channel_id: voice_channel_id.into(),
            text_channel_id: None,
            self_deaf: true,
            self_mute: false,
            region: None,
        }
    }
}

/// State shared between the client, its nodes and its players
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) user_id: String,
    gateway: GatewaySender,
    pub(crate) nodes: RwLock<HashMap<String, Arc<Node>>>,
    pub(crate) players: RwLock<HashMap<String, Arc<Player>>>,
    event_tx: broadcast::Sender<ClientEvent>,
}

impl Shared {
    /// Broadcast an event; no receivers is fine
    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Surface a non-fatal condition on the event bus
    pub(crate) fn debug(&self, message: impl Into<String>) {
        self.emit(ClientEvent::Debug {
            message: message.into(),
        });
    }

    pub(crate) fn send_gateway(&self, packet: Value) {
        (self.gateway)(packet);
    }

    pub(crate) async fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.read().await.get(name).cloned()
    }

    pub(crate) async fn player(&self, guild_id: &str) -> Option<Arc<Player>> {
        self.players.read().await.get(guild_id).cloned()
    }

    pub(crate) async fn remove_player(&self, guild_id: &str) {
        self.players.write().await.remove(guild_id);
    }

    /// Players whose current node is the named one
    pub(crate) async fn players_on(&self, node_name: &str) -> Vec<Arc<Player>> {
        let players: Vec<Arc<Player>> = self.players.read().await.values().cloned().collect();
        let mut on_node = Vec::new();
        for player in players {
            if player.node().await.name == node_name {
                on_node.push(player);
            }
        }
        on_node
    }

    /// Connected nodes sorted ascending by penalty. Disconnected nodes are
    /// excluded entirely, never just penalized; `exclude` additionally drops
    /// a node by name (the source node of a migration).
    pub(crate) async fn least_used_nodes(&self, exclude: Option<&str>) -> Vec<Arc<Node>> {
        let nodes: Vec<Arc<Node>> = self.nodes.read().await.values().cloned().collect();
        let mut scored = Vec::new();
        for node in nodes {
            if Some(node.name.as_str()) == exclude {
                continue;
            }
            if !node.is_connected().await {
                continue;
            }
            scored.push((node.penalty().await, node));
        }
        scored.sort_by_key(|(penalty, _)| *penalty);
        scored.into_iter().map(|(_, node)| node).collect()
    }

    /// Connected nodes covering a region, sorted by per-core CPU load
    pub(crate) async fn nodes_by_region(&self, region: &str) -> Vec<Arc<Node>> {
        let wanted = region.to_lowercase();
        let nodes: Vec<Arc<Node>> = self.nodes.read().await.values().cloned().collect();
        let mut matching = Vec::new();
        for node in nodes {
            if !node.is_connected().await {
                continue;
            }
            if node.regions.iter().any(|r| r.to_lowercase() == wanted) {
                matching.push((node.normalized_load().await, node));
            }
        }
        matching.sort_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        matching.into_iter().map(|(_, node)| node).collect()
    }
}

/// Entry point: the registry of all configured nodes and players
#[derive(Clone)]
pub struct Client {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client for the given bot user id. The `gateway` callback is
    /// invoked with raw voice join/leave packets the host must forward to its
    /// gateway connection.
    pub fn new(
        config: ClientConfig,
        user_id: impl Into<String>,
        gateway: GatewaySender,
    ) -> Result<Self> {
        let user_id = user_id.into();
        if user_id.is_empty() {
            return Err(Error::MissingUserId);
        }
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                user_id,
                gateway,
                nodes: RwLock::new(HashMap::new()),
                players: RwLock::new(HashMap::new()),
                event_tx,
            }),
        })
    }

    /// Subscribe to the client event bus
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    /// Register a node and issue its first connect attempt. Returns once the
    /// attempt has been issued; connection completes asynchronously.
    pub async fn add_node(&self, config: NodeConfig) -> Result<Arc<Node>> {
        let mut nodes = self.shared.nodes.write().await;
        if nodes.contains_key(&config.name) {
            return Err(Error::Config(format!(
                "node {} is already registered",
                config.name
            )));
        }
        info!(node = %config.name, host = %config.host, "adding node");
        let node = Node::new(config, Arc::clone(&self.shared))?;
        nodes.insert(node.name.clone(), Arc::clone(&node));
        drop(nodes);

        node.start();
        Ok(node)
    }

    /// Disconnect and deregister a node. Its players are migrated to other
    /// connected nodes first (or destroyed when none exists).
    pub async fn remove_node(&self, name: &str) -> Result<()> {
        let node = self
            .shared
            .nodes
            .write()
            .await
            .remove(name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))?;
        info!(node = %name, "removing node");
        node.disconnect().await;
        Ok(())
    }

    pub async fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.shared.node(name).await
    }

    pub async fn nodes(&self) -> Vec<Arc<Node>> {
        self.shared.nodes.read().await.values().cloned().collect()
    }

    /// Connected nodes sorted ascending by load penalty
    pub async fn least_used_nodes(&self) -> Vec<Arc<Node>> {
        self.shared.least_used_nodes(None).await
    }

    /// Connected nodes covering a voice region, least loaded first
    pub async fn nodes_by_region(&self, region: &str) -> Vec<Arc<Node>> {
        self.shared.nodes_by_region(region).await
    }

    pub async fn get_player(&self, guild_id: &str) -> Option<Arc<Player>> {
        self.shared.player(guild_id).await
    }

    pub async fn players(&self) -> Vec<Arc<Player>> {
        self.shared.players.read().await.values().cloned().collect()
    }

    /// Fetch or create the player for a guild and ask the host to join its
    /// voice channel. Idempotent: an existing player is returned as-is.
    pub async fn create_connection(&self, options: ConnectionOptions) -> Result<Arc<Player>> {
        if let Some(existing) = self.shared.player(&options.guild_id).await {
            return Ok(existing);
        }

        let node = match &options.region {
            Some(region) => self
                .shared
                .nodes_by_region(region)
                .await
                .into_iter()
                .next(),
            None => None,
        };
        let node = match node {
            Some(node) => node,
            None => self
                .shared
                .least_used_nodes(None)
                .await
                .into_iter()
                .next()
                .ok_or(Error::NoAvailableNodes)?,
        };

        let player = {
            let mut players = self.shared.players.write().await;
            match players.get(&options.guild_id) {
                // Lost the race against a concurrent create for this guild.
                Some(existing) => Arc::clone(existing),
                None => {
                    debug!(guild = %options.guild_id, node = %node.name, "creating player");
                    let player = Player::new(
                        Arc::clone(&self.shared),
                        node,
                        options.guild_id.clone(),
                        options.text_channel_id.clone(),
                    );
                    players.insert(options.guild_id.clone(), Arc::clone(&player));
                    self.shared.emit(ClientEvent::PlayerCreate {
                        guild_id: options.guild_id.clone(),
                    });
                    player
                }
            }
        };

        player
            .connect(&options.voice_channel_id, options.self_deaf, options.self_mute)
            .await;
        Ok(player)
    }

    /// Destroy a guild's player if it exists. Idempotent.
    pub async fn destroy_connection(&self, guild_id: &str) {
        if let Some(player) = self.shared.player(guild_id).await {
            player.destroy().await;
        }
    }

    /// Route a raw gateway dispatch packet (`{"t": ..., "d": ...}`) to the
    /// voice handlers. Unrelated packets are ignored.
    pub async fn handle_raw_packet(&self, packet: &Value) {
        let Some(kind) = packet.get("t").and_then(Value::as_str) else {
            return;
        };
        let Some(data) = packet.get("d") else {
            return;
        };
        match kind {
            "VOICE_STATE_UPDATE" => match serde_json::from_value(data.clone()) {
                Ok(update) => self.handle_voice_state_update(update).await,
                Err(e) => debug!(error = %e, "malformed voice state update dropped"),
            },
            "VOICE_SERVER_UPDATE" => match serde_json::from_value(data.clone()) {
                Ok(update) => self.handle_voice_server_update(update).await,
                Err(e) => debug!(error = %e, "malformed voice server update dropped"),
            },
            _ => {}
        }
    }

    /// Voice-state half of the handshake. Only the bot's own voice states are
    /// relevant; other users' updates are dropped here.
    pub async fn handle_voice_state_update(&self, update: VoiceStateUpdate) {
        if update.user_id != self.shared.user_id {
            return;
        }
        if let Some(player) = self.shared.player(&update.guild_id).await {
            player.on_voice_state_update(update).await;
        }
    }

    /// Voice-server half of the handshake
    pub async fn handle_voice_server_update(&self, update: VoiceServerUpdate) {
        if let Some(player) = self.shared.player(&update.guild_id).await {
            player.on_voice_server_update(update).await;
        }
    }

    /// Resolve a query (URL or free text) into tracks via the least-used
    /// node, attaching the requester to every returned track
    pub async fn resolve(&self, query: &str, requester: Option<Value>) -> Result<LoadResult> {
        let node = self
            .shared
            .least_used_nodes(None)
            .await
            .into_iter()
            .next()
            .ok_or(Error::NoAvailableNodes)?;

        let identifier = if query.starts_with("http://") || query.starts_with("https://") {
            query.to_string()
        } else {
            format!("{}:{}", self.shared.config.default_platform, query)
        };

        let mut result = node.rest.load_tracks(&identifier).await?;
        if let Some(requester) = requester {
            match &mut result {
                LoadResult::Track(track) => track.info.requester = Some(requester),
                LoadResult::Playlist(playlist) => {
                    for track in &mut playlist.tracks {
                        track.info.requester = Some(requester.clone());
                    }
                }
                LoadResult::Search(tracks) => {
                    for track in tracks {
                        track.info.requester = Some(requester.clone());
                    }
                }
                LoadResult::Empty {} | LoadResult::Error(_) => {}
            }
        }
        Ok(result)
    }

    /// Decode an encoded track payload via the least-used node
    pub async fn decode_track(&self, encoded: &str) -> Result<Track> {
        let node = self
            .shared
            .least_used_nodes(None)
            .await
            .into_iter()
            .next()
            .ok_or(Error::NoAvailableNodes)?;
        node.rest.decode_track(encoded).await
    }
}
