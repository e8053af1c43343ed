//! Per-guild playback session
//!
//! A `Player` owns its queue, its loop mode and a reference to the node that
//! hosts its server-side session. All queue advances funnel through one async
//! mutex so a concurrent `play()` and an event-driven advance can never
//! double-dequeue. Playback events pushed by the node arrive here via the
//! node's reader task.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::ClientEvent;
use crate::model::{
    PlayerEvent, PlayerUpdateState, Track, TrackEndReason, TrackInfo, UpdatePlayerPayload,
    UpdatePlayerTrack,
};
use crate::node::Node;
use crate::pool::Shared;
use crate::queue::Queue;
use crate::voice::{self, StateOutcome, VoiceConnection};

/// Voice close codes after which the last join payload is re-sent: the voice
/// server crashed or the session timed out, and a fresh handshake self-heals
/// the connection.
const VOICE_RESUME_CODES: [u16; 2] = [4009, 4015];

const MAX_VOLUME: u16 = 1000;

/// What happens to a finished track
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    /// Discard the finished track
    #[default]
    Off,
    /// Replay the finished track immediately
    Track,
    /// Re-enqueue the finished track at the back of the queue
    Queue,
}

/// Playback session for one guild. Exactly one player exists per guild id at
/// any time; the pool enforces that invariant.
pub struct Player {
    pub guild_id: String,
    shared: Arc<Shared>,
    /// Reassigned on migration between nodes
    node: RwLock<Arc<Node>>,
    queue: Mutex<Queue>,
    /// Serializes dequeue -> resolve -> play-request so concurrent advances
    /// cannot double-dequeue
    advance_lock: Mutex<()>,
    current: RwLock<Option<Track>>,
    previous: RwLock<Option<Track>>,
    loop_mode: RwLock<LoopMode>,
    voice: Mutex<VoiceConnection>,
    voice_channel_id: RwLock<Option<String>>,
    text_channel_id: RwLock<Option<String>>,
    is_playing: AtomicBool,
    is_paused: AtomicBool,
    is_connected: AtomicBool,
    destroyed: AtomicBool,
    /// Last known position in milliseconds, updated from player-update frames
    position: AtomicU64,
    ping: AtomicI64,
    volume: AtomicU32,
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("guild_id", &self.guild_id)
            .finish_non_exhaustive()
    }
}

impl Player {
    pub(crate) fn new(
        shared: Arc<Shared>,
        node: Arc<Node>,
        guild_id: String,
        text_channel_id: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            guild_id,
            shared,
            node: RwLock::new(node),
            queue: Mutex::new(Queue::new()),
            advance_lock: Mutex::new(()),
            current: RwLock::new(None),
            previous: RwLock::new(None),
            loop_mode: RwLock::new(LoopMode::Off),
            voice: Mutex::new(VoiceConnection::new()),
            voice_channel_id: RwLock::new(None),
            text_channel_id: RwLock::new(text_channel_id),
            is_playing: AtomicBool::new(false),
            is_paused: AtomicBool::new(false),
            is_connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            position: AtomicU64::new(0),
            ping: AtomicI64::new(-1),
            volume: AtomicU32::new(100),
        })
    }

    /// Node currently hosting this player's session
    pub async fn node(&self) -> Arc<Node> {
        self.node.read().await.clone()
    }

    /// Pending tracks; lock to mutate
    pub fn queue(&self) -> &Mutex<Queue> {
        &self.queue
    }

    pub async fn current_track(&self) -> Option<Track> {
        self.current.read().await.clone()
    }

    pub async fn previous_track(&self) -> Option<Track> {
        self.previous.read().await.clone()
    }

    pub async fn loop_mode(&self) -> LoopMode {
        *self.loop_mode.read().await
    }

    pub async fn set_loop(&self, mode: LoopMode) {
        *self.loop_mode.write().await = mode;
    }

    pub async fn voice_channel_id(&self) -> Option<String> {
        self.voice_channel_id.read().await.clone()
    }

    pub async fn text_channel_id(&self) -> Option<String> {
        self.text_channel_id.read().await.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    /// Last known playback position in milliseconds
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    /// Voice gateway round-trip time, -1 when unknown
    pub fn ping(&self) -> i64 {
        self.ping.load(Ordering::SeqCst)
    }

    pub fn volume(&self) -> u16 {
        self.volume.load(Ordering::SeqCst) as u16
    }

    /// Ask the host to join a voice channel. The actual voice session reaches
    /// the node later, once both gateway packets have been correlated.
    pub async fn connect(&self, voice_channel_id: &str, self_deaf: bool, self_mute: bool) {
        {
            let mut voice = self.voice.lock().await;
            voice.channel_id = Some(voice_channel_id.to_string());
            voice.self_deaf = self_deaf;
            voice.self_mute = self_mute;
        }
        *self.voice_channel_id.write().await = Some(voice_channel_id.to_string());
        self.is_connected.store(true, Ordering::SeqCst);
        info!(guild = %self.guild_id, channel = %voice_channel_id, "joining voice channel");
        self.shared.send_gateway(voice::join_packet(
            &self.guild_id,
            voice_channel_id,
            self_deaf,
            self_mute,
        ));
    }

    /// Leave the voice channel: pause playback, clear the channel and send
    /// the leave request through the host
    pub async fn disconnect(&self) {
        if let Err(e) = self.pause(true).await {
            debug!(guild = %self.guild_id, error = %e, "pause during disconnect failed");
        }
        *self.voice_channel_id.write().await = None;
        self.voice.lock().await.channel_id = None;
        self.is_connected.store(false, Ordering::SeqCst);
        self.shared.send_gateway(voice::leave_packet(&self.guild_id));
    }

    /// Start the next queued track. A no-op when the queue is empty: no state
    /// changes, no request to the node.
    pub async fn play(&self) -> Result<()> {
        let _advance = self.advance_lock.lock().await;

        let Some(track) = self.queue.lock().await.pop() else {
            return Ok(());
        };

        let track = if track.encoded.is_some() {
            track
        } else {
            match self.resolve_track(&track).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    self.shared.emit(ClientEvent::TrackError {
                        guild_id: self.guild_id.clone(),
                        message: format!("resolution failed for {}: {e}", track.info.title),
                    });
                    return Err(e);
                }
            }
        };

        let payload = UpdatePlayerPayload {
            track: Some(UpdatePlayerTrack {
                encoded: track.encoded.clone(),
                user_data: match &track.user_data {
                    Value::Null => None,
                    data => Some(data.clone()),
                },
            }),
            position: Some(0),
            ..Default::default()
        };
        let node = self.node().await;
        node.rest.update_player(&self.guild_id, &payload, false).await?;

        *self.current.write().await = Some(track);
        self.position.store(0, Ordering::SeqCst);
        self.is_playing.store(true, Ordering::SeqCst);
        self.is_paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Force the current track to stop. The node answers with a track-end
    /// event, and that event drives the advance to the next queued track.
    pub async fn skip(&self) -> Result<()> {
        let payload = UpdatePlayerPayload {
            track: Some(UpdatePlayerTrack::default()),
            ..Default::default()
        };
        let node = self.node().await;
        node.rest.update_player(&self.guild_id, &payload, false).await?;
        self.is_playing.store(false, Ordering::SeqCst);
        self.position.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Pause (`true`) or resume (`false`) playback
    pub async fn pause(&self, paused: bool) -> Result<()> {
        let payload = UpdatePlayerPayload {
            paused: Some(paused),
            ..Default::default()
        };
        let node = self.node().await;
        node.rest.update_player(&self.guild_id, &payload, false).await?;
        self.is_paused.store(paused, Ordering::SeqCst);
        self.is_playing.store(!paused, Ordering::SeqCst);
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.pause(false).await
    }

    /// Seek the current track to a position in milliseconds
    pub async fn seek(&self, position_ms: u64) -> Result<()> {
        let payload = UpdatePlayerPayload {
            position: Some(position_ms),
            ..Default::default()
        };
        let node = self.node().await;
        node.rest.update_player(&self.guild_id, &payload, false).await?;
        self.position.store(position_ms, Ordering::SeqCst);
        Ok(())
    }

    /// Set the playback volume, clamped to 0..=1000
    pub async fn set_volume(&self, volume: u16) -> Result<()> {
        let volume = volume.min(MAX_VOLUME);
        let payload = UpdatePlayerPayload {
            volume: Some(volume),
            ..Default::default()
        };
        let node = self.node().await;
        node.rest.update_player(&self.guild_id, &payload, false).await?;
        self.volume.store(u32::from(volume), Ordering::SeqCst);
        Ok(())
    }

    /// Apply an audio-effect parameter object, passed to the node verbatim
    pub async fn set_filters(&self, filters: Value) -> Result<()> {
        let payload = UpdatePlayerPayload {
            filters: Some(filters),
            ..Default::default()
        };
        let node = self.node().await;
        node.rest.update_player(&self.guild_id, &payload, false).await?;
        Ok(())
    }

    /// Re-establish playback after a session resume or a node migration:
    /// re-sends the current track at its last known position, or advances the
    /// queue when nothing was playing.
    pub async fn restart(&self) -> Result<()> {
        let current = self.current.read().await.clone();
        let Some(track) = current else {
            if self.queue.lock().await.is_empty() {
                return Ok(());
            }
            return self.play().await;
        };
        let Some(encoded) = track.encoded.clone() else {
            return self.play().await;
        };

        // Include the voice session when it is complete; after a migration
        // the new node has never seen it.
        let voice = self.voice.lock().await.payload();
        let payload = UpdatePlayerPayload {
            track: Some(UpdatePlayerTrack {
                encoded: Some(encoded),
                user_data: None,
            }),
            position: Some(self.position()),
            paused: Some(self.is_paused()),
            voice,
            ..Default::default()
        };
        let node = self.node().await;
        node.rest.update_player(&self.guild_id, &payload, false).await?;
        self.is_playing.store(!self.is_paused(), Ordering::SeqCst);
        Ok(())
    }

    /// Migrate this player to the named node and resume in place. On any
    /// failure the player is destroyed rather than left half-migrated.
    pub async fn move_node(&self, name: &str) -> Result<()> {
        let target = self
            .shared
            .node(name)
            .await
            .ok_or_else(|| Error::UnknownNode(name.to_string()))?;
        if !target.is_connected().await {
            return Err(Error::NoAvailableNodes);
        }

        let old = self.node().await;
        if old.name == target.name {
            return Ok(());
        }

        info!(guild = %self.guild_id, from = %old.name, to = %target.name, "moving player");
        if let Err(e) = old.rest.destroy_player(&self.guild_id).await {
            // Best effort; the old node may already be gone.
            debug!(guild = %self.guild_id, error = %e, "destroy on old node failed");
        }

        *self.node.write().await = target;
        match self.restart().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(guild = %self.guild_id, error = %e, "restart after move failed; destroying player");
                self.destroy().await;
                Err(e)
            }
        }
    }

    /// Migrate to the least-used connected node, excluding the one this
    /// player is currently on. Destroys the player when no candidate exists.
    pub async fn auto_move_node(&self) -> Result<()> {
        let current = self.node().await.name.clone();
        let candidates = self.shared.least_used_nodes(Some(&current)).await;
        let Some(target) = candidates.first() else {
            self.destroy().await;
            return Err(Error::NoAvailableNodes);
        };
        let target = target.name.clone();
        self.move_node(&target).await
    }

    /// Tear the player down: leave voice, destroy the server-side session and
    /// remove it from the registry. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect().await;

        let node = self.node().await;
        if let Err(e) = node.rest.destroy_player(&self.guild_id).await {
            warn!(guild = %self.guild_id, error = %e, "server-side player destroy failed");
            self.shared.debug(format!(
                "guild {}: server-side destroy failed: {e}",
                self.guild_id
            ));
        }

        self.shared.remove_player(&self.guild_id).await;
        self.shared.emit(ClientEvent::PlayerDestroy {
            guild_id: self.guild_id.clone(),
        });
    }

    /// Position/ping bookkeeping pushed by the node
    pub(crate) fn apply_update(&self, state: &PlayerUpdateState) {
        self.position.store(state.position, Ordering::SeqCst);
        self.ping.store(state.ping, Ordering::SeqCst);
        self.is_connected.store(state.connected, Ordering::SeqCst);
        self.shared.emit(ClientEvent::PlayerUpdate {
            guild_id: self.guild_id.clone(),
            position: state.position,
            ping: state.ping,
            connected: state.connected,
        });
    }

    /// Dispatch a node-pushed playback event
    pub(crate) async fn handle_event(&self, event: PlayerEvent) -> Result<()> {
        match event {
            PlayerEvent::TrackStart { track, .. } => {
                self.is_playing.store(true, Ordering::SeqCst);
                self.is_paused.store(false, Ordering::SeqCst);
                *self.current.write().await = Some(track.clone());
                self.shared.emit(ClientEvent::TrackStart {
                    guild_id: self.guild_id.clone(),
                    track,
                });
                Ok(())
            }
            PlayerEvent::TrackEnd { track, reason, .. } => {
                self.handle_track_end(track, reason).await
            }
            PlayerEvent::TrackException { exception, .. } => {
                self.shared.emit(ClientEvent::TrackError {
                    guild_id: self.guild_id.clone(),
                    message: format!(
                        "track exception ({}): {}",
                        exception.severity,
                        exception.message.as_deref().unwrap_or("unknown")
                    ),
                });
                // Never retry the same track.
                self.skip().await
            }
            PlayerEvent::TrackStuck { threshold_ms, .. } => {
                self.shared.emit(ClientEvent::TrackError {
                    guild_id: self.guild_id.clone(),
                    message: format!("track stuck for more than {threshold_ms}ms"),
                });
                self.skip().await
            }
            PlayerEvent::WebSocketClosed { code, reason, .. } => {
                if VOICE_RESUME_CODES.contains(&code) {
                    let (channel, self_deaf, self_mute) = {
                        let voice = self.voice.lock().await;
                        (voice.channel_id.clone(), voice.self_deaf, voice.self_mute)
                    };
                    if let Some(channel) = channel {
                        info!(guild = %self.guild_id, code, "voice socket lost; re-sending join");
                        self.shared.send_gateway(voice::join_packet(
                            &self.guild_id,
                            &channel,
                            self_deaf,
                            self_mute,
                        ));
                    }
                }
                self.shared.emit(ClientEvent::SocketClosed {
                    guild_id: self.guild_id.clone(),
                    code,
                    reason,
                });
                if let Err(e) = self.pause(true).await {
                    debug!(guild = %self.guild_id, error = %e, "pause after socket close failed");
                }
                Ok(())
            }
        }
    }

    async fn handle_track_end(&self, track: Track, reason: TrackEndReason) -> Result<()> {
        *self.previous.write().await = Some(track.clone());
        *self.current.write().await = None;
        self.is_playing.store(false, Ordering::SeqCst);
        self.shared.emit(ClientEvent::TrackEnd {
            guild_id: self.guild_id.clone(),
            track: track.clone(),
            reason,
        });

        if reason == TrackEndReason::Replaced {
            // A newer play request already superseded this track; advancing
            // here would stop its replacement.
            return Ok(());
        }

        if !reason.is_normal() {
            // Load failure or cleanup: bypass loop handling entirely.
            if self.queue.lock().await.is_empty() {
                self.shared.emit(ClientEvent::QueueEnd {
                    guild_id: self.guild_id.clone(),
                });
                return Ok(());
            }
            return self.play().await;
        }

        match *self.loop_mode.read().await {
            LoopMode::Track => {
                self.queue.lock().await.add_front(track);
                return self.play().await;
            }
            LoopMode::Queue => {
                self.queue.lock().await.add(track);
                return self.play().await;
            }
            LoopMode::Off => {}
        }

        if self.queue.lock().await.is_empty() {
            self.shared.emit(ClientEvent::QueueEnd {
                guild_id: self.guild_id.clone(),
            });
            return Ok(());
        }
        self.play().await
    }

    /// Voice-state half of the gateway handshake
    pub(crate) async fn on_voice_state_update(&self, update: crate::model::VoiceStateUpdate) {
        let outcome = self.voice.lock().await.state_update(update);
        match outcome {
            StateOutcome::None => {}
            StateOutcome::Forward(payload) => self.send_voice_update(payload).await,
            StateOutcome::ChannelCleared => {
                // The bot was disconnected or kicked from the channel.
                info!(guild = %self.guild_id, "voice channel cleared by gateway");
                *self.voice_channel_id.write().await = None;
                self.is_connected.store(false, Ordering::SeqCst);
                if let Err(e) = self.pause(true).await {
                    debug!(guild = %self.guild_id, error = %e, "pause after voice loss failed");
                }
                self.shared.debug(format!(
                    "guild {}: voice channel cleared, playback paused",
                    self.guild_id
                ));
            }
        }
    }

    /// Voice-server half of the gateway handshake
    pub(crate) async fn on_voice_server_update(&self, update: crate::model::VoiceServerUpdate) {
        let payload = self.voice.lock().await.server_update(update);
        if let Some(payload) = payload {
            self.send_voice_update(payload).await;
        }
    }

    async fn send_voice_update(&self, payload: crate::model::VoiceUpdatePayload) {
        let body = UpdatePlayerPayload {
            voice: Some(payload),
            ..Default::default()
        };
        let node = self.node().await;
        if let Err(e) = node.rest.update_player(&self.guild_id, &body, false).await {
            warn!(guild = %self.guild_id, error = %e, "voice update failed");
            self.shared.debug(format!(
                "guild {}: voice update failed: {e}",
                self.guild_id
            ));
        }
    }

    async fn resolve_track(&self, track: &Track) -> Result<Track> {
        let query = format!("{} - {}", track.info.author, track.info.title);
        let identifier = format!("{}:{}", self.shared.config.default_platform, query);
        debug!(guild = %self.guild_id, %identifier, "resolving unresolved track");

        let node = self.node().await;
        let candidates = node.rest.load_tracks(&identifier).await?.into_tracks();
        let mut resolved = pick_search_result(&track.info, candidates)
            .ok_or_else(|| Error::TrackResolveFailed(format!("no results for \"{query}\"")))?;

        resolved.info.requester = track.info.requester.clone();
        if track.user_data != Value::Null {
            resolved.user_data = track.user_data.clone();
        }
        Ok(resolved)
    }
}

/// Pick the best candidate for an unresolved track. A heuristic, not a
/// guarantee: prefer an exact author match (or the author's auto-generated
/// "<author> - Topic" channel), else a candidate within 2 seconds of the
/// known duration, else the first result.
fn pick_search_result(info: &TrackInfo, candidates: Vec<Track>) -> Option<Track> {
    const DURATION_WINDOW_MS: i64 = 2000;

    if !info.author.is_empty() {
        let author = info.author.to_lowercase();
        let topic = format!("{author} - topic");
        if let Some(found) = candidates.iter().find(|candidate| {
            let candidate_author = candidate.info.author.to_lowercase();
            candidate_author == author || candidate_author == topic
        }) {
            return Some(found.clone());
        }
    } else if info.length > 0 {
        if let Some(found) = candidates.iter().find(|candidate| {
            (candidate.info.length as i64 - info.length as i64).abs() <= DURATION_WINDOW_MS
        }) {
            return Some(found.clone());
        }
    }

    candidates.into_iter().next()
}
