//! Wire types for the node protocol
//!
//! Covers both directions: frames pushed by a node over its WebSocket
//! (`ready`, `stats`, `playerUpdate`, `event`) and the REST payloads the
//! client sends back. Field names follow the node protocol (camelCase) except
//! for the two host-gateway packets, which arrive in gateway form
//! (snake_case).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// A playable track reference.
///
/// A track with no `encoded` payload is unresolved: it carries metadata only
/// (typically from an external catalog) and must be resolved through a search
/// before playback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Opaque encoded payload understood by the node; `None` until resolved
    pub encoded: Option<String>,
    /// Descriptive metadata; immutable once resolved
    pub info: TrackInfo,
    /// Plugin-supplied extras, passed through verbatim
    #[serde(default)]
    pub plugin_info: Value,
    /// Arbitrary user data attached by the host application
    #[serde(default)]
    pub user_data: Value,
}

/// Descriptive track metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    #[serde(default)]
    pub is_seekable: bool,
    pub author: String,
    /// Duration in milliseconds (0 when unknown)
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub is_stream: bool,
    #[serde(default)]
    pub position: u64,
    pub title: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub source_name: String,
    /// Who requested this track; attached client-side, never sent by nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<Value>,
}

/// Result of a `/loadtracks` request
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "lowercase")]
pub enum LoadResult {
    /// A single track was loaded from a direct identifier
    Track(Track),
    /// A playlist was loaded
    Playlist(PlaylistData),
    /// A search produced zero or more candidates
    Search(Vec<Track>),
    /// Nothing matched the identifier
    Empty {},
    /// The node failed to load the identifier
    Error(LoadError),
}

impl LoadResult {
    /// All tracks carried by this result, in order
    pub fn into_tracks(self) -> Vec<Track> {
        match self {
            LoadResult::Track(track) => vec![track],
            LoadResult::Playlist(playlist) => playlist.tracks,
            LoadResult::Search(tracks) => tracks,
            LoadResult::Empty {} | LoadResult::Error(_) => Vec::new(),
        }
    }
}

/// Playlist payload of a `/loadtracks` response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistData {
    pub info: PlaylistInfo,
    #[serde(default)]
    pub plugin_info: Value,
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    /// Index of the selected track within the playlist, -1 if none
    #[serde(default)]
    pub selected_track: i64,
}

/// Error payload of a failed `/loadtracks` request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadError {
    #[serde(default)]
    pub message: Option<String>,
    pub severity: String,
    #[serde(default)]
    pub cause: Option<String>,
}

/// Statistics snapshot pushed periodically by a node.
///
/// Replaced wholesale on each stats frame, never partially merged.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

impl NodeStats {
    /// Load penalty used for node selection; lower is better.
    ///
    /// `players + round(1.05^(100*load) * 10 - 10) + deficit + nulled*2`.
    /// The exponential term is deliberately superlinear so that CPU load
    /// dominates quickly and new sessions avoid piling onto a hot node.
    pub fn penalty(&self) -> i64 {
        let cpu = (1.05f64.powf(100.0 * self.cpu.system_load) * 10.0 - 10.0).round() as i64;
        let mut penalty = i64::from(self.players) + cpu;
        if let Some(frames) = &self.frame_stats {
            penalty += frames.deficit + frames.nulled * 2;
        }
        penalty
    }

    /// CPU load normalized per core, as a percentage; used for region-local
    /// node ordering
    pub fn normalized_load(&self) -> f64 {
        if self.cpu.cores == 0 {
            return 0.0;
        }
        self.cpu.system_load / f64::from(self.cpu.cores) * 100.0
    }
}

/// Parsed inbound WebSocket frame
#[derive(Debug, Clone)]
pub enum IncomingFrame {
    Ready(ReadyFrame),
    Stats(NodeStats),
    PlayerUpdate(PlayerUpdateFrame),
    Event(PlayerEvent),
}

/// Parse a raw frame; returns `None` for frames without an operation tag or
/// with an unknown one (they are dropped, not errors).
pub fn parse_frame(text: &str) -> Result<Option<IncomingFrame>> {
    let value: Value = serde_json::from_str(text)?;
    let Some(op) = value.get("op").and_then(Value::as_str) else {
        return Ok(None);
    };
    let frame = match op {
        "ready" => IncomingFrame::Ready(serde_json::from_value(value)?),
        "stats" => IncomingFrame::Stats(serde_json::from_value(value)?),
        "playerUpdate" => IncomingFrame::PlayerUpdate(serde_json::from_value(value)?),
        "event" => IncomingFrame::Event(serde_json::from_value(value)?),
        _ => return Ok(None),
    };
    Ok(Some(frame))
}

/// Session handshake frame, first frame after a connection opens
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyFrame {
    pub resumed: bool,
    pub session_id: String,
}

/// Periodic per-player state snapshot
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdateFrame {
    pub guild_id: String,
    pub state: PlayerUpdateState,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdateState {
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub connected: bool,
    /// Voice gateway round-trip time; -1 when not connected
    #[serde(default = "default_ping")]
    pub ping: i64,
}

fn default_ping() -> i64 {
    -1
}

/// Player-scoped events pushed by a node
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    #[serde(rename = "TrackStartEvent", rename_all = "camelCase")]
    TrackStart { guild_id: String, track: Track },

    #[serde(rename = "TrackEndEvent", rename_all = "camelCase")]
    TrackEnd {
        guild_id: String,
        track: Track,
        reason: TrackEndReason,
    },

    #[serde(rename = "TrackExceptionEvent", rename_all = "camelCase")]
    TrackException {
        guild_id: String,
        track: Track,
        exception: TrackException,
    },

    #[serde(rename = "TrackStuckEvent", rename_all = "camelCase")]
    TrackStuck {
        guild_id: String,
        track: Track,
        threshold_ms: u64,
    },

    #[serde(rename = "WebSocketClosedEvent", rename_all = "camelCase")]
    WebSocketClosed {
        guild_id: String,
        code: u16,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        by_remote: bool,
    },
}

impl PlayerEvent {
    /// Guild the event belongs to
    pub fn guild_id(&self) -> &str {
        match self {
            PlayerEvent::TrackStart { guild_id, .. }
            | PlayerEvent::TrackEnd { guild_id, .. }
            | PlayerEvent::TrackException { guild_id, .. }
            | PlayerEvent::TrackStuck { guild_id, .. }
            | PlayerEvent::WebSocketClosed { guild_id, .. } => guild_id,
        }
    }
}

/// Why a track stopped playing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Whether the end was a normal termination that should go through loop
    /// handling. Load failures and cleanup advance the queue directly;
    /// `replaced` means another play request already superseded this track.
    pub fn is_normal(self) -> bool {
        matches!(self, TrackEndReason::Finished | TrackEndReason::Stopped)
    }
}

/// Exception details attached to a `TrackExceptionEvent`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    #[serde(default)]
    pub message: Option<String>,
    pub severity: String,
    #[serde(default)]
    pub cause: Option<String>,
}

/// Body of a `PATCH /sessions/{sessionId}/players/{guildId}` request.
///
/// Only fields that are set are serialized, so a payload mutates exactly the
/// state it names. Filters are passed through verbatim; this client never
/// interprets them.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayerPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdatePlayerTrack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceUpdatePayload>,
}

/// Track half of an update payload; `encoded: None` serializes as an explicit
/// null, which tells the node to stop the current track
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayerTrack {
    pub encoded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Value>,
}

/// Combined voice handshake forwarded to the node once both gateway halves
/// have arrived
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceUpdatePayload {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

/// Raw voice-state-update packet from the host's gateway connection
/// (gateway field casing, hence no rename)
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceStateUpdate {
    pub guild_id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    pub user_id: String,
    pub session_id: String,
}

/// Raw voice-server-update packet from the host's gateway connection
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceServerUpdate {
    pub guild_id: String,
    pub token: String,
    /// `None` while the voice server is being reallocated; a populated value
    /// always follows in a later packet
    #[serde(default)]
    pub endpoint: Option<String>,
}
