//! Client event types
//!
//! Everything observable about the pool is surfaced through one closed enum
//! broadcast on the client's event bus. There is no dynamic event-name
//! dispatch; consumers `match` on the variants and the compiler checks the
//! default arm.

use crate::model::{Track, TrackEndReason};

/// Events broadcast by the client.
///
/// Delivered via `tokio::sync::broadcast`; lagging receivers lose the oldest
/// events rather than blocking the dispatch path.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A node's WebSocket connection opened
    NodeConnect { node: String },
    /// A node's WebSocket connection closed (deliberately or not)
    NodeDisconnect { node: String, code: u16 },
    /// A node reported a transport or protocol error (observational only;
    /// reconnection is driven by the close path, never by this event)
    NodeError { node: String, message: String },
    /// A reconnect attempt was scheduled for a node
    NodeReconnect { node: String, attempt: u32 },
    /// Non-fatal diagnostic conditions, independent of whether an error was
    /// also returned to a caller
    Debug { message: String },

    /// A player was created for a guild
    PlayerCreate { guild_id: String },
    /// A player was destroyed and removed from the registry
    PlayerDestroy { guild_id: String },
    /// The node pushed a position/ping snapshot for a player
    PlayerUpdate {
        guild_id: String,
        position: u64,
        ping: i64,
        connected: bool,
    },

    /// A track started playing
    TrackStart { guild_id: String, track: Track },
    /// A track stopped playing
    TrackEnd {
        guild_id: String,
        track: Track,
        reason: TrackEndReason,
    },
    /// A track got stuck or raised an exception and was skipped
    TrackError { guild_id: String, message: String },
    /// The queue ran out of tracks
    QueueEnd { guild_id: String },

    /// The voice WebSocket between the node and the voice server closed
    SocketClosed {
        guild_id: String,
        code: u16,
        reason: String,
    },
}

impl ClientEvent {
    /// Event type name, mostly useful for filtering in tests and log output
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::NodeConnect { .. } => "NodeConnect",
            ClientEvent::NodeDisconnect { .. } => "NodeDisconnect",
            ClientEvent::NodeError { .. } => "NodeError",
            ClientEvent::NodeReconnect { .. } => "NodeReconnect",
            ClientEvent::Debug { .. } => "Debug",
            ClientEvent::PlayerCreate { .. } => "PlayerCreate",
            ClientEvent::PlayerDestroy { .. } => "PlayerDestroy",
            ClientEvent::PlayerUpdate { .. } => "PlayerUpdate",
            ClientEvent::TrackStart { .. } => "TrackStart",
            ClientEvent::TrackEnd { .. } => "TrackEnd",
            ClientEvent::TrackError { .. } => "TrackError",
            ClientEvent::QueueEnd { .. } => "QueueEnd",
            ClientEvent::SocketClosed { .. } => "SocketClosed",
        }
    }
}
