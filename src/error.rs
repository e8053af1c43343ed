//! Common error types for tidelink

use thiserror::Error;

/// Common result type for tidelink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the client.
///
/// Configuration errors are raised synchronously and are fatal to the calling
/// operation. Connectivity errors are handled internally by bounded reconnect
/// and only surface here once reconnection is exhausted. REST failures always
/// surface as errors; best-effort call sites (player teardown) log and ignore
/// them locally instead of swallowing them inside the client.
#[derive(Error, Debug)]
pub enum Error {
    /// No client user id was supplied at construction
    #[error("missing client user id")]
    MissingUserId,

    /// Configuration loading or validation error
    #[error("configuration error: {0}")]
    Config(String),

    /// Referenced node name is not registered in the pool
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// No connected node is available for selection
    #[error("no available nodes")]
    NoAvailableNodes,

    /// The node has not completed its ready handshake yet
    #[error("node session not established")]
    NoSession,

    /// Reconnection attempts for a node exceeded the configured maximum
    #[error("reconnect attempts exhausted for node {0}")]
    ReconnectExhausted(String),

    /// WebSocket transport error (wraps tungstenite)
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP transport error (wraps reqwest)
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Node REST API returned a non-success status
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },

    /// Frame or payload (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A queued track without an encoded payload could not be resolved
    #[error("failed to resolve track: {0}")]
    TrackResolveFailed(String),
}
