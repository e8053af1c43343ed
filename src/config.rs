//! Client and node configuration

use serde::Deserialize;

/// Version string advertised in the `Client-Name` connection header.
pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pool-wide client configuration
///
/// All fields have working defaults; hosts typically override the reconnect
/// policy and the default search platform.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Name advertised to nodes as `Client-Name: {client_name}/{version}`
    pub client_name: String,
    /// Delay between reconnect attempts, in milliseconds
    pub reconnect_delay_ms: u64,
    /// Maximum reconnect attempts before a node is considered permanently failed
    pub reconnect_tries: u32,
    /// Whether to configure server-side session resuming on each node
    pub resume: bool,
    /// Server-side session retention window, in seconds
    pub resume_timeout_secs: u64,
    /// Search platform prefix used when a query is not a URL (e.g. `ytsearch`)
    pub default_platform: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "tidelink".to_string(),
            reconnect_delay_ms: 10_000,
            reconnect_tries: 5,
            resume: false,
            resume_timeout_secs: 60,
            default_platform: "ytsearch".to_string(),
        }
    }
}

/// Per-node network configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Unique node name within the pool
    pub name: String,
    /// Hostname or IP of the node
    pub host: String,
    /// Port of the node
    pub port: u16,
    /// Use wss/https instead of ws/http
    #[serde(default)]
    pub secure: bool,
    /// Shared secret sent as the `Authorization` header
    pub password: String,
    /// Voice regions this node should be preferred for (empty = no preference)
    #[serde(default)]
    pub regions: Vec<String>,
}

impl NodeConfig {
    /// Base URL for the node's REST API, e.g. `https://host:port/v4`
    pub fn rest_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}/v4", scheme, self.host, self.port)
    }

    /// URL for the node's WebSocket endpoint
    pub fn socket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.host, self.port)
    }
}
