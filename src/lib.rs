//! tidelink - node pool and player orchestration for Lavalink-style audio nodes
//!
//! This crate manages a pool of audio nodes on behalf of a bot application:
//! it keeps a WebSocket session open to each node, picks the least loaded
//! node for new voice connections, and drives one [`Player`] state machine
//! per guild (queue, loop modes, track-end advancement, node migration).
//!
//! The host application keeps ownership of its gateway connection. It feeds
//! voice-state and voice-server packets into the client and forwards the
//! join/leave packets the client hands back through its `send` callback;
//! tidelink itself only talks to the nodes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tidelink::{Client, ClientConfig, ConnectionOptions, NodeConfig};
//!
//! # async fn run() -> tidelink::Result<()> {
//! let client = Client::new(
//!     ClientConfig::default(),
//!     "187645061572444161",
//!     Arc::new(|packet| {
//!         // forward `packet` to the gateway connection
//!     }),
//! )?;
//!
//! client
//!     .add_node(NodeConfig {
//!         name: "main".into(),
//!         host: "localhost".into(),
//!         port: 2333,
//!         secure: false,
//!         password: "youshallnotpass".into(),
//!         regions: vec![],
//!     })
//!     .await?;
//!
//! let player = client
//!     .create_connection(ConnectionOptions::new("guild-id", "channel-id"))
//!     .await?;
//! let tracks = client.resolve("never gonna give you up", None).await?.into_tracks();
//! if let Some(track) = tracks.into_iter().next() {
//!     player.queue().lock().await.add(track);
//!     player.play().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod node;
pub mod player;
pub mod pool;
pub mod queue;
pub mod rest;
pub mod voice;

pub use config::{ClientConfig, NodeConfig, LIBRARY_VERSION};
pub use error::{Error, Result};
pub use events::ClientEvent;
pub use model::{LoadResult, NodeStats, Track, TrackEndReason, TrackInfo};
pub use node::{Node, NodeState};
pub use player::{LoopMode, Player};
pub use pool::{Client, ConnectionOptions, GatewaySender};
pub use queue::Queue;
pub use voice::VoiceConnection;
