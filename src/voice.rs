//! Voice session correlation
//!
//! The voice handshake arrives in two independent halves from the host's
//! gateway connection: a state update (session id, channel id) and a server
//! update (token, endpoint). A node can only be told about the voice session
//! once both halves are known, and must be told exactly once per complete
//! pair. [`VoiceConnection`] buffers the halves and decides when to forward;
//! the REST call itself happens at the caller so this stays a pure state
//! machine.

use serde_json::{json, Value};

use crate::model::{VoiceServerUpdate, VoiceStateUpdate, VoiceUpdatePayload};

/// What a state update asks the caller to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateOutcome {
    /// Bookkeeping only, nothing to forward
    None,
    /// Both halves are now complete; forward this payload to the node
    Forward(VoiceUpdatePayload),
    /// The channel id became null: the bot was disconnected or kicked
    ChannelCleared,
}

/// Buffered halves of the voice handshake for one player
#[derive(Debug, Default)]
pub struct VoiceConnection {
    pub session_id: Option<String>,
    pub token: Option<String>,
    pub endpoint: Option<String>,
    /// Region derived from the endpoint hostname, e.g. `rotterdam`
    pub region: Option<String>,
    pub channel_id: Option<String>,
    pub self_deaf: bool,
    pub self_mute: bool,
    /// Set when a server update arrives, cleared when the pair is forwarded.
    /// Guarantees exactly one forward per complete pair.
    unsent: bool,
}

impl VoiceConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest the server half (token + endpoint). Returns the combined
    /// payload when the session half is already known.
    pub fn server_update(&mut self, update: VoiceServerUpdate) -> Option<VoiceUpdatePayload> {
        let Some(endpoint) = update.endpoint else {
            // The voice server is being reallocated; a populated endpoint
            // follows in a later packet.
            return None;
        };
        self.region = Some(region_of(&endpoint));
        self.endpoint = Some(endpoint);
        self.token = Some(update.token);
        self.unsent = true;
        self.complete_payload()
    }

    /// Ingest the state half (session id + channel id). On its own this is
    /// bookkeeping; it only produces a payload when it completes a pair whose
    /// server half arrived first.
    pub fn state_update(&mut self, update: VoiceStateUpdate) -> StateOutcome {
        self.session_id = Some(update.session_id);
        match update.channel_id {
            Some(channel_id) => {
                self.channel_id = Some(channel_id);
                match self.complete_payload() {
                    Some(payload) => StateOutcome::Forward(payload),
                    None => StateOutcome::None,
                }
            }
            None => {
                self.channel_id = None;
                StateOutcome::ChannelCleared
            }
        }
    }

    /// Combined payload when both halves are present, for inclusion in a
    /// player restart after node migration. Does not consume the unsent latch.
    pub fn payload(&self) -> Option<VoiceUpdatePayload> {
        Some(VoiceUpdatePayload {
            token: self.token.clone()?,
            endpoint: self.endpoint.clone()?,
            session_id: self.session_id.clone()?,
        })
    }

    fn complete_payload(&mut self) -> Option<VoiceUpdatePayload> {
        if !self.unsent {
            return None;
        }
        let payload = self.payload()?;
        self.unsent = false;
        Some(payload)
    }
}

fn region_of(endpoint: &str) -> String {
    endpoint
        .split('.')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_ascii_digit())
        .collect()
}

/// Gateway packet requesting a voice channel join; sent through the host's
/// `send` callback
pub(crate) fn join_packet(
    guild_id: &str,
    channel_id: &str,
    self_deaf: bool,
    self_mute: bool,
) -> Value {
    json!({
        "op": 4,
        "d": {
            "guild_id": guild_id,
            "channel_id": channel_id,
            "self_deaf": self_deaf,
            "self_mute": self_mute,
        }
    })
}

/// Gateway packet requesting a voice channel leave
pub(crate) fn leave_packet(guild_id: &str) -> Value {
    json!({
        "op": 4,
        "d": {
            "guild_id": guild_id,
            "channel_id": Value::Null,
            "self_deaf": false,
            "self_mute": false,
        }
    })
}
