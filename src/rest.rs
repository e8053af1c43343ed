//! Per-node REST client
//!
//! Thin, stateless request wrapper bound to one node: every call is a single
//! awaited request with the node's auth header, no retry logic. All failures
//! surface as typed errors uniformly (GET/PATCH/POST/DELETE alike); callers
//! that are best-effort, like destroying a player during teardown, log and
//! drop the error at the call site.

use std::sync::Arc;

use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::model::{LoadResult, Track, UpdatePlayerPayload};

const REQUEST_TIMEOUT_SECS: u64 = 15;

/// HTTP client for one node's REST API
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    /// `{scheme}://{host}:{port}` without the API prefix
    origin: String,
    /// `{origin}/v4`
    base_url: String,
    password: String,
    /// Session id from the node's ready frame; player-scoped paths are
    /// unavailable until it is set
    session_id: Arc<RwLock<Option<String>>>,
}

impl RestClient {
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let scheme = if config.secure { "https" } else { "http" };
        Ok(Self {
            base_url: config.rest_url(),
            origin: format!("{}://{}:{}", scheme, config.host, config.port),
            password: config.password.clone(),
            session_id: Arc::new(RwLock::new(None)),
            http,
        })
    }

    /// Store the session id announced by the node's ready frame
    pub async fn set_session_id(&self, session_id: String) {
        *self.session_id.write().await = Some(session_id);
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    /// Update a player's state; `no_replace` keeps a currently playing track
    /// in place instead of replacing it
    pub async fn update_player(
        &self,
        guild_id: &str,
        payload: &UpdatePlayerPayload,
        no_replace: bool,
    ) -> Result<Value> {
        let path = self.player_path(guild_id).await?;
        let no_replace = if no_replace { "true" } else { "false" };
        let body = serde_json::to_value(payload)?;
        let response = self
            .request(Method::PATCH, &path, &[("noReplace", no_replace)], Some(body))
            .await?;
        Ok(response.unwrap_or(Value::Null))
    }

    /// Destroy a player on the node
    pub async fn destroy_player(&self, guild_id: &str) -> Result<()> {
        let path = self.player_path(guild_id).await?;
        self.request(Method::DELETE, &path, &[], None).await?;
        Ok(())
    }

    /// Fetch one player's server-side state
    pub async fn get_player(&self, guild_id: &str) -> Result<Value> {
        let path = self.player_path(guild_id).await?;
        let response = self.request(Method::GET, &path, &[], None).await?;
        response.ok_or(Error::Api {
            status: 200,
            message: "empty player response".to_string(),
        })
    }

    /// Fetch all players known to this node's session
    pub async fn get_players(&self) -> Result<Vec<Value>> {
        let path = self.session_path("/players").await?;
        let response = self.request(Method::GET, &path, &[], None).await?;
        Ok(serde_json::from_value(response.unwrap_or(Value::Array(vec![])))?)
    }

    /// Configure server-side session resuming
    pub async fn update_session(&self, resuming: bool, timeout_secs: u64) -> Result<()> {
        let path = self.session_path("").await?;
        let body = json!({ "resuming": resuming, "timeout": timeout_secs });
        self.request(Method::PATCH, &path, &[], Some(body)).await?;
        Ok(())
    }

    /// Resolve an identifier (URL or `platform:query` search) into tracks
    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        let response = self
            .request(Method::GET, "/loadtracks", &[("identifier", identifier)], None)
            .await?;
        let response = response.ok_or(Error::Api {
            status: 200,
            message: "empty loadtracks response".to_string(),
        })?;
        Ok(serde_json::from_value(response)?)
    }

    /// Decode a single encoded track payload back into track metadata
    pub async fn decode_track(&self, encoded: &str) -> Result<Track> {
        let response = self
            .request(Method::GET, "/decodetrack", &[("encodedTrack", encoded)], None)
            .await?;
        let response = response.ok_or(Error::Api {
            status: 200,
            message: "empty decodetrack response".to_string(),
        })?;
        Ok(serde_json::from_value(response)?)
    }

    /// Decode a batch of encoded track payloads
    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<Track>> {
        let response = self
            .request(Method::POST, "/decodetracks", &[], Some(json!(encoded)))
            .await?;
        Ok(serde_json::from_value(response.unwrap_or(Value::Array(vec![])))?)
    }

    /// Node capability and plugin information
    pub async fn get_info(&self) -> Result<Value> {
        let response = self.request(Method::GET, "/info", &[], None).await?;
        response.ok_or(Error::Api {
            status: 200,
            message: "empty info response".to_string(),
        })
    }

    /// Node version string (served outside the API prefix)
    pub async fn get_version(&self) -> Result<String> {
        let url = format!("{}/version", self.origin);
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, self.password.as_str())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.text().await?)
    }

    /// Route planner status; `None` when no route planner is configured
    pub async fn routeplanner_status(&self) -> Result<Option<Value>> {
        self.request(Method::GET, "/routeplanner/status", &[], None).await
    }

    /// Unmark a single failed route planner address
    pub async fn unmark_failed_address(&self, address: &str) -> Result<()> {
        let body = json!({ "address": address });
        self.request(Method::POST, "/routeplanner/free/address", &[], Some(body))
            .await?;
        Ok(())
    }

    /// Unmark all failed route planner addresses
    pub async fn unmark_all_failed_addresses(&self) -> Result<()> {
        self.request(Method::POST, "/routeplanner/free/all", &[], None).await?;
        Ok(())
    }

    async fn player_path(&self, guild_id: &str) -> Result<String> {
        self.session_path(&format!("/players/{guild_id}")).await
    }

    async fn session_path(&self, suffix: &str) -> Result<String> {
        let session = self.session_id.read().await.clone().ok_or(Error::NoSession)?;
        Ok(format!("/sessions/{session}{suffix}"))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Option<Value>> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "node rest request");

        let mut request = self
            .http
            .request(method, &url)
            .header(reqwest::header::AUTHORIZATION, self.password.as_str())
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}
