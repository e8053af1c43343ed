//! Voice handshake correlation and track resolution integration tests

mod helpers;

use std::time::Duration;

use serde_json::json;
use tidelink::{ClientConfig, ConnectionOptions};

use helpers::TestContext;

const WAIT: Duration = Duration::from_secs(5);

async fn ready_context() -> TestContext {
    let ctx = helpers::setup(ClientConfig::default()).await;
    helpers::wait_until_ready(&ctx.client, "mock", WAIT).await;
    ctx
}

fn state_packet(channel_id: Option<&str>) -> serde_json::Value {
    json!({
        "t": "VOICE_STATE_UPDATE",
        "d": {
            "guild_id": "g1",
            "channel_id": channel_id,
            "user_id": helpers::BOT_USER_ID,
            "session_id": "voice-session"
        }
    })
}

fn server_packet(token: &str) -> serde_json::Value {
    json!({
        "t": "VOICE_SERVER_UPDATE",
        "d": {
            "guild_id": "g1",
            "token": token,
            "endpoint": "rotterdam123.example.gg"
        }
    })
}

#[tokio::test]
async fn test_complete_voice_pair_is_forwarded_exactly_once() {
    let ctx = ready_context().await;
    let _player = ctx
        .client
        .create_connection(ConnectionOptions::new("g1", "c1"))
        .await
        .expect("create connection");

    ctx.client.handle_raw_packet(&state_packet(Some("c1"))).await;
    ctx.client.handle_raw_packet(&server_packet("tok")).await;

    let request = ctx
        .node
        .wait_for_request(WAIT, |r| r.method == "PATCH" && r.body["voice"].is_object())
        .await;
    assert_eq!(request.path, "/v4/sessions/mock-session-1/players/g1");
    assert_eq!(request.body["voice"]["token"], "tok");
    assert_eq!(request.body["voice"]["sessionId"], "voice-session");
    assert_eq!(request.body["voice"]["endpoint"], "rotterdam123.example.gg");

    // A repeated state half must not re-send the same pair.
    ctx.client.handle_raw_packet(&state_packet(Some("c1"))).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let voice_updates = ctx
        .node
        .requests()
        .await
        .into_iter()
        .filter(|r| r.method == "PATCH" && r.body["voice"].is_object())
        .count();
    assert_eq!(voice_updates, 1);
}

#[tokio::test]
async fn test_fresh_server_half_resends_voice_session() {
    let ctx = ready_context().await;
    let _player = ctx
        .client
        .create_connection(ConnectionOptions::new("g1", "c1"))
        .await
        .expect("create connection");

    ctx.client.handle_raw_packet(&state_packet(Some("c1"))).await;
    ctx.client.handle_raw_packet(&server_packet("tok1")).await;
    ctx.client.handle_raw_packet(&server_packet("tok2")).await;

    let second = ctx
        .node
        .wait_for_requests(2, WAIT, |r| r.method == "PATCH" && r.body["voice"].is_object())
        .await;
    assert_eq!(second.body["voice"]["token"], "tok2");
}

#[tokio::test]
async fn test_cleared_channel_pauses_playback() {
    let ctx = ready_context().await;
    let player = ctx
        .client
        .create_connection(ConnectionOptions::new("g1", "c1"))
        .await
        .expect("create connection");
    assert!(player.is_connected());

    ctx.client.handle_raw_packet(&state_packet(None)).await;

    let request = ctx
        .node
        .wait_for_request(WAIT, |r| r.method == "PATCH" && r.body["paused"] == true)
        .await;
    assert!(request.path.ends_with("/players/g1"));
    assert!(!player.is_connected());
    assert!(player.voice_channel_id().await.is_none());
}

#[tokio::test]
async fn test_resolve_prefixes_search_queries() {
    let ctx = ready_context().await;
    ctx.node
        .set_load_response(json!({
            "loadType": "search",
            "data": [
                { "encoded": "ZZZ", "info": { "identifier": "id", "author": "Artist", "title": "Song" } }
            ]
        }))
        .await;

    let result = ctx
        .client
        .resolve("hello world", Some(json!({ "id": "42" })))
        .await
        .expect("resolve");
    let tracks = result.into_tracks();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].encoded.as_deref(), Some("ZZZ"));
    assert_eq!(tracks[0].info.requester, Some(json!({ "id": "42" })));

    let request = ctx
        .node
        .wait_for_request(WAIT, |r| r.path == "/v4/loadtracks")
        .await;
    assert!(
        request.query.contains("ytsearch%3Ahello"),
        "got query {}",
        request.query
    );
}

#[tokio::test]
async fn test_resolve_passes_urls_through_unprefixed() {
    let ctx = ready_context().await;
    ctx.client
        .resolve("https://example.com/track", None)
        .await
        .expect("resolve");

    let request = ctx
        .node
        .wait_for_request(WAIT, |r| r.path == "/v4/loadtracks")
        .await;
    assert!(
        request.query.contains("https%3A%2F%2Fexample.com%2Ftrack"),
        "got query {}",
        request.query
    );
    assert!(!request.query.contains("ytsearch"));
}
