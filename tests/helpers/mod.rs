//! Test helper modules for tidelink integration tests
//!
//! Provides reusable test infrastructure components:
//! - MockNode: a local audio node (WebSocket + REST) under test control
//! - EventStream: timeout-based waiters over the client event bus

#![allow(dead_code)]

pub mod mock_node;

pub use mock_node::{stats_frame, CapturedRequest, MockNode, WsSession, PASSWORD};

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::broadcast;

use tidelink::{Client, ClientConfig, ClientEvent};

pub const BOT_USER_ID: &str = "1234567890";

/// A client wired to one mock node, with the gateway callback captured
pub struct TestContext {
    pub client: Client,
    pub node: MockNode,
    pub events: EventStream,
    /// Packets the client asked the host to forward to its gateway
    pub gateway: Arc<StdMutex<Vec<Value>>>,
}

/// Start a mock node and a client pointed at it. The event subscription is
/// created before the node is added so the connect sequence is observable.
pub async fn setup(config: ClientConfig) -> TestContext {
    let node = MockNode::start().await;
    let gateway: Arc<StdMutex<Vec<Value>>> = Arc::new(StdMutex::new(Vec::new()));
    let captured = Arc::clone(&gateway);
    let client = Client::new(
        config,
        BOT_USER_ID,
        Arc::new(move |packet| captured.lock().unwrap().push(packet)),
    )
    .expect("client construction");

    let events = EventStream {
        receiver: client.subscribe(),
    };
    client.add_node(node.config("mock")).await.expect("add node");

    TestContext {
        client,
        node,
        events,
        gateway,
    }
}

/// Block until the named node has completed its ready handshake
pub async fn wait_until_ready(client: &Client, name: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(node) = client.node(name).await {
            if node.session_id().await.is_some() {
                return;
            }
        }
        if Instant::now() >= deadline {
            panic!("node {name} did not become ready within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receiver over the client event bus with timeout-based waiters
pub struct EventStream {
    pub receiver: broadcast::Receiver<ClientEvent>,
}

impl EventStream {
    /// Wait for the next event with a timeout
    pub async fn next_timeout(&mut self, timeout: Duration) -> Option<ClientEvent> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Ok(event)) => Some(event),
            _ => None,
        }
    }

    /// Wait for the first event of the given type, discarding others
    pub async fn wait_for(&mut self, event_type: &str, timeout: Duration) -> ClientEvent {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.receiver.recv()).await {
                Ok(Ok(event)) if event.event_type() == event_type => return event,
                Ok(Ok(_)) => {}
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) => panic!("event bus closed"),
                Err(_) => panic!("timed out waiting for {event_type} event"),
            }
        }
    }

    /// Assert that no event of the given type arrives within the window
    pub async fn expect_none(&mut self, event_type: &str, window: Duration) {
        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.receiver.recv()).await {
                Ok(Ok(event)) if event.event_type() == event_type => {
                    panic!("unexpected {event_type} event: {event:?}");
                }
                Ok(Ok(_)) => {}
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return,
            }
        }
    }
}
