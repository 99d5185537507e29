//! Cross-server tests: several gateways sharing one bus.

mod common;

use std::sync::Arc;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Duration;

use common::{eventually, ServerBuilder, TestClient};
use flux_sync::{
    AwarenessUpdate, BusHub, Frame, MemoryBroker, MemoryBus, Relay, RelayConfig, RelayPersistence,
    RemoteBus, RemoteBusConfig,
};

fn relay_config() -> RelayConfig {
    RelayConfig {
        health_interval: Duration::from_millis(50),
        ..RelayConfig::default()
    }
}

/// A gateway builder relaying through `broker`, plus its relay and bus.
fn on_broker(broker: &MemoryBroker) -> (ServerBuilder, Arc<Relay>, Arc<MemoryBus>) {
    let bus = Arc::new(broker.client());
    let relay = Arc::new(Relay::new(bus.clone(), relay_config()));
    let builder = ServerBuilder {
        relay: Some(relay.clone()),
        ..ServerBuilder::default()
    };
    (builder, relay, bus)
}

#[tokio::test]
async fn test_updates_cross_servers() {
    let broker = MemoryBroker::new();
    let (one, _, _) = on_broker(&broker);
    let (two, _, _) = on_broker(&broker);
    let one = one.start().await;
    let two = two.start().await;

    let mut alice = TestClient::join(&one.url, "shared").await;
    let mut bob = TestClient::join(&two.url, "shared").await;

    alice.insert(0, "from one").await;
    assert!(bob.wait_for_text("from one").await, "bob saw {:?}", bob.text());

    bob.insert(8, ", two").await;
    assert!(alice.wait_for_text("from one, two").await);
}

#[tokio::test]
async fn test_relayed_updates_are_not_republished() {
    let broker = MemoryBroker::new();
    let (one, relay_one, bus_one) = on_broker(&broker);
    let (two, relay_two, bus_two) = on_broker(&broker);
    let one = one.start().await;
    let two = two.start().await;

    let mut alice = TestClient::join(&one.url, "loop").await;
    let mut bob = TestClient::join(&two.url, "loop").await;
    alice.insert(0, "a").await;
    assert!(bob.wait_for_text("a").await);
    bob.insert(1, "b").await;
    assert!(alice.wait_for_text("ab").await);

    // Each side published its handshake reply and one edit, nothing else.
    let published = (bus_one.published(), bus_two.published());
    assert_eq!(published, (2, 2));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!((bus_one.published(), bus_two.published()), published);

    let stats = relay_one.stats();
    assert_eq!(stats.published, 2);
    assert!(stats.suppressed >= 2);
    assert!(stats.applied >= 1);
    assert!(relay_two.stats().applied >= 1);
}

#[tokio::test]
async fn test_presence_crosses_servers() {
    let broker = MemoryBroker::new();
    let (one, _, _) = on_broker(&broker);
    let (two, relay_two, _) = on_broker(&broker);
    let one = one.start().await;
    let two = two.start().await;

    let mut alice = TestClient::join(&one.url, "cursors").await;
    let mut bob = TestClient::join(&two.url, "cursors").await;

    alice.set_presence(json!({ "name": "ann" })).await;
    let frame = bob
        .recv_until(|f| matches!(f, Frame::Awareness(_)))
        .await
        .expect("presence relayed");
    let Frame::Awareness(payload) = frame else {
        unreachable!()
    };
    let update = AwarenessUpdate::decode(&payload).unwrap();
    let alice_id = update.entries[0].client;
    assert_eq!(
        AwarenessUpdate::state_of(&update.entries[0]),
        Some(json!({ "name": "ann" }))
    );

    // The presence hash is written right after the publish.
    let field = alice_id.to_string();
    let mut shared = None;
    for _ in 0..100 {
        shared = relay_two.presence("cursors").await.unwrap().remove(&field);
        if shared.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(shared, Some(json!({ "name": "ann" })));

    alice.ws.close(None).await.unwrap();
    drop(alice);
    let removal = bob
        .recv_until(|f| match f {
            Frame::Awareness(payload) => AwarenessUpdate::decode(payload)
                .map(|u| u.entries.iter().any(|e| e.client == alice_id && e.state.is_none()))
                .unwrap_or(false),
            _ => false,
        })
        .await;
    assert!(removal.is_some(), "removal did not cross servers");
    let mut cleared = false;
    for _ in 0..100 {
        cleared = relay_two.presence("cursors").await.unwrap().is_empty();
        if cleared {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cleared, "presence hash still holds alice");
}

#[tokio::test]
async fn test_bus_outage_keeps_local_sync_and_recovers() {
    let broker = MemoryBroker::new();
    let (one, _, _) = on_broker(&broker);
    let (two, _, _) = on_broker(&broker);
    let one = one.start().await;
    let two = two.start().await;

    let mut alice = TestClient::join(&one.url, "doc").await;
    let mut carol = TestClient::join(&one.url, "doc").await;
    let mut bob = TestClient::join(&two.url, "doc").await;

    broker.set_available(false);
    alice.insert(0, "local").await;
    assert!(carol.wait_for_text("local").await, "local peers must still converge");

    let gateway = one.gateway.clone();
    assert!(eventually(|| gateway.stats().relay.is_some_and(|r| r.degraded)).await);
    assert!(bob.is_quiet(Duration::from_millis(200)).await);
    assert_eq!(bob.text(), "");

    broker.set_available(true);
    assert!(eventually(|| gateway.stats().relay.is_some_and(|r| !r.degraded)).await);
    assert!(bob.wait_for_text("local").await, "bob saw {:?}", bob.text());
}

#[tokio::test]
async fn test_server_that_lost_its_link_pulls_missed_updates() {
    let broker = MemoryBroker::new();
    let (one, _, _) = on_broker(&broker);
    let (two, relay_two, bus_two) = on_broker(&broker);
    let one = one.start().await;
    let two = two.start().await;

    let mut alice = TestClient::join(&one.url, "apart").await;
    let mut bob = TestClient::join(&two.url, "apart").await;

    // Only the second server loses its link, and with it its subscriptions.
    bus_two.set_linked(false);
    assert!(relay_two.is_degraded());
    alice.insert(0, "while apart").await;
    assert!(bob.is_quiet(Duration::from_millis(200)).await);
    assert_eq!(bob.text(), "");

    bus_two.set_linked(true);
    assert!(bob.wait_for_text("while apart").await, "bob saw {:?}", bob.text());
    assert!(relay_two.stats().resyncs >= 1);

    bob.insert(11, "!").await;
    assert!(alice.wait_for_text("while apart!").await, "alice saw {:?}", alice.text());
}

#[tokio::test]
async fn test_shared_snapshot_hands_document_over() {
    let broker = MemoryBroker::new();
    let (one, relay_one, _) = on_broker(&broker);
    let one = ServerBuilder {
        persistence: Arc::new(RelayPersistence::new(relay_one)),
        ..one
    }
    .start()
    .await;

    let mut alice = TestClient::join(&one.url, "handoff").await;
    alice.insert(0, "carried over").await;
    alice.send(Frame::QueryAwareness).await;
    alice
        .recv_until(|f| matches!(f, Frame::Awareness(_)))
        .await
        .unwrap();
    one.stop().await;

    let (two, relay_two, _) = on_broker(&broker);
    let two = ServerBuilder {
        persistence: Arc::new(RelayPersistence::new(relay_two)),
        ..two
    }
    .start()
    .await;
    let bob = TestClient::join(&two.url, "handoff").await;
    assert_eq!(bob.text(), "carried over");
}

#[tokio::test]
async fn test_gateways_relay_through_hub() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hub_url = format!("ws://{}", listener.local_addr().unwrap());
    let (hub_shutdown, hub_rx) = watch::channel(false);
    let hub = tokio::spawn(BusHub::new("unused").serve(listener, hub_rx));

    let mut servers = Vec::new();
    for _ in 0..2 {
        let bus = Arc::new(RemoteBus::connect(RemoteBusConfig {
            url: hub_url.clone(),
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(200),
            ..RemoteBusConfig::default()
        }));
        let connected = bus.clone();
        assert!(eventually(|| connected.is_connected()).await, "hub unreachable");
        let relay = Arc::new(Relay::new(bus, relay_config()));
        let server = ServerBuilder {
            relay: Some(relay),
            ..ServerBuilder::default()
        }
        .start()
        .await;
        servers.push(server);
    }

    let mut alice = TestClient::join(&servers[0].url, "remote").await;
    let mut bob = TestClient::join(&servers[1].url, "remote").await;

    alice.insert(0, "over the hub").await;
    assert!(bob.wait_for_text("over the hub").await, "bob saw {:?}", bob.text());
    bob.insert(0, ">> ").await;
    assert!(alice.wait_for_text(">> over the hub").await);

    for server in servers {
        server.stop().await;
    }
    hub_shutdown.send_replace(true);
    tokio::time::timeout(Duration::from_secs(2), hub)
        .await
        .unwrap()
        .unwrap();
}
