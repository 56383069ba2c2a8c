//! End-to-end scenarios across the coordinator path and the relay path.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use widgetbus_core::{
    serve, ChannelRegistry, CoordinatorRouter, HubConfig, MemoryStore, RelayClient, RoomHub,
};
use widgetbus_transport::MemoryConnection;

type Seen = mpsc::UnboundedReceiver<(Value, String)>;

fn recorder() -> (impl Fn(&Value, &str) + Send + Sync + 'static, Seen) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |message: &Value, sender: &str| {
        let _ = tx.send((message.clone(), sender.to_string()));
    };
    (handler, rx)
}

async fn expect(seen: &mut Seen) -> (Value, String) {
    tokio::time::timeout(Duration::from_secs(1), seen.recv())
        .await
        .expect("handler was not invoked")
        .expect("handler dropped")
}

/// Fails on any delivery. A closed channel means the handler was dropped,
/// which counts as nothing delivered.
async fn expect_nothing(seen: &mut Seen) {
    let outcome = tokio::time::timeout(Duration::from_millis(50), seen.recv()).await;
    assert!(
        matches!(outcome, Err(_) | Ok(None)),
        "unexpected delivery: {:?}",
        outcome
    );
}

/// A relay client connected to `hub` through an in-memory pipe.
fn relay_to(hub: &Arc<RoomHub>) -> RelayClient {
    let (client, server) = MemoryConnection::pair();
    tokio::spawn(serve(Box::new(server), hub.clone()));
    RelayClient::new(Box::new(client))
}

#[tokio::test]
async fn test_widgets_exchange_through_coordinator() {
    let coordinator = CoordinatorRouter::spawn();
    let a = ChannelRegistry::connect(coordinator.attach());
    let b = ChannelRegistry::connect(coordinator.attach());

    let uid_a = a.ready().await.unwrap();
    let uid_b = b.ready().await.unwrap();
    assert_ne!(uid_a, uid_b);

    let (handler, mut seen) = recorder();
    a.subscribe("ping", handler).unwrap();

    b.publish("ping", json!("hi")).unwrap();
    assert_eq!(expect(&mut seen).await, (json!("hi"), uid_b));

    // A never hears its own publish through the coordinator.
    a.publish("ping", json!("me")).unwrap();
    expect_nothing(&mut seen).await;

    // Resubscribe with a handler whose sender outlives the unsubscribe.
    let (tx, mut seen) = mpsc::unbounded_channel();
    let kept = tx.clone();
    a.subscribe("ping", move |message: &Value, sender: &str| {
        let _ = tx.send((message.clone(), sender.to_string()));
    })
    .unwrap();
    assert!(a.unsubscribe("ping"));
    assert!(!a.unsubscribe("ping"));
    b.publish("ping", json!("again")).unwrap();
    expect_nothing(&mut seen).await;
    drop(kept);
}

#[tokio::test]
async fn test_rooms_and_users_across_clients() {
    let hub = Arc::new(RoomHub::new(HubConfig::default(), Arc::new(MemoryStore::new())));
    let c1 = relay_to(&hub);
    let c2 = relay_to(&hub);

    c1.set_username("alice").unwrap();
    assert_eq!(c1.username().await.unwrap(), "alice");

    c2.switch_room("ops").unwrap();
    assert_eq!(c2.current_room().await.unwrap(), "ops");

    assert_eq!(c1.all_rooms().await.unwrap(), vec!["ops".to_string()]);
    assert_eq!(c2.all_users().await.unwrap(), vec!["anonymous".to_string()]);
    assert_eq!(c1.all_users().await.unwrap(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn test_publish_crosses_browsers_via_relay() {
    let hub = Arc::new(RoomHub::new(HubConfig::default(), Arc::new(MemoryStore::new())));

    // Two hosts, each with its own coordinator and one widget.
    let first = CoordinatorRouter::spawn();
    let second = CoordinatorRouter::spawn();
    let a = ChannelRegistry::with_relay(first.attach(), relay_to(&hub));
    let b = ChannelRegistry::with_relay(second.attach(), relay_to(&hub));
    let uid_a = a.ready().await.unwrap();
    b.ready().await.unwrap();

    let (handler, mut seen) = recorder();
    b.subscribe("ping", handler).unwrap();

    // Both relays must be in the hub before the publish goes out.
    for registry in [&a, &b] {
        let relay = registry.relay().unwrap();
        assert_eq!(relay.current_room().await.unwrap(), "default");
    }

    a.publish("ping", json!({"n": 1})).unwrap();
    assert_eq!(expect(&mut seen).await, (json!({"n": 1}), uid_a));

    // A widget in another room hears nothing.
    b.relay().unwrap().switch_room("ops").unwrap();
    assert_eq!(b.relay().unwrap().current_room().await.unwrap(), "ops");
    a.publish("ping", json!({"n": 2})).unwrap();
    expect_nothing(&mut seen).await;
    assert_eq!(a.relay().unwrap().current_room().await.unwrap(), "default");

    let history = hub.store().history("default", 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].timestamp <= history[1].timestamp);
}

#[tokio::test]
async fn test_server_message_reaches_sibling_widgets() {
    let hub = Arc::new(RoomHub::new(HubConfig::default(), Arc::new(MemoryStore::new())));

    let first = CoordinatorRouter::spawn();
    let a = ChannelRegistry::with_relay(first.attach(), relay_to(&hub));
    let uid_a = a.ready().await.unwrap();

    // Second host: B talks to the server, its sibling S does not.
    let second = CoordinatorRouter::spawn();
    let b = ChannelRegistry::with_relay(second.attach(), relay_to(&hub));
    let s = ChannelRegistry::connect(second.attach());
    b.ready().await.unwrap();
    s.ready().await.unwrap();

    let (on_b, mut seen_b) = recorder();
    let (on_s, mut seen_s) = recorder();
    b.subscribe("ping", on_b).unwrap();
    s.subscribe("ping", on_s).unwrap();

    for registry in [&a, &b] {
        let relay = registry.relay().unwrap();
        assert_eq!(relay.current_room().await.unwrap(), "default");
    }

    a.publish("ping", json!("hello")).unwrap();
    assert_eq!(expect(&mut seen_b).await, (json!("hello"), uid_a.clone()));
    assert_eq!(expect(&mut seen_s).await, (json!("hello"), uid_a));
    expect_nothing(&mut seen_b).await;
}
