//! Network-flap suite: reconnection with jittered backoff and subscription
//! replay, driven over the in-memory channel.
//!
//! # Scenarios
//! 1. Link drop: the client reconnects and replays every recorded
//!    subscription exactly once, in original order, with original verbs.
//! 2. Send failure: the caller sees a connectivity error and the routing
//!    loop reconnects in the background.
//! 3. Silent liveness window: no inbound traffic forces a reconnect.
//! 4. Server-initiated `disconnecting`: handled like a link drop.
//! 5. Reconnect disabled: a flap stops the client instead.

mod support;

use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use support::{memory_connector, wait_until_open};
use tradewire::{ClientConfig, ClientError, ConnState, Handler, MessageRouter, RequestResolver, WsClient};

fn reconnect_config() -> ClientConfig {
    // reconnect and replay are on by default
    ClientConfig::new("wss://ws.example.com/ws/")
}

fn resolving_client(connector: support::MemoryConnector) -> (Arc<WsClient>, Arc<RequestResolver>) {
    let client =
        Arc::new(WsClient::with_connector(reconnect_config(), Box::new(connector)).unwrap());
    let resolver = Arc::new(RequestResolver::new("", "oid", "oid").with_op_name_path("e"));
    client.set_resolver(resolver.clone());
    client.set_router(MessageRouter::new(vec![(
        json!({"oid": null}),
        resolver.clone() as Arc<dyn Handler>,
    )]));
    (client, resolver)
}

#[tokio::test(start_paused = true)]
async fn reconnect_replays_subscriptions_in_order_exactly_once() {
    let (connector, mut sessions) = memory_connector();
    let connects = connector.connects.clone();
    let (client, _resolver) = resolving_client(connector);
    client.run().await.unwrap();

    let mut s1 = sessions.recv().await.unwrap();

    client
        .send_subscribe(json!({"e": "subscribe", "rooms": ["tickers"]}))
        .await
        .unwrap();
    client
        .send_subscribe(json!({"e": "subscribe", "rooms": ["pair-BTC-USD"]}))
        .await
        .unwrap();
    assert_eq!(s1.recv_json().await, json!({"e": "subscribe", "rooms": ["tickers"]}));
    assert_eq!(s1.recv_json().await, json!({"e": "subscribe", "rooms": ["pair-BTC-USD"]}));

    // request-style subscription: scripted response on the first session
    let waiter = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request_subscribe(json!({"e": "open-orders", "data": {"pair": ["BTC", "USD"]}}))
                .await
        })
    };
    let first_request = s1.recv_json().await;
    assert_eq!(first_request["e"], "open-orders");
    s1.send_json(&json!({"e": "open-orders", "ok": "ok", "data": [], "oid": first_request["oid"]}));
    waiter.await.unwrap().unwrap();

    // flap
    s1.drop_link();

    // the client reconnects and replays in original registry order:
    // fire-and-forget subscriptions first, request-style second
    let mut s2 = sessions.recv().await.unwrap();
    assert_eq!(s2.recv_json().await, json!({"e": "subscribe", "rooms": ["tickers"]}));
    assert_eq!(s2.recv_json().await, json!({"e": "subscribe", "rooms": ["pair-BTC-USD"]}));
    let replayed = s2.recv_json().await;
    assert_eq!(replayed["e"], "open-orders");
    assert_eq!(replayed["data"], json!({"pair": ["BTC", "USD"]}));
    // a fresh correlation id, not a reuse
    assert_ne!(replayed["oid"], first_request["oid"]);
    s2.send_json(&json!({"e": "open-orders", "ok": "ok", "data": [], "oid": replayed["oid"]}));

    // nothing is replayed twice
    assert!(s2.idle().await);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    wait_until_open(&client).await;
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn send_failure_raises_connectivity_and_reconnects() {
    let (connector, mut sessions) = memory_connector();
    let connects = connector.connects.clone();
    let client =
        Arc::new(WsClient::with_connector(reconnect_config(), Box::new(connector)).unwrap());
    client.run().await.unwrap();

    let s1 = sessions.recv().await.unwrap();
    s1.break_writes();

    let err = client
        .send(&json!({"e": "subscribe", "rooms": ["tickers"]}))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Connectivity(_)));

    // the routing loop observed the send error and reconnected
    let s2 = sessions.recv().await.unwrap();
    wait_until_open(&client).await;
    assert_eq!(connects.load(Ordering::SeqCst), 2);

    // sends succeed on the new channel
    client.send(&json!({"e": "pong"})).await.unwrap();
    drop(s2);
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn silent_liveness_window_forces_a_reconnect() {
    let (connector, mut sessions) = memory_connector();
    let connects = connector.connects.clone();
    let client =
        Arc::new(WsClient::with_connector(reconnect_config(), Box::new(connector)).unwrap());
    client.run().await.unwrap();

    let _s1 = sessions.recv().await.unwrap();
    // no traffic at all: the liveness window elapses and the client
    // treats the connection as dead
    let _s2 = sessions.recv().await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    wait_until_open(&client).await;
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn server_disconnecting_message_triggers_a_reconnect() {
    let (connector, mut sessions) = memory_connector();
    let connects = connector.connects.clone();
    let client =
        Arc::new(WsClient::with_connector(reconnect_config(), Box::new(connector)).unwrap());
    client.run().await.unwrap();

    let s1 = sessions.recv().await.unwrap();
    s1.send_json(&json!({"e": "disconnecting"}));

    let _s2 = sessions.recv().await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    wait_until_open(&client).await;
    client.stop().await;
}

#[tokio::test]
async fn without_auto_reconnect_a_flap_stops_the_client() {
    let (connector, mut sessions) = memory_connector();
    let connects = connector.connects.clone();
    let mut cfg = reconnect_config();
    cfg.reconnect = false;
    let client = Arc::new(WsClient::with_connector(cfg, Box::new(connector)).unwrap());
    client.run().await.unwrap();

    let mut s1 = sessions.recv().await.unwrap();
    s1.drop_link();

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(client.state(), ConnState::Closed);
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    client.stop().await;
}
