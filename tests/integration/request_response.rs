//! Request/response correlation over a live session: resolution, the
//! validator post-chain, unknown correlation ids, timeouts, and teardown.

mod support;

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use support::memory_connector;
use tradewire::{
    handler_fn, CallbackClient, ClientConfig, ClientError, Handler, MessageRouter,
    RequestResolver, Routed, WsClient,
};

fn test_config() -> ClientConfig {
    let mut cfg = ClientConfig::new("wss://ws.example.com/ws/");
    cfg.reconnect = false;
    cfg
}

/// A client whose router consists of the given resolver and a sink.
fn resolving_client(
    connector: support::MemoryConnector,
    sink: Arc<dyn Handler>,
) -> (Arc<WsClient>, Arc<RequestResolver>) {
    let client =
        Arc::new(WsClient::with_connector(test_config(), Box::new(connector)).unwrap());
    let resolver = Arc::new(RequestResolver::new("", "oid", "oid").with_op_name_path("e"));
    client.set_resolver(resolver.clone());
    client.set_router(
        MessageRouter::new(vec![(json!({"oid": null}), resolver.clone() as Arc<dyn Handler>)])
            .bind(sink),
    );
    (client, resolver)
}

fn counting_sink() -> (Arc<AtomicUsize>, Arc<dyn Handler>) {
    let count = Arc::new(AtomicUsize::new(0));
    let handler = {
        let count = count.clone();
        handler_fn(move |m| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(Routed::Handled(m))
        })
    };
    (count, handler)
}

#[tokio::test]
async fn request_resolves_with_the_matching_response() {
    let (connector, mut sessions) = memory_connector();
    let (_, sink) = counting_sink();
    let (client, resolver) = resolving_client(connector, sink);
    client.run().await.unwrap();

    let server_task = tokio::spawn(async move {
        let mut server = sessions.recv().await.unwrap();
        let request = server.recv_json().await;
        assert_eq!(request["e"], "get-balance");
        server.send_json(&json!({
            "e": "get-balance",
            "ok": "ok",
            "data": {"balance": "42"},
            "oid": request["oid"],
        }));
        server
    });

    let response = client.request(json!({"e": "get-balance"})).await.unwrap();
    assert_eq!(response["data"]["balance"], "42");
    assert_eq!(resolver.pending_len(), 0);

    server_task.await.unwrap();
    client.stop().await;
}

#[tokio::test]
async fn unknown_correlation_id_falls_through_to_the_sink() {
    let (connector, mut sessions) = memory_connector();
    let (sunk, sink) = counting_sink();
    let (client, _resolver) = resolving_client(connector, sink);
    client.run().await.unwrap();

    let server = sessions.recv().await.unwrap();
    server.send_json(&json!({"e": "get-balance", "oid": "undefined", "ok": "ok"}));

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(sunk.load(Ordering::SeqCst), 1);
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn request_without_a_response_times_out_and_leaves_the_entry() {
    let (connector, mut sessions) = memory_connector();
    let (_, sink) = counting_sink();
    let (client, resolver) = resolving_client(connector, sink);
    client.run().await.unwrap();
    let _server = sessions.recv().await.unwrap();

    let err = client
        .request(json!({"e": "subscribe", "rooms": ["none"]}))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));

    // the entry stays until teardown; a late response would be benign
    assert_eq!(resolver.pending_len(), 1);
    resolver.clear();
    assert_eq!(resolver.pending_len(), 0);
    client.stop().await;
}

#[tokio::test]
async fn stop_cancels_outstanding_requests() {
    let (connector, mut sessions) = memory_connector();
    let (_, sink) = counting_sink();
    let (client, _resolver) = resolving_client(connector, sink);
    client.run().await.unwrap();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.request(json!({"e": "get-balance"})).await })
    };

    let mut server = sessions.recv().await.unwrap();
    // the request is on the wire before the client shuts down
    let _request = server.recv_json().await;
    client.stop().await;

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(ClientError::Cancelled)));
}

#[tokio::test]
async fn callback_client_validates_and_extracts_response_data() {
    let (connector, mut sessions) = memory_connector();
    let notifications = Arc::new(AtomicUsize::new(0));
    let on_notification = {
        let notifications = notifications.clone();
        handler_fn(move |m| {
            notifications.fetch_add(1, Ordering::SeqCst);
            Ok(Routed::Handled(m))
        })
    };
    let client =
        CallbackClient::with_connector(test_config(), Box::new(connector), on_notification)
            .unwrap();
    client.run().await.unwrap();

    let server_task = tokio::spawn(async move {
        let mut server = sessions.recv().await.unwrap();

        let request = server.recv_json().await;
        server.send_json(&json!({
            "e": "ticker",
            "ok": "ok",
            "data": {"pair": "BTC:USD"},
            "oid": request["oid"],
        }));

        // push notification: no oid
        server.send_json(&json!({"e": "tick", "data": {"price": "1"}}));

        let request = server.recv_json().await;
        server.send_json(&json!({
            "e": "ticker",
            "ok": "error",
            "data": {"error": "unknown pair"},
            "oid": request["oid"],
        }));

        let request = server.recv_json().await;
        server.send_json(&json!({"e": "ticker", "ok": "??", "data": {}, "oid": request["oid"]}));

        server
    });

    let data = client
        .request(json!({"e": "ticker", "data": ["BTC", "USD"]}))
        .await
        .unwrap();
    assert_eq!(data["pair"], "BTC:USD");

    let err = client
        .request(json!({"e": "ticker", "data": ["BTC"]}))
        .await
        .unwrap_err();
    match err {
        ClientError::ErrorMessage(detail) => assert_eq!(detail, "unknown pair"),
        other => panic!("expected ErrorMessage, got {other:?}"),
    }

    let err = client.request(json!({"e": "ticker"})).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidMessage(_)));

    server_task.await.unwrap();
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
    client.stop().await;
}
