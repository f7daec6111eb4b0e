//! Messaging protocol behaviour over the in-memory broker

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use beacon_api::{Notification, RawMessage, Request};
use beacon_broker::{
    BindingKind, FnNotificationHandler, FnProtocolListener, FnRequestHandler, MemoryBroker,
    MessagingProtocol, MethodRouter, ProtocolConfig, ProtocolEvent, ProtocolListener, Responder,
};
use beacon_common::error::{CONNECTION_CLOSED, METHOD_NOT_FOUND, PUBLISH_FAILED, TRANSPORT_ERROR};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

const RPC: &str = "rpc-game-node-0";
const EVENTS: &str = "event-game-node-0";

fn connect(broker: &MemoryBroker) -> MessagingProtocol {
    MessagingProtocol::new(Arc::new(broker.connect()), ProtocolConfig::default())
}

/// Accepts `offer`, rejects everything else with 404.
async fn serve_offers(server: &MessagingProtocol) {
    server
        .on_request(
            RPC,
            Arc::new(FnRequestHandler::new(
                |request: Request, responder: Responder| async move {
                    if request.method == "offer" {
                        let _ = responder.accept(json!("We Accept Your Offer")).await;
                    } else {
                        let _ = responder.reject(404, "Not found").await;
                    }
                },
            )),
        )
        .await
        .unwrap();
}

fn record_events(events: &Arc<Mutex<Vec<ProtocolEvent>>>) -> Arc<dyn ProtocolListener> {
    let events = events.clone();
    Arc::new(FnProtocolListener::new(move |event: &ProtocolEvent| {
        events.lock().push(event.clone());
    }))
}

#[tokio::test]
async fn test_request_accepted() {
    let broker = MemoryBroker::new();
    let server = connect(&broker);
    let client = connect(&broker);
    serve_offers(&server).await;

    let result = client
        .request(RPC, "offer", json!({"sdp": "dummy-sdp"}))
        .await
        .unwrap();
    assert_eq!(result, json!("We Accept Your Offer"));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_request_rejected_with_code_and_reason() {
    let broker = MemoryBroker::new();
    let server = connect(&broker);
    let client = connect(&broker);
    serve_offers(&server).await;

    let rejection = client
        .request(RPC, "answer", RawMessage::Null)
        .await
        .unwrap_err();
    assert_eq!(rejection.code, 404);
    assert_eq!(rejection.reason, "Not found");
}

#[tokio::test]
async fn test_callbacks_fire_exactly_once() {
    let broker = MemoryBroker::new();
    let server = connect(&broker);
    let client = connect(&broker);
    serve_offers(&server).await;

    let accepted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));

    let requestor = client.requestor(RPC);
    for method in ["offer", "answer"] {
        let (a, r) = (accepted.clone(), rejected.clone());
        requestor
            .request_with(
                method,
                json!({}),
                move |_| {
                    a.fetch_add(1, Ordering::SeqCst);
                },
                move |code, _| {
                    assert_eq!(code, 404);
                    r.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await
            .unwrap();
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(rejected.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unbound_subject_times_out() {
    let broker = MemoryBroker::new();
    let client = connect(&broker);

    let started = tokio::time::Instant::now();
    let rejection = client
        .request("rpc-nobody", "offer", json!({}))
        .await
        .unwrap_err();

    assert!(rejection.is_timeout());
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_get_distinct_ids() {
    let broker = MemoryBroker::new();
    let server = connect(&broker);
    let client = connect(&broker);

    server
        .on_request(
            RPC,
            Arc::new(FnRequestHandler::new(
                |_request: Request, responder: Responder| async move {
                    let id = responder.id();
                    let _ = responder.accept(json!(id)).await;
                },
            )),
        )
        .await
        .unwrap();

    let calls = (0..50).map(|_| client.request(RPC, "echo-id", RawMessage::Null));
    let results = futures::future::join_all(calls).await;

    let ids: HashSet<u64> = results
        .into_iter()
        .map(|r| r.unwrap().as_u64().unwrap())
        .collect();
    assert_eq!(ids.len(), 50);
}

#[tokio::test(start_paused = true)]
async fn test_late_response_is_discarded() {
    let broker = MemoryBroker::new();
    let server = connect(&broker);
    let client = connect(&broker);

    server
        .on_request(
            RPC,
            Arc::new(
                MethodRouter::new()
                    .route_fn("slow", |_req, responder: Responder| async move {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        let _ = responder.accept(json!("late")).await;
                    })
                    .unwrap()
                    .route_fn("fast", |_req, responder: Responder| async move {
                        let _ = responder.accept(json!("fast")).await;
                    })
                    .unwrap(),
            ),
        )
        .await
        .unwrap();

    let rejection = client
        .request_with_timeout(RPC, "slow", RawMessage::Null, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(rejection.is_timeout());

    // let the late response arrive, then make sure nothing is confused by it
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(
        client.request(RPC, "fast", RawMessage::Null).await.unwrap(),
        json!("fast")
    );
}

#[tokio::test]
async fn test_router_rejects_unknown_method() {
    let broker = MemoryBroker::new();
    let server = connect(&broker);
    let client = connect(&broker);

    let router = MethodRouter::new()
        .route_fn("ping", |_req, responder: Responder| async move {
            let _ = responder.accept(json!("pong")).await;
        })
        .unwrap();
    server.on_request(RPC, Arc::new(router)).await.unwrap();

    assert_eq!(
        client.request(RPC, "ping", RawMessage::Null).await.unwrap(),
        json!("pong")
    );
    let rejection = client
        .request(RPC, "offer", RawMessage::Null)
        .await
        .unwrap_err();
    assert_eq!(rejection.code, METHOD_NOT_FOUND.code);
}

#[tokio::test(start_paused = true)]
async fn test_off_unbinds_subject() {
    let broker = MemoryBroker::new();
    let server = connect(&broker);
    let client = connect(&broker);
    serve_offers(&server).await;
    assert!(server.is_bound(BindingKind::Request, RPC));
    assert!(!server.is_bound(BindingKind::Broadcast, RPC));

    assert!(server.off(RPC));
    assert!(!server.off(RPC));
    tokio::task::yield_now().await;

    let rejection = client.request(RPC, "offer", json!({})).await.unwrap_err();
    assert!(rejection.is_timeout());
}

#[tokio::test]
async fn test_request_and_broadcast_bindings_share_subject() {
    let broker = MemoryBroker::new();
    let server = connect(&broker);
    let client = connect(&broker);
    serve_offers(&server).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .on_broadcast(
            RPC,
            Arc::new(FnNotificationHandler::new(
                move |_subject: &str, notification: Notification| {
                    let _ = tx.send(notification.method);
                },
            )),
        )
        .await
        .unwrap();
    assert!(server.is_bound(BindingKind::Request, RPC));
    assert!(server.is_bound(BindingKind::Broadcast, RPC));

    let result = client.request(RPC, "offer", json!({})).await.unwrap();
    assert_eq!(result, json!("We Accept Your Offer"));

    client.broadcaster(RPC).say("hello", &json!({}));
    assert_eq!(rx.recv().await.unwrap(), "hello");

    // dropping the broadcast handler leaves requests served
    assert!(server.off_broadcast(RPC));
    assert!(!server.off_broadcast(RPC));
    let result = client.request(RPC, "offer", json!({})).await.unwrap();
    assert_eq!(result, json!("We Accept Your Offer"));

    // and the other way round
    serve_offers(&server).await;
    server
        .on_broadcast(
            RPC,
            Arc::new(FnNotificationHandler::new(|_subject: &str, _n: Notification| {})),
        )
        .await
        .unwrap();
    assert!(server.off_request(RPC));
    assert!(server.is_bound(BindingKind::Broadcast, RPC));
}

#[tokio::test]
async fn test_publish_failure_is_reported() {
    let broker = MemoryBroker::new();
    let client = connect(&broker);
    broker.set_publish_failure(true);

    let rejection = client.request(RPC, "offer", json!({})).await.unwrap_err();
    assert_eq!(rejection.code, PUBLISH_FAILED.code);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_fails_pending_and_later_requests() {
    let broker = MemoryBroker::new();
    let server = connect(&broker);
    let client = connect(&broker);

    server
        .on_request(
            RPC,
            Arc::new(FnRequestHandler::new(
                |_request: Request, responder: Responder| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    drop(responder);
                },
            )),
        )
        .await
        .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    client.on(record_events(&events));

    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move { client.request(RPC, "offer", json!({})).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.pending_requests(), 1);

    client.close().await.unwrap();
    let rejection = in_flight.await.unwrap().unwrap_err();
    assert!(rejection.is_connection_closed());

    let later = client.request(RPC, "offer", json!({})).await.unwrap_err();
    assert_eq!(later.code, CONNECTION_CLOSED.code);

    // closing twice notifies once
    client.close().await.unwrap();
    tokio::task::yield_now().await;
    let events = events.lock();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], ProtocolEvent::Close { code, .. } if *code == CONNECTION_CLOSED.code));
}

#[tokio::test]
async fn test_transport_events_are_reemitted() {
    let broker = MemoryBroker::new();
    let transport = Arc::new(broker.connect());
    let protocol = MessagingProtocol::new(transport.clone(), ProtocolConfig::default());
    let broadcaster = protocol.broadcaster(EVENTS);

    let protocol_events = Arc::new(Mutex::new(Vec::new()));
    let broadcaster_events = Arc::new(Mutex::new(Vec::new()));
    protocol.on(record_events(&protocol_events));
    broadcaster.on(record_events(&broadcaster_events));

    // give the event forwarder a chance to subscribe before anything happens
    tokio::task::yield_now().await;
    transport.inject_error("slow consumer");
    transport.disconnect("server shutting down");

    for _ in 0..10 {
        if broadcaster_events.lock().len() == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }

    let seen = broadcaster_events.lock().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].code(), TRANSPORT_ERROR.code);
    assert!(matches!(&seen[1], ProtocolEvent::Close { reason, .. } if reason == "server shutting down"));
    assert_eq!(*protocol_events.lock(), seen);
    assert!(protocol.is_closed());
}

#[tokio::test]
async fn test_broadcast_reaches_every_subscriber_once() {
    let broker = MemoryBroker::new();
    let publisher = connect(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, String, Notification)>();

    let mut listeners = Vec::new();
    for name in ["peer-a", "peer-b"] {
        let peer = connect(&broker);
        let tx = tx.clone();
        peer.on_broadcast(
            EVENTS,
            Arc::new(FnNotificationHandler::new(
                move |subject: &str, notification: Notification| {
                    let _ = tx.send((name.to_string(), subject.to_string(), notification));
                },
            )),
        )
        .await
        .unwrap();
        listeners.push(peer);
    }

    let broadcaster = publisher.broadcaster(EVENTS);
    broadcaster.say("foo", &json!({"hello": "world"}));

    let mut peers = HashSet::new();
    for _ in 0..2 {
        let (peer, subject, notification) = rx.recv().await.unwrap();
        assert_eq!(subject, EVENTS);
        assert_eq!(notification.method, "foo");
        assert_eq!(notification.data, json!({"hello": "world"}));
        peers.insert(peer);
    }
    assert_eq!(peers.len(), 2);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_broadcasts_keep_call_order() {
    let broker = MemoryBroker::new();
    let publisher = connect(&broker);
    let listener = connect(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();

    listener
        .on_broadcast(
            EVENTS,
            Arc::new(FnNotificationHandler::new(
                move |_subject: &str, notification: Notification| {
                    let _ = tx.send(notification.data);
                },
            )),
        )
        .await
        .unwrap();

    let broadcaster = publisher.broadcaster(EVENTS);
    for seq in 0..20 {
        broadcaster.say("tick", &json!({ "seq": seq }));
    }

    for expected in 0..20 {
        let data = rx.recv().await.unwrap();
        assert_eq!(data["seq"], json!(expected));
    }
}
