//! Node runtime over the in-process store and broker

use std::sync::Arc;
use std::time::Duration;

use beacon_api::{Node, Notification, RawMessage};
use beacon_broker::{FnNotificationHandler, MemoryBroker, MessagingProtocol, ProtocolConfig};
use beacon_common::error::{METHOD_NOT_FOUND, NODE_INFO_ERROR};
use beacon_discovery::{KvStore, MemoryKvStore, list_nodes};
use beacon_server::model::constants::{NODE_ID, SERVICE_NAME};
use beacon_server::service::{METHOD_INFO, METHOD_PING, NOTIFY_NODE_DOWN, NOTIFY_NODE_UP};
use beacon_server::{BeaconNode, Configuration};
use config::Config;
use serde_json::json;
use tokio::sync::mpsc;

const SERVICE: &str = "game-server";

fn configuration(node_id: &str) -> Configuration {
    Config::builder()
        .set_override(SERVICE_NAME, SERVICE)
        .unwrap()
        .set_override(NODE_ID, node_id)
        .unwrap()
        .build()
        .unwrap()
        .into()
}

async fn start(node_id: &str, store: &Arc<MemoryKvStore>, broker: &MemoryBroker) -> BeaconNode {
    let store: Arc<dyn KvStore> = store.clone();
    BeaconNode::start(&configuration(node_id), store, Arc::new(broker.connect()))
        .await
        .unwrap()
}

fn client(broker: &MemoryBroker) -> MessagingProtocol {
    MessagingProtocol::new(Arc::new(broker.connect()), ProtocolConfig::default())
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_node_serves_ping_and_info() {
    let store = Arc::new(MemoryKvStore::new());
    let broker = MemoryBroker::new();
    let node = start("node-a", &store, &broker).await;
    let client = client(&broker);

    let pong = client
        .request("rpc-node-a", METHOD_PING, json!({"from": "test"}))
        .await
        .unwrap();
    assert_eq!(pong["id"], json!("node-a"));
    assert!(pong["time"].is_string());

    let info = client
        .request("rpc-node-a", METHOD_INFO, RawMessage::Null)
        .await
        .unwrap();
    let info: Node = serde_json::from_value(info).unwrap();
    assert_eq!(info.service, SERVICE);
    assert_eq!(info.id, "node-a");
    assert!(info.ip().is_some());
    assert_eq!(&info, node.node());

    let rejection = client
        .request("rpc-node-a", "offer", RawMessage::Null)
        .await
        .unwrap_err();
    assert_eq!(rejection.code, METHOD_NOT_FOUND.code);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_info_fails_once_unregistered() {
    let store = Arc::new(MemoryKvStore::new());
    let broker = MemoryBroker::new();
    let node = start("node-a", &store, &broker).await;
    let client = client(&broker);

    node.service_node().unregister_node().await.unwrap();
    let rejection = client
        .request("rpc-node-a", METHOD_INFO, RawMessage::Null)
        .await
        .unwrap_err();
    assert_eq!(rejection.code, NODE_INFO_ERROR.code);

    // shutdown after a manual unregister is still clean
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_peers_follow_each_other() {
    let store = Arc::new(MemoryKvStore::new());
    let broker = MemoryBroker::new();

    let a = start("node-a", &store, &broker).await;
    let b = start("node-b", &store, &broker).await;

    eventually(|| a.peers().len() == 1 && b.peers().len() == 1).await;
    assert_eq!(a.peers()[0].id, "node-b");
    assert_eq!(b.peers()[0].id, "node-a");

    // each node follows the other's event channel
    eventually(|| broker.subscriber_count("event-node-b") == 1).await;
    eventually(|| broker.subscriber_count("event-node-a") == 1).await;

    b.shutdown().await.unwrap();
    eventually(|| a.peers().is_empty()).await;
    eventually(|| broker.subscriber_count("event-node-b") == 0).await;

    a.shutdown().await.unwrap();
    assert!(list_nodes(store.as_ref(), "dc1", SERVICE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_announces_up_and_down() {
    let store = Arc::new(MemoryKvStore::new());
    let broker = MemoryBroker::new();
    let observer = client(&broker);

    let (tx, mut rx) = mpsc::unbounded_channel();
    observer
        .on_broadcast(
            "event-node-a",
            Arc::new(FnNotificationHandler::new(
                move |_subject: &str, notification: Notification| {
                    let _ = tx.send(notification);
                },
            )),
        )
        .await
        .unwrap();

    let node = start("node-a", &store, &broker).await;
    let up = rx.recv().await.unwrap();
    assert_eq!(up.method, NOTIFY_NODE_UP);
    assert_eq!(up.data["id"], json!("node-a"));

    node.shutdown().await.unwrap();
    let down = rx.recv().await.unwrap();
    assert_eq!(down.method, NOTIFY_NODE_DOWN);
    assert_eq!(down.data["service"], json!(SERVICE));
}
