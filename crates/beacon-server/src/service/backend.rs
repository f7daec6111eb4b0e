//! Store and transport backend selection

use std::sync::Arc;
use std::time::Duration;

use beacon_broker::{MemoryBroker, Transport};
use beacon_common::BeaconError;
use beacon_discovery::{KvStore, MemoryKvStore};
use tracing::warn;

use crate::model::Configuration;
use crate::model::constants::{BACKEND_ETCD, BACKEND_MEMORY, BACKEND_NATS};

/// How often the in-process store drops expired leases
const MEMORY_REAP_INTERVAL: Duration = Duration::from_secs(1);

pub async fn connect_store(configuration: &Configuration) -> anyhow::Result<Arc<dyn KvStore>> {
    match configuration.store_backend().as_str() {
        BACKEND_MEMORY => {
            warn!("Using the in-process discovery store, nodes in other processes are invisible");
            let store = Arc::new(MemoryKvStore::new());
            store.spawn_reaper(MEMORY_REAP_INTERVAL);
            Ok(store)
        }
        BACKEND_ETCD => connect_etcd(&configuration.store_endpoints()).await,
        other => Err(BeaconError::ConfigError(format!(
            "unknown discovery store backend: {}",
            other
        ))
        .into()),
    }
}

#[cfg(feature = "etcd")]
async fn connect_etcd(endpoints: &[String]) -> anyhow::Result<Arc<dyn KvStore>> {
    let store = beacon_discovery::EtcdKvStore::connect(endpoints).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "etcd"))]
async fn connect_etcd(_endpoints: &[String]) -> anyhow::Result<Arc<dyn KvStore>> {
    anyhow::bail!("the etcd store requires building with the `etcd` feature")
}

pub async fn connect_transport(
    configuration: &Configuration,
) -> anyhow::Result<Arc<dyn Transport>> {
    match configuration.transport_backend().as_str() {
        BACKEND_MEMORY => {
            warn!("Using the in-process transport, nodes in other processes are unreachable");
            Ok(Arc::new(MemoryBroker::new().connect()))
        }
        BACKEND_NATS => connect_nats(&configuration.transport_url()).await,
        other => Err(BeaconError::ConfigError(format!(
            "unknown messaging transport backend: {}",
            other
        ))
        .into()),
    }
}

#[cfg(feature = "nats")]
async fn connect_nats(url: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let transport = beacon_broker::NatsTransport::connect(url).await?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "nats"))]
async fn connect_nats(_url: &str) -> anyhow::Result<Arc<dyn Transport>> {
    anyhow::bail!("the NATS transport requires building with the `nats` feature")
}

#[cfg(test)]
mod tests {
    use config::Config;

    use super::*;
    use crate::model::constants::{DISCOVERY_STORE, MESSAGING_TRANSPORT};

    fn configuration(key: &str, value: &str) -> Configuration {
        Configuration::from(Config::builder().set_override(key, value).unwrap().build().unwrap())
    }

    #[tokio::test]
    async fn test_memory_backends_by_default() {
        let configuration = Configuration::default();
        let store = connect_store(&configuration).await.unwrap();
        assert!(store.get_prefix("dc1/").await.unwrap().is_empty());

        let transport = connect_transport(&configuration).await.unwrap();
        assert!(transport.new_inbox().starts_with("_INBOX."));
    }

    #[tokio::test]
    async fn test_unknown_backends_are_rejected() {
        let err = connect_store(&configuration(DISCOVERY_STORE, "zookeeper"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("zookeeper"));

        let err = connect_transport(&configuration(MESSAGING_TRANSPORT, "kafka"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("kafka"));
    }

    #[cfg(not(feature = "etcd"))]
    #[tokio::test]
    async fn test_etcd_without_feature_is_an_error() {
        let result = connect_store(&configuration(DISCOVERY_STORE, "etcd")).await;
        assert!(result.is_err());
    }
}
