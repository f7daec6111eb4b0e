//! Node model and store key layout
//!
//! A node lives under `scheme/service-nodeId`. The service segment has any
//! `/` replaced so every service occupies exactly one path segment.

use std::collections::HashMap;

use beacon_common::{INFO_IP, sanitize_service_name};
use serde::{Deserialize, Serialize};

/// A registered member of a service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub service: String,
    pub id: String,
    #[serde(default)]
    pub info: HashMap<String, String>,
}

impl Node {
    pub fn new(service: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            id: id.into(),
            info: HashMap::new(),
        }
    }

    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }

    /// The advertised network address, if resolved.
    pub fn ip(&self) -> Option<&str> {
        self.info
            .get(INFO_IP)
            .map(String::as_str)
            .filter(|ip| !ip.is_empty())
    }

    /// Encode for storage as the value of the node key.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.service,
            self.id,
            self.ip().unwrap_or("unknown")
        )
    }
}

/// Prefix under which every node of `service_name` is stored.
pub fn service_path(scheme: &str, service_name: &str) -> String {
    let scheme = scheme.trim_end_matches('/');
    let service = sanitize_service_name(service_name);
    if scheme.is_empty() {
        service
    } else {
        format!("{}/{}", scheme, service)
    }
}

/// Full store key of a node.
pub fn node_key(scheme: &str, service_name: &str, node_id: &str) -> String {
    format!("{}-{}", service_path(scheme, service_name), node_id)
}

/// Prefix used for scans and watches of one service.
pub fn scan_prefix(scheme: &str, service_name: &str) -> String {
    format!("{}-", service_path(scheme, service_name))
}

/// Recover the node id from a key found under `scan_prefix`.
pub fn node_id_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|id| !id.is_empty())
}
