// Configuration keys and their defaults

pub const SERVICE_NAME: &str = "service.name";
pub const NODE_ID: &str = "node.id";
pub const NODE_INFO: &str = "node.info";

pub const DISCOVERY_SCHEME: &str = "discovery.scheme";
pub const DISCOVERY_STORE: &str = "discovery.store";
pub const DISCOVERY_ENDPOINTS: &str = "discovery.endpoints";
pub const DISCOVERY_RENEW_INTERVAL_SECS: &str = "discovery.renew_interval_secs";
pub const DISCOVERY_LEASE_TTL_SECS: &str = "discovery.lease_ttl_secs";

pub const WATCH_SERVICES: &str = "watch.services";
pub const WATCH_INITIAL_BACKOFF_MS: &str = "watch.initial_backoff_ms";
pub const WATCH_MAX_BACKOFF_MS: &str = "watch.max_backoff_ms";

pub const MESSAGING_TRANSPORT: &str = "messaging.transport";
pub const MESSAGING_URL: &str = "messaging.url";
pub const MESSAGING_REQUEST_TIMEOUT_MS: &str = "messaging.request_timeout_ms";

pub const LOGGING_LEVEL: &str = "logging.level";
pub const LOGGING_DIR: &str = "logging.dir";
pub const LOGGING_CONSOLE: &str = "logging.console";
pub const LOGGING_FILE: &str = "logging.file";
pub const LOGGING_ROTATION: &str = "logging.rotation";

/// Keys still honoured under their old names, mapped to their replacement
pub const DEPRECATED_KEYS: &[(&str, &str)] = &[
    ("etcd.endpoints", DISCOVERY_ENDPOINTS),
    ("nats.url", MESSAGING_URL),
    ("discovery.dc", DISCOVERY_SCHEME),
    ("messaging.timeout_ms", MESSAGING_REQUEST_TIMEOUT_MS),
];

pub const DEFAULT_SERVICE_NAME: &str = "beacon";
pub const DEFAULT_ETCD_ENDPOINT: &str = "http://127.0.0.1:2379";
pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";
pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";

pub const BACKEND_MEMORY: &str = "memory";
pub const BACKEND_ETCD: &str = "etcd";
pub const BACKEND_NATS: &str = "nats";
