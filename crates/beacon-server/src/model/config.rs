//! Configuration management for the Beacon node
//!
//! Sources, lowest precedence first:
//! 1. `conf/application.yml`, or the file given with `--config`
//! 2. `BEACON_*` environment variables, with `__` between sections
//!    (`BEACON_DISCOVERY__LEASE_TTL_SECS=30`)
//! 3. command line flags

use std::collections::HashMap;
use std::time::Duration;

use beacon_broker::ProtocolConfig;
use beacon_common::{BeaconError, DEFAULT_SCHEME};
use beacon_discovery::{RegistryConfig, WatcherConfig};
use clap::Parser;
use config::{Config, ConfigError, Environment};
use tracing::warn;

use crate::startup::LoggingConfig;

use super::constants::*;

/// Command line arguments for the node
#[derive(Debug, Default, Parser)]
#[command(name = "beacon-server", version, about = "Beacon service node")]
pub struct Cli {
    /// Configuration file; defaults to conf/application.yml when present
    #[arg(short = 'c', long = "config", env = "BEACON_CONFIG")]
    pub config: Option<String>,
    #[arg(short = 's', long = "service")]
    pub service: Option<String>,
    #[arg(short = 'n', long = "node-id")]
    pub node_id: Option<String>,
    /// Discovery store backend: memory or etcd
    #[arg(long = "store")]
    pub store: Option<String>,
    /// Messaging transport backend: memory or nats
    #[arg(long = "transport")]
    pub transport: Option<String>,
    #[arg(long = "scheme")]
    pub scheme: Option<String>,
}

fn config_error(e: ConfigError) -> BeaconError {
    BeaconError::ConfigError(e.to_string())
}

/// Application configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl From<Config> for Configuration {
    fn from(config: Config) -> Self {
        Self { config }
    }
}

impl Configuration {
    /// Load from the process arguments.
    pub fn new() -> Result<Self, BeaconError> {
        Self::load(Cli::parse())
    }

    pub fn load(cli: Cli) -> Result<Self, BeaconError> {
        // an explicitly named file must exist, the default one may not
        let file = config::File::with_name(cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_FILE))
            .required(cli.config.is_some());

        let mut builder = Config::builder().add_source(file).add_source(
            Environment::with_prefix("BEACON")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let overrides = [
            (SERVICE_NAME, cli.service),
            (NODE_ID, cli.node_id),
            (DISCOVERY_STORE, cli.store),
            (MESSAGING_TRANSPORT, cli.transport),
            (DISCOVERY_SCHEME, cli.scheme),
        ];
        for (key, value) in overrides {
            if let Some(value) = value {
                builder = builder.set_override(key, value).map_err(config_error)?;
            }
        }

        Ok(Self {
            config: builder.build().map_err(config_error)?,
        })
    }

    /// Look `key` up, then any deprecated alias of it.
    fn lookup<T>(
        &self,
        key: &str,
        get: impl Fn(&Config, &str) -> Result<T, ConfigError>,
    ) -> Option<T> {
        if let Ok(value) = get(&self.config, key) {
            return Some(value);
        }
        DEPRECATED_KEYS
            .iter()
            .filter(|(_, replacement)| *replacement == key)
            .find_map(|(old, _)| {
                let value = get(&self.config, old).ok()?;
                warn!(
                    deprecated = %old,
                    replacement = %key,
                    "Deprecated configuration key in use"
                );
                Some(value)
            })
    }

    fn string(&self, key: &str) -> Option<String> {
        self.lookup(key, Config::get_string)
            .filter(|value| !value.trim().is_empty())
    }

    fn positive(&self, key: &str) -> Option<u64> {
        self.lookup(key, Config::get_int)
            .filter(|value| *value > 0)
            .map(|value| value as u64)
    }

    /// A list given either as a sequence or as one comma-separated string.
    pub fn string_list(&self, key: &str) -> Vec<String> {
        let items = self
            .lookup(key, Config::get_array)
            .map(|values| {
                values
                    .into_iter()
                    .filter_map(|v| v.into_string().ok())
                    .collect::<Vec<_>>()
            })
            .or_else(|| {
                self.lookup(key, Config::get_string)
                    .map(|raw| raw.split(',').map(str::to_string).collect())
            })
            .unwrap_or_default();

        items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    }

    // ========================================================================
    // Node
    // ========================================================================

    pub fn service_name(&self) -> String {
        self.string(SERVICE_NAME)
            .unwrap_or(DEFAULT_SERVICE_NAME.to_string())
    }

    /// Configured node id. The runtime generates one when absent.
    pub fn node_id(&self) -> Option<String> {
        self.string(NODE_ID)
    }

    /// Extra info published with the node, e.g. `node.info.zone: eu-1`
    pub fn node_info(&self) -> HashMap<String, String> {
        self.config
            .get::<HashMap<String, String>>(NODE_INFO)
            .unwrap_or_default()
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    pub fn scheme(&self) -> String {
        self.string(DISCOVERY_SCHEME)
            .unwrap_or(DEFAULT_SCHEME.to_string())
    }

    pub fn store_backend(&self) -> String {
        self.string(DISCOVERY_STORE)
            .unwrap_or(BACKEND_MEMORY.to_string())
            .to_lowercase()
    }

    pub fn store_endpoints(&self) -> Vec<String> {
        let endpoints = self.string_list(DISCOVERY_ENDPOINTS);
        if endpoints.is_empty() {
            vec![DEFAULT_ETCD_ENDPOINT.to_string()]
        } else {
            endpoints
        }
    }

    pub fn renew_interval(&self) -> Duration {
        self.positive(DISCOVERY_RENEW_INTERVAL_SECS)
            .map(Duration::from_secs)
            .unwrap_or(beacon_discovery::registry::DEFAULT_RENEW_INTERVAL)
    }

    pub fn lease_ttl(&self) -> Duration {
        self.positive(DISCOVERY_LEASE_TTL_SECS)
            .map(Duration::from_secs)
            .unwrap_or(beacon_discovery::registry::DEFAULT_LEASE_TTL)
    }

    /// Services whose peers this node follows. Defaults to its own service.
    pub fn watch_services(&self) -> Vec<String> {
        let services = self.string_list(WATCH_SERVICES);
        if services.is_empty() {
            vec![self.service_name()]
        } else {
            services
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            scheme: self.scheme(),
            renew_interval: self.renew_interval(),
            lease_ttl: self.lease_ttl(),
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        let defaults = WatcherConfig::default();
        WatcherConfig {
            scheme: self.scheme(),
            initial_backoff: self
                .positive(WATCH_INITIAL_BACKOFF_MS)
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: self
                .positive(WATCH_MAX_BACKOFF_MS)
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
        }
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    pub fn transport_backend(&self) -> String {
        self.string(MESSAGING_TRANSPORT)
            .unwrap_or(BACKEND_MEMORY.to_string())
            .to_lowercase()
    }

    pub fn transport_url(&self) -> String {
        self.string(MESSAGING_URL)
            .unwrap_or(DEFAULT_NATS_URL.to_string())
    }

    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            request_timeout: self
                .positive(MESSAGING_REQUEST_TIMEOUT_MS)
                .map(Duration::from_millis)
                .unwrap_or(beacon_broker::DEFAULT_REQUEST_TIMEOUT),
        }
    }

    // ========================================================================
    // Logging
    // ========================================================================

    /// `logging.*` keys, falling back to the `BEACON_LOG_*` variables.
    pub fn logging_config(&self) -> LoggingConfig {
        let env = LoggingConfig::from_env();
        LoggingConfig::from_config(
            self.string(LOGGING_DIR)
                .or(Some(env.log_dir.display().to_string())),
            self.config
                .get_bool(LOGGING_CONSOLE)
                .unwrap_or(env.console_output),
            self.config
                .get_bool(LOGGING_FILE)
                .unwrap_or(env.file_logging),
            &self
                .string(LOGGING_LEVEL)
                .unwrap_or(env.console_level.to_string()),
            self.string(LOGGING_ROTATION).as_deref(),
        )
    }
}
