use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

pub const ENV_PREFIX: &str = "MODEL_WATCHER";

/// Tunables for watch sessions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Upper bound on the best-effort remote `Stop` during teardown.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub facades: RpcFacades,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            event_capacity: default_event_capacity(),
            facades: RpcFacades::default(),
        }
    }
}

impl WatcherConfig {
    /// Reads `MODEL_WATCHER_*` variables. Each setting that is missing or
    /// unparsable keeps its default; the others still apply.
    pub fn from_env() -> Self {
        let source = match config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
        {
            Ok(source) => source,
            Err(err) => {
                warn!(
                    target = "model_watcher::config",
                    error = %err,
                    "could not read watcher environment; using defaults"
                );
                return WatcherConfig::default();
            }
        };

        let defaults = WatcherConfig::default();
        WatcherConfig {
            ping_interval_ms: setting(&source, "ping_interval_ms", defaults.ping_interval_ms),
            stop_timeout_ms: setting(&source, "stop_timeout_ms", defaults.stop_timeout_ms),
            event_capacity: setting(&source, "event_capacity", defaults.event_capacity),
            facades: RpcFacades {
                client: setting(&source, "facades.client", defaults.facades.client),
                all_watcher: setting(&source, "facades.all_watcher", defaults.facades.all_watcher),
                pinger: setting(&source, "facades.pinger", defaults.facades.pinger),
            },
        }
        .normalize()
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self.normalize()
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.normalize()
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    fn normalize(mut self) -> Self {
        if self.ping_interval_ms == 0 {
            self.ping_interval_ms = default_ping_interval_ms();
        }
        if self.stop_timeout_ms == 0 {
            self.stop_timeout_ms = default_stop_timeout_ms();
        }
        if self.event_capacity == 0 {
            self.event_capacity = default_event_capacity();
        }
        self
    }
}

/// Facade name and version pair used by [`crate::RpcConnection`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Facade {
    pub name: String,
    pub version: u32,
}

impl Facade {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RpcFacades {
    #[serde(default = "default_client_facade")]
    pub client: Facade,
    #[serde(default = "default_all_watcher_facade")]
    pub all_watcher: Facade,
    #[serde(default = "default_pinger_facade")]
    pub pinger: Facade,
}

impl Default for RpcFacades {
    fn default() -> Self {
        Self {
            client: default_client_facade(),
            all_watcher: default_all_watcher_facade(),
            pinger: default_pinger_facade(),
        }
    }
}

fn setting<T: DeserializeOwned>(source: &config::Config, key: &str, default: T) -> T {
    match source.get::<T>(key) {
        Ok(value) => value,
        Err(config::ConfigError::NotFound(_)) => default,
        Err(err) => {
            warn!(
                target = "model_watcher::config",
                key,
                error = %err,
                "ignoring invalid watcher setting"
            );
            default
        }
    }
}

fn default_ping_interval_ms() -> u64 {
    20_000
}

fn default_stop_timeout_ms() -> u64 {
    5_000
}

fn default_event_capacity() -> usize {
    256
}

fn default_client_facade() -> Facade {
    Facade::new("Client", 6)
}

fn default_all_watcher_facade() -> Facade {
    Facade::new("AllWatcher", 3)
}

fn default_pinger_facade() -> Facade {
    Facade::new("Pinger", 1)
}
