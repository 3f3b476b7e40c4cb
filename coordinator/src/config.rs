/// Backend specific configuration options.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", content = "options", deny_unknown_fields)]
pub enum Backend {
    /// Use zookeeper as the coordination store (recommended, default).
    #[serde(rename = "zookeeper")]
    Zookeeper(ZookeeperConfig),

    /// Process-local store, for development clusters and tests.
    #[serde(rename = "memory")]
    Memory,
}

impl Default for Backend {
    fn default() -> Backend {
        Backend::Zookeeper(ZookeeperConfig::default())
    }
}

/// Zookeeper-specific configuration options.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct ZookeeperConfig {
    /// Comma separated list of zookeeper endpoints.
    #[serde(default = "ZookeeperConfig::default_ensemble")]
    pub ensemble: String,

    /// Session timeout, in seconds.
    #[serde(default = "ZookeeperConfig::default_timeout")]
    pub timeout: u64,
}

impl Default for ZookeeperConfig {
    fn default() -> ZookeeperConfig {
        ZookeeperConfig {
            ensemble: Self::default_ensemble(),
            timeout: Self::default_timeout(),
        }
    }
}

impl ZookeeperConfig {
    fn default_ensemble() -> String {
        "localhost:2181".into()
    }

    fn default_timeout() -> u64 {
        10
    }
}

/// Retry policy for transient coordination store errors.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Give up after this many attempts.
    #[serde(default = "RetryConfig::default_attempts")]
    pub attempts: u32,

    /// Delay before the first retry; doubles on every attempt.
    #[serde(default = "RetryConfig::default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> RetryConfig {
        RetryConfig {
            attempts: Self::default_attempts(),
            base_delay_ms: Self::default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    fn default_attempts() -> u32 {
        5
    }

    fn default_base_delay_ms() -> u64 {
        100
    }
}

/// Distributed coordination configuration options.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, flatten)]
    pub backend: Backend,

    /// Parent path isolating every cluster managed by this store.
    #[serde(default = "Config::default_root")]
    pub root: String,

    /// Interval between cache snapshot refreshes, in milliseconds.
    #[serde(default = "Config::default_cache_refresh_ms")]
    pub cache_refresh_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            backend: Backend::default(),
            root: Self::default_root(),
            cache_refresh_ms: Self::default_cache_refresh_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    fn default_root() -> String {
        "/needlestack".into()
    }

    fn default_cache_refresh_ms() -> u64 {
        1000
    }
}
