use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde_yaml;

use failure::ResultExt;

use needlestack_coordinator::Config as CoordinatorConfig;

use super::logging::LoggingConfig;
use super::ErrorKind;
use super::Result;

/// Needlestack configuration options.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Path segment under the coordination root isolating this cluster.
    #[serde(default = "Config::default_cluster_name")]
    pub cluster_name: String,

    /// Hostname other nodes reach this process at.
    #[serde(default = "Config::default_host")]
    pub host: String,

    /// Port the API server listens on.
    #[serde(default = "Config::default_port")]
    pub port: u16,

    /// API server configuration.
    #[serde(default)]
    pub api: APIConfig,

    /// Coordination store configuration.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Data source configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Timeouts used throughout the system.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            cluster_name: Self::default_cluster_name(),
            host: Self::default_host(),
            port: Self::default_port(),
            api: APIConfig::default(),
            coordinator: CoordinatorConfig::default(),
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
            timeouts: TimeoutsConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from the given [`std::fs::File`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let config = File::open(path.as_ref()).with_context(|_| {
            ErrorKind::InvalidArgument(format!(
                "could not open configuration file {}",
                path.as_ref().display()
            ))
        })?;
        Config::from_reader(config)
    }

    /// Loads the configuration from the given [`std::io::Read`].
    pub fn from_reader<R: Read>(reader: R) -> Result<Config> {
        let conf = serde_yaml::from_reader(reader).with_context(|_| {
            ErrorKind::InvalidArgument("could not parse configuration".into())
        })?;
        Ok(conf)
    }

    /// Identity of this node for registration and replica ownership.
    pub fn hostport(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn default_cluster_name() -> String {
        "needlestack".into()
    }

    fn default_host() -> String {
        "localhost".into()
    }

    fn default_port() -> u16 {
        50051
    }
}

/// API server configuration options.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct APIConfig {
    /// Address the server binds; defaults to all interfaces on `port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Bounded worker pool size for request handling.
    #[serde(default = "APIConfig::default_threads")]
    pub threads: usize,

    /// Optional TLS material.
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for APIConfig {
    fn default() -> APIConfig {
        APIConfig {
            bind: None,
            threads: Self::default_threads(),
            tls: TlsConfig::default(),
        }
    }
}

impl APIConfig {
    fn default_threads() -> usize {
        8
    }
}

/// TLS material for inter-node calls.
///
/// Certificate termination for the embedded server is left to the
/// deployment (sidecar or load balancer); the CA certificate configured
/// here is what outbound clients verify against.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_cert: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_key: Option<String>,
}

/// Data source configuration options.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory blob data sources resolve under.
    #[serde(default = "StorageConfig::default_blob_root")]
    pub blob_root: String,
}

impl Default for StorageConfig {
    fn default() -> StorageConfig {
        StorageConfig {
            blob_root: Self::default_blob_root(),
        }
    }
}

impl StorageConfig {
    fn default_blob_root() -> String {
        "/var/lib/needlestack/blobs".into()
    }
}

/// Timeouts configured here are used throughout the system.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Time after which RPCs to searchers are failed, in seconds.
    #[serde(default = "TimeoutsConfig::default_searchers")]
    pub searchers: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> TimeoutsConfig {
        TimeoutsConfig {
            searchers: Self::default_searchers(),
        }
    }
}

impl TimeoutsConfig {
    fn default_searchers() -> u64 {
        15
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::Config;

    #[test]
    fn from_reader_error() {
        let cursor = Cursor::new("just a string");
        assert!(Config::from_reader(cursor).is_err());
    }

    #[test]
    fn from_reader_defaults() {
        let cursor = Cursor::new("{}");
        let config = Config::from_reader(cursor).unwrap();
        assert_eq!(config.cluster_name, "needlestack");
        assert_eq!(config.hostport(), "localhost:50051");
        assert_eq!(config.api.threads, 8);
    }

    #[test]
    fn from_reader_overrides() {
        let payload = concat!(
            "cluster_name: prod\n",
            "host: search-1.internal\n",
            "port: 9200\n",
            "api:\n",
            "  threads: 32\n",
            "coordinator:\n",
            "  backend: zookeeper\n",
            "  options:\n",
            "    ensemble: zoo1:2181,zoo2:2181\n",
            "timeouts:\n",
            "  searchers: 3\n",
        );
        let config = Config::from_reader(Cursor::new(payload)).unwrap();
        assert_eq!(config.cluster_name, "prod");
        assert_eq!(config.hostport(), "search-1.internal:9200");
        assert_eq!(config.api.threads, 32);
        assert_eq!(config.timeouts.searchers, 3);
    }
}
