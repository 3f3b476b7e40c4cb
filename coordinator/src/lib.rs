extern crate crossbeam_channel;
extern crate failure;
extern crate failure_derive;
#[macro_use]
extern crate lazy_static;
extern crate prometheus;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
#[macro_use]
extern crate slog;
extern crate zookeeper;

extern crate needlestack_models;

mod cache;
mod config;
mod error;
mod manager;
mod metrics;
pub mod store;

pub use self::cache::Cache;
pub use self::config::Backend as BackendConfig;
pub use self::config::Config;
pub use self::config::RetryConfig;
pub use self::config::ZookeeperConfig;
pub use self::error::Error;
pub use self::error::ErrorKind;
pub use self::error::Result;
pub use self::manager::ClusterManager;
pub use self::metrics::register_metrics;
