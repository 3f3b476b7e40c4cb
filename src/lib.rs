extern crate bodyparser;
extern crate clap;
extern crate crossbeam_channel;
extern crate failure;
extern crate failure_derive;
extern crate iron;
#[cfg(test)]
extern crate iron_test;
#[macro_use]
extern crate lazy_static;
extern crate prometheus;
extern crate rand;
extern crate router;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate serde_yaml;
#[macro_use]
extern crate slog;
extern crate slog_async;
extern crate slog_json;

extern crate needlestack_balancers;
extern crate needlestack_client;
extern crate needlestack_collections;
extern crate needlestack_coordinator;
extern crate needlestack_index;
extern crate needlestack_models;

use std::sync::Arc;
use std::time::Duration;

use clap::App;
use clap::Arg;
use clap::SubCommand;
use slog::Logger;

mod components;
mod config;
mod error;
mod interfaces;
mod logging;
mod metrics;


use self::components::Merger;
use self::components::Searcher;
use self::interfaces::Interfaces;

pub use self::config::Config;
pub use self::error::Error;
pub use self::error::ErrorKind;
pub use self::error::Result;

use needlestack_client::Credentials;
use needlestack_client::SearcherPool;
use needlestack_coordinator::ClusterManager;
use needlestack_index::Fetchers;

/// Which servicer a process runs as.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
enum Role {
    Merger,
    Searcher,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Merger => "merger",
            Role::Searcher => "searcher",
        }
    }
}

/// Initialise interfaces and components and wait for the system to exit.
fn initialise_and_run(config: Config, logger: Logger, role: Role) -> Result<()> {
    info!(logger, "Initialising sub-systems ..."; "role" => role.as_str());
    let mut interfaces = Interfaces::new(&config, logger.clone())?;
    register_all_metrics(&logger, &interfaces);

    let cluster = ClusterManager::new(
        config.coordinator.clone(),
        config.cluster_name.clone(),
        config.hostport(),
        logger.clone(),
    )
    .map_err(error::from_coordinator)?;
    cluster.startup().map_err(error::from_coordinator)?;
    let cluster = Arc::new(cluster);

    // Keep components alive until the API server stops.
    let mut _searcher = None;
    let mut _merger = None;
    match role {
        Role::Searcher => {
            let fetchers = Fetchers::filesystem(config.storage.blob_root.clone());
            let searcher = Arc::new(Searcher::new(
                Arc::clone(&cluster),
                fetchers,
                logger.clone(),
            ));
            searcher.startup()?;
            Searcher::attach(&searcher, &mut interfaces.api, &logger);
            _searcher = Some(searcher);
        }
        Role::Merger => {
            let timeout = Duration::from_secs(config.timeouts.searchers);
            let pool = Arc::new(SearcherPool::http(timeout));
            let credentials = Credentials {
                ca_cert_file: config.api.tls.ca_cert.clone(),
            };
            let merger = Arc::new(Merger::new(
                Arc::clone(&cluster),
                pool,
                credentials,
                timeout,
                logger.clone(),
            )?);
            Merger::attach(&merger, &mut interfaces.api, &logger);
            _merger = Some(merger);
        }
    };

    info!(logger, "Starting sub-systems ...");
    interfaces.run()?;
    info!(logger, "Needlestack ready"; "role" => role.as_str());
    interfaces.wait_all()?;

    cluster.shutdown();
    info!(logger, "Needlestack stopped gracefully");
    Ok(())
}

fn register_all_metrics(logger: &Logger, interfaces: &Interfaces) {
    let registry = interfaces.metrics.registry();
    self::metrics::register_metrics(logger, registry);
    needlestack_client::register_metrics(logger, registry);
    needlestack_coordinator::register_metrics(logger, registry);
}

/// Parse command line, load configuration, initialise the logger.
///
/// Once the configuration is loaded control is passed to
/// `initialise_and_run`.
pub fn run() -> Result<()> {
    let cli_args = App::new("Needlestack")
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .default_value("needlestack.yaml")
                .help("Specifies the configuration file to use")
                .takes_value(true),
        )
        .subcommand(SubCommand::with_name("searcher").about("Run a searcher node"))
        .subcommand(SubCommand::with_name("merger").about("Run a merger node"))
        .get_matches();

    let logger = logging::starter();
    info!(logger, "Starting needlestack"; "version" => env!("CARGO_PKG_VERSION"));

    let config_location = cli_args.value_of("config").expect("config has a default");
    info!(logger, "Loading configuration ..."; "config" => config_location);
    let config = Config::from_file(config_location)?;

    let role = match cli_args.subcommand_name() {
        Some("searcher") => Role::Searcher,
        Some("merger") => Role::Merger,
        _ => {
            return Err(ErrorKind::InvalidArgument(
                "specify a role to run: searcher or merger".into(),
            )
            .into());
        }
    };

    let logger = logging::configure(&config.logging);
    debug!(logger, "Logging configured");
    let result = initialise_and_run(config, logger.clone(), role);
    warn!(logger, "Shutdown: system exiting now"; "error" => result.is_err());
    result
}
