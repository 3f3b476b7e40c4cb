use slog::Logger;

use super::config::Config;
use super::Result;

pub mod api;
mod metrics;

pub use self::api::API;
pub use self::metrics::Metrics;

/// A container for the process interfaces.
///
/// Interfaces are units used to inspect the system or interact with it;
/// components implement logic on top of them.
pub struct Interfaces {
    pub api: API,
    pub metrics: Metrics,
}

impl Interfaces {
    /// Creates and configures interfaces.
    pub fn new(config: &Config, logger: Logger) -> Result<Interfaces> {
        let api = API::new(&config.api, config.port, logger);
        let metrics = Metrics::new();
        Ok(Interfaces { api, metrics })
    }

    /// Performs any final configuration and starts background threads.
    pub fn run(&mut self) -> Result<()> {
        let handler = self.metrics.handler();
        self.api.router().get("/metrics", handler, "metrics");
        self.metrics.run()?;
        self.api.run()?;
        Ok(())
    }

    /// Waits for all interfaces to terminate.
    pub fn wait_all(&mut self) -> Result<()> {
        self.api.wait()?;
        self.metrics.wait()?;
        Ok(())
    }
}
