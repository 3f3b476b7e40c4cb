use std::fs::OpenOptions;
use std::io::stdout;
use std::sync::Mutex;

use failure::Fail;
use slog::Drain;
use slog::IgnoreResult;
use slog::Logger;
use slog::Never;
use slog::SendSyncRefUnwindSafeDrain;
use slog::SendSyncUnwindSafeDrain;

use slog_async::Async;
use slog_json::Json;

/// Possible logging levels.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub enum LoggingLevel {
    #[serde(rename = "critical")]
    Critical,

    #[serde(rename = "error")]
    Error,

    #[serde(rename = "warning")]
    Warning,

    #[serde(rename = "info")]
    Info,

    #[serde(rename = "debug")]
    Debug,
}

impl Default for LoggingLevel {
    fn default() -> LoggingLevel {
        LoggingLevel::Info
    }
}

impl From<LoggingLevel> for ::slog::Level {
    fn from(level: LoggingLevel) -> Self {
        match level {
            LoggingLevel::Critical => ::slog::Level::Critical,
            LoggingLevel::Error => ::slog::Level::Error,
            LoggingLevel::Warning => ::slog::Level::Warning,
            LoggingLevel::Info => ::slog::Level::Info,
            LoggingLevel::Debug => ::slog::Level::Debug,
        }
    }
}

/// Logging configuration options.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Flush logs asynchronously.
    #[serde(default = "LoggingConfig::default_async_flush", rename = "async")]
    pub async_flush: bool,

    /// Write JSON log lines to this file instead of stdout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// The minimum logging level.
    #[serde(default)]
    pub level: LoggingLevel,
}

impl Default for LoggingConfig {
    fn default() -> LoggingConfig {
        LoggingConfig {
            async_flush: true,
            file: None,
            level: LoggingLevel::default(),
        }
    }
}

impl LoggingConfig {
    fn default_async_flush() -> bool {
        true
    }
}

/// Alternative implementation of slog's `LevelFilter` with `Ok == ()`.
///
/// The stock `LevelFilter` wraps `D::Ok` into an `Option`, which stops the
/// filtering drain from being wrapped into a `Logger`.
#[derive(Debug, Clone)]
struct LevelFilter<D: Drain>(pub D, pub ::slog::Level);

impl<D: Drain> Drain for LevelFilter<D> {
    type Ok = ();
    type Err = D::Err;

    fn log(
        &self,
        record: &::slog::Record,
        logger_values: &::slog::OwnedKVList,
    ) -> Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.1) {
            self.0.log(record, logger_values)?;
        }
        Ok(())
    }
}

fn into_logger<D>(drain: D) -> Logger
where
    D: SendSyncUnwindSafeDrain<Ok = (), Err = Never>,
    D: 'static + SendSyncRefUnwindSafeDrain<Ok = (), Err = Never>,
{
    Logger::root(drain, o!("version" => env!("CARGO_PKG_VERSION")))
}

fn config_async<D>(config: &LoggingConfig, drain: D) -> Logger
where
    D: SendSyncUnwindSafeDrain<Ok = (), Err = Never>,
    D: 'static + SendSyncRefUnwindSafeDrain<Ok = (), Err = Never>,
{
    if config.async_flush {
        into_logger(Async::new(drain).build().ignore_res())
    } else {
        into_logger(drain)
    }
}

fn config_level<D>(config: &LoggingConfig, drain: D) -> Logger
where
    D: SendSyncUnwindSafeDrain<Ok = (), Err = Never>,
    D: 'static + SendSyncRefUnwindSafeDrain<Ok = (), Err = Never>,
{
    let drain = LevelFilter(drain, config.level.clone().into());
    config_async(config, drain)
}

/// Creates a `Logger` based on the given configuration.
///
/// Filters apply before the async stage, processing after it.
pub fn configure(config: &LoggingConfig) -> Logger {
    match config.file {
        Some(ref file) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .expect("Unable to open log file");
            let drain = Mutex::new(Json::default(file)).map(IgnoreResult::new);
            config_level(config, drain)
        }
        None => {
            let drain = Mutex::new(Json::default(stdout())).map(IgnoreResult::new);
            config_level(config, drain)
        }
    }
}

/// Creates a fixed `Logger` to be used until configuration is loaded.
pub fn starter() -> Logger {
    let drain = Mutex::new(Json::default(stdout())).map(IgnoreResult::new);
    into_logger(drain)
}

/// Structured key/value pairs describing a failure and its chain.
pub fn failure_info(error: &dyn Fail) -> (String, String) {
    let mut causes = Vec::new();
    let mut current = error.cause();
    while let Some(cause) = current {
        causes.push(cause.to_string());
        current = cause.cause();
    }
    (error.to_string(), causes.join("; "))
}
