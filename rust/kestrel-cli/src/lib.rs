//! Kestrel CLI library.
//!
//! Configuration loading and the subcommands behind the `kestrel` binary.

pub mod colors;
pub mod commands;
pub mod config;
pub mod error;

pub use config::{ConfigError, KestrelConfig, LogConfig, ModuleDecl};
pub use error::CliError;

use tracing_subscriber::EnvFilter;

/// Environment variable holding a `tracing` filter; overrides the config.
pub const LOG_ENV: &str = "KESTREL_LOG";

/// Install the stderr subscriber. `KESTREL_LOG` wins over `log.level`.
pub fn init_logging(log: &LogConfig) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
