//! modscan common library
//!
//! Shared plumbing for the modscan crates:
//!
//! - [`config`] - Logging configuration and JSON5 loading helpers
//! - [`error`] - Error types
//! - [`init_tracing`] - Installs the process log sink

pub mod config;
pub mod error;

pub use config::{LogFormat, LoggingConfig, load_config, parse_config};
pub use error::{Error, Result};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// Events are written to stderr so stdout stays free for scan output. The
/// `RUST_LOG` environment variable takes precedence over `config.level`.
///
/// # Example
///
/// ```ignore
/// use modscan_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .try_init()
                .map_err(|e| Error::Logging(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(filter)
                .try_init()
                .map_err(|e| Error::Logging(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
