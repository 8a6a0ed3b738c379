//! Process-wide logging setup.
//!
//! Library code only emits `tracing` events. Binaries call [`init_logging`]
//! once to install a subscriber; `RUST_LOG` overrides the default filter.

use tracing_log::LogTracer;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

use crate::error::{KycError, KycResult};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "warn,kycverify_core=info,kycverify=info";

/// Installs the global subscriber: an [`EnvFilter`] plus a fmt layer writing
/// to stderr.
///
/// Records emitted through the `log` crate by dependencies are forwarded into
/// `tracing`. Debug and trace records from `log` are dropped; they come from
/// HTTP internals and are too noisy to be useful.
///
/// # Errors
///
/// Returns [`KycError::Configuration`] if a global subscriber or `log` logger
/// is already installed, or `default_filter` is not a valid directive.
pub fn init_logging(default_filter: &str) -> KycResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter).map_err(|e| {
            KycError::Configuration(format!("invalid log filter {default_filter:?}: {e}"))
        })?,
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr),
    );
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| KycError::Configuration(format!("failed to set subscriber: {e}")))?;

    LogTracer::builder()
        .with_max_level(log::LevelFilter::Info)
        .init()
        .map_err(|e| KycError::Configuration(format!("failed to bridge log records: {e}")))?;
    Ok(())
}
