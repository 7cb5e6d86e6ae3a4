//! Tracing setup for binaries and tests embedding the engine.

use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use hybridmem_config::{LogFormat, LoggingConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the file writer flushing for the life of the process.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` overrides `config.filter`. Returns `Ok(false)` when a global
/// subscriber was already installed, so calling this twice is harmless.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.filter))?;

    let mut layers: Vec<BoxedLayer> = vec![console_layer(config)];

    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir)?;
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("hybridmem")
            .filename_suffix("log")
            .max_log_files(30)
            .build(dir)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        layers.push(fmt::layer().with_writer(writer).with_ansi(false).boxed());
    }

    let installed = tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .is_ok();
    Ok(installed)
}

fn console_layer(config: &LoggingConfig) -> BoxedLayer {
    match config.format {
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_ansi(config.ansi)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(false).boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            log_dir: Some(dir.path().join("logs")),
            ansi: false,
            ..Default::default()
        };

        init_tracing(&config).unwrap();
        assert!(!init_tracing(&config).unwrap());
        assert!(dir.path().join("logs").is_dir());
        tracing::info!("telemetry test event");
    }

    #[test]
    fn test_bad_filter_is_rejected() {
        // Only meaningful when RUST_LOG does not take precedence.
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            filter: "hybridmem=notalevel".to_string(),
            ..Default::default()
        };
        assert!(init_tracing(&config).is_err());
    }
}
