//! Logging and tracing infrastructure
//!
//! - JSON file logging, rolled daily (always on)
//! - Console logging to stderr (verbose only)
//! - OpenTelemetry span export over OTLP/HTTP (when an endpoint is set)

use crate::config::TelemetryConfig;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

const SERVICE_NAME: &str = "orion-butler";
const LOG_FILE_PREFIX: &str = "butler.log";

/// Keeps the log writer and span exporter alive; flushes on drop
pub struct TelemetryGuard {
    session_id: Uuid,
    log_dir: PathBuf,
    _file_guard: WorkerGuard,
    otel_provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Id of this process run, attached to the startup log line
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.otel_provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to flush spans: {}", e);
            }
        }
    }
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug,hyper=info,h2=info,rustls=info")
        } else {
            EnvFilter::new("info,hyper=warn,h2=warn,rustls=warn")
        }
    })
}

/// Install the global subscriber
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging(config: &TelemetryConfig, log_dir: &Path) -> anyhow::Result<TelemetryGuard> {
    std::fs::create_dir_all(log_dir)?;
    let session_id = Uuid::new_v4();

    // Set up file appender for JSON logs
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);

    let otel_provider = if let Some(endpoint) = config.otel_endpoint.as_deref() {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()?;

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
            .build();

        let tracer = provider.tracer(SERVICE_NAME);
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        let console = config
            .verbose
            .then(|| fmt::layer().with_target(false).compact().with_writer(std::io::stderr));

        tracing_subscriber::registry()
            .with(env_filter(config.verbose))
            .with(console)
            .with(fmt::layer().json().with_writer(non_blocking))
            .with(otel_layer)
            .try_init()
            .ok();
        Some(provider)
    } else if config.verbose {
        // Verbose mode: console + file
        tracing_subscriber::registry()
            .with(env_filter(true))
            .with(fmt::layer().with_target(false).compact().with_writer(std::io::stderr))
            .with(fmt::layer().json().with_writer(non_blocking))
            .try_init()
            .ok();
        None
    } else {
        // Normal mode: file only (no console noise in the REPL)
        tracing_subscriber::registry()
            .with(env_filter(false))
            .with(fmt::layer().json().with_writer(non_blocking))
            .try_init()
            .ok();
        None
    };

    tracing::info!(
        session_id = %session_id,
        log_dir = %log_dir.display(),
        otel_enabled = otel_provider.is_some(),
        "Telemetry initialized"
    );

    Ok(TelemetryGuard {
        session_id,
        log_dir: log_dir.to_path_buf(),
        _file_guard: file_guard,
        otel_provider,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_log_dir_and_is_repeatable() {
        let temp = TempDir::new().unwrap();
        let log_dir = temp.path().join("logs");
        let config = TelemetryConfig::default();

        let first = init_logging(&config, &log_dir).unwrap();
        assert!(log_dir.is_dir());
        assert_eq!(first.log_dir(), log_dir.as_path());

        let second = init_logging(&config, &log_dir).unwrap();
        assert_ne!(first.session_id(), second.session_id());
    }
}
