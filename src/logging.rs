//! Tracing setup.
//!
//! Controllers and local commands log to stdout plus two daily-rolled files (text and JSON).
//! Replicas log to stdout only; the container runtime collects it.

use std::path::Path;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Stdout plus `{log_dir}/crawl-fleet.log` and `{log_dir}/crawl-fleet.json.log`, rotated daily.
///
/// `RUST_LOG` controls filtering, default `info`
/// (e.g. `RUST_LOG=crawl_fleet=debug,reqwest=warn`).
pub fn init_logging<P: AsRef<Path>>(log_dir: P) -> Result<(), Box<dyn std::error::Error>> {
    let log_path = log_dir.as_ref();
    std::fs::create_dir_all(log_path)?;

    let text_appender = tracing_appender::rolling::daily(log_path, "crawl-fleet.log");
    let (text_writer, text_guard) = tracing_appender::non_blocking(text_appender);

    let json_appender = tracing_appender::rolling::daily(log_path, "crawl-fleet.json.log");
    let (json_writer, json_guard) = tracing_appender::non_blocking(json_appender);

    let text_layer = fmt::layer()
        .with_writer(text_writer)
        .with_target(true)
        .with_line_number(true)
        .with_ansi(false)
        .compact()
        .with_filter(env_filter());

    let json_layer = fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_target(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_filter(env_filter());

    let stdout_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(env_filter());

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(stdout_layer)
        .try_init()?;

    // Guards flush on drop; the process owns them until exit.
    Box::leak(Box::new(text_guard));
    Box::leak(Box::new(json_guard));

    tracing::debug!(dir = %log_path.display(), "file logging initialized");
    Ok(())
}

/// Stdout only, with targets, for replicas running inside the cluster.
pub fn init_stdout_logging() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .compact()
                .with_filter(env_filter()),
        )
        .try_init()?;
    Ok(())
}
