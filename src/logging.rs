//! `tracing` subscriber setup.
//!
//! The long-running relay logs JSON lines to a daily-rotated file under the
//! logs directory and mirrors them to stderr in the compact text format.
//! One-shot commands such as `check` log to stderr only.
//!
//! `RUST_LOG` overrides the configured level in both cases.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name prefix of the rotated relay log; the appender adds `.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "matrix-relay.log";

/// Level used when neither `RUST_LOG` nor the configured level parses.
const FALLBACK_LEVEL: &str = "info";

/// Keeps the background log writer alive. Drop it last: dropping flushes
/// buffered lines to disk.
pub struct LoggingGuard {
    _writer: WorkerGuard,
}

impl std::fmt::Debug for LoggingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingGuard").finish_non_exhaustive()
    }
}

/// Build the level filter: `RUST_LOG` first, then `configured`, then `info`.
pub fn level_filter(configured: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured))
        .unwrap_or_else(|_| EnvFilter::new(FALLBACK_LEVEL))
}

/// Install the relay's subscriber: JSON to `{logs_dir}/matrix-relay.log.*`
/// plus text on stderr.
///
/// # Errors
///
/// Fails when `logs_dir` cannot be created or another global subscriber is
/// already installed.
pub fn init_production(logs_dir: &Path, default_level: &str) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let (file_writer, writer_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(level_filter(default_level))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_writer(file_writer),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .context("failed to install log subscriber")?;

    Ok(LoggingGuard {
        _writer: writer_guard,
    })
}

/// Stderr-only logging for one-shot commands. Later calls are ignored.
pub fn init_cli(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(level_filter(default_level))
        .with_writer(std::io::stderr)
        .try_init();
}
