use anyhow::Result;
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE: &str = "cli.log";

/// Initialize logging for the CLI
///
/// Logs go to stderr and, unless disabled, to `cli.log` in the data directory.
/// `RUST_LOG` overrides the level filter.
pub fn init_logging(
    log_level: Level,
    data_dir: Option<PathBuf>,
    no_file_log: bool,
    json: bool,
) -> Result<()> {
    let stderr = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .boxed()
    };

    let file = if no_file_log {
        None
    } else {
        let log_file_path = crate::config::data_dir(data_dir).join(LOG_FILE);
        if let Some(parent) = log_file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_file_path)?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false),
        )
    };

    tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(stderr)
        .with(file)
        .init();

    Ok(())
}

fn env_filter(level: Level) -> EnvFilter {
    let level = level.as_str().to_lowercase();
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "canvass={level},canvass_core={level},canvass_http={level},\
             canvass_session={level},canvass_notify={level}"
        )
        .into()
    })
}
