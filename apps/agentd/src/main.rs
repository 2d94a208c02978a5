//! Edge file-upload agent entry point.

mod app;
mod flags;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use uplift_agent::LogConfig;

fn main() -> anyhow::Result<()> {
    let config = flags::parse()?;
    let _log_guard = init_logging(&config.log)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting uplift agent"
    );
    tracing::info!(
        name = %config.uploadable.name,
        files = %config.files,
        mode = %config.mode,
        "uploadable configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("agent shut down cleanly");
    Ok(())
}

/// Initializes structured logging; the returned guard must stay alive so
/// buffered file output is flushed on exit.
fn init_logging(log: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log.log_level.to_lowercase()));

    if log.log_file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log.log_file)?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(Some(guard))
}
