use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialise the global tracing subscriber.
///
/// Returns a [`WorkerGuard`] that **must** be held for the lifetime of the
/// process. Dropping it flushes and closes the log file writer. Fails if a
/// global subscriber is already installed.
pub fn init_tracing(logging: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&logging.log_dir)
        .with_context(|| format!("failed to create log dir {}", logging.log_dir))?;

    let file_appender = tracing_appender::rolling::daily(&logging.log_dir, &logging.file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false).json())
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true).compact())
        .try_init()
        .context("tracing subscriber already initialised")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let logging = LoggingConfig {
            log_dir: tmp.path().join("logs").display().to_string(),
            file_name: "planner.log".into(),
            filter: "multiply_planner=debug".into(),
        };
        let _guard = init_tracing(&logging).unwrap();
        assert!(tmp.path().join("logs").is_dir());
        assert!(init_tracing(&logging).is_err());
    }
}
