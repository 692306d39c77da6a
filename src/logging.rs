use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber. Keep the guard alive until exit so
/// buffered file output is flushed.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender(config));

    // RUST_LOG wins over the configured level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives(config)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_current_span(false)
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stderr_layer = fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_ansi(true);
        registry.with(file_layer).with(stderr_layer).init();
    }

    guard
}

fn file_appender(config: &AppConfig) -> RollingFileAppender {
    match config.rotation.as_str() {
        "hourly" => rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => rolling::daily(&config.log_dir, &config.log_file),
        _ => rolling::never(&config.log_dir, &config.log_file),
    }
}

/// Filter directives: per-lock traces only with `enable_tracing`, sqlx
/// statement logging always quiet
fn directives(config: &AppConfig) -> String {
    if config.enable_tracing {
        format!("{},replica_locks::lock=debug,sqlx=warn", config.log_level)
    } else {
        format!("{},sqlx=warn", config.log_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enable_tracing: bool) -> AppConfig {
        AppConfig::from_yaml(&format!(
            "log_level: info\nlog_dir: ./logs\nlog_file: test.log\nuse_json: false\nrotation: never\nenable_tracing: {}\n",
            enable_tracing
        ))
        .unwrap()
    }

    #[test]
    fn test_directives() {
        assert_eq!(directives(&config(false)), "info,sqlx=warn");
        assert_eq!(
            directives(&config(true)),
            "info,replica_locks::lock=debug,sqlx=warn"
        );
    }

    #[test]
    fn test_directives_parse() {
        assert!(EnvFilter::try_new(directives(&config(true))).is_ok());
    }
}
