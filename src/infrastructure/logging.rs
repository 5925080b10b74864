use std::fs;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: String,
    pub file_prefix: String,
    /// Rotated files kept by `prune_old_logs`.
    pub max_files: usize,
    pub enable_console: bool,
    pub enable_file: bool,
    pub log_level: Level,
    pub enable_json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            file_prefix: "market-outbox.log".to_string(),
            max_files: 14,
            enable_console: true,
            enable_file: false,
            log_level: Level::INFO,
            enable_json: false,
        }
    }
}

fn default_filter(level: Level) -> String {
    format!("{}={},sqlx=warn,rdkafka=warn", env!("CARGO_CRATE_NAME"), level)
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
/// Keep the returned guard alive for the process lifetime, otherwise buffered
/// file output is lost.
pub fn init_logging(
    config: &LoggingConfig,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config.log_level)));

    let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();

    if config.enable_console {
        let console = fmt::layer().with_target(true).with_thread_ids(true).with_ansi(true);
        if config.enable_json {
            layers.push(Box::new(console.json()));
        } else {
            layers.push(Box::new(console));
        }
    }

    let mut guard = None;
    if config.enable_file {
        fs::create_dir_all(&config.log_dir)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, &config.file_prefix);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);

        let file = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false);
        if config.enable_json {
            layers.push(Box::new(file.json()));
        } else {
            layers.push(Box::new(file));
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()?;

    Ok(guard)
}

/// Deletes the oldest rotated files of `prefix` in `log_dir` beyond `max_files`.
/// Returns how many were removed.
pub fn prune_old_logs(log_dir: &str, prefix: &str, max_files: usize) -> std::io::Result<usize> {
    let path = Path::new(log_dir);
    if !path.exists() {
        return Ok(0);
    }

    let mut files: Vec<_> = fs::read_dir(path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.path().is_file() && entry.file_name().to_string_lossy().starts_with(prefix)
        })
        .collect();
    // Rotated names end in the date, so name order is age order.
    files.sort_by_key(|entry| entry.file_name());

    let excess = files.len().saturating_sub(max_files);
    let mut removed = 0;
    for entry in files.iter().take(excess) {
        if fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_quiets_dependencies() {
        assert_eq!(
            default_filter(Level::DEBUG),
            "market_outbox=DEBUG,sqlx=warn,rdkafka=warn"
        );
    }

    #[test]
    fn prune_keeps_newest_files() {
        let dir = std::env::temp_dir().join(format!("market-outbox-logs-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        for day in ["2026-01-01", "2026-01-02", "2026-01-03"] {
            fs::write(dir.join(format!("svc.log.{}", day)), b"x").unwrap();
        }
        fs::write(dir.join("other.txt"), b"x").unwrap();

        let removed = prune_old_logs(dir.to_str().unwrap(), "svc.log", 2).unwrap();

        assert_eq!(removed, 1);
        assert!(!dir.join("svc.log.2026-01-01").exists());
        assert!(dir.join("svc.log.2026-01-03").exists());
        assert!(dir.join("other.txt").exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn prune_ignores_missing_dir() {
        assert_eq!(prune_old_logs("/nonexistent/market-outbox", "x", 1).unwrap(), 0);
    }
}
