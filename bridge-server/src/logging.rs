//! Tracing bootstrap: env-filtered console output plus an optional
//! non-blocking rolling file layer with retention cleanup.

use std::time::{Duration, SystemTime};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Clean up old log files based on retention policy
fn cleanup_old_logs(logging_config: &LoggingConfig) {
    use std::fs;

    // Skip cleanup if both max_files and max_age_days are 0 (unlimited)
    if logging_config.max_files == 0 && logging_config.max_age_days == 0 {
        return;
    }

    let log_dir = std::path::Path::new(&logging_config.directory);
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<_> = match fs::read_dir(log_dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| name.starts_with(&logging_config.file_prefix))
                    .unwrap_or(false)
            })
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                let modified = metadata.modified().ok()?;
                Some((entry.path(), modified))
            })
            .collect(),
        Err(e) => {
            eprintln!("Failed to read log directory: {}", e);
            return;
        }
    };

    // Sort by modified time (newest first)
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let now = SystemTime::now();
    let max_age = Duration::from_secs((logging_config.max_age_days as u64) * 24 * 60 * 60);
    let mut deleted_count = 0;

    for (idx, (path, modified)) in log_files.iter().enumerate() {
        let mut should_delete = false;

        if logging_config.max_files > 0 && idx >= logging_config.max_files as usize {
            should_delete = true;
        }

        if logging_config.max_age_days > 0 {
            if let Ok(age) = now.duration_since(*modified) {
                if age > max_age {
                    should_delete = true;
                }
            }
        }

        if should_delete {
            match fs::remove_file(path) {
                Ok(_) => deleted_count += 1,
                Err(e) => eprintln!("Failed to delete log file {:?}: {}", path, e),
            }
        }
    }

    if deleted_count > 0 {
        eprintln!("Cleaned up {} old log file(s)", deleted_count);
    }
}

/// Initialize the global tracing subscriber.
/// Default to info level for all modules; can be overridden via RUST_LOG.
pub fn init(config: &LoggingConfig) {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer());

    if config.enabled {
        use tracing_appender::rolling;

        if let Err(e) = std::fs::create_dir_all(&config.directory) {
            eprintln!("Failed to create log directory {}: {}", config.directory, e);
        }

        cleanup_old_logs(config);

        let file_appender = match config.rotation.as_str() {
            "hourly" => rolling::hourly(&config.directory, &config.file_prefix),
            "never" => rolling::never(&config.directory, &config.file_prefix),
            _ => rolling::daily(&config.directory, &config.file_prefix),
        };

        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false),
            )
            .init();

        // The guard must outlive the process for the writer to keep flushing.
        std::mem::forget(guard);
    } else {
        subscriber.init();
    }
}
