use crate::config::LoggingOptions;
use crate::error::UploadError;
use std::sync::{LazyLock, Mutex, Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: Once = Once::new();

// Keep the guard alive for the lifetime of the program
static FILE_APPENDER_GUARD: LazyLock<Mutex<Option<tracing_appender::non_blocking::WorkerGuard>>> =
    LazyLock::new(|| Mutex::new(None));

pub const LOG_FILE_PREFIX: &str = "upload-engine.log";

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging(options: &LoggingOptions) -> Result<(), UploadError> {
    if let Some(dir) = &options.directory {
        std::fs::create_dir_all(dir)?;
    }

    LOGGER_INITIALIZED.call_once(|| {
        let console_layer = if options.json {
            fmt::layer()
                .json()
                .with_target(false)
                .with_filter(env_filter(&options.level))
                .boxed()
        } else {
            fmt::layer()
                .compact()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_filter(env_filter(&options.level))
                .boxed()
        };

        let file_layer = options.directory.as_ref().map(|dir| {
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            if let Ok(mut guard_mutex) = FILE_APPENDER_GUARD.lock() {
                *guard_mutex = Some(guard);
            }

            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter(&options.level))
        });

        let result = tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .try_init();
        if let Err(e) = result {
            eprintln!("Failed to install tracing subscriber: {}", e);
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempdir().unwrap();
        let options = LoggingOptions {
            level: "debug".to_string(),
            directory: Some(dir.path().join("logs")),
            json: false,
        };

        init_logging(&options).unwrap();
        init_logging(&options).unwrap();

        assert!(dir.path().join("logs").is_dir());
        assert!(LOGGER_INITIALIZED.is_completed());
    }
}
