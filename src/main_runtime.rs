use robo::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Console logging plus a daily-rotating file under `ROBO_LOG_DIR` when that
/// directory is writable. `RUST_LOG` overrides the configured level.
pub fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},robo=debug", logging.level)));

    let log_dir = std::env::var("ROBO_LOG_DIR").ok();

    // `tracing_appender::rolling::daily` panics if it cannot create the first
    // file, so check writability up front.
    let file_layer = log_dir.as_deref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: could not create log directory {dir} ({e}), file logging disabled");
            return None;
        }
        let probe = std::path::Path::new(dir).join(".robo_write_test");
        match std::fs::OpenOptions::new().create(true).append(true).open(&probe) {
            Ok(_) => {
                let _ = std::fs::remove_file(&probe);
                let appender = tracing_appender::rolling::daily(dir, "robo.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                // lives for the whole process
                Box::leak(Box::new(guard));
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!("Warning: could not write to log directory {dir} ({e}), file logging disabled");
                None
            }
        }
    });

    let (json_layer, text_layer) = if logging.json {
        (Some(tracing_subscriber::fmt::layer().json().with_target(true)), None)
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();

    if let (true, Some(dir)) = (file_logging_enabled, log_dir) {
        eprintln!("Logging to: {dir}/robo.log");
    }
}

/// Warnings only, for short-lived commands
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
