use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogConfig, LogFormat};

/// Global crash log directory, set during init.
static CRASH_LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

pub const LOG_FILE_PREFIX: &str = "bucket-migrator.log";

/// Initialize tracing with stdout, optional file and Sentry layers.
///
/// - Stdout: compact human-readable lines, or one JSON object per event
/// - File: daily-rolling, written off-thread, only when `config.dir` is set
/// - Sentry: captures ERROR events as issues, WARN as breadcrumbs
/// - Default filter from `config.filter`, override via RUST_LOG env
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and closes the file writer.
pub fn init(config: &LogConfig) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let (compact_layer, json_layer) = match config.format {
        LogFormat::Compact => (
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(fmt::layer().json().with_current_span(true).with_span_list(false)),
        ),
    };

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_target(true).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // Routes existing tracing::error!/warn! calls to Sentry automatically.
    // No-op when Sentry DSN is not configured.
    let sentry_layer = sentry_tracing::layer().event_filter(|meta| match *meta.level() {
        tracing::Level::ERROR => sentry_tracing::EventFilter::Event,
        tracing::Level::WARN => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    });

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(compact_layer)
        .with(json_layer)
        .with(file_layer)
        .with(sentry_layer)
        .try_init();
    if let Err(e) = installed {
        eprintln!("[logging] subscriber already installed: {e}");
    }

    tracing::debug!(format = ?config.format, dir = ?config.dir, "Tracing initialized");
    guard
}

/// Install a panic hook that writes crash details to `<dir>/crash_logs`
/// before handing off to the previous hook.
pub fn install_crash_hook(dir: &Path) {
    // Ensure backtraces are captured with full symbols
    if std::env::var("RUST_BACKTRACE").is_err() {
        std::env::set_var("RUST_BACKTRACE", "full");
    }

    let crash_dir = dir.join("crash_logs");
    if let Err(e) = std::fs::create_dir_all(&crash_dir) {
        tracing::warn!(dir = %crash_dir.display(), "Cannot create crash log directory: {}", e);
        return;
    }
    CRASH_LOG_DIR.set(crash_dir).ok();

    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if let Some(dir) = CRASH_LOG_DIR.get() {
            let now = chrono::Local::now();
            let path = dir.join(format!("crash_{}.log", now.format("%Y%m%d_%H%M%S")));

            let message = info
                .payload()
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "<unknown payload>".to_string());
            let location = info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
                .unwrap_or_else(|| "<unknown>".to_string());
            let thread = std::thread::current();

            let report = format!(
                "=== BUCKET MIGRATOR CRASH REPORT ===\n\
                 Time: {}\n\
                 Version: {}\n\n\
                 Panic: {}\n\
                 Location: {}\n\n\
                 Backtrace:\n{}\n\n\
                 Thread: {:?} (id: {:?})\n",
                now.to_rfc3339(),
                env!("CARGO_PKG_VERSION"),
                message,
                location,
                std::backtrace::Backtrace::force_capture(),
                thread.name(),
                thread.id(),
            );

            let _ = std::fs::write(&path, &report);
            eprintln!("[CRASH] Report written to: {}", path.display());
        }

        // Call the previous hook (Sentry, default, etc.)
        prev_hook(info);
    }));

    tracing::info!("Crash hook installed");
}
