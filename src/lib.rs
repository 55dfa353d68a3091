pub mod config;
pub mod error;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod retry;
pub mod store;

use std::process::ExitCode;
use std::sync::Arc;

pub use config::MigratorConfig;
pub use error::{AppError, MigrateError, ModelError, StepError, StepKind, StoreError};
pub use migrate::{migrate, BucketDefinition, MigrationOptions, MigrationReport, MigrationStatus, Migrator};
pub use store::{BucketStore, Filter, Precondition, RawRecord, WriteOp};

use store::sqlite::SqliteStore;

/// Binary entry point: load config, set up logging, migrate the store.
pub fn run() -> ExitCode {
    let config = match MigratorConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("bucket-migrator: {e}");
            return ExitCode::from(2);
        }
    };

    let _log_guard = logging::init(&config.log);
    if let Some(dir) = &config.log.dir {
        logging::install_crash_hook(dir);
    }
    tracing::info!("Starting bucket-migrator v{}", env!("CARGO_PKG_VERSION"));

    match run_with(&config) {
        Ok(report) => {
            match serde_json::to_string(&report) {
                Ok(json) => tracing::info!(report = %json, "Migration finished"),
                Err(e) => tracing::warn!("Could not serialize migration report: {}", e),
            }
            ExitCode::SUCCESS
        }
        Err(AppError::Migrate(e)) => {
            tracing::error!(bucket = %e.bucket, step = %e.step, "Migration failed: {}", e.source);
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(kind = e.kind(), "Startup failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Open the SQLite store named by `config` and run every bucket migration
/// on a single-threaded runtime.
pub fn run_with(config: &MigratorConfig) -> Result<MigrationReport, AppError> {
    let store = SqliteStore::open(&config.db_path)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let definitions = model::bucket_definitions();
    let migrator = Migrator::new(Arc::new(store)).with_options(config.migration_options());
    let report = runtime.block_on(migrator.run(&definitions))?;
    Ok(report)
}
