//! Start-up migration engine.
//!
//! [`Migrator::run`] waits for the store to reach the capability level
//! every bucket needs, then takes each bucket in turn through
//! upgrade → reindex → record migration. Each step is idempotent, so a
//! crash at any point is recovered by simply running again.

pub mod records;
pub mod reindex;
pub mod status;
pub mod upgrade;
pub mod version_gate;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::{MigrateError, StepError, StepKind};
use crate::model::ModelFactory;
use crate::retry::RetryPolicy;
use crate::store::{BucketSchema, BucketState, BucketStore, IndexType, DEFAULT_PAGE_SIZE, SCHEMA_MARKER_FIELD};

pub use status::{MigrationPhase, MigrationStatus};
pub use upgrade::UpgradeOutcome;

/// Delay between capability-version checks while the store is behind.
pub const DEFAULT_VERSION_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Records reindexed per store call.
pub const DEFAULT_REINDEX_BATCH_SIZE: u32 = 100;

// =============================================================================
// Bucket definitions
// =============================================================================

/// Static description of one bucket at the version this build expects.
#[derive(Clone)]
pub struct BucketDefinition {
    pub name: String,
    pub version: u32,
    pub min_store_version: u32,
    pub schema: BucketSchema,
    pub model: ModelFactory,
}

impl BucketDefinition {
    /// The schema always gains an index on the schema marker, which record
    /// migration queries on.
    pub fn new(name: impl Into<String>, version: u32, schema: BucketSchema, model: ModelFactory) -> Self {
        let mut schema = schema;
        schema
            .index
            .entry(SCHEMA_MARKER_FIELD.to_string())
            .or_insert(IndexType::Number);
        Self {
            name: name.into(),
            version,
            min_store_version: 0,
            schema,
            model,
        }
    }

    pub fn with_min_store_version(mut self, version: u32) -> Self {
        self.min_store_version = version;
        self
    }

    /// Bucket metadata this definition upgrades the store to.
    pub fn target_state(&self) -> BucketState {
        BucketState {
            schema: self.schema.clone(),
            version: self.version,
        }
    }
}

impl fmt::Debug for BucketDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketDefinition")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("min_store_version", &self.min_store_version)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Options and reports
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOptions {
    pub version_poll_interval: Duration,
    pub upgrade_retry: RetryPolicy,
    pub reindex_batch_size: u32,
    pub page_size: usize,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            version_poll_interval: DEFAULT_VERSION_POLL_INTERVAL,
            upgrade_retry: RetryPolicy::default(),
            reindex_batch_size: DEFAULT_REINDEX_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketReport {
    pub name: String,
    pub upgrade: UpgradeOutcome,
    pub reindexed: u64,
    pub migrated: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub capability_version: u32,
    pub buckets: Vec<BucketReport>,
}

impl MigrationReport {
    pub fn bucket(&self, name: &str) -> Option<&BucketReport> {
        self.buckets.iter().find(|b| b.name == name)
    }
}

// =============================================================================
// Pipeline
// =============================================================================

const PIPELINE: [StepKind; 3] = [StepKind::Upgrade, StepKind::Reindex, StepKind::MigrateRecords];

/// Per-bucket state handed from step to step.
struct BucketContext<'a> {
    store: &'a dyn BucketStore,
    def: &'a BucketDefinition,
    options: &'a MigrationOptions,
    upgrade: Option<UpgradeOutcome>,
    reindexed: u64,
    migrated: u64,
}

impl BucketContext<'_> {
    /// A bucket found at a newer version belongs to a newer build; leave it alone.
    fn finished_early(&self) -> bool {
        matches!(self.upgrade, Some(UpgradeOutcome::NewerThanCurrent { .. }))
    }

    fn into_report(self) -> BucketReport {
        BucketReport {
            name: self.def.name.clone(),
            upgrade: self.upgrade.unwrap_or(UpgradeOutcome::Unchanged),
            reindexed: self.reindexed,
            migrated: self.migrated,
        }
    }
}

async fn run_step(step: StepKind, ctx: &mut BucketContext<'_>) -> Result<(), StepError> {
    match step {
        StepKind::Upgrade => {
            let outcome = upgrade::put_bucket(ctx.store, ctx.def, &ctx.options.upgrade_retry).await?;
            ctx.upgrade = Some(outcome);
        }
        StepKind::Reindex => {
            ctx.reindexed =
                reindex::reindex_bucket(ctx.store, ctx.def, ctx.options.reindex_batch_size).await?;
        }
        StepKind::MigrateRecords => {
            ctx.migrated = records::migrate_records(ctx.store, ctx.def, ctx.options.page_size).await?;
        }
    }
    Ok(())
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Migrator {
    store: Arc<dyn BucketStore>,
    options: MigrationOptions,
    status: Arc<MigrationStatus>,
}

impl Migrator {
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self {
            store,
            options: MigrationOptions::default(),
            status: Arc::new(MigrationStatus::new()),
        }
    }

    pub fn with_options(mut self, options: MigrationOptions) -> Self {
        self.options = options;
        self
    }

    /// Share a status handle the hosting service already holds.
    pub fn with_status(mut self, status: Arc<MigrationStatus>) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> Arc<MigrationStatus> {
        self.status.clone()
    }

    /// Migrate every bucket in `definitions`, in order.
    ///
    /// Blocks (asynchronously, without bound) until the store's capability
    /// version satisfies every definition. The first fatal step error aborts
    /// the run; buckets already migrated stay migrated.
    pub async fn run(&self, definitions: &[BucketDefinition]) -> Result<MigrationReport, MigrateError> {
        let store = self.store.as_ref();
        let capability_version = version_gate::wait_for_store(
            store,
            definitions,
            self.options.version_poll_interval,
            &self.status,
        )
        .await;

        let mut buckets = Vec::with_capacity(definitions.len());
        for def in definitions {
            let mut ctx = BucketContext {
                store,
                def,
                options: &self.options,
                upgrade: None,
                reindexed: 0,
                migrated: 0,
            };
            for step in PIPELINE {
                if ctx.finished_early() {
                    break;
                }
                self.status.set(MigrationPhase::Migrating {
                    bucket: def.name.clone(),
                    step,
                });
                if let Err(source) = run_step(step, &mut ctx).await {
                    let err = MigrateError {
                        bucket: def.name.clone(),
                        step,
                        source,
                    };
                    tracing::error!(bucket = %def.name, step = %step, "Migration aborted: {}", err.source);
                    self.status.fail(&err);
                    return Err(err);
                }
            }
            let report = ctx.into_report();
            tracing::info!(
                bucket = %report.name,
                upgrade = ?report.upgrade,
                reindexed = report.reindexed,
                migrated = report.migrated,
                "Bucket migration finished"
            );
            buckets.push(report);
        }

        self.status.set(MigrationPhase::Ready);
        tracing::info!(buckets = buckets.len(), "All buckets migrated");
        Ok(MigrationReport {
            capability_version,
            buckets,
        })
    }
}

/// Migrate `definitions` with default options.
pub async fn migrate(store: Arc<dyn BucketStore>, definitions: &[BucketDefinition]) -> Result<MigrationReport, MigrateError> {
    Migrator::new(store).run(definitions).await
}
