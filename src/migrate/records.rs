use futures_util::TryStreamExt;

use super::BucketDefinition;
use crate::error::{ModelError, StepError, StoreError};
use crate::retry::{self, Step};
use crate::store::{
    schema_marker, BucketStore, Filter, FindOptions, Precondition, RawRecord, ReadMode, WriteOp,
    SCHEMA_MARKER_FIELD,
};

/// Records with no schema marker, or one below `target`.
pub fn stale_filter(target: u32) -> Filter {
    let unmarked = Filter::not(Filter::present(SCHEMA_MARKER_FIELD));
    match target.checked_sub(1) {
        Some(previous) => Filter::Or(vec![unmarked, Filter::le(SCHEMA_MARKER_FIELD, previous)]),
        None => unmarked,
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    migrated: u64,
    passes: u32,
    conflicts: u32,
}

/// Turn one page of stale records into a single batch of writes.
///
/// Any record the model cannot rebuild fails the whole page. Each record's
/// own write is pinned to the etag it was read with, so a concurrent
/// update makes the batch conflict instead of being overwritten. Fan-out
/// writes are left as the model made them; see [`pin_fan_out`].
pub fn build_writes(def: &BucketDefinition, records: &[RawRecord]) -> Result<Vec<WriteOp>, ModelError> {
    let mut ops = Vec::with_capacity(records.len());
    for record in records {
        let entity = (def.model)(record)?;
        let mut writes = entity.to_write_ops()?;

        let primary = writes
            .iter_mut()
            .find(|op| op.bucket == def.name && op.key == record.key);
        match primary {
            Some(op) if schema_marker(&op.value) == Some(def.version) => {
                if !op.is_conditional() {
                    op.precondition = Precondition::Etag(record.etag.clone());
                }
            }
            other => {
                return Err(ModelError::StaleMarker {
                    key: record.key.clone(),
                    written: other.and_then(|op| schema_marker(&op.value)),
                    expected: def.version,
                });
            }
        }
        ops.append(&mut writes);
    }
    Ok(ops)
}

/// Condition every write the model left unconditional on the record it
/// would replace.
///
/// An absent target becomes create-only, and a target on an older layout
/// is pinned to its etag. A target already carrying the write's schema
/// marker or a newer one came from a current writer, so the write is
/// dropped and that record stands.
pub async fn pin_fan_out(store: &dyn BucketStore, ops: Vec<WriteOp>) -> Result<Vec<WriteOp>, StoreError> {
    let mut pinned = Vec::with_capacity(ops.len());
    for mut op in ops {
        if op.is_conditional() {
            pinned.push(op);
            continue;
        }
        let existing = store.get_record(&op.bucket, &op.key).await?;
        let current = existing.as_ref().and_then(RawRecord::schema_marker);
        match (current, schema_marker(&op.value)) {
            (Some(found), Some(writing)) if found >= writing => {
                tracing::debug!(
                    bucket = %op.bucket,
                    key = %op.key,
                    found,
                    "Fan-out target already current, keeping it"
                );
                continue;
            }
            _ => {}
        }
        op.precondition = Precondition::observed(existing.map(|r| r.etag));
        pinned.push(op);
    }
    Ok(pinned)
}

/// Rewrite every record still on an older schema version through the
/// bucket's model.
///
/// Loops until a scan finds nothing stale. An etag conflict means live
/// traffic touched a record mid-pass, or a fan-out target: the batch is
/// dropped and the next scan picks up whatever the other writer left.
#[tracing::instrument(skip_all, fields(bucket = %def.name, version = def.version))]
pub async fn migrate_records(
    store: &dyn BucketStore,
    def: &BucketDefinition,
    page_size: usize,
) -> Result<u64, StepError> {
    let name = def.name.as_str();
    let filter = stale_filter(def.version);
    let filter = &filter;
    let options = FindOptions {
        read: ReadMode::Fresh,
        limit: page_size,
    };
    tracing::debug!(%filter, "Scanning for stale records");

    let progress = retry::drive(Progress::default(), |mut progress| async move {
        progress.passes += 1;
        let records: Vec<RawRecord> = match store.find(name, filter, options).try_collect().await {
            Ok(records) => records,
            Err(e) => return Step::Failed(StepError::Store(e)),
        };
        if records.is_empty() {
            return Step::Done(progress);
        }

        let ops = match build_writes(def, &records) {
            Ok(ops) => ops,
            Err(e) => return Step::Failed(StepError::Model(e)),
        };
        let ops = match pin_fan_out(store, ops).await {
            Ok(ops) => ops,
            Err(e) => return Step::Failed(StepError::Store(e)),
        };

        match store.batch(&ops).await {
            Ok(()) => {
                progress.migrated += records.len() as u64;
                tracing::debug!(
                    records = records.len(),
                    writes = ops.len(),
                    total = progress.migrated,
                    "Migrated batch"
                );
                Step::again(progress)
            }
            Err(e) if e.is_etag_conflict() => {
                progress.conflicts += 1;
                tracing::warn!(
                    conflicts = progress.conflicts,
                    "Concurrent update during migration, rescanning: {}", e
                );
                Step::again(progress)
            }
            Err(e) => Step::Failed(StepError::Store(e)),
        }
    })
    .await?;

    if progress.migrated == 0 {
        tracing::info!("Records already migrated");
    } else {
        tracing::info!(
            total = progress.migrated,
            passes = progress.passes,
            conflicts = progress.conflicts,
            "Record migration complete"
        );
    }
    Ok(progress.migrated)
}
