use super::BucketDefinition;
use crate::error::StepError;
use crate::retry::{self, Step};
use crate::store::{BucketStore, ReadMode};

/// Re-derive index values for every record written under an older schema.
///
/// Must finish before record migration: fields newly indexed by this
/// version are computed from existing payloads. Errors are not retried
/// here; a restart re-runs the reindex safely.
#[tracing::instrument(skip_all, fields(bucket = %def.name))]
pub async fn reindex_bucket(
    store: &dyn BucketStore,
    def: &BucketDefinition,
    batch_size: u32,
) -> Result<u64, StepError> {
    let name = def.name.as_str();

    let total = retry::drive(0u64, |total| async move {
        match store.reindex(name, batch_size, ReadMode::Fresh).await {
            Ok(0) => Step::Done(total),
            Ok(processed) => {
                let total = total + u64::from(processed);
                tracing::debug!(processed, total, "Reindex pass");
                Step::again(total)
            }
            Err(e) => Step::Failed(e),
        }
    })
    .await?;

    if total == 0 {
        tracing::info!("Bucket already reindexed");
    } else {
        tracing::info!(total, "Reindex complete");
    }
    Ok(total)
}
