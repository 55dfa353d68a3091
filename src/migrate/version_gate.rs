use std::time::Duration;

use super::{BucketDefinition, MigrationPhase, MigrationStatus};
use crate::retry::{self, Step};
use crate::store::BucketStore;

/// Highest `min_store_version` across `definitions`.
pub fn required_version(definitions: &[BucketDefinition]) -> u32 {
    definitions
        .iter()
        .map(|d| d.min_store_version)
        .max()
        .unwrap_or(0)
}

/// Wait until the store reports a capability version every definition
/// accepts, and return that version.
///
/// Retries forever: a store that is behind is waiting on an operator
/// upgrade, and failing to query it is treated the same way.
pub async fn wait_for_store(
    store: &dyn BucketStore,
    definitions: &[BucketDefinition],
    poll_interval: Duration,
    status: &MigrationStatus,
) -> u32 {
    let required = required_version(definitions);

    let outcome: Result<u32, std::convert::Infallible> = retry::drive(0u32, |checks| async move {
        let reported = match store.capability_version().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    required,
                    checks,
                    "Store capability check failed, retrying in {:?}: {}",
                    poll_interval,
                    e
                );
                status.set(MigrationPhase::WaitingForStore {
                    required,
                    reported: None,
                });
                return Step::after(checks + 1, poll_interval);
            }
        };

        let behind: Vec<&str> = definitions
            .iter()
            .filter(|d| d.min_store_version > reported)
            .map(|d| d.name.as_str())
            .collect();
        if behind.is_empty() {
            tracing::info!(version = reported, required, "Store capability version satisfied");
            return Step::Done(reported);
        }

        tracing::warn!(
            version = reported,
            required,
            buckets = ?behind,
            "Store capability version too old, retrying in {:?}",
            poll_interval
        );
        status.set(MigrationPhase::WaitingForStore {
            required,
            reported: Some(reported),
        });
        Step::after(checks + 1, poll_interval)
    })
    .await;

    match outcome {
        Ok(version) => version,
        Err(never) => match never {},
    }
}
