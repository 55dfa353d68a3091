use serde::Serialize;

use super::BucketDefinition;
use crate::error::StepError;
use crate::retry::RetryPolicy;
use crate::store::BucketStore;

/// What [`put_bucket`] did to the bucket's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpgradeOutcome {
    Created,
    Updated { from: u32 },
    Unchanged,
    /// The store already holds a newer version than this build knows.
    NewerThanCurrent { found: u32 },
}

/// Make sure the bucket exists at the definition's schema and version.
///
/// Fetch, create and update each get their own retry budget. A bucket is
/// never moved to a lower version.
#[tracing::instrument(skip_all, fields(bucket = %def.name, version = def.version))]
pub async fn put_bucket(
    store: &dyn BucketStore,
    def: &BucketDefinition,
    policy: &RetryPolicy,
) -> Result<UpgradeOutcome, StepError> {
    let name = def.name.as_str();

    let current = policy
        .run("get_bucket", name, move || async move {
            match store.get_bucket(name).await {
                Ok(state) => Ok(Some(state)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await?;

    let target = def.target_state();
    let target = &target;
    let outcome = match current {
        None => {
            policy
                .run("create_bucket", name, move || store.create_bucket(name, target))
                .await?;
            tracing::info!("Bucket created");
            UpgradeOutcome::Created
        }
        Some(state) if state.version > def.version => {
            tracing::warn!(
                found = state.version,
                "Bucket is newer than this build; leaving it untouched"
            );
            UpgradeOutcome::NewerThanCurrent {
                found: state.version,
            }
        }
        Some(state) if state.version == def.version => {
            tracing::info!("Bucket already at current version");
            UpgradeOutcome::Unchanged
        }
        Some(state) => {
            policy
                .run("update_bucket", name, move || store.update_bucket(name, target))
                .await?;
            tracing::info!(from = state.version, "Bucket schema updated");
            UpgradeOutcome::Updated {
                from: state.version,
            }
        }
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::factory;
    use crate::store::memory::MemoryStore;
    use crate::store::{BucketSchema, BucketState, IndexType};

    struct Nothing;
    impl crate::model::DomainEntity for Nothing {
        fn to_write_ops(&self) -> Result<Vec<crate::store::WriteOp>, crate::error::ModelError> {
            Ok(Vec::new())
        }
    }

    fn def(version: u32) -> BucketDefinition {
        let schema = BucketSchema::new().with_index("name", IndexType::String);
        BucketDefinition::new("networks", version, schema, factory(|_| Ok(Nothing)))
    }

    #[tokio::test]
    async fn test_creates_missing_bucket() {
        let store = MemoryStore::new();
        let outcome = put_bucket(&store, &def(2), &RetryPolicy::default()).await.unwrap();
        assert_eq!(outcome, UpgradeOutcome::Created);
        let state = store.get_bucket("networks").await.unwrap();
        assert_eq!(state.version, 2);
        assert!(state.schema.is_indexed("v"));
    }

    #[tokio::test]
    async fn test_updates_older_bucket() {
        let store = MemoryStore::new();
        store
            .create_bucket("networks", &BucketState { schema: BucketSchema::new(), version: 1 })
            .await
            .unwrap();
        let outcome = put_bucket(&store, &def(3), &RetryPolicy::default()).await.unwrap();
        assert_eq!(outcome, UpgradeOutcome::Updated { from: 1 });
        assert_eq!(store.get_bucket("networks").await.unwrap(), def(3).target_state());
    }

    #[tokio::test]
    async fn test_never_downgrades() {
        let store = MemoryStore::new();
        let newer = BucketState { schema: BucketSchema::new(), version: 5 };
        store.create_bucket("networks", &newer).await.unwrap();
        let writes = store.write_count();

        let outcome = put_bucket(&store, &def(3), &RetryPolicy::default()).await.unwrap();
        assert_eq!(outcome, UpgradeOutcome::NewerThanCurrent { found: 5 });
        assert_eq!(store.get_bucket("networks").await.unwrap(), newer);
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_current_bucket_is_unchanged() {
        let store = MemoryStore::new();
        put_bucket(&store, &def(2), &RetryPolicy::default()).await.unwrap();
        let writes = store.write_count();
        let outcome = put_bucket(&store, &def(2), &RetryPolicy::default()).await.unwrap();
        assert_eq!(outcome, UpgradeOutcome::Unchanged);
        assert_eq!(store.write_count(), writes);
    }
}
