//! Validation of local state against datastore invariants.
//!
//! Runs at startup, before the engine serves or fetches anything. Every violation
//! is fatal: a store that contradicts itself cannot be repaired by the engine, and
//! continuing would either corrupt the application or poison other replicas.

use crate::{
    datastore::{self, DataStore},
    types::digest_of_block,
    AppState,
};
use commonware_cryptography::Hasher;
use commonware_runtime::{Clock, Metrics, Storage};
use thiserror::Error;
use tracing::debug;

/// A violated invariant.
#[derive(Debug, Error)]
pub(crate) enum Violation {
    #[error("stored checkpoint range [{first}, {last}] is inverted")]
    InvertedCheckpointRange { first: u64, last: u64 },
    #[error("{count} stored checkpoints exceed the limit of {max}")]
    TooManyCheckpoints { count: u64, max: u64 },
    #[error("checkpoint {0} is inside the stored range but missing")]
    MissingCheckpoint(u64),
    #[error("checkpoint record {found} stored under number {expected}")]
    MislabeledCheckpoint { expected: u64, found: u64 },
    #[error("reachable block {0} is missing")]
    MissingReachableBlock(u64),
    #[error("block {0} does not match the digest embedded in its child")]
    BrokenChain(u64),
    #[error("block {0} has no parent digest")]
    MissingParentDigest(u64),
    #[error("last reachable block {reachable} behind checkpoint block {checkpoint_block}")]
    ReachableBehindCheckpoint {
        reachable: u64,
        checkpoint_block: u64,
    },
    #[error("checkpoint {checkpoint} pins a different digest for block {block}")]
    CheckpointBlockMismatch { checkpoint: u64, block: u64 },
    #[error("checkpoint {0} pins a different reserved-pages descriptor")]
    PagesDescriptorMismatch(u64),
    #[error("transfer progress recorded while not fetching")]
    ProgressWhileIdle,
    #[error("required block range [{first}, {last}] is inconsistent")]
    BadRequiredRange { first: u64, last: u64 },
    #[error("block {0} stored beyond the fetch target")]
    BlockBeyondTarget(u64),
}

/// Validates the datastore and the application block store against each other.
pub(crate) async fn check<E, H, A>(
    store: &DataStore<E, H::Digest>,
    app: &A,
) -> Result<(), Violation>
where
    E: Clock + Storage + Metrics,
    H: Hasher,
    A: AppState<Digest = H::Digest>,
{
    check_first_and_last_checkpoint::<E, H>(store)?;
    check_reachable_blocks::<E, H, A>(store, app).await?;
    check_unreachable_blocks::<E, H, A>(store, app).await?;
    check_blocks_being_fetched::<E, H, A>(store, app).await?;
    check_stored_checkpoints::<E, H>(store)?;
    debug!("state consistency verified");
    Ok(())
}

/// The stored checkpoint range is well-formed, within the retention limit, and
/// has no gaps.
fn check_first_and_last_checkpoint<E, H>(store: &DataStore<E, H::Digest>) -> Result<(), Violation>
where
    E: Clock + Storage + Metrics,
    H: Hasher,
{
    let (Some(first), Some(last)) = (
        store.first_stored_checkpoint(),
        store.last_stored_checkpoint(),
    ) else {
        return Ok(());
    };
    if first > last {
        return Err(Violation::InvertedCheckpointRange { first, last });
    }
    let max = store
        .setup()
        .map(|s| s.max_stored_checkpoints)
        .unwrap_or(u64::MAX);
    let count = last - first + 1;
    if count > max {
        return Err(Violation::TooManyCheckpoints { count, max });
    }
    for checkpoint in first..=last {
        let desc = store
            .get_checkpoint(checkpoint)
            .unwrap_or_else(|err| panic!("failed to read checkpoint: {err}"))
            .ok_or(Violation::MissingCheckpoint(checkpoint))?;
        if desc.checkpoint != checkpoint {
            return Err(Violation::MislabeledCheckpoint {
                expected: checkpoint,
                found: desc.checkpoint,
            });
        }
    }
    Ok(())
}

/// Every reachable block is present and the digest chain holds, and the latest
/// stored checkpoint's last block is reachable with the pinned digest.
async fn check_reachable_blocks<E, H, A>(
    store: &DataStore<E, H::Digest>,
    app: &A,
) -> Result<(), Violation>
where
    E: Clock + Storage + Metrics,
    H: Hasher,
    A: AppState<Digest = H::Digest>,
{
    let reachable = app.last_reachable_block().await;
    for block in 1..=reachable {
        if !app.has_block(block).await {
            return Err(Violation::MissingReachableBlock(block));
        }
        if block == 1 {
            continue;
        }
        let parent = app
            .parent_digest(block)
            .await
            .ok_or(Violation::MissingParentDigest(block))?;
        let bytes = app
            .get_block(block - 1)
            .await
            .ok_or(Violation::MissingReachableBlock(block - 1))?;
        if digest_of_block::<H>(block - 1, &bytes) != parent {
            return Err(Violation::BrokenChain(block - 1));
        }
    }

    let Some(last) = store.last_stored_checkpoint() else {
        return Ok(());
    };
    let desc = store
        .get_checkpoint(last)
        .unwrap_or_else(|err| panic!("failed to read checkpoint: {err}"))
        .ok_or(Violation::MissingCheckpoint(last))?;
    if desc.last_block == 0 {
        return Ok(());
    }
    if desc.last_block > reachable {
        return Err(Violation::ReachableBehindCheckpoint {
            reachable,
            checkpoint_block: desc.last_block,
        });
    }
    let bytes = app
        .get_block(desc.last_block)
        .await
        .ok_or(Violation::MissingReachableBlock(desc.last_block))?;
    if digest_of_block::<H>(desc.last_block, &bytes) != desc.digest_of_last_block {
        return Err(Violation::CheckpointBlockMismatch {
            checkpoint: last,
            block: desc.last_block,
        });
    }
    Ok(())
}

/// Blocks above the reachable frontier are only permitted while fetching, and
/// only below the certified target.
async fn check_unreachable_blocks<E, H, A>(
    store: &DataStore<E, H::Digest>,
    app: &A,
) -> Result<(), Violation>
where
    E: Clock + Storage + Metrics,
    H: Hasher,
    A: AppState<Digest = H::Digest>,
{
    let reachable = app.last_reachable_block().await;
    let last = app.last_block().await;
    if last == reachable {
        return Ok(());
    }
    // Blocks above the frontier can linger with no target when collection was
    // restarted mid-transfer; they are revalidated against the next certificate.
    match (store.is_fetching(), store.target()) {
        (true, None) => Ok(()),
        (true, Some(target)) if last <= target.last_block => Ok(()),
        _ => Err(Violation::BlockBeyondTarget(last)),
    }
}

/// Partial-transfer bookkeeping is internally consistent.
async fn check_blocks_being_fetched<E, H, A>(
    store: &DataStore<E, H::Digest>,
    app: &A,
) -> Result<(), Violation>
where
    E: Clock + Storage + Metrics,
    H: Hasher,
    A: AppState<Digest = H::Digest>,
{
    if !store.is_fetching() {
        if store.target().is_some() || store.required_blocks().is_some() {
            return Err(Violation::ProgressWhileIdle);
        }
        return Ok(());
    }
    let Some((first, last)) = store.required_blocks() else {
        return Ok(());
    };
    let target = store
        .target()
        .ok_or(Violation::BadRequiredRange { first, last })?;
    let reachable = app.last_reachable_block().await;
    if first == 0 || first > last || last != target.last_block || first > reachable + 1 {
        return Err(Violation::BadRequiredRange { first, last });
    }
    // Partially received blocks must form a contiguous suffix of the target
    // range (they are stored from the top down).
    let mut in_suffix = true;
    for block in (first..=last).rev() {
        if block <= reachable {
            break;
        }
        let present = app.has_block(block).await;
        if present && !in_suffix {
            return Err(Violation::BadRequiredRange { first, last });
        }
        in_suffix &= present;
    }
    Ok(())
}

/// Every stored checkpoint's reserved-pages descriptor digest is reproducible
/// from the stored snapshots.
fn check_stored_checkpoints<E, H>(store: &DataStore<E, H::Digest>) -> Result<(), Violation>
where
    E: Clock + Storage + Metrics,
    H: Hasher,
{
    let (Some(first), Some(last)) = (
        store.first_stored_checkpoint(),
        store.last_stored_checkpoint(),
    ) else {
        return Ok(());
    };
    for checkpoint in first..=last {
        let desc = store
            .get_checkpoint(checkpoint)
            .unwrap_or_else(|err| panic!("failed to read checkpoint: {err}"))
            .ok_or(Violation::MissingCheckpoint(checkpoint))?;
        let descriptor = datastore::descriptor_for::<H, E>(store, checkpoint)
            .unwrap_or_else(|err| panic!("failed to rebuild descriptor: {err}"));
        if descriptor.digest::<H>() != desc.digest_of_pages_descriptor {
            return Err(Violation::PagesDescriptorMismatch(checkpoint));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datastore::{PageRecord, Setup},
        mocks,
        types::{digest_of_page, CheckpointDesc},
    };
    use bytes::Bytes;
    use commonware_cryptography::{sha256, Sha256};
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};

    type TestStore = DataStore<deterministic::Context, sha256::Digest>;

    const PAGE_SIZE: u32 = 8;

    async fn fresh(context: deterministic::Context) -> TestStore {
        let mut store = TestStore::init(context, "audit".to_string()).await.unwrap();
        store.set_setup(Setup {
            max_stored_checkpoints: 10,
            reserved_pages: 2,
            page_size: PAGE_SIZE,
        });
        store
    }

    /// Stores a checkpoint over the app's current chain with a consistent
    /// descriptor digest.
    fn store_checkpoint(
        store: &mut TestStore,
        app: &mocks::AppState,
        checkpoint: u64,
    ) {
        let last_block = app.last_reachable();
        let digest_of_last_block = app.block_digest(last_block);
        let descriptor = datastore::descriptor_for::<Sha256, _>(store, checkpoint).unwrap();
        store.put_checkpoint(CheckpointDesc {
            checkpoint,
            last_block,
            digest_of_last_block,
            digest_of_pages_descriptor: descriptor.digest::<Sha256>(),
        });
    }

    #[test_traced]
    fn test_clean_state_passes() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let app = mocks::AppState::with_chain(5);
            let mut store = fresh(context).await;
            store.put_page_snapshot(
                0,
                1,
                PageRecord {
                    digest: digest_of_page::<Sha256>(0, 1, &[1u8; PAGE_SIZE as usize]),
                    data: Bytes::from(vec![1u8; PAGE_SIZE as usize]),
                },
            );
            store_checkpoint(&mut store, &app, 1);
            check::<_, Sha256, _>(&store, &app).await.unwrap();
        });
    }

    #[test_traced]
    fn test_missing_checkpoint_detected() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let app = mocks::AppState::with_chain(5);
            let mut store = fresh(context).await;
            store_checkpoint(&mut store, &app, 1);
            store_checkpoint(&mut store, &app, 3);
            let violation = check::<_, Sha256, _>(&store, &app).await.unwrap_err();
            assert!(matches!(violation, Violation::MissingCheckpoint(2)));
        });
    }

    #[test_traced]
    fn test_broken_chain_detected() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut app = mocks::AppState::with_chain(5);
            app.corrupt_block(3);
            let store = fresh(context).await;
            let violation = check::<_, Sha256, _>(&store, &app).await.unwrap_err();
            assert!(matches!(violation, Violation::BrokenChain(3)));
        });
    }

    #[test_traced]
    fn test_checkpoint_digest_mismatch_detected() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let app = mocks::AppState::with_chain(5);
            let mut store = fresh(context).await;
            let descriptor = datastore::descriptor_for::<Sha256, _>(&store, 1).unwrap();
            store.put_checkpoint(CheckpointDesc {
                checkpoint: 1,
                last_block: 5,
                digest_of_last_block: sha256::hash(b"wrong"),
                digest_of_pages_descriptor: descriptor.digest::<Sha256>(),
            });
            let violation = check::<_, Sha256, _>(&store, &app).await.unwrap_err();
            assert!(matches!(
                violation,
                Violation::CheckpointBlockMismatch {
                    checkpoint: 1,
                    block: 5
                }
            ));
        });
    }

    #[test_traced]
    fn test_pages_descriptor_mismatch_detected() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let app = mocks::AppState::with_chain(5);
            let mut store = fresh(context).await;
            store_checkpoint(&mut store, &app, 1);
            // A snapshot written after the checkpoint was described changes the
            // descriptor the auditor rebuilds.
            store.put_page_snapshot(
                0,
                1,
                PageRecord {
                    digest: digest_of_page::<Sha256>(0, 1, &[9u8; PAGE_SIZE as usize]),
                    data: Bytes::from(vec![9u8; PAGE_SIZE as usize]),
                },
            );
            let violation = check::<_, Sha256, _>(&store, &app).await.unwrap_err();
            assert!(matches!(violation, Violation::PagesDescriptorMismatch(1)));
        });
    }

    #[test_traced]
    fn test_progress_while_idle_detected() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let app = mocks::AppState::with_chain(5);
            let mut store = fresh(context).await;
            store.set_required_blocks(Some((1, 10)));
            let violation = check::<_, Sha256, _>(&store, &app).await.unwrap_err();
            assert!(matches!(violation, Violation::ProgressWhileIdle));
        });
    }

    #[test_traced]
    fn test_fetch_progress_validated() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let app = mocks::AppState::with_chain(0);
            let mut store = fresh(context).await;
            store.set_fetching(true);
            let target = CheckpointDesc {
                checkpoint: 5,
                last_block: 100,
                digest_of_last_block: sha256::hash(b"target"),
                digest_of_pages_descriptor: sha256::hash(b"pages"),
            };
            store.set_target(Some(target));
            store.set_required_blocks(Some((1, 100)));
            check::<_, Sha256, _>(&store, &app).await.unwrap();

            // The required range must end at the target's last block.
            store.set_required_blocks(Some((1, 90)));
            let violation = check::<_, Sha256, _>(&store, &app).await.unwrap_err();
            assert!(matches!(
                violation,
                Violation::BadRequiredRange { first: 1, last: 90 }
            ));
        });
    }
}
