//! Synchronize a lagging replica to a recent stable checkpoint under Byzantine faults.
//!
//! When a replica falls behind (crash, restart, or fresh provisioning), it can no longer
//! participate in ordering until it catches up. `commonware-statesync` implements a
//! collecting state transfer: the lagging replica asks its peers for summaries of their
//! latest stable checkpoint, assembles a certificate of f+1 matching summaries (so at
//! least one is from a correct replica), and then streams the missing blocks and reserved
//! pages from a selected source, verifying every byte against the certified digests
//! before anything becomes visible to the application.
//!
//! # Overview
//!
//! The [engine::Engine] is a single actor: inbound protocol messages, timer ticks, and
//! control commands are all funneled through one task, so handlers always observe the
//! effects of a fully-committed predecessor. Progress is persisted through an atomic
//! metadata partition, allowing a replica that crashes mid-transfer to resume in the
//! same phase without repeating completed work.
//!
//! Blocks are verified as a hash chain: the certificate pins the digest of the target's
//! last block, each accepted block exposes the digest of its parent, and the engine walks
//! the chain backwards from the target to the local frontier. Reserved pages are verified
//! by recomputing the page-descriptor digest pinned in the certified checkpoint. A source
//! that ships bytes failing either check is blacklisted and its pending data discarded.

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use bytes::Bytes;
use commonware_cryptography::Digest;
use std::future::Future;
use thiserror::Error;

pub mod engine;
pub mod mocks;
pub mod types;
pub mod wire;

mod auditor;
mod datastore;

/// Application block storage consumed by the engine.
///
/// Blocks are immutable records numbered from 1, each carrying the digest of its
/// predecessor so that they form a hash chain. The implementation decides the on-disk
/// layout; the engine only moves whole blocks and reads the embedded parent digest.
pub trait AppState: Send + Sync + 'static {
    /// Digest type embedded in blocks.
    type Digest: Digest;

    /// Returns the number of the last block reachable from genesis without gaps.
    fn last_reachable_block(&self) -> impl Future<Output = u64> + Send;

    /// Returns the number of the last block present in storage (reachable or not).
    fn last_block(&self) -> impl Future<Output = u64> + Send;

    /// Returns whether the block is present in storage.
    fn has_block(&self, number: u64) -> impl Future<Output = bool> + Send;

    /// Returns the raw bytes of a stored block, if present.
    fn get_block(&self, number: u64) -> impl Future<Output = Option<Bytes>> + Send;

    /// Returns the digest of the predecessor of the given stored block.
    ///
    /// Returns `None` if the block is not present (or is the genesis block).
    fn parent_digest(&self, number: u64) -> impl Future<Output = Option<Self::Digest>> + Send;

    /// Stores a block. Must be idempotent.
    ///
    /// Returns `false` only on storage failure (the engine treats this as fatal).
    fn put_block(&mut self, number: u64, block: Bytes) -> impl Future<Output = bool> + Send;
}

/// Notified when a state transfer completes.
pub trait Reporter: Clone + Send + 'static {
    /// Called exactly once per completed transfer, after the checkpoint has been
    /// durably committed.
    fn transfer_complete(&mut self, checkpoint: u64) -> impl Future<Output = ()> + Send;
}

/// Errors returned by control operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A transfer is already in progress.
    #[error("already collecting state")]
    AlreadyFetching,
    /// The operation is not permitted while a transfer is in progress.
    #[error("collecting state")]
    Fetching,
    /// The page identifier is outside the configured address space.
    #[error("invalid page id {page} (limit {limit})")]
    InvalidPageId {
        /// The offending page identifier.
        page: u32,
        /// The configured number of reserved pages.
        limit: u32,
    },
    /// The page payload does not match the configured page size.
    #[error("invalid page size {size} (expected {expected})")]
    InvalidPageSize {
        /// The offending payload size.
        size: usize,
        /// The configured page size.
        expected: u32,
    },
    /// Checkpoints must be created in strictly increasing order.
    #[error("non-monotonic checkpoint {checkpoint} (last {last})")]
    NonMonotonicCheckpoint {
        /// The requested checkpoint number.
        checkpoint: u64,
        /// The last stored checkpoint number.
        last: u64,
    },
    /// The engine has shut down.
    #[error("engine closed")]
    Closed,
}
