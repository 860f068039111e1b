//! Persistent journal of transfer progress, checkpoint descriptors, and reserved pages.
//!
//! All records live in a single [Metadata] partition so that one [DataStore::commit]
//! persists them atomically: the blob swap performed by [Metadata::sync] either lands
//! entirely or not at all. This is what lets the final step of a transfer (apply pages,
//! store the checkpoint descriptor, clear the fetching flag) behave as one transaction.
//!
//! Records are addressed by a 13-byte tagged key (`tag | page u32 | checkpoint u64`).
//! Small singleton records (progress root, page directory, sequence numbers) are cached
//! in memory and written back on commit; bulk records (pages, descriptors) are read
//! through on demand.

use crate::types::{
    digest_of_page, read_u16_le, read_u32_le, read_u64_le, CheckpointDesc, PageInfo,
    PagesDescriptor,
};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{
    Decode, DecodeExt, Encode, EncodeSize, Error as CodecError, FixedSize, Read, Write,
};
use commonware_cryptography::{Digest, Hasher};
use commonware_runtime::{Clock, Metrics, Storage};
use commonware_storage::metadata::{self, Metadata};
use commonware_utils::sequence::FixedBytes;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

/// Record key: `tag | page u32 | checkpoint u64` (big-endian, zero-padded).
pub(crate) type Key = FixedBytes<13>;

const TAG_SETUP: u8 = 0;
const TAG_ROOT: u8 = 1;
const TAG_DIRECTORY: u8 = 2;
const TAG_SEQNUMS: u8 = 3;
const TAG_CHECKPOINT: u8 = 4;
const TAG_SNAPSHOT: u8 = 5;
const TAG_PENDING: u8 = 6;

fn key(tag: u8, page: u32, checkpoint: u64) -> Key {
    let mut raw = [0u8; 13];
    raw[0] = tag;
    raw[1..5].copy_from_slice(&page.to_be_bytes());
    raw[5..13].copy_from_slice(&checkpoint.to_be_bytes());
    FixedBytes::new(raw)
}

/// Errors that can occur when interacting with the datastore.
///
/// Any of these is fatal to the engine: state on disk is left valid for re-entry,
/// but the process must not continue on a store it cannot read or persist.
#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("metadata: {0}")]
    Metadata(#[from] metadata::Error),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] CodecError),
}

/// Datastore geometry, fixed at first initialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Setup {
    pub max_stored_checkpoints: u64,
    pub reserved_pages: u32,
    pub page_size: u32,
}

impl Write for Setup {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.max_stored_checkpoints);
        buf.put_u32_le(self.reserved_pages);
        buf.put_u32_le(self.page_size);
    }
}

impl EncodeSize for Setup {
    fn encode_size(&self) -> usize {
        u64::SIZE + u32::SIZE * 2
    }
}

impl Read for Setup {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            max_stored_checkpoints: read_u64_le(buf)?,
            reserved_pages: read_u32_le(buf)?,
            page_size: read_u32_le(buf)?,
        })
    }
}

/// Transfer progress and stored-checkpoint bounds.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Root<D: Digest> {
    /// Stored checkpoint range; `None` until the first checkpoint is created.
    checkpoints: Option<(u64, u64)>,
    /// Whether a transfer is in progress.
    fetching: bool,
    /// The certified checkpoint being fetched, once known.
    target: Option<CheckpointDesc<D>>,
    /// Block range still required, while in the block phase.
    required_blocks: Option<(u64, u64)>,
}

impl<D: Digest> Default for Root<D> {
    fn default() -> Self {
        Self {
            checkpoints: None,
            fetching: false,
            target: None,
            required_blocks: None,
        }
    }
}

impl<D: Digest> Write for Root<D> {
    fn write(&self, buf: &mut impl BufMut) {
        match self.checkpoints {
            Some((first, last)) => {
                buf.put_u8(1);
                buf.put_u64_le(first);
                buf.put_u64_le(last);
            }
            None => buf.put_u8(0),
        }
        buf.put_u8(self.fetching as u8);
        match &self.target {
            Some(target) => {
                buf.put_u8(1);
                target.write(buf);
            }
            None => buf.put_u8(0),
        }
        match self.required_blocks {
            Some((first, last)) => {
                buf.put_u8(1);
                buf.put_u64_le(first);
                buf.put_u64_le(last);
            }
            None => buf.put_u8(0),
        }
    }
}

impl<D: Digest> EncodeSize for Root<D> {
    fn encode_size(&self) -> usize {
        let mut size = 3 * u8::SIZE;
        if self.checkpoints.is_some() {
            size += u64::SIZE * 2;
        }
        if let Some(target) = &self.target {
            size += target.encode_size();
        }
        if self.required_blocks.is_some() {
            size += u64::SIZE * 2;
        }
        size
    }
}

impl<D: Digest> Read for Root<D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let checkpoints = match read_flag(buf)? {
            true => Some((read_u64_le(buf)?, read_u64_le(buf)?)),
            false => None,
        };
        let fetching = read_flag(buf)?;
        let target = match read_flag(buf)? {
            true => Some(CheckpointDesc::read_cfg(buf, &())?),
            false => None,
        };
        let required_blocks = match read_flag(buf)? {
            true => Some((read_u64_le(buf)?, read_u64_le(buf)?)),
            false => None,
        };
        Ok(Self {
            checkpoints,
            fetching,
            target,
            required_blocks,
        })
    }
}

fn read_flag(buf: &mut impl Buf) -> Result<bool, CodecError> {
    if buf.remaining() < u8::SIZE {
        return Err(CodecError::EndOfBuffer);
    }
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(CodecError::Invalid("Root", "invalid flag")),
    }
}

/// Index of which page records exist (the [Metadata] store has no iteration).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Directory {
    /// Snapshot checkpoints per page, ascending.
    snapshots: BTreeMap<u32, Vec<u64>>,
    /// Pages with a pending (dirty) record.
    pending: BTreeSet<u32>,
}

impl Write for Directory {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.snapshots.len() as u32);
        for (page, checkpoints) in &self.snapshots {
            buf.put_u32_le(*page);
            buf.put_u32_le(checkpoints.len() as u32);
            for checkpoint in checkpoints {
                buf.put_u64_le(*checkpoint);
            }
        }
        buf.put_u32_le(self.pending.len() as u32);
        for page in &self.pending {
            buf.put_u32_le(*page);
        }
    }
}

impl EncodeSize for Directory {
    fn encode_size(&self) -> usize {
        let snapshots: usize = self
            .snapshots
            .values()
            .map(|c| u32::SIZE * 2 + u64::SIZE * c.len())
            .sum();
        u32::SIZE * 2 + snapshots + u32::SIZE * self.pending.len()
    }
}

impl Read for Directory {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let pages = read_u32_le(buf)?;
        let mut snapshots = BTreeMap::new();
        for _ in 0..pages {
            let page = read_u32_le(buf)?;
            let count = read_u32_le(buf)?;
            let mut checkpoints = Vec::with_capacity(count as usize);
            for _ in 0..count {
                checkpoints.push(read_u64_le(buf)?);
            }
            snapshots.insert(page, checkpoints);
        }
        let count = read_u32_le(buf)?;
        let mut pending = BTreeSet::new();
        for _ in 0..count {
            pending.insert(read_u32_le(buf)?);
        }
        Ok(Self { snapshots, pending })
    }
}

/// Last accepted message sequence number per sender.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct SeqNums(BTreeMap<u16, u64>);

impl Write for SeqNums {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.0.len() as u32);
        for (sender, seq) in &self.0 {
            buf.put_u16_le(*sender);
            buf.put_u64_le(*seq);
        }
    }
}

impl EncodeSize for SeqNums {
    fn encode_size(&self) -> usize {
        u32::SIZE + (u16::SIZE + u64::SIZE) * self.0.len()
    }
}

impl Read for SeqNums {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let count = read_u32_le(buf)?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let sender = read_u16_le(buf)?;
            let seq = read_u64_le(buf)?;
            map.insert(sender, seq);
        }
        Ok(Self(map))
    }
}

/// A reserved-page snapshot record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PageRecord<D: Digest> {
    pub digest: D,
    pub data: Bytes,
}

impl<D: Digest> Write for PageRecord<D> {
    fn write(&self, buf: &mut impl BufMut) {
        self.digest.write(buf);
        buf.put_slice(&self.data);
    }
}

impl<D: Digest> EncodeSize for PageRecord<D> {
    fn encode_size(&self) -> usize {
        D::SIZE + self.data.len()
    }
}

impl<D: Digest> Read for PageRecord<D> {
    /// The configured page size.
    type Cfg = u32;

    fn read_cfg(buf: &mut impl Buf, page_size: &u32) -> Result<Self, CodecError> {
        let digest = D::read_cfg(buf, &())?;
        if buf.remaining() < *page_size as usize {
            return Err(CodecError::EndOfBuffer);
        }
        let data = buf.copy_to_bytes(*page_size as usize);
        Ok(Self { digest, data })
    }
}

/// Durable store of everything the engine must not lose across a crash.
pub(crate) struct DataStore<E: Clock + Storage + Metrics, D: Digest> {
    metadata: Metadata<E, Key, Vec<u8>>,
    setup: Option<Setup>,
    root: Root<D>,
    directory: Directory,
    seqnums: SeqNums,
}

impl<E: Clock + Storage + Metrics, D: Digest> DataStore<E, D> {
    /// Opens (or creates) the datastore in the given partition.
    pub async fn init(context: E, partition: String) -> Result<Self, Error> {
        let metadata: Metadata<E, Key, Vec<u8>> = Metadata::init(
            context,
            metadata::Config {
                partition,
                codec_config: ((..).into(), ()),
            },
        )
        .await?;
        let setup = match metadata.get(&key(TAG_SETUP, 0, 0)) {
            Some(raw) => Some(Setup::decode(raw.as_slice())?),
            None => None,
        };
        let root = match metadata.get(&key(TAG_ROOT, 0, 0)) {
            Some(raw) => Root::decode(raw.as_slice())?,
            None => Root::default(),
        };
        let directory = match metadata.get(&key(TAG_DIRECTORY, 0, 0)) {
            Some(raw) => Directory::decode(raw.as_slice())?,
            None => Directory::default(),
        };
        let seqnums = match metadata.get(&key(TAG_SEQNUMS, 0, 0)) {
            Some(raw) => SeqNums::decode(raw.as_slice())?,
            None => SeqNums::default(),
        };
        debug!(
            initialized = setup.is_some(),
            fetching = root.fetching,
            checkpoints = ?root.checkpoints,
            "datastore opened"
        );
        Ok(Self {
            metadata,
            setup,
            root,
            directory,
            seqnums,
        })
    }

    // -------------------- Setup --------------------

    pub fn setup(&self) -> Option<&Setup> {
        self.setup.as_ref()
    }

    pub fn set_setup(&mut self, setup: Setup) {
        self.setup = Some(setup);
    }

    // -------------------- Checkpoints --------------------

    pub fn first_stored_checkpoint(&self) -> Option<u64> {
        self.root.checkpoints.map(|(first, _)| first)
    }

    pub fn last_stored_checkpoint(&self) -> Option<u64> {
        self.root.checkpoints.map(|(_, last)| last)
    }

    pub fn get_checkpoint(&self, checkpoint: u64) -> Result<Option<CheckpointDesc<D>>, Error> {
        let Some(raw) = self.metadata.get(&key(TAG_CHECKPOINT, 0, checkpoint)) else {
            return Ok(None);
        };
        Ok(Some(CheckpointDesc::decode(raw.as_slice())?))
    }

    /// Stores a checkpoint descriptor and extends the stored range to cover it.
    pub fn put_checkpoint(&mut self, desc: CheckpointDesc<D>) {
        let checkpoint = desc.checkpoint;
        self.metadata
            .put(key(TAG_CHECKPOINT, 0, checkpoint), desc.encode().into());
        self.root.checkpoints = Some(match self.root.checkpoints {
            Some((first, last)) => (first.min(checkpoint), last.max(checkpoint)),
            None => (checkpoint, checkpoint),
        });
    }

    /// Removes every checkpoint descriptor below `min`, together with the page
    /// snapshots it exclusively covers, and advances the stored range.
    ///
    /// A page's newest snapshot at or below `min` is retained: it still backs
    /// reads at every surviving checkpoint.
    pub fn prune_checkpoints(&mut self, min: u64) {
        let Some((first, last)) = self.root.checkpoints else {
            return;
        };
        if min <= first {
            return;
        }
        for checkpoint in first..min.min(last + 1) {
            self.metadata.remove(&key(TAG_CHECKPOINT, 0, checkpoint));
        }
        self.root.checkpoints = (min <= last).then_some((min, last));
        for (page, checkpoints) in self.directory.snapshots.iter_mut() {
            // Keep the newest snapshot at or below `min` (it backs reads at every
            // surviving checkpoint) plus everything above it.
            let keep_from = checkpoints.partition_point(|&c| c <= min).saturating_sub(1);
            for checkpoint in checkpoints.drain(..keep_from) {
                self.metadata.remove(&key(TAG_SNAPSHOT, *page, checkpoint));
            }
        }
    }

    // -------------------- Reserved pages --------------------

    pub fn put_pending_page(&mut self, page: u32, data: Bytes) {
        self.metadata.put(key(TAG_PENDING, page, 0), data.to_vec());
        self.directory.pending.insert(page);
    }

    pub fn get_pending_page(&self, page: u32) -> Option<Bytes> {
        self.metadata
            .get(&key(TAG_PENDING, page, 0))
            .map(|raw| Bytes::copy_from_slice(raw))
    }

    /// Pages with a pending record, ascending.
    pub fn pending_pages(&self) -> Vec<u32> {
        self.directory.pending.iter().copied().collect()
    }

    pub fn remove_pending_page(&mut self, page: u32) {
        self.metadata.remove(&key(TAG_PENDING, page, 0));
        self.directory.pending.remove(&page);
    }

    pub fn clear_pending_pages(&mut self) {
        for page in std::mem::take(&mut self.directory.pending) {
            self.metadata.remove(&key(TAG_PENDING, page, 0));
        }
    }

    pub fn put_page_snapshot(&mut self, page: u32, checkpoint: u64, record: PageRecord<D>) {
        self.metadata
            .put(key(TAG_SNAPSHOT, page, checkpoint), record.encode().into());
        let checkpoints = self.directory.snapshots.entry(page).or_default();
        if let Err(at) = checkpoints.binary_search(&checkpoint) {
            checkpoints.insert(at, checkpoint);
        }
    }

    pub fn get_page_snapshot(
        &self,
        page: u32,
        checkpoint: u64,
    ) -> Result<Option<PageRecord<D>>, Error> {
        let Some(setup) = &self.setup else {
            return Ok(None);
        };
        let Some(raw) = self.metadata.get(&key(TAG_SNAPSHOT, page, checkpoint)) else {
            return Ok(None);
        };
        Ok(Some(PageRecord::decode_cfg(
            raw.as_slice(),
            &setup.page_size,
        )?))
    }

    /// The newest snapshot of `page` at or below `checkpoint`, if any.
    pub fn newest_snapshot_at_or_below(&self, page: u32, checkpoint: u64) -> Option<u64> {
        let checkpoints = self.directory.snapshots.get(&page)?;
        let cut = checkpoints.partition_point(|&c| c <= checkpoint);
        cut.checked_sub(1).map(|at| checkpoints[at])
    }

    // -------------------- Fetching progress --------------------

    pub fn is_fetching(&self) -> bool {
        self.root.fetching
    }

    pub fn set_fetching(&mut self, fetching: bool) {
        self.root.fetching = fetching;
    }

    pub fn target(&self) -> Option<&CheckpointDesc<D>> {
        self.root.target.as_ref()
    }

    pub fn set_target(&mut self, target: Option<CheckpointDesc<D>>) {
        self.root.target = target;
    }

    pub fn required_blocks(&self) -> Option<(u64, u64)> {
        self.root.required_blocks
    }

    pub fn set_required_blocks(&mut self, range: Option<(u64, u64)>) {
        self.root.required_blocks = range;
    }

    // -------------------- Sequence numbers --------------------

    pub fn last_seq(&self, sender: u16) -> Option<u64> {
        self.seqnums.0.get(&sender).copied()
    }

    pub fn set_last_seq(&mut self, sender: u16, seq: u64) {
        self.seqnums.0.insert(sender, seq);
    }

    // -------------------- Transactions --------------------

    /// Durably persists every mutation applied since the last commit, atomically.
    pub async fn commit(&mut self) -> Result<(), Error> {
        if let Some(setup) = &self.setup {
            self.metadata.put(key(TAG_SETUP, 0, 0), setup.encode().into());
        }
        self.metadata
            .put(key(TAG_ROOT, 0, 0), self.root.encode().into());
        self.metadata
            .put(key(TAG_DIRECTORY, 0, 0), self.directory.encode().into());
        self.metadata
            .put(key(TAG_SEQNUMS, 0, 0), self.seqnums.encode().into());
        self.metadata.sync().await?;
        Ok(())
    }
}

/// Rebuilds the reserved-pages descriptor for `checkpoint` from stored snapshots.
///
/// Every page contributes its newest snapshot at or below `checkpoint`; pages never
/// written contribute a zeroed entry at checkpoint 0. Replicas with consistent page
/// state produce byte-identical descriptors, which is what makes the descriptor
/// digest comparable across the network.
pub(crate) fn descriptor_for<H, E>(
    store: &DataStore<E, H::Digest>,
    checkpoint: u64,
) -> Result<PagesDescriptor<H::Digest>, Error>
where
    H: Hasher,
    E: Clock + Storage + Metrics,
{
    let setup = store.setup().expect("geometry pinned at init");
    let zeroed = vec![0u8; setup.page_size as usize];
    let mut entries = Vec::with_capacity(setup.reserved_pages as usize);
    for page in 0..setup.reserved_pages {
        match store.newest_snapshot_at_or_below(page, checkpoint) {
            Some(snapshot) => {
                let record = store
                    .get_page_snapshot(page, snapshot)?
                    .expect("directory lists snapshot");
                entries.push(PageInfo {
                    page,
                    checkpoint: snapshot,
                    digest: record.digest,
                });
            }
            None => entries.push(PageInfo {
                page,
                checkpoint: 0,
                digest: digest_of_page::<H>(page, 0, &zeroed),
            }),
        }
    }
    Ok(PagesDescriptor { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::{sha256, Sha256};
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};

    type TestStore = DataStore<deterministic::Context, sha256::Digest>;

    fn page(byte: u8, size: usize) -> Bytes {
        Bytes::from(vec![byte; size])
    }

    fn desc(checkpoint: u64, last_block: u64) -> CheckpointDesc<sha256::Digest> {
        CheckpointDesc {
            checkpoint,
            last_block,
            digest_of_last_block: sha256::hash(&last_block.to_le_bytes()),
            digest_of_pages_descriptor: sha256::hash(&checkpoint.to_le_bytes()),
        }
    }

    #[test_traced]
    fn test_persistence_across_restart() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut store = TestStore::init(context.clone(), "test".to_string())
                .await
                .unwrap();
            assert!(store.setup().is_none());
            store.set_setup(Setup {
                max_stored_checkpoints: 10,
                reserved_pages: 4,
                page_size: 32,
            });
            store.put_checkpoint(desc(1, 10));
            store.put_pending_page(2, page(7, 32));
            store.put_page_snapshot(
                1,
                1,
                PageRecord {
                    digest: digest_of_page::<Sha256>(1, 1, &page(3, 32)),
                    data: page(3, 32),
                },
            );
            store.set_last_seq(2, 99);
            store.commit().await.unwrap();

            // Mutations after the commit are lost on restart.
            store.put_checkpoint(desc(2, 20));
            drop(store);

            let store = TestStore::init(context, "test".to_string()).await.unwrap();
            assert_eq!(store.setup().unwrap().reserved_pages, 4);
            assert_eq!(store.first_stored_checkpoint(), Some(1));
            assert_eq!(store.last_stored_checkpoint(), Some(1));
            assert_eq!(store.get_checkpoint(1).unwrap().unwrap(), desc(1, 10));
            assert!(store.get_checkpoint(2).unwrap().is_none());
            assert_eq!(store.get_pending_page(2).unwrap(), page(7, 32));
            assert_eq!(store.newest_snapshot_at_or_below(1, 5), Some(1));
            assert_eq!(
                store.get_page_snapshot(1, 1).unwrap().unwrap().data,
                page(3, 32)
            );
            assert_eq!(store.last_seq(2), Some(99));
        });
    }

    #[test_traced]
    fn test_prune_checkpoints_keeps_covering_snapshot() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut store = TestStore::init(context, "test".to_string()).await.unwrap();
            store.set_setup(Setup {
                max_stored_checkpoints: 10,
                reserved_pages: 4,
                page_size: 8,
            });
            for checkpoint in 3..=12 {
                store.put_checkpoint(desc(checkpoint, checkpoint * 10));
            }
            // Page 0 was written at every checkpoint; page 1 only at checkpoint 3.
            for checkpoint in 3..=12 {
                store.put_page_snapshot(
                    0,
                    checkpoint,
                    PageRecord {
                        digest: digest_of_page::<Sha256>(0, checkpoint, &page(0, 8)),
                        data: page(0, 8),
                    },
                );
            }
            store.put_page_snapshot(
                1,
                3,
                PageRecord {
                    digest: digest_of_page::<Sha256>(1, 3, &page(1, 8)),
                    data: page(1, 8),
                },
            );

            store.prune_checkpoints(4);
            assert_eq!(store.first_stored_checkpoint(), Some(4));
            assert_eq!(store.last_stored_checkpoint(), Some(12));
            assert!(store.get_checkpoint(3).unwrap().is_none());
            assert!(store.get_checkpoint(4).unwrap().is_some());

            // Page 0's snapshot at 3 is covered by the one at 4 and is gone.
            assert!(store.get_page_snapshot(0, 3).unwrap().is_none());
            assert_eq!(store.newest_snapshot_at_or_below(0, 4), Some(4));

            // Page 1's snapshot at 3 still backs reads at checkpoints 4..=12.
            assert!(store.get_page_snapshot(1, 3).unwrap().is_some());
            assert_eq!(store.newest_snapshot_at_or_below(1, 12), Some(3));
        });
    }

    #[test_traced]
    fn test_pending_pages() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut store = TestStore::init(context, "test".to_string()).await.unwrap();
            store.set_setup(Setup {
                max_stored_checkpoints: 10,
                reserved_pages: 4,
                page_size: 8,
            });
            assert!(store.get_pending_page(0).is_none());
            store.put_pending_page(0, page(1, 8));
            store.put_pending_page(3, page(2, 8));
            assert_eq!(store.pending_pages(), vec![0, 3]);
            store.remove_pending_page(0);
            assert!(store.get_pending_page(0).is_none());
            store.clear_pending_pages();
            assert!(store.pending_pages().is_empty());
            assert!(store.get_pending_page(3).is_none());
        });
    }

    #[test_traced]
    fn test_fetching_progress_roundtrip() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut store = TestStore::init(context.clone(), "test".to_string())
                .await
                .unwrap();
            store.set_fetching(true);
            store.set_target(Some(desc(5, 100)));
            store.set_required_blocks(Some((1, 100)));
            store.commit().await.unwrap();
            drop(store);

            let store = TestStore::init(context, "test".to_string()).await.unwrap();
            assert!(store.is_fetching());
            assert_eq!(store.target().unwrap().checkpoint, 5);
            assert_eq!(store.required_blocks(), Some((1, 100)));
        });
    }
}
