//! Checkpoint, reserved-page, and virtual-block data model.

use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error, FixedSize, Read, ReadExt, Write};
use commonware_cryptography::{Digest, Hasher};
use std::fmt;

/// Maximum number of checkpoints retained by a replica.
pub const MAX_STORED_CHECKPOINTS: u64 = 10;

/// Block number reserved for the virtual block of reserved pages.
///
/// Application blocks are numbered from 1, so the maximum value can never collide.
pub const VBLOCK_NUMBER: u64 = u64::MAX;

/// Number of summary broadcast rounds before partial certificates are purged
/// and collection restarts.
pub const SUMMARY_RESET_COUNT: u32 = 4;

/// Reserved-page sizes must be a multiple of this alignment.
pub const PAGE_ALIGNMENT: u32 = 8;

/// Phase of the transfer state machine.
///
/// The phase is derived from persisted progress, so a replica that crashes
/// mid-transfer resumes exactly where it left off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchingState {
    /// Not transferring. Serving requests from other replicas is permitted.
    NotFetching,
    /// Broadcasting [crate::wire::Payload::AskForCheckpointSummaries] and
    /// collecting a certificate of f+1 matching summaries.
    GettingCheckpointSummaries,
    /// Streaming missing blocks from the certified target down to the local
    /// frontier.
    GettingMissingBlocks,
    /// Fetching the virtual block of reserved pages for the certified target.
    GettingMissingResPages,
}

impl fmt::Display for FetchingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFetching => "NotFetching",
            Self::GettingCheckpointSummaries => "GettingCheckpointSummaries",
            Self::GettingMissingBlocks => "GettingMissingBlocks",
            Self::GettingMissingResPages => "GettingMissingResPages",
        };
        f.write_str(name)
    }
}

/// Description of a stored checkpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointDesc<D: Digest> {
    /// The checkpoint number.
    pub checkpoint: u64,
    /// The number of the last block covered by the checkpoint.
    pub last_block: u64,
    /// Digest of the last block.
    pub digest_of_last_block: D,
    /// Digest of the reserved-pages descriptor frozen at the checkpoint.
    pub digest_of_pages_descriptor: D,
}

impl<D: Digest> Write for CheckpointDesc<D> {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.checkpoint);
        buf.put_u64_le(self.last_block);
        self.digest_of_last_block.write(buf);
        self.digest_of_pages_descriptor.write(buf);
    }
}

impl<D: Digest> EncodeSize for CheckpointDesc<D> {
    fn encode_size(&self) -> usize {
        u64::SIZE * 2 + D::SIZE * 2
    }
}

impl<D: Digest> Read for CheckpointDesc<D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let checkpoint = read_u64_le(buf)?;
        let last_block = read_u64_le(buf)?;
        let digest_of_last_block = D::read(buf)?;
        let digest_of_pages_descriptor = D::read(buf)?;
        Ok(Self {
            checkpoint,
            last_block,
            digest_of_last_block,
            digest_of_pages_descriptor,
        })
    }
}

/// One entry of a reserved-pages descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageInfo<D: Digest> {
    /// The page identifier.
    pub page: u32,
    /// The checkpoint at which the page was last snapshotted (0 if never written).
    pub checkpoint: u64,
    /// Digest of the page at that snapshot.
    pub digest: D,
}

/// Ordered summary of the reserved-page state at some checkpoint.
///
/// Contains one entry per page, ordered by page identifier. Its digest pins the
/// entire reserved-page state into a [CheckpointDesc].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PagesDescriptor<D: Digest> {
    /// Descriptor entries, one per page, ascending by page identifier.
    pub entries: Vec<PageInfo<D>>,
}

impl<D: Digest> PagesDescriptor<D> {
    /// Computes the digest pinning this descriptor.
    pub fn digest<H: Hasher<Digest = D>>(&self) -> D {
        let mut hasher = H::new();
        hasher.update(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            hasher.update(&entry.page.to_le_bytes());
            hasher.update(&entry.checkpoint.to_le_bytes());
            hasher.update(entry.digest.as_ref());
        }
        hasher.finalize()
    }
}

/// One page carried by a [VBlock].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VBlockPage {
    /// The page identifier.
    pub page: u32,
    /// The checkpoint at which this snapshot of the page was frozen.
    pub checkpoint: u64,
    /// The page contents (exactly the configured page size).
    pub data: Bytes,
}

/// A packed bundle of the reserved pages a requester is missing: exactly those
/// pages whose snapshot checkpoint exceeds the requester's last known checkpoint.
///
/// Transferred as [crate::wire::Payload::ItemData] chunks under [VBLOCK_NUMBER].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VBlock {
    /// The checkpoint the bundle was materialized for.
    pub checkpoint: u64,
    /// The requester's last known checkpoint.
    pub requester_checkpoint: u64,
    /// The updated pages, ascending by page identifier.
    pub pages: Vec<VBlockPage>,
}

impl Write for VBlock {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.checkpoint);
        buf.put_u64_le(self.requester_checkpoint);
        buf.put_u32_le(self.pages.len() as u32);
        for page in &self.pages {
            buf.put_u32_le(page.page);
            buf.put_u64_le(page.checkpoint);
            buf.put_slice(&page.data);
        }
    }
}

impl EncodeSize for VBlock {
    fn encode_size(&self) -> usize {
        let per_page: usize = self
            .pages
            .iter()
            .map(|p| u32::SIZE + u64::SIZE + p.data.len())
            .sum();
        u64::SIZE * 2 + u32::SIZE + per_page
    }
}

impl Read for VBlock {
    /// `(page_size, max_pages)`.
    type Cfg = (u32, u32);

    fn read_cfg(buf: &mut impl Buf, (page_size, max_pages): &Self::Cfg) -> Result<Self, Error> {
        let checkpoint = read_u64_le(buf)?;
        let requester_checkpoint = read_u64_le(buf)?;
        let count = read_u32_le(buf)?;
        if count > *max_pages {
            return Err(Error::Invalid("VBlock", "too many pages"));
        }
        let mut pages = Vec::with_capacity(count as usize);
        let mut last_page: Option<u32> = None;
        for _ in 0..count {
            let page = read_u32_le(buf)?;
            if last_page.is_some_and(|last| page <= last) {
                return Err(Error::Invalid("VBlock", "pages out of order"));
            }
            last_page = Some(page);
            let checkpoint = read_u64_le(buf)?;
            if buf.remaining() < *page_size as usize {
                return Err(Error::EndOfBuffer);
            }
            let data = buf.copy_to_bytes(*page_size as usize);
            pages.push(VBlockPage {
                page,
                checkpoint,
                data,
            });
        }
        Ok(Self {
            checkpoint,
            requester_checkpoint,
            pages,
        })
    }
}

/// Computes the content digest of an application block.
///
/// The block number is folded in so a block cannot be replayed at a different
/// position in the chain.
pub fn digest_of_block<H: Hasher>(number: u64, block: &[u8]) -> H::Digest {
    let mut hasher = H::new();
    hasher.update(&number.to_le_bytes());
    hasher.update(block);
    hasher.finalize()
}

/// Computes the digest of a reserved page snapshot.
///
/// The page identifier and snapshot checkpoint are folded in so a page cannot be
/// replayed at a different address or epoch.
pub fn digest_of_page<H: Hasher>(page: u32, checkpoint: u64, data: &[u8]) -> H::Digest {
    let mut hasher = H::new();
    hasher.update(&page.to_le_bytes());
    hasher.update(&checkpoint.to_le_bytes());
    hasher.update(data);
    hasher.finalize()
}

pub(crate) fn read_u64_le(buf: &mut impl Buf) -> Result<u64, Error> {
    if buf.remaining() < u64::SIZE {
        return Err(Error::EndOfBuffer);
    }
    Ok(buf.get_u64_le())
}

pub(crate) fn read_u32_le(buf: &mut impl Buf) -> Result<u32, Error> {
    if buf.remaining() < u32::SIZE {
        return Err(Error::EndOfBuffer);
    }
    Ok(buf.get_u32_le())
}

pub(crate) fn read_u16_le(buf: &mut impl Buf) -> Result<u16, Error> {
    if buf.remaining() < u16::SIZE {
        return Err(Error::EndOfBuffer);
    }
    Ok(buf.get_u16_le())
}
