//! Bit-exact wire format for the six state-transfer messages.
//!
//! Every message begins with a fixed header (`type u16 | sender u16 | seq u64`,
//! little-endian) followed by a type-specific body of fixed-width little-endian
//! fields. The only variable-length payload is the [Payload::ItemData] trailer:
//! `data_size u32` followed by exactly that many bytes, bounded at decode time by
//! the configured maximum chunk size.

use crate::types::{read_u16_le, read_u32_le, read_u64_le};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error, FixedSize, Read, Write};
use commonware_cryptography::Digest;

const TYPE_ASK_FOR_CHECKPOINT_SUMMARIES: u16 = 1;
const TYPE_CHECKPOINT_SUMMARY: u16 = 2;
const TYPE_FETCH_BLOCKS: u16 = 3;
const TYPE_FETCH_RES_PAGES: u16 = 4;
const TYPE_REJECT_FETCHING: u16 = 5;
const TYPE_ITEM_DATA: u16 = 6;

/// A state-transfer message as it travels between replicas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message<D: Digest> {
    /// Index of the sending replica in the sorted participant set.
    pub sender: u16,
    /// Unique, strictly increasing (per sender) sequence number.
    pub seq: u64,
    /// The message body.
    pub payload: Payload<D>,
}

/// Body of a state-transfer [Message].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload<D: Digest> {
    /// Broadcast by a collecting replica to learn about stable checkpoints.
    AskForCheckpointSummaries(AskForCheckpointSummaries),
    /// Unicast reply describing the sender's latest relevant checkpoint.
    CheckpointSummary(CheckpointSummary<D>),
    /// Request a range of application blocks from the current source.
    FetchBlocks(FetchBlocks),
    /// Request the reserved pages the requester is missing.
    FetchResPages(FetchResPages),
    /// The source declines to serve a fetch.
    RejectFetching(RejectFetching),
    /// One chunk of a block (or of the reserved-pages virtual block).
    ItemData(ItemData),
}

impl<D: Digest> Payload<D> {
    const fn kind(&self) -> u16 {
        match self {
            Self::AskForCheckpointSummaries(_) => TYPE_ASK_FOR_CHECKPOINT_SUMMARIES,
            Self::CheckpointSummary(_) => TYPE_CHECKPOINT_SUMMARY,
            Self::FetchBlocks(_) => TYPE_FETCH_BLOCKS,
            Self::FetchResPages(_) => TYPE_FETCH_RES_PAGES,
            Self::RejectFetching(_) => TYPE_REJECT_FETCHING,
            Self::ItemData(_) => TYPE_ITEM_DATA,
        }
    }

    /// Human-readable message name (used in logs).
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AskForCheckpointSummaries(_) => "AskForCheckpointSummaries",
            Self::CheckpointSummary(_) => "CheckpointSummary",
            Self::FetchBlocks(_) => "FetchBlocks",
            Self::FetchResPages(_) => "FetchResPages",
            Self::RejectFetching(_) => "RejectFetching",
            Self::ItemData(_) => "ItemData",
        }
    }
}

/// `{min_relevant_checkpoint}`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AskForCheckpointSummaries {
    /// Summaries for checkpoints below this number are of no use to the requester.
    pub min_relevant_checkpoint: u64,
}

/// `{checkpoint, last_block, digest_of_last_block, digest_of_pages_descriptor, request_seq}`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointSummary<D: Digest> {
    /// The summarized checkpoint number.
    pub checkpoint: u64,
    /// The last block covered by the checkpoint.
    pub last_block: u64,
    /// Digest of that block.
    pub digest_of_last_block: D,
    /// Digest of the reserved-pages descriptor at the checkpoint.
    pub digest_of_pages_descriptor: D,
    /// Sequence number of the ask being answered.
    pub request_seq: u64,
}

/// `{first_required_block, last_required_block, last_known_chunk}`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchBlocks {
    /// Lowest block required (inclusive).
    pub first_required_block: u64,
    /// Highest block required (inclusive); streamed first.
    pub last_required_block: u64,
    /// Last chunk of `last_required_block` the requester already holds
    /// (0 = none; the source resumes at the next chunk).
    pub last_known_chunk: u16,
}

/// `{last_known_checkpoint, required_checkpoint, last_known_chunk}`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchResPages {
    /// The requester's last stored checkpoint.
    pub last_known_checkpoint: u64,
    /// The certified checkpoint whose pages are required.
    pub required_checkpoint: u64,
    /// Last chunk of the virtual block the requester already holds (0 = none).
    pub last_known_chunk: u16,
}

/// Why a source declined a fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    /// The source is itself collecting state.
    InProgress = 1,
    /// The requested checkpoint is not stored.
    MissingCheckpoint = 2,
    /// The requested block range is not served by this replica.
    InvalidRange = 3,
    /// The source is overloaded.
    Busy = 4,
}

impl TryFrom<u8> for RejectReason {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            1 => Ok(Self::InProgress),
            2 => Ok(Self::MissingCheckpoint),
            3 => Ok(Self::InvalidRange),
            4 => Ok(Self::Busy),
            _ => Err(Error::Invalid("RejectFetching", "unknown reason")),
        }
    }
}

/// `{reason, request_seq}`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectFetching {
    /// Why the fetch was declined.
    pub reason: RejectReason,
    /// Sequence number of the declined request.
    pub request_seq: u64,
}

/// `{block_number, total_chunks, chunk_number, last_in_batch, data}`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemData {
    /// The block being transferred ([crate::types::VBLOCK_NUMBER] for reserved pages).
    pub block_number: u64,
    /// Total number of chunks in the block.
    pub total_chunks: u16,
    /// This chunk's 1-based position.
    pub chunk_number: u16,
    /// Whether this is the final chunk of the current batch.
    pub last_in_batch: bool,
    /// The chunk contents.
    pub data: Bytes,
}

impl<D: Digest> Write for Message<D> {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.payload.kind());
        buf.put_u16_le(self.sender);
        buf.put_u64_le(self.seq);
        match &self.payload {
            Payload::AskForCheckpointSummaries(m) => {
                buf.put_u64_le(m.min_relevant_checkpoint);
            }
            Payload::CheckpointSummary(m) => {
                buf.put_u64_le(m.checkpoint);
                buf.put_u64_le(m.last_block);
                m.digest_of_last_block.write(buf);
                m.digest_of_pages_descriptor.write(buf);
                buf.put_u64_le(m.request_seq);
            }
            Payload::FetchBlocks(m) => {
                buf.put_u64_le(m.first_required_block);
                buf.put_u64_le(m.last_required_block);
                buf.put_u16_le(m.last_known_chunk);
            }
            Payload::FetchResPages(m) => {
                buf.put_u64_le(m.last_known_checkpoint);
                buf.put_u64_le(m.required_checkpoint);
                buf.put_u16_le(m.last_known_chunk);
            }
            Payload::RejectFetching(m) => {
                buf.put_u8(m.reason as u8);
                buf.put_u64_le(m.request_seq);
            }
            Payload::ItemData(m) => {
                buf.put_u64_le(m.block_number);
                buf.put_u16_le(m.total_chunks);
                buf.put_u16_le(m.chunk_number);
                buf.put_u8(m.last_in_batch as u8);
                buf.put_u32_le(m.data.len() as u32);
                buf.put_slice(&m.data);
            }
        }
    }
}

impl<D: Digest> EncodeSize for Message<D> {
    fn encode_size(&self) -> usize {
        let header = u16::SIZE * 2 + u64::SIZE;
        let body = match &self.payload {
            Payload::AskForCheckpointSummaries(_) => u64::SIZE,
            Payload::CheckpointSummary(_) => u64::SIZE * 3 + D::SIZE * 2,
            Payload::FetchBlocks(_) => u64::SIZE * 2 + u16::SIZE,
            Payload::FetchResPages(_) => u64::SIZE * 2 + u16::SIZE,
            Payload::RejectFetching(_) => u8::SIZE + u64::SIZE,
            Payload::ItemData(m) => {
                u64::SIZE + u16::SIZE * 2 + u8::SIZE + u32::SIZE + m.data.len()
            }
        };
        header + body
    }
}

impl<D: Digest> Read for Message<D> {
    /// Maximum accepted [ItemData] chunk size.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_chunk_size: &usize) -> Result<Self, Error> {
        let kind = read_u16_le(buf)?;
        let sender = read_u16_le(buf)?;
        let seq = read_u64_le(buf)?;
        let payload = match kind {
            TYPE_ASK_FOR_CHECKPOINT_SUMMARIES => {
                let min_relevant_checkpoint = read_u64_le(buf)?;
                Payload::AskForCheckpointSummaries(AskForCheckpointSummaries {
                    min_relevant_checkpoint,
                })
            }
            TYPE_CHECKPOINT_SUMMARY => {
                let checkpoint = read_u64_le(buf)?;
                let last_block = read_u64_le(buf)?;
                let digest_of_last_block = D::read_cfg(buf, &())?;
                let digest_of_pages_descriptor = D::read_cfg(buf, &())?;
                let request_seq = read_u64_le(buf)?;
                Payload::CheckpointSummary(CheckpointSummary {
                    checkpoint,
                    last_block,
                    digest_of_last_block,
                    digest_of_pages_descriptor,
                    request_seq,
                })
            }
            TYPE_FETCH_BLOCKS => {
                let first_required_block = read_u64_le(buf)?;
                let last_required_block = read_u64_le(buf)?;
                let last_known_chunk = read_u16_le(buf)?;
                if first_required_block > last_required_block {
                    return Err(Error::Invalid("FetchBlocks", "empty range"));
                }
                Payload::FetchBlocks(FetchBlocks {
                    first_required_block,
                    last_required_block,
                    last_known_chunk,
                })
            }
            TYPE_FETCH_RES_PAGES => {
                let last_known_checkpoint = read_u64_le(buf)?;
                let required_checkpoint = read_u64_le(buf)?;
                let last_known_chunk = read_u16_le(buf)?;
                if last_known_checkpoint >= required_checkpoint {
                    return Err(Error::Invalid("FetchResPages", "checkpoint not ahead"));
                }
                Payload::FetchResPages(FetchResPages {
                    last_known_checkpoint,
                    required_checkpoint,
                    last_known_chunk,
                })
            }
            TYPE_REJECT_FETCHING => {
                if buf.remaining() < u8::SIZE {
                    return Err(Error::EndOfBuffer);
                }
                let reason = RejectReason::try_from(buf.get_u8())?;
                let request_seq = read_u64_le(buf)?;
                Payload::RejectFetching(RejectFetching {
                    reason,
                    request_seq,
                })
            }
            TYPE_ITEM_DATA => {
                let block_number = read_u64_le(buf)?;
                let total_chunks = read_u16_le(buf)?;
                let chunk_number = read_u16_le(buf)?;
                if buf.remaining() < u8::SIZE {
                    return Err(Error::EndOfBuffer);
                }
                let last_in_batch = match buf.get_u8() {
                    0 => false,
                    1 => true,
                    _ => return Err(Error::Invalid("ItemData", "invalid flag")),
                };
                let data_size = read_u32_le(buf)? as usize;
                if chunk_number == 0 || chunk_number > total_chunks {
                    return Err(Error::Invalid("ItemData", "chunk out of range"));
                }
                if data_size == 0 || data_size > *max_chunk_size {
                    return Err(Error::Invalid("ItemData", "invalid chunk size"));
                }
                if buf.remaining() < data_size {
                    return Err(Error::EndOfBuffer);
                }
                let data = buf.copy_to_bytes(data_size);
                Payload::ItemData(ItemData {
                    block_number,
                    total_chunks,
                    chunk_number,
                    last_in_batch,
                    data,
                })
            }
            _ => return Err(Error::Invalid("Message", "unknown type")),
        };
        Ok(Self {
            sender,
            seq,
            payload,
        })
    }
}
