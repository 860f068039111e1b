//! Control surface of the state-transfer engine.
//!
//! The host replica drives the engine exclusively through the [Mailbox]: every
//! command is enqueued onto the same channel the engine drains for network and
//! timer events, so control calls are serialized with message handling.

use crate::{types::FetchingState, Error};
use bytes::Bytes;
use commonware_cryptography::Digest;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};

/// Snapshot of engine progress (for operators and tests).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    /// Current phase of the state machine.
    pub state: FetchingState,
    /// Last stored checkpoint, if any.
    pub last_stored_checkpoint: Option<u64>,
    /// Checkpoint being fetched, once certified.
    pub target_checkpoint: Option<u64>,
    /// Next block required from the source, while fetching blocks.
    pub next_required_block: Option<u64>,
    /// Buffered chunks awaiting reassembly.
    pub pending_chunks: usize,
}

/// Commands accepted by the engine.
pub enum Message<D: Digest> {
    /// Freeze the pending reserved pages and record a checkpoint descriptor.
    CreateCheckpoint {
        checkpoint: u64,
        response: oneshot::Sender<Result<(), Error>>,
    },
    /// Prune checkpoints that fell out of the retention window.
    MarkCheckpointStable {
        checkpoint: u64,
        response: oneshot::Sender<Result<(), Error>>,
    },
    /// Begin collecting state from peers.
    StartCollecting {
        response: oneshot::Sender<Result<(), Error>>,
    },
    /// Read a reserved page (pending view, else newest snapshot, else zeros).
    LoadReservedPage {
        page: u32,
        response: oneshot::Sender<Result<Bytes, Error>>,
    },
    /// Write a reserved page into the pending view.
    SaveReservedPage {
        page: u32,
        data: Bytes,
        response: oneshot::Sender<Result<(), Error>>,
    },
    /// Zero-fill a reserved page in the pending view.
    ZeroReservedPage {
        page: u32,
        response: oneshot::Sender<Result<(), Error>>,
    },
    /// Report engine progress.
    Status { response: oneshot::Sender<Status> },
    /// Return the digest of the last block of a stored checkpoint.
    CheckpointDigest {
        checkpoint: u64,
        response: oneshot::Sender<Option<D>>,
    },
}

/// Sends commands to the engine.
#[derive(Clone)]
pub struct Mailbox<D: Digest> {
    sender: mpsc::Sender<Message<D>>,
}

impl<D: Digest> Mailbox<D> {
    pub(super) const fn new(sender: mpsc::Sender<Message<D>>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &mut self,
        message: Message<D>,
        receiver: oneshot::Receiver<Result<T, Error>>,
    ) -> Result<T, Error> {
        self.sender.send(message).await.map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)?
    }

    /// Freezes the pending reserved pages into a snapshot indexed by `checkpoint`
    /// and records the checkpoint descriptor. Checkpoints must be created in
    /// strictly increasing order.
    pub async fn create_checkpoint(&mut self, checkpoint: u64) -> Result<(), Error> {
        let (response, receiver) = oneshot::channel();
        self.request(
            Message::CreateCheckpoint {
                checkpoint,
                response,
            },
            receiver,
        )
        .await
    }

    /// Prunes every stored checkpoint older than the retention window anchored
    /// at `checkpoint`, together with the page snapshots it exclusively covers.
    pub async fn mark_checkpoint_stable(&mut self, checkpoint: u64) -> Result<(), Error> {
        let (response, receiver) = oneshot::channel();
        self.request(
            Message::MarkCheckpointStable {
                checkpoint,
                response,
            },
            receiver,
        )
        .await
    }

    /// Starts a transfer. Fails with [Error::AlreadyFetching] if one is running.
    pub async fn start_collecting(&mut self) -> Result<(), Error> {
        let (response, receiver) = oneshot::channel();
        self.request(Message::StartCollecting { response }, receiver)
            .await
    }

    /// Reads a reserved page.
    pub async fn load_reserved_page(&mut self, page: u32) -> Result<Bytes, Error> {
        let (response, receiver) = oneshot::channel();
        self.request(Message::LoadReservedPage { page, response }, receiver)
            .await
    }

    /// Writes a reserved page into the pending view.
    pub async fn save_reserved_page(&mut self, page: u32, data: Bytes) -> Result<(), Error> {
        let (response, receiver) = oneshot::channel();
        self.request(
            Message::SaveReservedPage {
                page,
                data,
                response,
            },
            receiver,
        )
        .await
    }

    /// Zero-fills a reserved page in the pending view.
    pub async fn zero_reserved_page(&mut self, page: u32) -> Result<(), Error> {
        let (response, receiver) = oneshot::channel();
        self.request(Message::ZeroReservedPage { page, response }, receiver)
            .await
    }

    /// Reports engine progress.
    pub async fn status(&mut self) -> Result<Status, Error> {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(Message::Status { response })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)
    }

    /// Returns the digest of the last block of a stored checkpoint, if stored.
    pub async fn checkpoint_digest(&mut self, checkpoint: u64) -> Result<Option<D>, Error> {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(Message::CheckpointDigest {
                checkpoint,
                response,
            })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)
    }
}
