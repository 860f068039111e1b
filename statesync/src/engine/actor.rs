//! The state-transfer engine.

use super::{
    cache::{VBlockCache, VBlockKey, MAX_CACHED_VBLOCKS},
    collector::{Added, SummaryCollector},
    ingress::{Mailbox, Message, Status},
    metrics::Metrics,
    selector::SourceSelector,
    Config,
};
use crate::{
    auditor, datastore,
    datastore::{DataStore, PageRecord, Setup},
    types::{
        digest_of_block, digest_of_page, CheckpointDesc, FetchingState, PageInfo, PagesDescriptor,
        VBlock, VBlockPage, PAGE_ALIGNMENT, SUMMARY_RESET_COUNT, VBLOCK_NUMBER,
    },
    wire, AppState, Error, Reporter,
};
use bytes::{Bytes, BytesMut};
use commonware_codec::{Decode, Encode};
use commonware_cryptography::{Hasher, PublicKey};
use commonware_macros::select;
use commonware_p2p::{Receiver, Recipients, Sender};
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Spawner, Storage};
use commonware_utils::max_faults;
use futures::{channel::mpsc, StreamExt};
use rand::Rng;
use std::{
    cmp::Reverse,
    collections::BTreeMap,
    marker::PhantomData,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, info, warn};

/// Bits of a sequence number devoted to the per-millisecond counter.
const SEQ_COUNTER_BITS: u64 = 22;

/// A buffered chunk awaiting reassembly.
struct PendingChunk {
    total: u16,
    data: Bytes,
}

/// Result of attempting to reassemble a block from buffered chunks.
enum Assembled {
    /// All chunks are present and consistent.
    Complete(Bytes),
    /// Some chunks are still missing; keep waiting.
    Incomplete,
    /// The buffered chunks contradict each other; the source is lying.
    Bad,
}

/// Drives a replica through the collecting state transfer and serves other
/// replicas doing the same.
///
/// The engine is a single actor: control commands, inbound messages, and timer
/// ticks are handled one at a time, so every handler observes the fully-applied
/// effects of its predecessors. All durable progress goes through [DataStore],
/// whose commits are atomic; a crash at any point resumes in the same phase.
pub struct Engine<E, P, H, A, R, NetS, NetR>
where
    E: Clock + Spawner + Rng + RuntimeMetrics + Storage,
    P: PublicKey,
    H: Hasher,
    A: AppState<Digest = H::Digest>,
    R: Reporter,
    NetS: Sender<PublicKey = P>,
    NetR: Receiver<PublicKey = P>,
{
    context: E,

    // ---------- Configuration ----------
    participants: Vec<P>,
    me: u16,
    max_block_size: usize,
    max_chunk_size: usize,
    max_chunks_per_batch: u16,
    max_pending_bytes: usize,
    refresh_interval: Duration,
    summaries_retry_timeout: Duration,
    fetch_retry_timeout: Duration,
    max_msg_delay: Duration,
    seqnum_resync_window: Duration,
    metrics_dump_interval: Duration,

    // ---------- Collaborators ----------
    app: A,
    reporter: R,
    datastore: DataStore<E, H::Digest>,

    // ---------- Components ----------
    selector: SourceSelector<P>,
    collector: SummaryCollector<H::Digest>,
    vblocks: VBlockCache,

    // ---------- Sequence numbers ----------
    last_seq_millis: u64,
    last_seq_count: u64,
    seq_accept_times: BTreeMap<u16, SystemTime>,

    // ---------- Summary collection ----------
    last_ask_seq: u64,
    last_ask_time: Option<SystemTime>,
    ask_backoff: Duration,
    ask_retransmissions: u32,
    fetch_rotations: u32,

    // ---------- Fetch progress (rebuilt on resume) ----------
    next_required_block: u64,
    digest_of_next_required_block: Option<H::Digest>,
    pending_chunks: BTreeMap<(Reverse<u64>, u16), PendingChunk>,
    pending_bytes: usize,
    last_request_time: Option<SystemTime>,
    last_status_log: Option<SystemTime>,

    // ---------- Message passing ----------
    mailbox: mpsc::Receiver<Message<H::Digest>>,

    // ---------- Metrics ----------
    metrics: Metrics,

    _sender: PhantomData<NetS>,
    _receiver: PhantomData<NetR>,
}

impl<E, P, H, A, R, NetS, NetR> Engine<E, P, H, A, R, NetS, NetR>
where
    E: Clock + Spawner + Rng + RuntimeMetrics + Storage,
    P: PublicKey,
    H: Hasher,
    A: AppState<Digest = H::Digest>,
    R: Reporter,
    NetS: Sender<PublicKey = P>,
    NetR: Receiver<PublicKey = P>,
{
    /// Opens the datastore and creates a new engine.
    ///
    /// Returns the engine and a mailbox to control it. Panics if the configuration
    /// is invalid or the persisted geometry does not match the configured one.
    pub async fn init(context: E, cfg: Config<P>, app: A, reporter: R) -> (Self, Mailbox<H::Digest>) {
        // Validate configuration.
        let mut participants = cfg.participants;
        participants.sort();
        participants.dedup();
        let me = participants
            .binary_search(&cfg.public_key)
            .expect("public key not in participant set") as u16;
        assert!(participants.len() >= 4, "need at least 3f+1 = 4 replicas");
        assert!(cfg.reserved_pages > 0, "reserved page space is empty");
        assert!(
            cfg.page_size > 0 && cfg.page_size % PAGE_ALIGNMENT == 0,
            "page size must be a positive multiple of {PAGE_ALIGNMENT}"
        );
        assert!(
            cfg.page_size as usize <= cfg.max_chunk_size,
            "a page must fit in one chunk"
        );
        assert!(cfg.max_stored_checkpoints >= 1, "must store checkpoints");
        assert!(cfg.max_chunk_size > 0 && cfg.max_chunks_per_batch > 0);
        let threshold = max_faults(participants.len() as u32) as usize + 1;

        // Open the datastore and pin the geometry.
        let mut datastore: DataStore<E, H::Digest> = DataStore::init(
            context.with_label("datastore"),
            format!("{}-journal", cfg.partition_prefix),
        )
        .await
        .expect("failed to open datastore");
        let setup = Setup {
            max_stored_checkpoints: cfg.max_stored_checkpoints,
            reserved_pages: cfg.reserved_pages,
            page_size: cfg.page_size,
        };
        match datastore.setup() {
            Some(existing) => assert!(
                *existing == setup,
                "persisted geometry does not match configuration"
            ),
            None => datastore.set_setup(setup),
        }

        let others: Vec<P> = participants
            .iter()
            .filter(|p| **p != cfg.public_key)
            .cloned()
            .collect();
        let selector = SourceSelector::new(others, cfg.source_replacement_timeout);
        // A correct replica has no reason to describe more checkpoints per round.
        let sender_budget = cfg.max_stored_checkpoints as usize + 1;
        let collector = SummaryCollector::new(threshold, sender_budget);
        let metrics = Metrics::init(&context);

        let (sender, mailbox) = mpsc::channel(cfg.mailbox_size);
        (
            Self {
                context,
                participants,
                me,
                max_block_size: cfg.max_block_size,
                max_chunk_size: cfg.max_chunk_size,
                max_chunks_per_batch: cfg.max_chunks_per_batch,
                max_pending_bytes: cfg.max_pending_bytes,
                refresh_interval: cfg.refresh_interval,
                summaries_retry_timeout: cfg.summaries_retry_timeout,
                fetch_retry_timeout: cfg.fetch_retry_timeout,
                max_msg_delay: cfg.max_msg_delay,
                seqnum_resync_window: cfg.seqnum_resync_window,
                metrics_dump_interval: cfg.metrics_dump_interval,
                app,
                reporter,
                datastore,
                selector,
                collector,
                vblocks: VBlockCache::new(MAX_CACHED_VBLOCKS),
                last_seq_millis: 0,
                last_seq_count: 0,
                seq_accept_times: BTreeMap::new(),
                last_ask_seq: 0,
                last_ask_time: None,
                ask_backoff: cfg.summaries_retry_timeout,
                ask_retransmissions: 0,
                fetch_rotations: 0,
                next_required_block: 0,
                digest_of_next_required_block: None,
                pending_chunks: BTreeMap::new(),
                pending_bytes: 0,
                last_request_time: None,
                last_status_log: None,
                mailbox,
                metrics,
                _sender: PhantomData,
                _receiver: PhantomData,
            },
            Mailbox::new(sender),
        )
    }

    /// Starts the engine, resuming any transfer that was in flight when the
    /// replica last stopped.
    pub fn start(self, network: (NetS, NetR)) -> Handle<()> {
        let context = self.context.clone();
        context.spawn(move |_| self.run(network))
    }

    async fn run(mut self, network: (NetS, NetR)) {
        let (mut sender, mut receiver) = network;
        let mut shutdown = self.context.stopped();

        // Nothing below can repair a store that contradicts itself; better to
        // refuse to run than to serve (or fetch onto) corrupt state.
        auditor::check::<E, H, A>(&self.datastore, &self.app)
            .await
            .unwrap_or_else(|violation| panic!("state consistency violation: {violation}"));

        // Resume a transfer that was interrupted by a crash or restart.
        if self.datastore.is_fetching() {
            self.resume(&mut sender).await;
        }

        let mut next_tick = self.context.current() + self.refresh_interval;
        loop {
            self.update_gauges();
            select! {
                _ = &mut shutdown => {
                    debug!("shutdown");
                    return;
                },
                message = self.mailbox.next() => {
                    let Some(message) = message else {
                        debug!("mailbox closed");
                        return;
                    };
                    self.handle_control(message, &mut sender).await;
                },
                message = receiver.recv() => {
                    let Ok((peer, bytes)) = message else {
                        debug!("receiver closed");
                        return;
                    };
                    self.handle_network(peer, bytes, &mut sender).await;
                },
                _ = self.context.sleep_until(next_tick) => {
                    next_tick = self.context.current() + self.refresh_interval;
                    self.on_tick(&mut sender).await;
                },
            }
        }
    }

    // -------------------- State --------------------

    fn fetching_state(&self) -> FetchingState {
        if !self.datastore.is_fetching() {
            FetchingState::NotFetching
        } else if self.datastore.target().is_none() {
            FetchingState::GettingCheckpointSummaries
        } else if self.datastore.required_blocks().is_some() {
            FetchingState::GettingMissingBlocks
        } else {
            FetchingState::GettingMissingResPages
        }
    }

    fn setup(&self) -> &Setup {
        self.datastore.setup().expect("geometry pinned at init")
    }

    fn update_gauges(&self) {
        let state = match self.fetching_state() {
            FetchingState::NotFetching => 0,
            FetchingState::GettingCheckpointSummaries => 1,
            FetchingState::GettingMissingBlocks => 2,
            FetchingState::GettingMissingResPages => 3,
        };
        self.metrics.fetching_state.set(state);
        self.metrics
            .last_stored_checkpoint
            .set(self.datastore.last_stored_checkpoint().unwrap_or(0) as i64);
        self.metrics
            .target_checkpoint
            .set(self.datastore.target().map(|t| t.checkpoint).unwrap_or(0) as i64);
        self.metrics
            .next_required_block
            .set(self.next_required_block as i64);
        self.metrics.pending_chunks.set(self.pending_chunks.len() as i64);
        self.metrics.pending_bytes.set(self.pending_bytes as i64);
        self.metrics
            .preferred_sources
            .set(self.selector.len_preferred() as i64);
    }

    // -------------------- Sequence numbers --------------------

    fn unix_millis(&self) -> u64 {
        self.context
            .current()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Produces a unique, strictly increasing sequence number: wall-clock
    /// milliseconds in the upper bits, a per-millisecond counter in the lower.
    fn next_seq(&mut self) -> u64 {
        let millis = self.unix_millis();
        if millis > self.last_seq_millis {
            self.last_seq_millis = millis;
            self.last_seq_count = 0;
        }
        // A clock that moved backwards keeps the previous millisecond and bumps
        // the counter, so locally generated numbers never regress.
        self.last_seq_count += 1;
        (self.last_seq_millis << SEQ_COUNTER_BITS) | (self.last_seq_count & ((1 << SEQ_COUNTER_BITS) - 1))
    }

    /// Accepts a message sequence number if it is fresh and advances the
    /// sender's cursor. A sender whose number regressed is accepted again only
    /// after the resync window has passed (it likely restarted).
    fn accept_seq(&mut self, sender: u16, seq: u64) -> bool {
        let now = self.context.current();
        let now_millis = self.unix_millis();
        let sent_millis = seq >> SEQ_COUNTER_BITS;
        let max_delay = self.max_msg_delay.as_millis() as u64;
        if sent_millis + max_delay < now_millis || sent_millis > now_millis + max_delay {
            return false;
        }
        if let Some(last) = self.datastore.last_seq(sender) {
            if seq <= last {
                let resynced = self
                    .seq_accept_times
                    .get(&sender)
                    .and_then(|at| now.duration_since(*at).ok())
                    .is_some_and(|elapsed| elapsed >= self.seqnum_resync_window);
                if !resynced {
                    return false;
                }
            }
        }
        self.datastore.set_last_seq(sender, seq);
        self.seq_accept_times.insert(sender, now);
        true
    }

    // -------------------- Sending --------------------

    async fn send(
        &mut self,
        sender: &mut NetS,
        recipients: Recipients<P>,
        payload: wire::Payload<H::Digest>,
    ) -> u64 {
        let seq = self.next_seq();
        let message = wire::Message {
            sender: self.me,
            seq,
            payload,
        };
        let name = message.payload.name();
        let bytes: Bytes = message.encode().into();
        match sender.send(recipients, bytes, false).await {
            Err(err) => warn!(?err, name, "send failed"),
            Ok(to) if to.is_empty() => debug!(name, "message reached no peers"),
            Ok(_) => {}
        }
        seq
    }

    async fn send_ask(&mut self, sender: &mut NetS) {
        let min_relevant_checkpoint = self.datastore.last_stored_checkpoint().unwrap_or(0) + 1;
        let seq = self
            .send(
                sender,
                Recipients::All,
                wire::Payload::AskForCheckpointSummaries(wire::AskForCheckpointSummaries {
                    min_relevant_checkpoint,
                }),
            )
            .await;
        self.last_ask_seq = seq;
        self.last_ask_time = Some(self.context.current());
        // Randomize the next retransmission (bounded by the configured timeout)
        // so lagging replicas do not re-broadcast in lockstep.
        let base = self.summaries_retry_timeout.as_millis() as u64;
        let jitter = self.context.gen_range(0..=base / 2);
        self.ask_backoff = Duration::from_millis(base - jitter);
        self.metrics.sent_ask_summaries.inc();
        debug!(min_relevant_checkpoint, "asked for checkpoint summaries");
    }

    /// Highest chunk of `block` held contiguously from the start, so the source
    /// can resume mid-block instead of resending everything.
    fn last_known_chunk(&self, block: u64) -> u16 {
        let mut last = 0;
        for ((_, chunk), _) in self
            .pending_chunks
            .range((Reverse(block), 1)..=(Reverse(block), u16::MAX))
        {
            if *chunk != last + 1 {
                break;
            }
            last = *chunk;
        }
        last
    }

    /// (Re)sends the fetch request appropriate for the current phase, selecting a
    /// source first if none is active.
    async fn request_from_source(&mut self, sender: &mut NetS) {
        let now = self.context.current();
        if self.selector.current().is_none()
            && self.selector.select(&mut self.context, now).is_none()
        {
            return;
        }
        let source = self.selector.current().cloned().expect("source selected");
        let payload = match self.fetching_state() {
            FetchingState::GettingMissingBlocks => {
                let (first_required, _) = self.datastore.required_blocks().expect("in block phase");
                let last = self.next_required_block;
                let batch = self.max_chunks_per_batch as u64;
                let first = first_required.max(last.saturating_sub(batch - 1));
                self.metrics.sent_fetch_blocks.inc();
                wire::Payload::FetchBlocks(wire::FetchBlocks {
                    first_required_block: first,
                    last_required_block: last,
                    last_known_chunk: self.last_known_chunk(last),
                })
            }
            FetchingState::GettingMissingResPages => {
                let target = self.datastore.target().expect("in pages phase");
                self.metrics.sent_fetch_res_pages.inc();
                wire::Payload::FetchResPages(wire::FetchResPages {
                    last_known_checkpoint: self.datastore.last_stored_checkpoint().unwrap_or(0),
                    required_checkpoint: target.checkpoint,
                    last_known_chunk: self.last_known_chunk(VBLOCK_NUMBER),
                })
            }
            _ => return,
        };
        self.last_request_time = Some(now);
        self.send(sender, Recipients::One(source), payload).await;
    }

    /// Rotates away from the current source and re-requests.
    async fn rotate_source(&mut self, sender: &mut NetS) {
        self.clear_pending();
        self.fetch_rotations += 1;
        if self.restart_collection_if_exhausted(sender).await {
            return;
        }
        let now = self.context.current();
        self.selector.select(&mut self.context, now);
        self.request_from_source(sender).await;
    }

    /// Blacklists the current source for shipping bad data, then re-requests
    /// from another.
    async fn punish_source(&mut self, sender: &mut NetS) {
        if let Some(peer) = self.selector.current().cloned() {
            warn!(?peer, "source sent invalid data, blacklisting");
            self.selector.mark_bad(&peer);
        }
        self.clear_pending();
        self.fetch_rotations += 1;
        if self.restart_collection_if_exhausted(sender).await {
            return;
        }
        self.request_from_source(sender).await;
    }

    /// After too many fruitless rotations, the certificate itself may be the
    /// problem (or the network has moved on): drop it and collect summaries
    /// again. Returns whether collection restarted.
    async fn restart_collection_if_exhausted(&mut self, sender: &mut NetS) -> bool {
        if self.fetch_rotations < SUMMARY_RESET_COUNT {
            return false;
        }
        info!(
            rotations = self.fetch_rotations,
            "sources exhausted, restarting summary collection"
        );
        self.fetch_rotations = 0;
        self.datastore.set_target(None);
        self.datastore.set_required_blocks(None);
        self.datastore
            .commit()
            .await
            .unwrap_or_else(|err| panic!("failed to persist collection restart: {err}"));
        self.digest_of_next_required_block = None;
        self.next_required_block = 0;
        self.enter_summaries(sender).await;
        true
    }

    fn clear_pending(&mut self) {
        self.pending_chunks.clear();
        self.pending_bytes = 0;
    }

    // -------------------- Control commands --------------------

    async fn handle_control(&mut self, message: Message<H::Digest>, sender: &mut NetS) {
        match message {
            Message::CreateCheckpoint {
                checkpoint,
                response,
            } => {
                let _ = response.send(self.create_checkpoint(checkpoint).await);
            }
            Message::MarkCheckpointStable {
                checkpoint,
                response,
            } => {
                let _ = response.send(self.mark_checkpoint_stable(checkpoint).await);
            }
            Message::StartCollecting { response } => {
                let result = self.start_collecting(sender).await;
                let _ = response.send(result);
            }
            Message::LoadReservedPage { page, response } => {
                let _ = response.send(self.load_reserved_page(page));
            }
            Message::SaveReservedPage {
                page,
                data,
                response,
            } => {
                let _ = response.send(self.save_reserved_page(page, data).await);
            }
            Message::ZeroReservedPage { page, response } => {
                let page_size = self.setup().page_size as usize;
                let zeroed = Bytes::from(vec![0u8; page_size]);
                let _ = response.send(self.save_reserved_page(page, zeroed).await);
                self.metrics.zero_reserved_page.inc();
            }
            Message::Status { response } => {
                let state = self.fetching_state();
                let _ = response.send(Status {
                    state,
                    last_stored_checkpoint: self.datastore.last_stored_checkpoint(),
                    target_checkpoint: self.datastore.target().map(|t| t.checkpoint),
                    next_required_block: (state == FetchingState::GettingMissingBlocks)
                        .then_some(self.next_required_block),
                    pending_chunks: self.pending_chunks.len(),
                });
            }
            Message::CheckpointDigest {
                checkpoint,
                response,
            } => {
                let digest = self
                    .datastore
                    .get_checkpoint(checkpoint)
                    .unwrap_or_else(|err| panic!("failed to read checkpoint: {err}"))
                    .map(|desc| desc.digest_of_last_block);
                let _ = response.send(digest);
            }
        }
    }

    async fn create_checkpoint(&mut self, checkpoint: u64) -> Result<(), Error> {
        if self.datastore.is_fetching() {
            return Err(Error::Fetching);
        }
        if let Some(last) = self.datastore.last_stored_checkpoint() {
            if checkpoint <= last {
                return Err(Error::NonMonotonicCheckpoint { checkpoint, last });
            }
        }

        // Freeze the pending view into snapshots indexed by this checkpoint.
        for page in self.datastore.pending_pages() {
            let data = self
                .datastore
                .get_pending_page(page)
                .expect("directory lists pending page");
            let digest = digest_of_page::<H>(page, checkpoint, &data);
            self.datastore
                .put_page_snapshot(page, checkpoint, PageRecord { digest, data });
            self.datastore.remove_pending_page(page);
        }

        // Describe the checkpoint.
        let descriptor = datastore::descriptor_for::<H, E>(&self.datastore, checkpoint)
            .unwrap_or_else(|err| panic!("failed to rebuild descriptor: {err}"));
        let digest_of_pages_descriptor = descriptor.digest::<H>();
        let last_block = self.app.last_reachable_block().await;
        let digest_of_last_block = match self.app.get_block(last_block).await {
            Some(block) => digest_of_block::<H>(last_block, &block),
            None => digest_of_block::<H>(0, &[]),
        };
        self.datastore.put_checkpoint(CheckpointDesc {
            checkpoint,
            last_block,
            digest_of_last_block,
            digest_of_pages_descriptor,
        });

        // Drop checkpoints that fell out of the retention window.
        let max_stored = self.setup().max_stored_checkpoints;
        if checkpoint >= max_stored {
            let min = checkpoint - max_stored + 1;
            self.datastore.prune_checkpoints(min);
            self.vblocks.prune(min);
        }

        self.datastore
            .commit()
            .await
            .unwrap_or_else(|err| panic!("failed to persist checkpoint: {err}"));
        self.metrics.create_checkpoint.inc();
        debug!(checkpoint, last_block, "created checkpoint");
        Ok(())
    }

    async fn mark_checkpoint_stable(&mut self, checkpoint: u64) -> Result<(), Error> {
        if self.datastore.is_fetching() {
            return Err(Error::Fetching);
        }
        let max_stored = self.setup().max_stored_checkpoints;
        if checkpoint >= max_stored {
            let min = checkpoint - max_stored + 1;
            self.datastore.prune_checkpoints(min);
            self.vblocks.prune(min);
            self.datastore
                .commit()
                .await
                .unwrap_or_else(|err| panic!("failed to persist pruning: {err}"));
        }
        self.metrics.mark_checkpoint_stable.inc();
        debug!(checkpoint, "marked checkpoint stable");
        Ok(())
    }

    fn check_page(&self, page: u32) -> Result<(), Error> {
        let limit = self.setup().reserved_pages;
        if page >= limit {
            return Err(Error::InvalidPageId { page, limit });
        }
        Ok(())
    }

    fn load_reserved_page(&mut self, page: u32) -> Result<Bytes, Error> {
        if self.datastore.is_fetching() {
            return Err(Error::Fetching);
        }
        self.check_page(page)?;
        self.metrics.load_reserved_page.inc();
        if let Some(data) = self.datastore.get_pending_page(page) {
            return Ok(data);
        }
        if let Some(snapshot) = self.datastore.newest_snapshot_at_or_below(page, u64::MAX) {
            let record = self
                .datastore
                .get_page_snapshot(page, snapshot)
                .unwrap_or_else(|err| panic!("failed to read page snapshot: {err}"))
                .expect("directory lists snapshot");
            return Ok(record.data);
        }
        Ok(Bytes::from(vec![0u8; self.setup().page_size as usize]))
    }

    async fn save_reserved_page(&mut self, page: u32, data: Bytes) -> Result<(), Error> {
        if self.datastore.is_fetching() {
            return Err(Error::Fetching);
        }
        self.check_page(page)?;
        let expected = self.setup().page_size;
        if data.len() != expected as usize {
            return Err(Error::InvalidPageSize {
                size: data.len(),
                expected,
            });
        }
        self.datastore.put_pending_page(page, data);
        self.datastore
            .commit()
            .await
            .unwrap_or_else(|err| panic!("failed to persist page: {err}"));
        self.metrics.save_reserved_page.inc();
        Ok(())
    }

    async fn start_collecting(&mut self, sender: &mut NetS) -> Result<(), Error> {
        if self.datastore.is_fetching() {
            return Err(Error::AlreadyFetching);
        }
        self.datastore.set_fetching(true);
        self.datastore.set_target(None);
        self.datastore.set_required_blocks(None);
        self.datastore
            .commit()
            .await
            .unwrap_or_else(|err| panic!("failed to persist transfer start: {err}"));
        self.metrics.start_collecting.inc();
        info!("started collecting state");
        self.enter_summaries(sender).await;
        Ok(())
    }

    /// Enters (or re-enters) summary collection and broadcasts an ask.
    async fn enter_summaries(&mut self, sender: &mut NetS) {
        self.collector.clear();
        self.clear_pending();
        self.selector.reset();
        self.ask_retransmissions = 0;
        self.fetch_rotations = 0;
        self.send_ask(sender).await;
    }

    // -------------------- Resume --------------------

    /// Re-derives the in-memory fetch cursor from persisted state and the blocks
    /// already stored, then re-issues the request for the current phase.
    async fn resume(&mut self, sender: &mut NetS) {
        match self.fetching_state() {
            FetchingState::GettingCheckpointSummaries => {
                info!("resuming transfer: collecting summaries");
                self.enter_summaries(sender).await;
            }
            FetchingState::GettingMissingBlocks => {
                let (first, last) = self.datastore.required_blocks().expect("in block phase");
                // Blocks were stored from `last` downward, so the stored suffix is
                // contiguous; binary search for its lower edge.
                let (mut lo, mut hi) = (first, last + 1);
                while lo < hi {
                    let mid = lo + (hi - lo) / 2;
                    if self.app.has_block(mid).await {
                        hi = mid;
                    } else {
                        lo = mid + 1;
                    }
                }
                if lo == first {
                    // Every required block is already stored.
                    self.finish_blocks().await;
                    self.request_from_source(sender).await;
                    return;
                }
                self.next_required_block = lo - 1;
                self.digest_of_next_required_block = Some(if lo > last {
                    self.datastore
                        .target()
                        .expect("in block phase")
                        .digest_of_last_block
                } else {
                    self.app
                        .parent_digest(lo)
                        .await
                        .expect("stored block missing parent digest")
                });
                info!(
                    next = self.next_required_block,
                    last, "resuming transfer: fetching blocks"
                );
                self.request_from_source(sender).await;
            }
            FetchingState::GettingMissingResPages => {
                info!("resuming transfer: fetching reserved pages");
                self.request_from_source(sender).await;
            }
            FetchingState::NotFetching => unreachable!("resume requires a transfer"),
        }
    }

    // -------------------- Inbound messages --------------------

    async fn handle_network(&mut self, peer: P, bytes: Bytes, sender: &mut NetS) {
        let message = match wire::Message::<H::Digest>::decode_cfg(bytes, &self.max_chunk_size) {
            Ok(message) => message,
            Err(err) => {
                debug!(?err, ?peer, "malformed message");
                self.metrics.malformed_msg.inc();
                return;
            }
        };
        // The header index must agree with the authenticated transport identity.
        let Ok(index) = self.participants.binary_search(&peer) else {
            debug!(?peer, "unknown sender");
            self.metrics.irrelevant_msg.inc();
            return;
        };
        let index = index as u16;
        if message.sender != index || index == self.me {
            debug!(?peer, claimed = message.sender, "sender mismatch");
            self.metrics.malformed_msg.inc();
            return;
        }
        if !self.accept_seq(index, message.seq) {
            debug!(?peer, seq = message.seq, "stale sequence number");
            self.metrics.irrelevant_msg.inc();
            return;
        }
        match message.payload {
            wire::Payload::AskForCheckpointSummaries(m) => {
                self.handle_ask(peer, message.seq, m, sender).await
            }
            wire::Payload::CheckpointSummary(m) => self.handle_summary(index, m, sender).await,
            wire::Payload::FetchBlocks(m) => {
                self.handle_fetch_blocks(peer, message.seq, m, sender).await
            }
            wire::Payload::FetchResPages(m) => {
                self.handle_fetch_res_pages(peer, message.seq, m, sender).await
            }
            wire::Payload::RejectFetching(m) => self.handle_reject(peer, m, sender).await,
            wire::Payload::ItemData(m) => self.handle_item_data(peer, m, sender).await,
        }
    }

    /// Serves checkpoint summaries for every stored checkpoint the requester
    /// could use.
    async fn handle_ask(
        &mut self,
        peer: P,
        request_seq: u64,
        m: wire::AskForCheckpointSummaries,
        sender: &mut NetS,
    ) {
        if self.fetching_state() != FetchingState::NotFetching {
            self.metrics.irrelevant_msg.inc();
            return;
        }
        let (Some(first), Some(last)) = (
            self.datastore.first_stored_checkpoint(),
            self.datastore.last_stored_checkpoint(),
        ) else {
            self.metrics.irrelevant_msg.inc();
            return;
        };
        let lo = first.max(m.min_relevant_checkpoint);
        if lo > last {
            self.metrics.irrelevant_msg.inc();
            return;
        }
        self.metrics.received_ask_summaries.inc();
        for checkpoint in (lo..=last).rev() {
            let desc = self
                .datastore
                .get_checkpoint(checkpoint)
                .unwrap_or_else(|err| panic!("failed to read checkpoint: {err}"))
                .expect("stored range lists checkpoint");
            self.send(
                sender,
                Recipients::One(peer.clone()),
                wire::Payload::CheckpointSummary(wire::CheckpointSummary {
                    checkpoint: desc.checkpoint,
                    last_block: desc.last_block,
                    digest_of_last_block: desc.digest_of_last_block,
                    digest_of_pages_descriptor: desc.digest_of_pages_descriptor,
                    request_seq,
                }),
            )
            .await;
            self.metrics.sent_summary.inc();
        }
    }

    async fn handle_summary(
        &mut self,
        index: u16,
        m: wire::CheckpointSummary<H::Digest>,
        sender: &mut NetS,
    ) {
        if self.fetching_state() != FetchingState::GettingCheckpointSummaries {
            self.metrics.irrelevant_msg.inc();
            return;
        }
        // Only replies to our latest ask count: older replies may describe
        // checkpoints we no longer care about.
        if m.request_seq != self.last_ask_seq {
            self.metrics.irrelevant_msg.inc();
            return;
        }
        let min_relevant = self.datastore.last_stored_checkpoint().unwrap_or(0) + 1;
        if m.checkpoint < min_relevant {
            self.metrics.irrelevant_msg.inc();
            return;
        }
        self.metrics.received_summary.inc();
        match self.collector.add(index, &m) {
            Added::Accepted { divergent } => {
                if divergent {
                    // Two distinct payloads for one checkpoint: someone is lying,
                    // though we cannot yet tell who.
                    self.metrics.invalid_checkpoint_summary.inc();
                }
            }
            Added::Duplicate => return,
            Added::Conflict | Added::OverBudget => {
                self.metrics.invalid_checkpoint_summary.inc();
                return;
            }
        }
        let Some(target) = self.collector.complete().cloned() else {
            return;
        };
        self.on_certificate(target, sender).await;
    }

    /// A certificate has been assembled: pick the phase that gets us to the
    /// target and persist it.
    async fn on_certificate(&mut self, target: CheckpointDesc<H::Digest>, sender: &mut NetS) {
        let reachable = self.app.last_reachable_block().await;
        info!(
            checkpoint = target.checkpoint,
            last_block = target.last_block,
            reachable,
            "checkpoint certificate assembled"
        );
        self.collector.clear();
        self.datastore.set_required_blocks(
            (target.last_block > reachable).then(|| (reachable + 1, target.last_block)),
        );
        self.datastore.set_target(Some(target.clone()));
        self.datastore
            .commit()
            .await
            .unwrap_or_else(|err| panic!("failed to persist certificate: {err}"));
        self.selector.reset();
        self.clear_pending();
        if target.last_block > reachable {
            self.next_required_block = target.last_block;
            self.digest_of_next_required_block = Some(target.digest_of_last_block);
        }
        self.request_from_source(sender).await;
    }

    /// Serves a block range as [wire::Payload::ItemData] chunks, newest block first.
    async fn handle_fetch_blocks(
        &mut self,
        peer: P,
        request_seq: u64,
        m: wire::FetchBlocks,
        sender: &mut NetS,
    ) {
        if self.fetching_state() != FetchingState::NotFetching {
            self.reject(peer, request_seq, wire::RejectReason::InProgress, sender)
                .await;
            return;
        }
        let reachable = self.app.last_reachable_block().await;
        if m.last_required_block > reachable {
            self.reject(peer, request_seq, wire::RejectReason::InvalidRange, sender)
                .await;
            return;
        }
        self.metrics.received_fetch_blocks.inc();
        let mut budget = self.max_chunks_per_batch;
        for number in (m.first_required_block..=m.last_required_block).rev() {
            let Some(block) = self.app.get_block(number).await else {
                // Everything up to `reachable` must be present.
                panic!("reachable block {number} missing from app state");
            };
            let resume_after = if number == m.last_required_block {
                m.last_known_chunk
            } else {
                0
            };
            let finished = self
                .stream_chunks(
                    &peer,
                    number,
                    &block,
                    resume_after,
                    number == m.first_required_block,
                    &mut budget,
                    sender,
                )
                .await;
            if !finished {
                return;
            }
        }
    }

    /// Streams the chunks of one item, decrementing `budget`. Returns whether the
    /// item was fully sent (false once the batch budget is exhausted).
    #[allow(clippy::too_many_arguments)]
    async fn stream_chunks(
        &mut self,
        peer: &P,
        number: u64,
        item: &[u8],
        resume_after: u16,
        last_item: bool,
        budget: &mut u16,
        sender: &mut NetS,
    ) -> bool {
        let total_chunks = item.len().div_ceil(self.max_chunk_size).max(1) as u16;
        let resume_after = if resume_after >= total_chunks {
            0
        } else {
            resume_after
        };
        for chunk_number in (resume_after + 1)..=total_chunks {
            let start = (chunk_number as usize - 1) * self.max_chunk_size;
            let end = (start + self.max_chunk_size).min(item.len());
            *budget -= 1;
            let final_chunk = last_item && chunk_number == total_chunks;
            let last_in_batch = *budget == 0 || final_chunk;
            self.send(
                sender,
                Recipients::One(peer.clone()),
                wire::Payload::ItemData(wire::ItemData {
                    block_number: number,
                    total_chunks,
                    chunk_number,
                    last_in_batch,
                    data: Bytes::copy_from_slice(&item[start..end]),
                }),
            )
            .await;
            self.metrics.sent_item_data.inc();
            if *budget == 0 {
                return false;
            }
        }
        true
    }

    /// Serves the reserved pages a requester is missing, as one virtual block.
    async fn handle_fetch_res_pages(
        &mut self,
        peer: P,
        request_seq: u64,
        m: wire::FetchResPages,
        sender: &mut NetS,
    ) {
        if self.fetching_state() != FetchingState::NotFetching {
            self.reject(peer, request_seq, wire::RejectReason::InProgress, sender)
                .await;
            return;
        }
        if self
            .datastore
            .get_checkpoint(m.required_checkpoint)
            .unwrap_or_else(|err| panic!("failed to read checkpoint: {err}"))
            .is_none()
        {
            self.reject(peer, request_seq, wire::RejectReason::MissingCheckpoint, sender)
                .await;
            return;
        }
        self.metrics.received_fetch_res_pages.inc();
        let key = VBlockKey {
            checkpoint: m.required_checkpoint,
            requester_checkpoint: m.last_known_checkpoint,
        };
        let vblock = match self.vblocks.get(&key) {
            Some(vblock) => vblock,
            None => {
                let vblock = self.build_vblock(m.required_checkpoint, m.last_known_checkpoint);
                self.vblocks.put(key, vblock.clone());
                vblock
            }
        };
        let mut budget = self.max_chunks_per_batch;
        self.stream_chunks(
            &peer,
            VBLOCK_NUMBER,
            &vblock,
            m.last_known_chunk,
            true,
            &mut budget,
            sender,
        )
        .await;
    }

    /// Packs every page whose snapshot is newer than the requester's checkpoint.
    fn build_vblock(&self, checkpoint: u64, requester_checkpoint: u64) -> Bytes {
        let setup = self.setup();
        let mut pages = Vec::new();
        for page in 0..setup.reserved_pages {
            let Some(snapshot) = self.datastore.newest_snapshot_at_or_below(page, checkpoint)
            else {
                continue;
            };
            if snapshot <= requester_checkpoint {
                continue;
            }
            let record = self
                .datastore
                .get_page_snapshot(page, snapshot)
                .unwrap_or_else(|err| panic!("failed to read page snapshot: {err}"))
                .expect("directory lists snapshot");
            pages.push(VBlockPage {
                page,
                checkpoint: snapshot,
                data: record.data,
            });
        }
        let vblock = VBlock {
            checkpoint,
            requester_checkpoint,
            pages,
        };
        let bytes: BytesMut = vblock.encode();
        bytes.freeze()
    }

    async fn reject(
        &mut self,
        peer: P,
        request_seq: u64,
        reason: wire::RejectReason,
        sender: &mut NetS,
    ) {
        debug!(?peer, ?reason, "rejecting fetch");
        self.send(
            sender,
            Recipients::One(peer),
            wire::Payload::RejectFetching(wire::RejectFetching {
                reason,
                request_seq,
            }),
        )
        .await;
        self.metrics.sent_reject_fetching.inc();
    }

    async fn handle_reject(&mut self, peer: P, m: wire::RejectFetching, sender: &mut NetS) {
        let state = self.fetching_state();
        if state != FetchingState::GettingMissingBlocks
            && state != FetchingState::GettingMissingResPages
        {
            self.metrics.irrelevant_msg.inc();
            return;
        }
        if !self.selector.is_current(&peer) {
            self.metrics.irrelevant_msg.inc();
            return;
        }
        self.metrics.received_reject_fetching.inc();
        debug!(?peer, reason = ?m.reason, "source rejected fetch, rotating");
        self.rotate_source(sender).await;
    }

    async fn handle_item_data(&mut self, peer: P, m: wire::ItemData, sender: &mut NetS) {
        let state = self.fetching_state();
        let relevant = match state {
            FetchingState::GettingMissingBlocks => {
                let (first, _) = self.datastore.required_blocks().expect("in block phase");
                m.block_number >= first && m.block_number <= self.next_required_block
            }
            FetchingState::GettingMissingResPages => m.block_number == VBLOCK_NUMBER,
            _ => false,
        };
        if !relevant || !self.selector.is_current(&peer) {
            self.metrics.irrelevant_msg.inc();
            return;
        }
        // An item can never require more chunks than the largest block needs.
        let max_chunks = self.max_block_size.div_ceil(self.max_chunk_size).max(1) as u16;
        if state == FetchingState::GettingMissingBlocks && m.total_chunks > max_chunks {
            self.metrics.malformed_msg.inc();
            return;
        }
        // Backpressure: stop buffering ahead of reassembly.
        if self.pending_bytes + m.data.len() > self.max_pending_bytes {
            debug!(?peer, "pending data limit reached, dropping chunk");
            self.metrics.irrelevant_msg.inc();
            return;
        }
        let key = (Reverse(m.block_number), m.chunk_number);
        if self.pending_chunks.contains_key(&key) {
            self.metrics.irrelevant_msg.inc();
            return;
        }
        self.pending_bytes += m.data.len();
        let last_in_batch = m.last_in_batch;
        self.pending_chunks.insert(
            key,
            PendingChunk {
                total: m.total_chunks,
                data: m.data,
            },
        );
        self.metrics.received_item_data.inc();
        self.process_data(sender).await;

        // The source stopped streaming: ask for the next batch (of whichever
        // phase we are now in) if the transfer is still incomplete.
        if last_in_batch && self.datastore.is_fetching() && self.datastore.target().is_some() {
            self.request_from_source(sender).await;
        }
    }

    // -------------------- Reassembly --------------------

    /// Attempts to reassemble `number` from buffered chunks.
    fn assemble(&self, number: u64) -> Assembled {
        let mut chunks = self
            .pending_chunks
            .range((Reverse(number), 1)..=(Reverse(number), u16::MAX))
            .peekable();
        let Some((_, first)) = chunks.peek() else {
            return Assembled::Incomplete;
        };
        let total = first.total;
        let mut expected: u16 = 1;
        let mut size = 0;
        for ((_, chunk_number), chunk) in chunks {
            if chunk.total != total {
                return Assembled::Bad;
            }
            if *chunk_number != expected {
                return Assembled::Incomplete;
            }
            size += chunk.data.len();
            if size > self.max_block_size.max(self.max_pending_bytes) {
                return Assembled::Bad;
            }
            if *chunk_number == total {
                let mut data = BytesMut::with_capacity(size);
                for ((_, _), chunk) in self
                    .pending_chunks
                    .range((Reverse(number), 1)..=(Reverse(number), total))
                {
                    data.extend_from_slice(&chunk.data);
                }
                return Assembled::Complete(data.freeze());
            }
            expected += 1;
        }
        Assembled::Incomplete
    }

    /// Drops the buffered chunks of one item.
    fn drop_item(&mut self, number: u64) {
        let keys: Vec<_> = self
            .pending_chunks
            .range((Reverse(number), 1)..=(Reverse(number), u16::MAX))
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            if let Some(chunk) = self.pending_chunks.remove(&key) {
                self.pending_bytes -= chunk.data.len();
            }
        }
    }

    /// Consumes buffered chunks, accepting as many verified items as possible.
    async fn process_data(&mut self, sender: &mut NetS) {
        loop {
            match self.fetching_state() {
                FetchingState::GettingMissingBlocks => {
                    if !self.try_accept_block(sender).await {
                        return;
                    }
                }
                FetchingState::GettingMissingResPages => {
                    self.try_accept_vblock(sender).await;
                    return;
                }
                _ => return,
            }
        }
    }

    /// Attempts to accept the next required block. Returns whether progress was
    /// made (and another attempt is worthwhile).
    async fn try_accept_block(&mut self, sender: &mut NetS) -> bool {
        let number = self.next_required_block;
        let data = match self.assemble(number) {
            Assembled::Incomplete => return false,
            Assembled::Bad => {
                self.metrics.invalid_item_data.inc();
                self.punish_source(sender).await;
                return false;
            }
            Assembled::Complete(data) => data,
        };

        // The certificate (or the previously accepted child) pins this digest.
        let expected = self
            .digest_of_next_required_block
            .expect("expected digest tracked in block phase");
        let digest = digest_of_block::<H>(number, &data);
        if digest != expected {
            warn!(number, "block digest mismatch");
            self.metrics.invalid_item_data.inc();
            self.punish_source(sender).await;
            return false;
        }

        self.drop_item(number);
        if !self.app.put_block(number, data).await {
            panic!("failed to persist block {number}");
        }
        self.fetch_rotations = 0;
        if let Some(peer) = self.selector.current().cloned() {
            self.selector.on_valid_data(&peer, self.context.current());
        }

        let (first, _) = self.datastore.required_blocks().expect("in block phase");
        if number == first {
            self.finish_blocks().await;
            self.request_from_source(sender).await;
            return false;
        }
        self.digest_of_next_required_block = Some(
            self.app
                .parent_digest(number)
                .await
                .expect("accepted block missing parent digest"),
        );
        self.next_required_block = number - 1;
        true
    }

    /// All required blocks are stored and verified: move on to reserved pages.
    async fn finish_blocks(&mut self) {
        info!("all missing blocks collected");
        self.datastore.set_required_blocks(None);
        self.datastore
            .commit()
            .await
            .unwrap_or_else(|err| panic!("failed to persist block progress: {err}"));
        self.digest_of_next_required_block = None;
        self.next_required_block = 0;
        self.clear_pending();
    }

    /// Attempts to accept the virtual block of reserved pages and complete the
    /// transfer.
    async fn try_accept_vblock(&mut self, sender: &mut NetS) {
        let data = match self.assemble(VBLOCK_NUMBER) {
            Assembled::Incomplete => return,
            Assembled::Bad => {
                self.metrics.invalid_item_data.inc();
                self.punish_source(sender).await;
                return;
            }
            Assembled::Complete(data) => data,
        };
        let setup = self.setup().clone();
        let target = self.datastore.target().expect("in pages phase").clone();
        let vblock =
            match VBlock::decode_cfg(data, &(setup.page_size, setup.reserved_pages)) {
                Ok(vblock) => vblock,
                Err(err) => {
                    warn!(?err, "malformed virtual block");
                    self.metrics.invalid_item_data.inc();
                    self.punish_source(sender).await;
                    return;
                }
            };
        if vblock.checkpoint != target.checkpoint
            || vblock.pages.iter().any(|p| {
                p.page >= setup.reserved_pages
                    || p.checkpoint == 0
                    || p.checkpoint > target.checkpoint
            })
        {
            warn!("virtual block does not match target");
            self.metrics.invalid_item_data.inc();
            self.punish_source(sender).await;
            return;
        }

        // Verify: the descriptor rebuilt from (vblock pages + local snapshots)
        // must hash to the digest pinned by the certificate.
        let mut entries = Vec::with_capacity(setup.reserved_pages as usize);
        let zeroed = vec![0u8; setup.page_size as usize];
        let mut updated = vblock.pages.iter().peekable();
        for page in 0..setup.reserved_pages {
            if let Some(update) = updated.next_if(|u| u.page == page) {
                entries.push(PageInfo {
                    page,
                    checkpoint: update.checkpoint,
                    digest: digest_of_page::<H>(page, update.checkpoint, &update.data),
                });
                continue;
            }
            match self.datastore.newest_snapshot_at_or_below(page, target.checkpoint) {
                Some(snapshot) => {
                    let record = self
                        .datastore
                        .get_page_snapshot(page, snapshot)
                        .unwrap_or_else(|err| panic!("failed to read page snapshot: {err}"))
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
        let descriptor = PagesDescriptor { entries };
        if descriptor.digest::<H>() != target.digest_of_pages_descriptor {
            warn!("reserved pages descriptor digest mismatch");
            self.metrics.invalid_item_data.inc();
            self.punish_source(sender).await;
            return;
        }

        // Apply pages, store the checkpoint, and finish — one transaction.
        for update in &vblock.pages {
            let digest = digest_of_page::<H>(update.page, update.checkpoint, &update.data);
            self.datastore.put_page_snapshot(
                update.page,
                update.checkpoint,
                PageRecord {
                    digest,
                    data: update.data.clone(),
                },
            );
        }
        self.datastore.clear_pending_pages();
        self.datastore.put_checkpoint(target.clone());
        let max_stored = setup.max_stored_checkpoints;
        if target.checkpoint >= max_stored {
            self.datastore.prune_checkpoints(target.checkpoint - max_stored + 1);
        }
        self.datastore.set_fetching(false);
        self.datastore.set_target(None);
        self.datastore.set_required_blocks(None);
        self.datastore
            .commit()
            .await
            .unwrap_or_else(|err| panic!("failed to persist transfer completion: {err}"));
        self.clear_pending();
        self.selector.reset();
        self.metrics.transfer_complete.inc();
        info!(checkpoint = target.checkpoint, "state transfer complete");
        self.reporter.transfer_complete(target.checkpoint).await;
    }

    // -------------------- Timer --------------------

    async fn on_tick(&mut self, sender: &mut NetS) {
        let now = self.context.current();
        match self.fetching_state() {
            FetchingState::NotFetching => {}
            FetchingState::GettingCheckpointSummaries => {
                let due = self
                    .last_ask_time
                    .and_then(|at| now.duration_since(at).ok())
                    .is_none_or(|elapsed| elapsed >= self.ask_backoff);
                if !due {
                    return;
                }
                self.ask_retransmissions += 1;
                if self.ask_retransmissions >= SUMMARY_RESET_COUNT {
                    debug!(
                        rounds = self.ask_retransmissions,
                        "no certificate assembled, purging partial certificates"
                    );
                    self.ask_retransmissions = 0;
                    self.collector.clear();
                }
                self.send_ask(sender).await;
            }
            FetchingState::GettingMissingBlocks | FetchingState::GettingMissingResPages => {
                if self.selector.should_replace(now) {
                    debug!("source made no progress, rotating");
                    self.rotate_source(sender).await;
                } else {
                    let due = self
                        .last_request_time
                        .and_then(|at| now.duration_since(at).ok())
                        .is_none_or(|elapsed| elapsed >= self.fetch_retry_timeout);
                    if due {
                        self.selector.on_retransmission();
                        self.request_from_source(sender).await;
                    }
                }
                self.log_progress(now);
            }
        }
    }

    /// Periodic operator-facing progress line while fetching.
    fn log_progress(&mut self, now: SystemTime) {
        let due = self
            .last_status_log
            .and_then(|at| now.duration_since(at).ok())
            .is_none_or(|elapsed| elapsed >= self.metrics_dump_interval);
        if !due {
            return;
        }
        self.last_status_log = Some(now);
        info!(
            state = %self.fetching_state(),
            target = self.datastore.target().map(|t| t.checkpoint).unwrap_or(0),
            next_required_block = self.next_required_block,
            pending_chunks = self.pending_chunks.len(),
            pending_bytes = self.pending_bytes,
            preferred_sources = self.selector.len_preferred(),
            "collecting state"
        );
    }
}
