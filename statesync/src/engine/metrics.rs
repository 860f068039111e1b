//! Prometheus metrics for the state-transfer engine.

use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the state-transfer engine.
pub struct Metrics {
    /// Current phase (0 = not fetching, 1 = summaries, 2 = blocks, 3 = pages).
    pub fetching_state: Gauge,
    /// Last stored checkpoint number.
    pub last_stored_checkpoint: Gauge,
    /// Checkpoint being fetched (0 when idle or uncertified).
    pub target_checkpoint: Gauge,
    /// Next block required from the source.
    pub next_required_block: Gauge,
    /// Buffered chunks awaiting reassembly.
    pub pending_chunks: Gauge,
    /// Total bytes buffered awaiting reassembly.
    pub pending_bytes: Gauge,
    /// Sources still trusted to serve the transfer.
    pub preferred_sources: Gauge,

    /// Messages sent, by kind.
    pub sent_ask_summaries: Counter,
    pub sent_summary: Counter,
    pub sent_fetch_blocks: Counter,
    pub sent_fetch_res_pages: Counter,
    pub sent_reject_fetching: Counter,
    pub sent_item_data: Counter,

    /// Messages received and accepted, by kind.
    pub received_ask_summaries: Counter,
    pub received_summary: Counter,
    pub received_fetch_blocks: Counter,
    pub received_fetch_res_pages: Counter,
    pub received_reject_fetching: Counter,
    pub received_item_data: Counter,

    /// Messages dropped because they could not be parsed or violated a field
    /// invariant (not attributed to malice).
    pub malformed_msg: Counter,
    /// Messages dropped as stale, out-of-phase, or from an unknown sender.
    pub irrelevant_msg: Counter,
    /// Summaries that provably conflict with another contribution.
    pub invalid_checkpoint_summary: Counter,
    /// Chunks or blocks discarded after failing digest or shape verification.
    pub invalid_item_data: Counter,

    /// Control operations.
    pub create_checkpoint: Counter,
    pub mark_checkpoint_stable: Counter,
    pub start_collecting: Counter,
    pub load_reserved_page: Counter,
    pub save_reserved_page: Counter,
    pub zero_reserved_page: Counter,
    /// Completed transfers.
    pub transfer_complete: Counter,
}

impl Metrics {
    /// Creates and registers a new set of metrics on the given context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self {
            fetching_state: Gauge::default(),
            last_stored_checkpoint: Gauge::default(),
            target_checkpoint: Gauge::default(),
            next_required_block: Gauge::default(),
            pending_chunks: Gauge::default(),
            pending_bytes: Gauge::default(),
            preferred_sources: Gauge::default(),
            sent_ask_summaries: Counter::default(),
            sent_summary: Counter::default(),
            sent_fetch_blocks: Counter::default(),
            sent_fetch_res_pages: Counter::default(),
            sent_reject_fetching: Counter::default(),
            sent_item_data: Counter::default(),
            received_ask_summaries: Counter::default(),
            received_summary: Counter::default(),
            received_fetch_blocks: Counter::default(),
            received_fetch_res_pages: Counter::default(),
            received_reject_fetching: Counter::default(),
            received_item_data: Counter::default(),
            malformed_msg: Counter::default(),
            irrelevant_msg: Counter::default(),
            invalid_checkpoint_summary: Counter::default(),
            invalid_item_data: Counter::default(),
            create_checkpoint: Counter::default(),
            mark_checkpoint_stable: Counter::default(),
            start_collecting: Counter::default(),
            load_reserved_page: Counter::default(),
            save_reserved_page: Counter::default(),
            zero_reserved_page: Counter::default(),
            transfer_complete: Counter::default(),
        };
        context.register(
            "fetching_state",
            "Current phase of the transfer state machine",
            metrics.fetching_state.clone(),
        );
        context.register(
            "last_stored_checkpoint",
            "Last stored checkpoint number",
            metrics.last_stored_checkpoint.clone(),
        );
        context.register(
            "target_checkpoint",
            "Checkpoint being fetched",
            metrics.target_checkpoint.clone(),
        );
        context.register(
            "next_required_block",
            "Next block required from the source",
            metrics.next_required_block.clone(),
        );
        context.register(
            "pending_chunks",
            "Buffered chunks awaiting reassembly",
            metrics.pending_chunks.clone(),
        );
        context.register(
            "pending_bytes",
            "Total bytes buffered awaiting reassembly",
            metrics.pending_bytes.clone(),
        );
        context.register(
            "preferred_sources",
            "Sources still trusted to serve the transfer",
            metrics.preferred_sources.clone(),
        );
        context.register(
            "sent_ask_summaries",
            "AskForCheckpointSummaries messages sent",
            metrics.sent_ask_summaries.clone(),
        );
        context.register(
            "sent_summary",
            "CheckpointSummary messages sent",
            metrics.sent_summary.clone(),
        );
        context.register(
            "sent_fetch_blocks",
            "FetchBlocks messages sent",
            metrics.sent_fetch_blocks.clone(),
        );
        context.register(
            "sent_fetch_res_pages",
            "FetchResPages messages sent",
            metrics.sent_fetch_res_pages.clone(),
        );
        context.register(
            "sent_reject_fetching",
            "RejectFetching messages sent",
            metrics.sent_reject_fetching.clone(),
        );
        context.register(
            "sent_item_data",
            "ItemData chunks sent",
            metrics.sent_item_data.clone(),
        );
        context.register(
            "received_ask_summaries",
            "AskForCheckpointSummaries messages accepted",
            metrics.received_ask_summaries.clone(),
        );
        context.register(
            "received_summary",
            "CheckpointSummary messages accepted",
            metrics.received_summary.clone(),
        );
        context.register(
            "received_fetch_blocks",
            "FetchBlocks messages accepted",
            metrics.received_fetch_blocks.clone(),
        );
        context.register(
            "received_fetch_res_pages",
            "FetchResPages messages accepted",
            metrics.received_fetch_res_pages.clone(),
        );
        context.register(
            "received_reject_fetching",
            "RejectFetching messages accepted",
            metrics.received_reject_fetching.clone(),
        );
        context.register(
            "received_item_data",
            "ItemData chunks accepted",
            metrics.received_item_data.clone(),
        );
        context.register(
            "malformed_msg",
            "Messages dropped as unparseable or ill-formed",
            metrics.malformed_msg.clone(),
        );
        context.register(
            "irrelevant_msg",
            "Messages dropped as stale, out-of-phase, or from unknown senders",
            metrics.irrelevant_msg.clone(),
        );
        context.register(
            "invalid_checkpoint_summary",
            "Summaries conflicting with another contribution",
            metrics.invalid_checkpoint_summary.clone(),
        );
        context.register(
            "invalid_item_data",
            "Chunks or blocks that failed verification",
            metrics.invalid_item_data.clone(),
        );
        context.register(
            "create_checkpoint",
            "Checkpoints created",
            metrics.create_checkpoint.clone(),
        );
        context.register(
            "mark_checkpoint_stable",
            "Checkpoints marked stable",
            metrics.mark_checkpoint_stable.clone(),
        );
        context.register(
            "start_collecting",
            "Transfers started",
            metrics.start_collecting.clone(),
        );
        context.register(
            "load_reserved_page",
            "Reserved page loads",
            metrics.load_reserved_page.clone(),
        );
        context.register(
            "save_reserved_page",
            "Reserved page saves",
            metrics.save_reserved_page.clone(),
        );
        context.register(
            "zero_reserved_page",
            "Reserved page zeroings",
            metrics.zero_reserved_page.clone(),
        );
        context.register(
            "transfer_complete",
            "Completed transfers",
            metrics.transfer_complete.clone(),
        );
        metrics
    }
}
