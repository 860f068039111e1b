//! Engine for collecting state from peers and serving it to them.
//!
//! One [Engine] per replica handles both sides of the protocol: when the local
//! replica lags, it collects a certificate of matching checkpoint summaries and
//! streams the missing blocks and reserved pages from a selected source; when a
//! peer lags, it serves summaries, blocks, and virtual blocks of reserved pages
//! to that peer.

mod actor;
pub use actor::Engine;
mod ingress;
pub use ingress::{Mailbox, Message, Status};

mod cache;
mod collector;
mod metrics;
mod selector;

use commonware_cryptography::PublicKey;
use std::time::Duration;

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct Config<P: PublicKey> {
    /// The public key of this replica.
    pub public_key: P,

    /// All replicas (including this one). Must contain at least 3f+1 = 4
    /// entries; quorums are sized from this set.
    pub participants: Vec<P>,

    /// The prefix to use for all storage partitions.
    pub partition_prefix: String,

    /// Number of control commands to buffer before senders block.
    pub mailbox_size: usize,

    /// Checkpoints retained before old ones are pruned.
    pub max_stored_checkpoints: u64,

    /// Size of the reserved-page address space.
    pub reserved_pages: u32,

    /// Size of one reserved page in bytes (a positive multiple of 8, at most
    /// `max_chunk_size`).
    pub page_size: u32,

    /// Upper bound for an application block.
    pub max_block_size: usize,

    /// Upper bound for one `ItemData` payload.
    pub max_chunk_size: usize,

    /// Chunks a source streams per fetch request.
    pub max_chunks_per_batch: u16,

    /// Backpressure: chunk bytes buffered ahead of reassembly before new chunks
    /// are dropped.
    pub max_pending_bytes: usize,

    /// Periodic timer tick driving retransmissions and rotation.
    pub refresh_interval: Duration,

    /// How long to wait for summaries before re-broadcasting the ask.
    pub summaries_retry_timeout: Duration,

    /// How long to wait for chunks before re-sending the fetch request.
    pub fetch_retry_timeout: Duration,

    /// How long a source may go without progress before it is replaced.
    pub source_replacement_timeout: Duration,

    /// Messages older (or newer) than this are dropped as stale.
    pub max_msg_delay: Duration,

    /// How long before a sender whose sequence numbers regressed (e.g. after a
    /// restart or clock jump) is accepted again.
    pub seqnum_resync_window: Duration,

    /// Cadence of the operator-facing progress log while fetching.
    pub metrics_dump_interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::{Config, Engine, Mailbox, Status};
    use crate::{
        datastore::{DataStore, Setup},
        mocks,
        types::{digest_of_page, CheckpointDesc, FetchingState, PageInfo, PagesDescriptor},
        AppState as _,
    };
    use bytes::Bytes;
    use commonware_cryptography::{
        ed25519::{PrivateKey, PublicKey},
        sha256, PrivateKeyExt, Sha256, Signer,
    };
    use commonware_macros::test_traced;
    use commonware_p2p::simulated::{Link, Network, Oracle, Receiver, Sender};
    use commonware_runtime::{deterministic, Clock, Metrics, Quota, Runner};
    use futures::StreamExt;
    use std::num::NonZeroU32;
    use std::time::Duration;

    type TestEngine = Engine<
        deterministic::Context,
        PublicKey,
        Sha256,
        mocks::AppState,
        mocks::Reporter,
        Sender<PublicKey, deterministic::Context>,
        Receiver<PublicKey>,
    >;
    type TestMailbox = Mailbox<sha256::Digest>;

    const NUM_PAGES: u32 = 4;
    const PAGE_SIZE: u32 = 32;
    const TEST_QUOTA: Quota = Quota::per_second(NonZeroU32::MAX);
    const LINK: Link = Link {
        latency: Duration::from_millis(10),
        jitter: Duration::from_millis(1),
        success_rate: 1.0,
    };

    fn test_config(
        public_key: PublicKey,
        participants: Vec<PublicKey>,
        partition: &str,
    ) -> Config<PublicKey> {
        Config {
            public_key,
            participants,
            partition_prefix: partition.to_string(),
            mailbox_size: 1024,
            max_stored_checkpoints: 10,
            reserved_pages: NUM_PAGES,
            page_size: PAGE_SIZE,
            max_block_size: 1024,
            max_chunk_size: 32,
            max_chunks_per_batch: 10,
            max_pending_bytes: 1 << 20,
            refresh_interval: Duration::from_millis(50),
            summaries_retry_timeout: Duration::from_millis(500),
            fetch_retry_timeout: Duration::from_millis(500),
            source_replacement_timeout: Duration::from_secs(3),
            max_msg_delay: Duration::from_secs(60),
            seqnum_resync_window: Duration::from_secs(1),
            metrics_dump_interval: Duration::from_secs(5),
        }
    }

    async fn setup_network(
        context: &deterministic::Context,
        seeds: &[u64],
    ) -> (
        Oracle<PublicKey>,
        Vec<PrivateKey>,
        Vec<PublicKey>,
        Vec<(Sender<PublicKey>, Receiver<PublicKey>)>,
    ) {
        let (network, mut oracle) = Network::new(
            context.with_label("network"),
            commonware_p2p::simulated::Config {
                max_size: 1024 * 1024,
            },
        );
        network.start();

        let schemes: Vec<PrivateKey> = seeds.iter().map(|s| PrivateKey::from_seed(*s)).collect();
        let peers: Vec<PublicKey> = schemes.iter().map(|s| s.public_key()).collect();
        let mut connections = Vec::new();
        for peer in &peers {
            let connection = oracle.register(peer.clone(), 0).await.unwrap();
            connections.push(connection);
        }
        (oracle, schemes, peers, connections)
    }

    async fn add_link(oracle: &mut Oracle<PublicKey>, peers: &[PublicKey], from: usize, to: usize) {
        oracle
            .add_link(peers[from].clone(), peers[to].clone(), LINK.clone())
            .await
            .unwrap();
        oracle
            .add_link(peers[to].clone(), peers[from].clone(), LINK.clone())
            .await
            .unwrap();
    }

    async fn spawn_engine(
        context: &deterministic::Context,
        label: &str,
        partition: &str,
        public_key: PublicKey,
        participants: Vec<PublicKey>,
        connection: (Sender<PublicKey>, Receiver<PublicKey>),
        app: mocks::AppState,
        reporter: mocks::Reporter,
    ) -> TestMailbox {
        let (engine, mailbox) = TestEngine::init(
            context.with_label(label),
            test_config(public_key, participants, partition),
            app,
            reporter,
        )
        .await;
        engine.start(connection);
        mailbox
    }

    /// Saves deterministic page contents and creates checkpoints `1..=count`.
    async fn seed_source(mailbox: &mut TestMailbox, count: u64) {
        for checkpoint in 1..=count {
            for page in 0..NUM_PAGES {
                let byte = (checkpoint as u8).wrapping_mul(31) ^ (page as u8);
                mailbox
                    .save_reserved_page(page, Bytes::from(vec![byte; PAGE_SIZE as usize]))
                    .await
                    .unwrap();
            }
            mailbox.create_checkpoint(checkpoint).await.unwrap();
        }
    }

    async fn wait_for(
        context: &deterministic::Context,
        mailbox: &mut TestMailbox,
        condition: impl Fn(&Status) -> bool,
    ) -> Status {
        loop {
            let status = mailbox.status().await.unwrap();
            if condition(&status) {
                return status;
            }
            context.sleep(Duration::from_millis(50)).await;
        }
    }

    /// Whether some metric line (ignoring comments) reaches `min`.
    fn counter_at_least(buffer: &str, metric: &str, min: u64) -> bool {
        buffer.lines().any(|line| {
            !line.starts_with('#')
                && line.contains(metric)
                && line
                    .split_whitespace()
                    .last()
                    .and_then(|value| value.parse::<u64>().ok())
                    .is_some_and(|value| value >= min)
        })
    }

    #[test]
    #[should_panic(expected = "reserved page space is empty")]
    fn test_init_rejects_zero_pages() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (_oracle, _schemes, peers, _connections) =
                setup_network(&context, &[0, 1, 2, 3]).await;
            let mut cfg = test_config(peers[0].clone(), peers.clone(), "replica");
            cfg.reserved_pages = 0;
            TestEngine::init(context, cfg, mocks::AppState::new(), mocks::Reporter::dummy()).await;
        });
    }

    #[test]
    #[should_panic(expected = "positive multiple")]
    fn test_init_rejects_misaligned_page_size() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (_oracle, _schemes, peers, _connections) =
                setup_network(&context, &[0, 1, 2, 3]).await;
            let mut cfg = test_config(peers[0].clone(), peers.clone(), "replica");
            cfg.page_size = 30;
            TestEngine::init(context, cfg, mocks::AppState::new(), mocks::Reporter::dummy()).await;
        });
    }

    #[test_traced]
    fn test_cold_fetch_no_faults() {
        let executor = deterministic::Runner::timed(Duration::from_secs(60));
        executor.start(|context| async move {
            let (mut oracle, _schemes, peers, connections) =
                setup_network(&context, &[0, 1, 2, 3]).await;
            let mut connections = connections.into_iter();
            for source in 1..=3 {
                add_link(&mut oracle, &peers, 0, source).await;
            }

            // Requester starts empty.
            let requester_app = mocks::AppState::new();
            let (reporter, mut completions) = mocks::Reporter::new();
            let requester_connection = connections.next().unwrap();
            let mut requester = spawn_engine(
                &context,
                "requester",
                "requester",
                peers[0].clone(),
                peers.clone(),
                requester_connection,
                requester_app.clone(),
                reporter,
            )
            .await;

            // Sources hold blocks 1..=100 and checkpoints 1..=5.
            let mut sources = Vec::new();
            for (index, connection) in (1..=3).zip(connections) {
                let app = mocks::AppState::with_chain(100);
                let label = format!("source_{index}");
                let mut mailbox = spawn_engine(
                    &context,
                    &label,
                    &label,
                    peers[index].clone(),
                    peers.clone(),
                    connection,
                    app,
                    mocks::Reporter::dummy(),
                )
                .await;
                seed_source(&mut mailbox, 5).await;
                sources.push(mailbox);
            }

            // Collect.
            requester.start_collecting().await.unwrap();
            assert_eq!(completions.next().await, Some(5));

            // The callback fires exactly once.
            context.sleep(Duration::from_secs(1)).await;
            assert!(completions.try_next().is_err());

            // The requester holds the full chain and the certified checkpoint.
            assert_eq!(requester_app.last_reachable(), 100);
            let reference = mocks::AppState::with_chain(100);
            assert_eq!(
                requester_app.block_digest(100),
                reference.block_digest(100)
            );
            let status = requester.status().await.unwrap();
            assert_eq!(status.state, FetchingState::NotFetching);
            assert_eq!(status.last_stored_checkpoint, Some(5));
            assert!(requester
                .checkpoint_digest(5)
                .await
                .unwrap()
                .is_some());

            // Reserved pages match the sources'.
            for page in 0..NUM_PAGES {
                let ours = requester.load_reserved_page(page).await.unwrap();
                let theirs = sources[0].load_reserved_page(page).await.unwrap();
                assert_eq!(ours, theirs);
            }

            // A new transfer may start now, but not twice.
            assert!(requester.start_collecting().await.is_ok());
            assert_eq!(
                requester.start_collecting().await,
                Err(crate::Error::AlreadyFetching)
            );
        });
    }

    #[test_traced]
    fn test_byzantine_source_is_blacklisted() {
        let executor = deterministic::Runner::timed(Duration::from_secs(60));
        executor.start(|context| async move {
            let (mut oracle, _schemes, peers, connections) =
                setup_network(&context, &[0, 1, 2, 3]).await;
            let mut connections = connections.into_iter();
            for source in 1..=3 {
                add_link(&mut oracle, &peers, 0, source).await;
            }

            let requester_app = mocks::AppState::new();
            let (reporter, mut completions) = mocks::Reporter::new();
            let requester_connection = connections.next().unwrap();
            let mut requester = spawn_engine(
                &context,
                "requester",
                "requester",
                peers[0].clone(),
                peers.clone(),
                requester_connection,
                requester_app.clone(),
                reporter,
            )
            .await;

            let mut corrupt_apps = Vec::new();
            for (index, connection) in (1..=3).zip(connections) {
                let app = mocks::AppState::with_chain(100);
                let label = format!("source_{index}");
                let mut mailbox = spawn_engine(
                    &context,
                    &label,
                    &label,
                    peers[index].clone(),
                    peers.clone(),
                    connection,
                    app.clone(),
                    mocks::Reporter::dummy(),
                )
                .await;
                seed_source(&mut mailbox, 5).await;
                if index <= 2 {
                    corrupt_apps.push(app);
                }
            }

            // Two of the three sources now serve a block whose bytes no longer
            // match the certified digest. (Corrupted after startup so their own
            // consistency audits passed.)
            for app in corrupt_apps.iter_mut() {
                app.corrupt_block(100);
            }

            requester.start_collecting().await.unwrap();
            assert_eq!(completions.next().await, Some(5));

            // The requester ends with the correct chain, not the corrupted one.
            assert_eq!(requester_app.last_reachable(), 100);
            let reference = mocks::AppState::with_chain(100);
            assert_eq!(
                requester_app.block_digest(100),
                reference.block_digest(100)
            );
        });
    }

    #[test_traced]
    fn test_crash_resume_skips_summary_collection() {
        let executor = deterministic::Runner::timed(Duration::from_secs(60));
        executor.start(|context| async move {
            let (mut oracle, _schemes, peers, connections) =
                setup_network(&context, &[0, 1, 2, 3]).await;
            let mut connections = connections.into_iter();
            for source in 1..=3 {
                add_link(&mut oracle, &peers, 0, source).await;
            }
            let requester_connection = connections.next().unwrap();

            // Sources hold blocks 1..=100 and checkpoints 1..=5, but no reserved
            // pages were ever written (so the descriptor is all-zero pages and
            // the test can pin the target digest independently).
            for (index, connection) in (1..=3).zip(connections) {
                let app = mocks::AppState::with_chain(100);
                let label = format!("source_{index}");
                let mut mailbox = spawn_engine(
                    &context,
                    &label,
                    &label,
                    peers[index].clone(),
                    peers.clone(),
                    connection,
                    app,
                    mocks::Reporter::dummy(),
                )
                .await;
                for checkpoint in 1..=5 {
                    mailbox.create_checkpoint(checkpoint).await.unwrap();
                }
            }

            // Fabricate a requester that crashed mid-transfer: certificate for
            // checkpoint 5 persisted, blocks 100..=60 already fetched.
            let chain = mocks::AppState::with_chain(100);
            let mut requester_app = mocks::AppState::new();
            for number in 60..=100 {
                let block = chain.get_block(number).await.unwrap();
                assert!(requester_app.put_block(number, block).await);
            }
            let zeroed = vec![0u8; PAGE_SIZE as usize];
            let descriptor = PagesDescriptor {
                entries: (0..NUM_PAGES)
                    .map(|page| PageInfo {
                        page,
                        checkpoint: 0,
                        digest: digest_of_page::<Sha256>(page, 0, &zeroed),
                    })
                    .collect(),
            };
            let target = CheckpointDesc {
                checkpoint: 5,
                last_block: 100,
                digest_of_last_block: chain.block_digest(100),
                digest_of_pages_descriptor: descriptor.digest::<Sha256>(),
            };
            {
                let mut store: DataStore<deterministic::Context, sha256::Digest> =
                    DataStore::init(context.with_label("fabricate"), "requester-journal".into())
                        .await
                        .unwrap();
                store.set_setup(Setup {
                    max_stored_checkpoints: 10,
                    reserved_pages: NUM_PAGES,
                    page_size: PAGE_SIZE,
                });
                store.set_fetching(true);
                store.set_target(Some(target));
                store.set_required_blocks(Some((1, 100)));
                store.commit().await.unwrap();
            }

            // Restart: the engine must resume in the block phase (no summary
            // collection) and finish the transfer.
            let (reporter, mut completions) = mocks::Reporter::new();
            let _requester = spawn_engine(
                &context,
                "requester",
                "requester",
                peers[0].clone(),
                peers.clone(),
                requester_connection,
                requester_app.clone(),
                reporter,
            )
            .await;
            assert_eq!(completions.next().await, Some(5));
            assert_eq!(requester_app.last_reachable(), 100);

            // No ask was ever broadcast.
            let buffer = context.encode();
            assert!(!counter_at_least(&buffer, "sent_ask_summaries_total", 1));
        });
    }

    #[test_traced]
    fn test_divergent_summaries_never_certify() {
        let executor = deterministic::Runner::timed(Duration::from_secs(60));
        executor.start(|context| async move {
            let (mut oracle, _schemes, peers, connections) =
                setup_network(&context, &[0, 1, 2, 3]).await;
            let mut connections = connections.into_iter();
            add_link(&mut oracle, &peers, 0, 1).await;
            add_link(&mut oracle, &peers, 0, 2).await;

            let requester_app = mocks::AppState::new();
            let (reporter, _completions) = mocks::Reporter::new();
            let requester_connection = connections.next().unwrap();
            let mut requester = spawn_engine(
                &context,
                "requester",
                "requester",
                peers[0].clone(),
                peers.clone(),
                requester_connection,
                requester_app,
                reporter,
            )
            .await;

            // Two sources with divergent chains: same checkpoint numbers, same
            // last block, different digests. Neither payload can reach f+1 = 2.
            for (index, connection) in (1..=2).zip(connections) {
                let app = mocks::AppState::with_chain_salted(100, index as u8);
                let label = format!("source_{index}");
                let mut mailbox = spawn_engine(
                    &context,
                    &label,
                    &label,
                    peers[index].clone(),
                    peers.clone(),
                    connection,
                    app,
                    mocks::Reporter::dummy(),
                )
                .await;
                seed_source(&mut mailbox, 5).await;
            }

            requester.start_collecting().await.unwrap();

            // Let several broadcast rounds (including a purge) elapse.
            context.sleep(Duration::from_secs(4)).await;
            let status = requester.status().await.unwrap();
            assert_eq!(status.state, FetchingState::GettingCheckpointSummaries);
            assert_eq!(status.target_checkpoint, None);

            // The conflicting payloads were counted as provably invalid.
            let buffer = context.encode();
            assert!(counter_at_least(
                &buffer,
                "invalid_checkpoint_summary_total",
                2
            ));
        });
    }

    #[test_traced]
    fn test_stable_checkpoint_pruning() {
        let executor = deterministic::Runner::timed(Duration::from_secs(60));
        executor.start(|context| async move {
            let (_oracle, _schemes, peers, connections) =
                setup_network(&context, &[0, 1, 2, 3]).await;
            let mut connections = connections.into_iter();
            let connection = connections.next().unwrap();
            let mut mailbox = spawn_engine(
                &context,
                "replica",
                "replica",
                peers[0].clone(),
                peers.clone(),
                connection,
                mocks::AppState::with_chain(10),
                mocks::Reporter::dummy(),
            )
            .await;

            // Store checkpoints 3..=12 (the retention limit).
            for checkpoint in 3..=12 {
                mailbox
                    .save_reserved_page(0, Bytes::from(vec![checkpoint as u8; PAGE_SIZE as usize]))
                    .await
                    .unwrap();
                mailbox.create_checkpoint(checkpoint).await.unwrap();
            }
            for checkpoint in 3..=12 {
                assert!(mailbox.checkpoint_digest(checkpoint).await.unwrap().is_some());
            }

            // Marking 12 stable keeps the full window; creating 13 evicts 3.
            mailbox.mark_checkpoint_stable(12).await.unwrap();
            assert!(mailbox.checkpoint_digest(3).await.unwrap().is_some());
            mailbox.create_checkpoint(13).await.unwrap();

            assert!(mailbox.checkpoint_digest(3).await.unwrap().is_none());
            let mut stored = 0;
            for checkpoint in 1..=13u64 {
                if mailbox.checkpoint_digest(checkpoint).await.unwrap().is_some() {
                    stored += 1;
                }
            }
            assert_eq!(stored, 10);

            // Checkpoints must keep increasing.
            assert!(mailbox.create_checkpoint(13).await.is_err());
        });
    }

    #[test_traced]
    fn test_reject_cascade_rotates_without_regression() {
        let executor = deterministic::Runner::timed(Duration::from_secs(60));
        executor.start(|context| async move {
            let (mut oracle, _schemes, peers, connections) =
                setup_network(&context, &[0, 1, 2, 3]).await;
            let mut connections = connections.into_iter();
            for source in 1..=3 {
                add_link(&mut oracle, &peers, 0, source).await;
            }

            let requester_app = mocks::AppState::new();
            let (reporter, _completions) = mocks::Reporter::new();
            let requester_connection = connections.next().unwrap();
            let mut requester = spawn_engine(
                &context,
                "requester",
                "requester",
                peers[0].clone(),
                peers.clone(),
                requester_connection,
                requester_app,
                reporter,
            )
            .await;

            // A long chain so the block phase outlives the test's interference.
            let mut sources = Vec::new();
            for (index, connection) in (1..=3).zip(connections) {
                let app = mocks::AppState::with_chain(300);
                let label = format!("source_{index}");
                let mut mailbox = spawn_engine(
                    &context,
                    &label,
                    &label,
                    peers[index].clone(),
                    peers.clone(),
                    connection,
                    app,
                    mocks::Reporter::dummy(),
                )
                .await;
                seed_source(&mut mailbox, 5).await;
                sources.push(mailbox);
            }

            requester.start_collecting().await.unwrap();
            wait_for(&context, &mut requester, |status| {
                status.state == FetchingState::GettingMissingBlocks
            })
            .await;

            // Every source starts collecting itself: they now reject fetches.
            for source in sources.iter_mut() {
                source.start_collecting().await.unwrap();
            }

            // The requester rotates on rejection without losing progress.
            loop {
                let buffer = context.encode();
                if counter_at_least(&buffer, "received_reject_fetching_total", 1) {
                    break;
                }
                context.sleep(Duration::from_millis(100)).await;
            }
            let status = requester.status().await.unwrap();
            assert_eq!(status.state, FetchingState::GettingMissingBlocks);
            assert_eq!(status.target_checkpoint, Some(5));
        });
    }
}
