//! Quorum certificates over checkpoint summaries.

use crate::{types::CheckpointDesc, wire::CheckpointSummary};
use commonware_cryptography::Digest;
use std::collections::{BTreeMap, BTreeSet};

/// Outcome of feeding one summary to the collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Added {
    /// The contribution was recorded.
    Accepted {
        /// Whether the checkpoint now has more than one distinct payload — proof
        /// that at least one contributor is lying.
        divergent: bool,
    },
    /// The sender already contributed this exact payload.
    Duplicate,
    /// The sender already contributed a different payload for this checkpoint
    /// (first-wins: the new one is dropped).
    Conflict,
    /// The sender exhausted its per-round contribution budget.
    OverBudget,
}

struct Candidate<D: Digest> {
    desc: CheckpointDesc<D>,
    senders: BTreeSet<u16>,
}

/// Accumulates [CheckpointSummary] contributions until some checkpoint gathers
/// `threshold` (f+1) identical `(last_block, digest_of_last_block,
/// digest_of_pages_descriptor)` tuples from distinct senders.
///
/// With at most f Byzantine replicas, f+1 identical summaries include at least
/// one from a correct replica, so the certified tuple is trustworthy.
pub struct SummaryCollector<D: Digest> {
    threshold: usize,
    sender_budget: usize,
    candidates: BTreeMap<u64, Vec<Candidate<D>>>,
    accepted: BTreeMap<u16, usize>,
}

impl<D: Digest> SummaryCollector<D> {
    pub fn new(threshold: usize, sender_budget: usize) -> Self {
        assert!(threshold > 0);
        Self {
            threshold,
            sender_budget,
            candidates: BTreeMap::new(),
            accepted: BTreeMap::new(),
        }
    }

    /// Records a summary from `sender`.
    pub fn add(&mut self, sender: u16, summary: &CheckpointSummary<D>) -> Added {
        let desc = CheckpointDesc {
            checkpoint: summary.checkpoint,
            last_block: summary.last_block,
            digest_of_last_block: summary.digest_of_last_block,
            digest_of_pages_descriptor: summary.digest_of_pages_descriptor,
        };
        let candidates = self.candidates.entry(summary.checkpoint).or_default();
        for candidate in candidates.iter_mut() {
            if candidate.senders.contains(&sender) {
                return if candidate.desc == desc {
                    Added::Duplicate
                } else {
                    Added::Conflict
                };
            }
        }
        let accepted = self.accepted.entry(sender).or_default();
        if *accepted >= self.sender_budget {
            return Added::OverBudget;
        }
        *accepted += 1;
        match candidates.iter_mut().find(|c| c.desc == desc) {
            Some(candidate) => {
                candidate.senders.insert(sender);
            }
            None => candidates.push(Candidate {
                desc,
                senders: BTreeSet::from([sender]),
            }),
        }
        Added::Accepted {
            divergent: candidates.len() > 1,
        }
    }

    /// Returns the highest checkpoint with a complete certificate, if any.
    pub fn complete(&self) -> Option<&CheckpointDesc<D>> {
        self.candidates.iter().rev().find_map(|(_, candidates)| {
            candidates
                .iter()
                .find(|c| c.senders.len() >= self.threshold)
                .map(|c| &c.desc)
        })
    }

    /// Discards all partial certificates and per-sender budgets.
    pub fn clear(&mut self) {
        self.candidates.clear();
        self.accepted.clear();
    }

    /// Number of checkpoints with at least one contribution.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }
}
