//! Selection and rotation of the replica currently serving the transfer.

use commonware_cryptography::PublicKey;
use rand::{seq::SliceRandom, Rng};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Tracks which peers are still trusted to serve the transfer and which one is
/// the current source.
///
/// Sources that ship bad data are removed from the preferred set. If every peer
/// has been removed, the set is reseeded with all of them: either the fault
/// assumption was violated or the faults were transient, and retrying everyone
/// is the only option left.
pub struct SourceSelector<P: PublicKey> {
    /// Every other replica.
    all: Vec<P>,
    /// Replicas still trusted to serve.
    preferred: Vec<P>,
    /// The replica currently serving, if any.
    current: Option<P>,
    /// When the current source was selected (or last made progress).
    selected_at: Option<SystemTime>,
    /// Fetch retransmissions sent to the current source since it last made progress.
    retransmissions: u32,
    /// How long a source may go without progress before it is replaced.
    replacement_timeout: Duration,
}

impl<P: PublicKey> SourceSelector<P> {
    pub fn new(all: Vec<P>, replacement_timeout: Duration) -> Self {
        let preferred = all.clone();
        Self {
            all,
            preferred,
            current: None,
            selected_at: None,
            retransmissions: 0,
            replacement_timeout,
        }
    }

    /// Forgets all per-transfer state (bad sources, current selection).
    pub fn reset(&mut self) {
        self.preferred = self.all.clone();
        self.current = None;
        self.selected_at = None;
        self.retransmissions = 0;
    }

    pub fn current(&self) -> Option<&P> {
        self.current.as_ref()
    }

    pub fn is_current(&self, peer: &P) -> bool {
        self.current.as_ref() == Some(peer)
    }

    /// Whether the current source has exhausted its lease (or none is selected).
    pub fn should_replace(&self, now: SystemTime) -> bool {
        let Some(selected_at) = self.selected_at else {
            return true;
        };
        now.duration_since(selected_at)
            .is_ok_and(|elapsed| elapsed >= self.replacement_timeout)
    }

    /// Picks a new source pseudo-randomly from the preferred set, avoiding the
    /// current one when there is a choice.
    pub fn select<R: Rng>(&mut self, rng: &mut R, now: SystemTime) -> Option<P> {
        let mut candidates: Vec<&P> = self
            .preferred
            .iter()
            .filter(|peer| self.current.as_ref() != Some(peer))
            .collect();
        if candidates.is_empty() {
            candidates = self.preferred.iter().collect();
        }
        let next = candidates.choose(rng).copied()?.clone();
        debug!(source = ?next, "selected source");
        self.current = Some(next.clone());
        self.selected_at = Some(now);
        self.retransmissions = 0;
        Some(next)
    }

    /// Removes a peer from the preferred set, reseeding when it empties.
    pub fn mark_bad(&mut self, peer: &P) {
        self.preferred.retain(|p| p != peer);
        if self.current.as_ref() == Some(peer) {
            self.current = None;
            self.selected_at = None;
            self.retransmissions = 0;
        }
        if self.preferred.is_empty() {
            debug!("preferred sources exhausted, reseeding");
            self.preferred = self.all.clone();
        }
    }

    /// Credits the current source with progress, extending its lease.
    pub fn on_valid_data(&mut self, peer: &P, now: SystemTime) {
        if self.is_current(peer) {
            self.selected_at = Some(now);
            self.retransmissions = 0;
        }
    }

    /// Records a retransmission to the current source.
    pub fn on_retransmission(&mut self) -> u32 {
        self.retransmissions += 1;
        self.retransmissions
    }

    pub fn len_preferred(&self) -> usize {
        self.preferred.len()
    }
}
