//! In-memory application block store with hash-chained blocks.

use crate::types::digest_of_block;
use bytes::{BufMut, Bytes, BytesMut};
use commonware_cryptography::{sha256::Digest, Sha256};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

const DIGEST_LENGTH: usize = 32;

struct Inner {
    blocks: BTreeMap<u64, Bytes>,
}

/// An in-memory [crate::AppState].
///
/// Block layout: the parent's digest followed by an arbitrary payload, so the
/// engine's chain walk works against it unchanged. Cloning shares storage, which
/// lets tests keep a handle while the engine owns its copy.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Mutex<Inner>>,
}

impl AppState {
    /// Creates an empty block store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                blocks: BTreeMap::new(),
            })),
        }
    }

    /// Creates a store pre-filled with a valid chain of `count` blocks.
    pub fn with_chain(count: u64) -> Self {
        Self::with_chain_salted(count, 0)
    }

    /// Like [Self::with_chain], with a salt folded into every payload so two
    /// stores produce divergent chains.
    pub fn with_chain_salted(count: u64, salt: u8) -> Self {
        let state = Self::new();
        {
            let mut inner = state.inner.lock().unwrap();
            let mut parent = digest_of_block::<Sha256>(0, &[]);
            for number in 1..=count {
                let mut block = BytesMut::with_capacity(DIGEST_LENGTH + 16);
                block.put_slice(parent.as_ref());
                block.put_u64(number);
                block.put_u64(salt as u64);
                let block = block.freeze();
                parent = digest_of_block::<Sha256>(number, &block);
                inner.blocks.insert(number, block);
            }
        }
        state
    }

    /// Flips a payload byte of a stored block, breaking its digest without
    /// touching the digest embedded in its child.
    pub fn corrupt_block(&mut self, number: u64) {
        let mut inner = self.inner.lock().unwrap();
        let block = inner.blocks.get(&number).expect("block present");
        let mut raw = block.to_vec();
        let at = raw.len() - 1;
        raw[at] ^= 0xFF;
        inner.blocks.insert(number, Bytes::from(raw));
    }

    /// Synchronous accessor for tests.
    pub fn last_reachable(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        let mut reachable = 0;
        while inner.blocks.contains_key(&(reachable + 1)) {
            reachable += 1;
        }
        reachable
    }

    /// Digest of a stored block (the empty digest for block 0).
    pub fn block_digest(&self, number: u64) -> Digest {
        if number == 0 {
            return digest_of_block::<Sha256>(0, &[]);
        }
        let inner = self.inner.lock().unwrap();
        let block = inner.blocks.get(&number).expect("block present");
        digest_of_block::<Sha256>(number, block)
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::AppState for AppState {
    type Digest = Digest;

    async fn last_reachable_block(&self) -> u64 {
        self.last_reachable()
    }

    async fn last_block(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.blocks.keys().next_back().copied().unwrap_or(0)
    }

    async fn has_block(&self, number: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.blocks.contains_key(&number)
    }

    async fn get_block(&self, number: u64) -> Option<Bytes> {
        let inner = self.inner.lock().unwrap();
        inner.blocks.get(&number).cloned()
    }

    async fn parent_digest(&self, number: u64) -> Option<Digest> {
        let inner = self.inner.lock().unwrap();
        let block = inner.blocks.get(&number)?;
        <[u8; DIGEST_LENGTH]>::try_from(&block[..DIGEST_LENGTH])
            .ok()
            .map(Digest::from)
    }

    async fn put_block(&mut self, number: u64, block: Bytes) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.blocks.insert(number, block);
        true
    }
}
