//! Append-log sink backed by a shared in-memory store. Writers stage their
//! epoch's batch on task commit; the epoch becomes visible only when the
//! coordinator's terminal commit promotes every staged batch the tokens
//! identify, in one critical section. This is also the observable sink the
//! protocol tests run against.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::Result;
use crate::epoch::Epoch;
use crate::error::Error;
use crate::message::{CommitToken, Record, TokenSlots};
use crate::sink::{EpochCommitter, EpochWriter};

/// Token payload of the memory sink: which partition staged and how many
/// records it holds for the epoch.
#[derive(Debug, Serialize, Deserialize)]
struct MemoryToken {
    partition_idx: u16,
    records: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    /// staged batches per (epoch, partition), not yet visible
    staged: HashMap<(Epoch, u16), Vec<Bytes>>,
    /// committed output, keyed by epoch then partition
    visible: BTreeMap<Epoch, BTreeMap<u16, Vec<Bytes>>>,
}

/// Shared handle to the in-memory log. Writers and the coordinator built
/// from the same [SinkClientType](crate::sink::SinkClientType) observe one
/// store. NOTE: It is cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a writer's batch for (epoch, partition). A repeat staging for
    /// the same slot replaces the earlier attempt; only one token per slot
    /// ever reaches the terminal call.
    fn stage(&self, epoch: Epoch, partition_idx: u16, batch: Vec<Bytes>) {
        let mut inner = self.inner.lock();
        if inner
            .staged
            .insert((epoch, partition_idx), batch)
            .is_some()
        {
            warn!(epoch, partition_idx, "replacing a previously staged batch");
        }
    }

    /// Promotes the staged batches the tokens identify into the visible log.
    /// A no-op when the epoch is already visible. Validates every token
    /// before mutating anything so a failure leaves the staged state intact
    /// for a follow-up abort.
    fn promote(&self, epoch: Epoch, tokens: &TokenSlots) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.visible.contains_key(&epoch) {
            info!(epoch, "epoch already visible, ignoring repeated commit");
            return Ok(());
        }

        let mut partitions = Vec::with_capacity(tokens.filled_count());
        for token in tokens.iter().flatten() {
            let parsed: MemoryToken = serde_json::from_slice(token.payload())
                .map_err(|e| Error::Sink(format!("malformed memory sink token: {e}")))?;
            let batch = inner
                .staged
                .get(&(epoch, parsed.partition_idx))
                .ok_or_else(|| {
                    Error::Sink(format!(
                        "no staged batch for epoch {epoch} partition {}",
                        parsed.partition_idx
                    ))
                })?;
            if batch.len() as u64 != parsed.records {
                return Err(Error::Sink(format!(
                    "staged batch for epoch {epoch} partition {} holds {} records, token claims {}",
                    parsed.partition_idx,
                    batch.len(),
                    parsed.records
                )));
            }
            partitions.push(parsed.partition_idx);
        }

        let mut committed = BTreeMap::new();
        for partition_idx in partitions {
            let batch = inner
                .staged
                .remove(&(epoch, partition_idx))
                .unwrap_or_default();
            committed.insert(partition_idx, batch);
        }
        inner.visible.insert(epoch, committed);
        Ok(())
    }

    /// Discards every staged batch for the epoch, the tokens' holes
    /// included. Refuses to touch an epoch that is already visible.
    fn discard(&self, epoch: Epoch) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.visible.contains_key(&epoch) {
            return Err(Error::Sink(format!(
                "epoch {epoch} is already committed, refusing to discard its output"
            )));
        }
        inner.staged.retain(|(staged_epoch, _), _| *staged_epoch != epoch);
        Ok(())
    }

    pub fn is_visible(&self, epoch: Epoch) -> bool {
        self.inner.lock().visible.contains_key(&epoch)
    }

    pub fn visible_epochs(&self) -> Vec<Epoch> {
        self.inner.lock().visible.keys().copied().collect()
    }

    /// Committed records of an epoch, flattened in partition order. Empty
    /// when the epoch is not visible.
    pub fn visible_records(&self, epoch: Epoch) -> Vec<Bytes> {
        self.inner
            .lock()
            .visible
            .get(&epoch)
            .map(|partitions| partitions.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of staged batches still parked for the epoch.
    pub fn staged_batches(&self, epoch: Epoch) -> usize {
        self.inner
            .lock()
            .staged
            .keys()
            .filter(|(staged_epoch, _)| *staged_epoch == epoch)
            .count()
    }
}

/// Per-partition writer into the shared store. Buffers locally and hands the
/// whole batch to the store on task commit.
pub struct MemoryEpochWriter {
    store: MemoryStore,
    partition_idx: u16,
    epoch: Option<Epoch>,
    buffer: Vec<Bytes>,
}

impl MemoryEpochWriter {
    pub fn new(store: MemoryStore, partition_idx: u16) -> Self {
        Self {
            store,
            partition_idx,
            epoch: None,
            buffer: Vec::new(),
        }
    }
}

impl EpochWriter for MemoryEpochWriter {
    async fn begin(&mut self, epoch: Epoch) -> Result<()> {
        self.epoch = Some(epoch);
        self.buffer.clear();
        Ok(())
    }

    async fn write(&mut self, record: Record) -> Result<()> {
        if self.epoch.is_none() {
            return Err(Error::Writer(format!(
                "partition {} has no epoch in progress",
                self.partition_idx
            )));
        }
        self.buffer.push(record.value);
        Ok(())
    }

    async fn commit(&mut self) -> Result<CommitToken> {
        let epoch = self.epoch.take().ok_or_else(|| {
            Error::Writer(format!(
                "partition {} has no epoch in progress",
                self.partition_idx
            ))
        })?;
        let batch = std::mem::take(&mut self.buffer);
        let token = MemoryToken {
            partition_idx: self.partition_idx,
            records: batch.len() as u64,
        };
        self.store.stage(epoch, self.partition_idx, batch);
        let payload = serde_json::to_vec(&token)
            .map_err(|e| Error::Writer(format!("failed to encode memory sink token: {e}")))?;
        Ok(CommitToken::new(Bytes::from(payload)))
    }

    async fn abandon(&mut self) -> Result<()> {
        self.epoch = None;
        self.buffer.clear();
        Ok(())
    }
}

/// Driver-side committer over the shared store.
pub struct MemoryCommitter {
    store: MemoryStore,
}

impl MemoryCommitter {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }
}

impl EpochCommitter for MemoryCommitter {
    async fn commit(&mut self, epoch: Epoch, tokens: &TokenSlots) -> Result<()> {
        self.store.promote(epoch, tokens)
    }

    async fn abort(&mut self, epoch: Epoch, _tokens: &TokenSlots) -> Result<()> {
        // the store can identify everything staged for the epoch, which is
        // strictly more than the non-empty tokens describe
        self.store.discard(epoch)
    }
}
