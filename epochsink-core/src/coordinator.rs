//! The epoch commit coordinator: the single authority (logically one
//! instance, owned by the driver) that decides whether an epoch's output
//! becomes durably visible in the sink. It keeps one record per retained
//! epoch (lifecycle state, planned writer count, collected tokens), admits
//! writer tokens into their slots, and takes exactly one terminal
//! commit-or-abort decision per epoch, delegating the sink-level work to the
//! configured [EpochCommitter]. All calls are serialized through the actor
//! mailbox, so at most one terminal decision is in flight per epoch at a
//! time. Writers may already be producing epoch N+1 while epoch N is being
//! decided; the decision relies only on epoch N's token set, never on
//! write-side quiescence.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::Result;
use crate::config::{BlackholeConfig, DEFAULT_CHANNEL_CAPACITY};
use crate::epoch::{Epoch, EpochState};
use crate::error::Error;
use crate::message::{CommitToken, TokenSlots};
use crate::sink::blackhole::BlackholeCommitter;
use crate::sink::file::FileCommitter;
use crate::sink::memory::MemoryCommitter;
use crate::sink::{EpochCommitter, SinkClientType};

/// Coordinator-held state of one epoch.
struct EpochRecord {
    state: EpochState,
    expected_writers: u16,
    collected: TokenSlots,
}

enum ActorMessage {
    Open {
        epoch: Epoch,
        expected_writers: u16,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Seal {
        epoch: Epoch,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Collect {
        epoch: Epoch,
        partition_idx: u16,
        token: CommitToken,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Collected {
        epoch: Epoch,
        respond_to: oneshot::Sender<Result<TokenSlots>>,
    },
    Commit {
        epoch: Epoch,
        tokens: TokenSlots,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Abort {
        epoch: Epoch,
        tokens: TokenSlots,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Forget {
        epoch: Epoch,
        respond_to: oneshot::Sender<Result<()>>,
    },
    #[cfg(test)]
    State {
        epoch: Epoch,
        respond_to: oneshot::Sender<Option<EpochState>>,
    },
}

struct Coordinator<T> {
    actor_messages: mpsc::Receiver<ActorMessage>,
    committer: T,
    epochs: HashMap<Epoch, EpochRecord>,
    highest_opened: Option<Epoch>,
}

impl<T> Coordinator<T>
where
    T: EpochCommitter,
{
    fn new(actor_messages: mpsc::Receiver<ActorMessage>, committer: T) -> Self {
        Self {
            actor_messages,
            committer,
            epochs: HashMap::new(),
            highest_opened: None,
        }
    }

    async fn run(mut self) {
        while let Some(msg) = self.actor_messages.recv().await {
            self.handle_message(msg).await;
        }
    }

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Open {
                epoch,
                expected_writers,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_open(epoch, expected_writers));
            }
            ActorMessage::Seal { epoch, respond_to } => {
                let _ = respond_to.send(self.handle_seal(epoch));
            }
            ActorMessage::Collect {
                epoch,
                partition_idx,
                token,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_collect(epoch, partition_idx, token));
            }
            ActorMessage::Collected { epoch, respond_to } => {
                let result = self
                    .record(epoch)
                    .map(|record| record.collected.clone());
                let _ = respond_to.send(result);
            }
            ActorMessage::Commit {
                epoch,
                tokens,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_commit(epoch, tokens).await);
            }
            ActorMessage::Abort {
                epoch,
                tokens,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_abort(epoch, tokens).await);
            }
            ActorMessage::Forget { epoch, respond_to } => {
                let _ = respond_to.send(self.handle_forget(epoch));
            }
            #[cfg(test)]
            ActorMessage::State { epoch, respond_to } => {
                let _ = respond_to.send(self.epochs.get(&epoch).map(|record| record.state));
            }
        }
    }

    fn record(&mut self, epoch: Epoch) -> Result<&mut EpochRecord> {
        self.epochs.get_mut(&epoch).ok_or_else(|| {
            Error::Coordinator(format!("epoch {epoch} was never opened by this coordinator"))
        })
    }

    fn handle_open(&mut self, epoch: Epoch, expected_writers: u16) -> Result<()> {
        if self.highest_opened.is_some_and(|highest| epoch <= highest) {
            return Err(Error::Coordinator(format!(
                "epoch {epoch} was already opened in this run, ids are never reused"
            )));
        }
        self.epochs.insert(
            epoch,
            EpochRecord {
                state: EpochState::Open,
                expected_writers,
                collected: TokenSlots::new(expected_writers),
            },
        );
        self.highest_opened = Some(epoch);
        info!(epoch, expected_writers, "Opened epoch for writing");
        Ok(())
    }

    fn handle_seal(&mut self, epoch: Epoch) -> Result<()> {
        let record = self.record(epoch)?;
        record.state = record.state.advance(EpochState::AwaitingTokens)?;
        Ok(())
    }

    fn handle_collect(
        &mut self,
        epoch: Epoch,
        partition_idx: u16,
        token: CommitToken,
    ) -> Result<()> {
        let record = self.record(epoch)?;
        if record.state.is_terminal() {
            // the writer finished after the terminal decision was made; its
            // output was already handled (or abandoned) by that decision
            warn!(
                epoch,
                partition_idx,
                state = %record.state,
                "Token arrived after the terminal decision, dropping it"
            );
            return Ok(());
        }
        record.collected.fill(partition_idx, token)
    }

    async fn handle_commit(&mut self, epoch: Epoch, tokens: TokenSlots) -> Result<()> {
        let record = self.record(epoch)?;
        match record.state {
            EpochState::Committed => {
                info!(epoch, "Repeated commit for a committed epoch, ignoring");
                return Ok(());
            }
            EpochState::Aborted => {
                return Err(Error::Coordinator(format!(
                    "epoch {epoch} was aborted, it can never be committed"
                )));
            }
            EpochState::Open | EpochState::AwaitingTokens | EpochState::Deciding => {}
        }
        if tokens.len() != record.expected_writers as usize {
            return Err(Error::Coordinator(format!(
                "epoch {epoch} expects {} token slots, got {}",
                record.expected_writers,
                tokens.len()
            )));
        }

        record.state = record.state.advance(EpochState::Deciding)?;
        match self.committer.commit(epoch, &tokens).await {
            Ok(()) => {
                // record() cannot fail here, the entry was just touched
                let record = self.record(epoch)?;
                record.state = record.state.advance(EpochState::Committed)?;
                info!(epoch, tokens = tokens.filled_count(), "Epoch committed");
                Ok(())
            }
            Err(e) => {
                // the epoch stays in Deciding: the engine follows up with an
                // abort for this same epoch
                error!(epoch, %e, "Sink commit failed, epoch remains abortable");
                Err(e)
            }
        }
    }

    async fn handle_abort(&mut self, epoch: Epoch, tokens: TokenSlots) -> Result<()> {
        let record = self.record(epoch)?;
        match record.state {
            EpochState::Aborted => {
                info!(epoch, "Repeated abort for an aborted epoch, ignoring");
                return Ok(());
            }
            EpochState::Committed => {
                return Err(Error::Coordinator(format!(
                    "epoch {epoch} was committed, aborting it now would lose visible data"
                )));
            }
            EpochState::Open | EpochState::AwaitingTokens | EpochState::Deciding => {}
        }
        if tokens.len() != record.expected_writers as usize {
            return Err(Error::Coordinator(format!(
                "epoch {epoch} expects {} token slots, got {}",
                record.expected_writers,
                tokens.len()
            )));
        }

        record.state = record.state.advance(EpochState::Deciding)?;
        match self.committer.abort(epoch, &tokens).await {
            Ok(()) => {
                let record = self.record(epoch)?;
                record.state = record.state.advance(EpochState::Aborted)?;
                info!(epoch, tokens = tokens.filled_count(), "Epoch aborted");
                Ok(())
            }
            Err(e) => {
                // abort is already the last-resort cleanup path
                error!(
                    epoch,
                    %e,
                    "Sink abort failed, manual cleanup of the sink may be required"
                );
                Err(e)
            }
        }
    }

    fn handle_forget(&mut self, epoch: Epoch) -> Result<()> {
        let record = self.record(epoch)?;
        if !record.state.is_terminal() {
            return Err(Error::Coordinator(format!(
                "epoch {epoch} is still undecided, it cannot be forgotten"
            )));
        }
        self.epochs.remove(&epoch);
        Ok(())
    }
}

/// Engine-facing handle to the coordinator. The actor exits when all copies
/// of the handle are dropped and its mailbox drains.
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<ActorMessage>,
}

impl CoordinatorHandle {
    /// Spawns the coordinator over the configured sink's committer.
    pub fn new(sink: &SinkClientType) -> Self {
        match sink {
            SinkClientType::File(config) => Self::spawn(FileCommitter::new(config.clone())),
            SinkClientType::Memory(store) => Self::spawn(MemoryCommitter::new(store.clone())),
            SinkClientType::Blackhole(BlackholeConfig {}) => Self::spawn(BlackholeCommitter),
        }
    }

    /// Entry point for committers of sink technologies implemented outside
    /// the builtins.
    pub fn spawn<T>(committer: T) -> Self
    where
        T: EpochCommitter + 'static,
    {
        let (sender, receiver) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let coordinator = Coordinator::new(receiver, committer);
        tokio::spawn(coordinator.run());
        Self { sender }
    }

    /// Opens `epoch` for writing by `expected_writers` planned writer tasks.
    /// Epoch ids are engine-assigned and strictly increasing within a run.
    pub async fn open(&self, epoch: Epoch, expected_writers: u16) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Open {
            epoch,
            expected_writers,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(format!("{e:?}")))?
    }

    /// Marks that the engine stopped assigning writes for `epoch` and is now
    /// waiting for in-flight writers. Advisory: an unsealed epoch can still
    /// be decided.
    pub async fn seal(&self, epoch: Epoch) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Seal {
            epoch,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(format!("{e:?}")))?
    }

    /// Records a writer's token in its slot. Once this returns, the writer's
    /// token is accounted for and the writer may be released into the next
    /// epoch. Tokens arriving after the terminal decision are dropped.
    pub async fn collect(
        &self,
        epoch: Epoch,
        partition_idx: u16,
        token: CommitToken,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Collect {
            epoch,
            partition_idx,
            token,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(format!("{e:?}")))?
    }

    /// Snapshot of the slot array collected so far for `epoch`.
    pub async fn collected(&self, epoch: Epoch) -> Result<TokenSlots> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Collected {
            epoch,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(format!("{e:?}")))?
    }

    /// The authoritative decision that `epoch`'s output is durably visible.
    /// Safe to repeat for an already-committed epoch; on failure the epoch
    /// stays abortable and the engine must follow up with [abort](Self::abort).
    pub async fn commit(&self, epoch: Epoch, tokens: TokenSlots) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Commit {
            epoch,
            tokens,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(format!("{e:?}")))?
    }

    /// Best-effort cleanup of an epoch that cannot be committed. Empty slots
    /// are expected; an error here means the sink may need manual attention.
    pub async fn abort(&self, epoch: Epoch, tokens: TokenSlots) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Abort {
            epoch,
            tokens,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(format!("{e:?}")))?
    }

    /// Drops a decided epoch's record once the engine no longer retains the
    /// epoch for recovery.
    pub async fn forget(&self, epoch: Epoch) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Forget {
            epoch,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(format!("{e:?}")))?
    }

    #[cfg(test)]
    async fn state(&self, epoch: Epoch) -> Option<EpochState> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::State {
            epoch,
            respond_to: tx,
        })
        .await
        .ok()?;
        rx.await.ok()?
    }

    async fn send(&self, msg: ActorMessage) -> Result<()> {
        self.sender
            .send(msg)
            .await
            .map_err(|e| Error::Coordinator(format!("{e:?}")))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::time::{Duration, timeout};

    use super::*;
    use crate::message::Record;
    use crate::sink::EpochWriter;
    use crate::sink::memory::{MemoryEpochWriter, MemoryStore};

    /// Committer that fails its first `fail_commits` commit calls, then
    /// delegates to the memory sink. Drives the failed-commit-then-abort
    /// path.
    struct FlakyCommitter {
        inner: MemoryCommitter,
        fail_commits: u32,
    }

    impl FlakyCommitter {
        fn new(store: MemoryStore, fail_commits: u32) -> Self {
            Self {
                inner: MemoryCommitter::new(store),
                fail_commits,
            }
        }
    }

    impl EpochCommitter for FlakyCommitter {
        async fn commit(&mut self, epoch: Epoch, tokens: &TokenSlots) -> Result<()> {
            if self.fail_commits > 0 {
                self.fail_commits -= 1;
                return Err(Error::Sink("sink unavailable".to_string()));
            }
            self.inner.commit(epoch, tokens).await
        }

        async fn abort(&mut self, epoch: Epoch, tokens: &TokenSlots) -> Result<()> {
            self.inner.abort(epoch, tokens).await
        }
    }

    fn memory_coordinator() -> (CoordinatorHandle, MemoryStore) {
        let store = MemoryStore::new();
        let handle = CoordinatorHandle::spawn(MemoryCommitter::new(store.clone()));
        (handle, store)
    }

    /// Runs one writer through a full epoch and returns its token.
    async fn stage(
        store: &MemoryStore,
        epoch: Epoch,
        partition_idx: u16,
        values: &[&'static [u8]],
    ) -> CommitToken {
        let mut writer = MemoryEpochWriter::new(store.clone(), partition_idx);
        writer.begin(epoch).await.unwrap();
        for value in values {
            writer
                .write(Record::new(Bytes::from_static(value)))
                .await
                .unwrap();
        }
        writer.commit().await.unwrap()
    }

    #[tokio::test]
    async fn test_both_writers_succeed_and_commit() {
        let (handle, store) = memory_coordinator();

        handle.open(5, 2).await.unwrap();
        handle
            .collect(5, 0, stage(&store, 5, 0, &[b"w1-a", b"w1-b"]).await)
            .await
            .unwrap();
        handle
            .collect(5, 1, stage(&store, 5, 1, &[b"w2-a"]).await)
            .await
            .unwrap();
        handle.seal(5).await.unwrap();

        let tokens = handle.collected(5).await.unwrap();
        assert!(!tokens.has_gaps());
        timeout(Duration::from_secs(1), handle.commit(5, tokens))
            .await
            .unwrap()
            .unwrap();

        assert!(store.is_visible(5));
        assert_eq!(store.visible_records(5).len(), 3);
        assert_eq!(handle.state(5).await, Some(EpochState::Committed));
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let (handle, store) = memory_coordinator();

        handle.open(1, 1).await.unwrap();
        handle
            .collect(1, 0, stage(&store, 1, 0, &[b"once"]).await)
            .await
            .unwrap();
        let tokens = handle.collected(1).await.unwrap();

        handle.commit(1, tokens.clone()).await.unwrap();
        let visible_after_first = store.visible_records(1);

        // driver-side retry after an ambiguous failure replays the same call
        handle.commit(1, tokens).await.unwrap();
        assert_eq!(store.visible_records(1), visible_after_first);
        assert_eq!(handle.state(1).await, Some(EpochState::Committed));
    }

    #[tokio::test]
    async fn test_partial_failure_aborts_whole_epoch() {
        let (handle, store) = memory_coordinator();

        // writer 0 succeeds, writer 1 fails and never reports
        handle.open(6, 2).await.unwrap();
        handle
            .collect(6, 0, stage(&store, 6, 0, &[b"survivor"]).await)
            .await
            .unwrap();

        let tokens = handle.collected(6).await.unwrap();
        assert!(tokens.has_gaps());
        handle.abort(6, tokens).await.unwrap();

        // the successful partition's output is gone too, the epoch as a
        // whole was abandoned
        assert!(!store.is_visible(6));
        assert_eq!(store.staged_batches(6), 0);
        assert_eq!(handle.state(6).await, Some(EpochState::Aborted));
    }

    #[tokio::test]
    async fn test_failed_commit_then_abort() {
        let store = MemoryStore::new();
        let handle = CoordinatorHandle::spawn(FlakyCommitter::new(store.clone(), 1));

        handle.open(7, 2).await.unwrap();
        handle
            .collect(7, 0, stage(&store, 7, 0, &[b"t1"]).await)
            .await
            .unwrap();
        handle
            .collect(7, 1, stage(&store, 7, 1, &[b"t2"]).await)
            .await
            .unwrap();
        let tokens = handle.collected(7).await.unwrap();

        let err = handle.commit(7, tokens.clone()).await.unwrap_err();
        assert!(err.to_string().contains("sink unavailable"));
        // the epoch is not terminal yet, the engine re-enters the decision
        assert_eq!(handle.state(7).await, Some(EpochState::Deciding));

        handle.abort(7, tokens).await.unwrap();
        assert!(!store.is_visible(7));
        assert_eq!(handle.state(7).await, Some(EpochState::Aborted));
    }

    #[tokio::test]
    async fn test_commit_after_abort_is_rejected() {
        let (handle, store) = memory_coordinator();

        handle.open(3, 1).await.unwrap();
        let token = stage(&store, 3, 0, &[b"late"]).await;
        handle.abort(3, TokenSlots::new(1)).await.unwrap();

        let mut tokens = TokenSlots::new(1);
        tokens.fill(0, token).unwrap();
        let err = handle.commit(3, tokens).await.unwrap_err();
        assert!(err.to_string().contains("can never be committed"));
        assert_eq!(handle.state(3).await, Some(EpochState::Aborted));
    }

    #[tokio::test]
    async fn test_abort_after_commit_is_rejected() {
        let (handle, store) = memory_coordinator();

        handle.open(4, 1).await.unwrap();
        handle
            .collect(4, 0, stage(&store, 4, 0, &[b"kept"]).await)
            .await
            .unwrap();
        let tokens = handle.collected(4).await.unwrap();
        handle.commit(4, tokens.clone()).await.unwrap();

        let err = handle.abort(4, tokens).await.unwrap_err();
        assert!(err.to_string().contains("lose visible data"));
        assert!(store.is_visible(4));
    }

    #[tokio::test]
    async fn test_repeated_abort_is_a_noop() {
        let (handle, _store) = memory_coordinator();

        handle.open(2, 2).await.unwrap();
        handle.abort(2, TokenSlots::new(2)).await.unwrap();
        handle.abort(2, TokenSlots::new(2)).await.unwrap();
        assert_eq!(handle.state(2).await, Some(EpochState::Aborted));
    }

    #[tokio::test]
    async fn test_abort_tolerates_all_slots_empty() {
        let (handle, store) = memory_coordinator();

        // no writer ever started
        handle.open(9, 3).await.unwrap();
        handle.abort(9, TokenSlots::new(3)).await.unwrap();
        assert!(!store.is_visible(9));
    }

    #[tokio::test]
    async fn test_commit_with_gaps_is_the_sinks_judgment() {
        let (handle, store) = memory_coordinator();

        // the protocol does not forbid committing with empty slots; the
        // memory sink accepts and publishes the partitions that reported
        handle.open(13, 2).await.unwrap();
        handle
            .collect(13, 0, stage(&store, 13, 0, &[b"present"]).await)
            .await
            .unwrap();
        let tokens = handle.collected(13).await.unwrap();
        assert!(tokens.has_gaps());

        handle.commit(13, tokens).await.unwrap();
        assert!(store.is_visible(13));
        assert_eq!(store.visible_records(13).len(), 1);
    }

    #[tokio::test]
    async fn test_open_rejects_reused_epoch_ids() {
        let (handle, _store) = memory_coordinator();

        handle.open(10, 1).await.unwrap();
        let err = handle.open(10, 1).await.unwrap_err();
        assert!(err.to_string().contains("never reused"));
        let err = handle.open(9, 1).await.unwrap_err();
        assert!(err.to_string().contains("never reused"));
        handle.open(11, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminal_calls_require_an_opened_epoch() {
        let (handle, _store) = memory_coordinator();

        let err = handle.commit(42, TokenSlots::new(0)).await.unwrap_err();
        assert!(err.to_string().contains("never opened"));
        let err = handle.abort(42, TokenSlots::new(0)).await.unwrap_err();
        assert!(err.to_string().contains("never opened"));
    }

    #[tokio::test]
    async fn test_commit_rejects_wrong_slot_count() {
        let (handle, _store) = memory_coordinator();

        handle.open(1, 2).await.unwrap();
        let err = handle.commit(1, TokenSlots::new(1)).await.unwrap_err();
        assert!(err.to_string().contains("token slots"));
        // the epoch is untouched and still decidable
        handle.abort(1, TokenSlots::new(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_collect_rejects_duplicate_tokens() {
        let (handle, store) = memory_coordinator();

        handle.open(8, 2).await.unwrap();
        handle
            .collect(8, 1, stage(&store, 8, 1, &[b"first"]).await)
            .await
            .unwrap();
        let err = handle
            .collect(8, 1, stage(&store, 8, 1, &[b"second"]).await)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already recorded"));
    }

    #[tokio::test]
    async fn test_token_after_terminal_decision_is_dropped() {
        let (handle, store) = memory_coordinator();

        handle.open(12, 2).await.unwrap();
        handle.abort(12, TokenSlots::new(2)).await.unwrap();

        // a straggler writer finished after the abort went out
        let token = stage(&store, 12, 0, &[b"straggler"]).await;
        handle.collect(12, 0, token).await.unwrap();
        assert_eq!(handle.collected(12).await.unwrap().filled_count(), 0);
    }

    #[tokio::test]
    async fn test_forget_drops_only_decided_epochs() {
        let (handle, store) = memory_coordinator();

        handle.open(20, 1).await.unwrap();
        let err = handle.forget(20).await.unwrap_err();
        assert!(err.to_string().contains("undecided"));

        handle
            .collect(20, 0, stage(&store, 20, 0, &[b"done"]).await)
            .await
            .unwrap();
        let tokens = handle.collected(20).await.unwrap();
        handle.commit(20, tokens).await.unwrap();
        handle.forget(20).await.unwrap();
        assert_eq!(handle.state(20).await, None);
    }
}
