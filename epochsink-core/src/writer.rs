//! Per-partition writer harness. The engine talks to a [WriterHandle]; an
//! actor task owns the writer instance and serializes
//! begin/write/commit/abandon onto it, so writers never share mutable state
//! and reach the driver only through the tokens they emit. Any error raised
//! during begin, write, or commit marks the current epoch attempt as failed:
//! the attempt produces no token and further calls are rejected until the
//! engine abandons it or begins the next epoch (the coordinator then treats
//! the partition's slot as empty).

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::Result;
use crate::config::{BlackholeConfig, DEFAULT_CHANNEL_CAPACITY};
use crate::epoch::Epoch;
use crate::error::Error;
use crate::message::{CommitToken, Record};
use crate::sink::blackhole::BlackholeEpochWriter;
use crate::sink::file::FileEpochWriter;
use crate::sink::memory::MemoryEpochWriter;
use crate::sink::{EpochWriter, SinkClientType};

enum ActorMessage {
    Begin {
        epoch: Epoch,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Write {
        record: Record,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Commit {
        respond_to: oneshot::Sender<Result<CommitToken>>,
    },
    Abandon {
        respond_to: oneshot::Sender<Result<()>>,
    },
}

struct WriterActor<T> {
    actor_messages: mpsc::Receiver<ActorMessage>,
    writer: T,
    partition_idx: u16,
    attempt_failed: bool,
}

impl<T> WriterActor<T>
where
    T: EpochWriter,
{
    fn new(actor_messages: mpsc::Receiver<ActorMessage>, writer: T, partition_idx: u16) -> Self {
        Self {
            actor_messages,
            writer,
            partition_idx,
            attempt_failed: false,
        }
    }

    fn failed_attempt(&self) -> Error {
        Error::Writer(format!(
            "partition {} epoch attempt already failed, abandon it or begin the next epoch",
            self.partition_idx
        ))
    }

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Begin { epoch, respond_to } => {
                self.attempt_failed = false;
                let result = self.writer.begin(epoch).await;
                if result.is_err() {
                    self.attempt_failed = true;
                }
                let _ = respond_to.send(result);
            }
            ActorMessage::Write { record, respond_to } => {
                let result = if self.attempt_failed {
                    Err(self.failed_attempt())
                } else {
                    let result = self.writer.write(record).await;
                    if let Err(e) = &result {
                        warn!(
                            partition_idx = self.partition_idx,
                            %e,
                            "write failed, this epoch attempt will produce no token"
                        );
                        self.attempt_failed = true;
                    }
                    result
                };
                let _ = respond_to.send(result);
            }
            ActorMessage::Commit { respond_to } => {
                let result = if self.attempt_failed {
                    Err(self.failed_attempt())
                } else {
                    let result = self.writer.commit().await;
                    if let Err(e) = &result {
                        warn!(
                            partition_idx = self.partition_idx,
                            %e,
                            "task commit failed, this epoch attempt will produce no token"
                        );
                        self.attempt_failed = true;
                    }
                    result
                };
                let _ = respond_to.send(result);
            }
            ActorMessage::Abandon { respond_to } => {
                let result = self.writer.abandon().await;
                self.attempt_failed = false;
                let _ = respond_to.send(result);
            }
        }
    }

    async fn run(mut self) {
        while let Some(msg) = self.actor_messages.recv().await {
            self.handle_message(msg).await;
        }
    }
}

/// Engine-facing handle to one partition's writer. The actor exits when all
/// copies of the handle are dropped and its mailbox drains.
#[derive(Clone)]
pub struct WriterHandle {
    sender: mpsc::Sender<ActorMessage>,
}

impl WriterHandle {
    /// Spawns the writer actor for one partition of the configured sink.
    pub fn new(sink: &SinkClientType, partition_idx: u16) -> Self {
        match sink {
            SinkClientType::File(config) => Self::spawn(
                FileEpochWriter::new(config.clone(), partition_idx),
                partition_idx,
            ),
            SinkClientType::Memory(store) => Self::spawn(
                MemoryEpochWriter::new(store.clone(), partition_idx),
                partition_idx,
            ),
            SinkClientType::Blackhole(BlackholeConfig {}) => {
                Self::spawn(BlackholeEpochWriter::new(partition_idx), partition_idx)
            }
        }
    }

    /// Entry point for writers of sink technologies implemented outside the
    /// builtins.
    pub fn spawn<T>(writer: T, partition_idx: u16) -> Self
    where
        T: EpochWriter + 'static,
    {
        let (sender, receiver) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let actor = WriterActor::new(receiver, writer, partition_idx);
        tokio::spawn(actor.run());
        Self { sender }
    }

    /// Arms the writer for `epoch`, clearing residue from the previous one.
    pub async fn begin(&self, epoch: Epoch) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Begin {
                epoch,
                respond_to: tx,
            })
            .await
            .map_err(|e| Error::Writer(format!("{e:?}")))?;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(format!("{e:?}")))?
    }

    pub async fn write(&self, record: Record) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Write {
                record,
                respond_to: tx,
            })
            .await
            .map_err(|e| Error::Writer(format!("{e:?}")))?;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(format!("{e:?}")))?
    }

    /// Finishes the epoch and returns this partition's commit token.
    pub async fn commit(&self) -> Result<CommitToken> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Commit { respond_to: tx })
            .await
            .map_err(|e| Error::Writer(format!("{e:?}")))?;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(format!("{e:?}")))?
    }

    /// Gives up on the epoch without producing a token. The engine may retry
    /// the partition under a fresh writer instance.
    pub async fn abandon(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Abandon { respond_to: tx })
            .await
            .map_err(|e| Error::Writer(format!("{e:?}")))?;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(format!("{e:?}")))?
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::time::{Duration, timeout};

    use super::*;
    use crate::sink::memory::MemoryStore;

    /// Writer that fails every write, for driving the failure path.
    struct FailingWriter;

    impl EpochWriter for FailingWriter {
        async fn begin(&mut self, _epoch: Epoch) -> Result<()> {
            Ok(())
        }

        async fn write(&mut self, _record: Record) -> Result<()> {
            Err(Error::Sink("disk on fire".to_string()))
        }

        async fn commit(&mut self) -> Result<CommitToken> {
            Ok(CommitToken::new(Bytes::new()))
        }

        async fn abandon(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn record(value: &'static [u8]) -> Record {
        Record::new(Bytes::from_static(value))
    }

    #[tokio::test]
    async fn test_write_then_commit_produces_token() {
        let store = MemoryStore::new();
        let handle = WriterHandle::new(&SinkClientType::Memory(store.clone()), 0);

        handle.begin(1).await.unwrap();
        handle.write(record(b"a")).await.unwrap();
        handle.write(record(b"b")).await.unwrap();
        let token = timeout(Duration::from_secs(1), handle.commit())
            .await
            .unwrap()
            .unwrap();
        assert!(!token.payload().is_empty());
        assert_eq!(store.staged_batches(1), 1);
    }

    #[tokio::test]
    async fn test_failed_attempt_produces_no_token() {
        let handle = WriterHandle::spawn(FailingWriter, 2);

        handle.begin(1).await.unwrap();
        let err = handle.write(record(b"boom")).await.unwrap_err();
        assert!(err.to_string().contains("disk on fire"));

        // the attempt is poisoned: no token may be produced for it
        let err = handle.commit().await.unwrap_err();
        assert!(err.to_string().contains("already failed"));
        let err = handle.write(record(b"more")).await.unwrap_err();
        assert!(err.to_string().contains("already failed"));
    }

    #[tokio::test]
    async fn test_abandon_clears_failed_attempt() {
        let handle = WriterHandle::spawn(FailingWriter, 0);

        handle.begin(3).await.unwrap();
        handle.write(record(b"boom")).await.unwrap_err();
        handle.abandon().await.unwrap();

        // a fresh epoch can be started after abandoning the failed one
        handle.begin(4).await.unwrap();
        handle.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_begin_resets_failed_attempt() {
        let handle = WriterHandle::spawn(FailingWriter, 0);

        handle.begin(5).await.unwrap();
        handle.write(record(b"boom")).await.unwrap_err();

        handle.begin(6).await.unwrap();
        handle.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_reused_writer_carries_nothing_across_epochs() {
        let store = MemoryStore::new();
        let handle = WriterHandle::new(&SinkClientType::Memory(store.clone()), 0);

        handle.begin(1).await.unwrap();
        handle.write(record(b"one")).await.unwrap();
        handle.write(record(b"two")).await.unwrap();
        handle.commit().await.unwrap();

        handle.begin(2).await.unwrap();
        handle.write(record(b"three")).await.unwrap();
        let token = handle.commit().await.unwrap();

        // epoch 2's token accounts for exactly one record
        let payload: serde_json::Value = serde_json::from_slice(token.payload()).unwrap();
        assert_eq!(payload["records"], 1);
    }
}
