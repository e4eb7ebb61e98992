//! The sink-facing half of the protocol: two capability traits that every
//! sink technology implements, plus the set of builtin implementations. The
//! coordinator and the writer harness are generic over these traits, so the
//! concrete sink is chosen once at configuration time and everything above
//! it stays sink-agnostic. Token content is owned by the sink variant; the
//! rest of the crate treats it as an opaque blob.

use crate::Result;
use crate::config::{BlackholeConfig, FileSinkConfig, MemoryConfig, SinkConfig, SinkType};
use crate::epoch::Epoch;
use crate::message::{CommitToken, Record, TokenSlots};
use crate::sink::memory::MemoryStore;

/// [Blackhole] accepts and discards everything, semantic equivalent of `/dev/null`.
pub mod blackhole;

/// File-based sink: writers stage part files, commit flips visibility with
/// an epoch marker.
pub mod file;

/// Append-log sink backed by a shared in-memory store with a
/// staged-vs-visible split.
pub mod memory;

/// Per-partition worker side of the protocol. One instance is reused across
/// epochs: `begin` arms it for the next epoch and clears any residue from
/// the previous one, while the instance's identity (and any connection or
/// resource it holds) stays stable.
#[trait_variant::make(EpochWriter: Send)]
pub trait LocalEpochWriter {
    /// Arms the writer for `epoch`. This is the explicit reset step invoked
    /// by the runtime between epochs.
    async fn begin(&mut self, epoch: Epoch) -> Result<()>;

    /// Buffers or flushes `record` toward the sink as part of the current
    /// epoch's output.
    async fn write(&mut self, record: Record) -> Result<()>;

    /// Called once the epoch's input is exhausted with no unrecoverable
    /// error. Produces the durability proof for this writer's slice of the
    /// epoch and resets all per-epoch state (buffers, counters, partial
    /// writes not yet made visible) so the instance can be reused without
    /// residue.
    async fn commit(&mut self) -> Result<CommitToken>;

    /// Failure path, invoked instead of [commit](LocalEpochWriter::commit):
    /// discards the current epoch's buffered output and produces no token.
    /// The engine may then retry the partition under a fresh instance.
    async fn abandon(&mut self) -> Result<()>;
}

/// Driver side of the protocol: the single authority that decides whether an
/// epoch's output becomes durably visible.
#[trait_variant::make(EpochCommitter: Send)]
pub trait LocalEpochCommitter {
    /// Makes `epoch`'s output durably and atomically visible, based on the
    /// tokens collected from its writers. Implementations must be
    /// idempotent: the engine may call commit more than once for the same
    /// epoch after an ambiguous failure, and a repeat for an
    /// already-committed epoch must not re-apply side effects. If commit
    /// itself fails, the sink must be left in a state where a follow-up
    /// abort for the same epoch is still meaningful.
    ///
    /// Whether a commit with empty slots can still yield a consistent result
    /// is the sink's judgment; the protocol does not forbid it.
    async fn commit(&mut self, epoch: Epoch, tokens: &TokenSlots) -> Result<()>;

    /// Best-effort cleanup when the epoch cannot be committed. The slot
    /// array legitimately contains holes here (writers that never started,
    /// never finished, or whose token was lost in transit); emptiness itself
    /// must never raise. Implementations undo or discard whatever partial
    /// output the non-empty tokens identify; full cleanup is not guaranteed.
    async fn abort(&mut self, epoch: Epoch, tokens: &TokenSlots) -> Result<()>;
}

/// Builtin sink technologies, selected at configuration time. Sinks backed
/// by external systems (database transactions, message brokers) plug into
/// the same traits from their own crates.
#[derive(Debug, Clone)]
pub enum SinkClientType {
    File(FileSinkConfig),
    Memory(MemoryStore),
    Blackhole(BlackholeConfig),
}

impl SinkClientType {
    /// Instantiates the runtime client for a parsed [SinkConfig]. The
    /// memory sink's shared store is created here, once, so that writers
    /// and the coordinator built from the same client observe one log.
    pub fn from_config(config: &SinkConfig) -> Self {
        match &config.sink_type {
            SinkType::File(file_config) => SinkClientType::File(file_config.clone()),
            SinkType::Memory(MemoryConfig {}) => SinkClientType::Memory(MemoryStore::new()),
            SinkType::Blackhole(blackhole_config) => {
                SinkClientType::Blackhole(blackhole_config.clone())
            }
        }
    }
}
