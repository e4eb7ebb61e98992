//! Epoch-scoped commit coordination for streaming sinks. A streaming engine
//! processes work in discrete epochs, each written by many independent,
//! possibly-restarted per-partition writers. This crate is the contract that
//! makes those writers agree, epoch by epoch, on whether an epoch's output
//! is durably and atomically visible in the sink:
//! - every writer that finishes its slice emits exactly one commit token,
//! - the coordinator collects the tokens into an ordered slot array,
//! - exactly one terminal commit-or-abort decision is taken per epoch,
//!   idempotent under the driver-side retries that follow ambiguous
//!   failures.
//!
//! Epoch sizing, scheduling, transport, and the sink's own storage
//! transactionality belong to the host engine and the sink adapters; sinks
//! plug in through the capability traits in [sink].

pub use self::error::{Error, Result};

/// Sink selection and knobs, loadable from an environment-carried JSON spec.
pub mod config;

/// The driver-side epoch ledger and its terminal commit/abort decisions.
pub mod coordinator;

mod error;

/// Epoch ids and the per-epoch lifecycle state machine.
pub mod epoch;

/// Records, commit tokens, and the per-epoch token slot array.
pub mod message;

/// The sink capability traits and the builtin sink variants.
pub mod sink;

/// The per-partition writer harness the engine drives through an epoch.
pub mod writer;
