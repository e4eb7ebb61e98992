//! The values that cross the protocol boundary: the [Record] handed to a
//! writer, the opaque [CommitToken] a writer produces when it finishes an
//! epoch, and the [TokenSlots] array the driver assembles before taking the
//! terminal commit/abort decision for an epoch. A token is created by exactly
//! one writer for exactly one epoch, handed off to the driver, and never
//! mutated afterwards; its lifetime ends when the terminal call consumes it.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;

/// A single output record assigned to a writer as part of an epoch's output.
/// NOTE: It is cheap to clone.
#[derive(Debug, Clone)]
pub struct Record {
    /// keys of the record
    pub keys: Arc<[String]>,
    /// actual payload of the record
    pub value: Bytes,
    /// event time of the record
    pub event_time: DateTime<Utc>,
}

impl Record {
    pub fn new(value: Bytes) -> Self {
        Self {
            keys: Arc::from([]),
            value,
            event_time: Utc::now(),
        }
    }
}

/// Durability proof emitted by a writer when it finishes an epoch. The
/// payload is sink-defined (a staged-file path, a log offset, a transaction
/// handle); the coordinator never looks inside it, it only collects tokens
/// into an ordered sequence and hands them to the sink's terminal call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitToken {
    payload: Bytes,
}

impl CommitToken {
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Ordered token-or-empty slots for one epoch, one slot per writer planned
/// for that epoch, indexed by partition. The length always equals the
/// planned writer count no matter how many writers actually reported; empty
/// slots are legitimate on abort since a writer may never have started,
/// never finished, or its token may have been lost before reaching the
/// driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenSlots {
    slots: Vec<Option<CommitToken>>,
}

impl TokenSlots {
    /// An all-empty slot array for `expected` planned writers.
    pub fn new(expected: u16) -> Self {
        Self {
            slots: vec![None; expected as usize],
        }
    }

    /// Records `token` in the slot for `partition_idx`. Each slot accepts
    /// exactly one token.
    pub fn fill(&mut self, partition_idx: u16, token: CommitToken) -> Result<()> {
        let len = self.slots.len();
        let slot = self.slots.get_mut(partition_idx as usize).ok_or_else(|| {
            Error::Coordinator(format!(
                "partition {partition_idx} is out of range for {len} planned writers"
            ))
        })?;
        if slot.is_some() {
            return Err(Error::Coordinator(format!(
                "token already recorded for partition {partition_idx}"
            )));
        }
        *slot = Some(token);
        Ok(())
    }

    pub fn get(&self, partition_idx: u16) -> Option<&CommitToken> {
        self.slots.get(partition_idx as usize)?.as_ref()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots that actually hold a token.
    pub fn filled_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn has_gaps(&self) -> bool {
        self.filled_count() != self.slots.len()
    }

    /// Iterates the slots in partition order, empty slots included.
    pub fn iter(&self) -> impl Iterator<Item = Option<&CommitToken>> {
        self.slots.iter().map(|slot| slot.as_ref())
    }
}

impl From<Vec<Option<CommitToken>>> for TokenSlots {
    fn from(slots: Vec<Option<CommitToken>>) -> Self {
        Self { slots }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_and_gaps() {
        let mut slots = TokenSlots::new(3);
        assert_eq!(slots.len(), 3);
        assert!(slots.has_gaps());
        assert_eq!(slots.filled_count(), 0);

        slots
            .fill(1, CommitToken::new(Bytes::from_static(b"t1")))
            .unwrap();
        assert_eq!(slots.filled_count(), 1);
        assert!(slots.has_gaps());
        assert!(slots.get(0).is_none());
        assert_eq!(
            slots.get(1).unwrap().payload(),
            &Bytes::from_static(b"t1")
        );

        slots
            .fill(0, CommitToken::new(Bytes::from_static(b"t0")))
            .unwrap();
        slots
            .fill(2, CommitToken::new(Bytes::from_static(b"t2")))
            .unwrap();
        assert!(!slots.has_gaps());
    }

    #[test]
    fn test_fill_rejects_occupied_slot() {
        let mut slots = TokenSlots::new(1);
        slots
            .fill(0, CommitToken::new(Bytes::from_static(b"first")))
            .unwrap();
        let err = slots
            .fill(0, CommitToken::new(Bytes::from_static(b"second")))
            .unwrap_err();
        assert!(err.to_string().contains("already recorded"));
        // the original token is untouched
        assert_eq!(
            slots.get(0).unwrap().payload(),
            &Bytes::from_static(b"first")
        );
    }

    #[test]
    fn test_fill_rejects_out_of_range_partition() {
        let mut slots = TokenSlots::new(2);
        let err = slots
            .fill(2, CommitToken::new(Bytes::from_static(b"t")))
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }
}
