//! Blackhole is a sink to emulate `/dev/null`: every record is accepted and
//! discarded, and every epoch commits trivially.

use bytes::Bytes;

use crate::Result;
use crate::epoch::Epoch;
use crate::error::Error;
use crate::message::{CommitToken, Record, TokenSlots};
use crate::sink::{EpochCommitter, EpochWriter};

pub struct BlackholeEpochWriter {
    partition_idx: u16,
    epoch: Option<Epoch>,
}

impl BlackholeEpochWriter {
    pub fn new(partition_idx: u16) -> Self {
        Self {
            partition_idx,
            epoch: None,
        }
    }
}

impl EpochWriter for BlackholeEpochWriter {
    async fn begin(&mut self, epoch: Epoch) -> Result<()> {
        self.epoch = Some(epoch);
        Ok(())
    }

    async fn write(&mut self, _record: Record) -> Result<()> {
        if self.epoch.is_none() {
            return Err(Error::Writer(format!(
                "partition {} has no epoch in progress",
                self.partition_idx
            )));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<CommitToken> {
        self.epoch.take().ok_or_else(|| {
            Error::Writer(format!(
                "partition {} has no epoch in progress",
                self.partition_idx
            ))
        })?;
        Ok(CommitToken::new(Bytes::new()))
    }

    async fn abandon(&mut self) -> Result<()> {
        self.epoch = None;
        Ok(())
    }
}

pub struct BlackholeCommitter;

impl EpochCommitter for BlackholeCommitter {
    async fn commit(&mut self, _epoch: Epoch, _tokens: &TokenSlots) -> Result<()> {
        Ok(())
    }

    async fn abort(&mut self, _epoch: Epoch, _tokens: &TokenSlots) -> Result<()> {
        Ok(())
    }
}
