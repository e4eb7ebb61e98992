//! File-based sink. Writers stage one length-prefix-framed part file per
//! (epoch, partition) under the staging dir and hand the staged path over in
//! their token. The driver-side commit renames every staged part into the
//! output dir and then writes the epoch marker file; the marker is the
//! atomic visibility flip, so readers treat an epoch's parts as present only
//! once the marker exists. A failed commit leaves no marker behind, which
//! keeps the follow-up abort meaningful.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::FileSinkConfig;
use crate::epoch::Epoch;
use crate::error::Error;
use crate::message::{CommitToken, Record, TokenSlots};
use crate::sink::{EpochCommitter, EpochWriter};

/// Token payload of the file sink: where the staged part lives and how many
/// records it holds.
#[derive(Debug, Serialize, Deserialize)]
struct FileToken {
    staged_path: PathBuf,
    partition_idx: u16,
    records: u64,
}

fn staged_path(config: &FileSinkConfig, epoch: Epoch, partition_idx: u16) -> PathBuf {
    config
        .staging_dir
        .join(format!("{epoch}_{partition_idx}.part"))
}

fn part_path(output_dir: &Path, epoch: Epoch, partition_idx: u16) -> PathBuf {
    output_dir.join(format!("{epoch}_{partition_idx}.data"))
}

fn marker_path(output_dir: &Path, epoch: Epoch) -> PathBuf {
    output_dir.join(format!("{epoch}.committed"))
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Per-partition writer staging into the file sink.
pub struct FileEpochWriter {
    config: FileSinkConfig,
    partition_idx: u16,
    epoch: Option<Epoch>,
    current_file: Option<BufWriter<File>>,
    current_path: Option<PathBuf>,
    records: u64,
}

impl FileEpochWriter {
    pub fn new(config: FileSinkConfig, partition_idx: u16) -> Self {
        Self {
            config,
            partition_idx,
            epoch: None,
            current_file: None,
            current_path: None,
            records: 0,
        }
    }

    fn no_epoch(&self) -> Error {
        Error::Writer(format!(
            "partition {} has no epoch in progress",
            self.partition_idx
        ))
    }
}

impl EpochWriter for FileEpochWriter {
    async fn begin(&mut self, epoch: Epoch) -> Result<()> {
        // drop residue from any previous attempt before arming the new epoch
        self.current_file = None;
        self.current_path = None;
        self.records = 0;

        tokio::fs::create_dir_all(&self.config.staging_dir).await?;
        let path = staged_path(&self.config, epoch, self.partition_idx);
        debug!(path = %path.display(), "Opening staged part file");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;

        self.current_file = Some(BufWriter::new(file));
        self.current_path = Some(path);
        self.epoch = Some(epoch);
        Ok(())
    }

    async fn write(&mut self, record: Record) -> Result<()> {
        let Some(file) = self.current_file.as_mut() else {
            return Err(self.no_epoch());
        };
        file.write_u64_le(record.value.len() as u64).await?;
        file.write_all(&record.value).await?;
        self.records += 1;
        Ok(())
    }

    async fn commit(&mut self) -> Result<CommitToken> {
        if self.epoch.is_none() {
            return Err(self.no_epoch());
        }
        let Some(mut file) = self.current_file.take() else {
            return Err(self.no_epoch());
        };
        // the staged part must survive this writer; the epoch outcome is
        // decided later by the driver
        file.flush().await?;
        file.into_inner().sync_all().await?;

        let Some(path) = self.current_path.take() else {
            return Err(self.no_epoch());
        };
        let token = FileToken {
            staged_path: path,
            partition_idx: self.partition_idx,
            records: self.records,
        };
        let payload = serde_json::to_vec(&token)
            .map_err(|e| Error::Writer(format!("failed to encode file sink token: {e}")))?;

        self.epoch = None;
        self.records = 0;
        Ok(CommitToken::new(Bytes::from(payload)))
    }

    async fn abandon(&mut self) -> Result<()> {
        self.epoch = None;
        self.current_file = None;
        self.records = 0;
        if let Some(path) = self.current_path.take() {
            remove_if_present(&path).await?;
        }
        Ok(())
    }
}

/// Driver-side committer of the file sink.
pub struct FileCommitter {
    config: FileSinkConfig,
}

impl FileCommitter {
    pub fn new(config: FileSinkConfig) -> Self {
        Self { config }
    }
}

impl EpochCommitter for FileCommitter {
    async fn commit(&mut self, epoch: Epoch, tokens: &TokenSlots) -> Result<()> {
        let marker = marker_path(&self.config.output_dir, epoch);
        if tokio::fs::try_exists(&marker).await? {
            info!(epoch, "epoch marker already present, ignoring repeated commit");
            return Ok(());
        }

        // a hole would silently drop a partition's output from the epoch
        if tokens.has_gaps() {
            return Err(Error::Sink(format!(
                "cannot commit epoch {epoch}: {} of {} tokens missing",
                tokens.len() - tokens.filled_count(),
                tokens.len()
            )));
        }

        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        for token in tokens.iter().flatten() {
            let parsed: FileToken = serde_json::from_slice(token.payload())
                .map_err(|e| Error::Sink(format!("malformed file sink token: {e}")))?;
            let destination = part_path(&self.config.output_dir, epoch, parsed.partition_idx);
            match tokio::fs::rename(&parsed.staged_path, &destination).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    // a previous commit attempt may already have moved it
                    if tokio::fs::try_exists(&destination).await? {
                        debug!(
                            epoch,
                            partition_idx = parsed.partition_idx,
                            "part already published by an earlier attempt"
                        );
                    } else {
                        return Err(Error::Sink(format!(
                            "staged part for epoch {epoch} partition {} is gone: {e}",
                            parsed.partition_idx
                        )));
                    }
                }
                Err(e) => {
                    return Err(Error::Sink(format!(
                        "failed to publish part for epoch {epoch} partition {}: {e}",
                        parsed.partition_idx
                    )));
                }
            }
        }

        // the marker is the atomic visibility flip
        tokio::fs::write(&marker, epoch.to_string()).await?;
        info!(epoch, parts = tokens.filled_count(), "epoch committed");
        Ok(())
    }

    async fn abort(&mut self, epoch: Epoch, tokens: &TokenSlots) -> Result<()> {
        let marker = marker_path(&self.config.output_dir, epoch);
        if tokio::fs::try_exists(&marker).await? {
            return Err(Error::Sink(format!(
                "epoch {epoch} is already committed, refusing to remove its output"
            )));
        }

        for token in tokens.iter().flatten() {
            let parsed: FileToken = match serde_json::from_slice(token.payload()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    // best effort: keep cleaning the parts we can identify
                    warn!(epoch, "skipping malformed file sink token during abort: {e}");
                    continue;
                }
            };
            remove_if_present(&parsed.staged_path).await?;
            remove_if_present(&part_path(
                &self.config.output_dir,
                epoch,
                parsed.partition_idx,
            ))
            .await?;
        }
        info!(epoch, "epoch aborted");
        Ok(())
    }
}
