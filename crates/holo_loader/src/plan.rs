//! Restore plans and the local coordinator that replays them.
//!
//! A plan lists the appliers and, per batch, the sample files and the files
//! to load. The coordinator runs every batch through the loader: sampling,
//! partition install (proposed boundaries assigned to the plan's appliers in
//! order), file loads with retry of retryable failures, then finish.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use holo_restore::restore::{
    ApplierId, BackupFile, BatchId, CmdId, CoordinatorLink, ErrorKind, FileKind, LoaderCommand,
    LoaderHandle, LoaderReport, WorkloadCounters,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::fs_backup::FsBackupSource;

#[derive(Clone, Debug, Deserialize)]
pub struct RestorePlan {
    pub backup_url: String,
    pub appliers: Vec<ApplierId>,
    pub batches: Vec<PlanBatch>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PlanBatch {
    pub batch_id: BatchId,
    #[serde(default)]
    pub sample_files: Vec<PlanFile>,
    pub files: Vec<PlanFile>,
}

/// A backup file as written in a plan; `size` is read from the backup when
/// omitted.
#[derive(Clone, Debug, Deserialize)]
pub struct PlanFile {
    pub name: String,
    pub kind: FileKind,
    pub block_size: u64,
    #[serde(default)]
    pub size: Option<u64>,
}

impl RestorePlan {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read(path).with_context(|| format!("read plan {}", path.display()))?;
        let plan: RestorePlan = serde_json::from_slice(&raw)
            .with_context(|| format!("parse plan {}", path.display()))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.appliers.is_empty(), "plan has no appliers");
        anyhow::ensure!(
            self.batches
                .windows(2)
                .all(|pair| pair[0].batch_id < pair[1].batch_id),
            "plan batch ids must strictly increase"
        );
        for batch in &self.batches {
            for file in batch.sample_files.iter().chain(&batch.files) {
                anyhow::ensure!(
                    file.block_size > 0,
                    "file {} in batch {} has zero block size",
                    file.name,
                    batch.batch_id
                );
            }
        }
        Ok(())
    }
}

async fn resolve_files(
    source: &FsBackupSource,
    url: &str,
    files: &[PlanFile],
) -> anyhow::Result<Vec<BackupFile>> {
    let mut out = Vec::with_capacity(files.len());
    for file in files {
        let size = match file.size {
            Some(size) => size,
            None => source
                .file_size(url, &file.name)
                .await
                .with_context(|| format!("stat backup file {}", file.name))?,
        };
        out.push(BackupFile {
            name: file.name.clone(),
            kind: file.kind,
            size,
            block_size: file.block_size,
        });
    }
    Ok(out)
}

/// Coordinator link forwarding reports to the replay driver.
pub struct ChannelCoordinator {
    tx: mpsc::UnboundedSender<LoaderReport>,
}

impl ChannelCoordinator {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LoaderReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CoordinatorLink for ChannelCoordinator {
    async fn report(&self, report: LoaderReport) -> anyhow::Result<()> {
        self.tx
            .send(report)
            .map_err(|_| anyhow::anyhow!("replay driver stopped"))
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub boundaries: Vec<String>,
    pub files_loaded: u64,
    pub files_failed: Vec<FailedFile>,
    pub workload: WorkloadCounters,
}

#[derive(Clone, Debug, Serialize)]
pub struct FailedFile {
    pub file: String,
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ReplaySummary {
    pub batches: Vec<BatchSummary>,
}

impl ReplaySummary {
    pub fn failed_files(&self) -> usize {
        self.batches.iter().map(|b| b.files_failed.len()).sum()
    }
}

/// Drives a loader through a plan.
pub struct ReplayDriver<'a> {
    pub plan: &'a RestorePlan,
    pub backup_url: &'a str,
    pub source: FsBackupSource,
    pub report_timeout: Duration,
    pub max_attempts: u32,
    next_seq: u64,
}

impl<'a> ReplayDriver<'a> {
    pub fn new(plan: &'a RestorePlan, backup_url: &'a str, report_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            plan,
            backup_url,
            source: FsBackupSource,
            report_timeout,
            max_attempts: max_attempts.max(1),
            next_seq: 0,
        }
    }

    fn next_cmd(&mut self) -> CmdId {
        self.next_seq += 1;
        CmdId::new(1, self.next_seq)
    }

    pub async fn run(
        &mut self,
        loader: &LoaderHandle,
        reports: &mut mpsc::UnboundedReceiver<LoaderReport>,
    ) -> anyhow::Result<ReplaySummary> {
        let plan = self.plan;
        let mut summary = ReplaySummary::default();
        for batch in &plan.batches {
            let result = self.run_batch(batch, loader, reports).await?;
            summary.batches.push(result);
        }
        Ok(summary)
    }

    async fn run_batch(
        &mut self,
        batch: &PlanBatch,
        loader: &LoaderHandle,
        reports: &mut mpsc::UnboundedReceiver<LoaderReport>,
    ) -> anyhow::Result<BatchSummary> {
        let batch_id = batch.batch_id;
        let url = self.backup_url;
        let sample_files = resolve_files(&self.source, url, &batch.sample_files).await?;
        let files = resolve_files(&self.source, url, &batch.files).await?;
        let mut out = BatchSummary {
            batch_id,
            ..BatchSummary::default()
        };

        loader
            .send(LoaderCommand::StartSamplingPhase {
                batch_id,
                backup_url: url.to_string(),
                files: sample_files,
                applier_count: self.plan.appliers.len(),
            })
            .await?;
        let boundaries = loop {
            match self.next_report(reports).await? {
                LoaderReport::SamplingDone {
                    batch_id: done,
                    boundaries,
                    sampled_mutations,
                    ..
                } if done == batch_id => {
                    tracing::info!(batch_id, sampled_mutations, "sampling finished");
                    break boundaries;
                }
                other => self.unexpected(batch_id, other)?,
            }
        };
        out.boundaries = boundaries
            .iter()
            .map(|b| holo_restore::restore::codec::display_key(b))
            .collect();
        let appliers = (0..boundaries.len())
            .map(|idx| self.plan.appliers[idx % self.plan.appliers.len()])
            .collect();
        loader
            .send(LoaderCommand::InstallPartition {
                batch_id,
                boundaries,
                appliers,
            })
            .await?;

        // Issue every load, then retry retryable failures by redelivery.
        let mut attempts: BTreeMap<String, (BackupFile, u32)> = BTreeMap::new();
        for file in files {
            let cmd_id = self.next_cmd();
            attempts.insert(file.name.clone(), (file.clone(), 1));
            loader.send(self.load(batch_id, cmd_id, file)).await?;
        }
        let mut pending = attempts.len();
        while pending > 0 {
            match self.next_report(reports).await? {
                LoaderReport::FileLoaded {
                    batch_id: done,
                    file,
                    ..
                } if done == batch_id && attempts.contains_key(&file) => {
                    out.files_loaded += 1;
                    pending -= 1;
                }
                LoaderReport::FileFailed {
                    batch_id: failed,
                    file,
                    kind,
                    message,
                    ..
                } if failed == batch_id && attempts.contains_key(&file) => {
                    let Some((backup_file, tries)) = attempts.get_mut(&file) else {
                        continue;
                    };
                    if kind.is_retryable() && *tries < self.max_attempts {
                        *tries += 1;
                        tracing::warn!(batch_id, file = %file, attempt = *tries, %message, "retrying file load");
                        let backup_file = backup_file.clone();
                        let cmd_id = self.next_cmd();
                        loader.send(self.load(batch_id, cmd_id, backup_file)).await?;
                        continue;
                    }
                    out.files_failed.push(FailedFile {
                        file,
                        kind,
                        message,
                        attempts: *tries,
                    });
                    pending -= 1;
                }
                other => self.unexpected(batch_id, other)?,
            }
        }

        loader.send(LoaderCommand::FinishBatch { batch_id }).await?;
        loop {
            match self.next_report(reports).await? {
                LoaderReport::BatchComplete {
                    batch_id: done,
                    workload,
                    ..
                } if done == batch_id => {
                    out.workload = workload;
                    break;
                }
                other => self.unexpected(batch_id, other)?,
            }
        }
        Ok(out)
    }

    fn load(&self, batch_id: BatchId, cmd_id: CmdId, file: BackupFile) -> LoaderCommand {
        LoaderCommand::LoadFile {
            batch_id,
            cmd_id,
            backup_url: self.backup_url.to_string(),
            file,
        }
    }

    async fn next_report(
        &self,
        reports: &mut mpsc::UnboundedReceiver<LoaderReport>,
    ) -> anyhow::Result<LoaderReport> {
        tokio::time::timeout(self.report_timeout, reports.recv())
            .await
            .context("timed out waiting for loader report")?
            .context("loader report channel closed")
    }

    /// Tolerate informational reports; fail on anything fatal.
    fn unexpected(&self, batch_id: BatchId, report: LoaderReport) -> anyhow::Result<()> {
        match report {
            LoaderReport::Fatal { kind, message, .. } => {
                anyhow::bail!("batch {batch_id} failed ({kind:?}): {message}")
            }
            LoaderReport::FileFailed {
                cmd_id: None,
                file,
                message,
                ..
            } => {
                tracing::warn!(batch_id, file = %file, %message, "sample file skipped");
                Ok(())
            }
            other => {
                tracing::debug!(batch_id, report = ?other, "ignoring report");
                Ok(())
            }
        }
    }
}
