//! Loader core loop.
//!
//! A single task owns `LoaderState` and processes coordinator commands one at
//! a time. Backup reads run as futures in a bounded `FuturesUnordered`; their
//! results come back through the same loop, so the reassembler, sampler and
//! router are only ever touched from here.
//!
//! Batch lifecycle: `Idle → Sampling → PartitionInstalled → Loading →
//! Draining → Idle`. Commands for an older batch are ignored as stale.
//! Commands for a newer batch are held back while the current one is active;
//! once a held command opens the newer batch, the current batch is drained
//! (outstanding reads complete and are discarded), reported abandoned and
//! reset before the held commands replay.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use futures_util::future::{join_all, BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::LoaderError;
use super::format;
use super::ledger::LedgerDecision;
use super::reassembly::{MutationReassembler, ReassemblyStage};
use super::state::{BatchPhase, LoaderState};
use super::types::{
    ApplierId, ApplierSink, BackupContainer, BackupFile, BackupSource, BatchId, CmdId,
    CoordinatorLink, FileKind, LoaderCommand, LoaderReport, RoutedBatch, VersionedMutation,
};

/// Loop tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct LoaderConfig {
    /// Backup files read concurrently.
    pub max_inflight_fetches: usize,
    /// Soft cap on the encoded size of one applier message.
    pub send_batch_max_bytes: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_inflight_fetches: 8,
            send_batch_max_bytes: 1024 * 1024,
        }
    }
}

impl LoaderConfig {
    pub fn normalized(self) -> Self {
        Self {
            max_inflight_fetches: self.max_inflight_fetches.max(1),
            send_batch_max_bytes: self.send_batch_max_bytes.max(1),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum FetchPurpose {
    Sample,
    Load { cmd_id: CmdId },
}

#[derive(Debug)]
struct FetchJob {
    batch_id: BatchId,
    file: BackupFile,
    purpose: FetchPurpose,
}

struct FetchOutcome {
    job: FetchJob,
    result: Result<Vec<Bytes>, LoaderError>,
}

#[derive(Debug)]
struct SamplingProgress {
    remaining: usize,
    applier_count: usize,
}

enum LoopEvent {
    Command(Option<LoaderCommand>),
    Fetched(FetchOutcome),
}

pub struct Loader {
    state: LoaderState,
    source: Arc<dyn BackupSource>,
    appliers: Arc<dyn ApplierSink>,
    coordinator: Arc<dyn CoordinatorLink>,
    cfg: LoaderConfig,
    fetches: FuturesUnordered<BoxFuture<'static, FetchOutcome>>,
    /// Accepted reads waiting for a fetch slot.
    waiting: VecDeque<(FetchJob, Arc<dyn BackupContainer>)>,
    /// Commands for a newer batch held back until the current one ends.
    deferred: VecDeque<LoaderCommand>,
    /// Deferred commands released for processing.
    replay: VecDeque<LoaderCommand>,
    sampling: Option<SamplingProgress>,
    /// `SamplingDone` of the current batch, kept for redelivered
    /// `StartSamplingPhase` commands.
    sampled: Option<LoaderReport>,
    /// Set while the current batch drains before a newer one takes over.
    superseded_by: Option<BatchId>,
    /// Set while the current batch drains after `FinishBatch`.
    finishing: bool,
    /// Last batch that completed; later commands for it are stale.
    retired: Option<BatchId>,
}

/// Handle to a spawned loader task.
pub struct LoaderHandle {
    tx: mpsc::Sender<LoaderCommand>,
    task: JoinHandle<LoaderState>,
}

impl LoaderHandle {
    pub fn sender(&self) -> mpsc::Sender<LoaderCommand> {
        self.tx.clone()
    }

    pub async fn send(&self, cmd: LoaderCommand) -> anyhow::Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("loader task stopped"))
    }

    /// Close the command channel and wait for outstanding work.
    pub async fn shutdown(self) -> anyhow::Result<LoaderState> {
        drop(self.tx);
        self.task.await.context("loader task failed")
    }
}

impl Loader {
    pub fn new(
        state: LoaderState,
        source: Arc<dyn BackupSource>,
        appliers: Arc<dyn ApplierSink>,
        coordinator: Arc<dyn CoordinatorLink>,
        cfg: LoaderConfig,
    ) -> Self {
        Self {
            state,
            source,
            appliers,
            coordinator,
            cfg: cfg.normalized(),
            fetches: FuturesUnordered::new(),
            waiting: VecDeque::new(),
            deferred: VecDeque::new(),
            replay: VecDeque::new(),
            sampling: None,
            sampled: None,
            superseded_by: None,
            finishing: false,
            retired: None,
        }
    }

    /// Run the loop on a new task.
    pub fn spawn(self, queue_depth: usize) -> LoaderHandle {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let task = tokio::spawn(self.run(rx));
        LoaderHandle { tx, task }
    }

    /// Process commands until the channel closes and outstanding reads finish.
    pub async fn run(mut self, mut rx: mpsc::Receiver<LoaderCommand>) -> LoaderState {
        tracing::info!(
            node = %self.state.describe_node(),
            max_inflight_fetches = self.cfg.max_inflight_fetches,
            send_batch_max_bytes = self.cfg.send_batch_max_bytes,
            "loader started"
        );
        let mut commands_open = true;
        loop {
            if !commands_open && self.fetches.is_empty() {
                break;
            }
            let busy = !self.fetches.is_empty();
            let event = tokio::select! {
                cmd = rx.recv(), if commands_open => LoopEvent::Command(cmd),
                Some(outcome) = self.fetches.next(), if busy => LoopEvent::Fetched(outcome),
                else => break,
            };
            match event {
                LoopEvent::Command(Some(cmd)) => self.handle_command(cmd).await,
                LoopEvent::Command(None) => commands_open = false,
                LoopEvent::Fetched(outcome) => self.handle_fetched(outcome).await,
            }
            self.settle().await;
        }
        tracing::info!(
            node = %self.state.describe_node(),
            batches_completed = self.state.cumulative.batches_completed,
            files_loaded = self.state.cumulative.files_loaded,
            "loader stopped"
        );
        self.state
    }

    /// Start queued reads, finish a draining batch once nothing is
    /// outstanding, and replay released commands.
    async fn settle(&mut self) {
        loop {
            while self.fetches.len() < self.cfg.max_inflight_fetches {
                let Some((job, container)) = self.waiting.pop_front() else {
                    break;
                };
                self.launch(job, container);
            }
            if self.fetches.is_empty() && self.waiting.is_empty() {
                if let Some(next) = self.superseded_by.take() {
                    self.complete_abandon(next).await;
                } else if self.finishing {
                    self.complete_finish().await;
                }
            }
            let Some(cmd) = self.replay.pop_front() else {
                break;
            };
            self.handle_command(cmd).await;
        }
    }

    async fn handle_command(&mut self, cmd: LoaderCommand) {
        let batch_id = cmd.batch_id();
        let current = self.state.batch_id();
        tracing::debug!(cmd = cmd.name(), batch_id, current, "loader command");

        let retired = self.retired == Some(current);
        if batch_id < current || (batch_id == current && retired) {
            self.ignore_stale(batch_id).await;
            return;
        }
        if batch_id > current {
            if self.state.phase() != BatchPhase::Idle {
                self.defer(cmd);
                return;
            }
            self.begin_batch(batch_id);
        }
        if self.finishing || self.superseded_by.is_some() {
            self.ignore_stale(batch_id).await;
            return;
        }

        match cmd {
            LoaderCommand::StartSamplingPhase {
                batch_id,
                backup_url,
                files,
                applier_count,
            } => {
                self.start_sampling(batch_id, &backup_url, files, applier_count)
                    .await
            }
            LoaderCommand::InstallPartition {
                batch_id,
                boundaries,
                appliers,
            } => self.install_partition(batch_id, boundaries, appliers).await,
            LoaderCommand::LoadFile {
                batch_id,
                cmd_id,
                backup_url,
                file,
            } => self.accept_load(batch_id, cmd_id, &backup_url, file).await,
            LoaderCommand::FinishBatch { batch_id } => {
                tracing::info!(batch_id, in_flight = self.fetches.len(), "finishing batch");
                self.finishing = true;
                self.state.set_phase(BatchPhase::Draining);
            }
        }
    }

    async fn ignore_stale(&mut self, batch_id: BatchId) {
        let current = self.state.batch_id();
        tracing::debug!(batch_id, current, "ignoring stale command");
        self.report(LoaderReport::StaleIgnored {
            node_id: self.state.node_id(),
            batch_id,
            current,
        })
        .await;
    }

    fn defer(&mut self, cmd: LoaderCommand) {
        let next = cmd.batch_id();
        let starts = cmd.starts_batch();
        self.deferred.push_back(cmd);
        if !starts || self.superseded_by.is_some() || self.finishing {
            return;
        }

        // A newer batch is starting: stop taking work for the current one.
        let dropped = self.waiting.len();
        self.waiting.clear();
        self.superseded_by = Some(next);
        self.state.set_phase(BatchPhase::Draining);
        tracing::info!(
            batch_id = self.state.batch_id(),
            superseded_by = next,
            in_flight = self.fetches.len(),
            dropped,
            "abandoning batch"
        );
    }

    fn begin_batch(&mut self, batch_id: BatchId) {
        self.state.reset_per_version_batch(batch_id);
        self.sampling = None;
        self.sampled = None;
        self.retired = None;
        tracing::info!(node = %self.state.describe_node(), batch_id, "batch opened");
    }

    async fn complete_abandon(&mut self, next: BatchId) {
        let batch_id = self.state.batch_id();
        self.state.cumulative.batches_abandoned += 1;
        self.report(LoaderReport::BatchAbandoned {
            node_id: self.state.node_id(),
            batch_id,
            superseded_by: next,
        })
        .await;
        self.begin_batch(next);
        self.replay.extend(self.deferred.drain(..));
    }

    async fn complete_finish(&mut self) {
        self.finishing = false;
        let batch_id = self.state.batch_id();
        let workload = self.state.batch().workload;
        self.state.cumulative.batches_completed += 1;
        tracing::info!(
            batch_id,
            files = workload.files,
            mutations = workload.mutations,
            bytes = workload.bytes,
            "batch complete"
        );
        self.report(LoaderReport::BatchComplete {
            node_id: self.state.node_id(),
            batch_id,
            workload,
        })
        .await;
        self.state.reset_per_version_batch(batch_id);
        self.sampling = None;
        self.sampled = None;
        self.retired = Some(batch_id);
        self.replay.extend(self.deferred.drain(..));
    }

    async fn start_sampling(
        &mut self,
        batch_id: BatchId,
        backup_url: &str,
        files: Vec<BackupFile>,
        applier_count: usize,
    ) {
        if let Some(report) = self.sampled.clone() {
            tracing::debug!(batch_id, "sampling redelivered; resending result");
            self.report(report).await;
            return;
        }
        if self.sampling.is_some() {
            tracing::debug!(batch_id, "sampling already running");
            return;
        }
        if self.state.phase() != BatchPhase::Idle {
            // Partition was installed without sampling; nothing to sample for.
            tracing::warn!(
                batch_id,
                phase = self.state.phase().as_str(),
                "sampling requested after partition install; ignoring"
            );
            self.ignore_stale(batch_id).await;
            return;
        }

        let container = match self
            .state
            .init_backup_container(self.source.as_ref(), backup_url)
            .await
        {
            Ok(container) => container,
            Err(err) => {
                self.report_fatal(batch_id, &err).await;
                return;
            }
        };

        tracing::info!(batch_id, files = files.len(), applier_count, "sampling started");
        self.state.set_phase(BatchPhase::Sampling);
        self.sampling = Some(SamplingProgress {
            remaining: files.len(),
            applier_count,
        });
        for file in files {
            let job = FetchJob {
                batch_id,
                file,
                purpose: FetchPurpose::Sample,
            };
            self.waiting.push_back((job, container.clone()));
        }
        self.maybe_finish_sampling().await;
    }

    async fn maybe_finish_sampling(&mut self) {
        let Some(progress) = &self.sampling else {
            return;
        };
        if progress.remaining > 0 || self.sampled.is_some() {
            return;
        }
        let applier_count = progress.applier_count;
        let batch_id = self.state.batch_id();
        let sampler = &self.state.batch().sampler;
        let boundaries = match sampler.propose_boundaries(applier_count) {
            Ok(boundaries) => boundaries,
            Err(err) => {
                self.report_fatal(batch_id, &err).await;
                return;
            }
        };
        let report = LoaderReport::SamplingDone {
            node_id: self.state.node_id(),
            batch_id,
            sampled_mutations: sampler.sampled_mutations(),
            key_counts: sampler.key_counts(),
            boundaries,
        };
        tracing::info!(
            batch_id,
            sampled_mutations = sampler.sampled_mutations(),
            distinct_keys = sampler.distinct_keys(),
            "sampling done"
        );
        self.sampled = Some(report.clone());
        self.report(report).await;
    }

    async fn install_partition(
        &mut self,
        batch_id: BatchId,
        boundaries: Vec<Vec<u8>>,
        appliers: Vec<ApplierId>,
    ) {
        let batch = self.state.batch_mut();
        if let Err(err) = batch.router.install(boundaries, appliers) {
            tracing::warn!(batch_id, error = %err, "partition install rejected");
            self.report_fatal(batch_id, &err).await;
            return;
        }
        batch.sampler.clear();
        batch.router.describe();
        let appliers = batch.router.list_assigned_appliers().len();
        // Queued sample reads are dropped, outstanding ones discarded on arrival.
        self.sampling = None;
        self.waiting
            .retain(|(job, _)| !matches!(job.purpose, FetchPurpose::Sample));
        if self.state.phase() != BatchPhase::Loading {
            self.state.set_phase(BatchPhase::PartitionInstalled);
        }
        tracing::info!(batch_id, appliers, "partition installed");
    }

    async fn accept_load(&mut self, batch_id: BatchId, cmd_id: CmdId, backup_url: &str, file: BackupFile) {
        if !self.state.batch().router.is_installed() {
            let err = LoaderError::NoPartition { batch_id };
            self.report_file_failed(batch_id, Some(cmd_id), &file.name, &err).await;
            return;
        }

        match self.state.batch_mut().ledger.begin_or_skip(cmd_id, &file.name) {
            LedgerDecision::AlreadyDone => {
                tracing::debug!(batch_id, file = %file.name, cmd = %cmd_id, "file already loaded");
                self.report(LoaderReport::FileLoaded {
                    node_id: self.state.node_id(),
                    batch_id,
                    cmd_id,
                    file: file.name,
                    mutations: 0,
                    bytes: 0,
                    duplicate: true,
                })
                .await;
                return;
            }
            LedgerDecision::InProgress { owner } => {
                tracing::debug!(
                    batch_id,
                    file = %file.name,
                    cmd = %cmd_id,
                    owner = %owner,
                    "file load already running"
                );
                return;
            }
            LedgerDecision::Proceed => {}
        }

        let container = match self
            .state
            .init_backup_container(self.source.as_ref(), backup_url)
            .await
        {
            Ok(container) => container,
            Err(err) => {
                self.fail_load(batch_id, Some(cmd_id), &file.name, &err).await;
                return;
            }
        };
        self.state.set_phase(BatchPhase::Loading);
        let job = FetchJob {
            batch_id,
            file,
            purpose: FetchPurpose::Load { cmd_id },
        };
        self.waiting.push_back((job, container));
    }

    fn launch(&mut self, job: FetchJob, container: Arc<dyn BackupContainer>) {
        self.state.io_started();
        tracing::debug!(batch_id = job.batch_id, file = %job.file.name, "fetch started");
        self.fetches.push(
            async move {
                let result = fetch_blocks(container.as_ref(), &job.file).await;
                FetchOutcome { job, result }
            }
            .boxed(),
        );
    }

    async fn handle_fetched(&mut self, outcome: FetchOutcome) {
        self.state.io_finished();
        let FetchOutcome { job, result } = outcome;
        if job.batch_id != self.state.batch_id() || self.superseded_by.is_some() {
            tracing::debug!(
                batch_id = job.batch_id,
                file = %job.file.name,
                "discarding read for retired batch"
            );
            return;
        }
        match job.purpose {
            FetchPurpose::Sample => self.complete_sample(job, result).await,
            FetchPurpose::Load { cmd_id } => self.complete_load(job, cmd_id, result).await,
        }
    }

    async fn complete_sample(&mut self, job: FetchJob, result: Result<Vec<Bytes>, LoaderError>) {
        if self.sampling.is_none() || self.sampled.is_some() {
            return;
        }
        // Sample files are read on their own; partial payloads are dropped.
        let reassembler = MutationReassembler::new();
        let mut stage = ReassemblyStage::default();
        match result.and_then(|blocks| decode_blocks(&job.file, &blocks, &reassembler, &mut stage)) {
            Ok((mutations, _)) => {
                let sampler = &mut self.state.batch_mut().sampler;
                for m in &mutations {
                    sampler.observe(&m.mutation);
                }
                tracing::debug!(
                    batch_id = job.batch_id,
                    file = %job.file.name,
                    mutations = mutations.len(),
                    "sample file read"
                );
            }
            Err(err) => {
                self.report_file_failed(job.batch_id, None, &job.file.name, &err).await;
            }
        }
        if let Some(progress) = self.sampling.as_mut() {
            progress.remaining = progress.remaining.saturating_sub(1);
        }
        self.maybe_finish_sampling().await;
    }

    async fn complete_load(
        &mut self,
        job: FetchJob,
        cmd_id: CmdId,
        result: Result<Vec<Bytes>, LoaderError>,
    ) {
        let batch_id = job.batch_id;
        let file = job.file.name.as_str();
        // Reassembly changes stay staged until every message is delivered.
        let mut stage = ReassemblyStage::default();
        let decoded = result.and_then(|blocks| {
            decode_blocks(&job.file, &blocks, &self.state.batch().reassembler, &mut stage)
        });
        let (mutations, bytes) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                self.fail_load(batch_id, Some(cmd_id), file, &err).await;
                return;
            }
        };

        let routed = match self.state.batch_mut().router.route(mutations) {
            Ok(routed) => routed,
            Err(err) => {
                self.fail_load(batch_id, Some(cmd_id), file, &err).await;
                return;
            }
        };
        let count = routed.mutation_count;
        let messages = routed.into_batches(
            self.state.node_id(),
            batch_id,
            file,
            self.cfg.send_batch_max_bytes,
        );
        let sends: usize = messages.values().map(Vec::len).sum();
        if let Err(err) = self.send_to_appliers(messages).await {
            self.fail_load(batch_id, Some(cmd_id), file, &err).await;
            return;
        }

        let batch = self.state.batch_mut();
        batch.workload.bytes += bytes;
        batch.workload.files += 1;
        batch.workload.mutations += count;
        batch.workload.sends += sends as u64;
        batch.reassembler.commit(stage);
        batch.ledger.mark_done(file);
        self.state.cumulative.files_loaded += 1;
        self.state.cumulative.mutations_routed += count;
        self.state.cumulative.bytes_read += bytes;
        tracing::info!(
            batch_id,
            file,
            cmd = %cmd_id,
            mutations = count,
            bytes,
            sends,
            "file loaded"
        );
        self.report(LoaderReport::FileLoaded {
            node_id: self.state.node_id(),
            batch_id,
            cmd_id,
            file: file.to_string(),
            mutations: count,
            bytes,
            duplicate: false,
        })
        .await;
    }

    /// Deliver messages: sequential per applier, appliers in parallel.
    async fn send_to_appliers(
        &mut self,
        messages: BTreeMap<ApplierId, Vec<RoutedBatch>>,
    ) -> Result<(), LoaderError> {
        if messages.is_empty() {
            return Ok(());
        }
        self.state.io_started();
        let sends = messages.into_iter().map(|(applier, batches)| {
            let sink = self.appliers.clone();
            async move {
                for batch in batches {
                    let mutations = batch.mutation_count();
                    sink.send(batch)
                        .await
                        .map_err(|err| LoaderError::ApplierSend {
                            applier,
                            reason: format!("{err:#}"),
                        })?;
                    tracing::trace!(applier, mutations, "applier message sent");
                }
                Ok::<(), LoaderError>(())
            }
        });
        let results = join_all(sends).await;
        self.state.io_finished();
        results.into_iter().collect()
    }

    async fn fail_load(&mut self, batch_id: BatchId, cmd_id: Option<CmdId>, file: &str, err: &LoaderError) {
        self.state.batch_mut().ledger.abandon(file);
        self.state.cumulative.files_failed += 1;
        self.report_file_failed(batch_id, cmd_id, file, err).await;
    }

    async fn report_file_failed(
        &mut self,
        batch_id: BatchId,
        cmd_id: Option<CmdId>,
        file: &str,
        err: &LoaderError,
    ) {
        tracing::warn!(
            batch_id,
            file,
            cmd = ?cmd_id,
            retryable = err.is_retryable(),
            error = %err,
            "file load failed"
        );
        self.report(LoaderReport::FileFailed {
            node_id: self.state.node_id(),
            batch_id,
            cmd_id,
            file: file.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        })
        .await;
    }

    async fn report_fatal(&mut self, batch_id: BatchId, err: &LoaderError) {
        tracing::error!(batch_id, error = %err, "batch failed");
        self.report(LoaderReport::Fatal {
            node_id: self.state.node_id(),
            batch_id,
            kind: err.kind(),
            message: err.to_string(),
        })
        .await;
    }

    // Takes `&mut self` so the loop future stays `Send`: `fetches` is not `Sync`.
    async fn report(&mut self, report: LoaderReport) {
        if let Err(err) = self.coordinator.report(report).await {
            tracing::warn!(error = ?err, "coordinator report failed");
        }
    }
}

/// Read every block of `file`.
async fn fetch_blocks(container: &dyn BackupContainer, file: &BackupFile) -> Result<Vec<Bytes>, LoaderError> {
    let mut blocks = Vec::new();
    for (offset, len) in file.blocks() {
        let data = container.read_range(&file.name, offset, len).await?;
        if data.len() != len {
            return Err(LoaderError::corrupt(
                &file.name,
                format!("short read at offset {offset}: expected {len} bytes, got {}", data.len()),
            ));
        }
        blocks.push(data);
    }
    Ok(blocks)
}

/// Decode fetched blocks into mutations; log parts are staged over
/// `reassembler`.
///
/// Returns the completed mutations in file order and the bytes processed.
fn decode_blocks(
    file: &BackupFile,
    blocks: &[Bytes],
    reassembler: &MutationReassembler,
    stage: &mut ReassemblyStage,
) -> Result<(Vec<VersionedMutation>, u64), LoaderError> {
    let mut out = Vec::new();
    let mut bytes = 0u64;
    for block in blocks {
        bytes += block.len() as u64;
        match file.kind {
            FileKind::Range { version } => {
                out.extend(format::parse_range_block(&file.name, block, version)?);
            }
            FileKind::Log { .. } => {
                for chunk in format::parse_log_block(&file.name, block)? {
                    let completed = reassembler
                        .ingest_staged(
                            stage,
                            &chunk.batch_log_id,
                            chunk.part,
                            chunk.total_len as usize,
                            &chunk.data,
                        )
                        .map_err(|err| err.into_loader_error(&file.name))?;
                    if let Some(mutations) = completed {
                        out.extend(mutations);
                    }
                }
            }
        }
    }
    Ok((out, bytes))
}
