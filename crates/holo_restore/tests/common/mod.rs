//! Shared helpers for loader integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use holo_restore::restore::codec::LogChunk;
use holo_restore::restore::format::{self, BackupFileWriter};
use holo_restore::restore::{
    ApplierId, ApplierSink, BackupContainer, BackupFile, BackupSource, BatchId, CmdId,
    CoordinatorLink, FileKind, Loader, LoaderCommand, LoaderConfig, LoaderError, LoaderHandle,
    LoaderReport, LoaderState, RoutedBatch, Version, VersionedMutation,
};
use tokio::sync::Semaphore;

/// Timeout for waiting on loader reports.
pub const REPORT_TIMEOUT: Duration = Duration::from_secs(10);
pub const BACKUP_URL: &str = "mem://backup";
pub const BLOCK_SIZE: usize = 128;

struct MemoryStore {
    files: Mutex<HashMap<String, Bytes>>,
    reads: Mutex<HashMap<String, usize>>,
    held: Mutex<HashSet<String>>,
    gate: Semaphore,
    opens: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            files: Mutex::default(),
            reads: Mutex::default(),
            held: Mutex::default(),
            gate: Semaphore::new(0),
            opens: AtomicUsize::new(0),
        }
    }
}

/// In-memory backup source that counts reads per file.
///
/// Reads of "held" files block until `release` is called.
#[derive(Clone, Default)]
pub struct MemoryBackup {
    store: Arc<MemoryStore>,
}

impl MemoryBackup {
    pub fn put(&self, name: &str, data: Vec<u8>) {
        self.store
            .files
            .lock()
            .unwrap()
            .insert(name.to_string(), Bytes::from(data));
    }

    pub fn hold(&self, name: &str) {
        self.store.held.lock().unwrap().insert(name.to_string());
    }

    pub fn release(&self) {
        self.store.held.lock().unwrap().clear();
        self.store.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn reads(&self, name: &str) -> usize {
        self.store.reads.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn opens(&self) -> usize {
        self.store.opens.load(Ordering::SeqCst)
    }
}

struct MemoryContainer {
    url: String,
    store: Arc<MemoryStore>,
}

#[async_trait]
impl BackupContainer for MemoryContainer {
    fn url(&self) -> &str {
        &self.url
    }

    async fn read_range(&self, file: &str, offset: u64, len: usize) -> Result<Bytes, LoaderError> {
        *self
            .store
            .reads
            .lock()
            .unwrap()
            .entry(file.to_string())
            .or_default() += 1;
        let held = self.store.held.lock().unwrap().contains(file);
        if held {
            let permit = self.store.gate.acquire().await;
            drop(permit);
        }
        let data = self
            .store
            .files
            .lock()
            .unwrap()
            .get(file)
            .cloned()
            .ok_or_else(|| LoaderError::NotFound {
                file: file.to_string(),
            })?;
        let start = (offset as usize).min(data.len());
        let end = (start + len).min(data.len());
        Ok(data.slice(start..end))
    }
}

#[async_trait]
impl BackupSource for MemoryBackup {
    async fn open(&self, url: &str) -> Result<Arc<dyn BackupContainer>, LoaderError> {
        self.store.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryContainer {
            url: url.to_string(),
            store: self.store.clone(),
        }))
    }
}

/// Applier sink that records every message and can fail the first sends.
#[derive(Default)]
pub struct RecordingApplier {
    messages: Mutex<Vec<RoutedBatch>>,
    fail_next: AtomicUsize,
}

impl RecordingApplier {
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<RoutedBatch> {
        self.messages.lock().unwrap().clone()
    }

    /// Every mutation received by `applier`, flattened in delivery order.
    pub fn received(&self, applier: ApplierId) -> Vec<VersionedMutation> {
        self.messages()
            .into_iter()
            .filter(|m| m.applier == applier)
            .flat_map(|m| {
                m.entries.into_iter().flat_map(|(version, mutations)| {
                    mutations
                        .into_iter()
                        .map(move |mutation| VersionedMutation::new(version, mutation))
                })
            })
            .collect()
    }
}

#[async_trait]
impl ApplierSink for RecordingApplier {
    async fn send(&self, batch: RoutedBatch) -> anyhow::Result<()> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        anyhow::ensure!(!failing, "applier {} unavailable", batch.applier);
        self.messages.lock().unwrap().push(batch);
        Ok(())
    }
}

/// Coordinator link that records reports.
#[derive(Default)]
pub struct RecordingCoordinator {
    reports: Mutex<Vec<LoaderReport>>,
}

impl RecordingCoordinator {
    pub fn reports(&self) -> Vec<LoaderReport> {
        self.reports.lock().unwrap().clone()
    }

    /// Wait until a report matching `pred` shows up and return it.
    pub async fn wait_for<F>(&self, pred: F) -> anyhow::Result<LoaderReport>
    where
        F: Fn(&LoaderReport) -> bool,
    {
        let deadline = tokio::time::Instant::now() + REPORT_TIMEOUT;
        loop {
            if let Some(found) = self.reports().into_iter().find(|r| pred(r)) {
                return Ok(found);
            }
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for report; got {:?}",
                self.reports()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until `count` reports match `pred` and return them in order.
    pub async fn wait_for_count<F>(&self, pred: F, count: usize) -> anyhow::Result<Vec<LoaderReport>>
    where
        F: Fn(&LoaderReport) -> bool,
    {
        let deadline = tokio::time::Instant::now() + REPORT_TIMEOUT;
        loop {
            let found: Vec<LoaderReport> = self.reports().into_iter().filter(|r| pred(r)).collect();
            if found.len() >= count {
                return Ok(found);
            }
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} reports; got {:?}",
                self.reports()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl CoordinatorLink for RecordingCoordinator {
    async fn report(&self, report: LoaderReport) -> anyhow::Result<()> {
        self.reports.lock().unwrap().push(report);
        Ok(())
    }
}

/// A running loader wired to in-memory collaborators.
pub struct Harness {
    pub backup: MemoryBackup,
    pub appliers: Arc<RecordingApplier>,
    pub coordinator: Arc<RecordingCoordinator>,
    handle: LoaderHandle,
}

impl Harness {
    pub fn start() -> Self {
        Self::start_with(LoaderConfig {
            max_inflight_fetches: 4,
            send_batch_max_bytes: 256,
        })
    }

    pub fn start_with(cfg: LoaderConfig) -> Self {
        let backup = MemoryBackup::default();
        let appliers = Arc::new(RecordingApplier::default());
        let coordinator = Arc::new(RecordingCoordinator::default());
        let loader = Loader::new(
            LoaderState::new(1, 0),
            Arc::new(backup.clone()),
            appliers.clone(),
            coordinator.clone(),
            cfg,
        );
        Self {
            backup,
            appliers,
            coordinator,
            handle: loader.spawn(16),
        }
    }

    pub async fn send(&self, cmd: LoaderCommand) -> anyhow::Result<()> {
        self.handle.send(cmd).await
    }

    pub async fn shutdown(self) -> anyhow::Result<LoaderState> {
        self.handle.shutdown().await
    }
}

pub fn range_file(
    backup: &MemoryBackup,
    name: &str,
    version: Version,
    rows: &[(Vec<u8>, Vec<u8>)],
) -> BackupFile {
    let data = format::build_range_file(version, rows, BLOCK_SIZE).expect("range file");
    let file = BackupFile {
        name: name.to_string(),
        kind: FileKind::Range { version },
        size: data.len() as u64,
        block_size: BLOCK_SIZE as u64,
    };
    backup.put(name, data);
    file
}

pub fn log_file(
    backup: &MemoryBackup,
    name: &str,
    begin_version: Version,
    end_version: Version,
    payloads: &[(Vec<u8>, Vec<VersionedMutation>)],
) -> BackupFile {
    let data = format::build_log_file(begin_version, end_version, payloads, 32, BLOCK_SIZE)
        .expect("log file");
    let file = BackupFile {
        name: name.to_string(),
        kind: FileKind::Log {
            begin_version,
            end_version,
        },
        size: data.len() as u64,
        block_size: BLOCK_SIZE as u64,
    };
    backup.put(name, data);
    file
}

/// Log file holding exactly `chunks`, in the given order.
pub fn chunk_file(
    backup: &MemoryBackup,
    name: &str,
    begin_version: Version,
    end_version: Version,
    chunks: &[LogChunk],
) -> BackupFile {
    let kind = FileKind::Log {
        begin_version,
        end_version,
    };
    let mut writer = BackupFileWriter::new(kind, BLOCK_SIZE);
    for chunk in chunks {
        writer.add_chunk(chunk).expect("chunk fits a block");
    }
    let data = writer.finish();
    let file = BackupFile {
        name: name.to_string(),
        kind,
        size: data.len() as u64,
        block_size: BLOCK_SIZE as u64,
    };
    backup.put(name, data);
    file
}

pub fn rows(prefix: &str, count: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..count)
        .map(|i| (format!("{prefix}{i:02}").into_bytes(), format!("v{i}").into_bytes()))
        .collect()
}

pub fn install(batch_id: BatchId, boundaries: &[&str], appliers: &[ApplierId]) -> LoaderCommand {
    LoaderCommand::InstallPartition {
        batch_id,
        boundaries: boundaries.iter().map(|b| b.as_bytes().to_vec()).collect(),
        appliers: appliers.to_vec(),
    }
}

pub fn load(batch_id: BatchId, seq: u64, file: &BackupFile) -> LoaderCommand {
    LoaderCommand::LoadFile {
        batch_id,
        cmd_id: CmdId::new(1, seq),
        backup_url: BACKUP_URL.to_string(),
        file: file.clone(),
    }
}

pub fn is_loaded(report: &LoaderReport, name: &str, want_duplicate: bool) -> bool {
    matches!(report, LoaderReport::FileLoaded { file, duplicate, .. }
        if file == name && *duplicate == want_duplicate)
}

pub fn is_failed(report: &LoaderReport, name: &str) -> bool {
    matches!(report, LoaderReport::FileFailed { file, .. } if file == name)
}
