//! Shared types for the restore loader.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the batch components, the control loop, and the process wiring in
//! `holo_loader` (backup source, applier sink, coordinator link).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::{ErrorKind, LoaderError};

/// Log position of a mutation. Mutations are ordered by version, then by
/// their position inside the version.
pub type Version = u64;
/// Identifier of one restore batch (version batch).
pub type BatchId = u64;
/// Stable identity of a loader process.
pub type NodeId = u64;
/// Opaque identity of a downstream applier worker.
pub type ApplierId = u64;

/// Command identifier issued by the coordinator.
///
/// `epoch` changes when the coordinator restarts, `seq` increases per command
/// within an epoch, so a retransmission carries the same id as the original.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CmdId {
    pub epoch: u64,
    pub seq: u64,
}

impl CmdId {
    pub const fn new(epoch: u64, seq: u64) -> Self {
        Self { epoch, seq }
    }
}

impl fmt::Display for CmdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.epoch, self.seq)
    }
}

/// Operation carried by a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationType {
    Set,
    Clear,
    /// Clears `[key, param)`.
    ClearRange,
    AddValue,
    And,
    Or,
    Xor,
    Max,
    Min,
}

impl MutationType {
    pub const fn code(self) -> u8 {
        match self {
            Self::Set => 0,
            Self::Clear => 1,
            Self::ClearRange => 2,
            Self::AddValue => 3,
            Self::And => 4,
            Self::Or => 5,
            Self::Xor => 6,
            Self::Max => 7,
            Self::Min => 8,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Set,
            1 => Self::Clear,
            2 => Self::ClearRange,
            3 => Self::AddValue,
            4 => Self::And,
            5 => Self::Or,
            6 => Self::Xor,
            7 => Self::Max,
            8 => Self::Min,
            _ => return None,
        })
    }
}

/// One decoded operation over a key (or key range for `ClearRange`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub kind: MutationType,
    pub key: Vec<u8>,
    /// Value for writes and atomic ops, exclusive end key for `ClearRange`.
    pub param: Vec<u8>,
}

impl Mutation {
    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MutationType::Set,
            key: key.into(),
            param: value.into(),
        }
    }

    pub fn clear(key: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MutationType::Clear,
            key: key.into(),
            param: Vec::new(),
        }
    }

    pub fn clear_range(begin: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MutationType::ClearRange,
            key: begin.into(),
            param: end.into(),
        }
    }

    pub fn is_range(&self) -> bool {
        self.kind == MutationType::ClearRange
    }

    /// Approximate in-memory/wire footprint used for send batching.
    pub fn weight(&self) -> usize {
        1 + 4 + self.key.len() + 4 + self.param.len()
    }
}

/// A mutation tagged with the version it was committed at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedMutation {
    pub version: Version,
    pub mutation: Mutation,
}

impl VersionedMutation {
    pub fn new(version: Version, mutation: Mutation) -> Self {
        Self { version, mutation }
    }
}

/// Kind of backup artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileKind {
    /// Key/value snapshot of a key range taken at `version`.
    Range { version: Version },
    /// Chunked mutation log covering `[begin_version, end_version)`.
    Log {
        begin_version: Version,
        end_version: Version,
    },
}

/// Descriptor of one backup file as handed out by the coordinator.
///
/// `name` is the file identity used for load deduplication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    pub block_size: u64,
}

impl BackupFile {
    pub fn is_log(&self) -> bool {
        matches!(self.kind, FileKind::Log { .. })
    }

    /// `(offset, len)` of every block in file order. The last block may be short.
    pub fn blocks(&self) -> Vec<(u64, usize)> {
        let block_size = self.block_size.max(1);
        let mut out = Vec::with_capacity(self.size.div_ceil(block_size) as usize);
        let mut offset = 0u64;
        while offset < self.size {
            let len = block_size.min(self.size - offset);
            out.push((offset, len as usize));
            offset += len;
        }
        out
    }
}

/// Mutations for one applier produced from one file, grouped by version in
/// ascending order; each group keeps decode order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedBatch {
    pub node_id: NodeId,
    pub batch_id: BatchId,
    pub applier: ApplierId,
    pub file: String,
    pub entries: Vec<(Version, Vec<Mutation>)>,
}

impl RoutedBatch {
    pub fn mutation_count(&self) -> usize {
        self.entries.iter().map(|(_, m)| m.len()).sum()
    }
}

/// Per-batch workload counters reported to the coordinator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadCounters {
    /// Backup bytes read and processed (`curWorkloadSize`).
    pub bytes: u64,
    pub files: u64,
    pub mutations: u64,
    pub sends: u64,
}

/// Commands received from the coordinator.
#[derive(Clone, Debug)]
pub enum LoaderCommand {
    StartSamplingPhase {
        batch_id: BatchId,
        backup_url: String,
        files: Vec<BackupFile>,
        applier_count: usize,
    },
    InstallPartition {
        batch_id: BatchId,
        boundaries: Vec<Vec<u8>>,
        appliers: Vec<ApplierId>,
    },
    LoadFile {
        batch_id: BatchId,
        cmd_id: CmdId,
        backup_url: String,
        file: BackupFile,
    },
    FinishBatch {
        batch_id: BatchId,
    },
}

impl LoaderCommand {
    pub fn batch_id(&self) -> BatchId {
        match self {
            Self::StartSamplingPhase { batch_id, .. }
            | Self::InstallPartition { batch_id, .. }
            | Self::LoadFile { batch_id, .. }
            | Self::FinishBatch { batch_id } => *batch_id,
        }
    }

    /// Whether this command opens a new batch on an idle loader.
    pub fn starts_batch(&self) -> bool {
        matches!(
            self,
            Self::StartSamplingPhase { .. } | Self::InstallPartition { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::StartSamplingPhase { .. } => "start_sampling_phase",
            Self::InstallPartition { .. } => "install_partition",
            Self::LoadFile { .. } => "load_file",
            Self::FinishBatch { .. } => "finish_batch",
        }
    }
}

/// Reports emitted to the coordinator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum LoaderReport {
    SamplingDone {
        node_id: NodeId,
        batch_id: BatchId,
        sampled_mutations: u64,
        key_counts: Vec<(Vec<u8>, u64)>,
        boundaries: Vec<Vec<u8>>,
    },
    FileLoaded {
        node_id: NodeId,
        batch_id: BatchId,
        cmd_id: CmdId,
        file: String,
        mutations: u64,
        bytes: u64,
        /// The file was already loaded in this batch; nothing was redone.
        duplicate: bool,
    },
    FileFailed {
        node_id: NodeId,
        batch_id: BatchId,
        cmd_id: Option<CmdId>,
        file: String,
        kind: ErrorKind,
        message: String,
    },
    StaleIgnored {
        node_id: NodeId,
        batch_id: BatchId,
        current: BatchId,
    },
    BatchAbandoned {
        node_id: NodeId,
        batch_id: BatchId,
        superseded_by: BatchId,
    },
    BatchComplete {
        node_id: NodeId,
        batch_id: BatchId,
        workload: WorkloadCounters,
    },
    Fatal {
        node_id: NodeId,
        batch_id: BatchId,
        kind: ErrorKind,
        message: String,
    },
}

/// An opened backup container.
#[async_trait]
pub trait BackupContainer: Send + Sync + 'static {
    fn url(&self) -> &str;

    /// Read `len` bytes of `file` starting at `offset`.
    ///
    /// Fails with `LoaderError::NotFound` or `LoaderError::Io`. Timeouts are
    /// the implementation's responsibility and surface as `Io`.
    async fn read_range(&self, file: &str, offset: u64, len: usize) -> Result<Bytes, LoaderError>;
}

/// Opens backup containers by URL.
#[async_trait]
pub trait BackupSource: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Arc<dyn BackupContainer>, LoaderError>;
}

/// Delivery of routed mutations to appliers.
///
/// Delivery is at-least-once; appliers deduplicate on their side.
#[async_trait]
pub trait ApplierSink: Send + Sync + 'static {
    async fn send(&self, batch: RoutedBatch) -> anyhow::Result<()>;
}

/// Loader → coordinator reporting channel.
#[async_trait]
pub trait CoordinatorLink: Send + Sync + 'static {
    async fn report(&self, report: LoaderReport) -> anyhow::Result<()>;
}
