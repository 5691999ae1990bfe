//! Loader state and the per-batch lifecycle.
//!
//! `LoaderState` is owned by the core loop. Everything scoped to one batch
//! lives in `BatchState` and is replaced wholesale by
//! `reset_per_version_batch`; node identity, cumulative counters and the
//! backup container cache survive resets.

use std::fmt;
use std::sync::Arc;

use super::error::LoaderError;
use super::ledger::CommandLedger;
use super::reassembly::MutationReassembler;
use super::router::ApplierRouter;
use super::sampler::RangeSampler;
use super::types::{BackupContainer, BackupSource, BatchId, NodeId, WorkloadCounters};

/// Role tag carried in node descriptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Loader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Loader => f.write_str("Loader"),
        }
    }
}

/// Where the active batch is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchPhase {
    Idle,
    Sampling,
    PartitionInstalled,
    Loading,
    Draining,
}

impl BatchPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchPhase::Idle => "idle",
            BatchPhase::Sampling => "sampling",
            BatchPhase::PartitionInstalled => "partition_installed",
            BatchPhase::Loading => "loading",
            BatchPhase::Draining => "draining",
        }
    }
}

/// State scoped to one batch.
///
/// Only the core loop mutates it; callers outside `restore` get read access.
#[derive(Debug)]
pub struct BatchState {
    pub(super) batch_id: BatchId,
    pub(super) phase: BatchPhase,
    pub(super) router: ApplierRouter,
    pub(super) sampler: RangeSampler,
    pub(super) reassembler: MutationReassembler,
    pub(super) ledger: CommandLedger,
    pub(super) workload: WorkloadCounters,
}

impl BatchState {
    pub fn new(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            phase: BatchPhase::Idle,
            router: ApplierRouter::new(batch_id),
            sampler: RangeSampler::new(),
            reassembler: MutationReassembler::new(),
            ledger: CommandLedger::new(),
            workload: WorkloadCounters::default(),
        }
    }

    pub fn router(&self) -> &ApplierRouter {
        &self.router
    }

    pub fn sampler(&self) -> &RangeSampler {
        &self.sampler
    }

    pub fn reassembler(&self) -> &MutationReassembler {
        &self.reassembler
    }

    pub fn ledger(&self) -> &CommandLedger {
        &self.ledger
    }

    pub fn workload(&self) -> WorkloadCounters {
        self.workload
    }

    /// True when no batch-scoped data has been accumulated yet.
    pub fn is_pristine(&self) -> bool {
        !self.router.is_installed()
            && self.sampler.is_empty()
            && self.reassembler.is_empty()
            && self.ledger.is_empty()
            && self.workload == WorkloadCounters::default()
    }
}

/// Counters kept across batches for load reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CumulativeCounters {
    pub batches_completed: u64,
    pub batches_abandoned: u64,
    pub files_loaded: u64,
    pub files_failed: u64,
    pub mutations_routed: u64,
    pub bytes_read: u64,
}

pub struct LoaderState {
    node_id: NodeId,
    node_index: usize,
    role: Role,
    batch: BatchState,
    pub cumulative: CumulativeCounters,
    container: Option<Arc<dyn BackupContainer>>,
    in_flight: usize,
}

impl LoaderState {
    pub fn new(node_id: NodeId, node_index: usize) -> Self {
        Self {
            node_id,
            node_index,
            role: Role::Loader,
            batch: BatchState::new(0),
            cumulative: CumulativeCounters::default(),
            container: None,
            in_flight: 0,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn node_index(&self) -> usize {
        self.node_index
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn batch(&self) -> &BatchState {
        &self.batch
    }

    pub(super) fn batch_mut(&mut self) -> &mut BatchState {
        &mut self.batch
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch.batch_id
    }

    pub fn phase(&self) -> BatchPhase {
        self.batch.phase
    }

    pub fn set_phase(&mut self, phase: BatchPhase) {
        if self.batch.phase != phase {
            tracing::debug!(
                batch_id = self.batch.batch_id,
                from = self.batch.phase.as_str(),
                to = phase.as_str(),
                "batch phase change"
            );
            self.batch.phase = phase;
        }
    }

    /// Number of fetches or sends currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn io_started(&mut self) {
        self.in_flight += 1;
    }

    pub fn io_finished(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Discard all batch-scoped state and start `batch_id` from `Idle`.
    ///
    /// Panics if any fetch or send is outstanding: the caller must drain
    /// first.
    pub fn reset_per_version_batch(&mut self, batch_id: BatchId) {
        assert_eq!(
            self.in_flight, 0,
            "reset of batch {} with {} operations in flight",
            self.batch.batch_id, self.in_flight
        );
        let retired = std::mem::replace(&mut self.batch, BatchState::new(batch_id));
        tracing::debug!(
            retired = retired.batch_id,
            batch_id,
            files = retired.workload.files,
            pending_payloads = retired.reassembler.pending(),
            "reset per-version batch state"
        );
    }

    pub fn describe_node(&self) -> String {
        format!(
            "[Role: {}] [NodeID: {}] [NodeIndex: {}]",
            self.role, self.node_id, self.node_index
        )
    }

    /// Open (or reuse) the backup container for `url`.
    ///
    /// The cached handle is reused for the same url; a different url replaces
    /// it.
    pub async fn init_backup_container(
        &mut self,
        source: &dyn BackupSource,
        url: &str,
    ) -> Result<Arc<dyn BackupContainer>, LoaderError> {
        if let Some(container) = &self.container {
            if container.url() == url {
                return Ok(container.clone());
            }
        }
        let container = source.open(url).await?;
        tracing::info!(
            node = %self.describe_node(),
            url,
            replaced = self.container.is_some(),
            "opened backup container"
        );
        self.container = Some(container.clone());
        Ok(container)
    }
}

impl fmt::Debug for LoaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderState")
            .field("node_id", &self.node_id)
            .field("node_index", &self.node_index)
            .field("batch_id", &self.batch.batch_id)
            .field("phase", &self.batch.phase)
            .field("container", &self.container.as_ref().map(|c| c.url().to_string()))
            .field("in_flight", &self.in_flight)
            .finish()
    }
}
