//! Restore module wiring.
//!
//! `types` defines the shared data model and trait contracts (backup source,
//! applier sink, coordinator link). `reassembly`, `sampler`, `router` and
//! `ledger` are the single-writer components owned by one batch, `state`
//! holds them together with the node identity, and `loader` is the control
//! loop. `codec` and `format` define the payload and block encodings.

pub mod codec;
mod error;
pub mod format;
mod ledger;
mod loader;
mod reassembly;
mod router;
mod sampler;
mod state;
mod types;

pub use error::{ErrorKind, LoaderError, ReassemblyError};
pub use ledger::{CommandLedger, LedgerDecision};
pub use loader::{Loader, LoaderConfig, LoaderHandle};
pub use reassembly::{MutationReassembler, ReassemblyStage};
pub use router::{ApplierRouter, RoutedMutations};
pub use sampler::RangeSampler;
pub use state::{BatchPhase, BatchState, CumulativeCounters, LoaderState, Role};
pub use types::{
    ApplierId, ApplierSink, BackupContainer, BackupFile, BackupSource, BatchId, CmdId,
    CoordinatorLink, FileKind, LoaderCommand, LoaderReport, Mutation, MutationType, NodeId,
    RoutedBatch, Version, VersionedMutation, WorkloadCounters,
};
