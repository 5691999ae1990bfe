//! Error types for the restore loader.

use serde::{Deserialize, Serialize};

use super::types::{ApplierId, BatchId};

/// Errors surfaced by loader components and the control loop.
///
/// Every variant that concerns a file carries its name so the coordinator can
/// decide between retrying the command and aborting the batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoaderError {
    /// Malformed, truncated or length-mismatched backup payload.
    #[error("corrupt backup data in {file}: {reason}")]
    CorruptBackupData { file: String, reason: String },

    #[error("backup file not found: {file}")]
    NotFound { file: String },

    #[error("backup io error on {file}: {reason}")]
    Io { file: String, reason: String },

    /// A second partition was installed after routing started.
    #[error("routing already finalized for batch {batch_id}")]
    RoutingAlreadyFinalized { batch_id: BatchId },

    #[error("stale command for batch {batch_id} (current batch {current})")]
    StaleCommand { batch_id: BatchId, current: BatchId },

    #[error("no applier partition installed for batch {batch_id}")]
    NoPartition { batch_id: BatchId },

    #[error("invalid partition: {reason}")]
    InvalidPartition { reason: String },

    #[error("send to applier {applier} failed: {reason}")]
    ApplierSend { applier: ApplierId, reason: String },
}

impl LoaderError {
    pub fn corrupt(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptBackupData {
            file: file.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CorruptBackupData { .. } => ErrorKind::CorruptBackupData,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Io { .. } => ErrorKind::Io,
            Self::RoutingAlreadyFinalized { .. } => ErrorKind::RoutingAlreadyFinalized,
            Self::StaleCommand { .. } => ErrorKind::StaleCommand,
            Self::NoPartition { .. } => ErrorKind::NoPartition,
            Self::InvalidPartition { .. } => ErrorKind::InvalidPartition,
            Self::ApplierSend { .. } => ErrorKind::ApplierSend,
        }
    }

    /// Whether redelivering the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Wire-friendly classification of `LoaderError`, carried in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CorruptBackupData,
    NotFound,
    Io,
    RoutingAlreadyFinalized,
    StaleCommand,
    NoPartition,
    InvalidPartition,
    ApplierSend,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::NotFound | Self::Io | Self::ApplierSend)
    }
}

/// Reassembly failures. The loop converts these into
/// `LoaderError::CorruptBackupData` with the offending file attached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("out-of-order part for {id}: expected {expected}, got {got}")]
    OutOfOrderPart { id: String, expected: u32, got: u32 },

    #[error("length mismatch for {id}: declared {declared}, {detail}")]
    LengthMismatch {
        id: String,
        declared: usize,
        detail: String,
    },

    #[error("decode failed for {id}: {reason}")]
    Decode { id: String, reason: String },
}

impl ReassemblyError {
    pub fn into_loader_error(self, file: &str) -> LoaderError {
        LoaderError::corrupt(file, self.to_string())
    }
}
