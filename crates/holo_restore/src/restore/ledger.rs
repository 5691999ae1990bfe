//! Per-batch command ledger for idempotent file loads.
//!
//! A file is identified by its name; the command id only tells apart the
//! running attempt from a retransmission. Entries are scoped to one batch.

use std::collections::{BTreeSet, HashMap};

use super::types::CmdId;

/// Outcome of `CommandLedger::begin_or_skip`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerDecision {
    /// The caller owns the load and must `mark_done` or `abandon` it.
    Proceed,
    /// The file was fully loaded in this batch.
    AlreadyDone,
    /// Another command is loading the file right now.
    InProgress { owner: CmdId },
}

#[derive(Debug, Default)]
pub struct CommandLedger {
    done: BTreeSet<String>,
    in_flight: HashMap<String, CmdId>,
}

impl CommandLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_or_skip(&mut self, cmd_id: CmdId, file: &str) -> LedgerDecision {
        if self.done.contains(file) {
            return LedgerDecision::AlreadyDone;
        }
        if let Some(owner) = self.in_flight.get(file) {
            return LedgerDecision::InProgress { owner: *owner };
        }
        self.in_flight.insert(file.to_string(), cmd_id);
        LedgerDecision::Proceed
    }

    /// Record a completed load. Returns false if the file was already done.
    pub fn mark_done(&mut self, file: &str) -> bool {
        self.in_flight.remove(file);
        self.done.insert(file.to_string())
    }

    /// Release a failed attempt so the next command for `file` proceeds.
    pub fn abandon(&mut self, file: &str) -> Option<CmdId> {
        self.in_flight.remove(file)
    }

    pub fn processed_files(&self) -> impl Iterator<Item = &str> {
        self.done.iter().map(String::as_str)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty() && self.in_flight.is_empty()
    }

    pub fn clear(&mut self) {
        self.done.clear();
        self.in_flight.clear();
    }
}
