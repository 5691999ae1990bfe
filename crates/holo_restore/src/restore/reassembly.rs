//! Reassembly of mutation payloads split across log chunks.
//!
//! Parts of one payload are identified by a batch-log id and must arrive with
//! consecutive part indexes starting at 0. Parts of different ids may
//! interleave freely. A payload completes when the joined length reaches the
//! total declared by its parts; it is then decoded and its buffer released.
//!
//! A payload may span files. Loading one file therefore works on a
//! `ReassemblyStage` layered over the committed buffers, and only a file that
//! was fully delivered commits its stage. A failed file leaves the committed
//! buffers exactly as the previous files left them.

use std::collections::HashMap;

use super::codec;
use super::error::ReassemblyError;
use super::types::VersionedMutation;

#[derive(Clone, Debug)]
struct PartialBuffer {
    data: Vec<u8>,
    next_part: u32,
    declared_len: usize,
}

/// Buffers partially received payloads, keyed by batch-log id.
#[derive(Debug, Default)]
pub struct MutationReassembler {
    buffers: HashMap<Vec<u8>, PartialBuffer>,
}

/// Uncommitted changes of one file: `None` marks a released buffer.
#[derive(Debug, Default)]
pub struct ReassemblyStage {
    touched: HashMap<Vec<u8>, Option<PartialBuffer>>,
}

impl MutationReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one part and commit the result immediately.
    ///
    /// Returns `Ok(None)` while the payload is incomplete and the decoded
    /// mutations, in encoding order, once the last part arrived. Any error
    /// drops the buffer for `batch_log_id` and leaves other buffers untouched.
    pub fn ingest(
        &mut self,
        batch_log_id: &[u8],
        part: u32,
        total_len: usize,
        bytes: &[u8],
    ) -> Result<Option<Vec<VersionedMutation>>, ReassemblyError> {
        let mut stage = ReassemblyStage::default();
        let out = self.ingest_staged(&mut stage, batch_log_id, part, total_len, bytes);
        self.commit(stage);
        out
    }

    /// Accept one part into `stage` without touching the committed buffers.
    pub fn ingest_staged(
        &self,
        stage: &mut ReassemblyStage,
        batch_log_id: &[u8],
        part: u32,
        total_len: usize,
        bytes: &[u8],
    ) -> Result<Option<Vec<VersionedMutation>>, ReassemblyError> {
        let id = || codec::display_key(batch_log_id);
        // Committed buffers are copied into the stage on first touch.
        let current = match stage.touched.remove(batch_log_id) {
            Some(staged) => staged,
            None => self.buffers.get(batch_log_id).cloned(),
        };

        let mut buffer = match current {
            Some(buffer) if part != buffer.next_part => {
                stage.touched.insert(batch_log_id.to_vec(), None);
                return Err(ReassemblyError::OutOfOrderPart {
                    id: id(),
                    expected: buffer.next_part,
                    got: part,
                });
            }
            Some(buffer) if total_len != buffer.declared_len => {
                stage.touched.insert(batch_log_id.to_vec(), None);
                return Err(ReassemblyError::LengthMismatch {
                    id: id(),
                    declared: buffer.declared_len,
                    detail: format!("part {part} declares {total_len}"),
                });
            }
            Some(buffer) => buffer,
            None if part != 0 => {
                stage.touched.insert(batch_log_id.to_vec(), None);
                return Err(ReassemblyError::OutOfOrderPart {
                    id: id(),
                    expected: 0,
                    got: part,
                });
            }
            // The declared total comes from backup bytes; grow with the data.
            None => PartialBuffer {
                data: Vec::new(),
                next_part: 0,
                declared_len: total_len,
            },
        };
        buffer.data.extend_from_slice(bytes);
        buffer.next_part += 1;

        if buffer.data.len() < buffer.declared_len {
            stage.touched.insert(batch_log_id.to_vec(), Some(buffer));
            return Ok(None);
        }

        stage.touched.insert(batch_log_id.to_vec(), None);
        if buffer.data.len() > buffer.declared_len {
            return Err(ReassemblyError::LengthMismatch {
                id: id(),
                declared: buffer.declared_len,
                detail: format!("accumulated {}", buffer.data.len()),
            });
        }
        codec::decode_mutations(&buffer.data)
            .map(Some)
            .map_err(|err| ReassemblyError::Decode {
                id: id(),
                reason: err.to_string(),
            })
    }

    /// Apply a stage produced by `ingest_staged`.
    pub fn commit(&mut self, stage: ReassemblyStage) {
        for (id, buffer) in stage.touched {
            match buffer {
                Some(buffer) => {
                    self.buffers.insert(id, buffer);
                }
                None => {
                    self.buffers.remove(&id);
                }
            }
        }
    }

    /// Number of incomplete payloads.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
