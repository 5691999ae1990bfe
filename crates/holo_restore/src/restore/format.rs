//! Backup file block format.
//!
//! A backup file is a sequence of fixed-size blocks (the last one may be
//! short) so that a loader can fetch and verify blocks independently:
//!
//! `magic u32 | crc32(body) u32 | body_len u32 | body | zero padding`
//!
//! Range-file bodies hold `(key, value)` pairs that restore as `Set` at the
//! file version. Log-file bodies hold `LogChunk`s whose data parts join into a
//! `codec` payload. Entries never straddle blocks.

use crc32fast::Hasher;

use super::codec::{self, read_bytes, read_u32, LogChunk};
use super::error::LoaderError;
use super::types::{FileKind, Mutation, Version, VersionedMutation};

/// "HLBK"
pub const BLOCK_MAGIC: u32 = 0x484c_424b;
/// `magic | crc | body_len`.
pub const BLOCK_HEADER_LEN: usize = 12;

fn checksum(body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(body);
    hasher.finalize()
}

/// Incremental writer for one backup file.
pub struct BackupFileWriter {
    kind: FileKind,
    block_size: usize,
    out: Vec<u8>,
    body: Vec<u8>,
}

impl BackupFileWriter {
    pub fn new(kind: FileKind, block_size: usize) -> Self {
        Self {
            kind,
            block_size: block_size.max(BLOCK_HEADER_LEN + 1),
            out: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Append one snapshot row (range files only).
    pub fn add_kv(&mut self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(
            matches!(self.kind, FileKind::Range { .. }),
            "key/value rows are only valid in range files"
        );
        let mut entry = Vec::with_capacity(8 + key.len() + value.len());
        codec::put_bytes(&mut entry, key);
        codec::put_bytes(&mut entry, value);
        self.push_entry(entry)
    }

    /// Append one payload part (log files only).
    pub fn add_chunk(&mut self, chunk: &LogChunk) -> anyhow::Result<()> {
        anyhow::ensure!(
            matches!(self.kind, FileKind::Log { .. }),
            "log chunks are only valid in log files"
        );
        let mut entry = Vec::with_capacity(16 + chunk.batch_log_id.len() + chunk.data.len());
        codec::put_bytes(&mut entry, &chunk.batch_log_id);
        entry.extend_from_slice(&chunk.part.to_be_bytes());
        entry.extend_from_slice(&chunk.total_len.to_be_bytes());
        codec::put_bytes(&mut entry, &chunk.data);
        self.push_entry(entry)
    }

    fn push_entry(&mut self, entry: Vec<u8>) -> anyhow::Result<()> {
        let capacity = self.block_size - BLOCK_HEADER_LEN;
        anyhow::ensure!(
            entry.len() <= capacity,
            "entry of {} bytes does not fit a {} byte block",
            entry.len(),
            self.block_size
        );
        if self.body.len() + entry.len() > capacity {
            self.flush_block(true);
        }
        self.body.extend_from_slice(&entry);
        Ok(())
    }

    fn flush_block(&mut self, pad: bool) {
        let body = std::mem::take(&mut self.body);
        let start = self.out.len();
        self.out.extend_from_slice(&BLOCK_MAGIC.to_be_bytes());
        self.out.extend_from_slice(&checksum(&body).to_be_bytes());
        self.out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        self.out.extend_from_slice(&body);
        if pad {
            self.out.resize(start + self.block_size, 0);
        }
    }

    /// Finish the file; the last block is not padded.
    pub fn finish(mut self) -> Vec<u8> {
        if !self.body.is_empty() || self.out.is_empty() {
            self.flush_block(false);
        }
        self.out
    }
}

/// Verify a block and return its body.
pub fn decode_block<'a>(file: &str, block: &'a [u8]) -> Result<&'a [u8], LoaderError> {
    let corrupt = |reason: String| LoaderError::corrupt(file, reason);
    if block.len() < BLOCK_HEADER_LEN {
        return Err(corrupt(format!("short block ({} bytes)", block.len())));
    }
    let mut offset = 0usize;
    let header = (|| -> anyhow::Result<(u32, u32, u32)> {
        Ok((
            read_u32(block, &mut offset)?,
            read_u32(block, &mut offset)?,
            read_u32(block, &mut offset)?,
        ))
    })();
    let (magic, crc, body_len) = header.map_err(|err| corrupt(err.to_string()))?;
    if magic != BLOCK_MAGIC {
        return Err(corrupt(format!("bad block magic {magic:#010x}")));
    }
    let body_len = body_len as usize;
    if BLOCK_HEADER_LEN + body_len > block.len() {
        return Err(corrupt(format!(
            "block body length {body_len} exceeds block of {} bytes",
            block.len()
        )));
    }
    let body = &block[BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + body_len];
    if checksum(body) != crc {
        return Err(corrupt("block checksum mismatch".to_string()));
    }
    Ok(body)
}

/// Decode a range-file block into `Set` mutations at `version`.
pub fn parse_range_block(
    file: &str,
    block: &[u8],
    version: Version,
) -> Result<Vec<VersionedMutation>, LoaderError> {
    let body = decode_block(file, block)?;
    let mut offset = 0usize;
    let mut out = Vec::new();
    while offset < body.len() {
        let key = read_bytes(body, &mut offset).map_err(|e| LoaderError::corrupt(file, e.to_string()))?;
        let value =
            read_bytes(body, &mut offset).map_err(|e| LoaderError::corrupt(file, e.to_string()))?;
        out.push(VersionedMutation::new(version, Mutation::set(key, value)));
    }
    Ok(out)
}

/// Decode a log-file block into its payload parts, in file order.
pub fn parse_log_block(file: &str, block: &[u8]) -> Result<Vec<LogChunk>, LoaderError> {
    let body = decode_block(file, block)?;
    let mut offset = 0usize;
    let mut out = Vec::new();
    while offset < body.len() {
        let chunk = (|| -> anyhow::Result<LogChunk> {
            let batch_log_id = read_bytes(body, &mut offset)?;
            let part = read_u32(body, &mut offset)?;
            let total_len = read_u32(body, &mut offset)?;
            let data = read_bytes(body, &mut offset)?;
            Ok(LogChunk {
                batch_log_id,
                part,
                total_len,
                data,
            })
        })()
        .map_err(|e| LoaderError::corrupt(file, e.to_string()))?;
        out.push(chunk);
    }
    Ok(out)
}

/// Build a whole range file from snapshot rows.
pub fn build_range_file(
    version: Version,
    rows: &[(Vec<u8>, Vec<u8>)],
    block_size: usize,
) -> anyhow::Result<Vec<u8>> {
    let mut writer = BackupFileWriter::new(FileKind::Range { version }, block_size);
    for (key, value) in rows {
        writer.add_kv(key, value)?;
    }
    Ok(writer.finish())
}

/// Build a whole log file. Each `(batch_log_id, mutations)` payload is split
/// into parts of at most `max_part_len` bytes.
pub fn build_log_file(
    begin_version: Version,
    end_version: Version,
    payloads: &[(Vec<u8>, Vec<VersionedMutation>)],
    max_part_len: usize,
    block_size: usize,
) -> anyhow::Result<Vec<u8>> {
    let mut writer = BackupFileWriter::new(
        FileKind::Log {
            begin_version,
            end_version,
        },
        block_size,
    );
    for (id, mutations) in payloads {
        let payload = codec::encode_mutations(mutations);
        for chunk in codec::chunk_payload(id, &payload, max_part_len) {
            writer.add_chunk(&chunk)?;
        }
    }
    Ok(writer.finish())
}
