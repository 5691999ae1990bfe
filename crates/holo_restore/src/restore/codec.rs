//! Mutation payload encoding.
//!
//! A payload is a flat sequence of records, each
//! `version u64 | type u8 | key_len u32 | key | param_len u32 | param`
//! (integers big-endian). Log files carry payloads split into parts
//! (`LogChunk`) that the reassembler joins back before decoding.

use super::types::{Mutation, MutationType, Version, VersionedMutation};

/// Fixed bytes per record besides key and param.
const RECORD_HEADER_LEN: usize = 8 + 1 + 4 + 4;

/// One part of a split payload as stored in a log file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogChunk {
    /// Identifies the payload this part belongs to.
    pub batch_log_id: Vec<u8>,
    pub part: u32,
    /// Length of the whole payload once every part is joined.
    pub total_len: u32,
    pub data: Vec<u8>,
}

pub fn encoded_len(mutations: &[VersionedMutation]) -> usize {
    mutations
        .iter()
        .map(|m| RECORD_HEADER_LEN + m.mutation.key.len() + m.mutation.param.len())
        .sum()
}

pub fn encode_mutations(mutations: &[VersionedMutation]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(mutations));
    for m in mutations {
        out.extend_from_slice(&m.version.to_be_bytes());
        out.push(m.mutation.kind.code());
        out.extend_from_slice(&(m.mutation.key.len() as u32).to_be_bytes());
        out.extend_from_slice(&m.mutation.key);
        out.extend_from_slice(&(m.mutation.param.len() as u32).to_be_bytes());
        out.extend_from_slice(&m.mutation.param);
    }
    out
}

/// Decode a joined payload into mutations in encoding order.
pub fn decode_mutations(data: &[u8]) -> anyhow::Result<Vec<VersionedMutation>> {
    let mut offset = 0usize;
    let mut out = Vec::new();
    while offset < data.len() {
        anyhow::ensure!(
            offset + RECORD_HEADER_LEN - 4 <= data.len(),
            "short record header at offset {offset}"
        );
        let version: Version = read_u64(data, &mut offset)?;
        let code = read_u8(data, &mut offset)?;
        let kind = MutationType::from_code(code)
            .ok_or_else(|| anyhow::anyhow!("unknown mutation type {code} at offset {offset}"))?;
        let key = read_bytes(data, &mut offset)?;
        let param = read_bytes(data, &mut offset)?;
        if kind == MutationType::ClearRange {
            anyhow::ensure!(key <= param, "clear range with begin > end at version {version}");
        }
        out.push(VersionedMutation::new(version, Mutation { kind, key, param }));
    }
    Ok(out)
}

/// Split `payload` into parts of at most `max_part_len` bytes.
///
/// An empty payload still yields one (empty) part so the reader sees the id.
pub fn chunk_payload(batch_log_id: &[u8], payload: &[u8], max_part_len: usize) -> Vec<LogChunk> {
    let max_part_len = max_part_len.max(1);
    let total_len = payload.len() as u32;
    if payload.is_empty() {
        return vec![LogChunk {
            batch_log_id: batch_log_id.to_vec(),
            part: 0,
            total_len,
            data: Vec::new(),
        }];
    }
    payload
        .chunks(max_part_len)
        .enumerate()
        .map(|(idx, data)| LogChunk {
            batch_log_id: batch_log_id.to_vec(),
            part: idx as u32,
            total_len,
            data: data.to_vec(),
        })
        .collect()
}

/// Render a key for logs.
pub fn display_key(key: &[u8]) -> String {
    if key.is_empty() {
        return "<min>".to_string();
    }
    String::from_utf8_lossy(key).into_owned()
}

pub(crate) fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

pub(crate) fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset < data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

/// Length-prefixed byte string.
pub(crate) fn read_bytes(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let len = read_u32(data, offset)? as usize;
    anyhow::ensure!(*offset + len <= data.len(), "short byte string (len {len})");
    let out = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}

pub(crate) fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<VersionedMutation> {
        vec![
            VersionedMutation::new(10, Mutation::set(b"a".to_vec(), b"1".to_vec())),
            VersionedMutation::new(10, Mutation::clear(b"b".to_vec())),
            VersionedMutation::new(11, Mutation::clear_range(b"c".to_vec(), b"f".to_vec())),
        ]
    }

    #[test]
    fn decode_preserves_encoding_order() {
        let muts = sample();
        let bytes = encode_mutations(&muts);
        assert_eq!(bytes.len(), encoded_len(&muts));
        assert_eq!(decode_mutations(&bytes).expect("decode"), muts);
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let bytes = encode_mutations(&sample());
        let err = decode_mutations(&bytes[..bytes.len() - 1]).expect_err("truncated payload");
        assert!(err.to_string().contains("short"), "unexpected error: {err}");
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut bytes = encode_mutations(&sample()[..1]);
        bytes[8] = 0xee;
        let err = decode_mutations(&bytes).expect_err("bad type");
        assert!(err.to_string().contains("unknown mutation type"));
    }

    #[test]
    fn chunking_covers_payload_in_order() {
        let payload = encode_mutations(&sample());
        let chunks = chunk_payload(b"id", &payload, 7);
        assert!(chunks.len() > 1);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(joined, payload);
        for (idx, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.part, idx as u32);
            assert_eq!(chunk.total_len as usize, payload.len());
        }
    }

    #[test]
    fn empty_payload_yields_single_part() {
        let chunks = chunk_payload(b"id", &[], 16);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].total_len, 0);
    }
}
