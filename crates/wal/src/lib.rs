//! Append-only mutation log with CRC-protected binary records.
//!
//! Each record is a fixed 40-byte header followed by the key bytes and
//! value bytes it describes. The CRC-32 field covers the header bytes
//! preceding it. Records accumulate in an in-memory buffer and reach the
//! sink on flush; a record that fails verification during replay marks
//! the tail as torn and terminates the read at that point.
//!
//! On-disk record layout (little-endian):
//!
//! ```text
//! offset  size  field
//!   0      4    magic
//!   4      8    transaction_id
//!   12     8    timestamp_ns
//!   20     1    op_kind (1=Put, 2=Remove, 3=Clear, 4=Checkpoint)
//!   21     3    reserved (zero)
//!   24     4    key_len
//!   28     4    value_len
//!   32     1    value_kind tag
//!   33     3    reserved (zero)
//!   36     4    crc32 over bytes [0..36)
//!   40     ..   key bytes, then value bytes
//! ```

#![deny(unsafe_code)]

use hivemap_core::value::ValueKind;
use std::io;
use thiserror::Error;
use tracing::debug;

/// Magic bytes opening every record.
pub const WAL_MAGIC: [u8; 4] = *b"HWL1";

/// Fixed record header size in bytes.
pub const HEADER_LEN: usize = 40;

/// Default in-memory buffer capacity before a forced flush.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Errors produced while writing or replaying the log.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying sink or filesystem failure.
    #[error("wal io: {0}")]
    Io(#[from] io::Error),
    /// Record did not start with the magic bytes.
    #[error("bad record magic")]
    BadMagic,
    /// Stored CRC disagrees with the recomputed one.
    #[error("crc mismatch: stored {stored:#010x} computed {computed:#010x}")]
    CrcMismatch {
        /// CRC persisted in the record header.
        stored: u32,
        /// CRC recomputed over the header bytes.
        computed: u32,
    },
    /// Stream ended inside a record.
    #[error("truncated record: {0}")]
    Truncated(&'static str),
    /// Header carried an unknown operation kind.
    #[error("unknown op kind {0}")]
    UnknownOp(u8),
}

/// Operation described by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Insert or replace one key.
    Put,
    /// Remove one key.
    Remove,
    /// Drop every key.
    Clear,
    /// All prior records are superseded by backend state.
    Checkpoint,
}

impl OpKind {
    /// Wire tag.
    pub fn tag(self) -> u8 {
        match self {
            Self::Put => 1,
            Self::Remove => 2,
            Self::Clear => 3,
            Self::Checkpoint => 4,
        }
    }

    /// Decode a wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Put),
            2 => Some(Self::Remove),
            3 => Some(Self::Clear),
            4 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

/// One decoded record: header fields plus owned key and value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Process-monotonic transaction id.
    pub txn_id: u64,
    /// Nanosecond timestamp taken when the record was built.
    pub timestamp_ns: u64,
    /// Operation the record describes.
    pub op: OpKind,
    /// Raw value-kind tag carried by the header.
    pub value_tag: u8,
    /// Key bytes (empty for `Clear` and `Checkpoint`).
    pub key: Vec<u8>,
    /// Value bytes (empty for everything but `Put`).
    pub value: Vec<u8>,
}

impl WalRecord {
    /// Decode the value-kind tag, when it is a defined one.
    pub fn value_kind(&self) -> Option<ValueKind> {
        ValueKind::from_tag(self.value_tag)
    }
}

fn encode_header(
    txn_id: u64,
    timestamp_ns: u64,
    op: OpKind,
    value_tag: u8,
    key_len: u32,
    value_len: u32,
) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..4].copy_from_slice(&WAL_MAGIC);
    buf[4..12].copy_from_slice(&txn_id.to_le_bytes());
    buf[12..20].copy_from_slice(&timestamp_ns.to_le_bytes());
    buf[20] = op.tag();
    buf[24..28].copy_from_slice(&key_len.to_le_bytes());
    buf[28..32].copy_from_slice(&value_len.to_le_bytes());
    buf[32] = value_tag;
    let crc = crc32fast::hash(&buf[0..36]);
    buf[36..40].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Destination for flushed log bytes.
pub trait LogSink: Send {
    /// Append bytes to the end of the stream.
    fn append(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl LogSink for Vec<u8> {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Buffered record writer. Records accumulate in memory and reach the
/// sink when the buffer fills or `flush` is called.
pub struct WalWriter {
    sink: Box<dyn LogSink>,
    buf: Vec<u8>,
    capacity: usize,
    sequence: u64,
    appended_bytes: u64,
}

impl WalWriter {
    /// Writer with the default buffer capacity.
    pub fn new(sink: Box<dyn LogSink>) -> Self {
        Self::with_capacity(sink, DEFAULT_BUFFER_CAPACITY)
    }

    /// Writer with an explicit buffer capacity.
    pub fn with_capacity(sink: Box<dyn LogSink>, capacity: usize) -> Self {
        let capacity = capacity.max(HEADER_LEN);
        Self { sink, buf: Vec::with_capacity(capacity), capacity, sequence: 0, appended_bytes: 0 }
    }

    /// Append one record, flushing first when it would not fit the
    /// remaining buffer space. Returns the record's sequence number.
    pub fn append(
        &mut self,
        txn_id: u64,
        timestamp_ns: u64,
        op: OpKind,
        value_tag: u8,
        key: &[u8],
        value: &[u8],
    ) -> Result<u64, WalError> {
        let header = encode_header(
            txn_id,
            timestamp_ns,
            op,
            value_tag,
            key.len() as u32,
            value.len() as u32,
        );
        let record_len = HEADER_LEN + key.len() + value.len();
        if self.buf.len() + record_len > self.capacity {
            self.flush()?;
        }
        if record_len > self.capacity {
            // Oversized record bypasses the buffer.
            let mut direct = Vec::with_capacity(record_len);
            direct.extend_from_slice(&header);
            direct.extend_from_slice(key);
            direct.extend_from_slice(value);
            self.sink.append(&direct)?;
        } else {
            self.buf.extend_from_slice(&header);
            self.buf.extend_from_slice(key);
            self.buf.extend_from_slice(value);
        }
        self.sequence += 1;
        self.appended_bytes += record_len as u64;
        Ok(self.sequence)
    }

    /// Push buffered bytes to the sink. No-op on an empty buffer.
    pub fn flush(&mut self) -> Result<(), WalError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        debug!(bytes = self.buf.len(), "wal flush");
        self.sink.append(&self.buf)?;
        self.buf.clear();
        Ok(())
    }

    /// Number of records appended so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Seed the sequence counter, used after replay.
    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Bytes currently buffered and not yet flushed.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Total record bytes appended over the writer's lifetime.
    pub fn appended_bytes(&self) -> u64 {
        self.appended_bytes
    }
}

/// Replay reader over a log byte stream.
///
/// Iteration yields intact records in order and stops at the first
/// record that fails verification; the failure is then available from
/// [`WalReader::corruption`]. A stream that ends exactly on a record
/// boundary reports no corruption.
pub struct WalReader<'a> {
    buf: &'a [u8],
    pos: usize,
    verify_checksums: bool,
    corruption: Option<WalError>,
}

impl<'a> WalReader<'a> {
    /// Reader that verifies record CRCs.
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_verification(buf, true)
    }

    /// Reader with CRC verification toggled (off is for debugging only;
    /// magic and framing are always checked).
    pub fn with_verification(buf: &'a [u8], verify_checksums: bool) -> Self {
        Self { buf, pos: 0, verify_checksums, corruption: None }
    }

    /// Failure that terminated iteration, if any.
    pub fn corruption(&self) -> Option<&WalError> {
        self.corruption.as_ref()
    }

    /// Byte offset of the next unread record.
    pub fn offset(&self) -> usize {
        self.pos
    }

    fn read_next(&mut self) -> Result<Option<WalRecord>, WalError> {
        if self.pos == self.buf.len() {
            return Ok(None);
        }
        let rest = &self.buf[self.pos..];
        if rest.len() < HEADER_LEN {
            return Err(WalError::Truncated("header"));
        }
        let header = &rest[..HEADER_LEN];
        if header[0..4] != WAL_MAGIC {
            return Err(WalError::BadMagic);
        }
        if self.verify_checksums {
            let stored = u32::from_le_bytes(header[36..40].try_into().unwrap_or_default());
            let computed = crc32fast::hash(&header[0..36]);
            if stored != computed {
                return Err(WalError::CrcMismatch { stored, computed });
            }
        }
        let op = OpKind::from_tag(header[20]).ok_or(WalError::UnknownOp(header[20]))?;
        let txn_id = u64::from_le_bytes(header[4..12].try_into().unwrap_or_default());
        let timestamp_ns = u64::from_le_bytes(header[12..20].try_into().unwrap_or_default());
        let key_len = u32::from_le_bytes(header[24..28].try_into().unwrap_or_default()) as usize;
        let value_len = u32::from_le_bytes(header[28..32].try_into().unwrap_or_default()) as usize;
        let value_tag = header[32];
        if rest.len() < HEADER_LEN + key_len + value_len {
            return Err(WalError::Truncated("payload"));
        }
        let key = rest[HEADER_LEN..HEADER_LEN + key_len].to_vec();
        let value = rest[HEADER_LEN + key_len..HEADER_LEN + key_len + value_len].to_vec();
        self.pos += HEADER_LEN + key_len + value_len;
        Ok(Some(WalRecord { txn_id, timestamp_ns, op, value_tag, key, value }))
    }
}

impl Iterator for WalReader<'_> {
    type Item = WalRecord;

    fn next(&mut self) -> Option<WalRecord> {
        if self.corruption.is_some() {
            return None;
        }
        match self.read_next() {
            Ok(rec) => rec,
            Err(e) => {
                self.corruption = Some(e);
                None
            }
        }
    }
}
