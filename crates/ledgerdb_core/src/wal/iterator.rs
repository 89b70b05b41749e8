//! Streaming WAL record iterator.
//!
//! Reads records one at a time from the storage backend, so recovery
//! memory is bounded by the largest single record rather than the log
//! size. A truncated record at the tail ends iteration cleanly; actual
//! corruption (bad magic, bad CRC, unknown type) is an error.

use parking_lot::MutexGuard;

use ledgerdb_storage::StorageBackend;

use crate::error::{EngineError, EngineResult};
use crate::wal::record::{compute_crc32, WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
use crate::wal::writer::{CRC_SIZE, HEADER_SIZE};

/// A streaming iterator over WAL records.
///
/// Yields `(offset, record)` pairs in append order. Holds the WAL's
/// backend lock for its lifetime.
pub struct WalRecordIterator<'a> {
    backend: MutexGuard<'a, Box<dyn StorageBackend>>,
    total_size: u64,
    offset: u64,
    finished: bool,
}

impl<'a> WalRecordIterator<'a> {
    /// Creates an iterator positioned at the start of the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub(super) fn new(backend: MutexGuard<'a, Box<dyn StorageBackend>>) -> EngineResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            offset: 0,
            finished: false,
        })
    }

    /// Reads the record at the current offset.
    ///
    /// `Ok(None)` means clean end of log, including a truncated trailing
    /// record (a crash mid-append before the flush completed).
    fn read_next(&mut self) -> EngineResult<Option<(u64, WalRecord)>> {
        let start = self.offset;
        let remaining = (self.total_size - start) as usize;

        if remaining == 0 {
            return Ok(None);
        }
        if remaining < HEADER_SIZE {
            // Torn header at the tail: end of durable history.
            return Ok(None);
        }

        let header = self.backend.read_at(start, HEADER_SIZE)?;

        if header[0..4] != WAL_MAGIC {
            return Err(EngineError::wal_corruption(format!(
                "invalid magic at offset {start}"
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > WAL_VERSION {
            return Err(EngineError::wal_corruption(format!(
                "unsupported format version {version} at offset {start}"
            )));
        }

        let type_byte = header[6];
        let record_type = WalRecordType::from_byte(type_byte).ok_or_else(|| {
            EngineError::wal_corruption(format!(
                "unknown record type {type_byte} at offset {start}"
            ))
        })?;

        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if remaining < total_len {
            // Torn payload at the tail: end of durable history.
            return Ok(None);
        }

        let body = self
            .backend
            .read_at(start + HEADER_SIZE as u64, payload_len + CRC_SIZE)?;
        let payload = &body[..payload_len];
        let stored_crc = u32::from_le_bytes([
            body[payload_len],
            body[payload_len + 1],
            body[payload_len + 2],
            body[payload_len + 3],
        ]);

        let mut checked = header;
        checked.extend_from_slice(payload);
        let computed_crc = compute_crc32(&checked);
        if stored_crc != computed_crc {
            return Err(EngineError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let record = WalRecord::decode_payload(record_type, payload)?;
        self.offset += total_len as u64;
        Ok(Some((start, record)))
    }
}

impl Iterator for WalRecordIterator<'_> {
    type Item = EngineResult<(u64, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
