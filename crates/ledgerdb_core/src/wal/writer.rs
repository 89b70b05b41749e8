//! WAL writer.

use parking_lot::Mutex;

use ledgerdb_storage::StorageBackend;

use crate::error::{EngineError, EngineResult};
use crate::wal::record::{compute_crc32, WalRecord, WAL_MAGIC, WAL_VERSION};

/// Envelope header size: magic (4) + version (2) + type (1) + length (4).
pub(super) const HEADER_SIZE: usize = 11;

/// CRC trailer size.
pub(super) const CRC_SIZE: usize = 4;

/// Append-only writer (and recovery reader) over a storage backend.
pub struct WalManager {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_write: bool,
}

impl WalManager {
    /// Creates a WAL manager over the given backend.
    ///
    /// With `sync_on_write` set, every append is flushed immediately;
    /// otherwise flushing is left to the commit path.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            sync_on_write,
        }
    }

    /// Appends a record, returning the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or the backend
    /// write fails.
    pub fn append(&self, record: &WalRecord) -> EngineResult<u64> {
        let payload = record.encode_payload()?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&WAL_MAGIC);
        data.extend_from_slice(&WAL_VERSION.to_le_bytes());
        data.push(record.record_type().as_byte());
        let len = u32::try_from(payload.len())
            .map_err(|_| EngineError::invalid_operation("WAL record payload too large"))?;
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());

        let mut backend = self.backend.lock();
        let offset = backend.append(&data)?;
        if self.sync_on_write {
            backend.flush()?;
        }
        Ok(offset)
    }

    /// Flushes pending writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend flush fails.
    pub fn flush(&self) -> EngineResult<()> {
        self.backend.lock().flush()?;
        Ok(())
    }

    /// Returns the current log size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn size(&self) -> EngineResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Returns a streaming iterator over the log's records.
    ///
    /// The iterator holds the backend lock for its lifetime; appends
    /// block until it is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub fn iter(&self) -> EngineResult<super::WalRecordIterator<'_>> {
        super::WalRecordIterator::new(self.backend.lock())
    }

    /// Reads every record into memory.
    ///
    /// Convenient for tests and small logs; recovery uses `iter`.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption or I/O failure.
    pub fn read_all(&self) -> EngineResult<Vec<(u64, WalRecord)>> {
        self.iter()?.collect()
    }

    /// Returns the raw log bytes, for crash-simulation tests.
    #[cfg(test)]
    pub(crate) fn raw_bytes(&self) -> EngineResult<Vec<u8>> {
        let backend = self.backend.lock();
        let size = backend.size()?;
        Ok(backend.read_at(0, size as usize)?)
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}
