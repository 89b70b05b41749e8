//! WAL record types and serialization.

use crate::error::{EngineError, EngineResult};
use crate::types::{Key, SequenceNumber, TransactionId};

/// Magic bytes identifying a WAL record.
pub const WAL_MAGIC: [u8; 4] = *b"LWAL";

/// Current WAL format version.
pub const WAL_VERSION: u16 = 1;

/// Type of WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// A committed write of one key.
    Write = 1,
    /// Marker terminating a commit's run of writes.
    Commit = 2,
}

impl WalRecordType {
    /// Converts a byte to a record type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Write),
            2 => Some(Self::Commit),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A WAL record.
///
/// Only committed operations appear in the log; there are no begin or
/// abort records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// A committed write of one key.
    Write {
        /// Commit sequence of the owning transaction.
        sequence: SequenceNumber,
        /// The committing transaction.
        txid: TransactionId,
        /// Key written.
        key: Key,
        /// Value written.
        value: Vec<u8>,
    },

    /// Terminates a commit's run of `Write` records.
    ///
    /// Recovery applies a commit's writes only after seeing this marker.
    Commit {
        /// Commit sequence being finalized.
        sequence: SequenceNumber,
        /// The committing transaction.
        txid: TransactionId,
    },
}

/// Values larger than this cannot be framed by the 4-byte length fields.
pub const MAX_VALUE_SIZE: usize = u32::MAX as usize;

impl WalRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::Write { .. } => WalRecordType::Write,
            Self::Commit { .. } => WalRecordType::Commit,
        }
    }

    /// Returns the commit sequence the record belongs to.
    #[must_use]
    pub fn sequence(&self) -> SequenceNumber {
        match self {
            Self::Write { sequence, .. } | Self::Commit { sequence, .. } => *sequence,
        }
    }

    /// Returns the owning transaction.
    #[must_use]
    pub fn txid(&self) -> TransactionId {
        match self {
            Self::Write { txid, .. } | Self::Commit { txid, .. } => *txid,
        }
    }

    /// Serializes the record payload (without envelope).
    ///
    /// # Errors
    ///
    /// Returns an error if a `Write` value exceeds [`MAX_VALUE_SIZE`].
    pub fn encode_payload(&self) -> EngineResult<Vec<u8>> {
        let mut buf = Vec::new();

        match self {
            Self::Write {
                sequence,
                txid,
                key,
                value,
            } => {
                if value.len() > MAX_VALUE_SIZE {
                    return Err(EngineError::invalid_operation(format!(
                        "value of {} bytes exceeds the WAL frame limit",
                        value.len()
                    )));
                }
                buf.extend_from_slice(&sequence.as_u64().to_le_bytes());
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                let key_bytes = key.as_bytes();
                buf.extend_from_slice(&(key_bytes.len() as u32).to_le_bytes());
                buf.extend_from_slice(key_bytes);
                buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
                buf.extend_from_slice(value);
            }

            Self::Commit { sequence, txid } => {
                buf.extend_from_slice(&sequence.as_u64().to_le_bytes());
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
            }
        }

        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    ///
    /// # Errors
    ///
    /// Returns a corruption error on short, overlong, or malformed
    /// payloads.
    pub fn decode_payload(record_type: WalRecordType, payload: &[u8]) -> EngineResult<Self> {
        let mut cursor = 0;

        let read_u64 = |cursor: &mut usize| -> EngineResult<u64> {
            let end = *cursor + 8;
            if end > payload.len() {
                return Err(EngineError::wal_corruption("unexpected end of payload"));
            }
            let bytes: [u8; 8] = payload[*cursor..end]
                .try_into()
                .map_err(|_| EngineError::wal_corruption("invalid u64"))?;
            *cursor = end;
            Ok(u64::from_le_bytes(bytes))
        };

        let read_u32 = |cursor: &mut usize| -> EngineResult<u32> {
            let end = *cursor + 4;
            if end > payload.len() {
                return Err(EngineError::wal_corruption("unexpected end of payload"));
            }
            let bytes: [u8; 4] = payload[*cursor..end]
                .try_into()
                .map_err(|_| EngineError::wal_corruption("invalid u32"))?;
            *cursor = end;
            Ok(u32::from_le_bytes(bytes))
        };

        let read_bytes = |cursor: &mut usize, len: usize| -> EngineResult<Vec<u8>> {
            let end = cursor.checked_add(len).filter(|e| *e <= payload.len());
            let Some(end) = end else {
                return Err(EngineError::wal_corruption("unexpected end of payload"));
            };
            let bytes = payload[*cursor..end].to_vec();
            *cursor = end;
            Ok(bytes)
        };

        let record = match record_type {
            WalRecordType::Write => {
                let sequence = SequenceNumber::new(read_u64(&mut cursor)?);
                let txid = TransactionId::new(read_u64(&mut cursor)?);
                let key_len = read_u32(&mut cursor)? as usize;
                let key_bytes = read_bytes(&mut cursor, key_len)?;
                let key = String::from_utf8(key_bytes)
                    .map_err(|_| EngineError::wal_corruption("key is not valid UTF-8"))?;
                let value_len = read_u32(&mut cursor)? as usize;
                let value = read_bytes(&mut cursor, value_len)?;
                Self::Write {
                    sequence,
                    txid,
                    key: Key::new(key),
                    value,
                }
            }

            WalRecordType::Commit => {
                let sequence = SequenceNumber::new(read_u64(&mut cursor)?);
                let txid = TransactionId::new(read_u64(&mut cursor)?);
                Self::Commit { sequence, txid }
            }
        };

        if cursor != payload.len() {
            return Err(EngineError::wal_corruption(format!(
                "trailing bytes in {record_type:?} record: consumed {cursor} of {}",
                payload.len()
            )));
        }

        Ok(record)
    }
}

/// Computes the CRC32 checksum (IEEE polynomial) of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
