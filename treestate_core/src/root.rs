//! Root records: the entry point of one generation.
//!
//! Payload format:
//! ```text
//! 8   tree block id (u64 LE)
//! 2   union of the tree's flags (u16 LE)
//! 2   intersection of the tree's flags (u16 LE)
//! 8   file count (u64 LE)
//! 4   metadata length (u32 LE)
//! N   metadata
//! ```

use crate::block::{BlockId, FILE_HEADER_SIZE};
use crate::entry::read_bytes;
use crate::error::{Error, Result};
use crate::flags::{AggregatedState, StateFlags};
use std::io::Read;

/// Points at a generation's root directory and carries its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootRecord {
    /// Block id of the root directory.
    pub tree: BlockId,
    /// Aggregated flags of the whole tree.
    pub aggregate: AggregatedState,
    /// Number of files in the tree.
    pub file_count: u64,
    /// Caller-defined metadata.
    pub metadata: Vec<u8>,
}

impl RootRecord {
    /// Encode the record payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let metadata_len = metadata_len(self.metadata.len())?;
        let mut buf = Vec::with_capacity(24 + self.metadata.len());
        buf.extend_from_slice(&self.tree.to_le_bytes());
        buf.extend_from_slice(&self.aggregate.union.bits().to_le_bytes());
        buf.extend_from_slice(&self.aggregate.intersection.bits().to_le_bytes());
        buf.extend_from_slice(&self.file_count.to_le_bytes());
        buf.extend_from_slice(&metadata_len.to_le_bytes());
        buf.extend_from_slice(&self.metadata);
        Ok(buf)
    }

    /// Decode the payload of the root block at `id`.
    pub fn decode(payload: &[u8], id: BlockId) -> Result<Self> {
        Self::decode_fields(payload, id).map_err(|e| e.at_offset(id))
    }

    fn decode_fields(payload: &[u8], id: BlockId) -> Result<Self> {
        let mut reader = std::io::Cursor::new(payload);

        let mut u64_buf = [0u8; 8];
        reader.read_exact(&mut u64_buf)?;
        let tree = u64::from_le_bytes(u64_buf);
        if tree < FILE_HEADER_SIZE as u64 || tree >= id {
            return Err(Error::corrupt_store(
                id,
                format!("Invalid tree block id: {}", tree),
            ));
        }

        let mut u16_buf = [0u8; 2];
        reader.read_exact(&mut u16_buf)?;
        let union = StateFlags::from_stored(u16::from_le_bytes(u16_buf));
        reader.read_exact(&mut u16_buf)?;
        let intersection = StateFlags::from_stored(u16::from_le_bytes(u16_buf));
        let (Some(union), Some(intersection)) = (union, intersection) else {
            return Err(Error::corrupt_store(id, "Unknown state flags in root record"));
        };

        reader.read_exact(&mut u64_buf)?;
        let file_count = u64::from_le_bytes(u64_buf);

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let metadata = read_bytes(&mut reader, u32::from_le_bytes(len_buf))?;

        if reader.position() != payload.len() as u64 {
            return Err(Error::corrupt_store(id, "Trailing bytes after root record"));
        }

        Ok(Self {
            tree,
            aggregate: AggregatedState {
                union,
                intersection,
            },
            file_count,
            metadata,
        })
    }
}

fn metadata_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| Error::invalid_metadata(format!("{} bytes is too long to store", len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RootRecord {
        RootRecord {
            tree: 16,
            aggregate: AggregatedState::of_file(StateFlags::EXIST_NEXT),
            file_count: 3,
            metadata: b"p1=abc".to_vec(),
        }
    }

    #[test]
    fn test_root_record_roundtrip() {
        let encoded = record().encode().unwrap();
        assert_eq!(RootRecord::decode(&encoded, 200).unwrap(), record());
    }

    #[test]
    fn test_root_record_rejects_bad_tree_id() {
        let encoded = record().encode().unwrap();
        // The tree must precede its root record.
        assert!(matches!(
            RootRecord::decode(&encoded, 10),
            Err(Error::CorruptStore { offset: 10, .. })
        ));
    }

    #[test]
    fn test_root_record_truncated() {
        let encoded = record().encode().unwrap();
        assert!(matches!(
            RootRecord::decode(&encoded[..encoded.len() - 2], 200),
            Err(Error::CorruptStore { offset: 200, .. })
        ));
    }

    #[test]
    fn test_root_record_oversized_metadata_length() {
        let mut encoded = record().encode().unwrap();
        // The length field sits just before the six metadata bytes
        let len_at = encoded.len() - 6 - 4;
        encoded[len_at..len_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());

        assert!(matches!(
            RootRecord::decode(&encoded, 200),
            Err(Error::CorruptStore { offset: 200, .. })
        ));
    }

    #[test]
    fn test_metadata_length_limit() {
        assert_eq!(metadata_len(0).unwrap(), 0);
        assert_eq!(metadata_len(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(
            metadata_len(u32::MAX as usize + 1),
            Err(Error::InvalidMetadata { .. })
        ));
    }
}
