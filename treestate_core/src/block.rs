//! Binary store layout: file header, block headers and checksums.
//!
//! A store file starts with a 16-byte header:
//! ```text
//! 0x00  4   "TSTS" magic
//! 0x04  1   format version (u8) = 1
//! 0x05  11  reserved (must be 0)
//! ```
//!
//! Every block is a 24-byte header followed by the payload:
//! ```text
//! 0x00  4   "TSBK" magic
//! 0x04  1   kind: 1=directory, 2=root
//! 0x05  1   compression: 0=none, 1=zstd
//! 0x06  2   reserved (must be 0)
//! 0x08  8   payload_len (u64 LE) - stored size
//! 0x10  8   checksum: first 8 bytes of BLAKE3(stored payload)
//! 0x18  ... payload
//! ```
//!
//! A block's id is the offset of its header. Root blocks are followed by an
//! 8-byte trailer holding their own offset.

use crate::error::{Error, Result};

/// Magic bytes at the start of a store file.
pub const FILE_MAGIC: &[u8; 4] = b"TSTS";

/// Current store format version.
pub const FORMAT_VERSION: u8 = 1;

/// Size of the store file header in bytes.
pub const FILE_HEADER_SIZE: usize = 16;

/// Magic bytes at the start of every block.
pub const BLOCK_MAGIC: &[u8; 4] = b"TSBK";

/// Size of a block header in bytes.
pub const BLOCK_HEADER_SIZE: usize = 24;

/// Size of the trailer written after each root block.
pub const TRAILER_SIZE: usize = 8;

/// Offset of a block within a store file.
pub type BlockId = u64;

/// Block kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// A serialized directory node.
    Directory = 1,
    /// A root record naming a generation.
    Root = 2,
}

impl BlockKind {
    /// Convert to byte representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(BlockKind::Directory),
            2 => Some(BlockKind::Root),
            _ => None,
        }
    }

    /// Get the string name of this block kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Directory => "directory",
            BlockKind::Root => "root",
        }
    }
}

/// Compression types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression.
    None = 0,
    /// Zstandard compression.
    Zstd = 1,
}

impl CompressionType {
    /// Convert to byte representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Zstd),
            _ => None,
        }
    }
}

/// Checksum of a stored payload.
pub fn checksum(payload: &[u8]) -> [u8; 8] {
    let digest = blake3::hash(payload);
    let mut sum = [0u8; 8];
    sum.copy_from_slice(&digest.as_bytes()[..8]);
    sum
}

/// Encode the store file header.
pub fn encode_file_header() -> [u8; FILE_HEADER_SIZE] {
    let mut buf = [0u8; FILE_HEADER_SIZE];
    buf[0..4].copy_from_slice(FILE_MAGIC);
    buf[4] = FORMAT_VERSION;
    buf
}

/// Validate a store file header.
pub fn check_file_header(buf: &[u8]) -> Result<()> {
    if buf.len() < FILE_HEADER_SIZE {
        return Err(Error::corrupt_store(
            0,
            format!(
                "File header too short: {} bytes (expected {})",
                buf.len(),
                FILE_HEADER_SIZE
            ),
        ));
    }

    if &buf[0..4] != FILE_MAGIC {
        return Err(Error::corrupt_store(
            0,
            format!("Invalid magic: expected {:?}, got {:?}", FILE_MAGIC, &buf[0..4]),
        ));
    }

    if buf[4] != FORMAT_VERSION {
        return Err(Error::corrupt_store(
            0,
            format!(
                "Unsupported version: {} (expected {})",
                buf[4], FORMAT_VERSION
            ),
        ));
    }

    Ok(())
}

/// A 24-byte block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// What the payload holds.
    pub kind: BlockKind,
    /// How the payload is stored.
    pub compression: CompressionType,
    /// Length of the stored payload in bytes.
    pub payload_len: u64,
    /// Checksum of the stored payload.
    pub checksum: [u8; 8],
}

impl BlockHeader {
    /// Create the header for a stored payload.
    pub fn for_payload(kind: BlockKind, compression: CompressionType, stored: &[u8]) -> Self {
        Self {
            kind,
            compression,
            payload_len: stored.len() as u64,
            checksum: checksum(stored),
        }
    }

    /// Encode the header to a 24-byte array.
    pub fn encode(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE];

        // Magic (4 bytes)
        buf[0..4].copy_from_slice(BLOCK_MAGIC);

        // Kind and compression (1 byte each), 2 reserved bytes stay zero
        buf[4] = self.kind.to_u8();
        buf[5] = self.compression.to_u8();

        // Payload length (8 bytes, little-endian)
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());

        // Checksum (8 bytes)
        buf[16..24].copy_from_slice(&self.checksum);

        buf
    }

    /// Decode a header read from `offset`.
    pub fn decode(buf: &[u8], offset: BlockId) -> Result<Self> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return Err(Error::corrupt_store(
                offset,
                format!(
                    "Block header too short: {} bytes (expected {})",
                    buf.len(),
                    BLOCK_HEADER_SIZE
                ),
            ));
        }

        if &buf[0..4] != BLOCK_MAGIC {
            return Err(Error::corrupt_store(offset, "Invalid block magic"));
        }

        let kind = BlockKind::from_u8(buf[4]).ok_or_else(|| {
            Error::corrupt_store(offset, format!("Invalid block kind: {}", buf[4]))
        })?;

        let compression = CompressionType::from_u8(buf[5]).ok_or_else(|| {
            Error::corrupt_store(offset, format!("Invalid compression type: {}", buf[5]))
        })?;

        if buf[6] != 0 || buf[7] != 0 {
            return Err(Error::corrupt_store(offset, "Reserved header bytes must be 0"));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[8..16]);

        let mut checksum = [0u8; 8];
        checksum.copy_from_slice(&buf[16..24]);

        Ok(Self {
            kind,
            compression,
            payload_len: u64::from_le_bytes(len_bytes),
            checksum,
        })
    }

    /// Verify a stored payload against this header.
    pub fn verify(&self, stored: &[u8], offset: BlockId) -> Result<()> {
        let computed = checksum(stored);
        if computed != self.checksum {
            return Err(Error::corrupt_store(
                offset,
                format!(
                    "Checksum mismatch: expected {}, got {}",
                    hex::encode(self.checksum),
                    hex::encode(computed)
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_conversions() {
        assert_eq!(BlockKind::Directory.to_u8(), 1);
        assert_eq!(BlockKind::Root.to_u8(), 2);
        assert_eq!(BlockKind::from_u8(1), Some(BlockKind::Directory));
        assert_eq!(BlockKind::from_u8(2), Some(BlockKind::Root));
        assert_eq!(BlockKind::from_u8(0), None);
        assert_eq!(BlockKind::from_u8(3), None);
    }

    #[test]
    fn test_header_encode_decode() {
        let header = BlockHeader::for_payload(BlockKind::Root, CompressionType::None, b"payload");
        let encoded = header.encode();

        assert_eq!(encoded.len(), BLOCK_HEADER_SIZE);
        assert_eq!(&encoded[0..4], BLOCK_MAGIC);

        let decoded = BlockHeader::decode(&encoded, 16).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.verify(b"payload", 16).is_ok());
    }

    #[test]
    fn test_header_decode_invalid_magic() {
        let mut buf =
            BlockHeader::for_payload(BlockKind::Directory, CompressionType::None, b"").encode();
        buf[0..4].copy_from_slice(b"XXXX");

        assert!(matches!(
            BlockHeader::decode(&buf, 40),
            Err(Error::CorruptStore { offset: 40, .. })
        ));
    }

    #[test]
    fn test_header_decode_invalid_kind_and_compression() {
        let good = BlockHeader::for_payload(BlockKind::Directory, CompressionType::Zstd, b"x");

        let mut buf = good.encode();
        buf[4] = 99;
        assert!(BlockHeader::decode(&buf, 16).is_err());

        let mut buf = good.encode();
        buf[5] = 99;
        assert!(BlockHeader::decode(&buf, 16).is_err());

        let mut buf = good.encode();
        buf[6] = 1;
        assert!(BlockHeader::decode(&buf, 16).is_err());
    }

    #[test]
    fn test_header_too_short() {
        let buf = [0u8; 10];
        assert!(BlockHeader::decode(&buf, 16).is_err());
    }

    #[test]
    fn test_checksum_mismatch() {
        let header =
            BlockHeader::for_payload(BlockKind::Directory, CompressionType::None, b"original");
        assert!(matches!(
            header.verify(b"tampered", 64),
            Err(Error::CorruptStore { offset: 64, .. })
        ));
    }

    #[test]
    fn test_file_header() {
        let header = encode_file_header();
        assert!(check_file_header(&header).is_ok());

        let mut bad_version = header;
        bad_version[4] = 9;
        assert!(check_file_header(&bad_version).is_err());

        assert!(check_file_header(b"TSTS").is_err());
        assert!(check_file_header(&[0u8; FILE_HEADER_SIZE]).is_err());
    }
}
