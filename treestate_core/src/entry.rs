//! File entries: the leaf records of the tree.

use crate::error::{Error, Result};
use crate::flags::StateFlags;
use std::io::{self, Read};

/// Modification time meaning "unknown, re-check the file".
pub const MTIME_UNKNOWN: i64 = -1;

/// File mode (POSIX permissions).
pub type FileMode = u32;

/// The tracked state of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Status bits.
    pub flags: StateFlags,
    /// POSIX file mode.
    pub mode: FileMode,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, or [`MTIME_UNKNOWN`].
    pub mtime: i64,
    /// Copy source; present exactly when `flags` has COPIED.
    pub copied: Option<Vec<u8>>,
}

impl FileEntry {
    /// Create a new file entry.
    pub fn new(
        flags: StateFlags,
        mode: FileMode,
        size: u64,
        mtime: i64,
        copied: Option<Vec<u8>>,
    ) -> Result<Self> {
        let entry = Self {
            flags,
            mode,
            size,
            mtime,
            copied,
        };
        entry.validate()?;
        Ok(entry)
    }

    /// Check that `copied` and the COPIED flag agree.
    pub fn validate(&self) -> Result<()> {
        match (self.flags.contains(StateFlags::COPIED), &self.copied) {
            (true, None) => Err(Error::invalid_copy_source(
                "COPIED flag is set without a copy source",
            )),
            (false, Some(_)) => Err(Error::invalid_copy_source(
                "copy source given without the COPIED flag",
            )),
            (true, Some(source)) if source.is_empty() => {
                Err(Error::invalid_copy_source("copy source is empty"))
            }
            (true, Some(source)) => copy_source_len(source.len()).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Encode the entry fields, appending to `buf`.
    ///
    /// Format:
    /// - 2 bytes: flags (u16 LE)
    /// - 4 bytes: mode (u32 LE)
    /// - 8 bytes: size (u64 LE)
    /// - 8 bytes: mtime (i64 LE)
    /// - if COPIED: 4 bytes copy source length (u32 LE), then the bytes
    ///
    /// Nothing is appended if the copy source is too long to encode.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let copied_len = self
            .copied
            .as_ref()
            .map(|source| copy_source_len(source.len()))
            .transpose()?;

        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.mtime.to_le_bytes());

        if let (Some(source), Some(len)) = (&self.copied, copied_len) {
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(source);
        }
        Ok(())
    }

    /// Decode an entry from a reader.
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let mut flags_buf = [0u8; 2];
        reader.read_exact(&mut flags_buf)?;
        let raw_flags = u16::from_le_bytes(flags_buf);
        let flags = StateFlags::from_stored(raw_flags).ok_or_else(|| {
            Error::corrupt_store(0, format!("Unknown state flags: {:#06x}", raw_flags))
        })?;

        let mut mode_buf = [0u8; 4];
        reader.read_exact(&mut mode_buf)?;

        let mut size_buf = [0u8; 8];
        reader.read_exact(&mut size_buf)?;

        let mut mtime_buf = [0u8; 8];
        reader.read_exact(&mut mtime_buf)?;

        let copied = if flags.contains(StateFlags::COPIED) {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let len = u32::from_le_bytes(len_buf);
            if len == 0 {
                return Err(Error::corrupt_store(0, "Empty copy source"));
            }
            Some(read_bytes(reader, len)?)
        } else {
            None
        };

        Ok(Self {
            flags,
            mode: u32::from_le_bytes(mode_buf),
            size: u64::from_le_bytes(size_buf),
            mtime: i64::from_le_bytes(mtime_buf),
            copied,
        })
    }
}

/// Length prefix for a copy source.
fn copy_source_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        Error::invalid_copy_source(format!("copy source of {} bytes is too long", len))
    })
}

/// Read exactly `len` bytes, growing the buffer only as data arrives.
pub(crate) fn read_bytes<R: Read>(reader: &mut R, len: u32) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.by_ref().take(u64::from(len)).read_to_end(&mut buf)?;
    if buf.len() as u64 != u64::from(len) {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_encode_decode() {
        let entry = FileEntry::new(
            StateFlags::EXIST_P1 | StateFlags::COPIED,
            0o644,
            1024,
            MTIME_UNKNOWN,
            Some(b"src/old.rs".to_vec()),
        )
        .unwrap();

        let mut encoded = Vec::new();
        entry.encode(&mut encoded).unwrap();
        let decoded = FileEntry::decode(&mut std::io::Cursor::new(&encoded)).unwrap();

        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_copy_source_validation() {
        assert!(matches!(
            FileEntry::new(StateFlags::COPIED, 0o644, 0, 0, None),
            Err(Error::InvalidCopySource { .. })
        ));
        assert!(matches!(
            FileEntry::new(StateFlags::EXIST_P1, 0o644, 0, 0, Some(b"a".to_vec())),
            Err(Error::InvalidCopySource { .. })
        ));
        assert!(matches!(
            FileEntry::new(StateFlags::COPIED, 0o644, 0, 0, Some(Vec::new())),
            Err(Error::InvalidCopySource { .. })
        ));
        assert!(FileEntry::new(StateFlags::EXIST_NEXT, 0o755, 0, 0, None).is_ok());
    }

    #[test]
    fn test_decode_unknown_flags() {
        let mut encoded = Vec::new();
        FileEntry::new(StateFlags::EXIST_P1, 0, 0, 0, None)
            .unwrap()
            .encode(&mut encoded)
            .unwrap();
        encoded[1] = 0x80;

        let result = FileEntry::decode(&mut std::io::Cursor::new(&encoded));
        assert!(matches!(result, Err(Error::CorruptStore { .. })));
    }

    #[test]
    fn test_decode_truncated() {
        let mut encoded = Vec::new();
        FileEntry::new(StateFlags::COPIED, 0, 0, 0, Some(b"abc".to_vec()))
            .unwrap()
            .encode(&mut encoded)
            .unwrap();
        encoded.truncate(encoded.len() - 1);

        assert!(FileEntry::decode(&mut std::io::Cursor::new(&encoded)).is_err());
    }

    #[test]
    fn test_decode_oversized_copy_length() {
        let mut encoded = Vec::new();
        FileEntry::new(StateFlags::COPIED, 0, 0, 0, Some(b"abc".to_vec()))
            .unwrap()
            .encode(&mut encoded)
            .unwrap();
        // Claim a 4 GiB copy source backed by three bytes
        let len_at = encoded.len() - 3 - 4;
        encoded[len_at..len_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());

        let err = FileEntry::decode(&mut std::io::Cursor::new(&encoded)).unwrap_err();
        assert!(matches!(
            err,
            Error::Io { ref source } if source.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[test]
    fn test_copy_source_length_limit() {
        assert_eq!(copy_source_len(3).unwrap(), 3);
        assert_eq!(copy_source_len(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(
            copy_source_len(u32::MAX as usize + 1),
            Err(Error::InvalidCopySource { .. })
        ));
    }

    use proptest::prelude::*;

    fn arb_file_entry() -> impl Strategy<Value = FileEntry> {
        (
            0u16..(1 << 5),
            any::<u32>(),
            any::<u64>(),
            any::<i64>(),
            prop::option::of("[a-z/]{1,40}"),
        )
            .prop_map(|(bits, mode, size, mtime, copied)| {
                let mut flags = StateFlags::from_bits_truncate(bits);
                flags.set(StateFlags::COPIED, copied.is_some());
                FileEntry::new(flags, mode, size, mtime, copied.map(String::into_bytes)).unwrap()
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            max_shrink_iters: 10000,
            ..ProptestConfig::default()
        })]

        /// Entries survive encoding, including the mtime sentinel and copy sources.
        #[test]
        fn prop_file_entry_roundtrip(entry in arb_file_entry()) {
            let mut encoded = Vec::new();
            entry.encode(&mut encoded)?;
            let decoded = FileEntry::decode(&mut std::io::Cursor::new(&encoded))?;
            prop_assert_eq!(entry, decoded);
        }
    }
}
