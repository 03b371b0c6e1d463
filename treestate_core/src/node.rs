//! Directory nodes and their binary encoding.
//!
//! A directory payload is an entry count followed by the entries in name
//! order:
//! ```text
//! 4   entry count (u32 LE)
//! per entry:
//!   2   name length (u16 LE)
//!   N   name
//!   1   kind: 1=file, 2=directory
//!   file:      FileEntry fields (see entry.rs)
//!   directory: child block id (u64 LE), union (u16 LE), intersection (u16 LE)
//! ```
//!
//! Keeping the child's aggregated flags in the parent entry means a flush
//! never has to read an unmodified subtree.

use crate::block::{BlockId, FILE_HEADER_SIZE};
use crate::entry::FileEntry;
use crate::error::{Error, Result};
use crate::filtered::FilteredKeys;
use crate::flags::{AggregatedState, StateFlags};
use std::collections::BTreeMap;
use std::io::Read;

/// Entry kinds in a directory payload.
const KIND_FILE: u8 = 1;
const KIND_DIRECTORY: u8 = 2;

/// Reference to a directory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeRef {
    /// Written to the store; immutable.
    Stored {
        id: BlockId,
        aggregate: AggregatedState,
    },
    /// Index into the handle's arena of unflushed nodes.
    Dirty(usize),
}

impl NodeRef {
    /// Aggregated flags, known only for stored nodes.
    pub(crate) fn aggregate(&self) -> Option<AggregatedState> {
        match self {
            NodeRef::Stored { aggregate, .. } => Some(*aggregate),
            NodeRef::Dirty(_) => None,
        }
    }
}

/// A child of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Child {
    Directory(NodeRef),
    File(FileEntry),
}

/// A directory: children ordered by name.
#[derive(Debug, Clone, Default)]
pub(crate) struct DirectoryNode {
    pub(crate) children: BTreeMap<Box<[u8]>, Child>,
    pub(crate) filtered: Option<FilteredKeys>,
}

impl DirectoryNode {
    /// Mutable access to the children; drops the filtered-name cache.
    pub(crate) fn children_mut(&mut self) -> &mut BTreeMap<Box<[u8]>, Child> {
        self.filtered = None;
        &mut self.children
    }

    /// Decode the payload of the directory block at `id`.
    pub(crate) fn decode(payload: &[u8], id: BlockId) -> Result<Self> {
        Self::decode_entries(payload, id).map_err(|e| e.at_offset(id))
    }

    fn decode_entries(payload: &[u8], id: BlockId) -> Result<Self> {
        let mut reader = std::io::Cursor::new(payload);

        let mut count_buf = [0u8; 4];
        reader.read_exact(&mut count_buf)?;
        let count = u32::from_le_bytes(count_buf);

        let mut children = BTreeMap::new();
        let mut previous: Option<Box<[u8]>> = None;

        for _ in 0..count {
            let mut name_len_buf = [0u8; 2];
            reader.read_exact(&mut name_len_buf)?;
            let name_len = u16::from_le_bytes(name_len_buf) as usize;

            let mut name = vec![0u8; name_len];
            reader.read_exact(&mut name)?;
            check_name(&name).map_err(|reason| Error::corrupt_store(id, reason))?;
            let name = name.into_boxed_slice();

            // Canonical ordering: strictly increasing names
            if previous.as_ref().is_some_and(|prev| *prev >= name) {
                return Err(Error::corrupt_store(id, "Directory entries out of order"));
            }

            let mut kind_buf = [0u8; 1];
            reader.read_exact(&mut kind_buf)?;

            let child = match kind_buf[0] {
                KIND_FILE => Child::File(FileEntry::decode(&mut reader)?),
                KIND_DIRECTORY => {
                    let mut id_buf = [0u8; 8];
                    reader.read_exact(&mut id_buf)?;
                    let child_id = u64::from_le_bytes(id_buf);

                    // Children are always written before their parent.
                    if child_id < FILE_HEADER_SIZE as u64 || child_id >= id {
                        return Err(Error::corrupt_store(
                            id,
                            format!("Invalid child block id: {}", child_id),
                        ));
                    }

                    let union = read_flags(&mut reader, id)?;
                    let intersection = read_flags(&mut reader, id)?;
                    Child::Directory(NodeRef::Stored {
                        id: child_id,
                        aggregate: AggregatedState {
                            union,
                            intersection,
                        },
                    })
                }
                other => {
                    return Err(Error::corrupt_store(
                        id,
                        format!("Invalid entry kind: {}", other),
                    ));
                }
            };

            previous = Some(name.clone());
            children.insert(name, child);
        }

        if reader.position() != payload.len() as u64 {
            return Err(Error::corrupt_store(id, "Trailing bytes after directory entries"));
        }

        Ok(Self {
            children,
            filtered: None,
        })
    }
}

fn read_flags<R: Read>(reader: &mut R, id: BlockId) -> Result<StateFlags> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    let bits = u16::from_le_bytes(buf);
    StateFlags::from_stored(bits)
        .ok_or_else(|| Error::corrupt_store(id, format!("Unknown state flags: {:#06x}", bits)))
}

/// Check a single path component.
pub(crate) fn check_name(name: &[u8]) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty path component");
    }
    if name.len() > u16::MAX as usize {
        return Err("path component too long");
    }
    if name.contains(&b'/') {
        return Err("path component contains a separator");
    }
    Ok(())
}

/// Builds a directory payload entry by entry, in name order, while
/// aggregating the flags of everything added.
pub(crate) struct DirectoryEncoder {
    buf: Vec<u8>,
    aggregate: Option<AggregatedState>,
}

impl DirectoryEncoder {
    /// Start a payload holding `count` entries.
    pub(crate) fn new(count: usize) -> Self {
        let mut buf = Vec::with_capacity(4 + count * 32);
        buf.extend_from_slice(&(count as u32).to_le_bytes());
        Self {
            buf,
            aggregate: None,
        }
    }

    fn name(&mut self, name: &[u8]) {
        self.buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(name);
    }

    fn merge(&mut self, other: AggregatedState) {
        self.aggregate = Some(match self.aggregate {
            Some(current) => current.merge(other),
            None => other,
        });
    }

    /// Add a file entry.
    pub(crate) fn file(&mut self, name: &[u8], entry: &FileEntry) -> Result<()> {
        self.name(name);
        self.buf.push(KIND_FILE);
        entry.encode(&mut self.buf)?;
        self.merge(AggregatedState::of_file(entry.flags));
        Ok(())
    }

    /// Add a written subdirectory.
    pub(crate) fn directory(&mut self, name: &[u8], id: BlockId, aggregate: AggregatedState) {
        self.name(name);
        self.buf.push(KIND_DIRECTORY);
        self.buf.extend_from_slice(&id.to_le_bytes());
        self.buf.extend_from_slice(&aggregate.union.bits().to_le_bytes());
        self.buf.extend_from_slice(&aggregate.intersection.bits().to_le_bytes());
        self.merge(aggregate);
    }

    /// Finish, returning the payload and the directory's aggregate.
    pub(crate) fn finish(self) -> (Vec<u8>, AggregatedState) {
        (self.buf, self.aggregate.unwrap_or_default())
    }
}
