//! The tree state handle and copy-on-write mutation.

use crate::block::{BlockId, BlockKind};
use crate::entry::FileEntry;
use crate::error::{Error, Result};
use crate::node::{Child, DirectoryNode, NodeRef, check_name};
use crate::root::RootRecord;
use crate::store::{Store, StoreConfig};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::Path;
use tracing::{debug, trace};

/// A versioned directory-state tree.
///
/// Mutations stay in memory until [`TreeState::flush`] or
/// [`TreeState::save_as`]; dropping the handle discards them.
#[derive(Debug)]
pub struct TreeState {
    pub(crate) store: Store,
    pub(crate) root: NodeRef,
    /// Nodes modified since the last flush, addressed by `NodeRef::Dirty`.
    pub(crate) arena: Vec<DirectoryNode>,
    /// Stored nodes read so far and still part of the tree. Never modified,
    /// apart from their filter cache; promoted or replaced nodes are evicted.
    pub(crate) loaded: HashMap<BlockId, DirectoryNode>,
    pub(crate) metadata: Vec<u8>,
    pub(crate) file_count: u64,
    pub(crate) root_id: Option<BlockId>,
    pub(crate) dirty: bool,
}

impl TreeState {
    /// Open the generation `root_id` of the store at `path`.
    ///
    /// Root id 0 is the empty tree and reads nothing. Opening never creates
    /// the store file; the first flush does.
    pub fn open<P: AsRef<Path>>(path: P, root_id: BlockId) -> Result<Self> {
        Self::open_with_config(path, root_id, StoreConfig::default())
    }

    /// Open a generation with explicit store tunables.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        root_id: BlockId,
        config: StoreConfig,
    ) -> Result<Self> {
        let store = Store::open_with_config(path, config)?;
        Self::from_store(store, root_id)
    }

    /// Open the most recently flushed generation, or an empty tree if the
    /// store has none.
    pub fn open_latest<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut store = Store::open(path)?;
        let root_id = store.latest_root()?.unwrap_or(0);
        Self::from_store(store, root_id)
    }

    fn from_store(mut store: Store, root_id: BlockId) -> Result<Self> {
        if root_id == 0 {
            return Ok(Self {
                store,
                root: NodeRef::Dirty(0),
                arena: vec![DirectoryNode::default()],
                loaded: HashMap::new(),
                metadata: Vec::new(),
                file_count: 0,
                root_id: None,
                dirty: true,
            });
        }

        let payload = store.read_root(root_id)?;
        let record = RootRecord::decode(&payload, root_id)?;
        debug!(
            path = %store.path().display(),
            root_id,
            files = record.file_count,
            "opened tree state"
        );

        Ok(Self {
            store,
            root: NodeRef::Stored {
                id: record.tree,
                aggregate: record.aggregate,
            },
            arena: Vec::new(),
            loaded: HashMap::new(),
            metadata: record.metadata,
            file_count: record.file_count,
            root_id: Some(root_id),
            dirty: false,
        })
    }

    /// Number of files in the tree.
    pub fn len(&self) -> u64 {
        self.file_count
    }

    /// Whether the tree holds no files.
    pub fn is_empty(&self) -> bool {
        self.file_count == 0
    }

    /// Metadata attached to the current generation.
    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    /// Replace the metadata; carried through flush and save-as.
    pub fn set_metadata(&mut self, metadata: &[u8]) {
        self.metadata = metadata.to_vec();
        self.mark_dirty();
    }

    /// Whether there are mutations not yet flushed.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Root id of the generation this handle mirrors, if it has no
    /// unflushed mutations.
    pub fn root_id(&self) -> Option<BlockId> {
        if self.dirty { None } else { self.root_id }
    }

    /// Path of the underlying store file.
    pub fn store_path(&self) -> &Path {
        self.store.path()
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn root_ref(&self) -> NodeRef {
        self.root
    }

    /// Read-only access to a node, loading it if needed.
    pub(crate) fn node(&mut self, node: NodeRef) -> Result<&DirectoryNode> {
        self.node_mut(node).map(|n| &*n)
    }

    /// Access to a node for its filter cache. Stored nodes must not have
    /// their children changed through this.
    pub(crate) fn node_mut(&mut self, node: NodeRef) -> Result<&mut DirectoryNode> {
        match node {
            NodeRef::Dirty(index) => Ok(&mut self.arena[index]),
            NodeRef::Stored { id, .. } => match self.loaded.entry(id) {
                Entry::Occupied(entry) => Ok(entry.into_mut()),
                Entry::Vacant(entry) => Ok(entry.insert(read_node(&mut self.store, id)?)),
            },
        }
    }

    /// Arena index for a node, moving a stored node into the arena first.
    ///
    /// The caller replaces every reference to the stored id, so the node
    /// leaves the loaded cache.
    fn make_dirty(&mut self, node: NodeRef) -> Result<usize> {
        match node {
            NodeRef::Dirty(index) => Ok(index),
            NodeRef::Stored { id, .. } => {
                let mut node = match self.loaded.remove(&id) {
                    Some(node) => node,
                    None => read_node(&mut self.store, id)?,
                };
                node.filtered = None;
                self.arena.push(node);
                Ok(self.arena.len() - 1)
            }
        }
    }

    /// Drop the cached stored nodes of a subtree that left the tree.
    fn evict(&mut self, node: NodeRef) {
        let subdirs = |node: &DirectoryNode| -> Vec<NodeRef> {
            node.children
                .values()
                .filter_map(|child| match child {
                    Child::Directory(dir) => Some(*dir),
                    Child::File(_) => None,
                })
                .collect()
        };

        let dirs = match node {
            NodeRef::Dirty(index) => subdirs(&self.arena[index]),
            NodeRef::Stored { id, .. } => match self.loaded.remove(&id) {
                Some(removed) => subdirs(&removed),
                // Never loaded, so neither was anything below it
                None => return,
            },
        };
        for dir in dirs {
            self.evict(dir);
        }
    }

    /// Resolve a chain of directory names from the root.
    pub(crate) fn find_dir(&mut self, dirs: &[&[u8]]) -> Result<Option<NodeRef>> {
        let mut current = self.root;
        for name in dirs {
            match self.node(current)?.children.get(*name) {
                Some(Child::Directory(child)) => current = *child,
                _ => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Make every directory along `dirs` dirty, creating missing ones and
    /// replacing files that are in the way. Returns the arena index of the
    /// last directory.
    fn dirty_path(&mut self, dirs: &[&[u8]]) -> Result<usize> {
        let mut index = self.make_dirty(self.root)?;
        self.root = NodeRef::Dirty(index);

        for name in dirs {
            let existing = match self.arena[index].children.get(*name) {
                Some(Child::Directory(child)) => Some(*child),
                _ => None,
            };

            let next = match existing {
                Some(NodeRef::Dirty(next)) => next,
                Some(stored) => {
                    let next = self.make_dirty(stored)?;
                    self.arena[index]
                        .children
                        .insert((*name).into(), Child::Directory(NodeRef::Dirty(next)));
                    next
                }
                None => {
                    self.arena.push(DirectoryNode::default());
                    let next = self.arena.len() - 1;
                    self.arena[index]
                        .children_mut()
                        .insert((*name).into(), Child::Directory(NodeRef::Dirty(next)));
                    next
                }
            };
            index = next;
        }

        Ok(index)
    }

    /// Number of files a new file at `dirs/name` would displace.
    ///
    /// Loads every node on the path, so the mutation that follows cannot fail
    /// halfway through.
    fn displaced_files(&mut self, dirs: &[&[u8]], name: &[u8]) -> Result<u64> {
        let mut current = self.root;
        for dir in dirs {
            match self.node(current)?.children.get(*dir) {
                Some(Child::Directory(child)) => current = *child,
                // A file in the way is replaced by a directory
                Some(Child::File(_)) => return Ok(1),
                None => return Ok(0),
            }
        }

        let target = match self.node(current)?.children.get(name) {
            Some(Child::File(_)) => return Ok(1),
            Some(Child::Directory(child)) => *child,
            None => return Ok(0),
        };
        self.count_files(target)
    }

    /// Count the files below a directory.
    fn count_files(&mut self, node: NodeRef) -> Result<u64> {
        let (files, dirs) = {
            let node = self.node(node)?;
            let mut files = 0;
            let mut dirs = Vec::new();
            for child in node.children.values() {
                match child {
                    Child::File(_) => files += 1,
                    Child::Directory(dir) => dirs.push(*dir),
                }
            }
            (files, dirs)
        };

        let mut total = files;
        for dir in dirs {
            total += self.count_files(dir)?;
        }
        Ok(total)
    }

    /// Insert or replace the file at `path`.
    ///
    /// Missing parent directories are created. Whatever occupies `path` (a
    /// file or a whole directory), and any file standing where a parent
    /// directory belongs, is replaced.
    pub fn insert(&mut self, path: &[u8], entry: FileEntry) -> Result<()> {
        entry.validate()?;
        let (dirs, name) = split_path(path)?;

        let displaced = self.displaced_files(&dirs, name)?;
        let parent = self.dirty_path(&dirs)?;
        let replaced = self.arena[parent]
            .children_mut()
            .insert(name.into(), Child::File(entry));
        if let Some(Child::Directory(dir)) = replaced {
            self.evict(dir);
        }

        self.file_count = self.file_count - displaced + 1;
        self.mark_dirty();
        Ok(())
    }

    /// Remove the file at `path`. Returns whether a file was removed.
    ///
    /// Directories left empty are kept.
    pub fn remove(&mut self, path: &[u8]) -> Result<bool> {
        let Ok((dirs, name)) = split_path(path) else {
            return Ok(false);
        };

        let Some(parent) = self.find_dir(&dirs)? else {
            return Ok(false);
        };
        if !matches!(self.node(parent)?.children.get(name), Some(Child::File(_))) {
            return Ok(false);
        }

        let parent = self.dirty_path(&dirs)?;
        self.arena[parent].children_mut().remove(name);

        self.file_count -= 1;
        self.mark_dirty();
        Ok(true)
    }
}

fn read_node(store: &mut Store, id: BlockId) -> Result<DirectoryNode> {
    let payload = store.read_block(id, BlockKind::Directory)?;
    let node = DirectoryNode::decode(&payload, id)?;
    trace!(id, children = node.children.len(), "loaded directory");
    Ok(node)
}

/// Split a path into its directory names and final name.
pub(crate) fn split_path(path: &[u8]) -> Result<(Vec<&[u8]>, &[u8])> {
    let mut components: Vec<&[u8]> = path.split(|&b| b == b'/').collect();
    for component in &components {
        check_name(component).map_err(|reason| Error::invalid_path(path, reason))?;
    }
    // split always yields at least one component
    let name = components.pop().unwrap_or_default();
    Ok((components, name))
}

/// Split a directory path, tolerating one trailing separator. The empty
/// path and "/" name the root.
pub(crate) fn split_dir(path: &[u8]) -> Option<Vec<&[u8]>> {
    let path = path.strip_suffix(b"/").unwrap_or(path);
    if path.is_empty() {
        return Some(Vec::new());
    }
    let components: Vec<&[u8]> = path.split(|&b| b == b'/').collect();
    if components.iter().any(|c| check_name(c).is_err()) {
        return None;
    }
    Some(components)
}
