//! Writing generations: flush into the open store, or save into a new one.

use crate::block::{BlockId, BlockKind};
use crate::error::{Error, Result};
use crate::flags::AggregatedState;
use crate::node::{Child, DirectoryEncoder, DirectoryNode, NodeRef};
use crate::root::RootRecord;
use crate::state::TreeState;
use crate::store::Store;
use std::fs;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

impl TreeState {
    /// Write all unflushed changes and a new root record; returns the new
    /// root id.
    ///
    /// Unmodified subtrees are referenced by their existing ids. Flushing a
    /// clean handle returns its current root id without writing anything.
    /// On failure the in-memory state is kept and the flush may be retried.
    pub fn flush(&mut self) -> Result<BlockId> {
        if let (false, Some(root_id)) = (self.dirty, self.root_id) {
            return Ok(root_id);
        }

        let mut written = 0;
        let (tree, aggregate) = match self.root {
            NodeRef::Stored { id, aggregate } => (id, aggregate),
            NodeRef::Dirty(index) => self.write_dirty(index, &mut written)?,
        };
        self.root = NodeRef::Stored { id: tree, aggregate };
        self.arena.clear();

        let record = RootRecord {
            tree,
            aggregate,
            file_count: self.file_count,
            metadata: self.metadata.clone(),
        };
        let root_id = self.store.append_root(&record.encode()?)?;
        self.store.sync()?;

        self.root_id = Some(root_id);
        self.dirty = false;

        debug!(
            root_id,
            files = self.file_count,
            blocks = written,
            "flushed tree state"
        );
        Ok(root_id)
    }

    /// Write a dirty node and its dirty descendants, children first.
    ///
    /// The written node moves to the loaded cache. If writing fails it is
    /// put back, with whatever children were already written now stored.
    fn write_dirty(
        &mut self,
        index: usize,
        written: &mut usize,
    ) -> Result<(BlockId, AggregatedState)> {
        let mut node = std::mem::take(&mut self.arena[index]);
        match self.write_node(&mut node, written) {
            Ok((id, aggregate)) => {
                self.loaded.insert(id, node);
                Ok((id, aggregate))
            }
            Err(e) => {
                self.arena[index] = node;
                Err(e)
            }
        }
    }

    fn write_node(
        &mut self,
        node: &mut DirectoryNode,
        written: &mut usize,
    ) -> Result<(BlockId, AggregatedState)> {
        let mut encoder = DirectoryEncoder::new(node.children.len());

        for (name, child) in node.children.iter_mut() {
            match child {
                Child::File(entry) => encoder.file(name, entry)?,
                Child::Directory(dir) => {
                    let (id, aggregate) = match *dir {
                        NodeRef::Stored { id, aggregate } => (id, aggregate),
                        NodeRef::Dirty(index) => {
                            let (id, aggregate) = self.write_dirty(index, written)?;
                            *dir = NodeRef::Stored { id, aggregate };
                            (id, aggregate)
                        }
                    };
                    encoder.directory(name, id, aggregate);
                }
            }
        }

        let (payload, aggregate) = encoder.finish();
        let id = self.store.append_block(BlockKind::Directory, &payload)?;
        *written += 1;
        Ok((id, aggregate))
    }

    /// Write the current state, unflushed changes included, as a new
    /// self-contained store at `path`; returns its root id there.
    ///
    /// The store is assembled in a temporary file next to `path` and moved
    /// into place once complete. This handle is unaffected: it stays on its
    /// own store and keeps any unflushed changes.
    pub fn save_as<P: AsRef<Path>>(&mut self, path: P) -> Result<BlockId> {
        let dest = path.as_ref();
        if is_same_file(self.store.path(), dest) {
            return Err(Error::invalid_path(
                dest.as_os_str().as_encoded_bytes(),
                "cannot save over the open store",
            ));
        }

        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let temp = NamedTempFile::new_in(dir)?;
        let mut target = Store::from_file(
            dest.to_path_buf(),
            temp.as_file().try_clone()?,
            true,
            self.store.config().clone(),
        )?;

        let mut written = 0;
        let (tree, aggregate) = self.copy_node(self.root, &mut target, &mut written)?;
        let record = RootRecord {
            tree,
            aggregate,
            file_count: self.file_count,
            metadata: self.metadata.clone(),
        };
        let root_id = target.append_root(&record.encode()?)?;
        target.sync()?;
        drop(target);

        temp.persist(dest)?;

        debug!(
            dest = %dest.display(),
            root_id,
            files = self.file_count,
            blocks = written,
            "saved tree state"
        );
        Ok(root_id)
    }

    /// Copy a subtree into another store.
    fn copy_node(
        &mut self,
        node: NodeRef,
        target: &mut Store,
        written: &mut usize,
    ) -> Result<(BlockId, AggregatedState)> {
        let children: Vec<(Box<[u8]>, Child)> = self
            .node(node)?
            .children
            .iter()
            .map(|(name, child)| (name.clone(), child.clone()))
            .collect();

        let mut encoder = DirectoryEncoder::new(children.len());
        for (name, child) in &children {
            match child {
                Child::File(entry) => encoder.file(name, entry)?,
                Child::Directory(dir) => {
                    let (id, aggregate) = self.copy_node(*dir, target, written)?;
                    encoder.directory(name, id, aggregate);
                }
            }
        }

        let (payload, aggregate) = encoder.finish();
        let id = target.append_block(BlockKind::Directory, &payload)?;
        *written += 1;
        Ok((id, aggregate))
    }
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        // The open store may not exist on disk yet
        _ => a == b,
    }
}
