//! Normalized-name lookup (e.g. case-insensitive) against case-preserving
//! storage.
//!
//! Each directory memoizes a map from filtered name to stored name. The map
//! is tagged with the caller's filter id; a lookup with any other id rebuilds
//! it, since the filter behind the new id may normalize differently.

use crate::error::Result;
use crate::node::{Child, DirectoryNode};
use crate::state::{TreeState, split_path};
use std::collections::HashMap;

/// Filtered name -> first stored name (in name order) that filters to it.
#[derive(Debug, Clone)]
pub(crate) struct FilteredKeys {
    filter_id: u64,
    names: HashMap<Vec<u8>, Box<[u8]>>,
}

impl FilteredKeys {
    fn build<'a, F>(names: impl Iterator<Item = &'a Box<[u8]>>, filter_id: u64, filter: &mut F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8>,
    {
        let mut map = HashMap::new();
        for name in names {
            map.entry(filter(name)).or_insert_with(|| name.clone());
        }
        Self {
            filter_id,
            names: map,
        }
    }
}

impl DirectoryNode {
    /// Stored name whose filtered form is `key`, rebuilding the cache when
    /// `filter_id` differs from the one it was built with.
    pub(crate) fn filtered_name<F>(&mut self, key: &[u8], filter_id: u64, filter: &mut F) -> Option<&[u8]>
    where
        F: FnMut(&[u8]) -> Vec<u8>,
    {
        let stale = self
            .filtered
            .as_ref()
            .is_none_or(|cached| cached.filter_id != filter_id);
        if stale {
            self.filtered = Some(FilteredKeys::build(self.children.keys(), filter_id, filter));
        }

        self.filtered
            .as_ref()
            .and_then(|cached| cached.names.get(key))
            .map(|name| &name[..])
    }
}

impl TreeState {
    /// Resolve `path` through `filter`, returning the stored spelling.
    ///
    /// At each level the first child (in name order) whose filtered name
    /// equals the filtered query component is taken. Intermediate components
    /// must be directories; the last may be a file or a directory.
    pub fn get_filtered<F>(&mut self, path: &[u8], mut filter: F, filter_id: u64) -> Result<Option<Vec<u8>>>
    where
        F: FnMut(&[u8]) -> Vec<u8>,
    {
        let Ok((dirs, last)) = split_path(path) else {
            return Ok(None);
        };

        let mut current = self.root_ref();
        let mut resolved = Vec::with_capacity(path.len());

        for (depth, component) in dirs.iter().chain(std::iter::once(&last)).enumerate() {
            let key = filter(*component);
            let node = self.node_mut(current)?;

            let Some(name) = node.filtered_name(&key, filter_id, &mut filter) else {
                return Ok(None);
            };
            let name = name.to_vec();

            if depth < dirs.len() {
                match node.children.get(&name[..]) {
                    Some(Child::Directory(child)) => current = *child,
                    _ => return Ok(None),
                }
            }

            if !resolved.is_empty() {
                resolved.push(b'/');
            }
            resolved.extend_from_slice(&name);
        }

        Ok(Some(resolved))
    }
}
