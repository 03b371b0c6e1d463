//! Point lookups, filtered walks and path completion.

use crate::entry::FileEntry;
use crate::error::Result;
use crate::flags::StateFlags;
use crate::node::{Child, NodeRef};
use crate::state::{TreeState, split_dir, split_path};
use std::ops::Bound;

/// A child that survived a listing filter.
enum Listed {
    File,
    Directory(NodeRef),
}

impl TreeState {
    /// Look up the file at `path`.
    ///
    /// Directories and malformed paths are reported as absent.
    pub fn get(&mut self, path: &[u8]) -> Result<Option<FileEntry>> {
        let Ok((dirs, name)) = split_path(path) else {
            return Ok(None);
        };
        let Some(dir) = self.find_dir(&dirs)? else {
            return Ok(None);
        };
        match self.node(dir)?.children.get(name) {
            Some(Child::File(entry)) => Ok(Some(entry.clone())),
            _ => Ok(None),
        }
    }

    /// Whether a file exists at `path`.
    pub fn contains(&mut self, path: &[u8]) -> Result<bool> {
        Ok(self.get(path)?.is_some())
    }

    /// Whether a directory exists at `path`.
    ///
    /// The empty path and "/" name the root, which always exists. A single
    /// trailing "/" is accepted. Directories left empty by removals still
    /// count.
    pub fn has_dir(&mut self, path: &[u8]) -> Result<bool> {
        let Some(dirs) = split_dir(path) else {
            return Ok(false);
        };
        Ok(self.find_dir(&dirs)?.is_some())
    }

    /// Paths of all files whose flags contain `set` and avoid `unset`, in
    /// depth-first name order.
    pub fn walk(&mut self, set: StateFlags, unset: StateFlags) -> Result<Vec<Vec<u8>>> {
        let mut paths = Vec::new();
        let mut collect = |path: &[u8]| -> Result<()> {
            paths.push(path.to_vec());
            Ok(())
        };

        let root = self.root_ref();
        self.visit_files(root, &mut Vec::new(), set, unset, &mut collect)?;
        Ok(paths)
    }

    /// Complete `prefix` against the tree.
    ///
    /// The prefix is split at its last "/" into a directory and a partial
    /// name. Matching files directly in that directory are visited by path.
    /// Matching subdirectories are visited as `dir/` when they hold at least
    /// one matching file, or, with `full_paths`, expanded into every matching
    /// file below them. An error from `visit` stops completion.
    pub fn path_complete<F>(
        &mut self,
        prefix: &[u8],
        set: StateFlags,
        unset: StateFlags,
        full_paths: bool,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let (dir_part, partial) = match prefix.iter().rposition(|&b| b == b'/') {
            Some(pos) => prefix.split_at(pos + 1),
            None => (&b""[..], prefix),
        };

        let Some(dirs) = split_dir(dir_part) else {
            return Ok(());
        };
        let Some(dir) = self.find_dir(&dirs)? else {
            return Ok(());
        };

        // "/" is the root; completions are relative
        let mut path = if dirs.is_empty() {
            Vec::new()
        } else {
            dir_part.to_vec()
        };

        for (name, listed) in self.listing(dir, set, unset, partial)? {
            let len = path.len();
            path.extend_from_slice(&name);
            match listed {
                Listed::File => visit(&path[..])?,
                Listed::Directory(child) => {
                    path.push(b'/');
                    if full_paths {
                        self.visit_files(child, &mut path, set, unset, &mut visit)?;
                    } else if self.has_match(child, set, unset)? {
                        visit(&path[..])?;
                    }
                }
            }
            path.truncate(len);
        }

        Ok(())
    }

    /// Visit every matching file below `node`. `prefix` is empty or ends
    /// with "/".
    fn visit_files<F>(
        &mut self,
        node: NodeRef,
        prefix: &mut Vec<u8>,
        set: StateFlags,
        unset: StateFlags,
        visit: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        for (name, listed) in self.listing(node, set, unset, b"")? {
            let len = prefix.len();
            prefix.extend_from_slice(&name);
            match listed {
                Listed::File => visit(&prefix[..])?,
                Listed::Directory(dir) => {
                    prefix.push(b'/');
                    self.visit_files(dir, prefix, set, unset, visit)?;
                }
            }
            prefix.truncate(len);
        }
        Ok(())
    }

    /// Whether any file below `node` matches.
    fn has_match(&mut self, node: NodeRef, set: StateFlags, unset: StateFlags) -> Result<bool> {
        let mut dirs = Vec::new();
        for (_, listed) in self.listing(node, set, unset, b"")? {
            match listed {
                Listed::File => return Ok(true),
                Listed::Directory(dir) => dirs.push(dir),
            }
        }
        for dir in dirs {
            if self.has_match(dir, set, unset)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Children of `node` whose names start with `name_prefix`, keeping
    /// matching files and the subdirectories whose aggregate allows a match.
    fn listing(
        &mut self,
        node: NodeRef,
        set: StateFlags,
        unset: StateFlags,
        name_prefix: &[u8],
    ) -> Result<Vec<(Box<[u8]>, Listed)>> {
        let node = self.node(node)?;
        let listed = node
            .children
            .range::<[u8], _>((Bound::Included(name_prefix), Bound::Unbounded))
            .take_while(|(name, _)| name.starts_with(name_prefix))
            .filter_map(|(name, child)| {
                let listed = match child {
                    Child::File(entry) => entry.flags.matches(set, unset).then_some(Listed::File)?,
                    Child::Directory(dir) => {
                        let may_match = dir
                            .aggregate()
                            .is_none_or(|aggregate| aggregate.may_match(set, unset));
                        may_match.then_some(Listed::Directory(*dir))?
                    }
                };
                Some((name.clone(), listed))
            })
            .collect();
        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::TempDir;

    fn entry(flags: StateFlags) -> FileEntry {
        FileEntry::new(flags, 0o644, 0, 0, None).unwrap()
    }

    fn tree_with(temp_dir: &TempDir, paths: &[(&str, StateFlags)]) -> TreeState {
        let mut tree = TreeState::open(temp_dir.path().join("state"), 0).unwrap();
        for (path, flags) in paths {
            tree.insert(path.as_bytes(), entry(*flags)).unwrap();
        }
        tree
    }

    fn complete(tree: &mut TreeState, prefix: &str, full: bool) -> Vec<String> {
        let mut out = Vec::new();
        tree.path_complete(
            prefix.as_bytes(),
            StateFlags::empty(),
            StateFlags::empty(),
            full,
            |path| {
                out.push(String::from_utf8(path.to_vec()).unwrap());
                Ok(())
            },
        )
        .unwrap();
        out
    }

    #[test]
    fn test_get_and_contains() {
        let temp_dir = TempDir::new().unwrap();
        let mut tree = tree_with(&temp_dir, &[("a/b", StateFlags::EXIST_P1)]);

        assert_eq!(tree.get(b"a/b").unwrap(), Some(entry(StateFlags::EXIST_P1)));
        assert!(tree.contains(b"a/b").unwrap());
        // Directories are not files
        assert!(!tree.contains(b"a").unwrap());
        assert!(!tree.contains(b"a/b/c").unwrap());
        assert!(!tree.contains(b"a//b").unwrap());
        assert!(!tree.contains(b"").unwrap());
    }

    #[test]
    fn test_has_dir() {
        let temp_dir = TempDir::new().unwrap();
        let mut tree = tree_with(&temp_dir, &[]);
        assert!(tree.has_dir(b"/").unwrap());
        assert!(tree.has_dir(b"").unwrap());
        assert!(!tree.has_dir(b"a").unwrap());

        tree.insert(b"a/b/c", entry(StateFlags::EXIST_P1)).unwrap();
        tree.remove(b"a/b/c").unwrap();
        assert!(tree.has_dir(b"a").unwrap());
        assert!(tree.has_dir(b"a/b/").unwrap());
        assert!(!tree.has_dir(b"a/b/c").unwrap());
        assert!(!tree.has_dir(b"a//").unwrap());
    }

    #[test]
    fn test_walk_filters() {
        let temp_dir = TempDir::new().unwrap();
        let mut tree = tree_with(
            &temp_dir,
            &[
                ("x/ignored", StateFlags::IGNORED),
                ("x/tracked", StateFlags::EXIST_P1 | StateFlags::EXIST_NEXT),
                ("added", StateFlags::EXIST_NEXT),
            ],
        );

        let all = tree.walk(StateFlags::empty(), StateFlags::empty()).unwrap();
        assert_eq!(
            all,
            vec![b"added".to_vec(), b"x/ignored".to_vec(), b"x/tracked".to_vec()]
        );

        let next = tree.walk(StateFlags::EXIST_NEXT, StateFlags::EXIST_P1).unwrap();
        assert_eq!(next, vec![b"added".to_vec()]);

        tree.flush().unwrap();
        let ignored = tree.walk(StateFlags::IGNORED, StateFlags::empty()).unwrap();
        assert_eq!(ignored, vec![b"x/ignored".to_vec()]);
        let none = tree.walk(StateFlags::NEED_CHECK, StateFlags::empty()).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_walk_skips_subtrees_by_aggregate() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state");
        let mut tree = TreeState::open(&path, 0).unwrap();
        tree.insert(b"clean/a", entry(StateFlags::EXIST_P1)).unwrap();
        tree.insert(b"clean/b", entry(StateFlags::EXIST_P1)).unwrap();
        tree.insert(b"dirty/c", entry(StateFlags::NEED_CHECK)).unwrap();
        let root = tree.flush().unwrap();

        let mut tree = TreeState::open(&path, root).unwrap();
        let found = tree.walk(StateFlags::NEED_CHECK, StateFlags::empty()).unwrap();
        assert_eq!(found, vec![b"dirty/c".to_vec()]);
        // Root and "dirty" were read; "clean" was never loaded
        assert_eq!(tree.loaded.len(), 2);
    }

    #[test]
    fn test_path_complete() {
        let temp_dir = TempDir::new().unwrap();
        let p1 = StateFlags::EXIST_P1;
        let mut tree = tree_with(
            &temp_dir,
            &[("a/b/c", p1), ("a/b/d", p1), ("a/c", p1), ("de", p1)],
        );

        assert_eq!(complete(&mut tree, "", false), ["a/", "de"]);
        assert_eq!(complete(&mut tree, "d", false), ["de"]);
        assert_eq!(complete(&mut tree, "a/", false), ["a/b/", "a/c"]);
        assert_eq!(complete(&mut tree, "a/b/", false), ["a/b/c", "a/b/d"]);
        assert_eq!(complete(&mut tree, "a/b/c", false), ["a/b/c"]);
        assert_eq!(complete(&mut tree, "/", false), ["a/", "de"]);
        assert_eq!(
            complete(&mut tree, "", true),
            ["a/b/c", "a/b/d", "a/c", "de"]
        );
        assert!(complete(&mut tree, "x/", false).is_empty());
        assert!(complete(&mut tree, "de/", false).is_empty());
    }

    #[test]
    fn test_path_complete_respects_filter() {
        let temp_dir = TempDir::new().unwrap();
        let mut tree = tree_with(
            &temp_dir,
            &[("src/a", StateFlags::IGNORED), ("sub/b", StateFlags::EXIST_P1)],
        );

        let mut out = Vec::new();
        tree.path_complete(b"s", StateFlags::EXIST_P1, StateFlags::empty(), false, |path| {
            out.push(path.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(out, vec![b"sub/".to_vec()]);
    }

    #[test]
    fn test_path_complete_visitor_error_stops() {
        let temp_dir = TempDir::new().unwrap();
        let p1 = StateFlags::EXIST_P1;
        let mut tree = tree_with(&temp_dir, &[("a", p1), ("b", p1), ("c", p1)]);

        let mut seen = 0;
        let result = tree.path_complete(b"", p1, StateFlags::empty(), true, |_| {
            seen += 1;
            if seen == 2 {
                Err(Error::invalid_path(b"b", "stop"))
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(Error::InvalidPath { .. })));
        assert_eq!(seen, 2);
    }
}
