//! # Treestate Core
//!
//! A persistent, versioned trie of per-file working-copy state.
//!
//! Every tracked path maps to a compact [`FileEntry`]: status flags,
//! permission bits, size, mtime and an optional copy source. The trie lives in
//! a single append-only store file; each flush appends the modified
//! directories plus a root record and yields a root id that reopens exactly
//! that generation later.
//!
//! ## Features
//!
//! - Copy-on-write directories: a flush writes only what changed
//! - Point lookups in O(depth), loading directories on demand
//! - Flag-filtered walks that skip subtrees by aggregated flags
//! - Prefix completion and normalized-name (e.g. case-insensitive) lookup
//! - Exporting the current state into a fresh, compact store
//!
//! ## Example
//!
//! ```no_run
//! use treestate_core::{FileEntry, StateFlags, TreeState};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Start from the empty tree
//! let mut tree = TreeState::open("./dirstate", 0)?;
//!
//! let flags = StateFlags::EXIST_P1 | StateFlags::EXIST_NEXT;
//! tree.insert(b"src/lib.rs", FileEntry::new(flags, 0o644, 1024, 1_700_000_000, None)?)?;
//! let root = tree.flush()?;
//!
//! // Later: reopen that generation and list files needing a check
//! let mut tree = TreeState::open("./dirstate", root)?;
//! for path in tree.walk(StateFlags::NEED_CHECK, StateFlags::empty())? {
//!     println!("{}", String::from_utf8_lossy(&path));
//! }
//! # Ok(())
//! # }
//! ```

mod block;
mod entry;
mod error;
mod filtered;
mod flags;
mod node;
mod query;
mod root;
mod snapshot;
mod state;
mod store;

pub use block::{BlockId, BlockKind};
pub use entry::{FileEntry, FileMode, MTIME_UNKNOWN};
pub use error::{Error, Result};
pub use flags::{AggregatedState, StateFlags};
pub use root::RootRecord;
pub use state::TreeState;
pub use store::{Store, StoreConfig};
