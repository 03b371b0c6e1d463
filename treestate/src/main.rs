mod log_level;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log_level::LogLevel;
use output::{
    FLAG_NAMES, FileInfo, FindOutput, FlushOutput, GetOutput, InfoOutput, OutputWriter,
    PathsOutput, SaveAsOutput, display_path,
};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;
use treestate_core::{BlockId, FileEntry, FileMode, MTIME_UNKNOWN, StateFlags, TreeState};

/// Treestate - A versioned directory-state store
#[derive(Parser, Debug)]
#[command(name = "treestate")]
#[command(about = "Inspect and edit a versioned directory-state trie", long_about = None)]
#[command(version)]
struct Cli {
    /// Store file (defaults to TREESTATE_STORE env var or ./treestate)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Root id of the generation to open (defaults to the latest one)
    #[arg(short, long, global = true)]
    root: Option<BlockId>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log verbosity, written to stderr
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the generation's root id, file count and metadata
    Info,

    /// Show the state of one file
    Get {
        /// File path, relative to the working copy root
        path: String,
    },

    /// Add or replace a file and flush
    Insert {
        /// File path, relative to the working copy root
        path: String,

        /// Comma-separated flags: p1,p2,next,ignored,check,copied
        #[arg(long, default_value = "p1,p2,next", value_parser = parse_flags)]
        bits: StateFlags,

        /// File mode, in octal
        #[arg(long, default_value = "100644", value_parser = parse_mode)]
        mode: FileMode,

        /// Size in bytes
        #[arg(long, default_value_t = 0)]
        size: u64,

        /// Modification time in seconds (-1 = unknown)
        #[arg(long, default_value_t = MTIME_UNKNOWN, allow_negative_numbers = true)]
        mtime: i64,

        /// Copy source; implies the copied flag
        #[arg(long)]
        copied: Option<String>,
    },

    /// Remove a file and flush
    Remove {
        /// File path, relative to the working copy root
        path: String,
    },

    /// List files by flags
    Walk {
        /// Flags that must all be set
        #[arg(long, default_value = "", value_parser = parse_flags)]
        set: StateFlags,

        /// Flags that must all be clear
        #[arg(long, default_value = "", value_parser = parse_flags)]
        unset: StateFlags,
    },

    /// Complete a path prefix
    Complete {
        /// Prefix to complete
        #[arg(default_value = "")]
        prefix: String,

        /// Expand directories into the files below them
        #[arg(long)]
        full: bool,

        /// Flags that must all be set
        #[arg(long, default_value = "", value_parser = parse_flags)]
        set: StateFlags,

        /// Flags that must all be clear
        #[arg(long, default_value = "", value_parser = parse_flags)]
        unset: StateFlags,
    },

    /// Find the stored spelling of a path
    Find {
        /// Path to look up
        path: String,

        /// Compare names ignoring ASCII case
        #[arg(short, long)]
        ignore_case: bool,
    },

    /// Replace the generation's metadata and flush
    SetMetadata {
        /// New metadata, or "-" to read it from stdin
        text: String,
    },

    /// Write the generation into a new, compact store file
    SaveAs {
        /// Destination store file
        dest: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    setup_tracing(cli.log_level);
    debug!("Parsed CLI arguments: {cli:?}");

    // Determine store: CLI arg > TREESTATE_STORE env var > ./treestate default
    let store = cli
        .store
        .or_else(|| std::env::var("TREESTATE_STORE").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./treestate"));

    let output = OutputWriter::new(cli.json);

    let result = match cli.command {
        Commands::Info => cmd_info(&store, cli.root, &output),
        Commands::Get { path } => cmd_get(&store, cli.root, &path, &output),
        Commands::Insert {
            path,
            bits,
            mode,
            size,
            mtime,
            copied,
        } => cmd_insert(&store, cli.root, &path, bits, mode, size, mtime, copied, &output),
        Commands::Remove { path } => cmd_remove(&store, cli.root, &path, &output),
        Commands::Walk { set, unset } => cmd_walk(&store, cli.root, set, unset, &output),
        Commands::Complete {
            prefix,
            full,
            set,
            unset,
        } => cmd_complete(&store, cli.root, &prefix, full, set, unset, &output),
        Commands::Find { path, ignore_case } => {
            cmd_find(&store, cli.root, &path, ignore_case, &output)
        }
        Commands::SetMetadata { text } => cmd_set_metadata(&store, cli.root, &text, &output),
        Commands::SaveAs { dest } => cmd_save_as(&store, cli.root, &dest, &output),
    };

    if let Err(e) = result {
        output.write_error(&e, 1);
        std::process::exit(1);
    }
}

fn setup_tracing(log_level: LogLevel) {
    if let Some(level) = log_level.to_tracing_level() {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .without_time()
            .compact()
            .init();
    }
}

/// Parse a comma-separated list of flag names.
fn parse_flags(s: &str) -> std::result::Result<StateFlags, String> {
    let mut flags = StateFlags::empty();
    for name in s.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let (_, flag) = FLAG_NAMES
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                let known: Vec<&str> = FLAG_NAMES.iter().map(|(known, _)| *known).collect();
                format!("unknown flag '{}' (expected one of {})", name, known.join(", "))
            })?;
        flags |= *flag;
    }
    Ok(flags)
}

fn parse_mode(s: &str) -> std::result::Result<FileMode, String> {
    FileMode::from_str_radix(s, 8).map_err(|e| format!("invalid octal mode '{}': {}", s, e))
}

fn open_tree(store: &Path, root: Option<BlockId>) -> Result<TreeState> {
    let tree = match root {
        Some(id) => TreeState::open(store, id),
        None => TreeState::open_latest(store),
    };
    tree.with_context(|| format!("Failed to open tree state at {}", store.display()))
}

fn flush(tree: &mut TreeState, changed: bool, output: &OutputWriter) -> Result<()> {
    let root_id = tree
        .flush()
        .with_context(|| format!("Failed to flush {}", tree.store_path().display()))?;

    let data = FlushOutput {
        success: true,
        result_code: 0,
        changed,
        root_id,
        file_count: tree.len(),
    };
    output.write(&data, || format!("{}\n", root_id))
}

fn cmd_info(store: &Path, root: Option<BlockId>, output: &OutputWriter) -> Result<()> {
    let tree = open_tree(store, root)?;

    let data = InfoOutput {
        success: true,
        result_code: 0,
        store: store.display().to_string(),
        root_id: tree.root_id(),
        file_count: tree.len(),
        metadata: display_path(tree.metadata()),
    };

    output.write(&data, || {
        let root_id = match data.root_id {
            Some(id) => id.to_string(),
            None => "none (empty store)".to_string(),
        };
        format!(
            "Store: {}\nRoot: {}\nFiles: {}\nMetadata: {}\n",
            data.store, root_id, data.file_count, data.metadata
        )
    })
}

fn cmd_get(store: &Path, root: Option<BlockId>, path: &str, output: &OutputWriter) -> Result<()> {
    let mut tree = open_tree(store, root)?;

    let entry = tree
        .get(path.as_bytes())
        .with_context(|| format!("Failed to look up {}", path))?;
    let file = entry.map(|entry| FileInfo::new(path.as_bytes(), &entry));

    let data = GetOutput {
        success: true,
        result_code: 0,
        file,
    };

    output.write(&data, || match &data.file {
        Some(file) => {
            let mtime = file.mtime_human.clone().unwrap_or_else(|| "unknown".to_string());
            let mut text = format!(
                "Path: {}\nFlags: {}\nMode: {}\nSize: {}\nMtime: {}\n",
                file.path,
                file.flags.join(","),
                file.mode,
                file.size,
                mtime
            );
            if let Some(copied) = &file.copied {
                text.push_str(&format!("Copied from: {}\n", copied));
            }
            text
        }
        None => format!("Not tracked: {}\n", path),
    })
}

#[allow(clippy::too_many_arguments)]
fn cmd_insert(
    store: &Path,
    root: Option<BlockId>,
    path: &str,
    bits: StateFlags,
    mode: FileMode,
    size: u64,
    mtime: i64,
    copied: Option<String>,
    output: &OutputWriter,
) -> Result<()> {
    let mut tree = open_tree(store, root)?;

    let flags = if copied.is_some() {
        bits | StateFlags::COPIED
    } else {
        bits
    };
    let entry = FileEntry::new(flags, mode, size, mtime, copied.map(String::into_bytes))
        .with_context(|| format!("Invalid state for {}", path))?;

    tree.insert(path.as_bytes(), entry)
        .with_context(|| format!("Failed to insert {}", path))?;

    flush(&mut tree, true, output)
}

fn cmd_remove(
    store: &Path,
    root: Option<BlockId>,
    path: &str,
    output: &OutputWriter,
) -> Result<()> {
    let mut tree = open_tree(store, root)?;

    let removed = tree
        .remove(path.as_bytes())
        .with_context(|| format!("Failed to remove {}", path))?;
    if !removed {
        debug!(path, "nothing to remove");
    }

    flush(&mut tree, removed, output)
}

fn cmd_walk(
    store: &Path,
    root: Option<BlockId>,
    set: StateFlags,
    unset: StateFlags,
    output: &OutputWriter,
) -> Result<()> {
    let mut tree = open_tree(store, root)?;

    let paths: Vec<String> = tree
        .walk(set, unset)
        .with_context(|| "Failed to walk tree state")?
        .iter()
        .map(|path| display_path(path))
        .collect();

    write_paths(paths, output)
}

fn cmd_complete(
    store: &Path,
    root: Option<BlockId>,
    prefix: &str,
    full: bool,
    set: StateFlags,
    unset: StateFlags,
    output: &OutputWriter,
) -> Result<()> {
    let mut tree = open_tree(store, root)?;

    let mut paths = Vec::new();
    tree.path_complete(prefix.as_bytes(), set, unset, full, |path| {
        paths.push(display_path(path));
        Ok(())
    })
    .with_context(|| format!("Failed to complete {}", prefix))?;

    write_paths(paths, output)
}

fn write_paths(paths: Vec<String>, output: &OutputWriter) -> Result<()> {
    let data = PathsOutput {
        success: true,
        result_code: 0,
        paths,
    };

    output.write(&data, || {
        data.paths
            .iter()
            .map(|path| format!("{}\n", path))
            .collect()
    })
}

fn cmd_find(
    store: &Path,
    root: Option<BlockId>,
    path: &str,
    ignore_case: bool,
    output: &OutputWriter,
) -> Result<()> {
    let mut tree = open_tree(store, root)?;

    let found = if ignore_case {
        tree.get_filtered(path.as_bytes(), |name| name.to_ascii_lowercase(), 1)
    } else {
        tree.get_filtered(path.as_bytes(), |name| name.to_vec(), 0)
    }
    .with_context(|| format!("Failed to look up {}", path))?;

    let data = FindOutput {
        success: true,
        result_code: 0,
        path: found.as_deref().map(display_path),
    };

    output.write(&data, || match &data.path {
        Some(found) => format!("{}\n", found),
        None => format!("Not found: {}\n", path),
    })
}

fn cmd_set_metadata(
    store: &Path,
    root: Option<BlockId>,
    text: &str,
    output: &OutputWriter,
) -> Result<()> {
    let metadata = if text == "-" {
        if atty::is(atty::Stream::Stdin) {
            anyhow::bail!("Refusing to read metadata from a terminal; pipe it into stdin");
        }
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .with_context(|| "Failed to read metadata from stdin")?;
        buf
    } else {
        text.as_bytes().to_vec()
    };

    let mut tree = open_tree(store, root)?;
    let changed = tree.metadata() != metadata.as_slice();
    tree.set_metadata(&metadata);

    flush(&mut tree, changed, output)
}

fn cmd_save_as(
    store: &Path,
    root: Option<BlockId>,
    dest: &Path,
    output: &OutputWriter,
) -> Result<()> {
    let mut tree = open_tree(store, root)?;

    let root_id = tree
        .save_as(dest)
        .with_context(|| format!("Failed to save tree state to {}", dest.display()))?;

    let data = SaveAsOutput {
        success: true,
        result_code: 0,
        destination: dest.display().to_string(),
        root_id,
    };

    output.write(&data, || {
        format!("Saved generation {} to {}\n", root_id, data.destination)
    })
}
