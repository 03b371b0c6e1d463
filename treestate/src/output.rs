//! Output formatting for CLI commands.
//!
//! Provides abstraction layer for outputting results in text or JSON format.

use anyhow::Result;
use serde::Serialize;
use std::io::{self, Write};
use treestate_core::{BlockId, FileEntry, StateFlags};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    /// Create a new OutputWriter.
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Write output using the configured format.
    ///
    /// The `data` parameter must be a serializable struct that includes
    /// `success: bool` and `result_code: u8` fields.
    ///
    /// The `text_fn` closure is called only in text mode to generate the
    /// human-readable output.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error message to stderr.
    ///
    /// In JSON mode, writes a JSON error object with success=false.
    /// In text mode, writes the error chain.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

/// Flag names as accepted on the command line, in bit order.
pub const FLAG_NAMES: [(&str, StateFlags); 6] = [
    ("p1", StateFlags::EXIST_P1),
    ("p2", StateFlags::EXIST_P2),
    ("next", StateFlags::EXIST_NEXT),
    ("ignored", StateFlags::IGNORED),
    ("check", StateFlags::NEED_CHECK),
    ("copied", StateFlags::COPIED),
];

/// Names of the flags set in `flags`.
pub fn flag_names(flags: StateFlags) -> Vec<&'static str> {
    FLAG_NAMES
        .iter()
        .filter(|(_, flag)| flags.contains(*flag))
        .map(|(name, _)| *name)
        .collect()
}

/// Render a path held as bytes.
pub fn display_path(path: &[u8]) -> String {
    String::from_utf8_lossy(path).into_owned()
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

/// Error output structure.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `info` command.
#[derive(Debug, Serialize)]
pub struct InfoOutput {
    pub success: bool,
    pub result_code: u8,
    pub store: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_id: Option<BlockId>,
    pub file_count: u64,
    pub metadata: String,
}

/// File state for `get` command.
#[derive(Debug, Serialize)]
pub struct FileInfo {
    pub path: String,
    pub flags: Vec<&'static str>,
    pub mode: String,
    pub size: u64,
    pub mtime: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime_human: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copied: Option<String>,
}

impl FileInfo {
    pub fn new(path: &[u8], entry: &FileEntry) -> Self {
        Self {
            path: display_path(path),
            flags: flag_names(entry.flags),
            mode: format!("{:06o}", entry.mode),
            size: entry.size,
            mtime: entry.mtime,
            mtime_human: chrono::DateTime::from_timestamp(entry.mtime, 0)
                .filter(|_| entry.mtime >= 0)
                .map(|dt| dt.to_rfc3339()),
            copied: entry.copied.as_deref().map(display_path),
        }
    }
}

/// Output for `get` command.
#[derive(Debug, Serialize)]
pub struct GetOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileInfo>,
}

/// Output for mutating commands (`insert`, `remove`, `set-metadata`).
#[derive(Debug, Serialize)]
pub struct FlushOutput {
    pub success: bool,
    pub result_code: u8,
    pub changed: bool,
    pub root_id: BlockId,
    pub file_count: u64,
}

/// Output for `walk` and `complete` commands.
#[derive(Debug, Serialize)]
pub struct PathsOutput {
    pub success: bool,
    pub result_code: u8,
    pub paths: Vec<String>,
}

/// Output for `find` command.
#[derive(Debug, Serialize)]
pub struct FindOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Output for `save-as` command.
#[derive(Debug, Serialize)]
pub struct SaveAsOutput {
    pub success: bool,
    pub result_code: u8,
    pub destination: String,
    pub root_id: BlockId,
}
