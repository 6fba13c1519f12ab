//! Command table
//!
//! Named commands map a short name to a topic plus a table of canned
//! messages. The table lives in a file that is read again for every lookup,
//! so edits apply without a restart.
//!
//! ```yaml
//! light:
//!   topic: home/livingroom/light/set
//!   options:
//!     "on": "1"
//!     "off": "0"
//! ```

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use config::{File, FileFormat};
use serde::Deserialize;
use tracing::debug;

/// A named command
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Command {
    /// Topic the command publishes to
    pub topic: String,
    /// Canned messages keyed by option name
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Command {
    /// Pick the outgoing message: the option named by `message` when it is
    /// non-empty, else the body's own message, else `message` itself, else
    /// an empty string.
    pub fn resolve_message(&self, message: Option<&str>, body_message: Option<&str>) -> String {
        let non_empty = |s: &&str| !s.is_empty();

        message
            .and_then(|key| self.options.get(key))
            .map(String::as_str)
            .filter(non_empty)
            .or_else(|| body_message.filter(non_empty))
            .or_else(|| message.filter(non_empty))
            .unwrap_or("")
            .to_string()
    }
}

/// Command table errors
#[derive(Debug)]
pub enum CommandError {
    /// The table file could not be read
    Io(PathBuf, std::io::Error),
    /// The table file is not a valid table
    Parse(PathBuf, config::ConfigError),
    /// The file extension names no supported format
    UnsupportedFormat(PathBuf),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Io(path, e) => {
                write!(f, "Cannot read command table {}: {}", path.display(), e)
            }
            CommandError::Parse(path, e) => {
                write!(f, "Invalid command table {}: {}", path.display(), e)
            }
            CommandError::UnsupportedFormat(path) => write!(
                f,
                "Unsupported command table format {} (expected .yml, .yaml, .toml or .json)",
                path.display()
            ),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Io(_, e) => Some(e),
            CommandError::Parse(_, e) => Some(e),
            CommandError::UnsupportedFormat(_) => None,
        }
    }
}

/// Lookup of commands by name
#[async_trait]
pub trait CommandLookup: Send + Sync {
    /// `Ok(None)` when the table has no such command
    async fn lookup(&self, name: &str) -> Result<Option<Command>, CommandError>;
}

/// Command table backed by a file, re-read on every lookup
#[derive(Debug, Clone)]
pub struct FileCommandTable {
    path: PathBuf,
}

impl FileCommandTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the whole table
    pub async fn load(&self) -> Result<HashMap<String, Command>, CommandError> {
        let format = format_for(&self.path)?;
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| CommandError::Io(self.path.clone(), e))?;
        parse_table(&content, format).map_err(|e| CommandError::Parse(self.path.clone(), e))
    }
}

#[async_trait]
impl CommandLookup for FileCommandTable {
    async fn lookup(&self, name: &str) -> Result<Option<Command>, CommandError> {
        let mut table = self.load().await?;
        debug!(
            "Command table {}: {} entries",
            self.path.display(),
            table.len()
        );
        Ok(table.remove(name))
    }
}

/// Fixed in-memory command table
#[derive(Debug, Clone, Default)]
pub struct StaticCommandTable {
    commands: HashMap<String, Command>,
}

impl StaticCommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command and return self for chaining
    pub fn with(mut self, name: &str, command: Command) -> Self {
        self.commands.insert(name.to_string(), command);
        self
    }
}

#[async_trait]
impl CommandLookup for StaticCommandTable {
    async fn lookup(&self, name: &str) -> Result<Option<Command>, CommandError> {
        Ok(self.commands.get(name).cloned())
    }
}

fn format_for(path: &Path) -> Result<FileFormat, CommandError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("yml") | Some("yaml") => Ok(FileFormat::Yaml),
        Some("toml") => Ok(FileFormat::Toml),
        Some("json") => Ok(FileFormat::Json),
        _ => Err(CommandError::UnsupportedFormat(path.to_path_buf())),
    }
}

/// Parse table text. Scalar option values (numbers, booleans) come out as
/// strings.
pub fn parse_table(
    content: &str,
    format: FileFormat,
) -> Result<HashMap<String, Command>, config::ConfigError> {
    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }
    config::Config::builder()
        .add_source(File::from_str(content, format))
        .build()?
        .try_deserialize()
}
