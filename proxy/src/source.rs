//! Where identity files and known-hosts data are read from.

use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;

/// Read-only file access used by the tunnel dialer.
pub trait FileSource: Send + Sync {
    /// Open `path` for reading.
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;

    /// Read the whole of `path`.
    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.open(path)?.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// The host filesystem, with `~/` expanded to the current user's home.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostFs;

impl FileSource for HostFs {
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let file = std::fs::File::open(expand_home(path))?;
        Ok(Box::new(file))
    }
}

/// Files held in memory, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }
}

impl FileSource for MemoryFs {
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let content = self
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{}: file does not exist", path)))?;
        Ok(Box::new(Cursor::new(content)))
    }
}

/// Expand a leading `~` or `~/` to the home directory.
///
/// Paths without the shorthand, and `~user` forms, are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = if path == "~" {
        Some("")
    } else {
        path.strip_prefix("~/")
    };

    match (rest, dirs::home_dir()) {
        (Some(rest), Some(home)) if rest.is_empty() => home,
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
