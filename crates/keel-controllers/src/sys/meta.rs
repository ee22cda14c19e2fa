//! Meta keys: a small key-value store that survives reboots.

use std::fs;
use std::io;
use std::path::PathBuf;

/// Key marking the boot entry to fall back to after a failed upgrade.
pub const UPGRADE_FALLBACK: u8 = 0x0c;

/// Largest value accepted.
pub const MAX_VALUE_SIZE: usize = 4096;

/// Storage of meta keys.
pub trait MetaStore: Send + Sync {
    /// Reads a key.
    fn read(&self, key: u8) -> io::Result<Option<Vec<u8>>>;

    /// Writes a key.
    fn write(&self, key: u8, value: &[u8]) -> io::Result<()>;

    /// Deletes a key; returns whether it existed.
    fn delete(&self, key: u8) -> io::Result<bool>;
}

/// Meta keys stored as one file per key.
#[derive(Debug, Clone)]
pub struct FileMeta {
    dir: PathBuf,
}

impl FileMeta {
    /// Store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileMeta { dir: dir.into() }
    }

    fn path(&self, key: u8) -> PathBuf {
        self.dir.join(format!("{key:02x}"))
    }
}

impl MetaStore for FileMeta {
    fn read(&self, key: u8) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path(key)) {
            Ok(v) => Ok(Some(v)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write(&self, key: u8, value: &[u8]) -> io::Result<()> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("meta value of {} bytes exceeds {MAX_VALUE_SIZE}", value.len()),
            ));
        }

        fs::create_dir_all(&self.dir)?;
        fs::write(self.path(key), value)
    }

    fn delete(&self, key: u8) -> io::Result<bool> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}
