//! Cache manager for persisting JSON documents to disk
//!
//! Provides a `CacheManager` that reads and writes serializable data as JSON
//! files inside one directory. Writes go to a temporary sibling first and are
//! then renamed over the target, so a crash mid-write leaves the previous file
//! in place.

use directories::ProjectDirs;
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::PersistError;

/// Manages reading and writing JSON documents in the cache directory
///
/// Uses `~/.cache/fctoken/` on Linux, or the platform equivalent.
#[derive(Debug, Clone)]
pub struct CacheManager {
    /// Directory where cache files are stored
    cache_dir: PathBuf,
}

impl CacheManager {
    /// Creates a new CacheManager using the XDG-compliant cache directory
    ///
    /// Returns `None` if the cache directory cannot be determined (e.g., no home directory).
    pub fn new() -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "", "fctoken")?;
        let cache_dir = project_dirs.cache_dir().to_path_buf();
        Some(Self { cache_dir })
    }

    /// Creates a new CacheManager with a custom cache directory
    ///
    /// Useful for testing or when a specific cache location is needed.
    pub fn with_dir(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    /// Directory holding the cache files
    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the path to the cache file with the given name
    pub fn path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(name)
    }

    /// Ensures the cache directory exists
    fn ensure_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.cache_dir)
    }

    /// Serializes `data` and atomically replaces the file `name`
    ///
    /// # Returns
    /// * `Ok(())` on success
    /// * `Err` if directory creation, serialization or writing fails
    pub fn write_json<T: Serialize + ?Sized>(&self, name: &str, data: &T) -> Result<(), PersistError> {
        self.ensure_dir()?;

        let json = serde_json::to_string_pretty(data)?;
        let target = self.path(name);
        let staging = self.path(&format!(".{name}.tmp"));

        fs::write(&staging, json)?;
        if let Err(err) = fs::rename(&staging, &target) {
            let _ = fs::remove_file(&staging);
            return Err(err.into());
        }
        Ok(())
    }

    /// Reads and deserializes the file `name`
    ///
    /// # Returns
    /// * `Ok(Some(T))` if the file exists and parses
    /// * `Ok(None)` if the file does not exist
    /// * `Err` if the file cannot be read or is not valid JSON for `T`
    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, PersistError> {
        let content = match fs::read_to_string(self.path(name)) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Deletes the file `name`; a missing file is not an error
    pub fn remove(&self, name: &str) -> Result<(), PersistError> {
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
