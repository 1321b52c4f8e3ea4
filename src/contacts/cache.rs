//! On-disk contact cache: one `<id>.vcf` file per directory entry.
//!
//! The file's modified-time is the version stamp of the record. It is set
//! to the record's own revision when the record is written, and compared
//! against the remote listing on the next sync.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;

use super::ContactsError;

/// File extension of cached records.
pub const RECORD_EXTENSION: &str = "vcf";

/// Directory of cached directory records.
#[derive(Debug, Clone)]
pub struct ContactCache {
    dir: PathBuf,
}

impl ContactCache {
    /// Open (and create if needed) the cache directory.
    ///
    /// # Errors
    ///
    /// Returns [`ContactsError::Io`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ContactsError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, ContactsError> {
        if id.is_empty()
            || id.contains('/')
            || id.contains('\\')
            || id.contains("..")
            || id.starts_with('.')
        {
            return Err(ContactsError::InvalidId(id.to_owned()));
        }
        Ok(self.dir.join(format!("{id}.{RECORD_EXTENSION}")))
    }

    /// Ids of every cached record, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`ContactsError::Io`] if the directory cannot be read.
    pub fn ids(&self) -> Result<Vec<String>, ContactsError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_owned());
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Modified-time of the record for `id`, or `None` if it is not cached.
    ///
    /// # Errors
    ///
    /// [`ContactsError::InvalidId`] for an unsafe id, [`ContactsError::Io`]
    /// for any failure other than a missing file.
    pub fn modified(&self, id: &str) -> Result<Option<SystemTime>, ContactsError> {
        let path = self.path_for(id)?;
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the raw record for `id` and stamp it with `stamp`.
    ///
    /// # Errors
    ///
    /// [`ContactsError::InvalidId`] or [`ContactsError::Io`].
    pub fn write(&self, id: &str, raw: &str, stamp: SystemTime) -> Result<(), ContactsError> {
        let path = self.path_for(id)?;
        std::fs::write(&path, raw)?;
        filetime::set_file_mtime(&path, FileTime::from_system_time(stamp))?;
        Ok(())
    }

    /// Read the raw record for `id`.
    ///
    /// # Errors
    ///
    /// [`ContactsError::InvalidId`] or [`ContactsError::Io`].
    pub fn read(&self, id: &str) -> Result<String, ContactsError> {
        let path = self.path_for(id)?;
        Ok(std::fs::read_to_string(path)?)
    }

    /// Delete the record for `id`. Missing files are not an error.
    ///
    /// # Errors
    ///
    /// [`ContactsError::InvalidId`] or [`ContactsError::Io`].
    pub fn remove(&self, id: &str) -> Result<(), ContactsError> {
        let path = self.path_for(id)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
