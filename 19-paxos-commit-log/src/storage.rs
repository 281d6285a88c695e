//! Stable storage for the decided log.
//!
//! Uses `bincode` to serialize the whole log after every change and to reload
//! it on startup. This is the simple, inefficient approach: every write
//! replaces the file from scratch (via a sibling temp file and a rename, so a
//! crash mid-write leaves the previous version intact).

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::commit::Commit;
use crate::log::{ConsensusLog, LogError};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode log: {0}")]
    Encode(#[source] bincode::Error),
    #[error("persisted log at {path} is unreadable: {source}")]
    Undecodable {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },
    #[error("persisted log at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: LogError,
    },
}

/// Whole-file persistence for one replica's log.
#[derive(Debug, Clone)]
pub struct LogStorage {
    path: PathBuf,
}

impl LogStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted log.
    ///
    /// Returns `Ok(None)` when nothing has been written yet. Any entry whose
    /// id does not match its index makes the whole file [`StorageError::Corrupt`].
    pub fn load(&self) -> Result<Option<ConsensusLog>, StorageError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StorageError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        let entries: Vec<Commit> =
            bincode::deserialize(&bytes).map_err(|source| StorageError::Undecodable {
                path: self.path.clone(),
                source,
            })?;
        ConsensusLog::from_entries(entries)
            .map(Some)
            .map_err(|source| StorageError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    /// Replaces the persisted log with `log`.
    pub fn save(&self, log: &ConsensusLog) -> Result<(), StorageError> {
        let bytes = bincode::serialize(log.entries()).map_err(StorageError::Encode)?;
        let tmp = self.tmp_path();
        self.write_file(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path).map_err(|source| StorageError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let io_err = |source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = fs::File::create(path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes).map_err(io_err)?;
        let file = writer
            .into_inner()
            .map_err(|err| io_err(err.into_error()))?;
        file.sync_all().map_err(io_err)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
