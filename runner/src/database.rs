#[cfg(feature = "sqlite")]
pub mod sqlite;

use crate::{
    batch::BatchRecord,
    config::DatabaseConfig,
    job::{BatchId, Job, JobId},
};
use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};
use std::{
    ffi::OsString,
    fmt::Debug,
    fs::{File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StoreError {
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    SQLite(#[from] rusqlite::Error),
    #[error("Failed to (de)serialize a stored record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Stored record {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("No job store backend was compiled in")]
    Unsupported,
    #[error("Failed to open the runner lock {path:?}: {source}")]
    LockFile { path: PathBuf, source: io::Error },
    #[error("Failed to lock {path:?}: {source}")]
    Lock { path: PathBuf, source: Errno },
}

/// Durable home of job and batch snapshots. The registry stays the source of truth while the
/// process runs, the store is only read at start-up.
pub trait JobStore: Send + Sync + Debug {
    fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    fn delete_job(&self, id: JobId) -> Result<(), StoreError>;

    fn load_jobs(&self) -> Result<Vec<Job>, StoreError>;

    fn save_batch(&self, batch: &BatchRecord) -> Result<(), StoreError>;

    fn delete_batch(&self, id: BatchId) -> Result<(), StoreError>;

    fn load_batches(&self) -> Result<Vec<BatchRecord>, StoreError>;
}

/// open the store described by the configuration
pub fn open(config: &DatabaseConfig) -> Result<Arc<dyn JobStore>, StoreError> {
    #[cfg(feature = "sqlite")]
    {
        let store = sqlite::SharedConnection::load(&config.path)?;
        store.init()?;

        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "sqlite"))]
    {
        let _ = config;
        Err(StoreError::Unsupported)
    }
}

/// Advisory lock on `<database>.lock`.
///
/// Every process that drives jobs holds it shared for its whole lifetime. Whoever gets it
/// exclusively knows no runner is alive, so unfinished jobs in the store were interrupted.
#[derive(Debug)]
pub struct RunnerLock {
    path: PathBuf,
    _file: File,
}

impl RunnerLock {
    pub fn path_for(database: &Path) -> PathBuf {
        let mut path = OsString::from(database.as_os_str());
        path.push(".lock");
        PathBuf::from(path)
    }

    fn open(database: &Path) -> Result<(PathBuf, File), StoreError> {
        let path = Self::path_for(database);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|source| StoreError::LockFile {
                path: path.clone(),
                source,
            })?;

        Ok((path, file))
    }

    /// Exclusive hold, `None` while any other process holds the lock
    pub fn try_exclusive(database: &Path) -> Result<Option<Self>, StoreError> {
        let (path, file) = Self::open(database)?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(Some(Self { path, _file: file })),
            Err(errno) if errno == Errno::EWOULDBLOCK => {
                debug!(path = ?path, "Runner lock is held elsewhere");
                Ok(None)
            }
            Err(source) => Err(StoreError::Lock { path, source }),
        }
    }

    /// Shared hold, waits while another process recovers the store
    pub fn shared(database: &Path) -> Result<Self, StoreError> {
        let (path, file) = Self::open(database)?;

        flock(file.as_raw_fd(), FlockArg::LockShared)
            .map_err(|source| StoreError::Lock {
                path: path.clone(),
                source,
            })?;

        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
