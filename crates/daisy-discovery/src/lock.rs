//! Interprocess port locking
//!
//! Only one process may talk to a given input/output pair at a time. Each pair
//! is guarded by an advisory lock on a file in a shared directory. Within one
//! process the live lock handle is shared through [`PortLockRegistry`], so
//! reopening a pair that is already open never waits on itself.

use std::collections::HashMap;
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

const LOCK_PREFIX: &str = "blocks_sdk";
const MAX_LOCK_NAME_LENGTH: usize = 128;
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock {0} is held by another process")]
    Contended(String),

    #[error("Lock file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lock name for an input/output endpoint pair
pub fn lock_id(input_name: &str, output_name: &str) -> String {
    format!(
        "{LOCK_PREFIX}_{}_{}",
        legal_file_name(input_name),
        legal_file_name(output_name)
    )
}

fn legal_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control() && !"\"#@,;:<>*^|?\\/".contains(*c))
        .take(MAX_LOCK_NAME_LENGTH)
        .collect()
}

type Entries = Mutex<HashMap<String, Weak<PortLock>>>;

/// A held advisory lock. Released when the last handle is dropped.
pub struct PortLock {
    id: String,
    path: PathBuf,
    file: File,
    entries: Weak<Entries>,
}

impl PortLock {
    fn acquire(dir: &Path, id: &str, timeout: Duration, entries: Weak<Entries>) -> Result<Self, LockError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock() {
                Ok(()) => break,
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(LockError::Contended(id.to_string()));
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(TryLockError::Error(e)) => return Err(e.into()),
            }
        }

        debug!(lock = id, path = %path.display(), "Port lock acquired");
        Ok(Self {
            id: id.to_string(),
            path,
            file,
            entries,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PortLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            debug!(lock = %self.id, error = %e, "Failed to release port lock");
        }

        if let Some(entries) = self.entries.upgrade() {
            let mut entries = entries.lock();
            if entries.get(&self.id).is_some_and(|w| w.strong_count() == 0) {
                entries.remove(&self.id);
            }
        }

        trace!(lock = %self.id, "Port lock released");
    }
}

impl std::fmt::Debug for PortLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLock")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

/// Process-wide table of live port locks
pub struct PortLockRegistry {
    dir: PathBuf,
    timeout: Duration,
    entries: Arc<Entries>,
}

impl PortLockRegistry {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registry rooted in the system temp directory
    pub fn in_temp_dir(timeout: Duration) -> Self {
        Self::new(std::env::temp_dir(), timeout)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reuse the live handle for `id`, or take the OS lock within the timeout
    pub fn acquire(&self, id: &str) -> Result<Arc<PortLock>, LockError> {
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get(id).and_then(Weak::upgrade) {
            trace!(lock = id, "Reusing port lock");
            return Ok(existing);
        }

        let lock = Arc::new(PortLock::acquire(
            &self.dir,
            id,
            self.timeout,
            Arc::downgrade(&self.entries),
        )?);
        entries.insert(id.to_string(), Arc::downgrade(&lock));
        Ok(lock)
    }

    /// Number of locks currently held by this registry
    pub fn held(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_held(&self, id: &str) -> bool {
        self.entries
            .lock()
            .get(id)
            .is_some_and(|w| w.strong_count() > 0)
    }
}

impl std::fmt::Debug for PortLockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLockRegistry")
            .field("dir", &self.dir)
            .field("timeout", &self.timeout)
            .field("held", &self.held())
            .finish()
    }
}
