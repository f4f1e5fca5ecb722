use crate::error::{QralphError, Result};
use crate::paths;
use crate::process;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

const INITIAL_BACKOFF: Duration = Duration::from_millis(20);
const MAX_BACKOFF: Duration = Duration::from_millis(500);
/// A lock file with no readable owner record younger than this is assumed to
/// be mid-creation by another process.
const UNREADABLE_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// LockScope
// ---------------------------------------------------------------------------

/// What a lock protects: one project's state, or the shared registries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockScope {
    Project(String),
    Registry,
}

impl LockScope {
    fn path(&self, root: &Path) -> PathBuf {
        match self {
            LockScope::Project(id) => paths::lock_path(root, id),
            LockScope::Registry => paths::registry_lock_path(root),
        }
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockScope::Project(id) => write!(f, "project:{id}"),
            LockScope::Registry => f.write_str("registry"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    acquired_at: DateTime<Utc>,
    token: String,
}

// ---------------------------------------------------------------------------
// ExclusiveLock
// ---------------------------------------------------------------------------

/// An advisory lock file created with `create_new`. Released on drop.
#[derive(Debug)]
pub struct ExclusiveLock {
    scope: LockScope,
    path: PathBuf,
    token: String,
    released: bool,
}

impl ExclusiveLock {
    /// Take the lock, retrying with exponential backoff until `timeout`.
    pub fn acquire(root: &Path, scope: LockScope, timeout: Duration) -> Result<Self> {
        let path = scope.path(root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if let Some(lock) = Self::try_create(&scope, &path)? {
                tracing::debug!(scope = %scope, "lock acquired");
                return Ok(lock);
            }
            if reclaim_if_stale(&path)? {
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                let holder = read_record(&path)
                    .map(|r| r.pid.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(QralphError::LockContention {
                    scope: scope.to_string(),
                    holder,
                });
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn try_create(scope: &LockScope, path: &Path) -> Result<Option<Self>> {
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = LockRecord {
            pid: std::process::id(),
            acquired_at: Utc::now(),
            token: uuid::Uuid::new_v4().to_string(),
        };
        file.write_all(serde_json::to_string(&record)?.as_bytes())?;
        file.sync_all()?;
        Ok(Some(Self {
            scope: scope.clone(),
            path: path.to_path_buf(),
            token: record.token,
            released: false,
        }))
    }

    pub fn scope(&self) -> &LockScope {
        &self.scope
    }

    /// Fail unless this guard is for `id` and its lock file is still ours.
    pub fn ensure_project(&self, id: &str) -> Result<()> {
        match &self.scope {
            LockScope::Project(held) if held == id => self.ensure_owned(),
            other => Err(QralphError::LockNotHeld {
                expected: LockScope::Project(id.to_string()).to_string(),
                actual: other.to_string(),
            }),
        }
    }

    pub fn ensure_registry(&self) -> Result<()> {
        match &self.scope {
            LockScope::Registry => self.ensure_owned(),
            other => Err(QralphError::LockNotHeld {
                expected: LockScope::Registry.to_string(),
                actual: other.to_string(),
            }),
        }
    }

    fn ensure_owned(&self) -> Result<()> {
        match read_record(&self.path) {
            Some(r) if r.token == self.token && !self.released => Ok(()),
            _ => Err(QralphError::LockNotHeld {
                expected: self.scope.to_string(),
                actual: "a lock file no longer owned by this guard".to_string(),
            }),
        }
    }

    pub fn release(mut self) -> Result<()> {
        self.remove_if_owned()
    }

    fn remove_if_owned(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if matches!(read_record(&self.path), Some(r) if r.token == self.token) {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(scope = %self.scope, "lock released");
        Ok(())
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        if let Err(e) = self.remove_if_owned() {
            tracing::warn!(scope = %self.scope, "failed to release lock: {e}");
        }
    }
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

/// Remove the lock file when its owner is gone. A live owner is never
/// overridden. Returns true when a file was removed.
fn reclaim_if_stale(path: &Path) -> Result<bool> {
    let stale = match read_record(path) {
        Some(record) => !process::pid_alive(record.pid),
        None => match std::fs::metadata(path) {
            Ok(meta) => meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .is_some_and(|age| age > UNREADABLE_GRACE),
            // Released between our attempt and now.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        },
    };
    if !stale {
        return Ok(false);
    }
    tracing::warn!(path = %path.display(), "reclaiming stale lock");
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
