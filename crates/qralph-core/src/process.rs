use crate::config::ProcessConfig;
use crate::error::{CorruptionError, QralphError, Result};
use crate::io;
use crate::lock::{ExclusiveLock, LockScope};
use crate::paths;
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// OS primitives
// ---------------------------------------------------------------------------

/// True while a process with this pid exists (including ones we may not
/// signal).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence check only.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

/// Kernel start time of `pid` in clock ticks since boot. Together with the
/// pid this identifies one process across pid reuse.
#[cfg(target_os = "linux")]
pub fn process_start_ticks(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm (field 2) may contain spaces and parens; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
pub fn process_start_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(unix)]
pub fn terminate(pid: u32) -> Result<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(QralphError::InvalidValue(format!("refusing to signal pid {pid}")));
    }
    // SAFETY: plain SIGTERM to a single, identity-checked pid.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("cannot signal pid {pid} on this platform"),
    )
    .into())
}

// ---------------------------------------------------------------------------
// Registry types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Agent,
    Verify,
    Server,
    Other,
}

impl ProcessKind {
    pub fn grace(self, cfg: &ProcessConfig) -> Duration {
        Duration::from_secs(match self {
            ProcessKind::Agent => cfg.agent_grace_secs,
            ProcessKind::Verify => cfg.verify_grace_secs,
            ProcessKind::Server => cfg.server_grace_secs,
            ProcessKind::Other => cfg.other_grace_secs,
        })
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessKind::Agent => "agent",
            ProcessKind::Verify => "verify",
            ProcessKind::Server => "server",
            ProcessKind::Other => "other",
        })
    }
}

impl std::str::FromStr for ProcessKind {
    type Err = QralphError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "agent" => Ok(ProcessKind::Agent),
            "verify" => Ok(ProcessKind::Verify),
            "server" => Ok(ProcessKind::Server),
            "other" => Ok(ProcessKind::Other),
            _ => Err(QralphError::InvalidValue(format!("unknown process kind '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub kind: ProcessKind,
    pub purpose: String,
    pub project: String,
    pub registered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ticks: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Registry {
    #[serde(default)]
    processes: Vec<ProcessEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepAction {
    /// Process no longer exists; entry dropped.
    Gone,
    /// Owning run is still active.
    Kept,
    /// Identity verified and SIGTERM sent.
    Terminated,
    /// Dry run: would have been terminated.
    WouldTerminate,
    /// The pid now belongs to a different process. Never signalled.
    Foreign,
    /// Identity could not be checked. Never signalled.
    Unverified,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepItem {
    pub pid: u32,
    pub kind: ProcessKind,
    pub purpose: String,
    pub project: String,
    pub action: SweepAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub items: Vec<SweepItem>,
}

impl SweepReport {
    pub fn count(&self, action: SweepAction) -> usize {
        self.items.iter().filter(|i| i.action == action).count()
    }
}

// ---------------------------------------------------------------------------
// ProcessMonitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProcessMonitor {
    root: PathBuf,
    grace: ProcessConfig,
    lock_timeout: Duration,
}

impl ProcessMonitor {
    pub fn new(root: &Path, grace: ProcessConfig, lock_timeout: Duration) -> Self {
        Self {
            root: root.to_path_buf(),
            grace,
            lock_timeout,
        }
    }

    /// Snapshot of the registry. Readers never lock.
    pub fn entries(&self) -> Result<Vec<ProcessEntry>> {
        Ok(self.read()?.processes)
    }

    fn read(&self) -> Result<Registry> {
        let path = paths::process_registry_path(&self.root);
        if !path.exists() {
            return Ok(Registry::default());
        }
        let data = std::fs::read_to_string(&path)?;
        serde_json::from_str(&data).map_err(|e| {
            CorruptionError {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn write(&self, lock: &ExclusiveLock, registry: &Registry) -> Result<()> {
        lock.ensure_registry()?;
        let data = serde_json::to_string_pretty(registry)?;
        io::atomic_write(&paths::process_registry_path(&self.root), data.as_bytes())
    }

    fn lock(&self) -> Result<ExclusiveLock> {
        ExclusiveLock::acquire(&self.root, LockScope::Registry, self.lock_timeout)
    }

    pub fn register(
        &self,
        pid: u32,
        kind: ProcessKind,
        purpose: &str,
        project: &str,
    ) -> Result<ProcessEntry> {
        let entry = ProcessEntry {
            pid,
            kind,
            purpose: purpose.to_string(),
            project: project.to_string(),
            registered_at: Utc::now(),
            start_ticks: process_start_ticks(pid),
        };
        let lock = self.lock()?;
        let mut registry = self.read()?;
        registry.processes.retain(|p| p.pid != pid);
        registry.processes.push(entry.clone());
        self.write(&lock, &registry)?;
        tracing::debug!(pid, kind = %kind, project, "process registered");
        Ok(entry)
    }

    pub fn unregister(&self, pid: u32) -> Result<bool> {
        let lock = self.lock()?;
        let mut registry = self.read()?;
        let before = registry.processes.len();
        registry.processes.retain(|p| p.pid != pid);
        if registry.processes.len() == before {
            return Ok(false);
        }
        self.write(&lock, &registry)?;
        Ok(true)
    }

    /// A run is active while its project is open and was updated within
    /// the grace period for this kind of process.
    fn run_active(&self, store: &StateStore, entry: &ProcessEntry, now: DateTime<Utc>) -> bool {
        let Ok(state) = store.load(&entry.project) else {
            return false;
        };
        if state.phase.is_terminal() || state.is_aborted() {
            return false;
        }
        let idle = now
            .signed_duration_since(state.updated_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        idle < entry.kind.grace(&self.grace)
    }

    /// Reclaim processes left behind by inactive runs. Only a process whose
    /// start time still matches its registration is ever signalled.
    pub fn sweep(&self, store: &StateStore, dry_run: bool, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport {
            dry_run,
            items: Vec::new(),
        };
        if self.read()?.processes.is_empty() {
            return Ok(report);
        }
        let lock = if dry_run { None } else { Some(self.lock()?) };
        let registry = self.read()?;
        let mut keep = Vec::new();

        for entry in registry.processes.iter() {
            let mut detail = None;
            let action = if !pid_alive(entry.pid) {
                SweepAction::Gone
            } else if self.run_active(store, entry, now) {
                keep.push(entry.clone());
                SweepAction::Kept
            } else {
                match (entry.start_ticks, process_start_ticks(entry.pid)) {
                    (Some(expected), Some(actual)) if expected == actual => {
                        if dry_run {
                            SweepAction::WouldTerminate
                        } else {
                            match terminate(entry.pid) {
                                Ok(()) => SweepAction::Terminated,
                                Err(e) => {
                                    detail = Some(e.to_string());
                                    keep.push(entry.clone());
                                    SweepAction::Unverified
                                }
                            }
                        }
                    }
                    (Some(_), Some(_)) => {
                        detail = Some("pid reused by another process".to_string());
                        SweepAction::Foreign
                    }
                    _ => {
                        detail = Some("start time unavailable".to_string());
                        keep.push(entry.clone());
                        SweepAction::Unverified
                    }
                }
            };
            report.items.push(SweepItem {
                pid: entry.pid,
                kind: entry.kind,
                purpose: entry.purpose.clone(),
                project: entry.project.clone(),
                action,
                detail,
            });
        }

        if let Some(lock) = lock {
            if keep.len() != registry.processes.len() {
                self.write(&lock, &Registry { processes: keep })?;
            }
        }
        tracing::info!(
            dry_run,
            terminated = report.count(SweepAction::Terminated),
            gone = report.count(SweepAction::Gone),
            foreign = report.count(SweepAction::Foreign),
            "process sweep finished"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProjectState;
    use crate::types::{GateMode, Mode, Phase};
    use std::process::{Command, Stdio};
    use tempfile::TempDir;

    fn monitor(root: &Path) -> ProcessMonitor {
        ProcessMonitor::new(root, ProcessConfig::default(), Duration::from_millis(500))
    }

    fn spawn_sleeper() -> std::process::Child {
        Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap()
    }

    #[test]
    fn own_pid_is_alive_and_zero_is_not() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
    }

    #[test]
    fn clean_registry_sweep_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let report = monitor(dir.path())
            .sweep(&StateStore::new(dir.path()), false, Utc::now())
            .unwrap();
        assert!(report.items.is_empty());
        assert!(!paths::process_registry_path(dir.path()).exists());
    }

    #[test]
    fn register_and_unregister() {
        let dir = TempDir::new().unwrap();
        let m = monitor(dir.path());
        m.register(std::process::id(), ProcessKind::Other, "self", "p").unwrap();
        assert_eq!(m.entries().unwrap().len(), 1);
        assert!(m.unregister(std::process::id()).unwrap());
        assert!(!m.unregister(std::process::id()).unwrap());
        assert!(m.entries().unwrap().is_empty());
    }

    #[test]
    fn exited_process_is_dropped() {
        let dir = TempDir::new().unwrap();
        let m = monitor(dir.path());
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        m.register(pid, ProcessKind::Verify, "true", "p").unwrap();
        let report = m.sweep(&StateStore::new(dir.path()), false, Utc::now()).unwrap();
        assert_eq!(report.count(SweepAction::Gone), 1);
        assert!(m.entries().unwrap().is_empty());
    }

    #[test]
    fn active_run_keeps_its_processes() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let lock = ExclusiveLock::acquire(
            dir.path(),
            LockScope::Project("p".into()),
            Duration::ZERO,
        )
        .unwrap();
        let mut state = ProjectState::new("p", "r", Mode::Coding, GateMode::Auto);
        state.phase = Phase::Executing;
        store.create(&lock, &state).unwrap();

        let mut child = spawn_sleeper();
        let m = monitor(dir.path());
        m.register(child.id(), ProcessKind::Agent, "agent", "p").unwrap();
        let report = m.sweep(&store, false, Utc::now()).unwrap();
        child.kill().unwrap();
        child.wait().unwrap();
        assert_eq!(report.count(SweepAction::Kept), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn dry_run_reports_without_signalling() {
        let dir = TempDir::new().unwrap();
        let m = monitor(dir.path());
        let mut child = spawn_sleeper();
        m.register(child.id(), ProcessKind::Agent, "orphan", "gone-project")
            .unwrap();
        let report = m.sweep(&StateStore::new(dir.path()), true, Utc::now()).unwrap();
        assert_eq!(report.count(SweepAction::WouldTerminate), 1);
        assert!(child.try_wait().unwrap().is_none());
        assert_eq!(m.entries().unwrap().len(), 1);

        let report = m.sweep(&StateStore::new(dir.path()), false, Utc::now()).unwrap();
        assert_eq!(report.count(SweepAction::Terminated), 1);
        assert!(!child.wait().unwrap().success());
        assert!(m.entries().unwrap().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reused_pid_is_never_signalled() {
        let dir = TempDir::new().unwrap();
        let m = monitor(dir.path());
        let mut child = spawn_sleeper();
        let mut entry = m
            .register(child.id(), ProcessKind::Agent, "orphan", "gone-project")
            .unwrap();
        // Rewrite the registration as if it belonged to an earlier process.
        entry.start_ticks = entry.start_ticks.map(|t| t + 1);
        let lock = m.lock().unwrap();
        m.write(&lock, &Registry { processes: vec![entry] }).unwrap();
        drop(lock);

        let report = m.sweep(&StateStore::new(dir.path()), false, Utc::now()).unwrap();
        assert_eq!(report.count(SweepAction::Foreign), 1);
        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
