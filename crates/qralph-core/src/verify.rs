//! Verification of remediation and healing fixes.
//!
//! A `Verifier` answers one question: does the project pass its checks now?
//! `CommandVerifier` runs the configured shell commands (`verify.commands` in
//! `.qralph/config.yaml`) in order, stopping at the first failure.
//! `StatedOutcome` carries a result the orchestrator already knows, for
//! checks that ran outside the engine.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{QralphError, Result};
use crate::io;
use crate::process::{ProcessKind, ProcessMonitor};
use crate::types::Outcome;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const OUTPUT_TAIL_CHARS: usize = 2000;

#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub command: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub output_tail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub passed: bool,
    pub results: Vec<CommandResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl VerifyReport {
    /// One line for logs and healing attempt records.
    pub fn summary(&self) -> String {
        if self.results.is_empty() {
            return self.note.clone().unwrap_or_default();
        }
        let passed = self.results.iter().filter(|r| r.passed).count();
        match self.results.iter().find(|r| !r.passed) {
            None => format!("{passed}/{} commands passed", self.results.len()),
            Some(r) if r.timed_out => format!("`{}` timed out", r.command),
            Some(r) => format!(
                "`{}` failed (exit {}): {}",
                r.command,
                r.exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                io::tail(r.output_tail.trim(), 200)
            ),
        }
    }

    /// Output of the first failing command, used as the error text for
    /// healing.
    pub fn failure_text(&self) -> Option<String> {
        self.results
            .iter()
            .find(|r| !r.passed)
            .map(|r| format!("{}\n{}", r.command, r.output_tail))
    }
}

pub trait Verifier {
    fn verify(&self, project: &str, fix: Option<&str>) -> Result<VerifyReport>;
}

// ---------------------------------------------------------------------------
// StatedOutcome
// ---------------------------------------------------------------------------

pub struct StatedOutcome {
    pub outcome: Outcome,
    pub detail: Option<String>,
}

impl Verifier for StatedOutcome {
    fn verify(&self, _project: &str, _fix: Option<&str>) -> Result<VerifyReport> {
        Ok(VerifyReport {
            passed: self.outcome == Outcome::Success,
            results: Vec::new(),
            note: Some(
                self.detail
                    .clone()
                    .unwrap_or_else(|| format!("stated outcome: {}", self.outcome)),
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// CommandVerifier
// ---------------------------------------------------------------------------

pub struct CommandVerifier<'a> {
    root: PathBuf,
    commands: Vec<String>,
    timeout: Duration,
    monitor: &'a ProcessMonitor,
}

impl<'a> CommandVerifier<'a> {
    pub fn new(
        root: &Path,
        commands: Vec<String>,
        timeout: Duration,
        monitor: &'a ProcessMonitor,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            commands,
            timeout,
            monitor,
        }
    }

    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    fn run_one(&self, project: &str, command: &str, fix: Option<&str>) -> Result<CommandResult> {
        let shell = which::which("sh").map_err(|e| QralphError::Verify(format!("no shell: {e}")))?;
        let stdout_file = tempfile::tempfile()?;
        let stderr_file = tempfile::tempfile()?;

        let mut cmd = Command::new(shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .env("QRALPH_PROJECT", project)
            .stdin(Stdio::null())
            .stdout(stdout_file.try_clone()?)
            .stderr(stderr_file.try_clone()?);
        if let Some(fix) = fix {
            cmd.env("QRALPH_FIX", fix);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| QralphError::Verify(format!("failed to start `{command}`: {e}")))?;

        let pid = child.id();
        if let Err(e) = self.monitor.register(pid, ProcessKind::Verify, command, project) {
            tracing::warn!(pid, "could not register verify process: {e}");
        }

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if started.elapsed() >= self.timeout {
                tracing::warn!(command, "verify command timed out");
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            std::thread::sleep(POLL_INTERVAL);
        };
        if let Err(e) = self.monitor.unregister(pid) {
            tracing::warn!(pid, "could not unregister verify process: {e}");
        }

        let mut output = read_all(stdout_file)?;
        output.push_str(&read_all(stderr_file)?);
        Ok(CommandResult {
            command: command.to_string(),
            passed: status.is_some_and(|s| s.success()),
            exit_code: status.and_then(|s| s.code()),
            timed_out: status.is_none(),
            duration_ms: started.elapsed().as_millis() as u64,
            output_tail: io::tail(&output, OUTPUT_TAIL_CHARS).to_string(),
        })
    }
}

fn read_all(mut file: std::fs::File) -> Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

impl Verifier for CommandVerifier<'_> {
    fn verify(&self, project: &str, fix: Option<&str>) -> Result<VerifyReport> {
        if self.commands.is_empty() {
            return Ok(VerifyReport {
                passed: true,
                results: Vec::new(),
                note: Some("no verify commands configured".to_string()),
            });
        }
        let mut results = Vec::new();
        for command in &self.commands {
            let result = self.run_one(project, command, fix)?;
            let passed = result.passed;
            tracing::info!(command = %command, passed, "verify command finished");
            results.push(result);
            if !passed {
                break;
            }
        }
        Ok(VerifyReport {
            passed: results.iter().all(|r| r.passed),
            results,
            note: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;
    use tempfile::TempDir;

    fn monitor(root: &Path) -> ProcessMonitor {
        ProcessMonitor::new(root, ProcessConfig::default(), Duration::from_millis(500))
    }

    #[test]
    fn passing_commands_verify() {
        let dir = TempDir::new().unwrap();
        let m = monitor(dir.path());
        let v = CommandVerifier::new(
            dir.path(),
            vec!["echo ok".into(), "true".into()],
            Duration::from_secs(10),
            &m,
        );
        let report = v.verify("p", None).unwrap();
        assert!(report.passed);
        assert_eq!(report.results.len(), 2);
        assert!(report.results[0].output_tail.contains("ok"));
        assert!(m.entries().unwrap().is_empty());
    }

    #[test]
    fn stops_at_first_failure() {
        let dir = TempDir::new().unwrap();
        let m = monitor(dir.path());
        let v = CommandVerifier::new(
            dir.path(),
            vec!["echo boom >&2; exit 3".into(), "true".into()],
            Duration::from_secs(10),
            &m,
        );
        let report = v.verify("p", None).unwrap();
        assert!(!report.passed);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].exit_code, Some(3));
        assert!(report.summary().contains("boom"));
        assert!(report.failure_text().unwrap().contains("boom"));
    }

    #[test]
    fn slow_command_times_out() {
        let dir = TempDir::new().unwrap();
        let m = monitor(dir.path());
        let v = CommandVerifier::new(
            dir.path(),
            vec!["sleep 5".into()],
            Duration::from_millis(200),
            &m,
        );
        let report = v.verify("p", None).unwrap();
        assert!(!report.passed);
        assert!(report.results[0].timed_out);
    }

    #[test]
    fn fix_is_exposed_to_commands() {
        let dir = TempDir::new().unwrap();
        let m = monitor(dir.path());
        let v = CommandVerifier::new(
            dir.path(),
            vec!["test \"$QRALPH_FIX\" = \"pin openssl\"".into()],
            Duration::from_secs(10),
            &m,
        );
        assert!(v.verify("p", Some("pin openssl")).unwrap().passed);
    }

    #[test]
    fn stated_outcome_passes_through() {
        let v = StatedOutcome {
            outcome: Outcome::Failure,
            detail: None,
        };
        let report = v.verify("p", Some("x")).unwrap();
        assert!(!report.passed);
        assert_eq!(report.summary(), "stated outcome: failure");
    }
}
