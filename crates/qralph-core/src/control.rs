use crate::error::Result;
use crate::io;
use crate::lock::ExclusiveLock;
use crate::paths;
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// A human intervention written to a project's CONTROL.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
    Pause,
    Skip,
    Abort,
    Status,
    Escalate,
}

impl ControlCommand {
    pub fn all() -> &'static [ControlCommand] {
        &[
            ControlCommand::Pause,
            ControlCommand::Skip,
            ControlCommand::Abort,
            ControlCommand::Status,
            ControlCommand::Escalate,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlCommand::Pause => "PAUSE",
            ControlCommand::Skip => "SKIP",
            ControlCommand::Abort => "ABORT",
            ControlCommand::Status => "STATUS",
            ControlCommand::Escalate => "ESCALATE",
        }
    }

    /// Higher wins when several commands are pending.
    fn rank(self) -> u8 {
        match self {
            ControlCommand::Abort => 4,
            ControlCommand::Pause => 3,
            ControlCommand::Escalate => 2,
            ControlCommand::Skip => 1,
            ControlCommand::Status => 0,
        }
    }

    /// Only an exact standalone line counts. "- PAUSE: stop" or "pause" do not.
    fn from_line(line: &str) -> Option<ControlCommand> {
        let line = line.trim();
        ControlCommand::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == line)
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const TEMPLATE: &str = "# CONTROL

Write one command on a line by itself to intervene in this project.
The engine reads it before the next step and removes it once handled.

Commands:
- PAUSE: stop after the current step
- SKIP: defer the current failure to a human and continue
- ABORT: stop the project, keeping a checkpoint
- STATUS: report status and do nothing else
- ESCALATE: hand the current failure to a human and block

";

pub fn write_template(root: &Path, id: &str) -> Result<bool> {
    io::write_if_missing(&paths::control_path(root, id), TEMPLATE.as_bytes())
}

pub fn parse(text: &str) -> Vec<ControlCommand> {
    text.lines().filter_map(ControlCommand::from_line).collect()
}

/// The highest-priority pending command, if any.
pub fn pending(root: &Path, id: &str) -> Result<Option<ControlCommand>> {
    let path = paths::control_path(root, id);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    Ok(parse(&text).into_iter().max_by_key(|c| c.rank()))
}

/// Remove the lines carrying `cmd`, leaving everything else untouched.
/// Operators edit the file without taking the project lock, so the removal
/// is applied to a fresh read and retried if the file changed meanwhile.
pub fn consume(lock: &ExclusiveLock, root: &Path, id: &str, cmd: ControlCommand) -> Result<()> {
    lock.ensure_project(id)?;
    remove_command(&paths::control_path(root, id), cmd, || Ok(()))
}

const CONSUME_RETRIES: usize = 5;

fn without_command(text: &str, cmd: ControlCommand) -> String {
    let mut kept: Vec<&str> = text
        .lines()
        .filter(|l| ControlCommand::from_line(l) != Some(cmd))
        .collect();
    if text.ends_with('\n') {
        kept.push("");
    }
    kept.join("\n")
}

fn remove_command<F>(path: &Path, cmd: ControlCommand, mut before_write: F) -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    if !path.exists() {
        return Ok(());
    }
    let mut text = std::fs::read_to_string(path)?;
    for _ in 0..CONSUME_RETRIES {
        let updated = without_command(&text, cmd);
        before_write()?;
        let current = std::fs::read_to_string(path)?;
        if current == text {
            return io::atomic_write(path, updated.as_bytes());
        }
        text = current;
    }
    tracing::warn!(path = %path.display(), "CONTROL.md kept changing; applying removal to the latest read");
    io::atomic_write(path, without_command(&text, cmd).as_bytes())
}
