use crate::discovery::Capability;
use crate::error::{QralphError, Result};
use crate::process::{ProcessKind, ProcessMonitor};
use crate::types::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// AgentTask
// ---------------------------------------------------------------------------

/// One roster agent's review task, keyed by agent id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub agent: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentTask {
    pub fn new(agent: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            title: title.into(),
            status: TaskStatus::Pending,
            blocker: None,
            started_at: None,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Task list operations (operate on a mutable Vec<AgentTask>)
// ---------------------------------------------------------------------------

/// Replace the task list with one pending review task per roster agent.
pub fn assign_review_tasks(tasks: &mut Vec<AgentTask>, roster: &[String], request: &str) {
    let subject: String = request.chars().take(60).collect();
    tasks.clear();
    for agent in roster {
        tasks.push(AgentTask::new(agent.clone(), format!("Review: {subject}")));
    }
}

pub fn start_task(tasks: &mut [AgentTask], agent: &str) -> Result<()> {
    let task = find_mut(tasks, agent)?;
    task.status = TaskStatus::InProgress;
    task.blocker = None;
    task.started_at = Some(Utc::now());
    Ok(())
}

pub fn complete_task(tasks: &mut [AgentTask], agent: &str) -> Result<()> {
    let task = find_mut(tasks, agent)?;
    task.status = TaskStatus::Completed;
    task.blocker = None;
    if task.started_at.is_none() {
        task.started_at = Some(Utc::now());
    }
    task.completed_at = Some(Utc::now());
    Ok(())
}

pub fn block_task(tasks: &mut [AgentTask], agent: &str, reason: impl Into<String>) -> Result<()> {
    let task = find_mut(tasks, agent)?;
    task.status = TaskStatus::Blocked;
    task.blocker = Some(reason.into());
    Ok(())
}

pub fn all_completed(tasks: &[AgentTask]) -> bool {
    !tasks.is_empty() && tasks.iter().all(|t| t.status == TaskStatus::Completed)
}

/// Human-readable summary: "2/3 completed, 1 in progress, 0 blocked"
pub fn summarize(tasks: &[AgentTask]) -> String {
    let count = |s: TaskStatus| tasks.iter().filter(|t| t.status == s).count();
    format!(
        "{}/{} completed, {} in progress, {} blocked",
        count(TaskStatus::Completed),
        tasks.len(),
        count(TaskStatus::InProgress),
        count(TaskStatus::Blocked)
    )
}

fn find_mut<'a>(tasks: &'a mut [AgentTask], agent: &str) -> Result<&'a mut AgentTask> {
    tasks
        .iter_mut()
        .find(|t| t.agent == agent)
        .ok_or_else(|| QralphError::TaskNotFound(agent.to_string()))
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

pub fn render_prompt(project: &str, request: &str, capability: Option<&Capability>, agent: &str) -> String {
    let (name, description) = match capability {
        Some(c) => (c.name.as_str(), c.description.as_str()),
        None => (agent, ""),
    };
    format!(
        "# {name}\n\n\
         Project: {project}\n\n\
         ## Request\n\n{request}\n\n\
         ## Your role\n\n{description}\n\n\
         ## Output\n\n\
         Review the request from your role's point of view. List each finding on its\n\
         own line as `- [P0] ...`, `- [P1] ...` or `- [P2] ...` (P0 blocks release,\n\
         P1 should be fixed, P2 is optional). Free text around the findings is kept.\n"
    )
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub agent: String,
    pub prompt_path: PathBuf,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub agent: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pending jobs and their collected results. Results are only read once
/// every job has reported.
#[derive(Debug, Default)]
pub struct TaskBoard {
    queue: VecDeque<DispatchJob>,
    results: BTreeMap<String, DispatchResult>,
}

impl TaskBoard {
    pub fn new(jobs: Vec<DispatchJob>) -> Self {
        Self {
            queue: jobs.into(),
            results: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn take_jobs(&mut self) -> Vec<DispatchJob> {
        self.queue.drain(..).collect()
    }

    fn record(&mut self, result: DispatchResult) {
        self.results.insert(result.agent.clone(), result);
    }

    pub fn into_results(self) -> BTreeMap<String, DispatchResult> {
        self.results
    }
}

/// Settings for one dispatch run.
#[derive(Clone)]
pub struct DispatchSettings {
    /// Shell template with `{agent}`, `{prompt}` and `{output}` placeholders.
    pub runner: String,
    pub max_parallel: usize,
    pub timeout: Duration,
    pub project: String,
    pub monitor: ProcessMonitor,
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

pub fn render_runner(template: &str, job: &DispatchJob) -> String {
    template
        .replace("{agent}", &shell_quote(&job.agent))
        .replace("{prompt}", &shell_quote(&job.prompt_path.to_string_lossy()))
        .replace("{output}", &shell_quote(&job.output_path.to_string_lossy()))
}

/// Run every queued job concurrently, at most `max_parallel` at a time, and
/// return once all have finished.
pub async fn dispatch(mut board: TaskBoard, settings: DispatchSettings) -> TaskBoard {
    let semaphore = Arc::new(tokio::sync::Semaphore::new(settings.max_parallel.max(1)));
    let settings = Arc::new(settings);
    let mut handles = Vec::new();

    for job in board.take_jobs() {
        let sem = semaphore.clone();
        let settings = settings.clone();
        let agent = job.agent.clone();
        let handle = tokio::spawn(async move {
            let _permit = match sem.acquire().await {
                Ok(p) => p,
                Err(_) => return failed(&job.agent, "semaphore closed".to_string()),
            };
            run_job(&job, &settings).await
        });
        handles.push((agent, handle));
    }

    for (agent, handle) in handles {
        match handle.await {
            Ok(r) => board.record(r),
            Err(e) => board.record(failed(&agent, format!("task join error: {e}"))),
        }
    }
    board
}

fn failed(agent: &str, error: String) -> DispatchResult {
    DispatchResult {
        agent: agent.to_string(),
        ok: false,
        exit_code: None,
        timed_out: false,
        output_bytes: 0,
        error: Some(error),
    }
}

// The registry lock backs off with a blocking sleep, so it is taken off
// the runtime's worker threads.
async fn track(settings: &DispatchSettings, pid: u32, agent: &str) {
    let monitor = settings.monitor.clone();
    let project = settings.project.clone();
    let purpose = agent.to_string();
    let registered = tokio::task::spawn_blocking(move || {
        monitor.register(pid, ProcessKind::Agent, &purpose, &project)
    })
    .await;
    match registered {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::warn!(pid, agent, "could not register agent process: {e}"),
        Err(e) => tracing::warn!(pid, agent, "registry task failed: {e}"),
    }
}

async fn untrack(settings: &DispatchSettings, pid: u32) {
    let monitor = settings.monitor.clone();
    match tokio::task::spawn_blocking(move || monitor.unregister(pid)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::warn!(pid, "could not unregister agent process: {e}"),
        Err(e) => tracing::warn!(pid, "registry task failed: {e}"),
    }
}

async fn run_job(job: &DispatchJob, settings: &DispatchSettings) -> DispatchResult {
    let command = render_runner(&settings.runner, job);
    let mut child = match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(c) => c,
        Err(e) => return failed(&job.agent, format!("failed to spawn: {e}")),
    };

    let pid = child.id();
    if let Some(pid) = pid {
        track(settings, pid, &job.agent).await;
    }

    let stdout = child.stdout.take();
    let reader = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout {
            use tokio::io::AsyncReadExt;
            let _ = out.read_to_end(&mut buf).await;
        }
        buf
    });

    let waited = tokio::time::timeout(settings.timeout, child.wait()).await;
    let (status, timed_out) = match waited {
        Ok(Ok(status)) => (Some(status), false),
        Ok(Err(e)) => {
            tracing::warn!(agent = %job.agent, "wait failed: {e}");
            (None, false)
        }
        Err(_) => {
            tracing::warn!(agent = %job.agent, "agent timed out");
            let _ = child.kill().await;
            (None, true)
        }
    };
    if let Some(pid) = pid {
        untrack(settings, pid).await;
    }
    let captured = reader.await.unwrap_or_default();

    // Runners either print the review or write it to {output} themselves.
    if !captured.iter().all(u8::is_ascii_whitespace) {
        if let Err(e) = crate::io::atomic_write(&job.output_path, &captured) {
            return failed(&job.agent, format!("failed to write output: {e}"));
        }
    }
    let output_bytes = std::fs::metadata(&job.output_path)
        .map(|m| m.len())
        .unwrap_or(0);

    let ok = status.is_some_and(|s| s.success()) && output_bytes > 0;
    DispatchResult {
        agent: job.agent.clone(),
        ok,
        exit_code: status.and_then(|s| s.code()),
        timed_out,
        output_bytes,
        error: match (ok, timed_out) {
            (true, _) => None,
            (false, true) => Some(format!("timed out after {}s", settings.timeout.as_secs())),
            (false, false) if output_bytes == 0 => Some("agent produced no output".to_string()),
            (false, false) => Some("agent exited with failure".to_string()),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
