use super::Ctx;
use crate::output::envelope;
use anyhow::Context;
use qralph_core::team::{self, TaskBoard};
use serde_json::{json, Value};

/// Run the agent runner for every unfinished review task, bounded by
/// `agents.max_parallel`, then record the results in one step.
pub fn run(ctx: &Ctx, runner: Option<String>) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    let id = ctx.project()?;
    let jobs = engine.dispatch_jobs(id)?;
    if jobs.is_empty() {
        return envelope(
            "ok",
            &json!({ "project": id, "message": "no unfinished review tasks" }),
        );
    }
    let settings = engine.dispatch_settings(id, runner)?;
    tracing::info!(project = id, jobs = jobs.len(), max_parallel = settings.max_parallel, "dispatching agents");

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let board = rt.block_on(team::dispatch(TaskBoard::new(jobs), settings));
    let report = engine.record_dispatch(id, board.into_results())?;
    let status = if report.blocked > 0 { "partial" } else { "ok" };
    envelope(status, &report)
}
