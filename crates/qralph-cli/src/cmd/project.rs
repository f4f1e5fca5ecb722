use super::Ctx;
use crate::cmd::verify::with_verifier;
use crate::output::{envelope, status_for};
use qralph_core::engine::Resume;
use qralph_core::types::Phase;
use serde_json::{json, Value};

pub fn status(ctx: &Ctx) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    let report = engine.status(ctx.project()?)?;
    envelope("ok", &report)
}

pub fn remediate(ctx: &Ctx, fixed: &[String], defer: &[String]) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    let report = engine.remediate(ctx.project()?, fixed, defer)?;
    envelope("ok", &report)
}

pub fn remediate_verify(
    ctx: &Ctx,
    outcome: Option<&str>,
    detail: Option<String>,
) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    let id = ctx.project()?;
    let result = with_verifier(&engine, outcome, detail, |v| engine.remediate_verify(id, v))?;
    envelope(status_for(&result.refused), &result)
}

pub fn finalize(ctx: &Ctx, outcome: Option<&str>, detail: Option<String>) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    let id = ctx.project()?;
    let report = with_verifier(&engine, outcome, detail, |v| engine.finalize(id, v))?;
    envelope(status_for(&report.refused), &report)
}

pub fn approve(ctx: &Ctx) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    let report = engine.approve(ctx.project()?)?;
    envelope(status_for(&report.refused), &report)
}

pub fn abort(ctx: &Ctx, reason: &str) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    let reason = if reason.trim().is_empty() {
        "aborted by operator"
    } else {
        reason
    };
    let state = engine.abort(ctx.project()?, reason)?;
    envelope(
        "ok",
        &json!({ "project": state.id, "phase": state.phase, "hold": state.hold }),
    )
}

pub fn resume(ctx: &Ctx) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    let resumed = engine.resume(ctx.project()?)?;
    let status = match &resumed {
        Resume::AlreadyComplete { .. } => "complete",
        Resume::Resumed { state, .. } if state.phase == Phase::Blocked => "blocked",
        Resume::Resumed { .. } => "ok",
    };
    envelope(status, &resumed)
}

pub fn usage(ctx: &Ctx, tokens: u64, cost_usd: f64) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    let report = engine.record_usage(ctx.project()?, tokens, cost_usd)?;
    let status = if report.breaker_open.is_some() {
        "breaker_open"
    } else {
        "ok"
    };
    envelope(status, &report)
}

pub fn control(ctx: &Ctx) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    match engine.control(ctx.project()?)? {
        Some(report) => envelope("ok", &report),
        None => envelope("ok", &json!({ "command": null, "action": "no pending command" })),
    }
}

pub fn sweep(ctx: &Ctx, dry_run: bool) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    let report = engine.sweep(dry_run)?;
    envelope("ok", &report)
}
