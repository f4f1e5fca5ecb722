use super::Ctx;
use crate::output::{envelope, status_for};
use serde_json::{json, Value};

pub fn discover(ctx: &Ctx) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    let id = ctx.project()?;
    let found = engine.discover(id)?;
    let phase = engine.store().load(id)?.phase;
    envelope(
        "ok",
        &json!({
            "project": id,
            "phase": phase,
            "domains": found.domains,
            "target": found.target,
            "roster": found.roster,
            "candidates": found.candidates,
        }),
    )
}

pub fn select_agents(ctx: &Ctx, agents: &[String]) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    let id = ctx.project()?;
    let explicit = (!agents.is_empty()).then_some(agents);
    let selection = engine.select_agents(id, explicit)?;
    envelope("ok", &selection)
}

pub fn synthesize(ctx: &Ctx) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    let id = ctx.project()?;
    let report = engine.synthesize(id)?;
    envelope(status_for(&report.refused), &report)
}
