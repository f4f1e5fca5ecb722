use crate::output::envelope;
use anyhow::Context;
use qralph_core::engine::PhaseEngine;
use qralph_core::types::{GateMode, Mode};
use qralph_core::config::Config;
use qralph_core::workspace;
use serde_json::{json, Value};
use std::path::Path;

/// Initialize the workspace; with a request, also create a project in INIT
/// and make it current.
pub fn run(
    root: &Path,
    request: &[String],
    mode: &str,
    gate: &str,
    id: Option<&str>,
) -> anyhow::Result<Value> {
    let created = workspace::init(root).context("failed to initialize .qralph/")?;
    let request = request.join(" ");
    if request.trim().is_empty() {
        return envelope(
            "ok",
            &json!({ "root": root, "created": created, "projects": workspace::list_projects(root)? }),
        );
    }

    let mode: Mode = mode.parse()?;
    let gate: GateMode = gate.parse()?;
    let engine = PhaseEngine::new(root, Config::load(root)?);
    let state = engine.create(&request, mode, gate, id)?;
    envelope(
        "ok",
        &json!({
            "root": root,
            "created": created,
            "project": state.id,
            "phase": state.phase,
            "mode": state.mode,
            "gate": state.gate,
            "next": "discover",
        }),
    )
}
