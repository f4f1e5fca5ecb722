use super::Ctx;
use crate::output::envelope;
use clap::Subcommand;
use qralph_core::team;
use serde_json::{json, Value};

#[derive(Subcommand)]
pub enum TaskSubcommand {
    /// Mark an agent's review task in progress
    Start { agent: String },
    /// Mark an agent's review task completed
    Complete { agent: String },
    /// Mark an agent's review task blocked
    Block {
        agent: String,
        #[arg(required = true)]
        reason: Vec<String>,
    },
    /// List review tasks
    List,
}

pub fn run(ctx: &Ctx, subcmd: TaskSubcommand) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    let id = ctx.project()?;
    let task = match subcmd {
        TaskSubcommand::Start { agent } => engine.start_task(id, &agent)?,
        TaskSubcommand::Complete { agent } => engine.complete_task(id, &agent)?,
        TaskSubcommand::Block { agent, reason } => {
            engine.block_task(id, &agent, &reason.join(" "))?
        }
        TaskSubcommand::List => {
            let tasks = engine.tasks(id)?;
            return envelope(
                "ok",
                &json!({ "project": id, "summary": team::summarize(&tasks), "tasks": tasks }),
            );
        }
    };
    envelope("ok", &json!({ "project": id, "task": task }))
}
