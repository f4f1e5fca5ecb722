use super::Ctx;
use crate::cmd::verify::with_verifier;
use crate::output::{envelope, status_for};
use clap::Subcommand;
use qralph_core::healing::{FixGenerator, PlaybookFixGenerator, SuppliedFix};
use serde_json::{json, Value};

#[derive(Subcommand)]
pub enum HealSubcommand {
    /// Normalize an error and show its signature, tier and known fixes
    Analyze {
        #[arg(long)]
        error: String,
    },
    /// Make one healing attempt for the current failure
    Attempt {
        /// Error text; required when the project is in EXECUTING
        #[arg(long)]
        error: Option<String>,
        /// Fix to try; defaults to the built-in playbook for the error's category
        #[arg(long)]
        fix: Option<String>,
        /// Result of applying the fix, when verified outside qralph
        #[arg(long)]
        outcome: Option<String>,
        #[arg(long)]
        detail: Option<String>,
    },
    /// List healing attempts
    History {
        #[arg(long)]
        signature: Option<String>,
    },
    /// Restore the last healthy EXECUTING checkpoint
    Rollback {
        #[arg(long, default_value = "manual rollback")]
        reason: String,
    },
    /// Reset the circuit breaker
    Clear,
    /// Show failure, breaker and attempt counts
    Status,
}

pub fn run(ctx: &Ctx, subcmd: HealSubcommand) -> anyhow::Result<Value> {
    let engine = ctx.engine()?;
    let id = ctx.project()?;
    match subcmd {
        HealSubcommand::Analyze { error } => envelope("ok", &engine.heal_analyze(id, &error)?),
        HealSubcommand::Attempt {
            error,
            fix,
            outcome,
            detail,
        } => {
            let supplied;
            let playbook = PlaybookFixGenerator;
            let generator: &dyn FixGenerator = match fix {
                Some(fix) => {
                    supplied = SuppliedFix(fix);
                    &supplied
                }
                None => &playbook,
            };
            let report = with_verifier(&engine, outcome.as_deref(), detail, |v| {
                engine.heal(id, error.as_deref(), generator, v)
            })?;
            envelope(status_for(&report.refused), &report)
        }
        HealSubcommand::History { signature } => {
            let attempts = engine.heal_history(id, signature.as_deref())?;
            envelope("ok", &json!({ "project": id, "attempts": attempts }))
        }
        HealSubcommand::Rollback { reason } => envelope("ok", &engine.heal_rollback(id, &reason)?),
        HealSubcommand::Clear => {
            let breaker = engine.heal_clear(id)?;
            envelope("ok", &json!({ "project": id, "circuit_breaker": breaker }))
        }
        HealSubcommand::Status => envelope("ok", &engine.heal_status(id)?),
    }
}
