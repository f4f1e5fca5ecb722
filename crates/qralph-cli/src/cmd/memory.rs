use super::Ctx;
use crate::output::envelope;
use clap::Subcommand;
use qralph_core::config::Config;
use qralph_core::memory::MemoryStore;
use qralph_core::workspace;
use serde_json::{json, Value};

#[derive(Subcommand)]
pub enum MemorySubcommand {
    /// Record a resolution or decision
    Store {
        #[arg(required = true)]
        description: Vec<String>,
        #[arg(long, default_value = "general")]
        domain: String,
        #[arg(long, default_value = "note")]
        category: String,
    },
    /// Rank stored entries against text
    Query {
        #[arg(required = true)]
        text: Vec<String>,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Whether something similar was tried before
    Check {
        #[arg(required = true)]
        text: Vec<String>,
        #[arg(long)]
        domain: Option<String>,
    },
}

pub fn run(ctx: &Ctx, subcmd: MemorySubcommand) -> anyhow::Result<Value> {
    workspace::ensure_initialized(&ctx.root)?;
    let config = Config::load(&ctx.root)?;
    let store = MemoryStore::new(&ctx.root, config.memory.clone(), config.lock_timeout());
    match subcmd {
        MemorySubcommand::Store {
            description,
            domain,
            category,
        } => {
            let entry = store.store(
                &description.join(" "),
                &domain,
                &category,
                ctx.project.as_deref(),
            )?;
            envelope("ok", &json!({ "entry": entry }))
        }
        MemorySubcommand::Query {
            text,
            domain,
            limit,
        } => {
            let hits = store.query(&text.join(" "), domain.as_deref(), limit)?;
            envelope("ok", &json!({ "hits": hits }))
        }
        MemorySubcommand::Check { text, domain } => {
            envelope("ok", &store.check(&text.join(" "), domain.as_deref())?)
        }
    }
}
