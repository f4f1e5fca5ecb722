mod cmd;
mod output;
mod root;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, heal::HealSubcommand, memory::MemorySubcommand,
    task::TaskSubcommand, Ctx,
};
use qralph_core::QralphError;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "qralph",
    about = "Deterministic multi-agent workflow with checkpoints, CONTROL.md and self-healing",
    version,
    propagate_version = true
)]
struct Cli {
    /// Workspace root (default: auto-detect from .qralph/ or .git/)
    #[arg(long, global = true, env = "QRALPH_ROOT")]
    root: Option<PathBuf>,

    /// Project id (default: the one in .qralph/current-project.json)
    #[arg(long, global = true, env = "QRALPH_PROJECT")]
    project: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize .qralph/ and, given a request, start a project
    Init {
        request: Vec<String>,
        /// coding or work
        #[arg(long, default_value = "coding")]
        mode: String,
        /// auto or human
        #[arg(long, default_value = "auto")]
        gate: String,
        /// Explicit project id instead of NNN-slug
        #[arg(long)]
        id: Option<String>,
    },

    /// Rank capabilities for the request and enter discovery
    Discover,

    /// Fix the agent roster and assign review tasks
    SelectAgents {
        /// Comma-separated capability ids (default: the discovery ranking)
        #[arg(long, value_delimiter = ',')]
        agents: Vec<String>,
    },

    /// Run the agent runner for every unfinished review task
    Dispatch {
        /// Shell command template with {agent}, {prompt} and {output}
        #[arg(long)]
        runner: Option<String>,
    },

    /// Manage review tasks
    Task {
        #[command(subcommand)]
        subcommand: TaskSubcommand,
    },

    /// Merge agent outputs into SYNTHESIS.md and evaluate the quality gate
    Synthesize,

    /// Build the remediation plan from open P0/P1 findings
    Remediate {
        #[arg(long, value_delimiter = ',')]
        fixed: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        defer: Vec<String>,
    },

    /// Verify the remediation
    RemediateVerify {
        /// success or failure, when verified outside qralph
        #[arg(long)]
        outcome: Option<String>,
        #[arg(long)]
        detail: Option<String>,
    },

    /// Validate from scratch and finish
    Finalize {
        #[arg(long)]
        outcome: Option<String>,
        #[arg(long)]
        detail: Option<String>,
    },

    /// Approve the pending gated transition
    Approve,

    /// Stop the project, keeping a checkpoint
    Abort { reason: Vec<String> },

    /// Recover from the newest valid checkpoint and lift any hold
    Resume,

    /// Show project state
    Status,

    /// Record token and cost usage for the circuit breaker
    Usage {
        #[arg(long, default_value_t = 0)]
        tokens: u64,
        #[arg(long, default_value_t = 0.0)]
        cost: f64,
    },

    /// Self-healing
    Heal {
        #[command(subcommand)]
        subcommand: HealSubcommand,
    },

    /// Terminate orphaned processes left by finished runs
    Sweep {
        #[arg(long)]
        dry_run: bool,
    },

    /// Cross-project memory
    Memory {
        #[command(subcommand)]
        subcommand: MemorySubcommand,
    },

    /// Show or validate .qralph/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Apply a pending CONTROL.md command now
    Control,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp
            | ErrorKind::DisplayVersion
            | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => e.exit(),
            _ => {
                let body = serde_json::json!({ "status": "error", "error": e.to_string().trim() });
                println!("{body}");
                std::process::exit(2);
            }
        },
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let project = root::resolve_project(&root, cli.project);
    let ctx = Ctx { root, project };

    let result = match cli.command {
        Commands::Init {
            request,
            mode,
            gate,
            id,
        } => cmd::init::run(&ctx.root, &request, &mode, &gate, id.as_deref()),
        Commands::Discover => cmd::review::discover(&ctx),
        Commands::SelectAgents { agents } => cmd::review::select_agents(&ctx, &agents),
        Commands::Dispatch { runner } => cmd::dispatch::run(&ctx, runner),
        Commands::Task { subcommand } => cmd::task::run(&ctx, subcommand),
        Commands::Synthesize => cmd::review::synthesize(&ctx),
        Commands::Remediate { fixed, defer } => cmd::project::remediate(&ctx, &fixed, &defer),
        Commands::RemediateVerify { outcome, detail } => {
            cmd::project::remediate_verify(&ctx, outcome.as_deref(), detail)
        }
        Commands::Finalize { outcome, detail } => {
            cmd::project::finalize(&ctx, outcome.as_deref(), detail)
        }
        Commands::Approve => cmd::project::approve(&ctx),
        Commands::Abort { reason } => cmd::project::abort(&ctx, &reason.join(" ")),
        Commands::Resume => cmd::project::resume(&ctx),
        Commands::Status => cmd::project::status(&ctx),
        Commands::Usage { tokens, cost } => cmd::project::usage(&ctx, tokens, cost),
        Commands::Heal { subcommand } => cmd::heal::run(&ctx, subcommand),
        Commands::Sweep { dry_run } => cmd::project::sweep(&ctx, dry_run),
        Commands::Memory { subcommand } => cmd::memory::run(&ctx, subcommand),
        Commands::Config { subcommand } => cmd::config::run(&ctx.root, subcommand),
        Commands::Control => cmd::project::control(&ctx),
    };

    let (body, code) = match result {
        Ok(body) => (body, 0),
        Err(e) => match e.downcast_ref::<QralphError>() {
            Some(QralphError::Phase(refusal)) => (output::refused_body(refusal), 0),
            Some(q) if !q.is_environment_failure() => (output::error_body(&e), 0),
            _ => (output::error_body(&e), 1),
        },
    };
    if let Err(e) = output::print_json(&body) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
    std::process::exit(code);
}
