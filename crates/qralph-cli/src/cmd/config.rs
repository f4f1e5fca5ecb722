use crate::output::envelope;
use clap::Subcommand;
use qralph_core::config::{Config, WarnLevel};
use serde_json::{json, Value};
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration
    Show,
    /// Validate the config for common mistakes
    Validate,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand) -> anyhow::Result<Value> {
    let config = Config::load(root)?;
    match subcmd {
        ConfigSubcommand::Show => envelope("ok", &json!({ "config": config })),
        ConfigSubcommand::Validate => {
            let warnings = config.validate();
            let errors = warnings
                .iter()
                .filter(|w| w.level == WarnLevel::Error)
                .count();
            let status = if errors > 0 { "invalid" } else { "ok" };
            envelope(status, &json!({ "errors": errors, "warnings": warnings }))
        }
    }
}
