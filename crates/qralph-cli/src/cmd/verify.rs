use qralph_core::engine::PhaseEngine;
use qralph_core::types::Outcome;
use qralph_core::verify::{CommandVerifier, StatedOutcome, Verifier};
use qralph_core::QralphError;
use std::time::Duration;

/// Run `f` against the stated outcome when one was given, otherwise against
/// the configured verify commands.
pub fn with_verifier<T>(
    engine: &PhaseEngine,
    outcome: Option<&str>,
    detail: Option<String>,
    f: impl FnOnce(&dyn Verifier) -> qralph_core::Result<T>,
) -> anyhow::Result<T> {
    if let Some(outcome) = outcome {
        let outcome: Outcome = outcome.parse()?;
        return Ok(f(&StatedOutcome { outcome, detail })?);
    }
    let monitor = engine.monitor();
    let verifier = CommandVerifier::new(
        engine.root(),
        engine.config().verify.commands.clone(),
        Duration::from_secs(engine.config().verify.timeout_secs),
        &monitor,
    );
    if !verifier.has_commands() {
        return Err(QralphError::InvalidValue(
            "no verify commands configured: set verify.commands or pass --outcome success|failure"
                .to_string(),
        )
        .into());
    }
    Ok(f(&verifier)?)
}
