use crate::error::Result;
use crate::io;
use crate::paths;
use crate::state::ProjectState;
use std::path::Path;

/// Human triage list for everything the engine gave up on.
pub fn render(state: &ProjectState) -> String {
    let mut out = format!("# Deferred: {}\n\n", state.id);
    if state.deferred.is_empty() {
        out.push_str("Nothing deferred.\n");
        return out;
    }
    out.push_str("These items need a human. Each lists the last checkpoint known to be good.\n\n");
    for item in &state.deferred {
        out.push_str(&format!("## {}\n\n", item.id));
        out.push_str(&format!("- What failed: {}\n", item.what_failed.trim()));
        if let Some(sig) = &item.signature {
            out.push_str(&format!("- Signature: `{sig}`\n"));
        }
        out.push_str(&format!("- Attempts: {}\n", item.attempts));
        match item.last_good_checkpoint {
            Some(seq) => out.push_str(&format!("- Last good checkpoint: {seq}\n")),
            None => out.push_str("- Last good checkpoint: none\n"),
        }
        out.push_str(&format!("- Deferred at: {}\n\n", item.created_at.to_rfc3339()));
    }
    out
}

pub fn write(root: &Path, state: &ProjectState) -> Result<()> {
    io::atomic_write(&paths::deferred_path(root, &state.id), render(state).as_bytes())
}
