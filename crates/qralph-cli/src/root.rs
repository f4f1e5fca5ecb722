use qralph_core::workspace;
use std::path::{Path, PathBuf};

/// Resolve the workspace root.
///
/// Priority:
/// 1. `--root` flag / `QRALPH_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.qralph/`
/// 3. Walk upward from `cwd` looking for `.git/`
/// 4. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_upward(&cwd, ".qralph")
        .or_else(|| find_upward(&cwd, ".git"))
        .unwrap_or(cwd)
}

fn find_upward(start: &Path, marker: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(marker).is_dir())
        .map(Path::to_path_buf)
}

/// `--project` / `QRALPH_PROJECT` if given, else `current-project.json`.
/// Resolved once per invocation.
pub fn resolve_project(root: &Path, explicit: Option<String>) -> Option<String> {
    if explicit.is_some() {
        return explicit;
    }
    match workspace::current(root) {
        Ok(current) => current,
        Err(e) => {
            tracing::warn!("ignoring unreadable current-project.json: {e}");
            None
        }
    }
}
