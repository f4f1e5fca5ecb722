use crate::error::{QralphError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const QRALPH_DIR: &str = ".qralph";
pub const PROJECTS_DIR: &str = ".qralph/projects";

pub const CONFIG_FILE: &str = ".qralph/config.yaml";
pub const CURRENT_PROJECT_FILE: &str = ".qralph/current-project.json";
pub const REGISTRY_LOCK_FILE: &str = ".qralph/registry.lock";
pub const PROCESS_REGISTRY_FILE: &str = ".qralph/process-registry.json";
pub const HEALING_PATTERNS_FILE: &str = ".qralph/healing-attempts/healing-patterns.json";
pub const MEMORY_LOG_FILE: &str = ".qralph/memory/entries.jsonl";

pub const STATE_FILE: &str = "state.json";
pub const LOCK_FILE: &str = ".lock";
pub const CHECKPOINTS_DIR: &str = "checkpoints";
pub const ATTEMPTS_LOG: &str = "healing-attempts/attempts.jsonl";
pub const DECISIONS_LOG: &str = "decisions.log";
pub const CONTROL_MD: &str = "CONTROL.md";
pub const AGENT_PROMPTS_DIR: &str = "agent-prompts";
pub const AGENT_OUTPUTS_DIR: &str = "agent-outputs";
pub const SYNTHESIS_MD: &str = "SYNTHESIS.md";
pub const DEFERRED_MD: &str = "DEFERRED.md";
pub const SUMMARY_MD: &str = "SUMMARY.md";
pub const FORENSICS_DIR: &str = "forensics";

// ---------------------------------------------------------------------------
// Workspace-level paths
// ---------------------------------------------------------------------------

pub fn qralph_dir(root: &Path) -> PathBuf {
    root.join(QRALPH_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn current_project_path(root: &Path) -> PathBuf {
    root.join(CURRENT_PROJECT_FILE)
}

pub fn registry_lock_path(root: &Path) -> PathBuf {
    root.join(REGISTRY_LOCK_FILE)
}

pub fn process_registry_path(root: &Path) -> PathBuf {
    root.join(PROCESS_REGISTRY_FILE)
}

pub fn healing_patterns_path(root: &Path) -> PathBuf {
    root.join(HEALING_PATTERNS_FILE)
}

pub fn memory_log_path(root: &Path) -> PathBuf {
    root.join(MEMORY_LOG_FILE)
}

pub fn projects_dir(root: &Path) -> PathBuf {
    root.join(PROJECTS_DIR)
}

// ---------------------------------------------------------------------------
// Project-level paths
// ---------------------------------------------------------------------------

pub fn project_dir(root: &Path, id: &str) -> PathBuf {
    projects_dir(root).join(id)
}

pub fn state_path(root: &Path, id: &str) -> PathBuf {
    project_dir(root, id).join(STATE_FILE)
}

pub fn lock_path(root: &Path, id: &str) -> PathBuf {
    project_dir(root, id).join(LOCK_FILE)
}

pub fn checkpoints_dir(root: &Path, id: &str) -> PathBuf {
    project_dir(root, id).join(CHECKPOINTS_DIR)
}

pub fn checkpoint_path(root: &Path, id: &str, seq: u64) -> PathBuf {
    checkpoints_dir(root, id).join(format!("{seq:06}.json"))
}

pub fn attempts_log_path(root: &Path, id: &str) -> PathBuf {
    project_dir(root, id).join(ATTEMPTS_LOG)
}

pub fn decisions_log_path(root: &Path, id: &str) -> PathBuf {
    project_dir(root, id).join(DECISIONS_LOG)
}

pub fn control_path(root: &Path, id: &str) -> PathBuf {
    project_dir(root, id).join(CONTROL_MD)
}

pub fn agent_prompt_path(root: &Path, id: &str, agent: &str) -> PathBuf {
    project_dir(root, id)
        .join(AGENT_PROMPTS_DIR)
        .join(format!("{agent}.md"))
}

pub fn agent_output_path(root: &Path, id: &str, agent: &str) -> PathBuf {
    project_dir(root, id)
        .join(AGENT_OUTPUTS_DIR)
        .join(format!("{agent}.md"))
}

pub fn synthesis_path(root: &Path, id: &str) -> PathBuf {
    project_dir(root, id).join(SYNTHESIS_MD)
}

pub fn deferred_path(root: &Path, id: &str) -> PathBuf {
    project_dir(root, id).join(DEFERRED_MD)
}

pub fn summary_path(root: &Path, id: &str) -> PathBuf {
    project_dir(root, id).join(SUMMARY_MD)
}

pub fn forensics_dir(root: &Path, id: &str) -> PathBuf {
    project_dir(root, id).join(FORENSICS_DIR)
}

// ---------------------------------------------------------------------------
// Project id validation
// ---------------------------------------------------------------------------

static ID_RE: OnceLock<Regex> = OnceLock::new();

fn id_re() -> &'static Regex {
    ID_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

pub fn validate_project_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 || !id_re().is_match(id) {
        return Err(QralphError::InvalidProjectId(id.to_string()));
    }
    Ok(())
}

/// Lowercase, hyphen-joined words of `text`, cut at a word boundary so the
/// result is at most `max_len` bytes.
pub fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::new();
    for word in text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let word = word.to_ascii_lowercase();
        let extra = if slug.is_empty() { word.len() } else { word.len() + 1 };
        if slug.len() + extra > max_len {
            break;
        }
        if !slug.is_empty() {
            slug.push('-');
        }
        slug.push_str(&word);
    }
    if slug.is_empty() {
        "project".to_string()
    } else {
        slug
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids() {
        for id in ["001-add-dark-mode", "a", "x1"] {
            validate_project_id(id).unwrap_or_else(|_| panic!("expected valid: {id}"));
        }
    }

    #[test]
    fn invalid_ids() {
        for id in ["", "-lead", "trail-", "has space", "UPPER", "../etc"] {
            assert!(validate_project_id(id).is_err(), "expected invalid: {id}");
        }
    }

    #[test]
    fn slugify_cuts_at_word_boundary() {
        assert_eq!(slugify("Add dark mode!", 40), "add-dark-mode");
        assert_eq!(slugify("add dark mode", 8), "add-dark");
        assert_eq!(slugify("???", 10), "project");
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/ws");
        assert_eq!(
            state_path(root, "001-x"),
            PathBuf::from("/tmp/ws/.qralph/projects/001-x/state.json")
        );
        assert_eq!(
            checkpoint_path(root, "001-x", 7),
            PathBuf::from("/tmp/ws/.qralph/projects/001-x/checkpoints/000007.json")
        );
        assert_eq!(
            healing_patterns_path(root),
            PathBuf::from("/tmp/ws/.qralph/healing-attempts/healing-patterns.json")
        );
    }
}
