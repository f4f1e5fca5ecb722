use crate::error::Result;
use crate::io;
use crate::paths;
use crate::types::Phase;
use chrono::Utc;
use serde::Serialize;
use std::path::Path;

/// One parsed line of `decisions.log`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub at: String,
    pub phase: String,
    pub event: String,
    pub detail: String,
}

/// Append `<rfc3339>\t<PHASE>\t<event>\t<detail>` to the project's
/// decisions log. Embedded control characters are escaped so one call always
/// writes exactly one line.
pub fn append(root: &Path, id: &str, phase: Phase, event: &str, detail: &str) -> Result<()> {
    let line = format!(
        "{}\t{}\t{}\t{}\n",
        Utc::now().to_rfc3339(),
        phase,
        io::sanitize_log_text(event),
        io::sanitize_log_text(detail),
    );
    io::append_text(&paths::decisions_log_path(root, id), &line)
}

pub fn read(root: &Path, id: &str) -> Result<Vec<AuditEntry>> {
    let path = paths::decisions_log_path(root, id);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read_to_string(&path)?;
    Ok(data
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(4, '\t');
            Some(AuditEntry {
                at: parts.next()?.to_string(),
                phase: parts.next()?.to_string(),
                event: parts.next()?.to_string(),
                detail: parts.next().unwrap_or("").to_string(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn hostile_detail_stays_on_one_line() {
        let dir = TempDir::new().unwrap();
        append(
            dir.path(),
            "p",
            Phase::Executing,
            "heal",
            "boom\n2026-01-01T00:00:00Z\tCOMPLETE\tadvance\tforged",
        )
        .unwrap();
        let entries = read(dir.path(), "p").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].phase, "EXECUTING");
        assert!(entries[0].detail.contains("\\n"));
        assert!(entries[0].detail.contains("\\t"));
    }

    #[test]
    fn entries_are_appended_in_order() {
        let dir = TempDir::new().unwrap();
        append(dir.path(), "p", Phase::Init, "created", "").unwrap();
        append(dir.path(), "p", Phase::Discovering, "advance", "INIT -> DISCOVERING").unwrap();
        let entries = read(dir.path(), "p").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].event, "advance");
    }
}
