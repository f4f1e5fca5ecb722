use crate::error::{QralphError, Result};
use crate::io;
use crate::paths;
use crate::state::{Finding, GateCheck, GateReport, ProjectState};
use crate::team::{self, AgentTask};
use crate::types::{FindingStatus, Priority, TaskStatus};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

static FINDING_RE: OnceLock<Regex> = OnceLock::new();

fn finding_re() -> &'static Regex {
    FINDING_RE.get_or_init(|| Regex::new(r"^\s*[-*]\s*\[(P[012])\]\s*(.+?)\s*$").unwrap())
}

/// `(priority, text)` for every `- [P0] text` line in `text`.
pub fn parse_findings(text: &str) -> Vec<(Priority, String)> {
    text.lines()
        .filter_map(|line| {
            let caps = finding_re().captures(line)?;
            let priority = caps[1].parse().ok()?;
            Some((priority, caps[2].to_string()))
        })
        .collect()
}

/// Read every roster agent's output. Fails unless all of them exist and are
/// non-empty.
pub fn collect_outputs(root: &Path, id: &str, roster: &[String]) -> Result<BTreeMap<String, String>> {
    let mut outputs = BTreeMap::new();
    let mut missing = Vec::new();
    for agent in roster {
        let path = paths::agent_output_path(root, id, agent);
        match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => {
                outputs.insert(agent.clone(), text);
            }
            Ok(_) => missing.push(format!("{agent} (empty)")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                missing.push(format!("{agent} (missing)"))
            }
            Err(e) => return Err(e.into()),
        }
    }
    if roster.is_empty() {
        return Err(QralphError::Synthesis("no agents selected".to_string()));
    }
    if !missing.is_empty() {
        return Err(QralphError::Synthesis(format!(
            "waiting on agent outputs: {}",
            missing.join(", ")
        )));
    }
    Ok(outputs)
}

/// Findings in roster order, numbered F1.. . A repeated (priority, text)
/// pair is kept once, credited to the first agent that raised it.
pub fn extract_findings(roster: &[String], outputs: &BTreeMap<String, String>) -> Vec<Finding> {
    let mut seen = HashSet::new();
    let mut findings = Vec::new();
    for agent in roster {
        let Some(text) = outputs.get(agent) else {
            continue;
        };
        for (priority, line) in parse_findings(text) {
            if !seen.insert((priority, line.to_lowercase())) {
                continue;
            }
            findings.push(Finding {
                id: format!("F{}", findings.len() + 1),
                agent: agent.clone(),
                priority,
                text: line,
                status: FindingStatus::Open,
            });
        }
    }
    findings
}

pub fn quality_gate(tasks: &[AgentTask], roster: &[String], outputs: &BTreeMap<String, String>) -> GateReport {
    let blocked: Vec<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked)
        .map(|t| t.agent.as_str())
        .collect();
    let empty: Vec<&str> = roster
        .iter()
        .filter(|a| outputs.get(*a).map_or(true, |s| s.trim().is_empty()))
        .map(String::as_str)
        .collect();
    GateReport::from_checks(vec![
        GateCheck {
            name: "all_tasks_completed".to_string(),
            passed: team::all_completed(tasks),
            detail: Some(team::summarize(tasks)),
        },
        GateCheck {
            name: "outputs_non_empty".to_string(),
            passed: empty.is_empty(),
            detail: (!empty.is_empty()).then(|| empty.join(", ")),
        },
        GateCheck {
            name: "no_blocked_tasks".to_string(),
            passed: blocked.is_empty(),
            detail: (!blocked.is_empty()).then(|| blocked.join(", ")),
        },
    ])
}

pub fn render(state: &ProjectState) -> String {
    let mut out = format!("# Synthesis: {}\n\n{}\n\n", state.id, state.request);
    out.push_str(&format!("Agents: {}\n\n", state.roster.join(", ")));
    for priority in [Priority::P0, Priority::P1, Priority::P2] {
        let group: Vec<&Finding> = state
            .findings
            .iter()
            .filter(|f| f.priority == priority)
            .collect();
        out.push_str(&format!("## {priority} ({})\n\n", group.len()));
        if group.is_empty() {
            out.push_str("None.\n\n");
            continue;
        }
        for f in group {
            let mark = match f.status {
                FindingStatus::Open => " ",
                FindingStatus::Fixed => "x",
                FindingStatus::Deferred => "-",
            };
            out.push_str(&format!("- [{mark}] {} {} ({})\n", f.id, f.text, f.agent));
        }
        out.push('\n');
    }
    out
}

pub fn write(root: &Path, state: &ProjectState) -> Result<()> {
    io::atomic_write(&paths::synthesis_path(root, &state.id), render(state).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GateMode, Mode};
    use tempfile::TempDir;

    fn roster() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn parses_bullets_with_priorities() {
        let text = "Intro\n- [P0] Fix XSS in search\n* [P2]   tidy css  \n-[P1] no space is fine\n- [P3] ignored\n[P1] no bullet\n";
        let found = parse_findings(text);
        assert_eq!(
            found,
            vec![
                (Priority::P0, "Fix XSS in search".to_string()),
                (Priority::P2, "tidy css".to_string()),
                (Priority::P1, "no space is fine".to_string()),
            ]
        );
    }

    #[test]
    fn barrier_names_missing_and_empty_outputs() {
        let dir = TempDir::new().unwrap();
        let out = paths::agent_output_path(dir.path(), "p", "a");
        io::atomic_write(&out, b"  \n").unwrap();
        let err = collect_outputs(dir.path(), "p", &roster()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("a (empty)"), "{msg}");
        assert!(msg.contains("b (missing)"), "{msg}");
    }

    #[test]
    fn findings_are_numbered_in_roster_order_without_duplicates() {
        let mut outputs = BTreeMap::new();
        outputs.insert("b".to_string(), "- [P1] Add tests\n".to_string());
        outputs.insert(
            "a".to_string(),
            "- [P0] Contrast too low\n- [P1] add tests\n".to_string(),
        );
        let findings = extract_findings(&roster(), &outputs);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].id, "F1");
        assert_eq!(findings[0].agent, "a");
        assert_eq!(findings[1].text, "add tests");
    }

    #[test]
    fn gate_fails_on_blocked_task() {
        let mut tasks = vec![AgentTask::new("a", "t"), AgentTask::new("b", "t")];
        team::complete_task(&mut tasks, "a").unwrap();
        team::block_task(&mut tasks, "b", "no access").unwrap();
        let mut outputs = BTreeMap::new();
        outputs.insert("a".to_string(), "x".to_string());
        outputs.insert("b".to_string(), "y".to_string());
        let gate = quality_gate(&tasks, &roster(), &outputs);
        assert!(!gate.passed);
        assert_eq!(gate.failed_names(), vec!["all_tasks_completed", "no_blocked_tasks"]);
    }

    #[test]
    fn render_groups_by_priority() {
        let mut state = ProjectState::new("p", "add dark mode", Mode::Coding, GateMode::Auto);
        state.roster = roster();
        state.findings = extract_findings(
            &state.roster,
            &BTreeMap::from([("a".to_string(), "- [P0] one\n- [P2] two\n".to_string())]),
        );
        let md = render(&state);
        assert!(md.contains("## P0 (1)"));
        assert!(md.contains("## P1 (0)\n\nNone."));
        assert!(md.contains("- [ ] F1 one (a)"));
    }
}
