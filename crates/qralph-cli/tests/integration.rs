#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::PathBuf;
use tempfile::TempDir;

const PROJECT: &str = "001-add-dark-mode";

fn qralph(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("qralph").unwrap();
    cmd.current_dir(dir.path())
        .env("QRALPH_ROOT", dir.path())
        .env_remove("QRALPH_PROJECT")
        .env_remove("RUST_LOG");
    cmd
}

/// Run and parse stdout, asserting the exit code.
fn run_json(dir: &TempDir, args: &[&str], code: i32) -> Value {
    let out = qralph(dir).args(args).assert().code(code).get_output().stdout.clone();
    serde_json::from_slice(&out).unwrap_or_else(|e| {
        panic!("{args:?}: stdout is not JSON ({e}): {}", String::from_utf8_lossy(&out))
    })
}

fn ok(dir: &TempDir, args: &[&str]) -> Value {
    let v = run_json(dir, args, 0);
    assert_eq!(v["status"], "ok", "{args:?}: {v}");
    v
}

fn project_dir(dir: &TempDir) -> PathBuf {
    dir.path().join(".qralph/projects").join(PROJECT)
}

fn write_outputs(dir: &TempDir, roster: &Value, body: &str) {
    let outputs = project_dir(dir).join("agent-outputs");
    std::fs::create_dir_all(&outputs).unwrap();
    for agent in roster.as_array().unwrap() {
        let agent = agent.as_str().unwrap();
        std::fs::write(outputs.join(format!("{agent}.md")), body).unwrap();
    }
}

/// init + discover + select-agents; returns the roster.
fn start_review(dir: &TempDir) -> Value {
    ok(dir, &["init", "add dark mode"]);
    ok(dir, &["discover"]);
    ok(dir, &["select-agents"])["roster"].clone()
}

fn phase(dir: &TempDir) -> String {
    ok(dir, &["status"])["state"]["phase"]
        .as_str()
        .unwrap()
        .to_string()
}

// ---------------------------------------------------------------------------
// qralph init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_workspace_and_project() {
    let dir = TempDir::new().unwrap();
    let v = ok(&dir, &["init", "add dark mode"]);
    assert_eq!(v["project"], PROJECT);
    assert_eq!(v["phase"], "INIT");

    assert!(dir.path().join(".qralph/config.yaml").exists());
    assert!(dir.path().join(".qralph/current-project.json").exists());
    assert!(project_dir(&dir).join("state.json").exists());
    assert!(project_dir(&dir).join("CONTROL.md").exists());
    assert!(project_dir(&dir).join("checkpoints/000001.json").exists());
}

#[test]
fn init_without_request_is_idempotent() {
    let dir = TempDir::new().unwrap();
    ok(&dir, &["init"]);
    let again = ok(&dir, &["init"]);
    assert_eq!(again["created"], serde_json::json!([]));
}

#[test]
fn blank_request_only_initializes() {
    let dir = TempDir::new().unwrap();
    let v = run_json(&dir, &["init", "  "], 0);
    assert_eq!(v["status"], "ok");
    assert!(v.get("project").is_none());
}

// ---------------------------------------------------------------------------
// Full run
// ---------------------------------------------------------------------------

#[test]
fn legal_run_reaches_complete() {
    let dir = TempDir::new().unwrap();
    let roster = start_review(&dir);
    assert_eq!(roster.as_array().unwrap().len(), 3);
    assert_eq!(phase(&dir), "REVIEWING");

    write_outputs(&dir, &roster, "Review notes\n- [P1] check contrast in dark theme\n");
    let synth = ok(&dir, &["synthesize"]);
    assert_eq!(synth["phase"], "EXECUTING");
    assert_eq!(synth["findings"].as_array().unwrap().len(), 1);
    assert!(project_dir(&dir).join("SYNTHESIS.md").exists());

    let plan = ok(&dir, &["remediate"]);
    assert_eq!(plan["plan"][0]["id"], "F1");

    let verified = ok(&dir, &["remediate-verify", "--outcome", "success"]);
    assert_eq!(verified["result"], "verified");
    assert_eq!(verified["phase"], "VALIDATING");

    let done = ok(&dir, &["finalize", "--outcome", "success"]);
    assert_eq!(done["phase"], "COMPLETE");
    assert!(project_dir(&dir).join("SUMMARY.md").exists());
    assert_eq!(phase(&dir), "COMPLETE");

    let log = std::fs::read_to_string(project_dir(&dir).join("decisions.log")).unwrap();
    assert!(log.contains("\tCOMPLETE\ttransition\t"));
}

#[test]
fn control_md_template_is_not_a_command() {
    let dir = TempDir::new().unwrap();
    let roster = start_review(&dir);
    let control = std::fs::read_to_string(project_dir(&dir).join("CONTROL.md")).unwrap();
    assert!(control.contains("PAUSE"));

    write_outputs(&dir, &roster, "- [P2] polish\n");
    ok(&dir, &["synthesize"]);
    ok(&dir, &["remediate"]);
    ok(&dir, &["remediate-verify", "--outcome", "success"]);
    let done = ok(&dir, &["finalize", "--outcome", "success"]);
    assert_eq!(done["phase"], "COMPLETE");
}

#[test]
fn standalone_pause_line_holds_the_project() {
    let dir = TempDir::new().unwrap();
    ok(&dir, &["init", "add dark mode"]);
    let control = project_dir(&dir).join("CONTROL.md");
    let mut text = std::fs::read_to_string(&control).unwrap();
    text.push_str("PAUSE\n");
    std::fs::write(&control, text).unwrap();

    let v = run_json(&dir, &["discover"], 0);
    assert_eq!(v["status"], "refused");
    assert_eq!(v["refused"]["missing_precondition"], "resume");
    assert_eq!(phase(&dir), "INIT");

    ok(&dir, &["resume"]);
    ok(&dir, &["discover"]);
    assert_eq!(phase(&dir), "DISCOVERING");
}

#[test]
fn dispatch_runs_agents_and_feeds_synthesis() {
    let dir = TempDir::new().unwrap();
    start_review(&dir);
    let v = ok(
        &dir,
        &["dispatch", "--runner", "echo '- [P1] reviewed by' {agent}"],
    );
    assert_eq!(v["completed"], 3);
    let synth = ok(&dir, &["synthesize"]);
    assert_eq!(synth["findings"].as_array().unwrap().len(), 3);
    assert_eq!(synth["phase"], "EXECUTING");
}

#[test]
fn failed_verification_then_heal() {
    let dir = TempDir::new().unwrap();
    let roster = start_review(&dir);
    write_outputs(&dir, &roster, "- [P1] contrast\n");
    ok(&dir, &["synthesize"]);
    ok(&dir, &["remediate"]);

    let failed = ok(
        &dir,
        &["remediate-verify", "--outcome", "failure", "--detail", "npm test: 2 failing"],
    );
    assert_eq!(failed["result"], "failed");
    assert_eq!(failed["phase"], "SELF_HEAL");

    let healed = ok(
        &dir,
        &["heal", "attempt", "--fix", "update snapshot", "--outcome", "success"],
    );
    assert_eq!(healed["outcome"], "healed");
    assert_eq!(healed["phase"], "EXECUTING");

    let history = ok(&dir, &["heal", "history"]);
    assert_eq!(history["attempts"].as_array().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[test]
fn resume_skips_truncated_checkpoint() {
    let dir = TempDir::new().unwrap();
    ok(&dir, &["init", "add dark mode"]);
    ok(&dir, &["discover"]);
    let latest = project_dir(&dir).join("checkpoints/000002.json");
    let text = std::fs::read_to_string(&latest).unwrap();
    std::fs::write(&latest, &text[..text.len() / 2]).unwrap();

    let v = ok(&dir, &["resume"]);
    assert_eq!(v["checkpoint"], 1);
    assert_eq!(v["skipped_corrupt"], serde_json::json!([2]));
    assert_eq!(phase(&dir), "INIT");

    let again = ok(&dir, &["resume"]);
    assert_eq!(again["restored"], false);
}

#[test]
fn corrupt_state_file_is_recovered_by_status() {
    let dir = TempDir::new().unwrap();
    ok(&dir, &["init", "add dark mode"]);
    ok(&dir, &["discover"]);
    std::fs::write(project_dir(&dir).join("state.json"), "{\"phase\":").unwrap();

    assert_eq!(phase(&dir), "DISCOVERING");
    let v = ok(&dir, &["resume"]);
    assert_eq!(v["restored"], false);
}

#[test]
fn heal_status_survives_corrupt_state_file() {
    let dir = TempDir::new().unwrap();
    ok(&dir, &["init", "add dark mode"]);
    std::fs::write(project_dir(&dir).join("state.json"), "{\"phase\":").unwrap();

    let v = ok(&dir, &["heal", "status"]);
    assert_eq!(v["phase"], "INIT");
}

#[test]
fn abort_then_resume() {
    let dir = TempDir::new().unwrap();
    ok(&dir, &["init", "add dark mode"]);
    ok(&dir, &["abort", "wrong", "request"]);
    let refused = run_json(&dir, &["discover"], 0);
    assert_eq!(refused["status"], "refused");
    let resumed = ok(&dir, &["resume"]);
    assert_eq!(resumed["cleared_hold"]["kind"], "aborted");
    ok(&dir, &["discover"]);
}

// ---------------------------------------------------------------------------
// Exit codes
// ---------------------------------------------------------------------------

#[test]
fn refused_transition_exits_zero() {
    let dir = TempDir::new().unwrap();
    ok(&dir, &["init", "add dark mode"]);
    let usage = run_json(&dir, &["usage", "--tokens", "5000000"], 0);
    assert_eq!(usage["status"], "breaker_open");

    let v = run_json(&dir, &["discover"], 0);
    assert_eq!(v["status"], "refused");
    assert_eq!(v["refused"]["missing_precondition"], "heal clear");
    assert_eq!(phase(&dir), "INIT");
}

#[test]
fn wrong_phase_is_an_error_result_not_a_failure() {
    let dir = TempDir::new().unwrap();
    ok(&dir, &["init", "add dark mode"]);
    let v = run_json(&dir, &["synthesize"], 0);
    assert_eq!(v["status"], "error");
    assert!(v["error"].as_str().unwrap().contains("REVIEWING"));
}

#[test]
fn uninitialized_workspace_exits_one() {
    let dir = TempDir::new().unwrap();
    qralph(&dir)
        .args(["status", "--project", PROJECT])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("\"status\": \"error\""))
        .stdout(predicate::str::contains("not initialized"));
}

#[test]
fn missing_project_exits_one() {
    let dir = TempDir::new().unwrap();
    ok(&dir, &["init"]);
    let v = run_json(&dir, &["status"], 1);
    assert!(v["error"].as_str().unwrap().contains("no project selected"));
}

#[test]
fn verify_without_commands_or_outcome_is_rejected() {
    let dir = TempDir::new().unwrap();
    let roster = start_review(&dir);
    write_outputs(&dir, &roster, "- [P2] polish\n");
    ok(&dir, &["synthesize"]);
    let v = run_json(&dir, &["remediate-verify"], 0);
    assert_eq!(v["status"], "error");
    assert!(v["error"].as_str().unwrap().contains("--outcome"));
}

// ---------------------------------------------------------------------------
// Memory and config
// ---------------------------------------------------------------------------

#[test]
fn memory_store_then_query() {
    let dir = TempDir::new().unwrap();
    ok(&dir, &["init"]);
    ok(
        &dir,
        &["memory", "store", "pin node to 20 to fix the esm loader crash", "--domain", "build"],
    );
    let hits = ok(&dir, &["memory", "query", "esm loader crash"]);
    assert_eq!(hits["hits"].as_array().unwrap().len(), 1);
    let check = ok(&dir, &["memory", "check", "esm loader crash"]);
    assert_eq!(check["tried_before"], true);
}

#[test]
fn config_show_and_validate() {
    let dir = TempDir::new().unwrap();
    ok(&dir, &["init"]);
    let shown = ok(&dir, &["config", "show"]);
    assert_eq!(shown["config"]["healing"]["attempt_budget"], 5);
    ok(&dir, &["config", "validate"]);
}
