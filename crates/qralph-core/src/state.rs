use crate::config::BreakerConfig;
use crate::team::AgentTask;
use crate::types::{
    FindingStatus, GateMode, Mode, Phase, Priority, RemediationStatus, ValidationOutcome,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// A P0/P1/P2 item parsed from an agent's output during synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub agent: String,
    pub priority: Priority,
    pub text: String,
    pub status: FindingStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remediation {
    pub status: RemediationStatus,
    /// Finding ids in the remediation plan.
    #[serde(default)]
    pub plan: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
}

impl Default for Remediation {
    fn default() -> Self {
        Self {
            status: RemediationStatus::NotStarted,
            plan: Vec::new(),
            last_error: None,
            verified_at: None,
        }
    }
}

/// The failure that sent the project into SELF_HEAL. Cleared once healed or
/// deferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub error: String,
    pub signature: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateCheck {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub passed: bool,
    pub checks: Vec<GateCheck>,
}

impl GateReport {
    pub fn from_checks(checks: Vec<GateCheck>) -> Self {
        Self {
            passed: checks.iter().all(|c| c.passed),
            checks,
        }
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldKind {
    Paused,
    Aborted,
}

/// A pause or abort marker. While set, every advance is refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hold {
    pub kind: HoldKind,
    pub reason: String,
    pub since: DateTime<Utc>,
}

/// Work handed to a human: an exhausted healing budget, a SKIP, or an
/// ESCALATE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub what_failed: String,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_good_checkpoint: Option<u64>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Monotonic usage and failure counters. Reset only by `heal clear`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub tokens: u64,
    pub cost_usd: f64,
    #[serde(default)]
    pub error_counts: BTreeMap<String, u32>,
    pub consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn record_usage(&mut self, tokens: u64, cost_usd: f64) {
        self.tokens = self.tokens.saturating_add(tokens);
        if cost_usd.is_finite() && cost_usd > 0.0 {
            self.cost_usd += cost_usd;
        }
    }

    pub fn record_error(&mut self, signature: &str) {
        *self.error_counts.entry(signature.to_string()).or_insert(0) += 1;
    }

    /// Why the breaker is open, if it is.
    pub fn trip_reason(&self, limits: &BreakerConfig) -> Option<String> {
        if self.tokens > limits.max_tokens {
            return Some(format!(
                "token usage {} exceeds limit {}",
                self.tokens, limits.max_tokens
            ));
        }
        if self.cost_usd > limits.max_cost_usd {
            return Some(format!(
                "cost ${:.2} exceeds limit ${:.2}",
                self.cost_usd, limits.max_cost_usd
            ));
        }
        self.error_counts
            .iter()
            .find(|(_, n)| **n >= limits.max_same_error)
            .map(|(sig, n)| format!("error {sig} seen {n} times"))
    }
}

// ---------------------------------------------------------------------------
// ProjectState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub id: String,
    pub phase: Phase,
    pub mode: Mode,
    pub gate: GateMode,
    pub request: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub roster: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<AgentTask>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub remediation: Remediation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<Failure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_gate: Option<GateReport>,
    /// Human approval recorded for the transition into this phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_for: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold: Option<Hold>,
    #[serde(default)]
    pub deferred: Vec<DeferredItem>,
    #[serde(default)]
    pub circuit_breaker: CircuitBreaker,
}

impl ProjectState {
    pub fn new(id: impl Into<String>, request: impl Into<String>, mode: Mode, gate: GateMode) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            phase: Phase::Init,
            mode,
            gate,
            request: request.into(),
            created_at: now,
            updated_at: now,
            domains: Vec::new(),
            roster: Vec::new(),
            tasks: Vec::new(),
            findings: Vec::new(),
            remediation: Remediation::default(),
            validation: None,
            last_failure: None,
            quality_gate: None,
            approved_for: None,
            hold: None,
            deferred: Vec::new(),
            circuit_breaker: CircuitBreaker::default(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_aborted(&self) -> bool {
        matches!(&self.hold, Some(h) if h.kind == HoldKind::Aborted)
    }

    pub fn open_findings(&self, priorities: &[Priority]) -> Vec<&Finding> {
        self.findings
            .iter()
            .filter(|f| f.status == FindingStatus::Open && priorities.contains(&f.priority))
            .collect()
    }

    pub fn add_deferred(
        &mut self,
        signature: Option<String>,
        what_failed: impl Into<String>,
        attempts: u32,
        last_good_checkpoint: Option<u64>,
    ) -> String {
        let id = format!("D{}", self.deferred.len() + 1);
        self.deferred.push(DeferredItem {
            id: id.clone(),
            signature,
            what_failed: what_failed.into(),
            attempts,
            last_good_checkpoint,
            created_at: Utc::now(),
        });
        id
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_starts_in_init() {
        let s = ProjectState::new("001-x", "add dark mode", Mode::Coding, GateMode::Auto);
        assert_eq!(s.phase, Phase::Init);
        assert_eq!(s.remediation.status, RemediationStatus::NotStarted);
        assert!(s.hold.is_none());
    }

    #[test]
    fn json_roundtrip_is_exact() {
        let mut s = ProjectState::new("001-x", "add dark mode", Mode::Work, GateMode::Human);
        s.circuit_breaker.record_usage(1200, 0.37);
        s.circuit_breaker.record_error("abcd");
        s.add_deferred(Some("abcd".into()), "tests fail", 5, Some(3));
        let json = serde_json::to_string(&s).unwrap();
        let back: ProjectState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn breaker_trips_on_cost_and_repeats() {
        let limits = BreakerConfig::default();
        let mut b = CircuitBreaker::default();
        assert!(b.trip_reason(&limits).is_none());
        b.record_usage(10, 60.0);
        assert!(b.trip_reason(&limits).unwrap().contains("cost"));

        let mut b = CircuitBreaker::default();
        for _ in 0..limits.max_same_error {
            b.record_error("sig");
        }
        assert!(b.trip_reason(&limits).unwrap().contains("sig"));
    }

    #[test]
    fn usage_ignores_negative_cost() {
        let mut b = CircuitBreaker::default();
        b.record_usage(5, -3.0);
        assert_eq!(b.cost_usd, 0.0);
        assert_eq!(b.tokens, 5);
    }

    #[test]
    fn deferred_ids_are_sequential() {
        let mut s = ProjectState::new("p", "r", Mode::Coding, GateMode::Auto);
        assert_eq!(s.add_deferred(None, "a", 0, None), "D1");
        assert_eq!(s.add_deferred(None, "b", 0, None), "D2");
    }
}
