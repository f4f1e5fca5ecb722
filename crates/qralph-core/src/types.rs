use crate::error::QralphError;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Init,
    Discovering,
    Planning,
    Reviewing,
    UserReview,
    Executing,
    SelfHeal,
    Escalate,
    Validating,
    Blocked,
    Uat,
    Complete,
}

impl Phase {
    pub fn all() -> &'static [Phase] {
        &[
            Phase::Init,
            Phase::Discovering,
            Phase::Planning,
            Phase::Reviewing,
            Phase::UserReview,
            Phase::Executing,
            Phase::SelfHeal,
            Phase::Escalate,
            Phase::Validating,
            Phase::Blocked,
            Phase::Uat,
            Phase::Complete,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::Discovering => "DISCOVERING",
            Phase::Planning => "PLANNING",
            Phase::Reviewing => "REVIEWING",
            Phase::UserReview => "USER_REVIEW",
            Phase::Executing => "EXECUTING",
            Phase::SelfHeal => "SELF_HEAL",
            Phase::Escalate => "ESCALATE",
            Phase::Validating => "VALIDATING",
            Phase::Blocked => "BLOCKED",
            Phase::Uat => "UAT",
            Phase::Complete => "COMPLETE",
        }
    }

    /// BLOCKED and COMPLETE have no outgoing edges.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Blocked | Phase::Complete)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = QralphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Phase::all()
            .iter()
            .copied()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| QralphError::InvalidPhase(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Coding,
    Work,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Coding => "coding",
            Mode::Work => "work",
        }
    }

    /// Inclusive roster size bounds.
    pub fn roster_bounds(self) -> (usize, usize) {
        match self {
            Mode::Coding => (3, 7),
            Mode::Work => (1, 3),
        }
    }

    pub fn discovery_phase(self) -> Phase {
        match self {
            Mode::Coding => Phase::Discovering,
            Mode::Work => Phase::Planning,
        }
    }

    pub fn review_phase(self) -> Phase {
        match self {
            Mode::Coding => Phase::Reviewing,
            Mode::Work => Phase::UserReview,
        }
    }

    pub fn heal_phase(self) -> Phase {
        match self {
            Mode::Coding => Phase::SelfHeal,
            Mode::Work => Phase::Escalate,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = QralphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coding" => Ok(Mode::Coding),
            "work" => Ok(Mode::Work),
            _ => Err(QralphError::InvalidMode(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// GateMode
// ---------------------------------------------------------------------------

/// Who confirms gated transitions: a quality-gate evaluation or a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    Auto,
    Human,
}

impl fmt::Display for GateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GateMode::Auto => "auto",
            GateMode::Human => "human",
        })
    }
}

impl std::str::FromStr for GateMode {
    type Err = QralphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(GateMode::Auto),
            "human" => Ok(GateMode::Human),
            _ => Err(QralphError::InvalidValue(format!(
                "unknown gate '{s}': must be auto or human"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

/// Capability tier used for a healing attempt, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Fast,
    Standard,
    Deep,
    Human,
}

impl Tier {
    /// Attempts 1-2 fast, 3-4 standard, 5 deep, 6 and beyond need a human.
    pub fn for_attempt(attempt: u32) -> Tier {
        match attempt {
            0..=2 => Tier::Fast,
            3..=4 => Tier::Standard,
            5 => Tier::Deep,
            _ => Tier::Human,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Standard => "standard",
            Tier::Deep => "deep",
            Tier::Human => "human",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Priority / FindingStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
        })
    }
}

impl std::str::FromStr for Priority {
    type Err = QralphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P0" | "p0" => Ok(Priority::P0),
            "P1" | "p1" => Ok(Priority::P1),
            "P2" | "p2" => Ok(Priority::P2),
            _ => Err(QralphError::InvalidValue(format!("unknown priority '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Open,
    Fixed,
    Deferred,
}

// ---------------------------------------------------------------------------
// RemediationStatus / ValidationOutcome / Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStatus {
    NotStarted,
    InProgress,
    Verified,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationOutcome {
    Passed,
    Regressions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        })
    }
}

impl std::str::FromStr for Outcome {
    type Err = QralphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" | "pass" | "passed" => Ok(Outcome::Success),
            "failure" | "fail" | "failed" => Ok(Outcome::Failure),
            _ => Err(QralphError::InvalidValue(format!("unknown outcome '{s}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
