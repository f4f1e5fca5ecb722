//! The phase lifecycle and the workflow operations built on it.
//!
//! Every mutation takes the project lock, polls CONTROL.md, and ends with a
//! checkpoint plus a `decisions.log` line. A refused transition leaves the
//! persisted state untouched.

use crate::audit;
use crate::config::{BreakerConfig, Config};
use crate::control::{self, ControlCommand};
use crate::deferred;
use crate::discovery::{self, CapabilityRegistry, Discovery};
use crate::error::{PhaseError, QralphError, RecoveryError, Result};
use crate::healing::{
    self, Analysis, FixGenerator, HealOutcome, HealStatus, HealingAttempt, RollbackReport,
    SelfHealer,
};
use crate::io;
use crate::lock::{ExclusiveLock, LockScope};
use crate::paths;
use crate::process::{ProcessMonitor, SweepReport};
use crate::state::{CircuitBreaker, Failure, Finding, GateReport, Hold, HoldKind, ProjectState};
use crate::store::StateStore;
use crate::synthesis;
use crate::team::{self, AgentTask, DispatchJob, DispatchResult, DispatchSettings};
use crate::types::{
    FindingStatus, GateMode, Mode, Outcome, Phase, Priority, RemediationStatus, TaskStatus,
    ValidationOutcome,
};
use crate::verify::{Verifier, VerifyReport};
use crate::workspace;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Transition graph
// ---------------------------------------------------------------------------

/// Every legal edge for `mode`. Work mode substitutes PLANNING, USER_REVIEW
/// and ESCALATE for the coding-mode phases.
pub fn edges(mode: Mode) -> [(Phase, Phase); 10] {
    let discover = mode.discovery_phase();
    let review = mode.review_phase();
    let heal = mode.heal_phase();
    [
        (Phase::Init, discover),
        (discover, review),
        (review, Phase::Executing),
        (Phase::Executing, heal),
        (heal, Phase::Executing),
        (heal, Phase::Blocked),
        (Phase::Executing, Phase::Validating),
        (Phase::Validating, Phase::Executing),
        (Phase::Validating, Phase::Uat),
        (Phase::Uat, Phase::Complete),
    ]
}

pub fn is_edge(mode: Mode, from: Phase, to: Phase) -> bool {
    edges(mode).contains(&(from, to))
}

fn hold_refusal(state: &ProjectState, to: Phase) -> Option<PhaseError> {
    let hold = state.hold.as_ref()?;
    let word = match hold.kind {
        HoldKind::Paused => "paused",
        HoldKind::Aborted => "aborted",
    };
    Some(PhaseError::unmet(
        state.phase,
        to,
        format!("project is {word}: {}", hold.reason),
        "resume",
    ))
}

/// Hold, breaker and edge checks. Says nothing about the edge's
/// precondition.
fn guard(state: &ProjectState, to: Phase, limits: &BreakerConfig) -> std::result::Result<(), PhaseError> {
    if let Some(refusal) = hold_refusal(state, to) {
        return Err(refusal);
    }
    if to != Phase::Blocked {
        if let Some(reason) = state.circuit_breaker.trip_reason(limits) {
            return Err(PhaseError::unmet(
                state.phase,
                to,
                format!("circuit breaker open: {reason}"),
                "heal clear",
            ));
        }
    }
    if !is_edge(state.mode, state.phase, to) {
        return Err(PhaseError::illegal(state.phase, to));
    }
    Ok(())
}

/// Whether `state` may move to `to` right now.
pub fn can_transition_to(
    state: &ProjectState,
    to: Phase,
    limits: &BreakerConfig,
) -> std::result::Result<(), PhaseError> {
    guard(state, to, limits)?;
    precondition(state, to, limits)
        .map_err(|(reason, missing)| PhaseError::unmet(state.phase, to, reason, missing))
}

type Unmet = (String, &'static str);

fn require(ok: bool, reason: impl Into<String>, missing: &'static str) -> std::result::Result<(), Unmet> {
    if ok {
        Ok(())
    } else {
        Err((reason.into(), missing))
    }
}

fn precondition(state: &ProjectState, to: Phase, limits: &BreakerConfig) -> std::result::Result<(), Unmet> {
    let mode = state.mode;
    let review = mode.review_phase();
    let heal = mode.heal_phase();
    match (state.phase, to) {
        (Phase::Init, _) => require(
            !state.request.trim().is_empty(),
            "request is empty",
            "request text",
        ),
        (from, _) if from == mode.discovery_phase() => {
            let (min, max) = mode.roster_bounds();
            let n = state.roster.len();
            require(
                (min..=max).contains(&n),
                format!("roster has {n} agents; {mode} mode needs {min} to {max}"),
                "select-agents",
            )
        }
        (from, Phase::Executing) if from == review => {
            require(
                team::all_completed(&state.tasks),
                format!("review tasks not finished: {}", team::summarize(&state.tasks)),
                "complete review tasks",
            )?;
            match &state.quality_gate {
                None => return Err(("quality gate not evaluated".to_string(), "synthesize")),
                Some(gate) => require(
                    gate.passed,
                    format!("quality gate failed: {}", gate.failed_names().join(", ")),
                    "synthesize",
                )?,
            }
            require(
                state.gate == GateMode::Auto || state.approved_for == Some(Phase::Executing),
                "awaiting human approval",
                "approve",
            )
        }
        (Phase::Executing, to) if to == heal => require(
            state.last_failure.is_some(),
            "no failure recorded",
            "remediate-verify or heal attempt --error",
        ),
        (from, Phase::Executing) if from == heal => require(
            state.last_failure.is_none(),
            "the failure is neither healed nor deferred",
            "heal attempt",
        ),
        (_, Phase::Blocked) => require(
            !state.deferred.is_empty() || state.circuit_breaker.trip_reason(limits).is_some(),
            "nothing was deferred or escalated",
            "heal attempt",
        ),
        (Phase::Executing, Phase::Validating) => require(
            state.remediation.status == RemediationStatus::Verified,
            "remediation is not verified",
            "remediate-verify",
        ),
        (Phase::Validating, Phase::Executing) => require(
            state.validation == Some(ValidationOutcome::Regressions),
            "validation found no regressions",
            "finalize",
        ),
        (Phase::Validating, Phase::Uat) => require(
            state.validation == Some(ValidationOutcome::Passed),
            "validation has not passed",
            "finalize",
        ),
        (Phase::Uat, Phase::Complete) => require(
            state.gate == GateMode::Auto || state.approved_for == Some(Phase::Complete),
            "awaiting human approval",
            "approve",
        ),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: ProjectState,
    pub tasks: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_control: Option<ControlCommand>,
    pub checkpoints: usize,
    pub corrupt_checkpoints: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker_open: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "resume", rename_all = "snake_case")]
pub enum Resume {
    AlreadyComplete {
        state: ProjectState,
    },
    Resumed {
        state: ProjectState,
        checkpoint: u64,
        restored: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        cleared_hold: Option<Hold>,
        skipped_corrupt: Vec<u64>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlReport {
    pub command: ControlCommand,
    pub action: String,
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApproveReport {
    pub approved_for: Phase,
    pub advanced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refused: Option<PhaseError>,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub circuit_breaker: CircuitBreaker,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker_open: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    pub roster: Vec<String>,
    pub tasks: Vec<AgentTask>,
    pub prompts: Vec<PathBuf>,
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthesisReport {
    pub findings: Vec<Finding>,
    pub counts: BTreeMap<String, usize>,
    pub quality_gate: GateReport,
    pub path: PathBuf,
    pub advanced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refused: Option<PhaseError>,
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemediationReport {
    pub plan: Vec<Finding>,
    pub fixed: Vec<String>,
    pub deferred: Vec<String>,
    pub remediation: RemediationStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    /// "verified" or "failed".
    pub result: &'static str,
    pub report: VerifyReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub advanced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refused: Option<PhaseError>,
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalizeReport {
    pub validation: ValidationOutcome,
    pub report: VerifyReport,
    pub open_p0: Vec<String>,
    pub awaiting_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refused: Option<PhaseError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep: Option<SweepReport>,
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealReport {
    #[serde(flatten)]
    pub outcome: HealOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deferred_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refused: Option<PhaseError>,
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub results: BTreeMap<String, DispatchResult>,
    pub completed: usize,
    pub blocked: usize,
    pub tasks: String,
}

// ---------------------------------------------------------------------------
// PhaseEngine
// ---------------------------------------------------------------------------

pub struct PhaseEngine {
    root: PathBuf,
    config: Config,
    store: StateStore,
    registry: CapabilityRegistry,
}

impl PhaseEngine {
    pub fn new(root: &Path, config: Config) -> Self {
        let registry = CapabilityRegistry::new(&config.capabilities);
        Self {
            root: root.to_path_buf(),
            store: StateStore::new(root),
            registry,
            config,
        }
    }

    /// Engine for an initialized workspace, configured from its
    /// `.qralph/config.yaml`.
    pub fn open(root: &Path) -> Result<Self> {
        workspace::ensure_initialized(root)?;
        Ok(Self::new(root, Config::load(root)?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> ProcessMonitor {
        ProcessMonitor::new(
            &self.root,
            self.config.process.clone(),
            self.config.lock_timeout(),
        )
    }

    pub fn healer(&self) -> SelfHealer<'_> {
        SelfHealer::new(&self.root, &self.config, &self.store)
    }

    pub fn lock(&self, id: &str) -> Result<ExclusiveLock> {
        paths::validate_project_id(id)?;
        if !self.store.exists(id) {
            return Err(QralphError::ProjectNotFound(id.to_string()));
        }
        ExclusiveLock::acquire(
            &self.root,
            LockScope::Project(id.to_string()),
            self.config.lock_timeout(),
        )
    }

    /// Load state.json. A corrupt file is replaced by the newest valid
    /// checkpoint, taking the project lock to do so.
    fn load(&self, id: &str) -> Result<ProjectState> {
        match self.store.load(id) {
            Err(QralphError::Corruption(_)) => {
                let lock = self.lock(id)?;
                let state = self.load_locked(&lock, id)?;
                lock.release()?;
                Ok(state)
            }
            other => other,
        }
    }

    /// Same as `load` for a caller already holding the project lock.
    fn load_locked(&self, lock: &ExclusiveLock, id: &str) -> Result<ProjectState> {
        let err = match self.store.load(id) {
            Err(QralphError::Corruption(e)) => e,
            other => return other,
        };
        let checkpoint = self
            .store
            .latest_valid(id)?
            .ok_or_else(|| RecoveryError::NoValidCheckpoint(id.to_string()))?;
        tracing::warn!(
            project = id,
            checkpoint = checkpoint.seq,
            "state.json is corrupt ({}); restoring the newest valid checkpoint",
            err.reason
        );
        let seq = self.store.restore(
            lock,
            &checkpoint,
            &format!("recovered corrupt state from checkpoint {}", checkpoint.seq),
        )?;
        audit::append(
            &self.root,
            id,
            checkpoint.state.phase,
            "recovered",
            &format!("state.json was corrupt; restored checkpoint {} as {seq}", checkpoint.seq),
        )?;
        Ok(checkpoint.state)
    }

    /// Lock, load, and apply any pending CONTROL.md command.
    fn begin(&self, id: &str) -> Result<(ExclusiveLock, ProjectState)> {
        let lock = self.lock(id)?;
        let mut state = self.load_locked(&lock, id)?;
        self.poll_control(&lock, &mut state)?;
        Ok((lock, state))
    }

    fn persist(
        &self,
        lock: &ExclusiveLock,
        state: &mut ProjectState,
        event: &str,
        detail: &str,
    ) -> Result<u64> {
        state.touch();
        let seq = self.store.save(lock, state, &format!("{event}: {detail}"))?;
        audit::append(&self.root, &state.id, state.phase, event, detail)?;
        Ok(seq)
    }

    fn transition(
        &self,
        lock: &ExclusiveLock,
        state: &mut ProjectState,
        to: Phase,
        reason: &str,
    ) -> Result<u64> {
        can_transition_to(state, to, &self.config.breaker)?;
        let from = state.phase;
        state.phase = to;
        if state.approved_for == Some(to) {
            state.approved_for = None;
        }
        state.touch();
        let detail = format!("{from} -> {to}: {reason}");
        let seq = self.store.save(lock, state, &detail)?;
        audit::append(&self.root, &state.id, to, "transition", &detail)?;
        tracing::info!(project = %state.id, %from, %to, seq, "phase advanced");
        Ok(seq)
    }

    /// Like `transition`, but a refusal is returned as a value.
    fn try_transition(
        &self,
        lock: &ExclusiveLock,
        state: &mut ProjectState,
        to: Phase,
        reason: &str,
    ) -> Result<Option<PhaseError>> {
        match self.transition(lock, state, to, reason) {
            Ok(_) => Ok(None),
            Err(QralphError::Phase(e)) => {
                tracing::info!(project = %state.id, to = %to, "transition refused: {}", e.reason);
                Ok(Some(e))
            }
            Err(e) => Err(e),
        }
    }

    fn expect_phase(state: &ProjectState, operation: &str, expected: Phase) -> Result<()> {
        if state.phase == expected {
            Ok(())
        } else {
            Err(QralphError::WrongPhase {
                operation: operation.to_string(),
                expected: expected.to_string(),
                actual: state.phase.to_string(),
            })
        }
    }

    /// Newest checkpoint taken in EXECUTING with no consecutive failures.
    fn last_good(&self, id: &str) -> Result<Option<u64>> {
        Ok(self
            .store
            .latest_valid_where(id, |cp| {
                cp.state.phase == Phase::Executing
                    && cp.state.circuit_breaker.consecutive_failures == 0
            })?
            .map(|cp| cp.seq))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a project in INIT and make it the current project.
    pub fn create(
        &self,
        request: &str,
        mode: Mode,
        gate: GateMode,
        id: Option<&str>,
    ) -> Result<ProjectState> {
        let request = request.trim();
        if request.is_empty() {
            return Err(QralphError::EmptyRequest);
        }
        workspace::init(&self.root)?;
        let id = match id {
            Some(id) => {
                paths::validate_project_id(id)?;
                id.to_string()
            }
            None => workspace::allocate_project_id(&self.root, request)?,
        };
        if self.store.exists(&id) {
            return Err(QralphError::ProjectExists(id));
        }
        let lock = ExclusiveLock::acquire(
            &self.root,
            LockScope::Project(id.clone()),
            self.config.lock_timeout(),
        )?;
        let state = ProjectState::new(&id, request, mode, gate);
        self.store.create(&lock, &state)?;
        control::write_template(&self.root, &id)?;
        audit::append(
            &self.root,
            &id,
            Phase::Init,
            "created",
            &format!("mode={mode} gate={gate}: {request}"),
        )?;
        workspace::set_current(&self.root, &id)?;
        lock.release()?;
        self.sweep_quietly();
        Ok(state)
    }

    pub fn status(&self, id: &str) -> Result<StatusReport> {
        let state = self.load(id)?;
        let checkpoints = self.store.checkpoints(id)?;
        Ok(StatusReport {
            tasks: team::summarize(&state.tasks),
            pending_control: control::pending(&self.root, id)?,
            checkpoints: checkpoints.len(),
            corrupt_checkpoints: checkpoints.iter().filter(|c| !c.valid).map(|c| c.seq).collect(),
            breaker_open: state.circuit_breaker.trip_reason(&self.config.breaker),
            next: next_step(&state).map(str::to_string),
            state,
        })
    }

    /// Move `id` from `from` to `to`. Refused unless `from` is the stored
    /// phase and the edge and its precondition hold.
    pub fn advance(&self, id: &str, from: Phase, to: Phase, reason: &str) -> Result<ProjectState> {
        let (lock, mut state) = self.begin(id)?;
        if state.phase != from {
            return Err(PhaseError::unmet(
                from,
                to,
                format!("project is in {}, not {from}", state.phase),
                format!("phase {from}"),
            )
            .into());
        }
        self.transition(&lock, &mut state, to, reason)?;
        Ok(state)
    }

    /// Recover from the newest valid checkpoint and lift any pause or abort.
    /// Running it twice changes nothing the second time.
    pub fn resume(&self, id: &str) -> Result<Resume> {
        let lock = self.lock(id)?;
        let checkpoint = self
            .store
            .latest_valid(id)?
            .ok_or_else(|| RecoveryError::NoValidCheckpoint(id.to_string()))?;
        let skipped_corrupt: Vec<u64> = self
            .store
            .checkpoints(id)?
            .into_iter()
            .filter(|c| !c.valid && c.seq > checkpoint.seq)
            .map(|c| c.seq)
            .collect();

        if checkpoint.state.phase == Phase::Complete {
            self.load_locked(&lock, id)?;
            lock.release()?;
            return Ok(Resume::AlreadyComplete {
                state: checkpoint.state,
            });
        }

        let current = match self.store.load(id) {
            Ok(s) => Some(s),
            Err(QralphError::Corruption(e)) => {
                tracing::warn!(project = id, "state.json is corrupt: {}", e.reason);
                None
            }
            Err(e) => return Err(e),
        };
        let mut state = checkpoint.state.clone();
        let restored = current.as_ref() != Some(&checkpoint.state);
        if restored {
            let seq = self.store.restore(
                &lock,
                &checkpoint,
                &format!("resume from checkpoint {}", checkpoint.seq),
            )?;
            audit::append(
                &self.root,
                id,
                state.phase,
                "resume",
                &format!("restored checkpoint {} as {seq}", checkpoint.seq),
            )?;
        }
        let cleared_hold = state.hold.take();
        if let Some(hold) = &cleared_hold {
            self.persist(&lock, &mut state, "resume", &format!("cleared hold: {}", hold.reason))?;
        }
        lock.release()?;
        self.sweep_quietly();
        Ok(Resume::Resumed {
            state,
            checkpoint: checkpoint.seq,
            restored,
            cleared_hold,
            skipped_corrupt,
        })
    }

    /// Stop the project. The hold is checkpointed before the lock is
    /// released.
    pub fn abort(&self, id: &str, reason: &str) -> Result<ProjectState> {
        let lock = self.lock(id)?;
        let mut state = self.load_locked(&lock, id)?;
        if state.phase.is_terminal() {
            return Err(QralphError::InvalidValue(format!(
                "project is already {}",
                state.phase
            )));
        }
        state.hold = Some(Hold {
            kind: HoldKind::Aborted,
            reason: reason.to_string(),
            since: Utc::now(),
        });
        self.persist(&lock, &mut state, "abort", reason)?;
        lock.release()?;
        Ok(state)
    }

    pub fn record_usage(&self, id: &str, tokens: u64, cost_usd: f64) -> Result<UsageReport> {
        let lock = self.lock(id)?;
        let mut state = self.load_locked(&lock, id)?;
        state.circuit_breaker.record_usage(tokens, cost_usd);
        self.persist(
            &lock,
            &mut state,
            "usage",
            &format!("+{tokens} tokens, +${cost_usd:.4}"),
        )?;
        Ok(UsageReport {
            breaker_open: state.circuit_breaker.trip_reason(&self.config.breaker),
            circuit_breaker: state.circuit_breaker,
        })
    }

    /// Record human approval and take the transition it was waiting for.
    pub fn approve(&self, id: &str) -> Result<ApproveReport> {
        let (lock, mut state) = self.begin(id)?;
        let review = state.mode.review_phase();
        let target = match state.phase {
            p if p == review => Phase::Executing,
            Phase::Uat => Phase::Complete,
            other => {
                return Err(QralphError::WrongPhase {
                    operation: "approve".to_string(),
                    expected: format!("{review} or UAT"),
                    actual: other.to_string(),
                })
            }
        };
        if let Some(refusal) = hold_refusal(&state, target) {
            return Err(refusal.into());
        }
        state.approved_for = Some(target);
        self.persist(&lock, &mut state, "approve", &format!("approval recorded for {target}"))?;
        let refused = self.try_transition(&lock, &mut state, target, "human approval")?;
        let summary_path = if state.phase == Phase::Complete {
            Some(self.write_summary(&state)?)
        } else {
            None
        };
        lock.release()?;
        if state.phase == Phase::Complete {
            self.sweep_quietly();
        }
        Ok(ApproveReport {
            approved_for: target,
            advanced: refused.is_none(),
            refused,
            phase: state.phase,
            summary_path,
        })
    }

    // -----------------------------------------------------------------------
    // CONTROL.md
    // -----------------------------------------------------------------------

    /// Apply the highest-priority pending command, then remove it from the
    /// file.
    fn poll_control(&self, lock: &ExclusiveLock, state: &mut ProjectState) -> Result<Option<ControlReport>> {
        let Some(cmd) = control::pending(&self.root, &state.id)? else {
            return Ok(None);
        };
        let report = self.apply_control(lock, state, cmd)?;
        control::consume(lock, &self.root, &state.id, cmd)?;
        tracing::info!(project = %state.id, command = %cmd, action = %report.action, "control command applied");
        Ok(Some(report))
    }

    /// Check CONTROL.md now.
    pub fn control(&self, id: &str) -> Result<Option<ControlReport>> {
        let lock = self.lock(id)?;
        let mut state = self.load_locked(&lock, id)?;
        self.poll_control(&lock, &mut state)
    }

    pub fn apply_control(
        &self,
        lock: &ExclusiveLock,
        state: &mut ProjectState,
        cmd: ControlCommand,
    ) -> Result<ControlReport> {
        let heal = state.mode.heal_phase();
        let in_heal = state.phase == heal;
        let action = match cmd {
            ControlCommand::Status => {
                audit::append(&self.root, &state.id, state.phase, "control", "STATUS requested")?;
                "status reported".to_string()
            }
            ControlCommand::Pause | ControlCommand::Abort => {
                let kind = if cmd == ControlCommand::Pause {
                    HoldKind::Paused
                } else {
                    HoldKind::Aborted
                };
                if state.hold.as_ref().map(|h| h.kind) == Some(kind) {
                    "already held".to_string()
                } else {
                    state.hold = Some(Hold {
                        kind,
                        reason: format!("{cmd} in CONTROL.md"),
                        since: Utc::now(),
                    });
                    self.persist(lock, state, "control", &format!("{cmd}: hold set"))?;
                    format!("{cmd}: hold set")
                }
            }
            ControlCommand::Skip if in_heal && state.last_failure.is_some() => {
                let item = self.defer_failure(state, "skipped by operator")?;
                match self.try_transition(lock, state, Phase::Executing, &format!("SKIP: deferred as {item}"))? {
                    None => format!("failure deferred as {item}"),
                    Some(e) => {
                        self.persist(lock, state, "control", &format!("SKIP: deferred as {item}"))?;
                        format!("failure deferred as {item}; {e}")
                    }
                }
            }
            ControlCommand::Skip => {
                audit::append(&self.root, &state.id, state.phase, "control", "SKIP ignored: no failure")?;
                "nothing to skip".to_string()
            }
            ControlCommand::Escalate if in_heal => {
                let item = self.defer_failure(state, "escalated by operator")?;
                match self.try_transition(lock, state, Phase::Blocked, &format!("ESCALATE: deferred as {item}"))? {
                    None => format!("escalated as {item}; project blocked"),
                    Some(e) => {
                        self.persist(lock, state, "control", &format!("ESCALATE: deferred as {item}"))?;
                        format!("escalated as {item}; {e}")
                    }
                }
            }
            ControlCommand::Escalate => {
                let last_good = self.last_good(&state.id)?;
                let what = format!("escalated by operator during {}", state.phase);
                let item = state.add_deferred(None, what, 0, last_good);
                state.hold = Some(Hold {
                    kind: HoldKind::Paused,
                    reason: format!("escalated to a human ({item})"),
                    since: Utc::now(),
                });
                deferred::write(&self.root, state)?;
                self.persist(lock, state, "control", &format!("ESCALATE: {item}, paused"))?;
                format!("escalated as {item}; project paused")
            }
        };
        Ok(ControlReport {
            command: cmd,
            action,
            phase: state.phase,
        })
    }

    /// Move the current failure into the deferred list and DEFERRED.md.
    fn defer_failure(&self, state: &mut ProjectState, note: &str) -> Result<String> {
        let last_good = self.last_good(&state.id)?;
        let (signature, what, attempts) = match state.last_failure.take() {
            Some(f) => {
                let attempts = healing::read_attempts(&self.root, &state.id)?
                    .iter()
                    .filter(|a| a.signature == f.signature)
                    .count() as u32;
                (Some(f.signature), format!("{} ({note})", f.error.trim()), attempts)
            }
            None => (None, note.to_string(), 0),
        };
        let item = state.add_deferred(signature, what, attempts, last_good);
        deferred::write(&self.root, state)?;
        Ok(item)
    }

    // -----------------------------------------------------------------------
    // Discovery and team
    // -----------------------------------------------------------------------

    /// Rank capabilities for the request. From INIT this also moves the
    /// project into discovery.
    pub fn discover(&self, id: &str) -> Result<Discovery> {
        let (lock, mut state) = self.begin(id)?;
        let found = discovery::discover(&state.request, state.mode, &self.registry, &self.config.discovery);
        let target = state.mode.discovery_phase();
        if state.phase == Phase::Init {
            state.domains = found.domains.clone();
            let reason = format!("domains: {}", found.domains.join(", "));
            self.transition(&lock, &mut state, target, &reason)?;
        } else if state.phase == target {
            if state.domains != found.domains {
                state.domains = found.domains.clone();
                self.persist(&lock, &mut state, "discover", &found.domains.join(", "))?;
            }
        } else {
            return Err(QralphError::WrongPhase {
                operation: "discover".to_string(),
                expected: format!("INIT or {target}"),
                actual: state.phase.to_string(),
            });
        }
        Ok(found)
    }

    /// Fix the roster (explicit ids, or the discovery ranking), assign one
    /// review task per agent, and move to review.
    pub fn select_agents(&self, id: &str, agents: Option<&[String]>) -> Result<Selection> {
        let (lock, mut state) = self.begin(id)?;
        Self::expect_phase(&state, "select-agents", state.mode.discovery_phase())?;
        let roster = match agents {
            Some(list) => {
                let mut seen = BTreeSet::new();
                let mut roster = Vec::new();
                for agent in list {
                    if self.registry.get(agent).is_none() {
                        return Err(QralphError::InvalidValue(format!("unknown capability '{agent}'")));
                    }
                    if seen.insert(agent.clone()) {
                        roster.push(agent.clone());
                    }
                }
                roster
            }
            None => {
                discovery::discover(&state.request, state.mode, &self.registry, &self.config.discovery)
                    .roster
            }
        };
        let request = state.request.clone();
        team::assign_review_tasks(&mut state.tasks, &roster, &request);
        state.roster = roster;
        state.findings.clear();
        state.quality_gate = None;
        let review = state.mode.review_phase();
        let reason = format!("roster: {}", state.roster.join(", "));
        self.transition(&lock, &mut state, review, &reason)?;

        let mut prompts = Vec::new();
        for agent in &state.roster {
            prompts.push(self.write_prompt(&state, agent, true)?);
        }
        Ok(Selection {
            roster: state.roster.clone(),
            tasks: state.tasks.clone(),
            prompts,
            phase: state.phase,
        })
    }

    fn write_prompt(&self, state: &ProjectState, agent: &str, overwrite: bool) -> Result<PathBuf> {
        let path = paths::agent_prompt_path(&self.root, &state.id, agent);
        let prompt = team::render_prompt(&state.id, &state.request, self.registry.get(agent), agent);
        if overwrite {
            io::atomic_write(&path, prompt.as_bytes())?;
        } else {
            io::write_if_missing(&path, prompt.as_bytes())?;
        }
        Ok(path)
    }

    pub fn tasks(&self, id: &str) -> Result<Vec<AgentTask>> {
        Ok(self.load(id)?.tasks)
    }

    fn update_task<F>(&self, id: &str, agent: &str, event: &str, f: F) -> Result<AgentTask>
    where
        F: FnOnce(&mut [AgentTask]) -> Result<()>,
    {
        let lock = self.lock(id)?;
        let mut state = self.load_locked(&lock, id)?;
        f(&mut state.tasks)?;
        self.persist(&lock, &mut state, event, agent)?;
        state
            .tasks
            .into_iter()
            .find(|t| t.agent == agent)
            .ok_or_else(|| QralphError::TaskNotFound(agent.to_string()))
    }

    pub fn start_task(&self, id: &str, agent: &str) -> Result<AgentTask> {
        self.update_task(id, agent, "task_started", |tasks| team::start_task(tasks, agent))
    }

    pub fn complete_task(&self, id: &str, agent: &str) -> Result<AgentTask> {
        self.update_task(id, agent, "task_completed", |tasks| team::complete_task(tasks, agent))
    }

    pub fn block_task(&self, id: &str, agent: &str, reason: &str) -> Result<AgentTask> {
        self.update_task(id, agent, "task_blocked", |tasks| team::block_task(tasks, agent, reason))
    }

    /// Jobs for every review task not yet completed. Prompts that are
    /// missing are regenerated.
    pub fn dispatch_jobs(&self, id: &str) -> Result<Vec<DispatchJob>> {
        let state = self.load(id)?;
        Self::expect_phase(&state, "dispatch", state.mode.review_phase())?;
        let mut jobs = Vec::new();
        for task in state.tasks.iter().filter(|t| t.status != TaskStatus::Completed) {
            jobs.push(DispatchJob {
                agent: task.agent.clone(),
                prompt_path: self.write_prompt(&state, &task.agent, false)?,
                output_path: paths::agent_output_path(&self.root, id, &task.agent),
            });
        }
        Ok(jobs)
    }

    pub fn dispatch_settings(&self, id: &str, runner: Option<String>) -> Result<DispatchSettings> {
        let runner = runner
            .or_else(|| self.config.agents.runner.clone())
            .ok_or_else(|| {
                QralphError::InvalidValue(
                    "no agent runner configured: set agents.runner in .qralph/config.yaml or pass --runner"
                        .to_string(),
                )
            })?;
        Ok(DispatchSettings {
            runner,
            max_parallel: self.config.agents.max_parallel,
            timeout: Duration::from_secs(self.config.agents.timeout_secs),
            project: id.to_string(),
            monitor: self.monitor(),
        })
    }

    /// Fold dispatch results into the task board once every job reported.
    pub fn record_dispatch(
        &self,
        id: &str,
        results: BTreeMap<String, DispatchResult>,
    ) -> Result<DispatchReport> {
        let (lock, mut state) = self.begin(id)?;
        let (mut completed, mut blocked) = (0, 0);
        for result in results.values() {
            if result.ok {
                team::complete_task(&mut state.tasks, &result.agent)?;
                completed += 1;
            } else {
                let reason = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "agent run failed".to_string());
                team::block_task(&mut state.tasks, &result.agent, reason)?;
                blocked += 1;
            }
        }
        self.persist(
            &lock,
            &mut state,
            "dispatch",
            &format!("{completed} completed, {blocked} blocked"),
        )?;
        Ok(DispatchReport {
            results,
            completed,
            blocked,
            tasks: team::summarize(&state.tasks),
        })
    }

    // -----------------------------------------------------------------------
    // Synthesis and remediation
    // -----------------------------------------------------------------------

    /// Barrier on every roster agent's output, then parse findings, evaluate
    /// the quality gate and move to EXECUTING when it allows.
    pub fn synthesize(&self, id: &str) -> Result<SynthesisReport> {
        let (lock, mut state) = self.begin(id)?;
        let review = state.mode.review_phase();
        Self::expect_phase(&state, "synthesize", review)?;
        guard(&state, Phase::Executing, &self.config.breaker)?;

        let outputs = synthesis::collect_outputs(&self.root, id, &state.roster)?;
        for agent in outputs.keys() {
            let status = state.tasks.iter().find(|t| &t.agent == agent).map(|t| t.status);
            if matches!(status, Some(TaskStatus::Pending | TaskStatus::InProgress)) {
                team::complete_task(&mut state.tasks, agent)?;
            }
        }
        state.findings = synthesis::extract_findings(&state.roster, &outputs);
        let gate = synthesis::quality_gate(&state.tasks, &state.roster, &outputs);
        state.quality_gate = Some(gate.clone());
        let detail = format!(
            "{} findings; quality gate {}",
            state.findings.len(),
            if gate.passed { "passed" } else { "failed" }
        );
        self.persist(&lock, &mut state, "synthesize", &detail)?;
        synthesis::write(&self.root, &state)?;

        let refused = self.try_transition(&lock, &mut state, Phase::Executing, "synthesis complete")?;
        let mut counts = BTreeMap::new();
        for f in &state.findings {
            *counts.entry(f.priority.to_string()).or_insert(0) += 1;
        }
        Ok(SynthesisReport {
            findings: state.findings.clone(),
            counts,
            quality_gate: gate,
            path: paths::synthesis_path(&self.root, id),
            advanced: refused.is_none(),
            refused,
            phase: state.phase,
        })
    }

    /// Mark findings fixed or deferred and rebuild the plan from the open
    /// P0/P1 findings.
    pub fn remediate(&self, id: &str, fixed: &[String], defer: &[String]) -> Result<RemediationReport> {
        let (lock, mut state) = self.begin(id)?;
        Self::expect_phase(&state, "remediate", Phase::Executing)?;
        if let Some(refusal) = hold_refusal(&state, Phase::Executing) {
            return Err(refusal.into());
        }
        let last_good = self.last_good(id)?;
        for fid in fixed {
            find_finding(&mut state.findings, fid)?.status = FindingStatus::Fixed;
        }
        for fid in defer {
            let finding = find_finding(&mut state.findings, fid)?;
            finding.status = FindingStatus::Deferred;
            let what = format!("{} [{}] {}", finding.id, finding.priority, finding.text);
            state.add_deferred(None, what, 0, last_good);
        }
        state.remediation.plan = state
            .open_findings(&[Priority::P0, Priority::P1])
            .iter()
            .map(|f| f.id.clone())
            .collect();
        state.remediation.status = RemediationStatus::InProgress;
        state.remediation.verified_at = None;
        let detail = format!(
            "plan: [{}]; fixed: [{}]; deferred: [{}]",
            state.remediation.plan.join(", "),
            fixed.join(", "),
            defer.join(", ")
        );
        self.persist(&lock, &mut state, "remediate", &detail)?;
        synthesis::write(&self.root, &state)?;
        if !defer.is_empty() {
            deferred::write(&self.root, &state)?;
        }
        let plan = state
            .open_findings(&[Priority::P0, Priority::P1])
            .into_iter()
            .cloned()
            .collect();
        Ok(RemediationReport {
            plan,
            fixed: fixed.to_vec(),
            deferred: defer.to_vec(),
            remediation: state.remediation.status,
        })
    }

    /// Verify the remediation. Passing moves to VALIDATING; failing records
    /// the failure and moves to the heal phase.
    pub fn remediate_verify(&self, id: &str, verifier: &dyn Verifier) -> Result<VerifyOutcome> {
        let (lock, mut state) = self.begin(id)?;
        Self::expect_phase(&state, "remediate-verify", Phase::Executing)?;
        guard(&state, Phase::Validating, &self.config.breaker)?;

        let report = verifier.verify(id, None)?;
        if report.passed {
            state.remediation.status = RemediationStatus::Verified;
            state.remediation.verified_at = Some(Utc::now());
            state.remediation.last_error = None;
            let refused = self.try_transition(&lock, &mut state, Phase::Validating, &report.summary())?;
            return Ok(VerifyOutcome {
                result: "verified",
                report,
                signature: None,
                advanced: refused.is_none(),
                refused,
                phase: state.phase,
            });
        }

        let error = report.failure_text().unwrap_or_else(|| report.summary());
        let signature = healing::signature(&healing::normalize_error(&error));
        state.remediation.status = RemediationStatus::Failed;
        state.remediation.last_error = Some(io::tail(&error, 2000).to_string());
        state.last_failure = Some(Failure {
            error,
            signature: signature.clone(),
            at: Utc::now(),
        });
        state.circuit_breaker.record_error(&signature);
        self.persist(&lock, &mut state, "verify_failed", &report.summary())?;
        let heal = state.mode.heal_phase();
        let refused = self.try_transition(&lock, &mut state, heal, "remediation verification failed")?;
        Ok(VerifyOutcome {
            result: "failed",
            report,
            signature: Some(signature),
            advanced: refused.is_none(),
            refused,
            phase: state.phase,
        })
    }

    /// Validate from scratch: verify again and require no open P0 finding.
    /// Under the auto gate a pass runs straight through UAT to COMPLETE.
    pub fn finalize(&self, id: &str, verifier: &dyn Verifier) -> Result<FinalizeReport> {
        let (lock, mut state) = self.begin(id)?;
        Self::expect_phase(&state, "finalize", Phase::Validating)?;
        guard(&state, Phase::Uat, &self.config.breaker)?;

        let report = verifier.verify(id, None)?;
        let open_p0: Vec<String> = state
            .open_findings(&[Priority::P0])
            .iter()
            .map(|f| f.id.clone())
            .collect();

        let validation;
        let mut refused;
        if report.passed && open_p0.is_empty() {
            validation = ValidationOutcome::Passed;
            state.validation = Some(validation);
            refused = self.try_transition(&lock, &mut state, Phase::Uat, "validation passed")?;
            if refused.is_none() && state.gate == GateMode::Auto {
                refused = self.try_transition(&lock, &mut state, Phase::Complete, "auto gate")?;
            }
        } else {
            validation = ValidationOutcome::Regressions;
            state.validation = Some(validation);
            state.remediation.status = RemediationStatus::InProgress;
            state.remediation.last_error = Some(match report.failure_text() {
                Some(text) => io::tail(&text, 2000).to_string(),
                None => format!("open P0 findings: {}", open_p0.join(", ")),
            });
            refused = self.try_transition(&lock, &mut state, Phase::Executing, "validation found regressions")?;
        }

        let summary_path = if state.phase == Phase::Complete {
            Some(self.write_summary(&state)?)
        } else {
            None
        };
        lock.release()?;
        let sweep = if state.phase == Phase::Complete {
            match self.sweep(false) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::warn!("process sweep failed: {e}");
                    None
                }
            }
        } else {
            None
        };
        Ok(FinalizeReport {
            validation,
            report,
            open_p0,
            awaiting_approval: state.phase == Phase::Uat && state.gate == GateMode::Human,
            summary_path,
            refused,
            sweep,
            phase: state.phase,
        })
    }

    fn write_summary(&self, state: &ProjectState) -> Result<PathBuf> {
        let attempts = healing::read_attempts(&self.root, &state.id)?;
        let path = paths::summary_path(&self.root, &state.id);
        io::atomic_write(&path, render_summary(state, &attempts).as_bytes())?;
        Ok(path)
    }

    // -----------------------------------------------------------------------
    // Healing
    // -----------------------------------------------------------------------

    /// One healing attempt. From EXECUTING, `error` is first recorded as the
    /// failure and the project moves to the heal phase.
    pub fn heal(
        &self,
        id: &str,
        error: Option<&str>,
        generator: &dyn FixGenerator,
        verifier: &dyn Verifier,
    ) -> Result<HealReport> {
        let (lock, mut state) = self.begin(id)?;
        let heal = state.mode.heal_phase();
        let error = match (error, &state.last_failure) {
            (Some(e), _) if !e.trim().is_empty() => e.to_string(),
            (_, Some(f)) => f.error.clone(),
            _ => {
                return Err(QralphError::InvalidValue(
                    "no error given and no failure recorded".to_string(),
                ))
            }
        };

        if state.phase == Phase::Executing {
            state.last_failure = Some(Failure {
                signature: healing::signature(&healing::normalize_error(&error)),
                error: error.clone(),
                at: Utc::now(),
            });
            self.transition(&lock, &mut state, heal, "failure reported")?;
        } else {
            Self::expect_phase(&state, "heal attempt", heal)?;
            if let Some(refusal) = hold_refusal(&state, Phase::Executing) {
                return Err(refusal.into());
            }
        }

        let outcome = self
            .healer()
            .attempt(&lock, &mut state, &error, generator, verifier)?;
        let mut deferred_id = None;
        let mut refused = None;
        match &outcome {
            HealOutcome::Healed { attempt } => {
                state.last_failure = None;
                if state.remediation.status == RemediationStatus::Failed {
                    state.remediation.status = RemediationStatus::InProgress;
                }
                let reason = format!("healed by attempt {} ({})", attempt.attempt, attempt.tier);
                refused = self.try_transition(&lock, &mut state, Phase::Executing, &reason)?;
                if refused.is_some() {
                    self.persist(&lock, &mut state, "healed", &reason)?;
                }
            }
            HealOutcome::Retry { attempt, next_tier, .. } => {
                let detail = format!(
                    "attempt {} failed: {}; next tier {next_tier}",
                    attempt.attempt, attempt.detail
                );
                self.persist(&lock, &mut state, "heal_retry", &detail)?;
            }
            HealOutcome::Deferred {
                signature,
                attempts,
                reason,
            } => {
                let last_good = self.last_good(id)?;
                let item = state.add_deferred(Some(signature.clone()), error.trim(), *attempts, last_good);
                state.last_failure = None;
                deferred::write(&self.root, &state)?;
                let detail = format!("{reason}; deferred as {item}");
                refused = self.try_transition(&lock, &mut state, Phase::Blocked, &detail)?;
                if refused.is_some() {
                    self.persist(&lock, &mut state, "heal_deferred", &detail)?;
                }
                deferred_id = Some(item);
            }
            HealOutcome::RolledBack {
                restored_seq,
                forensic_path,
                ..
            } => {
                audit::append(
                    &self.root,
                    id,
                    state.phase,
                    "rollback",
                    &format!(
                        "restored checkpoint {restored_seq}; forensics at {}",
                        forensic_path.display()
                    ),
                )?;
            }
            HealOutcome::Rejected { fix, reason } => {
                audit::append(&self.root, id, state.phase, "heal_rejected", &format!("{fix}: {reason}"))?;
            }
        }
        Ok(HealReport {
            outcome,
            deferred_id,
            refused,
            phase: state.phase,
        })
    }

    pub fn heal_analyze(&self, id: &str, error: &str) -> Result<Analysis> {
        let state = self.load(id)?;
        self.healer().analyze(&state, error)
    }

    pub fn heal_history(&self, id: &str, signature: Option<&str>) -> Result<Vec<HealingAttempt>> {
        self.healer().history(id, signature)
    }

    pub fn heal_status(&self, id: &str) -> Result<HealStatus> {
        let state = self.load(id)?;
        self.healer().status(&state)
    }

    pub fn heal_rollback(&self, id: &str, reason: &str) -> Result<RollbackReport> {
        let lock = self.lock(id)?;
        let mut state = self.load_locked(&lock, id)?;
        let report = self.healer().rollback(&lock, &mut state, reason)?;
        audit::append(
            &self.root,
            id,
            state.phase,
            "rollback",
            &format!("restored checkpoint {} ({reason})", report.restored_seq),
        )?;
        Ok(report)
    }

    /// Reset the circuit breaker.
    pub fn heal_clear(&self, id: &str) -> Result<CircuitBreaker> {
        let lock = self.lock(id)?;
        let mut state = self.load_locked(&lock, id)?;
        self.healer().clear(&mut state);
        self.persist(&lock, &mut state, "breaker_cleared", "circuit breaker reset")?;
        Ok(state.circuit_breaker)
    }

    // -----------------------------------------------------------------------
    // Processes
    // -----------------------------------------------------------------------

    pub fn sweep(&self, dry_run: bool) -> Result<SweepReport> {
        self.monitor().sweep(&self.store, dry_run, Utc::now())
    }

    fn sweep_quietly(&self) {
        if let Err(e) = self.sweep(false) {
            tracing::warn!("process sweep failed: {e}");
        }
    }
}

fn find_finding<'a>(findings: &'a mut [Finding], id: &str) -> Result<&'a mut Finding> {
    findings
        .iter_mut()
        .find(|f| f.id == id)
        .ok_or_else(|| QralphError::FindingNotFound(id.to_string()))
}

/// Suggested next command.
fn next_step(state: &ProjectState) -> Option<&'static str> {
    if state.hold.is_some() {
        return Some("resume");
    }
    let mode = state.mode;
    Some(match state.phase {
        Phase::Init => "discover",
        p if p == mode.discovery_phase() => "select-agents",
        p if p == mode.review_phase() => {
            if state.gate == GateMode::Human
                && state.quality_gate.as_ref().is_some_and(|g| g.passed)
            {
                "approve"
            } else {
                "dispatch or write agent outputs, then synthesize"
            }
        }
        Phase::Executing => match state.remediation.status {
            RemediationStatus::NotStarted | RemediationStatus::Failed => "remediate",
            _ => "remediate-verify",
        },
        p if p == mode.heal_phase() => "heal attempt",
        Phase::Validating => "finalize",
        Phase::Uat => "approve",
        Phase::Blocked => "review DEFERRED.md",
        _ => return None,
    })
}

fn render_summary(state: &ProjectState, attempts: &[HealingAttempt]) -> String {
    let count = |s: FindingStatus| state.findings.iter().filter(|f| f.status == s).count();
    let healed = attempts.iter().filter(|a| a.outcome == Outcome::Success).count();
    let mut out = format!("# Summary: {}\n\n{}\n\n", state.id, state.request);
    out.push_str(&format!("- Mode: {} (gate: {})\n", state.mode, state.gate));
    out.push_str(&format!("- Phase: {}\n", state.phase));
    out.push_str(&format!("- Agents: {}\n", state.roster.join(", ")));
    out.push_str(&format!(
        "- Findings: {} total, {} fixed, {} deferred, {} open\n",
        state.findings.len(),
        count(FindingStatus::Fixed),
        count(FindingStatus::Deferred),
        count(FindingStatus::Open)
    ));
    out.push_str(&format!(
        "- Healing attempts: {} ({healed} succeeded)\n",
        attempts.len()
    ));
    out.push_str(&format!(
        "- Usage: {} tokens, ${:.2}\n",
        state.circuit_breaker.tokens, state.circuit_breaker.cost_usd
    ));
    if !state.deferred.is_empty() {
        out.push_str(&format!(
            "- Deferred to a human: {} (see DEFERRED.md)\n",
            state.deferred.len()
        ));
    }
    out.push_str(&format!("- Finished: {}\n", state.updated_at.to_rfc3339()));
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healing::SuppliedFix;
    use crate::state::GateCheck;
    use crate::verify::StatedOutcome;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> PhaseEngine {
        PhaseEngine::new(dir.path(), Config::default())
    }

    fn pass() -> StatedOutcome {
        StatedOutcome {
            outcome: Outcome::Success,
            detail: None,
        }
    }

    fn fail(detail: &str) -> StatedOutcome {
        StatedOutcome {
            outcome: Outcome::Failure,
            detail: Some(detail.to_string()),
        }
    }

    fn write_outputs(e: &PhaseEngine, id: &str, body: &str) {
        for agent in e.store().load(id).unwrap().roster {
            let path = paths::agent_output_path(e.root(), id, &agent);
            io::atomic_write(&path, body.as_bytes()).unwrap();
        }
    }

    /// Create and drive a project to EXECUTING.
    fn executing(e: &PhaseEngine, findings: &str) -> String {
        let id = e.create("add dark mode", Mode::Coding, GateMode::Auto, None).unwrap().id;
        e.discover(&id).unwrap();
        e.select_agents(&id, None).unwrap();
        write_outputs(e, &id, findings);
        let report = e.synthesize(&id).unwrap();
        assert!(report.advanced, "{:?}", report.refused);
        id
    }

    /// A state at `from` that satisfies the precondition of `from -> to`.
    fn ready(mode: Mode, from: Phase, to: Phase) -> ProjectState {
        let mut s = ProjectState::new("p", "add dark mode", mode, GateMode::Auto);
        s.phase = from;
        s.roster = vec!["a".into(), "b".into(), "c".into()];
        team::assign_review_tasks(&mut s.tasks, &s.roster.clone(), "r");
        for agent in ["a", "b", "c"] {
            team::complete_task(&mut s.tasks, agent).unwrap();
        }
        s.quality_gate = Some(GateReport::from_checks(vec![GateCheck {
            name: "ok".into(),
            passed: true,
            detail: None,
        }]));
        s.remediation.status = RemediationStatus::Verified;
        s.validation = Some(if to == Phase::Executing {
            ValidationOutcome::Regressions
        } else {
            ValidationOutcome::Passed
        });
        if to == mode.heal_phase() {
            s.last_failure = Some(Failure {
                error: "boom".into(),
                signature: "sig".into(),
                at: Utc::now(),
            });
        }
        s.add_deferred(None, "x", 0, None);
        s
    }

    #[test]
    fn transition_grid_allows_exactly_the_edges() {
        let limits = BreakerConfig::default();
        for mode in [Mode::Coding, Mode::Work] {
            let mut allowed = 0;
            for &from in Phase::all() {
                for &to in Phase::all() {
                    let result = can_transition_to(&ready(mode, from, to), to, &limits);
                    if is_edge(mode, from, to) {
                        assert!(result.is_ok(), "{mode}: {from} -> {to} refused: {result:?}");
                        allowed += 1;
                    } else {
                        let err = result.expect_err("illegal edge accepted");
                        assert_eq!(err.missing_precondition, None, "{mode}: {from} -> {to}");
                    }
                }
            }
            assert_eq!(allowed, 10);
        }
    }

    #[test]
    fn terminal_phases_have_no_exits() {
        for mode in [Mode::Coding, Mode::Work] {
            for (from, _) in edges(mode) {
                assert!(!from.is_terminal());
            }
        }
    }

    #[test]
    fn unmet_precondition_names_what_is_missing() {
        let mut s = ready(Mode::Coding, Phase::Executing, Phase::Validating);
        s.remediation.status = RemediationStatus::InProgress;
        let err = can_transition_to(&s, Phase::Validating, &BreakerConfig::default()).unwrap_err();
        assert_eq!(err.missing_precondition.as_deref(), Some("remediate-verify"));
    }

    #[test]
    fn refused_advance_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = e.create("add dark mode", Mode::Coding, GateMode::Auto, None).unwrap().id;
        let before = e.store().load(&id).unwrap();
        let seqs = e.store().next_seq(&id).unwrap();
        let err = e
            .advance(&id, Phase::Init, Phase::Complete, "skip ahead")
            .unwrap_err();
        assert!(matches!(err, QralphError::Phase(_)));
        assert_eq!(e.store().load(&id).unwrap(), before);
        assert_eq!(e.store().next_seq(&id).unwrap(), seqs);
    }

    #[test]
    fn stale_from_phase_is_refused() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = e.create("add dark mode", Mode::Coding, GateMode::Auto, None).unwrap().id;
        let err = e
            .advance(&id, Phase::Discovering, Phase::Reviewing, "x")
            .unwrap_err();
        let QralphError::Phase(p) = err else {
            panic!("expected a phase error")
        };
        assert!(p.reason.contains("project is in INIT"));
    }

    #[test]
    fn legal_run_reaches_complete() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = executing(&e, "- [P1] check contrast in dark theme\n- [P2] add a toggle animation\n");
        let state = e.store().load(&id).unwrap();
        assert_eq!(state.roster.len(), 3);
        assert_eq!(state.roster[0], "frontend-engineer");
        assert!(team::all_completed(&state.tasks));
        assert_eq!(state.findings.len(), 2);

        let plan = e.remediate(&id, &[], &[]).unwrap();
        assert_eq!(plan.plan.len(), 1);
        let verified = e.remediate_verify(&id, &pass()).unwrap();
        assert_eq!(verified.result, "verified");
        assert_eq!(verified.phase, Phase::Validating);

        let done = e.finalize(&id, &pass()).unwrap();
        assert_eq!(done.phase, Phase::Complete);
        assert!(done.summary_path.unwrap().exists());
        assert!(paths::synthesis_path(dir.path(), &id).exists());

        let phases: Vec<String> = audit::read(dir.path(), &id)
            .unwrap()
            .into_iter()
            .filter(|a| a.event == "transition")
            .map(|a| a.phase)
            .collect();
        assert_eq!(
            phases,
            ["DISCOVERING", "REVIEWING", "EXECUTING", "VALIDATING", "UAT", "COMPLETE"]
        );
    }

    #[test]
    fn control_template_does_not_pause_the_run() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = executing(&e, "- [P2] polish\n");
        let control = std::fs::read_to_string(paths::control_path(dir.path(), &id)).unwrap();
        assert!(control.contains("- PAUSE: stop after the current step"));
        e.remediate(&id, &[], &[]).unwrap();
        e.remediate_verify(&id, &pass()).unwrap();
        assert_eq!(e.finalize(&id, &pass()).unwrap().phase, Phase::Complete);
    }

    #[test]
    fn standalone_pause_holds_until_resume() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = executing(&e, "- [P2] polish\n");
        io::append_text(&paths::control_path(dir.path(), &id), "PAUSE\n").unwrap();

        let err = e.remediate(&id, &[], &[]).unwrap_err();
        assert!(err.to_string().contains("paused"), "{err}");
        assert!(control::pending(dir.path(), &id).unwrap().is_none());

        let Resume::Resumed { cleared_hold, .. } = e.resume(&id).unwrap() else {
            panic!("expected resumed")
        };
        assert!(cleared_hold.is_some());
        e.remediate(&id, &[], &[]).unwrap();
    }

    #[test]
    fn resume_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = executing(&e, "- [P2] polish\n");
        e.abort(&id, "operator stop").unwrap();
        e.resume(&id).unwrap();
        let state = e.store().load(&id).unwrap();
        let next = e.store().next_seq(&id).unwrap();

        let Resume::Resumed {
            restored,
            cleared_hold,
            ..
        } = e.resume(&id).unwrap()
        else {
            panic!("expected resumed")
        };
        assert!(!restored);
        assert!(cleared_hold.is_none());
        assert_eq!(e.store().load(&id).unwrap(), state);
        assert_eq!(e.store().next_seq(&id).unwrap(), next);
    }

    #[test]
    fn resume_skips_truncated_checkpoint() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = e.create("add dark mode", Mode::Coding, GateMode::Auto, None).unwrap().id;
        e.discover(&id).unwrap();
        let latest = e.store().next_seq(&id).unwrap() - 1;
        let path = paths::checkpoint_path(dir.path(), &id, latest);
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, &text[..text.len() / 2]).unwrap();

        let Resume::Resumed {
            state,
            checkpoint,
            restored,
            skipped_corrupt,
            ..
        } = e.resume(&id).unwrap()
        else {
            panic!("expected resumed")
        };
        assert!(restored);
        assert_eq!(checkpoint, latest - 1);
        assert_eq!(skipped_corrupt, vec![latest]);
        assert_eq!(state.phase, Phase::Init);
        assert_eq!(e.store().load(&id).unwrap().phase, Phase::Init);
    }

    #[test]
    fn completed_project_resumes_without_mutation() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = executing(&e, "- [P2] polish\n");
        e.remediate(&id, &[], &[]).unwrap();
        e.remediate_verify(&id, &pass()).unwrap();
        e.finalize(&id, &pass()).unwrap();
        let next = e.store().next_seq(&id).unwrap();
        assert!(matches!(e.resume(&id).unwrap(), Resume::AlreadyComplete { .. }));
        assert_eq!(e.store().next_seq(&id).unwrap(), next);
    }

    fn truncate_state(dir: &TempDir, id: &str) {
        let path = paths::state_path(dir.path(), id);
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, &text[..text.len() / 2]).unwrap();
    }

    #[test]
    fn status_recovers_from_truncated_state_file() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = e.create("add dark mode", Mode::Coding, GateMode::Auto, None).unwrap().id;
        e.discover(&id).unwrap();
        truncate_state(&dir, &id);

        let report = e.status(&id).unwrap();
        assert_eq!(report.state.phase, Phase::Discovering);
        assert_eq!(e.store().load(&id).unwrap().phase, Phase::Discovering);
        let log = std::fs::read_to_string(paths::decisions_log_path(dir.path(), &id)).unwrap();
        assert!(log.contains("\trecovered\t"));
    }

    #[test]
    fn heal_status_recovers_from_truncated_state_file() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = executing(&e, "- [P1] contrast\n");
        e.heal(&id, Some("npm test: 2 failing"), &SuppliedFix("a".into()), &fail("still failing"))
            .unwrap();
        truncate_state(&dir, &id);

        let status = e.heal_status(&id).unwrap();
        assert_eq!(status.phase, Phase::SelfHeal);
        assert_eq!(status.attempts, 1);
        assert_eq!(status.circuit_breaker.consecutive_failures, 1);
    }

    #[test]
    fn completed_project_with_corrupt_state_is_repaired_on_resume() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = executing(&e, "- [P2] polish\n");
        e.remediate(&id, &[], &[]).unwrap();
        e.remediate_verify(&id, &pass()).unwrap();
        e.finalize(&id, &pass()).unwrap();
        truncate_state(&dir, &id);

        assert!(matches!(e.resume(&id).unwrap(), Resume::AlreadyComplete { .. }));
        assert_eq!(e.store().load(&id).unwrap().phase, Phase::Complete);
    }

    #[test]
    fn synthesis_waits_for_every_agent() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = e.create("add dark mode", Mode::Coding, GateMode::Auto, None).unwrap().id;
        e.discover(&id).unwrap();
        let roster = e.select_agents(&id, None).unwrap().roster;
        let path = paths::agent_output_path(dir.path(), &id, &roster[0]);
        io::atomic_write(&path, b"- [P1] only one agent answered\n").unwrap();

        let err = e.synthesize(&id).unwrap_err();
        assert!(matches!(err, QralphError::Synthesis(_)));
        assert_eq!(e.store().load(&id).unwrap().phase, Phase::Reviewing);
    }

    #[test]
    fn human_gate_waits_for_approval() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = e.create("add dark mode", Mode::Coding, GateMode::Human, None).unwrap().id;
        e.discover(&id).unwrap();
        e.select_agents(&id, None).unwrap();
        write_outputs(&e, &id, "- [P2] polish\n");
        let report = e.synthesize(&id).unwrap();
        assert!(!report.advanced);
        assert_eq!(
            report.refused.unwrap().missing_precondition.as_deref(),
            Some("approve")
        );
        let approved = e.approve(&id).unwrap();
        assert!(approved.advanced);
        assert_eq!(approved.phase, Phase::Executing);

        e.remediate(&id, &[], &[]).unwrap();
        e.remediate_verify(&id, &pass()).unwrap();
        let finalized = e.finalize(&id, &pass()).unwrap();
        assert!(finalized.awaiting_approval);
        assert_eq!(e.approve(&id).unwrap().phase, Phase::Complete);
    }

    #[test]
    fn open_p0_sends_validation_back() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = executing(&e, "- [P0] dark theme breaks login page\n");
        e.remediate(&id, &[], &[]).unwrap();
        e.remediate_verify(&id, &pass()).unwrap();
        let report = e.finalize(&id, &pass()).unwrap();
        assert_eq!(report.validation, ValidationOutcome::Regressions);
        assert_eq!(report.open_p0, vec!["F1".to_string()]);
        assert_eq!(report.phase, Phase::Executing);

        e.remediate(&id, &["F1".to_string()], &[]).unwrap();
        e.remediate_verify(&id, &pass()).unwrap();
        assert_eq!(e.finalize(&id, &pass()).unwrap().phase, Phase::Complete);
    }

    #[test]
    fn deferring_a_finding_writes_deferred_md() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = executing(&e, "- [P0] rewrite theming engine\n");
        let report = e.remediate(&id, &[], &["F1".to_string()]).unwrap();
        assert!(report.plan.is_empty());
        let md = std::fs::read_to_string(paths::deferred_path(dir.path(), &id)).unwrap();
        assert!(md.contains("F1 [P0] rewrite theming engine"));
        assert!(matches!(
            e.remediate(&id, &["F9".to_string()], &[]),
            Err(QralphError::FindingNotFound(_))
        ));
    }

    #[test]
    fn failed_verification_heals_back_to_executing() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = executing(&e, "- [P1] contrast\n");
        e.remediate(&id, &[], &[]).unwrap();
        let failed = e
            .remediate_verify(&id, &fail("error: cannot find module 'theme' in /src/app.ts:12:4"))
            .unwrap();
        assert_eq!(failed.result, "failed");
        assert_eq!(failed.phase, Phase::SelfHeal);
        assert!(e.store().load(&id).unwrap().last_failure.is_some());

        let healed = e
            .heal(&id, None, &SuppliedFix("add theme module export".into()), &pass())
            .unwrap();
        assert!(matches!(healed.outcome, HealOutcome::Healed { .. }));
        assert_eq!(healed.phase, Phase::Executing);
        assert!(e.store().load(&id).unwrap().last_failure.is_none());
    }

    #[test]
    fn exhausted_budget_blocks_with_deferred_record() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.healing.attempt_budget = 2;
        config.healing.rollback_threshold = 10;
        let e = PhaseEngine::new(dir.path(), config);
        let id = executing(&e, "- [P1] contrast\n");
        let error = "build failed: linker error";

        let first = e
            .heal(&id, Some(error), &SuppliedFix("fix one".into()), &fail("still broken"))
            .unwrap();
        assert!(matches!(first.outcome, HealOutcome::Retry { .. }));
        let second = e
            .heal(&id, None, &SuppliedFix("fix two".into()), &fail("still broken"))
            .unwrap();
        assert!(matches!(second.outcome, HealOutcome::Deferred { .. }));
        assert_eq!(second.phase, Phase::Blocked);
        assert_eq!(second.deferred_id.as_deref(), Some("D1"));
        let md = std::fs::read_to_string(paths::deferred_path(dir.path(), &id)).unwrap();
        assert!(md.contains("linker error"));
    }

    #[test]
    fn skip_defers_the_failure_and_continues() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = executing(&e, "- [P1] contrast\n");
        e.remediate(&id, &[], &[]).unwrap();
        e.remediate_verify(&id, &fail("flaky snapshot")).unwrap();
        io::append_text(&paths::control_path(dir.path(), &id), "SKIP\n").unwrap();

        let report = e.control(&id).unwrap().unwrap();
        assert_eq!(report.command, ControlCommand::Skip);
        assert_eq!(report.phase, Phase::Executing);
        let state = e.store().load(&id).unwrap();
        assert!(state.last_failure.is_none());
        assert_eq!(state.deferred.len(), 1);
    }

    #[test]
    fn escalate_outside_healing_pauses() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = executing(&e, "- [P1] contrast\n");
        io::append_text(&paths::control_path(dir.path(), &id), "ESCALATE\n").unwrap();
        let report = e.control(&id).unwrap().unwrap();
        assert!(report.action.contains("paused"));
        let state = e.store().load(&id).unwrap();
        assert_eq!(state.hold.unwrap().kind, HoldKind::Paused);
        assert_eq!(state.deferred.len(), 1);
    }

    #[test]
    fn tripped_breaker_refuses_advances() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.breaker.max_tokens = 100;
        let e = PhaseEngine::new(dir.path(), config);
        let id = e.create("add dark mode", Mode::Coding, GateMode::Auto, None).unwrap().id;
        let usage = e.record_usage(&id, 500, 0.1).unwrap();
        assert!(usage.breaker_open.is_some());
        let err = e.discover(&id).unwrap_err();
        assert!(err.to_string().contains("circuit breaker open"), "{err}");

        e.heal_clear(&id).unwrap();
        e.discover(&id).unwrap();
    }

    #[test]
    fn aborted_project_refuses_then_resumes() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = e.create("add dark mode", Mode::Coding, GateMode::Auto, None).unwrap().id;
        let state = e.abort(&id, "wrong request").unwrap();
        assert!(state.is_aborted());
        let last = e.store().latest_valid(&id).unwrap().unwrap();
        assert!(last.state.is_aborted());
        assert!(e.discover(&id).is_err());
        e.resume(&id).unwrap();
        e.discover(&id).unwrap();
    }

    #[test]
    fn work_mode_uses_its_own_phases() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = e
            .create("write the quarterly report for the board", Mode::Work, GateMode::Auto, None)
            .unwrap()
            .id;
        e.discover(&id).unwrap();
        assert_eq!(e.store().load(&id).unwrap().phase, Phase::Planning);
        let selection = e.select_agents(&id, None).unwrap();
        assert_eq!(selection.phase, Phase::UserReview);
        assert!((1..=3).contains(&selection.roster.len()));
    }

    #[test]
    fn explicit_roster_is_validated() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = e.create("add dark mode", Mode::Coding, GateMode::Auto, None).unwrap().id;
        e.discover(&id).unwrap();
        let err = e
            .select_agents(&id, Some(&["no-such-agent".to_string()][..]))
            .unwrap_err();
        assert!(matches!(err, QralphError::InvalidValue(_)));
        let too_few = e.select_agents(&id, Some(&["frontend-engineer".to_string()][..]));
        assert!(matches!(too_few, Err(QralphError::Phase(_))));
        assert_eq!(e.store().load(&id).unwrap().phase, Phase::Discovering);
    }

    #[test]
    fn dispatch_results_update_the_task_board() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = e.create("add dark mode", Mode::Coding, GateMode::Auto, None).unwrap().id;
        e.discover(&id).unwrap();
        e.select_agents(&id, None).unwrap();
        let jobs = e.dispatch_jobs(&id).unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs[0].prompt_path.exists());

        let mut results = BTreeMap::new();
        for (i, job) in jobs.iter().enumerate() {
            results.insert(
                job.agent.clone(),
                DispatchResult {
                    agent: job.agent.clone(),
                    ok: i > 0,
                    exit_code: Some(if i > 0 { 0 } else { 1 }),
                    timed_out: false,
                    output_bytes: 10,
                    error: (i == 0).then(|| "agent exited with failure".to_string()),
                },
            );
        }
        let report = e.record_dispatch(&id, results).unwrap();
        assert_eq!((report.completed, report.blocked), (2, 1));
        assert_eq!(e.dispatch_jobs(&id).unwrap().len(), 1);
    }

    #[test]
    fn status_suggests_next_step() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let id = e.create("add dark mode", Mode::Coding, GateMode::Auto, None).unwrap().id;
        let status = e.status(&id).unwrap();
        assert_eq!(status.next.as_deref(), Some("discover"));
        assert_eq!(status.checkpoints, 1);
        assert!(status.pending_control.is_none());
    }
}
