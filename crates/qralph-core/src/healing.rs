use crate::config::Config;
use crate::error::{CorruptionError, QralphError, RecoveryError, Result};
use crate::io;
use crate::lock::{ExclusiveLock, LockScope};
use crate::memory::MemoryStore;
use crate::paths;
use crate::state::{CircuitBreaker, DeferredItem, Failure, ProjectState};
use crate::store::StateStore;
use crate::types::{Outcome, Phase, Tier};
use crate::verify::Verifier;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Normalization and signatures
// ---------------------------------------------------------------------------

static TIMESTAMP_RE: OnceLock<Regex> = OnceLock::new();
static HEX_RE: OnceLock<Regex> = OnceLock::new();
static PATH_RE: OnceLock<Regex> = OnceLock::new();
static LINE_WORD_RE: OnceLock<Regex> = OnceLock::new();
static LINE_COL_RE: OnceLock<Regex> = OnceLock::new();
static SPACE_RE: OnceLock<Regex> = OnceLock::new();

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap())
}

/// Strip everything that varies between occurrences of the same failure:
/// timestamps, hex addresses, file paths, line and column numbers, and
/// whitespace runs. Lowercased.
pub fn normalize_error(error: &str) -> String {
    let s = re(
        &TIMESTAMP_RE,
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
    )
    .replace_all(error, "<ts>");
    let s = re(&HEX_RE, r"0[xX][0-9a-fA-F]+").replace_all(&s, "<addr>");
    let s = re(&PATH_RE, r"(?:[A-Za-z]:)?(?:[\w.~-]*[/\\])+[\w.-]+").replace_all(&s, "<path>");
    let s = re(&LINE_WORD_RE, r"(?i)\b(line|col|column)\s+\d+").replace_all(&s, "$1 <n>");
    let s = re(&LINE_COL_RE, r":\d+(?::\d+)?\b").replace_all(&s, ":<n>");
    let s = re(&SPACE_RE, r"\s+").replace_all(&s, " ");
    s.trim().to_lowercase()
}

/// First 16 hex characters of the SHA-256 of the normalized error.
pub fn signature(normalized: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(normalized.as_bytes()));
    digest[..16].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Dependency,
    Permission,
    Network,
    Type,
    Lint,
    Test,
    Build,
    Runtime,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Dependency => "dependency",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Network => "network",
            ErrorCategory::Type => "type",
            ErrorCategory::Lint => "lint",
            ErrorCategory::Test => "test",
            ErrorCategory::Build => "build",
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First matching category wins.
const CATEGORY_KEYWORDS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Dependency,
        &["cannot find module", "module not found", "modulenotfounderror", "unresolved import",
          "no matching version", "could not resolve", "package not found", "failed to fetch"],
    ),
    (
        ErrorCategory::Permission,
        &["permission denied", "eacces", "eperm", "forbidden", "not permitted"],
    ),
    (
        ErrorCategory::Network,
        &["connection refused", "econnreset", "timed out", "timeout", "dns", "network unreachable"],
    ),
    (
        ErrorCategory::Type,
        &["typeerror", "type error", "mismatched types", "is not assignable", "expected type"],
    ),
    (ErrorCategory::Lint, &["lint", "clippy", "eslint", "prettier", "formatting"]),
    (
        ErrorCategory::Test,
        &["test failed", "tests failed", "assertion", "assert", "snapshot", "expected"],
    ),
    (
        ErrorCategory::Build,
        &["compile", "compilation", "build failed", "linker", "syntax error", "error["],
    ),
    (
        ErrorCategory::Runtime,
        &["panic", "segmentation fault", "null pointer", "exception", "traceback", "undefined is not"],
    ),
];

pub fn categorize(normalized: &str) -> ErrorCategory {
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| normalized.contains(w)))
        .map(|(c, _)| *c)
        .unwrap_or(ErrorCategory::Unknown)
}

// ---------------------------------------------------------------------------
// HealingAttempt ledger (per project, append-only)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingAttempt {
    pub id: String,
    pub project: String,
    pub signature: String,
    pub attempt: u32,
    pub tier: Tier,
    pub fix: String,
    pub outcome: Outcome,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Written to the ledger by a rollback. Attempts before the newest marker
/// no longer count against the budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerReset {
    pub reset_at: DateTime<Utc>,
    pub restored_seq: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum LedgerLine {
    Attempt(HealingAttempt),
    Reset(LedgerReset),
}

fn read_ledger(root: &Path, project: &str) -> Result<Vec<LedgerLine>> {
    io::read_jsonl(&paths::attempts_log_path(root, project))
}

/// Every attempt ever made in the project, across rollbacks.
pub fn read_attempts(root: &Path, project: &str) -> Result<Vec<HealingAttempt>> {
    Ok(read_ledger(root, project)?
        .into_iter()
        .filter_map(|line| match line {
            LedgerLine::Attempt(a) => Some(a),
            LedgerLine::Reset(_) => None,
        })
        .collect())
}

/// Attempts made since the last rollback.
pub fn current_attempts(root: &Path, project: &str) -> Result<Vec<HealingAttempt>> {
    let mut current = Vec::new();
    for line in read_ledger(root, project)? {
        match line {
            LedgerLine::Attempt(a) => current.push(a),
            LedgerLine::Reset(_) => current.clear(),
        }
    }
    Ok(current)
}

fn append_reset(root: &Path, project: &str, reset: LedgerReset) -> Result<()> {
    io::append_jsonl(&paths::attempts_log_path(root, project), &LedgerLine::Reset(reset))
}

fn append_attempt(root: &Path, attempt: &HealingAttempt) -> Result<()> {
    io::append_jsonl(&paths::attempts_log_path(root, &attempt.project), attempt)
}

// ---------------------------------------------------------------------------
// HealingPattern store (shared across projects)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixRecord {
    pub fix: String,
    pub tier: Tier,
    pub outcome: Outcome,
    pub project: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingPattern {
    pub signature: String,
    pub normalized_error: String,
    pub category: ErrorCategory,
    #[serde(default)]
    pub fixes_attempted: Vec<FixRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_fix: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl HealingPattern {
    pub fn failed_fixes(&self) -> BTreeSet<String> {
        self.fixes_attempted
            .iter()
            .filter(|f| f.outcome == Outcome::Failure)
            .map(|f| f.fix.clone())
            .collect()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PatternFile {
    #[serde(default)]
    patterns: BTreeMap<String, HealingPattern>,
}

pub struct PatternStore {
    root: PathBuf,
    lock_timeout: std::time::Duration,
}

impl PatternStore {
    pub fn new(root: &Path, lock_timeout: std::time::Duration) -> Self {
        Self {
            root: root.to_path_buf(),
            lock_timeout,
        }
    }

    fn read(&self) -> Result<PatternFile> {
        let path = paths::healing_patterns_path(&self.root);
        if !path.exists() {
            return Ok(PatternFile::default());
        }
        let data = std::fs::read_to_string(&path)?;
        serde_json::from_str(&data).map_err(|e| {
            CorruptionError {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub fn all(&self) -> Result<BTreeMap<String, HealingPattern>> {
        Ok(self.read()?.patterns)
    }

    pub fn get(&self, signature: &str) -> Result<Option<HealingPattern>> {
        Ok(self.read()?.patterns.remove(signature))
    }

    /// Add one attempted fix to the pattern for `analysis.signature`.
    fn record(&self, analysis: &Analysis, attempt: &HealingAttempt) -> Result<HealingPattern> {
        let lock = ExclusiveLock::acquire(&self.root, LockScope::Registry, self.lock_timeout)?;
        lock.ensure_registry()?;
        let mut file = self.read()?;
        let pattern = file
            .patterns
            .entry(analysis.signature.clone())
            .or_insert_with(|| HealingPattern {
                signature: analysis.signature.clone(),
                normalized_error: analysis.normalized.clone(),
                category: analysis.category,
                fixes_attempted: Vec::new(),
                successful_fix: None,
                first_seen: attempt.at,
                last_seen: attempt.at,
            });
        pattern.fixes_attempted.push(FixRecord {
            fix: attempt.fix.clone(),
            tier: attempt.tier,
            outcome: attempt.outcome,
            project: attempt.project.clone(),
            at: attempt.at,
        });
        pattern.last_seen = attempt.at;
        if attempt.outcome == Outcome::Success {
            pattern.successful_fix = Some(attempt.fix.clone());
        }
        let pattern = pattern.clone();
        let data = serde_json::to_string_pretty(&file)?;
        io::atomic_write(&paths::healing_patterns_path(&self.root), data.as_bytes())?;
        Ok(pattern)
    }
}

// ---------------------------------------------------------------------------
// Fix generation
// ---------------------------------------------------------------------------

/// Everything a fix generator may use to propose the next candidate.
#[derive(Debug, Clone, Serialize)]
pub struct FixRequest {
    pub project: String,
    pub error: String,
    pub normalized: String,
    pub signature: String,
    pub category: ErrorCategory,
    pub attempt: u32,
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Fixes already recorded as failed for this signature. Never proposed.
    pub excluded: Vec<String>,
    pub prior_resolutions: Vec<String>,
}

pub trait FixGenerator {
    fn propose(&self, request: &FixRequest) -> Option<String>;
}

/// A fix chosen by the orchestrator.
pub struct SuppliedFix(pub String);

impl FixGenerator for SuppliedFix {
    fn propose(&self, _request: &FixRequest) -> Option<String> {
        let fix = self.0.trim();
        (!fix.is_empty()).then(|| fix.to_string())
    }
}

/// Deterministic strategies per error category, tried in order.
pub struct PlaybookFixGenerator;

impl PlaybookFixGenerator {
    fn strategies(category: ErrorCategory) -> &'static [&'static str] {
        match category {
            ErrorCategory::Dependency => &[
                "reinstall dependencies from the lockfile",
                "add the missing dependency at the version used by the last green checkpoint",
                "regenerate the lockfile and reinstall",
            ],
            ErrorCategory::Permission => &[
                "restore file permissions on the project tree",
                "run the failing step without elevated paths (use a project-local cache directory)",
            ],
            ErrorCategory::Network => &[
                "retry the failing step once the network is reachable",
                "use the offline cache for dependency resolution",
            ],
            ErrorCategory::Type => &[
                "align the type annotations at the reported call site",
                "revert the signature change that introduced the type mismatch",
            ],
            ErrorCategory::Lint => &[
                "run the formatter and linter autofix",
                "address the reported lint findings by hand",
            ],
            ErrorCategory::Test => &[
                "re-run the failing test in isolation to rule out flakiness",
                "update the assertion to the intended behavior",
                "revert the change under test to the last passing version",
            ],
            ErrorCategory::Build => &[
                "clean build artifacts and rebuild",
                "fix the reported compile error at its first occurrence",
                "pin the toolchain to the version used by the last green checkpoint",
            ],
            ErrorCategory::Runtime => &[
                "add a guard for the failing value at the crash site",
                "revert the most recent change on the failing path",
            ],
            ErrorCategory::Unknown => &[],
        }
    }

    const GENERIC: &'static [&'static str] = &[
        "re-run the failing step to confirm the failure is reproducible",
        "revert the last change and re-apply it in smaller steps",
    ];
}

impl FixGenerator for PlaybookFixGenerator {
    fn propose(&self, request: &FixRequest) -> Option<String> {
        Self::strategies(request.category)
            .iter()
            .chain(Self::GENERIC.iter())
            .find(|s| !request.excluded.iter().any(|e| e == *s))
            .map(|s| s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Analysis and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub signature: String,
    pub normalized: String,
    pub category: ErrorCategory,
    /// Attempts already made for this signature since the last rollback.
    pub attempts_so_far: u32,
    pub next_attempt: u32,
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_fix: Option<String>,
    pub excluded_fixes: Vec<String>,
    pub budget_remaining: u32,
    pub tried_before: bool,
    pub prior_resolutions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HealOutcome {
    /// The fix verified.
    Healed { attempt: HealingAttempt },
    /// The fix failed but budget and rollback threshold remain.
    Retry {
        attempt: HealingAttempt,
        consecutive_failures: u32,
        next_tier: Tier,
    },
    /// Budget exhausted, breaker open or no untried fix left. Needs a human.
    Deferred {
        signature: String,
        attempts: u32,
        reason: String,
    },
    /// Too many consecutive failures; the project was restored to its last
    /// healthy EXECUTING checkpoint.
    RolledBack {
        attempt: HealingAttempt,
        restored_seq: u64,
        forensic_path: PathBuf,
    },
    /// The proposed fix already failed for this signature. Nothing changed.
    Rejected { fix: String, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub restored_seq: u64,
    pub new_seq: u64,
    pub forensic_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealStatus {
    pub project: String,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<Failure>,
    pub circuit_breaker: CircuitBreaker,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker_open: Option<String>,
    pub attempts: usize,
    pub successes: usize,
    pub deferred: Vec<DeferredItem>,
}

// ---------------------------------------------------------------------------
// SelfHealer
// ---------------------------------------------------------------------------

pub struct SelfHealer<'a> {
    root: PathBuf,
    config: &'a Config,
    store: &'a StateStore,
    patterns: PatternStore,
    memory: MemoryStore,
}

impl<'a> SelfHealer<'a> {
    pub fn new(root: &Path, config: &'a Config, store: &'a StateStore) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            store,
            patterns: PatternStore::new(root, config.lock_timeout()),
            memory: MemoryStore::new(root, config.memory.clone(), config.lock_timeout()),
        }
    }

    pub fn patterns(&self) -> &PatternStore {
        &self.patterns
    }

    /// Read-only: what would the next attempt for `error` look like.
    pub fn analyze(&self, state: &ProjectState, error: &str) -> Result<Analysis> {
        let normalized = normalize_error(error);
        let signature = signature(&normalized);
        let category = categorize(&normalized);

        let ledger: Vec<HealingAttempt> = read_attempts(&self.root, &state.id)?
            .into_iter()
            .filter(|a| a.signature == signature)
            .collect();
        let attempts_so_far = current_attempts(&self.root, &state.id)?
            .iter()
            .filter(|a| a.signature == signature)
            .count() as u32;

        let pattern = self.patterns.get(&signature)?;
        let mut excluded: BTreeSet<String> = pattern
            .as_ref()
            .map(HealingPattern::failed_fixes)
            .unwrap_or_default();
        excluded.extend(
            ledger
                .iter()
                .filter(|a| a.outcome == Outcome::Failure)
                .map(|a| a.fix.clone()),
        );
        let known_fix = pattern
            .and_then(|p| p.successful_fix)
            .filter(|f| !excluded.contains(f));

        let next_attempt = attempts_so_far + 1;
        let tier = if known_fix.is_some() && next_attempt <= self.config.healing.attempt_budget {
            Tier::Fast
        } else {
            Tier::for_attempt(next_attempt)
        };

        let prior = match self.memory.check(&normalized, Some(category.as_str())) {
            Ok(check) => check,
            Err(e) => {
                tracing::warn!("memory store unavailable: {e}");
                crate::memory::MemoryCheck {
                    tried_before: false,
                    prior_results: Vec::new(),
                }
            }
        };

        Ok(Analysis {
            signature,
            normalized,
            category,
            attempts_so_far,
            next_attempt,
            tier,
            model: self
                .config
                .healing
                .tier_models
                .model_for(tier)
                .map(str::to_string),
            known_fix,
            excluded_fixes: excluded.into_iter().collect(),
            budget_remaining: self
                .config
                .healing
                .attempt_budget
                .saturating_sub(attempts_so_far),
            tried_before: prior.tried_before,
            prior_resolutions: prior
                .prior_results
                .into_iter()
                .map(|h| h.entry.description)
                .collect(),
        })
    }

    /// Make one healing attempt. Mutates the breaker counters in `state`;
    /// on rollback `state` is replaced by the restored checkpoint. The
    /// caller persists every outcome except `RolledBack`, which is already
    /// persisted.
    pub fn attempt(
        &self,
        lock: &ExclusiveLock,
        state: &mut ProjectState,
        error: &str,
        generator: &dyn FixGenerator,
        verifier: &dyn Verifier,
    ) -> Result<HealOutcome> {
        lock.ensure_project(&state.id)?;
        let analysis = self.analyze(state, error)?;
        let budget = self.config.healing.attempt_budget;

        if let Some(reason) = state.circuit_breaker.trip_reason(&self.config.breaker) {
            return Ok(HealOutcome::Deferred {
                signature: analysis.signature,
                attempts: analysis.attempts_so_far,
                reason: format!("circuit breaker open: {reason}"),
            });
        }
        if analysis.next_attempt > budget || analysis.tier == Tier::Human {
            return Ok(HealOutcome::Deferred {
                signature: analysis.signature,
                attempts: analysis.attempts_so_far,
                reason: format!("healing budget of {budget} attempts exhausted"),
            });
        }

        let request = FixRequest {
            project: state.id.clone(),
            error: error.to_string(),
            normalized: analysis.normalized.clone(),
            signature: analysis.signature.clone(),
            category: analysis.category,
            attempt: analysis.next_attempt,
            tier: analysis.tier,
            model: analysis.model.clone(),
            excluded: analysis.excluded_fixes.clone(),
            prior_resolutions: analysis.prior_resolutions.clone(),
        };
        let fix = match &analysis.known_fix {
            Some(known) => known.clone(),
            None => match generator.propose(&request) {
                Some(fix) if !fix.trim().is_empty() => fix.trim().to_string(),
                _ => {
                    return Ok(HealOutcome::Deferred {
                        signature: analysis.signature,
                        attempts: analysis.attempts_so_far,
                        reason: "no untried fix remains".to_string(),
                    })
                }
            },
        };
        if analysis.excluded_fixes.contains(&fix) {
            tracing::info!(signature = %analysis.signature, "rejected previously failed fix");
            return Ok(HealOutcome::Rejected {
                fix,
                reason: format!(
                    "this fix already failed for signature {}",
                    analysis.signature
                ),
            });
        }

        let (outcome, detail) = match verifier.verify(&state.id, Some(&fix)) {
            Ok(report) if report.passed => (Outcome::Success, report.summary()),
            Ok(report) => (Outcome::Failure, report.summary()),
            Err(e) => (Outcome::Failure, format!("verification error: {e}")),
        };
        let attempt = HealingAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            project: state.id.clone(),
            signature: analysis.signature.clone(),
            attempt: analysis.next_attempt,
            tier: analysis.tier,
            fix: fix.clone(),
            outcome,
            detail,
            at: Utc::now(),
        };
        append_attempt(&self.root, &attempt)?;
        self.patterns.record(&analysis, &attempt)?;
        tracing::info!(
            signature = %attempt.signature,
            attempt = attempt.attempt,
            tier = %attempt.tier,
            outcome = %attempt.outcome,
            "healing attempt recorded"
        );

        if outcome == Outcome::Success {
            state.circuit_breaker.consecutive_failures = 0;
            self.remember(state, &analysis, &fix);
            return Ok(HealOutcome::Healed { attempt });
        }

        state.circuit_breaker.consecutive_failures += 1;
        state.circuit_breaker.record_error(&analysis.signature);
        let consecutive = state.circuit_breaker.consecutive_failures;

        if consecutive >= self.config.healing.rollback_threshold {
            let reason = format!("{consecutive} consecutive healing failures");
            match self.rollback(lock, state, &reason) {
                Ok(report) => {
                    return Ok(HealOutcome::RolledBack {
                        attempt,
                        restored_seq: report.restored_seq,
                        forensic_path: report.forensic_path,
                    })
                }
                Err(QralphError::Recovery(RecoveryError::NoValidCheckpoint(_)))
                    if attempt.attempt >= budget =>
                {
                    let reason = format!(
                        "healing budget exhausted and no healthy checkpoint to roll back to ({reason})"
                    );
                    state.touch();
                    self.store.save(lock, state, &reason)?;
                    return Err(RecoveryError::Fatal {
                        project: state.id.clone(),
                        reason,
                    }
                    .into());
                }
                Err(QralphError::Recovery(RecoveryError::NoValidCheckpoint(_))) => {
                    tracing::warn!(project = %state.id, "rollback threshold reached but no healthy checkpoint exists");
                }
                Err(e) => return Err(e),
            }
        }

        if attempt.attempt >= budget {
            return Ok(HealOutcome::Deferred {
                signature: analysis.signature,
                attempts: attempt.attempt,
                reason: format!("healing budget of {budget} attempts exhausted"),
            });
        }
        Ok(HealOutcome::Retry {
            next_tier: Tier::for_attempt(attempt.attempt + 1),
            consecutive_failures: consecutive,
            attempt,
        })
    }

    fn remember(&self, state: &ProjectState, analysis: &Analysis, fix: &str) {
        let description = format!("{} => {}", analysis.normalized, fix);
        if let Err(e) = self.memory.store(
            &description,
            analysis.category.as_str(),
            "healing",
            Some(&state.id),
        ) {
            tracing::warn!("could not store resolution in memory: {e}");
        }
    }

    /// Write the current state to forensics and restore the newest valid
    /// checkpoint taken in EXECUTING with no consecutive failures.
    pub fn rollback(
        &self,
        lock: &ExclusiveLock,
        state: &mut ProjectState,
        reason: &str,
    ) -> Result<RollbackReport> {
        lock.ensure_project(&state.id)?;
        let target = self
            .store
            .latest_valid_where(&state.id, |cp| {
                cp.state.phase == Phase::Executing
                    && cp.state.circuit_breaker.consecutive_failures == 0
            })?
            .ok_or_else(|| RecoveryError::NoValidCheckpoint(state.id.clone()))?;

        let forensic_path = self.store.write_forensic(lock, state, reason)?;
        let new_seq = self
            .store
            .restore(lock, &target, &format!("rollback to {}: {reason}", target.seq))?;
        append_reset(
            &self.root,
            &state.id,
            LedgerReset {
                reset_at: Utc::now(),
                restored_seq: target.seq,
                reason: reason.to_string(),
            },
        )?;
        tracing::warn!(project = %state.id, restored = target.seq, "rolled back");
        *state = target.state.clone();
        Ok(RollbackReport {
            restored_seq: target.seq,
            new_seq,
            forensic_path,
        })
    }

    pub fn history(&self, project: &str, signature: Option<&str>) -> Result<Vec<HealingAttempt>> {
        Ok(read_attempts(&self.root, project)?
            .into_iter()
            .filter(|a| signature.map_or(true, |s| a.signature == s))
            .collect())
    }

    /// Reset the breaker. The attempt ledger and shared patterns are kept.
    pub fn clear(&self, state: &mut ProjectState) {
        state.circuit_breaker = CircuitBreaker::default();
    }

    pub fn status(&self, state: &ProjectState) -> Result<HealStatus> {
        let attempts = read_attempts(&self.root, &state.id)?;
        Ok(HealStatus {
            project: state.id.clone(),
            phase: state.phase,
            last_failure: state.last_failure.clone(),
            circuit_breaker: state.circuit_breaker.clone(),
            breaker_open: state.circuit_breaker.trip_reason(&self.config.breaker),
            attempts: attempts.len(),
            successes: attempts
                .iter()
                .filter(|a| a.outcome == Outcome::Success)
                .count(),
            deferred: state.deferred.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
