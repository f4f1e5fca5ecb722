use crate::discovery::Capability;
use crate::error::Result;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// HealingConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    /// Attempts per error signature before the failure is deferred to a human.
    #[serde(default = "default_attempt_budget")]
    pub attempt_budget: u32,
    /// Consecutive failed attempts (any signature) that trigger rollback.
    #[serde(default = "default_rollback_threshold")]
    pub rollback_threshold: u32,
    #[serde(default)]
    pub tier_models: TierModels,
}

fn default_attempt_budget() -> u32 {
    5
}

fn default_rollback_threshold() -> u32 {
    3
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            attempt_budget: default_attempt_budget(),
            rollback_threshold: default_rollback_threshold(),
            tier_models: TierModels::default(),
        }
    }
}

/// Model names reported alongside each tier, for the orchestrator's benefit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierModels {
    #[serde(default = "default_fast_model")]
    pub fast: String,
    #[serde(default = "default_standard_model")]
    pub standard: String,
    #[serde(default = "default_deep_model")]
    pub deep: String,
}

fn default_fast_model() -> String {
    "haiku".to_string()
}

fn default_standard_model() -> String {
    "sonnet".to_string()
}

fn default_deep_model() -> String {
    "opus".to_string()
}

impl Default for TierModels {
    fn default() -> Self {
        Self {
            fast: default_fast_model(),
            standard: default_standard_model(),
            deep: default_deep_model(),
        }
    }
}

impl TierModels {
    pub fn model_for(&self, tier: crate::types::Tier) -> Option<&str> {
        use crate::types::Tier;
        match tier {
            Tier::Fast => Some(&self.fast),
            Tier::Standard => Some(&self.standard),
            Tier::Deep => Some(&self.deep),
            Tier::Human => None,
        }
    }
}

// ---------------------------------------------------------------------------
// DiscoveryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f64,
    #[serde(default = "default_category_cap")]
    pub category_cap: usize,
    /// Requests longer than this many words get one extra agent.
    #[serde(default = "default_long_request_words")]
    pub long_request_words: usize,
}

fn default_relevance_threshold() -> f64 {
    0.1
}

fn default_category_cap() -> usize {
    2
}

fn default_long_request_words() -> usize {
    30
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            relevance_threshold: default_relevance_threshold(),
            category_cap: default_category_cap(),
            long_request_words: default_long_request_words(),
        }
    }
}

// ---------------------------------------------------------------------------
// BreakerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_max_cost")]
    pub max_cost_usd: f64,
    /// Occurrences of one error signature before the breaker trips.
    #[serde(default = "default_max_same_error")]
    pub max_same_error: u32,
}

fn default_max_tokens() -> u64 {
    2_000_000
}

fn default_max_cost() -> f64 {
    50.0
}

fn default_max_same_error() -> u32 {
    10
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            max_cost_usd: default_max_cost(),
            max_same_error: default_max_same_error(),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_half_life")]
    pub half_life_days: f64,
    #[serde(default = "default_domain_boost")]
    pub domain_boost: f64,
}

fn default_half_life() -> f64 {
    30.0
}

fn default_domain_boost() -> f64 {
    1.5
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            half_life_days: default_half_life(),
            domain_boost: default_domain_boost(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessConfig
// ---------------------------------------------------------------------------

/// Grace periods (seconds) after which an inactive run's processes are reclaimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(default = "default_agent_grace")]
    pub agent_grace_secs: u64,
    #[serde(default = "default_verify_grace")]
    pub verify_grace_secs: u64,
    #[serde(default = "default_server_grace")]
    pub server_grace_secs: u64,
    #[serde(default = "default_other_grace")]
    pub other_grace_secs: u64,
}

fn default_agent_grace() -> u64 {
    1800
}

fn default_verify_grace() -> u64 {
    900
}

fn default_server_grace() -> u64 {
    300
}

fn default_other_grace() -> u64 {
    600
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            agent_grace_secs: default_agent_grace(),
            verify_grace_secs: default_verify_grace(),
            server_grace_secs: default_server_grace(),
            other_grace_secs: default_other_grace(),
        }
    }
}

// ---------------------------------------------------------------------------
// VerifyConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Shell commands run by remediate-verify, finalize and heal attempts
    /// (e.g. "cargo test", "npm run lint").
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default = "default_verify_timeout")]
    pub timeout_secs: u64,
}

fn default_verify_timeout() -> u64 {
    600
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            timeout_secs: default_verify_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Shell template run once per agent by `dispatch`. Placeholders:
    /// `{agent}`, `{prompt}` (prompt file path), `{output}` (output file path).
    /// Stdout is captured as the agent's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<String>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

fn default_max_parallel() -> usize {
    3
}

fn default_agent_timeout() -> u64 {
    1800
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            runner: None,
            max_parallel: default_max_parallel(),
            timeout_secs: default_agent_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// LockConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_timeout")]
    pub timeout_ms: u64,
}

fn default_lock_timeout() -> u64 {
    5000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub healing: HealingConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub lock: LockConfig,
    /// Extra capabilities; an entry with a built-in id replaces the built-in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<Capability>,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            healing: HealingConfig::default(),
            discovery: DiscoveryConfig::default(),
            breaker: BreakerConfig::default(),
            memory: MemoryConfig::default(),
            process: ProcessConfig::default(),
            verify: VerifyConfig::default(),
            agents: AgentsConfig::default(),
            lock: LockConfig::default(),
            capabilities: Vec::new(),
        }
    }
}

impl Config {
    /// Load `.qralph/config.yaml`; a missing file means defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock.timeout_ms)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.healing.attempt_budget == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "healing.attempt_budget is 0: every failure is deferred immediately"
                    .to_string(),
            });
        }
        if self.healing.attempt_budget > 5 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "healing.attempt_budget={} exceeds the 5 automated tiers; attempts beyond 5 go to a human",
                    self.healing.attempt_budget
                ),
            });
        }
        if self.healing.rollback_threshold == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "healing.rollback_threshold must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.discovery.relevance_threshold) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "discovery.relevance_threshold={} is outside 0.0..=1.0",
                    self.discovery.relevance_threshold
                ),
            });
        }
        if self.discovery.category_cap == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "discovery.category_cap is 0: rosters are filled by backfill only"
                    .to_string(),
            });
        }
        if self.memory.half_life_days <= 0.0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "memory.half_life_days must be positive".to_string(),
            });
        }
        if self.agents.max_parallel == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "agents.max_parallel must be at least 1".to_string(),
            });
        }
        for command in &self.verify.commands {
            if command.trim().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: "verify.commands contains an empty command".to_string(),
                });
            }
        }

        let mut seen = HashSet::new();
        for cap in &self.capabilities {
            if !seen.insert(cap.id.as_str()) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("capability '{}' is defined more than once", cap.id),
                });
            }
            if cap.domains.is_empty() && cap.keywords.is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "capability '{}' has no domains or keywords and can only be picked by backfill",
                        cap.id
                    ),
                });
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.healing.attempt_budget, 5);
        assert_eq!(cfg.healing.rollback_threshold, 3);
        assert_eq!(cfg.discovery.category_cap, 2);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = paths::config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "healing:\n  rollback_threshold: 5\nverify:\n  commands: [\"true\"]\n",
        )
        .unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.healing.rollback_threshold, 5);
        assert_eq!(cfg.healing.attempt_budget, 5);
        assert_eq!(cfg.verify.commands, vec!["true".to_string()]);
        assert_eq!(cfg.verify.timeout_secs, 600);
    }

    #[test]
    fn default_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        Config::default().save(dir.path()).unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.memory.half_life_days, 30.0);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn validate_flags_bad_values() {
        let mut cfg = Config::default();
        cfg.healing.rollback_threshold = 0;
        cfg.agents.max_parallel = 0;
        cfg.verify.commands.push("   ".to_string());
        let warnings = cfg.validate();
        assert_eq!(
            warnings
                .iter()
                .filter(|w| w.level == WarnLevel::Error)
                .count(),
            2
        );
        assert!(warnings.iter().any(|w| w.message.contains("empty command")));
    }
}
