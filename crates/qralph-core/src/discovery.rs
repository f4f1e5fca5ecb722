use crate::config::DiscoveryConfig;
use crate::types::Mode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const DOMAIN_WEIGHT: f64 = 0.6;
const KEYWORD_WEIGHT: f64 = 0.25;
const DESCRIPTION_WEIGHT: f64 = 0.15;

// ---------------------------------------------------------------------------
// Domain vocabulary
// ---------------------------------------------------------------------------

/// Fixed request-classification vocabulary: domain and its trigger words.
pub const DOMAINS: &[(&str, &[&str])] = &[
    (
        "security",
        &["security", "auth", "authentication", "authorization", "login", "password", "token",
          "vulnerability", "xss", "csrf", "injection", "encrypt", "secret", "permission", "oauth"],
    ),
    (
        "frontend",
        &["frontend", "ui", "ux", "css", "html", "react", "vue", "component", "page", "button",
          "layout", "theme", "dark", "style", "responsive", "browser", "form"],
    ),
    (
        "backend",
        &["backend", "api", "endpoint", "server", "service", "rest", "grpc", "handler", "route",
          "webhook", "queue", "worker"],
    ),
    (
        "database",
        &["database", "db", "sql", "postgres", "mysql", "sqlite", "schema", "migration", "table",
          "index", "query", "orm"],
    ),
    (
        "testing",
        &["test", "testing", "coverage", "regression", "unit", "integration", "e2e", "flaky",
          "fixture", "qa"],
    ),
    (
        "devops",
        &["deploy", "deployment", "ci", "cd", "pipeline", "docker", "kubernetes", "k8s",
          "infrastructure", "terraform", "release", "monitoring"],
    ),
    (
        "performance",
        &["performance", "slow", "latency", "throughput", "cache", "caching", "optimize",
          "memory", "profile", "speed", "scale"],
    ),
    (
        "documentation",
        &["doc", "docs", "documentation", "readme", "guide", "tutorial", "changelog", "write",
          "report"],
    ),
    (
        "architecture",
        &["architecture", "refactor", "design", "modular", "module", "boundary", "pattern",
          "restructure", "decouple"],
    ),
    (
        "accessibility",
        &["accessibility", "a11y", "aria", "contrast", "screen", "keyboard", "wcag"],
    ),
    (
        "data",
        &["data", "analytics", "etl", "warehouse", "dashboard", "metric", "csv", "dataset",
          "research", "analysis"],
    ),
];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "add", "make", "use", "our",
    "new", "all", "are", "can", "should", "will", "when", "then", "have", "has", "not", "but",
];

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// A handler that can be put on a project's team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl Capability {
    fn builtin(
        id: &str,
        name: &str,
        category: &str,
        domains: &[&str],
        keywords: &[&str],
        description: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            category: category.to_string(),
            domains: domains.iter().map(|s| s.to_string()).collect(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            description: description.to_string(),
        }
    }
}

pub fn builtin_capabilities() -> Vec<Capability> {
    vec![
        Capability::builtin("security-reviewer", "Security Reviewer", "review", &["security"],
            &["security", "auth", "vulnerability", "injection", "xss", "csrf", "secret", "owasp"],
            "Reviews changes for authentication, authorization and injection flaws."),
        Capability::builtin("frontend-engineer", "Frontend Engineer", "engineering", &["frontend"],
            &["ui", "react", "css", "component", "layout", "theme", "dark", "mode"],
            "Builds user interface components, styling and client-side state."),
        Capability::builtin("ui-designer", "UI Designer", "design", &["frontend", "accessibility"],
            &["design", "ux", "theme", "color", "palette", "dark", "visual"],
            "Designs visual language, color themes and interaction patterns."),
        Capability::builtin("backend-engineer", "Backend Engineer", "engineering", &["backend"],
            &["api", "endpoint", "service", "server", "rest", "grpc", "handler"],
            "Implements server-side services, endpoints and business logic."),
        Capability::builtin("database-architect", "Database Architect", "data", &["database", "data"],
            &["schema", "migration", "sql", "query", "index", "table"],
            "Designs schemas, migrations and query plans."),
        Capability::builtin("test-engineer", "Test Engineer", "quality", &["testing"],
            &["test", "coverage", "regression", "unit", "integration", "e2e"],
            "Writes and maintains automated tests and regression suites."),
        Capability::builtin("devops-engineer", "DevOps Engineer", "operations", &["devops"],
            &["deploy", "ci", "pipeline", "docker", "kubernetes", "infrastructure"],
            "Owns build pipelines, deployment and infrastructure configuration."),
        Capability::builtin("performance-engineer", "Performance Engineer", "performance", &["performance"],
            &["latency", "throughput", "cache", "profile", "optimize", "slow"],
            "Profiles hot paths and removes latency and memory bottlenecks."),
        Capability::builtin("technical-writer", "Technical Writer", "documentation", &["documentation"],
            &["docs", "readme", "guide", "changelog", "tutorial"],
            "Writes user guides, reference documentation and changelogs."),
        Capability::builtin("architecture-advisor", "Architecture Advisor", "architecture", &["architecture", "backend"],
            &["architecture", "modular", "refactor", "boundary", "pattern"],
            "Reviews module boundaries, dependencies and long-term structure."),
        Capability::builtin("accessibility-auditor", "Accessibility Auditor", "review", &["accessibility", "frontend"],
            &["a11y", "accessibility", "aria", "contrast", "screen", "keyboard"],
            "Audits interfaces for contrast, keyboard and screen reader support."),
        Capability::builtin("data-engineer", "Data Engineer", "data", &["data", "database"],
            &["etl", "pipeline", "analytics", "warehouse", "stream", "dataset"],
            "Builds data pipelines, transformations and analytics storage."),
        Capability::builtin("code-reviewer", "Code Reviewer", "review", &["backend", "frontend", "testing"],
            &["review", "quality", "lint", "bug", "refactor"],
            "Reviews code for correctness, readability and maintainability."),
        Capability::builtin("requirements-analyst", "Requirements Analyst", "planning", &[],
            &["requirement", "scope", "story", "acceptance", "plan"],
            "Turns requests into scoped requirements and acceptance criteria."),
        Capability::builtin("sre-engineer", "Site Reliability Engineer", "operations", &["devops", "performance"],
            &["monitoring", "alert", "incident", "reliability", "logging"],
            "Adds monitoring, alerting and incident runbooks."),
        Capability::builtin("api-designer", "API Designer", "design", &["backend", "architecture"],
            &["api", "contract", "openapi", "versioning", "schema"],
            "Designs API contracts, versioning and error models."),
        Capability::builtin("qa-strategist", "QA Strategist", "quality", &["testing"],
            &["qa", "acceptance", "uat", "manual", "plan"],
            "Plans acceptance testing and user acceptance sign-off."),
        Capability::builtin("research-analyst", "Research Analyst", "planning", &["data", "documentation"],
            &["research", "compare", "evaluate", "market", "analysis"],
            "Researches options, compares alternatives and writes findings."),
        Capability::builtin("project-coordinator", "Project Coordinator", "planning", &[],
            &["coordinate", "timeline", "milestone", "stakeholder", "plan"],
            "Coordinates timelines, milestones and stakeholder communication."),
    ]
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Built-in catalogue plus configured capabilities; a configured entry with
/// a built-in id replaces it.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    capabilities: Vec<Capability>,
}

impl CapabilityRegistry {
    pub fn new(overrides: &[Capability]) -> Self {
        let mut by_id: BTreeMap<String, Capability> = builtin_capabilities()
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        for cap in overrides {
            by_id.insert(cap.id.clone(), cap.clone());
        }
        Self {
            capabilities: by_id.into_values().collect(),
        }
    }

    pub fn all(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn get(&self, id: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.id == id)
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

fn stem(word: &str) -> String {
    let w = word.to_lowercase();
    if w.len() > 3 && w.ends_with('s') && !w.ends_with("ss") {
        w[..w.len() - 1].to_string()
    } else {
        w
    }
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(stem)
        .collect()
}

/// Domains whose vocabulary appears in `request`, in vocabulary order.
pub fn classify_domains(request: &str) -> Vec<String> {
    let tokens: BTreeSet<String> = tokenize(request).into_iter().collect();
    DOMAINS
        .iter()
        .filter(|(_, words)| words.iter().any(|w| tokens.contains(&stem(w))))
        .map(|(d, _)| d.to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub domain_overlap: f64,
    pub keyword_match: f64,
    pub description_match: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredCapability {
    pub id: String,
    pub name: String,
    pub category: String,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

fn score(cap: &Capability, domains: &[String], tokens: &BTreeSet<String>) -> ScoreBreakdown {
    let domain_overlap = if domains.is_empty() {
        0.0
    } else {
        let hits = domains.iter().filter(|d| cap.domains.contains(d)).count();
        hits as f64 / domains.len() as f64
    };

    let mut cap_words: BTreeSet<String> = cap.keywords.iter().map(|k| stem(k)).collect();
    cap_words.extend(tokenize(&cap.name));
    let keyword_hits = cap_words.iter().filter(|w| tokens.contains(*w)).count();
    let keyword_match = (keyword_hits as f64 / 2.0).min(1.0);

    let significant: Vec<&String> = tokens
        .iter()
        .filter(|t| t.len() >= 3 && !STOPWORDS.contains(&t.as_str()))
        .collect();
    let description_match = if significant.is_empty() {
        0.0
    } else {
        let desc: BTreeSet<String> = tokenize(&cap.description).into_iter().collect();
        let hits = significant.iter().filter(|t| desc.contains(**t)).count();
        hits as f64 / significant.len() as f64
    };

    ScoreBreakdown {
        domain_overlap,
        keyword_match,
        description_match,
    }
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        DOMAIN_WEIGHT * self.domain_overlap
            + KEYWORD_WEIGHT * self.keyword_match
            + DESCRIPTION_WEIGHT * self.description_match
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Discovery {
    pub domains: Vec<String>,
    pub target: usize,
    pub candidates: Vec<ScoredCapability>,
    pub roster: Vec<String>,
}

/// Team size: mode base, +1 per domain beyond two, +1 for a long request,
/// clamped to the mode's bounds.
pub fn target_count(mode: Mode, domains: usize, words: usize, cfg: &DiscoveryConfig) -> usize {
    let (min, max) = mode.roster_bounds();
    let mut target = min;
    target += domains.saturating_sub(2);
    if words > cfg.long_request_words {
        target += 1;
    }
    target.clamp(min, max)
}

/// Rank every capability against `request` and pick a roster. Identical
/// inputs always give identical output.
pub fn discover(
    request: &str,
    mode: Mode,
    registry: &CapabilityRegistry,
    cfg: &DiscoveryConfig,
) -> Discovery {
    let domains = classify_domains(request);
    let tokens: BTreeSet<String> = tokenize(request).into_iter().collect();
    let words = request.split_whitespace().count();
    let target = target_count(mode, domains.len(), words, cfg);

    let mut candidates: Vec<ScoredCapability> = registry
        .all()
        .iter()
        .map(|cap| {
            let breakdown = score(cap, &domains, &tokens);
            ScoredCapability {
                id: cap.id.clone(),
                name: cap.name.clone(),
                category: cap.category.clone(),
                score: breakdown.total(),
                breakdown,
            }
        })
        .collect();
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));

    let mut roster: Vec<String> = Vec::new();
    let mut per_category: BTreeMap<&str, usize> = BTreeMap::new();
    for c in &candidates {
        if roster.len() >= target || c.score < cfg.relevance_threshold {
            break;
        }
        let used = per_category.entry(c.category.as_str()).or_insert(0);
        if *used >= cfg.category_cap {
            continue;
        }
        *used += 1;
        roster.push(c.id.clone());
    }

    let (min, _) = mode.roster_bounds();
    for c in &candidates {
        if roster.len() >= min {
            break;
        }
        if !roster.contains(&c.id) {
            roster.push(c.id.clone());
        }
    }

    tracing::debug!(?domains, target, roster = ?roster, "discovery ranked");
    Discovery {
        domains,
        target,
        candidates,
        roster,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new(&[])
    }

    #[test]
    fn classifies_dark_mode_as_frontend() {
        assert_eq!(classify_domains("add dark mode"), vec!["frontend".to_string()]);
    }

    #[test]
    fn classifies_multiple_domains() {
        let d = classify_domains("Fix slow SQL queries behind the login API and add tests");
        for expected in ["security", "backend", "database", "testing", "performance"] {
            assert!(d.contains(&expected.to_string()), "missing {expected}: {d:?}");
        }
    }

    #[test]
    fn roster_is_deterministic() {
        let cfg = DiscoveryConfig::default();
        let a = discover("add dark mode", Mode::Coding, &registry(), &cfg);
        let b = discover("add dark mode", Mode::Coding, &registry(), &cfg);
        assert_eq!(a.roster, b.roster);
        assert_eq!(a.roster.len(), 3);
        assert_eq!(a.roster[0], "frontend-engineer");
    }

    #[test]
    fn roster_respects_bounds_and_category_cap() {
        let cfg = DiscoveryConfig::default();
        let request = "Harden login security, speed up slow database queries, add API tests, \
                       document the deploy pipeline and audit keyboard accessibility of every \
                       page in the dashboard before the next release goes out to customers";
        let d = discover(request, Mode::Coding, &registry(), &cfg);
        assert_eq!(d.target, 7);
        assert!(d.roster.len() >= 3 && d.roster.len() <= 7);
        let reg = registry();
        let mut per_category: BTreeMap<String, usize> = BTreeMap::new();
        for id in &d.roster {
            *per_category
                .entry(reg.get(id).unwrap().category.clone())
                .or_insert(0) += 1;
        }
        assert!(per_category.values().all(|n| *n <= 2), "{per_category:?}");
    }

    #[test]
    fn unrelated_request_is_backfilled_to_minimum() {
        let cfg = DiscoveryConfig::default();
        let d = discover("zzz qqq", Mode::Coding, &registry(), &cfg);
        assert!(d.domains.is_empty());
        assert_eq!(d.roster.len(), 3);
    }

    #[test]
    fn work_mode_uses_smaller_team() {
        let cfg = DiscoveryConfig::default();
        let d = discover("research analytics vendors", Mode::Work, &registry(), &cfg);
        assert!(!d.roster.is_empty() && d.roster.len() <= 3);
    }

    #[test]
    fn target_count_grows_with_domains_and_length() {
        let cfg = DiscoveryConfig::default();
        assert_eq!(target_count(Mode::Coding, 1, 3, &cfg), 3);
        assert_eq!(target_count(Mode::Coding, 4, 3, &cfg), 5);
        assert_eq!(target_count(Mode::Coding, 4, 31, &cfg), 6);
        assert_eq!(target_count(Mode::Coding, 11, 100, &cfg), 7);
        assert_eq!(target_count(Mode::Work, 0, 5, &cfg), 1);
    }

    #[test]
    fn config_entry_replaces_builtin() {
        let custom = Capability {
            id: "frontend-engineer".into(),
            name: "Custom Frontend".into(),
            category: "engineering".into(),
            domains: vec!["frontend".into()],
            keywords: vec![],
            description: String::new(),
        };
        let reg = CapabilityRegistry::new(&[custom]);
        assert_eq!(reg.get("frontend-engineer").unwrap().name, "Custom Frontend");
        assert_eq!(reg.all().len(), builtin_capabilities().len());
    }
}
