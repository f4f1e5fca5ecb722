use crate::config::MemoryConfig;
use crate::error::{QralphError, Result};
use crate::io;
use crate::lock::{ExclusiveLock, LockScope};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tantivy::{
    collector::TopDocs,
    query::QueryParser,
    schema::{Schema, Value, STORED, STRING, TEXT},
    Index, IndexWriter, ReloadPolicy, TantivyDocument,
};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One remembered resolution or lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub description: String,
    pub domain: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryHit {
    pub entry: MemoryEntry,
    /// BM25 relevance before decay and boost.
    pub relevance: f32,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryCheck {
    pub tried_before: bool,
    pub prior_results: Vec<MemoryHit>,
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

pub struct MemoryStore {
    root: PathBuf,
    cfg: MemoryConfig,
    lock_timeout: Duration,
}

impl MemoryStore {
    pub fn new(root: &Path, cfg: MemoryConfig, lock_timeout: Duration) -> Self {
        Self {
            root: root.to_path_buf(),
            cfg,
            lock_timeout,
        }
    }

    pub fn store(
        &self,
        description: &str,
        domain: &str,
        category: &str,
        project: Option<&str>,
    ) -> Result<MemoryEntry> {
        if description.trim().is_empty() {
            return Err(QralphError::InvalidValue(
                "memory description is empty".to_string(),
            ));
        }
        let entry = MemoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.trim().to_string(),
            domain: domain.to_lowercase(),
            category: category.to_lowercase(),
            project: project.map(str::to_string),
            created_at: Utc::now(),
        };
        self.append(&entry)?;
        Ok(entry)
    }

    fn append(&self, entry: &MemoryEntry) -> Result<()> {
        let lock = ExclusiveLock::acquire(&self.root, LockScope::Registry, self.lock_timeout)?;
        lock.ensure_registry()?;
        io::append_jsonl(&paths::memory_log_path(&self.root), entry)
    }

    pub fn entries(&self) -> Result<Vec<MemoryEntry>> {
        io::read_jsonl(&paths::memory_log_path(&self.root))
    }

    pub fn query(&self, text: &str, domain: Option<&str>, limit: usize) -> Result<Vec<MemoryHit>> {
        self.query_at(text, domain, limit, Utc::now())
    }

    /// BM25 relevance × `0.5^(age_days / half_life_days)` × domain boost.
    pub fn query_at(
        &self,
        text: &str,
        domain: Option<&str>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<MemoryHit>> {
        let entries = self.entries()?;
        let query_str = query_terms(text).join(" ");
        if entries.is_empty() || query_str.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut schema_builder = Schema::builder();
        let id_field = schema_builder.add_text_field("id", STRING | STORED);
        let description_field = schema_builder.add_text_field("description", TEXT);
        let category_field = schema_builder.add_text_field("category", TEXT);
        let index = Index::create_in_ram(schema_builder.build());

        let mut writer: IndexWriter = index
            .writer(15_000_000)
            .map_err(|e| QralphError::Search(e.to_string()))?;
        for e in &entries {
            let mut doc = TantivyDocument::default();
            doc.add_text(id_field, &e.id);
            doc.add_text(description_field, &e.description);
            doc.add_text(category_field, &e.category);
            writer
                .add_document(doc)
                .map_err(|e| QralphError::Search(e.to_string()))?;
        }
        writer
            .commit()
            .map_err(|e| QralphError::Search(e.to_string()))?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e: tantivy::TantivyError| QralphError::Search(e.to_string()))?;
        let searcher = reader.searcher();

        // Terms are OR-joined: any shared word is a partial match.
        let parser = QueryParser::for_index(&index, vec![description_field, category_field]);
        let query = match parser.parse_query(&query_str) {
            Ok(q) => q,
            Err(_) => return Ok(Vec::new()),
        };
        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(entries.len()))
            .map_err(|e| QralphError::Search(e.to_string()))?;

        let by_id: HashMap<&str, &MemoryEntry> =
            entries.iter().map(|e| (e.id.as_str(), e)).collect();
        let domain = domain.map(str::to_lowercase);
        let mut hits = Vec::with_capacity(top_docs.len());
        for (relevance, addr) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(addr)
                .map_err(|e| QralphError::Search(e.to_string()))?;
            let Some(entry) = doc
                .get_first(id_field)
                .and_then(|v| v.as_str())
                .and_then(|id| by_id.get(id))
            else {
                continue;
            };
            let age_days = now
                .signed_duration_since(entry.created_at)
                .num_seconds()
                .max(0) as f64
                / 86_400.0;
            let decay = 0.5f64.powf(age_days / self.cfg.half_life_days);
            let boost = match &domain {
                Some(d) if *d == entry.domain => self.cfg.domain_boost,
                _ => 1.0,
            };
            hits.push(MemoryHit {
                entry: (*entry).clone(),
                relevance,
                score: relevance as f64 * decay * boost,
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.entry.created_at.cmp(&a.entry.created_at))
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    pub fn check(&self, text: &str, domain: Option<&str>) -> Result<MemoryCheck> {
        let prior_results = self.query(text, domain, 5)?;
        Ok(MemoryCheck {
            tried_before: !prior_results.is_empty(),
            prior_results,
        })
    }
}

/// Lowercase alphanumeric words, deduplicated. Anything the query parser
/// treats as syntax is dropped.
fn query_terms(text: &str) -> Vec<String> {
    let terms: BTreeSet<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 2)
        .map(str::to_lowercase)
        .collect();
    terms.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
