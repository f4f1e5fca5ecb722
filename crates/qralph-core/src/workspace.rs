//! Workspace layout under `.qralph/`: initialization, the current-project
//! pointer and project id allocation.

use crate::config::Config;
use crate::error::{QralphError, Result};
use crate::io;
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

const SLUG_LEN: usize = 40;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentProject {
    pub project: String,
    pub set_at: DateTime<Utc>,
}

/// Create the `.qralph/` skeleton and a default config. Existing files are
/// left alone. Returns the paths that were created.
pub fn init(root: &Path) -> Result<Vec<String>> {
    let mut created = Vec::new();
    for dir in [
        paths::qralph_dir(root),
        paths::projects_dir(root),
        root.join(".qralph/healing-attempts"),
        root.join(".qralph/memory"),
    ] {
        if !dir.exists() {
            io::ensure_dir(&dir)?;
            created.push(display(root, &dir));
        }
    }
    let config = paths::config_path(root);
    if !config.exists() {
        Config::default().save(root)?;
        created.push(display(root, &config));
    }
    Ok(created)
}

fn display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).display().to_string()
}

pub fn ensure_initialized(root: &Path) -> Result<()> {
    if paths::qralph_dir(root).is_dir() {
        Ok(())
    } else {
        Err(QralphError::NotInitialized)
    }
}

pub fn set_current(root: &Path, id: &str) -> Result<()> {
    paths::validate_project_id(id)?;
    let pointer = CurrentProject {
        project: id.to_string(),
        set_at: Utc::now(),
    };
    let data = serde_json::to_string_pretty(&pointer)?;
    io::atomic_write(&paths::current_project_path(root), data.as_bytes())
}

/// The project named in `current-project.json`, if any.
pub fn current(root: &Path) -> Result<Option<String>> {
    let path = paths::current_project_path(root);
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(&path)?;
    let pointer: CurrentProject = serde_json::from_str(&data)?;
    Ok(Some(pointer.project))
}

/// Project ids in name order.
pub fn list_projects(root: &Path) -> Result<Vec<String>> {
    let dir = paths::projects_dir(root);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            ids.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    ids.sort();
    Ok(ids)
}

/// `NNN-slug`: one past the highest numeric prefix in use, then the request
/// slugified.
pub fn allocate_project_id(root: &Path, request: &str) -> Result<String> {
    let next = list_projects(root)?
        .iter()
        .filter_map(|id| id.split('-').next()?.parse::<u32>().ok())
        .max()
        .map_or(1, |n| n + 1);
    let id = format!("{next:03}-{}", paths::slugify(request, SLUG_LEN));
    paths::validate_project_id(&id)?;
    Ok(id)
}
