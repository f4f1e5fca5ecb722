use crate::error::{CorruptionError, QralphError, Result};
use crate::io;
use crate::lock::ExclusiveLock;
use crate::paths;
use crate::state::ProjectState;
use crate::types::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const CHECKSUM_FIELD: &str = "_checksum";

// ---------------------------------------------------------------------------
// Checksums
// ---------------------------------------------------------------------------

/// Serialize with object keys sorted at every level, so the checksum does
/// not depend on field order.
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = Map::new();
                for k in keys {
                    out.insert(k.clone(), sorted(&map[k]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

/// Hex SHA-256 of the canonical JSON of `value`, ignoring any `_checksum`.
pub fn checksum(value: &Value) -> String {
    let mut value = value.clone();
    if let Value::Object(map) = &mut value {
        map.remove(CHECKSUM_FIELD);
    }
    format!("{:x}", Sha256::digest(canonical_json(&value).as_bytes()))
}

fn seal<T: Serialize>(doc: &T) -> Result<Vec<u8>> {
    let mut value = serde_json::to_value(doc)?;
    let sum = checksum(&value);
    if let Value::Object(map) = &mut value {
        map.insert(CHECKSUM_FIELD.to_string(), Value::String(sum));
    }
    Ok(serde_json::to_vec_pretty(&value)?)
}

fn corrupt(path: &Path, reason: impl Into<String>) -> QralphError {
    CorruptionError {
        path: path.display().to_string(),
        reason: reason.into(),
    }
    .into()
}

/// Parse a sealed document and verify its checksum. Any parse failure or
/// mismatch is a `CorruptionError`.
fn unseal<T: for<'de> Deserialize<'de>>(path: &Path, data: &str) -> Result<T> {
    let value: Value =
        serde_json::from_str(data).map_err(|e| corrupt(path, format!("unparseable: {e}")))?;
    let stored = value
        .get(CHECKSUM_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| corrupt(path, "missing _checksum"))?
        .to_string();
    let computed = checksum(&value);
    if stored != computed {
        return Err(corrupt(
            path,
            format!("checksum mismatch: stored {stored}, computed {computed}"),
        ));
    }
    serde_json::from_value(value).map_err(|e| corrupt(path, format!("invalid shape: {e}")))
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: u64,
    pub taken_at: DateTime<Utc>,
    pub reason: String,
    pub state: ProjectState,
}

/// One file in `checkpoints/`, valid or not.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointInfo {
    pub seq: u64,
    pub path: PathBuf,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self, id: &str) -> bool {
        paths::state_path(&self.root, id).exists()
    }

    pub fn load(&self, id: &str) -> Result<ProjectState> {
        let path = paths::state_path(&self.root, id);
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(QralphError::ProjectNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        unseal(&path, &data)
    }

    /// Persist `state` and record it as the next checkpoint. The checkpoint
    /// is written first so `state.json` never runs ahead of the history.
    pub fn save(&self, lock: &ExclusiveLock, state: &ProjectState, reason: &str) -> Result<u64> {
        lock.ensure_project(&state.id)?;
        let seq = self.write_checkpoint(state, reason)?;
        io::atomic_write(&paths::state_path(&self.root, &state.id), &seal(state)?)?;
        tracing::debug!(project = %state.id, seq, phase = %state.phase, "state saved");
        Ok(seq)
    }

    pub fn create(&self, lock: &ExclusiveLock, state: &ProjectState) -> Result<u64> {
        if self.exists(&state.id) {
            return Err(QralphError::ProjectExists(state.id.clone()));
        }
        self.save(lock, state, "created")
    }

    /// Make a checkpoint's state current again, byte for byte, and record the
    /// restore as a new checkpoint.
    pub fn restore(&self, lock: &ExclusiveLock, checkpoint: &Checkpoint, reason: &str) -> Result<u64> {
        self.save(lock, &checkpoint.state, reason)
    }

    fn write_checkpoint(&self, state: &ProjectState, reason: &str) -> Result<u64> {
        let checkpoint = Checkpoint {
            seq: self.next_seq(&state.id)?,
            taken_at: Utc::now(),
            reason: reason.to_string(),
            state: state.clone(),
        };
        let path = paths::checkpoint_path(&self.root, &state.id, checkpoint.seq);
        io::atomic_create(&path, &seal(&checkpoint)?)?;
        Ok(checkpoint.seq)
    }

    // -----------------------------------------------------------------------
    // Checkpoint queries
    // -----------------------------------------------------------------------

    fn checkpoint_seqs(&self, id: &str) -> Result<Vec<u64>> {
        let dir = paths::checkpoints_dir(&self.root, id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut seqs = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(seq) = name.strip_suffix(".json").and_then(|s| s.parse::<u64>().ok()) {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    /// Max existing sequence number plus one. Corrupt files still occupy
    /// their number.
    pub fn next_seq(&self, id: &str) -> Result<u64> {
        Ok(self.checkpoint_seqs(id)?.last().map_or(1, |s| s + 1))
    }

    pub fn read_checkpoint(&self, id: &str, seq: u64) -> Result<Checkpoint> {
        let path = paths::checkpoint_path(&self.root, id, seq);
        let data = std::fs::read_to_string(&path)?;
        let checkpoint: Checkpoint = unseal(&path, &data)?;
        if checkpoint.seq != seq || checkpoint.state.id != id {
            return Err(corrupt(&path, "sequence or project id does not match file name"));
        }
        Ok(checkpoint)
    }

    /// Every checkpoint file in sequence order, with validity.
    pub fn checkpoints(&self, id: &str) -> Result<Vec<CheckpointInfo>> {
        let mut out = Vec::new();
        for seq in self.checkpoint_seqs(id)? {
            let path = paths::checkpoint_path(&self.root, id, seq);
            out.push(match self.read_checkpoint(id, seq) {
                Ok(cp) => CheckpointInfo {
                    seq,
                    path,
                    valid: true,
                    phase: Some(cp.state.phase),
                    reason: Some(cp.reason),
                    error: None,
                },
                Err(e) => CheckpointInfo {
                    seq,
                    path,
                    valid: false,
                    phase: None,
                    reason: None,
                    error: Some(e.to_string()),
                },
            });
        }
        Ok(out)
    }

    pub fn latest_valid(&self, id: &str) -> Result<Option<Checkpoint>> {
        self.latest_valid_where(id, |_| true)
    }

    /// Newest valid checkpoint matching `pred`, skipping corrupt files.
    pub fn latest_valid_where<F>(&self, id: &str, pred: F) -> Result<Option<Checkpoint>>
    where
        F: Fn(&Checkpoint) -> bool,
    {
        for seq in self.checkpoint_seqs(id)?.into_iter().rev() {
            match self.read_checkpoint(id, seq) {
                Ok(cp) if pred(&cp) => return Ok(Some(cp)),
                Ok(_) => {}
                Err(QralphError::Corruption(e)) => {
                    tracing::warn!(project = id, seq, "skipping corrupt checkpoint: {}", e.reason);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Write the given state under `forensics/` for later inspection.
    pub fn write_forensic(&self, lock: &ExclusiveLock, state: &ProjectState, reason: &str) -> Result<PathBuf> {
        lock.ensure_project(&state.id)?;
        let seq = self.next_seq(&state.id)?.saturating_sub(1);
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let path = paths::forensics_dir(&self.root, &state.id).join(format!("{seq:06}-{stamp}.json"));
        let doc = serde_json::json!({
            "reason": reason,
            "captured_at": Utc::now(),
            "state": state,
        });
        io::atomic_write(&path, serde_json::to_string_pretty(&doc)?.as_bytes())?;
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockScope;
    use crate::types::{GateMode, Mode};
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, StateStore, ExclusiveLock, ProjectState) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let lock = ExclusiveLock::acquire(
            dir.path(),
            LockScope::Project("001-x".into()),
            Duration::ZERO,
        )
        .unwrap();
        let state = ProjectState::new("001-x", "add dark mode", Mode::Coding, GateMode::Auto);
        (dir, store, lock, state)
    }

    #[test]
    fn save_then_load_roundtrips() {
        let (_dir, store, lock, state) = setup();
        assert_eq!(store.create(&lock, &state).unwrap(), 1);
        assert_eq!(store.load("001-x").unwrap(), state);
    }

    #[test]
    fn create_refuses_existing_project() {
        let (_dir, store, lock, state) = setup();
        store.create(&lock, &state).unwrap();
        assert!(matches!(
            store.create(&lock, &state),
            Err(QralphError::ProjectExists(_))
        ));
    }

    #[test]
    fn single_byte_edit_is_detected() {
        let (dir, store, lock, state) = setup();
        store.create(&lock, &state).unwrap();
        let path = paths::state_path(dir.path(), "001-x");
        let data = std::fs::read_to_string(&path).unwrap();
        let tampered = data.replacen("add dark mode", "add dark mods", 1);
        std::fs::write(&path, tampered).unwrap();
        assert!(matches!(
            store.load("001-x"),
            Err(QralphError::Corruption(_))
        ));
    }

    #[test]
    fn field_reordering_keeps_checksum_valid() {
        let (dir, store, lock, state) = setup();
        store.create(&lock, &state).unwrap();
        let path = paths::state_path(dir.path(), "001-x");
        // Compact, keys in sorted order: different bytes, same content.
        let value: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        std::fs::write(&path, canonical_json(&value)).unwrap();
        assert_eq!(store.load("001-x").unwrap(), state);
    }

    #[test]
    fn missing_state_is_not_found() {
        let (_dir, store, _lock, _state) = setup();
        assert!(matches!(
            store.load("001-x"),
            Err(QralphError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn every_save_appends_a_checkpoint() {
        let (_dir, store, lock, mut state) = setup();
        store.create(&lock, &state).unwrap();
        state.phase = Phase::Discovering;
        assert_eq!(store.save(&lock, &state, "advance").unwrap(), 2);
        let cps = store.checkpoints("001-x").unwrap();
        assert_eq!(cps.len(), 2);
        assert!(cps.iter().all(|c| c.valid));
        assert_eq!(cps[1].phase, Some(Phase::Discovering));
    }

    #[test]
    fn latest_valid_skips_truncated_checkpoint() {
        let (dir, store, lock, mut state) = setup();
        store.create(&lock, &state).unwrap();
        state.phase = Phase::Discovering;
        store.save(&lock, &state, "advance").unwrap();

        let newest = paths::checkpoint_path(dir.path(), "001-x", 2);
        let data = std::fs::read(&newest).unwrap();
        std::fs::write(&newest, &data[..data.len() / 2]).unwrap();

        let cp = store.latest_valid("001-x").unwrap().unwrap();
        assert_eq!(cp.seq, 1);
        assert_eq!(cp.state.phase, Phase::Init);
        // The corrupt file still occupies its sequence number.
        assert_eq!(store.next_seq("001-x").unwrap(), 3);
    }

    #[test]
    fn restore_reproduces_checkpoint_state_exactly() {
        let (_dir, store, lock, mut state) = setup();
        store.create(&lock, &state).unwrap();
        let first = store.read_checkpoint("001-x", 1).unwrap();
        state.phase = Phase::Discovering;
        state.circuit_breaker.consecutive_failures = 2;
        store.save(&lock, &state, "advance").unwrap();

        store.restore(&lock, &first, "rollback").unwrap();
        assert_eq!(store.load("001-x").unwrap(), first.state);
        let latest = store.latest_valid("001-x").unwrap().unwrap();
        assert_eq!(latest.seq, 3);
        assert_eq!(latest.state, first.state);
    }

    #[test]
    fn save_with_wrong_guard_is_refused() {
        let (dir, store, _lock, _state) = setup();
        let other = ExclusiveLock::acquire(
            dir.path(),
            LockScope::Project("002-y".into()),
            Duration::ZERO,
        )
        .unwrap();
        let state = ProjectState::new("001-x", "r", Mode::Coding, GateMode::Auto);
        assert!(matches!(
            store.save(&other, &state, "x"),
            Err(QralphError::LockNotHeld { .. })
        ));
        assert!(!store.exists("001-x"));
    }

    #[test]
    fn forensic_copy_is_written() {
        let (_dir, store, lock, state) = setup();
        store.create(&lock, &state).unwrap();
        let path = store.write_forensic(&lock, &state, "rollback").unwrap();
        assert!(path.exists());
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("000001-"));
    }
}
