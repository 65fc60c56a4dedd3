//! Crash-safe persistence of [`WorkflowState`].
//!
//! Layout under the state directory:
//!
//! ```text
//! workflow-state/
//!   {id}.json        canonical envelope
//!   {id}.json.tmp    in-flight write, never read
//!   {id}.json.bak.N  previous canonical files, N = 1 is newest
//!   {id}.lock        lease held by the executor running the workflow
//! ```
//!
//! Every file is a [`StateEnvelope`]: the state plus a schema version and a
//! SHA-256 checksum of the state's canonical JSON. A file failing any check is
//! reported as [`StateError::Corrupt`] and never silently replaced.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use super::state::WorkflowState;
use crate::errors::StateError;
use crate::util::{atomic_write, sha256_hex, sync_dir, tmp_path_for, write_synced};

pub const SCHEMA_VERSION: u32 = 1;

/// Default number of backups kept per workflow.
pub const DEFAULT_BACKUPS: usize = 3;

#[derive(Debug, Serialize, Deserialize)]
pub struct StateEnvelope {
    pub schema_version: u32,
    pub checksum: String,
    pub state: serde_json::Value,
}

pub struct StateStore {
    dir: PathBuf,
    backups: usize,
}

/// Exclusive right to run a workflow. Released on drop.
#[derive(Debug)]
pub struct WorkflowLease {
    id: String,
    file: File,
}

impl WorkflowLease {
    pub fn workflow_id(&self) -> &str {
        &self.id
    }
}

impl Drop for WorkflowLease {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!(workflow_id = %self.id, error = %e, "lease unlock failed");
        }
    }
}

/// Reject ids that could escape the state directory.
pub fn validate_workflow_id(id: &str) -> Result<(), StateError> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StateError::InvalidId { id: id.to_string() })
    }
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            backups: DEFAULT_BACKUPS,
        }
    }

    pub fn with_backups(mut self, backups: usize) -> Self {
        self.backups = backups;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn backups(&self) -> usize {
        self.backups
    }

    pub fn state_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn backup_path(&self, id: &str, n: usize) -> PathBuf {
        self.dir.join(format!("{}.json.bak.{}", id, n))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", id))
    }

    fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StateError + '_ {
        move |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Build the envelope bytes for a state.
    pub fn encode(state: &WorkflowState) -> Result<Vec<u8>, StateError> {
        let value = serde_json::to_value(state).map_err(StateError::Serialize)?;
        let canonical = serde_json::to_vec(&value).map_err(StateError::Serialize)?;
        let envelope = StateEnvelope {
            schema_version: SCHEMA_VERSION,
            checksum: sha256_hex(&canonical),
            state: value,
        };
        serde_json::to_vec_pretty(&envelope).map_err(StateError::Serialize)
    }

    /// Validate envelope bytes read from `path` and extract the state.
    pub fn decode(path: &Path, bytes: &[u8], expected_id: &str) -> Result<WorkflowState, StateError> {
        let corrupt = |reason: String| StateError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let envelope: StateEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| corrupt(format!("not a state envelope: {}", e)))?;
        if envelope.schema_version != SCHEMA_VERSION {
            return Err(corrupt(format!(
                "schema version {} (expected {})",
                envelope.schema_version, SCHEMA_VERSION
            )));
        }
        let canonical = serde_json::to_vec(&envelope.state)
            .map_err(|e| corrupt(format!("state not serializable: {}", e)))?;
        let actual = sha256_hex(&canonical);
        if actual != envelope.checksum {
            return Err(corrupt(format!(
                "checksum mismatch (stored {}, computed {})",
                envelope.checksum, actual
            )));
        }
        let state: WorkflowState = serde_json::from_value(envelope.state)
            .map_err(|e| corrupt(format!("invalid state: {}", e)))?;
        if state.id != expected_id {
            return Err(corrupt(format!(
                "id mismatch (file holds '{}', expected '{}')",
                state.id, expected_id
            )));
        }
        Ok(state)
    }

    /// Persist `state` atomically, rotating the previous canonical file into
    /// the backup ring.
    pub fn save(&self, state: &WorkflowState) -> Result<(), StateError> {
        validate_workflow_id(&state.id)?;
        let bytes = Self::encode(state)?;
        let path = self.state_path(&state.id);
        let tmp = tmp_path_for(&path);

        write_synced(&tmp, &bytes).map_err(Self::io_err(&tmp))?;
        self.rotate_backups(&state.id)?;
        fs::rename(&tmp, &path).map_err(Self::io_err(&path))?;
        sync_dir(&self.dir).map_err(Self::io_err(&self.dir))?;

        tracing::trace!(
            workflow_id = %state.id,
            step = state.current_step_index,
            status = %state.status,
            "state saved"
        );
        Ok(())
    }

    fn rotate_backups(&self, id: &str) -> Result<(), StateError> {
        let canonical = self.state_path(id);
        if self.backups == 0 || !canonical.exists() {
            return Ok(());
        }
        for n in (1..self.backups).rev() {
            let from = self.backup_path(id, n);
            if from.exists() {
                let to = self.backup_path(id, n + 1);
                fs::rename(&from, &to).map_err(Self::io_err(&to))?;
            }
        }
        let first = self.backup_path(id, 1);
        fs::copy(&canonical, &first).map_err(Self::io_err(&first))?;
        Ok(())
    }

    fn read_file(&self, path: &Path, id: &str) -> Result<Option<WorkflowState>, StateError> {
        match fs::read(path) {
            Ok(bytes) => Self::decode(path, &bytes, id).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Load the canonical state. `Ok(None)` if the workflow was never saved.
    pub fn load(&self, id: &str) -> Result<Option<WorkflowState>, StateError> {
        validate_workflow_id(id)?;
        self.read_file(&self.state_path(id), id)
    }

    /// Load backup `n` (1 is the newest).
    pub fn load_backup(&self, id: &str, n: usize) -> Result<Option<WorkflowState>, StateError> {
        validate_workflow_id(id)?;
        self.read_file(&self.backup_path(id, n), id)
    }

    /// The newest backup that passes validation, with its slot number.
    pub fn latest_valid_backup(&self, id: &str) -> Result<Option<(usize, WorkflowState)>, StateError> {
        for n in 1..=self.backups {
            match self.load_backup(id, n) {
                Ok(Some(state)) => return Ok(Some((n, state))),
                Ok(None) => continue,
                Err(StateError::Corrupt { path, reason }) => {
                    tracing::warn!(
                        workflow_id = id,
                        path = %path.display(),
                        reason,
                        "skipping corrupt backup"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Replace the canonical file with the newest valid backup.
    ///
    /// This is an operator action; the executor never calls it on its own.
    pub fn recover_from_backup(&self, id: &str) -> Result<WorkflowState, StateError> {
        let (n, state) = self
            .latest_valid_backup(id)?
            .ok_or_else(|| StateError::Corrupt {
                path: self.state_path(id),
                reason: "no valid backup to recover from".to_string(),
            })?;
        let backup = self.backup_path(id, n);
        let bytes = fs::read(&backup).map_err(Self::io_err(&backup))?;
        let path = self.state_path(id);
        atomic_write(&path, &bytes).map_err(Self::io_err(&path))?;
        tracing::info!(workflow_id = id, backup = n, "state recovered from backup");
        Ok(state)
    }

    /// Remove the canonical file and all backups.
    pub fn delete(&self, id: &str) -> Result<(), StateError> {
        validate_workflow_id(id)?;
        let canonical = self.state_path(id);
        let mut paths = vec![canonical.clone(), tmp_path_for(&canonical)];
        paths.extend((1..=self.backups).map(|n| self.backup_path(id, n)));
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StateError::Io { path, source: e }),
            }
        }
        Ok(())
    }

    /// Ids of all workflows with a canonical state file, sorted.
    pub fn list(&self) -> Result<Vec<String>, StateError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(Self::io_err(&self.dir))?;
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Take the workflow's lease. Fails with [`StateError::Locked`] if another
    /// executor holds it.
    pub fn acquire_lease(&self, id: &str) -> Result<WorkflowLease, StateError> {
        validate_workflow_id(id)?;
        fs::create_dir_all(&self.dir).map_err(Self::io_err(&self.dir))?;
        let path = self.lock_path(id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(Self::io_err(&path))?;
        if file.try_lock_exclusive().is_err() {
            return Err(StateError::Locked { id: id.to_string() });
        }
        Ok(WorkflowLease {
            id: id.to_string(),
            file,
        })
    }

    /// Whether some executor currently holds the workflow's lease.
    pub fn is_leased(&self, id: &str) -> bool {
        match self.acquire_lease(id) {
            Ok(_lease) => false,
            Err(StateError::Locked { .. }) => true,
            Err(_) => false,
        }
    }
}
