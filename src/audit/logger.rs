use super::DecisionAuditTrail;
use crate::decision::Decision;
use crate::orchestrator::store::validate_workflow_id;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

enum Backend {
    Dir(PathBuf),
    Memory(HashMap<String, Vec<Decision>>),
}

/// Writes and reads per-workflow decision trails.
pub struct AuditLogger {
    backend: Mutex<Backend>,
}

impl AuditLogger {
    /// A logger writing JSONL files into `decisions_dir`.
    pub fn new(decisions_dir: &Path) -> Self {
        Self {
            backend: Mutex::new(Backend::Dir(decisions_dir.to_path_buf())),
        }
    }

    /// A logger that keeps trails in memory only.
    pub fn ephemeral() -> Self {
        Self {
            backend: Mutex::new(Backend::Memory(HashMap::new())),
        }
    }

    pub fn trail_path(decisions_dir: &Path, workflow_id: &str) -> PathBuf {
        decisions_dir.join(format!("{}.jsonl", workflow_id))
    }

    /// Append one decision to the workflow's trail.
    pub fn append(&self, workflow_id: &str, decision: &Decision) -> Result<()> {
        validate_workflow_id(workflow_id)?;
        let mut backend = self
            .backend
            .lock()
            .map_err(|_| anyhow::anyhow!("audit logger lock poisoned"))?;
        match &mut *backend {
            Backend::Memory(trails) => {
                trails
                    .entry(workflow_id.to_string())
                    .or_default()
                    .push(decision.clone());
            }
            Backend::Dir(dir) => {
                fs::create_dir_all(&*dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
                let path = Self::trail_path(dir, workflow_id);
                let mut file = OpenOptions::new()
                    .create(true)
                    .read(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                let mut line = String::new();
                if ends_mid_line(&mut file)
                    .with_context(|| format!("Failed to read {}", path.display()))?
                {
                    // Terminate a line torn by a crash mid-append.
                    line.push('\n');
                }
                line.push_str(
                    &serde_json::to_string(decision).context("Failed to serialize decision")?,
                );
                line.push('\n');
                file.write_all(line.as_bytes())
                    .with_context(|| format!("Failed to append to {}", path.display()))?;
                file.sync_data()
                    .with_context(|| format!("Failed to sync {}", path.display()))?;
            }
        }
        tracing::debug!(
            workflow_id,
            source = %decision.source,
            confidence = decision.confidence,
            "decision recorded"
        );
        Ok(())
    }

    /// Load the workflow's trail. A workflow with no decisions has an empty trail.
    ///
    /// A torn final line (a crash mid-append) is skipped with a warning.
    pub fn trail(&self, workflow_id: &str) -> Result<DecisionAuditTrail> {
        validate_workflow_id(workflow_id)?;
        let backend = self
            .backend
            .lock()
            .map_err(|_| anyhow::anyhow!("audit logger lock poisoned"))?;
        let mut trail = DecisionAuditTrail::new(workflow_id);
        match &*backend {
            Backend::Memory(trails) => {
                if let Some(decisions) = trails.get(workflow_id) {
                    trail.decisions = decisions.clone();
                }
            }
            Backend::Dir(dir) => {
                let path = Self::trail_path(dir, workflow_id);
                if !path.exists() {
                    return Ok(trail);
                }
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                for (line_no, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Decision>(line) {
                        Ok(decision) => trail.decisions.push(decision),
                        Err(e) => tracing::warn!(
                            workflow_id,
                            line = line_no + 1,
                            error = %e,
                            "skipping unreadable audit record"
                        ),
                    }
                }
            }
        }
        Ok(trail)
    }

    /// Workflow ids with at least one recorded decision, sorted.
    pub fn list_workflows(&self) -> Result<Vec<String>> {
        let backend = self
            .backend
            .lock()
            .map_err(|_| anyhow::anyhow!("audit logger lock poisoned"))?;
        let mut ids: Vec<String> = match &*backend {
            Backend::Memory(trails) => trails.keys().cloned().collect(),
            Backend::Dir(dir) => {
                if !dir.exists() {
                    return Ok(Vec::new());
                }
                fs::read_dir(dir)?
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().map(|e| e == "jsonl").unwrap_or(false))
                    .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
                    .filter(|id| validate_workflow_id(id).is_ok())
                    .collect()
            }
        };
        ids.sort();
        Ok(ids)
    }
}

/// Whether the file is non-empty and its last byte is not a newline.
fn ends_mid_line(file: &mut fs::File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DecisionSource;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup_logger() -> (AuditLogger, TempDir) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let logger = AuditLogger::new(&dir.path().join("decisions"));
        (logger, dir)
    }

    fn decision(question: &str, confidence: f64) -> Decision {
        Decision::new(
            question,
            DecisionSource::AgentReasoning,
            json!("answer"),
            confidence,
            "because",
        )
    }

    #[test]
    fn test_missing_trail_is_empty() {
        let (logger, _dir) = setup_logger();
        let trail = logger.trail("wf-none").unwrap();
        assert!(trail.is_empty());
        assert_eq!(trail.workflow_id, "wf-none");
    }

    #[test]
    fn test_append_persists_in_order() {
        let (logger, dir) = setup_logger();
        logger.append("wf-1", &decision("first", 0.9)).unwrap();
        logger.append("wf-1", &decision("second", 0.4)).unwrap();

        let reopened = AuditLogger::new(&dir.path().join("decisions"));
        let trail = reopened.trail("wf-1").unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail.decisions[0].question, "first");
        assert_eq!(trail.decisions[1].question, "second");
    }

    #[test]
    fn test_append_never_rewrites_earlier_lines() {
        let (logger, dir) = setup_logger();
        logger.append("wf-1", &decision("first", 0.9)).unwrap();
        let path = AuditLogger::trail_path(&dir.path().join("decisions"), "wf-1");
        let before = fs::read_to_string(&path).unwrap();

        logger.append("wf-1", &decision("second", 0.8)).unwrap();
        let after = fs::read_to_string(&path).unwrap();
        assert!(after.starts_with(&before));
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let (logger, dir) = setup_logger();
        logger.append("wf-1", &decision("first", 0.9)).unwrap();
        let path = AuditLogger::trail_path(&dir.path().join("decisions"), "wf-1");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"question\": \"trunc").unwrap();

        let trail = logger.trail("wf-1").unwrap();
        assert_eq!(trail.len(), 1);
    }

    #[test]
    fn test_append_after_torn_line_is_kept() {
        let (logger, dir) = setup_logger();
        logger.append("wf-1", &decision("q1", 0.9)).unwrap();
        let path = AuditLogger::trail_path(&dir.path().join("decisions"), "wf-1");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"question\":\"q2\",\"sou").unwrap();

        logger.append("wf-1", &decision("q3", 0.8)).unwrap();
        let trail = logger.trail("wf-1").unwrap();
        let questions: Vec<_> = trail.decisions.iter().map(|d| d.question.as_str()).collect();
        assert_eq!(questions, vec!["q1", "q3"]);
    }

    #[test]
    fn test_invalid_workflow_id_is_rejected() {
        let (logger, dir) = setup_logger();
        assert!(logger.append("../escape", &decision("q", 0.9)).is_err());
        assert!(logger.trail("a/b").is_err());
        assert!(!dir.path().join("escape.jsonl").exists());
        assert!(AuditLogger::ephemeral().append("", &decision("q", 0.9)).is_err());
    }

    #[test]
    fn test_trails_are_per_workflow() {
        let (logger, _dir) = setup_logger();
        logger.append("wf-a", &decision("a", 0.9)).unwrap();
        logger.append("wf-b", &decision("b", 0.9)).unwrap();

        assert_eq!(logger.trail("wf-a").unwrap().len(), 1);
        assert_eq!(logger.list_workflows().unwrap(), vec!["wf-a", "wf-b"]);
    }

    #[test]
    fn test_ephemeral_logger() {
        let logger = AuditLogger::ephemeral();
        logger.append("wf-1", &decision("q", 0.5)).unwrap();
        assert_eq!(logger.trail("wf-1").unwrap().len(), 1);
        assert_eq!(logger.list_workflows().unwrap(), vec!["wf-1"]);
    }
}
