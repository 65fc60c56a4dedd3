use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use waypoint_common::{EventSink, WorkflowEvent};

use super::{EscalationFilter, EscalationMetrics, EscalationRecord};
use crate::errors::EscalationError;
use crate::util::atomic_write;

/// Default interval at which waiters re-read the durable record.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// File-backed escalation queue, shared by every workflow in the process.
pub struct EscalationQueue {
    dir: PathBuf,
    poll_interval: Duration,
    events: EventSink,
    record_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    resolved: Notify,
}

/// Holds the cross-process lock on one record file. Released on drop.
struct RecordFileLock(File);

impl Drop for RecordFileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

impl EscalationQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            events: EventSink::disabled(),
            record_locks: Mutex::new(HashMap::new()),
            resolved: Notify::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", id))
    }

    fn io_err(path: &Path) -> impl FnOnce(io::Error) -> EscalationError + '_ {
        move |source| EscalationError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn is_valid_id(id: &str) -> bool {
        !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    }

    fn record_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.record_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    fn release_record_lock(&self, id: &str) {
        self.record_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    #[cfg(test)]
    fn tracked_record_locks(&self) -> usize {
        self.record_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Claim a fresh id by creating its lock file. Lock files are never
    /// removed, so an existing one means the id is taken.
    fn reserve_id(&self) -> Result<String, EscalationError> {
        loop {
            let id = super::new_escalation_id();
            let path = self.lock_path(&id);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) if self.record_path(&id).exists() => continue,
                Ok(_) => return Ok(id),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(Self::io_err(&path)(e)),
            }
        }
    }

    /// Take the cross-process lock on a record. `lock_exclusive` blocks, so it
    /// runs on the blocking pool.
    async fn lock_record_file(&self, id: &str) -> Result<RecordFileLock, EscalationError> {
        let path = self.lock_path(id);
        let lock_path = path.clone();
        let locked = tokio::task::spawn_blocking(move || -> io::Result<RecordFileLock> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(RecordFileLock(file))
        })
        .await
        .map_err(|e| Self::io_err(&path)(io::Error::other(e)))?;
        locked.map_err(Self::io_err(&path))
    }

    fn write_record(&self, record: &EscalationRecord) -> Result<(), EscalationError> {
        let path = self.record_path(&record.id);
        let bytes = serde_json::to_vec_pretty(record).map_err(|e| EscalationError::Corrupt {
            path: path.clone(),
            reason: format!("failed to serialize record: {}", e),
        })?;
        atomic_write(&path, &bytes).map_err(Self::io_err(&path))
    }

    fn read_record(path: &Path) -> Result<EscalationRecord, EscalationError> {
        let bytes = fs::read(path).map_err(Self::io_err(path))?;
        serde_json::from_slice(&bytes).map_err(|e| EscalationError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// File a new pending escalation.
    pub async fn add(
        &self,
        workflow_id: &str,
        step_index: usize,
        question: &str,
        context: serde_json::Value,
    ) -> Result<EscalationRecord, EscalationError> {
        fs::create_dir_all(&self.dir).map_err(Self::io_err(&self.dir))?;

        let mut record = EscalationRecord::new(workflow_id, step_index, question, context);
        record.id = self.reserve_id()?;
        let _file_lock = self.lock_record_file(&record.id).await?;
        self.write_record(&record)?;

        tracing::info!(
            escalation_id = %record.id,
            workflow_id,
            step_index,
            question,
            "escalation created"
        );
        self.events.emit(WorkflowEvent::EscalationCreated {
            id: record.id.clone(),
            workflow_id: workflow_id.to_string(),
            step_index,
        });
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<EscalationRecord, EscalationError> {
        let not_found = || EscalationError::NotFound { id: id.to_string() };
        if !Self::is_valid_id(id) {
            return Err(not_found());
        }
        let path = self.record_path(id);
        match Self::read_record(&path) {
            Err(EscalationError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Err(not_found())
            }
            other => other,
        }
    }

    /// Records matching `filter`, oldest first. Unreadable files are skipped
    /// with a warning.
    pub fn list(&self, filter: &EscalationFilter) -> Result<Vec<EscalationRecord>, EscalationError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(Self::io_err(&self.dir))?;
        let mut records = Vec::new();
        for path in entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
        {
            match Self::read_record(&path) {
                Ok(record) if filter.matches(&record) => records.push(record),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping escalation record")
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Resolve a pending escalation with a human response.
    pub async fn respond(
        &self,
        id: &str,
        response: &str,
    ) -> Result<EscalationRecord, EscalationError> {
        self.get(id)?;
        let lock = self.record_lock(id);
        let result = {
            let _guard = lock.lock().await;
            self.resolve_locked(id, response).await
        };
        // The file lock still serializes any later caller.
        self.release_record_lock(id);
        result
    }

    async fn resolve_locked(
        &self,
        id: &str,
        response: &str,
    ) -> Result<EscalationRecord, EscalationError> {
        let _file_lock = self.lock_record_file(id).await?;
        // Read under the file lock; another process may have answered first.
        let mut record = self.get(id)?;
        if record.is_resolved() {
            return Err(EscalationError::AlreadyResolved { id: id.to_string() });
        }
        record.resolve(response);
        self.write_record(&record)?;

        tracing::info!(
            escalation_id = id,
            workflow_id = %record.workflow_id,
            "escalation resolved"
        );
        self.events.emit(WorkflowEvent::EscalationResolved {
            id: id.to_string(),
            workflow_id: record.workflow_id.clone(),
        });
        self.resolved.notify_waiters();
        Ok(record)
    }

    pub fn metrics(&self) -> Result<EscalationMetrics, EscalationError> {
        let records = self.list(&EscalationFilter::all())?;
        Ok(EscalationMetrics::from_records(&records))
    }

    /// Wait until the escalation is resolved and return the resolved record.
    ///
    /// Wakes on an in-process [`respond`](Self::respond) and otherwise re-reads
    /// the record every poll interval. There is no timeout; cancel `cancel` to
    /// stop waiting.
    pub async fn wait_for_resolution(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<EscalationRecord, EscalationError> {
        loop {
            let notified = self.resolved.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let record = self.get(id)?;
            if record.is_resolved() {
                return Ok(record);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {
                    return Err(EscalationError::Cancelled { id: id.to_string() });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::EscalationStatus;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup_queue() -> (EscalationQueue, TempDir) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let queue = EscalationQueue::new(dir.path().join("escalations"))
            .with_poll_interval(Duration::from_millis(20));
        (queue, dir)
    }

    #[tokio::test]
    async fn test_add_persists_pending_record() {
        let (queue, dir) = setup_queue();
        let record = queue.add("wf-1", 1, "Which database?", json!({"scale": 10})).await.unwrap();

        let reopened = EscalationQueue::new(dir.path().join("escalations"));
        let loaded = reopened.get(&record.id).unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.status, EscalationStatus::Pending);
    }

    #[tokio::test]
    async fn test_add_emits_event() {
        let dir = TempDir::new().unwrap();
        let (sink, mut rx) = EventSink::channel();
        let queue = EscalationQueue::new(dir.path()).with_events(sink);
        let record = queue.add("wf", 0, "q", json!(null)).await.unwrap();
        match rx.try_recv().unwrap() {
            WorkflowEvent::EscalationCreated { id, .. } => assert_eq!(id, record.id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let (queue, _dir) = setup_queue();
        assert!(matches!(
            queue.get("esc-00000000").unwrap_err(),
            EscalationError::NotFound { .. }
        ));
        assert!(matches!(
            queue.get("../etc/passwd").unwrap_err(),
            EscalationError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_respond_resolves_once() {
        let (queue, _dir) = setup_queue();
        let record = queue.add("wf", 1, "q", json!(null)).await.unwrap();

        let resolved = queue.respond(&record.id, "postgres").await.unwrap();
        assert!(resolved.is_resolved());
        assert_eq!(resolved.response.as_deref(), Some("postgres"));
        assert!(resolved.resolved_at.is_some());

        let err = queue.respond(&record.id, "mysql").await.unwrap_err();
        assert!(matches!(err, EscalationError::AlreadyResolved { .. }));
        assert_eq!(
            queue.get(&record.id).unwrap().response.as_deref(),
            Some("postgres")
        );
    }

    #[tokio::test]
    async fn test_respond_unknown_is_not_found() {
        let (queue, _dir) = setup_queue();
        let err = queue.respond("esc-deadbeef", "x").await.unwrap_err();
        assert!(matches!(err, EscalationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_record_locks_do_not_accumulate() {
        let (queue, _dir) = setup_queue();
        let record = queue.add("wf", 0, "q", json!(null)).await.unwrap();
        assert_eq!(queue.tracked_record_locks(), 0);

        queue.respond("esc-deadbeef", "x").await.unwrap_err();
        queue.respond("../../tmp/x", "x").await.unwrap_err();
        assert_eq!(queue.tracked_record_locks(), 0);

        queue.respond(&record.id, "ok").await.unwrap();
        queue.respond(&record.id, "again").await.unwrap_err();
        assert_eq!(queue.tracked_record_locks(), 0);
    }

    #[tokio::test]
    async fn test_add_never_reuses_an_id() {
        let (queue, _dir) = setup_queue();
        let mut ids = std::collections::HashSet::new();
        for i in 0..20 {
            let record = queue.add("wf", i, "q", json!(null)).await.unwrap();
            assert!(queue.lock_path(&record.id).exists());
            assert!(ids.insert(record.id));
        }
        assert_eq!(queue.list(&EscalationFilter::all()).unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_concurrent_responses_resolve_exactly_once() {
        let (queue, _dir) = setup_queue();
        let queue = Arc::new(queue);
        let record = queue.add("wf", 0, "q", json!(null)).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let queue = Arc::clone(&queue);
                let id = record.id.clone();
                tokio::spawn(async move { queue.respond(&id, &format!("answer-{i}")).await })
            })
            .collect();
        let results = futures::future::join_all(handles).await;
        let successes = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let (queue, _dir) = setup_queue();
        let first = queue.add("wf-a", 0, "q1", json!(null)).await.unwrap();
        let second = queue.add("wf-b", 1, "q2", json!(null)).await.unwrap();
        let third = queue.add("wf-a", 2, "q3", json!(null)).await.unwrap();
        queue.respond(&second.id, "done").await.unwrap();

        let all = queue.list(&EscalationFilter::all()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, first.id);

        let pending = queue.list(&EscalationFilter::pending()).unwrap();
        assert_eq!(pending.len(), 2);

        let wf_a = queue
            .list(&EscalationFilter::all().for_workflow("wf-a"))
            .unwrap();
        let ids: Vec<_> = wf_a.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&first.id.as_str()));
        assert!(ids.contains(&third.id.as_str()));
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_files() {
        let (queue, _dir) = setup_queue();
        queue.add("wf", 0, "q", json!(null)).await.unwrap();
        fs::write(queue.dir().join("esc-broken0.json"), b"{not json").unwrap();
        assert_eq!(queue.list(&EscalationFilter::all()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_metrics_counts() {
        let (queue, _dir) = setup_queue();
        let a = queue.add("wf", 0, "q", json!(null)).await.unwrap();
        queue.add("wf", 1, "q", json!(null)).await.unwrap();
        queue.respond(&a.id, "ok").await.unwrap();

        let metrics = queue.metrics().unwrap();
        assert_eq!(metrics.pending_count, 1);
        assert_eq!(metrics.resolved_count, 1);
        assert!(metrics.avg_resolution_time_ms.is_some());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_in_process_respond() {
        let (queue, _dir) = setup_queue();
        let queue = Arc::new(queue.with_poll_interval(Duration::from_secs(60)));
        let record = queue.add("wf", 0, "q", json!(null)).await.unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            let id = record.id.clone();
            tokio::spawn(async move {
                queue
                    .wait_for_resolution(&id, &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.respond(&record.id, "go").await.unwrap();

        let resolved = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should wake")
            .unwrap()
            .unwrap();
        assert_eq!(resolved.response.as_deref(), Some("go"));
    }

    #[tokio::test]
    async fn test_wait_sees_out_of_process_respond_by_polling() {
        let (queue, dir) = setup_queue();
        let record = queue.add("wf", 0, "q", json!(null)).await.unwrap();

        // A second queue over the same directory stands in for another process.
        let other = EscalationQueue::new(dir.path().join("escalations"));
        let id = record.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            other.respond(&id, "from cli").await.unwrap();
        });

        let resolved = tokio::time::timeout(
            Duration::from_secs(5),
            queue.wait_for_resolution(&record.id, &CancellationToken::new()),
        )
        .await
        .expect("poll should observe resolution")
        .unwrap();
        assert_eq!(resolved.response.as_deref(), Some("from cli"));
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let (queue, _dir) = setup_queue();
        let record = queue.add("wf", 0, "q", json!(null)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = queue
            .wait_for_resolution(&record.id, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EscalationError::Cancelled { .. }));
    }
}
