//! Job ledger: one row per asynchronous unit of work, mutated only by the
//! worker executing it (plus an external cancel request). Transitions are
//! monotonic and progress only moves forward; both backends enforce this, the
//! Postgres one with status-guarded UPDATEs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hpt_core::{clamp_percent, JobKind, JobRecord, JobStatus, NewJob, RunCounters};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

use crate::StorageError;

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    pub limit: i64,
    pub offset: i64,
}

impl JobFilter {
    pub fn latest(limit: i64) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, spec: NewJob) -> Result<Uuid, StorageError>;
    async fn mark_running(&self, id: Uuid) -> Result<(), StorageError>;
    /// Progress only moves forward within a run; a stale lower value is kept
    /// out without erroring.
    async fn update_progress(&self, id: Uuid, percent: i32) -> Result<(), StorageError>;
    async fn record_counters(&self, id: Uuid, counters: &RunCounters) -> Result<(), StorageError>;
    async fn complete(&self, id: Uuid, output: JsonValue) -> Result<(), StorageError>;
    async fn fail(&self, id: Uuid, message: &str, detail: Option<&str>)
        -> Result<(), StorageError>;
    async fn cancel(&self, id: Uuid) -> Result<(), StorageError>;
    async fn request_cancel(&self, id: Uuid) -> Result<(), StorageError>;
    async fn cancel_requested(&self, id: Uuid) -> Result<bool, StorageError>;
    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StorageError>;
    async fn list(&self, filter: JobFilter) -> Result<Vec<JobRecord>, StorageError>;
}

/// Handle a worker threads through its run: progress reporting, counters and
/// the cooperative cancellation check at loop boundaries.
#[derive(Clone)]
pub struct JobHandle {
    store: Arc<dyn JobStore>,
    id: Uuid,
}

impl JobHandle {
    pub fn new(store: Arc<dyn JobStore>, id: Uuid) -> Self {
        Self { store, id }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn progress(&self, percent: i32) -> Result<(), StorageError> {
        self.store.update_progress(self.id, percent).await
    }

    pub async fn counters(&self, counters: &RunCounters) -> Result<(), StorageError> {
        self.store.record_counters(self.id, counters).await
    }

    pub async fn cancel_requested(&self) -> Result<bool, StorageError> {
        self.store.cancel_requested(self.id).await
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    kind: String,
    name: String,
    queue: String,
    status: String,
    priority: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    progress_percent: i32,
    input: JsonValue,
    output: JsonValue,
    error_message: Option<String>,
    error_detail: Option<String>,
    records_processed: i64,
    records_created: i64,
    records_updated: i64,
    records_skipped: i64,
    records_failed: i64,
    cron_expression: Option<String>,
    next_run_at: Option<DateTime<Utc>>,
    cancel_requested: bool,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StorageError;

    fn try_from(row: JobRow) -> Result<Self, StorageError> {
        let kind = JobKind::parse(&row.kind)
            .ok_or_else(|| StorageError::Message(format!("unknown job kind {:?}", row.kind)))?;
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| StorageError::Message(format!("unknown job status {:?}", row.status)))?;
        Ok(JobRecord {
            id: row.id,
            kind,
            name: row.name,
            queue: row.queue,
            status,
            priority: row.priority,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            progress_percent: row.progress_percent,
            input: row.input,
            output: row.output,
            error_message: row.error_message,
            error_detail: row.error_detail,
            counters: RunCounters {
                processed: row.records_processed,
                created: row.records_created,
                updated: row.records_updated,
                skipped: row.records_skipped,
                failed: row.records_failed,
            },
            cron_expression: row.cron_expression,
            next_run_at: row.next_run_at,
            cancel_requested: row.cancel_requested,
        })
    }
}

const SELECT_JOB: &str = "SELECT id, kind, name, queue, status, priority, created_at, \
     started_at, completed_at, duration_ms, progress_percent, input, output, error_message, \
     error_detail, records_processed, records_created, records_updated, records_skipped, \
     records_failed, cron_expression, next_run_at, cancel_requested FROM jobs";

#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A guarded UPDATE that touched nothing means either a missing row or a
    /// disallowed transition; tell the two apart for the caller.
    async fn guard_miss(&self, id: Uuid, to: JobStatus) -> StorageError {
        match sqlx::query_scalar::<_, String>("SELECT status FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(_)) => StorageError::InvalidTransition { id, to },
            Ok(None) => StorageError::JobNotFound { id },
            Err(err) => StorageError::Database(err),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, spec: NewJob) -> Result<Uuid, StorageError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO jobs (id, kind, name, queue, status, priority, created_at, \
               progress_percent, input, output, cron_expression, next_run_at, cancel_requested) \
             VALUES ($1, $2, $3, $4, 'pending', $5, NOW(), 0, $6, 'null'::jsonb, $7, $8, FALSE)",
        )
        .bind(id)
        .bind(spec.kind.as_str())
        .bind(&spec.name)
        .bind(&spec.queue)
        .bind(spec.priority)
        .bind(&spec.input)
        .bind(&spec.cron_expression)
        .bind(spec.next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.guard_miss(id, JobStatus::Running).await);
        }
        Ok(())
    }

    async fn update_progress(&self, id: Uuid, percent: i32) -> Result<(), StorageError> {
        let percent = clamp_percent(percent);
        let result = sqlx::query(
            "UPDATE jobs SET progress_percent = GREATEST(progress_percent, $2) \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(percent)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.guard_miss(id, JobStatus::Running).await);
        }
        Ok(())
    }

    async fn record_counters(&self, id: Uuid, counters: &RunCounters) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE jobs SET records_processed = $2, records_created = $3, \
               records_updated = $4, records_skipped = $5, records_failed = $6 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(counters.processed)
        .bind(counters.created)
        .bind(counters.updated)
        .bind(counters.skipped)
        .bind(counters.failed)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.guard_miss(id, JobStatus::Running).await);
        }
        Ok(())
    }

    async fn complete(&self, id: Uuid, output: JsonValue) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = NOW(), \
               duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT, \
               progress_percent = 100, output = $2 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(&output)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.guard_miss(id, JobStatus::Completed).await);
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        message: &str,
        detail: Option<&str>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', completed_at = NOW(), \
               duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT, \
               error_message = $2, error_detail = $3 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(message)
        .bind(detail)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.guard_miss(id, JobStatus::Failed).await);
        }
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', completed_at = NOW(), \
               duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.guard_miss(id, JobStatus::Cancelled).await);
        }
        Ok(())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE jobs SET cancel_requested = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::JobNotFound { id });
        }
        Ok(())
    }

    async fn cancel_requested(&self, id: Uuid) -> Result<bool, StorageError> {
        sqlx::query_scalar::<_, bool>("SELECT cancel_requested FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::JobNotFound { id })
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StorageError> {
        let row = sqlx::query_as::<_, JobRow>(&format!("{SELECT_JOB} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<JobRecord>, StorageError> {
        let limit = if filter.limit <= 0 { 50 } else { filter.limit };
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "{SELECT_JOB} WHERE ($1::TEXT IS NULL OR status = $1) \
               AND ($2::TEXT IS NULL OR kind = $2) \
             ORDER BY created_at DESC LIMIT $3 OFFSET $4"
        ))
        .bind(filter.status.map(JobStatus::as_str))
        .bind(filter.kind.map(JobKind::as_str))
        .bind(limit)
        .bind(filter.offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }
}

#[derive(Debug)]
struct MemoryJob {
    record: JobRecord,
    progress_trace: Vec<i32>,
}

/// In-memory job ledger for tests and local runs. Enforces the same state
/// machine as the Postgres store and additionally records the full progress
/// sequence per job.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, MemoryJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every progress value a job ever reported, in order.
    pub fn progress_trace(&self, id: Uuid) -> Vec<i32> {
        self.jobs
            .lock()
            .expect("lock poisoned")
            .get(&id)
            .map(|j| j.progress_trace.clone())
            .unwrap_or_default()
    }

    fn terminal(
        &self,
        id: Uuid,
        to: JobStatus,
        apply: impl FnOnce(&mut JobRecord),
    ) -> Result<(), StorageError> {
        let mut jobs = self.jobs.lock().expect("lock poisoned");
        let job = jobs.get_mut(&id).ok_or(StorageError::JobNotFound { id })?;
        if !job.record.status.can_transition_to(to) {
            return Err(StorageError::InvalidTransition { id, to });
        }
        let now = Utc::now();
        job.record.status = to;
        // completed_at is set exactly once, on the terminal transition.
        job.record.completed_at = Some(now);
        job.record.duration_ms = job
            .record
            .started_at
            .map(|started| (now - started).num_milliseconds());
        apply(&mut job.record);
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, spec: NewJob) -> Result<Uuid, StorageError> {
        let id = Uuid::new_v4();
        let record = JobRecord {
            id,
            kind: spec.kind,
            name: spec.name,
            queue: spec.queue,
            status: JobStatus::Pending,
            priority: spec.priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            progress_percent: 0,
            input: spec.input,
            output: JsonValue::Null,
            error_message: None,
            error_detail: None,
            counters: RunCounters::default(),
            cron_expression: spec.cron_expression,
            next_run_at: spec.next_run_at,
            cancel_requested: false,
        };
        self.jobs.lock().expect("lock poisoned").insert(
            id,
            MemoryJob {
                record,
                progress_trace: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), StorageError> {
        let mut jobs = self.jobs.lock().expect("lock poisoned");
        let job = jobs.get_mut(&id).ok_or(StorageError::JobNotFound { id })?;
        if !job.record.status.can_transition_to(JobStatus::Running) {
            return Err(StorageError::InvalidTransition {
                id,
                to: JobStatus::Running,
            });
        }
        job.record.status = JobStatus::Running;
        job.record.started_at = Some(Utc::now());
        Ok(())
    }

    async fn update_progress(&self, id: Uuid, percent: i32) -> Result<(), StorageError> {
        let mut jobs = self.jobs.lock().expect("lock poisoned");
        let job = jobs.get_mut(&id).ok_or(StorageError::JobNotFound { id })?;
        if job.record.status != JobStatus::Running {
            return Err(StorageError::InvalidTransition {
                id,
                to: JobStatus::Running,
            });
        }
        let percent = clamp_percent(percent).max(job.record.progress_percent);
        job.record.progress_percent = percent;
        job.progress_trace.push(percent);
        Ok(())
    }

    async fn record_counters(&self, id: Uuid, counters: &RunCounters) -> Result<(), StorageError> {
        let mut jobs = self.jobs.lock().expect("lock poisoned");
        let job = jobs.get_mut(&id).ok_or(StorageError::JobNotFound { id })?;
        if job.record.status != JobStatus::Running {
            return Err(StorageError::InvalidTransition {
                id,
                to: JobStatus::Running,
            });
        }
        job.record.counters = *counters;
        Ok(())
    }

    async fn complete(&self, id: Uuid, output: JsonValue) -> Result<(), StorageError> {
        self.terminal(id, JobStatus::Completed, |record| {
            record.progress_percent = 100;
            record.output = output;
        })
    }

    async fn fail(
        &self,
        id: Uuid,
        message: &str,
        detail: Option<&str>,
    ) -> Result<(), StorageError> {
        let message = message.to_string();
        let detail = detail.map(str::to_string);
        self.terminal(id, JobStatus::Failed, move |record| {
            record.error_message = Some(message);
            record.error_detail = detail;
        })
    }

    async fn cancel(&self, id: Uuid) -> Result<(), StorageError> {
        self.terminal(id, JobStatus::Cancelled, |_| {})
    }

    async fn request_cancel(&self, id: Uuid) -> Result<(), StorageError> {
        let mut jobs = self.jobs.lock().expect("lock poisoned");
        let job = jobs.get_mut(&id).ok_or(StorageError::JobNotFound { id })?;
        job.record.cancel_requested = true;
        Ok(())
    }

    async fn cancel_requested(&self, id: Uuid) -> Result<bool, StorageError> {
        let jobs = self.jobs.lock().expect("lock poisoned");
        jobs.get(&id)
            .map(|j| j.record.cancel_requested)
            .ok_or(StorageError::JobNotFound { id })
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StorageError> {
        let jobs = self.jobs.lock().expect("lock poisoned");
        Ok(jobs.get(&id).map(|j| j.record.clone()))
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<JobRecord>, StorageError> {
        let jobs = self.jobs.lock().expect("lock poisoned");
        let mut records: Vec<JobRecord> = jobs
            .values()
            .map(|j| j.record.clone())
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| filter.kind.map_or(true, |k| r.kind == k))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let limit = if filter.limit <= 0 { 50 } else { filter.limit } as usize;
        Ok(records
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> NewJob {
        NewJob::new(JobKind::Scan, "registry scan", "scans")
    }

    #[tokio::test]
    async fn lifecycle_pending_running_completed() {
        let store = MemoryJobStore::new();
        let id = store.create(spec()).await.unwrap();

        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );

        store.mark_running(id).await.unwrap();
        store.update_progress(id, 40).await.unwrap();
        store.complete(id, json!({"ok": true})).await.unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress_percent, 100);
        assert!(record.completed_at.is_some());
        assert!(record.duration_ms.is_some());
        assert_eq!(record.output, json!({"ok": true}));
    }

    #[tokio::test]
    async fn running_cannot_be_reentered() {
        let store = MemoryJobStore::new();
        let id = store.create(spec()).await.unwrap();
        store.mark_running(id).await.unwrap();
        store.complete(id, JsonValue::Null).await.unwrap();

        let err = store.mark_running(id).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn pending_cannot_jump_to_terminal() {
        let store = MemoryJobStore::new();
        let id = store.create(spec()).await.unwrap();
        let err = store.complete(id, JsonValue::Null).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn progress_never_regresses() {
        let store = MemoryJobStore::new();
        let id = store.create(spec()).await.unwrap();
        store.mark_running(id).await.unwrap();

        store.update_progress(id, 30).await.unwrap();
        store.update_progress(id, 10).await.unwrap();
        store.update_progress(id, 150).await.unwrap();

        let trace = store.progress_trace(id);
        assert_eq!(trace, vec![30, 30, 100]);
        assert!(trace.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn failure_captures_message_and_detail() {
        let store = MemoryJobStore::new();
        let id = store.create(spec()).await.unwrap();
        store.mark_running(id).await.unwrap();
        store
            .fail(id, "registry unreachable", Some("connect timeout"))
            .await
            .unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("registry unreachable"));
        assert_eq!(record.error_detail.as_deref(), Some("connect timeout"));
    }

    #[tokio::test]
    async fn cancellation_is_cooperative() {
        let store = MemoryJobStore::new();
        let id = store.create(spec()).await.unwrap();
        store.mark_running(id).await.unwrap();

        assert!(!store.cancel_requested(id).await.unwrap());
        store.request_cancel(id).await.unwrap();
        assert!(store.cancel_requested(id).await.unwrap());

        store.cancel(id).await.unwrap();
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn list_filters_by_status_and_kind() {
        let store = MemoryJobStore::new();
        let scan = store.create(spec()).await.unwrap();
        let refresh = store
            .create(NewJob::new(JobKind::MetricsRefresh, "refresh", "analytics"))
            .await
            .unwrap();
        store.mark_running(scan).await.unwrap();

        let running = store
            .list(JobFilter {
                status: Some(JobStatus::Running),
                ..JobFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, scan);

        let refreshes = store
            .list(JobFilter {
                kind: Some(JobKind::MetricsRefresh),
                ..JobFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(refreshes.len(), 1);
        assert_eq!(refreshes[0].id, refresh);
    }
}
