//! Ingestion queue: durable, priority-ordered, retrying hand-off between the
//! scanner and the download workers.
//!
//! Delivery is at-least-once; consumers stay idempotent (the artifact store
//! is content-hash addressed, so re-processing a file is a no-op). Items are
//! serviced in priority order with FIFO tie-break by enqueue sequence. A
//! failed attempt backs off exponentially; an exhausted item is marked failed
//! and stays inspectable rather than being dropped. Finished items are kept
//! up to a bounded count, oldest pruned first.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hpt_core::{JobKind, NewJob, WorkItem};
use hpt_storage::{ArtifactStore, HttpFetcher, JobStore};
use serde_json::json;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hpt-queue";

/// Newly discovered files are serviced ahead of refreshes of known ones.
pub const NEW_FILE_PRIORITY: i32 = 10;
pub const REFRESH_FILE_PRIORITY: i32 = 5;

/// Upper bound on the exponential retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("queue payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("queue item {id} not found or not active")]
    NotActive { id: Uuid },
}

#[derive(Debug, Clone, Copy)]
pub struct EnqueueOptions {
    pub priority: i32,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: REFRESH_FILE_PRIORITY,
            max_attempts: 3,
            backoff_base: Duration::from_secs(30),
        }
    }
}

impl EnqueueOptions {
    /// Standard options for a scanner-discovered item: priority follows the
    /// `is_new` flag.
    pub fn for_item(item: &WorkItem) -> Self {
        Self {
            priority: if item.is_new {
                NEW_FILE_PRIORITY
            } else {
                REFRESH_FILE_PRIORITY
            },
            ..Self::default()
        }
    }
}

/// How many finished items each queue keeps around for operability.
#[derive(Debug, Clone, Copy)]
pub struct RetentionLimits {
    pub completed: i64,
    pub failed: i64,
}

impl Default for RetentionLimits {
    fn default() -> Self {
        Self {
            completed: 500,
            failed: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClaimedItem {
    pub id: Uuid,
    pub item: WorkItem,
    /// 1-based attempt number this claim represents.
    pub attempt: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Exhausted,
}

/// Backoff after `failed_attempts` failures (1-based): doubling from `base`,
/// capped, until attempts are exhausted.
pub fn retry_decision(failed_attempts: u32, max_attempts: u32, base: Duration) -> RetryDecision {
    if failed_attempts >= max_attempts {
        return RetryDecision::Exhausted;
    }
    let exponent = failed_attempts.saturating_sub(1).min(16);
    let delay = base
        .saturating_mul(1u32 << exponent)
        .min(MAX_RETRY_DELAY);
    RetryDecision::Retry { delay }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait IngestQueue: Send + Sync {
    async fn enqueue(&self, item: &WorkItem, opts: EnqueueOptions) -> Result<Uuid, QueueError>;

    /// Claim the highest-priority eligible item, marking it active and
    /// counting the attempt.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<ClaimedItem>, QueueError>;

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), QueueError>;

    /// Record a failed attempt; schedules a retry or marks the item failed.
    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, QueueError>;

    /// Trim finished items beyond the retention limits, oldest first.
    async fn prune_finished(&self, limits: RetentionLimits) -> Result<u64, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}

const STATE_PENDING: &str = "pending";
const STATE_ACTIVE: &str = "active";
const STATE_COMPLETED: &str = "completed";
const STATE_FAILED: &str = "failed";

#[derive(Debug, Clone)]
pub struct PgIngestQueue {
    pool: PgPool,
}

impl PgIngestQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IngestQueue for PgIngestQueue {
    async fn enqueue(&self, item: &WorkItem, opts: EnqueueOptions) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO ingest_queue \
               (id, payload, priority, state, attempts, max_attempts, backoff_base_ms, \
                enqueued_at) \
             VALUES ($1, $2, $3, 'pending', 0, $4, $5, NOW())",
        )
        .bind(id)
        .bind(serde_json::to_value(item)?)
        .bind(opts.priority)
        .bind(opts.max_attempts as i32)
        .bind(opts.backoff_base.as_millis() as i64)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<ClaimedItem>, QueueError> {
        let row = sqlx::query_as::<_, (Uuid, serde_json::Value, i32, i32)>(
            "WITH next AS ( \
               SELECT id FROM ingest_queue \
               WHERE state = 'pending' AND (retry_after IS NULL OR retry_after <= $1) \
               ORDER BY priority DESC, seq ASC \
               LIMIT 1 \
               FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE ingest_queue q \
             SET state = 'active', started_at = $1, attempts = q.attempts + 1 \
             FROM next WHERE q.id = next.id \
             RETURNING q.id, q.payload, q.attempts, q.max_attempts",
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some((id, payload, attempts, max_attempts)) => Ok(Some(ClaimedItem {
                id,
                item: serde_json::from_value(payload)?,
                attempt: attempts.max(1) as u32,
                max_attempts: max_attempts.max(1) as u32,
            })),
        }
    }

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE ingest_queue SET state = 'completed', finished_at = $2 \
             WHERE id = $1 AND state = 'active'",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotActive { id });
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, QueueError> {
        let row = sqlx::query_as::<_, (i32, i32, i64)>(
            "SELECT attempts, max_attempts, backoff_base_ms FROM ingest_queue \
             WHERE id = $1 AND state = 'active'",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::NotActive { id })?;

        let (attempts, max_attempts, backoff_base_ms) = row;
        let decision = retry_decision(
            attempts.max(0) as u32,
            max_attempts.max(1) as u32,
            Duration::from_millis(backoff_base_ms.max(0) as u64),
        );

        match decision {
            RetryDecision::Retry { delay } => {
                sqlx::query(
                    "UPDATE ingest_queue SET state = 'pending', retry_after = $2, \
                       last_error = $3 \
                     WHERE id = $1",
                )
                .bind(id)
                .bind(now + chrono::Duration::from_std(delay).unwrap_or_default())
                .bind(error)
                .execute(&self.pool)
                .await?;
            }
            RetryDecision::Exhausted => {
                sqlx::query(
                    "UPDATE ingest_queue SET state = 'failed', finished_at = $2, \
                       last_error = $3 \
                     WHERE id = $1",
                )
                .bind(id)
                .bind(now)
                .bind(error)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(decision)
    }

    async fn prune_finished(&self, limits: RetentionLimits) -> Result<u64, QueueError> {
        let mut pruned = 0u64;
        for (state, keep) in [
            (STATE_COMPLETED, limits.completed),
            (STATE_FAILED, limits.failed),
        ] {
            let result = sqlx::query(
                "DELETE FROM ingest_queue WHERE state = $1 AND seq NOT IN ( \
                   SELECT seq FROM ingest_queue WHERE state = $1 \
                   ORDER BY seq DESC LIMIT $2)",
            )
            .bind(state)
            .bind(keep.max(0))
            .execute(&self.pool)
            .await?;
            pruned += result.rows_affected();
        }
        Ok(pruned)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT state, COUNT(*) FROM ingest_queue GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut counts = QueueCounts::default();
        for (state, n) in rows {
            let n = n.max(0) as u64;
            match state.as_str() {
                STATE_PENDING => counts.pending = n,
                STATE_ACTIVE => counts.active = n,
                STATE_COMPLETED => counts.completed = n,
                STATE_FAILED => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }
}

#[derive(Debug)]
struct MemoryEntry {
    id: Uuid,
    seq: u64,
    item: WorkItem,
    priority: i32,
    state: &'static str,
    attempts: u32,
    max_attempts: u32,
    backoff_base: Duration,
    retry_after: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// In-memory queue with the same ordering, retry and retention semantics as
/// the Postgres backend.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    entries: Mutex<Vec<MemoryEntry>>,
    next_seq: Mutex<u64>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items enqueued so far, for test assertions.
    pub fn enqueued_items(&self) -> Vec<WorkItem> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|e| e.item.clone())
            .collect()
    }

    pub fn last_error(&self, id: Uuid) -> Option<String> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .iter()
            .find(|e| e.id == id)
            .and_then(|e| e.last_error.clone())
    }
}

#[async_trait]
impl IngestQueue for MemoryQueue {
    async fn enqueue(&self, item: &WorkItem, opts: EnqueueOptions) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        let seq = {
            let mut next = self.next_seq.lock().expect("lock poisoned");
            *next += 1;
            *next
        };
        self.entries.lock().expect("lock poisoned").push(MemoryEntry {
            id,
            seq,
            item: item.clone(),
            priority: opts.priority,
            state: STATE_PENDING,
            attempts: 0,
            max_attempts: opts.max_attempts.max(1),
            backoff_base: opts.backoff_base,
            retry_after: None,
            last_error: None,
        });
        Ok(id)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<ClaimedItem>, QueueError> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let best = entries
            .iter_mut()
            .filter(|e| e.state == STATE_PENDING && e.retry_after.map_or(true, |t| t <= now))
            .max_by_key(|e| (e.priority, std::cmp::Reverse(e.seq)));

        Ok(best.map(|entry| {
            entry.state = STATE_ACTIVE;
            entry.attempts += 1;
            ClaimedItem {
                id: entry.id,
                item: entry.item.clone(),
                attempt: entry.attempts,
                max_attempts: entry.max_attempts,
            }
        }))
    }

    async fn complete(&self, id: Uuid, _now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id && e.state == STATE_ACTIVE)
            .ok_or(QueueError::NotActive { id })?;
        entry.state = STATE_COMPLETED;
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, QueueError> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id && e.state == STATE_ACTIVE)
            .ok_or(QueueError::NotActive { id })?;

        entry.last_error = Some(error.to_string());
        let decision = retry_decision(entry.attempts, entry.max_attempts, entry.backoff_base);
        match decision {
            RetryDecision::Retry { delay } => {
                entry.state = STATE_PENDING;
                entry.retry_after = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            }
            RetryDecision::Exhausted => {
                entry.state = STATE_FAILED;
            }
        }
        Ok(decision)
    }

    async fn prune_finished(&self, limits: RetentionLimits) -> Result<u64, QueueError> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let mut pruned = 0u64;
        for (state, keep) in [
            (STATE_COMPLETED, limits.completed.max(0) as usize),
            (STATE_FAILED, limits.failed.max(0) as usize),
        ] {
            let mut seqs: Vec<u64> = entries
                .iter()
                .filter(|e| e.state == state)
                .map(|e| e.seq)
                .collect();
            seqs.sort_unstable_by(|a, b| b.cmp(a));
            let cutoff: Vec<u64> = seqs.into_iter().skip(keep).collect();
            let before = entries.len();
            entries.retain(|e| e.state != state || !cutoff.contains(&e.seq));
            pruned += (before - entries.len()) as u64;
        }
        Ok(pruned)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let entries = self.entries.lock().expect("lock poisoned");
        let mut counts = QueueCounts::default();
        for e in entries.iter() {
            match e.state {
                STATE_PENDING => counts.pending += 1,
                STATE_ACTIVE => counts.active += 1,
                STATE_COMPLETED => counts.completed += 1,
                STATE_FAILED => counts.failed += 1,
                _ => {}
            }
        }
        Ok(counts)
    }
}

/// File extension for storing a downloaded transparency file, taken from the
/// advertised filename.
pub fn file_extension(item: &WorkItem) -> &str {
    item.filename
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 8)
        .unwrap_or("bin")
}

#[derive(Debug)]
pub enum WorkerTick {
    Idle,
    Completed { queue_id: Uuid, job_id: Uuid },
    Failed { queue_id: Uuid, job_id: Uuid, will_retry: bool },
}

/// Services one queue item at a time: claim, ledger job, timed fetch,
/// artifact store, then complete or fail the attempt under the retry policy.
/// Every attempt gets a fresh ledger record; the audit trail is append-only.
pub struct DownloadWorker {
    queue: std::sync::Arc<dyn IngestQueue>,
    jobs: std::sync::Arc<dyn JobStore>,
    http: std::sync::Arc<HttpFetcher>,
    artifacts: ArtifactStore,
    attempt_timeout: Duration,
    retention: RetentionLimits,
}

impl DownloadWorker {
    pub fn new(
        queue: std::sync::Arc<dyn IngestQueue>,
        jobs: std::sync::Arc<dyn JobStore>,
        http: std::sync::Arc<HttpFetcher>,
        artifacts: ArtifactStore,
        attempt_timeout: Duration,
        retention: RetentionLimits,
    ) -> Self {
        Self {
            queue,
            jobs,
            http,
            artifacts,
            attempt_timeout,
            retention,
        }
    }

    pub async fn run_once(&self) -> anyhow::Result<WorkerTick> {
        let now = Utc::now();
        let Some(claimed) = self.queue.claim_next(now).await? else {
            return Ok(WorkerTick::Idle);
        };
        let item = &claimed.item;

        let job_id = self
            .jobs
            .create(
                NewJob::new(
                    JobKind::FileDownload,
                    format!("download {} for {}", item.filename, item.hospital_name),
                    "ingest",
                )
                .with_priority(if item.is_new {
                    NEW_FILE_PRIORITY
                } else {
                    REFRESH_FILE_PRIORITY
                })
                .with_input(serde_json::to_value(item)?),
            )
            .await?;
        self.jobs.mark_running(job_id).await?;

        let tick = match self.attempt(item, now).await {
            Ok(output) => {
                self.jobs.complete(job_id, output).await?;
                self.queue.complete(claimed.id, Utc::now()).await?;
                info!(queue_id = %claimed.id, attempt = claimed.attempt, file = %item.filename, "file ingested");
                WorkerTick::Completed {
                    queue_id: claimed.id,
                    job_id,
                }
            }
            Err(err) => {
                let message = format!("{err:#}");
                self.jobs.fail(job_id, &message, None).await?;
                let decision = self.queue.fail(claimed.id, &message, Utc::now()).await?;
                let will_retry = matches!(decision, RetryDecision::Retry { .. });
                warn!(
                    queue_id = %claimed.id,
                    attempt = claimed.attempt,
                    will_retry,
                    error = %message,
                    "file download attempt failed"
                );
                WorkerTick::Failed {
                    queue_id: claimed.id,
                    job_id,
                    will_retry,
                }
            }
        };

        // The queue only grows through scans and shrinks here, so each
        // finished tick is the place to enforce retention.
        let pruned = self.queue.prune_finished(self.retention).await?;
        if pruned > 0 {
            info!(pruned, "pruned finished queue items");
        }
        Ok(tick)
    }

    async fn attempt(
        &self,
        item: &WorkItem,
        fetched_at: DateTime<Utc>,
    ) -> anyhow::Result<serde_json::Value> {
        let fetched = tokio::time::timeout(
            self.attempt_timeout,
            self.http.fetch_bytes(&item.hospital_name, &item.url),
        )
        .await
        .map_err(|_| anyhow::anyhow!("attempt timed out after {:?}", self.attempt_timeout))?
        .with_context(|| format!("fetching {}", item.url))?;

        let stored = self
            .artifacts
            .store_file(
                &item.hospital_external_id,
                fetched_at,
                file_extension(item),
                &fetched.body,
            )
            .await?;

        Ok(json!({
            "bytes": stored.byte_size,
            "contentHash": stored.content_hash,
            "path": stored.relative_path.to_string_lossy(),
            "alreadyPresent": stored.already_present,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(file_id: &str, is_new: bool) -> WorkItem {
        WorkItem {
            hospital_id: Uuid::new_v4(),
            hospital_external_id: "CCN-390001".to_string(),
            hospital_name: "Springfield General".to_string(),
            file_id: file_id.to_string(),
            filename: format!("{file_id}.csv"),
            url: format!("https://example.org/{file_id}.csv"),
            size_display: None,
            retrieved_at: None,
            is_new,
        }
    }

    #[test]
    fn retry_schedule_doubles_then_exhausts() {
        let base = Duration::from_secs(30);
        assert_eq!(
            retry_decision(1, 3, base),
            RetryDecision::Retry {
                delay: Duration::from_secs(30)
            }
        );
        assert_eq!(
            retry_decision(2, 3, base),
            RetryDecision::Retry {
                delay: Duration::from_secs(60)
            }
        );
        assert_eq!(retry_decision(3, 3, base), RetryDecision::Exhausted);
    }

    #[test]
    fn retry_delay_is_capped() {
        let decision = retry_decision(10, 20, Duration::from_secs(60));
        assert_eq!(
            decision,
            RetryDecision::Retry {
                delay: MAX_RETRY_DELAY
            }
        );
    }

    #[tokio::test]
    async fn new_items_are_claimed_before_refreshes() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(&item("refresh-1", false), EnqueueOptions::for_item(&item("refresh-1", false)))
            .await
            .unwrap();
        queue
            .enqueue(&item("new-1", true), EnqueueOptions::for_item(&item("new-1", true)))
            .await
            .unwrap();

        let first = queue.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(first.item.file_id, "new-1");
        let second = queue.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(second.item.file_id, "refresh-1");
    }

    #[tokio::test]
    async fn fifo_within_a_priority_band() {
        let queue = MemoryQueue::new();
        for id in ["a", "b", "c"] {
            queue
                .enqueue(&item(id, true), EnqueueOptions::for_item(&item(id, true)))
                .await
                .unwrap();
        }
        let order: Vec<String> = [
            queue.claim_next(Utc::now()).await.unwrap().unwrap(),
            queue.claim_next(Utc::now()).await.unwrap().unwrap(),
            queue.claim_next(Utc::now()).await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|c| c.item.file_id)
        .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn failed_item_retries_then_lands_in_failed_state() {
        let queue = MemoryQueue::new();
        let opts = EnqueueOptions {
            max_attempts: 2,
            backoff_base: Duration::ZERO,
            ..EnqueueOptions::default()
        };
        let id = queue.enqueue(&item("flaky", false), opts).await.unwrap();

        let first = queue.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        let decision = queue.fail(first.id, "503", Utc::now()).await.unwrap();
        assert!(matches!(decision, RetryDecision::Retry { .. }));

        let second = queue.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        let decision = queue.fail(second.id, "503 again", Utc::now()).await.unwrap();
        assert_eq!(decision, RetryDecision::Exhausted);

        // Exhausted items are not dropped: still there, inspectable.
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 0);
        assert_eq!(queue.last_error(id).as_deref(), Some("503 again"));
    }

    #[tokio::test]
    async fn backoff_delay_gates_the_retry() {
        let queue = MemoryQueue::new();
        let opts = EnqueueOptions {
            max_attempts: 3,
            backoff_base: Duration::from_secs(60),
            ..EnqueueOptions::default()
        };
        queue.enqueue(&item("slow", false), opts).await.unwrap();

        let now = Utc::now();
        let claimed = queue.claim_next(now).await.unwrap().unwrap();
        queue.fail(claimed.id, "timeout", now).await.unwrap();

        // Not eligible until the backoff elapses.
        assert!(queue.claim_next(now).await.unwrap().is_none());
        let later = now + chrono::Duration::seconds(61);
        assert!(queue.claim_next(later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn retention_prunes_oldest_finished_first() {
        let queue = MemoryQueue::new();
        for i in 0..5 {
            let id = queue
                .enqueue(&item(&format!("f{i}"), false), EnqueueOptions::default())
                .await
                .unwrap();
            let claimed = queue.claim_next(Utc::now()).await.unwrap().unwrap();
            assert_eq!(claimed.id, id);
            queue.complete(id, Utc::now()).await.unwrap();
        }

        let pruned = queue
            .prune_finished(RetentionLimits {
                completed: 2,
                failed: 10,
            })
            .await
            .unwrap();
        assert_eq!(pruned, 3);

        let kept: Vec<String> = queue
            .enqueued_items()
            .into_iter()
            .map(|i| i.file_id)
            .collect();
        assert_eq!(kept, vec!["f3", "f4"]);
    }

    #[tokio::test]
    async fn worker_tick_enforces_queue_retention() {
        use hpt_storage::{BackoffPolicy, HttpClientConfig, MemoryJobStore};
        use std::sync::Arc;

        let queue = Arc::new(MemoryQueue::new());
        for i in 0..4 {
            let id = queue
                .enqueue(&item(&format!("done{i}"), false), EnqueueOptions::default())
                .await
                .unwrap();
            queue.claim_next(Utc::now()).await.unwrap();
            queue.complete(id, Utc::now()).await.unwrap();
        }
        // Nothing listens on the discard port, so the fetch fails fast.
        let mut unreachable = item("unreachable", false);
        unreachable.url = "http://127.0.0.1:9/standardcharges.csv".to_string();
        queue
            .enqueue(
                &unreachable,
                EnqueueOptions {
                    max_attempts: 1,
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();

        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            backoff: BackoffPolicy {
                max_retries: 0,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        })
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let worker = DownloadWorker::new(
            Arc::clone(&queue) as Arc<dyn IngestQueue>,
            Arc::new(MemoryJobStore::new()),
            Arc::new(http),
            ArtifactStore::new(dir.path()),
            Duration::from_secs(5),
            RetentionLimits {
                completed: 2,
                failed: 10,
            },
        );

        let tick = worker.run_once().await.unwrap();
        assert!(matches!(
            tick,
            WorkerTick::Failed {
                will_retry: false,
                ..
            }
        ));

        // The finished tick trimmed the completed backlog down to the limit.
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.failed, 1);
    }

    #[test]
    fn extension_from_filename() {
        let mut i = item("cdm", false);
        assert_eq!(file_extension(&i), "csv");
        i.filename = "prices.json".to_string();
        assert_eq!(file_extension(&i), "json");
        i.filename = "no-extension".to_string();
        assert_eq!(file_extension(&i), "bin");
        i.filename = "weird.".to_string();
        assert_eq!(file_extension(&i), "bin");
    }
}
