//! Core domain model for HPT: hospitals, file manifests, work items, the job
//! ledger state machine, metric keys and calendar periods.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hpt-core";

/// One remote file a jurisdictional registry advertises for a hospital.
///
/// Not persisted as its own table; its effect is a queued [`WorkItem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifestEntry {
    pub file_id: String,
    pub filename: String,
    pub url: String,
    pub size_display: Option<String>,
    pub suffix: Option<String>,
    /// When the registry itself last refreshed the file, as reported upstream.
    pub retrieved_at: Option<DateTime<Utc>>,
}

/// Hospital payload as observed from a registry listing, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HospitalDraft {
    pub external_id: String,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub bed_count: Option<i32>,
    pub certification_numbers: Vec<String>,
    pub files: Vec<FileManifestEntry>,
}

/// Persisted hospital row. `external_id` is unique across scans; `last_updated`
/// is stamped on every scan observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hospital {
    pub id: Uuid,
    pub external_id: String,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub bed_count: Option<i32>,
    pub certification_numbers: Vec<String>,
    pub last_updated: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an upsert keyed by external id.
///
/// `Unchanged` means the hospital was observed but no mutable field differed;
/// `last_updated` is stamped in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct HospitalUpsert {
    pub id: Uuid,
    pub outcome: UpsertOutcome,
    /// `last_updated` as it stood before this scan stamped it. `None` for a
    /// freshly created row. Change detection compares against this value.
    pub previous_last_updated: Option<DateTime<Utc>>,
}

/// A discovered file reference queued for download. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub hospital_id: Uuid,
    /// Registry identifier; also the top-level artifact directory for the
    /// hospital's downloaded files.
    pub hospital_external_id: String,
    pub hospital_name: String,
    pub file_id: String,
    pub filename: String,
    pub url: String,
    pub size_display: Option<String>,
    pub retrieved_at: Option<DateTime<Utc>>,
    /// Set when the owning hospital was first seen this scan. Drives queue
    /// priority and forces reprocessing downstream.
    pub is_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Scan,
    MetricsRefresh,
    FileDownload,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Scan => "scan",
            JobKind::MetricsRefresh => "metrics_refresh",
            JobKind::FileDownload => "file_download",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scan" => Some(JobKind::Scan),
            "metrics_refresh" => Some(JobKind::MetricsRefresh),
            "file_download" => Some(JobKind::FileDownload),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Monotonic transitions only: a run is single-shot, so `running` can
    /// never be re-entered; retries create a new job record.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }
}

/// Per-run record counters kept on the job record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub processed: i64,
    pub created: i64,
    pub updated: i64,
    pub skipped: i64,
    pub failed: i64,
}

/// Inputs for creating a job ledger row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub name: String,
    pub queue: String,
    pub priority: i32,
    pub input: JsonValue,
    pub cron_expression: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(kind: JobKind, name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            queue: queue.into(),
            priority: 0,
            input: JsonValue::Null,
            cron_expression: None,
            next_run_at: None,
        }
    }

    pub fn with_input(mut self, input: JsonValue) -> Self {
        self.input = input;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// One row per asynchronous unit of work; the audit trail never reuses rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: JobKind,
    pub name: String,
    pub queue: String,
    pub status: JobStatus,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub progress_percent: i32,
    pub input: JsonValue,
    pub output: JsonValue,
    pub error_message: Option<String>,
    pub error_detail: Option<String>,
    pub counters: RunCounters,
    pub cron_expression: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
}

/// Clamp a reported progress value to the [0, 100] band.
pub fn clamp_percent(value: i32) -> i32 {
    value.clamp(0, 100)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Month,
    Quarter,
    Year,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            PeriodType::Month => "month",
            PeriodType::Quarter => "quarter",
            PeriodType::Year => "year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "month" => Some(PeriodType::Month),
            "quarter" => Some(PeriodType::Quarter),
            "year" => Some(PeriodType::Year),
            _ => None,
        }
    }
}

/// A calendar period label, e.g. `2024-01`, `2024-Q1`, `2024`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    pub label: String,
    pub period_type: PeriodType,
}

impl Period {
    pub fn month_of(at: DateTime<Utc>) -> Self {
        Self {
            label: format!("{:04}-{:02}", at.year(), at.month()),
            period_type: PeriodType::Month,
        }
    }

    pub fn quarter_of(at: DateTime<Utc>) -> Self {
        Self {
            label: format!("{:04}-Q{}", at.year(), (at.month() - 1) / 3 + 1),
            period_type: PeriodType::Quarter,
        }
    }

    pub fn year_of(at: DateTime<Utc>) -> Self {
        Self {
            label: format!("{:04}", at.year()),
            period_type: PeriodType::Year,
        }
    }
}

/// The period set an analytics run covers: current month, quarter and year.
pub fn current_periods(at: DateTime<Utc>) -> Vec<Period> {
    vec![
        Period::month_of(at),
        Period::quarter_of(at),
        Period::year_of(at),
    ]
}

/// Optional dimension tuple on a metric row. An unset dimension is a distinct
/// key component from any set value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricDimensions {
    pub state: Option<String>,
    pub city: Option<String>,
    pub hospital_id: Option<Uuid>,
    pub category: Option<String>,
    pub service_code: Option<String>,
}

impl MetricDimensions {
    pub fn state(code: impl Into<String>) -> Self {
        Self {
            state: Some(code.into()),
            ..Self::default()
        }
    }

    pub fn service_code(code: impl Into<String>) -> Self {
        Self {
            service_code: Some(code.into()),
            ..Self::default()
        }
    }
}

/// Full uniqueness key for a live metric row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    pub name: String,
    pub period: Period,
    pub dimensions: MetricDimensions,
}

/// One computed statistic. `value` is a fixed-precision decimal string so
/// repeated recomputation cannot drift through float round-tripping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub key: MetricKey,
    pub value: String,
    pub sample_size: i64,
    pub confidence: Option<f64>,
    pub metadata: JsonValue,
    pub source_query: Option<String>,
    pub depends_on: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

/// Render an aggregate value at the stored precision (4 decimal places).
pub fn format_metric_value(value: f64) -> String {
    format!("{value:.4}")
}

/// How a catalog metric is computed over the fact tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    GroupedCount,
    Average,
    StdDev,
    TopN(u32),
    BottomN(u32),
}

/// Fact-table column a grouped aggregate partitions by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactDimension {
    State,
    ServiceCode,
}

/// A named metric in the analytics catalog, with lineage for explainability.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub kind: AggregateKind,
    pub dimension: Option<FactDimension>,
    pub source_query: &'static str,
    pub depends_on: &'static [&'static str],
}

/// One aggregation result row before it is keyed to a period.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub dimensions: MetricDimensions,
    pub value: f64,
    pub sample_size: i64,
}

/// Summary of one scan run. Partial failure is a normal, reportable outcome:
/// callers inspect `success`, control flow never signals it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    /// Jurisdictions walked, whether or not their registry call succeeded.
    pub scanned_jurisdictions: usize,
    pub total_hospitals: usize,
    pub new_hospitals: usize,
    pub updated_hospitals: usize,
    pub files_enqueued: usize,
    pub errors: Vec<String>,
    pub duration_ms: i64,
    pub success: bool,
}

/// Summary of one analytics refresh run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResult {
    pub metrics_updated: usize,
    pub refreshed_metrics: Vec<String>,
    pub errors: Vec<String>,
    pub duration_ms: i64,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_transitions_are_monotonic() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));

        // A run is single-shot.
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("paused"), None);
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(clamp_percent(-5), 0);
        assert_eq!(clamp_percent(0), 0);
        assert_eq!(clamp_percent(42), 42);
        assert_eq!(clamp_percent(100), 100);
        assert_eq!(clamp_percent(250), 100);
    }

    #[test]
    fn period_labels() {
        let at = Utc.with_ymd_and_hms(2024, 2, 15, 8, 0, 0).single().unwrap();
        let periods = current_periods(at);
        assert_eq!(periods.len(), 3);
        assert_eq!(periods[0].label, "2024-02");
        assert_eq!(periods[0].period_type, PeriodType::Month);
        assert_eq!(periods[1].label, "2024-Q1");
        assert_eq!(periods[1].period_type, PeriodType::Quarter);
        assert_eq!(periods[2].label, "2024");
        assert_eq!(periods[2].period_type, PeriodType::Year);
    }

    #[test]
    fn quarter_boundaries() {
        for (month, label) in [(1, "Q1"), (3, "Q1"), (4, "Q2"), (9, "Q3"), (10, "Q4"), (12, "Q4")] {
            let at = Utc.with_ymd_and_hms(2024, month, 1, 0, 0, 0).single().unwrap();
            assert_eq!(Period::quarter_of(at).label, format!("2024-{label}"));
        }
    }

    #[test]
    fn metric_value_precision() {
        assert_eq!(format_metric_value(1234.5), "1234.5000");
        assert_eq!(format_metric_value(0.123456), "0.1235");
        assert_eq!(format_metric_value(0.0), "0.0000");
    }

    #[test]
    fn unset_dimension_is_distinct_from_set() {
        let base = MetricKey {
            name: "average_gross_charge".into(),
            period: Period {
                label: "2024-Q1".into(),
                period_type: PeriodType::Quarter,
            },
            dimensions: MetricDimensions::default(),
        };
        let mut scoped = base.clone();
        scoped.dimensions.state = Some("CA".into());
        assert_ne!(base, scoped);
    }
}
