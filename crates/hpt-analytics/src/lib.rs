//! Analytics engine: recomputes the catalog of pre-aggregated metrics over
//! the current month, quarter and year.
//!
//! Each (metric, period, dimensions) key holds exactly one live row. A
//! recompute replaces the row atomically, so readers never observe a window
//! with the key missing. Existing rows are skipped unless the caller forces a
//! refresh; a failed metric is recorded and the run moves on to the next one.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hpt_core::{
    clamp_percent, current_periods, format_metric_value, AggregateKind, FactDimension, MetricDef,
    MetricKey, MetricRecord, Period, RefreshResult,
};
use hpt_storage::{FactAggregates, JobHandle, MetricStore};
use serde_json::json;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "hpt-analytics";

/// Rows older than this are pruned after a clean full refresh.
const RETENTION: Duration = Duration::days(2 * 365);

/// The metric catalog. Names are stable identifiers consumed by dashboards;
/// renaming one orphans its historical rows.
pub const CATALOG: &[MetricDef] = &[
    MetricDef {
        name: "total_hospitals",
        kind: AggregateKind::Count,
        dimension: None,
        source_query: "SELECT COUNT(*) FROM hospitals",
        depends_on: &["hospitals"],
    },
    MetricDef {
        name: "hospitals_by_state",
        kind: AggregateKind::GroupedCount,
        dimension: Some(FactDimension::State),
        source_query: "SELECT state, COUNT(*) FROM hospitals GROUP BY state",
        depends_on: &["hospitals"],
    },
    MetricDef {
        name: "average_gross_charge",
        kind: AggregateKind::Average,
        dimension: None,
        source_query: "SELECT AVG(gross_charge) FROM prices",
        depends_on: &["prices"],
    },
    MetricDef {
        name: "gross_charge_stddev",
        kind: AggregateKind::StdDev,
        dimension: None,
        source_query: "SELECT STDDEV_SAMP(gross_charge) FROM prices",
        depends_on: &["prices"],
    },
    MetricDef {
        name: "top_services_by_charge",
        kind: AggregateKind::TopN(10),
        dimension: Some(FactDimension::ServiceCode),
        source_query: "SELECT service_code, AVG(gross_charge) FROM prices \
                       GROUP BY service_code ORDER BY 2 DESC LIMIT 10",
        depends_on: &["prices"],
    },
    MetricDef {
        name: "bottom_services_by_charge",
        kind: AggregateKind::BottomN(10),
        dimension: Some(FactDimension::ServiceCode),
        source_query: "SELECT service_code, AVG(gross_charge) FROM prices \
                       GROUP BY service_code ORDER BY 2 ASC LIMIT 10",
        depends_on: &["prices"],
    },
];

pub fn metric_by_name(name: &str) -> Option<&'static MetricDef> {
    CATALOG.iter().find(|m| m.name == name)
}

fn aggregate_label(kind: AggregateKind) -> &'static str {
    match kind {
        AggregateKind::Count => "count",
        AggregateKind::GroupedCount => "grouped_count",
        AggregateKind::Average => "average",
        AggregateKind::StdDev => "stddev",
        AggregateKind::TopN(_) => "top_n",
        AggregateKind::BottomN(_) => "bottom_n",
    }
}

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    /// Restrict the run to these catalog metrics. `None` runs the full
    /// catalog.
    pub metric_names: Option<Vec<String>>,
    /// Recompute even where a live row for the period already exists.
    pub force_refresh: bool,
    pub now: DateTime<Utc>,
}

impl RefreshOptions {
    pub fn full(now: DateTime<Utc>) -> Self {
        Self {
            metric_names: None,
            force_refresh: false,
            now,
        }
    }

    pub fn forced(now: DateTime<Utc>) -> Self {
        Self {
            force_refresh: true,
            ..Self::full(now)
        }
    }
}

pub struct AnalyticsEngine {
    facts: Arc<dyn FactAggregates>,
    metrics: Arc<dyn MetricStore>,
}

impl AnalyticsEngine {
    pub fn new(facts: Arc<dyn FactAggregates>, metrics: Arc<dyn MetricStore>) -> Self {
        Self { facts, metrics }
    }

    /// Run the catalog (or the selected subset) over the current periods.
    pub async fn refresh(
        &self,
        opts: &RefreshOptions,
        job: Option<&JobHandle>,
    ) -> anyhow::Result<RefreshResult> {
        let mut defs: Vec<&MetricDef> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        match &opts.metric_names {
            None => defs.extend(CATALOG.iter()),
            Some(names) => {
                for name in names {
                    match metric_by_name(name) {
                        Some(def) => defs.push(def),
                        None => errors.push(format!("unknown metric: {name}")),
                    }
                }
            }
        }

        let mut result = self.refresh_defs(&defs, opts, job, errors).await?;

        // Retention only runs after a clean, unfiltered pass so a transient
        // failure cannot shrink history.
        if opts.metric_names.is_none() && result.success {
            let pruned = self.metrics.prune_before(opts.now - RETENTION).await?;
            if pruned > 0 {
                info!(pruned, "pruned expired metric rows");
            }
        }

        result.duration_ms = (Utc::now() - opts.now).num_milliseconds().max(0);
        Ok(result)
    }

    async fn refresh_defs(
        &self,
        defs: &[&MetricDef],
        opts: &RefreshOptions,
        job: Option<&JobHandle>,
        mut errors: Vec<String>,
    ) -> anyhow::Result<RefreshResult> {
        let periods = current_periods(opts.now);
        let total_units = (defs.len() * periods.len()).max(1) as i64;
        let mut done_units = 0i64;
        let mut metrics_updated = 0usize;
        let mut refreshed: Vec<String> = Vec::new();

        'outer: for def in defs {
            let mut updated_any = false;
            for period in &periods {
                if let Some(handle) = job {
                    if handle.cancel_requested().await? {
                        warn!(metric = def.name, "metrics refresh cancelled");
                        break 'outer;
                    }
                }

                match self.refresh_one(def, period, opts).await {
                    Ok(true) => updated_any = true,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(metric = def.name, period = %period.label, error = %err, "metric refresh failed");
                        errors.push(format!("{} [{}]: {err:#}", def.name, period.label));
                    }
                }

                done_units += 1;
                if let Some(handle) = job {
                    handle
                        .progress(clamp_percent((done_units * 100 / total_units) as i32))
                        .await?;
                }
            }
            if updated_any {
                metrics_updated += 1;
                refreshed.push(def.name.to_string());
            }
        }

        Ok(RefreshResult {
            metrics_updated,
            refreshed_metrics: refreshed,
            errors: errors.clone(),
            duration_ms: 0,
            success: errors.is_empty(),
        })
    }

    /// Recompute one metric for one period. Returns whether any row was
    /// written.
    async fn refresh_one(
        &self,
        def: &MetricDef,
        period: &Period,
        opts: &RefreshOptions,
    ) -> anyhow::Result<bool> {
        if !opts.force_refresh && self.metrics.exists(def.name, period).await? {
            return Ok(false);
        }

        let rows = self.facts.compute(def).await?;
        if rows.is_empty() {
            // A forced recompute with nothing left to aggregate must not
            // leave the previous rows standing.
            if opts.force_refresh {
                let cleared = self.metrics.clear(def.name, period).await?;
                if cleared > 0 {
                    info!(metric = def.name, period = %period.label, cleared, "metric cleared");
                }
                return Ok(cleared > 0);
            }
            return Ok(false);
        }

        for row in &rows {
            let record = MetricRecord {
                key: MetricKey {
                    name: def.name.to_string(),
                    period: period.clone(),
                    dimensions: row.dimensions.clone(),
                },
                value: format_metric_value(row.value),
                sample_size: row.sample_size,
                confidence: None,
                metadata: json!({ "aggregate": aggregate_label(def.kind) }),
                source_query: Some(def.source_query.to_string()),
                depends_on: def.depends_on.iter().map(|d| d.to_string()).collect(),
                computed_at: Utc::now(),
            };
            self.metrics.replace(&record).await?;
        }
        info!(metric = def.name, period = %period.label, rows = rows.len(), "metric refreshed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hpt_core::{JobKind, JobStatus, MetricDimensions, NewJob};
    use hpt_storage::{JobStore, MemoryFactAggregates, MemoryJobStore, MemoryMetricStore};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 14, 12, 0, 0).unwrap()
    }

    fn seeded_engine() -> (AnalyticsEngine, Arc<MemoryMetricStore>) {
        let facts = Arc::new(MemoryFactAggregates::new());
        facts.add_hospital(Some("CA"));
        facts.add_hospital(Some("CA"));
        facts.add_hospital(Some("NY"));
        facts.add_price("99213", 100.0);
        facts.add_price("99213", 200.0);
        facts.add_price("70450", 300.0);
        let metrics = Arc::new(MemoryMetricStore::new());
        (
            AnalyticsEngine::new(facts, Arc::clone(&metrics) as _),
            metrics,
        )
    }

    #[tokio::test]
    async fn full_refresh_covers_catalog_and_periods() {
        let (engine, metrics) = seeded_engine();
        let result = engine
            .refresh(&RefreshOptions::full(now()), None)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.metrics_updated, CATALOG.len());

        for period in current_periods(now()) {
            assert!(metrics.exists("total_hospitals", &period).await.unwrap());
        }

        let rows = metrics.all_rows();
        let total: Vec<_> = rows
            .iter()
            .filter(|r| r.key.name == "total_hospitals")
            .collect();
        assert_eq!(total.len(), 3);
        assert!(total.iter().all(|r| r.value == "3.0000"));

        let by_state: Vec<_> = rows
            .iter()
            .filter(|r| {
                r.key.name == "hospitals_by_state" && r.key.period.label == "2024-02"
            })
            .collect();
        assert_eq!(by_state.len(), 2);
        let ca = by_state
            .iter()
            .find(|r| r.key.dimensions.state.as_deref() == Some("CA"))
            .unwrap();
        assert_eq!(ca.value, "2.0000");
        assert_eq!(ca.sample_size, 2);
    }

    #[tokio::test]
    async fn existing_rows_are_skipped_unless_forced() {
        let (engine, metrics) = seeded_engine();
        engine
            .refresh(&RefreshOptions::full(now()), None)
            .await
            .unwrap();
        let rows_before = metrics.all_rows().len();

        let second = engine
            .refresh(&RefreshOptions::full(now()), None)
            .await
            .unwrap();
        assert!(second.success);
        assert_eq!(second.metrics_updated, 0);
        assert!(second.refreshed_metrics.is_empty());
        assert_eq!(metrics.all_rows().len(), rows_before);

        let forced = engine
            .refresh(&RefreshOptions::forced(now()), None)
            .await
            .unwrap();
        assert_eq!(forced.metrics_updated, CATALOG.len());
        // Replace, not append: still one live row per key.
        assert_eq!(metrics.all_rows().len(), rows_before);
    }

    #[tokio::test]
    async fn unknown_metric_name_is_reported_and_the_rest_run() {
        let (engine, metrics) = seeded_engine();
        let opts = RefreshOptions {
            metric_names: Some(vec![
                "total_hospitals".to_string(),
                "no_such_metric".to_string(),
            ]),
            force_refresh: false,
            now: now(),
        };
        let result = engine.refresh(&opts, None).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("no_such_metric"));
        assert_eq!(result.refreshed_metrics, vec!["total_hospitals"]);
        assert!(!metrics.all_rows().is_empty());
    }

    #[tokio::test]
    async fn empty_facts_write_only_the_zero_count() {
        let facts = Arc::new(MemoryFactAggregates::new());
        let metrics = Arc::new(MemoryMetricStore::new());
        let engine = AnalyticsEngine::new(facts, Arc::clone(&metrics) as _);

        let result = engine
            .refresh(&RefreshOptions::full(now()), None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.refreshed_metrics, vec!["total_hospitals"]);

        let rows = metrics.all_rows();
        assert_eq!(rows.len(), 3);
        assert!(rows
            .iter()
            .all(|r| r.key.name == "total_hospitals" && r.value == "0.0000"));
    }

    #[tokio::test]
    async fn forced_refresh_clears_metrics_with_no_remaining_facts() {
        let (engine, metrics) = seeded_engine();
        engine
            .refresh(&RefreshOptions::full(now()), None)
            .await
            .unwrap();
        assert!(metrics
            .all_rows()
            .iter()
            .any(|r| r.key.name == "average_gross_charge"));

        // Same metric store, but the price facts are gone.
        let drained = AnalyticsEngine::new(
            Arc::new(MemoryFactAggregates::new()),
            Arc::clone(&metrics) as _,
        );
        let result = drained
            .refresh(&RefreshOptions::forced(now()), None)
            .await
            .unwrap();
        assert!(result.success);

        let rows = metrics.all_rows();
        assert!(!rows.iter().any(|r| r.key.name == "average_gross_charge"));
        assert!(!rows.iter().any(|r| r.key.name == "top_services_by_charge"));
        // The zero count is a real aggregate and stays live.
        assert!(rows
            .iter()
            .any(|r| r.key.name == "total_hospitals" && r.value == "0.0000"));
    }

    #[tokio::test]
    async fn cancellation_stops_between_units() {
        let (engine, metrics) = seeded_engine();
        let jobs = Arc::new(MemoryJobStore::new());
        let id = jobs
            .create(NewJob::new(JobKind::MetricsRefresh, "refresh", "analytics"))
            .await
            .unwrap();
        jobs.mark_running(id).await.unwrap();
        jobs.request_cancel(id).await.unwrap();

        let handle = JobHandle::new(Arc::clone(&jobs) as _, id);
        let result = engine
            .refresh(&RefreshOptions::full(now()), Some(&handle))
            .await
            .unwrap();

        assert_eq!(result.metrics_updated, 0);
        assert!(metrics.all_rows().is_empty());

        jobs.cancel(id).await.unwrap();
        let record = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn clean_full_run_prunes_expired_rows() {
        let (engine, metrics) = seeded_engine();

        let stale = MetricRecord {
            key: MetricKey {
                name: "total_hospitals".to_string(),
                period: Period::year_of(Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap()),
                dimensions: MetricDimensions::default(),
            },
            value: "7.0000".to_string(),
            sample_size: 7,
            confidence: None,
            metadata: json!({}),
            source_query: None,
            depends_on: vec![],
            computed_at: Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap(),
        };
        metrics.replace(&stale).await.unwrap();

        engine
            .refresh(&RefreshOptions::full(now()), None)
            .await
            .unwrap();

        assert!(!metrics
            .all_rows()
            .iter()
            .any(|r| r.key.period.label == "2021"));
    }

    #[tokio::test]
    async fn progress_reaches_full_on_an_unforced_run() {
        let (engine, _metrics) = seeded_engine();
        let jobs = Arc::new(MemoryJobStore::new());
        let id = jobs
            .create(NewJob::new(JobKind::MetricsRefresh, "refresh", "analytics"))
            .await
            .unwrap();
        jobs.mark_running(id).await.unwrap();

        let handle = JobHandle::new(Arc::clone(&jobs) as _, id);
        engine
            .refresh(&RefreshOptions::full(now()), Some(&handle))
            .await
            .unwrap();

        let trace = jobs.progress_trace(id);
        assert_eq!(trace.last().copied(), Some(100));
        assert!(trace.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn catalog_names_are_unique() {
        let mut names: Vec<&str> = CATALOG.iter().map(|m| m.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), CATALOG.len());
    }

    #[test]
    fn lookup_by_name() {
        assert!(metric_by_name("average_gross_charge").is_some());
        assert!(metric_by_name("nope").is_none());
    }
}
