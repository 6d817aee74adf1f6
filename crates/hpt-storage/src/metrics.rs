//! Metric rows and the fact aggregates that feed them.
//!
//! A metric row is unique per full key (name + period + period type + each
//! optional dimension, with "unset" distinct from any value). Recomputation
//! replaces within that exact key: delete-then-insert inside one transaction,
//! so readers never observe the transient-empty window.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hpt_core::{
    AggregateKind, AggregateRow, FactDimension, MetricDef, MetricDimensions, MetricKey,
    MetricRecord, Period, PeriodType,
};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

use crate::StorageError;

#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Whether any live row exists for (name, period, period type). Backs
    /// the skip-if-present check on repeated refresh triggers within a
    /// period.
    async fn exists(&self, name: &str, period: &Period) -> Result<bool, StorageError>;

    /// Replace the live row for the record's exact key.
    async fn replace(&self, record: &MetricRecord) -> Result<(), StorageError>;

    /// Drop every live row for (name, period, period type); returns how many
    /// went. Used when a forced recompute finds no facts left to aggregate.
    async fn clear(&self, name: &str, period: &Period) -> Result<u64, StorageError>;

    async fn live_rows(&self, name: &str, period: &Period)
        -> Result<Vec<MetricRecord>, StorageError>;

    /// Drop rows computed before `cutoff`; returns how many went.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;
}

/// Aggregation queries over the fact tables, one shape per catalog metric
/// kind. Injected so tests compute over in-memory facts.
#[async_trait]
pub trait FactAggregates: Send + Sync {
    async fn compute(&self, metric: &MetricDef) -> Result<Vec<AggregateRow>, StorageError>;
}

#[derive(Debug, sqlx::FromRow)]
struct MetricRow {
    metric_name: String,
    period: String,
    period_type: String,
    state: Option<String>,
    city: Option<String>,
    hospital_id: Option<Uuid>,
    category: Option<String>,
    service_code: Option<String>,
    value: String,
    sample_size: i64,
    confidence: Option<f64>,
    metadata: JsonValue,
    source_query: Option<String>,
    depends_on: Vec<String>,
    computed_at: DateTime<Utc>,
}

impl TryFrom<MetricRow> for MetricRecord {
    type Error = StorageError;

    fn try_from(row: MetricRow) -> Result<Self, StorageError> {
        let period_type = PeriodType::parse(&row.period_type).ok_or_else(|| {
            StorageError::Message(format!("unknown period type {:?}", row.period_type))
        })?;
        Ok(MetricRecord {
            key: MetricKey {
                name: row.metric_name,
                period: Period {
                    label: row.period,
                    period_type,
                },
                dimensions: MetricDimensions {
                    state: row.state,
                    city: row.city,
                    hospital_id: row.hospital_id,
                    category: row.category,
                    service_code: row.service_code,
                },
            },
            value: row.value,
            sample_size: row.sample_size,
            confidence: row.confidence,
            metadata: row.metadata,
            source_query: row.source_query,
            depends_on: row.depends_on,
            computed_at: row.computed_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgMetricStore {
    pool: PgPool,
}

impl PgMetricStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetricStore for PgMetricStore {
    async fn exists(&self, name: &str, period: &Period) -> Result<bool, StorageError> {
        let found = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM metrics \
             WHERE metric_name = $1 AND period = $2 AND period_type = $3)",
        )
        .bind(name)
        .bind(&period.label)
        .bind(period.period_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn replace(&self, record: &MetricRecord) -> Result<(), StorageError> {
        let key = &record.key;
        let dims = &key.dimensions;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM metrics \
             WHERE metric_name = $1 AND period = $2 AND period_type = $3 \
               AND state IS NOT DISTINCT FROM $4 \
               AND city IS NOT DISTINCT FROM $5 \
               AND hospital_id IS NOT DISTINCT FROM $6 \
               AND category IS NOT DISTINCT FROM $7 \
               AND service_code IS NOT DISTINCT FROM $8",
        )
        .bind(&key.name)
        .bind(&key.period.label)
        .bind(key.period.period_type.as_str())
        .bind(&dims.state)
        .bind(&dims.city)
        .bind(dims.hospital_id)
        .bind(&dims.category)
        .bind(&dims.service_code)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO metrics (id, metric_name, period, period_type, state, city, \
               hospital_id, category, service_code, value, sample_size, confidence, metadata, \
               source_query, depends_on, computed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(Uuid::new_v4())
        .bind(&key.name)
        .bind(&key.period.label)
        .bind(key.period.period_type.as_str())
        .bind(&dims.state)
        .bind(&dims.city)
        .bind(dims.hospital_id)
        .bind(&dims.category)
        .bind(&dims.service_code)
        .bind(&record.value)
        .bind(record.sample_size)
        .bind(record.confidence)
        .bind(&record.metadata)
        .bind(&record.source_query)
        .bind(&record.depends_on)
        .bind(record.computed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn clear(&self, name: &str, period: &Period) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "DELETE FROM metrics \
             WHERE metric_name = $1 AND period = $2 AND period_type = $3",
        )
        .bind(name)
        .bind(&period.label)
        .bind(period.period_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn live_rows(
        &self,
        name: &str,
        period: &Period,
    ) -> Result<Vec<MetricRecord>, StorageError> {
        let rows = sqlx::query_as::<_, MetricRow>(
            "SELECT metric_name, period, period_type, state, city, hospital_id, category, \
               service_code, value, sample_size, confidence, metadata, source_query, depends_on, \
               computed_at \
             FROM metrics WHERE metric_name = $1 AND period = $2 AND period_type = $3",
        )
        .bind(name)
        .bind(&period.label)
        .bind(period.period_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MetricRecord::try_from).collect()
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM metrics WHERE computed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// In-memory metric store. Replacement happens under one mutex guard, which
/// gives it the same no-transient-window guarantee as the transactional
/// Postgres path.
#[derive(Debug, Default)]
pub struct MemoryMetricStore {
    rows: Mutex<Vec<MetricRecord>>,
}

impl MemoryMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_rows(&self) -> Vec<MetricRecord> {
        self.rows.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl MetricStore for MemoryMetricStore {
    async fn exists(&self, name: &str, period: &Period) -> Result<bool, StorageError> {
        let rows = self.rows.lock().expect("lock poisoned");
        Ok(rows
            .iter()
            .any(|r| r.key.name == name && r.key.period == *period))
    }

    async fn replace(&self, record: &MetricRecord) -> Result<(), StorageError> {
        let mut rows = self.rows.lock().expect("lock poisoned");
        rows.retain(|r| r.key != record.key);
        rows.push(record.clone());
        Ok(())
    }

    async fn clear(&self, name: &str, period: &Period) -> Result<u64, StorageError> {
        let mut rows = self.rows.lock().expect("lock poisoned");
        let before = rows.len();
        rows.retain(|r| r.key.name != name || r.key.period != *period);
        Ok((before - rows.len()) as u64)
    }

    async fn live_rows(
        &self,
        name: &str,
        period: &Period,
    ) -> Result<Vec<MetricRecord>, StorageError> {
        let rows = self.rows.lock().expect("lock poisoned");
        Ok(rows
            .iter()
            .filter(|r| r.key.name == name && r.key.period == *period)
            .cloned()
            .collect())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut rows = self.rows.lock().expect("lock poisoned");
        let before = rows.len();
        rows.retain(|r| r.computed_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}

fn unsupported_shape(metric: &MetricDef) -> StorageError {
    StorageError::Message(format!(
        "metric {} has an unsupported kind/dimension combination",
        metric.name
    ))
}

#[derive(Debug, Clone)]
pub struct PgFactAggregates {
    pool: PgPool,
}

impl PgFactAggregates {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FactAggregates for PgFactAggregates {
    async fn compute(&self, metric: &MetricDef) -> Result<Vec<AggregateRow>, StorageError> {
        match (metric.kind, metric.dimension) {
            (AggregateKind::Count, None) => {
                let count = sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM hospitals WHERE is_active",
                )
                .fetch_one(&self.pool)
                .await?;
                Ok(vec![AggregateRow {
                    dimensions: MetricDimensions::default(),
                    value: count as f64,
                    sample_size: count,
                }])
            }
            (AggregateKind::GroupedCount, Some(FactDimension::State)) => {
                let rows = sqlx::query_as::<_, (String, i64)>(
                    "SELECT state, COUNT(*) FROM hospitals \
                     WHERE is_active AND state IS NOT NULL \
                     GROUP BY state ORDER BY state",
                )
                .fetch_all(&self.pool)
                .await?;
                Ok(rows
                    .into_iter()
                    .map(|(state, count)| AggregateRow {
                        dimensions: MetricDimensions::state(state),
                        value: count as f64,
                        sample_size: count,
                    })
                    .collect())
            }
            (AggregateKind::Average, None) => {
                let row = sqlx::query_as::<_, (Option<f64>, i64)>(
                    "SELECT AVG(gross_charge)::FLOAT8, COUNT(*) FROM prices",
                )
                .fetch_one(&self.pool)
                .await?;
                Ok(match row {
                    (Some(value), sample_size) => vec![AggregateRow {
                        dimensions: MetricDimensions::default(),
                        value,
                        sample_size,
                    }],
                    (None, _) => Vec::new(),
                })
            }
            (AggregateKind::StdDev, None) => {
                let row = sqlx::query_as::<_, (Option<f64>, i64)>(
                    "SELECT STDDEV_SAMP(gross_charge)::FLOAT8, COUNT(*) FROM prices",
                )
                .fetch_one(&self.pool)
                .await?;
                Ok(match row {
                    (Some(value), sample_size) => vec![AggregateRow {
                        dimensions: MetricDimensions::default(),
                        value,
                        sample_size,
                    }],
                    (None, _) => Vec::new(),
                })
            }
            (AggregateKind::TopN(n), Some(FactDimension::ServiceCode)) => {
                self.ranked_services("DESC", n).await
            }
            (AggregateKind::BottomN(n), Some(FactDimension::ServiceCode)) => {
                self.ranked_services("ASC", n).await
            }
            _ => Err(unsupported_shape(metric)),
        }
    }
}

impl PgFactAggregates {
    async fn ranked_services(
        &self,
        direction: &str,
        n: u32,
    ) -> Result<Vec<AggregateRow>, StorageError> {
        // `direction` is a fixed token from the match above, never user input.
        let rows = sqlx::query_as::<_, (String, f64, i64)>(&format!(
            "SELECT service_code, AVG(gross_charge)::FLOAT8 AS avg_charge, COUNT(*) \
             FROM prices GROUP BY service_code \
             ORDER BY avg_charge {direction}, service_code LIMIT $1"
        ))
        .bind(i64::from(n))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(service_code, value, sample_size)| AggregateRow {
                dimensions: MetricDimensions::service_code(service_code),
                value,
                sample_size,
            })
            .collect())
    }
}

/// One active-hospital fact for the in-memory aggregates.
#[derive(Debug, Clone)]
pub struct HospitalFact {
    pub state: Option<String>,
}

/// One price fact for the in-memory aggregates.
#[derive(Debug, Clone)]
pub struct PriceFact {
    pub service_code: String,
    pub gross_charge: f64,
}

/// In-memory fact source computing the same aggregate shapes as the Postgres
/// queries.
#[derive(Debug, Default)]
pub struct MemoryFactAggregates {
    hospitals: Mutex<Vec<HospitalFact>>,
    prices: Mutex<Vec<PriceFact>>,
}

impl MemoryFactAggregates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hospital(&self, state: Option<&str>) {
        self.hospitals
            .lock()
            .expect("lock poisoned")
            .push(HospitalFact {
                state: state.map(str::to_string),
            });
    }

    pub fn add_price(&self, service_code: &str, gross_charge: f64) {
        self.prices.lock().expect("lock poisoned").push(PriceFact {
            service_code: service_code.to_string(),
            gross_charge,
        });
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn stddev_samp(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

#[async_trait]
impl FactAggregates for MemoryFactAggregates {
    async fn compute(&self, metric: &MetricDef) -> Result<Vec<AggregateRow>, StorageError> {
        match (metric.kind, metric.dimension) {
            (AggregateKind::Count, None) => {
                let count = self.hospitals.lock().expect("lock poisoned").len() as i64;
                Ok(vec![AggregateRow {
                    dimensions: MetricDimensions::default(),
                    value: count as f64,
                    sample_size: count,
                }])
            }
            (AggregateKind::GroupedCount, Some(FactDimension::State)) => {
                let hospitals = self.hospitals.lock().expect("lock poisoned");
                let mut counts: std::collections::BTreeMap<String, i64> = Default::default();
                for h in hospitals.iter() {
                    if let Some(state) = &h.state {
                        *counts.entry(state.clone()).or_default() += 1;
                    }
                }
                Ok(counts
                    .into_iter()
                    .map(|(state, count)| AggregateRow {
                        dimensions: MetricDimensions::state(state),
                        value: count as f64,
                        sample_size: count,
                    })
                    .collect())
            }
            (AggregateKind::Average, None) => {
                let prices = self.prices.lock().expect("lock poisoned");
                let charges: Vec<f64> = prices.iter().map(|p| p.gross_charge).collect();
                Ok(mean(&charges)
                    .map(|value| {
                        vec![AggregateRow {
                            dimensions: MetricDimensions::default(),
                            value,
                            sample_size: charges.len() as i64,
                        }]
                    })
                    .unwrap_or_default())
            }
            (AggregateKind::StdDev, None) => {
                let prices = self.prices.lock().expect("lock poisoned");
                let charges: Vec<f64> = prices.iter().map(|p| p.gross_charge).collect();
                Ok(stddev_samp(&charges)
                    .map(|value| {
                        vec![AggregateRow {
                            dimensions: MetricDimensions::default(),
                            value,
                            sample_size: charges.len() as i64,
                        }]
                    })
                    .unwrap_or_default())
            }
            (AggregateKind::TopN(n), Some(FactDimension::ServiceCode)) => {
                Ok(self.ranked_services(true, n as usize))
            }
            (AggregateKind::BottomN(n), Some(FactDimension::ServiceCode)) => {
                Ok(self.ranked_services(false, n as usize))
            }
            _ => Err(unsupported_shape(metric)),
        }
    }
}

impl MemoryFactAggregates {
    fn ranked_services(&self, descending: bool, n: usize) -> Vec<AggregateRow> {
        let prices = self.prices.lock().expect("lock poisoned");
        let mut grouped: std::collections::BTreeMap<String, Vec<f64>> = Default::default();
        for p in prices.iter() {
            grouped
                .entry(p.service_code.clone())
                .or_default()
                .push(p.gross_charge);
        }
        let mut rows: Vec<AggregateRow> = grouped
            .into_iter()
            .filter_map(|(code, charges)| {
                mean(&charges).map(|value| AggregateRow {
                    dimensions: MetricDimensions::service_code(code),
                    value,
                    sample_size: charges.len() as i64,
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            let ord = a.value.partial_cmp(&b.value).expect("finite charges");
            if descending { ord.reverse() } else { ord }
        });
        rows.truncate(n);
        rows
    }
}
