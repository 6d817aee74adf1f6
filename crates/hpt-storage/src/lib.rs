//! Durable storage for HPT: Postgres-backed stores for hospitals, the job
//! ledger, metric rows and fact aggregates; an immutable hash-addressed
//! artifact store for downloaded transparency files; and HTTP fetch
//! utilities with retry classification.
//!
//! Every store is expressed as a trait so orchestration code takes injected
//! dependencies; each trait ships a Postgres implementation and an in-memory
//! one for tests and local runs.

mod artifacts;
mod fetch;
mod hospitals;
mod jobs;
mod metrics;

pub use artifacts::{ArtifactStore, StoredArtifact};
pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use hospitals::{HospitalStore, MemoryHospitalStore, PgHospitalStore};
pub use jobs::{JobFilter, JobHandle, JobStore, MemoryJobStore, PgJobStore};
pub use metrics::{
    FactAggregates, HospitalFact, MemoryFactAggregates, MemoryMetricStore, MetricStore,
    PgFactAggregates, PgMetricStore, PriceFact,
};

use hpt_core::JobStatus;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hpt-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("job {id} not found")]
    JobNotFound { id: Uuid },
    #[error("job {id} cannot transition to {to:?}")]
    InvalidTransition { id: Uuid, to: JobStatus },
    #[error("{0}")]
    Message(String),
}
