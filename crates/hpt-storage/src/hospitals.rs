//! Hospital entity store. Upserts are keyed by the stable external registry
//! id: a hospital is inserted on first sighting and updated in place on every
//! subsequent scan, never duplicated. Last writer wins across overlapping
//! scans; there is no optimistic-concurrency check.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hpt_core::{Hospital, HospitalDraft, HospitalUpsert, UpsertOutcome};
use sqlx::PgPool;
use uuid::Uuid;

use crate::StorageError;

#[async_trait]
pub trait HospitalStore: Send + Sync {
    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Hospital>, StorageError>;

    /// Insert or update by external id, stamping `last_updated` to
    /// `observed_at` in every case. The returned outcome distinguishes a
    /// fresh insert, a field change, and an observation that changed nothing.
    async fn upsert(
        &self,
        draft: &HospitalDraft,
        observed_at: DateTime<Utc>,
    ) -> Result<HospitalUpsert, StorageError>;
}

fn draft_matches(existing: &Hospital, draft: &HospitalDraft) -> bool {
    existing.name == draft.name
        && existing.address == draft.address
        && existing.city == draft.city
        && existing.state == draft.state
        && existing.zip_code == draft.zip_code
        && existing.latitude == draft.latitude
        && existing.longitude == draft.longitude
        && existing.bed_count == draft.bed_count
        && existing.certification_numbers == draft.certification_numbers
}

#[derive(Debug, sqlx::FromRow)]
struct HospitalRow {
    id: Uuid,
    external_id: String,
    name: String,
    address: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip_code: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    bed_count: Option<i32>,
    certification_numbers: Vec<String>,
    last_updated: DateTime<Utc>,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl From<HospitalRow> for Hospital {
    fn from(row: HospitalRow) -> Self {
        Hospital {
            id: row.id,
            external_id: row.external_id,
            name: row.name,
            address: row.address,
            city: row.city,
            state: row.state,
            zip_code: row.zip_code,
            latitude: row.latitude,
            longitude: row.longitude,
            bed_count: row.bed_count,
            certification_numbers: row.certification_numbers,
            last_updated: row.last_updated,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}

const SELECT_HOSPITAL: &str = "SELECT id, external_id, name, address, city, state, zip_code, \
     latitude, longitude, bed_count, certification_numbers, last_updated, is_active, created_at \
     FROM hospitals WHERE external_id = $1";

#[derive(Debug, Clone)]
pub struct PgHospitalStore {
    pool: PgPool,
}

impl PgHospitalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HospitalStore for PgHospitalStore {
    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Hospital>, StorageError> {
        let row = sqlx::query_as::<_, HospitalRow>(SELECT_HOSPITAL)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Hospital::from))
    }

    async fn upsert(
        &self,
        draft: &HospitalDraft,
        observed_at: DateTime<Utc>,
    ) -> Result<HospitalUpsert, StorageError> {
        let existing = sqlx::query_as::<_, HospitalRow>(SELECT_HOSPITAL)
            .bind(&draft.external_id)
            .fetch_optional(&self.pool)
            .await?;

        match existing {
            None => {
                let id = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO hospitals \
                       (id, external_id, name, address, city, state, zip_code, latitude, \
                        longitude, bed_count, certification_numbers, last_updated, is_active, \
                        created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, TRUE, $12)",
                )
                .bind(id)
                .bind(&draft.external_id)
                .bind(&draft.name)
                .bind(&draft.address)
                .bind(&draft.city)
                .bind(&draft.state)
                .bind(&draft.zip_code)
                .bind(draft.latitude)
                .bind(draft.longitude)
                .bind(draft.bed_count)
                .bind(&draft.certification_numbers)
                .bind(observed_at)
                .execute(&self.pool)
                .await?;

                Ok(HospitalUpsert {
                    id,
                    outcome: UpsertOutcome::Created,
                    previous_last_updated: None,
                })
            }
            Some(row) => {
                let previous_last_updated = row.last_updated;
                let hospital: Hospital = row.into();
                let outcome = if draft_matches(&hospital, draft) {
                    UpsertOutcome::Unchanged
                } else {
                    UpsertOutcome::Updated
                };

                sqlx::query(
                    "UPDATE hospitals SET name = $2, address = $3, city = $4, state = $5, \
                       zip_code = $6, latitude = $7, longitude = $8, bed_count = $9, \
                       certification_numbers = $10, last_updated = $11 \
                     WHERE id = $1",
                )
                .bind(hospital.id)
                .bind(&draft.name)
                .bind(&draft.address)
                .bind(&draft.city)
                .bind(&draft.state)
                .bind(&draft.zip_code)
                .bind(draft.latitude)
                .bind(draft.longitude)
                .bind(draft.bed_count)
                .bind(&draft.certification_numbers)
                .bind(observed_at)
                .execute(&self.pool)
                .await?;

                Ok(HospitalUpsert {
                    id: hospital.id,
                    outcome,
                    previous_last_updated: Some(previous_last_updated),
                })
            }
        }
    }
}

/// In-memory hospital store for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryHospitalStore {
    by_external_id: Mutex<HashMap<String, Hospital>>,
}

impl MemoryHospitalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_external_id.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl HospitalStore for MemoryHospitalStore {
    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Hospital>, StorageError> {
        let map = self.by_external_id.lock().expect("lock poisoned");
        Ok(map.get(external_id).cloned())
    }

    async fn upsert(
        &self,
        draft: &HospitalDraft,
        observed_at: DateTime<Utc>,
    ) -> Result<HospitalUpsert, StorageError> {
        let mut map = self.by_external_id.lock().expect("lock poisoned");

        match map.get_mut(&draft.external_id) {
            None => {
                let id = Uuid::new_v4();
                map.insert(
                    draft.external_id.clone(),
                    Hospital {
                        id,
                        external_id: draft.external_id.clone(),
                        name: draft.name.clone(),
                        address: draft.address.clone(),
                        city: draft.city.clone(),
                        state: draft.state.clone(),
                        zip_code: draft.zip_code.clone(),
                        latitude: draft.latitude,
                        longitude: draft.longitude,
                        bed_count: draft.bed_count,
                        certification_numbers: draft.certification_numbers.clone(),
                        last_updated: observed_at,
                        is_active: true,
                        created_at: observed_at,
                    },
                );
                Ok(HospitalUpsert {
                    id,
                    outcome: UpsertOutcome::Created,
                    previous_last_updated: None,
                })
            }
            Some(existing) => {
                let previous_last_updated = existing.last_updated;
                let outcome = if draft_matches(existing, draft) {
                    UpsertOutcome::Unchanged
                } else {
                    UpsertOutcome::Updated
                };

                existing.name = draft.name.clone();
                existing.address = draft.address.clone();
                existing.city = draft.city.clone();
                existing.state = draft.state.clone();
                existing.zip_code = draft.zip_code.clone();
                existing.latitude = draft.latitude;
                existing.longitude = draft.longitude;
                existing.bed_count = draft.bed_count;
                existing.certification_numbers = draft.certification_numbers.clone();
                existing.last_updated = observed_at;

                Ok(HospitalUpsert {
                    id: existing.id,
                    outcome,
                    previous_last_updated: Some(previous_last_updated),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn draft(external_id: &str, name: &str) -> HospitalDraft {
        HospitalDraft {
            external_id: external_id.to_string(),
            name: name.to_string(),
            address: Some("1 Main St".into()),
            city: Some("Springfield".into()),
            state: Some("PA".into()),
            zip_code: Some("19064".into()),
            latitude: Some(39.9),
            longitude: Some(-75.3),
            bed_count: Some(120),
            certification_numbers: vec!["390001".into()],
            files: vec![],
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn first_sighting_creates() {
        let store = MemoryHospitalStore::new();
        let result = store.upsert(&draft("ext-1", "General"), at(1)).await.unwrap();
        assert_eq!(result.outcome, UpsertOutcome::Created);
        assert!(result.previous_last_updated.is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn resighting_never_duplicates() {
        let store = MemoryHospitalStore::new();
        let first = store.upsert(&draft("ext-1", "General"), at(1)).await.unwrap();
        let second = store.upsert(&draft("ext-1", "General"), at(2)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unchanged_observation_still_stamps_last_updated() {
        let store = MemoryHospitalStore::new();
        store.upsert(&draft("ext-1", "General"), at(1)).await.unwrap();
        let second = store.upsert(&draft("ext-1", "General"), at(2)).await.unwrap();

        assert_eq!(second.outcome, UpsertOutcome::Unchanged);
        assert_eq!(second.previous_last_updated, Some(at(1)));

        let stored = store.find_by_external_id("ext-1").await.unwrap().unwrap();
        assert_eq!(stored.last_updated, at(2));
    }

    #[tokio::test]
    async fn field_change_reports_updated() {
        let store = MemoryHospitalStore::new();
        store.upsert(&draft("ext-1", "General"), at(1)).await.unwrap();
        let second = store
            .upsert(&draft("ext-1", "General Medical Center"), at(2))
            .await
            .unwrap();
        assert_eq!(second.outcome, UpsertOutcome::Updated);
    }
}
