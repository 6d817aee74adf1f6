//! Jurisdictional registry lookup: the contract the scanner calls per
//! jurisdiction, its HTTP implementation, and the wire-format decoder.
//!
//! Registries serve camelCase JSON listings of hospitals, each carrying the
//! transparency files it currently advertises.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hpt_core::{FileManifestEntry, HospitalDraft};
use hpt_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use thiserror::Error;

pub const CRATE_NAME: &str = "hpt-registry";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry fetch for {jurisdiction} failed: {source}")]
    Fetch {
        jurisdiction: String,
        #[source]
        source: FetchError,
    },
    #[error("registry listing for {jurisdiction} is not valid JSON: {source}")]
    Decode {
        jurisdiction: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Message(String),
}

/// One lookup per jurisdiction. The scanner only sees this trait, so tests
/// substitute a canned implementation.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn list_hospitals(
        &self,
        jurisdiction: &str,
    ) -> Result<Vec<HospitalDraft>, RegistryError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireListing {
    #[serde(default)]
    hospitals: Vec<WireHospital>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHospital {
    id: String,
    name: String,
    address: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip_code: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    bed_count: Option<i32>,
    #[serde(default)]
    certification_numbers: Vec<String>,
    #[serde(default)]
    files: Vec<WireFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFile {
    file_id: String,
    filename: String,
    url: String,
    size: Option<String>,
    suffix: Option<String>,
    /// When the registry itself last refreshed this file.
    retrieved: Option<DateTime<Utc>>,
}

impl From<WireHospital> for HospitalDraft {
    fn from(wire: WireHospital) -> Self {
        HospitalDraft {
            external_id: wire.id,
            name: wire.name,
            address: wire.address,
            city: wire.city,
            state: wire.state,
            zip_code: wire.zip_code,
            latitude: wire.latitude,
            longitude: wire.longitude,
            bed_count: wire.bed_count,
            certification_numbers: wire.certification_numbers,
            files: wire
                .files
                .into_iter()
                .map(|f| FileManifestEntry {
                    file_id: f.file_id,
                    filename: f.filename,
                    url: f.url,
                    size_display: f.size,
                    suffix: f.suffix,
                    retrieved_at: f.retrieved,
                })
                .collect(),
        }
    }
}

/// Decode one registry listing payload.
pub fn parse_hospital_listing(
    jurisdiction: &str,
    body: &[u8],
) -> Result<Vec<HospitalDraft>, RegistryError> {
    let listing: WireListing =
        serde_json::from_slice(body).map_err(|source| RegistryError::Decode {
            jurisdiction: jurisdiction.to_string(),
            source,
        })?;
    Ok(listing.hospitals.into_iter().map(Into::into).collect())
}

/// Live registry client over the shared HTTP fetcher.
#[derive(Debug)]
pub struct HttpRegistryClient {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl HttpRegistryClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn listing_url(&self, jurisdiction: &str) -> String {
        format!(
            "{}/api/hospitals?state={jurisdiction}",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn list_hospitals(
        &self,
        jurisdiction: &str,
    ) -> Result<Vec<HospitalDraft>, RegistryError> {
        let url = self.listing_url(jurisdiction);
        let response =
            self.http
                .fetch_bytes(jurisdiction, &url)
                .await
                .map_err(|source| RegistryError::Fetch {
                    jurisdiction: jurisdiction.to_string(),
                    source,
                })?;
        parse_hospital_listing(jurisdiction, &response.body)
    }
}

/// Load a captured registry listing from disk, for local runs against saved
/// responses.
pub fn load_fixture_listing(
    jurisdiction: &str,
    path: impl AsRef<Path>,
) -> anyhow::Result<Vec<HospitalDraft>> {
    let path = path.as_ref();
    let body = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_hospital_listing(jurisdiction, &body)
        .with_context(|| format!("decoding {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"{
        "hospitals": [
            {
                "id": "pa-390001",
                "name": "Springfield General",
                "address": "1 Main St",
                "city": "Springfield",
                "state": "PA",
                "zipCode": "19064",
                "latitude": 39.93,
                "longitude": -75.34,
                "bedCount": 120,
                "certificationNumbers": ["390001"],
                "files": [
                    {
                        "fileId": "f-1",
                        "filename": "standardcharges.csv",
                        "url": "https://springfield.example.org/cdm.csv",
                        "size": "1.2 MB",
                        "suffix": "csv",
                        "retrieved": "2024-03-01T06:00:00Z"
                    }
                ]
            },
            {
                "id": "pa-390044",
                "name": "Riverside Medical Center",
                "files": []
            }
        ]
    }"#;

    #[test]
    fn decodes_a_full_listing() {
        let drafts = parse_hospital_listing("PA", LISTING.as_bytes()).unwrap();
        assert_eq!(drafts.len(), 2);

        let first = &drafts[0];
        assert_eq!(first.external_id, "pa-390001");
        assert_eq!(first.state.as_deref(), Some("PA"));
        assert_eq!(first.bed_count, Some(120));
        assert_eq!(first.files.len(), 1);

        let file = &first.files[0];
        assert_eq!(file.file_id, "f-1");
        assert_eq!(file.size_display.as_deref(), Some("1.2 MB"));
        assert_eq!(
            file.retrieved_at.map(|t| t.to_rfc3339()),
            Some("2024-03-01T06:00:00+00:00".to_string())
        );
    }

    #[test]
    fn tolerates_sparse_hospitals() {
        let drafts = parse_hospital_listing("PA", LISTING.as_bytes()).unwrap();
        let sparse = &drafts[1];
        assert_eq!(sparse.name, "Riverside Medical Center");
        assert!(sparse.address.is_none());
        assert!(sparse.files.is_empty());
        assert!(sparse.certification_numbers.is_empty());
    }

    #[test]
    fn empty_listing_is_empty_not_an_error() {
        let drafts = parse_hospital_listing("WY", br#"{"hospitals": []}"#).unwrap();
        assert!(drafts.is_empty());
        let drafts = parse_hospital_listing("WY", br#"{}"#).unwrap();
        assert!(drafts.is_empty());
    }

    #[test]
    fn malformed_body_reports_jurisdiction() {
        let err = parse_hospital_listing("TX", b"<html>503</html>").unwrap_err();
        assert!(err.to_string().contains("TX"));
    }
}
