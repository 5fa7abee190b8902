//! Optional VIN decoding that fills gaps in extracted records.
//!
//! Only records carrying a VIN and missing a year, make, model or known body type are
//! looked up. Decoded values never replace what the dealer's page said, and a failed
//! lookup leaves the record untouched.

use std::collections::HashMap;

use async_trait::async_trait;
use dossier_core::{VehicleRecord, VehicleType};
use dossier_storage::{FetchError, FetchSession, HttpFetcher};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::extract::InventoryRules;

pub const NHTSA_BASE_URL: &str = "https://vpic.nhtsa.dot.gov/api/vehicles";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VinDecoding {
    pub year: Option<u16>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub body_class: Option<String>,
}

#[derive(Debug, Error)]
pub enum VinDecodeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("vin decoder answered http status {0}")]
    Status(u16),
    #[error("decoding vin decoder response: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait VinDecoder: Send + Sync {
    /// `Ok(None)` when the decoder knows nothing about `vin`.
    async fn decode(&self, vin: &str) -> Result<Option<VinDecoding>, VinDecodeError>;
}

/// NHTSA vPIC `DecodeVinValues` client. Answers are cached for the life of the decoder;
/// failures are not.
#[derive(Debug)]
pub struct NhtsaVinDecoder {
    session: FetchSession,
    base_url: String,
    cache: Mutex<HashMap<String, Option<VinDecoding>>>,
}

impl NhtsaVinDecoder {
    pub fn new(fetcher: &HttpFetcher) -> Result<Self, FetchError> {
        Self::with_base_url(fetcher, NHTSA_BASE_URL)
    }

    pub fn with_base_url(fetcher: &HttpFetcher, base_url: &str) -> Result<Self, FetchError> {
        Ok(Self {
            session: fetcher.open_session()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: Mutex::new(HashMap::new()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct NhtsaEnvelope {
    #[serde(rename = "Results", default)]
    results: Vec<NhtsaRow>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct NhtsaRow {
    model_year: String,
    make: String,
    model: String,
    body_class: String,
}

fn present(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty() && !value.eq_ignore_ascii_case("not applicable")).then(|| value.to_string())
}

/// Reads a `DecodeVinValues` body. Blank fields come back as empty strings.
pub fn parse_nhtsa_response(body: &[u8]) -> Result<Option<VinDecoding>, serde_json::Error> {
    let envelope: NhtsaEnvelope = serde_json::from_slice(body)?;
    let Some(row) = envelope.results.into_iter().next() else {
        return Ok(None);
    };
    let decoding = VinDecoding {
        year: row.model_year.trim().parse().ok(),
        make: present(&row.make),
        model: present(&row.model),
        body_class: present(&row.body_class),
    };
    Ok((decoding != VinDecoding::default()).then_some(decoding))
}

#[async_trait]
impl VinDecoder for NhtsaVinDecoder {
    async fn decode(&self, vin: &str) -> Result<Option<VinDecoding>, VinDecodeError> {
        if let Some(hit) = self.cache.lock().await.get(vin) {
            return Ok(hit.clone());
        }
        let url = format!("{}/DecodeVinValues/{vin}?format=json", self.base_url);
        let resp = self.session.fetch_page(&url).await?;
        if !resp.status.is_success() {
            return Err(VinDecodeError::Status(resp.status.as_u16()));
        }
        let decoding = parse_nhtsa_response(&resp.body)?;
        self.cache
            .lock()
            .await
            .insert(vin.to_string(), decoding.clone());
        Ok(decoding)
    }
}

fn needs_decoding(record: &VehicleRecord) -> bool {
    record.vin.is_some()
        && (record.year.is_none()
            || record.make.is_none()
            || record.model.is_none()
            || record.vehicle_type == VehicleType::Other)
}

/// Fills missing fields from `decoder`, then re-runs body classification for records that
/// were still unclassified. Returns how many records changed.
pub async fn enrich_inventory(
    records: &mut [VehicleRecord],
    decoder: &dyn VinDecoder,
    rules: &InventoryRules,
) -> usize {
    let mut decoded: HashMap<String, Option<VinDecoding>> = HashMap::new();
    let mut changed = 0;
    for record in records.iter_mut().filter(|r| needs_decoding(r)) {
        let Some(vin) = record.vin.clone() else {
            continue;
        };
        if !decoded.contains_key(&vin) {
            let answer = match decoder.decode(&vin).await {
                Ok(answer) => answer,
                Err(err) => {
                    warn!(vin = %vin, error = %err, "vin decode failed");
                    None
                }
            };
            decoded.insert(vin.clone(), answer);
        }
        let Some(Some(decoding)) = decoded.get(&vin) else {
            continue;
        };
        if fill_from(record, decoding, rules) {
            changed += 1;
        }
    }
    debug!(changed, lookups = decoded.len(), "inventory enriched");
    changed
}

fn fill_from(record: &mut VehicleRecord, decoding: &VinDecoding, rules: &InventoryRules) -> bool {
    let before = record.clone();
    record.year = record.year.or(decoding.year);
    if record.make.is_none() {
        record.make = decoding.make.clone();
    }
    if record.model.is_none() {
        record.model = decoding.model.clone();
    }
    if record.vehicle_type == VehicleType::Other {
        record.vehicle_type = rules.classify_type(
            decoding.body_class.as_deref(),
            record.model.as_deref(),
            record.trim.as_deref(),
            None,
        );
    }
    *record != before
}
