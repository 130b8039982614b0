//! Device roster loading.
//!
//! The roster is read once at start-up from an inventory source and turned
//! into [`Device`]s. A source failure is fatal; a bad record is only skipped.

use crate::config::{FieldMapping, RosterConfig};
use crate::device::{Credentials, Device};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub type RosterRecord = Map<String, Value>;

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("Failed to read roster file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Roster request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid roster header {0}")]
    InvalidHeader(String),

    #[error("Malformed roster payload: {0}")]
    Payload(String),
}

/// Inventory of camera records.
#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn load(&self) -> Result<Vec<RosterRecord>, RosterError>;
}

/// Roster stored as a local JSON document.
pub struct FileRoster {
    path: PathBuf,
}

impl FileRoster {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RosterSource for FileRoster {
    async fn load(&self) -> Result<Vec<RosterRecord>, RosterError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|source| RosterError::Io {
                path: self.path.clone(),
                source,
            })?;

        let payload: Value =
            serde_json::from_slice(&raw).map_err(|e| RosterError::Payload(e.to_string()))?;

        extract_records(payload)
    }
}

/// Roster served by an inventory HTTP API.
pub struct HttpRoster {
    client: reqwest::Client,
    url: String,
}

impl HttpRoster {
    pub fn new(
        url: &str,
        headers: &std::collections::HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, RosterError> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| RosterError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| RosterError::InvalidHeader(name.to_string()))?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(header_map)
            .build()?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl RosterSource for HttpRoster {
    async fn load(&self) -> Result<Vec<RosterRecord>, RosterError> {
        debug!(url = %self.url, "Requesting device roster");

        let payload: Value = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        extract_records(payload)
    }
}

/// Build the configured roster source.
pub fn source_from_config(
    config: &RosterConfig,
    timeout: Duration,
) -> Result<Box<dyn RosterSource>, RosterError> {
    match (&config.file, &config.url) {
        (Some(path), _) => Ok(Box::new(FileRoster::new(path.clone()))),
        (None, Some(url)) => Ok(Box::new(HttpRoster::new(url, &config.headers, timeout)?)),
        (None, None) => Err(RosterError::Payload("no roster source configured".to_string())),
    }
}

/// Accept either a bare array or an object carrying a `records` array.
fn extract_records(payload: Value) -> Result<Vec<RosterRecord>, RosterError> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("records") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(RosterError::Payload(
                    "expected a `records` array".to_string(),
                ))
            }
        },
        _ => return Err(RosterError::Payload("expected an array or object".to_string())),
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(record) => Some(record),
            other => {
                warn!(record = %other, "Skipping non-object roster entry");
                None
            }
        })
        .collect())
}

/// Read a field as text. Numbers are stringified; blanks count as missing.
fn field_text(record: &RosterRecord, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn publish_disabled(record: &RosterRecord, fields: &FieldMapping) -> bool {
    fields
        .disable_publish
        .as_ref()
        .and_then(|field| record.get(field))
        .map(|value| match value {
            Value::Bool(flag) => *flag,
            Value::String(s) => s.eq_ignore_ascii_case("yes") || s.eq_ignore_ascii_case("true"),
            _ => false,
        })
        .unwrap_or(false)
}

/// Turn roster records into devices, skipping incomplete or invalid ones.
pub fn build_devices(
    records: &[RosterRecord],
    fields: &FieldMapping,
    fallback_image: &Bytes,
    failure_limit: u32,
    credentials: Option<&Credentials>,
) -> Vec<Device> {
    let mut devices = Vec::with_capacity(records.len());

    for (index, record) in records.iter().enumerate() {
        if publish_disabled(record, fields) {
            debug!(index, "Publishing disabled for roster record, skipping");
            continue;
        }

        let id = field_text(record, &fields.id).unwrap_or_default();
        let address = field_text(record, &fields.address).unwrap_or_default();
        let model = field_text(record, &fields.model).unwrap_or_default();

        match Device::new(
            &id,
            &address,
            &model,
            fallback_image.clone(),
            failure_limit,
            credentials,
        ) {
            Ok(device) => {
                debug!(
                    device_id = %device.id(),
                    address = %device.address(),
                    model = %device.model().as_str(),
                    "Device added from roster"
                );
                devices.push(device);
            }
            Err(e) => {
                warn!(index, device_id = %id, error = %e, "Skipping roster record");
            }
        }
    }

    info!(
        records = records.len(),
        devices = devices.len(),
        "Built devices from roster"
    );

    devices
}
