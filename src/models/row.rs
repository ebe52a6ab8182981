use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::middleware::RelayError;

pub const SOURCE_RELAY_URI_FIELD: &str = "_source_relay_uri_";
pub const SOURCE_ID_FIELD: &str = "_source_id_";
pub const RELAY_METADATA_FIELD: &str = "_relay_metadata_";
pub const METADATA_RELAY_FIELD: &str = "_source_relay_";
pub const METADATA_SOURCE_FIELD: &str = "_source_id_";

/// Engine row tagged with where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub values: Map<String, Value>,
    pub source_relay_uri: String,
    pub source_id: String,
}

/// Provenance envelope used by the polling transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayMetadata {
    #[serde(rename = "_source_relay_")]
    pub source_relay: String,
    #[serde(rename = "_source_id_")]
    pub source_id: String,
}

impl ResultRow {
    pub fn new(
        values: Map<String, Value>,
        source_relay_uri: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            values,
            source_relay_uri: source_relay_uri.into(),
            source_id: source_id.into(),
        }
    }

    /// Flat object with the provenance columns alongside the data columns
    pub fn to_streaming_json(&self) -> Value {
        let mut values = self.values.clone();
        values.insert(
            SOURCE_RELAY_URI_FIELD.to_string(),
            Value::String(self.source_relay_uri.clone()),
        );
        values.insert(SOURCE_ID_FIELD.to_string(), Value::String(self.source_id.clone()));
        Value::Object(values)
    }

    /// Object with provenance nested under `_relay_metadata_`
    pub fn to_polling_json(&self) -> Value {
        let mut values = self.values.clone();
        let metadata = RelayMetadata {
            source_relay: self.source_relay_uri.clone(),
            source_id: self.source_id.clone(),
        };
        values.insert(
            RELAY_METADATA_FIELD.to_string(),
            serde_json::to_value(metadata).unwrap_or(Value::Null),
        );
        Value::Object(values)
    }

    /// Parse a streamed row. Rows without provenance are rejected.
    pub fn from_streaming_json(value: Value) -> Result<Self, RelayError> {
        let mut values = match value {
            Value::Object(map) => map,
            other => {
                return Err(RelayError::Remote(format!(
                    "expected a JSON object row, got {}",
                    other
                )))
            }
        };
        let relay = take_string(&mut values, SOURCE_RELAY_URI_FIELD)?;
        let source = take_string(&mut values, SOURCE_ID_FIELD)?;
        Ok(Self::new(values, relay, source))
    }

    /// Parse a polled row, flattening the metadata envelope
    pub fn from_polling_json(value: Value) -> Result<Self, RelayError> {
        let mut values = match value {
            Value::Object(map) => map,
            other => {
                return Err(RelayError::Remote(format!(
                    "expected a JSON object row, got {}",
                    other
                )))
            }
        };
        let metadata = values.remove(RELAY_METADATA_FIELD).ok_or_else(|| {
            RelayError::Remote(format!("row is missing {}", RELAY_METADATA_FIELD))
        })?;
        let metadata: RelayMetadata = serde_json::from_value(metadata)
            .map_err(|e| RelayError::Remote(format!("malformed {}: {}", RELAY_METADATA_FIELD, e)))?;
        Ok(Self::new(values, metadata.source_relay, metadata.source_id))
    }
}

fn take_string(values: &mut Map<String, Value>, field: &str) -> Result<String, RelayError> {
    match values.remove(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        _ => Err(RelayError::Remote(format!("row is missing provenance field {}", field))),
    }
}
