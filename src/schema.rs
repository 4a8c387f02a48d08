//! Extraction record types shared by the normalizer, the store and the API.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Field name → extracted value.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Field name → confidence score in `[0, 100]`.
pub type ConfidenceMap = BTreeMap<String, f64>;

/// Document name used when the caller does not supply one.
pub const UNTITLED_DOCUMENT: &str = "Untitled Document";

/// A single extracted value. The model is asked for strings or numbers; any
/// other JSON it returns is folded into text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(serde_json::Number),
    Text(String),
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Number(n) => FieldValue::Number(n),
            Value::String(s) => FieldValue::Text(s),
            Value::Null => FieldValue::Text(String::new()),
            Value::Bool(b) => FieldValue::Text(b.to_string()),
            other => FieldValue::Text(other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(FieldValue::from)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

/// Normalized output of processing one document image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub fields: FieldMap,
    #[serde(default)]
    pub confidence: ConfidenceMap,
    #[serde(default)]
    pub raw_text: String,
    pub processed_at: DateTime<Utc>,
}

/// A record ready to be persisted; the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub caller_id: String,
    pub document_name: String,
    pub fields: FieldMap,
    pub confidence: ConfidenceMap,
    pub raw_text: String,
    pub processed_at: DateTime<Utc>,
}

impl NewDocument {
    pub fn from_result(
        result: ExtractionResult,
        caller_id: impl Into<String>,
        document_name: Option<&str>,
    ) -> Self {
        Self {
            caller_id: caller_id.into(),
            document_name: document_name_or_default(document_name),
            fields: result.fields,
            confidence: result.confidence,
            raw_text: result.raw_text,
            processed_at: result.processed_at,
        }
    }

    /// Mean confidence across all scored fields, `0` when nothing is scored.
    pub fn total_accuracy(&self) -> f64 {
        total_accuracy(&self.confidence)
    }
}

/// A persisted record, as returned by history queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(rename = "user_ip")]
    pub caller_id: String,
    pub document_name: String,
    pub fields: FieldMap,
    #[serde(default)]
    pub confidence: ConfidenceMap,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub total_accuracy: f64,
    pub processed_at: DateTime<Utc>,
}

impl StoredDocument {
    pub fn from_new(id: String, doc: NewDocument) -> Self {
        let total_accuracy = doc.total_accuracy();
        Self {
            id,
            caller_id: doc.caller_id,
            document_name: doc.document_name,
            fields: doc.fields,
            confidence: doc.confidence,
            raw_text: doc.raw_text,
            total_accuracy,
            processed_at: doc.processed_at,
        }
    }
}

pub fn total_accuracy(confidence: &ConfidenceMap) -> f64 {
    if confidence.is_empty() {
        return 0.0;
    }
    confidence.values().sum::<f64>() / confidence.len() as f64
}

fn document_name_or_default(name: Option<&str>) -> String {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(UNTITLED_DOCUMENT)
        .to_string()
}

/// Row ids come back as integers or uuids depending on the table definition.
pub fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "unexpected id value: {}",
            other
        ))),
    }
}
