//! Versioned payload envelope stored in the `payload` column.
//!
//! New jobs are written as `{"schema": ..., "version": ..., "body": ...}`.
//! Reading never fails: older rows holding a bare JSON value are wrapped at
//! version 0, and cells that are not JSON at all decode to an empty body.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::JobType;

/// Version written for newly enqueued payloads.
pub const CURRENT_PAYLOAD_VERSION: u32 = 1;

/// Version assigned to bare JSON payloads written before the envelope existed.
pub const LEGACY_PAYLOAD_VERSION: u32 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadEnvelope {
    pub schema: String,
    pub version: u32,
    pub body: Value,
}

/// How a stored payload cell was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadDecoding {
    /// A well-formed envelope.
    Envelope,
    /// Bare JSON from before the envelope; wrapped as-is.
    Legacy,
    /// Empty cell.
    Empty,
    /// Not JSON. Body defaults to `{}`.
    Malformed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    pub envelope: PayloadEnvelope,
    pub decoding: PayloadDecoding,
}

#[derive(Deserialize)]
struct RawEnvelope {
    schema: String,
    version: u32,
    #[serde(default)]
    body: Value,
}

impl PayloadEnvelope {
    pub fn new(job_type: &JobType, body: Value) -> Self {
        Self {
            schema: job_type.to_string(),
            version: CURRENT_PAYLOAD_VERSION,
            body,
        }
    }

    /// An empty-object body for `job_type`.
    pub fn empty(job_type: &JobType, version: u32) -> Self {
        Self {
            schema: job_type.to_string(),
            version,
            body: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a stored payload cell. Never fails.
    pub fn decode(raw: &str, job_type: &JobType) -> DecodedPayload {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return DecodedPayload {
                envelope: Self::empty(job_type, LEGACY_PAYLOAD_VERSION),
                decoding: PayloadDecoding::Empty,
            };
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                return DecodedPayload {
                    envelope: Self::empty(job_type, LEGACY_PAYLOAD_VERSION),
                    decoding: PayloadDecoding::Malformed,
                };
            }
        };

        if looks_like_envelope(&value)
            && let Ok(raw) = serde_json::from_value::<RawEnvelope>(value.clone())
        {
            return DecodedPayload {
                envelope: PayloadEnvelope {
                    schema: raw.schema,
                    version: raw.version,
                    body: raw.body,
                },
                decoding: PayloadDecoding::Envelope,
            };
        }

        DecodedPayload {
            envelope: PayloadEnvelope {
                schema: job_type.to_string(),
                version: LEGACY_PAYLOAD_VERSION,
                body: value,
            },
            decoding: PayloadDecoding::Legacy,
        }
    }

    /// Convenience accessor for a string field in the body.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(|v| v.as_str())
    }
}

fn looks_like_envelope(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|m| m.contains_key("schema") && m.contains_key("version"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_decodes_back() {
        let env = PayloadEnvelope::new(&JobType::ExportCsv, json!({"sheetName": "Sales"}));
        let raw = env.encode().unwrap();
        let decoded = PayloadEnvelope::decode(&raw, &JobType::ExportCsv);
        assert_eq!(decoded.decoding, PayloadDecoding::Envelope);
        assert_eq!(decoded.envelope, env);
        assert_eq!(decoded.envelope.str_field("sheetName"), Some("Sales"));
    }

    #[test]
    fn bare_json_is_legacy() {
        let decoded = PayloadEnvelope::decode(r#"{"days": 30}"#, &JobType::BatchCleanup);
        assert_eq!(decoded.decoding, PayloadDecoding::Legacy);
        assert_eq!(decoded.envelope.version, LEGACY_PAYLOAD_VERSION);
        assert_eq!(decoded.envelope.schema, "BATCH_CLEANUP");
        assert_eq!(decoded.envelope.body, json!({"days": 30}));
    }

    #[test]
    fn malformed_defaults_to_empty_object() {
        let decoded = PayloadEnvelope::decode("{not json", &JobType::GenerateReport);
        assert_eq!(decoded.decoding, PayloadDecoding::Malformed);
        assert_eq!(decoded.envelope.body, json!({}));
    }

    #[test]
    fn empty_cell_is_not_malformed() {
        let decoded = PayloadEnvelope::decode("   ", &JobType::CalculateStats);
        assert_eq!(decoded.decoding, PayloadDecoding::Empty);
        assert_eq!(decoded.envelope.body, json!({}));
    }

    #[test]
    fn object_with_schema_but_bad_version_is_legacy() {
        let decoded =
            PayloadEnvelope::decode(r#"{"schema": "x", "version": "two"}"#, &JobType::ExportCsv);
        assert_eq!(decoded.decoding, PayloadDecoding::Legacy);
        assert_eq!(decoded.envelope.body["schema"], "x");
    }
}
