//! Wire format of published jobs and decoding of received bodies.

use crate::error::ArgumentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// JSON body of a published job.
///
/// ```json
/// {"job": "MailerJob", "method": "perform", "args": [42, "welcome"], "sent_at": "2026-01-01T00:00:00Z"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job: String,
    pub method: String,
    pub args: Vec<Value>,
    pub sent_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(job: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            job: job.into(),
            method: method.into(),
            args,
            sent_at: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A decoded message body: JSON when it parses, otherwise the untouched bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Raw(Vec<u8>),
}

impl Payload {
    /// Decode a message body. Never fails: undecodable bodies stay raw.
    pub fn decode(data: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(data) {
            Ok(value) => Payload::Json(value),
            Err(e) => {
                debug!(error = %e, bytes = data.len(), "Payload is not JSON, keeping raw body");
                Payload::Raw(data.to_vec())
            }
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Payload::Raw(_))
    }

    /// Positional arguments carried by the payload's `args` field.
    ///
    /// A mapping contributes its values in insertion order; a missing or null
    /// `args` means no arguments. A body that is not a JSON object cannot be
    /// mapped onto positional arguments.
    pub fn args(&self) -> Result<Vec<Value>, ArgumentError> {
        let Some(Value::Object(fields)) = self.as_json() else {
            return Err(ArgumentError::new(
                "payload is not a JSON object, cannot extract args",
            ));
        };

        Ok(match fields.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(args)) => args.clone(),
            Some(Value::Object(named)) => named.values().cloned().collect(),
            Some(single) => vec![single.clone()],
        })
    }

    /// The envelope's `sent_at`, when present and well formed.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.as_json()?
            .get("sent_at")?
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = JobEnvelope::new("MailerJob", "perform", vec![json!(1), json!("two")]);
        let value: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(value["job"], "MailerJob");
        assert_eq!(value["method"], "perform");
        assert_eq!(value["args"], json!([1, "two"]));
        let sent_at = value["sent_at"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(sent_at).is_ok());
    }

    #[test]
    fn test_decode_falls_back_to_raw() {
        let payload = Payload::decode(b"not a json string");
        assert_eq!(payload, Payload::Raw(b"not a json string".to_vec()));
        assert!(payload.is_raw());
    }

    #[test]
    fn test_args_from_array() {
        let payload = Payload::decode(br#"{"args": [1, 2]}"#);
        assert_eq!(payload.args().unwrap(), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_args_from_mapping_keep_insertion_order() {
        let payload = Payload::decode(br#"{"args": {"zeta": 1, "alpha": 2, "mid": 3}}"#);
        assert_eq!(payload.args().unwrap(), vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_args_missing_or_null() {
        assert!(Payload::decode(br#"{"job": "X"}"#).args().unwrap().is_empty());
        assert!(Payload::decode(br#"{"args": null}"#).args().unwrap().is_empty());
    }

    #[test]
    fn test_args_rejects_non_object_payload() {
        assert!(Payload::decode(b"[1, 2]").args().is_err());
        assert!(Payload::decode(b"plain text").args().is_err());
    }

    #[test]
    fn test_sent_at_round_trip() {
        let envelope = JobEnvelope::new("ReportJob", "perform", vec![]);
        let payload = Payload::decode(&envelope.to_bytes().unwrap());
        assert_eq!(payload.sent_at(), Some(envelope.sent_at));
    }
}
