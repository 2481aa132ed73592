//! Stream-entry codec.
//!
//! Stream entries are flat key/value string pairs. This module decodes them
//! into [`Message`] values, re-encodes messages for the retry queue, and
//! salvages what it can from malformed entries so the consumer can still
//! clean up after them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved correlation id that triggers OTP synthesis instead of a
/// template render.
pub const OTP_SENTINEL: &str = "otp";

/// A single submitted form field. Names may repeat and may carry a `[]`
/// suffix indicating multi-valued grouping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: String,
}

/// A decoded stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Opaque entry id assigned by the stream engine
    pub id: String,
    /// Client-supplied correlation / dedup key
    pub hex: String,
    /// External form identifier
    pub form_id: String,
    /// Free-form provenance label
    pub origin: String,
    /// Ordered submitted fields
    pub fields: Vec<Field>,
    /// Number of attachment blobs referenced by the manifest
    pub attachment_count: u32,
    /// Prior delivery attempts; zero on primary-stream entries
    pub fail_count: u32,
}

/// Why a raw entry could not be decoded. Decode failures are non-retriable;
/// the raw entry goes to the dead-letter sink.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid numeric field `{field}`: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("invalid fields payload: {0}")]
    InvalidFields(#[from] serde_json::Error),
}

impl Message {
    /// Decode a flat entry map into a message. Unknown keys are ignored.
    pub fn decode(id: &str, entry: &HashMap<String, String>) -> Result<Self, DecodeError> {
        let hex = require(entry, "hex")?;
        let form_id = require(entry, "form_id")?;
        let origin = require(entry, "origin")?;

        let raw_fields = require(entry, "fields")?;
        let fields: Vec<Field> = serde_json::from_str(&raw_fields)?;

        let attachment_count = parse_u32(entry, "attachment_count")?
            .ok_or(DecodeError::MissingField("attachment_count"))?;

        // fail_count only appears on retry-stream entries
        let fail_count = parse_u32(entry, "fail_count")?.unwrap_or(0);

        Ok(Message {
            id: id.to_string(),
            hex,
            form_id,
            origin,
            fields,
            attachment_count,
            fail_count,
        })
    }

    /// Encode this message as a retry envelope: the original payload with a
    /// bumped `fail_count` and the source entry id carried along for
    /// correlation. The retry stream assigns its own entry id.
    pub fn retry_pairs(&self, next_fail_count: u32) -> Vec<(String, String)> {
        vec![
            ("hex".into(), self.hex.clone()),
            ("form_id".into(), self.form_id.clone()),
            (
                "fields".into(),
                serde_json::to_string(&self.fields).unwrap_or_else(|_| "[]".into()),
            ),
            ("origin".into(), self.origin.clone()),
            ("attachment_count".into(), self.attachment_count.to_string()),
            ("fail_count".into(), next_fail_count.to_string()),
            ("source_id".into(), self.id.clone()),
        ]
    }

    /// Serialized fields for dead-letter records.
    pub fn fields_json(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_else(|_| "[]".into())
    }
}

fn require(entry: &HashMap<String, String>, key: &'static str) -> Result<String, DecodeError> {
    entry
        .get(key)
        .cloned()
        .ok_or(DecodeError::MissingField(key))
}

fn parse_u32(
    entry: &HashMap<String, String>,
    key: &'static str,
) -> Result<Option<u32>, DecodeError> {
    match entry.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| DecodeError::InvalidNumber {
                field: key,
                value: raw.clone(),
            }),
    }
}

/// Pull the correlation id out of a malformed entry, if present.
pub fn salvage_hex(entry: &HashMap<String, String>) -> Option<&str> {
    entry.get("hex").map(String::as_str).filter(|h| !h.is_empty())
}

/// Pull a usable attachment count out of a malformed entry. An unparseable
/// value degrades to zero rather than blocking cleanup.
pub fn salvage_attachment_count(entry: &HashMap<String, String>) -> u32 {
    entry
        .get("attachment_count")
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn valid_entry() -> HashMap<String, String> {
        entry(&[
            ("hex", "a1b2c3d4e5f60718293a4b5c6d7e8f90"),
            ("form_id", "frm_123"),
            ("origin", "web"),
            ("fields", r#"[{"name":"email","value":"x@y.example"}]"#),
            ("attachment_count", "0"),
        ])
    }

    #[test]
    fn test_decode_valid() {
        let msg = Message::decode("1700000000000-0", &valid_entry()).unwrap();
        assert_eq!(msg.id, "1700000000000-0");
        assert_eq!(msg.hex, "a1b2c3d4e5f60718293a4b5c6d7e8f90");
        assert_eq!(msg.form_id, "frm_123");
        assert_eq!(msg.origin, "web");
        assert_eq!(msg.fields.len(), 1);
        assert_eq!(msg.fields[0].name, "email");
        assert_eq!(msg.attachment_count, 0);
        assert_eq!(msg.fail_count, 0);
    }

    #[test]
    fn test_decode_fail_count_present() {
        let mut raw = valid_entry();
        raw.insert("fail_count".into(), "3".into());
        let msg = Message::decode("1-0", &raw).unwrap();
        assert_eq!(msg.fail_count, 3);
    }

    #[test]
    fn test_decode_ignores_unknown_keys() {
        let mut raw = valid_entry();
        raw.insert("source_id".into(), "1699999999999-7".into());
        raw.insert("extra".into(), "junk".into());
        assert!(Message::decode("1-0", &raw).is_ok());
    }

    #[test]
    fn test_decode_missing_hex() {
        let mut raw = valid_entry();
        raw.remove("hex");
        match Message::decode("1-0", &raw) {
            Err(DecodeError::MissingField("hex")) => {}
            other => panic!("expected MissingField(hex), got {other:?}"),
        }
    }

    #[test]
    fn test_decode_bad_attachment_count() {
        let mut raw = valid_entry();
        raw.insert("attachment_count".into(), "two".into());
        match Message::decode("1-0", &raw) {
            Err(DecodeError::InvalidNumber { field, value }) => {
                assert_eq!(field, "attachment_count");
                assert_eq!(value, "two");
            }
            other => panic!("expected InvalidNumber, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_bad_fail_count() {
        let mut raw = valid_entry();
        raw.insert("fail_count".into(), "-1".into());
        assert!(matches!(
            Message::decode("1-0", &raw),
            Err(DecodeError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn test_decode_bad_fields_json() {
        let mut raw = valid_entry();
        raw.insert("fields".into(), "{not json".into());
        assert!(matches!(
            Message::decode("1-0", &raw),
            Err(DecodeError::InvalidFields(_))
        ));
    }

    #[test]
    fn test_retry_pairs_round_trip() {
        let mut raw = valid_entry();
        raw.insert("fail_count".into(), "1".into());
        let msg = Message::decode("1700000000000-0", &raw).unwrap();

        let pairs = msg.retry_pairs(2);
        let reencoded: HashMap<String, String> = pairs.into_iter().collect();
        assert_eq!(reencoded["fail_count"], "2");
        assert_eq!(reencoded["source_id"], "1700000000000-0");

        let again = Message::decode("1700000000001-0", &reencoded).unwrap();
        assert_eq!(again.hex, msg.hex);
        assert_eq!(again.fields, msg.fields);
        assert_eq!(again.fail_count, 2);
    }

    #[test]
    fn test_salvage_from_malformed() {
        let raw = entry(&[
            ("hex", "deadbeef"),
            ("attachment_count", "3"),
            ("fields", "{broken"),
        ]);
        assert_eq!(salvage_hex(&raw), Some("deadbeef"));
        assert_eq!(salvage_attachment_count(&raw), 3);
    }

    #[test]
    fn test_salvage_degrades_to_nothing() {
        let raw = entry(&[("attachment_count", "lots")]);
        assert_eq!(salvage_hex(&raw), None);
        assert_eq!(salvage_attachment_count(&raw), 0);
    }
}
