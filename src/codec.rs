//! Wire-value codec.
//!
//! Converts between [`Value`] trees and JSON that the server understands.
//! Special values travel as one-entry objects keyed by a tag:
//!
//! | Native      | Wire                                                  |
//! |-------------|-------------------------------------------------------|
//! | `Date`      | `{"$date": "2012-06-01T10:00:00.000Z"}`               |
//! | `Binary`    | `{"$binary": "<base64>"}`                             |
//! | `Regex`     | `{"$regexp": {"pattern": "^a", "options": 1}}`        |
//! | `Reference` | `{"$ref": {"entity": "users", "id": "507f"}}`         |
//!
//! Dates are written with millisecond precision; anything finer is truncated.
//! A user field whose name equals a tag is indistinguishable from a tagged
//! value and will be decoded as one.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value as Json};
use thiserror::Error;

use crate::value::{Map, Reference, Regex, RegexOptions, Value};

pub const DATE_TAG: &str = "$date";
pub const BINARY_TAG: &str = "$binary";
pub const REGEX_TAG: &str = "$regexp";
pub const REFERENCE_TAG: &str = "$ref";

/// A tagged node whose payload could not be reconstructed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("cannot decode {path}: {reason}")]
pub struct CodecError {
    pub path: String,
    pub reason: String,
}

impl CodecError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Formats a date the way it is sent to the server.
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Encode a value tree into wire JSON.
pub fn encode(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Number(n) => Json::Number(n.clone()),
        Value::String(s) => Json::String(s.clone()),
        Value::Array(items) => Json::Array(items.iter().map(encode).collect()),
        Value::Object(map) => encode_map(map),
        Value::Date(d) => json!({ DATE_TAG: format_date(d) }),
        Value::Binary(data) => json!({ BINARY_TAG: BASE64.encode(data) }),
        Value::Regex(r) => json!({
            REGEX_TAG: { "pattern": r.pattern, "options": r.options.bits() }
        }),
        Value::Reference(r) => json!({
            REFERENCE_TAG: { "entity": r.entity_name, "id": r.id }
        }),
    }
}

/// Encode an object map into a wire JSON object.
pub fn encode_map(map: &Map) -> Json {
    Json::Object(map.iter().map(|(k, v)| (k.clone(), encode(v))).collect())
}

/// Decode wire JSON, failing on the first malformed tagged node.
pub fn decode(json: &Json) -> Result<Value, CodecError> {
    let mut errors = Vec::new();
    let value = decode_node(json, "$", &mut errors);
    match errors.into_iter().next() {
        Some(err) => Err(err),
        None => Ok(value),
    }
}

/// Decode wire JSON, substituting `Null` for malformed tagged nodes.
///
/// Returns the decoded tree together with one error per substituted node.
pub fn decode_lossy(json: &Json) -> (Value, Vec<CodecError>) {
    let mut errors = Vec::new();
    let value = decode_node(json, "$", &mut errors);
    (value, errors)
}

fn decode_node(json: &Json, path: &str, errors: &mut Vec<CodecError>) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => Value::Number(n.clone()),
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| decode_node(item, &format!("{}[{}]", path, i), errors))
                .collect(),
        ),
        Json::Object(map) => {
            if map.len() == 1 {
                if let Some((tag, payload)) = map.iter().next() {
                    if let Some(result) = decode_tagged(tag, payload) {
                        return result.unwrap_or_else(|reason| {
                            errors.push(CodecError::new(path, reason));
                            Value::Null
                        });
                    }
                }
            }
            Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), decode_node(v, &format!("{}.{}", path, k), errors)))
                    .collect(),
            )
        }
    }
}

/// Returns `None` when `tag` is not a wire tag.
fn decode_tagged(tag: &str, payload: &Json) -> Option<Result<Value, String>> {
    let result = match tag {
        DATE_TAG => decode_date(payload),
        BINARY_TAG => decode_binary(payload),
        REGEX_TAG => decode_regex(payload),
        REFERENCE_TAG => decode_reference(payload),
        _ => return None,
    };
    Some(result)
}

fn decode_date(payload: &Json) -> Result<Value, String> {
    let text = payload
        .as_str()
        .ok_or_else(|| "date payload is not a string".to_string())?;
    DateTime::parse_from_rfc3339(text)
        .map(|d| Value::Date(d.with_timezone(&Utc)))
        .map_err(|e| format!("invalid timestamp {:?}: {}", text, e))
}

fn decode_binary(payload: &Json) -> Result<Value, String> {
    let text = payload
        .as_str()
        .ok_or_else(|| "binary payload is not a string".to_string())?;
    BASE64
        .decode(text)
        .or_else(|_| hex::decode(text))
        .map(Value::Binary)
        .map_err(|_| "binary payload is neither base64 nor hex".to_string())
}

fn decode_regex(payload: &Json) -> Result<Value, String> {
    let pattern = payload
        .get("pattern")
        .and_then(Json::as_str)
        .ok_or_else(|| "regex payload has no pattern".to_string())?;
    let bits = match payload.get("options") {
        None | Some(Json::Null) => 0,
        Some(opts) => opts
            .as_u64()
            .and_then(|b| u8::try_from(b).ok())
            .ok_or_else(|| "regex options are not a bitmask".to_string())?,
    };
    let options =
        RegexOptions::from_bits(bits).ok_or_else(|| format!("unknown regex option bits {:#x}", bits))?;
    Ok(Value::Regex(Regex::new(pattern, options)))
}

fn decode_reference(payload: &Json) -> Result<Value, String> {
    let entity = payload
        .get("entity")
        .and_then(Json::as_str)
        .ok_or_else(|| "reference payload has no entity".to_string())?;
    let id = payload
        .get("id")
        .and_then(Json::as_str)
        .ok_or_else(|| "reference payload has no id".to_string())?;
    Ok(Value::Reference(Reference::new(entity, id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{SubsecRound, TimeZone};

    fn sample() -> Value {
        let mut inner = Map::new();
        inner.insert("avatar".into(), Value::Binary(vec![0xde, 0xad, 0xbe, 0xef]));
        inner.insert(
            "pattern".into(),
            Value::Regex(Regex::new("^a.*", RegexOptions::CASE_INSENSITIVE | RegexOptions::MULTILINE)),
        );
        let mut map = Map::new();
        map.insert("name".into(), "Alice".into());
        map.insert(
            "born".into(),
            Value::Date(Utc.with_ymd_and_hms(1990, 5, 17, 8, 30, 0).unwrap()),
        );
        map.insert("owner".into(), Value::Reference(Reference::new("users", "507f")));
        map.insert("tags".into(), Value::Array(vec!["x".into(), Value::Null, 3.into()]));
        map.insert("profile".into(), Value::Object(inner));
        Value::Object(map)
    }

    #[test]
    fn test_encode_tags() {
        let wire = encode(&sample());
        assert_eq!(wire["born"], json!({"$date": "1990-05-17T08:30:00.000Z"}));
        assert_eq!(wire["owner"], json!({"$ref": {"entity": "users", "id": "507f"}}));
        assert_eq!(wire["profile"]["avatar"], json!({"$binary": "3q2+7w=="}));
        assert_eq!(
            wire["profile"]["pattern"],
            json!({"$regexp": {"pattern": "^a.*", "options": 3}})
        );
        assert_eq!(wire["tags"], json!(["x", null, 3]));
    }

    #[test]
    fn test_round_trip() {
        let original = sample();
        assert_eq!(decode(&encode(&original)).unwrap(), original);
    }

    #[test]
    fn test_date_truncated_to_millis() {
        let precise = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let decoded = decode(&encode(&Value::Date(precise))).unwrap();
        assert_eq!(decoded, Value::Date(precise.trunc_subsecs(3)));
        assert_ne!(decoded, Value::Date(precise));
    }

    #[test]
    fn test_decode_hex_binary() {
        // unpadded text is not valid base64, so the hex fallback applies
        let decoded = decode(&json!({"$binary": "0a0b0"})).unwrap_err();
        assert!(decoded.reason.contains("neither"));
        let decoded = decode(&json!({"$binary": "0a0b0c"})).unwrap();
        assert!(matches!(decoded, Value::Binary(_)));
    }

    #[test]
    fn test_malformed_date_reports_path() {
        let err = decode(&json!({"a": [{"$date": "yesterday"}]})).unwrap_err();
        assert_eq!(err.path, "$.a[0]");
    }

    #[test]
    fn test_decode_lossy_substitutes_null() {
        let (value, errors) = decode_lossy(&json!({
            "ok": {"$date": "2020-01-01T00:00:00Z"},
            "bad": {"$regexp": {"options": 1}}
        }));
        assert_eq!(errors.len(), 1);
        assert!(value.get("bad").unwrap().is_null());
        assert!(value.get("ok").unwrap().as_date().is_some());
    }

    #[test]
    fn test_multi_key_object_is_not_tagged() {
        let value = decode(&json!({"$date": "nope", "other": 1})).unwrap();
        assert_eq!(value.get("$date"), Some(&Value::String("nope".into())));
    }
}
