//! Wire value tests for the Deployd Rust SDK.

use chrono::{TimeZone, Utc};
use deployd::codec::{decode, decode_lossy, encode};
use deployd::{Map, Reference, Regex, RegexOptions, Value};
use serde_json::json;

#[test]
fn test_plain_json_passes_through() {
  let wire = json!({"name": "Alice", "tags": ["a", "b"], "age": 30, "ok": true, "none": null});
  let value = decode(&wire).unwrap();
  assert_eq!(value.get("name").and_then(Value::as_str), Some("Alice"));
  assert_eq!(value.get("age").and_then(Value::as_i64), Some(30));
  assert_eq!(encode(&value), wire);
}

#[test]
fn test_nested_special_values() {
  let date = Utc.with_ymd_and_hms(2012, 6, 18, 6, 13, 20).unwrap();
  let mut doc = Map::new();
  doc.insert("at".into(), Value::Date(date));
  doc.insert(
    "filters".into(),
    Value::Array(vec![
      Value::Regex(Regex::new("^a", RegexOptions::CASE_INSENSITIVE)),
      Value::Reference(Reference::new("users", "u1")),
    ]),
  );
  doc.insert("blob".into(), Value::Binary(b"hi".to_vec()));

  let wire = encode(&Value::Object(doc.clone()));
  assert_eq!(
    wire,
    json!({
      "at": {"$date": "2012-06-18T06:13:20.000Z"},
      "filters": [
        {"$regexp": {"pattern": "^a", "options": 1}},
        {"$ref": {"entity": "users", "id": "u1"}}
      ],
      "blob": {"$binary": "aGk="}
    })
  );
  assert_eq!(decode(&wire).unwrap(), Value::Object(doc));
}

#[test]
fn test_decode_reports_path() {
  let wire = json!({"items": [{"at": {"$date": "nope"}}]});
  let err = decode(&wire).unwrap_err();
  assert_eq!(err.path, "$.items[0].at");

  let (value, errors) = decode_lossy(&wire);
  assert_eq!(errors.len(), 1);
  assert!(value.get("items").is_some());
}
