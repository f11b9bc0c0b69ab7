// SPDX-License-Identifier: MIT OR Apache-2.0
//! Strict JSON parsing with duplicate-key rejection.
//!
//! `serde_json` silently keeps the last value when an object repeats a key.
//! That ambiguity is how smuggling attacks slip divergent values past a
//! signature check, so envelope parsing goes through this deserializer
//! instead: any repeated key at any nesting level is an error.

use serde::de::{self, DeserializeSeed, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Value};
use std::fmt;

/// Marker embedded in duplicate-key error messages so callers can tell them
/// apart from ordinary syntax errors.
pub(crate) const DUPLICATE_KEY_MARKER: &str = "duplicate JSON key";

/// Parse `raw` into a [`Value`], rejecting duplicate keys everywhere.
pub(crate) fn parse_strict(raw: &[u8]) -> Result<Value, serde_json::Error> {
    let mut de = serde_json::Deserializer::from_slice(raw);
    let value = StrictValue.deserialize(&mut de)?;
    de.end()?;
    Ok(value)
}

struct StrictValue;

impl<'de> DeserializeSeed<'de> for StrictValue {
    type Value = Value;

    fn deserialize<D>(self, deserializer: D) -> Result<Value, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_any(StrictValueVisitor)
    }
}

struct StrictValueVisitor;

impl<'de> Visitor<'de> for StrictValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any JSON value")
    }

    fn visit_bool<E>(self, v: bool) -> Result<Value, E>
    where
        E: de::Error,
    {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Value, E>
    where
        E: de::Error,
    {
        Ok(Value::from(v))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Value, E>
    where
        E: de::Error,
    {
        Ok(Value::from(v))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Value, E>
    where
        E: de::Error,
    {
        Ok(Value::from(v))
    }

    fn visit_str<E>(self, v: &str) -> Result<Value, E>
    where
        E: de::Error,
    {
        Ok(Value::String(v.to_owned()))
    }

    fn visit_string<E>(self, v: String) -> Result<Value, E>
    where
        E: de::Error,
    {
        Ok(Value::String(v))
    }

    fn visit_unit<E>(self) -> Result<Value, E>
    where
        E: de::Error,
    {
        Ok(Value::Null)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element_seed(StrictValue)? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A>(self, mut access: A) -> Result<Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut map = Map::new();
        while let Some(key) = access.next_key::<String>()? {
            if map.contains_key(&key) {
                return Err(de::Error::custom(format!(
                    "{DUPLICATE_KEY_MARKER}: {key:?}"
                )));
            }
            let value = access.next_value_seed(StrictValue)?;
            map.insert(key, value);
        }
        Ok(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_unique_keys() {
        let value = parse_strict(br#"{"a": 1, "b": {"c": 2}}"#).unwrap();
        assert_eq!(value["b"]["c"], 2);
    }

    #[test]
    fn rejects_top_level_duplicate() {
        let err = parse_strict(br#"{"version":"1.0","version":"evil"}"#).unwrap_err();
        assert!(err.to_string().contains(DUPLICATE_KEY_MARKER));
    }

    #[test]
    fn rejects_nested_duplicate() {
        let err = parse_strict(br#"{"payload":{"k":1,"k":2}}"#).unwrap_err();
        assert!(err.to_string().contains(DUPLICATE_KEY_MARKER));
    }

    #[test]
    fn rejects_duplicate_inside_array_element() {
        let err = parse_strict(br#"{"items":[{"x":1,"x":2}]}"#).unwrap_err();
        assert!(err.to_string().contains(DUPLICATE_KEY_MARKER));
    }

    #[test]
    fn rejects_trailing_garbage() {
        let err = parse_strict(br#"{"a":1} trailing"#).unwrap_err();
        assert!(!err.to_string().contains(DUPLICATE_KEY_MARKER));
    }
}
