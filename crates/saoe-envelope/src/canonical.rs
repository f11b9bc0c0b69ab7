// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON serialization for hashing and signing.
//!
//! The canonical form is: keys sorted lexicographically at every nesting
//! level, `,` and `:` separators with no whitespace, ASCII-only escaping
//! (non-ASCII characters written as lowercase `\uXXXX`, astral-plane
//! characters as UTF-16 surrogate pairs), encoded as UTF-8. Two independent
//! implementations must agree byte for byte, so nothing here may depend on
//! serializer defaults.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize `value` to its canonical byte representation.
///
/// # Examples
///
/// ```
/// use serde_json::json;
///
/// let value = json!({"b": 1, "a": {"z": true}});
/// let bytes = saoe_envelope::canonical::to_canonical_bytes(&value);
/// assert_eq!(bytes, br#"{"a":{"z":true},"b":1}"#);
/// ```
#[must_use]
pub fn to_canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(&mut out, value);
    out
}

/// Hex SHA-256 of the canonical byte representation of `value`.
#[must_use]
pub fn canonical_sha256_hex(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(to_canonical_bytes(value));
    hex::encode(hasher.finalize())
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // Sort explicitly rather than trusting map iteration order, so
            // canonical output is stable even under `preserve_order` builds.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(out, key);
                out.push(b':');
                write_value(out, &map[key.as_str()]);
            }
            out.push(b'}');
        }
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.push(b'"');
    for ch in s.chars() {
        match ch {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\u{08}' => out.extend_from_slice(b"\\b"),
            '\u{0c}' => out.extend_from_slice(b"\\f"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            c if c.is_ascii() && (c as u32) >= 0x20 => out.push(c as u8),
            c => {
                // Control and non-ASCII characters: lowercase \uXXXX, with
                // surrogate pairs for characters above the BMP.
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.extend_from_slice(format!("\\u{unit:04x}").as_bytes());
                }
            }
        }
    }
    out.push(b'"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn keys_sort_at_every_nesting_level() {
        let value = json!({"z": {"b": 1, "a": 2}, "a": [{"y": 1, "x": 2}]});
        assert_eq!(
            to_canonical_bytes(&value),
            br#"{"a":[{"x":2,"y":1}],"z":{"a":2,"b":1}}"#
        );
    }

    #[test]
    fn no_whitespace_separators() {
        let value = json!({"k": [1, 2, 3], "m": {"n": true}});
        assert_eq!(
            to_canonical_bytes(&value),
            br#"{"k":[1,2,3],"m":{"n":true}}"#
        );
    }

    #[test]
    fn non_ascii_escapes_to_lowercase_hex() {
        let value = json!({"title": "h\u{e9}llo"});
        let expected: &[u8] = b"{\"title\":\"h\\u00e9llo\"}";
        assert_eq!(to_canonical_bytes(&value), expected);
    }

    #[test]
    fn astral_characters_use_surrogate_pairs() {
        // U+1F389 encodes as the surrogate pair d83c/df89.
        let value = json!({"emoji": "\u{1F389}"});
        let expected: &[u8] = b"{\"emoji\":\"\\ud83c\\udf89\"}";
        assert_eq!(to_canonical_bytes(&value), expected);
    }

    #[test]
    fn control_characters_escape() {
        let value = json!({"s": "a\u{0001}b\nc"});
        let expected: &[u8] = b"{\"s\":\"a\\u0001b\\nc\"}";
        assert_eq!(to_canonical_bytes(&value), expected);
    }

    #[test]
    fn quotes_and_backslashes_escape() {
        let value = json!({"s": "say \"hi\" \\ done"});
        let expected: &[u8] = b"{\"s\":\"say \\\"hi\\\" \\\\ done\"}";
        assert_eq!(to_canonical_bytes(&value), expected);
    }

    #[test]
    fn scalars_match_json() {
        assert_eq!(to_canonical_bytes(&json!(null)), b"null");
        assert_eq!(to_canonical_bytes(&json!(true)), b"true");
        assert_eq!(to_canonical_bytes(&json!(42)), b"42");
        assert_eq!(to_canonical_bytes(&json!(-7)), b"-7");
    }

    #[test]
    fn sha256_is_over_canonical_bytes() {
        // Same logical object, different insertion order, same digest.
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(canonical_sha256_hex(&a), canonical_sha256_hex(&b));
        assert_eq!(canonical_sha256_hex(&a).len(), 64);
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[ -~°é\u{1F389}]{0,12}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z°]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn canonical_bytes_reparse_to_the_same_value(value in arb_json()) {
            let bytes = to_canonical_bytes(&value);
            let reparsed: Value = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(&reparsed, &value);
            // Canonicalization is idempotent.
            prop_assert_eq!(to_canonical_bytes(&reparsed), bytes);
        }

        #[test]
        fn canonical_bytes_are_pure_ascii(value in arb_json()) {
            prop_assert!(to_canonical_bytes(&value).iter().all(u8::is_ascii));
        }
    }
}
