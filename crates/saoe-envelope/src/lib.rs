// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! saoe-envelope
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub mod canonical;
mod strict;

/// Wire-format version written into every envelope.
pub const ENVELOPE_VERSION: &str = "1.0";

/// File suffix for envelopes delivered through queue directories.
pub const ENVELOPE_FILE_SUFFIX: &str = ".satl.json";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from envelope parsing, signing, and verification.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// A JSON object repeated a key at some nesting level.
    #[error("duplicate JSON key: {key:?}")]
    DuplicateKey {
        /// The repeated key.
        key: String,
    },

    /// The JSON was invalid or a required field was missing or mistyped.
    #[error("envelope parse error: {reason}")]
    Parse {
        /// What went wrong.
        reason: String,
    },

    /// The envelope signature is malformed or does not verify.
    #[error("envelope signature verification failed")]
    BadSignature,
}

impl EnvelopeError {
    /// Stable tag for audit `rejected` events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateKey { .. } => "DUPLICATE_KEY",
            Self::Parse { .. } => "ENVELOPE_PARSE",
            Self::BadSignature => "BAD_SIGNATURE",
        }
    }

    fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// Reference to a signed template in the vault.
///
/// All six fields participate in envelope signature coverage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    /// Template identifier.
    pub template_id: String,
    /// Template version.
    pub version: String,
    /// Hex SHA-256 of the canonical template JSON.
    pub sha256_hash: String,
    /// Hex Ed25519 signature over the canonical template manifest.
    pub dispatcher_signature: String,
    /// Capability set licensed alongside the template.
    pub capability_set_id: String,
    /// Capability set version.
    pub capability_set_version: String,
}

/// Immutable SATL envelope. `envelope_signature` covers all other fields,
/// including `human_readable`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatlEnvelope {
    /// Wire-format version.
    pub version: String,
    /// One-shot envelope identifier (UUID); the replay guard keys on this.
    pub envelope_id: String,
    /// Session the envelope belongs to.
    pub session_id: String,
    /// ISO-8601 UTC timestamp at signing time.
    pub timestamp_utc: String,
    /// Originating agent.
    pub sender_id: String,
    /// Destination agent.
    pub receiver_id: String,
    /// Operator-facing description. Ignored by execution logic; covered by
    /// the signature so it cannot be falsified in transit.
    pub human_readable: String,
    /// Reference to the signed template licensing this message.
    pub template_ref: TemplateRef,
    /// Message payload; schema-checked against the template at validation.
    pub payload: Map<String, Value>,
    /// Hex Ed25519 signature; absent from the bytes that were signed.
    pub envelope_signature: String,
}

/// All envelope fields except the signature, as assembled by a sender.
///
/// `envelope_id` and `timestamp_utc` may be left `None` to have
/// [`sign_envelope`] fill them (fresh UUID, current UTC time).
#[derive(Debug, Clone)]
pub struct EnvelopeDraft {
    /// Wire-format version.
    pub version: String,
    /// Optional pre-assigned envelope id.
    pub envelope_id: Option<String>,
    /// Session the envelope belongs to.
    pub session_id: String,
    /// Optional pre-assigned timestamp.
    pub timestamp_utc: Option<String>,
    /// Originating agent.
    pub sender_id: String,
    /// Destination agent.
    pub receiver_id: String,
    /// Operator-facing description.
    pub human_readable: String,
    /// Reference to the signed template licensing this message.
    pub template_ref: TemplateRef,
    /// Message payload.
    pub payload: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Canonical bytes
// ---------------------------------------------------------------------------

/// Canonical bytes of `envelope` for signing and verification.
///
/// `envelope_signature` is excluded; every other field is included, so the
/// signature covers the complete message.
#[must_use]
pub fn canonical_bytes(envelope: &SatlEnvelope) -> Vec<u8> {
    let value = json!({
        "version": envelope.version,
        "envelope_id": envelope.envelope_id,
        "session_id": envelope.session_id,
        "timestamp_utc": envelope.timestamp_utc,
        "sender_id": envelope.sender_id,
        "receiver_id": envelope.receiver_id,
        "human_readable": envelope.human_readable,
        "template_ref": {
            "template_id": envelope.template_ref.template_id,
            "version": envelope.template_ref.version,
            "sha256_hash": envelope.template_ref.sha256_hash,
            "dispatcher_signature": envelope.template_ref.dispatcher_signature,
            "capability_set_id": envelope.template_ref.capability_set_id,
            "capability_set_version": envelope.template_ref.capability_set_version,
        },
        "payload": Value::Object(envelope.payload.clone()),
    });
    canonical::to_canonical_bytes(&value)
}

// ---------------------------------------------------------------------------
// Signing and verification
// ---------------------------------------------------------------------------

/// Build a [`SatlEnvelope`] from `draft` and sign it.
///
/// Missing `envelope_id`/`timestamp_utc` are defaulted to a fresh v4 UUID
/// and the current UTC time. The returned envelope is complete and
/// immutable.
#[must_use]
pub fn sign_envelope(draft: EnvelopeDraft, signing_key: &saoe_keyring::SigningKey) -> SatlEnvelope {
    let mut envelope = SatlEnvelope {
        version: draft.version,
        envelope_id: draft
            .envelope_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        session_id: draft.session_id,
        timestamp_utc: draft.timestamp_utc.unwrap_or_else(now_utc),
        sender_id: draft.sender_id,
        receiver_id: draft.receiver_id,
        human_readable: draft.human_readable,
        template_ref: draft.template_ref,
        payload: draft.payload,
        envelope_signature: String::new(),
    };
    let data = canonical_bytes(&envelope);
    envelope.envelope_signature = hex::encode(saoe_keyring::sign_bytes(signing_key, &data));
    envelope
}

/// Verify the `envelope_signature` field against `sender_verify_key`.
///
/// Non-hex or wrong-length signatures fail before any curve math runs.
///
/// # Errors
///
/// Returns [`EnvelopeError::BadSignature`] if the signature is malformed,
/// was produced by a different key, or any signed field was altered.
pub fn verify_envelope_signature(
    envelope: &SatlEnvelope,
    sender_verify_key: &saoe_keyring::VerifyingKey,
) -> Result<(), EnvelopeError> {
    let data = canonical_bytes(envelope);
    saoe_keyring::verify_hex_signature(sender_verify_key, &data, &envelope.envelope_signature)
        .map_err(|_| EnvelopeError::BadSignature)
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse `raw_json` into a [`SatlEnvelope`].
///
/// Strict decode: duplicate keys at any nesting level fail with
/// [`EnvelopeError::DuplicateKey`]; a missing or mistyped required field
/// fails with [`EnvelopeError::Parse`]. No coercion, no silent defaults.
///
/// # Errors
///
/// See above; syntactically invalid JSON also yields
/// [`EnvelopeError::Parse`].
pub fn parse_envelope(raw_json: &[u8]) -> Result<SatlEnvelope, EnvelopeError> {
    let value = strict::parse_strict(raw_json).map_err(classify_json_error)?;

    let root = value
        .as_object()
        .ok_or_else(|| EnvelopeError::parse("envelope must be a JSON object"))?;

    let tref_value = root
        .get("template_ref")
        .ok_or_else(|| EnvelopeError::parse("missing required envelope field: template_ref"))?;
    let tref = tref_value
        .as_object()
        .ok_or_else(|| EnvelopeError::parse("template_ref must be a JSON object"))?;

    let template_ref = TemplateRef {
        template_id: required_string("template_ref.template_id", tref.get("template_id"))?,
        version: required_string("template_ref.version", tref.get("version"))?,
        sha256_hash: required_string("template_ref.sha256_hash", tref.get("sha256_hash"))?,
        dispatcher_signature: required_string("template_ref.dispatcher_signature",
            tref.get("dispatcher_signature"),
        )?,
        capability_set_id: required_string("template_ref.capability_set_id",
            tref.get("capability_set_id"),
        )?,
        capability_set_version: required_string("template_ref.capability_set_version",
            tref.get("capability_set_version"),
        )?,
    };

    let payload = root
        .get("payload")
        .ok_or_else(|| EnvelopeError::parse("missing required envelope field: payload"))?
        .as_object()
        .ok_or_else(|| EnvelopeError::parse("payload must be a JSON object"))?
        .clone();

    Ok(SatlEnvelope {
        version: required_string("version", root.get("version"))?,
        envelope_id: required_string("envelope_id", root.get("envelope_id"))?,
        session_id: required_string("session_id", root.get("session_id"))?,
        timestamp_utc: required_string("timestamp_utc", root.get("timestamp_utc"))?,
        sender_id: required_string("sender_id", root.get("sender_id"))?,
        receiver_id: required_string("receiver_id", root.get("receiver_id"))?,
        human_readable: required_string("human_readable", root.get("human_readable"))?,
        template_ref,
        payload,
        envelope_signature: required_string("envelope_signature",
            root.get("envelope_signature"),
        )?,
    })
}

fn required_string(field: &str, value: Option<&Value>) -> Result<String, EnvelopeError> {
    match value {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(EnvelopeError::parse(format!(
            "envelope field {field} must be a string"
        ))),
        None => Err(EnvelopeError::parse(format!(
            "missing required envelope field: {field}"
        ))),
    }
}

fn classify_json_error(err: serde_json::Error) -> EnvelopeError {
    let msg = err.to_string();
    if let Some(rest) = msg.split(strict::DUPLICATE_KEY_MARKER).nth(1) {
        let key = rest
            .split('"')
            .nth(1)
            .unwrap_or_default()
            .to_string();
        EnvelopeError::DuplicateKey { key }
    } else {
        EnvelopeError::parse(format!("invalid JSON: {msg}"))
    }
}

/// Serialize an envelope to the pretty JSON wire form written into queue
/// directories.
///
/// # Errors
///
/// Returns [`EnvelopeError::Parse`] if serialization fails (practically
/// unreachable for well-formed envelopes).
pub fn envelope_to_json(envelope: &SatlEnvelope) -> Result<String, EnvelopeError> {
    serde_json::to_string_pretty(envelope)
        .map_err(|e| EnvelopeError::parse(format!("cannot serialize envelope: {e}")))
}

/// Current UTC time in the ISO-8601 form stamped into envelopes.
#[must_use]
pub fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn template_ref() -> TemplateRef {
        TemplateRef {
            template_id: "blog_article_intent".into(),
            version: "1".into(),
            sha256_hash: "ab".repeat(32),
            dispatcher_signature: "cd".repeat(64),
            capability_set_id: "blog_caps".into(),
            capability_set_version: "1".into(),
        }
    }

    fn draft() -> EnvelopeDraft {
        let mut payload = Map::new();
        payload.insert("title".into(), Value::from("Hello"));
        payload.insert("body_markdown".into(), Value::from("# x"));
        EnvelopeDraft {
            version: ENVELOPE_VERSION.into(),
            envelope_id: None,
            session_id: "sess-1".into(),
            timestamp_utc: None,
            sender_id: "intake_agent".into(),
            receiver_id: "sanitization_agent".into(),
            human_readable: "new article".into(),
            template_ref: template_ref(),
            payload,
        }
    }

    #[test]
    fn sign_fills_defaults_and_verifies() {
        let (sk, vk) = saoe_keyring::generate_keypair();
        let envelope = sign_envelope(draft(), &sk);
        assert!(!envelope.envelope_id.is_empty());
        assert!(!envelope.timestamp_utc.is_empty());
        assert_eq!(envelope.envelope_signature.len(), 128);
        verify_envelope_signature(&envelope, &vk).unwrap();
    }

    #[test]
    fn verify_fails_under_wrong_key() {
        let (sk, _) = saoe_keyring::generate_keypair();
        let (_, other_vk) = saoe_keyring::generate_keypair();
        let envelope = sign_envelope(draft(), &sk);
        let err = verify_envelope_signature(&envelope, &other_vk).unwrap_err();
        assert!(matches!(err, EnvelopeError::BadSignature));
    }

    #[test]
    fn signature_covers_every_field() {
        let (sk, vk) = saoe_keyring::generate_keypair();
        let envelope = sign_envelope(draft(), &sk);

        let mut tampered = envelope.clone();
        tampered.human_readable = "forged note".into();
        assert!(verify_envelope_signature(&tampered, &vk).is_err());

        let mut tampered = envelope.clone();
        tampered
            .payload
            .insert("title".into(), Value::from("TAMPERED"));
        assert!(verify_envelope_signature(&tampered, &vk).is_err());

        let mut tampered = envelope.clone();
        tampered.template_ref.sha256_hash = "00".repeat(32);
        assert!(verify_envelope_signature(&tampered, &vk).is_err());

        let mut tampered = envelope;
        tampered.receiver_id = "attacker".into();
        assert!(verify_envelope_signature(&tampered, &vk).is_err());
    }

    #[test]
    fn serialize_parse_canonicalize_is_signature_preserving() {
        let (sk, vk) = saoe_keyring::generate_keypair();
        let envelope = sign_envelope(draft(), &sk);

        let wire = envelope_to_json(&envelope).unwrap();
        let parsed = parse_envelope(wire.as_bytes()).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(canonical_bytes(&parsed), canonical_bytes(&envelope));
        verify_envelope_signature(&parsed, &vk).unwrap();
    }

    #[test]
    fn parse_rejects_duplicate_keys_before_anything_else() {
        let raw = br#"{"version":"1.0","version":"evil"}"#;
        let err = parse_envelope(raw).unwrap_err();
        assert!(matches!(err, EnvelopeError::DuplicateKey { key } if key == "version"));
    }

    #[test]
    fn parse_rejects_nested_duplicate_keys() {
        let (sk, _) = saoe_keyring::generate_keypair();
        let envelope = sign_envelope(draft(), &sk);
        let wire = envelope_to_json(&envelope).unwrap();
        // Inject a duplicate inside the payload object.
        let attacked = wire.replacen("\"title\"", "\"title\": \"x\", \"title\"", 1);
        let err = parse_envelope(attacked.as_bytes()).unwrap_err();
        assert!(matches!(err, EnvelopeError::DuplicateKey { .. }));
    }

    #[test]
    fn parse_rejects_missing_required_field() {
        let (sk, _) = saoe_keyring::generate_keypair();
        let envelope = sign_envelope(draft(), &sk);
        let mut value = serde_json::to_value(&envelope).unwrap();
        value.as_object_mut().unwrap().remove("session_id");
        let raw = serde_json::to_vec(&value).unwrap();
        let err = parse_envelope(&raw).unwrap_err();
        assert!(matches!(err, EnvelopeError::Parse { reason } if reason.contains("session_id")));
    }

    #[test]
    fn parse_rejects_mistyped_field_without_coercion() {
        let (sk, _) = saoe_keyring::generate_keypair();
        let envelope = sign_envelope(draft(), &sk);
        let mut value = serde_json::to_value(&envelope).unwrap();
        value["envelope_id"] = Value::from(42);
        let raw = serde_json::to_vec(&value).unwrap();
        let err = parse_envelope(&raw).unwrap_err();
        assert!(matches!(err, EnvelopeError::Parse { .. }));
    }

    #[test]
    fn parse_rejects_non_object_payload() {
        let (sk, _) = saoe_keyring::generate_keypair();
        let envelope = sign_envelope(draft(), &sk);
        let mut value = serde_json::to_value(&envelope).unwrap();
        value["payload"] = Value::from("not an object");
        let raw = serde_json::to_vec(&value).unwrap();
        let err = parse_envelope(&raw).unwrap_err();
        assert!(matches!(err, EnvelopeError::Parse { reason } if reason.contains("payload")));
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(
            EnvelopeError::DuplicateKey { key: "k".into() }.kind(),
            "DUPLICATE_KEY"
        );
        assert_eq!(EnvelopeError::parse("x").kind(), "ENVELOPE_PARSE");
        assert_eq!(EnvelopeError::BadSignature.kind(), "BAD_SIGNATURE");
    }
}
