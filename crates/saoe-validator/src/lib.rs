// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! saoe-validator
#![deny(unsafe_code)]
#![warn(missing_docs)]

use saoe_audit::{AuditError, AuditEvent, AuditLog, EVENT_VALIDATED};
use saoe_envelope::{EnvelopeError, SatlEnvelope, canonical};
use saoe_keyring::VerifyingKey;
use saoe_vault::{TemplateVault, VaultError, manifest};
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Default raw-byte cap applied at step 1 (1 MiB).
pub const DEFAULT_FILE_SIZE_CAP: usize = 1024 * 1024;

/// Default per-sender validated-envelope quota per rolling hour.
pub const DEFAULT_SENDER_QUOTA_PER_HOUR: u64 = 1000;

// ---------------------------------------------------------------------------
// Errors: one named kind per rejection reason, default deny
// ---------------------------------------------------------------------------

/// A rejection from the validation pipeline.
///
/// Each variant maps to exactly one pipeline step; the shim converts the
/// variant's [`kind`](Self::kind) into the `reason` tag of a `rejected`
/// audit event.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// Step 1: the raw envelope exceeds the size cap.
    #[error("envelope size {size} exceeds cap {cap}")]
    FileSizeExceeded {
        /// Observed byte count.
        size: usize,
        /// Configured cap.
        cap: usize,
    },

    /// Step 2 or 3: parse failure, duplicate key, or bad signature.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Step 4: the envelope is addressed to a different agent.
    #[error("receiver_id {receiver_id:?} does not match own agent id {own_agent_id:?}")]
    ReceiverMismatch {
        /// The envelope's receiver.
        receiver_id: String,
        /// The validating agent.
        own_agent_id: String,
    },

    /// Step 5 or 8: the referenced template or capability set is absent.
    #[error("vault cannot resolve {key}")]
    VaultResolution {
        /// `<kind>:<id>:<version>` that failed to resolve.
        key: String,
    },

    /// Vault failure other than a missing entry (decrypt, manifest).
    #[error("vault failure: {0}")]
    Vault(#[source] VaultError),

    /// Step 6: vault template content does not hash to the pinned value.
    #[error("template sha256 mismatch: envelope claims {claimed}, vault content hashes to {actual}")]
    TemplateSha256Mismatch {
        /// Hash pinned in the envelope's template_ref.
        claimed: String,
        /// Hash of the resolved vault content.
        actual: String,
    },

    /// Step 7 or 9: a dispatcher manifest signature failed to verify.
    #[error("dispatcher signature verification failed for {entry}")]
    DispatcherSig {
        /// Which manifest failed (`template <id> v<ver>` or `capset ...`).
        entry: String,
    },

    /// Step 10: the payload does not conform to the template schema.
    #[error("payload schema validation failed: {reason}")]
    PayloadSchema {
        /// First schema violation encountered.
        reason: String,
    },

    /// Step 11: sender/receiver not allowed, payload too large, or quota
    /// exhausted.
    #[error("capability constraint violated: {reason}")]
    CapabilityConstraint {
        /// Which constraint failed.
        reason: String,
    },

    /// Step 12: this envelope id has already been validated.
    #[error("replay detected: envelope_id {envelope_id:?} already processed")]
    ReplayAttack {
        /// The duplicate envelope identifier.
        envelope_id: String,
    },

    /// The audit store failed for a reason other than replay.
    #[error("audit store failure: {0}")]
    Audit(#[source] AuditError),
}

impl ValidationError {
    /// Stable tag for audit `rejected` events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileSizeExceeded { .. } => "FILE_SIZE_EXCEEDED",
            Self::Envelope(e) => e.kind(),
            Self::ReceiverMismatch { .. } => "RECEIVER_MISMATCH",
            Self::VaultResolution { .. } => "VAULT_RESOLUTION",
            Self::Vault(e) => e.kind(),
            Self::TemplateSha256Mismatch { .. } => "TEMPLATE_SHA256_MISMATCH",
            Self::DispatcherSig { .. } => "DISPATCHER_SIG",
            Self::PayloadSchema { .. } => "PAYLOAD_SCHEMA",
            Self::CapabilityConstraint { .. } => "CAPABILITY_CONSTRAINT",
            Self::ReplayAttack { .. } => "REPLAY_ATTACK",
            Self::Audit(_) => "AUDIT_STORAGE",
        }
    }
}

// ---------------------------------------------------------------------------
// ValidationResult
// ---------------------------------------------------------------------------

/// Returned on success: the envelope together with the vault content that
/// licensed it.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// The validated envelope.
    pub envelope: SatlEnvelope,
    /// The resolved canonical template.
    pub template: Map<String, Value>,
    /// The resolved capability set.
    pub capability_set: Map<String, Value>,
}

impl ValidationResult {
    /// Session the envelope belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.envelope.session_id
    }

    /// Agent that signed the envelope.
    #[must_use]
    pub fn sender_id(&self) -> &str {
        &self.envelope.sender_id
    }

    /// Agent the envelope was addressed to.
    #[must_use]
    pub fn receiver_id(&self) -> &str {
        &self.envelope.receiver_id
    }
}

// ---------------------------------------------------------------------------
// EnvelopeValidator
// ---------------------------------------------------------------------------

/// Executes the twelve-step validation pipeline for one agent.
pub struct EnvelopeValidator {
    vault: Arc<TemplateVault>,
    own_agent_id: String,
    audit: AuditLog,
    file_size_cap: usize,
    sender_quota_per_hour: u64,
}

impl EnvelopeValidator {
    /// Create a validator for `own_agent_id` over the given vault and audit
    /// log, with default size cap and quota.
    #[must_use]
    pub fn new(vault: Arc<TemplateVault>, own_agent_id: impl Into<String>, audit: AuditLog) -> Self {
        Self {
            vault,
            own_agent_id: own_agent_id.into(),
            audit,
            file_size_cap: DEFAULT_FILE_SIZE_CAP,
            sender_quota_per_hour: DEFAULT_SENDER_QUOTA_PER_HOUR,
        }
    }

    /// Override the step-1 raw-byte cap.
    #[must_use]
    pub fn with_file_size_cap(mut self, cap: usize) -> Self {
        self.file_size_cap = cap;
        self
    }

    /// Override the step-11 per-sender hourly quota.
    #[must_use]
    pub fn with_sender_quota_per_hour(mut self, quota: u64) -> Self {
        self.sender_quota_per_hour = quota;
        self
    }

    /// Run steps 1–12 over raw envelope bytes.
    ///
    /// # Errors
    ///
    /// The [`ValidationError`] variant of whichever step failed first;
    /// nothing past that step executes and no `validated` event exists.
    pub async fn validate_bytes(
        &self,
        raw: &[u8],
        sender_verify_key: &VerifyingKey,
    ) -> Result<ValidationResult, ValidationError> {
        // Step 1: size cap, before the parser sees a single byte.
        if raw.len() > self.file_size_cap {
            return Err(ValidationError::FileSizeExceeded {
                size: raw.len(),
                cap: self.file_size_cap,
            });
        }

        // Step 2: strict parse with duplicate-key rejection.
        let envelope = saoe_envelope::parse_envelope(raw)?;

        self.validate_envelope(envelope, sender_verify_key).await
    }

    /// Run steps 3–12 over a pre-parsed envelope.
    ///
    /// # Errors
    ///
    /// As [`validate_bytes`](Self::validate_bytes).
    pub async fn validate_envelope(
        &self,
        envelope: SatlEnvelope,
        sender_verify_key: &VerifyingKey,
    ) -> Result<ValidationResult, ValidationError> {
        // Step 3: signature before any field is trusted.
        saoe_envelope::verify_envelope_signature(&envelope, sender_verify_key)?;

        // Step 4: the envelope must be addressed to this agent.
        if envelope.receiver_id != self.own_agent_id {
            return Err(ValidationError::ReceiverMismatch {
                receiver_id: envelope.receiver_id.clone(),
                own_agent_id: self.own_agent_id.clone(),
            });
        }

        let tref = &envelope.template_ref;

        // Step 5: resolve the canonical template.
        let template = self
            .vault
            .get_template(&tref.template_id, &tref.version)
            .await
            .map_err(map_vault_error)?;

        // Step 6: the envelope is bound to the exact template content.
        let actual_sha256 = canonical::canonical_sha256_hex(&Value::Object(template.clone()));
        if actual_sha256 != tref.sha256_hash {
            return Err(ValidationError::TemplateSha256Mismatch {
                claimed: tref.sha256_hash.clone(),
                actual: actual_sha256,
            });
        }

        // Step 7: dispatcher signature over the template manifest.
        let manifest_bytes =
            manifest::template_manifest_bytes(&tref.template_id, &tref.version, &actual_sha256);
        saoe_keyring::verify_hex_signature(
            self.vault.dispatcher_verify_key(),
            &manifest_bytes,
            &tref.dispatcher_signature,
        )
        .map_err(|_| ValidationError::DispatcherSig {
            entry: format!("template {} v{}", tref.template_id, tref.version),
        })?;

        // Step 8: resolve the capability set.
        let capability_set = self
            .vault
            .get_capability_set(&tref.capability_set_id, &tref.capability_set_version)
            .await
            .map_err(map_vault_error)?;

        // Step 9: capability-set integrity, same discipline as steps 6–7.
        self.check_capability_set_integrity(tref, &capability_set)?;

        // Step 10: payload conformance against the template schema.
        check_payload_schema(&template, &envelope.payload)?;

        // Step 11: policy constraints need a schema-valid payload.
        self.check_capability_constraints(&envelope, &template)?;

        // Step 12: atomic replay guard. The insert is the check.
        let emitted = self.audit.emit(
            &AuditEvent::new(EVENT_VALIDATED)
                .with_envelope_id(&envelope.envelope_id)
                .with_session_id(&envelope.session_id)
                .with_sender_id(&envelope.sender_id)
                .with_receiver_id(&envelope.receiver_id)
                .with_template_id(&tref.template_id)
                .with_agent_id(&self.own_agent_id)
                .with_details(json!({"template_version": tref.version})),
        );
        match emitted {
            Ok(()) => {}
            Err(AuditError::ReplayAttack { envelope_id }) => {
                return Err(ValidationError::ReplayAttack { envelope_id });
            }
            Err(e) => return Err(ValidationError::Audit(e)),
        }

        tracing::debug!(
            envelope_id = %envelope.envelope_id,
            sender = %envelope.sender_id,
            template = %tref.template_id,
            "envelope validated"
        );

        Ok(ValidationResult {
            envelope,
            template,
            capability_set,
        })
    }

    // ------------------------------------------------------------------
    // Step internals
    // ------------------------------------------------------------------

    fn check_capability_set_integrity(
        &self,
        tref: &saoe_envelope::TemplateRef,
        capability_set: &Map<String, Value>,
    ) -> Result<(), ValidationError> {
        let entry = format!(
            "capset {} v{}",
            tref.capability_set_id, tref.capability_set_version
        );

        let capset_manifest = self
            .vault
            .get_capability_set_manifest(&tref.capability_set_id, &tref.capability_set_version)
            .map_err(map_vault_error)?;

        let actual_sha256 =
            canonical::canonical_sha256_hex(&Value::Object(capability_set.clone()));
        if actual_sha256 != capset_manifest.sha256_hash {
            return Err(ValidationError::DispatcherSig { entry });
        }

        let manifest_bytes = manifest::capability_set_manifest_bytes(
            &tref.capability_set_id,
            &tref.capability_set_version,
            &capset_manifest.sha256_hash,
        );
        saoe_keyring::verify_hex_signature(
            self.vault.dispatcher_verify_key(),
            &manifest_bytes,
            &capset_manifest.dispatcher_signature,
        )
        .map_err(|_| ValidationError::DispatcherSig { entry })
    }

    fn check_capability_constraints(
        &self,
        envelope: &SatlEnvelope,
        template: &Map<String, Value>,
    ) -> Result<(), ValidationError> {
        // Absent policy fields are treated as most restrictive.
        let empty = Map::new();
        let policy = template
            .get("policy_metadata")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let allowed_senders = string_list(policy.get("allowed_senders"));
        let allowed_receivers = string_list(policy.get("allowed_receivers"));
        let max_payload_bytes = policy
            .get("max_payload_bytes")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        if !allowed_senders.iter().any(|s| s == &envelope.sender_id) {
            return Err(ValidationError::CapabilityConstraint {
                reason: format!(
                    "sender {:?} not in allowed_senders {allowed_senders:?}",
                    envelope.sender_id
                ),
            });
        }
        if !allowed_receivers.iter().any(|r| r == &envelope.receiver_id) {
            return Err(ValidationError::CapabilityConstraint {
                reason: format!(
                    "receiver {:?} not in allowed_receivers {allowed_receivers:?}",
                    envelope.receiver_id
                ),
            });
        }

        let payload_size =
            canonical::to_canonical_bytes(&Value::Object(envelope.payload.clone())).len() as u64;
        if payload_size > max_payload_bytes {
            return Err(ValidationError::CapabilityConstraint {
                reason: format!(
                    "payload size {payload_size} exceeds template max_payload_bytes {max_payload_bytes}"
                ),
            });
        }

        let sender_count = self
            .audit
            .query_session_count(&envelope.sender_id, 1)
            .map_err(ValidationError::Audit)?;
        if sender_count >= self.sender_quota_per_hour {
            return Err(ValidationError::CapabilityConstraint {
                reason: format!(
                    "sender {:?} exceeded quota: {sender_count} >= {} per hour",
                    envelope.sender_id, self.sender_quota_per_hour
                ),
            });
        }
        Ok(())
    }
}

fn check_payload_schema(
    template: &Map<String, Value>,
    payload: &Map<String, Value>,
) -> Result<(), ValidationError> {
    let schema = template
        .get("json_schema")
        .ok_or_else(|| ValidationError::PayloadSchema {
            reason: "template has no json_schema field".to_string(),
        })?;

    let validator =
        jsonschema::validator_for(schema).map_err(|e| ValidationError::PayloadSchema {
            reason: format!("template schema does not compile: {e}"),
        })?;

    let instance = Value::Object(payload.clone());
    validator
        .validate(&instance)
        .map_err(|e| ValidationError::PayloadSchema {
            reason: e.to_string(),
        })
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn map_vault_error(err: VaultError) -> ValidationError {
    match err {
        VaultError::EntryNotFound { key } => ValidationError::VaultResolution { key },
        other => ValidationError::Vault(other),
    }
}
