// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! saoe-toolgate
#![deny(unsafe_code)]
#![warn(missing_docs)]

use saoe_audit::{AuditError, AuditEvent, AuditLog, EVENT_TOOL_EXECUTED};
use saoe_envelope::canonical;
use saoe_keyring::VerifyingKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

/// Plan wire-format version.
pub const PLAN_SCHEMA_VERSION: &str = "1.0";

/// Argument and context mappings passed to tools.
pub type JsonMap = Map<String, Value>;

/// A registered tool callable: `(args, context) -> result`.
///
/// Tools report their own failures through `anyhow`; the gate wraps them
/// in [`ToolGateError::ToolFailed`] and halts the plan.
pub type ToolFn = Box<dyn Fn(&JsonMap, &JsonMap) -> anyhow::Result<JsonMap> + Send + Sync>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from ToolGate construction and plan execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolGateError {
    /// The issuer verify key does not match the pinned hash.
    ///
    /// Process-fatal at construction: an unpinned issuer key means any
    /// plan could be forged.
    #[error("issuer key pin mismatch: {0}")]
    IssuerKeyMismatch(#[source] saoe_keyring::KeyringError),

    /// The plan's issuer signature is malformed or does not verify.
    #[error("plan issuer signature verification failed")]
    BadSignature,

    /// The plan references a tool that is not registered.
    #[error("tool {tool_name:?} not in registry")]
    UnknownTool {
        /// The unregistered tool name.
        tool_name: String,
    },

    /// Tool args do not conform to the registered schema (or the schema
    /// itself does not compile at registration).
    #[error("args schema error for tool {tool_name:?}: {reason}")]
    ToolArgSchema {
        /// The tool whose args failed.
        tool_name: String,
        /// First violation encountered.
        reason: String,
    },

    /// A tool ran and reported failure; remaining calls were not executed.
    #[error("tool {tool_name:?} failed: {source}")]
    ToolFailed {
        /// The failing tool.
        tool_name: String,
        /// The tool's own error.
        #[source]
        source: anyhow::Error,
    },

    /// The audit store failed while recording a tool execution.
    #[error("audit store failure: {0}")]
    Audit(#[from] AuditError),
}

impl ToolGateError {
    /// Stable tag for audit `rejected` events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IssuerKeyMismatch(_) => "ISSUER_KEY_MISMATCH",
            Self::BadSignature => "BAD_SIGNATURE",
            Self::UnknownTool { .. } => "UNKNOWN_TOOL",
            Self::ToolArgSchema { .. } => "TOOL_ARG_SCHEMA",
            Self::ToolFailed { .. } => "TOOL_FAILED",
            Self::Audit(_) => "AUDIT_STORAGE",
        }
    }
}

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// A single tool invocation within an [`ExecutionPlan`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier of this call within the plan.
    pub tool_call_id: String,
    /// Registered tool name.
    pub tool_name: String,
    /// Arguments; schema-checked against the registration at execute time.
    pub args: JsonMap,
}

/// Signed, ordered list of tool calls issued by the authorized issuer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Plan wire-format version.
    pub schema_version: String,
    /// Unique plan identifier.
    pub plan_id: String,
    /// Session the plan belongs to.
    pub session_id: String,
    /// Agent that issued (and signed) the plan.
    pub issuer_id: String,
    /// ISO-8601 UTC timestamp at signing time.
    pub timestamp_utc: String,
    /// Ordered tool calls.
    pub tool_calls: Vec<ToolCall>,
    /// Hex Ed25519 signature; absent from the bytes that were signed.
    pub issuer_signature: String,
}

/// All plan fields except the signature, as assembled by an issuer.
#[derive(Debug, Clone)]
pub struct PlanDraft {
    /// Optional pre-assigned plan id (defaults to a fresh UUID).
    pub plan_id: Option<String>,
    /// Session the plan belongs to.
    pub session_id: String,
    /// Issuing agent.
    pub issuer_id: String,
    /// Optional pre-assigned timestamp (defaults to now).
    pub timestamp_utc: Option<String>,
    /// Ordered tool calls.
    pub tool_calls: Vec<ToolCall>,
}

/// Canonical bytes of `plan` for signing and verification; the signature
/// covers everything except itself.
#[must_use]
pub fn plan_canonical_bytes(plan: &ExecutionPlan) -> Vec<u8> {
    let calls: Vec<Value> = plan
        .tool_calls
        .iter()
        .map(|tc| {
            json!({
                "tool_call_id": tc.tool_call_id,
                "tool_name": tc.tool_name,
                "args": Value::Object(tc.args.clone()),
            })
        })
        .collect();
    canonical::to_canonical_bytes(&json!({
        "schema_version": plan.schema_version,
        "plan_id": plan.plan_id,
        "session_id": plan.session_id,
        "issuer_id": plan.issuer_id,
        "timestamp_utc": plan.timestamp_utc,
        "tool_calls": calls,
    }))
}

/// Build an [`ExecutionPlan`] from `draft` and sign it with the issuer key.
#[must_use]
pub fn sign_plan(draft: PlanDraft, signing_key: &saoe_keyring::SigningKey) -> ExecutionPlan {
    let mut plan = ExecutionPlan {
        schema_version: PLAN_SCHEMA_VERSION.to_string(),
        plan_id: draft
            .plan_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        session_id: draft.session_id,
        issuer_id: draft.issuer_id,
        timestamp_utc: draft.timestamp_utc.unwrap_or_else(saoe_envelope::now_utc),
        tool_calls: draft.tool_calls,
        issuer_signature: String::new(),
    };
    let data = plan_canonical_bytes(&plan);
    plan.issuer_signature = hex::encode(saoe_keyring::sign_bytes(signing_key, &data));
    plan
}

// ---------------------------------------------------------------------------
// ToolGate
// ---------------------------------------------------------------------------

struct ToolEntry {
    callable: ToolFn,
    args_validator: jsonschema::Validator,
}

/// Enforces signed execution plans before dispatching any tool call.
pub struct ToolGate {
    issuer_vk: VerifyingKey,
    audit: AuditLog,
    tools: BTreeMap<String, ToolEntry>,
}

impl std::fmt::Debug for ToolGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolGate")
            .field("issuer_vk", &self.issuer_vk)
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ToolGate {
    /// Create a gate bound to the pinned issuer.
    ///
    /// # Errors
    ///
    /// Returns [`ToolGateError::IssuerKeyMismatch`] when
    /// `issuer_verify_key` does not hash to `issuer_pin`; callers must
    /// treat this as process-fatal.
    pub fn new(
        issuer_verify_key: VerifyingKey,
        issuer_pin: &str,
        audit: AuditLog,
    ) -> Result<Self, ToolGateError> {
        saoe_keyring::assert_key_pin(&issuer_verify_key, issuer_pin)
            .map_err(ToolGateError::IssuerKeyMismatch)?;
        Ok(Self {
            issuer_vk: issuer_verify_key,
            audit,
            tools: BTreeMap::new(),
        })
    }

    /// Register a tool callable with the JSON Schema its args must satisfy.
    ///
    /// # Errors
    ///
    /// Returns [`ToolGateError::ToolArgSchema`] when `args_schema` is not a
    /// compilable JSON Schema.
    pub fn register_tool(
        &mut self,
        name: impl Into<String>,
        args_schema: &Value,
        callable: ToolFn,
    ) -> Result<(), ToolGateError> {
        let name = name.into();
        let args_validator =
            jsonschema::validator_for(args_schema).map_err(|e| ToolGateError::ToolArgSchema {
                tool_name: name.clone(),
                reason: format!("schema does not compile: {e}"),
            })?;
        self.tools.insert(
            name,
            ToolEntry {
                callable,
                args_validator,
            },
        );
        Ok(())
    }

    /// Names of all registered tools, sorted.
    #[must_use]
    pub fn registered_tools(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Execute all tool calls in `plan`, in order.
    ///
    /// The issuer signature is verified exactly once, before anything else.
    /// On any failure the plan halts: calls past the failure never run, and
    /// the caller decides whether to retry. Results are returned in call
    /// order, aligned with `plan.tool_calls`.
    ///
    /// # Errors
    ///
    /// [`ToolGateError::BadSignature`], [`ToolGateError::UnknownTool`],
    /// [`ToolGateError::ToolArgSchema`], [`ToolGateError::ToolFailed`], or
    /// [`ToolGateError::Audit`].
    pub fn execute(
        &self,
        plan: &ExecutionPlan,
        context: &JsonMap,
    ) -> Result<Vec<JsonMap>, ToolGateError> {
        // One signature verification per plan, not per call.
        saoe_keyring::verify_hex_signature(
            &self.issuer_vk,
            &plan_canonical_bytes(plan),
            &plan.issuer_signature,
        )
        .map_err(|_| ToolGateError::BadSignature)?;

        let mut results = Vec::with_capacity(plan.tool_calls.len());
        for tc in &plan.tool_calls {
            let entry =
                self.tools
                    .get(&tc.tool_name)
                    .ok_or_else(|| ToolGateError::UnknownTool {
                        tool_name: tc.tool_name.clone(),
                    })?;

            let args_value = Value::Object(tc.args.clone());
            entry.args_validator.validate(&args_value).map_err(|e| {
                ToolGateError::ToolArgSchema {
                    tool_name: tc.tool_name.clone(),
                    reason: e.to_string(),
                }
            })?;

            let result =
                (entry.callable)(&tc.args, context).map_err(|source| ToolGateError::ToolFailed {
                    tool_name: tc.tool_name.clone(),
                    source,
                })?;

            self.audit.emit(
                &AuditEvent::new(EVENT_TOOL_EXECUTED)
                    .with_session_id(&plan.session_id)
                    .with_agent_id(&plan.issuer_id)
                    .with_details(json!({
                        "plan_id": plan.plan_id,
                        "tool_call_id": tc.tool_call_id,
                        "tool_name": tc.tool_name,
                    })),
            )?;
            tracing::debug!(
                plan_id = %plan.plan_id,
                tool = %tc.tool_name,
                "tool executed under signed plan"
            );

            results.push(result);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn audit_log(dir: &tempfile::TempDir) -> AuditLog {
        AuditLog::open(&dir.path().join("audit.db")).unwrap()
    }

    fn counting_tool(counter: Arc<AtomicUsize>) -> ToolFn {
        Box::new(move |args, _context| {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut out = JsonMap::new();
            out.insert("echo".into(), Value::Object(args.clone()));
            Ok(out)
        })
    }

    fn string_args_schema() -> Value {
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"],
            "additionalProperties": false,
        })
    }

    fn call(id: &str, tool: &str, text: &str) -> ToolCall {
        let mut args = JsonMap::new();
        args.insert("text".into(), Value::from(text));
        ToolCall {
            tool_call_id: id.into(),
            tool_name: tool.into(),
            args,
        }
    }

    fn plan_for(issuer_sk: &saoe_keyring::SigningKey, calls: Vec<ToolCall>) -> ExecutionPlan {
        sign_plan(
            PlanDraft {
                plan_id: None,
                session_id: "sess-1".into(),
                issuer_id: "over_agent".into(),
                timestamp_utc: None,
                tool_calls: calls,
            },
            issuer_sk,
        )
    }

    #[test]
    fn construction_requires_matching_pin() {
        let dir = tempfile::tempdir().unwrap();
        let (_, vk) = saoe_keyring::generate_keypair();
        let err = ToolGate::new(vk, &"0".repeat(64), audit_log(&dir)).unwrap_err();
        assert!(matches!(err, ToolGateError::IssuerKeyMismatch(_)));
        assert_eq!(err.kind(), "ISSUER_KEY_MISMATCH");
    }

    #[test]
    fn executes_calls_in_order_and_audits_each() {
        let dir = tempfile::tempdir().unwrap();
        let audit = audit_log(&dir);
        let (sk, vk) = saoe_keyring::generate_keypair();
        let mut gate = ToolGate::new(vk, &saoe_keyring::key_pin(&vk), audit.clone()).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        gate.register_tool("echo", &string_args_schema(), counting_tool(counter.clone()))
            .unwrap();

        let plan = plan_for(&sk, vec![call("c1", "echo", "one"), call("c2", "echo", "two")]);
        let results = gate.execute(&plan, &JsonMap::new()).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["echo"]["text"], "one");
        assert_eq!(results[1]["echo"]["text"], "two");
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        let events = audit.recent_events(10).unwrap();
        assert_eq!(
            events
                .iter()
                .filter(|e| e.event_type == "tool_executed")
                .count(),
            2
        );
    }

    #[test]
    fn attacker_signed_plan_runs_no_tool() {
        let dir = tempfile::tempdir().unwrap();
        let (_, issuer_vk) = saoe_keyring::generate_keypair();
        let (attacker_sk, _) = saoe_keyring::generate_keypair();
        let mut gate =
            ToolGate::new(issuer_vk, &saoe_keyring::key_pin(&issuer_vk), audit_log(&dir))
                .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        gate.register_tool("echo", &string_args_schema(), counting_tool(counter.clone()))
            .unwrap();

        // Plan claims the real issuer's identity but is signed by the
        // attacker's key.
        let plan = plan_for(&attacker_sk, vec![call("c1", "echo", "pwn")]);
        let err = gate.execute(&plan, &JsonMap::new()).unwrap_err();
        assert!(matches!(err, ToolGateError::BadSignature));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tampered_plan_fails_signature() {
        let dir = tempfile::tempdir().unwrap();
        let (sk, vk) = saoe_keyring::generate_keypair();
        let mut gate =
            ToolGate::new(vk, &saoe_keyring::key_pin(&vk), audit_log(&dir)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        gate.register_tool("echo", &string_args_schema(), counting_tool(counter.clone()))
            .unwrap();

        let mut plan = plan_for(&sk, vec![call("c1", "echo", "benign")]);
        plan.tool_calls[0]
            .args
            .insert("text".into(), Value::from("malicious"));

        let err = gate.execute(&plan, &JsonMap::new()).unwrap_err();
        assert!(matches!(err, ToolGateError::BadSignature));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_tool_halts_before_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let (sk, vk) = saoe_keyring::generate_keypair();
        let gate = ToolGate::new(vk, &saoe_keyring::key_pin(&vk), audit_log(&dir)).unwrap();

        let plan = plan_for(&sk, vec![call("c1", "delete_everything", "now")]);
        let err = gate.execute(&plan, &JsonMap::new()).unwrap_err();
        assert!(matches!(err, ToolGateError::UnknownTool { tool_name } if tool_name == "delete_everything"));
    }

    #[test]
    fn schema_violation_halts_remaining_calls() {
        let dir = tempfile::tempdir().unwrap();
        let audit = audit_log(&dir);
        let (sk, vk) = saoe_keyring::generate_keypair();
        let mut gate = ToolGate::new(vk, &saoe_keyring::key_pin(&vk), audit.clone()).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        gate.register_tool("echo", &string_args_schema(), counting_tool(counter.clone()))
            .unwrap();

        let mut bad_args = JsonMap::new();
        bad_args.insert("text".into(), Value::from(42));
        let plan = plan_for(
            &sk,
            vec![
                call("c1", "echo", "ok"),
                ToolCall {
                    tool_call_id: "c2".into(),
                    tool_name: "echo".into(),
                    args: bad_args,
                },
                call("c3", "echo", "never runs"),
            ],
        );

        let err = gate.execute(&plan, &JsonMap::new()).unwrap_err();
        assert!(matches!(err, ToolGateError::ToolArgSchema { .. }));
        // The first call ran; the failing one and everything after did not.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let executed = audit
            .recent_events(10)
            .unwrap()
            .iter()
            .filter(|e| e.event_type == "tool_executed")
            .count();
        assert_eq!(executed, 1);
    }

    #[test]
    fn tool_failure_surfaces_as_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let (sk, vk) = saoe_keyring::generate_keypair();
        let mut gate =
            ToolGate::new(vk, &saoe_keyring::key_pin(&vk), audit_log(&dir)).unwrap();
        gate.register_tool(
            "fragile",
            &json!({"type": "object"}),
            Box::new(|_, _| anyhow::bail!("disk on fire")),
        )
        .unwrap();

        let plan = plan_for(
            &sk,
            vec![ToolCall {
                tool_call_id: "c1".into(),
                tool_name: "fragile".into(),
                args: JsonMap::new(),
            }],
        );
        let err = gate.execute(&plan, &JsonMap::new()).unwrap_err();
        assert!(matches!(err, ToolGateError::ToolFailed { .. }));
        assert_eq!(err.kind(), "TOOL_FAILED");
    }

    #[test]
    fn plan_signature_covers_every_field() {
        let (sk, vk) = saoe_keyring::generate_keypair();
        let plan = plan_for(&sk, vec![call("c1", "echo", "x")]);
        saoe_keyring::verify_hex_signature(&vk, &plan_canonical_bytes(&plan), &plan.issuer_signature)
            .unwrap();

        let mut tampered = plan;
        tampered.session_id = "sess-other".into();
        assert!(
            saoe_keyring::verify_hex_signature(
                &vk,
                &plan_canonical_bytes(&tampered),
                &tampered.issuer_signature
            )
            .is_err()
        );
    }
}
