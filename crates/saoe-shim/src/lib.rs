// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! saoe-shim
#![deny(unsafe_code)]
#![warn(missing_docs)]

use saoe_audit::{
    AuditError, AuditEvent, AuditLog, EVENT_FORWARDED, EVENT_HANDLER_ERROR, EVENT_QUARANTINE_LIMIT,
    EVENT_REJECTED,
};
use saoe_envelope::{ENVELOPE_FILE_SUFFIX, EnvelopeDraft, EnvelopeError, SatlEnvelope, TemplateRef};
use saoe_keyring::{SigningKey, VerifyingKey};
use saoe_telemetry::ValidationCounters;
use saoe_validator::{EnvelopeValidator, ValidationResult};
use saoe_vault::TemplateVault;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default ceiling on quarantined files before ingestion pauses.
pub const DEFAULT_MAX_QUARANTINE_FILES: usize = 50;

/// Default poll interval for [`AgentShim::run_forever`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Rejection detail strings are truncated to this many characters before
/// they are written into audit events.
const DETAIL_LIMIT: usize = 500;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from shim infrastructure (not per-envelope rejections, which are
/// recorded as audit events and never abort the loop).
#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    /// Queue or quarantine directory failure.
    #[error("shim I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The shared audit store failed.
    #[error("audit store failure: {0}")]
    Audit(#[from] AuditError),

    /// An outbound envelope could not be serialized.
    #[error("outbound envelope failure: {0}")]
    Envelope(#[from] EnvelopeError),
}

// ---------------------------------------------------------------------------
// AgentShim
// ---------------------------------------------------------------------------

/// Standardised lifecycle for one SAOE agent.
///
/// Construction wires the agent's identity to its vault, audit log,
/// signing key, queue, and quarantine; policy knobs are adjusted through
/// the `with_*` builders.
pub struct AgentShim {
    agent_id: String,
    vault: Arc<TemplateVault>,
    audit: AuditLog,
    signing_key: SigningKey,
    known_sender_keys: BTreeMap<String, VerifyingKey>,
    queue_dir: PathBuf,
    quarantine_dir: PathBuf,
    max_quarantine_files: usize,
    file_size_cap: usize,
    sender_quota_per_hour: u64,
    counters: ValidationCounters,
}

impl AgentShim {
    /// Create a shim for `agent_id`, creating the queue and quarantine
    /// directories if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ShimError::Io`] when either directory cannot be created.
    pub fn new(
        agent_id: impl Into<String>,
        vault: Arc<TemplateVault>,
        audit: AuditLog,
        signing_key: SigningKey,
        queue_dir: impl Into<PathBuf>,
        quarantine_dir: impl Into<PathBuf>,
    ) -> Result<Self, ShimError> {
        let queue_dir = queue_dir.into();
        let quarantine_dir = quarantine_dir.into();
        std::fs::create_dir_all(&queue_dir)?;
        std::fs::create_dir_all(&quarantine_dir)?;
        Ok(Self {
            agent_id: agent_id.into(),
            vault,
            audit,
            signing_key,
            known_sender_keys: BTreeMap::new(),
            queue_dir,
            quarantine_dir,
            max_quarantine_files: DEFAULT_MAX_QUARANTINE_FILES,
            file_size_cap: saoe_validator::DEFAULT_FILE_SIZE_CAP,
            sender_quota_per_hour: saoe_validator::DEFAULT_SENDER_QUOTA_PER_HOUR,
            counters: ValidationCounters::new(),
        })
    }

    /// Register a sender this agent accepts envelopes from.
    #[must_use]
    pub fn with_known_sender(mut self, sender_id: impl Into<String>, vk: VerifyingKey) -> Self {
        self.known_sender_keys.insert(sender_id.into(), vk);
        self
    }

    /// Override the quarantine back-pressure limit.
    #[must_use]
    pub fn with_max_quarantine_files(mut self, max: usize) -> Self {
        self.max_quarantine_files = max;
        self
    }

    /// Override the validator's raw-byte size cap.
    #[must_use]
    pub fn with_file_size_cap(mut self, cap: usize) -> Self {
        self.file_size_cap = cap;
        self
    }

    /// Override the validator's per-sender hourly quota.
    #[must_use]
    pub fn with_sender_quota_per_hour(mut self, quota: u64) -> Self {
        self.sender_quota_per_hour = quota;
        self
    }

    /// Share a counter set (e.g. one per process across several shims).
    #[must_use]
    pub fn with_counters(mut self, counters: ValidationCounters) -> Self {
        self.counters = counters;
        self
    }

    /// This shim's agent id.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Outcome totals recorded so far.
    #[must_use]
    pub fn counters(&self) -> &ValidationCounters {
        &self.counters
    }

    fn validator(&self) -> EnvelopeValidator {
        EnvelopeValidator::new(Arc::clone(&self.vault), self.agent_id.clone(), self.audit.clone())
            .with_file_size_cap(self.file_size_cap)
            .with_sender_quota_per_hour(self.sender_quota_per_hour)
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    /// Scan the queue once and validate every envelope found.
    ///
    /// Quarantine back-pressure is checked first: at or past the limit,
    /// a `quarantine_limit_exceeded` event is emitted and nothing is
    /// ingested. Each queue file is atomically moved into quarantine and
    /// validated from the moved copy only. Success deletes the quarantine
    /// copy; failure leaves it for operator review and emits a `rejected`
    /// event tagged with the rejection kind.
    ///
    /// # Errors
    ///
    /// Returns [`ShimError`] only for infrastructure faults (directory
    /// listing, audit store); per-envelope failures never abort the scan.
    pub async fn poll_once(&self) -> Result<Vec<ValidationResult>, ShimError> {
        let quarantine_count = list_envelope_files(&self.quarantine_dir)?.len();
        if quarantine_count >= self.max_quarantine_files {
            tracing::warn!(
                agent = %self.agent_id,
                count = quarantine_count,
                max = self.max_quarantine_files,
                "quarantine limit reached; pausing ingestion"
            );
            self.audit.emit(
                &AuditEvent::new(EVENT_QUARANTINE_LIMIT)
                    .with_agent_id(&self.agent_id)
                    .with_details(json!({
                        "count": quarantine_count,
                        "max": self.max_quarantine_files,
                    })),
            )?;
            return Ok(Vec::new());
        }

        let validator = self.validator();
        let mut results = Vec::new();

        for queue_file in list_envelope_files(&self.queue_dir)? {
            // Move first, then trust: the queue copy is never read.
            let quarantine_path =
                match saoe_safe_fs::atomic_move_then_verify(&queue_file, &self.quarantine_dir) {
                    Ok(path) => path,
                    Err(e) => {
                        self.record_rejected("ATOMIC_MOVE", &e.to_string(), None)?;
                        continue;
                    }
                };

            let raw = match tokio::fs::read(&quarantine_path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.record_rejected("ATOMIC_MOVE", &e.to_string(), None)?;
                    continue;
                }
            };

            // A loose pre-parse just to route the verify-key lookup; the
            // validator re-parses strictly.
            let sender_id = serde_json::from_slice::<Value>(&raw)
                .ok()
                .and_then(|v| v.get("sender_id").and_then(Value::as_str).map(str::to_owned))
                .unwrap_or_default();
            let Some(sender_vk) = self.known_sender_keys.get(&sender_id) else {
                self.record_rejected("UNKNOWN_SENDER", &sender_id, Some(&sender_id))?;
                continue;
            };

            match validator.validate_bytes(&raw, sender_vk).await {
                Ok(result) => {
                    if let Err(e) = std::fs::remove_file(&quarantine_path) {
                        tracing::debug!(
                            path = %quarantine_path.display(),
                            error = %e,
                            "validated envelope cleanup failed"
                        );
                    }
                    self.counters.record_validated(&self.agent_id);
                    results.push(result);
                }
                Err(e) => {
                    self.record_rejected(e.kind(), &e.to_string(), Some(&sender_id))?;
                }
            }
        }

        Ok(results)
    }

    fn record_rejected(
        &self,
        reason: &str,
        detail: &str,
        sender_id: Option<&str>,
    ) -> Result<(), ShimError> {
        let mut details = Map::new();
        details.insert("reason".into(), Value::from(reason));
        details.insert("detail".into(), Value::from(truncate(detail)));
        if let Some(sender) = sender_id {
            details.insert("sender_id".into(), Value::from(sender));
        }
        let mut event = AuditEvent::new(EVENT_REJECTED)
            .with_agent_id(&self.agent_id)
            .with_details(Value::Object(details));
        if let Some(sender) = sender_id {
            if !sender.is_empty() {
                event = event.with_sender_id(sender);
            }
        }
        self.audit.emit(&event)?;
        self.counters.record_rejected(&self.agent_id);
        tracing::info!(agent = %self.agent_id, %reason, "envelope rejected");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Build, sign, and deliver an envelope into a peer's queue.
    ///
    /// The file lands as `<envelope_id>.satl.json` via write-to-temp plus
    /// atomic rename, so the receiving agent never observes a partial
    /// write. A `forwarded` audit event records the delivery.
    ///
    /// # Errors
    ///
    /// [`ShimError::Io`] on delivery failure, [`ShimError::Audit`] when
    /// the forwarded event cannot be recorded.
    pub fn send_envelope(
        &self,
        receiver_id: &str,
        receiver_queue_dir: &Path,
        template_ref: TemplateRef,
        payload: Map<String, Value>,
        session_id: &str,
        human_readable: &str,
    ) -> Result<SatlEnvelope, ShimError> {
        let envelope = saoe_envelope::sign_envelope(
            EnvelopeDraft {
                version: saoe_envelope::ENVELOPE_VERSION.into(),
                envelope_id: None,
                session_id: session_id.to_string(),
                timestamp_utc: None,
                sender_id: self.agent_id.clone(),
                receiver_id: receiver_id.to_string(),
                human_readable: human_readable.to_string(),
                template_ref,
                payload,
            },
            &self.signing_key,
        );

        let wire = saoe_envelope::envelope_to_json(&envelope)?;
        let final_path = receiver_queue_dir
            .join(format!("{}{ENVELOPE_FILE_SUFFIX}", envelope.envelope_id));
        let mut tmp = tempfile::NamedTempFile::new_in(receiver_queue_dir)?;
        tmp.write_all(wire.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&final_path).map_err(|e| ShimError::Io(e.error))?;

        // The envelope id travels in details: the indexed column is
        // reserved for the validated-exactly-once replay guard, and the
        // receiver's validation of this envelope must not collide with
        // the sender's delivery record.
        self.audit.emit(
            &AuditEvent::new(EVENT_FORWARDED)
                .with_session_id(session_id)
                .with_sender_id(&self.agent_id)
                .with_receiver_id(receiver_id)
                .with_agent_id(&self.agent_id)
                .with_details(json!({"envelope_id": envelope.envelope_id})),
        )?;
        self.counters.record_forwarded(&self.agent_id);
        tracing::debug!(
            agent = %self.agent_id,
            receiver = %receiver_id,
            envelope_id = %envelope.envelope_id,
            "envelope forwarded"
        );
        Ok(envelope)
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Poll the queue and hand every validated envelope to `handler`,
    /// sleeping `poll_interval` between scans.
    ///
    /// Handler errors are caught, recorded as `handler_error` events, and
    /// the loop continues. A SIGTERM (Unix) or ctrl-c observed between
    /// polls stops the loop after in-flight work completes.
    ///
    /// # Errors
    ///
    /// Returns [`ShimError`] only for infrastructure faults; handler
    /// faults never propagate.
    pub async fn run_forever<F>(
        &self,
        mut handler: F,
        poll_interval: Duration,
    ) -> Result<(), ShimError>
    where
        F: FnMut(&ValidationResult) -> anyhow::Result<()>,
    {
        tracing::info!(
            agent = %self.agent_id,
            queue = %self.queue_dir.display(),
            "agent shim starting"
        );

        #[cfg(unix)]
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        loop {
            for result in self.poll_once().await? {
                if let Err(e) = handler(&result) {
                    self.audit.emit(
                        &AuditEvent::new(EVENT_HANDLER_ERROR)
                            .with_agent_id(&self.agent_id)
                            .with_session_id(result.session_id())
                            .with_details(json!({"error": truncate(&format!("{e:#}"))})),
                    )?;
                    self.counters.record_handler_error(&self.agent_id);
                    tracing::warn!(agent = %self.agent_id, error = %e, "handler error");
                }
            }

            #[cfg(unix)]
            {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = tokio::signal::ctrl_c() => break,
                    _ = sigterm.recv() => break,
                }
            }
            #[cfg(not(unix))]
            {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }

        tracing::info!(agent = %self.agent_id, "agent shim stopped");
        Ok(())
    }
}

/// Envelope files in `dir`, deterministically sorted by filename.
fn list_envelope_files(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(ENVELOPE_FILE_SUFFIX))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn truncate(detail: &str) -> String {
    detail.chars().take(DETAIL_LIMIT).collect()
}
