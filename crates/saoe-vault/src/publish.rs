// SPDX-License-Identifier: MIT OR Apache-2.0
//! Publisher pathway: the only code that writes into a vault.
//!
//! Publication re-types trust: the operator must echo the canonical SHA-256
//! of the entry back through the confirmation gate before anything touches
//! disk. Any mismatch aborts without writing. Front-ends (a CLI prompt, a
//! review UI) supply the gate; tests drive it directly.

use crate::manifest::{
    CapabilitySetManifest, TemplateManifest, capability_set_manifest_bytes,
    template_manifest_bytes,
};
use crate::{ENTRY_SUFFIX, EntryKind};
use saoe_envelope::canonical;
use saoe_keyring::SigningKey;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

/// Wall-clock bound on one `age` encryption invocation.
const ENCRYPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the publisher pathway.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The entry JSON is missing its id or version field.
    #[error("entry not publishable: {reason}")]
    InvalidEntry {
        /// What is missing or malformed.
        reason: String,
    },

    /// The operator-typed hash did not match the computed hash.
    #[error("confirmation hash mismatch: expected {expected}, operator typed {typed}")]
    ConfirmationMismatch {
        /// The computed canonical SHA-256.
        expected: String,
        /// What came back through the gate.
        typed: String,
    },

    /// `age` encryption failed or timed out.
    #[error("age encryption failed: {reason}")]
    AgeEncrypt {
        /// What went wrong.
        reason: String,
    },

    /// Filesystem failure while installing files.
    #[error("publish I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Paths and hash of a successfully published entry.
#[derive(Debug, Clone)]
pub struct Published {
    /// Hex SHA-256 of the canonical entry JSON.
    pub sha256_hash: String,
    /// Installed ciphertext (or plaintext fallback) path.
    pub entry_path: PathBuf,
    /// Installed manifest path.
    pub manifest_path: PathBuf,
}

/// Publish a template into `vault_dir`.
///
/// `confirm` receives the computed canonical SHA-256 and must return the
/// hash the operator typed; publication proceeds only on an exact match.
/// With `age_recipient = None` the body is stored in plaintext (test
/// environments without `age`); a warning is logged.
///
/// # Errors
///
/// [`PublishError::InvalidEntry`] when `template_id`/`version` are missing,
/// [`PublishError::ConfirmationMismatch`] when the gate fails (nothing is
/// written), [`PublishError::AgeEncrypt`]/[`PublishError::Io`] on
/// encryption or installation failure.
pub async fn publish_template<F>(
    template: &Value,
    vault_dir: &Path,
    dispatcher_signing_key: &SigningKey,
    age_recipient: Option<&str>,
    confirm: F,
) -> Result<Published, PublishError>
where
    F: FnOnce(&str) -> String,
{
    let id = required_field(template, "template_id")?;
    let version = required_field(template, "version")?;

    let canonical_bytes = canonical::to_canonical_bytes(template);
    let sha256 = canonical::canonical_sha256_hex(template);

    gate(&sha256, confirm)?;

    let signature = hex::encode(saoe_keyring::sign_bytes(
        dispatcher_signing_key,
        &template_manifest_bytes(&id, &version, &sha256),
    ));
    let manifest = TemplateManifest {
        template_id: id.clone(),
        version: version.clone(),
        sha256_hash: sha256.clone(),
        dispatcher_signature: signature,
    };
    let manifest_json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| PublishError::InvalidEntry {
            reason: format!("manifest not serializable: {e}"),
        })?;

    install(
        vault_dir,
        EntryKind::Template,
        &id,
        &version,
        &canonical_bytes,
        &manifest_json,
        age_recipient,
        sha256,
    )
    .await
}

/// Publish a capability set into `vault_dir`.
///
/// Identical discipline to [`publish_template`], keyed on
/// `capability_set_id` and signed over the capability-set manifest domain.
///
/// # Errors
///
/// As [`publish_template`].
pub async fn publish_capability_set<F>(
    capability_set: &Value,
    vault_dir: &Path,
    dispatcher_signing_key: &SigningKey,
    age_recipient: Option<&str>,
    confirm: F,
) -> Result<Published, PublishError>
where
    F: FnOnce(&str) -> String,
{
    let id = required_field(capability_set, "capability_set_id")?;
    let version = required_field(capability_set, "version")?;

    let canonical_bytes = canonical::to_canonical_bytes(capability_set);
    let sha256 = canonical::canonical_sha256_hex(capability_set);

    gate(&sha256, confirm)?;

    let signature = hex::encode(saoe_keyring::sign_bytes(
        dispatcher_signing_key,
        &capability_set_manifest_bytes(&id, &version, &sha256),
    ));
    let manifest = CapabilitySetManifest {
        capability_set_id: id.clone(),
        version: version.clone(),
        sha256_hash: sha256.clone(),
        dispatcher_signature: signature,
    };
    let manifest_json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| PublishError::InvalidEntry {
            reason: format!("manifest not serializable: {e}"),
        })?;

    install(
        vault_dir,
        EntryKind::CapabilitySet,
        &id,
        &version,
        &canonical_bytes,
        &manifest_json,
        age_recipient,
        sha256,
    )
    .await
}

fn required_field(entry: &Value, field: &str) -> Result<String, PublishError> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| PublishError::InvalidEntry {
            reason: format!("missing string field {field:?}"),
        })
}

fn gate<F>(sha256: &str, confirm: F) -> Result<(), PublishError>
where
    F: FnOnce(&str) -> String,
{
    let typed = confirm(sha256).trim().to_string();
    if typed != sha256 {
        return Err(PublishError::ConfirmationMismatch {
            expected: sha256.to_string(),
            typed,
        });
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn install(
    vault_dir: &Path,
    kind: EntryKind,
    id: &str,
    version: &str,
    canonical_bytes: &[u8],
    manifest_json: &str,
    age_recipient: Option<&str>,
    sha256: String,
) -> Result<Published, PublishError> {
    let entry_dir = vault_dir.join(match kind {
        EntryKind::Template => "templates",
        EntryKind::CapabilitySet => "capsets",
    });
    let manifest_dir = vault_dir.join("manifests");
    std::fs::create_dir_all(&entry_dir)?;
    std::fs::create_dir_all(&manifest_dir)?;

    let body = match age_recipient {
        Some(recipient) => encrypt(canonical_bytes, recipient).await?,
        None => {
            tracing::warn!(%id, %version, "age not configured; storing entry in plaintext");
            canonical_bytes.to_vec()
        }
    };

    let entry_path = entry_dir.join(format!("{id}_v{version}{ENTRY_SUFFIX}"));
    atomic_write(&entry_dir, &entry_path, &body)?;

    let manifest_path = manifest_dir.join(format!("{id}_v{version}.manifest.json"));
    atomic_write(&manifest_dir, &manifest_path, manifest_json.as_bytes())?;

    tracing::info!(%id, %version, %sha256, "vault entry published");
    Ok(Published {
        sha256_hash: sha256,
        entry_path,
        manifest_path,
    })
}

fn atomic_write(dir: &Path, final_path: &Path, bytes: &[u8]) -> Result<(), PublishError> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(final_path)
        .map_err(|e| PublishError::Io(e.error))?;
    Ok(())
}

async fn encrypt(plaintext: &[u8], recipient: &str) -> Result<Vec<u8>, PublishError> {
    let mut child = tokio::process::Command::new("age")
        .arg("-r")
        .arg(recipient)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PublishError::AgeEncrypt {
            reason: format!("cannot run age: {e}"),
        })?;

    if let Some(stdin) = child.stdin.as_mut() {
        use tokio::io::AsyncWriteExt;
        stdin
            .write_all(plaintext)
            .await
            .map_err(|e| PublishError::AgeEncrypt {
                reason: format!("cannot feed plaintext: {e}"),
            })?;
    }
    drop(child.stdin.take());

    let output = tokio::time::timeout(ENCRYPT_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| PublishError::AgeEncrypt {
            reason: format!("encryption timed out after {ENCRYPT_TIMEOUT:?}"),
        })?
        .map_err(|e| PublishError::AgeEncrypt {
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(PublishError::AgeEncrypt {
            reason: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output.stdout)
}
