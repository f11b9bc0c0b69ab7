// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! saoe-vault
#![deny(unsafe_code)]
#![warn(missing_docs)]

use saoe_keyring::VerifyingKey;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

pub mod manifest;
pub mod publish;

pub use manifest::{CapabilitySetManifest, TemplateManifest};

/// Default wall-clock bound on one `age` decryption invocation.
pub const DEFAULT_DECRYPT_TIMEOUT: Duration = Duration::from_secs(10);

/// File suffix for encrypted vault entries.
pub const ENTRY_SUFFIX: &str = ".json.age";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from vault construction and entry resolution.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The dispatcher verify key does not match the configured pin.
    ///
    /// Process-fatal: the vault is the root of trust for template content,
    /// and an unpinned dispatcher key means that trust is gone.
    #[error("dispatcher key pin mismatch: {0}")]
    DispatcherKeyMismatch(#[source] saoe_keyring::KeyringError),

    /// The decryption identity file is missing or not owner-only.
    #[error("identity file rejected: {0}")]
    IdentityFile(#[source] saoe_keyring::KeyringError),

    /// The dispatcher verify key file is missing or malformed.
    #[error("dispatcher verify key unusable: {0}")]
    DispatcherKeyFile(#[source] saoe_keyring::KeyringError),

    /// No vault entry exists for the requested id and version.
    #[error("no vault entry for {key}")]
    EntryNotFound {
        /// `<kind>:<id>:<version>` of the missing entry.
        key: String,
    },

    /// Decryption failed, timed out, or produced non-JSON plaintext.
    #[error("age decryption failed for {key}: {reason}")]
    AgeDecrypt {
        /// Entry being decrypted.
        key: String,
        /// What went wrong.
        reason: String,
    },

    /// A plaintext manifest file could not be read or parsed.
    #[error("manifest unusable for {key}: {reason}")]
    ManifestParse {
        /// Entry the manifest belongs to.
        key: String,
        /// What went wrong.
        reason: String,
    },
}

impl VaultError {
    /// Stable tag for audit `rejected` events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DispatcherKeyMismatch(_) => "DISPATCHER_KEY_MISMATCH",
            Self::IdentityFile(_) => "IDENTITY_FILE",
            Self::DispatcherKeyFile(_) => "DISPATCHER_KEY_MISMATCH",
            Self::EntryNotFound { .. } => "VAULT_ENTRY_NOT_FOUND",
            Self::AgeDecrypt { .. } => "AGE_DECRYPT",
            Self::ManifestParse { .. } => "VAULT_ENTRY_NOT_FOUND",
        }
    }
}

// ---------------------------------------------------------------------------
// Entry kinds
// ---------------------------------------------------------------------------

/// The two kinds of encrypted entry a vault holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A message template (JSON Schema + policy metadata).
    Template,
    /// A capability set (allowed actions + tool permissions).
    CapabilitySet,
}

impl EntryKind {
    fn subdir(self) -> &'static str {
        match self {
            Self::Template => "templates",
            Self::CapabilitySet => "capsets",
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::CapabilitySet => "capset",
        }
    }
}

fn entry_key(kind: EntryKind, id: &str, version: &str) -> String {
    format!("{}:{id}:{version}", kind.tag())
}

// ---------------------------------------------------------------------------
// TemplateVault
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Backend {
    /// Real vault directory; entries decrypted through the `age` binary.
    Age {
        vault_dir: PathBuf,
        identity_file: PathBuf,
        age_bin: PathBuf,
        timeout: Duration,
    },
    /// In-memory entries for tests. Keys are `<kind>:<id>:<version>`,
    /// values are plaintext JSON strings.
    Memory(BTreeMap<String, String>),
}

/// Read-only view of the SAOE vault.
///
/// Many readers, zero writers at runtime; mutation belongs to the
/// [`publish`] pathway. Every constructor enforces the dispatcher pin.
#[derive(Debug)]
pub struct TemplateVault {
    backend: Backend,
    dispatcher_vk: VerifyingKey,
}

impl TemplateVault {
    /// Open a vault directory.
    ///
    /// Fails fast (and the process must treat this as fatal) when the
    /// dispatcher key does not match `dispatcher_pin`, when the identity
    /// file is not mode `0600`, or when the key file is malformed.
    ///
    /// # Errors
    ///
    /// [`VaultError::DispatcherKeyMismatch`], [`VaultError::IdentityFile`],
    /// or [`VaultError::DispatcherKeyFile`].
    pub fn open(
        vault_dir: &Path,
        identity_file: &Path,
        dispatcher_pin: &str,
    ) -> Result<Self, VaultError> {
        saoe_keyring::assert_owner_only(identity_file).map_err(VaultError::IdentityFile)?;

        let key_file = vault_dir.join("keys").join("dispatcher_verify.pub");
        let dispatcher_vk =
            saoe_keyring::load_verify_key(&key_file).map_err(VaultError::DispatcherKeyFile)?;
        saoe_keyring::assert_key_pin(&dispatcher_vk, dispatcher_pin)
            .map_err(VaultError::DispatcherKeyMismatch)?;

        Ok(Self {
            backend: Backend::Age {
                vault_dir: vault_dir.to_path_buf(),
                identity_file: identity_file.to_path_buf(),
                age_bin: PathBuf::from("age"),
                timeout: DEFAULT_DECRYPT_TIMEOUT,
            },
            dispatcher_vk,
        })
    }

    /// Construct a vault backed by in-memory entries (tests only).
    ///
    /// The pin check is still enforced; test fixtures exercise the same
    /// trust-root discipline as production.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::DispatcherKeyMismatch`] when the supplied key
    /// does not match `dispatcher_pin`.
    pub fn with_entries(
        entries: BTreeMap<String, String>,
        dispatcher_vk: VerifyingKey,
        dispatcher_pin: &str,
    ) -> Result<Self, VaultError> {
        saoe_keyring::assert_key_pin(&dispatcher_vk, dispatcher_pin)
            .map_err(VaultError::DispatcherKeyMismatch)?;
        Ok(Self {
            backend: Backend::Memory(entries),
            dispatcher_vk,
        })
    }

    /// Override the `age` binary path (defaults to `age` on `PATH`).
    #[must_use]
    pub fn with_age_binary(mut self, path: impl Into<PathBuf>) -> Self {
        if let Backend::Age { age_bin, .. } = &mut self.backend {
            *age_bin = path.into();
        }
        self
    }

    /// Override the decryption timeout.
    #[must_use]
    pub fn with_decrypt_timeout(mut self, timeout: Duration) -> Self {
        if let Backend::Age { timeout: t, .. } = &mut self.backend {
            *t = timeout;
        }
        self
    }

    /// The pinned dispatcher verify key.
    #[must_use]
    pub fn dispatcher_verify_key(&self) -> &VerifyingKey {
        &self.dispatcher_vk
    }

    /// Decrypt and return the template for `(template_id, version)`.
    ///
    /// # Errors
    ///
    /// [`VaultError::EntryNotFound`] when no such entry exists,
    /// [`VaultError::AgeDecrypt`] on decryption failure, timeout, or
    /// non-JSON plaintext.
    pub async fn get_template(
        &self,
        template_id: &str,
        version: &str,
    ) -> Result<Map<String, Value>, VaultError> {
        self.get_entry(EntryKind::Template, template_id, version)
            .await
    }

    /// Decrypt and return the capability set for `(id, version)`.
    ///
    /// # Errors
    ///
    /// Same as [`get_template`](Self::get_template).
    pub async fn get_capability_set(
        &self,
        capability_set_id: &str,
        version: &str,
    ) -> Result<Map<String, Value>, VaultError> {
        self.get_entry(EntryKind::CapabilitySet, capability_set_id, version)
            .await
    }

    /// Read the plaintext signed manifest for a capability set.
    ///
    /// # Errors
    ///
    /// [`VaultError::EntryNotFound`] when no manifest exists,
    /// [`VaultError::ManifestParse`] when the file is not valid manifest
    /// JSON.
    pub fn get_capability_set_manifest(
        &self,
        capability_set_id: &str,
        version: &str,
    ) -> Result<CapabilitySetManifest, VaultError> {
        let key = entry_key(EntryKind::CapabilitySet, capability_set_id, version);
        let raw = self.read_manifest_text(capability_set_id, version, &key)?;
        serde_json::from_str(&raw).map_err(|e| VaultError::ManifestParse {
            key,
            reason: e.to_string(),
        })
    }

    /// Read the plaintext signed manifest for a template.
    ///
    /// # Errors
    ///
    /// Same as [`get_capability_set_manifest`](Self::get_capability_set_manifest).
    pub fn get_template_manifest(
        &self,
        template_id: &str,
        version: &str,
    ) -> Result<TemplateManifest, VaultError> {
        let key = entry_key(EntryKind::Template, template_id, version);
        let raw = self.read_manifest_text(template_id, version, &key)?;
        serde_json::from_str(&raw).map_err(|e| VaultError::ManifestParse {
            key,
            reason: e.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn read_manifest_text(
        &self,
        id: &str,
        version: &str,
        key: &str,
    ) -> Result<String, VaultError> {
        match &self.backend {
            Backend::Memory(entries) => {
                let mkey = format!("manifest:{key}");
                entries
                    .get(&mkey)
                    .cloned()
                    .ok_or_else(|| VaultError::EntryNotFound { key: mkey })
            }
            Backend::Age { vault_dir, .. } => {
                let path = vault_dir
                    .join("manifests")
                    .join(format!("{id}_v{version}.manifest.json"));
                if !path.exists() {
                    return Err(VaultError::EntryNotFound {
                        key: key.to_string(),
                    });
                }
                std::fs::read_to_string(&path).map_err(|e| VaultError::ManifestParse {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn get_entry(
        &self,
        kind: EntryKind,
        id: &str,
        version: &str,
    ) -> Result<Map<String, Value>, VaultError> {
        let key = entry_key(kind, id, version);
        let plaintext = match &self.backend {
            Backend::Memory(entries) => entries
                .get(&key)
                .cloned()
                .ok_or_else(|| VaultError::EntryNotFound { key: key.clone() })?
                .into_bytes(),
            Backend::Age {
                vault_dir,
                identity_file,
                age_bin,
                timeout,
            } => {
                let path = vault_dir
                    .join(kind.subdir())
                    .join(format!("{id}_v{version}{ENTRY_SUFFIX}"));
                if !path.exists() {
                    return Err(VaultError::EntryNotFound { key: key.clone() });
                }
                decrypt_file(age_bin, identity_file, &path, *timeout, &key).await?
            }
        };

        let parsed: Value =
            serde_json::from_slice(&plaintext).map_err(|e| VaultError::AgeDecrypt {
                key: key.clone(),
                reason: format!("plaintext is not valid JSON: {e}"),
            })?;
        match parsed {
            Value::Object(map) => Ok(map),
            _ => Err(VaultError::AgeDecrypt {
                key,
                reason: "plaintext is not a JSON object".to_string(),
            }),
        }
    }
}

async fn decrypt_file(
    age_bin: &Path,
    identity_file: &Path,
    path: &Path,
    timeout: Duration,
    key: &str,
) -> Result<Vec<u8>, VaultError> {
    let mut cmd = tokio::process::Command::new(age_bin);
    cmd.arg("--decrypt")
        .arg("-i")
        .arg(identity_file)
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| VaultError::AgeDecrypt {
            key: key.to_string(),
            reason: format!("decryption timed out after {timeout:?}"),
        })?
        .map_err(|e| VaultError::AgeDecrypt {
            key: key.to_string(),
            reason: format!("cannot run age: {e}"),
        })?;

    if !output.status.success() {
        return Err(VaultError::AgeDecrypt {
            key: key.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    tracing::debug!(%key, "vault entry decrypted");
    Ok(output.stdout)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
