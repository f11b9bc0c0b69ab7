// SPDX-License-Identifier: MIT OR Apache-2.0
//! Signed vault manifests.
//!
//! A manifest binds an entry id and version to the SHA-256 of the entry's
//! canonical JSON, under a dispatcher signature. Template and capability-set
//! manifests use distinct id field names so a signature over one can never
//! be replayed as the other.

use saoe_envelope::canonical;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Plaintext manifest published next to an encrypted template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateManifest {
    /// Template identifier.
    pub template_id: String,
    /// Template version.
    pub version: String,
    /// Hex SHA-256 of the canonical template JSON.
    pub sha256_hash: String,
    /// Hex Ed25519 signature over [`template_manifest_bytes`].
    pub dispatcher_signature: String,
}

/// Plaintext manifest published next to an encrypted capability set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySetManifest {
    /// Capability set identifier.
    pub capability_set_id: String,
    /// Capability set version.
    pub version: String,
    /// Hex SHA-256 of the canonical capability-set JSON.
    pub sha256_hash: String,
    /// Hex Ed25519 signature over [`capability_set_manifest_bytes`].
    pub dispatcher_signature: String,
}

/// Canonical bytes a dispatcher signs for a template manifest.
#[must_use]
pub fn template_manifest_bytes(template_id: &str, version: &str, sha256_hash: &str) -> Vec<u8> {
    canonical::to_canonical_bytes(&json!({
        "template_id": template_id,
        "version": version,
        "sha256_hash": sha256_hash,
    }))
}

/// Canonical bytes a dispatcher signs for a capability-set manifest.
#[must_use]
pub fn capability_set_manifest_bytes(
    capability_set_id: &str,
    version: &str,
    sha256_hash: &str,
) -> Vec<u8> {
    canonical::to_canonical_bytes(&json!({
        "capability_set_id": capability_set_id,
        "version": version,
        "sha256_hash": sha256_hash,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_manifest_bytes_are_canonical() {
        let bytes = template_manifest_bytes("blog_article_intent", "1", "abc");
        assert_eq!(
            bytes,
            br#"{"sha256_hash":"abc","template_id":"blog_article_intent","version":"1"}"#
        );
    }

    #[test]
    fn manifest_domains_are_separated() {
        // Same id/version/hash must not produce the same signed bytes for
        // the two manifest kinds.
        let t = template_manifest_bytes("x", "1", "h");
        let c = capability_set_manifest_bytes("x", "1", "h");
        assert_ne!(t, c);
    }
}
