// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! saoe-keyring
#![deny(unsafe_code)]
#![warn(missing_docs)]

use ed25519_dalek::{Signature, Signer, Verifier};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub use ed25519_dalek::{SigningKey, VerifyingKey};

/// Length in bytes of a raw key file (seed or public key).
pub const RAW_KEY_LEN: usize = 32;

/// Length in bytes of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from key loading, persistence, and pin checks.
#[derive(Debug, thiserror::Error)]
pub enum KeyringError {
    /// A loaded verify key does not match its pinned SHA-256 hash.
    ///
    /// Components treat this as process-fatal: a pinned key that fails the
    /// pin check means the trust root has been replaced or misconfigured.
    #[error("pinned key hash mismatch: expected {expected}, got {actual}")]
    KeyPinMismatch {
        /// The hex SHA-256 pin established out of band.
        expected: String,
        /// The hex SHA-256 of the key that was actually loaded.
        actual: String,
    },

    /// A key file does not contain exactly 32 bytes.
    #[error("key file {path} must be {RAW_KEY_LEN} bytes, got {len}")]
    InvalidKeyFile {
        /// Path of the offending file.
        path: PathBuf,
        /// Observed file length.
        len: usize,
    },

    /// The raw public key bytes do not form a valid Ed25519 point.
    #[error("key file {path} does not hold a valid Ed25519 public key")]
    MalformedKey {
        /// Path of the offending file.
        path: PathBuf,
    },

    /// A signing-key file is readable by users other than the owner.
    #[error("signing key file {path} must have mode 0600, got {mode:o}")]
    InsecureKeyFile {
        /// Path of the offending file.
        path: PathBuf,
        /// Observed permission bits.
        mode: u32,
    },

    /// A signature failed to verify, or was not 64 bytes of valid hex.
    #[error("signature verification failed")]
    BadSignature,

    /// Underlying filesystem error.
    #[error("key file I/O error at {path}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Key generation
// ---------------------------------------------------------------------------

/// Generate a fresh Ed25519 keypair from the OS CSPRNG.
#[must_use]
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let mut csprng = rand::rngs::OsRng;
    let sk = SigningKey::generate(&mut csprng);
    let vk = sk.verifying_key();
    (sk, vk)
}

// ---------------------------------------------------------------------------
// Key persistence (raw 32-byte files)
// ---------------------------------------------------------------------------

/// Write a raw 32-byte signing-key seed to `path` with mode `0600`.
///
/// # Errors
///
/// Returns [`KeyringError::Io`] if the file cannot be written or its
/// permissions cannot be restricted.
pub fn save_signing_key(sk: &SigningKey, path: &Path) -> Result<(), KeyringError> {
    fs::write(path, sk.to_bytes()).map_err(|source| KeyringError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    set_owner_only(path)
}

/// Write a raw 32-byte verify key to `path`.
///
/// # Errors
///
/// Returns [`KeyringError::Io`] if the file cannot be written.
pub fn save_verify_key(vk: &VerifyingKey, path: &Path) -> Result<(), KeyringError> {
    fs::write(path, vk.to_bytes()).map_err(|source| KeyringError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a signing key from a 32-byte seed file.
///
/// The file must be exactly 32 bytes and, on Unix, owner-read-write only.
///
/// # Errors
///
/// Returns [`KeyringError::InvalidKeyFile`] on a wrong-length file,
/// [`KeyringError::InsecureKeyFile`] if the file mode is broader than
/// `0600`, and [`KeyringError::Io`] on read failure.
pub fn load_signing_key(path: &Path) -> Result<SigningKey, KeyringError> {
    assert_owner_only(path)?;
    let raw = read_raw_key(path)?;
    Ok(SigningKey::from_bytes(&raw))
}

/// Load a verify key from a 32-byte public-key file.
///
/// # Errors
///
/// Returns [`KeyringError::InvalidKeyFile`] on a wrong-length file,
/// [`KeyringError::MalformedKey`] if the bytes are not a valid curve point,
/// and [`KeyringError::Io`] on read failure.
pub fn load_verify_key(path: &Path) -> Result<VerifyingKey, KeyringError> {
    let raw = read_raw_key(path)?;
    VerifyingKey::from_bytes(&raw).map_err(|_| KeyringError::MalformedKey {
        path: path.to_path_buf(),
    })
}

fn read_raw_key(path: &Path) -> Result<[u8; RAW_KEY_LEN], KeyringError> {
    let bytes = fs::read(path).map_err(|source| KeyringError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| KeyringError::InvalidKeyFile {
            path: path.to_path_buf(),
            len,
        })
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<(), KeyringError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
        KeyringError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<(), KeyringError> {
    Ok(())
}

/// Check that `path` has mode `0600` (no-op on non-Unix targets).
///
/// # Errors
///
/// Returns [`KeyringError::InsecureKeyFile`] if any group/other bits are set.
#[cfg(unix)]
pub fn assert_owner_only(path: &Path) -> Result<(), KeyringError> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path).map_err(|source| KeyringError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mode = meta.permissions().mode() & 0o777;
    if mode != 0o600 {
        return Err(KeyringError::InsecureKeyFile {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

/// Check that `path` has mode `0600` (no-op on non-Unix targets).
#[cfg(not(unix))]
pub fn assert_owner_only(_path: &Path) -> Result<(), KeyringError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Cryptographic operations
// ---------------------------------------------------------------------------

/// Sign `data` with `sk`; returns the 64-byte Ed25519 signature.
#[must_use]
pub fn sign_bytes(sk: &SigningKey, data: &[u8]) -> [u8; SIGNATURE_LEN] {
    sk.sign(data).to_bytes()
}

/// Verify `signature` over `data` with `vk`.
///
/// # Errors
///
/// Returns [`KeyringError::BadSignature`] if the signature does not verify.
pub fn verify_bytes(vk: &VerifyingKey, data: &[u8], signature: &[u8]) -> Result<(), KeyringError> {
    let sig = Signature::from_slice(signature).map_err(|_| KeyringError::BadSignature)?;
    vk.verify(data, &sig).map_err(|_| KeyringError::BadSignature)
}

/// Verify a hex-encoded signature over `data` with `vk`.
///
/// Non-hex input fails with [`KeyringError::BadSignature`] before any curve
/// math runs.
///
/// # Errors
///
/// Returns [`KeyringError::BadSignature`] on malformed hex or a failed
/// verification.
pub fn verify_hex_signature(
    vk: &VerifyingKey,
    data: &[u8],
    signature_hex: &str,
) -> Result<(), KeyringError> {
    let sig_bytes = hex::decode(signature_hex).map_err(|_| KeyringError::BadSignature)?;
    verify_bytes(vk, data, &sig_bytes)
}

// ---------------------------------------------------------------------------
// Pinning
// ---------------------------------------------------------------------------

/// Lowercase hex SHA-256 digest of the raw 32-byte verify-key bytes.
///
/// # Examples
///
/// ```
/// let (_, vk) = saoe_keyring::generate_keypair();
/// let pin = saoe_keyring::key_pin(&vk);
/// assert_eq!(pin.len(), 64);
/// assert!(saoe_keyring::assert_key_pin(&vk, &pin).is_ok());
/// ```
#[must_use]
pub fn key_pin(vk: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(vk.to_bytes());
    hex::encode(hasher.finalize())
}

/// Assert that `vk` matches `expected_pin` (hex SHA-256 of its bytes).
///
/// # Errors
///
/// Returns [`KeyringError::KeyPinMismatch`] when the digest differs. Callers
/// binding a trust root (vault dispatcher, ToolGate issuer) must treat this
/// as fatal and refuse to construct.
pub fn assert_key_pin(vk: &VerifyingKey, expected_pin: &str) -> Result<(), KeyringError> {
    let actual = key_pin(vk);
    if actual != expected_pin {
        return Err(KeyringError::KeyPinMismatch {
            expected: expected_pin.to_string(),
            actual,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let (sk, vk) = generate_keypair();
        let sig = sign_bytes(&sk, b"payload");
        verify_bytes(&vk, b"payload", &sig).unwrap();
    }

    #[test]
    fn verify_rejects_altered_data() {
        let (sk, vk) = generate_keypair();
        let sig = sign_bytes(&sk, b"payload");
        let err = verify_bytes(&vk, b"tampered", &sig).unwrap_err();
        assert!(matches!(err, KeyringError::BadSignature));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let (sk, _) = generate_keypair();
        let (_, other_vk) = generate_keypair();
        let sig = sign_bytes(&sk, b"payload");
        assert!(verify_bytes(&other_vk, b"payload", &sig).is_err());
    }

    #[test]
    fn hex_signature_rejects_non_hex() {
        let (_, vk) = generate_keypair();
        let err = verify_hex_signature(&vk, b"payload", "zz-not-hex").unwrap_err();
        assert!(matches!(err, KeyringError::BadSignature));
    }

    #[test]
    fn pin_matches_only_its_own_key() {
        let (_, vk) = generate_keypair();
        let (_, other_vk) = generate_keypair();
        let pin = key_pin(&vk);
        assert_key_pin(&vk, &pin).unwrap();
        let err = assert_key_pin(&other_vk, &pin).unwrap_err();
        assert!(matches!(err, KeyringError::KeyPinMismatch { .. }));
    }

    #[test]
    fn key_files_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sk_path = dir.path().join("agent.key");
        let vk_path = dir.path().join("agent.pub");
        let (sk, vk) = generate_keypair();

        save_signing_key(&sk, &sk_path).unwrap();
        save_verify_key(&vk, &vk_path).unwrap();

        let loaded_sk = load_signing_key(&sk_path).unwrap();
        let loaded_vk = load_verify_key(&vk_path).unwrap();
        assert_eq!(loaded_sk.to_bytes(), sk.to_bytes());
        assert_eq!(loaded_vk.to_bytes(), vk.to_bytes());
    }

    #[test]
    fn truncated_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.pub");
        std::fs::write(&path, [0u8; 16]).unwrap();
        let err = load_verify_key(&path).unwrap_err();
        assert!(matches!(err, KeyringError::InvalidKeyFile { len: 16, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn world_readable_signing_key_is_rejected() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loose.key");
        let (sk, _) = generate_keypair();
        save_signing_key(&sk, &path).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let err = load_signing_key(&path).unwrap_err();
        assert!(matches!(err, KeyringError::InsecureKeyFile { mode: 0o644, .. }));
    }
}
