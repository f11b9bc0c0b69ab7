// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! saoe-safe-fs
#![deny(unsafe_code)]
#![warn(missing_docs)]

use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the safe filesystem primitives.
#[derive(Debug, thiserror::Error)]
pub enum SafeFsError {
    /// A resolved path escapes the allowed base directory or traverses a
    /// symlink.
    #[error("unsafe path: {reason}")]
    SafePath {
        /// Why the path was rejected.
        reason: String,
    },

    /// `atomic_move_then_verify` failed.
    #[error("atomic move failed: {reason}")]
    AtomicMove {
        /// Why the move failed.
        reason: String,
    },
}

impl SafeFsError {
    fn safe_path(reason: impl Into<String>) -> Self {
        Self::SafePath {
            reason: reason.into(),
        }
    }

    fn atomic_move(reason: impl Into<String>) -> Self {
        Self::AtomicMove {
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// resolve_safe_path
// ---------------------------------------------------------------------------

/// Resolve `untrusted` relative to `base_dir`, enforcing containment.
///
/// Rules:
/// - the result must stay inside `base_dir` (no `../` escapes, no absolute
///   replacement);
/// - no component of the joined path below `base_dir` may be a symlink.
///
/// The symlink walk runs on the unresolved join, before any normalization
/// that would follow links and erase them from the path. `base_dir` itself
/// is canonicalized first (it may legitimately sit behind a symlink such as
/// `/tmp` on macOS); it does not need to exist yet.
///
/// # Errors
///
/// Returns [`SafeFsError::SafePath`] on any violation.
pub fn resolve_safe_path(base_dir: &Path, untrusted: &str) -> Result<PathBuf, SafeFsError> {
    let base = canonical_base(base_dir)?;
    let joined = base.join(untrusted);

    reject_symlink_components(&base, &joined)?;

    let candidate = normalize_lexically(&joined)
        .ok_or_else(|| SafeFsError::safe_path(format!("cannot resolve path: {untrusted:?}")))?;

    if !candidate.starts_with(&base) {
        return Err(SafeFsError::safe_path(format!(
            "path {untrusted:?} escapes base directory {}",
            base.display()
        )));
    }
    Ok(candidate)
}

fn canonical_base(base_dir: &Path) -> Result<PathBuf, SafeFsError> {
    if base_dir.exists() {
        base_dir.canonicalize().map_err(|e| {
            SafeFsError::safe_path(format!("cannot canonicalize base {}: {e}", base_dir.display()))
        })
    } else {
        std::path::absolute(base_dir).map_err(|e| {
            SafeFsError::safe_path(format!("cannot absolutize base {}: {e}", base_dir.display()))
        })
    }
}

/// Walk every cumulative prefix of `joined` below `base` and reject any
/// component that exists as a symlink. Must run before normalization.
fn reject_symlink_components(base: &Path, joined: &Path) -> Result<(), SafeFsError> {
    let relative = match joined.strip_prefix(base) {
        Ok(rel) => rel,
        // Absolute untrusted input replaced the base on join; containment
        // is checked after normalization, nothing to walk here.
        Err(_) => return Ok(()),
    };

    let mut current = base.to_path_buf();
    for component in relative.components() {
        current.push(component);
        if let Ok(meta) = std::fs::symlink_metadata(&current) {
            if meta.file_type().is_symlink() {
                return Err(SafeFsError::safe_path(format!(
                    "symlink detected in path: {}",
                    current.display()
                )));
            }
        }
    }
    Ok(())
}

/// Normalize `.` and `..` without touching the filesystem. Safe only after
/// the symlink walk: with no links in play, lexical and physical
/// resolution agree. Returns `None` when `..` would climb past the root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other),
        }
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// atomic_move_then_verify
// ---------------------------------------------------------------------------

/// Atomically move `src` into `dst_dir`, verifying the copy's SHA-256.
///
/// Steps: read `src` exactly once; write the bytes to a temp file in
/// `dst_dir`; fsync; re-read the temp file and compare digests; atomically
/// rename temp to the final name; best-effort remove `src`.
///
/// After success the caller must work only from the returned path. `src`
/// may have been swapped by an attacker in the meantime; it is never
/// re-read.
///
/// # Errors
///
/// Returns [`SafeFsError::AtomicMove`] when the source is missing or
/// unreadable, the digest check fails, or any filesystem operation fails.
pub fn atomic_move_then_verify(src: &Path, dst_dir: &Path) -> Result<PathBuf, SafeFsError> {
    let file_name = src
        .file_name()
        .ok_or_else(|| SafeFsError::atomic_move(format!("source has no file name: {}", src.display())))?;
    let data = std::fs::read(src)
        .map_err(|e| SafeFsError::atomic_move(format!("cannot read source {}: {e}", src.display())))?;
    let expected_sha256 = sha256_hex(&data);

    let final_path = dst_dir.join(file_name);

    let mut tmp = tempfile::Builder::new()
        .prefix("_tmp_")
        .tempfile_in(dst_dir)
        .map_err(|e| SafeFsError::atomic_move(format!("cannot create temp file in {}: {e}", dst_dir.display())))?;

    tmp.write_all(&data)
        .and_then(|()| tmp.flush())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| SafeFsError::atomic_move(format!("cannot write temp file: {e}")))?;

    let written = std::fs::read(tmp.path())
        .map_err(|e| SafeFsError::atomic_move(format!("cannot re-read temp file: {e}")))?;
    let actual_sha256 = sha256_hex(&written);
    if actual_sha256 != expected_sha256 {
        return Err(SafeFsError::atomic_move(format!(
            "SHA-256 mismatch after write: expected {expected_sha256}, got {actual_sha256}"
        )));
    }

    // Same-directory rename: atomic on POSIX.
    tmp.persist(&final_path)
        .map_err(|e| SafeFsError::atomic_move(format!("rename failed: {}", e.error)))?;

    if let Err(e) = std::fs::remove_file(src) {
        // Best-effort: the authoritative copy is already in place.
        tracing::debug!(src = %src.display(), error = %e, "source cleanup failed after move");
    }

    Ok(final_path)
}

/// Hex SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
