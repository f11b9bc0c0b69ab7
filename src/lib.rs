// SPDX-License-Identifier: MIT OR Apache-2.0
//! Secure Agent Orchestration Envelope.
//!
//! Umbrella crate: re-exports every SAOE subsystem under one roof. If you
//! only take one dependency, take this one.
//!
//! - [`keyring`]: Ed25519 keys and pinned-hash guards
//! - [`audit`]: append-only audit log with atomic replay protection
//! - [`safe_fs`]: path-traversal guards and atomic move-then-verify
//! - [`envelope`]: the SATL envelope model and canonical JSON codec
//! - [`vault`]: the age-encrypted template vault and publisher pathway
//! - [`validator`]: the twelve-step default-deny validation pipeline
//! - [`toolgate`]: signed execution-plan enforcement
//! - [`shim`]: the per-agent queue/quarantine lifecycle
//! - [`telemetry`]: tracing setup and operator counters
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub use saoe_audit as audit;
pub use saoe_envelope as envelope;
pub use saoe_keyring as keyring;
pub use saoe_safe_fs as safe_fs;
pub use saoe_shim as shim;
pub use saoe_telemetry as telemetry;
pub use saoe_toolgate as toolgate;
pub use saoe_validator as validator;
pub use saoe_vault as vault;
