// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! saoe-telemetry
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Reads `RUST_LOG` for filtering (defaulting to `info`) and writes
/// human-readable events to stderr. Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Per-agent outcome totals for one shim's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTotals {
    /// Envelopes that passed all validation steps.
    pub validated: u64,
    /// Envelopes rejected at any step.
    pub rejected: u64,
    /// Envelopes signed and sent to peers.
    pub forwarded: u64,
    /// Handler invocations that returned an error.
    pub handler_errors: u64,
}

/// Thread-safe counters keyed by agent id.
///
/// Clone freely; all clones share the same totals.
#[derive(Debug, Clone, Default)]
pub struct ValidationCounters {
    inner: Arc<Mutex<BTreeMap<String, AgentTotals>>>,
}

impl ValidationCounters {
    /// Create an empty counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a validated envelope for `agent_id`.
    pub fn record_validated(&self, agent_id: &str) {
        self.with_totals(agent_id, |t| t.validated += 1);
    }

    /// Record a rejected envelope for `agent_id`.
    pub fn record_rejected(&self, agent_id: &str) {
        self.with_totals(agent_id, |t| t.rejected += 1);
    }

    /// Record a forwarded envelope for `agent_id`.
    pub fn record_forwarded(&self, agent_id: &str) {
        self.with_totals(agent_id, |t| t.forwarded += 1);
    }

    /// Record a handler error for `agent_id`.
    pub fn record_handler_error(&self, agent_id: &str) {
        self.with_totals(agent_id, |t| t.handler_errors += 1);
    }

    /// Snapshot of the totals for `agent_id` (zeroes when unseen).
    #[must_use]
    pub fn totals(&self, agent_id: &str) -> AgentTotals {
        let map = self.inner.lock().expect("counter lock poisoned");
        map.get(agent_id).cloned().unwrap_or_default()
    }

    /// Snapshot of every agent's totals, in agent-id order.
    #[must_use]
    pub fn all_totals(&self) -> BTreeMap<String, AgentTotals> {
        let map = self.inner.lock().expect("counter lock poisoned");
        map.clone()
    }

    fn with_totals(&self, agent_id: &str, update: impl FnOnce(&mut AgentTotals)) {
        let mut map = self.inner.lock().expect("counter lock poisoned");
        update(map.entry(agent_id.to_string()).or_default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_agent() {
        let counters = ValidationCounters::new();
        counters.record_validated("a");
        counters.record_validated("a");
        counters.record_rejected("a");
        counters.record_forwarded("b");

        assert_eq!(counters.totals("a").validated, 2);
        assert_eq!(counters.totals("a").rejected, 1);
        assert_eq!(counters.totals("b").forwarded, 1);
        assert_eq!(counters.totals("unseen"), AgentTotals::default());
    }

    #[test]
    fn clones_share_state() {
        let counters = ValidationCounters::new();
        let clone = counters.clone();
        clone.record_handler_error("a");
        assert_eq!(counters.totals("a").handler_errors, 1);
    }

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
