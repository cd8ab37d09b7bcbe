//! Additive accounting of generation resources.
//!
//! A session records the units reported by each of its own model calls under
//! its agent's name. Delegation folds a nested session's counters into the
//! parent with [`merge`], which only ever adds: totals and per-agent entries
//! grow, nothing is replaced.

use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

/// Request/response/total units for one model call or an aggregate of calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCounts {
    pub request_units: u64,
    pub response_units: u64,
    pub total_units: u64,
}

impl UnitCounts {
    pub fn new(request_units: u64, response_units: u64, total_units: u64) -> Self {
        Self {
            request_units,
            response_units,
            total_units,
        }
    }

    /// Counts whose total is the sum of request and response units.
    pub fn from_parts(request_units: u64, response_units: u64) -> Self {
        Self::new(
            request_units,
            response_units,
            request_units.saturating_add(response_units),
        )
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl AddAssign for UnitCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.request_units = self.request_units.saturating_add(rhs.request_units);
        self.response_units = self.response_units.saturating_add(rhs.response_units);
        self.total_units = self.total_units.saturating_add(rhs.total_units);
    }
}

/// Usage of a session, including everything merged in from delegations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    #[serde(flatten)]
    pub totals: UnitCounts,
    /// Per-agent breakdown keyed by agent name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_agent: BTreeMap<String, UnitCounts>,
}

impl UsageCounters {
    pub fn request_units(&self) -> u64 {
        self.totals.request_units
    }

    pub fn response_units(&self) -> u64 {
        self.totals.response_units
    }

    pub fn total_units(&self) -> u64 {
        self.totals.total_units
    }

    /// Record units consumed directly by `agent`.
    pub fn record(&mut self, agent: &str, units: UnitCounts) {
        self.totals += units;
        *self.by_agent.entry(agent.to_string()).or_default() += units;
    }

    pub fn agent(&self, agent: &str) -> UnitCounts {
        self.by_agent.get(agent).copied().unwrap_or_default()
    }
}

/// Add `from` into `into`. Totals and each per-agent entry are summed.
///
/// There is no deduplication: merging the same counters twice counts them
/// twice. Callers merge each nested result exactly once.
pub fn merge(into: &mut UsageCounters, from: &UsageCounters) {
    into.totals += from.totals;
    for (agent, units) in &from.by_agent {
        *into.by_agent.entry(agent.clone()).or_default() += *units;
    }
}

/// Shared handle to a session's counters.
///
/// Tool handlers running concurrently inside one node (delegations in
/// particular) merge into the same accumulator, so access is serialized.
#[derive(Debug, Clone, Default)]
pub struct UsageAccumulator {
    inner: Arc<Mutex<UsageCounters>>,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, UsageCounters> {
        // Counter updates cannot leave the map half-written, so a poisoned
        // lock still holds consistent data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, agent: &str, units: UnitCounts) {
        self.lock().record(agent, units);
    }

    pub fn merge(&self, from: &UsageCounters) {
        merge(&mut self.lock(), from);
    }

    pub fn snapshot(&self) -> UsageCounters {
        self.lock().clone()
    }
}
