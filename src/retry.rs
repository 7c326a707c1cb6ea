//! Retry policies.
//!
//! Policies only decide *what* to try next and how long to wait; callers own
//! the actual waiting, which keeps the schedules testable without real time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Fixed delay between ledger creation attempts when the ledger service
    /// cannot host the requested ensemble.
    pub ensemble_backoff_ms: u64,
    /// Cap on ledger creation attempts. `None` retries indefinitely.
    pub ensemble_attempts: Option<u32>,
    /// Compare-and-swap attempts per member when publishing a ledger.
    pub cas_attempts: u32,
    /// Delay before re-campaigning after a failed election attempt.
    pub election_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            ensemble_backoff_ms: 1000,
            ensemble_attempts: None,
            cas_attempts: 3,
            election_backoff_ms: 1000,
        }
    }
}

impl RetryConfig {
    pub fn ensemble_backoff(&self) -> Duration {
        Duration::from_millis(self.ensemble_backoff_ms)
    }

    pub fn election_backoff(&self) -> Duration {
        Duration::from_millis(self.election_backoff_ms)
    }

    pub fn ensemble_policy(&self, cluster_size: usize) -> EnsemblePolicy {
        EnsemblePolicy {
            initial: cluster_size.max(1),
            backoff: self.ensemble_backoff(),
            max_attempts: self.ensemble_attempts,
        }
    }
}

/// Replication width of a new ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnsembleSpec {
    pub ensemble_size: usize,
    pub write_quorum: usize,
    pub ack_quorum: usize,
}

impl EnsembleSpec {
    /// Quorum is `n - 1` above two nodes, otherwise every node must ack.
    pub fn for_size(n: usize) -> Self {
        let m = if n > 2 { n - 1 } else { n };
        Self {
            ensemble_size: n,
            write_quorum: m,
            ack_quorum: m,
        }
    }
}

/// Ensemble degradation schedule for ledger creation.
///
/// Starts at the cluster size and shrinks by one after every rejected attempt,
/// never below two nodes (a cluster that starts at one or two keeps its size).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsemblePolicy {
    pub initial: usize,
    pub backoff: Duration,
    pub max_attempts: Option<u32>,
}

impl EnsemblePolicy {
    pub fn first(&self) -> EnsembleSpec {
        EnsembleSpec::for_size(self.initial)
    }

    /// Width to try after `current` was rejected.
    pub fn degrade(&self, current: usize) -> usize {
        if current > 2 {
            current - 1
        } else {
            current
        }
    }

    /// Whether another attempt may follow `attempts` failed ones.
    pub fn may_retry(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }

    /// The ensemble widths tried for up to `attempts` attempts.
    pub fn schedule(&self, attempts: usize) -> Vec<usize> {
        let mut sizes = Vec::with_capacity(attempts);
        let mut n = self.initial;
        for _ in 0..attempts {
            sizes.push(n);
            n = self.degrade(n);
        }
        sizes
    }
}
