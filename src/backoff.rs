//! Per-key exponential backoff
//!
//! Keys are opaque strings (content addresses, names). The governor does not
//! know why an attempt failed; it only decides whether another attempt is
//! allowed yet.
//!
//! Penalty after the n-th consecutive fresh failure:
//! `min(base * 2^(n-1), max)`. A failure reported while a penalty window is
//! still active is a duplicate and does not compound.

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::BackoffConfig;
use crate::store::{KvStore, KvStoreExt};

const BACKOFF_NAMESPACE: &str = "backoff";

/// Persisted penalty state of one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffEntry {
    pub key: String,
    pub attempts: u32,
    /// Milliseconds since the epoch
    pub next_allowed_at: i64,
}

pub struct BackoffGovernor {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: BackoffConfig,
    /// Keys with an attempt currently running; never persisted
    in_flight: DashSet<String>,
}

impl BackoffGovernor {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: BackoffConfig) -> Self {
        Self {
            store,
            clock,
            config,
            in_flight: DashSet::new(),
        }
    }

    /// True while an attempt is in flight or a penalty window is active
    pub fn should_skip(&self, key: &str) -> bool {
        self.in_flight.contains(key) || self.is_penalized(key)
    }

    /// True while a persisted penalty window is active
    pub fn is_penalized(&self, key: &str) -> bool {
        match self.entry(key) {
            Some(entry) => entry.next_allowed_at > self.clock.now_ms(),
            None => false,
        }
    }

    /// Record that an attempt for `key` started
    pub fn mark_pending(&self, key: &str) {
        self.in_flight.insert(key.to_string());
    }

    /// Check and mark pending in one step.
    ///
    /// Returns `false` if the attempt must be skipped. Two concurrent callers
    /// for the same key cannot both get `true`.
    pub fn try_begin(&self, key: &str) -> bool {
        if self.is_penalized(key) {
            return false;
        }
        self.in_flight.insert(key.to_string())
    }

    /// [`try_begin`](Self::try_begin) returning a guard that clears the
    /// in-flight mark if dropped unsettled
    pub fn begin(&self, key: &str) -> Option<Attempt<'_>> {
        self.try_begin(key).then(|| Attempt {
            governor: self,
            key: key.to_string(),
            settled: false,
        })
    }

    /// Clear the in-flight mark without judging the attempt (e.g. cancelled)
    pub fn release(&self, key: &str) {
        self.in_flight.remove(key);
    }

    pub fn report_success(&self, key: &str) {
        self.in_flight.remove(key);
        if let Err(e) = self.store.delete(BACKOFF_NAMESPACE, key) {
            warn!(key = %key, error = %e, "Failed to clear backoff entry");
        }
    }

    pub fn report_failure(&self, key: &str) {
        self.in_flight.remove(key);

        let now = self.clock.now_ms();
        let previous = self.entry(key);
        if let Some(entry) = &previous {
            if now < entry.next_allowed_at {
                debug!(key = %key, attempts = entry.attempts, "Duplicate failure inside penalty window");
                return;
            }
        }

        let attempts = previous.map(|e| e.attempts).unwrap_or(0).saturating_add(1);
        let delay = self.penalty_ms(attempts);
        let entry = BackoffEntry {
            key: key.to_string(),
            attempts,
            next_allowed_at: now + delay,
        };
        debug!(key = %key, attempts, delay_ms = delay, "Backing off");

        if let Err(e) = self.store.set_json(BACKOFF_NAMESPACE, key, &entry) {
            warn!(key = %key, error = %e, "Failed to persist backoff entry");
        }
    }

    /// Persisted entry for `key`, if any
    pub fn entry(&self, key: &str) -> Option<BackoffEntry> {
        match self.store.get_json(BACKOFF_NAMESPACE, key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "Unreadable backoff entry, treating as absent");
                None
            }
        }
    }

    fn penalty_ms(&self, attempts: u32) -> i64 {
        let exponent = attempts.saturating_sub(1).min(62);
        self.config
            .base_ms
            .saturating_mul(1i64 << exponent)
            .min(self.config.max_ms)
    }
}

/// One in-flight attempt. Dropping it without [`succeeded`](Self::succeeded)
/// or [`failed`](Self::failed) releases the key unjudged.
pub struct Attempt<'a> {
    governor: &'a BackoffGovernor,
    key: String,
    settled: bool,
}

impl Attempt<'_> {
    pub fn succeeded(mut self) {
        self.settled = true;
        self.governor.report_success(&self.key);
    }

    pub fn failed(mut self) {
        self.settled = true;
        self.governor.report_failure(&self.key);
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(key = %self.key, "Attempt dropped, releasing");
            self.governor.release(&self.key);
        }
    }
}
