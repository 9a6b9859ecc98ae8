//! Per-node routing state.
//!
//! A node moves between three states:
//!
//! - healthy: routable, `is_suspect` clear and no cooldown pending
//! - cooling down: `suspect_until` lies in the future, the node is skipped
//! - suspect: `is_suspect` still set after the cooldown elapsed, either
//!   because reconciliation found no model the node still serves or because
//!   its tag listing failed; only a fresh registration brings it back
//!
//! Reaching the failure threshold sets both `is_suspect` and `suspect_until`.
//! A reconciliation that keeps at least one model clears `is_suspect` and the
//! failure count, leaving the node to sit out the rest of its cooldown.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub(crate) struct ModelOffering {
    /// Name used for alias matching, e.g. "Andy-4-micro-0516".
    pub display_name: String,
    /// Identifier the node's own API expects, passed through verbatim.
    pub backend_id: String,
    pub quantization: String,
    pub context_length: u64,
    pub release_date: DateTime<Utc>,
}

impl ModelOffering {
    /// A target matches a display name equal to it or starting with it, so
    /// "Andy-4-micro-0516" satisfies a request for "Andy-4-micro".
    pub(crate) fn matches(&self, target: &str) -> bool {
        self.display_name.starts_with(target)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SuspicionPolicy {
    /// Consecutive failures after which a node is marked suspect.
    pub failure_threshold: u32,
    /// How long a suspect node is excluded from routing.
    pub cooldown: Duration,
}

impl Default for SuspicionPolicy {
    fn default() -> Self {
        SuspicionPolicy {
            failure_threshold: 3,
            cooldown: Duration::minutes(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub(crate) enum Health {
    Healthy,
    CoolingDown,
    Suspect,
}

#[derive(Debug, Clone)]
pub(crate) struct Provider {
    /// host:port, the registry key.
    pub address: String,
    pub models: Vec<ModelOffering>,
    pub max_clients: u32,
    pub current_load: u32,
    pub avg_tokens_per_second: f64,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub is_suspect: bool,
    pub suspect_until: Option<DateTime<Utc>>,
    pub vram_gb: Option<f64>,
    pub gpu_info: Option<String>,
    /// Bumped on every registration; stale reconciliations compare against it.
    pub(crate) generation: u64,
    /// Registration order, the final ranking tie-breaker.
    pub(crate) seq: u64,
}

impl Provider {
    pub(crate) fn new(address: String, seq: u64) -> Provider {
        Provider {
            address,
            models: Vec::new(),
            max_clients: 1,
            current_load: 0,
            avg_tokens_per_second: 0.0,
            failure_count: 0,
            last_failure_time: None,
            is_suspect: false,
            suspect_until: None,
            vram_gb: None,
            gpu_info: None,
            generation: 0,
            seq,
        }
    }

    pub(crate) fn cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.suspect_until.map_or(false, |until| until > now)
    }

    /// Both flags gate eligibility: a cleared `is_suspect` does not shorten a
    /// pending cooldown.
    pub(crate) fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.is_suspect && !self.cooling_down(now)
    }

    pub(crate) fn health(&self, now: DateTime<Utc>) -> Health {
        if self.cooling_down(now) {
            Health::CoolingDown
        } else if self.is_suspect {
            Health::Suspect
        } else {
            Health::Healthy
        }
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.current_load < self.max_clients
    }

    /// First offering in registration order that satisfies the target.
    pub(crate) fn find_offering(&self, target: &str) -> Option<&ModelOffering> {
        self.models.iter().find(|m| m.matches(target))
    }

    pub(crate) fn clear_failures(&mut self) {
        self.failure_count = 0;
        self.last_failure_time = None;
        self.is_suspect = false;
        self.suspect_until = None;
    }

    pub(crate) fn record_success(&mut self) {
        self.failure_count = 0;
        self.is_suspect = false;
        self.suspect_until = None;
    }

    /// Records a failed generation. Returns true when this failure is the one
    /// that turned the node suspect.
    pub(crate) fn record_failure(&mut self, now: DateTime<Utc>, policy: &SuspicionPolicy) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);

        if self.failure_count >= policy.failure_threshold && !self.is_suspect {
            self.is_suspect = true;
            self.suspect_until = Some(
                now.checked_add_signed(policy.cooldown)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            );

            return true;
        }

        false
    }
}
