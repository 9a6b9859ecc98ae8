use super::profile::{self, ProfileTable};
use super::provider::{Health, ModelOffering, Provider, SuspicionPolicy};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub(crate) enum Error {
    /// A model was offered without a release date
    #[error("model \"{0}\" does not carry a release date")]
    MissingReleaseDate(String),
    /// A release date that is neither RFC 3339 nor YYYY-MM-DD
    #[error("model \"{model}\" has an unparseable release date \"{value}\"")]
    InvalidReleaseDate { model: String, value: String },
    /// No node is registered under the address
    #[error("provider \"{0}\" is not registered")]
    ProviderNotFound(String),
    /// Throughput must be a finite, non-negative number
    #[error("invalid tokens per second value {0}")]
    InvalidStats(f64),
}

/// A model as advertised by a joining node.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) struct OfferedModel {
    #[serde(alias = "display_name")]
    pub name: String,
    pub backend_id: String,
    pub quantization: String,
    pub context_length: u64,
    pub release_date: Option<String>,
}

/// A node announcing itself to the pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) struct Registration {
    #[serde(alias = "ollama_base_url")]
    pub address: String,
    pub models: Vec<OfferedModel>,
    pub max_clients: Option<u32>,
    pub avg_tokens_per_second: Option<f64>,
    pub vram_gb: Option<f64>,
    pub gpu_info: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Registered {
    pub max_clients: u32,
    /// True when an existing node was updated in place.
    pub replaced: bool,
}

/// The outcome of asking a node to take one more request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Admission {
    /// The node's load was incremented; the caller must report the outcome.
    Admitted(ModelOffering),
    AtCapacity,
    NoMatchingModel,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Reconciled {
    pub kept: usize,
    /// Backend ids that the node no longer serves.
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) struct ProviderSummary {
    pub address: String,
    pub models: Vec<ModelOffering>,
    pub max_clients: u32,
    pub current_load: u32,
    pub avg_tokens_per_second: f64,
    pub health: Health,
    pub failure_count: u32,
    #[serde(default)]
    pub last_failure_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub vram_gb: Option<f64>,
    #[serde(default)]
    pub gpu_info: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) struct ModelSummary {
    pub name: String,
    pub quantization: String,
    pub context_length: u64,
    pub release_date: DateTime<Utc>,
    pub providers: Vec<String>,
}

#[derive(Default)]
struct State {
    providers: HashMap<String, Provider>,
    next_seq: u64,
}

/// The process-wide set of compute nodes.
///
/// One instance is created at startup and shared by every entry point. All
/// state lives behind a single mutex that is never held across an `.await`,
/// so each admission check and its load increment happen atomically.
pub(crate) struct Registry {
    state: Mutex<State>,
    profiles: ProfileTable,
    policy: SuspicionPolicy,
}

fn parse_release_date(model: &str, value: Option<&str>) -> Result<DateTime<Utc>, Error> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::MissingReleaseDate(model.to_string()))?;

    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .ok_or_else(|| Error::InvalidReleaseDate {
            model: model.to_string(),
            value: value.to_string(),
        })
}

impl Registry {
    pub(crate) fn new(profiles: ProfileTable, policy: SuspicionPolicy) -> Registry {
        Registry {
            state: Mutex::new(State::default()),
            profiles,
            policy,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Every critical section leaves the map consistent, a panic inside
        // one does not invalidate it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a node or replaces an existing one in place. The whole
    /// registration is rejected if any model lacks a valid release date.
    pub(crate) fn register(&self, registration: Registration) -> Result<Registered, Error> {
        let mut models = Vec::with_capacity(registration.models.len());

        for offered in registration.models {
            let release_date =
                parse_release_date(&offered.name, offered.release_date.as_deref())?;

            models.push(ModelOffering {
                display_name: offered.name,
                backend_id: offered.backend_id,
                quantization: offered.quantization,
                context_length: offered.context_length,
                release_date,
            });
        }

        let dominant = self
            .profiles
            .dominant(models.iter().map(|m| m.display_name.as_str()));

        let max_clients =
            profile::max_clients(dominant, registration.max_clients, registration.vram_gb);

        let mut state = self.state();
        let State {
            providers,
            next_seq,
        } = &mut *state;

        let replaced = providers.contains_key(&registration.address);

        let provider = providers
            .entry(registration.address.clone())
            .or_insert_with(|| {
                let seq = *next_seq;
                *next_seq += 1;
                Provider::new(registration.address.clone(), seq)
            });

        provider.models = models;
        provider.max_clients = max_clients;
        if let Some(tps) = registration.avg_tokens_per_second {
            provider.avg_tokens_per_second = tps;
        }
        provider.vram_gb = registration.vram_gb;
        provider.gpu_info = registration.gpu_info;
        provider.clear_failures();
        provider.generation += 1;

        info!(
            address = %provider.address,
            models = provider.models.len(),
            max_clients,
            replaced,
            "provider registered"
        );

        Ok(Registered {
            max_clients,
            replaced,
        })
    }

    pub(crate) fn update_stats(&self, address: &str, avg_tokens_per_second: f64) -> Result<(), Error> {
        if !avg_tokens_per_second.is_finite() || avg_tokens_per_second < 0.0 {
            return Err(Error::InvalidStats(avg_tokens_per_second));
        }

        let mut state = self.state();

        let provider = state
            .providers
            .get_mut(address)
            .ok_or_else(|| Error::ProviderNotFound(address.to_string()))?;

        provider.avg_tokens_per_second = avg_tokens_per_second;

        debug!(address, avg_tokens_per_second, "provider stats updated");

        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.state().providers.len()
    }

    /// Addresses of the nodes currently eligible for routing, fastest first,
    /// then least loaded, then in registration order.
    pub(crate) fn ranked(&self, now: DateTime<Utc>) -> Vec<String> {
        let state = self.state();

        let mut eligible: Vec<&Provider> = state
            .providers
            .values()
            .filter(|p| p.is_eligible(now))
            .collect();

        eligible.sort_by(|a, b| {
            b.avg_tokens_per_second
                .partial_cmp(&a.avg_tokens_per_second)
                .unwrap_or(Ordering::Equal)
                .then(a.current_load.cmp(&b.current_load))
                .then(a.seq.cmp(&b.seq))
        });

        eligible.into_iter().map(|p| p.address.clone()).collect()
    }

    /// Checks capacity and model availability and, if both hold, takes a
    /// slot on the node in the same critical section.
    pub(crate) fn try_admit(&self, address: &str, target: &str) -> Admission {
        let mut state = self.state();

        let provider = match state.providers.get_mut(address) {
            Some(provider) => provider,
            None => return Admission::Unknown,
        };

        if !provider.has_capacity() {
            return Admission::AtCapacity;
        }

        let offering = match provider.find_offering(target) {
            Some(offering) => offering.clone(),
            None => return Admission::NoMatchingModel,
        };

        provider.current_load += 1;

        Admission::Admitted(offering)
    }

    pub(crate) fn record_success(&self, address: &str) {
        let mut state = self.state();

        if let Some(provider) = state.providers.get_mut(address) {
            provider.current_load = provider.current_load.saturating_sub(1);

            if provider.is_suspect || provider.suspect_until.is_some() {
                info!(address, "provider recovered");
            }

            provider.record_success();
        }
    }

    /// Releases the node's slot and counts the failure. Returns the node's
    /// registration generation when this failure made it suspect, in which
    /// case the caller should reconcile it.
    pub(crate) fn record_failure(&self, address: &str, now: DateTime<Utc>) -> Option<u64> {
        let mut state = self.state();

        let provider = state.providers.get_mut(address)?;

        provider.current_load = provider.current_load.saturating_sub(1);

        if provider.record_failure(now, &self.policy) {
            warn!(
                address,
                failures = provider.failure_count,
                suspect_until = ?provider.suspect_until,
                "provider marked suspect"
            );

            Some(provider.generation)
        } else {
            None
        }
    }

    /// Drops every offering whose backend id is not in `live`. Returns `None`
    /// if the node vanished or re-registered since `generation` was taken.
    pub(crate) fn prune_to_live(
        &self,
        address: &str,
        generation: u64,
        live: &HashSet<String>,
    ) -> Option<Reconciled> {
        let mut state = self.state();

        let provider = state.providers.get_mut(address)?;

        if provider.generation != generation {
            return None;
        }

        let (kept, dropped): (Vec<ModelOffering>, Vec<ModelOffering>) = provider
            .models
            .drain(..)
            .partition(|m| live.contains(&m.backend_id));

        provider.models = kept;

        if !provider.models.is_empty() {
            // The cooldown still applies, only the history is forgiven.
            provider.failure_count = 0;
            provider.is_suspect = false;
        }

        Some(Reconciled {
            kept: provider.models.len(),
            dropped: dropped.into_iter().map(|m| m.backend_id).collect(),
        })
    }

    #[cfg(test)]
    pub(crate) fn provider(&self, address: &str) -> Option<Provider> {
        self.state().providers.get(address).cloned()
    }

    fn ordered(state: &State) -> Vec<&Provider> {
        let mut providers: Vec<&Provider> = state.providers.values().collect();
        providers.sort_by_key(|p| p.seq);
        providers
    }

    pub(crate) fn providers(&self) -> Vec<ProviderSummary> {
        let now = Utc::now();
        let state = self.state();

        Self::ordered(&state)
            .into_iter()
            .map(|p| ProviderSummary {
                address: p.address.clone(),
                models: p.models.clone(),
                max_clients: p.max_clients,
                current_load: p.current_load,
                avg_tokens_per_second: p.avg_tokens_per_second,
                health: p.health(now),
                failure_count: p.failure_count,
                last_failure_time: p.last_failure_time,
                vram_gb: p.vram_gb,
                gpu_info: p.gpu_info.clone(),
            })
            .collect()
    }

    /// Distinct models across all nodes, grouped by name, quantization,
    /// context length and release date.
    pub(crate) fn models(&self) -> Vec<ModelSummary> {
        let state = self.state();
        let mut summaries: Vec<ModelSummary> = Vec::new();

        for provider in Self::ordered(&state) {
            for model in &provider.models {
                let existing = summaries.iter_mut().find(|s| {
                    s.name == model.display_name
                        && s.quantization == model.quantization
                        && s.context_length == model.context_length
                        && s.release_date == model.release_date
                });

                match existing {
                    Some(summary) => {
                        if !summary.providers.contains(&provider.address) {
                            summary.providers.push(provider.address.clone());
                        }
                    }
                    None => summaries.push(ModelSummary {
                        name: model.display_name.clone(),
                        quantization: model.quantization.clone(),
                        context_length: model.context_length,
                        release_date: model.release_date,
                        providers: vec![provider.address.clone()],
                    }),
                }
            }
        }

        summaries
    }

    #[cfg(test)]
    pub(crate) fn update<F: FnOnce(&mut Provider)>(&self, address: &str, f: F) {
        let mut state = self.state();
        f(state.providers.get_mut(address).expect("provider is registered"));
    }
}
