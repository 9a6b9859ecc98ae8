//! Model profiles describe how much of a node a single running instance of a
//! model family consumes. A profile is selected by matching the beginning of a
//! model's display name against a configured prefix; the longest matching
//! prefix wins, so "Andy-4-micro-0516" resolves to the "Andy-4-micro" profile
//! rather than the broader "Andy-4" one.
//!
//! The capacity of a node (how many requests it may serve concurrently) is
//! derived from the most demanding profile among the models it offers.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub(crate) struct ModelProfile {
    /// Advisory parameter count, in billions.
    pub size_billion_params: f64,
    /// VRAM required to keep one instance of the model loaded.
    pub vram_per_instance_gb: f64,
    /// Capacity assumed when the node does not report its VRAM.
    pub default_max_clients: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct ProfileTable {
    // Sorted by descending prefix length
    entries: Vec<(String, ModelProfile)>,
    default: ModelProfile,
}

impl ProfileTable {
    pub(crate) fn new<I>(entries: I, default: ModelProfile) -> ProfileTable
    where
        I: IntoIterator<Item = (String, ModelProfile)>,
    {
        let mut entries: Vec<(String, ModelProfile)> = entries.into_iter().collect();

        // The sort is stable, prefixes of equal length keep their configured order.
        entries.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));

        ProfileTable { entries, default }
    }

    /// Returns the most specific profile for a display name, or the default
    /// profile if no prefix applies.
    pub(crate) fn resolve(&self, display_name: &str) -> &ModelProfile {
        self.entries
            .iter()
            .find(|(prefix, _)| display_name.starts_with(prefix.as_str()))
            .map(|(_, profile)| profile)
            .unwrap_or(&self.default)
    }

    /// Returns the profile with the largest per-instance VRAM requirement
    /// among the given display names. Ties keep the first one seen.
    pub(crate) fn dominant<'n, I>(&self, display_names: I) -> &ModelProfile
    where
        I: IntoIterator<Item = &'n str>,
    {
        let mut dominant: Option<&ModelProfile> = None;

        for name in display_names {
            let profile = self.resolve(name);

            match dominant {
                Some(current) if current.vram_per_instance_gb >= profile.vram_per_instance_gb => {}
                _ => dominant = Some(profile),
            }
        }

        dominant.unwrap_or(&self.default)
    }

    #[cfg(test)]
    pub(crate) fn prefixes(&self) -> Vec<&str> {
        self.entries.iter().map(|(p, _)| p.as_str()).collect()
    }
}

/// Computes how many concurrent requests a node may be assigned.
///
/// The VRAM-derived capacity is `floor(vram_gb / vram_per_instance_gb)` when
/// the node reports a positive amount of VRAM, and the profile's default
/// otherwise. A capacity requested by the node can only lower that figure.
/// The result is never below one.
pub(crate) fn max_clients(
    dominant: &ModelProfile,
    requested: Option<u32>,
    vram_gb: Option<f64>,
) -> u32 {
    let derived = match vram_gb {
        Some(vram) if vram > 0.0 && dominant.vram_per_instance_gb > 0.0 => {
            ((vram / dominant.vram_per_instance_gb).floor() as u32).max(1)
        }
        _ => dominant.default_max_clients.max(1),
    };

    match requested {
        Some(requested) if requested > 0 => requested.min(derived).max(1),
        _ => derived,
    }
}
