//! The registry tracks every compute node that has joined the pool: the
//! models it offers, how many requests it may serve at once, how fast it is,
//! and whether it is currently trusted.
//!
//! Nodes are keyed by their address (host:port). A node joins with a list of
//! model offerings; each offering has a human-facing display name, used for
//! matching aliases, and an opaque backend identifier which is passed to the
//! node's own API verbatim.
//!
//! ## Capacity
//!
//! A node's concurrency ceiling is derived from the static profile table. Each
//! display name resolves to the profile with the longest matching prefix, and
//! the profile with the largest per-instance VRAM requirement among a node's
//! models dominates. The reported VRAM divided by that requirement gives the
//! ceiling, which a node may lower but never raise.
//!
//! ## Suspicion
//!
//! Consecutive failures are counted per node. When the count reaches the
//! configured threshold the node is marked suspect and excluded for a
//! cooldown period, and the router reconciles its advertised models against
//! what the node actually reports as loaded.

pub(crate) mod alias;
pub(crate) mod profile;
pub(crate) mod provider;
pub(crate) mod registry;

pub(crate) use alias::AliasTable;
pub(crate) use profile::{ModelProfile, ProfileTable};
pub(crate) use provider::{Health, ModelOffering, SuspicionPolicy};
pub(crate) use registry::{
    Admission, Error, ModelSummary, OfferedModel, ProviderSummary, Reconciled, Registered,
    Registration, Registry,
};
