//! Concrete client types, along with the fallback identifiers

use serde::{Deserialize, Serialize};

/// Identifies which fallback completion service is in use. The `to_string`
/// and `FromStr` forms appear in the configuration file and the logs.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    Deserialize,
    Serialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub(crate) enum FallbackIdentifier {
    #[default]
    Pollinations,
    Disabled,
}

pub(crate) use super::fallback::Unavailable;
pub(crate) use super::ollama::OllamaClient;
pub(crate) use super::pollinations::Pollinations;
