use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::registry::{AliasTable, ModelProfile, ProfileTable, SuspicionPolicy};

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub(crate) struct Server {
    pub listen: String,
}

impl Default for Server {
    fn default() -> Self {
        Server {
            listen: "0.0.0.0:5000".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub(crate) struct Timeouts {
    pub generate_secs: u64,
    pub tags_secs: u64,
    pub fallback_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            generate_secs: 120,
            tags_secs: 15,
            fallback_secs: 45,
        }
    }
}

impl Timeouts {
    pub(crate) fn generate(&self) -> Duration {
        Duration::from_secs(self.generate_secs)
    }

    pub(crate) fn tags(&self) -> Duration {
        Duration::from_secs(self.tags_secs)
    }

    pub(crate) fn fallback(&self) -> Duration {
        Duration::from_secs(self.fallback_secs)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub(crate) struct Suspicion {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for Suspicion {
    fn default() -> Self {
        Suspicion {
            failure_threshold: 3,
            cooldown_secs: 300,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub(crate) struct Profile {
    /// Empty for the default profile.
    #[serde(default)]
    pub prefix: String,
    pub size_billion_params: f64,
    pub vram_per_instance_gb: f64,
    pub default_max_clients: u32,
}

impl Profile {
    fn new(prefix: &str, size_billion_params: f64, vram_per_instance_gb: f64, clients: u32) -> Self {
        Profile {
            prefix: prefix.to_string(),
            size_billion_params,
            vram_per_instance_gb,
            default_max_clients: clients,
        }
    }

    fn model_profile(&self) -> ModelProfile {
        ModelProfile {
            size_billion_params: self.size_billion_params,
            vram_per_instance_gb: self.vram_per_instance_gb,
            default_max_clients: self.default_max_clients,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub(crate) struct Fallback {
    pub enabled: bool,
    pub url: String,
    pub default_model: String,
    /// Name of the environment variable holding the API key. The key itself
    /// never appears in the file.
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for Fallback {
    fn default() -> Self {
        Fallback {
            enabled: true,
            url: "https://api.pollinations.ai/v1/text/completions".to_string(),
            default_model: "text-davinci-003".to_string(),
            api_key_env: "POLLINATIONS_API_KEY".to_string(),
            max_tokens: 1500,
            temperature: 0.7,
        }
    }
}

impl Fallback {
    pub(crate) fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

/// A hundred years. Anything longer is a typo, not a cooldown.
const MAX_COOLDOWN_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn builtin_profiles() -> Vec<Profile> {
    vec![
        Profile::new("Andy-4-micro", 1.5, 2.0, 4),
        Profile::new("Andy-4-tiny", 0.5, 1.0, 6),
        Profile::new("Andy-4", 8.0, 6.0, 2),
    ]
}

fn builtin_default_profile() -> Profile {
    Profile::new("", 7.0, 6.0, 1)
}

fn builtin_aliases() -> HashMap<String, Vec<String>> {
    let alias = |names: &[&str]| -> Vec<String> { names.iter().map(|n| n.to_string()).collect() };

    HashMap::from([
        (
            "micro".to_string(),
            alias(&["Andy-4-micro-0516", "Andy-4-micro"]),
        ),
        ("tiny".to_string(), alias(&["Andy-4-tiny"])),
        ("andy-4".to_string(), alias(&["Andy-4-0516", "Andy-4"])),
    ])
}

/// Broker configuration. Every section is optional; the profile table and
/// the alias table each replace their built-in counterpart when present.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub(crate) struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub suspicion: Suspicion,
    #[serde(default = "builtin_profiles")]
    pub profiles: Vec<Profile>,
    #[serde(default = "builtin_default_profile")]
    pub default_profile: Profile,
    #[serde(default = "builtin_aliases")]
    pub aliases: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub fallback: Fallback,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: Server::default(),
            timeouts: Timeouts::default(),
            suspicion: Suspicion::default(),
            profiles: builtin_profiles(),
            default_profile: builtin_default_profile(),
            aliases: builtin_aliases(),
            fallback: Fallback::default(),
        }
    }
}

impl Config {
    pub(crate) fn profile_table(&self) -> ProfileTable {
        ProfileTable::new(
            self.profiles
                .iter()
                .map(|p| (p.prefix.clone(), p.model_profile())),
            self.default_profile.model_profile(),
        )
    }

    pub(crate) fn alias_table(&self) -> AliasTable {
        AliasTable::new(self.aliases.clone())
    }

    pub(crate) fn suspicion_policy(&self) -> SuspicionPolicy {
        SuspicionPolicy {
            failure_threshold: self.suspicion.failure_threshold,
            cooldown: chrono::Duration::seconds(
                self.suspicion.cooldown_secs.min(MAX_COOLDOWN_SECS) as i64,
            ),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        let default = std::iter::once(&self.default_profile);

        for profile in self.profiles.iter().chain(default) {
            let name = if profile.prefix.is_empty() {
                "default_profile"
            } else {
                profile.prefix.as_str()
            };

            if !(profile.vram_per_instance_gb > 0.0) {
                return Err(Error::Invalid(format!(
                    "profile \"{}\" needs a positive vram_per_instance_gb",
                    name
                )));
            }

            if profile.default_max_clients < 1 {
                return Err(Error::Invalid(format!(
                    "profile \"{}\" needs default_max_clients of at least 1",
                    name
                )));
            }
        }

        if let Some(profile) = self.profiles.iter().find(|p| p.prefix.is_empty()) {
            return Err(Error::Invalid(format!(
                "profile with {} GB per instance has an empty prefix, use [default_profile]",
                profile.vram_per_instance_gb
            )));
        }

        if let Some((alias, _)) = self.aliases.iter().find(|(_, names)| names.is_empty()) {
            return Err(Error::Invalid(format!(
                "alias \"{}\" has no preferred models",
                alias
            )));
        }

        if self.suspicion.failure_threshold < 1 {
            return Err(Error::Invalid(
                "suspicion.failure_threshold must be at least 1".to_string(),
            ));
        }

        if self.suspicion.cooldown_secs > MAX_COOLDOWN_SECS {
            return Err(Error::Invalid(format!(
                "suspicion.cooldown_secs must not exceed {}",
                MAX_COOLDOWN_SECS
            )));
        }

        let timeouts = [
            ("generate_secs", self.timeouts.generate_secs),
            ("tags_secs", self.timeouts.tags_secs),
            ("fallback_secs", self.timeouts.fallback_secs),
        ];

        if let Some((key, _)) = timeouts.iter().find(|(_, secs)| *secs < 1) {
            return Err(Error::Invalid(format!(
                "timeouts.{} must be at least 1",
                key
            )));
        }

        Ok(())
    }
}

fn get_config_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME");

    if let Some(home) = home {
        let home = PathBuf::from(home);

        const USER_PATHS: [&str; 2] = [".config/andy-broker/config.toml", ".andy-broker.toml"];

        for &path in USER_PATHS.iter() {
            let fullpath = home.join(path);

            if fullpath.exists() {
                return Some(fullpath);
            }
        }
    }

    let system_config = PathBuf::from("/etc/andy-broker.toml");

    if system_config.exists() {
        Some(system_config)
    } else {
        None
    }
}

fn extraneous_keys_helper<'a>(
    path: &mut Vec<&'a String>,
    user_config: &'a toml::Table,
    config: &'a toml::Table,
    found: &mut Vec<String>,
) {
    for (user_key, user_value) in user_config {
        path.push(user_key);

        match (user_value, config.get(user_key)) {
            (toml::Value::Table(user_value), Some(toml::Value::Table(config_value))) => {
                extraneous_keys_helper(path, user_value, config_value, found)
            }
            (_, Some(_)) => {}
            (_, None) => {
                let path: Vec<&str> = path.iter().map(|&s| s.as_str()).collect();

                found.push(path.join("."));
            }
        }

        path.pop();
    }
}

/// Returns the dotted paths of keys in the user's file that the parsed
/// configuration does not know about.
fn extraneous_keys(config: &Config, raw_config: &str) -> Result<Vec<String>, Error> {
    let user_config: toml::Table = toml::de::from_str(raw_config)?;

    let known: toml::Table = {
        let reserialized = toml::ser::to_string(config)
            .map_err(|err| Error::Invalid(format!("failed to reserialize config: {}", err)))?;

        toml::de::from_str(&reserialized)?
    };

    let mut path = Vec::new();
    let mut found = Vec::new();

    extraneous_keys_helper(&mut path, &user_config, &known, &mut found);

    Ok(found)
}

fn parse_config(raw_config: &str) -> Result<Config, Error> {
    let config: Config = toml::de::from_str(raw_config)?;

    for key in extraneous_keys(&config, raw_config)? {
        warn!(key, "config contains extraneous key, ignoring");
    }

    config.validate()?;

    Ok(config)
}

fn read_config_at(path: &Path) -> Result<Config, Error> {
    let raw_config = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;

    parse_config(&raw_config)
}

/// Reads the configuration from `config`, or from the first file found in
/// the usual locations. Built-in defaults apply when there is no file.
pub(crate) fn read_config(config: Option<PathBuf>) -> Result<Config, Error> {
    match config.or_else(get_config_path) {
        Some(path) => read_config_at(&path),
        None => Ok(Config::default()),
    }
}
