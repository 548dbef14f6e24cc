//! TOML configuration parsing and validation.
//!
//! The extractor is driven entirely by a TOML file (see
//! `config/hubharvest.example.toml`). The private app token may be supplied
//! either in `[api]` or through the `HUBSPOT_PRIVATE_APP_TOKEN` environment
//! variable so credentials can stay out of checked-in files.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ExtractError;

pub const TOKEN_ENV_VAR: &str = "HUBSPOT_PRIVATE_APP_TOKEN";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    pub objects: ObjectsConfig,
    #[serde(default)]
    pub properties: PropertiesConfig,
    #[serde(default)]
    pub associations: Vec<AssociationConfig>,
    pub destination: DestinationConfig,
    pub state: StateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Private app token; falls back to `HUBSPOT_PRIVATE_APP_TOKEN`.
    #[serde(default)]
    pub private_app_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_base_url() -> String {
    "https://api.hubapi.com".to_string()
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    5
}

impl ApiConfig {
    pub fn resolve_token(&self) -> Result<String, ExtractError> {
        if let Some(token) = &self.private_app_token {
            if !token.is_empty() {
                return Ok(token.clone());
            }
        }
        std::env::var(TOKEN_ENV_VAR)
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ExtractError::Configuration(format!(
                    "missing credential: set api.private_app_token or the {} environment variable",
                    TOKEN_ENV_VAR
                ))
            })
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    FullFetch,
    IncrementalFetch,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_mode")]
    pub mode: FetchMode,
    /// Lower bound for modified-since filters: `YYYY-MM-DD`, `now`,
    /// `yesterday`, or `last run`.
    #[serde(default = "default_date_from")]
    pub date_from: String,
    /// Also list archived records for endpoints that support it.
    #[serde(default)]
    pub archived: bool,
    /// Abort the whole run on the first failed object type.
    #[serde(default)]
    pub fail_fast: bool,
}

fn default_fetch_mode() -> FetchMode {
    FetchMode::FullFetch
}
fn default_date_from() -> String {
    "yesterday".to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            mode: default_fetch_mode(),
            date_from: default_date_from(),
            archived: false,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObjectsConfig {
    /// Object types to extract, in run order.
    pub enabled: Vec<String>,
    /// Account-specific custom object type ids (e.g. `"2-12345678"`).
    /// These are registered at runtime and extracted after the built-ins.
    #[serde(default)]
    pub custom: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PropertyMode {
    All,
    Base,
    Custom,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PropertiesConfig {
    #[serde(default = "default_property_mode")]
    pub mode: PropertyMode,
    /// Also request per-property value history (doubles API cost, halves
    /// page size).
    #[serde(default)]
    pub fetch_property_history: bool,
    /// Explicit property lists per object type, used when `mode = "custom"`.
    #[serde(default)]
    pub custom_lists: BTreeMap<String, Vec<String>>,
    /// Property names to fetch history for, per object type.
    #[serde(default)]
    pub history_lists: BTreeMap<String, Vec<String>>,
}

fn default_property_mode() -> PropertyMode {
    PropertyMode::Base
}

impl Default for PropertiesConfig {
    fn default() -> Self {
        Self {
            mode: default_property_mode(),
            fetch_property_history: false,
            custom_lists: BTreeMap::new(),
            history_lists: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssociationConfig {
    pub from_object: String,
    pub to_object: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    FullLoad,
    IncrementalLoad,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DestinationConfig {
    /// Directory the CSV tables and their manifests are written to.
    pub out_dir: PathBuf,
    #[serde(default = "default_load_mode")]
    pub load_mode: LoadMode,
}

fn default_load_mode() -> LoadMode {
    LoadMode::IncrementalLoad
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    /// SQLite file holding checkpoints and table column state.
    pub path: PathBuf,
}

/// A parsed `date_from` bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFrom {
    /// Resolve against the object type's stored checkpoint at run time.
    LastRun,
    /// Fixed bound in epoch milliseconds.
    At(i64),
}

/// Parse a `date_from` value relative to `now`.
///
/// Accepts `YYYY-MM-DD` (UTC midnight), `now`, `yesterday`, and the
/// `last run` keyword in its historical spellings.
pub fn parse_date_bound(input: &str, now: DateTime<Utc>) -> Result<DateFrom, ExtractError> {
    let normalized = input.trim().to_lowercase();
    match normalized.as_str() {
        "last" | "lastrun" | "last run" => Ok(DateFrom::LastRun),
        "now" => Ok(DateFrom::At(now.timestamp_millis())),
        "yesterday" => Ok(DateFrom::At((now - Duration::days(1)).timestamp_millis())),
        _ => {
            let date = NaiveDate::parse_from_str(&normalized, "%Y-%m-%d").map_err(|_| {
                ExtractError::Configuration(format!(
                    "failed to parse date \"{}\": use YYYY-MM-DD, \"now\", \"yesterday\", or \"last run\"",
                    input
                ))
            })?;
            let ts = date
                .and_hms_opt(0, 0, 0)
                .expect("midnight is always valid")
                .and_utc()
                .timestamp_millis();
            Ok(DateFrom::At(ts))
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.api.timeout_secs == 0 {
        anyhow::bail!("api.timeout_secs must be > 0");
    }

    // Catch an unparseable date at startup rather than mid-run.
    parse_date_bound(&config.fetch.date_from, Utc::now())?;

    // Associations read the from-side ids out of the pages extracted during
    // this run, so the from object must itself be extracted.
    for assoc in &config.associations {
        let enabled = config
            .objects
            .enabled
            .iter()
            .chain(config.objects.custom.iter())
            .any(|o| o == &assoc.from_object);
        if !enabled {
            anyhow::bail!(
                "association {} -> {}: \"{}\" is not in objects.enabled, all objects for which \
                 associations are fetched must be extracted in the same run",
                assoc.from_object,
                assoc.to_object,
                assoc.from_object
            );
        }
    }

    Ok(())
}

impl Config {
    /// A minimal configuration for tests and embedding.
    pub fn minimal(out_dir: PathBuf, state_path: PathBuf) -> Self {
        Self {
            api: ApiConfig {
                base_url: default_base_url(),
                private_app_token: Some("test-token".to_string()),
                timeout_secs: default_timeout_secs(),
                max_retries: default_max_retries(),
            },
            fetch: FetchConfig::default(),
            objects: ObjectsConfig {
                enabled: Vec::new(),
                custom: Vec::new(),
            },
            properties: PropertiesConfig::default(),
            associations: Vec::new(),
            destination: DestinationConfig {
                out_dir,
                load_mode: default_load_mode(),
            },
            state: StateConfig { path: state_path },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[api]
private_app_token = "pat-na1-secret"
timeout_secs = 10

[fetch]
mode = "incremental_fetch"
date_from = "last run"
archived = true

[objects]
enabled = ["contact", "company"]
custom = ["2-12345678"]

[properties]
mode = "custom"
fetch_property_history = true

[properties.custom_lists]
contact = ["firstname", "lastname"]

[properties.history_lists]
contact = ["lifecyclestage"]

[[associations]]
from_object = "contact"
to_object = "company"

[destination]
out_dir = "./out"
load_mode = "incremental_load"

[state]
path = "./data/state.sqlite"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.fetch.mode, FetchMode::IncrementalFetch);
        assert!(config.fetch.archived);
        assert!(!config.fetch.fail_fast);
        assert_eq!(config.objects.enabled, vec!["contact", "company"]);
        assert_eq!(config.objects.custom, vec!["2-12345678"]);
        assert_eq!(config.properties.mode, PropertyMode::Custom);
        assert_eq!(
            config.properties.custom_lists["contact"],
            vec!["firstname", "lastname"]
        );
        assert_eq!(config.associations.len(), 1);
        assert_eq!(config.destination.load_mode, LoadMode::IncrementalLoad);
        validate(&config).unwrap();
    }

    #[test]
    fn defaults_apply() {
        let toml = r#"
[api]

[objects]
enabled = ["contact"]

[destination]
out_dir = "./out"

[state]
path = "./state.sqlite"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.api.base_url, "https://api.hubapi.com");
        assert_eq!(config.api.max_retries, 5);
        assert_eq!(config.fetch.mode, FetchMode::FullFetch);
        assert_eq!(config.fetch.date_from, "yesterday");
        assert_eq!(config.properties.mode, PropertyMode::Base);
    }

    #[test]
    fn association_from_object_must_be_enabled() {
        let toml = r#"
[api]

[objects]
enabled = ["company"]

[[associations]]
from_object = "contact"
to_object = "company"

[destination]
out_dir = "./out"

[state]
path = "./state.sqlite"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("contact"));
    }

    #[test]
    fn parse_date_bound_variants() {
        let now = fixed_now();
        assert_eq!(
            parse_date_bound("last run", now).unwrap(),
            DateFrom::LastRun
        );
        assert_eq!(parse_date_bound("Lastrun", now).unwrap(), DateFrom::LastRun);
        assert_eq!(
            parse_date_bound("now", now).unwrap(),
            DateFrom::At(now.timestamp_millis())
        );
        assert_eq!(
            parse_date_bound("yesterday", now).unwrap(),
            DateFrom::At((now - Duration::days(1)).timestamp_millis())
        );
        let DateFrom::At(ts) = parse_date_bound("2024-01-01", now).unwrap() else {
            panic!("expected fixed bound");
        };
        assert_eq!(ts, 1_704_067_200_000);
    }

    #[test]
    fn parse_date_bound_rejects_garbage() {
        let err = parse_date_bound("three sleeps ago", fixed_now()).unwrap_err();
        assert!(matches!(err, ExtractError::Configuration(_)));
    }

    #[test]
    fn inline_token_wins() {
        let api = ApiConfig {
            base_url: default_base_url(),
            private_app_token: Some("pat-na1-inline".to_string()),
            timeout_secs: 10,
            max_retries: 5,
        };
        assert_eq!(api.resolve_token().unwrap(), "pat-na1-inline");
    }
}
