//! Configuration: runtime knobs from the environment, routing and rules
//! from a JSON config file, tag vocabularies from an optional second file.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::dispatcher::{DEFAULT_MAX_DISPATCH_ATTEMPTS, DEFAULT_PACING_SECS};
use crate::engine::DEFAULT_ALBUM_GRACE;
use crate::error::ConfigError;
use crate::rules::{ProgressiveTier, Route, RuleSet, StaticRuleProvider, DEFAULT_CLOSE_INTERVAL};
use crate::scheduler::{CLOSE_SWEEP_INTERVAL, DEFAULT_RETENTION, DISPATCH_SWEEP_INTERVAL};

/// Engine runtime settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub album_grace: Duration,
    pub close_sweep_interval: Duration,
    pub dispatch_sweep_interval: Duration,
    pub retention: Duration,
    pub max_dispatch_attempts: u32,
    /// Seconds between consecutive sends within one queue.
    pub pacing_secs: RangeInclusive<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/feed-relay.db"),
            album_grace: DEFAULT_ALBUM_GRACE,
            close_sweep_interval: CLOSE_SWEEP_INTERVAL,
            dispatch_sweep_interval: DISPATCH_SWEEP_INTERVAL,
            retention: DEFAULT_RETENTION,
            max_dispatch_attempts: DEFAULT_MAX_DISPATCH_ATTEMPTS,
            pacing_secs: DEFAULT_PACING_SECS,
        }
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied. A malformed override
    /// fails the load rather than being silently ignored.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("FEED_RELAY_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(secs) = env_u64("FEED_RELAY_CLOSE_SWEEP_SECS")? {
            config.close_sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("FEED_RELAY_DISPATCH_SWEEP_SECS")? {
            config.dispatch_sweep_interval = Duration::from_secs(secs);
        }
        if let Some(hours) = env_u64("FEED_RELAY_RETENTION_HOURS")? {
            config.retention = Duration::from_secs(hours * 3600);
        }
        Ok(config)
    }
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_u64(key, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected an integer, got {raw:?}"),
    })
}

// ── Rule file format ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ConfigFile {
    sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize)]
struct SourceConfig {
    source_id: String,
    destinations: Vec<String>,
    /// Defaults to `source_id` when omitted.
    #[serde(default)]
    rule_set_id: Option<String>,
    #[serde(default)]
    rules: RuleConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RuleConfig {
    allowed: Vec<String>,
    disallowed: Vec<String>,
    remove_keywords: Vec<String>,
    remove_links: Option<bool>,
    remove_users: Option<bool>,
    remove_emails: Option<bool>,
    remove_hashtags: Option<bool>,
    price_rules: Vec<PriceRuleConfig>,
    progressive_tiers: Vec<TierConfig>,
    static_tags: Vec<String>,
    brand_id: Option<String>,
    close_interval_secs: Option<u64>,
    media_without_message: bool,
}

#[derive(Debug, Deserialize)]
struct PriceRuleConfig {
    pattern: String,
    base_value: Decimal,
    currency_suffix: String,
}

#[derive(Debug, Deserialize)]
struct TierConfig {
    limit: Decimal,
    increment: Decimal,
}

/// Tag vocabulary file: language code → ordered keyword/tag entries.
#[derive(Debug, Deserialize)]
struct TagFile {
    languages: HashMap<String, Vec<TagEntry>>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    keyword: String,
    tag: String,
}

/// Load routing and rules from the JSON config file, with an optional tag
/// vocabulary file applied to every rule set. All patterns compile here;
/// a bad pattern fails the whole load.
pub fn load_rule_provider(
    config_path: &Path,
    tags_path: Option<&Path>,
) -> Result<StaticRuleProvider, ConfigError> {
    let file: ConfigFile = read_json(config_path)?;
    let tags: Option<TagFile> = tags_path.map(read_json).transpose()?;

    let mut routes: HashMap<String, Vec<Route>> = HashMap::new();
    for source in file.sources {
        let rule_set_id = source
            .rule_set_id
            .clone()
            .unwrap_or_else(|| source.source_id.clone());
        let rule_set = Arc::new(build_rule_set(&rule_set_id, source.rules, tags.as_ref())?);

        let source_routes = routes.entry(source.source_id).or_default();
        for destination_id in source.destinations {
            source_routes.push(Route {
                destination_id,
                rule_set: rule_set.clone(),
            });
        }
    }
    Ok(StaticRuleProvider::new(routes))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn build_rule_set(
    id: &str,
    config: RuleConfig,
    tags: Option<&TagFile>,
) -> Result<RuleSet, ConfigError> {
    let mut rules = RuleSet::empty(id);

    for pattern in &config.allowed {
        rules.add_allowed(pattern)?;
    }
    for pattern in &config.disallowed {
        rules.add_disallowed(pattern)?;
    }
    for pattern in &config.remove_keywords {
        rules.add_remove_keyword(pattern)?;
    }

    // Cleaning defaults to scrubbing everything; flags only opt out.
    rules.clean_flags.remove_links = config.remove_links.unwrap_or(true);
    rules.clean_flags.remove_users = config.remove_users.unwrap_or(true);
    rules.clean_flags.remove_emails = config.remove_emails.unwrap_or(true);
    rules.clean_flags.remove_hashtags = config.remove_hashtags.unwrap_or(true);

    for price in &config.price_rules {
        rules.add_price_rule(&price.pattern, price.base_value, &price.currency_suffix)?;
    }
    rules.set_progressive_tiers(
        config
            .progressive_tiers
            .iter()
            .map(|t| ProgressiveTier {
                limit: t.limit,
                increment: t.increment,
            })
            .collect(),
    )?;

    if let Some(tags) = tags {
        for (language, entries) in &tags.languages {
            for entry in entries {
                rules.add_tag_rule(language, &entry.keyword, &entry.tag)?;
            }
        }
    }

    rules.static_tags = config.static_tags;
    rules.brand_id = config.brand_id;
    rules.close_interval = config
        .close_interval_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_CLOSE_INTERVAL);
    rules.media_without_message = config.media_without_message;
    Ok(rules)
}
