//! Per-source rule sets — immutable configuration consumed by the pipeline.
//!
//! A `RuleSet` is built and validated once at load time, then shared via
//! `Arc` across every transform. All patterns are compiled here; the
//! transformer never compiles or fails on a pattern at runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use rust_decimal::Decimal;

use crate::error::ConfigError;

/// Default queue close interval: 45 minutes.
pub const DEFAULT_CLOSE_INTERVAL: Duration = Duration::from_secs(2700);

/// A price adjustment rule. Rules are tried in order; first match wins and
/// only the first occurrence in a message is adjusted.
#[derive(Debug, Clone)]
pub struct PriceRule {
    /// Pattern with exactly one numeric capture group.
    pub pattern: Regex,
    /// Added to the extracted value when no progressive tier qualifies.
    pub base_value: Decimal,
    /// Appended to the adjusted value in the replacement text.
    pub currency_suffix: String,
}

/// A value-range tier: the highest tier whose `limit <= value` supplies the
/// increment added instead of the rule's base value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressiveTier {
    pub limit: Decimal,
    pub increment: Decimal,
}

/// Which text classes the clean stage removes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanFlags {
    pub remove_links: bool,
    pub remove_users: bool,
    pub remove_emails: bool,
    pub remove_hashtags: bool,
}

impl CleanFlags {
    /// Remove everything — the common production setting.
    pub fn all() -> Self {
        Self {
            remove_links: true,
            remove_users: true,
            remove_emails: true,
            remove_hashtags: true,
        }
    }
}

/// A keyword → tag mapping entry for one language.
#[derive(Debug, Clone)]
pub struct TagRule {
    /// Case-insensitive keyword matcher.
    pub keyword: Regex,
    /// Tag emitted when the keyword appears in the cleaned text.
    pub tag: String,
}

/// Immutable per-source configuration: filters, cleaning, price rules,
/// tag rules, and batching interval.
#[derive(Debug, Clone)]
pub struct RuleSet {
    /// Stable identifier; part of the queue key.
    pub id: String,
    /// Empty means allow-all.
    pub allowed_patterns: Vec<Regex>,
    pub disallowed_patterns: Vec<Regex>,
    /// Per-source regexes scrubbed from the text during cleaning.
    pub remove_keywords: Vec<Regex>,
    pub clean_flags: CleanFlags,
    pub price_rules: Vec<PriceRule>,
    /// Strictly ascending by limit.
    pub progressive_tiers: Vec<ProgressiveTier>,
    /// Language code → ordered keyword rules.
    pub tag_rules: HashMap<String, Vec<TagRule>>,
    /// Appended to every message's tags, in order.
    pub static_tags: Vec<String>,
    /// Appended as the terminal tag when set.
    pub brand_id: Option<String>,
    /// How long a queue stays open after its first message.
    pub close_interval: Duration,
    /// Allow messages with media but no text through the filter.
    pub media_without_message: bool,
}

impl RuleSet {
    /// An empty, allow-all rule set. Useful as a base for tests and as the
    /// target of the loader's `add_*` calls.
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            allowed_patterns: Vec::new(),
            disallowed_patterns: Vec::new(),
            remove_keywords: Vec::new(),
            clean_flags: CleanFlags::default(),
            price_rules: Vec::new(),
            progressive_tiers: Vec::new(),
            tag_rules: HashMap::new(),
            static_tags: Vec::new(),
            brand_id: None,
            close_interval: DEFAULT_CLOSE_INTERVAL,
            media_without_message: false,
        }
    }

    /// Compile and add an allowed pattern (case-insensitive).
    pub fn add_allowed(&mut self, pattern: &str) -> Result<(), ConfigError> {
        self.allowed_patterns.push(self.compile(pattern)?);
        Ok(())
    }

    /// Compile and add a disallowed pattern (case-insensitive).
    pub fn add_disallowed(&mut self, pattern: &str) -> Result<(), ConfigError> {
        self.disallowed_patterns.push(self.compile(pattern)?);
        Ok(())
    }

    /// Compile and add a remove-keyword pattern.
    pub fn add_remove_keyword(&mut self, pattern: &str) -> Result<(), ConfigError> {
        self.remove_keywords.push(self.compile(pattern)?);
        Ok(())
    }

    /// Compile and add a price rule. The pattern must contain a capture
    /// group for the numeric value.
    pub fn add_price_rule(
        &mut self,
        pattern: &str,
        base_value: Decimal,
        currency_suffix: &str,
    ) -> Result<(), ConfigError> {
        let regex = self.compile(pattern)?;
        if regex.captures_len() < 2 {
            return Err(ConfigError::MissingCaptureGroup {
                rule_set: self.id.clone(),
                pattern: pattern.to_string(),
            });
        }
        self.price_rules.push(PriceRule {
            pattern: regex,
            base_value,
            currency_suffix: currency_suffix.to_string(),
        });
        Ok(())
    }

    /// Compile and add a keyword → tag rule for a language.
    pub fn add_tag_rule(
        &mut self,
        language: &str,
        keyword: &str,
        tag: &str,
    ) -> Result<(), ConfigError> {
        let keyword = self.compile(keyword)?;
        self.tag_rules
            .entry(language.to_string())
            .or_default()
            .push(TagRule {
                keyword,
                tag: tag.to_string(),
            });
        Ok(())
    }

    /// Set the progressive tiers, validating strict ascent by limit.
    pub fn set_progressive_tiers(
        &mut self,
        tiers: Vec<ProgressiveTier>,
    ) -> Result<(), ConfigError> {
        for pair in tiers.windows(2) {
            if pair[1].limit <= pair[0].limit {
                return Err(ConfigError::UnsortedTiers {
                    rule_set: self.id.clone(),
                    limit: pair[1].limit.to_string(),
                });
            }
        }
        self.progressive_tiers = tiers;
        Ok(())
    }

    fn compile(&self, pattern: &str) -> Result<Regex, ConfigError> {
        Regex::new(&format!("(?i){pattern}")).map_err(|e| ConfigError::InvalidPattern {
            rule_set: self.id.clone(),
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
    }
}

/// A routing target for a source: destination feed plus the rule set that
/// governs the transformation and batching.
#[derive(Debug, Clone)]
pub struct Route {
    pub destination_id: String,
    pub rule_set: Arc<RuleSet>,
}

/// Supplies routing and rules for a source feed. Read-only to the core.
pub trait RuleProvider: Send + Sync {
    /// All (destination, rule set) routes for a source. Empty means the
    /// source is not configured and its messages are ignored.
    fn routes_for(&self, source_id: &str) -> Vec<Route>;
}

/// Fixed routing table built from configuration at startup.
#[derive(Debug)]
pub struct StaticRuleProvider {
    routes: HashMap<String, Vec<Route>>,
}

impl StaticRuleProvider {
    pub fn new(routes: HashMap<String, Vec<Route>>) -> Self {
        Self { routes }
    }

    /// A provider with a single source → destination route, for tests.
    pub fn single(source_id: &str, destination_id: &str, rule_set: Arc<RuleSet>) -> Self {
        let mut routes = HashMap::new();
        routes.insert(
            source_id.to_string(),
            vec![Route {
                destination_id: destination_id.to_string(),
                rule_set,
            }],
        );
        Self { routes }
    }
}

impl RuleProvider for StaticRuleProvider {
    fn routes_for(&self, source_id: &str) -> Vec<Route> {
        self.routes.get(source_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn empty_rule_set_is_allow_all() {
        let rules = RuleSet::empty("rs-1");
        assert!(rules.allowed_patterns.is_empty());
        assert_eq!(rules.close_interval, Duration::from_secs(2700));
    }

    #[test]
    fn patterns_are_case_insensitive() {
        let mut rules = RuleSet::empty("rs-1");
        rules.add_allowed("дроп").unwrap();
        assert!(rules.allowed_patterns[0].is_match("ДРОП нова колекція"));
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let mut rules = RuleSet::empty("rs-1");
        let err = rules.add_allowed("(unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn price_rule_requires_capture_group() {
        let mut rules = RuleSet::empty("rs-1");
        let err = rules
            .add_price_rule(r"\d+ грн", dec!(100), " грн")
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingCaptureGroup { .. }));

        rules
            .add_price_rule(r"(\d+) грн", dec!(100), " грн")
            .unwrap();
        assert_eq!(rules.price_rules.len(), 1);
    }

    #[test]
    fn tiers_must_strictly_ascend() {
        let mut rules = RuleSet::empty("rs-1");
        let err = rules
            .set_progressive_tiers(vec![
                ProgressiveTier { limit: dec!(500), increment: dec!(50) },
                ProgressiveTier { limit: dec!(500), increment: dec!(100) },
            ])
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnsortedTiers { .. }));

        rules
            .set_progressive_tiers(vec![
                ProgressiveTier { limit: dec!(500), increment: dec!(50) },
                ProgressiveTier { limit: dec!(1000), increment: dec!(100) },
            ])
            .unwrap();
        assert_eq!(rules.progressive_tiers.len(), 2);
    }

    #[test]
    fn static_provider_routes() {
        let rules = Arc::new(RuleSet::empty("rs-1"));
        let provider = StaticRuleProvider::single("src-a", "dst-1", rules);
        assert_eq!(provider.routes_for("src-a").len(), 1);
        assert!(provider.routes_for("src-unknown").is_empty());
    }
}
