//! Stateless transformation pipeline: filter → clean → price-adjust → tag.
//!
//! `transform` consumes one raw message plus its rule set and produces zero
//! or one transformed message. A `None` is a normal filtered-out outcome,
//! not an error. All patterns arrive pre-compiled in the `RuleSet`, so no
//! stage can fail at runtime.
//!
//! Album folding (pipeline step 5) lives in [`crate::pipeline::album`]; the
//! engine merges album members into a single raw message before it reaches
//! this transformer.

use regex::Regex;
use rust_decimal::Decimal;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::pipeline::language::LanguageTable;
use crate::pipeline::types::{RawMessage, TransformedMessage};
use crate::rules::{ProgressiveTier, RuleSet};

/// Emoji ranges stripped before filter matching, as the upstream feeds
/// decorate keywords with pictographs.
const EMOJI_CLASS: &str = "[\u{1F1E6}-\u{1F1FF}\u{1F300}-\u{1F5FF}\u{1F600}-\u{1F64F}\u{1F680}-\u{1F6FF}\u{1F900}-\u{1F9FF}\u{1FA70}-\u{1FAFF}\u{2600}-\u{27BF}]+";

/// Message transformer. Construct once and share; holds only the compiled
/// cleaning patterns and the language table.
pub struct Transformer {
    language_table: LanguageTable,
    emoji: Regex,
    links: Regex,
    users: Regex,
    emails: Regex,
    hashtags: Regex,
    blank_runs: Regex,
}

impl Transformer {
    pub fn new(language_table: LanguageTable) -> Self {
        // Literal patterns, known-good; compiled exactly once.
        Self {
            language_table,
            emoji: Regex::new(EMOJI_CLASS).unwrap(),
            links: Regex::new(
                r"(?i)\bhttps?://\S+|\bwww\.\S+|\b[a-z0-9][a-z0-9.-]*\.(?:com|net|org|info|biz|shop|store|ua|ru|by|kz)(?:/\S*)?",
            )
            .unwrap(),
            // Mentions only at start-of-text or after whitespace, so email
            // local parts never match — keeps the cleaning patterns disjoint.
            users: Regex::new(r"(?:^|\s)@[A-Za-z0-9_]+").unwrap(),
            emails: Regex::new(r"[A-Za-z0-9_.+-]+@[A-Za-z0-9-]+\.[A-Za-z0-9-.]+").unwrap(),
            hashtags: Regex::new(r"(?:^|\s)[#＃]\w+").unwrap(),
            blank_runs: Regex::new(r"\n{3,}").unwrap(),
        }
    }

    /// Run the full pipeline. Returns `None` when the filter drops the
    /// message.
    pub fn transform(&self, raw: &RawMessage, rules: &RuleSet) -> Option<TransformedMessage> {
        if !self.passes_filter(raw, rules) {
            debug!(
                message_id = %raw.id,
                source_id = %raw.source_id,
                rule_set = %rules.id,
                "Message dropped by filter"
            );
            return None;
        }

        let cleaned = self.clean(&raw.text, rules);
        let priced = self.adjust_price(&cleaned, rules);
        let tags = self.generate_tags(&priced, rules);
        let text = render_with_tags(&priced, &tags);

        trace!(message_id = %raw.id, rule_set = %rules.id, tag_count = tags.len(), "Message transformed");

        Some(TransformedMessage {
            id: Uuid::new_v4(),
            text,
            media_refs: raw.media_refs.clone(),
            tags,
        })
    }

    // ── Filter ──────────────────────────────────────────────────────

    /// A message passes iff no disallowed pattern matches AND (allowed is
    /// empty OR at least one allowed pattern matches). A message with no
    /// text against a populated allowed list only survives via the
    /// bare-media policy.
    fn passes_filter(&self, raw: &RawMessage, rules: &RuleSet) -> bool {
        let text = self.strip_emoji(&raw.text);

        if rules.disallowed_patterns.iter().any(|p| p.is_match(&text)) {
            return false;
        }
        if rules.allowed_patterns.is_empty() {
            return true;
        }
        if rules.allowed_patterns.iter().any(|p| p.is_match(&text)) {
            return true;
        }
        text.trim().is_empty() && rules.media_without_message && !raw.media_refs.is_empty()
    }

    fn strip_emoji(&self, text: &str) -> String {
        self.emoji.replace_all(text, "").into_owned()
    }

    // ── Clean ───────────────────────────────────────────────────────

    fn clean(&self, text: &str, rules: &RuleSet) -> String {
        let mut out = text.to_string();

        if rules.clean_flags.remove_links {
            out = self.links.replace_all(&out, "").into_owned();
        }
        if rules.clean_flags.remove_emails {
            out = self.emails.replace_all(&out, "").into_owned();
        }
        if rules.clean_flags.remove_users {
            out = self.users.replace_all(&out, "").into_owned();
        }
        if rules.clean_flags.remove_hashtags {
            out = self.hashtags.replace_all(&out, "").into_owned();
        }
        for keyword in &rules.remove_keywords {
            out = keyword.replace_all(&out, "").into_owned();
        }

        out = self.blank_runs.replace_all(&out, "\n\n").into_owned();
        out.trim().to_string()
    }

    // ── Price adjustment ────────────────────────────────────────────

    /// Scan price rules in order; the first matching rule adjusts the first
    /// occurrence in the text and ends the stage. Subsequent occurrences
    /// are left untouched (one price per listing).
    fn adjust_price(&self, text: &str, rules: &RuleSet) -> String {
        for rule in &rules.price_rules {
            let Some(caps) = rule.pattern.captures(text) else {
                continue;
            };
            let (Some(full), Some(value_match)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let Some(value) = parse_price(value_match.as_str()) else {
                // Matched but the captured group is not a plausible price.
                return text.to_string();
            };

            let increment = tier_increment(&rules.progressive_tiers, value)
                .unwrap_or(rule.base_value);
            let adjusted = (value + increment).normalize();

            let mut out = String::with_capacity(text.len());
            out.push_str(&text[..full.start()]);
            out.push_str(&adjusted.to_string());
            out.push_str(&rule.currency_suffix);
            out.push_str(&text[full.end()..]);

            debug!(
                rule_set = %rules.id,
                original = %value,
                adjusted = %adjusted,
                "Price adjusted"
            );
            return out;
        }
        text.to_string()
    }

    // ── Tag generation ──────────────────────────────────────────────

    /// Detect the language, collect keyword tags for it, then static tags,
    /// deduplicate in first-seen order, and finish with the brand tag.
    fn generate_tags(&self, text: &str, rules: &RuleSet) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        let push = |tag: &str, tags: &mut Vec<String>| {
            if !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        };

        let language = self.language_table.detect(text);
        if let Some(language_rules) = rules.tag_rules.get(language) {
            for rule in language_rules {
                if rule.keyword.is_match(text) {
                    push(&rule.tag, &mut tags);
                }
            }
        }

        for tag in &rules.static_tags {
            push(tag, &mut tags);
        }

        if let Some(brand) = &rules.brand_id {
            let brand_tag = format!("brand_{brand}");
            push(&brand_tag, &mut tags);
        }

        tags
    }
}

/// Normalize and parse a captured price string. Spaces are thousands
/// separators and a comma is a decimal point. A value with more than one
/// decimal separator is not a price.
fn parse_price(raw: &str) -> Option<Decimal> {
    let normalized: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if normalized.matches('.').count() > 1 {
        return None;
    }
    normalized.parse().ok()
}

/// The highest tier whose `limit <= value` supplies the increment; tiers
/// are strictly ascending, so the last qualifying one wins.
fn tier_increment(tiers: &[ProgressiveTier], value: Decimal) -> Option<Decimal> {
    tiers
        .iter()
        .take_while(|t| t.limit <= value)
        .last()
        .map(|t| t.increment)
}

/// Append the tag block to the message text.
fn render_with_tags(text: &str, tags: &[String]) -> String {
    if tags.is_empty() {
        return text.to_string();
    }
    let block = tags
        .iter()
        .map(|t| format!("#{t}"))
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        block
    } else {
        format!("{text}\n\n{block}")
    }
}
