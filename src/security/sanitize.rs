//! Outbound privacy filter.
//!
//! Every user message passes through [`SanitizationGate::check`] before it can
//! reach the rate limiter or the network. Detection is a single pass over a
//! declarative, ordered list of [`EntityRule`]s:
//!
//! 1. every rule is matched against the original text, producing candidate spans
//! 2. overlapping candidates are resolved: longer span wins, then critical
//!    entity kinds, then rule order
//! 3. surviving spans are replaced by an opaque placeholder such as `[EMAIL]`
//!
//! Numbers, dates, fitness apps and devices are redacted but do not make text
//! unsafe. Emails, phone numbers and personal names are *critical*: if any is
//! found, [`SanitizationResult::is_safe`] is `false` and the pipeline refuses
//! to send the message at all.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Numbers at or below this magnitude ("2 devices", "step 3") are left alone.
const NUMBER_THRESHOLD: f64 = 10.0;

/// Words that follow "I'm", "I am" or "this is" without being names.
const NAME_STOPWORDS: &[&str] = &[
    "a", "able", "about", "actually", "afraid", "after", "again", "all", "almost",
    "also", "always", "an", "and", "android", "angry", "annoyed", "annoying", "another", "any",
    "app", "apple", "as", "at", "awake", "away", "awful", "back", "bad", "basically", "being",
    "bored", "broken", "busy", "but", "charged", "completely", "concerned", "confused", "connected",
    "crazy", "curious", "currently", "data", "day", "desperate", "disappointed", "disconnected",
    "done", "down", "fed", "finally", "fine", "fitbit", "for", "from", "frustrated", "galaxy",
    "garmin", "getting", "glad", "going", "gonna", "good", "google", "happy", "having", "health",
    "here", "honestly", "how", "i", "im", "in", "into", "is", "issue", "it", "just", "kind", "late",
    "left", "literally", "locked", "logged", "looking", "lost", "mad", "me", "missing", "my", "new",
    "no", "normal", "not", "now", "odd", "of", "off", "ok", "okay", "old", "on", "one", "only",
    "or", "oura", "out", "over", "paired", "peloton", "phone", "pixel", "polar", "pretty",
    "probably", "problem", "quite", "ready", "really", "ridiculous", "running", "sad", "samsung",
    "scared", "seeing", "seriously", "sick", "signed", "so", "some", "sorry", "still", "strange",
    "strava", "stressed", "stuck", "such", "super", "sure", "sync", "synced", "syncing", "terrible",
    "that", "the", "then", "there", "this", "tired", "to", "too", "totally", "trying",
    "unable", "under", "unsure", "up", "updated", "upset", "useless", "using", "usually", "very",
    "walking", "watch", "weird", "what", "when", "where", "whoop", "why", "with", "withings",
    "wondering", "worried", "wrong", "you",
];

/// Endings of adjectives and participles that follow "I am" far more often
/// than a name does.
const NON_NAME_SUFFIXES: &[&str] = &["ing", "ful", "ous", "able", "ible", "less", "ness"];

/// Kind of sensitive entity found in outbound text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Counts and measurements above a small magnitude
    Number,
    /// Relative or absolute date/time expressions
    Date,
    /// Named fitness or health app
    FitnessApp,
    /// Named wearable or device brand
    Device,
    Email,
    Phone,
    /// Name given in an introduction ("my name is ...")
    PersonName,
}

impl EntityType {
    /// Critical entities make a message unsafe to transmit.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            EntityType::Email | EntityType::Phone | EntityType::PersonName
        )
    }

    pub fn placeholder(self) -> &'static str {
        match self {
            EntityType::Number => "[NUMBER]",
            EntityType::Date => "[TIME]",
            EntityType::FitnessApp => "[APP]",
            EntityType::Device => "[DEVICE]",
            EntityType::Email => "[EMAIL]",
            EntityType::Phone => "[PHONE]",
            EntityType::PersonName => "[NAME]",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Number => "number",
            EntityType::Date => "date",
            EntityType::FitnessApp => "fitness_app",
            EntityType::Device => "device",
            EntityType::Email => "email",
            EntityType::Phone => "phone",
            EntityType::PersonName => "person_name",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte range of a detected entity in the *original* text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedEntity {
    pub entity_type: EntityType,
    pub span: Span,
}

/// Outcome of checking one outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizationResult {
    pub sanitized_text: String,
    /// One entry per redacted span, in text order
    pub detected_entities: Vec<DetectedEntity>,
    /// `false` iff at least one critical entity was found
    pub is_safe: bool,
}

impl SanitizationResult {
    /// Distinct critical entity kinds, in first-seen order.
    pub fn critical_types(&self) -> Vec<EntityType> {
        let mut kinds = Vec::new();
        for entity in &self.detected_entities {
            if entity.entity_type.is_critical() && !kinds.contains(&entity.entity_type) {
                kinds.push(entity.entity_type);
            }
        }
        kinds
    }
}

/// One detection rule: a pattern, the capture group holding the entity, and
/// an optional acceptance filter applied to the matched text.
pub struct EntityRule {
    pub entity_type: EntityType,
    regex: Regex,
    group: usize,
    /// Optional second word that extends the match when it also passes `accept`.
    continuation: Option<usize>,
    accept: fn(&str) -> bool,
}

impl EntityRule {
    fn new(entity_type: EntityType, pattern: &str) -> Self {
        Self::with_filter(entity_type, pattern, 0, |_| true)
    }

    fn with_filter(
        entity_type: EntityType,
        pattern: &str,
        group: usize,
        accept: fn(&str) -> bool,
    ) -> Self {
        Self {
            entity_type,
            // Patterns are compile-time constants covered by tests.
            regex: Regex::new(pattern).unwrap_or_else(|e| panic!("invalid entity rule: {e}")),
            group,
            continuation: None,
            accept,
        }
    }

    fn continued_by(mut self, group: usize) -> Self {
        self.continuation = Some(group);
        self
    }

    /// The span a match claims, if any, and the offset to search from next.
    /// Words the match looked at but rejected stay available to later matches.
    fn claim(&self, caps: &Captures<'_>) -> (Option<Span>, usize) {
        let whole_end = caps.get(0).map_or(0, |m| m.end());
        let Some(found) = caps.get(self.group) else {
            return (None, whole_end);
        };
        if found.as_str().is_empty() {
            return (None, whole_end);
        }
        if !(self.accept)(found.as_str()) {
            return (None, found.end());
        }

        let mut end = found.end();
        if let Some(group) = self.continuation {
            if let Some(next) = caps.get(group) {
                if (self.accept)(next.as_str()) {
                    end = next.end();
                }
            }
        }
        let span = Span {
            start: found.start(),
            end,
        };
        (Some(span), end)
    }
}

fn number_above_threshold(raw: &str) -> bool {
    raw.replace(',', "")
        .parse::<f64>()
        .is_ok_and(|value| value > NUMBER_THRESHOLD)
}

fn plausible_name(raw: &str) -> bool {
    let first = raw
        .split([' ', '-', '\'', '’'])
        .next()
        .unwrap_or(raw)
        .to_lowercase();
    !first.is_empty() && !NAME_STOPWORDS.contains(&first.as_str())
}

/// Stricter check for "I'm ..." and "this is ...", which are followed by
/// ordinary words far more often than by names.
fn plausible_self_name(raw: &str) -> bool {
    let lower = raw.to_lowercase();
    plausible_name(raw)
        && !NON_NAME_SUFFIXES
            .iter()
            .any(|suffix| lower.len() > suffix.len() + 1 && lower.ends_with(suffix))
}

/// The rule set, in evaluation order.
fn default_rules() -> &'static [EntityRule] {
    static RULES: OnceLock<Vec<EntityRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        vec![
            EntityRule::with_filter(
                EntityType::Number,
                r"\b\d{1,3}(?:,\d{3})+(?:\.\d+)?\b|\b\d+(?:\.\d+)?\b",
                0,
                number_above_threshold,
            ),
            EntityRule::new(
                EntityType::Date,
                r"(?i)\b(?:yesterday|today|tonight|tomorrow|last\s+(?:night|week|weekend|month|year|monday|tuesday|wednesday|thursday|friday|saturday|sunday)|this\s+(?:morning|afternoon|evening|week|weekend|month)|(?:\d+|a|an|a\s+few|a\s+couple\s+of|few|couple\s+of|one|two|three|several)\s+(?:minutes?|hours?|days?|weeks?|months?|years?)\s+ago)\b",
            ),
            EntityRule::new(
                EntityType::Date,
                r"(?i)\b(?:on\s+)?(?:monday|tuesday|wednesday|thursday|friday|saturday|sunday)s?\b",
            ),
            EntityRule::new(
                EntityType::Date,
                r"\b\d{4}-\d{1,2}-\d{1,2}\b|\b\d{1,2}/\d{1,2}(?:/\d{2,4})?\b",
            ),
            EntityRule::new(
                EntityType::Date,
                r"(?i)\b(?:jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\.?\s+\d{1,2}(?:st|nd|rd|th)?(?:,?\s+\d{4})?\b",
            ),
            EntityRule::new(
                EntityType::Date,
                r"(?i)\b\d{1,2}:\d{2}(?:\s?[ap]m)?\b|\b\d{1,2}\s?[ap]m\b",
            ),
            EntityRule::new(
                EntityType::FitnessApp,
                r"(?i)\b(?:apple\s+health|health\s*kit|health\s+connect|google\s+fit|samsung\s+health|fitbit\s+app|garmin\s+connect|strava|my\s*fitness\s*pal|polar\s+flow|health\s+mate|zepp(?:\s+life)?|mi\s+fit|nike\s+run\s+club|runkeeper|cronometer|sleep\s+cycle|komoot|oura\s+app|peloton\s+app)\b",
            ),
            EntityRule::new(
                EntityType::Device,
                r"(?i)\b(?:apple\s+watch(?:\s+(?:series\s+\d+|ultra(?:\s+\d+)?|se))?|galaxy\s+watch(?:\s*\d+)?|pixel\s+watch(?:\s*\d+)?|fitbit(?:\s+(?:charge|versa|sense|inspire|luxe)(?:\s*\d+)?)?|garmin(?:\s+(?:forerunner|fenix|venu|vivoactive|instinct)(?:\s*\d+)?)?|oura(?:\s+ring)?|whoop|withings|polar\s+(?:vantage|grit\s*x|ignite|pacer|h10)|mi\s+band(?:\s*\d+)?|xiaomi\s+(?:smart\s+)?band(?:\s*\d+)?|amazfit(?:\s+(?:gtr|gts|bip|band)(?:\s*\d+)?)?|wear\s*os|peloton)\b",
            ),
            EntityRule::new(
                EntityType::Email,
                r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            ),
            EntityRule::new(
                EntityType::Phone,
                r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{3}\)\s?|\b\d{3}[\s.-]?)\d{3}[\s.-]?\d{4}\b",
            ),
            EntityRule::with_filter(
                EntityType::PersonName,
                r"(?i:\b(?:my\s+name\s+is|my\s+name['’]s|call\s+me))\s+(\p{L}[\p{L}'’-]*)(?:[ \t]+(\p{L}[\p{L}'’-]*))?",
                1,
                plausible_name,
            )
            .continued_by(2),
            EntityRule::with_filter(
                EntityType::PersonName,
                r"(?i:\b(?:i['’]?m|i\s+am|this\s+is))\s+(\p{L}[\p{L}'’-]*)(?:[ \t]+(\p{L}[\p{L}'’-]*))?",
                1,
                plausible_self_name,
            )
            .continued_by(2),
        ]
    })
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    entity_type: EntityType,
    span: Span,
    order: usize,
}

/// Stateless privacy filter for outbound text.
#[derive(Clone, Copy)]
pub struct SanitizationGate {
    rules: &'static [EntityRule],
}

impl SanitizationGate {
    pub fn new() -> Self {
        Self {
            rules: default_rules(),
        }
    }

    /// Detect and redact sensitive entities. Total over any input.
    pub fn check(&self, text: &str) -> SanitizationResult {
        if text.is_empty() {
            return SanitizationResult {
                sanitized_text: String::new(),
                detected_entities: Vec::new(),
                is_safe: true,
            };
        }

        let mut candidates = Vec::new();
        for (order, rule) in self.rules.iter().enumerate() {
            let mut at = 0;
            while let Some(caps) = rule.regex.captures_at(text, at) {
                let (span, resume) = rule.claim(&caps);
                if let Some(span) = span {
                    candidates.push(Candidate {
                        entity_type: rule.entity_type,
                        span,
                        order,
                    });
                }
                if resume <= at {
                    break;
                }
                at = resume;
            }
        }

        // Longest span first, critical kinds before non-critical, then rule order.
        candidates.sort_by(|a, b| {
            b.span
                .len()
                .cmp(&a.span.len())
                .then_with(|| {
                    b.entity_type
                        .is_critical()
                        .cmp(&a.entity_type.is_critical())
                })
                .then_with(|| a.order.cmp(&b.order))
                .then_with(|| a.span.start.cmp(&b.span.start))
        });

        let mut accepted: Vec<Candidate> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if accepted.iter().all(|kept| !kept.span.overlaps(&candidate.span)) {
                accepted.push(candidate);
            }
        }
        accepted.sort_by_key(|c| c.span.start);

        let mut sanitized = String::with_capacity(text.len());
        let mut cursor = 0;
        for candidate in &accepted {
            sanitized.push_str(&text[cursor..candidate.span.start]);
            sanitized.push_str(candidate.entity_type.placeholder());
            cursor = candidate.span.end;
        }
        sanitized.push_str(&text[cursor..]);

        let detected_entities: Vec<DetectedEntity> = accepted
            .into_iter()
            .map(|c| DetectedEntity {
                entity_type: c.entity_type,
                span: c.span,
            })
            .collect();
        let is_safe = !detected_entities
            .iter()
            .any(|e| e.entity_type.is_critical());

        SanitizationResult {
            sanitized_text: sanitized,
            detected_entities,
            is_safe,
        }
    }
}

impl Default for SanitizationGate {
    fn default() -> Self {
        Self::new()
    }
}
