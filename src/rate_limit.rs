//! Tolerant extraction of per-model rate-limit figures.
//!
//! The upstream reports quota in whatever JSON shape the current app build
//! happens to emit, keyed loosely by model or request kind. Rather than chase
//! each shape, this module mines the payload with a scored depth-first walk:
//! keys that look like "remaining" or "reset" fields are followed, names that
//! resemble the requested model boost the score, and the best candidate per
//! field wins.

use chrono::DateTime;
use itertools::Itertools;
use serde_json::Value;

/// Maximum depth of the scoring walk.
const MAX_DEPTH: usize = 8;

/// Flat score bonus for candidates found inside an object whose
/// model/name/bucket field matches the requested model.
const HINT_BONUS: i64 = 40;

/// Base key names for the remaining-quota field, highest priority first.
const BASE_REMAINING_KEYS: &[&str] = &[
    "remainingtokens",
    "remainingqueries",
    "remaining",
    "quota",
    "left",
    "available",
    "balance",
    "credits",
];

/// Base key names for the reset-time field, highest priority first.
const BASE_RESET_KEYS: &[&str] = &[
    "resetat",
    "resettime",
    "retryafter",
    "timeuntilreset",
    "cooldownuntil",
    "nextreset",
    "reset",
];

/// Sibling keys whose string value identifies which model a sub-object
/// describes.
const HINT_KEYS: &[&str] = &[
    "model",
    "modelname",
    "name",
    "bucket",
    "kind",
    "requestkind",
    "id",
    "slug",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RateLimitResult {
    pub known: bool,
    pub remaining: Option<i64>,
    /// Epoch milliseconds.
    pub reset_at: Option<i64>,
}

impl RateLimitResult {
    pub fn unknown() -> Self {
        Self {
            known: false,
            remaining: None,
            reset_at: None,
        }
    }
}

/// The upstream request kind a model name maps to on the rate-limit surface.
/// Unknown models alias to themselves.
pub fn request_kind_alias(model: &str) -> String {
    let lower = model.to_ascii_lowercase();
    if lower.ends_with("deepersearch") {
        "DEEPERSEARCH".to_string()
    } else if lower.ends_with("deepsearch") {
        "DEEPSEARCH".to_string()
    } else if lower.ends_with("thinking") || lower.ends_with("reasoning") {
        "REASONING".to_string()
    } else if lower.starts_with("grok") {
        "DEFAULT".to_string()
    } else {
        model.to_string()
    }
}

/// Extract `(remaining, reset_at)` for a model from an arbitrary payload.
pub fn extract_rate_limit(payload: &Value, model: &str, now_ms: i64) -> RateLimitResult {
    let strategy = Strategy::for_model(model);
    let mut extractor = Extractor {
        strategy: &strategy,
        now_ms,
        best_remaining: None,
        best_reset: None,
    };
    extractor.walk(payload, 0, 0);

    let remaining = extractor.best_remaining.map(|(_, v)| v);
    let reset_at = extractor.best_reset.map(|(_, v)| v);
    RateLimitResult {
        known: remaining.is_some() || reset_at.is_some(),
        remaining,
        reset_at,
    }
}

/// Key-matching material derived from a model name.
struct Strategy {
    aliases: Vec<String>,
    tokens: Vec<String>,
    remaining_keys: Vec<String>,
    reset_keys: Vec<String>,
}

impl Strategy {
    fn for_model(model: &str) -> Self {
        let kind = request_kind_alias(model);
        let aliases: Vec<String> = [normalize(model), normalize(&kind)]
            .into_iter()
            .filter(|a| !a.is_empty())
            .unique()
            .collect();
        let tokens: Vec<String> = alpha_tokens(model)
            .into_iter()
            .chain(alpha_tokens(&kind))
            .unique()
            .collect();

        let remaining_keys = build_priority_keys(&tokens, BASE_REMAINING_KEYS);
        let reset_keys = build_priority_keys(&tokens, BASE_RESET_KEYS);

        Self {
            aliases,
            tokens,
            remaining_keys,
            reset_keys,
        }
    }

    fn key_score(&self, key: &str) -> i64 {
        if self.aliases.iter().any(|a| key == a.as_str()) {
            120
        } else if self.aliases.iter().any(|a| key.contains(a.as_str())) {
            70
        } else if self.tokens.iter().any(|t| key == t.as_str()) {
            45
        } else if self.tokens.iter().any(|t| key.contains(t.as_str())) {
            25
        } else {
            0
        }
    }

    fn field_keys(&self, field: Field) -> &[String] {
        match field {
            Field::Remaining => &self.remaining_keys,
            Field::Reset => &self.reset_keys,
        }
    }
}

/// Prefix/suffix every token onto the base key set, then append the base set;
/// duplicates removed preserving order.
fn build_priority_keys(tokens: &[String], base: &[&str]) -> Vec<String> {
    tokens
        .iter()
        .flat_map(|token| {
            base.iter()
                .flat_map(move |b| [format!("{token}{b}"), format!("{b}{token}")])
        })
        .chain(base.iter().map(|b| b.to_string()))
        .unique()
        .collect()
}

/// Position-based rank: earlier entries rank higher. Entries match exactly or
/// as a substring of the key, which keeps suffixed variants like `resetAtMs`
/// reachable.
fn rank_in(keys: &[String], key: &str) -> Option<i64> {
    keys.iter()
        .position(|k| key == k.as_str() || key.contains(k.as_str()))
        .map(|idx| (keys.len() - idx) as i64)
}

fn normalize(s: &str) -> String {
    s.to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

fn alpha_tokens(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_ascii_alphabetic())
        .filter(|t| t.len() >= 2)
        .map(str::to_ascii_lowercase)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Remaining,
    Reset,
}

struct Extractor<'a> {
    strategy: &'a Strategy,
    now_ms: i64,
    best_remaining: Option<(i64, i64)>,
    best_reset: Option<(i64, i64)>,
}

impl Extractor<'_> {
    fn walk(&mut self, value: &Value, depth: usize, inherited: i64) {
        if depth >= MAX_DEPTH {
            return;
        }

        match value {
            Value::Array(items) => {
                for item in items {
                    self.walk(item, depth + 1, inherited);
                }
            }
            Value::Object(map) => {
                let hinted = self.model_hint(map);
                let depth_score = (MAX_DEPTH - depth) as i64;

                for (key, child) in map {
                    let nk = normalize(key);
                    let mut key_score = self.strategy.key_score(&nk);
                    if hinted {
                        key_score *= 2;
                    }
                    let hint_bonus = if hinted { HINT_BONUS } else { 0 };

                    for field in [Field::Remaining, Field::Reset] {
                        if let Some(rank) = rank_in(self.strategy.field_keys(field), &nk) {
                            let base =
                                inherited + depth_score + rank * 5 + key_score + hint_bonus;
                            self.follow(child, field, &nk, base, depth + 1);
                        }
                    }

                    // Keep walking: a matching bucket key (for example the
                    // model name itself) raises everything beneath it.
                    self.walk(child, depth + 1, inherited + key_score);
                }
            }
            _ => {}
        }
    }

    /// Follow the value of a matched priority key.
    fn follow(&mut self, value: &Value, field: Field, key: &str, base: i64, depth: usize) {
        match value {
            Value::Object(_) | Value::Array(_) => self.follow_nested(value, field, base, depth),
            scalar => {
                if let Some(parsed) = self.interpret(field, key, scalar) {
                    self.offer(field, base, parsed);
                }
            }
        }
    }

    /// Inside a followed object/array: nested priority hits score four times
    /// their rank weight; other scalars contribute as low-score fallbacks.
    fn follow_nested(&mut self, value: &Value, field: Field, base: i64, depth: usize) {
        if depth >= MAX_DEPTH {
            return;
        }

        match value {
            Value::Array(items) => {
                for item in items {
                    self.follow_nested(item, field, base.saturating_sub(1), depth + 1);
                }
            }
            Value::Object(map) => {
                for (key, child) in map {
                    let nk = normalize(key);
                    if let Some(rank) = rank_in(self.strategy.field_keys(field), &nk) {
                        self.follow(child, field, &nk, base + rank * 5 * 4, depth + 1);
                    } else {
                        match child {
                            Value::Object(_) | Value::Array(_) => {
                                self.follow_nested(child, field, base.saturating_sub(1), depth + 1)
                            }
                            scalar => self.offer_fallback(field, &nk, scalar, base),
                        }
                    }
                }
            }
            scalar => self.offer_fallback(field, "", scalar, base),
        }
    }

    /// Unnamed scalar inside a followed subtree. Remaining accepts any
    /// numeric; reset accepts only unambiguous ISO timestamps.
    fn offer_fallback(&mut self, field: Field, key: &str, scalar: &Value, base: i64) {
        match field {
            Field::Remaining => {
                if let Some(n) = as_number(scalar) {
                    self.offer(field, base, n.round() as i64);
                }
            }
            Field::Reset => {
                if let Some(ms) = scalar.as_str().and_then(parse_datetime_ms) {
                    self.offer(field, base, ms);
                } else if !key.is_empty() {
                    if let Some(parsed) = self.interpret(field, key, scalar) {
                        // Named but non-priority keys still count, just with no
                        // rank weight.
                        self.offer(field, base, parsed);
                    }
                }
            }
        }
    }

    fn interpret(&self, field: Field, key: &str, scalar: &Value) -> Option<i64> {
        match field {
            Field::Remaining => as_number(scalar).map(|n| n.round() as i64),
            Field::Reset => {
                if let Some(n) = as_number(scalar) {
                    return Some(reset_to_epoch_ms(n, key, self.now_ms));
                }
                scalar.as_str().and_then(parse_datetime_ms)
            }
        }
    }

    fn offer(&mut self, field: Field, score: i64, value: i64) {
        let slot = match field {
            Field::Remaining => &mut self.best_remaining,
            Field::Reset => &mut self.best_reset,
        };
        if slot.map(|(best, _)| score > best).unwrap_or(true) {
            *slot = Some((score, value));
        }
    }

    fn model_hint(&self, map: &serde_json::Map<String, Value>) -> bool {
        map.iter().any(|(key, value)| {
            let nk = normalize(key);
            if !HINT_KEYS.contains(&nk.as_str()) {
                return false;
            }
            value
                .as_str()
                .map(|s| {
                    let nv = normalize(s);
                    !nv.is_empty()
                        && self
                            .strategy
                            .aliases
                            .iter()
                            .any(|a| nv == *a || nv.contains(a.as_str()) || a.contains(nv.as_str()))
                })
                .unwrap_or(false)
        })
    }
}

fn as_number(value: &Value) -> Option<f64> {
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    value.as_str().and_then(|s| s.trim().parse::<f64>().ok())
}

fn parse_datetime_ms(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_rfc2822(s))
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Interpret a numeric reset value by its key name.
fn reset_to_epoch_ms(n: f64, key: &str, now_ms: i64) -> i64 {
    let relative = key.contains("retryafter") || key.contains("untilreset") || key.contains("seconds");
    if relative {
        if n >= 1e12 {
            n as i64
        } else if n > 1e9 {
            (n * 1000.0) as i64
        } else {
            now_ms + (n * 1000.0) as i64
        }
    } else if key.ends_with("millis") || key.ends_with("ms") {
        now_ms + n as i64
    } else if n >= 1e12 {
        n as i64
    } else if n >= 1e9 {
        (n * 1000.0) as i64
    } else {
        now_ms + (n * 1000.0) as i64
    }
}
