//! Best-effort normalization of vision-model output into an [`ExtractionResult`].
//!
//! Model answers are untrusted: the JSON may be wrapped in prose or markdown
//! fences, keys may be missing, and transcriptions sometimes loop on the same
//! words. [`normalize`] never fails. It tries three parse tiers in order and
//! degrades to a single `content` field when nothing parses.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::schema::{ConfidenceMap, ExtractionResult, FieldMap, FieldValue};

/// Score given to fields the model returned without a confidence entry.
pub const DEFAULT_CONFIDENCE: f64 = 85.0;
/// Score given to the single `content` field of the fallback record.
pub const FALLBACK_CONFIDENCE: f64 = 50.0;
pub const FALLBACK_FIELD: &str = "content";

/// A word or phrase repeated at least this many times in a row is a stutter.
const MIN_STUTTER_RUN: usize = 4;
/// Longest phrase (in words) checked for stutter runs.
const MAX_STUTTER_PHRASE: usize = 8;

/// A fence marker. The language tag only counts when it ends the line, so
/// text glued to a stray backtick run survives.
static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)```(?:[A-Za-z0-9_+-]+$)?").unwrap());

/// Outcome of coercing model text into the expected record shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    /// The whole (unfenced) text parsed as a record.
    Direct(ModelRecord),
    /// A brace-delimited span inside the text parsed as a record.
    Embedded(ModelRecord),
    /// Nothing usable; the text itself becomes the record.
    Fallback,
}

impl ParsedResponse {
    pub fn tier(&self) -> &'static str {
        match self {
            ParsedResponse::Direct(_) => "direct",
            ParsedResponse::Embedded(_) => "embedded",
            ParsedResponse::Fallback => "fallback",
        }
    }
}

/// The `{fields, confidence, rawText}` object the model is asked to return.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelRecord {
    pub fields: FieldMap,
    pub confidence: ConfidenceMap,
    pub raw_text: Option<String>,
}

impl ModelRecord {
    /// Accepts only JSON objects whose `fields` is itself an object.
    fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut obj) = value else {
            return None;
        };

        let fields = match obj.remove("fields") {
            Some(Value::Object(map)) => map
                .into_iter()
                .map(|(k, v)| (k, FieldValue::from(v)))
                .collect(),
            _ => return None,
        };

        let confidence = match obj.remove("confidence") {
            Some(Value::Object(map)) => confidence_from_json(map),
            _ => ConfidenceMap::new(),
        };

        let raw_text = match obj.remove("rawText") {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            _ => None,
        };

        Some(Self {
            fields,
            confidence,
            raw_text,
        })
    }
}

/// Normalize raw model output, stamping the current time.
pub fn normalize(raw: &str) -> ExtractionResult {
    normalize_at(raw, Utc::now())
}

pub fn normalize_at(raw: &str, processed_at: DateTime<Utc>) -> ExtractionResult {
    let cleaned = strip_fences(raw);
    let parsed = parse_response(&cleaned);
    debug!(
        "Model response parsed via {} tier ({} chars)",
        parsed.tier(),
        cleaned.len()
    );

    let (fields, confidence, raw_text) = match parsed {
        ParsedResponse::Direct(record) | ParsedResponse::Embedded(record) => {
            let raw_text = record.raw_text.unwrap_or_else(|| cleaned.clone());
            (record.fields, record.confidence, raw_text)
        }
        ParsedResponse::Fallback => {
            warn!(
                "Model response is not structured JSON, falling back to a single '{}' field",
                FALLBACK_FIELD
            );
            let fields = FieldMap::from([(
                FALLBACK_FIELD.to_string(),
                FieldValue::Text(cleaned.clone()),
            )]);
            let confidence =
                ConfidenceMap::from([(FALLBACK_FIELD.to_string(), FALLBACK_CONFIDENCE)]);
            (fields, confidence, cleaned.clone())
        }
    };

    let confidence = backfill(&fields, confidence);

    ExtractionResult {
        fields,
        confidence,
        raw_text: sanitize(&raw_text),
        processed_at,
    }
}

/// Try the direct parse, then the first-`{`-to-last-`}` span.
pub fn parse_response(cleaned: &str) -> ParsedResponse {
    if let Some(record) = parse_record(cleaned) {
        return ParsedResponse::Direct(record);
    }

    if let Some(record) = brace_span(cleaned).and_then(parse_record) {
        return ParsedResponse::Embedded(record);
    }

    ParsedResponse::Fallback
}

/// Insert [`DEFAULT_CONFIDENCE`] for every field without a score.
/// Existing entries, including ones for unknown fields, are kept as-is.
pub fn backfill(fields: &FieldMap, mut confidence: ConfidenceMap) -> ConfidenceMap {
    for key in fields.keys() {
        confidence
            .entry(key.clone())
            .or_insert(DEFAULT_CONFIDENCE);
    }
    confidence
}

/// Remove code fences, collapse stutter runs and trim.
///
/// Runs until the text stops changing, so the result is a fixed point:
/// `sanitize(&sanitize(x)) == sanitize(x)`. Genuinely repeated words in the
/// source (four or more in a row) are collapsed as well.
pub fn sanitize(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let unfenced = FENCE_RE.replace_all(&current, "");
        let next = collapse_stutter(&unfenced).trim().to_string();
        if next == current {
            return next;
        }
        current = next;
    }
}

/// Unwrap a response that is entirely enclosed in a markdown code block.
/// Backticks inside the body are left alone.
pub fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    let inner = match trimmed.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.trim_start_matches(|c: char| {
                c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-')
            });
            rest.strip_suffix("```").unwrap_or(rest)
        }
        None => trimmed,
    };
    inner.trim().to_string()
}

fn parse_record(text: &str) -> Option<ModelRecord> {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(ModelRecord::from_value)
}

/// Greedy span from the first `{` to the last `}`.
fn brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

pub fn confidence_from_json(map: Map<String, Value>) -> ConfidenceMap {
    map.into_iter()
        .filter_map(|(key, value)| {
            let score = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
                _ => None,
            }?;
            Some((key, score.clamp(0.0, 100.0)))
        })
        .collect()
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || c == ','
}

/// A word and the separator run that follows it.
struct Token<'a> {
    word: &'a str,
    sep: &'a str,
}

fn tokenize(text: &str) -> (&str, Vec<Token<'_>>) {
    let lead_end = text.find(|c: char| !is_separator(c)).unwrap_or(text.len());
    let (lead, mut rest) = text.split_at(lead_end);

    let mut tokens = Vec::new();
    while !rest.is_empty() {
        let word_end = rest.find(is_separator).unwrap_or(rest.len());
        let (word, tail) = rest.split_at(word_end);
        let sep_end = tail.find(|c: char| !is_separator(c)).unwrap_or(tail.len());
        let (sep, next) = tail.split_at(sep_end);
        tokens.push(Token { word, sep });
        rest = next;
    }

    (lead, tokens)
}

/// Shortest phrase starting at `start` that repeats back-to-back at least
/// [`MIN_STUTTER_RUN`] times, as `(phrase_len, repeats)`.
fn stutter_at(tokens: &[Token<'_>], start: usize) -> Option<(usize, usize)> {
    (1..=MAX_STUTTER_PHRASE).find_map(|len| {
        let phrase = tokens.get(start..start + len)?;
        let repeats = 1 + tokens[start + len..]
            .chunks_exact(len)
            .take_while(|chunk| chunk.iter().zip(phrase).all(|(a, b)| a.word == b.word))
            .count();
        (repeats >= MIN_STUTTER_RUN).then_some((len, repeats))
    })
}

fn collapse_stutter(text: &str) -> String {
    let (lead, tokens) = tokenize(text);
    let mut out = String::with_capacity(text.len());
    out.push_str(lead);

    let mut i = 0;
    while i < tokens.len() {
        match stutter_at(&tokens, i) {
            Some((len, repeats)) => {
                // Keep the first occurrence, closed by the separator after the run.
                let run_end = i + len * repeats;
                for (offset, token) in tokens[i..i + len].iter().enumerate() {
                    out.push_str(token.word);
                    if offset + 1 == len {
                        out.push_str(tokens[run_end - 1].sep);
                    } else {
                        out.push_str(token.sep);
                    }
                }
                i = run_end;
            }
            None => {
                out.push_str(tokens[i].word);
                out.push_str(tokens[i].sep);
                i += 1;
            }
        }
    }

    out
}
