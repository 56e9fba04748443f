//! Response contract: decoding the language model's structured reply.
//!
//! The model is asked to answer with one JSON object:
//!
//! ```json
//! {
//!   "messages": ["Oi!", "Tudo bem?"],
//!   "next_stage": 1,
//!   "lead": { "name": "Ana", "city": "Recife" },
//!   "interest_level": "medio",
//!   "summary": "Curious about solar, bill around R$ 300"
//! }
//! ```
//!
//! Decoding never fails the turn. Anything that cannot be decoded turns into
//! a [`ResponseContract::Degraded`] carrying the raw text as the only segment
//! and no stage change.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::lead::{CapturedFields, InterestLevel, Stage};

/// Literal token splitting a single-string `messages` field into segments.
pub const SEGMENT_DELIMITER: &str = "[BREAK]";

/// Sent when a degraded reply has no usable text at all.
pub const BLANK_FALLBACK: &str = "Desculpe, não consegui entender. Pode repetir, por favor?";

// ── Segments ────────────────────────────────────────────────────────

/// Ordered, non-empty list of non-blank message segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segments(Vec<String>);

impl Segments {
    /// Trim every item and drop blanks. `None` if nothing is left.
    pub fn new<I, S>(items: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let items: Vec<String> = items
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if items.is_empty() { None } else { Some(Self(items)) }
    }

    /// Single segment; blank text becomes [`BLANK_FALLBACK`].
    pub fn single(text: &str) -> Self {
        Self::new([text]).unwrap_or_else(|| Self(vec![BLANK_FALLBACK.to_string()]))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a Segments {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ── Contract types ──────────────────────────────────────────────────

/// Allow-listed updates carried by a contract.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdates {
    pub fields: CapturedFields,
    pub summary: Option<String>,
    pub interest_level: Option<InterestLevel>,
}

/// A fully decoded reply.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredReply {
    pub segments: Segments,
    /// `None` when absent or not a non-negative integer.
    pub next_stage: Option<Stage>,
    pub updates: FieldUpdates,
}

/// Why a reply was degraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradeReason {
    /// No balanced `{...}` span in the text.
    NoJsonObject,
    /// The span was not a valid contract object.
    InvalidJson(String),
    /// The object decoded but held no usable segment.
    NoSegments,
    /// The language model call itself failed or timed out.
    Upstream(String),
}

impl DegradeReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoJsonObject => "no_json_object",
            Self::InvalidJson(_) => "invalid_json",
            Self::NoSegments => "no_segments",
            Self::Upstream(_) => "upstream_failure",
        }
    }
}

/// Decoded shape of the language model's output.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseContract {
    Structured(StructuredReply),
    /// Fallback: plain segments, stage held, no updates.
    Degraded {
        segments: Segments,
        reason: DegradeReason,
    },
}

impl ResponseContract {
    /// Fallback used when the language model call fails.
    pub fn upstream_failure(apology: &str, reason: impl Into<String>) -> Self {
        Self::Degraded {
            segments: Segments::single(apology),
            reason: DegradeReason::Upstream(reason.into()),
        }
    }

    pub fn segments(&self) -> &Segments {
        match self {
            Self::Structured(reply) => &reply.segments,
            Self::Degraded { segments, .. } => segments,
        }
    }

    /// Stage proposed by the model. Degraded replies never move the stage.
    pub fn next_stage(&self) -> Option<Stage> {
        match self {
            Self::Structured(reply) => reply.next_stage,
            Self::Degraded { .. } => None,
        }
    }

    pub fn updates(&self) -> Option<&FieldUpdates> {
        match self {
            Self::Structured(reply) => Some(&reply.updates),
            Self::Degraded { .. } => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    /// True when the model call itself failed and nothing was decoded.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            Self::Degraded {
                reason: DegradeReason::Upstream(_),
                ..
            }
        )
    }
}

// ── Parsing ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawContract {
    #[serde(default, alias = "segments")]
    messages: Option<RawSegments>,
    #[serde(default, alias = "nextStage", alias = "stage")]
    next_stage: Option<Value>,
    #[serde(default, alias = "captured", alias = "fields")]
    lead: Option<Map<String, Value>>,
    #[serde(default, alias = "interestLevel")]
    interest_level: Option<Value>,
    #[serde(default)]
    summary: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSegments {
    List(Vec<Value>),
    Text(String),
}

/// Decode raw model output into a contract. Never fails.
pub fn parse(raw: &str) -> ResponseContract {
    let degraded = |reason: DegradeReason| {
        warn!(reason = reason.label(), "Falling back to degraded contract");
        ResponseContract::Degraded {
            segments: Segments::single(raw),
            reason,
        }
    };

    let Some(span) = first_balanced_object(raw) else {
        return degraded(DegradeReason::NoJsonObject);
    };

    let contract: RawContract = match serde_json::from_str(span) {
        Ok(c) => c,
        Err(e) => return degraded(DegradeReason::InvalidJson(e.to_string())),
    };

    let segments = match contract.messages {
        Some(RawSegments::List(items)) => Segments::new(
            items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string)),
        ),
        Some(RawSegments::Text(text)) => Segments::new(text.split(SEGMENT_DELIMITER)),
        None => None,
    };
    let Some(segments) = segments else {
        return degraded(DegradeReason::NoSegments);
    };

    let mut updates = contract
        .lead
        .map(|map| filter_updates(&map))
        .unwrap_or_default();
    // Top-level tags win over the ones nested in the lead object
    if let Some(level) = contract.interest_level.as_ref().and_then(value_text) {
        if let Some(parsed) = InterestLevel::parse(&level) {
            updates.interest_level = Some(parsed);
        }
    }
    if let Some(summary) = contract.summary.as_ref().and_then(value_text) {
        updates.summary = Some(summary);
    }

    let next_stage = contract.next_stage.as_ref().and_then(stage_from_value);

    debug!(
        segments = segments.len(),
        next_stage = ?next_stage,
        "Decoded structured contract"
    );

    ResponseContract::Structured(StructuredReply {
        segments,
        next_stage,
        updates,
    })
}

/// Locate the first balanced `{...}` span, honoring JSON string escapes.
fn first_balanced_object(text: &str) -> Option<&str> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = balanced_end(&text[start..]) {
            return Some(&text[start..start + end]);
        }
        search_from = start + 1;
    }
    None
}

/// Byte length of the balanced object at the start of `text`, if it closes.
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Allow-listed keys a contract may write to the lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllowedKey {
    Name,
    TaxId,
    Email,
    Street,
    Number,
    Neighborhood,
    City,
    State,
    ZipCode,
    AverageConsumption,
    Summary,
    InterestLevel,
}

impl AllowedKey {
    fn from_key(key: &str) -> Option<Self> {
        match key {
            "name" => Some(Self::Name),
            "tax_id" | "taxId" => Some(Self::TaxId),
            "email" => Some(Self::Email),
            "street" => Some(Self::Street),
            "number" => Some(Self::Number),
            "neighborhood" => Some(Self::Neighborhood),
            "city" => Some(Self::City),
            "state" => Some(Self::State),
            "zip_code" | "zipCode" => Some(Self::ZipCode),
            "average_consumption" | "averageConsumption" => Some(Self::AverageConsumption),
            "summary" => Some(Self::Summary),
            "interest_level" | "interestLevel" => Some(Self::InterestLevel),
            _ => None,
        }
    }
}

fn filter_updates(map: &Map<String, Value>) -> FieldUpdates {
    let mut updates = FieldUpdates::default();
    for (key, value) in map {
        let Some(allowed) = AllowedKey::from_key(key) else {
            debug!(key = %key, "Dropping non-allow-listed field");
            continue;
        };
        let Some(text) = value_text(value) else {
            continue;
        };
        let f = &mut updates.fields;
        match allowed {
            AllowedKey::Name => f.name = Some(text),
            AllowedKey::TaxId => f.tax_id = Some(text),
            AllowedKey::Email => f.email = Some(text),
            AllowedKey::Street => f.street = Some(text),
            AllowedKey::Number => f.number = Some(text),
            AllowedKey::Neighborhood => f.neighborhood = Some(text),
            AllowedKey::City => f.city = Some(text),
            AllowedKey::State => f.state = Some(text),
            AllowedKey::ZipCode => f.zip_code = Some(text),
            AllowedKey::AverageConsumption => f.average_consumption = Some(text),
            AllowedKey::Summary => updates.summary = Some(text),
            AllowedKey::InterestLevel => updates.interest_level = InterestLevel::parse(&text),
        }
    }
    updates
}

/// Non-blank string or number as text; anything else is ignored.
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn stage_from_value(value: &Value) -> Option<Stage> {
    match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                u32::try_from(u).ok().map(Stage)
            } else {
                n.as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u32::MAX as f64)
                    .map(|f| Stage(f as u32))
            }
        }
        Value::String(s) => s.trim().parse::<u32>().ok().map(Stage),
        _ => None,
    }
}
